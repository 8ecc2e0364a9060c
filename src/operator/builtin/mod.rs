// SPDX-License-Identifier: Apache-2.0

//! Builtin operators registered in the default registry.

pub mod copy;
pub mod file_input;
pub mod metadata;
pub mod noop;
pub mod stdout;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bounded_channel::BoundedReceiver;
use crate::entry::Entry;
use crate::operator::Outputs;

/// Worker loop shared by the transforming operators: receive entries,
/// apply the transform, emit downstream. On cancellation the remaining
/// queued entries are drained before the worker exits.
pub(crate) async fn transform_loop<F>(
    mut rx: BoundedReceiver<Entry>,
    outputs: Outputs,
    cancel: CancellationToken,
    operator_id: String,
    operator_type: &'static str,
    mut transform: F,
) where
    F: FnMut(Entry) -> Option<Entry> + Send,
{
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                while let Some(entry) = rx.try_recv() {
                    if let Some(out) = transform(entry) {
                        if let Err(e) = outputs.send(out).await {
                            debug!(
                                operator_id,
                                operator_type,
                                error = %e,
                                "dropping entry during shutdown drain"
                            );
                            return;
                        }
                    }
                }
                return;
            }

            entry = rx.next() => {
                let Some(entry) = entry else { return };
                if let Some(out) = transform(entry) {
                    if let Err(e) = outputs.send(out).await {
                        debug!(
                            operator_id,
                            operator_type,
                            error = %e,
                            "downstream closed, stopping worker"
                        );
                        return;
                    }
                }
            }
        }
    }
}
