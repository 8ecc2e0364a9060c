// SPDX-License-Identifier: Apache-2.0

//! Operators are the nodes of the pipeline graph. An operator may consume
//! entries (input-capable), produce them (output-capable), or both. The
//! capability set is expressed on the [`Operator`] trait: an input-capable
//! operator returns a sender from [`Operator::input_sender`]; an
//! output-capable one declares downstream ids via [`Operator::output_ids`].

pub mod builtin;
mod context;
mod descriptor;
mod output;
mod registry;

pub use context::{BuildContext, DEFAULT_CHANNEL_CAPACITY};
pub use descriptor::{check_unique_ids, decode_descriptors, OperatorDescriptor};
pub use output::Outputs;
pub use registry::{default_registry, Registry};

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::bounded_channel::{bounded, BoundedReceiver, BoundedSender};
use crate::entry::Entry;
use crate::error::{Error, Result};

/// Grace period a stopping operator is given to terminate its worker before
/// the worker is abandoned
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// A node in the pipeline graph. Operators are created by the pipeline
/// builder, started exactly once and stopped exactly once.
#[async_trait]
pub trait Operator: Send {
    /// Identifier, unique within one pipeline
    fn id(&self) -> &str;

    /// The configuration type name this operator was built from
    fn type_name(&self) -> &'static str;

    /// The sender for this operator's input queue. `None` for sources.
    fn input_sender(&self) -> Option<BoundedSender<Entry>> {
        None
    }

    /// Identifiers of the downstream operators this operator emits to
    fn output_ids(&self) -> &[String] {
        &[]
    }

    /// Install the resolved downstream senders. Called once, before start.
    fn connect_outputs(&mut self, _outputs: Outputs) {}

    /// Launch the operator's worker
    async fn start(&mut self) -> Result<()>;

    /// Terminate the worker, draining or discarding in-flight entries.
    /// Returns only once the worker has terminated or the grace period has
    /// elapsed.
    async fn stop(&mut self) -> Result<()>;
}

/// The input side of an input-capable operator: one bounded queue whose
/// sender is handed to upstreams and whose receiver is moved into the
/// worker at start.
pub struct InputPort {
    tx: BoundedSender<Entry>,
    rx: Option<BoundedReceiver<Entry>>,
}

impl InputPort {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx: Some(rx) }
    }

    pub fn sender(&self) -> BoundedSender<Entry> {
        self.tx.clone()
    }

    /// Take the receiver for the worker. Fails if the operator was already
    /// started.
    pub fn take_receiver(&mut self, operator_id: &str) -> Result<BoundedReceiver<Entry>> {
        self.rx
            .take()
            .ok_or_else(|| Error::Config(format!("operator '{}' started twice", operator_id)))
    }
}

/// Cancellation token plus join handle for one operator worker
pub struct WorkerHandle {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    /// Token the worker future should observe for prompt shutdown
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<F>(&mut self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle = Some(tokio::spawn(fut));
    }

    /// Cancel the worker and wait for it to terminate, abandoning it after
    /// the grace period.
    pub async fn stop(&mut self, operator_id: &str, operator_type: &str) {
        self.cancel.cancel();
        if let Some(mut handle) = self.handle.take() {
            match tokio::time::timeout(STOP_GRACE_PERIOD, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        operator_id,
                        operator_type,
                        error = %e,
                        "operator worker panicked"
                    );
                }
                Err(_) => {
                    error!(
                        operator_id,
                        operator_type,
                        grace = ?STOP_GRACE_PERIOD,
                        "operator worker did not stop within grace period, abandoning"
                    );
                    handle.abort();
                }
            }
        }
    }
}

impl Default for WorkerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for dyn Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operator")
            .field("id", &self.id())
            .field("type", &self.type_name())
            .finish()
    }
}
