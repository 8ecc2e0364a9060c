// SPDX-License-Identifier: Apache-2.0

use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, error};

use crate::bounded_channel::BoundedSender;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::operator::{BuildContext, InputPort, Operator, OperatorDescriptor, WorkerHandle};

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Stdout is a sink that writes each entry as one JSON line. The writer is
/// injectable so tests can capture output.
pub struct Stdout {
    id: String,
    writer: SharedWriter,
    input: InputPort,
    worker: WorkerHandle,
}

impl Stdout {
    pub fn new(id: impl Into<String>, capacity: usize) -> Self {
        Self::with_writer(id, capacity, Box::new(std::io::stdout()))
    }

    pub fn with_writer(
        id: impl Into<String>,
        capacity: usize,
        writer: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            id: id.into(),
            writer: Arc::new(Mutex::new(writer)),
            input: InputPort::new(capacity),
            worker: WorkerHandle::new(),
        }
    }
}

pub(crate) fn build(
    descriptor: &OperatorDescriptor,
    context: &mut BuildContext,
) -> Result<Box<dyn Operator>> {
    if descriptor.explicit_output {
        return Err(Error::Config(format!(
            "operator '{}': 'stdout' is a sink and cannot declare outputs",
            descriptor.id
        )));
    }
    let capacity = descriptor.buffer_capacity(context.channel_capacity)?;
    Ok(Box::new(Stdout::new(descriptor.id.clone(), capacity)))
}

fn write_entry(writer: &SharedWriter, operator_id: &str, entry: &Entry) {
    let line = match serde_json::to_string(entry) {
        Ok(line) => line,
        Err(e) => {
            error!(operator_id, operator_type = "stdout", error = %e, "failed to encode entry");
            return;
        }
    };
    let mut guard = match writer.lock() {
        Ok(guard) => guard,
        Err(e) => {
            error!(operator_id, operator_type = "stdout", error = %e, "writer lock poisoned");
            return;
        }
    };
    if let Err(e) = writeln!(guard, "{}", line).and_then(|_| guard.flush()) {
        error!(operator_id, operator_type = "stdout", error = %e, "failed to write entry");
    }
}

#[async_trait]
impl Operator for Stdout {
    fn id(&self) -> &str {
        &self.id
    }

    fn type_name(&self) -> &'static str {
        "stdout"
    }

    fn input_sender(&self) -> Option<BoundedSender<Entry>> {
        Some(self.input.sender())
    }

    async fn start(&mut self) -> Result<()> {
        let mut rx = self.input.take_receiver(&self.id)?;
        let cancel = self.worker.cancellation();
        let writer = self.writer.clone();
        let id = self.id.clone();

        self.worker.spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        while let Some(entry) = rx.try_recv() {
                            write_entry(&writer, &id, &entry);
                        }
                        debug!(operator_id = %id, operator_type = "stdout", "worker stopped");
                        return;
                    }

                    entry = rx.next() => {
                        let Some(entry) = entry else { return };
                        write_entry(&writer, &id, &entry);
                    }
                }
            }
        });
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.worker.stop(&self.id, "stdout").await;
        Ok(())
    }
}
