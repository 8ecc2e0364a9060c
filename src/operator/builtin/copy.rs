// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use super::transform_loop;
use crate::bounded_channel::BoundedSender;
use crate::entry::Entry;
use crate::error::Result;
use crate::operator::{
    BuildContext, InputPort, Operator, OperatorDescriptor, Outputs, WorkerHandle,
};

/// Copy duplicates each entry to every declared output. Each downstream
/// receives its own deep copy, so mutations on one branch never leak into
/// another.
pub struct Copy {
    id: String,
    output_ids: Vec<String>,
    input: InputPort,
    outputs: Option<Outputs>,
    worker: WorkerHandle,
}

impl Copy {
    pub fn new(id: impl Into<String>, output_ids: Vec<String>, capacity: usize) -> Self {
        Self {
            id: id.into(),
            output_ids,
            input: InputPort::new(capacity),
            outputs: None,
            worker: WorkerHandle::new(),
        }
    }
}

pub(crate) fn build(
    descriptor: &OperatorDescriptor,
    context: &mut BuildContext,
) -> Result<Box<dyn Operator>> {
    let capacity = descriptor.buffer_capacity(context.channel_capacity)?;
    Ok(Box::new(Copy::new(
        descriptor.id.clone(),
        descriptor.outputs.clone(),
        capacity,
    )))
}

#[async_trait]
impl Operator for Copy {
    fn id(&self) -> &str {
        &self.id
    }

    fn type_name(&self) -> &'static str {
        "copy"
    }

    fn input_sender(&self) -> Option<BoundedSender<Entry>> {
        Some(self.input.sender())
    }

    fn output_ids(&self) -> &[String] {
        &self.output_ids
    }

    fn connect_outputs(&mut self, outputs: Outputs) {
        self.outputs = Some(outputs);
    }

    async fn start(&mut self) -> Result<()> {
        let rx = self.input.take_receiver(&self.id)?;
        let outputs = self.outputs.take().unwrap_or_default();
        let cancel = self.worker.cancellation();
        let id = self.id.clone();
        // The per-branch copies are made at the fan-out, one per downstream
        self.worker
            .spawn(transform_loop(rx, outputs, cancel, id, "copy", Some));
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.worker.stop(&self.id, "copy").await;
        Ok(())
    }
}
