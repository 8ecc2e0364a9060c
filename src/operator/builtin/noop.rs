// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use super::transform_loop;
use crate::bounded_channel::BoundedSender;
use crate::entry::Entry;
use crate::error::Result;
use crate::operator::{
    BuildContext, InputPort, Operator, OperatorDescriptor, Outputs, WorkerHandle,
};

/// Pass-through operator, useful for naming a point in the graph
pub struct Noop {
    id: String,
    output_ids: Vec<String>,
    input: InputPort,
    outputs: Option<Outputs>,
    worker: WorkerHandle,
}

impl Noop {
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
    Ok(Box::new(Noop::new(
        descriptor.id.clone(),
        descriptor.outputs.clone(),
        capacity,
    )))
}

#[async_trait]
impl Operator for Noop {
    fn id(&self) -> &str {
        &self.id
    }

    fn type_name(&self) -> &'static str {
        "noop"
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
        self.worker
            .spawn(transform_loop(rx, outputs, cancel, id, "noop", Some));
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.worker.stop(&self.id, "noop").await;
        Ok(())
    }
}
