// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

use super::transform_loop;
use crate::bounded_channel::BoundedSender;
use crate::entry::Entry;
use crate::error::Result;
use crate::operator::{
    BuildContext, InputPort, Operator, OperatorDescriptor, Outputs, WorkerHandle,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataConfig {
    /// Labels stamped onto every entry passing through
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Metadata stamps configured labels onto each entry.
pub struct Metadata {
    id: String,
    output_ids: Vec<String>,
    config: MetadataConfig,
    input: InputPort,
    outputs: Option<Outputs>,
    worker: WorkerHandle,
}

impl Metadata {
    pub fn new(
        id: impl Into<String>,
        output_ids: Vec<String>,
        config: MetadataConfig,
        capacity: usize,
    ) -> Self {
        Self {
            id: id.into(),
            output_ids,
            config,
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
    let config: MetadataConfig = descriptor.decode_settings()?;
    let capacity = descriptor.buffer_capacity(context.channel_capacity)?;
    Ok(Box::new(Metadata::new(
        descriptor.id.clone(),
        descriptor.outputs.clone(),
        config,
        capacity,
    )))
}

#[async_trait]
impl Operator for Metadata {
    fn id(&self) -> &str {
        &self.id
    }

    fn type_name(&self) -> &'static str {
        "metadata"
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
        let labels = self.config.labels.clone();
        self.worker.spawn(transform_loop(
            rx,
            outputs,
            cancel,
            id,
            "metadata",
            move |mut entry: Entry| {
                for (key, value) in &labels {
                    entry.labels.insert(key.clone(), value.clone());
                }
                Some(entry)
            },
        ));
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.worker.stop(&self.id, "metadata").await;
        Ok(())
    }
}
