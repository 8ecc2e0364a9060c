// SPDX-License-Identifier: Apache-2.0

//! Pipeline construction and lifecycle.
//!
//! Building a pipeline expands plugin templates, builds each operator via
//! the registry, resolves declared outputs against input-capable targets,
//! and validates acyclicity with a topological sort. Start brings
//! operators up in reverse topological order so every consumer is ready
//! before its producers; Stop takes them down in topological order so
//! sources stop producing before their consumers drain.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_yaml::Value;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::operator::{
    decode_descriptors, BuildContext, Operator, OperatorDescriptor, Outputs, Registry,
};
use crate::plugin;

#[derive(Debug)]
pub struct Pipeline {
    /// Operators in declaration order
    operators: Vec<Box<dyn Operator>>,
    /// Resolved descriptors after template expansion, declaration order
    descriptors: Vec<OperatorDescriptor>,
    /// Indices into `operators`, in topological order
    topo_order: Vec<usize>,
}

impl Pipeline {
    /// Build a pipeline from a configuration document: a YAML sequence of
    /// operator descriptors.
    pub fn build(
        document: &Value,
        registry: &Registry,
        context: &mut BuildContext,
    ) -> Result<Self> {
        let descriptors = decode_descriptors(document)?;
        let descriptors = plugin::expand_descriptors(descriptors, &context.templates)?;

        let mut operators = Vec::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            operators.push(registry.build(descriptor, context)?);
        }

        connect_outputs(&mut operators)?;
        let topo_order = topological_order(&operators)?;

        Ok(Self {
            operators,
            descriptors,
            topo_order,
        })
    }

    /// The resolved operator descriptors this pipeline was built from
    pub fn descriptors(&self) -> &[OperatorDescriptor] {
        &self.descriptors
    }

    /// Operator ids in topological order
    pub fn topological_ids(&self) -> Vec<&str> {
        self.topo_order
            .iter()
            .map(|&i| self.operators[i].id())
            .collect()
    }

    /// All edges of the graph as (from, to) id pairs
    pub fn edges(&self) -> Vec<(String, String)> {
        let mut edges = Vec::new();
        for op in &self.operators {
            for output in op.output_ids() {
                edges.push((op.id().to_string(), output.clone()));
            }
        }
        edges
    }

    /// Start all operators, downstream first. If any operator fails to
    /// start, the ones already started are stopped again and the original
    /// error is returned.
    pub async fn start(&mut self) -> Result<()> {
        info!(operators = self.operators.len(), "starting pipeline");

        let order = self.topo_order.clone();
        let mut started: Vec<usize> = Vec::with_capacity(order.len());

        for &i in order.iter().rev() {
            let id = self.operators[i].id().to_string();
            let type_name = self.operators[i].type_name();
            debug!(operator_id = %id, operator_type = type_name, "starting operator");

            if let Err(e) = self.operators[i].start().await {
                error!(
                    operator_id = %id,
                    operator_type = type_name,
                    error = %e,
                    "operator failed to start, rolling back"
                );
                for &j in started.iter().rev() {
                    let stopped_id = self.operators[j].id().to_string();
                    if let Err(stop_err) = self.operators[j].stop().await {
                        error!(
                            operator_id = %stopped_id,
                            error = %stop_err,
                            "error stopping operator during rollback"
                        );
                    }
                }
                return Err(e.in_stage(format!("start operator '{}'", id)));
            }
            started.push(i);
        }

        Ok(())
    }

    /// Stop all operators, sources first. Infallible; sub-errors are
    /// logged.
    pub async fn stop(&mut self) {
        let order = self.topo_order.clone();
        for &i in &order {
            let id = self.operators[i].id().to_string();
            let type_name = self.operators[i].type_name();
            debug!(operator_id = %id, operator_type = type_name, "stopping operator");

            if let Err(e) = self.operators[i].stop().await {
                error!(
                    operator_id = %id,
                    operator_type = type_name,
                    error = %e,
                    "error stopping operator"
                );
            }
        }
        info!("pipeline stopped");
    }
}

/// Resolve every operator's declared outputs to input senders, failing on
/// unresolved or input-incapable targets.
fn connect_outputs(operators: &mut [Box<dyn Operator>]) -> Result<()> {
    let mut senders = HashMap::new();
    let mut all_ids = HashSet::new();
    for op in operators.iter() {
        all_ids.insert(op.id().to_string());
        if let Some(tx) = op.input_sender() {
            senders.insert(op.id().to_string(), tx);
        }
    }

    for op in operators.iter_mut() {
        let output_ids = op.output_ids().to_vec();
        let mut targets = Vec::with_capacity(output_ids.len());
        for output_id in &output_ids {
            match senders.get(output_id) {
                Some(tx) => targets.push((output_id.clone(), tx.clone())),
                None => {
                    let reason = if all_ids.contains(output_id) {
                        "is not capable of receiving entries"
                    } else {
                        "does not exist"
                    };
                    return Err(Error::Config(format!(
                        "invalid output reference: operator '{}' lists output '{}' which {}",
                        op.id(),
                        output_id,
                        reason
                    )));
                }
            }
        }
        op.connect_outputs(Outputs::new(targets));
    }

    Ok(())
}

/// Kahn's algorithm over the operator graph. A cycle fails with an error
/// naming one offending edge.
fn topological_order(operators: &[Box<dyn Operator>]) -> Result<Vec<usize>> {
    let n = operators.len();
    let index_of: HashMap<&str, usize> = operators
        .iter()
        .enumerate()
        .map(|(i, op)| (op.id(), i))
        .collect();

    let mut adjacency = vec![Vec::new(); n];
    let mut indegree = vec![0usize; n];
    for (i, op) in operators.iter().enumerate() {
        for output_id in op.output_ids() {
            if let Some(&j) = index_of.get(output_id.as_str()) {
                adjacency[i].push(j);
                indegree[j] += 1;
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &j in &adjacency[i] {
            indegree[j] -= 1;
            if indegree[j] == 0 {
                ready.push_back(j);
            }
        }
    }

    if order.len() < n {
        let ordered: HashSet<usize> = order.iter().copied().collect();
        for (i, op) in operators.iter().enumerate() {
            if ordered.contains(&i) {
                continue;
            }
            for &j in &adjacency[i] {
                if !ordered.contains(&j) {
                    return Err(Error::Config(format!(
                        "pipeline contains a cycle ({} -> {})",
                        op.id(),
                        operators[j].id()
                    )));
                }
            }
        }
        return Err(Error::Config("pipeline contains a cycle".to_string()));
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::{bounded, BoundedSender};
    use crate::entry::Entry;
    use crate::operator::{InputPort, WorkerHandle};
    use async_trait::async_trait;

    /// Test sink that forwards every received entry into a channel the
    /// test holds.
    struct Capture {
        id: String,
        input: InputPort,
        tx: BoundedSender<Entry>,
        worker: WorkerHandle,
    }

    #[async_trait]
    impl Operator for Capture {
        fn id(&self) -> &str {
            &self.id
        }

        fn type_name(&self) -> &'static str {
            "capture"
        }

        fn input_sender(&self) -> Option<BoundedSender<Entry>> {
            Some(self.input.sender())
        }

        async fn start(&mut self) -> Result<()> {
            let mut rx = self.input.take_receiver(&self.id)?;
            let tx = self.tx.clone();
            let cancel = self.worker.cancellation();
            self.worker.spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            while let Some(entry) = rx.try_recv() {
                                let _ = tx.send(entry).await;
                            }
                            return;
                        }
                        entry = rx.next() => {
                            let Some(entry) = entry else { return };
                            let _ = tx.send(entry).await;
                        }
                    }
                }
            });
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            self.worker.stop(&self.id, "capture").await;
            Ok(())
        }
    }

    fn registry_with_capture(
        capacity: usize,
    ) -> (Registry, crate::bounded_channel::BoundedReceiver<Entry>) {
        let (tx, rx) = bounded(capacity);
        let mut registry = Registry::with_builtins();
        registry.register("capture", move |desc: &OperatorDescriptor, _: &mut BuildContext| {
            Ok(Box::new(Capture {
                id: desc.id.clone(),
                input: InputPort::new(capacity),
                tx: tx.clone(),
                worker: WorkerHandle::new(),
            }) as Box<dyn Operator>)
        });
        (registry, rx)
    }

    fn build(yaml: &str, registry: &Registry) -> Result<Pipeline> {
        let document: Value = serde_yaml::from_str(yaml).unwrap();
        Pipeline::build(&document, registry, &mut BuildContext::in_memory())
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let registry = Registry::with_builtins();
        let yaml = "\
- type: noop
  id: a
  output: [b, c]
- type: noop
  id: b
  output: d
- type: noop
  id: c
  output: d
- type: noop
  id: d
";
        let pipeline = build(yaml, &registry).unwrap();
        let ids = pipeline.topological_ids();

        let position: HashMap<&str, usize> =
            ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        for (from, to) in pipeline.edges() {
            assert!(
                position[from.as_str()] < position[to.as_str()],
                "edge {} -> {} violates topological order {:?}",
                from,
                to,
                ids
            );
        }
    }

    #[test]
    fn test_cycle_rejected_naming_edge() {
        let registry = Registry::with_builtins();
        let yaml = "\
- type: noop
  id: a
  output: b
- type: noop
  id: b
  output: a
";
        let err = build(yaml, &registry).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("pipeline contains a cycle"), "{}", message);
        assert!(
            message.contains("a -> b") || message.contains("b -> a"),
            "cycle error should name an edge: {}",
            message
        );
    }

    #[test]
    fn test_unresolved_output_rejected() {
        let registry = Registry::with_builtins();
        let err = build("- type: noop\n  output: ghost\n", &registry).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_output_to_source_rejected() {
        let registry = Registry::with_builtins();
        let yaml = "\
- type: noop
  id: a
  output: tail
- type: file_input
  id: tail
  include: ['/tmp/never/*.log']
";
        let err = build(yaml, &registry).unwrap_err();
        assert!(err.to_string().contains("not capable of receiving"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let registry = Registry::with_builtins();
        let err = build("- type: no_such_thing\n", &registry).unwrap_err();
        assert!(err.to_string().contains("unknown operator type"));
    }

    #[tokio::test]
    async fn test_entries_flow_through_chain() {
        let (registry, mut rx) = registry_with_capture(16);
        let yaml = "\
- type: noop
  id: head
- type: metadata
  labels:
    hop: 'yes'
- type: capture
";
        let mut pipeline = build(yaml, &registry).unwrap();
        pipeline.start().await.unwrap();

        // Inject through the head operator's input queue
        let head_tx = pipeline
            .operators
            .iter()
            .find(|op| op.id() == "head")
            .and_then(|op| op.input_sender())
            .unwrap();
        head_tx.send(Entry::with_record("payload")).await.unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_secs(5), rx.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.record_string(), Some("payload"));
        assert_eq!(got.labels.get("hop").map(String::as_str), Some("yes"));

        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_fan_in_multiplexes() {
        let (registry, mut rx) = registry_with_capture(16);
        let yaml = "\
- type: noop
  id: left
  output: sink
- type: noop
  id: right
  output: sink
- type: capture
  id: sink
";
        let mut pipeline = build(yaml, &registry).unwrap();
        pipeline.start().await.unwrap();

        for op_id in ["left", "right"] {
            let tx = pipeline
                .operators
                .iter()
                .find(|op| op.id() == op_id)
                .and_then(|op| op.input_sender())
                .unwrap();
            tx.send(Entry::with_record(op_id)).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..2 {
            let entry = tokio::time::timeout(std::time::Duration::from_secs(5), rx.next())
                .await
                .unwrap()
                .unwrap();
            seen.push(entry.record_string().unwrap().to_string());
        }
        seen.sort();
        assert_eq!(seen, vec!["left", "right"]);

        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_start_failure_rolls_back() {
        // Two file inputs sharing one offsets bucket cannot both load from
        // a poisoned state; instead force failure with a double start
        let registry = Registry::with_builtins();
        let yaml = "\
- type: noop
  id: a
- type: stdout
";
        let mut pipeline = build(yaml, &registry).unwrap();
        pipeline.start().await.unwrap();

        // Starting again fails (receivers already taken) and must not hang
        let err = pipeline.start().await.unwrap_err();
        assert!(err.to_string().contains("started twice"));

        pipeline.stop().await;
    }
}
