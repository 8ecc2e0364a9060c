// SPDX-License-Identifier: Apache-2.0

use futures::future::join_all;

use crate::bounded_channel::BoundedSender;
use crate::entry::Entry;
use crate::error::{Error, Result};

/// The resolved downstream senders of one operator.
///
/// Fan-out clones the entry once per branch and delivers to all branches
/// concurrently, so a full queue on one branch delays only that branch's
/// copy, never a sibling's. An empty target set is the pipeline end:
/// entries are discarded.
#[derive(Clone, Default)]
pub struct Outputs {
    targets: Vec<(String, BoundedSender<Entry>)>,
}

impl Outputs {
    pub fn new(targets: Vec<(String, BoundedSender<Entry>)>) -> Self {
        Self { targets }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Deliver an entry to every downstream, blocking while any downstream
    /// queue is full.
    pub async fn send(&self, entry: Entry) -> Result<()> {
        let Some(((last_id, last_tx), rest)) = self.targets.split_last() else {
            return Ok(());
        };

        if rest.is_empty() {
            return last_tx
                .send(entry)
                .await
                .map_err(|_| Error::ChannelSend(last_id.clone()));
        }

        let mut sends = Vec::with_capacity(self.targets.len());
        for (_, tx) in rest {
            sends.push(tx.send(entry.clone()));
        }
        sends.push(last_tx.send(entry));

        for (i, result) in join_all(sends).await.into_iter().enumerate() {
            if result.is_err() {
                return Err(Error::ChannelSend(self.targets[i].0.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::bounded;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_to_single_target() {
        let (tx, mut rx) = bounded(4);
        let outputs = Outputs::new(vec![("sink".to_string(), tx)]);

        outputs.send(Entry::with_record("a")).await.unwrap();
        assert_eq!(rx.next().await.unwrap().record_string(), Some("a"));
    }

    #[tokio::test]
    async fn test_fan_out_clones_per_branch() {
        let (tx1, mut rx1) = bounded(4);
        let (tx2, mut rx2) = bounded(4);
        let outputs = Outputs::new(vec![("a".to_string(), tx1), ("b".to_string(), tx2)]);

        outputs
            .send(Entry::with_record(json!({"message": "hello"})))
            .await
            .unwrap();

        let mut first = rx1.next().await.unwrap();
        let second = rx2.next().await.unwrap();
        assert_eq!(first, second);

        // Mutating one copy leaves the other unchanged
        first.record["message"] = json!("changed");
        assert_eq!(second.record["message"], json!("hello"));
    }

    #[tokio::test]
    async fn test_slow_branch_does_not_block_sibling_delivery() {
        let (slow_tx, slow_rx) = bounded(1);
        let (fast_tx, mut fast_rx) = bounded(4);

        // Fill the slow branch so its next send blocks
        slow_tx.send(Entry::with_record("filler")).await.unwrap();

        let outputs = Outputs::new(vec![
            ("slow".to_string(), slow_tx),
            ("fast".to_string(), fast_tx),
        ]);

        let send = tokio::spawn(async move { outputs.send(Entry::with_record("x")).await });

        // The fast branch receives its copy while the slow branch is full
        let got = tokio::time::timeout(std::time::Duration::from_secs(1), fast_rx.next())
            .await
            .expect("fast branch should receive despite blocked sibling")
            .unwrap();
        assert_eq!(got.record_string(), Some("x"));

        // Draining the slow branch lets the overall send complete
        let mut slow_rx = slow_rx;
        slow_rx.next().await.unwrap();
        slow_rx.next().await.unwrap();
        send.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_send_to_closed_target_fails() {
        let (tx, rx) = bounded(1);
        drop(rx);
        let outputs = Outputs::new(vec![("gone".to_string(), tx)]);

        let err = outputs.send(Entry::new()).await.unwrap_err();
        assert!(matches!(err, Error::ChannelSend(id) if id == "gone"));
    }

    #[tokio::test]
    async fn test_empty_outputs_discard() {
        let outputs = Outputs::none();
        outputs.send(Entry::new()).await.unwrap();
    }
}
