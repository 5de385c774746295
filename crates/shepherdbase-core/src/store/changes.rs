//! Per-table change notification plumbing.
//!
//! Both adapters publish [`TableChange`]s into a [`ChangeHub`]: the local
//! store feeds it from sled's native watch mechanism, the remote store from
//! the server's change stream. Subscribers receive changes for one logical
//! table through a broadcast channel wrapped in a [`TableSubscription`].

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

/// Broadcast buffer per table. A subscriber that falls further behind than
/// this skips ahead to the oldest retained change.
const CHANGE_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Upsert,
    Delete,
}

/// One observed change to a logical table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableChange {
    pub table: String,
    pub op: ChangeOp,
    pub row_id: String,
    /// The affected row as stored, absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<Value>,
}

/// A live change listener for one table.
///
/// Dropping the subscription (or calling [`unsubscribe`](Self::unsubscribe),
/// which is safe to call repeatedly) stops delivery.
pub struct TableSubscription {
    table: String,
    receiver: Option<broadcast::Receiver<TableChange>>,
}

impl TableSubscription {
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Wait for the next change. Returns `None` once unsubscribed or when
    /// the publishing side has shut down. Lagged gaps are skipped.
    pub async fn next(&mut self) -> Option<TableChange> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(table = %self.table, skipped, "change subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Stop receiving changes. Idempotent.
    pub fn unsubscribe(&mut self) {
        self.receiver = None;
    }

    /// Non-blocking drain used by tests and polling callers.
    pub fn try_next(&mut self) -> Option<TableChange> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.try_recv() {
                Ok(change) => return Some(change),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Lazily-created broadcast sender per logical table.
pub(crate) struct ChangeHub {
    senders: Mutex<HashMap<String, broadcast::Sender<TableChange>>>,
}

impl ChangeHub {
    pub(crate) fn new() -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, table: &str) -> broadcast::Sender<TableChange> {
        let mut senders = self.senders.lock().expect("change hub lock poisoned");
        senders
            .entry(table.to_string())
            .or_insert_with(|| broadcast::channel(CHANGE_BUFFER).0)
            .clone()
    }

    pub(crate) fn subscribe(&self, table: &str) -> TableSubscription {
        TableSubscription {
            table: table.to_string(),
            receiver: Some(self.sender(table).subscribe()),
        }
    }

    /// Deliver a change to current subscribers; a table nobody watches is
    /// silently dropped.
    pub(crate) fn publish(&self, change: TableChange) {
        let senders = self.senders.lock().expect("change hub lock poisoned");
        if let Some(sender) = senders.get(&change.table) {
            let _ = sender.send(change);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(table: &str, id: &str) -> TableChange {
        TableChange {
            table: table.to_string(),
            op: ChangeOp::Upsert,
            row_id: id.to_string(),
            row: Some(json!({"household_id": id})),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let hub = ChangeHub::new();
        let mut sub = hub.subscribe("households");
        hub.publish(change("households", "h1"));
        let received = sub.next().await.expect("expected a change");
        assert_eq!(received.row_id, "h1");
        assert_eq!(received.op, ChangeOp::Upsert);
    }

    #[tokio::test]
    async fn test_changes_are_scoped_to_their_table() {
        let hub = ChangeHub::new();
        let mut sub = hub.subscribe("households");
        hub.publish(change("guardians", "g1"));
        hub.publish(change("households", "h1"));
        assert_eq!(sub.next().await.unwrap().row_id, "h1");
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let hub = ChangeHub::new();
        let mut sub = hub.subscribe("households");
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(sub.next().await.is_none());
        assert!(sub.try_next().is_none());
    }

    #[test]
    fn test_change_serialization_shape() {
        let serialized = serde_json::to_value(change("households", "h1")).unwrap();
        assert_eq!(serialized["op"], json!("upsert"));
        let round: TableChange =
            serde_json::from_str(r#"{"table":"children","op":"delete","row_id":"c9"}"#).unwrap();
        assert_eq!(round.op, ChangeOp::Delete);
        assert!(round.row.is_none());
    }
}
