// Outbound message bookkeeping
//
// Status moves monotonically: Sending → Sent → Acknowledged, with Failed
// and Acknowledged terminal. Regressions are ignored rather than panicked
// on, since acks can race the send bookkeeping.

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::dht::unix_now;
use crate::wire::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Sending,
    Sent,
    Acknowledged,
    Failed,
}

/// One outbound message awaiting its acknowledgement.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub recipient_username: String,
    pub content: String,
    pub sent_at: u64,
    pub acknowledged_at: Option<u64>,
    pub status: MessageStatus,
}

/// Concurrent table of pending outbound messages keyed by message id.
#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<HashMap<MessageId, PendingMessage>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: MessageId, recipient_username: String, content: String) {
        self.inner.lock().insert(
            id,
            PendingMessage {
                recipient_username,
                content,
                sent_at: unix_now(),
                acknowledged_at: None,
                status: MessageStatus::Sending,
            },
        );
    }

    pub fn mark_sent(&self, id: &MessageId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(id) {
            if entry.status == MessageStatus::Sending {
                entry.status = MessageStatus::Sent;
            }
        }
    }

    pub fn mark_acknowledged(&self, id: &MessageId) -> bool {
        let mut inner = self.inner.lock();
        match inner.get_mut(id) {
            Some(entry)
                if matches!(entry.status, MessageStatus::Sending | MessageStatus::Sent) =>
            {
                entry.status = MessageStatus::Acknowledged;
                entry.acknowledged_at = Some(unix_now());
                true
            }
            _ => false,
        }
    }

    pub fn mark_failed(&self, id: &MessageId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(id) {
            if matches!(entry.status, MessageStatus::Sending | MessageStatus::Sent) {
                entry.status = MessageStatus::Failed;
            }
        }
    }

    pub fn get(&self, id: &MessageId) -> Option<PendingMessage> {
        self.inner.lock().get(id).cloned()
    }

    pub fn all(&self) -> Vec<(MessageId, PendingMessage)> {
        self.inner
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_lifecycle() {
        let table = PendingTable::new();
        let id = MessageId::random();

        table.insert(id, "bob".to_string(), "hi".to_string());
        assert_eq!(table.get(&id).unwrap().status, MessageStatus::Sending);

        table.mark_sent(&id);
        assert_eq!(table.get(&id).unwrap().status, MessageStatus::Sent);

        assert!(table.mark_acknowledged(&id));
        let entry = table.get(&id).unwrap();
        assert_eq!(entry.status, MessageStatus::Acknowledged);
        assert!(entry.acknowledged_at.is_some());
    }

    #[test]
    fn failed_is_terminal() {
        let table = PendingTable::new();
        let id = MessageId::random();

        table.insert(id, "bob".to_string(), "hi".to_string());
        table.mark_failed(&id);
        assert!(!table.mark_acknowledged(&id));
        assert_eq!(table.get(&id).unwrap().status, MessageStatus::Failed);
    }

    #[test]
    fn acknowledged_is_terminal() {
        let table = PendingTable::new();
        let id = MessageId::random();

        table.insert(id, "bob".to_string(), "hi".to_string());
        assert!(table.mark_acknowledged(&id));
        table.mark_failed(&id);
        table.mark_sent(&id);
        assert_eq!(table.get(&id).unwrap().status, MessageStatus::Acknowledged);
    }

    #[test]
    fn ack_for_unknown_id_is_ignored() {
        let table = PendingTable::new();
        assert!(!table.mark_acknowledged(&MessageId::random()));
    }

    #[test]
    fn ack_can_race_ahead_of_sent() {
        // The ack may arrive while the send call is still unwinding.
        let table = PendingTable::new();
        let id = MessageId::random();
        table.insert(id, "bob".to_string(), "hi".to_string());

        assert!(table.mark_acknowledged(&id));
        table.mark_sent(&id);
        assert_eq!(table.get(&id).unwrap().status, MessageStatus::Acknowledged);
    }
}
