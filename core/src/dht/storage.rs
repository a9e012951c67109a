// In-memory DHT storage: key/value records plus offline-message mailboxes
//
// Capacity pressure is a DoS defence, not a user-visible failure: when a
// cap is hit we attempt a cleanup and otherwise drop silently.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use super::NodeId;
use crate::config::StorageConfig;

#[derive(Debug, Clone)]
struct StoredValue {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone)]
struct OfflineMessage {
    ciphertext: Vec<u8>,
    expires_at: Instant,
}

#[derive(Default)]
struct ValueTable {
    values: HashMap<NodeId, StoredValue>,
    total_bytes: usize,
}

/// Storage statistics for status reporting.
#[derive(Debug, Clone, Copy)]
pub struct StorageStats {
    pub values: usize,
    pub value_bytes: usize,
    pub offline_recipients: usize,
    pub offline_messages: usize,
}

/// Durable (for the process lifetime) store backing STORE / FIND_VALUE and
/// the offline mailboxes.
pub struct Storage {
    config: StorageConfig,
    values: Mutex<ValueTable>,
    offline: Mutex<HashMap<NodeId, Vec<OfflineMessage>>>,
    last_cleanup: Mutex<Instant>,
}

impl Storage {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            values: Mutex::new(ValueTable::default()),
            offline: Mutex::new(HashMap::new()),
            // Backdate so the first pressure event may clean immediately.
            last_cleanup: Mutex::new(Instant::now() - Duration::from_secs(3600)),
        }
    }

    /// Insert or overwrite a value. Silently drops when full after cleanup.
    pub fn store(&self, key: NodeId, value: Vec<u8>, ttl: Option<Duration>) {
        let now = Instant::now();
        let expires_at = ttl.map(|t| now + t);

        {
            let mut table = self.values.lock();
            let new_entry = !table.values.contains_key(&key);
            let at_cap = table.values.len() >= self.config.max_values
                || table.total_bytes + value.len() > self.config.max_value_bytes;

            if !(new_entry && at_cap) {
                if let Some(old) = table.values.remove(&key) {
                    table.total_bytes -= old.data.len();
                }
                table.total_bytes += value.len();
                table.values.insert(key, StoredValue { data: value, expires_at });
                return;
            }
        }

        // At capacity: one cleanup attempt, then retry once.
        self.maybe_cleanup();

        let mut table = self.values.lock();
        if table.values.len() >= self.config.max_values
            || table.total_bytes + value.len() > self.config.max_value_bytes
        {
            debug!(key = %key, "value store full, dropping");
            return;
        }
        table.total_bytes += value.len();
        table.values.insert(key, StoredValue { data: value, expires_at });
    }

    /// Fetch a value; expired entries are removed lazily.
    pub fn get(&self, key: &NodeId) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut table = self.values.lock();
        match table.values.get(key) {
            Some(value) if value.is_expired(now) => {
                let removed = table.values.remove(key).expect("entry just observed");
                table.total_bytes -= removed.data.len();
                None
            }
            Some(value) => Some(value.data.clone()),
            None => None,
        }
    }

    /// Append to a recipient's mailbox. Per-recipient and global caps apply;
    /// overflow drops silently after a cleanup attempt.
    pub fn store_offline_message(
        &self,
        recipient: NodeId,
        ciphertext: Vec<u8>,
        ttl: Option<Duration>,
    ) {
        let expires_at = Instant::now() + ttl.unwrap_or(self.config.offline_ttl);

        {
            let mut offline = self.offline.lock();
            let is_new_recipient = !offline.contains_key(&recipient);
            if !(is_new_recipient && offline.len() >= self.config.max_offline_recipients) {
                let mailbox = offline.entry(recipient).or_default();
                if mailbox.len() >= self.config.max_offline_per_recipient {
                    debug!(recipient = %recipient, "mailbox full, dropping offline message");
                    return;
                }
                mailbox.push(OfflineMessage { ciphertext, expires_at });
                return;
            }
        }

        self.maybe_cleanup();

        let mut offline = self.offline.lock();
        if !offline.contains_key(&recipient) && offline.len() >= self.config.max_offline_recipients
        {
            debug!("offline recipient cap reached, dropping message");
            return;
        }
        let mailbox = offline.entry(recipient).or_default();
        if mailbox.len() < self.config.max_offline_per_recipient {
            mailbox.push(OfflineMessage { ciphertext, expires_at });
        }
    }

    /// Drain the recipient's mailbox: removes and returns every non-expired
    /// message in insertion order. Retrieval implies delivery acceptance.
    pub fn get_offline_messages(&self, recipient: &NodeId) -> Vec<Vec<u8>> {
        let now = Instant::now();
        let mut offline = self.offline.lock();
        match offline.remove(recipient) {
            Some(mailbox) => mailbox
                .into_iter()
                .filter(|m| m.expires_at > now)
                .map(|m| m.ciphertext)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Live key/value pairs for periodic re-announcement.
    pub fn get_all_for_republish(&self) -> Vec<(NodeId, Vec<u8>)> {
        let now = Instant::now();
        let table = self.values.lock();
        table
            .values
            .iter()
            .filter(|(_, v)| !v.is_expired(now))
            .map(|(k, v)| (*k, v.data.clone()))
            .collect()
    }

    pub fn stats(&self) -> StorageStats {
        let table = self.values.lock();
        let offline = self.offline.lock();
        StorageStats {
            values: table.values.len(),
            value_bytes: table.total_bytes,
            offline_recipients: offline.len(),
            offline_messages: offline.values().map(|m| m.len()).sum(),
        }
    }

    /// Sweep expired entries, at most once per cleanup interval.
    pub fn maybe_cleanup(&self) {
        {
            let mut last = self.last_cleanup.lock();
            if last.elapsed() < self.config.cleanup_interval {
                return;
            }
            *last = Instant::now();
        }
        self.cleanup_now();
    }

    fn cleanup_now(&self) {
        let now = Instant::now();

        let mut table = self.values.lock();
        let mut freed = 0usize;
        table.values.retain(|_, value| {
            if value.is_expired(now) {
                freed += value.data.len();
                false
            } else {
                true
            }
        });
        table.total_bytes -= freed;
        drop(table);

        let mut offline = self.offline.lock();
        for mailbox in offline.values_mut() {
            mailbox.retain(|m| m.expires_at > now);
        }
        offline.retain(|_, mailbox| !mailbox.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> Storage {
        Storage::new(StorageConfig::default())
    }

    #[test]
    fn store_get_roundtrip_with_ttl() {
        let storage = storage();
        let key = NodeId::from_string("k");

        storage.store(key, b"v".to_vec(), Some(Duration::from_millis(50)));
        assert_eq!(storage.get(&key), Some(b"v".to_vec()));

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(storage.get(&key), None);
    }

    #[test]
    fn store_without_ttl_persists() {
        let storage = storage();
        let key = NodeId::from_string("k");
        storage.store(key, b"v".to_vec(), None);
        assert_eq!(storage.get(&key), Some(b"v".to_vec()));
    }

    #[test]
    fn overwrite_updates_byte_accounting() {
        let storage = storage();
        let key = NodeId::from_string("k");
        storage.store(key, vec![0; 100], None);
        storage.store(key, vec![0; 10], None);
        assert_eq!(storage.stats().value_bytes, 10);
        assert_eq!(storage.stats().values, 1);
    }

    #[test]
    fn value_cap_drops_silently() {
        let storage = Storage::new(StorageConfig {
            max_values: 2,
            cleanup_interval: Duration::from_secs(3600),
            ..StorageConfig::default()
        });

        storage.store(NodeId::from_string("a"), vec![1], None);
        storage.store(NodeId::from_string("b"), vec![2], None);
        storage.store(NodeId::from_string("c"), vec![3], None);

        assert_eq!(storage.stats().values, 2);
        assert_eq!(storage.get(&NodeId::from_string("c")), None);
        // Overwriting an existing key is always allowed at cap.
        storage.store(NodeId::from_string("a"), vec![9], None);
        assert_eq!(storage.get(&NodeId::from_string("a")), Some(vec![9]));
    }

    #[test]
    fn byte_cap_enforced() {
        let storage = Storage::new(StorageConfig {
            max_value_bytes: 100,
            cleanup_interval: Duration::from_secs(3600),
            ..StorageConfig::default()
        });

        storage.store(NodeId::from_string("a"), vec![0; 80], None);
        storage.store(NodeId::from_string("b"), vec![0; 50], None);
        assert_eq!(storage.stats().values, 1);
    }

    #[test]
    fn offline_mailbox_drains_in_order() {
        let storage = storage();
        let recipient = NodeId::from_string("recipient");

        storage.store_offline_message(recipient, b"m1".to_vec(), None);
        storage.store_offline_message(recipient, b"m2".to_vec(), None);

        let drained = storage.get_offline_messages(&recipient);
        assert_eq!(drained, vec![b"m1".to_vec(), b"m2".to_vec()]);

        // A second drain is empty until new messages arrive.
        assert!(storage.get_offline_messages(&recipient).is_empty());

        storage.store_offline_message(recipient, b"m3".to_vec(), None);
        assert_eq!(storage.get_offline_messages(&recipient), vec![b"m3".to_vec()]);
    }

    #[test]
    fn expired_offline_messages_are_not_returned() {
        let storage = storage();
        let recipient = NodeId::from_string("recipient");

        storage.store_offline_message(recipient, b"old".to_vec(), Some(Duration::from_millis(10)));
        storage.store_offline_message(recipient, b"new".to_vec(), None);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(storage.get_offline_messages(&recipient), vec![b"new".to_vec()]);
    }

    #[test]
    fn per_recipient_cap_enforced() {
        let storage = Storage::new(StorageConfig {
            max_offline_per_recipient: 3,
            cleanup_interval: Duration::from_secs(3600),
            ..StorageConfig::default()
        });
        let recipient = NodeId::from_string("recipient");

        for i in 0..5u8 {
            storage.store_offline_message(recipient, vec![i], None);
        }
        assert_eq!(storage.get_offline_messages(&recipient).len(), 3);
    }

    #[test]
    fn republish_skips_expired_values() {
        let storage = storage();
        storage.store(NodeId::from_string("live"), vec![1], None);
        storage.store(
            NodeId::from_string("dying"),
            vec![2],
            Some(Duration::from_millis(10)),
        );

        std::thread::sleep(Duration::from_millis(30));
        let republish = storage.get_all_for_republish();
        assert_eq!(republish.len(), 1);
        assert_eq!(republish[0].0, NodeId::from_string("live"));
    }

    #[test]
    fn cleanup_sweeps_expired_entries() {
        let storage = storage();
        let recipient = NodeId::from_string("r");
        storage.store(
            NodeId::from_string("v"),
            vec![0; 64],
            Some(Duration::from_millis(5)),
        );
        storage.store_offline_message(recipient, vec![1], Some(Duration::from_millis(5)));
        std::thread::sleep(Duration::from_millis(20));

        storage.maybe_cleanup();
        let stats = storage.stats();
        assert_eq!(stats.values, 0);
        assert_eq!(stats.value_bytes, 0);
        assert_eq!(stats.offline_recipients, 0);
    }
}
