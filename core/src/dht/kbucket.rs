// K-bucket — bounded LRU list of known peers
//
// Head is the least-recently-seen node, tail the most recent. Eviction is
// the caller's decision: a full bucket reports BucketFull and the caller
// chooses between dropping the newcomer and replace_oldest.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use super::NodeId;

/// A peer known to the routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KademliaNode {
    pub id: NodeId,
    pub public_key: Vec<u8>,
    pub address: SocketAddr,
    pub last_seen: u64,
}

impl KademliaNode {
    pub fn new(id: NodeId, public_key: Vec<u8>, address: SocketAddr) -> Self {
        Self {
            id,
            public_key,
            address,
            last_seen: unix_now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = unix_now();
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Result of attempting to add a node to a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// New node appended at the tail.
    Added,
    /// Node already present; moved to the tail and marked seen.
    Updated,
    /// Bucket at capacity; nothing changed.
    BucketFull,
}

/// Ordered list (oldest-first) of up to `k` nodes within one bucket index.
#[derive(Debug)]
pub struct KBucket {
    nodes: Vec<KademliaNode>,
    capacity: usize,
}

impl KBucket {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: Vec::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|n| n.id == *id)
    }

    /// Add or refresh a node. No two entries ever share an id.
    pub fn try_add(&mut self, node: KademliaNode) -> AddOutcome {
        if let Some(pos) = self.nodes.iter().position(|n| n.id == node.id) {
            let mut existing = self.nodes.remove(pos);
            existing.address = node.address;
            existing.public_key = node.public_key;
            existing.touch();
            self.nodes.push(existing);
            return AddOutcome::Updated;
        }

        if self.nodes.len() < self.capacity {
            self.nodes.push(node);
            return AddOutcome::Added;
        }

        AddOutcome::BucketFull
    }

    /// Drop the least-recently-seen node and append the replacement.
    pub fn replace_oldest(&mut self, node: KademliaNode) {
        if !self.nodes.is_empty() {
            self.nodes.remove(0);
        }
        self.nodes.retain(|n| n.id != node.id);
        self.nodes.push(node);
    }

    pub fn get_oldest(&self) -> Option<&KademliaNode> {
        self.nodes.first()
    }

    /// Move the entry to the tail and refresh its timestamp.
    pub fn mark_seen(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.nodes.iter().position(|n| n.id == *id) {
            let mut node = self.nodes.remove(pos);
            node.touch();
            self.nodes.push(node);
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|n| n.id != *id);
        self.nodes.len() != before
    }

    pub fn get(&self, id: &NodeId) -> Option<&KademliaNode> {
        self.nodes.iter().find(|n| n.id == *id)
    }

    /// Snapshot in most-recently-seen-first order. Callers rely on this
    /// ordering when picking fresh peers.
    pub fn get_nodes(&self) -> Vec<KademliaNode> {
        self.nodes.iter().rev().cloned().collect()
    }
}
