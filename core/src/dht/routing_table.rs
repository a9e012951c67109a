// Routing table — 256 k-buckets behind bucket-local locks

use parking_lot::RwLock;
use rand::seq::SliceRandom;

use super::kbucket::{AddOutcome, KBucket, KademliaNode};
use super::node_id::{NodeId, NODE_ID_LEN};

const BUCKET_COUNT: usize = NODE_ID_LEN * 8;

/// All peers known to the local node, partitioned by XOR distance.
/// The local id is never stored.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<RwLock<KBucket>>,
    k: usize,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize) -> Self {
        let buckets = (0..BUCKET_COUNT).map(|_| RwLock::new(KBucket::new(k))).collect();
        Self {
            local_id,
            buckets,
            k,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Add or refresh a node. Adding the local id is a no-op reported as
    /// Updated so callers treat it as already-known.
    pub fn try_add(&self, node: KademliaNode) -> AddOutcome {
        let Some(index) = self.local_id.bucket_index(&node.id) else {
            return AddOutcome::Updated;
        };
        self.buckets[index].write().try_add(node)
    }

    pub fn mark_seen(&self, id: &NodeId) -> bool {
        match self.local_id.bucket_index(id) {
            Some(index) => self.buckets[index].write().mark_seen(id),
            None => false,
        }
    }

    pub fn remove(&self, id: &NodeId) -> bool {
        match self.local_id.bucket_index(id) {
            Some(index) => self.buckets[index].write().remove(id),
            None => false,
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<KademliaNode> {
        let index = self.local_id.bucket_index(id)?;
        self.buckets[index].read().get(id).cloned()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Least-recently-seen node in the bucket `id` belongs to.
    pub fn oldest_in_bucket_of(&self, id: &NodeId) -> Option<KademliaNode> {
        let index = self.local_id.bucket_index(id)?;
        self.buckets[index].read().get_oldest().cloned()
    }

    /// Evict the oldest node in `node`'s bucket and insert `node` at the tail.
    pub fn replace_oldest_in_bucket(&self, node: KademliaNode) {
        if let Some(index) = self.local_id.bucket_index(&node.id) {
            self.buckets[index].write().replace_oldest(node);
        }
    }

    /// Total nodes across all buckets.
    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.read().len()).sum()
    }

    /// The `n` nodes closest to `target`, sorted by ascending distance.
    /// Ties break on the node id so repeated queries are deterministic.
    pub fn find_closest(&self, target: &NodeId, n: usize) -> Vec<KademliaNode> {
        let mut nodes: Vec<KademliaNode> = self
            .buckets
            .iter()
            .flat_map(|b| b.read().get_nodes())
            .collect();
        nodes.sort_by_key(|node| (node.id.distance_to(target), node.id));
        nodes.truncate(n);
        nodes
    }

    /// `n` nodes sampled uniformly from the whole table (Fisher-Yates).
    /// Callers filter out the lookup target themselves.
    pub fn get_random_nodes(&self, n: usize) -> Vec<KademliaNode> {
        let mut nodes: Vec<KademliaNode> = self
            .buckets
            .iter()
            .flat_map(|b| b.read().get_nodes())
            .collect();
        nodes.shuffle(&mut rand::thread_rng());
        nodes.truncate(n);
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn node_from_id(id: NodeId) -> KademliaNode {
        KademliaNode::new(id, vec![0; 32], "10.0.0.1:4000".parse().unwrap())
    }

    fn table() -> RoutingTable {
        RoutingTable::new(NodeId::from_bytes([0u8; 32]), 20)
    }

    #[test]
    fn local_id_is_never_stored() {
        let table = table();
        let outcome = table.try_add(node_from_id(table.local_id()));
        assert_eq!(outcome, AddOutcome::Updated);
        assert_eq!(table.node_count(), 0);
    }

    #[test]
    fn node_count_matches_bucket_sum() {
        let table = table();
        for _ in 0..50 {
            table.try_add(node_from_id(NodeId::random()));
        }
        assert_eq!(table.node_count(), 50);
    }

    #[test]
    fn find_closest_is_sorted_by_distance() {
        // Ten random nodes, target near zero: returned distances must be
        // non-decreasing.
        let table = table();
        for _ in 0..10 {
            table.try_add(node_from_id(NodeId::random()));
        }

        let mut target_bytes = [0u8; 32];
        target_bytes[31] = 1;
        let target = NodeId::from_bytes(target_bytes);

        let closest = table.find_closest(&target, 5);
        assert_eq!(closest.len(), 5);

        let distances: Vec<_> = closest.iter().map(|n| n.id.distance_to(&target)).collect();
        for pair in distances.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn find_closest_is_deterministic() {
        let table = table();
        for _ in 0..30 {
            table.try_add(node_from_id(NodeId::random()));
        }
        let target = NodeId::random();

        let first: Vec<_> = table.find_closest(&target, 10).iter().map(|n| n.id).collect();
        let second: Vec<_> = table.find_closest(&target, 10).iter().map(|n| n.id).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn random_nodes_are_distinct_and_bounded() {
        let table = table();
        for _ in 0..20 {
            table.try_add(node_from_id(NodeId::random()));
        }

        let sampled = table.get_random_nodes(5);
        assert_eq!(sampled.len(), 5);
        let ids: HashSet<_> = sampled.iter().map(|n| n.id).collect();
        assert_eq!(ids.len(), 5);

        // Asking for more than exist returns everything.
        assert_eq!(table.get_random_nodes(100).len(), 20);
    }

    #[test]
    fn remove_and_get() {
        let table = table();
        let node = node_from_id(NodeId::random());
        table.try_add(node.clone());

        assert!(table.contains(&node.id));
        assert!(table.remove(&node.id));
        assert!(table.get(&node.id).is_none());
    }

    #[test]
    fn replace_oldest_in_full_bucket() {
        // Force every node into bucket 7 (ids with a single low byte).
        let table = RoutingTable::new(NodeId::from_bytes([0u8; 32]), 2);
        let mut id_bytes = [0u8; 32];

        id_bytes[31] = 0x80;
        let first = NodeId::from_bytes(id_bytes);
        id_bytes[31] = 0x81;
        let second = NodeId::from_bytes(id_bytes);
        id_bytes[31] = 0x82;
        let third = NodeId::from_bytes(id_bytes);

        assert_eq!(table.try_add(node_from_id(first)), AddOutcome::Added);
        assert_eq!(table.try_add(node_from_id(second)), AddOutcome::Added);
        assert_eq!(table.try_add(node_from_id(third)), AddOutcome::BucketFull);

        assert_eq!(table.oldest_in_bucket_of(&third).unwrap().id, first);
        table.replace_oldest_in_bucket(node_from_id(third));
        assert!(table.contains(&third));
        assert!(!table.contains(&first));
    }
}
