// Relay circuit table entry

use std::net::SocketAddr;
use std::time::Instant;

use crate::dht::NodeId;
use crate::wire::CircuitId;

/// One live circuit between a requester and a target, with byte accounting.
#[derive(Debug, Clone)]
pub struct RelayCircuit {
    pub circuit_id: CircuitId,
    pub requester_id: NodeId,
    pub requester_endpoint: SocketAddr,
    pub target_node_id: NodeId,
    pub target_endpoint: Option<SocketAddr>,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub bytes_relayed: u64,
}

impl RelayCircuit {
    pub fn new(
        circuit_id: CircuitId,
        requester_id: NodeId,
        requester_endpoint: SocketAddr,
        target_node_id: NodeId,
        target_endpoint: Option<SocketAddr>,
    ) -> Self {
        let now = Instant::now();
        Self {
            circuit_id,
            requester_id,
            requester_endpoint,
            target_node_id,
            target_endpoint,
            created_at: now,
            last_activity: now,
            bytes_relayed: 0,
        }
    }

    /// True when relaying `len` more bytes would cross the byte cap.
    pub fn would_exceed(&self, len: usize, cap: u64) -> bool {
        self.bytes_relayed + len as u64 > cap
    }

    /// Account forwarded bytes and refresh the activity timestamp.
    pub fn record(&mut self, len: usize) {
        self.bytes_relayed += len as u64;
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounting_accumulates() {
        let mut circuit = RelayCircuit::new(
            CircuitId::random(),
            NodeId::from_string("requester"),
            "10.0.0.1:5000".parse().unwrap(),
            NodeId::from_string("target"),
            None,
        );

        assert!(!circuit.would_exceed(100, 1000));
        circuit.record(600);
        assert_eq!(circuit.bytes_relayed, 600);
        assert!(!circuit.would_exceed(400, 1000));
        assert!(circuit.would_exceed(401, 1000));
    }
}
