// Relay service — circuit switchboard plus one-shot request piping
//
// Stateless mode forwards a single frame to a target from the routing
// table and pipes the response back. Circuit mode keeps a RelayCircuit
// per id and forwards RelayData frames raw to whichever party is the
// opposite of the sender.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::circuit::RelayCircuit;
use crate::config::RelayConfig;
use crate::dht::{NodeId, RoutingTable};
use crate::net::{one_shot_request, push_frame, ConnectionManager};
use crate::wire::CircuitId;

/// Where an admitted RelayData frame should be forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DataVerdict {
    Forward {
        node: NodeId,
        endpoint: Option<SocketAddr>,
    },
    Unknown,
    CapExceeded,
}

/// What became of one RelayData frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDataOutcome {
    Forwarded,
    Dropped,
    /// Byte cap crossed: the circuit is gone and the sender gets a
    /// CircuitClose.
    Closed,
}

/// Relay statistics for status reporting.
#[derive(Debug, Clone, Copy)]
pub struct RelayStats {
    pub active_circuits: usize,
    pub bytes_relayed: u64,
}

pub struct RelayService {
    config: RelayConfig,
    routing: Arc<RoutingTable>,
    connections: Arc<ConnectionManager>,
    circuits: Mutex<HashMap<CircuitId, RelayCircuit>>,
    total_bytes: AtomicU64,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<RelayService>,
}

impl RelayService {
    pub fn new(
        config: RelayConfig,
        routing: Arc<RoutingTable>,
        connections: Arc<ConnectionManager>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            routing,
            connections,
            circuits: Mutex::new(HashMap::new()),
            total_bytes: AtomicU64::new(0),
            cleanup_task: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    /// Spawn the periodic cleanup loop. Idempotent.
    pub fn start(&self) {
        let mut slot = self.cleanup_task.lock();
        if slot.is_some() {
            return;
        }
        let Some(service) = self.self_ref.upgrade() else {
            return;
        };
        let interval = self.config.cleanup_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                service.cleanup_expired();
            }
        }));
    }

    /// Stop the cleanup loop and drop all circuits. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.cleanup_task.lock().take() {
            task.abort();
        }
        self.circuits.lock().clear();
    }

    /// One-shot relay: forward `payload` to `target_id` over a dedicated
    /// socket and return the piped-back response. Fails fast when the
    /// target is unknown or unreachable.
    pub async fn handle_relay_request(
        &self,
        source: SocketAddr,
        target_id: NodeId,
        payload: Vec<u8>,
    ) -> (bool, Vec<u8>) {
        let Some(target) = self.routing.get(&target_id) else {
            debug!(%source, target = %target_id, "relay request for unknown target");
            return (false, Vec::new());
        };

        let timeout = self.config.relay_request_timeout;
        match one_shot_request(target.address, &payload, timeout, timeout).await {
            Ok(response) => {
                self.total_bytes
                    .fetch_add((payload.len() + response.len()) as u64, Ordering::Relaxed);
                (true, response)
            }
            Err(err) => {
                warn!(target = %target_id, %err, "relay request forwarding failed");
                (false, Vec::new())
            }
        }
    }

    /// Admit a new circuit unless a quota forbids it. Returns the rejection
    /// reason on refusal.
    pub fn handle_circuit_request(
        &self,
        requester_id: NodeId,
        requester: SocketAddr,
        circuit_id: CircuitId,
        target_id: NodeId,
    ) -> Result<(), String> {
        let mut circuits = self.circuits.lock();

        if circuits.len() >= self.config.max_circuits {
            return Err("circuit limit reached".to_string());
        }
        if circuits.contains_key(&circuit_id) {
            return Err("duplicate circuit id".to_string());
        }
        let held = circuits
            .values()
            .filter(|c| c.requester_endpoint.ip() == requester.ip())
            .count();
        if held >= self.config.max_circuits_per_requester {
            return Err("requester circuit quota exceeded".to_string());
        }

        let target_endpoint = self.routing.get(&target_id).map(|n| n.address);
        circuits.insert(
            circuit_id,
            RelayCircuit::new(circuit_id, requester_id, requester, target_id, target_endpoint),
        );
        info!(circuit = %circuit_id, %requester, target = %target_id, "circuit opened");
        Ok(())
    }

    /// Account a RelayData frame against its circuit and decide where the
    /// bytes go. Removes the circuit when the byte cap is crossed.
    pub(crate) fn admit_data(
        &self,
        circuit_id: &CircuitId,
        from: SocketAddr,
        len: usize,
    ) -> DataVerdict {
        let mut circuits = self.circuits.lock();
        let Some(circuit) = circuits.get_mut(circuit_id) else {
            return DataVerdict::Unknown;
        };

        if circuit.would_exceed(len, self.config.max_circuit_bytes) {
            warn!(circuit = %circuit_id, "byte cap exceeded, closing circuit");
            circuits.remove(circuit_id);
            return DataVerdict::CapExceeded;
        }

        circuit.record(len);
        self.total_bytes.fetch_add(len as u64, Ordering::Relaxed);

        let from_requester = from.ip() == circuit.requester_endpoint.ip();
        if from_requester {
            if circuit.target_endpoint.is_none() {
                // The target may have joined the routing table since the
                // circuit was opened.
                circuit.target_endpoint =
                    self.routing.get(&circuit.target_node_id).map(|n| n.address);
            }
            DataVerdict::Forward {
                node: circuit.target_node_id,
                endpoint: circuit.target_endpoint,
            }
        } else {
            DataVerdict::Forward {
                node: circuit.requester_id,
                endpoint: Some(circuit.requester_endpoint),
            }
        }
    }

    /// Forward an admitted RelayData frame raw to the opposite party,
    /// preferring a live connection over a fresh dial.
    pub async fn handle_relay_data(
        &self,
        source: SocketAddr,
        circuit_id: CircuitId,
        data: Vec<u8>,
    ) -> RelayDataOutcome {
        match self.admit_data(&circuit_id, source, data.len()) {
            DataVerdict::Unknown => {
                debug!(circuit = %circuit_id, "data for unknown circuit dropped");
                RelayDataOutcome::Dropped
            }
            DataVerdict::CapExceeded => RelayDataOutcome::Closed,
            DataVerdict::Forward { node, endpoint } => {
                if self.connections.send_to_peer_id(&node, &data).await.is_ok() {
                    return RelayDataOutcome::Forwarded;
                }
                if let Some(endpoint) = endpoint {
                    match push_frame(endpoint, &data, self.config.relay_request_timeout).await {
                        Ok(()) => return RelayDataOutcome::Forwarded,
                        Err(err) => {
                            warn!(circuit = %circuit_id, %endpoint, %err, "circuit forward failed");
                        }
                    }
                }
                RelayDataOutcome::Dropped
            }
        }
    }

    pub fn handle_circuit_close(&self, circuit_id: &CircuitId) {
        if self.circuits.lock().remove(circuit_id).is_some() {
            info!(circuit = %circuit_id, "circuit closed by peer");
        }
    }

    /// Remove circuits idle past the configured timeout.
    pub fn cleanup_expired(&self) {
        let idle = self.config.circuit_idle_timeout;
        let mut circuits = self.circuits.lock();
        let before = circuits.len();
        circuits.retain(|_, circuit| circuit.idle_for() < idle);
        let removed = before - circuits.len();
        if removed > 0 {
            debug!(removed, "expired circuits removed");
        }
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            active_circuits: self.circuits.lock().len(),
            bytes_relayed: self.total_bytes.load(Ordering::Relaxed),
        }
    }
}

#[async_trait::async_trait]
impl crate::dht::RelaySink for RelayService {
    async fn handle_relay(
        &self,
        source: SocketAddr,
        message: crate::wire::KademliaMessage,
    ) -> Option<crate::wire::MessageBody> {
        use crate::wire::MessageBody;

        let reply_to = message.message_id;
        match message.body {
            MessageBody::RelayRequest { target_id, payload } => {
                let (success, payload) =
                    self.handle_relay_request(source, target_id, payload).await;
                Some(MessageBody::RelayResponse {
                    in_response_to: reply_to,
                    success,
                    payload,
                })
            }
            MessageBody::CircuitRequest {
                circuit_id,
                target_id,
            } => {
                let verdict = self.handle_circuit_request(
                    message.sender_id,
                    source,
                    circuit_id,
                    target_id,
                );
                Some(MessageBody::CircuitResponse {
                    in_response_to: reply_to,
                    circuit_id,
                    accepted: verdict.is_ok(),
                    error: verdict.err().unwrap_or_default(),
                })
            }
            MessageBody::RelayData { circuit_id, data } => {
                match self.handle_relay_data(source, circuit_id, data).await {
                    RelayDataOutcome::Closed => Some(MessageBody::CircuitClose { circuit_id }),
                    RelayDataOutcome::Forwarded | RelayDataOutcome::Dropped => None,
                }
            }
            MessageBody::CircuitClose { circuit_id } => {
                self.handle_circuit_close(&circuit_id);
                None
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;

    fn service(config: RelayConfig) -> Arc<RelayService> {
        let routing = Arc::new(RoutingTable::new(NodeId::from_string("relay"), 20));
        let connections = ConnectionManager::new(
            ConnectionConfig::default(),
            NodeId::from_string("relay"),
            vec![0; 32],
            Arc::clone(&routing),
        );
        RelayService::new(config, routing, connections)
    }

    fn requester() -> SocketAddr {
        "10.1.1.1:5000".parse().unwrap()
    }

    fn requester_id() -> NodeId {
        NodeId::from_string("requester")
    }

    #[test]
    fn circuit_quotas() {
        let service = service(RelayConfig {
            max_circuits: 2,
            max_circuits_per_requester: 1,
            ..RelayConfig::default()
        });

        let target = NodeId::from_string("target");
        assert!(service
            .handle_circuit_request(requester_id(), requester(), CircuitId::random(), target)
            .is_ok());

        // Same requester IP: per-requester quota.
        let err = service
            .handle_circuit_request(
                requester_id(),
                "10.1.1.1:6000".parse().unwrap(),
                CircuitId::random(),
                target,
            )
            .unwrap_err();
        assert!(err.contains("quota"));

        assert!(service
            .handle_circuit_request(
                NodeId::from_string("other"),
                "10.1.1.2:5000".parse().unwrap(),
                CircuitId::random(),
                target,
            )
            .is_ok());

        // Global cap.
        let err = service
            .handle_circuit_request(
                NodeId::from_string("third"),
                "10.1.1.3:5000".parse().unwrap(),
                CircuitId::random(),
                target,
            )
            .unwrap_err();
        assert!(err.contains("limit"));
    }

    #[test]
    fn duplicate_circuit_id_refused() {
        let service = service(RelayConfig::default());
        let id = CircuitId::random();
        let target = NodeId::from_string("target");

        assert!(service
            .handle_circuit_request(requester_id(), requester(), id, target)
            .is_ok());
        assert!(service
            .handle_circuit_request(requester_id(), requester(), id, target)
            .is_err());
    }

    #[test]
    fn byte_cap_closes_circuit() {
        // Data totalling just below the cap passes; the chunk that crosses
        // it removes the circuit and later frames find nothing.
        let service = service(RelayConfig {
            max_circuit_bytes: 1000,
            ..RelayConfig::default()
        });
        let id = CircuitId::random();
        service
            .handle_circuit_request(requester_id(), requester(), id, NodeId::from_string("target"))
            .unwrap();

        for _ in 0..9 {
            let verdict = service.admit_data(&id, requester(), 100);
            assert!(matches!(verdict, DataVerdict::Forward { .. }));
        }
        assert_eq!(service.stats().bytes_relayed, 900);

        assert_eq!(
            service.admit_data(&id, requester(), 101),
            DataVerdict::CapExceeded
        );
        assert_eq!(service.admit_data(&id, requester(), 1), DataVerdict::Unknown);
        assert_eq!(service.stats().active_circuits, 0);
    }

    #[test]
    fn reverse_direction_targets_requester() {
        let service = service(RelayConfig::default());
        let id = CircuitId::random();
        service
            .handle_circuit_request(requester_id(), requester(), id, NodeId::from_string("target"))
            .unwrap();

        let from_target: SocketAddr = "10.9.9.9:7000".parse().unwrap();
        match service.admit_data(&id, from_target, 10) {
            DataVerdict::Forward { node, endpoint } => {
                assert_eq!(node, requester_id());
                assert_eq!(endpoint, Some(requester()));
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[test]
    fn idle_circuits_cleaned() {
        let service = service(RelayConfig {
            circuit_idle_timeout: std::time::Duration::from_millis(10),
            ..RelayConfig::default()
        });
        service
            .handle_circuit_request(
                requester_id(),
                requester(),
                CircuitId::random(),
                NodeId::from_string("t"),
            )
            .unwrap();
        assert_eq!(service.stats().active_circuits, 1);

        std::thread::sleep(std::time::Duration::from_millis(30));
        service.cleanup_expired();
        assert_eq!(service.stats().active_circuits, 0);
    }
}
