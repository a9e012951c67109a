// DHT node — Kademlia RPC server and client
//
// One reader task per connection; frames are processed one at a time per
// connection. Outbound requests are tracked by message id in a pending map
// and completed by the matching response id, whichever connection the
// response arrives on; unmatched responses are dropped. No background task
// may crash the process.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::kbucket::unix_now;
use super::{AddOutcome, KademliaNode, NodeId, RoutingTable, Storage, StorageStats, UserKeyRecord};
use crate::config::DhtConfig;
use crate::identity::Identity;
use crate::net::{
    one_shot_request, CircuitDialer, ConnectionManager, FrameHandler, NetError, PeerConn,
    RateLimiter,
};
use crate::wire::{
    CircuitId, KademliaMessage, MessageBody, MessageId, NodeRecord, WireError,
};

/// Default time-to-live sent with published and republished values.
const PUBLISH_TTL_SECONDS: u32 = 24 * 3600;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("node is already running")]
    AlreadyRunning,
    #[error("user not found")]
    UserNotFound,
    #[error("no peers available")]
    NoPeers,
    #[error("request timed out")]
    Timeout,
    #[error("peer sent an unexpected response")]
    UnexpectedResponse,
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("network error: {0}")]
    Net(#[from] NetError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receives onion payloads unwrapped from OnionMessage RPCs.
#[async_trait]
pub trait OnionSink: Send + Sync {
    async fn handle_onion(&self, source: SocketAddr, sender_public_key: Vec<u8>, payload: Vec<u8>);
}

/// Receives relay and circuit RPCs; the reply, if any, is written back on
/// the same connection.
#[async_trait]
pub trait RelaySink: Send + Sync {
    async fn handle_relay(
        &self,
        source: SocketAddr,
        message: KademliaMessage,
    ) -> Option<MessageBody>;
}

/// DHT statistics for status reporting.
#[derive(Debug, Clone)]
pub struct DhtStats {
    pub listen_addr: Option<SocketAddr>,
    pub routing_nodes: usize,
    pub storage: StorageStats,
}

struct LookupOutcome {
    closest: Vec<KademliaNode>,
    value: Option<Vec<u8>>,
}

#[derive(Clone, Copy)]
enum LookupKind {
    Node,
    Value,
}

pub struct DhtNode {
    identity: Arc<Identity>,
    config: DhtConfig,
    routing: Arc<RoutingTable>,
    storage: Arc<Storage>,
    connections: Arc<ConnectionManager>,
    rate_limiter: RateLimiter,
    pending: Mutex<HashMap<MessageId, oneshot::Sender<KademliaMessage>>>,
    onion_sink: RwLock<Option<Arc<dyn OnionSink>>>,
    relay_sink: RwLock<Option<Arc<dyn RelaySink>>>,
    listen_addr: RwLock<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    self_ref: Weak<DhtNode>,
}

impl DhtNode {
    pub fn new(
        identity: Arc<Identity>,
        config: DhtConfig,
        routing: Arc<RoutingTable>,
        storage: Arc<Storage>,
        connections: Arc<ConnectionManager>,
    ) -> Arc<Self> {
        let rate_limiter = RateLimiter::new(config.rpc_rate);
        let (shutdown, _) = watch::channel(false);
        Arc::new_cyclic(|self_ref| Self {
            identity,
            config,
            routing,
            storage,
            connections,
            rate_limiter,
            pending: Mutex::new(HashMap::new()),
            onion_sink: RwLock::new(None),
            relay_sink: RwLock::new(None),
            listen_addr: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
            shutdown,
            self_ref: self_ref.clone(),
        })
    }

    fn strong_self(&self) -> Arc<Self> {
        self.self_ref
            .upgrade()
            .expect("method called on a live DhtNode")
    }

    pub fn local_id(&self) -> NodeId {
        self.routing.local_id()
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.read()
    }

    pub fn set_onion_sink(&self, sink: Arc<dyn OnionSink>) {
        *self.onion_sink.write() = Some(sink);
    }

    pub fn set_relay_sink(&self, sink: Arc<dyn RelaySink>) {
        *self.relay_sink.write() = Some(sink);
    }

    pub fn stats(&self) -> DhtStats {
        DhtStats {
            listen_addr: self.listen_addr(),
            routing_nodes: self.routing.node_count(),
            storage: self.storage.stats(),
        }
    }

    /// Bind the listener, attach this node as the connection dispatcher,
    /// and spawn the accept, maintenance and republish loops. Port 0 binds
    /// an ephemeral port; the bound address is returned.
    pub async fn start(&self, port: u16) -> Result<SocketAddr, DhtError> {
        if self.listen_addr().is_some() {
            return Err(DhtError::AlreadyRunning);
        }

        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        *self.listen_addr.write() = Some(local_addr);
        let _ = self.shutdown.send(false);

        self.connections
            .set_frame_handler(self.strong_self() as Arc<dyn FrameHandler>);
        self.connections
            .set_circuit_dialer(self.strong_self() as Arc<dyn CircuitDialer>);

        let announce = KademliaMessage::new(
            self.local_id(),
            self.identity.encryption_public_key().to_vec(),
            MessageBody::NodeAnnounce {
                listen_port: local_addr.port(),
            },
        );
        self.connections.set_announce_frame(announce.serialize()?);

        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_accept_loop(listener));
        tasks.push(self.spawn_maintenance());
        tasks.push(self.spawn_republish());
        drop(tasks);

        info!(%local_addr, id = %self.local_id(), "dht node listening");
        Ok(local_addr)
    }

    /// Stop serving. Safe to call repeatedly. Handler references are
    /// dropped so composed components do not keep each other alive.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if self.listen_addr.write().take().is_some() {
            info!(id = %self.local_id(), "dht node stopped");
        }
        self.pending.lock().clear();
        *self.onion_sink.write() = None;
        *self.relay_sink.write() = None;
        self.connections.detach();
    }

    fn spawn_accept_loop(&self, listener: TcpListener) -> JoinHandle<()> {
        let node = self.strong_self();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _peer)) => {
                            node.connections
                                .adopt(stream, Some(node.config.read_timeout));
                        }
                        Err(err) => {
                            warn!(%err, "accept failed");
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        })
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let node = self.strong_self();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                node.storage.maybe_cleanup();
                node.rate_limiter.cleanup();
                node.connections.evict_idle();
            }
        })
    }

    fn spawn_republish(&self) -> JoinHandle<()> {
        let node = self.strong_self();
        let interval = self.config.republish_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // skip the immediate tick
            loop {
                ticker.tick().await;
                node.republish_values().await;
            }
        })
    }

    /// Re-store every live local value on the currently known closest nodes.
    async fn republish_values(&self) {
        for (key, value) in self.storage.get_all_for_republish() {
            let targets = self.routing.find_closest(&key, self.config.k);
            for target in targets {
                let body = MessageBody::Store {
                    key,
                    value: value.clone(),
                    ttl_seconds: PUBLISH_TTL_SECONDS,
                };
                if let Err(err) = self.send_rpc(&target, body).await {
                    debug!(key = %key, peer = %target.id, %err, "republish store failed");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    /// Remember a node, checking the liveness of a full bucket's oldest
    /// entry before letting the newcomer take its place.
    fn observe_node(&self, node: KademliaNode) {
        match self.routing.try_add(node.clone()) {
            AddOutcome::Added | AddOutcome::Updated => {}
            AddOutcome::BucketFull => {
                let Some(oldest) = self.routing.oldest_in_bucket_of(&node.id) else {
                    return;
                };
                let routing = Arc::clone(&self.routing);
                let local = (
                    self.local_id(),
                    self.identity.encryption_public_key().to_vec(),
                );
                let request_timeout = self.config.request_timeout;
                tokio::spawn(async move {
                    if ping_for_liveness(&oldest, local, request_timeout).await {
                        routing.mark_seen(&oldest.id);
                    } else {
                        debug!(evicted = %oldest.id, replacement = %node.id, "bucket eviction");
                        routing.replace_oldest_in_bucket(node);
                    }
                });
            }
        }
    }

    async fn dispatch(&self, message: KademliaMessage, peer: SocketAddr) -> Option<MessageBody> {
        let reply_to = message.message_id;
        match message.body {
            MessageBody::Ping => Some(MessageBody::Pong {
                in_response_to: reply_to,
            }),
            MessageBody::FindNode { target } => Some(MessageBody::FindNodeResponse {
                in_response_to: reply_to,
                nodes: self.closest_records(&target),
            }),
            MessageBody::FindValue { key } => match self.storage.get(&key) {
                Some(value) => Some(MessageBody::FindValueResponse {
                    in_response_to: reply_to,
                    value: Some(value),
                    nodes: Vec::new(),
                }),
                None => Some(MessageBody::FindValueResponse {
                    in_response_to: reply_to,
                    value: None,
                    nodes: self.closest_records(&key),
                }),
            },
            MessageBody::Store {
                key,
                value,
                ttl_seconds,
            } => {
                // Values that parse as signed user key records must carry a
                // valid signature; anything else is stored opaquely.
                if let Ok(record) = UserKeyRecord::deserialize(&value) {
                    if record.signature.is_some() && !record.verify_signature() {
                        warn!(key = %key, "rejected key record with bad signature");
                        return Some(MessageBody::StoreResponse {
                            in_response_to: reply_to,
                            success: false,
                            error: "signature verification failed".to_string(),
                        });
                    }
                }
                let ttl = (ttl_seconds > 0)
                    .then(|| std::time::Duration::from_secs(u64::from(ttl_seconds)));
                self.storage.store(key, value, ttl);
                Some(MessageBody::StoreResponse {
                    in_response_to: reply_to,
                    success: true,
                    error: String::new(),
                })
            }
            MessageBody::StoreOfflineMessage {
                recipient_public_key,
                ciphertext,
            } => {
                let key = NodeId::from_public_key(&recipient_public_key);
                self.storage.store_offline_message(key, ciphertext, None);
                Some(MessageBody::StoreResponse {
                    in_response_to: reply_to,
                    success: true,
                    error: String::new(),
                })
            }
            MessageBody::GetOfflineMessages {
                recipient_public_key,
            } => {
                let key = NodeId::from_public_key(&recipient_public_key);
                Some(MessageBody::OfflineMessagesResponse {
                    in_response_to: reply_to,
                    messages: self.storage.get_offline_messages(&key),
                })
            }
            MessageBody::NodeAnnounce { listen_port } => {
                // Correct the sender's routing entry to its dialable
                // endpoint.
                if message.sender_id != self.local_id()
                    && !message.sender_public_key.is_empty()
                    && listen_port != 0
                {
                    self.observe_node(KademliaNode::new(
                        message.sender_id,
                        message.sender_public_key,
                        SocketAddr::new(peer.ip(), listen_port),
                    ));
                }
                None
            }
            MessageBody::OnionMessage { payload } => {
                let sink = self.onion_sink.read().clone();
                match sink {
                    Some(sink) => {
                        sink.handle_onion(peer, message.sender_public_key, payload)
                            .await
                    }
                    None => debug!("onion payload received but no router is attached"),
                }
                None
            }
            MessageBody::RelayRequest { .. }
            | MessageBody::CircuitRequest { .. }
            | MessageBody::RelayData { .. }
            | MessageBody::CircuitClose { .. } => {
                let sink = self.relay_sink.read().clone();
                match sink {
                    Some(sink) => sink.handle_relay(peer, message).await,
                    None => {
                        debug!("relay message received but relaying is not enabled");
                        None
                    }
                }
            }
            // Responses: route through the pending map; unmatched ones are
            // dropped there.
            MessageBody::Pong { .. }
            | MessageBody::FindNodeResponse { .. }
            | MessageBody::FindValueResponse { .. }
            | MessageBody::StoreResponse { .. }
            | MessageBody::OfflineMessagesResponse { .. }
            | MessageBody::RelayResponse { .. }
            | MessageBody::CircuitResponse { .. } => {
                self.complete_pending(message);
                None
            }
        }
    }

    fn closest_records(&self, target: &NodeId) -> Vec<NodeRecord> {
        self.routing
            .find_closest(target, self.config.k)
            .iter()
            .map(node_to_record)
            .collect()
    }

    fn complete_pending(&self, message: KademliaMessage) {
        let Some(request_id) = message.body.in_response_to() else {
            debug!("response without correlation id dropped");
            return;
        };
        let sender = self.pending.lock().remove(&request_id);
        match sender {
            Some(sender) => {
                let _ = sender.send(message);
            }
            None => debug!(request = %request_id, "unmatched response dropped"),
        }
    }

    // ------------------------------------------------------------------
    // Client side
    // ------------------------------------------------------------------

    /// Send one RPC and await the response carrying its id.
    pub async fn send_rpc(
        &self,
        node: &KademliaNode,
        body: MessageBody,
    ) -> Result<KademliaMessage, DhtError> {
        let message = KademliaMessage::new(
            self.local_id(),
            self.identity.encryption_public_key().to_vec(),
            body,
        );
        let request_id = message.message_id;
        let frame = message.serialize()?;

        let (sender, receiver) = oneshot::channel();
        self.pending.lock().insert(request_id, sender);

        if let Err(err) = self.connections.send_to_node(node, &frame).await {
            self.pending.lock().remove(&request_id);
            return Err(err.into());
        }

        match timeout(self.config.request_timeout, receiver).await {
            Ok(Ok(reply)) => Ok(reply),
            _ => {
                self.pending.lock().remove(&request_id);
                Err(DhtError::Timeout)
            }
        }
    }

    /// Ping a bare address, learning the node behind it.
    pub async fn ping_address(&self, address: SocketAddr) -> Result<KademliaNode, DhtError> {
        let probe = KademliaNode::new(NodeId::random(), Vec::new(), address);
        let reply = self.send_rpc(&probe, MessageBody::Ping).await?;
        match reply.body {
            MessageBody::Pong { .. } => {
                let node = KademliaNode::new(reply.sender_id, reply.sender_public_key, address);
                self.observe_node(node.clone());
                Ok(node)
            }
            _ => Err(DhtError::UnexpectedResponse),
        }
    }

    /// Learn initial peers from the seed set, then populate buckets with an
    /// iterative lookup of the local id.
    pub async fn bootstrap(&self, seeds: &[SocketAddr]) -> Result<(), DhtError> {
        let mut reached = 0usize;
        for seed in seeds {
            match self.ping_address(*seed).await {
                Ok(node) => {
                    reached += 1;
                    debug!(seed = %seed, id = %node.id, "bootstrap seed answered");
                }
                Err(err) => warn!(seed = %seed, %err, "bootstrap seed unreachable"),
            }
        }
        if reached == 0 && !seeds.is_empty() {
            return Err(DhtError::NoPeers);
        }

        let local_id = self.local_id();
        self.iterative_lookup(local_id, LookupKind::Node).await;
        info!(peers = self.routing.node_count(), "bootstrap complete");
        Ok(())
    }

    /// Store a value locally and on the k closest nodes found iteratively.
    /// Returns how many remote stores succeeded.
    pub async fn store_value(
        &self,
        key: NodeId,
        value: Vec<u8>,
        ttl_seconds: u32,
    ) -> Result<usize, DhtError> {
        let ttl =
            (ttl_seconds > 0).then(|| std::time::Duration::from_secs(u64::from(ttl_seconds)));
        self.storage.store(key, value.clone(), ttl);

        let outcome = self.iterative_lookup(key, LookupKind::Node).await;
        let mut stored = 0usize;
        let mut stores: FuturesUnordered<_> = outcome
            .closest
            .iter()
            .map(|node| {
                let body = MessageBody::Store {
                    key,
                    value: value.clone(),
                    ttl_seconds,
                };
                async move { self.send_rpc(node, body).await }
            })
            .collect();
        while let Some(result) = stores.next().await {
            if let Ok(reply) = result {
                if matches!(reply.body, MessageBody::StoreResponse { success: true, .. }) {
                    stored += 1;
                }
            }
        }
        Ok(stored)
    }

    /// Iterative FIND_VALUE. A found value is cached locally for an hour.
    pub async fn find_value(&self, key: NodeId) -> Option<Vec<u8>> {
        if let Some(value) = self.storage.get(&key) {
            return Some(value);
        }

        let outcome = self.iterative_lookup(key, LookupKind::Value).await;
        if let Some(value) = &outcome.value {
            self.storage
                .store(key, value.clone(), Some(self.config.found_value_cache_ttl));
        }
        outcome.value
    }

    /// Publish the local identity's signed key record under hash(username).
    pub async fn publish_public_key(&self, username: &str) -> Result<usize, DhtError> {
        let record = UserKeyRecord::signed(&self.identity, unix_now() as i64);
        let value = record.serialize()?;
        let key = NodeId::from_string(username);
        self.store_value(key, value, PUBLISH_TTL_SECONDS).await
    }

    /// Resolve a username to a verified key record.
    pub async fn lookup_public_key(&self, username: &str) -> Result<UserKeyRecord, DhtError> {
        let key = NodeId::from_string(username);
        let value = self.find_value(key).await.ok_or(DhtError::UserNotFound)?;

        let record = UserKeyRecord::deserialize(&value).map_err(|err| {
            warn!(%username, %err, "stored key record is malformed");
            DhtError::UserNotFound
        })?;
        if record.signature.is_some() && !record.verify_signature() {
            warn!(%username, "stored key record failed signature verification");
            return Err(DhtError::UserNotFound);
        }
        Ok(record)
    }

    /// Replicate an offline message onto the k nodes closest to the
    /// recipient's key hash. Falls back to the local mailbox when nobody
    /// else accepts it.
    pub async fn store_offline_message(
        &self,
        recipient_public_key: &[u8],
        ciphertext: Vec<u8>,
    ) -> Result<usize, DhtError> {
        let key = NodeId::from_public_key(recipient_public_key);
        let outcome = self.iterative_lookup(key, LookupKind::Node).await;

        if outcome.closest.is_empty() {
            self.storage.store_offline_message(key, ciphertext, None);
            return Ok(0);
        }

        let mut stored = 0usize;
        let mut stores: FuturesUnordered<_> = outcome
            .closest
            .iter()
            .map(|node| {
                let body = MessageBody::StoreOfflineMessage {
                    recipient_public_key: recipient_public_key.to_vec(),
                    ciphertext: ciphertext.clone(),
                };
                async move { self.send_rpc(node, body).await }
            })
            .collect();
        while let Some(result) = stores.next().await {
            if let Ok(reply) = result {
                if matches!(reply.body, MessageBody::StoreResponse { success: true, .. }) {
                    stored += 1;
                }
            }
        }

        if stored == 0 {
            self.storage.store_offline_message(key, ciphertext, None);
        }
        Ok(stored)
    }

    /// Drain the local mailbox plus the mailboxes of the nodes nearest to
    /// our own key hash. Order within each mailbox is preserved.
    pub async fn get_offline_messages(&self) -> Vec<Vec<u8>> {
        let own_key = self.identity.encryption_public_key().to_vec();
        let key = NodeId::from_public_key(&own_key);

        let mut messages = self.storage.get_offline_messages(&key);

        let outcome = self.iterative_lookup(key, LookupKind::Node).await;
        for node in &outcome.closest {
            let body = MessageBody::GetOfflineMessages {
                recipient_public_key: own_key.clone(),
            };
            match self.send_rpc(node, body).await {
                Ok(reply) => {
                    if let MessageBody::OfflineMessagesResponse { messages: batch, .. } =
                        reply.body
                    {
                        messages.extend(batch);
                    }
                }
                Err(err) => debug!(peer = %node.id, %err, "offline fetch failed"),
            }
        }
        messages
    }

    /// Uniform sample of known nodes for onion path construction.
    pub fn random_nodes_for_path(&self, n: usize) -> Vec<KademliaNode> {
        self.routing.get_random_nodes(n)
    }

    // ------------------------------------------------------------------
    // Iterative lookup
    // ------------------------------------------------------------------

    async fn iterative_lookup(&self, target: NodeId, kind: LookupKind) -> LookupOutcome {
        let k = self.config.k;
        let alpha = self.config.alpha;

        let mut shortlist = self.routing.find_closest(&target, k);
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut best = shortlist.first().map(|n| n.id.distance_to(&target));

        loop {
            let batch: Vec<KademliaNode> = shortlist
                .iter()
                .filter(|n| !queried.contains(&n.id))
                .take(alpha)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }

            let mut in_flight: FuturesUnordered<_> = batch
                .into_iter()
                .map(|node| {
                    queried.insert(node.id);
                    let body = match kind {
                        LookupKind::Node => MessageBody::FindNode { target },
                        LookupKind::Value => MessageBody::FindValue { key: target },
                    };
                    async move {
                        let result = self.send_rpc(&node, body).await;
                        (node, result)
                    }
                })
                .collect();

            while let Some((node, result)) = in_flight.next().await {
                match result {
                    Ok(reply) => match reply.body {
                        MessageBody::FindValueResponse {
                            value: Some(value), ..
                        } => {
                            return LookupOutcome {
                                closest: shortlist,
                                value: Some(value),
                            };
                        }
                        MessageBody::FindNodeResponse { nodes, .. }
                        | MessageBody::FindValueResponse { nodes, .. } => {
                            for record in nodes {
                                self.admit_candidate(&mut shortlist, record);
                            }
                        }
                        _ => debug!(peer = %node.id, "unexpected lookup reply"),
                    },
                    Err(err) => {
                        debug!(peer = %node.id, %err, "lookup query failed");
                    }
                }
            }

            // Clamp to the k nearest and test for progress.
            shortlist.sort_by_key(|n| (n.id.distance_to(&target), n.id));
            shortlist.truncate(k);

            let round_best = shortlist.first().map(|n| n.id.distance_to(&target));
            let improved = match (round_best, best) {
                (Some(new), Some(old)) => new < old,
                (Some(_), None) => true,
                _ => false,
            };
            if improved {
                best = round_best;
            } else {
                break;
            }
        }

        LookupOutcome {
            closest: shortlist,
            value: None,
        }
    }

    fn admit_candidate(&self, shortlist: &mut Vec<KademliaNode>, record: NodeRecord) {
        if record.id == self.local_id() {
            return;
        }
        if shortlist.iter().any(|n| n.id == record.id) {
            return;
        }
        let node = record_to_node(record);
        self.observe_node(node.clone());
        shortlist.push(node);
    }
}

#[async_trait]
impl FrameHandler for DhtNode {
    async fn handle_frame(&self, conn: &Arc<PeerConn>, frame: Vec<u8>) -> bool {
        let peer = conn.peer();
        if !self.rate_limiter.is_allowed(peer.ip()) {
            debug!(%peer, "rate limited, closing connection");
            return false;
        }

        let message = match KademliaMessage::deserialize(&frame) {
            Ok(message) => message,
            Err(err) => {
                debug!(%peer, %err, "malformed message, closing connection");
                return false;
            }
        };

        // Identify the peer: remember its live connection, refresh its
        // routing entry, or record it under the observed remote endpoint.
        if message.sender_id != self.local_id() && !message.sender_public_key.is_empty() {
            self.connections
                .register_direct(message.sender_id, Arc::clone(conn));
            if !self.routing.mark_seen(&message.sender_id) {
                self.observe_node(KademliaNode::new(
                    message.sender_id,
                    message.sender_public_key.clone(),
                    peer,
                ));
            }
        }

        if let Some(body) = self.dispatch(message, peer).await {
            let reply = KademliaMessage::new(
                self.local_id(),
                self.identity.encryption_public_key().to_vec(),
                body,
            );
            match reply.serialize() {
                Ok(bytes) => {
                    if let Err(err) = conn.send_frame(&bytes).await {
                        debug!(%peer, %err, "failed to write reply");
                        return false;
                    }
                }
                Err(err) => warn!(%err, "failed to encode reply"),
            }
        }
        true
    }
}

#[async_trait]
impl CircuitDialer for DhtNode {
    async fn establish_circuit(
        &self,
        relay: &KademliaNode,
        target: NodeId,
    ) -> Result<CircuitId, NetError> {
        let circuit_id = CircuitId::random();
        let reply = self
            .send_rpc(
                relay,
                MessageBody::CircuitRequest {
                    circuit_id,
                    target_id: target,
                },
            )
            .await
            .map_err(|_| NetError::NoRelayPath)?;

        match reply.body {
            MessageBody::CircuitResponse {
                accepted: true,
                circuit_id,
                ..
            } => Ok(circuit_id),
            MessageBody::CircuitResponse { error, .. } => Err(NetError::CircuitRefused(error)),
            _ => Err(NetError::UnexpectedResponse),
        }
    }
}

#[async_trait]
impl crate::onion::OfflineStore for DhtNode {
    async fn store_offline(&self, recipient_public_key: &[u8], ciphertext: Vec<u8>) {
        if let Err(err) = self
            .store_offline_message(recipient_public_key, ciphertext)
            .await
        {
            warn!(%err, "offline replication failed");
        }
    }
}

/// Liveness probe for bucket eviction decisions: one Ping over a dedicated
/// socket, so it cannot tie up the shared routes.
async fn ping_for_liveness(
    node: &KademliaNode,
    local: (NodeId, Vec<u8>),
    request_timeout: std::time::Duration,
) -> bool {
    let message = KademliaMessage::new(local.0, local.1, MessageBody::Ping);
    let Ok(frame) = message.serialize() else {
        return false;
    };
    match one_shot_request(node.address, &frame, request_timeout, request_timeout).await {
        Ok(reply_frame) => matches!(
            KademliaMessage::deserialize(&reply_frame).map(|m| m.body),
            Ok(MessageBody::Pong { .. })
        ),
        Err(_) => false,
    }
}

fn node_to_record(node: &KademliaNode) -> NodeRecord {
    NodeRecord {
        id: node.id,
        public_key: node.public_key.clone(),
        address: node.address.ip(),
        port: node.address.port(),
    }
}

fn record_to_node(record: NodeRecord) -> KademliaNode {
    KademliaNode::new(
        record.id,
        record.public_key,
        SocketAddr::new(record.address, record.port),
    )
}
