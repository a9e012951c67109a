// Chat service — the facade and compose root
//
// Builds every subsystem around one shared routing table, wires the
// subscriptions between them, and exposes the small surface the front-ends
// use: start, send_message, message_status, stop.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::message::ChatMessage;
use super::pending::{PendingMessage, PendingTable};
use crate::config::CoreConfig;
use crate::dht::{
    DhtError, DhtNode, DhtStats, KademliaNode, NodeId, RoutingTable, Storage, UserKeyRecord,
};
use crate::identity::Identity;
use crate::net::{ConnectionManager, ConnectionStats, NetError};
use crate::onion::{OnionBuilder, OnionError, OnionRouter, ReplyPath, RouterEvents};
use crate::relay::{RelayService, RelayStats};
use crate::wire::{KademliaMessage, MessageBody, MessageId, WireError};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("user not found: {0}")]
    UserNotFound(String),
    #[error("no peers available to build a path")]
    NoPeers,
    #[error("service is not running")]
    NotRunning,
    #[error("recipient key record is invalid")]
    InvalidRecipientKey,
    #[error("dht error: {0}")]
    Dht(#[from] DhtError),
    #[error("onion error: {0}")]
    Onion(#[from] OnionError),
    #[error("network error: {0}")]
    Net(#[from] NetError),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

/// Application callbacks for inbound traffic.
pub trait ChatEvents: Send + Sync {
    fn on_message(&self, message: ChatMessage);
    fn on_ack(&self, message_id: MessageId);
}

/// Combined statistics for status output.
#[derive(Debug, Clone)]
pub struct ChatStats {
    pub dht: DhtStats,
    pub relay: RelayStats,
    pub connections: ConnectionStats,
    pub pending_messages: usize,
}

type EventsSlot = Arc<RwLock<Option<Arc<dyn ChatEvents>>>>;

/// Owned subscription the router reports into; deduplicates deliveries
/// that reached us over more than one route.
struct RouterSubscriber {
    pending: Arc<PendingTable>,
    events: EventsSlot,
    seen: Mutex<HashSet<MessageId>>,
}

impl RouterEvents for RouterSubscriber {
    fn on_message_received(&self, message: ChatMessage, _reply_path: ReplyPath) {
        if !self.seen.lock().insert(message.id) {
            debug!(id = %message.id, "duplicate delivery suppressed");
            return;
        }
        if let Some(events) = self.events.read().clone() {
            events.on_message(message);
        }
    }

    fn on_ack_received(&self, message_id: MessageId) {
        if self.pending.mark_acknowledged(&message_id) {
            if let Some(events) = self.events.read().clone() {
                events.on_ack(message_id);
            }
        } else {
            debug!(id = %message_id, "acknowledgement for unknown message");
        }
    }
}

pub struct ChatService {
    identity: Arc<Identity>,
    config: CoreConfig,
    username: RwLock<Option<String>>,
    dht: Arc<DhtNode>,
    relay: Arc<RelayService>,
    router: Arc<OnionRouter>,
    connections: Arc<ConnectionManager>,
    builder: OnionBuilder,
    pending: Arc<PendingTable>,
    resolve_cache: RwLock<HashMap<String, UserKeyRecord>>,
    events: EventsSlot,
    advertised: RwLock<Option<SocketAddr>>,
}

impl ChatService {
    /// Compose root: every component is constructed here, in dependency
    /// order, and they all share the single routing table instance.
    pub fn new(identity: Arc<Identity>, config: CoreConfig) -> Arc<Self> {
        let routing = Arc::new(RoutingTable::new(identity.node_id(), config.dht.k));
        let storage = Arc::new(Storage::new(config.storage.clone()));
        let connections = ConnectionManager::new(
            config.connection.clone(),
            identity.node_id(),
            identity.encryption_public_key().to_vec(),
            Arc::clone(&routing),
        );
        let dht = DhtNode::new(
            Arc::clone(&identity),
            config.dht.clone(),
            Arc::clone(&routing),
            storage,
            Arc::clone(&connections),
        );
        let relay = RelayService::new(
            config.relay.clone(),
            Arc::clone(&routing),
            Arc::clone(&connections),
        );
        let router = Arc::new(OnionRouter::new(
            Arc::clone(&identity),
            config.onion.clone(),
            Arc::clone(&routing),
            Arc::clone(&connections),
        ));

        let pending = Arc::new(PendingTable::new());
        let events: EventsSlot = Arc::new(RwLock::new(None));
        let subscriber = Arc::new(RouterSubscriber {
            pending: Arc::clone(&pending),
            events: Arc::clone(&events),
            seen: Mutex::new(HashSet::new()),
        });

        dht.set_onion_sink(Arc::clone(&router) as _);
        dht.set_relay_sink(Arc::clone(&relay) as _);
        router.set_offline_store(Arc::clone(&dht) as _);
        router.set_events(subscriber);

        let builder = OnionBuilder::new(config.onion.block_size);

        Arc::new(Self {
            identity,
            config,
            username: RwLock::new(None),
            dht,
            relay,
            router,
            connections,
            builder,
            pending,
            resolve_cache: RwLock::new(HashMap::new()),
            events,
            advertised: RwLock::new(None),
        })
    }

    pub fn set_events(&self, events: Arc<dyn ChatEvents>) {
        *self.events.write() = Some(events);
    }

    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    pub fn username(&self) -> Option<String> {
        self.username.read().clone()
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.dht.listen_addr()
    }

    /// Bring the node up: DHT server, relay service, key publication, and
    /// a drain of any mailboxed messages.
    pub async fn start(
        &self,
        port: u16,
        username: &str,
        bootstrap_seeds: &[SocketAddr],
    ) -> Result<SocketAddr, ChatError> {
        let listen = self.dht.start(port).await?;

        let advertised_ip = self
            .config
            .advertised_ip
            .unwrap_or_else(|| IpAddr::from([127, 0, 0, 1]));
        *self.advertised.write() = Some(SocketAddr::new(advertised_ip, listen.port()));
        *self.username.write() = Some(username.to_string());

        self.relay.start();

        if !bootstrap_seeds.is_empty() {
            self.dht.bootstrap(bootstrap_seeds).await?;
        }

        match self.dht.publish_public_key(username).await {
            Ok(stored) => info!(%username, replicas = stored, "published key record"),
            Err(err) => warn!(%username, %err, "key publication failed, will retry on republish"),
        }

        self.sync_mailbox().await;

        Ok(listen)
    }

    /// Drain messages mailboxed while this node was unreachable and feed
    /// them through the router as if they had just arrived.
    pub async fn sync_mailbox(&self) {
        let mailbox = self.dht.get_offline_messages().await;
        if !mailbox.is_empty() {
            info!(count = mailbox.len(), "draining offline mailbox");
        }
        for payload in mailbox {
            self.router.ingest(payload).await;
        }
    }

    /// Resolve, wrap, and push one message. The returned id tracks the
    /// pending entry through Sent and Acknowledged.
    pub async fn send_message(
        &self,
        recipient_username: &str,
        content: &str,
    ) -> Result<MessageId, ChatError> {
        let username = self.username.read().clone().ok_or(ChatError::NotRunning)?;
        let advertised = (*self.advertised.read()).ok_or(ChatError::NotRunning)?;

        let record = self.resolve_user(recipient_username).await?;
        let recipient_key: [u8; 32] = record
            .encryption_public_key
            .as_slice()
            .try_into()
            .map_err(|_| ChatError::InvalidRecipientKey)?;
        let recipient_node_id = NodeId::from_public_key(&recipient_key);

        let want = self.config.onion.path_length;
        let path: Vec<KademliaNode> = self
            .dht
            .random_nodes_for_path(want + 2)
            .into_iter()
            .filter(|n| n.id != recipient_node_id && n.id != self.identity.node_id())
            .take(want)
            .collect();
        if path.is_empty() {
            return Err(ChatError::NoPeers);
        }
        if path.len() < want {
            warn!(
                have = path.len(),
                want, "onion path shorter than configured, proceeding"
            );
        }

        let message = ChatMessage::signed(&self.identity, &username, content)?;
        let message_id = message.id;
        self.pending.insert(
            message_id,
            recipient_username.to_string(),
            content.to_string(),
        );

        let built = match self.builder.build_message(
            &message.serialize()?,
            &recipient_key,
            &path,
            &self.identity.encryption_public_key(),
            advertised,
        ) {
            Ok(built) => built,
            Err(err) => {
                self.pending.mark_failed(&message_id);
                return Err(err.into());
            }
        };

        let wrapper = KademliaMessage::new(
            self.identity.node_id(),
            self.identity.encryption_public_key().to_vec(),
            MessageBody::OnionMessage {
                payload: built.payload,
            },
        );
        let frame = wrapper.serialize()?;

        match self.connections.send_to_node(&built.first_hop, &frame).await {
            Ok(()) => {
                self.pending.mark_sent(&message_id);
                debug!(id = %message_id, to = %recipient_username, hops = built.hop_count, "message sent");
                Ok(message_id)
            }
            Err(err) => {
                self.pending.mark_failed(&message_id);
                Err(err.into())
            }
        }
    }

    async fn resolve_user(&self, username: &str) -> Result<UserKeyRecord, ChatError> {
        if let Some(record) = self.resolve_cache.read().get(username).cloned() {
            return Ok(record);
        }
        let record = self.dht.lookup_public_key(username).await.map_err(|err| {
            match err {
                DhtError::UserNotFound => ChatError::UserNotFound(username.to_string()),
                other => ChatError::Dht(other),
            }
        })?;
        self.resolve_cache
            .write()
            .insert(username.to_string(), record.clone());
        Ok(record)
    }

    pub fn message_status(&self, id: &MessageId) -> Option<PendingMessage> {
        self.pending.get(id)
    }

    pub fn pending_messages(&self) -> Vec<(MessageId, PendingMessage)> {
        self.pending.all()
    }

    pub fn stats(&self) -> ChatStats {
        ChatStats {
            dht: self.dht.stats(),
            relay: self.relay.stats(),
            connections: self.connections.stats(),
            pending_messages: self.pending.len(),
        }
    }

    /// Shut everything down, top-down. Safe to call repeatedly.
    pub fn stop(&self) {
        self.router.detach();
        self.relay.stop();
        self.dht.stop();
        *self.username.write() = None;
        *self.advertised.write() = None;
    }
}

impl Drop for ChatService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Arc<ChatService> {
        let (identity, _) = Identity::generate();
        ChatService::new(Arc::new(identity), CoreConfig::default())
    }

    #[tokio::test]
    async fn send_before_start_fails() {
        let service = service();
        let result = service.send_message("bob", "hello").await;
        assert!(matches!(result, Err(ChatError::NotRunning)));
    }

    #[tokio::test]
    async fn start_and_stop_lifecycle() {
        let service = service();
        let addr = service.start(0, "alice", &[]).await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(service.username().as_deref(), Some("alice"));

        service.stop();
        service.stop();
        assert!(service.listen_addr().is_none());
        assert!(service.username().is_none());
    }

    #[tokio::test]
    async fn unknown_recipient_is_a_typed_failure() {
        let service = service();
        service.start(0, "alice", &[]).await.unwrap();

        let result = service.send_message("nobody", "hello").await;
        assert!(matches!(result, Err(ChatError::UserNotFound(name)) if name == "nobody"));

        service.stop();
    }

    #[tokio::test]
    async fn stats_reflect_composition() {
        let service = service();
        service.start(0, "alice", &[]).await.unwrap();

        let stats = service.stats();
        assert_eq!(stats.relay.active_circuits, 0);
        assert_eq!(stats.pending_messages, 0);
        assert!(stats.dht.listen_addr.is_some());

        service.stop();
    }
}
