// Inbound onion dispatch
//
// Every payload is either a sealed layer for this node or a bare Ack
// element whose reply token is sealed for this node; the first byte keeps
// the two apart (sealed layers always begin with the ephemeral-key length
// 0x20, bare elements with a content tag 0x01..0x04).
//
// Trade-off preserved from the protocol: the final hop sees the recipient
// public key in clear so it can locate or mailbox the delivery.

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::builder::{build_ack, LayerKind, OnionLayerContent, RecipientPayload};
use super::layer::OnionLayer;
use super::padding::unpad;
use super::reply::{PreviousHop, ReplyPath, ReplyToken};
use super::OnionError;
use crate::chat::ChatMessage;
use crate::config::OnionConfig;
use crate::dht::{NodeId, OnionSink, RoutingTable};
use crate::identity::Identity;
use crate::net::{push_frame, ConnectionManager, RateLimiter};
use crate::wire::{KademliaMessage, MessageBody, MessageId};

const FORWARD_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const SEALED_FIRST_BYTE: u8 = 0x20;
const BARE_TAG_MIN: u8 = 0x01;
const BARE_TAG_MAX: u8 = 0x04;

/// Consumer interface for decrypted traffic addressed to this node.
pub trait RouterEvents: Send + Sync {
    fn on_message_received(&self, message: ChatMessage, reply_path: ReplyPath);
    fn on_ack_received(&self, message_id: MessageId);
}

/// Mailbox backend used when a final hop cannot reach the recipient.
#[async_trait]
pub trait OfflineStore: Send + Sync {
    async fn store_offline(&self, recipient_public_key: &[u8], ciphertext: Vec<u8>);
}

pub struct OnionRouter {
    identity: Arc<Identity>,
    config: OnionConfig,
    routing: Arc<RoutingTable>,
    connections: Arc<ConnectionManager>,
    rate_limiter: RateLimiter,
    offline: RwLock<Option<Arc<dyn OfflineStore>>>,
    events: RwLock<Option<Arc<dyn RouterEvents>>>,
}

impl OnionRouter {
    pub fn new(
        identity: Arc<Identity>,
        config: OnionConfig,
        routing: Arc<RoutingTable>,
        connections: Arc<ConnectionManager>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(config.accept_rate);
        Self {
            identity,
            config,
            routing,
            connections,
            rate_limiter,
            offline: RwLock::new(None),
            events: RwLock::new(None),
        }
    }

    pub fn set_offline_store(&self, store: Arc<dyn OfflineStore>) {
        *self.offline.write() = Some(store);
    }

    pub fn set_events(&self, events: Arc<dyn RouterEvents>) {
        *self.events.write() = Some(events);
    }

    /// Drop handler references so shutdown breaks the wiring cycle.
    pub fn detach(&self) {
        *self.offline.write() = None;
        *self.events.write() = None;
    }

    /// Feed a payload that did not arrive over the network (drained
    /// mailboxes); skips the per-IP limiter.
    pub async fn ingest(&self, payload: Vec<u8>) {
        if let Err(err) = self.process(payload).await {
            debug!(%err, "local onion payload dropped");
        }
    }

    async fn process(&self, payload: Vec<u8>) -> Result<(), OnionError> {
        match payload.first() {
            Some(&SEALED_FIRST_BYTE) => {
                let layer = OnionLayer::decode(&payload)?;
                let plain = layer.open(self.identity.encryption_secret())?;
                let content = OnionLayerContent::decode(&plain)?;
                self.dispatch(content).await
            }
            Some(&tag) if (BARE_TAG_MIN..=BARE_TAG_MAX).contains(&tag) => {
                let content = OnionLayerContent::decode(&payload)?;
                match content.kind {
                    LayerKind::Ack => self.handle_ack(content).await,
                    _ => Err(OnionError::UnknownEnvelope),
                }
            }
            _ => Err(OnionError::UnknownEnvelope),
        }
    }

    async fn dispatch(&self, content: OnionLayerContent) -> Result<(), OnionError> {
        match content.kind.clone() {
            LayerKind::Relay {
                next_address,
                next_port,
            } => {
                let address: IpAddr = next_address
                    .parse()
                    .map_err(|_| OnionError::InvalidNextHop("unparseable address"))?;
                self.validate_next_hop(&address, next_port)?;

                self.decorrelation_delay().await;
                self.push_onion(SocketAddr::new(address, next_port), content.inner)
                    .await
            }
            LayerKind::FinalHop {
                recipient_public_key,
            } => self.handle_final_hop(recipient_public_key, content.inner).await,
            LayerKind::Delivery => self.handle_delivery(content.inner).await,
            LayerKind::Ack => self.handle_ack(content).await,
        }
    }

    /// Last relay on the forward path: locate the recipient or mailbox the
    /// ciphertext. Never drops silently.
    async fn handle_final_hop(
        &self,
        recipient_public_key: Vec<u8>,
        delivery_ciphertext: Vec<u8>,
    ) -> Result<(), OnionError> {
        if recipient_public_key == self.identity.encryption_public_key() {
            return self.handle_delivery(delivery_ciphertext).await;
        }

        let recipient_key: [u8; 32] = recipient_public_key
            .as_slice()
            .try_into()
            .map_err(|_| OnionError::InvalidPeerKey)?;
        let delivery = OnionLayerContent {
            kind: LayerKind::Delivery,
            reply_token: Vec::new(),
            inner: delivery_ciphertext,
        };
        let sealed = OnionLayer::seal_bytes(&recipient_key, &delivery.encode()?)?;

        let recipient_id = NodeId::from_public_key(&recipient_public_key);
        if let Some(node) = self.routing.get(&recipient_id) {
            let frame = self.onion_frame(sealed.clone())?;
            // Direct only: a relay circuit would report success even when
            // the recipient is gone, and the mailbox is the real fallback.
            match self.connections.send_direct(&node, &frame).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(recipient = %recipient_id, %err, "delivery failed, mailboxing");
                }
            }
        }

        let offline_store = self.offline.read().clone();
        match offline_store {
            Some(store) => {
                store.store_offline(&recipient_public_key, sealed).await;
                info!(recipient = %recipient_id, "delivery mailboxed for offline recipient");
                Ok(())
            }
            None => {
                warn!(recipient = %recipient_id, "no mailbox backend, delivery lost");
                Ok(())
            }
        }
    }

    /// The delivery reached its addressee: unwrap, verify, surface, ack.
    async fn handle_delivery(&self, delivery_ciphertext: Vec<u8>) -> Result<(), OnionError> {
        let payload_bytes =
            OnionLayer::open_bytes(self.identity.encryption_secret(), &delivery_ciphertext)?;
        let payload = RecipientPayload::decode(&payload_bytes)?;
        let message_bytes = unpad(&payload.padded_message)?;
        let message = ChatMessage::deserialize(&message_bytes)?;

        if message.signature.is_some() && !message.verify() {
            warn!(id = %message.id, "chat message failed signature verification");
            return Err(OnionError::BadSignature);
        }

        let message_id = message.id;
        if let Some(events) = self.events.read().clone() {
            events.on_message_received(message, payload.reply_path.clone());
        }

        self.send_ack(&payload.reply_path, &message_id).await;
        Ok(())
    }

    /// Send an acknowledgement back along the reply path.
    pub async fn send_ack(&self, reply_path: &ReplyPath, message_id: &MessageId) {
        match build_ack(reply_path, message_id.as_bytes()) {
            Ok((entry, chain)) => {
                if let Err(err) = self.push_onion(entry, chain).await {
                    warn!(%err, "acknowledgement send failed");
                }
            }
            Err(err) => warn!(%err, "acknowledgement build failed"),
        }
    }

    async fn handle_ack(&self, content: OnionLayerContent) -> Result<(), OnionError> {
        let token_plain =
            OnionLayer::open_bytes(self.identity.encryption_secret(), &content.reply_token)?;
        let token = ReplyToken::decode(&token_plain)?;

        match token.previous_hop {
            PreviousHop::Sender => {
                let id_bytes: [u8; 16] = content
                    .inner
                    .as_slice()
                    .try_into()
                    .map_err(|_| OnionError::UnknownEnvelope)?;
                let message_id = MessageId::from_bytes(id_bytes);
                debug!(id = %message_id, "acknowledgement arrived");
                if let Some(events) = self.events.read().clone() {
                    events.on_ack_received(message_id);
                }
                Ok(())
            }
            PreviousHop::Relay { address, port } => {
                self.validate_next_hop(&address, port)?;
                self.push_onion(SocketAddr::new(address, port), content.inner)
                    .await
            }
        }
    }

    fn validate_next_hop(&self, address: &IpAddr, port: u16) -> Result<(), OnionError> {
        if port == 0 {
            return Err(OnionError::InvalidNextHop("port zero"));
        }
        if self.config.allow_local_next_hop {
            return Ok(());
        }
        let local = match address {
            IpAddr::V4(v4) => {
                v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
            }
            IpAddr::V6(v6) => {
                v6.is_loopback()
                    || v6.is_unspecified()
                    || (v6.segments()[0] & 0xffc0) == 0xfe80
            }
        };
        if local {
            return Err(OnionError::InvalidNextHop("loopback or link-local"));
        }
        Ok(())
    }

    /// Uniform random delay decorrelating inbound and outbound timing.
    async fn decorrelation_delay(&self) {
        let min = self.config.relay_delay_min.as_millis() as u64;
        let max = self.config.relay_delay_max.as_millis() as u64;
        let delay = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    fn onion_frame(&self, payload: Vec<u8>) -> Result<Vec<u8>, OnionError> {
        let message = KademliaMessage::new(
            self.routing.local_id(),
            self.identity.encryption_public_key().to_vec(),
            MessageBody::OnionMessage { payload },
        );
        message.serialize().map_err(OnionError::Malformed)
    }

    async fn push_onion(&self, address: SocketAddr, payload: Vec<u8>) -> Result<(), OnionError> {
        let frame = self.onion_frame(payload)?;
        if let Err(err) = push_frame(address, &frame, FORWARD_CONNECT_TIMEOUT).await {
            debug!(%address, %err, "onion forward failed");
        }
        Ok(())
    }
}

#[async_trait]
impl OnionSink for OnionRouter {
    async fn handle_onion(
        &self,
        source: SocketAddr,
        _sender_public_key: Vec<u8>,
        payload: Vec<u8>,
    ) {
        if !self.rate_limiter.is_allowed(source.ip()) {
            debug!(%source, "onion payload rate limited");
            return;
        }
        if let Err(err) = self.process(payload).await {
            debug!(%source, %err, "onion payload dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, OnionConfig};
    use parking_lot::Mutex;

    struct Captured {
        acks: Mutex<Vec<MessageId>>,
    }

    impl RouterEvents for Captured {
        fn on_message_received(&self, _message: ChatMessage, _reply_path: ReplyPath) {}
        fn on_ack_received(&self, message_id: MessageId) {
            self.acks.lock().push(message_id);
        }
    }

    fn router(config: OnionConfig) -> (OnionRouter, Arc<Identity>) {
        let (identity, _) = Identity::generate();
        let identity = Arc::new(identity);
        let routing = Arc::new(RoutingTable::new(identity.node_id(), 20));
        let connections = ConnectionManager::new(
            ConnectionConfig::default(),
            identity.node_id(),
            identity.encryption_public_key().to_vec(),
            Arc::clone(&routing),
        );
        (
            OnionRouter::new(Arc::clone(&identity), config, routing, connections),
            identity,
        )
    }

    #[test]
    fn next_hop_validation() {
        let (router, _) = router(OnionConfig::default());

        assert!(router
            .validate_next_hop(&"8.8.8.8".parse().unwrap(), 443)
            .is_ok());
        assert!(router
            .validate_next_hop(&"127.0.0.1".parse().unwrap(), 443)
            .is_err());
        assert!(router
            .validate_next_hop(&"169.254.1.1".parse().unwrap(), 443)
            .is_err());
        assert!(router
            .validate_next_hop(&"::1".parse().unwrap(), 443)
            .is_err());
        assert!(router
            .validate_next_hop(&"fe80::1".parse().unwrap(), 443)
            .is_err());
        assert!(router
            .validate_next_hop(&"8.8.8.8".parse().unwrap(), 0)
            .is_err());
    }

    #[test]
    fn local_next_hop_allowed_when_configured() {
        let (router, _) = router(OnionConfig {
            allow_local_next_hop: true,
            ..OnionConfig::default()
        });
        assert!(router
            .validate_next_hop(&"127.0.0.1".parse().unwrap(), 443)
            .is_ok());
    }

    #[tokio::test]
    async fn sender_marked_ack_emits_event() {
        let (router, identity) = router(OnionConfig::default());
        let captured = Arc::new(Captured {
            acks: Mutex::new(Vec::new()),
        });
        router.set_events(captured.clone());

        let message_id = MessageId::random();
        let token = ReplyToken::new(PreviousHop::Sender);
        let sealed_token = OnionLayer::seal_bytes(
            &identity.encryption_public_key(),
            &token.encode(),
        )
        .unwrap();
        let content = OnionLayerContent {
            kind: LayerKind::Ack,
            reply_token: sealed_token,
            inner: message_id.as_bytes().to_vec(),
        };

        router.handle_ack(content).await.unwrap();
        assert_eq!(captured.acks.lock().as_slice(), &[message_id]);
    }

    #[tokio::test]
    async fn garbage_payload_is_dropped_quietly() {
        let (router, _) = router(OnionConfig::default());
        // Does not panic; errors are swallowed into logs.
        router.ingest(vec![0xff, 0xfe, 0xfd]).await;
        router.ingest(Vec::new()).await;
    }

    #[tokio::test]
    async fn bare_non_ack_rejected() {
        let (router, _) = router(OnionConfig::default());
        let content = OnionLayerContent {
            kind: LayerKind::Delivery,
            reply_token: Vec::new(),
            inner: vec![1, 2, 3],
        };
        let result = router.process(content.encode().unwrap()).await;
        assert!(matches!(result, Err(OnionError::UnknownEnvelope)));
    }
}
