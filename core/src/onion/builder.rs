// Onion packet construction
//
// A message leaves as nested sealed layers over the sampled path
// [n1 … nm]: every hop except the last gets a Relay wrap naming its
// successor, the last gets a FinalHop wrap naming the recipient, and the
// innermost payload is the padded message plus the reply path, sealed for
// the recipient alone.

use std::net::SocketAddr;

use super::layer::OnionLayer;
use super::padding::pad;
use super::reply::{PreviousHop, ReplyPath, ReplyToken};
use super::OnionError;
use crate::dht::KademliaNode;
use crate::wire::{ByteReader, ByteWriter, WireError, MAX_ONION_PAYLOAD, MAX_STRING_LEN};

const KIND_RELAY: u8 = 0x01;
const KIND_FINAL_HOP: u8 = 0x02;
const KIND_DELIVERY: u8 = 0x03;
const KIND_ACK: u8 = 0x04;

const MAX_KEY_LEN: usize = 32;

/// Routing role of one decrypted layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerKind {
    Relay {
        next_address: String,
        next_port: u16,
    },
    FinalHop {
        recipient_public_key: Vec<u8>,
    },
    Delivery,
    Ack,
}

/// Plaintext of one onion layer: the role, an optional reply token, and
/// the bytes for the next stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionLayerContent {
    pub kind: LayerKind,
    pub reply_token: Vec<u8>,
    pub inner: Vec<u8>,
}

impl OnionLayerContent {
    pub fn type_tag(&self) -> u8 {
        match self.kind {
            LayerKind::Relay { .. } => KIND_RELAY,
            LayerKind::FinalHop { .. } => KIND_FINAL_HOP,
            LayerKind::Delivery => KIND_DELIVERY,
            LayerKind::Ack => KIND_ACK,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut writer = ByteWriter::with_capacity(8 + self.reply_token.len() + self.inner.len());
        writer.put_u8(self.type_tag());
        match &self.kind {
            LayerKind::Relay {
                next_address,
                next_port,
            } => {
                writer.put_string(next_address, MAX_STRING_LEN)?;
                writer.put_u16_le(*next_port);
            }
            LayerKind::FinalHop {
                recipient_public_key,
            } => {
                writer.put_u8_prefixed(recipient_public_key)?;
            }
            LayerKind::Delivery | LayerKind::Ack => {}
        }
        writer.put_i32_prefixed(&self.reply_token, MAX_ONION_PAYLOAD)?;
        writer.put_i32_prefixed(&self.inner, MAX_ONION_PAYLOAD)?;
        Ok(writer.into_bytes())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = ByteReader::new(bytes);
        let kind = match reader.take_u8()? {
            KIND_RELAY => LayerKind::Relay {
                next_address: reader.take_string(MAX_STRING_LEN)?,
                next_port: reader.take_u16_le()?,
            },
            KIND_FINAL_HOP => LayerKind::FinalHop {
                recipient_public_key: reader.take_u8_prefixed(MAX_KEY_LEN)?.to_vec(),
            },
            KIND_DELIVERY => LayerKind::Delivery,
            KIND_ACK => LayerKind::Ack,
            _ => return Err(WireError::InvalidField("onion content type")),
        };
        let reply_token = reader.take_i32_prefixed(MAX_ONION_PAYLOAD)?.to_vec();
        let inner = reader.take_i32_prefixed(MAX_ONION_PAYLOAD)?.to_vec();
        reader.finish()?;
        Ok(Self {
            kind,
            reply_token,
            inner,
        })
    }
}

/// What the recipient ultimately decrypts: the padded message and the
/// reverse channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientPayload {
    pub padded_message: Vec<u8>,
    pub reply_path: ReplyPath,
}

impl RecipientPayload {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut writer = ByteWriter::with_capacity(self.padded_message.len() + 256);
        writer.put_i32_prefixed(&self.padded_message, MAX_ONION_PAYLOAD)?;
        writer.put_bytes(&self.reply_path.encode()?);
        Ok(writer.into_bytes())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = ByteReader::new(bytes);
        let padded_message = reader.take_i32_prefixed(MAX_ONION_PAYLOAD)?.to_vec();
        let reply_path = ReplyPath::decode_from(&mut reader)?;
        reader.finish()?;
        Ok(Self {
            padded_message,
            reply_path,
        })
    }
}

/// A fully wrapped outbound packet.
#[derive(Debug, Clone)]
pub struct BuiltOnion {
    pub first_hop: KademliaNode,
    pub payload: Vec<u8>,
    pub hop_count: usize,
}

/// Builds outbound onion packets from a sampled relay path.
pub struct OnionBuilder {
    block_size: usize,
}

impl OnionBuilder {
    pub fn new(block_size: usize) -> Self {
        Self { block_size }
    }

    /// Wrap `message_bytes` for `recipient_public_key` across `path`.
    /// Produces exactly one reply token per hop.
    pub fn build_message(
        &self,
        message_bytes: &[u8],
        recipient_public_key: &[u8; 32],
        path: &[KademliaNode],
        sender_public_key: &[u8],
        sender_endpoint: SocketAddr,
    ) -> Result<BuiltOnion, OnionError> {
        if path.is_empty() {
            return Err(OnionError::EmptyPath);
        }

        let padded = pad(message_bytes, self.block_size)?;

        // One reply token per hop, each naming the hop before it on the
        // forward path; the first hop's token names the sender's endpoint.
        let mut hop_tokens_forward = Vec::with_capacity(path.len());
        for (i, hop) in path.iter().enumerate() {
            let previous = if i == 0 {
                PreviousHop::Relay {
                    address: sender_endpoint.ip(),
                    port: sender_endpoint.port(),
                }
            } else {
                PreviousHop::Relay {
                    address: path[i - 1].address.ip(),
                    port: path[i - 1].address.port(),
                }
            };
            let token = ReplyToken::new(previous);
            let hop_key = node_key(hop)?;
            hop_tokens_forward.push(OnionLayer::seal_bytes(&hop_key, &token.encode())?);
        }

        let exit = path.last().expect("path is non-empty");
        let reply_path = ReplyPath {
            exit_address: exit.address.ip(),
            exit_port: exit.address.port(),
            // Consumption order: exit hop first.
            hop_tokens: hop_tokens_forward.iter().rev().cloned().collect(),
            sender_public_key: sender_public_key.to_vec(),
        };

        let recipient_payload = RecipientPayload {
            padded_message: padded,
            reply_path,
        };
        let delivery_ciphertext =
            OnionLayer::seal_bytes(recipient_public_key, &recipient_payload.encode()?)?;

        // Innermost wrap: the exit hop locates the recipient.
        let final_content = OnionLayerContent {
            kind: LayerKind::FinalHop {
                recipient_public_key: recipient_public_key.to_vec(),
            },
            reply_token: Vec::new(),
            inner: delivery_ciphertext,
        };
        let mut wrapped = OnionLayer::seal_bytes(&node_key(exit)?, &final_content.encode()?)?;

        // Relay wraps from the second-to-last hop back to the first.
        for i in (0..path.len() - 1).rev() {
            let next = &path[i + 1];
            let content = OnionLayerContent {
                kind: LayerKind::Relay {
                    next_address: next.address.ip().to_string(),
                    next_port: next.address.port(),
                },
                reply_token: Vec::new(),
                inner: wrapped,
            };
            wrapped = OnionLayer::seal_bytes(&node_key(&path[i])?, &content.encode()?)?;
        }

        Ok(BuiltOnion {
            first_hop: path[0].clone(),
            payload: wrapped,
            hop_count: path.len(),
        })
    }
}

/// Assemble an acknowledgement that retraces the reply path. The innermost
/// element is sealed for the original sender and carries a token marked
/// Sender, so the sender's own router recognizes the acknowledgement as
/// addressed to it.
pub fn build_ack(
    reply_path: &ReplyPath,
    message_id: &[u8; 16],
) -> Result<(SocketAddr, Vec<u8>), OnionError> {
    let sender_key: [u8; 32] = reply_path
        .sender_public_key
        .as_slice()
        .try_into()
        .map_err(|_| OnionError::InvalidPeerKey)?;

    let sender_token = ReplyToken::new(PreviousHop::Sender);
    let core = OnionLayerContent {
        kind: LayerKind::Ack,
        reply_token: OnionLayer::seal_bytes(&sender_key, &sender_token.encode())?,
        inner: message_id.to_vec(),
    };
    let mut chain = OnionLayer::seal_bytes(&sender_key, &core.encode()?)?;

    // hop_tokens are exit-first; nest from the hop nearest the sender out.
    for token in reply_path.hop_tokens.iter().rev() {
        chain = OnionLayerContent {
            kind: LayerKind::Ack,
            reply_token: token.clone(),
            inner: chain,
        }
        .encode()?;
    }

    Ok((reply_path.exit_endpoint(), chain))
}

fn node_key(node: &KademliaNode) -> Result<[u8; 32], OnionError> {
    node.public_key
        .as_slice()
        .try_into()
        .map_err(|_| OnionError::InvalidPeerKey)
}
