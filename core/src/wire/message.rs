// Kademlia RPC message codec
//
// Frame body layout, common to every RPC:
//   type (1) | message_id (16) | sender_id (32) | pk_len (1) | pk | payload
//
// All multi-byte integers are little-endian. Every length field is checked
// against its bound before the bytes behind it are touched.

use std::net::IpAddr;

use super::bytes::{ByteReader, ByteWriter};
use super::WireError;
use crate::dht::NodeId;

/// Largest value accepted by STORE / FIND_VALUE.
pub const MAX_VALUE_SIZE: usize = 32 * 1024;

/// Largest onion payload carried by an OnionMessage wrapper.
pub const MAX_ONION_PAYLOAD: usize = 64 * 1024;

/// Bound on any string field.
pub const MAX_STRING_LEN: usize = 1024;

/// Bound on the error text of a StoreResponse.
pub const MAX_ERROR_LEN: usize = 256;

/// Node records per response; equals the replication factor k.
pub const MAX_NODES_PER_RESPONSE: usize = 20;

const MAX_PUBLIC_KEY_LEN: usize = 32;
const MAX_OFFLINE_MESSAGES: usize = 100;

mod tag {
    pub const PING: u8 = 0x01;
    pub const PONG: u8 = 0x02;
    pub const FIND_NODE: u8 = 0x03;
    pub const FIND_NODE_RESPONSE: u8 = 0x04;
    pub const FIND_VALUE: u8 = 0x05;
    pub const FIND_VALUE_RESPONSE: u8 = 0x06;
    pub const STORE: u8 = 0x07;
    pub const STORE_RESPONSE: u8 = 0x08;
    pub const ONION_MESSAGE: u8 = 0x10;
    pub const NODE_ANNOUNCE: u8 = 0x11;
    pub const STORE_OFFLINE_MESSAGE: u8 = 0x12;
    pub const GET_OFFLINE_MESSAGES: u8 = 0x13;
    pub const OFFLINE_MESSAGES_RESPONSE: u8 = 0x14;
    pub const RELAY_REQUEST: u8 = 0x20;
    pub const RELAY_RESPONSE: u8 = 0x21;
    pub const CIRCUIT_REQUEST: u8 = 0x22;
    pub const CIRCUIT_RESPONSE: u8 = 0x23;
    pub const RELAY_DATA: u8 = 0x24;
    pub const CIRCUIT_CLOSE: u8 = 0x25;
}

/// 16-byte request/response correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; 16]);

impl MessageId {
    pub fn random() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// 16-byte relay circuit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CircuitId([u8; 16]);

impl CircuitId {
    pub fn random() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for CircuitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Contact information exchanged in lookup responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub public_key: Vec<u8>,
    pub address: IpAddr,
    pub port: u16,
}

impl NodeRecord {
    fn encode(&self, writer: &mut ByteWriter) -> Result<(), WireError> {
        writer.put_bytes(self.id.as_bytes());
        if self.public_key.len() > MAX_PUBLIC_KEY_LEN {
            return Err(WireError::InvalidField("node record public key"));
        }
        writer.put_u8_prefixed(&self.public_key)?;
        match self.address {
            IpAddr::V4(v4) => {
                writer.put_u8(4);
                writer.put_bytes(&v4.octets());
            }
            IpAddr::V6(v6) => {
                writer.put_u8(16);
                writer.put_bytes(&v6.octets());
            }
        }
        writer.put_u16_le(self.port);
        Ok(())
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, WireError> {
        let id = NodeId::from_bytes(reader.take_array::<32>()?);
        let public_key = reader.take_u8_prefixed(MAX_PUBLIC_KEY_LEN)?.to_vec();
        let address = match reader.take_u8()? {
            4 => IpAddr::from(reader.take_array::<4>()?),
            16 => IpAddr::from(reader.take_array::<16>()?),
            _ => return Err(WireError::InvalidField("ip address length")),
        };
        let port = reader.take_u16_le()?;
        Ok(Self {
            id,
            public_key,
            address,
            port,
        })
    }
}

/// Per-type payload of a Kademlia RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Ping,
    Pong {
        in_response_to: MessageId,
    },
    FindNode {
        target: NodeId,
    },
    FindNodeResponse {
        in_response_to: MessageId,
        nodes: Vec<NodeRecord>,
    },
    FindValue {
        key: NodeId,
    },
    FindValueResponse {
        in_response_to: MessageId,
        value: Option<Vec<u8>>,
        nodes: Vec<NodeRecord>,
    },
    Store {
        key: NodeId,
        value: Vec<u8>,
        ttl_seconds: u32,
    },
    StoreResponse {
        in_response_to: MessageId,
        success: bool,
        error: String,
    },
    OnionMessage {
        payload: Vec<u8>,
    },
    /// First frame on every connection: the sender's listening port, so
    /// peers record a dialable endpoint instead of the ephemeral one.
    NodeAnnounce {
        listen_port: u16,
    },
    StoreOfflineMessage {
        recipient_public_key: Vec<u8>,
        ciphertext: Vec<u8>,
    },
    GetOfflineMessages {
        recipient_public_key: Vec<u8>,
    },
    OfflineMessagesResponse {
        in_response_to: MessageId,
        messages: Vec<Vec<u8>>,
    },
    RelayRequest {
        target_id: NodeId,
        payload: Vec<u8>,
    },
    RelayResponse {
        in_response_to: MessageId,
        success: bool,
        payload: Vec<u8>,
    },
    CircuitRequest {
        circuit_id: CircuitId,
        target_id: NodeId,
    },
    CircuitResponse {
        in_response_to: MessageId,
        circuit_id: CircuitId,
        accepted: bool,
        error: String,
    },
    RelayData {
        circuit_id: CircuitId,
        data: Vec<u8>,
    },
    CircuitClose {
        circuit_id: CircuitId,
    },
}

impl MessageBody {
    pub fn type_tag(&self) -> u8 {
        match self {
            MessageBody::Ping => tag::PING,
            MessageBody::Pong { .. } => tag::PONG,
            MessageBody::FindNode { .. } => tag::FIND_NODE,
            MessageBody::FindNodeResponse { .. } => tag::FIND_NODE_RESPONSE,
            MessageBody::FindValue { .. } => tag::FIND_VALUE,
            MessageBody::FindValueResponse { .. } => tag::FIND_VALUE_RESPONSE,
            MessageBody::Store { .. } => tag::STORE,
            MessageBody::StoreResponse { .. } => tag::STORE_RESPONSE,
            MessageBody::OnionMessage { .. } => tag::ONION_MESSAGE,
            MessageBody::NodeAnnounce { .. } => tag::NODE_ANNOUNCE,
            MessageBody::StoreOfflineMessage { .. } => tag::STORE_OFFLINE_MESSAGE,
            MessageBody::GetOfflineMessages { .. } => tag::GET_OFFLINE_MESSAGES,
            MessageBody::OfflineMessagesResponse { .. } => tag::OFFLINE_MESSAGES_RESPONSE,
            MessageBody::RelayRequest { .. } => tag::RELAY_REQUEST,
            MessageBody::RelayResponse { .. } => tag::RELAY_RESPONSE,
            MessageBody::CircuitRequest { .. } => tag::CIRCUIT_REQUEST,
            MessageBody::CircuitResponse { .. } => tag::CIRCUIT_RESPONSE,
            MessageBody::RelayData { .. } => tag::RELAY_DATA,
            MessageBody::CircuitClose { .. } => tag::CIRCUIT_CLOSE,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            MessageBody::Ping => "Ping",
            MessageBody::Pong { .. } => "Pong",
            MessageBody::FindNode { .. } => "FindNode",
            MessageBody::FindNodeResponse { .. } => "FindNodeResponse",
            MessageBody::FindValue { .. } => "FindValue",
            MessageBody::FindValueResponse { .. } => "FindValueResponse",
            MessageBody::Store { .. } => "Store",
            MessageBody::StoreResponse { .. } => "StoreResponse",
            MessageBody::OnionMessage { .. } => "OnionMessage",
            MessageBody::NodeAnnounce { .. } => "NodeAnnounce",
            MessageBody::StoreOfflineMessage { .. } => "StoreOfflineMessage",
            MessageBody::GetOfflineMessages { .. } => "GetOfflineMessages",
            MessageBody::OfflineMessagesResponse { .. } => "OfflineMessagesResponse",
            MessageBody::RelayRequest { .. } => "RelayRequest",
            MessageBody::RelayResponse { .. } => "RelayResponse",
            MessageBody::CircuitRequest { .. } => "CircuitRequest",
            MessageBody::CircuitResponse { .. } => "CircuitResponse",
            MessageBody::RelayData { .. } => "RelayData",
            MessageBody::CircuitClose { .. } => "CircuitClose",
        }
    }

    /// The id of the request this message answers, if it is a response.
    pub fn in_response_to(&self) -> Option<MessageId> {
        match self {
            MessageBody::Pong { in_response_to }
            | MessageBody::FindNodeResponse { in_response_to, .. }
            | MessageBody::FindValueResponse { in_response_to, .. }
            | MessageBody::StoreResponse { in_response_to, .. }
            | MessageBody::OfflineMessagesResponse { in_response_to, .. }
            | MessageBody::RelayResponse { in_response_to, .. }
            | MessageBody::CircuitResponse { in_response_to, .. } => Some(*in_response_to),
            _ => None,
        }
    }
}

/// One complete RPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KademliaMessage {
    pub message_id: MessageId,
    pub sender_id: NodeId,
    pub sender_public_key: Vec<u8>,
    pub body: MessageBody,
}

impl KademliaMessage {
    pub fn new(sender_id: NodeId, sender_public_key: Vec<u8>, body: MessageBody) -> Self {
        Self {
            message_id: MessageId::random(),
            sender_id,
            sender_public_key,
            body,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, WireError> {
        let mut writer = ByteWriter::with_capacity(64);
        writer.put_u8(self.body.type_tag());
        writer.put_bytes(self.message_id.as_bytes());
        writer.put_bytes(self.sender_id.as_bytes());
        if self.sender_public_key.len() > MAX_PUBLIC_KEY_LEN {
            return Err(WireError::InvalidField("sender public key"));
        }
        writer.put_u8_prefixed(&self.sender_public_key)?;

        match &self.body {
            MessageBody::Ping => {}
            MessageBody::Pong { in_response_to } => {
                writer.put_bytes(in_response_to.as_bytes());
            }
            MessageBody::FindNode { target } => {
                writer.put_bytes(target.as_bytes());
            }
            MessageBody::FindNodeResponse {
                in_response_to,
                nodes,
            } => {
                writer.put_bytes(in_response_to.as_bytes());
                encode_node_list(&mut writer, nodes)?;
            }
            MessageBody::FindValue { key } => {
                writer.put_bytes(key.as_bytes());
            }
            MessageBody::FindValueResponse {
                in_response_to,
                value,
                nodes,
            } => {
                writer.put_bytes(in_response_to.as_bytes());
                match value {
                    Some(value) => {
                        writer.put_bool(true);
                        writer.put_i32_prefixed(value, MAX_VALUE_SIZE)?;
                    }
                    None => {
                        writer.put_bool(false);
                        encode_node_list(&mut writer, nodes)?;
                    }
                }
            }
            MessageBody::Store {
                key,
                value,
                ttl_seconds,
            } => {
                writer.put_bytes(key.as_bytes());
                writer.put_i32_prefixed(value, MAX_VALUE_SIZE)?;
                writer.put_u32_le(*ttl_seconds);
            }
            MessageBody::StoreResponse {
                in_response_to,
                success,
                error,
            } => {
                writer.put_bytes(in_response_to.as_bytes());
                writer.put_bool(*success);
                writer.put_string(error, MAX_ERROR_LEN)?;
            }
            MessageBody::OnionMessage { payload } => {
                writer.put_i32_prefixed(payload, MAX_ONION_PAYLOAD)?;
            }
            MessageBody::NodeAnnounce { listen_port } => {
                writer.put_u16_le(*listen_port);
            }
            MessageBody::StoreOfflineMessage {
                recipient_public_key,
                ciphertext,
            } => {
                writer.put_u8_prefixed(recipient_public_key)?;
                writer.put_i32_prefixed(ciphertext, MAX_ONION_PAYLOAD)?;
            }
            MessageBody::GetOfflineMessages {
                recipient_public_key,
            } => {
                writer.put_u8_prefixed(recipient_public_key)?;
            }
            MessageBody::OfflineMessagesResponse {
                in_response_to,
                messages,
            } => {
                writer.put_bytes(in_response_to.as_bytes());
                if messages.len() > MAX_OFFLINE_MESSAGES {
                    return Err(WireError::InvalidField("offline message count"));
                }
                writer.put_varint(messages.len() as u64);
                for message in messages {
                    writer.put_i32_prefixed(message, MAX_ONION_PAYLOAD)?;
                }
            }
            MessageBody::RelayRequest { target_id, payload } => {
                writer.put_bytes(target_id.as_bytes());
                writer.put_i32_prefixed(payload, MAX_FRAME_PAYLOAD)?;
            }
            MessageBody::RelayResponse {
                in_response_to,
                success,
                payload,
            } => {
                writer.put_bytes(in_response_to.as_bytes());
                writer.put_bool(*success);
                writer.put_i32_prefixed(payload, MAX_FRAME_PAYLOAD)?;
            }
            MessageBody::CircuitRequest {
                circuit_id,
                target_id,
            } => {
                writer.put_bytes(circuit_id.as_bytes());
                writer.put_bytes(target_id.as_bytes());
            }
            MessageBody::CircuitResponse {
                in_response_to,
                circuit_id,
                accepted,
                error,
            } => {
                writer.put_bytes(in_response_to.as_bytes());
                writer.put_bytes(circuit_id.as_bytes());
                writer.put_bool(*accepted);
                writer.put_string(error, MAX_ERROR_LEN)?;
            }
            MessageBody::RelayData { circuit_id, data } => {
                writer.put_bytes(circuit_id.as_bytes());
                writer.put_i32_prefixed(data, MAX_FRAME_PAYLOAD)?;
            }
            MessageBody::CircuitClose { circuit_id } => {
                writer.put_bytes(circuit_id.as_bytes());
            }
        }

        Ok(writer.into_bytes())
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = ByteReader::new(bytes);
        let type_tag = reader.take_u8()?;
        let message_id = MessageId::from_bytes(reader.take_array::<16>()?);
        let sender_id = NodeId::from_bytes(reader.take_array::<32>()?);
        let sender_public_key = reader.take_u8_prefixed(MAX_PUBLIC_KEY_LEN)?.to_vec();

        let body = match type_tag {
            tag::PING => MessageBody::Ping,
            tag::PONG => MessageBody::Pong {
                in_response_to: MessageId::from_bytes(reader.take_array::<16>()?),
            },
            tag::FIND_NODE => MessageBody::FindNode {
                target: NodeId::from_bytes(reader.take_array::<32>()?),
            },
            tag::FIND_NODE_RESPONSE => MessageBody::FindNodeResponse {
                in_response_to: MessageId::from_bytes(reader.take_array::<16>()?),
                nodes: decode_node_list(&mut reader)?,
            },
            tag::FIND_VALUE => MessageBody::FindValue {
                key: NodeId::from_bytes(reader.take_array::<32>()?),
            },
            tag::FIND_VALUE_RESPONSE => {
                let in_response_to = MessageId::from_bytes(reader.take_array::<16>()?);
                if reader.take_bool()? {
                    MessageBody::FindValueResponse {
                        in_response_to,
                        value: Some(reader.take_i32_prefixed(MAX_VALUE_SIZE)?.to_vec()),
                        nodes: Vec::new(),
                    }
                } else {
                    MessageBody::FindValueResponse {
                        in_response_to,
                        value: None,
                        nodes: decode_node_list(&mut reader)?,
                    }
                }
            }
            tag::STORE => MessageBody::Store {
                key: NodeId::from_bytes(reader.take_array::<32>()?),
                value: reader.take_i32_prefixed(MAX_VALUE_SIZE)?.to_vec(),
                ttl_seconds: reader.take_u32_le()?,
            },
            tag::STORE_RESPONSE => MessageBody::StoreResponse {
                in_response_to: MessageId::from_bytes(reader.take_array::<16>()?),
                success: reader.take_bool()?,
                error: reader.take_string(MAX_ERROR_LEN)?,
            },
            tag::ONION_MESSAGE => MessageBody::OnionMessage {
                payload: reader.take_i32_prefixed(MAX_ONION_PAYLOAD)?.to_vec(),
            },
            tag::NODE_ANNOUNCE => MessageBody::NodeAnnounce {
                listen_port: reader.take_u16_le()?,
            },
            tag::STORE_OFFLINE_MESSAGE => MessageBody::StoreOfflineMessage {
                recipient_public_key: reader.take_u8_prefixed(MAX_PUBLIC_KEY_LEN)?.to_vec(),
                ciphertext: reader.take_i32_prefixed(MAX_ONION_PAYLOAD)?.to_vec(),
            },
            tag::GET_OFFLINE_MESSAGES => MessageBody::GetOfflineMessages {
                recipient_public_key: reader.take_u8_prefixed(MAX_PUBLIC_KEY_LEN)?.to_vec(),
            },
            tag::OFFLINE_MESSAGES_RESPONSE => {
                let in_response_to = MessageId::from_bytes(reader.take_array::<16>()?);
                let count = reader.take_varint()?;
                if count > MAX_OFFLINE_MESSAGES as u64 {
                    return Err(WireError::LengthOutOfRange {
                        field: "offline message count",
                        value: count,
                    });
                }
                let mut messages = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    messages.push(reader.take_i32_prefixed(MAX_ONION_PAYLOAD)?.to_vec());
                }
                MessageBody::OfflineMessagesResponse {
                    in_response_to,
                    messages,
                }
            }
            tag::RELAY_REQUEST => MessageBody::RelayRequest {
                target_id: NodeId::from_bytes(reader.take_array::<32>()?),
                payload: reader.take_i32_prefixed(MAX_FRAME_PAYLOAD)?.to_vec(),
            },
            tag::RELAY_RESPONSE => MessageBody::RelayResponse {
                in_response_to: MessageId::from_bytes(reader.take_array::<16>()?),
                success: reader.take_bool()?,
                payload: reader.take_i32_prefixed(MAX_FRAME_PAYLOAD)?.to_vec(),
            },
            tag::CIRCUIT_REQUEST => MessageBody::CircuitRequest {
                circuit_id: CircuitId::from_bytes(reader.take_array::<16>()?),
                target_id: NodeId::from_bytes(reader.take_array::<32>()?),
            },
            tag::CIRCUIT_RESPONSE => MessageBody::CircuitResponse {
                in_response_to: MessageId::from_bytes(reader.take_array::<16>()?),
                circuit_id: CircuitId::from_bytes(reader.take_array::<16>()?),
                accepted: reader.take_bool()?,
                error: reader.take_string(MAX_ERROR_LEN)?,
            },
            tag::RELAY_DATA => MessageBody::RelayData {
                circuit_id: CircuitId::from_bytes(reader.take_array::<16>()?),
                data: reader.take_i32_prefixed(MAX_FRAME_PAYLOAD)?.to_vec(),
            },
            tag::CIRCUIT_CLOSE => MessageBody::CircuitClose {
                circuit_id: CircuitId::from_bytes(reader.take_array::<16>()?),
            },
            other => return Err(WireError::UnknownTypeTag(other)),
        };

        reader.finish()?;
        Ok(Self {
            message_id,
            sender_id,
            sender_public_key,
            body,
        })
    }
}

/// Relayed payloads may carry a full inner frame, minus framing overhead.
const MAX_FRAME_PAYLOAD: usize = super::frame::MAX_FRAME_SIZE - 128;

fn encode_node_list(writer: &mut ByteWriter, nodes: &[NodeRecord]) -> Result<(), WireError> {
    if nodes.len() > MAX_NODES_PER_RESPONSE {
        return Err(WireError::InvalidField("node list length"));
    }
    writer.put_u8(nodes.len() as u8);
    for node in nodes {
        node.encode(writer)?;
    }
    Ok(())
}

fn decode_node_list(reader: &mut ByteReader<'_>) -> Result<Vec<NodeRecord>, WireError> {
    let count = reader.take_u8()? as usize;
    if count > MAX_NODES_PER_RESPONSE {
        return Err(WireError::LengthOutOfRange {
            field: "node list length",
            value: count as u64,
        });
    }
    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        nodes.push(NodeRecord::decode(reader)?);
    }
    Ok(nodes)
}
