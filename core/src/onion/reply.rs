// Reply tokens — the anonymous reverse channel
//
// Each hop receives one sealed token naming only the previous hop on the
// forward path. Acknowledgements retrace the path by peeling tokens, and a
// token marked Sender means the acknowledgement has arrived home.

use std::net::{IpAddr, SocketAddr};

use crate::wire::{ByteReader, ByteWriter, WireError, MAX_ONION_PAYLOAD};

pub const SESSION_KEY_LEN: usize = 32;

const HOP_TAG_SENDER: u8 = 0x00;
const HOP_TAG_RELAY: u8 = 0x01;
const MAX_HOP_TOKENS: usize = 8;
const MAX_KEY_LEN: usize = 32;

/// Where an acknowledgement goes after this hop. The sender marker is a
/// typed variant so it can never collide with a literal address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviousHop {
    Sender,
    Relay { address: IpAddr, port: u16 },
}

/// Decrypted contents of one reply token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyToken {
    pub previous_hop: PreviousHop,
    pub session_key: [u8; SESSION_KEY_LEN],
}

impl ReplyToken {
    pub fn new(previous_hop: PreviousHop) -> Self {
        use rand::RngCore;
        let mut session_key = [0u8; SESSION_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut session_key);
        Self {
            previous_hop,
            session_key,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(1 + 17 + 2 + SESSION_KEY_LEN);
        match &self.previous_hop {
            PreviousHop::Sender => writer.put_u8(HOP_TAG_SENDER),
            PreviousHop::Relay { address, port } => {
                writer.put_u8(HOP_TAG_RELAY);
                match address {
                    IpAddr::V4(v4) => {
                        writer.put_u8(4);
                        writer.put_bytes(&v4.octets());
                    }
                    IpAddr::V6(v6) => {
                        writer.put_u8(16);
                        writer.put_bytes(&v6.octets());
                    }
                }
                writer.put_u16_le(*port);
            }
        }
        writer.put_bytes(&self.session_key);
        writer.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = ByteReader::new(bytes);
        let previous_hop = match reader.take_u8()? {
            HOP_TAG_SENDER => PreviousHop::Sender,
            HOP_TAG_RELAY => {
                let address = match reader.take_u8()? {
                    4 => IpAddr::from(reader.take_array::<4>()?),
                    16 => IpAddr::from(reader.take_array::<16>()?),
                    _ => return Err(WireError::InvalidField("ip address length")),
                };
                let port = reader.take_u16_le()?;
                PreviousHop::Relay { address, port }
            }
            _ => return Err(WireError::InvalidField("previous hop tag")),
        };
        let session_key = reader.take_array::<SESSION_KEY_LEN>()?;
        reader.finish()?;
        Ok(Self {
            previous_hop,
            session_key,
        })
    }
}

/// Handed to the recipient inside the innermost payload: everything needed
/// to route an acknowledgement back without learning the forward path.
/// Tokens are ordered for consumption, exit hop first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPath {
    pub exit_address: IpAddr,
    pub exit_port: u16,
    pub hop_tokens: Vec<Vec<u8>>,
    pub sender_public_key: Vec<u8>,
}

impl ReplyPath {
    pub fn exit_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.exit_address, self.exit_port)
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut writer = ByteWriter::new();
        match self.exit_address {
            IpAddr::V4(v4) => {
                writer.put_u8(4);
                writer.put_bytes(&v4.octets());
            }
            IpAddr::V6(v6) => {
                writer.put_u8(16);
                writer.put_bytes(&v6.octets());
            }
        }
        writer.put_u16_le(self.exit_port);

        if self.hop_tokens.len() > MAX_HOP_TOKENS {
            return Err(WireError::InvalidField("hop token count"));
        }
        writer.put_u8(self.hop_tokens.len() as u8);
        for token in &self.hop_tokens {
            writer.put_i32_prefixed(token, MAX_ONION_PAYLOAD)?;
        }
        writer.put_u8_prefixed(&self.sender_public_key)?;
        Ok(writer.into_bytes())
    }

    pub(crate) fn decode_from(reader: &mut ByteReader<'_>) -> Result<Self, WireError> {
        let exit_address = match reader.take_u8()? {
            4 => IpAddr::from(reader.take_array::<4>()?),
            16 => IpAddr::from(reader.take_array::<16>()?),
            _ => return Err(WireError::InvalidField("ip address length")),
        };
        let exit_port = reader.take_u16_le()?;

        let count = reader.take_u8()? as usize;
        if count > MAX_HOP_TOKENS {
            return Err(WireError::LengthOutOfRange {
                field: "hop token count",
                value: count as u64,
            });
        }
        let mut hop_tokens = Vec::with_capacity(count);
        for _ in 0..count {
            hop_tokens.push(reader.take_i32_prefixed(MAX_ONION_PAYLOAD)?.to_vec());
        }
        let sender_public_key = reader.take_u8_prefixed(MAX_KEY_LEN)?.to_vec();
        Ok(Self {
            exit_address,
            exit_port,
            hop_tokens,
            sender_public_key,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = ByteReader::new(bytes);
        let path = Self::decode_from(&mut reader)?;
        reader.finish()?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_token_roundtrip() {
        let token = ReplyToken::new(PreviousHop::Sender);
        let decoded = ReplyToken::decode(&token.encode()).unwrap();
        assert_eq!(token, decoded);
    }

    #[test]
    fn relay_token_roundtrip() {
        let token = ReplyToken::new(PreviousHop::Relay {
            address: "10.2.3.4".parse().unwrap(),
            port: 41000,
        });
        let decoded = ReplyToken::decode(&token.encode()).unwrap();
        assert_eq!(token, decoded);
    }

    #[test]
    fn v6_relay_token_roundtrip() {
        let token = ReplyToken::new(PreviousHop::Relay {
            address: "2001:db8::7".parse().unwrap(),
            port: 9,
        });
        assert_eq!(ReplyToken::decode(&token.encode()).unwrap(), token);
    }

    #[test]
    fn bad_tag_rejected() {
        let mut bytes = ReplyToken::new(PreviousHop::Sender).encode();
        bytes[0] = 0x09;
        assert!(ReplyToken::decode(&bytes).is_err());
    }

    #[test]
    fn session_keys_are_fresh() {
        let a = ReplyToken::new(PreviousHop::Sender);
        let b = ReplyToken::new(PreviousHop::Sender);
        assert_ne!(a.session_key, b.session_key);
    }

    #[test]
    fn reply_path_roundtrip() {
        let path = ReplyPath {
            exit_address: "192.168.7.7".parse().unwrap(),
            exit_port: 40004,
            hop_tokens: vec![vec![1; 80], vec![2; 80], vec![3; 80]],
            sender_public_key: vec![9; 32],
        };
        assert_eq!(ReplyPath::decode(&path.encode().unwrap()).unwrap(), path);
    }
}
