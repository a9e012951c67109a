// Chat message codec and signature
//
// Travels only inside the padded recipient payload; the signature covers
// everything except itself so relays cannot reattribute a message.

use crate::dht::unix_now;
use crate::identity::Identity;
use crate::wire::{ByteReader, ByteWriter, MessageId, WireError, MAX_STRING_LEN};

const MAX_SIG_LEN: usize = 64;
const MAX_KEY_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender_username: String,
    pub content: String,
    pub timestamp: i64,
    pub sender_signing_public_key: Vec<u8>,
    pub signature: Option<Vec<u8>>,
}

impl ChatMessage {
    /// Build and sign an outbound message. Fails when the username or
    /// content exceeds the wire bounds.
    pub fn signed(
        identity: &Identity,
        sender_username: &str,
        content: &str,
    ) -> Result<Self, WireError> {
        let mut message = Self {
            id: MessageId::random(),
            sender_username: sender_username.to_string(),
            content: content.to_string(),
            timestamp: unix_now() as i64,
            sender_signing_public_key: identity.signing_public_key().to_vec(),
            signature: None,
        };
        let signable = message.signable_bytes()?;
        message.signature = Some(identity.sign(&signable).to_vec());
        Ok(message)
    }

    fn signable_bytes(&self) -> Result<Vec<u8>, WireError> {
        let mut writer = ByteWriter::new();
        writer.put_bytes(self.id.as_bytes());
        writer.put_string(&self.sender_username, MAX_STRING_LEN)?;
        writer.put_string(&self.content, MAX_STRING_LEN)?;
        writer.put_i64_le(self.timestamp);
        writer.put_u8_prefixed(&self.sender_signing_public_key)?;
        Ok(writer.into_bytes())
    }

    pub fn serialize(&self) -> Result<Vec<u8>, WireError> {
        let mut writer = ByteWriter::new();
        writer.put_bytes(&self.signable_bytes()?);
        match &self.signature {
            Some(signature) => {
                writer.put_bool(true);
                if signature.len() > MAX_SIG_LEN {
                    return Err(WireError::InvalidField("message signature"));
                }
                writer.put_u8_prefixed(signature)?;
            }
            None => writer.put_bool(false),
        }
        Ok(writer.into_bytes())
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = ByteReader::new(bytes);
        let id = MessageId::from_bytes(reader.take_array::<16>()?);
        let sender_username = reader.take_string(MAX_STRING_LEN)?;
        let content = reader.take_string(MAX_STRING_LEN)?;
        let timestamp = reader.take_i64_le()?;
        let sender_signing_public_key = reader.take_u8_prefixed(MAX_KEY_LEN)?.to_vec();
        let signature = if reader.take_bool()? {
            Some(reader.take_u8_prefixed(MAX_SIG_LEN)?.to_vec())
        } else {
            None
        };
        reader.finish()?;
        Ok(Self {
            id,
            sender_username,
            content,
            timestamp,
            sender_signing_public_key,
            signature,
        })
    }

    /// True when the signature is present and valid over the signable
    /// bytes.
    pub fn verify(&self) -> bool {
        let Some(signature) = &self.signature else {
            return false;
        };
        let Ok(signable) = self.signable_bytes() else {
            return false;
        };
        Identity::verify(&signable, signature, &self.sender_signing_public_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_roundtrip_verifies() {
        let (identity, _) = Identity::generate();
        let message = ChatMessage::signed(&identity, "alice", "hello bob").unwrap();

        let decoded = ChatMessage::deserialize(&message.serialize().unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert!(decoded.verify());
        assert_eq!(decoded.content, "hello bob");
    }

    #[test]
    fn tampered_content_fails_verification() {
        let (identity, _) = Identity::generate();
        let mut message = ChatMessage::signed(&identity, "alice", "hello bob").unwrap();
        message.content = "hello mallory".to_string();
        assert!(!message.verify());
    }

    #[test]
    fn unsigned_message_does_not_verify() {
        let (identity, _) = Identity::generate();
        let mut message = ChatMessage::signed(&identity, "alice", "hi").unwrap();
        message.signature = None;
        assert!(!message.verify());

        // It still round-trips: signature presence is a wire flag.
        let decoded = ChatMessage::deserialize(&message.serialize().unwrap()).unwrap();
        assert_eq!(decoded.signature, None);
    }

    #[test]
    fn oversized_content_rejected() {
        let (identity, _) = Identity::generate();
        let mut message = ChatMessage::signed(&identity, "alice", "hi").unwrap();
        message.content = "x".repeat(MAX_STRING_LEN + 1);
        assert!(message.serialize().is_err());
    }

    #[test]
    fn unicode_content_roundtrip() {
        let (identity, _) = Identity::generate();
        let message = ChatMessage::signed(&identity, "ålice", "päivää 👋").unwrap();
        let decoded = ChatMessage::deserialize(&message.serialize().unwrap()).unwrap();
        assert_eq!(decoded.content, "päivää 👋");
        assert!(decoded.verify());
    }
}
