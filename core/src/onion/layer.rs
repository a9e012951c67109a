// One onion layer: X25519 ECDH → HKDF-SHA256 → ChaCha20-Poly1305
//
// Wire form: ephemeral_pk_len (1) | ephemeral_pk (32) | nonce_len (1) |
// nonce (12) | ciphertext_len (i32) | ciphertext.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};

use super::OnionError;
use crate::wire::{ByteReader, ByteWriter, WireError, MAX_ONION_PAYLOAD};

const EPHEMERAL_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// A single AEAD layer addressed to exactly one hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionLayer {
    pub ephemeral_public_key: [u8; EPHEMERAL_KEY_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl OnionLayer {
    /// Encrypt `plaintext` so only the holder of the secret matching
    /// `recipient_public_key` can open it.
    pub fn seal(
        recipient_public_key: &[u8; 32],
        plaintext: &[u8],
    ) -> Result<Self, OnionError> {
        let ephemeral = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_public = X25519PublicKey::from(&ephemeral);

        let shared = ephemeral.diffie_hellman(&X25519PublicKey::from(*recipient_public_key));
        let key = derive_layer_key(shared.as_bytes());

        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| OnionError::EncryptFailed)?;

        Ok(Self {
            ephemeral_public_key: ephemeral_public.to_bytes(),
            nonce,
            ciphertext,
        })
    }

    /// Decrypt with the local long-term key-agreement secret.
    pub fn open(&self, secret: &StaticSecret) -> Result<Vec<u8>, OnionError> {
        let shared = secret.diffie_hellman(&X25519PublicKey::from(self.ephemeral_public_key));
        let key = derive_layer_key(shared.as_bytes());

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(Nonce::from_slice(&self.nonce), self.ciphertext.as_slice())
            .map_err(|_| OnionError::DecryptFailed)
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut writer = ByteWriter::with_capacity(2 + 32 + 12 + 4 + self.ciphertext.len());
        writer.put_u8_prefixed(&self.ephemeral_public_key)?;
        writer.put_u8_prefixed(&self.nonce)?;
        writer.put_i32_prefixed(&self.ciphertext, MAX_ONION_PAYLOAD)?;
        Ok(writer.into_bytes())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = ByteReader::new(bytes);
        let layer = Self::decode_from(&mut reader)?;
        reader.finish()?;
        Ok(layer)
    }

    pub(crate) fn decode_from(reader: &mut ByteReader<'_>) -> Result<Self, WireError> {
        let ephemeral = reader.take_u8_prefixed(EPHEMERAL_KEY_LEN)?;
        let ephemeral_public_key: [u8; EPHEMERAL_KEY_LEN] = ephemeral
            .try_into()
            .map_err(|_| WireError::InvalidField("ephemeral key length"))?;
        let nonce_bytes = reader.take_u8_prefixed(NONCE_LEN)?;
        let nonce: [u8; NONCE_LEN] = nonce_bytes
            .try_into()
            .map_err(|_| WireError::InvalidField("nonce length"))?;
        let ciphertext = reader.take_i32_prefixed(MAX_ONION_PAYLOAD)?.to_vec();
        Ok(Self {
            ephemeral_public_key,
            nonce,
            ciphertext,
        })
    }

    /// Seal and encode in one step.
    pub fn seal_bytes(
        recipient_public_key: &[u8; 32],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, OnionError> {
        Self::seal(recipient_public_key, plaintext)?
            .encode()
            .map_err(OnionError::Malformed)
    }

    /// Decode and open in one step.
    pub fn open_bytes(secret: &StaticSecret, bytes: &[u8]) -> Result<Vec<u8>, OnionError> {
        Self::decode(bytes)?.open(secret)
    }
}

fn derive_layer_key(shared_secret: &[u8]) -> [u8; 32] {
    // Empty salt and empty info, fixed by the protocol.
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hk.expand(&[], &mut key).expect("32 bytes is a valid HKDF length");
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (StaticSecret, [u8; 32]) {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = X25519PublicKey::from(&secret).to_bytes();
        (secret, public)
    }

    #[test]
    fn seal_open_roundtrip() {
        let (secret, public) = keypair();
        let layer = OnionLayer::seal(&public, b"layered secret").unwrap();
        assert_eq!(layer.open(&secret).unwrap(), b"layered secret");
    }

    #[test]
    fn wrong_key_cannot_open() {
        let (_, public) = keypair();
        let (other_secret, _) = keypair();

        let layer = OnionLayer::seal(&public, b"layered secret").unwrap();
        assert!(matches!(
            layer.open(&other_secret),
            Err(OnionError::DecryptFailed)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let (secret, public) = keypair();
        let mut layer = OnionLayer::seal(&public, b"layered secret").unwrap();
        let last = layer.ciphertext.len() - 1;
        layer.ciphertext[last] ^= 0x01;
        assert!(layer.open(&secret).is_err());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let (secret, public) = keypair();
        let bytes = OnionLayer::seal_bytes(&public, b"wire trip").unwrap();
        assert_eq!(bytes[0], 32, "layers start with the ephemeral key length");
        assert_eq!(OnionLayer::open_bytes(&secret, &bytes).unwrap(), b"wire trip");
    }

    #[test]
    fn ephemeral_keys_are_unique() {
        let (_, public) = keypair();
        let a = OnionLayer::seal(&public, b"x").unwrap();
        let b = OnionLayer::seal(&public, b"x").unwrap();
        assert_ne!(a.ephemeral_public_key, b.ephemeral_public_key);
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn truncated_layer_rejected() {
        let (_, public) = keypair();
        let bytes = OnionLayer::seal_bytes(&public, b"wire trip").unwrap();
        assert!(OnionLayer::decode(&bytes[..bytes.len() - 3]).is_err());
    }
}
