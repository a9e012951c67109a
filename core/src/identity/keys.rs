// Mnemonic-derived identity keys
//
// A 24-word BIP39 phrase yields a 64-byte seed. The first half seeds the
// Ed25519 signing key, the second half the X25519 key-agreement secret.
// The node id is SHA-256 of the encryption public key.

use bip39::{Language, Mnemonic, MnemonicType, Seed};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::dht::NodeId;

/// Expected mnemonic length.
pub const MNEMONIC_WORDS: usize = 24;

/// BIP39 seed length in bytes.
pub const SEED_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid mnemonic phrase: {0}")]
    InvalidMnemonic(String),
    #[error("expected {MNEMONIC_WORDS} mnemonic words, got {0}")]
    WrongWordCount(usize),
    #[error("passphrase must be at least {0} characters")]
    PassphraseTooShort(usize),
    #[error("credential file is corrupt or has an unknown format")]
    CredentialFormat,
    #[error("credential decryption failed: wrong passphrase or tampered file")]
    DecryptFailed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Long-term identity: Ed25519 signing keypair plus X25519 key-agreement
/// keypair, both derived from one seed.
pub struct Identity {
    seed: Zeroizing<[u8; SEED_LEN]>,
    signing_key: SigningKey,
    encryption_secret: StaticSecret,
}

impl Identity {
    /// Generate a fresh identity. Returns the identity and its mnemonic
    /// phrase; the phrase is the only way to restore the identity later.
    pub fn generate() -> (Self, String) {
        let mnemonic = Mnemonic::new(MnemonicType::Words24, Language::English);
        let phrase = mnemonic.phrase().to_string();
        let identity = Self::from_validated_mnemonic(&mnemonic);
        (identity, phrase)
    }

    /// Restore an identity from its mnemonic phrase.
    pub fn from_mnemonic(phrase: &str) -> Result<Self, IdentityError> {
        let word_count = phrase.split_whitespace().count();
        if word_count != MNEMONIC_WORDS {
            return Err(IdentityError::WrongWordCount(word_count));
        }

        let mnemonic = Mnemonic::from_phrase(phrase, Language::English)
            .map_err(|e| IdentityError::InvalidMnemonic(e.to_string()))?;

        Ok(Self::from_validated_mnemonic(&mnemonic))
    }

    /// Rebuild an identity from a raw 64-byte seed (credential file path).
    pub fn from_seed(seed: &[u8; SEED_LEN]) -> Self {
        let mut signing_seed = [0u8; 32];
        signing_seed.copy_from_slice(&seed[..32]);
        let signing_key = SigningKey::from_bytes(&signing_seed);
        signing_seed.zeroize();

        let mut encryption_seed = [0u8; 32];
        encryption_seed.copy_from_slice(&seed[32..]);
        let encryption_secret = StaticSecret::from(encryption_seed);
        encryption_seed.zeroize();

        Self {
            seed: Zeroizing::new(*seed),
            signing_key,
            encryption_secret,
        }
    }

    fn from_validated_mnemonic(mnemonic: &Mnemonic) -> Self {
        // Empty BIP39 passphrase: the credential store adds its own
        // passphrase protection at rest.
        let seed = Seed::new(mnemonic, "");
        let mut seed_bytes = [0u8; SEED_LEN];
        seed_bytes.copy_from_slice(seed.as_bytes());
        let identity = Self::from_seed(&seed_bytes);
        seed_bytes.zeroize();
        identity
    }

    /// The raw seed, for handing to the credential store.
    pub fn seed(&self) -> &[u8; SEED_LEN] {
        &self.seed
    }

    /// Node id: SHA-256 of the encryption public key.
    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.encryption_public_key())
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn encryption_secret(&self) -> &StaticSecret {
        &self.encryption_secret
    }

    pub fn signing_public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn encryption_public_key(&self) -> [u8; 32] {
        X25519PublicKey::from(&self.encryption_secret).to_bytes()
    }

    /// Sign arbitrary bytes with the identity signing key.
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.signing_key.sign(data).to_bytes()
    }

    /// Verify a signature against a 32-byte Ed25519 public key.
    pub fn verify(data: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        let sig = Signature::from_bytes(&sig_bytes);
        verifying_key.verify(data, &sig).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_restore() {
        let (identity, phrase) = Identity::generate();
        let restored = Identity::from_mnemonic(&phrase).unwrap();

        assert_eq!(
            identity.signing_public_key(),
            restored.signing_public_key()
        );
        assert_eq!(
            identity.encryption_public_key(),
            restored.encryption_public_key()
        );
        assert_eq!(identity.node_id(), restored.node_id());
    }

    #[test]
    fn derivation_is_deterministic() {
        let phrase = "abandon abandon abandon abandon abandon abandon abandon abandon \
                      abandon abandon abandon abandon abandon abandon abandon abandon \
                      abandon abandon abandon abandon abandon abandon abandon art";
        let a = Identity::from_mnemonic(phrase).unwrap();
        let b = Identity::from_mnemonic(phrase).unwrap();
        assert_eq!(a.signing_public_key(), b.signing_public_key());
        assert_eq!(a.encryption_public_key(), b.encryption_public_key());
    }

    #[test]
    fn signing_and_encryption_keys_differ() {
        let (identity, _) = Identity::generate();
        assert_ne!(
            identity.signing_public_key(),
            identity.encryption_public_key()
        );
    }

    #[test]
    fn wrong_word_count_rejected() {
        let result = Identity::from_mnemonic("abandon abandon art");
        assert!(matches!(result, Err(IdentityError::WrongWordCount(3))));
    }

    #[test]
    fn invalid_words_rejected() {
        let phrase = vec!["notaword"; MNEMONIC_WORDS].join(" ");
        let result = Identity::from_mnemonic(&phrase);
        assert!(matches!(result, Err(IdentityError::InvalidMnemonic(_))));
    }

    #[test]
    fn sign_verify_roundtrip() {
        let (identity, _) = Identity::generate();
        let data = b"attested bytes";
        let sig = identity.sign(data);

        assert!(Identity::verify(data, &sig, &identity.signing_public_key()));
        assert!(!Identity::verify(
            b"other bytes",
            &sig,
            &identity.signing_public_key()
        ));
    }

    #[test]
    fn seed_roundtrip() {
        let (identity, _) = Identity::generate();
        let restored = Identity::from_seed(identity.seed());
        assert_eq!(identity.node_id(), restored.node_id());
    }
}
