// Passphrase-protected credential file
//
// Layout: magic (4) | version (1) | salt (16) | nonce (12) | ciphertext.
// Key: PBKDF2-HMAC-SHA256 over the passphrase, 600 000 rounds.
// Cipher: AES-256-GCM over the 64-byte identity seed.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::Sha256;
use std::path::{Path, PathBuf};
use zeroize::Zeroize;

use super::keys::{IdentityError, SEED_LEN};

const MAGIC: &[u8; 4] = b"HLID";
const VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const PBKDF2_ROUNDS: u32 = 600_000;
const MIN_PASSPHRASE_LEN: usize = 8;

/// Encrypted on-disk store for the identity seed.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Encrypt and persist the identity seed.
    pub fn save(&self, seed: &[u8; SEED_LEN], passphrase: &str) -> Result<(), IdentityError> {
        if passphrase.chars().count() < MIN_PASSPHRASE_LEN {
            return Err(IdentityError::PassphraseTooShort(MIN_PASSPHRASE_LEN));
        }

        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let mut key = derive_key(passphrase, &salt);
        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|_| IdentityError::CredentialFormat)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), seed.as_slice())
            .map_err(|_| IdentityError::CredentialFormat)?;
        key.zeroize();

        let mut blob = Vec::with_capacity(4 + 1 + SALT_LEN + NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(MAGIC);
        blob.push(VERSION);
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, &blob)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600));
        }

        Ok(())
    }

    /// Load and decrypt the identity seed.
    pub fn load(&self, passphrase: &str) -> Result<[u8; SEED_LEN], IdentityError> {
        if passphrase.chars().count() < MIN_PASSPHRASE_LEN {
            return Err(IdentityError::PassphraseTooShort(MIN_PASSPHRASE_LEN));
        }

        let blob = std::fs::read(&self.path)?;
        if blob.len() < 4 + 1 + SALT_LEN + NONCE_LEN || &blob[..4] != MAGIC || blob[4] != VERSION {
            return Err(IdentityError::CredentialFormat);
        }

        let salt = &blob[5..5 + SALT_LEN];
        let nonce = &blob[5 + SALT_LEN..5 + SALT_LEN + NONCE_LEN];
        let ciphertext = &blob[5 + SALT_LEN + NONCE_LEN..];

        let mut key = derive_key(passphrase, salt);
        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|_| IdentityError::CredentialFormat)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| IdentityError::DecryptFailed)?;
        key.zeroize();

        let seed: [u8; SEED_LEN] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::CredentialFormat)?;
        Ok(seed)
    }
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use tempfile::tempdir;

    #[test]
    fn save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("identity.cred"));
        let (identity, _) = Identity::generate();

        store.save(identity.seed(), "correct horse battery").unwrap();
        assert!(store.exists());

        let seed = store.load("correct horse battery").unwrap();
        let restored = Identity::from_seed(&seed);
        assert_eq!(identity.node_id(), restored.node_id());
    }

    #[test]
    fn wrong_passphrase_fails() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("identity.cred"));
        let (identity, _) = Identity::generate();

        store.save(identity.seed(), "correct horse battery").unwrap();
        let result = store.load("incorrect horse battery");
        assert!(matches!(result, Err(IdentityError::DecryptFailed)));
    }

    #[test]
    fn short_passphrase_rejected() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("identity.cred"));
        let (identity, _) = Identity::generate();

        let result = store.save(identity.seed(), "short");
        assert!(matches!(result, Err(IdentityError::PassphraseTooShort(_))));
    }

    #[test]
    fn tampered_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.cred");
        let store = CredentialStore::new(&path);
        let (identity, _) = Identity::generate();

        store.save(identity.seed(), "correct horse battery").unwrap();

        let mut blob = std::fs::read(&path).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        std::fs::write(&path, &blob).unwrap();

        let result = store.load("correct horse battery");
        assert!(matches!(result, Err(IdentityError::DecryptFailed)));
    }
}
