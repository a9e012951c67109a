// Signed user key record — the DHT value published under hash(username)
//
// Layout: enc_pk_len (1) | enc_pk | sign_pk_len (1) | sign_pk |
//         timestamp (i64 LE) | has_signature (1) [| sig_len (1) | signature]
// The signature covers everything before has_signature.

use crate::identity::Identity;
use crate::wire::{ByteReader, ByteWriter, WireError};

const MAX_KEY_LEN: usize = 32;
const MAX_SIG_LEN: usize = 64;

/// Resolves a username to the owner's long-term public keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserKeyRecord {
    pub encryption_public_key: Vec<u8>,
    pub signing_public_key: Vec<u8>,
    pub timestamp: i64,
    pub signature: Option<Vec<u8>>,
}

impl UserKeyRecord {
    /// Build and sign a record for the local identity.
    pub fn signed(identity: &Identity, timestamp: i64) -> Self {
        let mut record = Self {
            encryption_public_key: identity.encryption_public_key().to_vec(),
            signing_public_key: identity.signing_public_key().to_vec(),
            timestamp,
            signature: None,
        };
        let signable = record.signable_bytes().expect("fixed-size keys encode");
        record.signature = Some(identity.sign(&signable).to_vec());
        record
    }

    /// The byte range covered by the signature.
    pub fn signable_bytes(&self) -> Result<Vec<u8>, WireError> {
        let mut writer = ByteWriter::with_capacity(2 + MAX_KEY_LEN * 2 + 8);
        writer.put_u8_prefixed(&self.encryption_public_key)?;
        writer.put_u8_prefixed(&self.signing_public_key)?;
        writer.put_i64_le(self.timestamp);
        Ok(writer.into_bytes())
    }

    pub fn serialize(&self) -> Result<Vec<u8>, WireError> {
        if self.encryption_public_key.len() > MAX_KEY_LEN
            || self.signing_public_key.len() > MAX_KEY_LEN
        {
            return Err(WireError::InvalidField("record public key"));
        }
        let mut writer = ByteWriter::new();
        writer.put_bytes(&self.signable_bytes()?);
        match &self.signature {
            Some(signature) => {
                writer.put_bool(true);
                if signature.len() > MAX_SIG_LEN {
                    return Err(WireError::InvalidField("record signature"));
                }
                writer.put_u8_prefixed(signature)?;
            }
            None => writer.put_bool(false),
        }
        Ok(writer.into_bytes())
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = ByteReader::new(bytes);
        let encryption_public_key = reader.take_u8_prefixed(MAX_KEY_LEN)?.to_vec();
        let signing_public_key = reader.take_u8_prefixed(MAX_KEY_LEN)?.to_vec();
        let timestamp = reader.take_i64_le()?;
        let signature = if reader.take_bool()? {
            Some(reader.take_u8_prefixed(MAX_SIG_LEN)?.to_vec())
        } else {
            None
        };
        reader.finish()?;
        Ok(Self {
            encryption_public_key,
            signing_public_key,
            timestamp,
            signature,
        })
    }

    /// True when the record carries a valid signature over its signable
    /// bytes. Unsigned records verify as false.
    pub fn verify_signature(&self) -> bool {
        let Some(signature) = &self.signature else {
            return false;
        };
        let Ok(signable) = self.signable_bytes() else {
            return false;
        };
        Identity::verify(&signable, signature, &self.signing_public_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_record_roundtrip_verifies() {
        let (identity, _) = Identity::generate();
        let record = UserKeyRecord::signed(&identity, 1_700_000_000);

        let bytes = record.serialize().unwrap();
        let decoded = UserKeyRecord::deserialize(&bytes).unwrap();

        assert_eq!(record, decoded);
        assert!(decoded.verify_signature());
    }

    #[test]
    fn tampered_timestamp_fails_verification() {
        let (identity, _) = Identity::generate();
        let mut record = UserKeyRecord::signed(&identity, 1_700_000_000);

        record.timestamp += 1;
        assert!(!record.verify_signature());
    }

    #[test]
    fn tampered_key_fails_verification() {
        let (identity, _) = Identity::generate();
        let mut record = UserKeyRecord::signed(&identity, 1_700_000_000);

        record.encryption_public_key[0] ^= 0xff;
        assert!(!record.verify_signature());
    }

    #[test]
    fn unsigned_record_does_not_verify() {
        let (identity, _) = Identity::generate();
        let record = UserKeyRecord {
            encryption_public_key: identity.encryption_public_key().to_vec(),
            signing_public_key: identity.signing_public_key().to_vec(),
            timestamp: 0,
            signature: None,
        };
        assert!(!record.verify_signature());

        let bytes = record.serialize().unwrap();
        let decoded = UserKeyRecord::deserialize(&bytes).unwrap();
        assert_eq!(decoded.signature, None);
    }

    #[test]
    fn garbage_bytes_rejected() {
        assert!(UserKeyRecord::deserialize(&[0xff; 8]).is_err());
        assert!(UserKeyRecord::deserialize(&[]).is_err());
    }
}
