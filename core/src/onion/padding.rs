// Fixed-block padding
//
// Every chat payload travels as one block: a 4-byte big-endian length
// prefix, the message, and a tail of cryptographically random bytes, so
// every delivery is size-indistinguishable.

use rand::RngCore;

use super::OnionError;

const LENGTH_PREFIX: usize = 4;

/// Pad `message` to exactly `block_size` bytes.
pub fn pad(message: &[u8], block_size: usize) -> Result<Vec<u8>, OnionError> {
    if message.len() > block_size - LENGTH_PREFIX {
        return Err(OnionError::MessageTooLarge {
            size: message.len(),
            block: block_size,
        });
    }

    let mut block = vec![0u8; block_size];
    block[..LENGTH_PREFIX].copy_from_slice(&(message.len() as u32).to_be_bytes());
    block[LENGTH_PREFIX..LENGTH_PREFIX + message.len()].copy_from_slice(message);
    rand::rngs::OsRng.fill_bytes(&mut block[LENGTH_PREFIX + message.len()..]);
    Ok(block)
}

/// Recover the original message from a padded block. A length prefix that
/// does not fit the block is treated as corruption.
pub fn unpad(block: &[u8]) -> Result<Vec<u8>, OnionError> {
    if block.len() < LENGTH_PREFIX {
        return Err(OnionError::CorruptPadding);
    }
    let len = u32::from_be_bytes([block[0], block[1], block[2], block[3]]) as usize;
    if len > block.len() - LENGTH_PREFIX {
        return Err(OnionError::CorruptPadding);
    }
    Ok(block[LENGTH_PREFIX..LENGTH_PREFIX + len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BLOCK: usize = 16 * 1024;

    #[test]
    fn padded_block_has_exact_size() {
        let padded = pad(b"Hello, World!", BLOCK).unwrap();
        assert_eq!(padded.len(), BLOCK);
    }

    #[test]
    fn roundtrip() {
        let message = b"a short message";
        assert_eq!(unpad(&pad(message, BLOCK).unwrap()).unwrap(), message);
    }

    #[test]
    fn empty_message_roundtrip() {
        assert!(unpad(&pad(b"", BLOCK).unwrap()).unwrap().is_empty());
    }

    #[test]
    fn largest_fitting_message_roundtrip() {
        let message = vec![0xabu8; BLOCK - 4];
        assert_eq!(unpad(&pad(&message, BLOCK).unwrap()).unwrap(), message);
    }

    #[test]
    fn oversized_message_rejected() {
        let message = vec![0u8; BLOCK - 3];
        assert!(matches!(
            pad(&message, BLOCK),
            Err(OnionError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn corrupt_length_prefix_rejected() {
        let mut padded = pad(b"payload", BLOCK).unwrap();
        padded[0] = 0xff;
        assert!(matches!(unpad(&padded), Err(OnionError::CorruptPadding)));
    }

    #[test]
    fn short_block_rejected() {
        assert!(unpad(&[0, 0]).is_err());
    }

    #[test]
    fn tails_differ_between_blocks() {
        let a = pad(b"same message", BLOCK).unwrap();
        let b = pad(b"same message", BLOCK).unwrap();
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn roundtrip_any_message(message in proptest::collection::vec(any::<u8>(), 0..=BLOCK - 4)) {
            let padded = pad(&message, BLOCK).unwrap();
            prop_assert_eq!(padded.len(), BLOCK);
            prop_assert_eq!(unpad(&padded).unwrap(), message);
        }
    }
}
