// Identity — deterministic key derivation from a mnemonic passphrase

mod keys;
mod store;

pub use keys::{Identity, IdentityError, MNEMONIC_WORDS, SEED_LEN};
pub use store::CredentialStore;
