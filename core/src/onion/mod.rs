// Onion routing — layered encryption, padding, reply tokens, inbound dispatch

mod builder;
mod layer;
mod padding;
mod reply;
mod router;

pub use builder::{
    BuiltOnion, LayerKind, OnionBuilder, OnionLayerContent, RecipientPayload,
};
pub use layer::OnionLayer;
pub use padding::{pad, unpad};
pub use reply::{PreviousHop, ReplyPath, ReplyToken};
pub use router::{OfflineStore, OnionRouter, RouterEvents};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OnionError {
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("message of {size} bytes does not fit a {block} byte block")]
    MessageTooLarge { size: usize, block: usize },
    #[error("corrupt padding")]
    CorruptPadding,
    #[error("relay path is empty")]
    EmptyPath,
    #[error("peer has an invalid public key")]
    InvalidPeerKey,
    #[error("invalid next hop: {0}")]
    InvalidNextHop(&'static str),
    #[error("message signature verification failed")]
    BadSignature,
    #[error("unrecognized onion envelope")]
    UnknownEnvelope,
    #[error("malformed onion payload: {0}")]
    Malformed(#[from] crate::wire::WireError),
}
