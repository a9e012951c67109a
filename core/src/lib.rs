// hushlink core — peer-to-peer encrypted messaging substrate
//
// Kademlia discovery and storage, onion-wrapped delivery with an anonymous
// reply channel, relay fallback for NATed peers, and mnemonic-derived
// identities. Front-ends compose everything through `ChatService`.

pub mod chat;
pub mod config;
pub mod dht;
pub mod identity;
pub mod net;
pub mod onion;
pub mod relay;
pub mod wire;

pub use chat::{ChatError, ChatEvents, ChatMessage, ChatService, MessageStatus};
pub use config::CoreConfig;
pub use dht::{DhtNode, NodeId, UserKeyRecord};
pub use identity::{CredentialStore, Identity, IdentityError};
pub use wire::MessageId;
