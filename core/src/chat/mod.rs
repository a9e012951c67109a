// Chat layer — message type, outbound bookkeeping, and the facade

mod message;
mod pending;
mod service;

pub use message::ChatMessage;
pub use pending::{MessageStatus, PendingMessage, PendingTable};
pub use service::{ChatError, ChatEvents, ChatService, ChatStats};
