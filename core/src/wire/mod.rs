// Wire format — length-prefixed frames carrying hand-encoded messages
//
// Every length field is validated before any allocation happens; a frame
// or message that fails a bound check is dropped and the connection closed.

mod bytes;
mod frame;
mod message;

pub(crate) use bytes::{ByteReader, ByteWriter};
pub use frame::{read_frame, write_frame, MAX_FRAME_SIZE};
pub use message::{
    CircuitId, KademliaMessage, MessageBody, MessageId, NodeRecord, MAX_ERROR_LEN,
    MAX_NODES_PER_RESPONSE, MAX_ONION_PAYLOAD, MAX_STRING_LEN, MAX_VALUE_SIZE,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),
    #[error("truncated message")]
    Truncated,
    #[error("length field out of range: {field} = {value}")]
    LengthOutOfRange { field: &'static str, value: u64 },
    #[error("unknown message type tag {0:#04x}")]
    UnknownTypeTag(u8),
    #[error("invalid {0}")]
    InvalidField(&'static str),
    #[error("trailing bytes after message")]
    TrailingBytes,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
