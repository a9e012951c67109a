// Network plumbing shared by the DHT server and the onion router

mod connection;
mod rate_limit;

pub use connection::{
    CircuitDialer, ConnectionManager, ConnectionStats, FrameHandler, NetError, PeerConn,
};
pub use rate_limit::RateLimiter;

pub(crate) use connection::{one_shot_request, push_frame};
