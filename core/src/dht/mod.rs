// Kademlia DHT — identifiers, routing, storage, and the RPC node

mod kbucket;
mod node;
mod node_id;
mod record;
mod routing_table;
mod storage;

pub use kbucket::{AddOutcome, KBucket, KademliaNode};
pub use node::{DhtError, DhtNode, DhtStats, OnionSink, RelaySink};
pub use node_id::{Distance, NodeId, NODE_ID_LEN};
pub use record::UserKeyRecord;
pub use routing_table::RoutingTable;
pub use storage::{Storage, StorageStats};

pub(crate) use kbucket::unix_now;
