//! VeilNet DHT
//!
//! Kademlia-style routing and replicated storage over a JSON datagram
//! protocol: k-buckets under the XOR metric, parallel FIND_VALUE lookups
//! correlated by query id, and the NAT hole-punch handshake.

mod node;
mod routing;
mod storage;

pub use node::{DhtError, DhtNode, Result, FIND_VALUE_TIMEOUT, NAT_PUNCH_TIMEOUT};
pub use routing::RoutingTable;
pub use storage::{ValueStore, DEFAULT_TTL};
