//! VeilNet Overlay
//!
//! The overlay node: stream peer set, inbound mixing queue, cover
//! traffic, circuit assembly over the DHT, and dispatch between the
//! identity, routing, and onion layers.

mod circuit;
mod mixer;
mod node;
mod peers;

pub use circuit::{relay_record_key, Circuit, OnionEngine, RelayRecord, Resolver};
pub use mixer::{MixedFrame, Mixer};
pub use node::{NodeEvent, OverlayNode};
pub use peers::{PeerHandle, PeerSet};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("routing error: {0}")]
    Dht(#[from] veilnet_dht::DhtError),

    #[error("onion error: {0}")]
    Onion(#[from] veilnet_crypto::OnionError),

    #[error("frame encoding failed: {0}")]
    Encode(#[from] veilnet_core::WireError),

    #[error("no relay candidates could be resolved")]
    NoRelays,

    #[error("unknown circuit")]
    UnknownCircuit,
}

pub type Result<T> = std::result::Result<T, OverlayError>;
