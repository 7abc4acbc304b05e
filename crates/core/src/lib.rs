//! VeilNet Core Types
//!
//! This crate defines the fundamental data structures shared by the
//! routing, crypto, and overlay crates: 160-bit identifiers with the XOR
//! metric, wire frames for both transports, and node configuration.

mod config;
mod error;
mod types;
mod wire;

pub use config::*;
pub use error::*;
pub use types::*;
pub use wire::*;
