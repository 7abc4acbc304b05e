//! VeilNet Cryptography
//!
//! Keypairs, sealed-box public-key encryption, the pseudonymous node
//! identity, and onion envelope construction.

mod encrypt;
mod identity;
mod keys;
mod onion;

pub use encrypt::*;
pub use identity::*;
pub use keys::*;
pub use onion::*;
