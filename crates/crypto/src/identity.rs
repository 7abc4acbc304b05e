//! Pseudonymous node identity
//!
//! A long-term signing keypair and encryption keypair plus a random
//! 128-bit pseudonym tag. Ephemeral subkeys are minted on demand with a
//! usage cap and an age cap; holders only ever see opaque handles, the key
//! material never leaves the identity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::keys::{sign_data, EncryptionKeypair, SigningKeypair};

/// Signatures allowed per ephemeral key
const EPHEMERAL_MAX_USES: u32 = 100;

/// Lifetime of an ephemeral key
const EPHEMERAL_MAX_AGE: Duration = Duration::from_secs(3600);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdentityError {
    #[error("unknown ephemeral key handle")]
    UnknownEphemeralKey,

    #[error("ephemeral key exceeded its usage or age cap")]
    EphemeralKeyExpired,
}

/// Opaque handle to an ephemeral subkey
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EphemeralHandle(u64);

struct EphemeralKey {
    keypair: SigningKeypair,
    created: Instant,
    uses: u32,
}

impl EphemeralKey {
    fn is_valid(&self, max_age: Duration) -> bool {
        self.uses <= EPHEMERAL_MAX_USES && self.created.elapsed() <= max_age
    }
}

/// Long-term node identity
pub struct Identity {
    signing: SigningKeypair,
    encryption: EncryptionKeypair,
    pseudonym: [u8; 16],
    ephemeral: Mutex<HashMap<u64, EphemeralKey>>,
    next_handle: AtomicU64,
    ephemeral_max_age: Duration,
}

impl Identity {
    /// Generate a fresh identity with a random pseudonym tag
    pub fn generate() -> Self {
        let mut pseudonym = [0u8; 16];
        OsRng.fill_bytes(&mut pseudonym);
        Self {
            signing: SigningKeypair::generate(),
            encryption: EncryptionKeypair::generate(),
            pseudonym,
            ephemeral: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            ephemeral_max_age: EPHEMERAL_MAX_AGE,
        }
    }

    #[cfg(test)]
    fn with_ephemeral_max_age(max_age: Duration) -> Self {
        Self {
            ephemeral_max_age: max_age,
            ..Self::generate()
        }
    }

    /// Pseudonym tag, 32 hex chars
    pub fn pseudonym(&self) -> String {
        hex::encode(self.pseudonym)
    }

    /// Long-term signing public key
    pub fn signing_public(&self) -> [u8; 32] {
        self.signing.public_key_bytes()
    }

    /// Long-term encryption public key, published for onion layers
    pub fn encryption_public(&self) -> [u8; 32] {
        self.encryption.public_key_bytes()
    }

    /// Long-term encryption secret, used to peel inbound onion layers
    pub fn encryption_secret(&self) -> [u8; 32] {
        self.encryption.secret_key_bytes()
    }

    /// Mint a fresh ephemeral signing key and return its handle
    pub fn new_ephemeral(&self) -> EphemeralHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let key = EphemeralKey {
            keypair: SigningKeypair::generate(),
            created: Instant::now(),
            uses: 0,
        };
        self.ephemeral
            .lock()
            .expect("ephemeral lock poisoned")
            .insert(handle, key);
        EphemeralHandle(handle)
    }

    /// Public key of an ephemeral subkey, for signature verification
    pub fn ephemeral_public(&self, handle: EphemeralHandle) -> Result<[u8; 32], IdentityError> {
        let keys = self.ephemeral.lock().expect("ephemeral lock poisoned");
        keys.get(&handle.0)
            .map(|k| k.keypair.public_key_bytes())
            .ok_or(IdentityError::UnknownEphemeralKey)
    }

    /// Sign the SHA-256 digest of `msg` with an ephemeral key.
    ///
    /// The use counter is incremented first; a key that violates its usage
    /// or age cap after the increment is destroyed and the call fails.
    pub fn sign(&self, msg: &[u8], handle: EphemeralHandle) -> Result<String, IdentityError> {
        let mut keys = self.ephemeral.lock().expect("ephemeral lock poisoned");
        let key = keys
            .get_mut(&handle.0)
            .ok_or(IdentityError::UnknownEphemeralKey)?;

        key.uses += 1;
        if !key.is_valid(self.ephemeral_max_age) {
            keys.remove(&handle.0);
            return Err(IdentityError::EphemeralKeyExpired);
        }

        let digest = Sha256::digest(msg);
        let signature = sign_data(&key.keypair, &digest);
        Ok(BASE64.encode(signature))
    }

    /// Prove knowledge of the pseudonym for a challenge
    pub fn prove(&self, challenge: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.pseudonym);
        hasher.update(challenge);
        hex::encode(hasher.finalize())
    }

    /// Check a pseudonym proof in constant time
    pub fn verify(proof: &str, challenge: &[u8], pseudonym: &str) -> bool {
        let Ok(pseudonym_bytes) = hex::decode(pseudonym) else {
            return false;
        };
        let mut hasher = Sha256::new();
        hasher.update(&pseudonym_bytes);
        hasher.update(challenge);
        let expected = hex::encode(hasher.finalize());
        if expected.len() != proof.len() {
            return false;
        }
        expected.as_bytes().ct_eq(proof.as_bytes()).into()
    }

    /// Number of live ephemeral keys
    pub fn ephemeral_count(&self) -> usize {
        self.ephemeral.lock().expect("ephemeral lock poisoned").len()
    }
}
