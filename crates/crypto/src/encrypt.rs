//! Sealed-box public-key encryption
//!
//! X25519 ECDH with a fresh ephemeral key per message, SHA-256 key
//! derivation, ChaCha20-Poly1305 AEAD. Wire layout:
//! `[ephemeral_pubkey: 32][nonce: 12][ciphertext]`.
//! Only the holder of the recipient secret can recover the plaintext; the
//! sender is not authenticated.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::keys::{hash, EncryptionKeypair};

/// Ephemeral pubkey prefix plus AEAD nonce
const SEALED_OVERHEAD: usize = 32 + 12;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SealError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid key")]
    InvalidKey,
    #[error("Ciphertext too short")]
    CiphertextTooShort,
}

/// Encrypt to a recipient's public key with a fresh ephemeral key
pub fn seal(recipient_pubkey: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
    let ephemeral = EncryptionKeypair::generate();
    let shared_secret = ephemeral.diffie_hellman(recipient_pubkey);
    let symmetric_key = hash(&shared_secret);

    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher =
        ChaCha20Poly1305::new_from_slice(&symmetric_key).map_err(|_| SealError::InvalidKey)?;

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| SealError::EncryptionFailed)?;

    let mut result = Vec::with_capacity(SEALED_OVERHEAD + ciphertext.len());
    result.extend_from_slice(&ephemeral.public_key_bytes());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);

    Ok(result)
}

/// Decrypt a sealed box with the recipient's secret key
pub fn open(recipient_secret: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, SealError> {
    if sealed.len() < SEALED_OVERHEAD {
        return Err(SealError::CiphertextTooShort);
    }

    let ephemeral_pubkey: [u8; 32] = sealed[..32].try_into().map_err(|_| SealError::InvalidKey)?;
    let nonce = Nonce::from_slice(&sealed[32..44]);
    let ciphertext = &sealed[44..];

    let recipient_secret = StaticSecret::from(*recipient_secret);
    let ephemeral_public = PublicKey::from(ephemeral_pubkey);
    let shared_secret = recipient_secret.diffie_hellman(&ephemeral_public);
    let symmetric_key = hash(shared_secret.as_bytes());

    let cipher =
        ChaCha20Poly1305::new_from_slice(&symmetric_key).map_err(|_| SealError::InvalidKey)?;

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| SealError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let recipient = EncryptionKeypair::generate();
        let plaintext = b"layered envelope";

        let sealed = seal(&recipient.public_key_bytes(), plaintext).unwrap();
        let opened = open(&recipient.secret_key_bytes(), &sealed).unwrap();

        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_fresh_ephemeral_per_seal() {
        let recipient = EncryptionKeypair::generate();

        let a = seal(&recipient.public_key_bytes(), b"same").unwrap();
        let b = seal(&recipient.public_key_bytes(), b"same").unwrap();

        // Different ephemeral keys and nonces, no ciphertext correlation
        assert_ne!(a, b);
        assert_ne!(a[..32], b[..32]);
    }

    #[test]
    fn test_wrong_secret_fails() {
        let recipient = EncryptionKeypair::generate();
        let wrong = EncryptionKeypair::generate();

        let sealed = seal(&recipient.public_key_bytes(), b"secret").unwrap();
        let result = open(&wrong.secret_key_bytes(), &sealed);

        assert_eq!(result, Err(SealError::DecryptionFailed));
    }

    #[test]
    fn test_too_short_input() {
        let recipient = EncryptionKeypair::generate();
        assert_eq!(
            open(&recipient.secret_key_bytes(), &[0u8; 10]),
            Err(SealError::CiphertextTooShort)
        );
        assert_eq!(
            open(&recipient.secret_key_bytes(), &[]),
            Err(SealError::CiphertextTooShort)
        );
    }

    #[test]
    fn test_corrupted_ciphertext_fails() {
        let recipient = EncryptionKeypair::generate();
        let mut sealed = seal(&recipient.public_key_bytes(), b"payload").unwrap();

        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;

        assert_eq!(
            open(&recipient.secret_key_bytes(), &sealed),
            Err(SealError::DecryptionFailed)
        );
    }

    #[test]
    fn test_corrupted_ephemeral_pubkey_fails() {
        let recipient = EncryptionKeypair::generate();
        let mut sealed = seal(&recipient.public_key_bytes(), b"payload").unwrap();

        sealed[0] ^= 0xFF;

        assert_eq!(
            open(&recipient.secret_key_bytes(), &sealed),
            Err(SealError::DecryptionFailed)
        );
    }

    #[test]
    fn test_empty_plaintext() {
        let recipient = EncryptionKeypair::generate();
        let sealed = seal(&recipient.public_key_bytes(), b"").unwrap();
        let opened = open(&recipient.secret_key_bytes(), &sealed).unwrap();
        assert!(opened.is_empty());
        // pubkey + nonce + auth tag only
        assert_eq!(sealed.len(), SEALED_OVERHEAD + 16);
    }
}
