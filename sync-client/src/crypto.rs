//! Pairing-key cryptography for Clipmesh.
//!
//! This module provides:
//! - HKDF-SHA256 derivation of a pairing key from a one-time token
//! - XChaCha20-Poly1305 sealing of a public key into a [`SealedKey`]
//!
//! # Security Notes
//!
//! - XChaCha20 uses 192-bit nonces (24 bytes), safe for random generation
//! - The tag is carried detached from the ciphertext on the wire
//! - Key material is zeroized on drop and never printed

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    Tag, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use sync_types::SealedKey;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce size for XChaCha20-Poly1305 (192 bits = 24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Key size for XChaCha20-Poly1305 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// Authentication tag size (128 bits = 16 bytes).
pub const TAG_SIZE: usize = 16;

const PAIRING_INFO: &[u8] = b"pairing";

/// Crypto errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication error).
    #[error("decryption failed: authentication error")]
    DecryptionFailed,

    /// A sealed field was not valid base64.
    #[error("invalid base64 in {field}")]
    InvalidEncoding {
        /// Which field.
        field: &'static str,
    },

    /// A sealed field had the wrong length.
    #[error("invalid {field} length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Which field.
        field: &'static str,
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),
}

/// Symmetric key shared by both ends of a pairing, derived from the token.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PairingKey {
    key: [u8; KEY_SIZE],
}

impl PairingKey {
    /// Derive the key from a pairing token.
    ///
    /// HKDF-SHA256 with an empty salt and info `"pairing"`.
    pub fn derive(token: &str) -> Result<Self, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(None, token.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        hkdf.expand(PAIRING_INFO, &mut key)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        Ok(Self { key })
    }

    /// Encrypt `plaintext` under a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedKey, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let cipher = XChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(XNonce::from_slice(&nonce_bytes), b"", &mut buffer)
            .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()))?;

        Ok(SealedKey {
            iv: STANDARD.encode(nonce_bytes),
            ciphertext: STANDARD.encode(&buffer),
            tag: STANDARD.encode(tag),
        })
    }

    /// Decrypt and authenticate a [`SealedKey`].
    pub fn open(&self, sealed: &SealedKey) -> Result<Vec<u8>, CryptoError> {
        let nonce = decode_exact("iv", &sealed.iv, NONCE_SIZE)?;
        let tag = decode_exact("tag", &sealed.tag, TAG_SIZE)?;
        let mut buffer = STANDARD
            .decode(&sealed.ciphertext)
            .map_err(|_| CryptoError::InvalidEncoding {
                field: "ciphertext",
            })?;

        let cipher = XChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        cipher
            .decrypt_in_place_detached(
                XNonce::from_slice(&nonce),
                b"",
                &mut buffer,
                Tag::from_slice(&tag),
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;
        Ok(buffer)
    }
}

fn decode_exact(field: &'static str, value: &str, expected: usize) -> Result<Vec<u8>, CryptoError> {
    let bytes = STANDARD
        .decode(value)
        .map_err(|_| CryptoError::InvalidEncoding { field })?;
    if bytes.len() != expected {
        return Err(CryptoError::InvalidLength {
            field,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

// Don't leak keys in debug output
impl std::fmt::Debug for PairingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PairingKey {{ key: [REDACTED] }}")
    }
}
