//! Packet encryption for SRT.
//!
//! The session key is derived from a shared passphrase with PBKDF2-SHA256
//! and a salt exchanged during the handshake; payloads are encrypted with
//! AES in counter mode using an IV derived from the packet sequence number,
//! so no IV ever repeats under one key. Keys are rotated after a usage
//! threshold, with an even/odd parity flag on each packet selecting the key
//! at the receiver.

pub mod cipher;
pub mod keys;

pub use cipher::{CipherSession, CryptoStats, KeyParity};
pub use keys::{derive_key, generate_salt, CipherKind, KeyMaterial, SALT_LEN};

use thiserror::Error;

/// Crypto failures. Per-packet failures are absorbed by the caller (drop
/// and count); only configuration-level problems abort setup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("passphrase length {0} outside the accepted 10..=79 range")]
    PassphraseLength(usize),

    #[error("salt must be {SALT_LEN} bytes, got {0}")]
    SaltLength(usize),

    #[error("packet carries no-encryption flag on an encrypted session")]
    MissingKeyFlag,
}
