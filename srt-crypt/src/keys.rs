//! PBKDF2 key schedule.
//!
//! One passphrase and one handshake salt yield a deterministic sequence of
//! session keys k0, k1, ...: kN appends the 4-byte big-endian refresh index
//! to the salt, so both peers derive the same next key without any rekeying
//! exchange.

use crate::CryptoError;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

/// Salt length carried in the handshake encryption extension.
pub const SALT_LEN: usize = 16;

/// PBKDF2 iteration count.
pub const KDF_ROUNDS: u32 = 10_000;

/// AES key width for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherKind {
    Aes128,
    Aes192,
    #[default]
    Aes256,
}

impl CipherKind {
    /// Key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            CipherKind::Aes128 => 16,
            CipherKind::Aes192 => 24,
            CipherKind::Aes256 => 32,
        }
    }

    /// Wire value of the handshake encryption field (0 = off, 2 = on).
    pub fn wire_value(self) -> u16 {
        2
    }
}

/// A derived session key plus the inputs needed to derive its successors.
#[derive(Clone)]
pub struct KeyMaterial {
    pub kind: CipherKind,
    pub salt: [u8; SALT_LEN],
    /// Refresh index this key was derived with (0 for the initial key).
    pub index: u32,
    key: Vec<u8>,
}

impl KeyMaterial {
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Derives the key for the next refresh period.
    pub fn next(&self, passphrase: &str) -> Result<KeyMaterial, CryptoError> {
        derive_key_indexed(passphrase, &self.salt, self.kind, self.index + 1)
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // key bytes deliberately not printed
        f.debug_struct("KeyMaterial")
            .field("kind", &self.kind)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// Validates the passphrase length bound shared with the handshake.
pub fn check_passphrase(passphrase: &str) -> Result<(), CryptoError> {
    let len = passphrase.len();
    if !(10..=79).contains(&len) {
        return Err(CryptoError::PassphraseLength(len));
    }
    Ok(())
}

/// Fresh random salt for a listener that initiates key material.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derives the initial session key (refresh index 0).
pub fn derive_key(
    passphrase: &str,
    salt: &[u8],
    kind: CipherKind,
) -> Result<KeyMaterial, CryptoError> {
    derive_key_indexed(passphrase, salt, kind, 0)
}

fn derive_key_indexed(
    passphrase: &str,
    salt: &[u8],
    kind: CipherKind,
    index: u32,
) -> Result<KeyMaterial, CryptoError> {
    check_passphrase(passphrase)?;
    if salt.len() != SALT_LEN {
        return Err(CryptoError::SaltLength(salt.len()));
    }

    let mut salted = [0u8; SALT_LEN + 4];
    salted[..SALT_LEN].copy_from_slice(salt);
    salted[SALT_LEN..].copy_from_slice(&index.to_be_bytes());
    let kdf_salt = if index == 0 { salt } else { &salted[..] };

    let mut key = vec![0u8; kind.key_len()];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), kdf_salt, KDF_ROUNDS, &mut key);

    let mut salt_arr = [0u8; SALT_LEN];
    salt_arr.copy_from_slice(salt);
    Ok(KeyMaterial {
        kind,
        salt: salt_arr,
        index,
        key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASS: &str = "my_secret_passphrase";

    #[test]
    fn derivation_is_deterministic() {
        let salt = [7u8; SALT_LEN];
        let a = derive_key(PASS, &salt, CipherKind::Aes256).unwrap();
        let b = derive_key(PASS, &salt, CipherKind::Aes256).unwrap();
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().len(), 32);
    }

    #[test]
    fn key_length_tracks_cipher_kind() {
        let salt = [0u8; SALT_LEN];
        assert_eq!(derive_key(PASS, &salt, CipherKind::Aes128).unwrap().key().len(), 16);
        assert_eq!(derive_key(PASS, &salt, CipherKind::Aes192).unwrap().key().len(), 24);
    }

    #[test]
    fn refresh_changes_the_key() {
        let salt = [3u8; SALT_LEN];
        let k0 = derive_key(PASS, &salt, CipherKind::Aes256).unwrap();
        let k1 = k0.next(PASS).unwrap();
        assert_ne!(k0.key(), k1.key());
        assert_eq!(k1.index, 1);

        // both peers derive the same successor
        let k1_peer = derive_key(PASS, &salt, CipherKind::Aes256)
            .unwrap()
            .next(PASS)
            .unwrap();
        assert_eq!(k1.key(), k1_peer.key());
    }

    #[test]
    fn passphrase_bounds_enforced() {
        let salt = [0u8; SALT_LEN];
        assert_eq!(
            derive_key("short", &salt, CipherKind::Aes256).unwrap_err(),
            CryptoError::PassphraseLength(5)
        );
        let long = "x".repeat(80);
        assert_eq!(
            derive_key(&long, &salt, CipherKind::Aes256).unwrap_err(),
            CryptoError::PassphraseLength(80)
        );
    }

    #[test]
    fn bad_salt_rejected() {
        assert_eq!(
            derive_key(PASS, &[0u8; 8], CipherKind::Aes256).unwrap_err(),
            CryptoError::SaltLength(8)
        );
    }
}
