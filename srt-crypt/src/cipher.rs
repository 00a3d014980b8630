//! AES-CTR packet cipher with key rotation.
//!
//! The counter-mode IV is the 4-byte big-endian packet sequence number
//! followed by 12 zero bytes. Sequence numbers are unique per transmitted
//! packet, so the (key, IV) pair never repeats inside one refresh period.
//! Rotation keeps the previous key alive until a streak of packets under
//! the new key shows the transition is over, letting in-flight packets
//! from the old period still decrypt.

use crate::keys::KeyMaterial;
use crate::CryptoError;
use ctr::cipher::{KeyIvInit, StreamCipher};
use tracing::debug;

type Ctr128Aes128 = ctr::Ctr128BE<aes::Aes128>;
type Ctr128Aes192 = ctr::Ctr128BE<aes::Aes192>;
type Ctr128Aes256 = ctr::Ctr128BE<aes::Aes256>;

/// Consecutive packets under the active key before the previous key is
/// retired. The parity flag is one bit, so a retired key's parity gets
/// reused two refresh periods later; the streak bound keeps the slots
/// unambiguous long before that.
const OVERLAP_STREAK: u64 = 4096;

/// Which of the two rotating key slots a packet was encrypted under.
///
/// Wire encoding (the KK field of the data header) is owned by the packet
/// codec; this type only names the parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyParity {
    Even,
    Odd,
}

impl KeyParity {
    fn of_index(index: u32) -> Self {
        if index % 2 == 0 {
            KeyParity::Even
        } else {
            KeyParity::Odd
        }
    }
}

/// Counters kept by the cipher session. Monotone non-decreasing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CryptoStats {
    pub packets_encrypted: u64,
    pub packets_decrypted: u64,
    pub decrypt_failures: u64,
    pub key_refreshes: u64,
}

impl CryptoStats {
    pub fn as_map(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("crypto.packets_encrypted", self.packets_encrypted),
            ("crypto.packets_decrypted", self.packets_decrypted),
            ("crypto.decrypt_failures", self.decrypt_failures),
            ("crypto.key_refreshes", self.key_refreshes),
        ]
    }
}

/// One end's encryption state: active key, lingering previous key, usage
/// accounting and the refresh threshold.
pub struct CipherSession {
    passphrase: String,
    active: KeyMaterial,
    previous: Option<KeyMaterial>,
    /// Packets encrypted under the active key (drives sender rotation).
    sent_under_active: u64,
    /// Consecutive packets decrypted under the active key (drives
    /// previous-key retirement).
    recv_streak: u64,
    refresh_after: u64,
    stats: CryptoStats,
}

impl CipherSession {
    /// `refresh_after` is the per-key packet budget before rotation.
    pub fn new(passphrase: String, initial: KeyMaterial, refresh_after: u64) -> Self {
        CipherSession {
            passphrase,
            active: initial,
            previous: None,
            sent_under_active: 0,
            recv_streak: 0,
            refresh_after,
            stats: CryptoStats::default(),
        }
    }

    /// Parity the next encrypted packet will carry.
    pub fn active_parity(&self) -> KeyParity {
        KeyParity::of_index(self.active.index)
    }

    pub fn stats(&self) -> CryptoStats {
        self.stats
    }

    /// Encrypts `payload` in place; same length out as in. Returns the
    /// parity to stamp into the packet's key flag.
    pub fn encrypt(&mut self, seq_raw: u32, payload: &mut [u8]) -> Result<KeyParity, CryptoError> {
        if self.sent_under_active >= self.refresh_after {
            self.rotate()?;
        }
        apply_keystream(&self.active, seq_raw, payload);
        self.sent_under_active += 1;
        self.stats.packets_encrypted += 1;
        Ok(self.active_parity())
    }

    /// Decrypts `payload` in place, selecting the key by the packet's
    /// parity flag. Follows the peer forward when it has rotated.
    pub fn decrypt(
        &mut self,
        seq_raw: u32,
        parity: KeyParity,
        payload: &mut [u8],
    ) -> Result<(), CryptoError> {
        if parity == self.active_parity() {
            apply_keystream(&self.active, seq_raw, payload);
            self.recv_streak += 1;
            if self.recv_streak > OVERLAP_STREAK {
                self.previous = None;
            }
        } else if let Some(prev) = self
            .previous
            .as_ref()
            .filter(|prev| KeyParity::of_index(prev.index) == parity)
        {
            // straggler from the previous refresh period
            apply_keystream(prev, seq_raw, payload);
        } else {
            // the peer rotated first; derive its new key and follow
            self.rotate()?;
            apply_keystream(&self.active, seq_raw, payload);
            self.recv_streak = 1;
        }
        self.stats.packets_decrypted += 1;
        Ok(())
    }

    /// Counts a decrypt failure signalled by the caller (e.g. a cleartext
    /// packet on an encrypted session).
    pub fn note_failure(&mut self) {
        self.stats.decrypt_failures += 1;
    }

    fn rotate(&mut self) -> Result<(), CryptoError> {
        let next = self.active.next(&self.passphrase)?;
        debug!(index = next.index, "rotating session key");
        self.previous = Some(std::mem::replace(&mut self.active, next));
        self.sent_under_active = 0;
        self.recv_streak = 0;
        self.stats.key_refreshes += 1;
        Ok(())
    }
}

fn apply_keystream(key: &KeyMaterial, seq_raw: u32, payload: &mut [u8]) {
    let mut iv = [0u8; 16];
    iv[..4].copy_from_slice(&seq_raw.to_be_bytes());

    // key length is fixed by CipherKind and the IV is always 16 bytes
    match key.key().len() {
        16 => Ctr128Aes128::new_from_slices(key.key(), &iv)
            .expect("aes-128 key length")
            .apply_keystream(payload),
        24 => Ctr128Aes192::new_from_slices(key.key(), &iv)
            .expect("aes-192 key length")
            .apply_keystream(payload),
        _ => Ctr128Aes256::new_from_slices(key.key(), &iv)
            .expect("aes-256 key length")
            .apply_keystream(payload),
    }
}
