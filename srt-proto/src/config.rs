//! Connection configuration.
//!
//! Validated once at construction; the engines trust these values
//! afterwards. File-format handling lives with the tools, not here.

use crate::packet::HEADER_LEN;
use srt_crypt::CipherKind;
use std::time::Duration;
use thiserror::Error;

/// Application-facing knobs of one connection.
#[derive(Debug, Clone)]
pub struct SrtConfig {
    /// Cipher suite; `None` disables encryption.
    pub encryption: Option<CipherKind>,
    /// Required when `encryption` is set; 10..=79 characters.
    pub passphrase: Option<String>,
    /// TSBPD playback delay, 20..=8000 ms.
    pub playback_delay_ms: u32,
    /// Maximum segment size including the SRT header, 76..=65536.
    pub mss_bytes: usize,
    /// Pacing ceiling, at least 80 kbit/s.
    pub max_bandwidth_bps: u64,
    pub initial_send_window_packets: u32,
    pub initial_recv_window_packets: u32,
    /// Packets per session key before a refresh, at least 1000.
    pub key_refresh_packets: u64,
    /// Cumulative ACK every this many accepted packets.
    pub ack_frequency_packets: u32,
    pub retransmit_timeout_min_us: u64,
    pub retransmit_timeout_max_us: u64,
    /// Retransmissions per packet before it is abandoned.
    pub max_retransmits: u32,
}

impl Default for SrtConfig {
    fn default() -> Self {
        SrtConfig {
            encryption: None,
            passphrase: None,
            playback_delay_ms: 120,
            mss_bytes: 1500,
            max_bandwidth_bps: 1_000_000,
            initial_send_window_packets: 8192,
            initial_recv_window_packets: 8192,
            key_refresh_packets: 1_000_000,
            ack_frequency_packets: 10,
            retransmit_timeout_min_us: 1_000,
            retransmit_timeout_max_us: 60_000_000,
            max_retransmits: 5,
        }
    }
}

impl SrtConfig {
    /// Checks every range constraint; a valid config is immutable truth
    /// for the rest of the stack.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encryption.is_some() {
            match &self.passphrase {
                None => return Err(ConfigError::PassphraseRequired),
                Some(p) if !(10..=79).contains(&p.len()) => {
                    return Err(ConfigError::PassphraseLength(p.len()))
                }
                _ => {}
            }
        }
        if !(20..=8000).contains(&self.playback_delay_ms) {
            return Err(ConfigError::Range {
                field: "playback_delay_ms",
                value: self.playback_delay_ms as u64,
                lo: 20,
                hi: 8000,
            });
        }
        if !(76..=65536).contains(&self.mss_bytes) {
            return Err(ConfigError::Range {
                field: "mss_bytes",
                value: self.mss_bytes as u64,
                lo: 76,
                hi: 65536,
            });
        }
        if self.max_bandwidth_bps < 80_000 {
            return Err(ConfigError::Range {
                field: "max_bandwidth_bps",
                value: self.max_bandwidth_bps,
                lo: 80_000,
                hi: u64::MAX,
            });
        }
        if self.initial_send_window_packets == 0 {
            return Err(ConfigError::Zero("initial_send_window_packets"));
        }
        if self.initial_recv_window_packets == 0 {
            return Err(ConfigError::Zero("initial_recv_window_packets"));
        }
        if self.key_refresh_packets < 1000 {
            return Err(ConfigError::Range {
                field: "key_refresh_packets",
                value: self.key_refresh_packets,
                lo: 1000,
                hi: u64::MAX,
            });
        }
        if self.ack_frequency_packets == 0 {
            return Err(ConfigError::Zero("ack_frequency_packets"));
        }
        if self.max_retransmits == 0 {
            return Err(ConfigError::Zero("max_retransmits"));
        }
        if self.retransmit_timeout_min_us > self.retransmit_timeout_max_us {
            return Err(ConfigError::RtoBounds {
                min: self.retransmit_timeout_min_us,
                max: self.retransmit_timeout_max_us,
            });
        }
        Ok(())
    }

    /// Payload budget per data packet.
    pub fn max_payload(&self) -> usize {
        self.mss_bytes - HEADER_LEN
    }

    pub fn playback_delay(&self) -> Duration {
        Duration::from_millis(self.playback_delay_ms as u64)
    }

    pub fn rto_min(&self) -> Duration {
        Duration::from_micros(self.retransmit_timeout_min_us)
    }

    pub fn rto_max(&self) -> Duration {
        Duration::from_micros(self.retransmit_timeout_max_us)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("encryption enabled but no passphrase given")]
    PassphraseRequired,

    #[error("passphrase length {0} outside 10..=79")]
    PassphraseLength(usize),

    #[error("{field} = {value} outside {lo}..={hi}")]
    Range {
        field: &'static str,
        value: u64,
        lo: u64,
        hi: u64,
    },

    #[error("{0} must be at least 1")]
    Zero(&'static str),

    #[error("retransmit timeout bounds inverted: min {min} > max {max}")]
    RtoBounds { min: u64, max: u64 },
}
