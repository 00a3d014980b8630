//! Round-trip time estimation (RFC 6298) and link-quality scoring.

use std::collections::VecDeque;
use std::time::Duration;

const ALPHA: f64 = 0.125;
const BETA: f64 = 0.25;
const HISTORY_CAP: usize = 100;

/// Coarse link quality derived from RTT statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkCondition {
    /// No samples yet.
    Unknown,
    Excellent,
    Good,
    Fair,
    Poor,
    Terrible,
}

impl NetworkCondition {
    /// Window-scaling factor applied to the bandwidth-delay product.
    fn window_factor(self) -> f64 {
        match self {
            NetworkCondition::Excellent => 1.5,
            NetworkCondition::Good => 1.2,
            NetworkCondition::Unknown | NetworkCondition::Fair => 1.0,
            NetworkCondition::Poor => 0.8,
            NetworkCondition::Terrible => 0.5,
        }
    }
}

/// Smoothed round-trip state fed by ACK echo samples.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    current_us: f64,
    srtt_us: f64,
    rttvar_us: f64,
    min_us: f64,
    max_us: f64,
    samples: u64,
    history_us: VecDeque<f64>,
    rto_min: Duration,
    rto_max: Duration,
}

impl RttEstimator {
    pub fn new(rto_min: Duration, rto_max: Duration) -> Self {
        RttEstimator {
            current_us: 0.0,
            srtt_us: 0.0,
            rttvar_us: 0.0,
            min_us: f64::INFINITY,
            max_us: 0.0,
            samples: 0,
            history_us: VecDeque::with_capacity(HISTORY_CAP),
            rto_min,
            rto_max,
        }
    }

    /// Feeds one measured round trip.
    pub fn record(&mut self, rtt: Duration) {
        let r = rtt.as_micros() as f64;
        self.current_us = r;
        self.min_us = self.min_us.min(r);
        self.max_us = self.max_us.max(r);

        if self.samples == 0 {
            self.srtt_us = r;
            self.rttvar_us = r / 2.0;
        } else {
            self.rttvar_us = (1.0 - BETA) * self.rttvar_us + BETA * (self.srtt_us - r).abs();
            self.srtt_us = (1.0 - ALPHA) * self.srtt_us + ALPHA * r;
        }
        self.samples += 1;

        if self.history_us.len() == HISTORY_CAP {
            self.history_us.pop_front();
        }
        self.history_us.push_back(r);
    }

    pub fn has_sample(&self) -> bool {
        self.samples > 0
    }

    pub fn smoothed(&self) -> Duration {
        Duration::from_micros(self.srtt_us as u64)
    }

    pub fn variation(&self) -> Duration {
        Duration::from_micros(self.rttvar_us as u64)
    }

    pub fn latest(&self) -> Duration {
        Duration::from_micros(self.current_us as u64)
    }

    pub fn min(&self) -> Duration {
        if self.min_us.is_finite() {
            Duration::from_micros(self.min_us as u64)
        } else {
            Duration::ZERO
        }
    }

    pub fn max(&self) -> Duration {
        Duration::from_micros(self.max_us as u64)
    }

    /// Smoothed RTT in microseconds, for rate arithmetic.
    pub fn smoothed_us(&self) -> f64 {
        self.srtt_us
    }

    /// `clamp(SRTT + max(1ms, 4·RTTVAR))` within the configured bounds.
    pub fn rto(&self) -> Duration {
        if self.samples == 0 {
            // conservative pre-sample default: 100 ms within bounds
            return Duration::from_millis(100).clamp(self.rto_min, self.rto_max);
        }
        let var_term = (4.0 * self.rttvar_us).max(1_000.0);
        Duration::from_micros((self.srtt_us + var_term) as u64).clamp(self.rto_min, self.rto_max)
    }

    /// Mean absolute difference of successive samples in the history.
    pub fn jitter(&self) -> Duration {
        if self.history_us.len() < 2 {
            return Duration::ZERO;
        }
        let diffs: f64 = self
            .history_us
            .iter()
            .zip(self.history_us.iter().skip(1))
            .map(|(a, b)| (b - a).abs())
            .sum();
        Duration::from_micros((diffs / (self.history_us.len() - 1) as f64) as u64)
    }

    /// RTTVAR relative to SRTT; 0 before the first sample.
    pub fn variability(&self) -> f64 {
        if self.srtt_us > 0.0 {
            self.rttvar_us / self.srtt_us
        } else {
            0.0
        }
    }

    pub fn condition(&self) -> NetworkCondition {
        if self.samples == 0 {
            return NetworkCondition::Unknown;
        }
        let srtt_ms = self.srtt_us / 1_000.0;
        let jitter_ms = self.jitter().as_micros() as f64 / 1_000.0;
        let var = self.variability();

        if srtt_ms < 20.0 && jitter_ms < 2.0 && var < 0.1 {
            NetworkCondition::Excellent
        } else if srtt_ms < 50.0 && jitter_ms < 5.0 && var < 0.2 {
            NetworkCondition::Good
        } else if srtt_ms < 100.0 && jitter_ms < 10.0 && var < 0.3 {
            NetworkCondition::Fair
        } else if srtt_ms < 200.0 && jitter_ms < 20.0 && var < 0.5 {
            NetworkCondition::Poor
        } else {
            NetworkCondition::Terrible
        }
    }

    /// 0..=100 steadiness score; 50 until ten samples exist.
    pub fn stability_score(&self) -> f64 {
        if self.samples < 10 {
            return 50.0;
        }
        let jitter_ms = self.jitter().as_micros() as f64 / 1_000.0;
        let jitter_score = (100.0 - jitter_ms * 10.0).max(0.0);
        let var_score = (100.0 - self.variability() * 200.0).max(0.0);
        (jitter_score + var_score) / 2.0
    }

    /// Window suggestion in packets from the bandwidth-delay product,
    /// scaled by the condition factor and clamped to [1, 65536].
    pub fn suggested_window(&self, bandwidth_bps: u64) -> u32 {
        let bdp_packets = bandwidth_bps as f64 * self.srtt_us / (8.0 * 1500.0 * 1e6);
        let scaled = bdp_packets * self.condition().window_factor();
        scaled.clamp(1.0, 65536.0) as u32
    }
}
