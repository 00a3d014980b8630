//! AIMD congestion control with slow start.
//!
//! The window is real-valued in packets. Growth is one packet per ACK in
//! slow start and 1/cwnd per ACK in congestion avoidance; any loss event
//! halves the threshold and multiplies the window by 0.875 (a gentler
//! decrease than halving, tuned for live streams that cannot ride out a
//! deep rate dip).

use std::time::Instant;
use tracing::debug;

const DECREASE_FACTOR: f64 = 0.875;

/// Loss-rate bands for the observability label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossCondition {
    Excellent,
    Good,
    Fair,
    Poor,
}

/// Tunables of the controller.
#[derive(Debug, Clone)]
pub struct CongestionConfig {
    pub initial_cwnd: f64,
    pub initial_ssthresh: f64,
    pub mss_bytes: usize,
    pub min_rate_bps: u64,
    pub max_rate_bps: u64,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        CongestionConfig {
            initial_cwnd: 2.0,
            initial_ssthresh: 65_536.0 / 1500.0,
            mss_bytes: 1500,
            min_rate_bps: 80_000,
            max_rate_bps: 800_000_000,
        }
    }
}

/// Snapshot of the controller state.
#[derive(Debug, Clone, Copy)]
pub struct CongestionStats {
    pub cwnd: f64,
    pub ssthresh: f64,
    pub in_slow_start: bool,
    pub loss_rate: f64,
    pub packets_sent: u64,
    pub packets_lost: u64,
    pub sending_rate_bps: u64,
}

impl CongestionStats {
    pub fn as_map(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("congestion.cwnd_packets", self.cwnd as u64),
            ("congestion.ssthresh_packets", self.ssthresh as u64),
            ("congestion.in_slow_start", self.in_slow_start as u64),
            ("congestion.packets_sent", self.packets_sent),
            ("congestion.packets_lost", self.packets_lost),
            ("congestion.sending_rate_bps", self.sending_rate_bps),
        ]
    }
}

pub struct CongestionController {
    config: CongestionConfig,
    cwnd: f64,
    ssthresh: f64,
    in_slow_start: bool,
    sent: u64,
    lost: u64,
    sending_rate_bps: u64,
    last_loss_at: Option<Instant>,
}

impl CongestionController {
    pub fn new(config: CongestionConfig) -> Self {
        let sending_rate_bps = config.min_rate_bps;
        CongestionController {
            cwnd: config.initial_cwnd,
            ssthresh: config.initial_ssthresh,
            in_slow_start: true,
            sent: 0,
            lost: 0,
            sending_rate_bps,
            last_loss_at: None,
            config,
        }
    }

    /// Window in packets; admission allows `in_flight < cwnd`.
    pub fn window(&self) -> f64 {
        self.cwnd
    }

    pub fn in_slow_start(&self) -> bool {
        self.in_slow_start
    }

    /// True when another packet fits the congestion window.
    pub fn admits(&self, in_flight: u32) -> bool {
        (in_flight as f64) < self.cwnd
    }

    pub fn on_packet_sent(&mut self) {
        self.sent += 1;
    }

    /// One cumulative ACK arrived; `srtt_us` refreshes the rate estimate.
    pub fn on_ack(&mut self, srtt_us: f64) {
        if self.in_slow_start {
            self.cwnd += 1.0;
            if self.cwnd >= self.ssthresh {
                self.in_slow_start = false;
                debug!(cwnd = self.cwnd, "slow start complete");
            }
        } else {
            self.cwnd += 1.0 / self.cwnd;
        }
        self.refresh_rate(srtt_us);
    }

    /// A loss event: NAK entries or a retransmission timeout.
    pub fn on_loss(&mut self, lost_packets: u32, now: Instant) {
        self.lost += lost_packets as u64;
        self.in_slow_start = false;
        self.ssthresh = self.cwnd / 2.0;
        self.cwnd = (self.cwnd * DECREASE_FACTOR).max(1.0);
        self.last_loss_at = Some(now);
        debug!(
            lost = lost_packets,
            cwnd = self.cwnd,
            ssthresh = self.ssthresh,
            "congestion decrease"
        );
    }

    /// `cwnd · MSS · 8 · 1e6 / max(SRTT, 1 ms)`, clamped to the rate bounds.
    fn refresh_rate(&mut self, srtt_us: f64) {
        let srtt = srtt_us.max(1_000.0);
        let rate = self.cwnd * self.config.mss_bytes as f64 * 8.0 * 1e6 / srtt;
        self.sending_rate_bps =
            (rate as u64).clamp(self.config.min_rate_bps, self.config.max_rate_bps);
    }

    pub fn sending_rate_bps(&self) -> u64 {
        self.sending_rate_bps
    }

    pub fn loss_rate(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.lost as f64 / self.sent as f64
        }
    }

    pub fn condition(&self) -> LossCondition {
        let rate = self.loss_rate();
        if rate < 0.01 {
            LossCondition::Excellent
        } else if rate < 0.05 {
            LossCondition::Good
        } else if rate < 0.10 {
            LossCondition::Fair
        } else {
            LossCondition::Poor
        }
    }

    pub fn last_loss_at(&self) -> Option<Instant> {
        self.last_loss_at
    }

    pub fn stats(&self) -> CongestionStats {
        CongestionStats {
            cwnd: self.cwnd,
            ssthresh: self.ssthresh,
            in_slow_start: self.in_slow_start,
            loss_rate: self.loss_rate(),
            packets_sent: self.sent,
            packets_lost: self.lost,
            sending_rate_bps: self.sending_rate_bps,
        }
    }
}
