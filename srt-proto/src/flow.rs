//! Flow control: the three admission gates in front of the wire.
//!
//! A packet may leave only when (1) the local send window has room, (2)
//! the token bucket holds enough credit for its bytes, and (3) the peer's
//! advertised receive window is not exhausted. Denials are returned, never
//! blocked on; the caller re-arms a timer and retries.

use std::time::Instant;
use thiserror::Error;

/// Which gate refused the packet.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDenial {
    #[error("send window full")]
    WindowFull,

    #[error("token bucket empty, rate limited")]
    RateLimited,

    #[error("peer receive window exhausted")]
    PeerWindowFull,
}

/// Byte-rate pacing bucket.
///
/// Credit refills continuously at `fill_rate` bytes per second up to one
/// eighth of a second of rate. A full bucket admits even a packet larger
/// than its capacity, leaving the level in debt; this keeps oversized
/// packets flowing at low configured rates instead of wedging forever.
#[derive(Debug, Clone)]
struct TokenBucket {
    capacity: f64,
    fill_rate: f64,
    level: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_bps: u64, now: Instant) -> Self {
        let fill_rate = rate_bps as f64 / 8.0;
        let capacity = fill_rate / 8.0;
        TokenBucket {
            capacity,
            fill_rate,
            level: capacity,
            last_refill: now,
        }
    }

    fn set_rate(&mut self, rate_bps: u64, now: Instant) {
        self.refill(now);
        self.fill_rate = rate_bps as f64 / 8.0;
        self.capacity = self.fill_rate / 8.0;
        self.level = self.level.min(self.capacity);
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.level = (self.level + elapsed * self.fill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self, bytes: usize, now: Instant) -> bool {
        self.refill(now);
        if self.level >= (bytes as f64).min(self.capacity) {
            self.level -= bytes as f64;
            true
        } else {
            false
        }
    }

    /// Seconds until `bytes` worth of credit accrues.
    fn time_until(&mut self, bytes: usize, now: Instant) -> f64 {
        self.refill(now);
        let need = (bytes as f64).min(self.capacity) - self.level;
        if need <= 0.0 {
            0.0
        } else {
            need / self.fill_rate
        }
    }
}

/// Counters exposed by the flow controller. Monotone non-decreasing
/// except `utilisation`, which is instantaneous.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowStats {
    pub packets_admitted: u64,
    pub bytes_admitted: u64,
    pub rate_limited: u64,
    pub window_full: u64,
    pub peer_window_full: u64,
    pub utilisation: f64,
}

impl FlowStats {
    pub fn as_map(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("flow.packets_admitted", self.packets_admitted),
            ("flow.bytes_admitted", self.bytes_admitted),
            ("flow.rate_limited", self.rate_limited),
            ("flow.window_full", self.window_full),
            ("flow.peer_window_full", self.peer_window_full),
            ("flow.utilisation_pct", (self.utilisation * 100.0) as u64),
        ]
    }
}

pub struct FlowController {
    send_window: u32,
    peer_recv_window: u32,
    in_flight: u32,
    bucket: TokenBucket,
    rate_bps: u64,
    stats: FlowStats,
}

impl FlowController {
    pub fn new(send_window: u32, peer_recv_window: u32, rate_bps: u64, now: Instant) -> Self {
        FlowController {
            send_window,
            peer_recv_window,
            in_flight: 0,
            bucket: TokenBucket::new(rate_bps, now),
            rate_bps,
            stats: FlowStats::default(),
        }
    }

    /// Runs all three gates; on success the packet's bytes are charged and
    /// it counts as in flight.
    pub fn admit(&mut self, packet_bytes: usize, now: Instant) -> Result<(), FlowDenial> {
        if self.in_flight >= self.send_window {
            self.stats.window_full += 1;
            return Err(FlowDenial::WindowFull);
        }
        if self.in_flight >= self.peer_recv_window {
            self.stats.peer_window_full += 1;
            return Err(FlowDenial::PeerWindowFull);
        }
        if !self.bucket.try_consume(packet_bytes, now) {
            self.stats.rate_limited += 1;
            return Err(FlowDenial::RateLimited);
        }
        self.in_flight += 1;
        self.stats.packets_admitted += 1;
        self.stats.bytes_admitted += packet_bytes as u64;
        Ok(())
    }

    /// Retransmissions are paced but do not re-enter the window count
    /// (their sequence is already in flight).
    pub fn admit_retransmit(&mut self, packet_bytes: usize, now: Instant) -> Result<(), FlowDenial> {
        if !self.bucket.try_consume(packet_bytes, now) {
            self.stats.rate_limited += 1;
            return Err(FlowDenial::RateLimited);
        }
        self.stats.bytes_admitted += packet_bytes as u64;
        Ok(())
    }

    /// Cumulative ACK released `acked` packets from flight.
    pub fn on_acked(&mut self, acked: u32) {
        self.in_flight = self.in_flight.saturating_sub(acked);
    }

    /// A packet was abandoned (retransmission cap or TTL); it no longer
    /// occupies the window.
    pub fn on_abandoned(&mut self, count: u32) {
        self.in_flight = self.in_flight.saturating_sub(count);
    }

    /// Loss feedback: multiplicative rate decrease, bucket re-tuned.
    pub fn on_loss(&mut self, now: Instant) {
        self.rate_bps = ((self.rate_bps as f64 * 0.875) as u64).max(1);
        self.bucket.set_rate(self.rate_bps, now);
    }

    /// Adopts the congestion controller's current rate.
    pub fn set_rate(&mut self, rate_bps: u64, now: Instant) {
        self.rate_bps = rate_bps;
        self.bucket.set_rate(rate_bps, now);
    }

    pub fn update_peer_window(&mut self, packets: u32) {
        self.peer_recv_window = packets;
    }

    /// Adopts a new send-window size (from the RTT estimator's
    /// bandwidth-delay sizing).
    pub fn set_send_window(&mut self, packets: u32) {
        self.send_window = packets.max(1);
    }

    pub fn send_window(&self) -> u32 {
        self.send_window
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    pub fn rate_bps(&self) -> u64 {
        self.rate_bps
    }

    /// Delay until the bucket could admit `packet_bytes`, for timer
    /// re-arming after a [`FlowDenial::RateLimited`].
    pub fn pacing_delay(&mut self, packet_bytes: usize, now: Instant) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.bucket.time_until(packet_bytes, now))
    }

    pub fn stats(&self) -> FlowStats {
        FlowStats {
            utilisation: if self.send_window > 0 {
                self.in_flight as f64 / self.send_window as f64
            } else {
                0.0
            },
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn controller(rate_bps: u64) -> (FlowController, Instant) {
        let now = Instant::now();
        (FlowController::new(8, 8, rate_bps, now), now)
    }

    #[test]
    fn admits_until_window_full() {
        let (mut flow, now) = controller(8_000_000);
        for _ in 0..8 {
            flow.admit(100, now).unwrap();
        }
        assert_eq!(flow.admit(100, now), Err(FlowDenial::WindowFull));
        assert_eq!(flow.stats().window_full, 1);

        flow.on_acked(3);
        assert!(flow.admit(100, now).is_ok());
    }

    #[test]
    fn peer_window_caps_flight() {
        let (mut flow, now) = controller(8_000_000);
        flow.update_peer_window(2);
        flow.admit(100, now).unwrap();
        flow.admit(100, now).unwrap();
        assert_eq!(flow.admit(100, now), Err(FlowDenial::PeerWindowFull));
        assert_eq!(flow.stats().peer_window_full, 1);
    }

    #[test]
    fn full_bucket_admits_oversized_packet_once() {
        // 8000 bps = 1000 bytes/s fill, 125-byte capacity
        let (mut flow, now) = controller(8_000);
        assert!(flow.admit(2_000, now).is_ok());
        assert_eq!(flow.admit(2_000, now), Err(FlowDenial::RateLimited));
        assert_eq!(flow.stats().rate_limited, 1);
    }

    #[test]
    fn bucket_refills_over_time() {
        let (mut flow, now) = controller(8_000); // 1000 bytes/s
        flow.admit(125, now).unwrap();
        assert_eq!(flow.admit(100, now), Err(FlowDenial::RateLimited));

        let later = now + Duration::from_millis(200); // +200 bytes
        assert!(flow.admit(100, later).is_ok());
    }

    #[test]
    fn pacing_delay_estimates_refill() {
        let (mut flow, now) = controller(8_000); // 1000 bytes/s, cap 125
        flow.admit(125, now).unwrap();
        let wait = flow.pacing_delay(100, now);
        assert!(wait > Duration::from_millis(90) && wait <= Duration::from_millis(110));
    }

    #[test]
    fn loss_decays_rate() {
        let (mut flow, now) = controller(1_000_000);
        flow.on_loss(now);
        assert_eq!(flow.rate_bps(), 875_000);
    }

    #[test]
    fn retransmit_skips_window_but_not_bucket() {
        let (mut flow, now) = controller(8_000_000);
        for _ in 0..8 {
            flow.admit(100, now).unwrap();
        }
        // window is full, yet a retransmit may still pass the bucket
        assert!(flow.admit_retransmit(100, now).is_ok());
        assert_eq!(flow.in_flight(), 8);
    }

    #[test]
    fn utilisation_tracks_flight() {
        let (mut flow, now) = controller(8_000_000);
        flow.admit(100, now).unwrap();
        flow.admit(100, now).unwrap();
        assert!((flow.stats().utilisation - 0.25).abs() < 1e-9);
    }
}
