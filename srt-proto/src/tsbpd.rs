//! Time-stamp-based packet delivery.
//!
//! Reassembled payloads are released to the application at
//! `origin time + playback delay`, translated onto the local clock via the
//! first observed packet (base wall time and base timestamp). Packets past
//! their slot are dropped rather than delivered late; packets absurdly far
//! in the future are treated as clock errors and dropped too.

use crate::sequence::SeqNumber;
use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Disposition of one enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// Release slot already passed.
    DroppedLate,
    /// Release slot further out than 10 playback delays.
    DroppedEarly,
}

/// Counters of the scheduler. Monotone non-decreasing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TsbpdStats {
    pub delivered: u64,
    pub dropped_late: u64,
    pub dropped_early: u64,
    pub drift_updates: u64,
    /// Smoothed lateness between scheduled and actual release, microseconds.
    pub avg_delivery_delay_us: u64,
    pub max_delivery_delay_us: u64,
}

impl TsbpdStats {
    pub fn as_map(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("tsbpd.delivered", self.delivered),
            ("tsbpd.dropped_late", self.dropped_late),
            ("tsbpd.dropped_early", self.dropped_early),
            ("tsbpd.drift_updates", self.drift_updates),
            ("tsbpd.avg_delivery_delay_us", self.avg_delivery_delay_us),
            ("tsbpd.max_delivery_delay_us", self.max_delivery_delay_us),
        ]
    }
}

struct Slot {
    release_at: Instant,
    seq: SeqNumber,
    payload: Bytes,
}

// Min-heap on (release_at, seq).
impl Ord for Slot {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .release_at
            .cmp(&self.release_at)
            .then_with(|| other.seq.raw().cmp(&self.seq.raw()))
    }
}

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        self.release_at == other.release_at && self.seq == other.seq
    }
}

impl Eq for Slot {}

/// The delivery scheduler for one receiving connection.
pub struct TsbpdScheduler {
    playback_delay: Duration,
    drop_late: bool,
    /// Wall clock at the first observed packet of the current base epoch.
    base_wall: Option<Instant>,
    /// That packet's 32-bit origin timestamp.
    base_timestamp: u32,
    /// Externally measured clock drift, parts per million.
    drift_ppm: f64,
    /// Externally measured constant offset between the clocks.
    clock_offset: Duration,
    queue: BinaryHeap<Slot>,
    stats: TsbpdStats,
}

impl TsbpdScheduler {
    pub fn new(playback_delay: Duration, drop_late: bool) -> Self {
        TsbpdScheduler {
            playback_delay,
            drop_late,
            base_wall: None,
            base_timestamp: 0,
            drift_ppm: 0.0,
            clock_offset: Duration::ZERO,
            queue: BinaryHeap::new(),
            stats: TsbpdStats::default(),
        }
    }

    /// Feeds external drift measurements (e.g. from ACK timing analysis).
    pub fn set_drift(&mut self, drift_ppm: f64, clock_offset: Duration) {
        self.drift_ppm = drift_ppm;
        self.clock_offset = clock_offset;
        self.stats.drift_updates += 1;
    }

    /// Drops everything queued and re-anchors the base on the next packet.
    /// Used on timestamp wrap or forced resync.
    pub fn reset_base(&mut self) {
        warn!(queued = self.queue.len(), "tsbpd base reset");
        self.queue.clear();
        self.base_wall = None;
    }

    /// Schedules one reassembled payload. `timestamp` is the origin
    /// timestamp of the message's first packet.
    pub fn enqueue(
        &mut self,
        seq: SeqNumber,
        timestamp: u32,
        payload: Bytes,
        now: Instant,
    ) -> Enqueue {
        let base_wall = *self.base_wall.get_or_insert_with(|| {
            self.base_timestamp = timestamp;
            now
        });

        // Signed offset from the base timestamp; two's complement keeps
        // packets slightly older than the base negative across wrap.
        let offset_us = timestamp.wrapping_sub(self.base_timestamp) as i32 as i64;
        let drift_us = offset_us as f64 * self.drift_ppm * 1e-6;
        let total_us = offset_us + drift_us as i64;

        let from_base = if total_us >= 0 {
            base_wall + Duration::from_micros(total_us as u64)
        } else {
            base_wall - Duration::from_micros(total_us.unsigned_abs())
        };
        let release_at = from_base + self.clock_offset + self.playback_delay;

        if self.drop_late && release_at < now {
            self.stats.dropped_late += 1;
            trace!(%seq, "too late for its delivery slot, dropped");
            return Enqueue::DroppedLate;
        }
        if release_at > now + 10 * self.playback_delay {
            self.stats.dropped_early += 1;
            warn!(%seq, "release slot implausibly far ahead, dropped");
            return Enqueue::DroppedEarly;
        }

        self.queue.push(Slot {
            release_at,
            seq,
            payload,
        });
        Enqueue::Queued
    }

    /// Pops every payload whose slot has arrived, in slot order.
    pub fn release(&mut self, now: Instant) -> Vec<(SeqNumber, Bytes)> {
        let mut out = Vec::new();
        while let Some(head) = self.queue.peek() {
            if head.release_at > now {
                break;
            }
            let slot = self.queue.pop().expect("peeked entry exists");
            let lateness = now.saturating_duration_since(slot.release_at);
            self.note_delivery(lateness);
            out.push((slot.seq, slot.payload));
        }
        out
    }

    /// Deadline of the earliest queued payload.
    pub fn next_release(&self) -> Option<Instant> {
        self.queue.peek().map(|slot| slot.release_at)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> TsbpdStats {
        self.stats
    }

    fn note_delivery(&mut self, lateness: Duration) {
        let late_us = lateness.as_micros() as u64;
        self.stats.delivered += 1;
        self.stats.max_delivery_delay_us = self.stats.max_delivery_delay_us.max(late_us);
        // EWMA, 1/8 weight on the newest observation
        self.stats.avg_delivery_delay_us =
            (self.stats.avg_delivery_delay_us * 7 + late_us) / 8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(120);

    fn scheduler() -> TsbpdScheduler {
        TsbpdScheduler::new(DELAY, true)
    }

    fn seq(n: u32) -> SeqNumber {
        SeqNumber::new(n)
    }

    #[test]
    fn first_packet_anchors_base_and_waits_playback_delay() {
        let mut ts = scheduler();
        let now = Instant::now();
        assert_eq!(
            ts.enqueue(seq(1), 1_000_000, Bytes::from_static(b"a"), now),
            Enqueue::Queued
        );
        assert_eq!(ts.next_release(), Some(now + DELAY));

        assert!(ts.release(now).is_empty());
        let released = ts.release(now + DELAY);
        assert_eq!(released.len(), 1);
        assert_eq!(&released[0].1[..], b"a");
    }

    #[test]
    fn release_order_follows_origin_time_not_arrival() {
        let mut ts = scheduler();
        let now = Instant::now();
        ts.enqueue(seq(10), 5_000, Bytes::from_static(b"later"), now);
        ts.enqueue(seq(9), 1_000, Bytes::from_static(b"sooner"), now);

        let released = ts.release(now + DELAY + Duration::from_millis(10));
        let order: Vec<&[u8]> = released.iter().map(|(_, p)| &p[..]).collect();
        assert_eq!(order, vec![&b"sooner"[..], &b"later"[..]]);
    }

    #[test]
    fn too_late_packet_dropped_and_counted() {
        let mut ts = scheduler();
        let now = Instant::now();
        ts.enqueue(seq(1), 2_000_000, Bytes::from_static(b"base"), now);

        // a packet stamped a full second before the base arrives much later
        let outcome = ts.enqueue(
            seq(2),
            1_000_000,
            Bytes::from_static(b"stale"),
            now + Duration::from_millis(10),
        );
        assert_eq!(outcome, Enqueue::DroppedLate);
        assert_eq!(ts.stats().dropped_late, 1);
        assert_eq!(ts.queued(), 1);
    }

    #[test]
    fn implausibly_early_packet_dropped() {
        let mut ts = scheduler();
        let now = Instant::now();
        ts.enqueue(seq(1), 0, Bytes::from_static(b"base"), now);

        // stamped ten seconds ahead of the base: beyond 10x playback delay
        let outcome = ts.enqueue(seq(2), 10_000_000, Bytes::from_static(b"future"), now);
        assert_eq!(outcome, Enqueue::DroppedEarly);
        assert_eq!(ts.stats().dropped_early, 1);
    }

    #[test]
    fn late_delivery_when_drop_disabled() {
        let mut ts = TsbpdScheduler::new(DELAY, false);
        let now = Instant::now();
        ts.enqueue(seq(1), 2_000_000, Bytes::from_static(b"base"), now);
        let outcome = ts.enqueue(
            seq(2),
            1_000_000,
            Bytes::from_static(b"stale"),
            now + Duration::from_millis(10),
        );
        assert_eq!(outcome, Enqueue::Queued);

        let released = ts.release(now + Duration::from_millis(10));
        assert_eq!(released.len(), 1);
        assert_eq!(ts.stats().delivered, 1);
    }

    #[test]
    fn drift_correction_shifts_release() {
        let mut ts = scheduler();
        let now = Instant::now();
        ts.enqueue(seq(1), 0, Bytes::from_static(b"base"), now);

        // +1000 ppm over a 100 ms span stretches it by 100 us
        ts.set_drift(1000.0, Duration::ZERO);
        ts.enqueue(seq(2), 100_000, Bytes::from_static(b"drifted"), now);

        let expected = now + Duration::from_micros(100_000 + 100) + DELAY;
        assert_eq!(ts.next_release(), Some(now + DELAY)); // base packet first
        ts.release(now + DELAY);
        assert_eq!(ts.next_release(), Some(expected));
        assert_eq!(ts.stats().drift_updates, 1);
    }

    #[test]
    fn reset_clears_queue_and_reanchors() {
        let mut ts = scheduler();
        let now = Instant::now();
        ts.enqueue(seq(1), 500_000, Bytes::from_static(b"a"), now);
        ts.reset_base();
        assert_eq!(ts.queued(), 0);

        // next packet becomes the new base regardless of its timestamp
        let later = now + Duration::from_secs(5);
        ts.enqueue(seq(2), 42, Bytes::from_static(b"b"), later);
        assert_eq!(ts.next_release(), Some(later + DELAY));
    }

    #[test]
    fn timestamp_wrap_handled_by_signed_offset() {
        let mut ts = scheduler();
        let now = Instant::now();
        ts.enqueue(seq(1), u32::MAX - 50_000, Bytes::from_static(b"pre-wrap"), now);

        // 100 ms later in origin time, but the counter wrapped
        let outcome = ts.enqueue(seq(2), 49_999, Bytes::from_static(b"post-wrap"), now);
        assert_eq!(outcome, Enqueue::Queued);
        ts.release(now + DELAY);
        assert_eq!(
            ts.next_release(),
            Some(now + Duration::from_micros(100_000) + DELAY)
        );
    }
}
