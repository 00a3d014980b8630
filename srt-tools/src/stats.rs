//! Human-readable rendering of connection counters.

use srt_live::StatsSnapshot;

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

pub fn format_bandwidth(bps: u64) -> String {
    const UNITS: [&str; 4] = ["bps", "kbps", "Mbps", "Gbps"];
    let mut value = bps as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bps} bps")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// One-line periodic stats summary.
pub fn display_stats(stats: &StatsSnapshot) -> String {
    let rate = stats
        .congestion
        .as_ref()
        .map(|c| c.sending_rate_bps)
        .unwrap_or(0);
    format!(
        "tx {} ({} pkts, {} rexmit) | rx {} ({} pkts, {} dup) | rate {} | late drops {}",
        format_bytes(stats.conn.bytes_sent),
        stats.conn.data_packets_sent,
        stats.send.packets_retransmitted,
        format_bytes(stats.conn.bytes_received),
        stats.conn.data_packets_received,
        stats.recv.duplicates,
        format_bandwidth(rate),
        stats.tsbpd.dropped_late,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_scale() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn bandwidth_scale() {
        assert_eq!(format_bandwidth(800), "800 bps");
        assert_eq!(format_bandwidth(1_500_000), "1.5 Mbps");
    }

    #[test]
    fn summary_mentions_core_counters() {
        let line = display_stats(&StatsSnapshot::default());
        assert!(line.contains("tx"));
        assert!(line.contains("rx"));
    }
}
