//! # Transfer Statistics
//!
//! Per-product and aggregate counters for both endpoints. Everything is
//! `Serialize` so daemons can export JSON snapshots.

use serde::Serialize;

// ─── Per-Product Stats ──────────────────────────────────────────────────────

/// Counters for a single product transfer, kept by both endpoints.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProductTransferStats {
    /// Packets sent/received on the multicast path.
    pub mcast_packets: u64,
    /// Payload bytes on the multicast path.
    pub mcast_bytes: u64,
    /// Packets sent/received on the retransmission path.
    pub retx_packets: u64,
    /// Payload bytes on the retransmission path.
    pub retx_bytes: u64,
    /// Seconds the multicast phase took.
    pub mcast_secs: f64,
}

// ─── Sender Stats ───────────────────────────────────────────────────────────

/// Aggregate sender-side statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    /// Products fully multicast.
    pub products_sent: u64,
    /// Products released because every receiver acknowledged repair.
    pub products_completed: u64,
    /// Products released by deadline expiry.
    pub products_expired: u64,
    /// Multicast DATA packets sent.
    pub packets_sent: u64,
    /// Multicast payload bytes sent.
    pub bytes_sent: u64,
    /// Retransmitted packets sent over back-channels.
    pub retrans_packets: u64,
    /// Retransmitted payload bytes.
    pub retrans_bytes: u64,
}

impl SenderStats {
    /// Retransmission overhead ratio.
    pub fn retrans_ratio(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.retrans_packets as f64 / self.packets_sent as f64
        }
    }
}

// ─── Receiver Stats ─────────────────────────────────────────────────────────

/// Aggregate receiver-side statistics, covering every product since start
/// (or the last reset).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    /// Products whose BOP was accepted.
    pub products_started: u64,
    /// Products fully assembled and delivered.
    pub products_received: u64,
    /// Products that ended in a missed notification.
    pub products_failed: u64,
    /// DATA packets taken from the multicast path.
    pub mcast_packets: u64,
    /// Multicast payload bytes written.
    pub mcast_bytes: u64,
    /// RETRANS_DATA packets taken from the back-channel.
    pub retx_packets: u64,
    /// Retransmitted payload bytes written.
    pub retx_bytes: u64,
    /// Late or duplicate DATA packets discarded.
    pub duplicates: u64,
    /// DATA packets dropped by the loss injector.
    pub simulated_drops: u64,
    /// Per-product history lines for HISTORY_STATS reports.
    #[serde(skip)]
    pub history: Vec<String>,
}

impl ReceiverStats {
    /// Fraction of delivered packets that needed the repair path.
    pub fn retrans_ratio(&self) -> f64 {
        let total = self.mcast_packets + self.retx_packets;
        if total == 0 {
            0.0
        } else {
            self.retx_packets as f64 / total as f64
        }
    }

    /// Fraction of started products that completed.
    pub fn robustness(&self) -> f64 {
        if self.products_started == 0 {
            1.0
        } else {
            self.products_received as f64 / self.products_started as f64
        }
    }

    /// Append one product's history record:
    /// `product_id,size,mcast_secs,retx_bytes,ok`.
    pub fn record_product(&mut self, product_id: u32, size: u32, stats: &ProductTransferStats, ok: bool) {
        self.history.push(format!(
            "{},{},{:.5},{},{}",
            product_id,
            size,
            stats.mcast_secs,
            stats.retx_bytes,
            u8::from(ok),
        ));
    }

    /// Render the accumulated history report for a HISTORY_STATS packet.
    pub fn history_report(&self) -> String {
        self.history.join("\n")
    }

    /// Reset all counters and drop the history.
    pub fn reset(&mut self) {
        *self = ReceiverStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratios_handle_zero_counts() {
        let s = SenderStats::default();
        assert_eq!(s.retrans_ratio(), 0.0);
        let r = ReceiverStats::default();
        assert_eq!(r.retrans_ratio(), 0.0);
        assert_eq!(r.robustness(), 1.0);
    }

    #[test]
    fn history_report_lines() {
        let mut r = ReceiverStats::default();
        let p = ProductTransferStats {
            mcast_secs: 0.25,
            retx_bytes: 1024,
            ..Default::default()
        };
        r.record_product(3, 65536, &p, true);
        r.record_product(4, 100, &ProductTransferStats::default(), false);
        let report = r.history_report();
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "3,65536,0.25000,1024,1");
        assert!(lines[1].ends_with(",0"));
        r.reset();
        assert!(r.history_report().is_empty());
    }

    #[test]
    fn stats_serialize_to_json() {
        let s = SenderStats {
            products_sent: 2,
            packets_sent: 100,
            ..Default::default()
        };
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"packets_sent\":100"));
    }
}
