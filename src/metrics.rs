//! Derived views over the ring counters: stats, fill level, snapshots,
//! and throughput between snapshots. Everything here is read-only and
//! racy by design — a live queue keeps moving while we look.

use std::fmt;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::ring::Queue;

/// Nanoseconds since the Unix epoch.
pub(crate) fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Raw cursor view of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub head: u64,
    /// Slowest reader's cursor: the minimum active group tail, or the
    /// control-block tail when no group is active.
    pub tail: u64,
    pub capacity: u64,
    /// Messages published but not yet consumed by the slowest reader —
    /// the same occupancy the producer's full-check sees.
    pub used: u64,
    pub slot_size: u64,
}

/// Formatted metrics report.
#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub name: String,
    pub capacity: u64,
    pub slot_size: u64,
    pub head: u64,
    pub tail: u64,
    pub used: u64,
    pub fill_percent: u8,
    pub last_activity_ns: u64,
}

impl Metrics {
    /// JSON rendering of the report.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "queue {}", self.name)?;
        writeln!(
            f,
            "  geometry: {} slots x {} bytes",
            self.capacity, self.slot_size
        )?;
        writeln!(f, "  head: {}  tail: {}  used: {}", self.head, self.tail, self.used)?;
        write!(f, "  fill: {}%", self.fill_percent)
    }
}

/// Point-in-time counter sample for throughput computation.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Snapshot {
    pub timestamp_ns: u64,
    pub head: u64,
    pub tail: u64,
    /// Total messages ever published (the head counter never wraps).
    pub pushed: u64,
    /// Total messages ever consumed by the direct consumer.
    pub popped: u64,
}

/// Combined push+pop operations per second between two snapshots.
/// Zero when no time passed.
pub fn throughput(first: &Snapshot, second: &Snapshot) -> f64 {
    let delta_ns = second.timestamp_ns.saturating_sub(first.timestamp_ns);
    if delta_ns == 0 {
        return 0.0;
    }
    let ops = second.pushed.saturating_sub(first.pushed)
        + second.popped.saturating_sub(first.popped);
    (ops as f64 * 1e9) / delta_ns as f64
}

impl Queue {
    /// Raw cursor snapshot.
    pub fn stats(&self) -> QueueStats {
        let ctrl = self.shared.control();
        let head = ctrl.head.load(Ordering::Acquire);
        let tail = self.shared.reclaim_tail();
        QueueStats {
            head,
            tail,
            capacity: self.shared.geo.capacity,
            used: head.saturating_sub(tail),
            slot_size: self.shared.geo.slot_size,
        }
    }

    /// Formatted metrics report (human-readable via `Display`, JSON via
    /// [`Metrics::to_json`]).
    pub fn metrics(&self) -> Metrics {
        let stats = self.stats();
        Metrics {
            name: self.name.clone(),
            capacity: stats.capacity,
            slot_size: stats.slot_size,
            head: stats.head,
            tail: stats.tail,
            used: stats.used,
            fill_percent: self.fill_level(),
            last_activity_ns: self.last_activity(),
        }
    }

    /// Samples the counters for later throughput computation.
    pub fn take_snapshot(&self) -> Snapshot {
        let stats = self.stats();
        Snapshot {
            timestamp_ns: now_ns(),
            head: stats.head,
            tail: stats.tail,
            pushed: stats.head,
            popped: stats.tail,
        }
    }

    /// Percentage of the ring occupied, 0..=100.
    pub fn fill_level(&self) -> u8 {
        let stats = self.stats();
        ((stats.used * 100) / stats.capacity).min(100) as u8
    }

    /// True once the fill level reaches `threshold` percent.
    pub fn is_pressured(&self, threshold: u8) -> bool {
        self.fill_level() >= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(timestamp_ns: u64, pushed: u64, popped: u64) -> Snapshot {
        Snapshot {
            timestamp_ns,
            head: pushed,
            tail: popped,
            pushed,
            popped,
        }
    }

    #[test]
    fn test_throughput_counts_both_directions() {
        let a = snapshot(0, 0, 0);
        let b = snapshot(1_000_000_000, 500, 300);
        let ops_per_sec = throughput(&a, &b);
        assert!((ops_per_sec - 800.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_throughput_zero_time_delta() {
        let a = snapshot(42, 10, 10);
        let b = snapshot(42, 20, 20);
        assert_eq!(throughput(&a, &b), 0.0);
    }

    #[test]
    fn test_metrics_json_contains_fields() {
        let metrics = Metrics {
            name: "/q".to_owned(),
            capacity: 8,
            slot_size: 64,
            head: 5,
            tail: 2,
            used: 3,
            fill_percent: 37,
            last_activity_ns: 0,
        };
        let json = metrics.to_json();
        assert!(json.contains("\"capacity\":8"));
        assert!(json.contains("\"fill_percent\":37"));
        assert!(metrics.to_string().contains("fill: 37%"));
    }
}
