//! Engine counters and the `kbsync stats` overview.
//!
//! [`EngineStats`] is shared by the detector, workers and swap path; every
//! field is a relaxed atomic counter, so recording never blocks the hot
//! path. [`print_overview`] combines a counter snapshot with the persisted
//! index state for the CLI.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::GenerationId;
use crate::queue::QueueDepth;

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct EngineStats {
    /// Change events emitted by the detector.
    pub detected: Counter,
    pub enqueued: Counter,
    pub coalesced: Counter,
    pub deferred: Counter,
    /// Lower-class events pushed out of a full queue.
    pub displaced: Counter,
    /// Events turned away by a full queue under the `reject` policy.
    pub rejected: Counter,
    /// Source reads that exhausted their retries.
    pub read_failures: Counter,
    pub batches: Counter,
    /// Events whose work reached the live index.
    pub committed: Counter,
    pub generations: Counter,
    pub chunks_embedded: Counter,
    /// Chunks whose previous vector was carried over.
    pub chunks_reused: Counter,
    pub rolled_back: Counter,
    pub dead_lettered: Counter,
    pub discarded_stale: Counter,
    pub version_conflicts: Counter,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub detected: u64,
    pub enqueued: u64,
    pub coalesced: u64,
    pub deferred: u64,
    pub displaced: u64,
    pub rejected: u64,
    pub read_failures: u64,
    pub batches: u64,
    pub committed: u64,
    pub generations: u64,
    pub chunks_embedded: u64,
    pub chunks_reused: u64,
    pub rolled_back: u64,
    pub dead_lettered: u64,
    pub discarded_stale: u64,
    pub version_conflicts: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            detected: self.detected.get(),
            enqueued: self.enqueued.get(),
            coalesced: self.coalesced.get(),
            deferred: self.deferred.get(),
            displaced: self.displaced.get(),
            rejected: self.rejected.get(),
            read_failures: self.read_failures.get(),
            batches: self.batches.get(),
            committed: self.committed.get(),
            generations: self.generations.get(),
            chunks_embedded: self.chunks_embedded.get(),
            chunks_reused: self.chunks_reused.get(),
            rolled_back: self.rolled_back.get(),
            dead_lettered: self.dead_lettered.get(),
            discarded_stale: self.discarded_stale.get(),
            version_conflicts: self.version_conflicts.get(),
        }
    }
}

/// Persisted state of the index, as shown by `kbsync stats`.
#[derive(Debug, Clone, Serialize)]
pub struct IndexOverview {
    pub generation: GenerationId,
    pub retained_generations: Vec<GenerationId>,
    pub documents: usize,
    pub chunks: usize,
    pub dead_letters: usize,
    pub alerts: usize,
    pub degraded: usize,
    pub last_commit: Option<DateTime<Utc>>,
    pub queue: QueueDepth,
}

pub fn print_overview(db_path: &Path, overview: &IndexOverview, counters: &StatsSnapshot) {
    let db_size = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);

    println!("kbsync — Index Stats");
    println!("====================");
    println!();
    println!("  Database:      {}", db_path.display());
    println!("  Size:          {}", format_bytes(db_size));
    println!();
    println!("  Generation:    {}", overview.generation);
    println!(
        "  Retained:      {}",
        overview
            .retained_generations
            .iter()
            .map(|g| g.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!(
        "  Last commit:   {}",
        overview
            .last_commit
            .map(|t| format_ts_relative(t.timestamp()))
            .unwrap_or_else(|| "never".to_string())
    );
    println!("  Documents:     {}", overview.documents);
    println!("  Chunks:        {}", overview.chunks);
    println!();
    println!("  Dead letters:  {}", overview.dead_letters);
    println!("  Alerts:        {}", overview.alerts);
    println!("  Degraded:      {}", overview.degraded);

    let q = &overview.queue;
    println!();
    println!(
        "  Queue:         critical {}  high {}  medium {}  low {}  (in flight {}, deferred {})",
        q.critical, q.high, q.medium, q.low, q.in_flight, q.deferred
    );

    if counters.detected > 0 || counters.committed > 0 {
        println!();
        println!("  This run:");
        println!("  {:<20} {:>8}", "COUNTER", "VALUE");
        println!("  {}", "-".repeat(29));
        for (name, value) in [
            ("detected", counters.detected),
            ("enqueued", counters.enqueued),
            ("coalesced", counters.coalesced),
            ("deferred", counters.deferred),
            ("displaced", counters.displaced),
            ("rejected", counters.rejected),
            ("read failures", counters.read_failures),
            ("batches", counters.batches),
            ("committed", counters.committed),
            ("generations", counters.generations),
            ("chunks embedded", counters.chunks_embedded),
            ("chunks reused", counters.chunks_reused),
            ("rolled back", counters.rolled_back),
            ("dead-lettered", counters.dead_lettered),
            ("discarded stale", counters.discarded_stale),
            ("version conflicts", counters.version_conflicts),
        ] {
            println!("  {:<20} {:>8}", name, value);
        }
    }

    println!();
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp relative to now (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    let plural = |n: i64| if n == 1 { "" } else { "s" };
    match delta {
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => format!("{} min{} ago", d / 60, plural(d / 60)),
        d if d < 86400 => format!("{} hour{} ago", d / 3600, plural(d / 3600)),
        d if d < 86400 * 30 => format!("{} day{} ago", d / 86400, plural(d / 86400)),
        _ => format_ts_iso(ts),
    }
}

fn format_ts_iso(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_snapshot() {
        let stats = EngineStats::default();
        stats.detected.incr();
        stats.detected.incr();
        stats.chunks_embedded.add(5);
        let snap = stats.snapshot();
        assert_eq!(snap.detected, 2);
        assert_eq!(snap.chunks_embedded, 5);
        assert_eq!(snap.committed, 0);
    }

    #[test]
    fn byte_and_time_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_ts_relative(Utc::now().timestamp()), "just now");
        assert_eq!(format_ts_relative(Utc::now().timestamp() - 7200), "2 hours ago");
    }
}
