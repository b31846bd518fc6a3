//! Sync cycle progress reporting.
//!
//! Reports what a `kbsync sync` or `kbsync watch` cycle is doing: which
//! source is being scanned, what the scan found, how much queued work is
//! left and which generations were committed. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts.

use serde::Serialize;
use std::io::Write;

use crate::models::GenerationId;

/// A single progress event for a sync cycle.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SyncProgressEvent {
    /// Listing a source; the number of items is not known yet.
    Scanning { source: String },
    /// A source listing was compared against the hash store.
    Scanned {
        source: String,
        listed: u64,
        changed: u64,
        deleted: u64,
        failed: u64,
    },
    /// Queued work still to be processed.
    Draining { pending: u64, in_flight: u64 },
    /// A batch became live.
    Committed {
        generation: GenerationId,
        documents: u64,
    },
    /// A batch was rolled back after a quality regression.
    RolledBack {
        from: GenerationId,
        to: GenerationId,
    },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync docs  scanned  1,234 items  (3 changed, 1 deleted)".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Scanning { source } => format!("sync {}  scanning...\n", source),
            SyncProgressEvent::Scanned {
                source,
                listed,
                changed,
                deleted,
                failed,
            } => {
                let mut line = format!(
                    "sync {}  scanned  {} items  ({} changed, {} deleted",
                    source,
                    format_number(*listed),
                    format_number(*changed),
                    format_number(*deleted)
                );
                if *failed > 0 {
                    line.push_str(&format!(", {} unreadable", format_number(*failed)));
                }
                line.push_str(")\n");
                line
            }
            SyncProgressEvent::Draining { pending, in_flight } => format!(
                "queue  {} pending  {} in flight\n",
                format_number(*pending),
                format_number(*in_flight)
            ),
            SyncProgressEvent::Committed {
                generation,
                documents,
            } => format!(
                "commit  generation {}  {} documents\n",
                generation,
                format_number(*documents)
            ),
            SyncProgressEvent::RolledBack { from, to } => {
                format!("rollback  generation {} -> {}\n", from, to)
            }
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr, tagged
/// by `phase` (`{"phase":"committed","generation":4,"documents":2}`).
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        if let Ok(line) = serde_json::to_string(&event) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
