//! Bounded stdout/stderr tail reading (spec §4.5 step 4: "read bounded
//! tails (default 64 KiB) of stdout/stderr, decode as UTF-8 with a
//! replacement sentinel on failure").

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

pub const MAX_IO_LOGLENGTH: u64 = 64 * 1024;

pub fn read_tail(path: &Path, max_bytes: u64) -> String {
    let Ok(mut file) = std::fs::File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(max_bytes);
    if file.seek(SeekFrom::Start(start)).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}
