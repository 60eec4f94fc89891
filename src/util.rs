//! Small shared helpers: clocks, durations, sizes and atomic file writes

use crate::error::{KilnError, KilnResult};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

/// Milliseconds since the unix epoch
pub fn now_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as u64,
        Err(_) => 0,
    }
}

/// Render an epoch-millis timestamp as RFC3339, or the raw number if out of range
pub fn format_millis(millis: u64) -> String {
    i64::try_from(millis)
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| millis.to_string())
}

/// Format an elapsed duration for log output (e.g. "850ms", "1.204s", "2m 5s")
pub fn format_elapsed(elapsed: Duration) -> String {
    let ms = elapsed.as_millis() as u64;
    if ms < 1000 {
        return format!("{}ms", ms);
    }
    let s = ms / 1000;
    let rem = ms % 1000;
    if s < 60 {
        return format!("{}.{:03}s", s, rem);
    }
    let m = s / 60;
    let rem_s = s % 60 + (rem + 500) / 1000;
    format!("{}m {}s", m, rem_s)
}

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Parse a compact duration such as `7d`, `12h`, `30m` or `45s`
pub fn parse_duration(input: &str) -> KilnResult<Duration> {
    let input = input.trim();
    let invalid = |reason: &str| KilnError::InvalidDuration {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    if input.len() < 2 {
        return Err(invalid("expected a number followed by a unit"));
    }

    let (number, unit) = input.split_at(input.len() - 1);
    let secs_per_unit = match unit {
        "d" => 24 * 60 * 60,
        "h" => 60 * 60,
        "m" => 60,
        "s" => 1,
        _ => return Err(invalid("unknown unit, expected one of d, h, m, s")),
    };
    let length: u64 = number.parse().map_err(|_| invalid("not a whole number"))?;

    length
        .checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| invalid("duration too large"))
}

/// Render a duration back into the compact form accepted by [`parse_duration`]
pub fn render_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    for (unit, size) in [("d", 86_400), ("h", 3_600), ("m", 60)] {
        if secs != 0 && secs % size == 0 {
            return format!("{}{}", secs / size, unit);
        }
    }
    format!("{}s", secs)
}

/// Serde adapter storing a `Duration` as a compact string (`"7d"`)
pub mod compact_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::render_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Total size in bytes of all regular files below `path`
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `bytes` to `path` through a sibling temp file and a rename.
///
/// Readers observe either the previous content or the new content, never a
/// partially written file.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> KilnResult<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .map_err(|e| KilnError::io(format!("creating directory {}", parent.display()), e))?;

    let (tmp_path, mut file) = open_unique_tmp_file(path, parent)
        .map_err(|e| KilnError::io(format!("creating temp file for {}", path.display()), e))?;

    let written = file.write_all(bytes).and_then(|_| file.sync_all());
    drop(file);
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(KilnError::io(format!("writing {}", tmp_path.display()), e));
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(KilnError::io(format!("replacing {}", path.display()), e));
    }
    Ok(())
}

fn open_unique_tmp_file(dest: &Path, parent: &Path) -> io::Result<(PathBuf, fs::File)> {
    let file_name = dest
        .file_name()
        .ok_or_else(|| io::Error::other("destination path has no file name"))?;
    let pid = std::process::id();

    loop {
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(format!(".tmp.{}.{}", pid, counter));
        let tmp_path = parent.join(tmp_name);

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(file) => return Ok((tmp_path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
}
