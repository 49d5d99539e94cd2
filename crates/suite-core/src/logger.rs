//! Structured logging with daily rotation and age-based compression. See spec §4.2.
//!
//! Built on `tracing` + `tracing-appender`, the same stack the teacher wires
//! up in `add-ons/pagi-gateway/src/main.rs` and `add-ons/pagi-daemon/src/main.rs`.
//! `init()` installs the global subscriber; `compact_old_logs` is run
//! periodically by the supervisor to gzip logs older than `compress_after_days`
//! and delete ones older than twice that.

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;

/// Owns the background flush thread for the non-blocking file writer; drop
/// this at the very end of `main` to guarantee a final flush.
pub struct LoggerHandle {
    _file_guard: WorkerGuard,
}

impl LoggerHandle {
    /// Flushes the non-blocking file writer and drops its background thread.
    /// Call once, last, at shutdown (spec §9: "each subsystem exposes a
    /// close/shutdown operation") rather than relying on an implicit drop at
    /// the end of `main`.
    pub fn close(self) {
        drop(self);
    }
}

/// Installs the global `tracing` subscriber: an `EnvFilter` (default `info`)
/// plus a daily-rotating file layer under `logs/`. Console output is
/// suppressed when `SUITE_NO_CONSOLE=1` is set (spec §4.2's GUI-host note).
pub fn init(logs_dir: &Path) -> io::Result<LoggerHandle> {
    fs::create_dir_all(logs_dir)?;
    let file_appender = tracing_appender::rolling::daily(logs_dir, "suite");
    let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    let console_suppressed = std::env::var("SUITE_NO_CONSOLE")
        .map(|v| v == "1")
        .unwrap_or(false);

    use tracing_subscriber::prelude::*;
    if console_suppressed {
        tracing_subscriber::registry().with(filter).with(file_layer).init();
    } else {
        let console_layer = tracing_subscriber::fmt::layer();
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(console_layer)
            .init();
    }

    Ok(LoggerHandle { _file_guard: file_guard })
}

/// Gzips `logs/YYYY-MM-DD.log` files older than `compress_after_days` and
/// deletes `.log.gz` files older than `2 * compress_after_days`. Call this
/// once per day from the supervisor; safe to call more often (a no-op on
/// files that are already compressed or already deleted).
pub fn compact_old_logs(logs_dir: &Path, compress_after_days: i64) -> io::Result<()> {
    let today = Utc::now().date_naive();
    let entries = match fs::read_dir(logs_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        let Some(date) = parse_log_date(name) else { continue };
        let age_days = (today - date).num_days();

        if name.ends_with(".log.gz") {
            if age_days >= compress_after_days * 2 {
                fs::remove_file(&path)?;
            }
            continue;
        }
        if name.ends_with(".log") && age_days >= compress_after_days {
            compress_file(&path)?;
        }
    }
    Ok(())
}

fn parse_log_date(file_name: &str) -> Option<NaiveDate> {
    let stem = file_name.strip_suffix(".log.gz").or_else(|| file_name.strip_suffix(".log"))?;
    let date_part = stem.rsplit('.').next()?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

fn compress_file(path: &Path) -> io::Result<()> {
    let data = fs::read(path)?;
    let gz_path: PathBuf = {
        let mut s = path.as_os_str().to_os_string();
        s.push(".gz");
        PathBuf::from(s)
    };
    let out = File::create(&gz_path)?;
    let mut encoder = GzEncoder::new(out, Compression::default());
    encoder.write_all(&data)?;
    encoder.finish()?;
    fs::remove_file(path)?;
    Ok(())
}

/// One-line structured log helper matching spec §4.2's fixed fields
/// (timestamp is implicit via `tracing`'s own event time). Prefer calling
/// `tracing::info!`/`warn!`/`error!` directly; this exists for call sites
/// that build the category/fields dynamically (e.g. diagnostics breadcrumbs).
pub fn log_event(category: &str, level: tracing::Level, message: &str, fields: &serde_json::Value) {
    match level {
        tracing::Level::ERROR => tracing::error!(category, fields = %fields, "{message}"),
        tracing::Level::WARN => tracing::warn!(category, fields = %fields, "{message}"),
        tracing::Level::DEBUG => tracing::debug!(category, fields = %fields, "{message}"),
        tracing::Level::TRACE => tracing::trace!(category, fields = %fields, "{message}"),
        _ => tracing::info!(category, fields = %fields, "{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_daily_rotation_filename() {
        assert_eq!(
            parse_log_date("suite.2026-01-01.log"),
            NaiveDate::from_ymd_opt(2026, 1, 1)
        );
        assert_eq!(
            parse_log_date("suite.2025-12-25.log.gz"),
            NaiveDate::from_ymd_opt(2025, 12, 25)
        );
        assert_eq!(parse_log_date("not-a-log"), None);
    }

    #[test]
    fn compacts_and_expires_old_logs() {
        let tmp = tempfile::tempdir().unwrap();
        let old_date = Utc::now().date_naive() - ChronoDuration::days(10);
        let old_log = tmp.path().join(format!("suite.{}.log", old_date.format("%Y-%m-%d")));
        fs::write(&old_log, b"hello").unwrap();

        compact_old_logs(tmp.path(), 7).unwrap();
        assert!(!old_log.exists());
        assert!(old_log.with_extension("log.gz").exists() || tmp.path().join(format!("suite.{}.log.gz", old_date.format("%Y-%m-%d"))).exists());
    }
}
