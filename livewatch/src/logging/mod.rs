//! Logging setup with a reloadable filter.
//!
//! Console and daily-rotated file output, both stamped with local time.
//! Rotated files older than [`LOG_RETENTION_DAYS`] are removed by a
//! background task.

use chrono::{Local, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "livewatch=info,sqlx=warn";

/// Log retention period in days.
pub const LOG_RETENTION_DAYS: i64 = 7;

const LOG_FILE_PREFIX: &str = "livewatch.log";

#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Handle on the installed subscriber.
pub struct LoggingConfig {
    handle: FilterHandle,
    log_dir: PathBuf,
}

impl LoggingConfig {
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the active filter directive (e.g. `livewatch=debug`).
    pub fn set_filter(&self, directive: &str) -> crate::Result<()> {
        let new_filter = EnvFilter::try_new(directive)
            .map_err(|e| crate::Error::config(format!("Invalid filter directive: {}", e)))?;

        self.handle
            .reload(new_filter)
            .map_err(|e| crate::Error::Other(format!("Failed to reload filter: {}", e)))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Delete rotated log files older than the retention period once a day.
    pub fn start_retention_cleanup(self: &Arc<Self>, cancel_token: CancellationToken) {
        let log_dir = self.log_dir.clone();

        tokio::spawn(async move {
            let cleanup_interval = Duration::from_secs(24 * 60 * 60);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Log retention cleanup task shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(cleanup_interval) => {
                        if let Err(e) = cleanup_old_logs(&log_dir, LOG_RETENTION_DAYS).await {
                            warn!(error = %e, "Failed to cleanup old logs");
                        }
                    }
                }
            }
        });
    }
}

/// Delete `livewatch.log.YYYY-MM-DD` files dated before the cutoff.
/// Returns how many files were removed.
pub async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<usize> {
    let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).date_naive();

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted_count = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(date_str) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|name| name.strip_prefix(LOG_FILE_PREFIX))
            .and_then(|rest| rest.strip_prefix('.'))
        else {
            continue;
        };

        let Ok(file_date) = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
            continue;
        };

        if file_date < cutoff {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    deleted_count += 1;
                    debug!(path = %path.display(), "Deleted old log file");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete old log file"),
            }
        }
    }

    if deleted_count > 0 {
        info!(count = deleted_count, "Cleaned up old log files");
    }

    Ok(deleted_count)
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides [`DEFAULT_LOG_FILTER`]. Keep the returned guard alive
/// for the lifetime of the process or buffered file output is lost.
pub fn init_logging(log_dir: &str) -> crate::Result<(Arc<LoggingConfig>, WorkerGuard)> {
    let log_path = PathBuf::from(log_dir);
    std::fs::create_dir_all(&log_path)?;

    let file_appender = tracing_appender::rolling::daily(&log_path, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let initial_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .try_init()
        .map_err(|e| {
            crate::Error::Other(format!("Failed to set global default subscriber: {}", e))
        })?;

    let config = Arc::new(LoggingConfig {
        handle: filter_handle,
        log_dir: log_path,
    });

    Ok((config, guard))
}
