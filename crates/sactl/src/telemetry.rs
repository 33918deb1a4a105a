//! Log output setup
//!
//! `RUST_LOG`, when set, wins over `logging.level` from the config files.
//! `logging.json` switches the formatter to one JSON object per line.
//!
//! Long-running commands also write `<logging.dir>/<module>.<date>.log`,
//! rotated daily. Files older than `logging.rotate_days` are removed at
//! startup.

use anyhow::{anyhow, Context, Result};
use saconf::LoggingConfig;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Keeps the file writer flushing. Hold it until the process exits.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Filter directive to use: a non-empty `RUST_LOG` or the configured level.
fn filter_directive(logging: &LoggingConfig, rust_log: Option<&str>) -> String {
    match rust_log.map(str::trim) {
        Some(directive) if !directive.is_empty() => directive.to_string(),
        _ => logging.level.to_lowercase(),
    }
}

/// True for the rotated files of `module`: `<module>.<date>.log`.
fn is_module_log(file_name: &str, module: &str) -> bool {
    file_name
        .strip_prefix(module)
        .and_then(|rest| rest.strip_prefix('.'))
        .is_some_and(|rest| rest.ends_with(".log"))
}

/// Delete `module`'s log files in `dir` last modified more than
/// `rotate_days` before `now`. Returns how many were removed.
pub fn prune_old_logs(dir: &Path, module: &str, rotate_days: u32, now: SystemTime) -> Result<usize> {
    let Some(cutoff) = now.checked_sub(DAY * rotate_days) else {
        return Ok(0);
    };

    let mut removed = 0;
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read log directory {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !is_module_log(name, module) {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() || metadata.modified()? >= cutoff {
            continue;
        }
        std::fs::remove_file(entry.path())
            .with_context(|| format!("Failed to remove old log {}", entry.path().display()))?;
        removed += 1;
    }
    Ok(removed)
}

fn format_layer<W>(json: bool, writer: W, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer().with_writer(writer).with_ansi(ansi);
    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

/// Install the global tracing subscriber.
///
/// With a `module`, log lines also go to that module's daily file under
/// `logging.dir`.
pub fn init(logging: &LoggingConfig, module: Option<&str>) -> Result<LogGuard> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directive = filter_directive(logging, rust_log.as_deref());
    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("invalid log filter '{}'", directive))?;

    let mut layers = vec![format_layer(logging.json, std::io::stdout, true)];
    let mut file_guard = None;
    let mut pruned = 0;

    if let Some(module) = module {
        std::fs::create_dir_all(&logging.dir)
            .with_context(|| format!("Failed to create log directory {}", logging.dir.display()))?;
        pruned = prune_old_logs(&logging.dir, module, logging.rotate_days, SystemTime::now())?;

        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(module)
            .filename_suffix("log")
            .build(&logging.dir)
            .with_context(|| format!("Failed to open log file in {}", logging.dir.display()))?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(format_layer(logging.json, writer, false));
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| anyhow!("failed to install log subscriber: {}", e))?;

    if pruned > 0 {
        tracing::debug!("Removed {} log file(s) older than {} days", pruned, logging.rotate_days);
    }
    Ok(LogGuard { _file: file_guard })
}
