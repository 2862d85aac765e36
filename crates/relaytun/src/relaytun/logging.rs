use std::{io, path::Path};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::relaytun::config;

/// Keeps the non-blocking writer flushing; drop it last.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

pub fn init(logging: &config::LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let fmt = logging.format.trim().to_ascii_lowercase();
    let out = logging.output.trim();

    // RUST_LOG wins over the config file.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive(&logging.level)))
        .context("logging: init filter")?;

    let (writer, guard) = make_writer(out)?;

    let base_fmt = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(fmt == "text" && out == "stderr")
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);

    let base_fmt = match fmt.as_str() {
        "json" => base_fmt.json().boxed(),
        "text" | "" => base_fmt.boxed(),
        other => anyhow::bail!("logging: unknown format {other:?} (expected text|json)"),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(base_fmt)
        .try_init()
        .context("logging: install subscriber")?;

    Ok(LoggingRuntime { _guard: guard })
}

/// Maps the config level to a filter directive. Third-party crates stay at `warn` unless
/// the level is `trace`.
fn directive(level: &str) -> String {
    let level = match level.trim().to_ascii_lowercase().as_str() {
        "trace" => return "trace".into(),
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };
    format!("warn,relaytun={level}")
}

/// Output sinks: `stderr` (default), `stdout`, `discard`, `daily:<dir>` for a log file
/// rotated every day, or a plain file path opened for append.
fn make_writer(output: &str) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    match output {
        "" | "stderr" => Ok(tracing_appender::non_blocking(io::stderr())),
        "stdout" => Ok(tracing_appender::non_blocking(io::stdout())),
        "discard" => Ok(tracing_appender::non_blocking(io::sink())),
        other => match other.strip_prefix("daily:") {
            Some(dir) => {
                let dir = Path::new(dir.trim());
                ensure_dir(dir)?;
                let appender = tracing_appender::rolling::daily(dir, "relaytun.log");
                Ok(tracing_appender::non_blocking(appender))
            }
            None => {
                let p = Path::new(other);
                if let Some(parent) = p.parent() {
                    ensure_dir(parent)?;
                }
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(p)
                    .with_context(|| format!("logging: open {}", p.display()))?;
                Ok(tracing_appender::non_blocking(file))
            }
        },
    }
}

fn ensure_dir(dir: &Path) -> anyhow::Result<()> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(dir).with_context(|| format!("logging: mkdir {}", dir.display()))
}
