//! Logger initialisation using tracing.

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use super::config::{LogConfig, LogFormat};

/// Keeps the non-blocking file writer alive for the process lifetime.
pub struct LoggerGuard {
    _guard: Option<WorkerGuard>,
}

/// Initialise the global subscriber: stdout in the configured format,
/// plus a daily-rotated JSON file when `log_dir` is set. `RUST_LOG`
/// overrides the configured default level.
pub fn init(config: &LogConfig) -> Result<LoggerGuard> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.level.parse()?)
        .from_env_lossy();

    let guard = if let Some(ref log_dir) = config.log_dir {
        let file_appender = rolling::daily(log_dir, "maestro.log");
        let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true)
            .with_filter(env_filter.clone());

        let stdout_layer = stdout_layer(config).with_filter(env_filter);
        tracing_subscriber::registry()
            .with(file_layer)
            .with(stdout_layer)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(stdout_layer(config).with_filter(env_filter))
            .init();
        None
    };

    Ok(LoggerGuard { _guard: guard })
}

fn stdout_layer<S>(config: &LogConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(false)
            .boxed(),
    }
}
