//! Logging initialization using the `tracing` ecosystem.
//!
//! Provides:
//! - Console output (colored, human-readable, or JSON lines)
//! - File output (daily rotation via `tracing-appender`, non-blocking writer)
//! - Configurable log level via env var `RUST_LOG` or explicit parameter

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Initialize the global tracing subscriber.
///
/// Should be called once at program start. The returned guard flushes the
/// file writer on drop, so keep it alive for the lifetime of the process.
///
/// # Parameters
///
/// - `log_level`: default level if `RUST_LOG` env var is not set (e.g. `"info"`)
/// - `cfg`: log directory, file prefix and output format
pub fn init_logging(log_level: &str, cfg: &LoggingConfig) -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let module_name = cfg.module_name.as_deref().unwrap_or("hx_engine");

    let (file_writer, guard) = match cfg.log_dir.as_deref() {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, module_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    // Layers are boxed so the four format/file combinations share one path.
    let registry = tracing_subscriber::registry().with(env_filter);
    if cfg.json {
        let console = fmt::layer().json().with_target(true).with_current_span(false);
        let file = file_writer.map(|w| {
            fmt::layer().json().with_writer(w).with_target(true).with_current_span(false)
        });
        registry.with(console).with(file).init();
    } else {
        let console = fmt::layer().with_target(true).with_thread_ids(true).with_ansi(true);
        let file = file_writer.map(|w| {
            fmt::layer()
                .with_writer(w)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
        });
        registry.with(console).with(file).init();
    }
    guard
}
