use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `LOG_LEVEL` is read as an `EnvFilter`
/// directive; `RUST_LOG` wins when set. The returned guard must outlive the
/// server so the file writer flushes.
pub(crate) fn init_tracing(
    log_level: &str,
    log_dir: Option<&Path>,
    log_to_stderr: bool,
) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, "server.log");
            let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_target(false)
                .json();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if log_to_stderr {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(false);
        registry.with(console_layer).init();
    } else {
        let console_layer = tracing_subscriber::fmt::layer().with_target(false);
        registry.with(console_layer).init();
    }
    Ok(guard)
}
