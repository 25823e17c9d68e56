use std::{fs, path::Path};

use anyhow::Context;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Installs the console and file loggers. The returned guard flushes the
/// file writer when dropped, so it has to live as long as `main`.
pub fn init_logging(
    console_level: LevelFilter,
    log_file: &Path,
    file_level: LevelFilter,
) -> anyhow::Result<WorkerGuard> {
    let dir = log_file.parent().filter(|dir| !dir.as_os_str().is_empty()).unwrap_or(Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("Failed to create log directory {dir:?}"))?;
    let file_name = log_file
        .file_name()
        .with_context(|| format!("Log file {log_file:?} has no file name"))?;

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));

    let console_filter = EnvFilter::builder()
        .with_default_directive(console_level.into())
        .from_env_lossy();
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_filter(file_level);

    tracing_subscriber::registry().with(console_layer).with(file_layer).try_init()?;

    Ok(guard)
}
