use std::fs::OpenOptions;
use std::path::Path;

use tracing::warn;
use tracing_appender::non_blocking;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const LOG_DIR: &str = "log";
pub const LOG_FILE: &str = "activator.log";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("activator_core=info,activator_cli=info"))
}

/// Logs to stderr and, when `home` is writable, to `<home>/log/activator.log`.
/// Keep the returned guard alive until exit so buffered file output is flushed.
pub fn init(home: Option<&Path>) -> Option<WorkerGuard> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter());

    let (file_layer, guard, file_err) = match home.map(open_log_file) {
        Some(Ok(file)) => {
            let (writer, guard) = non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .with_filter(env_filter());
            (Some(layer), Some(guard), None)
        }
        Some(Err(err)) => (None, None, Some(err)),
        None => (None, None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    if let Some(err) = file_err {
        warn!("file logging disabled: {err}");
    }
    guard
}

fn open_log_file(home: &Path) -> std::io::Result<std::fs::File> {
    let log_dir = home.join(LOG_DIR);
    std::fs::create_dir_all(&log_dir)?;
    let mut options = OpenOptions::new();
    options.create(true).append(true);

    // Owner read/write only.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    options.open(log_dir.join(LOG_FILE))
}
