use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// sqlx logs every statement at info.
const DEFAULT_FILTER: &str = "info,sqlx=warn,hyper=warn";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn filter_from(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Logs to stdout and to `server.log` in `log_dir`, rotated daily.
///
/// `RUST_LOG` replaces the default filter when it parses.
pub fn init(log_dir: &Path) {
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "server.log"));
    let _ = LOG_GUARD.set(guard);

    let directives = std::env::var("RUST_LOG").ok();
    let registry = tracing_subscriber::registry()
        .with(filter_from(directives.as_deref()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        );

    if registry.try_init().is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}
