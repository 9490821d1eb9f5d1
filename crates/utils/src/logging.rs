//! provides logging helpers

use std::path::Path;

use tracing::Subscriber;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Environment variable that redirects diagnostics from stderr into a daily rolling file.
pub const LOG_PATH_ENV_VAR: &str = "PU_MONITOR_LOG_PATH";

const DEFAULT_LOG_FILE: &str = "pu-monitor.log";

/// Build the diagnostics formatting layer.
///
/// Writes to stderr unless `log_path` names a file, in which case the file is
/// rotated daily next to the given path.
pub fn get_fmt_layer<S>(log_path: Option<String>) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match log_path {
        Some(log_path) => {
            let log_path = Path::new(&log_path);
            let dir = log_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let prefix = log_path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or(DEFAULT_LOG_FILE);
            let appender = tracing_appender::rolling::daily(dir, prefix);

            layer()
                .with_writer(appender)
                .with_ansi(false)
                .with_target(true)
                .boxed()
        }
        None => layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
    }
}
