//! Global tracing setup
//!
//! Diagnostics use the shared formatter from `utils`, events on the `metrics` target
//! go to a daily rolling file as raw line-protocol records.

use std::env;
use std::fmt;
use std::path::Path;

use anyhow::Context as _;
use tracing::field::Field;
use tracing::field::Visit;
use tracing::Event;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::fmt::format;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use utils::logging::LOG_PATH_ENV_VAR;

pub const METRICS_TARGET: &str = "metrics";
const DEFAULT_METRICS_FILE: &str = "/var/log/pu-monitor/metrics.log";

/// Writes the recorded field values only, one record per line
struct LineProtocolFormatter;

struct FieldVisitor {
    msg: String,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, _: &Field, value: &str) {
        self.msg.push_str(value);
    }

    fn record_debug(&mut self, _: &Field, value: &dyn fmt::Debug) {
        self.msg.push_str(&format!("{value:?}"));
    }
}

impl<S, N> FormatEvent<S, N> for LineProtocolFormatter
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldVisitor { msg: String::new() };
        event.record(&mut visitor);
        writeln!(writer, "{}", visitor.msg)
    }
}

/// Install the global tracing subscriber.
///
/// The returned guard flushes the metrics file on drop and must be kept alive for
/// the lifetime of the process.
pub fn init<P: AsRef<Path>>(metrics_file: Option<P>) -> anyhow::Result<WorkerGuard> {
    let log_path = env::var(LOG_PATH_ENV_VAR).ok();
    let fmt_layer = utils::logging::get_fmt_layer(log_path);

    let metrics_file: &Path = match &metrics_file {
        Some(path) => path.as_ref(),
        None => Path::new(DEFAULT_METRICS_FILE),
    };
    let dir = metrics_file
        .parent()
        .context("metrics file has no parent directory")?;
    let file_name = metrics_file
        .file_name()
        .and_then(|name| name.to_str())
        .context("metrics file has no valid file name")?;

    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();
    let fmt_layer = fmt_layer.with_filter(env_filter.and(filter::filter_fn(|metadata| {
        metadata.target() != METRICS_TARGET
    })));

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_name)
        .max_log_files(3)
        .build(dir)
        .with_context(|| format!("failed to create metrics appender in {}", dir.display()))?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let metrics_layer = layer()
        .event_format(LineProtocolFormatter)
        .fmt_fields(format::DefaultFields::new())
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(filter::filter_fn(|metadata| {
            metadata.target() == METRICS_TARGET
        }));

    registry()
        .with(fmt_layer)
        .with(metrics_layer)
        .try_init()
        .context("global tracing subscriber already installed")?;
    Ok(file_guard)
}
