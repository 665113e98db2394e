// =============================================================================
// Log sink — tracing frontend, non-blocking file writer, per-worker tags
// =============================================================================
//
// Producers format events on their own thread and hand the finished line to a
// queue drained by a single background writer (lossless mode, so nothing is
// dropped under burst load). Each worker task carries a 6-character tag that
// appears in every line it emits; logging never surfaces errors to callers.
// =============================================================================

use std::fmt;
use std::io;

use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Fixed width of the per-worker tag.
pub const LOG_TAG_WIDTH: usize = 6;

tokio::task_local! {
    static WORKER_TAG: String;
}

/// Pad or truncate a tag to exactly [`LOG_TAG_WIDTH`] characters.
pub fn pad_tag(tag: &str) -> String {
    let mut padded: String = tag.chars().take(LOG_TAG_WIDTH).collect();
    while padded.chars().count() < LOG_TAG_WIDTH {
        padded.push(' ');
    }
    padded
}

/// Run `fut` with the given worker tag attached to every log line it emits.
pub async fn with_worker_tag<F>(tag: &str, fut: F) -> F::Output
where
    F: std::future::Future,
{
    WORKER_TAG.scope(pad_tag(tag), fut).await
}

fn current_tag() -> String {
    WORKER_TAG
        .try_with(|t| t.clone())
        .unwrap_or_else(|_| pad_tag("MAIN"))
}

// ---------------------------------------------------------------------------
// Event formatter
// ---------------------------------------------------------------------------

/// `timestamp [TAG   ] LEVEL message fields...`
struct TaggedFormat;

impl<S, N> FormatEvent<S, N> for TaggedFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(
            writer,
            "{} [{}] {:>5} ",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            current_tag(),
            event.metadata().level()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

/// Install the global subscriber: append-only file sink plus optional console
/// sink. The returned guard must stay alive for the process lifetime so the
/// writer thread flushes on shutdown.
pub fn init(config: &LoggingConfig) -> io::Result<WorkerGuard> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_file)?;

    let (file_writer, guard) = NonBlockingBuilder::default().lossy(false).finish(file);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .event_format(TaggedFormat)
        .with_ansi(false)
        .with_writer(file_writer);

    if config.console_logging {
        let console_layer = tracing_subscriber::fmt::layer()
            .event_format(TaggedFormat)
            .with_writer(io::stdout);
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(console_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();
    }

    Ok(guard)
}
