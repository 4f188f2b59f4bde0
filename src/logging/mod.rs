// Logging sink selection: timestamped stderr in the foreground, syslog
// when daemonized

use crate::error::{MonitorError, Result};
use std::fmt;
use std::fmt::Write as _;
use std::sync::Mutex;
use syslog::{Facility, Formatter3164, Logger, LoggerBackend};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;

const SYSLOG_IDENTITY: &str = "fdbmonitor";

/// Install the global logging sink.
///
/// Daemonized monitors log to the system log with facility DAEMON; in the
/// foreground every record goes to stderr prefixed with a local timestamp
/// and the epoch time.
pub fn init(daemonized: bool) -> Result<()> {
    if daemonized {
        let formatter = Formatter3164 {
            facility: Facility::LOG_DAEMON,
            hostname: None,
            process: SYSLOG_IDENTITY.to_string(),
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter)
            .map_err(|e| MonitorError::Startup(format!("Unable to connect to syslog: {}", e)))?;
        tracing_subscriber::registry()
            .with(SyslogLayer {
                logger: Mutex::new(logger),
            })
            .init();
    } else {
        tracing_subscriber::fmt()
            .event_format(StderrFormat)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

/// `"TZ YYYY-MM-DD HH:MM:SS.uuuuuu (epoch.uuuuuu): message"` on stderr.
struct StderrFormat;

impl<S, N> FormatEvent<S, N> for StderrFormat
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
        let now = chrono::Local::now();
        write!(
            writer,
            "{} ({}.{:06}): ",
            now.format("%Z %Y-%m-%d %H:%M:%S%.6f"),
            now.timestamp(),
            now.timestamp_subsec_micros()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Forwards tracing events into the system log, mapping levels onto syslog
/// severities.
struct SyslogLayer {
    logger: Mutex<Logger<LoggerBackend, Formatter3164>>,
}

impl<S: Subscriber> Layer<S> for SyslogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let Ok(mut logger) = self.logger.lock() else {
            return;
        };
        let message = visitor.message;
        let _ = match *event.metadata().level() {
            Level::ERROR => logger.err(&message),
            Level::WARN => logger.warning(&message),
            Level::INFO => logger.info(&message),
            Level::DEBUG | Level::TRACE => logger.debug(&message),
        };
    }
}

/// Collects an event's `message` field, appending any other fields as
/// `key=value` pairs.
#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.message, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.message, " {}={:?}", field.name(), value);
        }
    }
}
