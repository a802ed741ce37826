//! Our compact event format.
//!
//! One line per event: timestamp, level, target, message and fields, then the fields of every active span.
//! Span names are left out, their fields carry the useful context.

use std::fmt;

use nu_ansi_term::{Color, Style};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{Event, Level, Subscriber};
use tracing_log::NormalizeEvent as _;
use tracing_subscriber::{
    fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields, format::Writer},
    registry::{LookupSpan, Scope},
};

pub struct Format {
    timestamp: bool,
}

impl Format {
    pub fn new() -> Self {
        Self { timestamp: true }
    }

    /// For interactive output where the time of day is just noise.
    pub fn without_timestamp(self) -> Self {
        Self { timestamp: false }
    }
}

impl Default for Format {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, N> FormatEvent<S, N> for Format
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
        let normalized = event.normalized_metadata();
        let meta = normalized.as_ref().unwrap_or_else(|| event.metadata());
        let ansi = writer.has_ansi_escapes();
        let dimmed = if ansi { Style::new().dimmed() } else { Style::new() };

        if self.timestamp {
            let now = OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .map_err(|_| fmt::Error)?;

            write!(writer, "{} ", dimmed.paint(now))?;
        }

        write!(writer, "{} ", level(meta.level(), ansi))?;
        write!(writer, "{} ", dimmed.paint(format!("{}:", meta.target())))?;

        ctx.format_fields(writer.by_ref(), event)?;

        for span in ctx.event_scope().into_iter().flat_map(Scope::from_root) {
            let extensions = span.extensions();
            let Some(fields) = extensions.get::<FormattedFields<N>>() else {
                continue;
            };
            if fields.is_empty() {
                continue;
            }

            write!(writer, " {}", fields.fields)?;
        }

        writeln!(writer)
    }
}

fn level(level: &Level, ansi: bool) -> String {
    let (text, color) = match *level {
        Level::TRACE => ("TRACE", Color::Purple),
        Level::DEBUG => ("DEBUG", Color::Blue),
        Level::INFO => (" INFO", Color::Green),
        Level::WARN => (" WARN", Color::Yellow),
        Level::ERROR => ("ERROR", Color::Red),
    };

    if ansi {
        color.paint(text).to_string()
    } else {
        text.to_owned()
    }
}
