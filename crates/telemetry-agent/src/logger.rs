// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line format of the agent.
//!
//! ```text
//! TELEMETRY | LEVEL | [group] [span_name{span_fields}:] message {event_fields}
//! ```
//!
//! Work the channel does for a group runs inside a [`GROUP_SPAN`] span, which
//! is rendered as the bare group name in brackets.

use std::fmt;
use telemetry_channel::constants::GROUP_SPAN;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

/// Prefixes every line with `TELEMETRY` so agent output can be told apart from
/// the host application's.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(&mut writer, "TELEMETRY | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                // Filled in by the fmt layer when the span was created.
                let ext = span.extensions();
                let fields = ext
                    .get::<FormattedFields<N>>()
                    .map_or("", |fields| fields.fields.as_str());

                if span.name() == GROUP_SPAN {
                    let group = fields.strip_prefix("name=").unwrap_or(fields);
                    write!(writer, "[{group}] ")?;
                } else if fields.is_empty() {
                    write!(writer, "{}: ", span.name())?;
                } else {
                    write!(writer, "{}{{{fields}}}: ", span.name())?;
                }
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Buffer {
        type Writer = Buffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture(emit: impl FnOnce()) -> String {
        let buffer = Buffer::default();
        let subscriber = tracing_subscriber::fmt::Subscriber::builder()
            .with_ansi(false)
            .event_format(Formatter)
            .with_writer(buffer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, emit);
        let output = buffer.0.lock().unwrap().clone();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn test_format_includes_prefix_level_and_span() {
        let output = capture(|| {
            let span = tracing::info_span!("stdin", line = 7);
            let _entered = span.enter();
            tracing::info!(count = 3, "Sending batch");
        });

        assert!(output.starts_with("TELEMETRY | INFO | stdin{line=7}: "));
        assert!(output.contains("Sending batch count=3"));
        assert!(output.ends_with('\n'));
    }

    #[test]
    fn test_group_span_is_shown_as_the_group_name() {
        let output = capture(|| {
            let group = "group_analytics";
            let span = tracing::info_span!(GROUP_SPAN, name = %group);
            let _entered = span.enter();
            tracing::warn!("CHANNEL | Batch failed");
        });

        assert!(output.starts_with("TELEMETRY | WARN | [group_analytics] "));
        assert!(output.contains("CHANNEL | Batch failed"));
        assert!(!output.contains("name="));
    }
}
