//! Captures the runtime process's own internal log messages into a
//! request's response, instead of (or in addition to) wherever the process's
//! general-purpose logs go.
//!
//! Implemented as a [`tracing_subscriber::Layer`]: installed once as part of
//! the global subscriber, it watches for events whose target falls under a
//! configured runtime-internal namespace and at `INFO` or above, and buffers
//! them (bounded in bytes) until [`RuntimeLogSink::flush_logs`] drains them
//! into a request's [`MutableUpResponse`].

use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
};

use parking_lot::Mutex;
use response_sink::{
    MutableUpResponse,
    RuntimeLogLine,
};
use tracing::{
    field::{
        Field,
        Visit,
    },
    Event,
    Level,
    Subscriber,
};
use tracing_subscriber::{
    layer::Context,
    Layer,
};

const MAX_SIZE_REACHED_MESSAGE: &str = "maximum runtime log size reached";

struct Inner {
    current_size_bytes: usize,
    pending: Vec<RuntimeLogLine>,
    /// Set once the byte budget has been exhausted for the current batch;
    /// suppresses every further record until the next flush so we emit
    /// exactly one "maximum runtime log size reached" placeholder rather
    /// than one per overflowing record.
    capped: bool,
    /// Exception text -> formatted timestamp of its first occurrence this
    /// request, so repeated stack traces (the same failure logged on every
    /// retry of a loop, say) collapse to a single full entry.
    seen_exceptions: HashMap<String, String>,
}

impl Inner {
    fn new() -> Self {
        Self {
            current_size_bytes: 0,
            pending: Vec::new(),
            capped: false,
            seen_exceptions: HashMap::new(),
        }
    }
}

/// Severity classification the response wire format uses: 2 for severe
/// (error), 1 for warning, 0 for everything else.
pub fn severity_for_level(level: &Level) -> i32 {
    match *level {
        Level::ERROR => 2,
        Level::WARN => 1,
        _ => 0,
    }
}

/// A process-wide sink, cloneable because every subsystem that wants to flush
/// it (chiefly `RequestManager::finish_request`) needs its own handle to the
/// same underlying buffer.
#[derive(Clone)]
pub struct RuntimeLogSink {
    max_size_bytes: usize,
    source_namespace_prefix: Arc<str>,
    inner: Arc<Mutex<Inner>>,
}

impl RuntimeLogSink {
    pub fn new(max_size_bytes: usize, source_namespace_prefix: impl Into<Arc<str>>) -> Self {
        Self {
            max_size_bytes,
            source_namespace_prefix: source_namespace_prefix.into(),
            inner: Arc::new(Mutex::new(Inner::new())),
        }
    }

    /// Record one runtime log line, subject to the byte cap.
    pub fn record(&self, severity: i32, timestamp_us: i64, message: String) {
        let mut inner = self.inner.lock();
        if inner.capped {
            return;
        }
        let size = 2 * message.len();
        if inner.current_size_bytes + size > self.max_size_bytes {
            inner.pending.push(RuntimeLogLine {
                severity: 2,
                timestamp_us,
                message: MAX_SIZE_REACHED_MESSAGE.to_string(),
            });
            inner.capped = true;
            return;
        }
        inner.current_size_bytes += size;
        inner.pending.push(RuntimeLogLine {
            severity,
            timestamp_us,
            message,
        });
    }

    /// Record a rendered exception/stack trace, deduplicating by its literal
    /// text: the first occurrence within this request is recorded in full;
    /// later occurrences of the exact same trace are replaced with a short
    /// back-reference to when it first happened.
    pub fn record_exception(
        &self,
        severity: i32,
        timestamp_us: i64,
        exception_text: &str,
        rendered_message: String,
        formatted_timestamp: impl Into<String>,
    ) {
        let already_seen = {
            let mut inner = self.inner.lock();
            match inner.seen_exceptions.get(exception_text) {
                Some(first_seen) => Some(first_seen.clone()),
                None => {
                    inner
                        .seen_exceptions
                        .insert(exception_text.to_string(), formatted_timestamp.into());
                    None
                },
            }
        };
        match already_seen {
            Some(first_seen) => self.record(
                severity,
                timestamp_us,
                format!("(duplicate stack trace, first seen at {first_seen})"),
            ),
            None => self.record(severity, timestamp_us, rendered_message),
        }
    }

    /// Move every buffered line into `sink` and reset all per-request state
    /// (byte budget, cap flag, and exception-dedup map) so the sink is ready
    /// for the next request.
    pub fn flush_logs(&self, sink: &MutableUpResponse) {
        let mut inner = self.inner.lock();
        for line in inner.pending.drain(..) {
            sink.append_runtime_log_line(line);
        }
        inner.current_size_bytes = 0;
        inner.capped = false;
        inner.seen_exceptions.clear();
    }

    pub fn current_size_bytes(&self) -> usize {
        self.inner.lock().current_size_bytes
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

impl<S: Subscriber> Layer<S> for RuntimeLogSink {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !metadata.target().starts_with(&*self.source_namespace_prefix) {
            return;
        }
        // "INFO or above" in increasing severity: ERROR < WARN < INFO in
        // `tracing`'s `Ord` for `Level`, so anything *past* INFO (DEBUG,
        // TRACE) is excluded.
        if *metadata.level() > Level::INFO {
            return;
        }
        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);
        let timestamp_us = 0; // caller context supplies real wall-clock time via `record`
        self.record(
            severity_for_level(metadata.level()),
            timestamp_us,
            visitor.message,
        );
    }
}

#[cfg(test)]
mod tests {
    use response_sink::MutableUpResponse;

    use super::*;

    fn sink() -> MutableUpResponse {
        MutableUpResponse::new(request_context::RequestId::new_for_test())
    }

    #[test]
    fn records_accumulate_current_size_bytes_as_twice_message_length() {
        let log_sink = RuntimeLogSink::new(1_000_000, "runtime_core");
        log_sink.record(0, 1, "hello".to_string());
        assert_eq!(log_sink.current_size_bytes(), 10);
        log_sink.record(1, 2, "world!".to_string());
        assert_eq!(log_sink.current_size_bytes(), 10 + 12);
    }

    #[test]
    fn records_beyond_budget_are_replaced_by_a_single_cap_message() {
        let log_sink = RuntimeLogSink::new(20, "runtime_core");
        log_sink.record(0, 1, "0123456789".to_string()); // 20 bytes, exactly fills budget
        log_sink.record(0, 2, "more".to_string());
        log_sink.record(0, 3, "even more".to_string());
        let up = sink();
        log_sink.flush_logs(&up);
        let lines = up.build().runtime_log_lines;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].message, "maximum runtime log size reached");
    }

    #[test]
    fn flush_resets_state_for_the_next_request() {
        let log_sink = RuntimeLogSink::new(20, "runtime_core");
        log_sink.record(0, 1, "0123456789".to_string());
        log_sink.record(0, 2, "more".to_string());
        let up = sink();
        log_sink.flush_logs(&up);
        assert_eq!(log_sink.current_size_bytes(), 0);
        assert_eq!(log_sink.pending_len(), 0);

        // After reset, a record that would have been capped under the old
        // budget usage is accepted again.
        log_sink.record(0, 3, "0123456789".to_string());
        assert_eq!(log_sink.current_size_bytes(), 20);
    }

    #[test]
    fn severity_mapping_matches_spec() {
        assert_eq!(severity_for_level(&Level::ERROR), 2);
        assert_eq!(severity_for_level(&Level::WARN), 1);
        assert_eq!(severity_for_level(&Level::INFO), 0);
        assert_eq!(severity_for_level(&Level::DEBUG), 0);
    }

    #[test]
    fn repeated_exception_text_collapses_to_a_back_reference() {
        let log_sink = RuntimeLogSink::new(1_000_000, "runtime_core");
        log_sink.record_exception(2, 1, "NullPointerException: boom", "full trace #1".into(), "T0");
        log_sink.record_exception(2, 2, "NullPointerException: boom", "full trace #2".into(), "T1");
        let up = sink();
        log_sink.flush_logs(&up);
        let lines = up.build().runtime_log_lines;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].message, "full trace #1");
        assert!(lines[1].message.contains("duplicate stack trace"));
        assert!(lines[1].message.contains("T0"));
    }
}
