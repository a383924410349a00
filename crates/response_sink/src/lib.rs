//! The thread-safe accumulator into which a request's logs, trace bytes, and
//! final HTTP payload are deposited over the lifetime of a request, and
//! frozen into an immutable [`UpResponse`] at finalization.

use std::sync::Arc;

use parking_lot::Mutex;
use request_context::RequestId;

/// Severity of a single application log line, in increasing order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// Where in the application's source a log line originated, if known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub function: String,
}

/// A single application-emitted log record, possibly one piece of a larger
/// record that was split because it exceeded the configured size limit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppLogLine {
    pub level: LogLevel,
    pub timestamp_us: i64,
    pub message: String,
    pub source_location: Option<SourceLocation>,
}

impl AppLogLine {
    /// The size this line contributes to the writer's byte budget: its
    /// serialized size is approximated by the message length, matching the
    /// byte accounting the writer uses to decide when to flush.
    pub fn serialized_size(&self) -> usize {
        self.message.len()
    }
}

/// A line captured by the runtime-internal log sink, already classified to
/// the two-bit severity scheme the upstream response format uses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeLogLine {
    pub severity: i32,
    pub timestamp_us: i64,
    pub message: String,
}

/// The final HTTP response, once the servlet engine has produced one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponsePayload {
    pub status_code: u32,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
    pub compressed: bool,
}

impl HttpResponsePayload {
    pub fn new(status_code: u32, body: Vec<u8>) -> Self {
        Self {
            status_code,
            body,
            headers: Vec::new(),
            compressed: false,
        }
    }
}

/// A request-level error recorded on the response: a short machine-stable
/// code plus a human-readable detail message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseError {
    pub code: String,
    pub detail: String,
}

#[derive(Default)]
struct UpResponseInner {
    error: Option<ResponseError>,
    http_response: Option<HttpResponsePayload>,
    trace_bytes: Option<Vec<u8>>,
    app_log_lines: Vec<AppLogLine>,
    runtime_log_lines: Vec<RuntimeLogLine>,
    terminate_clone: bool,
    clone_is_unclean: bool,
    user_cpu_megacycles: u64,
}

/// Immutable snapshot produced by [`MutableUpResponse::build`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpResponse {
    pub request_id: RequestId,
    pub error: Option<ResponseError>,
    pub http_response: Option<HttpResponsePayload>,
    pub trace_bytes: Option<Vec<u8>>,
    pub app_log_lines: Vec<AppLogLine>,
    pub runtime_log_lines: Vec<RuntimeLogLine>,
    pub terminate_clone: bool,
    pub clone_is_unclean: bool,
    pub user_cpu_megacycles: u64,
}

/// Mutable, lock-protected response accumulator. Every subsystem that
/// contributes to a request's final response -- the servlet engine, the app
/// log writer, the runtime log sink, the trace writer -- holds a clone of
/// this handle and mutates it through its setters.
#[derive(Clone)]
pub struct MutableUpResponse {
    request_id: RequestId,
    inner: Arc<Mutex<UpResponseInner>>,
}

impl MutableUpResponse {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            inner: Arc::new(Mutex::new(UpResponseInner::default())),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn set_error(&self, code: impl Into<String>, detail: impl Into<String>) {
        self.inner.lock().error = Some(ResponseError {
            code: code.into(),
            detail: detail.into(),
        });
    }

    pub fn has_error(&self) -> bool {
        self.inner.lock().error.is_some()
    }

    pub fn set_http_response(&self, response: HttpResponsePayload) {
        self.inner.lock().http_response = Some(response);
    }

    /// Remove and return the HTTP response set so far, if any. Used by the
    /// post-dispatch compression step, which needs to mutate the body the
    /// servlet engine left behind before putting it back.
    pub fn take_http_response(&self) -> Option<HttpResponsePayload> {
        self.inner.lock().http_response.take()
    }

    /// Whether an HTTP response has been set yet, without consuming it. Used
    /// to decide whether a background-worker run needs the default 200/OK
    /// fallback.
    pub fn has_http_response(&self) -> bool {
        self.inner.lock().http_response.is_some()
    }

    pub fn set_trace_bytes(&self, bytes: Vec<u8>) {
        self.inner.lock().trace_bytes = Some(bytes);
    }

    /// Append a batch of app-log lines, preserving call order. Used by the
    /// app-log writer's flush path.
    pub fn append_app_log_lines(&self, lines: impl IntoIterator<Item = AppLogLine>) {
        self.inner.lock().app_log_lines.extend(lines);
    }

    /// Remove and return every app-log line buffered since the last drain.
    /// `AppLogsWriter` uses this to build each flush's payload: lines live in
    /// the sink only until the batch containing them is flushed to the log
    /// service, matching `currentByteCount`'s reset-on-flush invariant.
    pub fn drain_app_log_lines(&self) -> Vec<AppLogLine> {
        std::mem::take(&mut self.inner.lock().app_log_lines)
    }

    /// Current count and byte size of app-log lines buffered since the last
    /// drain, without consuming them.
    pub fn pending_app_log_bytes(&self) -> usize {
        self.inner
            .lock()
            .app_log_lines
            .iter()
            .map(AppLogLine::serialized_size)
            .sum()
    }

    pub fn append_runtime_log_line(&self, line: RuntimeLogLine) {
        self.inner.lock().runtime_log_lines.push(line);
    }

    pub fn set_terminate_clone(&self) {
        self.inner.lock().terminate_clone = true;
    }

    pub fn terminate_clone(&self) -> bool {
        self.inner.lock().terminate_clone
    }

    pub fn set_clone_is_unclean(&self) {
        self.inner.lock().clone_is_unclean = true;
    }

    pub fn add_user_cpu_megacycles(&self, megacycles: u64) {
        self.inner.lock().user_cpu_megacycles += megacycles;
    }

    /// Freeze the accumulated state into an immutable response. If an HTTP
    /// response was set but carries a zero status code, it's coerced to 400
    /// with a warning logged -- a response is never handed back to the
    /// transport with a meaningless status.
    pub fn build(&self) -> UpResponse {
        let mut inner = self.inner.lock();
        if let Some(ref mut http_response) = inner.http_response {
            if http_response.status_code == 0 {
                tracing::warn!(
                    request_id = %self.request_id,
                    "response had HTTP status code 0, defaulting to 400"
                );
                http_response.status_code = 400;
            }
        }
        UpResponse {
            request_id: self.request_id,
            error: inner.error.clone(),
            http_response: inner.http_response.clone(),
            trace_bytes: inner.trace_bytes.clone(),
            app_log_lines: inner.app_log_lines.clone(),
            runtime_log_lines: inner.runtime_log_lines.clone(),
            terminate_clone: inner.terminate_clone,
            clone_is_unclean: inner.clone_is_unclean,
            user_cpu_megacycles: inner.user_cpu_megacycles,
        }
    }
}

#[cfg(test)]
mod tests {
    use request_context::RequestId;

    use super::*;

    #[test]
    fn app_log_lines_preserve_call_order() {
        let sink = MutableUpResponse::new(RequestId::new_for_test());
        for i in 0..5 {
            sink.append_app_log_lines([AppLogLine {
                level: LogLevel::Info,
                timestamp_us: i,
                message: format!("line {i}"),
                source_location: None,
            }]);
        }
        let response = sink.build();
        let messages: Vec<_> = response
            .app_log_lines
            .iter()
            .map(|l| l.message.as_str())
            .collect();
        assert_eq!(messages, vec!["line 0", "line 1", "line 2", "line 3", "line 4"]);
    }

    #[test]
    fn zero_status_code_defaults_to_400() {
        let sink = MutableUpResponse::new(RequestId::new_for_test());
        sink.set_http_response(HttpResponsePayload::new(0, Vec::new()));
        let response = sink.build();
        assert_eq!(response.http_response.unwrap().status_code, 400);
    }

    #[test]
    fn empty_body_defaults_to_empty_vec() {
        let sink = MutableUpResponse::new(RequestId::new_for_test());
        sink.set_http_response(HttpResponsePayload::new(200, Vec::new()));
        let response = sink.build();
        assert_eq!(response.http_response.unwrap().body, Vec::<u8>::new());
    }

    #[test]
    fn terminate_clone_is_sticky() {
        let sink = MutableUpResponse::new(RequestId::new_for_test());
        assert!(!sink.terminate_clone());
        sink.set_terminate_clone();
        assert!(sink.terminate_clone());
        assert!(sink.build().terminate_clone);
    }
}
