//! The RPC transport boundary: everything the request core needs from
//! whatever framed-message protocol actually delivered the request. A real
//! adapter lives with the RPC layer (out of scope here); this crate ships
//! only the trait and an in-memory test double.

use std::time::Duration;

/// Request budget assumed when a transport never reports a remaining time
/// for an RPC at all (as opposed to reporting a short one).
pub const DEFAULT_REQUEST_BUDGET_MS: u64 = 60_000;

/// What the core calls to finish responding to one RPC.
pub trait Transport: Send + Sync {
    fn finish_with_response(&self, bytes: Vec<u8>);
    fn finish_with_app_error(&self, code: &str, detail: &str);
    /// `None` if the transport never reported a remaining time for this
    /// RPC; callers building a `Request` from it fall back to
    /// [`DEFAULT_REQUEST_BUDGET_MS`].
    fn time_remaining(&self) -> Option<Duration>;
    fn start_time_millis(&self) -> u64;
    fn global_id(&self) -> u64;
}

/// In-memory `Transport` used by tests: records whichever of the two finish
/// calls happened, and reports a fixed deadline/id.
pub struct FakeTransport {
    pub deadline: Option<Duration>,
    pub start_time_millis: u64,
    pub global_id: u64,
    pub finished: parking_lot::Mutex<Option<FakeTransportResult>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FakeTransportResult {
    Response(Vec<u8>),
    AppError { code: String, detail: String },
}

impl FakeTransport {
    pub fn new(deadline: Duration, global_id: u64) -> Self {
        Self {
            deadline: Some(deadline),
            start_time_millis: 0,
            global_id,
            finished: parking_lot::Mutex::new(None),
        }
    }

    /// A transport that never reports a remaining time for this RPC, so a
    /// `Request` built from it falls back to [`DEFAULT_REQUEST_BUDGET_MS`].
    pub fn new_without_deadline(global_id: u64) -> Self {
        Self {
            deadline: None,
            start_time_millis: 0,
            global_id,
            finished: parking_lot::Mutex::new(None),
        }
    }

    pub fn result(&self) -> Option<FakeTransportResult> {
        self.finished.lock().clone()
    }
}

impl Transport for FakeTransport {
    fn finish_with_response(&self, bytes: Vec<u8>) {
        *self.finished.lock() = Some(FakeTransportResult::Response(bytes));
    }

    fn finish_with_app_error(&self, code: &str, detail: &str) {
        *self.finished.lock() = Some(FakeTransportResult::AppError {
            code: code.to_string(),
            detail: detail.to_string(),
        });
    }

    fn time_remaining(&self) -> Option<Duration> {
        self.deadline
    }

    fn start_time_millis(&self) -> u64 {
        self.start_time_millis
    }

    fn global_id(&self) -> u64 {
        self.global_id
    }
}
