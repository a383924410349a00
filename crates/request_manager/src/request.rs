//! The immutable input message `RequestManager::start_request` is handed,
//! and the opaque per-request handle it returns.

use std::sync::{
    atomic::{
        AtomicBool,
        AtomicU64,
        Ordering,
    },
    Arc,
};
use std::time::Duration;

use errors::RuntimeErrorKind;
use futures::FutureExt;
use parking_lot::Mutex;
use request_context::RequestId;
use response_sink::MutableUpResponse;
use runtime::{
    Runtime,
    UnixTimestamp,
};
use trace_writer::TraceContext;

use crate::{
    app_version::AppVersion,
    state::RequestState,
    timer::CpuRatioTimer,
    transport::{
        Transport,
        DEFAULT_REQUEST_BUDGET_MS,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestType {
    UserHandler,
    BackgroundWorker,
    ShutdownNotification,
}

/// Immutable input handed to `RequestManager::start_request`.
#[derive(Clone, Debug)]
pub struct Request {
    pub security_ticket: String,
    pub global_id: u64,
    pub request_type: RequestType,
    /// Duration until the transport's own hard deadline fires.
    pub deadline: Duration,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub trace_context_header: Option<String>,
    /// Application identity the request is addressed to, checked against
    /// the clone's installed `AppVersion` before dispatch.
    pub app_id: String,
    pub version_id: String,
}

impl Request {
    pub fn trace_context(&self) -> anyhow::Result<Option<TraceContext>> {
        match &self.trace_context_header {
            Some(header) => Ok(Some(TraceContext::parse(header)?)),
            None => Ok(None),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Build a `Request` from whatever a transport reports for one inbound
    /// RPC, applying the default request budget if the transport never
    /// reported a remaining time at all.
    #[allow(clippy::too_many_arguments)]
    pub fn from_transport(
        transport: &impl Transport,
        request_type: RequestType,
        url: String,
        headers: Vec<(String, String)>,
        security_ticket: String,
        trace_context_header: Option<String>,
        app_id: String,
        version_id: String,
    ) -> Self {
        let deadline = transport
            .time_remaining()
            .unwrap_or_else(|| Duration::from_millis(DEFAULT_REQUEST_BUDGET_MS));
        Self {
            security_ticket,
            global_id: transport.global_id(),
            request_type,
            deadline,
            url,
            headers,
            trace_context_header,
            app_id,
            version_id,
        }
    }
}

/// What `finish_request` should do once the response is otherwise ready, set
/// by `start_request` based on whether the request is a snapshot request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndAction {
    None,
    DisableApiHost,
}

/// Lets the deadline pipeline interrupt whatever future is currently
/// suspended on behalf of this request's driver, handing back a specific
/// error rather than just waking it up. One per request; cloned into every
/// place that might need to inject a deadline error (today, only the
/// `RequestManager`'s own deadline-escalation path).
#[derive(Clone)]
pub(crate) struct DeadlineSignal {
    notify: Arc<tokio::sync::Notify>,
    injected_error: Arc<Mutex<Option<RuntimeErrorKind>>>,
}

impl DeadlineSignal {
    fn new() -> Self {
        Self {
            notify: Arc::new(tokio::sync::Notify::new()),
            injected_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Arm the signal with `kind` and wake whoever is currently racing
    /// against it. If called twice (soft deadline, then hard deadline), the
    /// later call wins: the driver only ever observes one injected error.
    pub(crate) fn fire(&self, kind: RuntimeErrorKind) {
        *self.injected_error.lock() = Some(kind);
        self.notify.notify_waiters();
    }
}

/// Opaque per-request handle returned by `start_request`; exactly one
/// `finish_request` call must follow. Holds everything the request
/// lifecycle needs to tear the request down again.
pub struct RequestToken<RT: Runtime> {
    pub request_id: RequestId,
    pub security_ticket: String,
    pub response_sink: MutableUpResponse,
    pub cpu_timer: CpuRatioTimer<RT>,
    pub app_version: Arc<AppVersion>,
    pub hard_deadline: UnixTimestamp,
    pub start_time: UnixTimestamp,
    pub trace_writer: Option<trace_writer::TraceWriter>,
    /// The request's own root span, if tracing is enabled for it. Ended by
    /// `RequestManager::finish_request` just before the trace is flushed.
    pub(crate) root_span: Option<trace_writer::SpanCtx>,
    pub state: Arc<RequestState>,
    pub end_action: EndAction,
    pub request_type: RequestType,
    /// Bumped every time a new deadline action is armed for this request, so
    /// a scheduler entry popped after the request already moved on (escalated
    /// or finished) can recognize it is stale and no-op.
    pub(crate) deadline_generation: AtomicU64,
    /// Set by the soft-deadline action once it has interrupted every worker;
    /// cooperative, nothing forcibly preempts a worker that never checks it.
    pub(crate) interrupted: Arc<AtomicBool>,
    pub(crate) deadline_signal: DeadlineSignal,
    /// Background futures issued on this request's behalf (fire-and-forget
    /// async work, not a worker thread tracked via `RequestState`). Canceled
    /// by the soft-deadline pipeline and drained by `finish_request`.
    background_futures: Mutex<Vec<RT::Handle>>,
}

impl<RT: Runtime> RequestToken<RT> {
    pub fn new(
        request_id: RequestId,
        security_ticket: String,
        response_sink: MutableUpResponse,
        cpu_timer: CpuRatioTimer<RT>,
        app_version: Arc<AppVersion>,
        hard_deadline: UnixTimestamp,
        start_time: UnixTimestamp,
        trace_writer: Option<trace_writer::TraceWriter>,
        root_span: Option<trace_writer::SpanCtx>,
        end_action: EndAction,
        request_type: RequestType,
    ) -> Self {
        Self {
            request_id,
            security_ticket,
            response_sink,
            cpu_timer,
            app_version,
            hard_deadline,
            start_time,
            trace_writer,
            root_span,
            state: Arc::new(RequestState::new()),
            end_action,
            request_type,
            deadline_generation: AtomicU64::new(0),
            interrupted: Arc::new(AtomicBool::new(false)),
            deadline_signal: DeadlineSignal::new(),
            background_futures: Mutex::new(Vec::new()),
        }
    }

    pub fn remaining_time(&self, rt: &RT) -> Duration {
        self.hard_deadline - rt.unix_timestamp()
    }

    /// Register a background future spawned on this request's behalf, so the
    /// soft-deadline pipeline can cancel it before escalating further.
    pub fn register_background_future(&self, handle: RT::Handle) {
        self.background_futures.lock().push(handle);
    }

    /// Request cancellation of every background future registered so far.
    /// Fire-and-forget: does not wait for them to actually stop.
    pub(crate) fn cancel_background_futures(&self) {
        for mut handle in self.background_futures.lock().drain(..) {
            handle.shutdown();
        }
    }

    /// Cancel and wait for every background future registered so far to
    /// finish, swallowing cancellation errors (panics still propagate by
    /// being logged, matching `runtime::shutdown_and_join`).
    pub(crate) async fn drain_background_futures(&self) {
        let handles: Vec<RT::Handle> = std::mem::take(&mut *self.background_futures.lock());
        for handle in handles {
            if let Err(err) = runtime::shutdown_and_join(handle).await {
                tracing::warn!(request_id = %self.request_id, %err, "background future panicked during drain");
            }
        }
    }

    /// Whether the soft-deadline action has already interrupted this
    /// request's workers. Checked cooperatively by code that loops on behalf
    /// of a worker thread.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Race `fut` against a deadline-injected error. If the manager's
    /// deadline pipeline fires before `fut` resolves, this returns the
    /// injected `RuntimeErrorKind` as an error instead of `fut`'s output --
    /// mirroring how an isolate timeout surfaces as an error at the
    /// handler's next suspension point rather than truly preempting it.
    pub async fn race_with_deadline<F, T>(&self, fut: F) -> anyhow::Result<T>
    where
        F: std::future::Future<Output = anyhow::Result<T>>,
    {
        let mut fut = fut.fuse();
        let mut notified = self.deadline_signal.notify.notified().fuse();
        futures::select_biased! {
            result = fut => result,
            () = notified => {
                let kind = self.deadline_signal.injected_error.lock()
                    .take()
                    .unwrap_or(RuntimeErrorKind::HardDeadline);
                Err(anyhow::Error::new(kind))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FakeTransport;

    #[test]
    fn from_transport_uses_the_reported_deadline_when_present() {
        let transport = FakeTransport::new(Duration::from_secs(5), 42);
        let request = Request::from_transport(
            &transport,
            RequestType::UserHandler,
            "/x".to_string(),
            Vec::new(),
            "ticket".to_string(),
            None,
            "app".to_string(),
            "v1".to_string(),
        );
        assert_eq!(request.deadline, Duration::from_secs(5));
        assert_eq!(request.global_id, 42);
    }

    #[test]
    fn from_transport_falls_back_to_the_default_budget_when_unreported() {
        let transport = FakeTransport::new_without_deadline(42);
        let request = Request::from_transport(
            &transport,
            RequestType::UserHandler,
            "/x".to_string(),
            Vec::new(),
            "ticket".to_string(),
            None,
            "app".to_string(),
            "v1".to_string(),
        );
        assert_eq!(request.deadline, Duration::from_millis(DEFAULT_REQUEST_BUDGET_MS));
    }
}
