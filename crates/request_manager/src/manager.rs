//! `RequestManager`: owns every process-wide piece of the request lifecycle
//! and drives one request at a time through `start_request` / `send_deadline`
//! / `finish_request`. Generalizes a per-isolate `Timeout<RT>` (a single
//! background task driving one armed deadline) into a single shared
//! scheduler task driving a min-heap of every live request's armed deadline,
//! since a clone hosts many concurrent requests rather than one isolate per
//! deadline.

use std::{
    cmp::Reverse,
    collections::{
        BinaryHeap,
        HashMap,
    },
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use background_coordinator::BackgroundRequestCoordinator;
use errors::{
    ErrorMetadata,
    RuntimeErrorKind,
};
use futures::FutureExt;
use parking_lot::Mutex;
use request_context::RequestId;
use response_sink::MutableUpResponse;
use runtime::Runtime;
use runtime_log_sink::RuntimeLogSink;
use trace_writer::TraceWriter;

use crate::{
    app_version::AppVersionRegistry,
    clone_settings::CloneSettings,
    deadlock::{
        DeadlockDetector,
        NoDeadlockDetector,
    },
    metrics,
    request::{
        EndAction,
        Request,
        RequestToken,
        RequestType,
    },
    semaphore::ApiRpcLimiter,
    state::WorkerHandle,
};

/// An API-side request for a background worker, carrying whatever opaque
/// payload the application handed the core (execution itself is the servlet
/// engine's concern; the core only brokers the handoff).
pub struct BackgroundRunnable(pub Vec<u8>);

pub type Coordinator<RT> = BackgroundRequestCoordinator<RT, BackgroundRunnable, WorkerHandle>;

/// Tuning knobs independent of both per-process CLI flags
/// ([`crate::flags::RuntimeFlags`]) and per-clone [`CloneSettings`]: these
/// shape the deadline pipeline's own timing rather than anything the
/// application or control plane configures.
#[derive(Clone, Debug)]
pub struct RequestManagerConfig {
    /// Subtracted from the transport's reported deadline before computing a
    /// request's hard deadline, so the core always finishes before the
    /// transport itself times the RPC out.
    pub rpc_deadline_padding: Duration,
    /// How long before the hard deadline the soft deadline fires.
    pub soft_deadline_lead: Duration,
    /// Grace period after the soft deadline fires, before workers are
    /// interrupted, during which the handler may still finish on its own.
    pub soft_deadline_grace_before_interrupt: Duration,
    /// Grace period after workers are interrupted, before the soft-deadline
    /// error is injected and the hard deadline is armed.
    pub soft_deadline_grace_after_interrupt: Duration,
    /// Maximum span count recorded per trace.
    pub max_trace_spans: usize,
    /// Whether every hard-deadline termination marks the clone unclean (the
    /// conservative choice; a more precise implementation would additionally
    /// distinguish whether the driver was suspended mid class-initialization,
    /// which this core has no equivalent concept of).
    pub always_mark_unclean_on_hard_deadline: bool,
    /// How long `finish_request` waits for a request's worker tasks to check
    /// in as forgotten before giving up and reporting `ThreadsStillRunning`
    /// instead of blocking finalization indefinitely.
    pub thread_join_grace: Duration,
    /// When set, `start_request` never arms a soft-deadline action for any
    /// request. Every other part of the lifecycle (finalization, worker
    /// accounting) runs unchanged; only the scheduled escalation is skipped.
    /// Intended for local/test harnesses driving the core directly without a
    /// transport that itself enforces a timeout.
    pub disable_deadline_timers: bool,
}

impl Default for RequestManagerConfig {
    fn default() -> Self {
        Self {
            rpc_deadline_padding: Duration::from_millis(500),
            soft_deadline_lead: Duration::from_secs(2),
            soft_deadline_grace_before_interrupt: Duration::from_millis(150),
            soft_deadline_grace_after_interrupt: Duration::from_secs(1),
            max_trace_spans: trace_writer::DEFAULT_MAX_TRACE_SIZE,
            always_mark_unclean_on_hard_deadline: false,
            thread_join_grace: Duration::from_secs(2),
            disable_deadline_timers: false,
        }
    }
}

struct ArmedDeadline {
    fire_at: tokio::time::Instant,
    request_id: RequestId,
    generation: u64,
    is_hard: bool,
}

impl PartialEq for ArmedDeadline {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at
    }
}
impl Eq for ArmedDeadline {}
impl PartialOrd for ArmedDeadline {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ArmedDeadline {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at.cmp(&other.fire_at)
    }
}

struct Inner<RT: Runtime> {
    rt: RT,
    config: RequestManagerConfig,
    app_versions: AppVersionRegistry,
    log_sink: RuntimeLogSink,
    live: Mutex<HashMap<RequestId, Arc<RequestToken<RT>>>>,
    clone_settings: Mutex<CloneSettings>,
    api_rpc_limiter: ApiRpcLimiter,
    coordinator: Coordinator<RT>,
    deadline_heap: Mutex<BinaryHeap<Reverse<ArmedDeadline>>>,
    deadline_notify: tokio::sync::Notify,
    shutting_down: AtomicBool,
    api_host_enabled: AtomicBool,
    next_worker_handle: AtomicU64,
    deadlock_detector: Arc<dyn DeadlockDetector>,
}

impl<RT: Runtime> Inner<RT> {
    fn is_live(&self, request_id: RequestId) -> bool {
        self.live.lock().contains_key(&request_id)
    }

    fn arm_deadline(&self, token: &RequestToken<RT>, delay: Duration, is_hard: bool) {
        let generation = token.deadline_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let fire_at = self.rt.monotonic_now() + delay;
        self.deadline_heap.lock().push(Reverse(ArmedDeadline {
            fire_at,
            request_id: token.request_id,
            generation,
            is_hard,
        }));
        self.deadline_notify.notify_one();
    }
}

/// Cheaply cloneable handle owning the request-lifecycle core's process-wide
/// state: one per clone process.
pub struct RequestManager<RT: Runtime> {
    inner: Arc<Inner<RT>>,
    scheduler_task: Arc<Mutex<Option<RT::Handle>>>,
}

impl<RT: Runtime> Clone for RequestManager<RT> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            scheduler_task: self.scheduler_task.clone(),
        }
    }
}

impl<RT: Runtime> RequestManager<RT> {
    pub fn new(rt: RT, config: RequestManagerConfig, log_sink: RuntimeLogSink, clone_settings: CloneSettings) -> Self {
        Self::with_deadlock_detector(rt, config, log_sink, clone_settings, Arc::new(NoDeadlockDetector))
    }

    /// Same as `new`, but with a thread-dump facility plugged in place of
    /// the default no-op detector.
    pub fn with_deadlock_detector(
        rt: RT,
        config: RequestManagerConfig,
        log_sink: RuntimeLogSink,
        clone_settings: CloneSettings,
        deadlock_detector: Arc<dyn DeadlockDetector>,
    ) -> Self {
        let api_rpc_limiter = ApiRpcLimiter::new(clone_settings.max_outstanding_api_rpcs.max(1));
        let inner = Arc::new(Inner {
            coordinator: BackgroundRequestCoordinator::new(rt.clone()),
            live: Mutex::new(HashMap::new()),
            clone_settings: Mutex::new(clone_settings),
            api_rpc_limiter,
            deadline_heap: Mutex::new(BinaryHeap::new()),
            deadline_notify: tokio::sync::Notify::new(),
            shutting_down: AtomicBool::new(false),
            api_host_enabled: AtomicBool::new(true),
            next_worker_handle: AtomicU64::new(1),
            app_versions: AppVersionRegistry::new(),
            deadlock_detector,
            log_sink,
            config,
            rt: rt.clone(),
        });
        let scheduler_task = Arc::new(Mutex::new(Some(
            rt.spawn("deadline_scheduler", Self::run_scheduler(inner.clone())),
        )));
        Self {
            inner,
            scheduler_task,
        }
    }

    pub fn app_versions(&self) -> &AppVersionRegistry {
        &self.inner.app_versions
    }

    pub fn coordinator(&self) -> &Coordinator<RT> {
        &self.inner.coordinator
    }

    pub fn api_rpc_limiter(&self) -> &ApiRpcLimiter {
        &self.inner.api_rpc_limiter
    }

    pub fn api_host_enabled(&self) -> bool {
        self.inner.api_host_enabled.load(Ordering::SeqCst)
    }

    /// How many requests are currently registered as live (started but not
    /// yet finished). Used by `getPerformanceData`.
    pub fn live_request_count(&self) -> usize {
        self.inner.live.lock().len()
    }

    /// Allocate an id for a new application-spawned worker task and register
    /// it against `token`'s state, refusing if the request is past the point
    /// where new workers are allowed.
    pub fn register_worker(&self, token: &RequestToken<RT>) -> anyhow::Result<WorkerHandle> {
        let handle = self.inner.next_worker_handle.fetch_add(1, Ordering::SeqCst);
        token.state.record_worker(handle)?;
        Ok(handle)
    }

    /// Begin serving `request`: validate it against the installed
    /// application, compute its deadlines, arm the soft-deadline action, and
    /// register it as live.
    pub async fn start_request(&self, request: Request) -> anyhow::Result<Arc<RequestToken<RT>>> {
        let app_version = self.inner.app_versions.current().ok_or_else(|| {
            anyhow::Error::new(RuntimeErrorKind::UnknownApp).context(ErrorMetadata::not_found(
                "UnknownApp",
                "no application version is running on this clone",
            ))
        })?;
        if !self.inner.app_versions.matches(&request.app_id, &request.version_id) {
            return Err(anyhow::Error::new(RuntimeErrorKind::UnknownApp).context(
                ErrorMetadata::not_found(
                    "UnknownApp",
                    format!(
                        "no application version {}/{} is running on this clone",
                        request.app_id, request.version_id
                    ),
                ),
            ));
        }

        let request_id = RequestId::from_global_id(request.global_id);
        let response_sink = MutableUpResponse::new(request_id);
        let rt = self.inner.rt.clone();
        let now = rt.unix_timestamp();
        // If the transport's remaining time is already shorter than the
        // padding, the padding is not subtracted -- the request keeps the
        // whole of whatever time it actually has left.
        let remaining = if request.deadline < self.inner.config.rpc_deadline_padding {
            request.deadline
        } else {
            request.deadline - self.inner.config.rpc_deadline_padding
        };
        let hard_deadline = now + remaining;

        let now_us = now.as_millis() as i64 * 1000;
        let trace_context = request.trace_context()?;
        let trace_writer = trace_context
            .filter(trace_writer::TraceContext::tracing_requested)
            .map(|ctx| TraceWriter::with_max_trace_size(ctx.trace_id, self.inner.config.max_trace_spans));
        let root_span = trace_writer.as_ref().map(|tw| {
            let span = tw.start_request_span(request.url.clone(), now_us);
            tw.set_label(
                span,
                "security_ticket_present",
                (!request.security_ticket.is_empty()).to_string(),
            );
            span
        });

        let end_action = if request.url == "/_ah/snapshot" && request.header("X-AppEngine-Snapshot").is_some() {
            EndAction::DisableApiHost
        } else {
            EndAction::None
        };

        let cpu_timer = crate::timer::CpuRatioTimer::start(rt.clone());
        let token = Arc::new(RequestToken::new(
            request_id,
            request.security_ticket.clone(),
            response_sink,
            cpu_timer,
            app_version,
            hard_deadline,
            now,
            trace_writer,
            root_span,
            end_action,
            request.request_type,
        ));

        self.inner.live.lock().insert(request_id, token.clone());
        if !self.inner.config.disable_deadline_timers {
            self.inner
                .arm_deadline(&token, remaining.saturating_sub(self.inner.config.soft_deadline_lead), false);
        }

        Ok(token)
    }

    /// Tear a request down: disallow further workers, interrupt any still
    /// running, flush the trace and runtime logs, stop the CPU timer, run the
    /// end action, and deregister the request.
    pub async fn finish_request(&self, token: &Arc<RequestToken<RT>>) {
        token.state.disallow_new_request_thread_creation();
        token.interrupted.store(true, Ordering::SeqCst);

        // The hard deadline already ran its own escalation; waiting again
        // here would only delay a response that's already decided to
        // terminate the clone. Otherwise give workers a bounded grace period
        // to notice they've been interrupted and check out.
        let grace = if token.state.hard_deadline_passed() {
            Duration::ZERO
        } else {
            self.inner.config.thread_join_grace
        };
        if !token.state.wait_until_empty(&self.inner.rt, grace).await {
            let still_running = token.state.workers();
            tracing::warn!(
                request_id = %token.request_id,
                ?still_running,
                "finish_request: worker tasks did not check out in time"
            );
            if !token.response_sink.has_error() {
                token.response_sink.set_error(
                    "ThreadsStillRunning",
                    "the request finished but some of its worker tasks are still running",
                );
            }
            token.response_sink.set_terminate_clone();
        }

        if let Some(tw) = &token.trace_writer {
            if let Some(root_span) = token.root_span {
                let now_us = self.inner.rt.unix_timestamp().as_millis() as i64 * 1000;
                tw.end_span(root_span, now_us);
            }
            tw.flush_trace(&token.response_sink);
        }

        token.drain_background_futures().await;

        // Bump the generation so any scheduler entry already popped for this
        // request recognizes itself as stale and no-ops.
        token.deadline_generation.fetch_add(1, Ordering::SeqCst);
        self.inner.live.lock().remove(&token.request_id);

        let user_cpu_megacycles = token.cpu_timer.stop();
        token.response_sink.add_user_cpu_megacycles(user_cpu_megacycles);

        match token.end_action {
            EndAction::DisableApiHost => {
                self.inner.api_host_enabled.store(false, Ordering::SeqCst);
            },
            EndAction::None => {},
        }

        self.inner.log_sink.flush_logs(&token.response_sink);
    }

    /// External notification that a request's hard deadline has been hit
    /// (e.g. the transport itself observed it), or internal escalation from
    /// the soft-deadline pipeline. A no-op if the request already finished.
    pub async fn send_deadline(&self, request_id: RequestId, is_hard: bool) {
        let Some(token) = self.inner.live.lock().get(&request_id).cloned() else {
            return;
        };
        if is_hard {
            Self::run_hard_deadline(self.inner.clone(), token).await;
        } else {
            Self::run_soft_deadline(self.inner.clone(), token).await;
        }
    }

    /// Invoke the application's shutdown hook equivalent, flush diagnostics,
    /// and mark the request done. The core has no module-unload step of its
    /// own to perform (that's the servlet engine's concern on `stop`).
    pub async fn shutdown_requests(&self, token: &Arc<RequestToken<RT>>) {
        tracing::info!(request_id = %token.request_id, "shutdown notification delivered");
        token
            .response_sink
            .set_http_response(response_sink::HttpResponsePayload::new(200, Vec::new()));
        self.finish_request(token).await;
    }

    /// Atomically swap in new per-clone settings: resize the API RPC limiter
    /// and replace the deadline tables used to classify outbound API calls.
    pub fn apply_clone_settings(&self, settings: CloneSettings) {
        let current_outstanding_estimate = {
            let current = self.inner.clone_settings.lock();
            current
                .max_outstanding_api_rpcs
                .saturating_sub(self.inner.api_rpc_limiter.available_permits())
        };
        self.inner
            .api_rpc_limiter
            .resize(settings.max_outstanding_api_rpcs.max(1), current_outstanding_estimate);
        *self.inner.clone_settings.lock() = settings;
    }

    pub fn clone_settings(&self) -> CloneSettings {
        self.inner.clone_settings.lock().clone()
    }

    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.deadline_notify.notify_waiters();
        if let Some(handle) = self.scheduler_task.lock().take() {
            let _ = runtime::shutdown_and_join(handle).await;
        }
    }

    async fn run_scheduler(inner: Arc<Inner<RT>>) {
        loop {
            if inner.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            let next_fire_at = inner.deadline_heap.lock().peek().map(|Reverse(d)| d.fire_at);
            match next_fire_at {
                None => inner.deadline_notify.notified().await,
                Some(fire_at) => {
                    let now = inner.rt.monotonic_now();
                    if fire_at <= now {
                        let popped = inner.deadline_heap.lock().pop();
                        if let Some(Reverse(deadline)) = popped {
                            Self::dispatch_deadline(&inner, deadline);
                        }
                    } else {
                        let mut wait = inner.rt.wait(fire_at - now);
                        let mut notified = inner.deadline_notify.notified().fuse();
                        futures::select_biased! {
                            () = wait => {},
                            () = notified => {},
                        }
                    }
                },
            }
        }
    }

    fn dispatch_deadline(inner: &Arc<Inner<RT>>, deadline: ArmedDeadline) {
        let token = inner.live.lock().get(&deadline.request_id).cloned();
        let Some(token) = token else {
            return;
        };
        if token.deadline_generation.load(Ordering::SeqCst) != deadline.generation {
            return;
        }
        let inner = inner.clone();
        inner.rt.spawn("deadline_action", async move {
            if deadline.is_hard {
                Self::run_hard_deadline(inner, token).await;
            } else {
                Self::run_soft_deadline(inner, token).await;
            }
        });
    }

    async fn run_soft_deadline(inner: Arc<Inner<RT>>, token: Arc<RequestToken<RT>>) {
        metrics::log_soft_deadline_fired();

        if let Some(cycle) = inner.deadlock_detector.detect_cycle(token.request_id) {
            tracing::error!(request_id = %token.request_id, %cycle, "deadlock cycle detected, finalizing request immediately");
            token.state.disallow_new_request_thread_creation();
            token.response_sink.set_error(
                "LogFatalDeath",
                format!("deadlock detected among this request's worker tasks: {cycle}"),
            );
            token.response_sink.set_terminate_clone();
            token.response_sink.set_clone_is_unclean();
            token.deadline_signal.fire(RuntimeErrorKind::LogFatalDeath);
            return;
        }

        token.state.disallow_new_request_thread_creation();
        token.cancel_background_futures();

        inner
            .rt
            .wait(inner.config.soft_deadline_grace_before_interrupt)
            .await;
        if inner.is_live(token.request_id) {
            token.interrupted.store(true, Ordering::SeqCst);
            inner
                .rt
                .wait(inner.config.soft_deadline_grace_after_interrupt)
                .await;
        }

        token.state.set_soft_deadline_passed();

        if inner.is_live(token.request_id) {
            token.response_sink.set_error(
                "RequestSoftDeadlineExceeded",
                "the request exceeded its soft deadline and is being cleaned up",
            );
            token.deadline_signal.fire(RuntimeErrorKind::SoftDeadline);
            let hard_delay = token
                .remaining_time(&inner.rt)
                .min(inner.config.soft_deadline_grace_after_interrupt);
            inner.arm_deadline(&token, hard_delay, true);
        }
    }

    async fn run_hard_deadline(inner: Arc<Inner<RT>>, token: Arc<RequestToken<RT>>) {
        if !inner.is_live(token.request_id) {
            return;
        }
        metrics::log_hard_deadline_fired();
        token.state.set_hard_deadline_passed();
        token.response_sink.set_error(
            "RequestHardDeadlineExceeded",
            "the request exceeded its hard deadline and was terminated",
        );
        token.response_sink.set_terminate_clone();
        if inner.config.always_mark_unclean_on_hard_deadline {
            token.response_sink.set_clone_is_unclean();
        }
        metrics::log_terminate_clone();
        token.deadline_signal.fire(RuntimeErrorKind::HardDeadline);
    }
}

#[cfg(test)]
mod tests {
    use runtime::testing::TestRuntime;
    use runtime_log_sink::RuntimeLogSink;

    use super::*;
    use crate::{
        app_version::AppVersion,
        deadlock::{
            DeadlockCycle,
            FixedDeadlockDetector,
        },
        request::RequestType,
    };

    fn manager(rt: TestRuntime, config: RequestManagerConfig) -> RequestManager<TestRuntime> {
        let manager = RequestManager::new(
            rt,
            config,
            RuntimeLogSink::new(1_000_000, "manager_test"),
            CloneSettings {
                max_outstanding_api_rpcs: 10,
                ..Default::default()
            },
        );
        manager
            .app_versions()
            .install(AppVersion {
                app_id: "app".to_string(),
                version_id: "v1".to_string(),
                root_directory: "/app".to_string(),
                environment: Vec::new(),
            })
            .unwrap();
        manager
    }

    fn sample_request() -> Request {
        Request {
            security_ticket: "ticket".to_string(),
            global_id: 1,
            request_type: RequestType::UserHandler,
            deadline: Duration::from_secs(30),
            url: "/hello".to_string(),
            headers: Vec::new(),
            trace_context_header: None,
            app_id: "app".to_string(),
            version_id: "v1".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disable_deadline_timers_skips_arming_the_soft_deadline() {
        let rt = TestRuntime::new();
        let mut config = RequestManagerConfig::default();
        config.disable_deadline_timers = true;
        let manager = manager(rt.clone(), config);
        let token = manager.start_request(sample_request()).await.unwrap();
        assert!(manager.inner.deadline_heap.lock().is_empty());

        // Even a long wait must not trigger an escalation that was never armed.
        rt.advance(Duration::from_secs(60)).await;
        assert!(!token.state.soft_deadline_passed());
        manager.finish_request(&token).await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_request_rejects_an_app_version_other_than_the_installed_one() {
        let rt = TestRuntime::new();
        let manager = manager(rt, RequestManagerConfig::default());
        let mut request = sample_request();
        request.version_id = "v2".to_string();
        let err = manager.start_request(request).await.unwrap_err();
        assert!(format!("{err:#}").contains("UnknownApp"));
        assert_eq!(manager.live_request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_request_does_not_subtract_padding_past_the_remaining_time() {
        let rt = TestRuntime::new();
        let mut config = RequestManagerConfig::default();
        config.rpc_deadline_padding = Duration::from_secs(10);
        let manager = manager(rt.clone(), config);
        let mut request = sample_request();
        request.deadline = Duration::from_secs(5);
        let token = manager.start_request(request).await.unwrap();
        assert_eq!(token.remaining_time(&rt), Duration::from_secs(5));
        manager.finish_request(&token).await;
    }

    #[tokio::test(start_paused = true)]
    async fn soft_deadline_cancels_background_futures_before_interrupting_workers() {
        let rt = TestRuntime::new();
        let manager = manager(rt.clone(), RequestManagerConfig::default());
        let token = manager.start_request(sample_request()).await.unwrap();

        let canceled = Arc::new(AtomicBool::new(false));
        let canceled_clone = canceled.clone();
        let handle = rt.spawn("background_future", async move {
            futures::future::pending::<()>().await;
            canceled_clone.store(true, Ordering::SeqCst);
        });
        token.register_background_future(handle);

        let soft_deadline = tokio::spawn({
            let manager = manager.clone();
            let request_id = token.request_id;
            async move {
                manager.send_deadline(request_id, false).await;
            }
        });
        rt.advance(Duration::from_secs(2)).await;
        soft_deadline.await.unwrap();

        assert!(token.is_interrupted());
        // The future was aborted rather than left to run to completion.
        assert!(!canceled.load(Ordering::SeqCst));
        manager.finish_request(&token).await;
    }

    #[tokio::test(start_paused = true)]
    async fn finish_request_with_no_workers_reports_no_error() {
        let rt = TestRuntime::new();
        let manager = manager(rt, RequestManagerConfig::default());
        let token = manager.start_request(sample_request()).await.unwrap();
        manager.finish_request(&token).await;
        let response = token.response_sink.build();
        assert!(response.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn finish_request_reports_threads_still_running_if_a_worker_never_checks_out() {
        let rt = TestRuntime::new();
        let mut config = RequestManagerConfig::default();
        config.thread_join_grace = Duration::from_millis(50);
        let manager = manager(rt.clone(), config);
        let token = manager.start_request(sample_request()).await.unwrap();
        manager.register_worker(&token).unwrap();

        let finish = tokio::spawn({
            let manager = manager.clone();
            let token = token.clone();
            async move {
                manager.finish_request(&token).await;
            }
        });
        rt.advance(Duration::from_millis(100)).await;
        finish.await.unwrap();

        let response = token.response_sink.build();
        let error = response.error.expect("expected ThreadsStillRunning error");
        assert_eq!(error.code, "ThreadsStillRunning");
    }

    #[tokio::test(start_paused = true)]
    async fn finish_request_does_not_wait_once_the_hard_deadline_already_passed() {
        let rt = TestRuntime::new();
        let mut config = RequestManagerConfig::default();
        config.thread_join_grace = Duration::from_secs(60);
        let manager = manager(rt.clone(), config);
        let token = manager.start_request(sample_request()).await.unwrap();
        manager.register_worker(&token).unwrap();
        token.state.set_hard_deadline_passed();

        // Would hang for 60s if finish_request still waited out the grace
        // period; the test timing out is the failure signal here.
        manager.finish_request(&token).await;
        let response = token.response_sink.build();
        assert_eq!(response.error.unwrap().code, "ThreadsStillRunning");
    }

    #[tokio::test(start_paused = true)]
    async fn soft_deadline_short_circuits_on_a_detected_deadlock() {
        let rt = TestRuntime::new();
        let manager_with_detector = {
            let cycle = DeadlockCycle("worker-1 waits on worker-2 waits on worker-1".to_string());
            RequestManager::with_deadlock_detector(
                rt.clone(),
                RequestManagerConfig::default(),
                RuntimeLogSink::new(1_000_000, "manager_test"),
                CloneSettings::default(),
                Arc::new(FixedDeadlockDetector(Some(cycle))),
            )
        };
        manager_with_detector
            .app_versions()
            .install(AppVersion {
                app_id: "app".to_string(),
                version_id: "v1".to_string(),
                root_directory: "/app".to_string(),
                environment: Vec::new(),
            })
            .unwrap();
        let token = manager_with_detector.start_request(sample_request()).await.unwrap();

        manager_with_detector.send_deadline(token.request_id, false).await;

        let response = token.response_sink.build();
        let error = response.error.expect("expected a LogFatalDeath error");
        assert_eq!(error.code, "LogFatalDeath");
        assert!(response.terminate_clone);
        assert!(response.clone_is_unclean);
    }
}
