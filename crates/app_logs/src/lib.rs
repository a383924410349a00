//! Batches application log lines written during a single request, splitting
//! oversized records and flushing them to the log service asynchronously with
//! at most one flush in flight at a time.
//!
//! The writer appends every record straight into the request's
//! [`MutableUpResponse`] as it arrives (so tests and in-process observers can
//! see log lines immediately), then periodically drains that buffer and hands
//! the drained batch to a [`LogFlusher`] in the background. Draining is what
//! keeps `current_byte_count` honest: it always equals the serialized size of
//! whatever's sitting in the sink's app-log list, because that list only ever
//! holds lines written since the last drain.

use std::{
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    future::BoxFuture,
    FutureExt,
};
use parking_lot::Mutex;
use response_sink::{
    AppLogLine,
    MutableUpResponse,
};
use runtime::Runtime;

mod metrics;
mod split;

pub use split::split_log_record;

/// A group of log lines handed to the log service in a single flush.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogGroup {
    pub lines: Vec<AppLogLine>,
}

/// Opaque handle to a completed (or completing) flush, returned by
/// [`LogFlusher::flush`]. The writer doesn't inspect it; it exists so
/// production implementations can report back a request id or similar for
/// debugging without changing the trait's shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushHandle(pub u64);

/// The log-service boundary: hands a batch of log lines off to be persisted
/// and/or forwarded out of process. Flushing is best-effort -- a failure is
/// logged and the lines are allowed to be lost, never propagated as a request
/// failure.
#[async_trait]
pub trait LogFlusher: Send + Sync {
    async fn flush(&self, group: LogGroup) -> anyhow::Result<FlushHandle>;
}

/// Immutable configuration for an [`AppLogsWriter`], set once at
/// construction from the process's CLI flags.
#[derive(Clone, Copy, Debug)]
pub struct AppLogsWriterConfig {
    /// Flush as soon as the buffered batch would exceed this many bytes.
    /// Zero disables size-triggered flushing.
    pub max_bytes_to_flush: usize,
    /// Records longer than this are split into multiple pieces. Must be at
    /// least 1024 so the splitting algorithm always has room for its
    /// continuation markers.
    pub max_log_message_length: usize,
    /// Flush if this many seconds have elapsed since the oldest line in the
    /// current batch was buffered. Zero disables time-triggered flushing.
    pub max_seconds_between_flush: u64,
}

impl AppLogsWriterConfig {
    pub fn new(
        max_bytes_to_flush: usize,
        max_log_message_length: usize,
        max_seconds_between_flush: u64,
    ) -> Self {
        assert!(
            max_log_message_length >= 1024,
            "max_log_message_length must be at least 1024, got {max_log_message_length}"
        );
        Self {
            max_bytes_to_flush,
            max_log_message_length,
            max_seconds_between_flush,
        }
    }
}

impl Default for AppLogsWriterConfig {
    fn default() -> Self {
        Self::new(100 * 1024, 16 * 1024, 1)
    }
}

struct WriterState {
    current_byte_count: usize,
    /// Completes when the in-flight flush (if any) finishes. `None` means no
    /// flush is currently outstanding.
    current_flush: Option<BoxFuture<'static, ()>>,
    /// Monotonic instant the first line of the current (unflushed) batch was
    /// buffered, used to drive `max_seconds_between_flush`.
    stopwatch_start: Option<tokio::time::Instant>,
}

/// Batches, splits, and flushes one request's application log lines.
///
/// Not `Clone`: a writer is owned by the single request that created it, and
/// is driven from whatever task is executing the user handler plus the
/// background stopwatch task spawned in [`AppLogsWriter::new`].
pub struct AppLogsWriter<RT: Runtime> {
    rt: RT,
    config: AppLogsWriterConfig,
    sink: MutableUpResponse,
    flusher: Arc<dyn LogFlusher>,
    state: Arc<Mutex<WriterState>>,
    stopwatch_task: Mutex<Option<RT::Handle>>,
}

impl<RT: Runtime> AppLogsWriter<RT> {
    pub fn new(
        rt: RT,
        config: AppLogsWriterConfig,
        sink: MutableUpResponse,
        flusher: Arc<dyn LogFlusher>,
    ) -> Self {
        let state = Arc::new(Mutex::new(WriterState {
            current_byte_count: 0,
            current_flush: None,
            stopwatch_start: None,
        }));
        let stopwatch_task = (config.max_seconds_between_flush > 0).then(|| {
            Self::spawn_stopwatch_task(
                rt.clone(),
                config,
                sink.clone(),
                flusher.clone(),
                state.clone(),
            )
        });
        Self {
            rt,
            config,
            sink,
            flusher,
            state,
            stopwatch_task: Mutex::new(stopwatch_task),
        }
    }

    /// Background task matching the "small shared pool of scheduler tasks...
    /// runs timed log flushes" duty from the concurrency model: even a
    /// request that stops logging before its batch ages out still gets
    /// flushed eventually, not just on the next `add_log_record` call.
    fn spawn_stopwatch_task(
        rt: RT,
        config: AppLogsWriterConfig,
        sink: MutableUpResponse,
        flusher: Arc<dyn LogFlusher>,
        state: Arc<Mutex<WriterState>>,
    ) -> RT::Handle {
        let poll_every = Duration::from_millis(250).min(Duration::from_secs(
            config.max_seconds_between_flush.max(1),
        ));
        rt.spawn("app_logs_stopwatch", {
            let rt = rt.clone();
            async move {
                loop {
                    rt.wait(poll_every).await;
                    let due = {
                        let state = state.lock();
                        state.stopwatch_start.is_some_and(|start| {
                            rt.monotonic_now() - start
                                >= Duration::from_secs(config.max_seconds_between_flush)
                        })
                    };
                    if due {
                        Self::start_flush(&rt, &config, &sink, &flusher, &state).await;
                    }
                }
            }
        })
    }

    /// Append one log record, splitting it if it exceeds
    /// `max_log_message_length` and flushing the current batch first if
    /// appending would push it over `max_bytes_to_flush`.
    pub async fn add_log_record(&self, record: AppLogLine) {
        let pieces = split_log_record(&record, self.config.max_log_message_length);
        for piece in pieces {
            let size = piece.serialized_size();
            let exceeds_budget = self.config.max_bytes_to_flush > 0
                && self.state.lock().current_byte_count + size > self.config.max_bytes_to_flush;
            if exceeds_budget {
                Self::start_flush(
                    &self.rt,
                    &self.config,
                    &self.sink,
                    &self.flusher,
                    &self.state,
                )
                .await;
            }
            self.sink.append_app_log_lines([piece]);
            let mut state = self.state.lock();
            state.current_byte_count += size;
            if state.stopwatch_start.is_none() {
                state.stopwatch_start = Some(self.rt.monotonic_now());
            }
        }
        let timed_out = {
            let state = self.state.lock();
            self.config.max_seconds_between_flush > 0
                && state.stopwatch_start.is_some_and(|start| {
                    self.rt.monotonic_now() - start
                        > Duration::from_secs(self.config.max_seconds_between_flush)
                })
        };
        if timed_out {
            Self::start_flush(
                &self.rt,
                &self.config,
                &self.sink,
                &self.flusher,
                &self.state,
            )
            .await;
        }
    }

    /// Start one last flush of whatever remains buffered and wait for it to
    /// complete. Called once at request finalization.
    pub async fn flush_and_wait(&self) {
        Self::start_flush(
            &self.rt,
            &self.config,
            &self.sink,
            &self.flusher,
            &self.state,
        )
        .await;
        self.wait_for_current_flush().await;
        if let Some(mut task) = self.stopwatch_task.lock().take() {
            task.shutdown();
        }
    }

    async fn wait_for_current_flush(&self) {
        let maybe_flush = self.state.lock().current_flush.take();
        if let Some(flush) = maybe_flush {
            flush.await;
        }
    }

    /// Drain whatever is currently buffered in the sink and hand it to the
    /// flusher in the background. A no-op if nothing is buffered. Awaits any
    /// flush already in flight before draining, so at most one flush is ever
    /// running regardless of which path (size budget, stopwatch, or manual)
    /// triggers it.
    async fn start_flush(
        rt: &RT,
        _config: &AppLogsWriterConfig,
        sink: &MutableUpResponse,
        flusher: &Arc<dyn LogFlusher>,
        state: &Arc<Mutex<WriterState>>,
    ) {
        let prior_flush = state.lock().current_flush.take();
        if let Some(flush) = prior_flush {
            flush.await;
        }
        let lines = sink.drain_app_log_lines();
        {
            let mut state = state.lock();
            state.current_byte_count = 0;
            state.stopwatch_start = None;
        }
        if lines.is_empty() {
            return;
        }
        metrics::log_flush_started(lines.len());
        let flusher = flusher.clone();
        let handle = rt.spawn("app_logs_flush", async move {
            if let Err(e) = flusher.flush(LogGroup { lines }).await {
                tracing::warn!(
                    "app log flush failed, logs lost for this batch (best-effort): {e:#}"
                );
                metrics::log_flush_failed();
            }
        });
        let mut handle = handle;
        let joined: BoxFuture<'static, ()> = async move {
            let _ = handle.join().await;
        }
        .boxed();
        state.lock().current_flush = Some(joined);
    }
}

/// Test double that records every flushed group instead of sending it
/// anywhere, so tests can assert on exactly what was flushed and when.
pub struct RecordingLogFlusher {
    flushed: Mutex<Vec<LogGroup>>,
    next_handle: Mutex<u64>,
}

impl RecordingLogFlusher {
    pub fn new() -> Self {
        Self {
            flushed: Mutex::new(Vec::new()),
            next_handle: Mutex::new(0),
        }
    }

    pub fn flushed_groups(&self) -> Vec<LogGroup> {
        self.flushed.lock().clone()
    }

    pub fn flushed_lines(&self) -> Vec<AppLogLine> {
        self.flushed
            .lock()
            .iter()
            .flat_map(|g| g.lines.clone())
            .collect()
    }
}

impl Default for RecordingLogFlusher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogFlusher for RecordingLogFlusher {
    async fn flush(&self, group: LogGroup) -> anyhow::Result<FlushHandle> {
        let mut next_handle = self.next_handle.lock();
        let handle = FlushHandle(*next_handle);
        *next_handle += 1;
        self.flushed.lock().push(group);
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::Duration,
    };

    use request_context::RequestId;
    use response_sink::{
        LogLevel,
        MutableUpResponse,
    };
    use runtime::{
        testing::TestRuntime,
        Runtime,
    };

    use super::*;

    fn line(msg: &str) -> AppLogLine {
        AppLogLine {
            level: LogLevel::Info,
            timestamp_us: 0,
            message: msg.to_string(),
            source_location: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_two_lines_no_flush_until_finalize() {
        let rt = TestRuntime::new();
        let sink = MutableUpResponse::new(RequestId::new_for_test());
        let flusher = Arc::new(RecordingLogFlusher::new());
        let writer = AppLogsWriter::new(
            rt,
            AppLogsWriterConfig::new(0, 1024, 0),
            sink.clone(),
            flusher.clone(),
        );
        writer.add_log_record(line("a")).await;
        writer.add_log_record(line("b")).await;
        assert!(flusher.flushed_groups().is_empty());
        assert_eq!(sink.build().app_log_lines.len(), 2);

        writer.flush_and_wait().await;
        assert_eq!(flusher.flushed_lines().len(), 2);
        // Lines are drained from the sink once flushed.
        assert_eq!(sink.build().app_log_lines.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_size_threshold_equal_to_one_message_forces_flush_on_every_add() {
        let rt = TestRuntime::new();
        let sink = MutableUpResponse::new(RequestId::new_for_test());
        let flusher = Arc::new(RecordingLogFlusher::new());
        let msg = "x".repeat(100);
        let writer = AppLogsWriter::new(
            rt,
            AppLogsWriterConfig::new(100, 1024, 0),
            sink,
            flusher.clone(),
        );
        for _ in 0..3 {
            writer.add_log_record(line(&msg)).await;
        }
        // Every add after the first pushes the running total over budget,
        // forcing the previous batch out before the new line lands.
        assert_eq!(flusher.flushed_groups().len(), 2);
        writer.flush_and_wait().await;
        assert_eq!(flusher.flushed_groups().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn max_seconds_between_flush_zero_disables_time_based_flushing() {
        let rt = TestRuntime::new();
        let sink = MutableUpResponse::new(RequestId::new_for_test());
        let flusher = Arc::new(RecordingLogFlusher::new());
        let writer = AppLogsWriter::new(
            rt.clone(),
            AppLogsWriterConfig::new(0, 1024, 0),
            sink,
            flusher.clone(),
        );
        writer.add_log_record(line("a")).await;
        rt.advance(Duration::from_secs(3600)).await;
        assert!(flusher.flushed_groups().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn time_based_flush_fires_without_further_adds() {
        let rt = TestRuntime::new();
        let sink = MutableUpResponse::new(RequestId::new_for_test());
        let flusher = Arc::new(RecordingLogFlusher::new());
        let writer = AppLogsWriter::new(
            rt.clone(),
            AppLogsWriterConfig::new(0, 1024, 2),
            sink,
            flusher.clone(),
        );
        writer.add_log_record(line("a")).await;
        assert!(flusher.flushed_groups().is_empty());
        rt.advance(Duration::from_secs(3)).await;
        // Give the background stopwatch task a chance to observe the clock.
        tokio::task::yield_now().await;
        rt.advance(Duration::from_millis(300)).await;
        tokio::task::yield_now().await;
        assert_eq!(flusher.flushed_groups().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_flush_in_flight() {
        let rt = TestRuntime::new();
        let sink = MutableUpResponse::new(RequestId::new_for_test());
        let flusher = Arc::new(RecordingLogFlusher::new());
        let writer = Arc::new(AppLogsWriter::new(
            rt,
            AppLogsWriterConfig::new(10, 1024, 0),
            sink,
            flusher,
        ));
        let mut handles = Vec::new();
        for i in 0..20 {
            let writer = writer.clone();
            let msg = format!("line-{i}");
            handles.push(tokio::spawn(async move {
                writer.add_log_record(line(&msg)).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        writer.flush_and_wait().await;
    }
}
