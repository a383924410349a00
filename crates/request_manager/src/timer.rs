//! Wallclock + CPU-time measurement for a single request. This timer owns the
//! wall-clock half, and on `stop` derives an estimated user-cycle count from
//! elapsed wall time (assuming a fixed clock rate) for `finish_request` to
//! write into the response sink via `MutableUpResponse::add_user_cpu_megacycles`.

use std::sync::atomic::{
    AtomicBool,
    Ordering,
};

use runtime::Runtime;

use crate::metrics;

/// `stop` takes `&self` (not `&mut self`): a `RequestToken` is shared between
/// the task driving the handler and the manager's live-request registry, so
/// nothing holds an exclusive reference to its timer by the time the request
/// finishes.
/// Assumed CPU clock rate used to turn elapsed wall time into an estimated
/// cycle count, in the absence of a real per-thread CPU-time syscall. 2 GHz
/// is a conservative, round figure for the instance classes this runs on.
const ASSUMED_CLOCK_HZ: f64 = 2_000_000_000.0;

pub struct CpuRatioTimer<RT: Runtime> {
    rt: RT,
    start: tokio::time::Instant,
    stopped: AtomicBool,
}

impl<RT: Runtime> CpuRatioTimer<RT> {
    pub fn start(rt: RT) -> Self {
        let start = rt.monotonic_now();
        Self {
            rt,
            start,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.rt.monotonic_now() - self.start
    }

    /// Stop the timer, report the request's wall-clock time, and return the
    /// estimated user-cycle count in megacycles for the caller to write into
    /// the response sink. Idempotent: `finish_request` always calls this, but
    /// a request that never got far enough to start one (e.g. failed in
    /// `start_request`) should not double-report, so later calls return 0.
    pub fn stop(&self) -> u64 {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let elapsed = self.elapsed();
        metrics::log_request_wall_time(elapsed.as_secs_f64());
        (elapsed.as_secs_f64() * ASSUMED_CLOCK_HZ / 1_000_000.0) as u64
    }
}

impl<RT: Runtime> Drop for CpuRatioTimer<RT> {
    fn drop(&mut self) {
        self.stop();
    }
}
