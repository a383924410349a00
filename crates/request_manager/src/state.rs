//! Per-request mutable flags and the registry of worker tasks a request has
//! spawned, all protected by a single lock.

use std::{
    collections::BTreeSet,
    time::Duration,
};

use errors::ErrorMetadata;
use parking_lot::Mutex;
use runtime::Runtime;

/// Opaque handle identifying one application-spawned worker task, used only
/// for set membership (insertion order doesn't matter; a `BTreeSet` gives a
/// stable, dedupable snapshot).
pub type WorkerHandle = u64;

struct Inner {
    allow_new_request_thread_creation: bool,
    soft_deadline_passed: bool,
    hard_deadline_passed: bool,
    request_threads: BTreeSet<WorkerHandle>,
}

/// Per-request state, all mutations guarded by one lock. Never acquires any
/// other component's lock while holding its own.
pub struct RequestState {
    inner: Mutex<Inner>,
    /// Fired every time a worker is forgotten, so finalization can wait for
    /// `workers()` to drain without busy-polling.
    drained: tokio::sync::Notify,
}

impl Default for RequestState {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                allow_new_request_thread_creation: true,
                soft_deadline_passed: false,
                hard_deadline_passed: false,
                request_threads: BTreeSet::new(),
            }),
            drained: tokio::sync::Notify::new(),
        }
    }

    pub fn allow_new_request_thread_creation(&self) -> bool {
        self.inner.lock().allow_new_request_thread_creation
    }

    pub fn disallow_new_request_thread_creation(&self) {
        self.inner.lock().allow_new_request_thread_creation = false;
    }

    pub fn soft_deadline_passed(&self) -> bool {
        self.inner.lock().soft_deadline_passed
    }

    pub fn set_soft_deadline_passed(&self) {
        self.inner.lock().soft_deadline_passed = true;
    }

    pub fn hard_deadline_passed(&self) -> bool {
        self.inner.lock().hard_deadline_passed
    }

    pub fn set_hard_deadline_passed(&self) {
        self.inner.lock().hard_deadline_passed = true;
    }

    /// Register a worker. Refuses once `allow_new_request_thread_creation`
    /// has been turned off (soft deadline escalation or finalization).
    pub fn record_worker(&self, handle: WorkerHandle) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if !inner.allow_new_request_thread_creation {
            anyhow::bail!(ErrorMetadata::overloaded(
                "RequestThreadCreationDisallowed",
                "this request is no longer allowed to start new worker tasks",
            ));
        }
        inner.request_threads.insert(handle);
        Ok(())
    }

    pub fn forget_worker(&self, handle: WorkerHandle) {
        self.inner.lock().request_threads.remove(&handle);
        self.drained.notify_waiters();
    }

    pub fn workers(&self) -> Vec<WorkerHandle> {
        self.inner.lock().request_threads.iter().copied().collect()
    }

    /// Wait up to `bound` for every registered worker to be forgotten.
    /// Returns `true` if the set drained in time, `false` if `bound` elapsed
    /// first -- the caller is expected to log a warning and proceed rather
    /// than block finalization indefinitely, per the cooperative-cancellation
    /// model: a worker that never checks in on its own has no forcible join.
    pub async fn wait_until_empty<RT: Runtime>(&self, rt: &RT, bound: Duration) -> bool {
        use futures::FutureExt;

        if self.inner.lock().request_threads.is_empty() {
            return true;
        }
        let mut remaining = bound;
        loop {
            let mut notified = self.drained.notified().fuse();
            if self.inner.lock().request_threads.is_empty() {
                return true;
            }
            let start = rt.monotonic_now();
            let mut timeout = rt.wait(remaining);
            futures::select_biased! {
                () = notified => {
                    if self.inner.lock().request_threads.is_empty() {
                        return true;
                    }
                    remaining = remaining.saturating_sub(rt.monotonic_now() - start);
                    if remaining.is_zero() {
                        return self.inner.lock().request_threads.is_empty();
                    }
                },
                () = timeout => return self.inner.lock().request_threads.is_empty(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_registration_is_refused_once_new_threads_are_disallowed() {
        let state = RequestState::new();
        state.record_worker(1).unwrap();
        state.disallow_new_request_thread_creation();
        assert!(state.record_worker(2).is_err());
        assert_eq!(state.workers(), vec![1]);
    }

    #[test]
    fn forget_worker_removes_from_the_snapshot() {
        let state = RequestState::new();
        state.record_worker(1).unwrap();
        state.record_worker(2).unwrap();
        state.forget_worker(1);
        assert_eq!(state.workers(), vec![2]);
    }

    #[test]
    fn deadline_flags_start_false_and_are_sticky_once_set() {
        let state = RequestState::new();
        assert!(!state.soft_deadline_passed());
        state.set_soft_deadline_passed();
        assert!(state.soft_deadline_passed());
        assert!(!state.hard_deadline_passed());
        state.set_hard_deadline_passed();
        assert!(state.hard_deadline_passed());
    }
}
