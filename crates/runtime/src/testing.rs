//! Deterministic `Runtime` for tests. Time only moves when the test
//! explicitly advances it, so deadline/rendezvous timing assertions don't
//! need real sleeps and aren't flaky under load.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    time::{
        Duration,
        SystemTime,
    },
};

use futures::future::{
    BoxFuture,
    FusedFuture,
    FutureExt,
};
use parking_lot::Mutex;
use rand::{
    rngs::SmallRng,
    RngCore,
    SeedableRng,
};
use uuid::Uuid;

use crate::{
    JoinError,
    Runtime,
    SpawnHandle,
};

struct TestRuntimeInner {
    now: tokio::time::Instant,
    system_time: SystemTime,
    rng: SmallRng,
    next_uuid_counter: u64,
}

/// A `Runtime` whose clock and randomness are both deterministic and
/// controlled by the test.
#[derive(Clone)]
pub struct TestRuntime {
    inner: Arc<Mutex<TestRuntimeInner>>,
}

impl TestRuntime {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TestRuntimeInner {
                now: tokio::time::Instant::now(),
                system_time: SystemTime::now(),
                rng: SmallRng::seed_from_u64(0),
                next_uuid_counter: 0,
            })),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        let rt = Self::new();
        rt.inner.lock().rng = SmallRng::seed_from_u64(seed);
        rt
    }

    /// Advance the virtual clock. Requires `tokio::time::pause()` to have
    /// been called by the test (e.g. via `#[tokio::test(start_paused =
    /// true)]`) so that real tokio timers track the same virtual clock.
    pub async fn advance(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.now += duration;
        inner.system_time += duration;
        drop(inner);
        tokio::time::advance(duration).await;
    }
}

impl Default for TestRuntime {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TestSpawnHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl SpawnHandle for TestSpawnHandle {
    fn shutdown(&mut self) {
        self.handle.abort();
    }

    fn join(&mut self) -> BoxFuture<'static, Result<(), JoinError>> {
        let fut = std::mem::replace(&mut self.handle, tokio::spawn(async {}));
        async move {
            match fut.await {
                Ok(()) => Ok(()),
                Err(e) if e.is_cancelled() => Err(JoinError::Canceled),
                Err(e) => Err(JoinError::Panicked(anyhow::anyhow!("{e}"))),
            }
        }
        .boxed()
    }
}

impl Runtime for TestRuntime {
    type Handle = TestSpawnHandle;

    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration).fuse())
    }

    fn spawn(
        &self,
        _name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> TestSpawnHandle {
        TestSpawnHandle {
            handle: tokio::spawn(f),
        }
    }

    fn spawn_thread<Fut, F>(&self, f: F) -> TestSpawnHandle
    where
        Fut: Future<Output = ()>,
        F: FnOnce() -> Fut + Send + 'static,
    {
        // No real OS thread is needed in tests: a plain task is enough to
        // exercise the same cancellation/join contract.
        TestSpawnHandle {
            handle: tokio::spawn(async move { f().await }),
        }
    }

    fn system_time(&self) -> SystemTime {
        self.inner.lock().system_time
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        self.inner.lock().now
    }

    fn rng(&self) -> Box<dyn RngCore + Send> {
        let mut inner = self.inner.lock();
        let seed = inner.rng.next_u64();
        Box::new(SmallRng::seed_from_u64(seed))
    }

    fn new_uuid_v4(&self) -> Uuid {
        let mut inner = self.inner.lock();
        inner.next_uuid_counter += 1;
        let counter = inner.next_uuid_counter;
        Uuid::from_u128(counter as u128)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::TestRuntime;
    use crate::Runtime;

    #[tokio::test(start_paused = true)]
    async fn advancing_the_clock_moves_monotonic_now() {
        let rt = TestRuntime::new();
        let t0 = rt.monotonic_now();
        rt.advance(Duration::from_secs(5)).await;
        let t1 = rt.monotonic_now();
        assert_eq!(t1 - t0, Duration::from_secs(5));
    }

    #[test]
    fn uuids_are_deterministic_and_distinct() {
        let rt = TestRuntime::new();
        let a = rt.new_uuid_v4();
        let b = rt.new_uuid_v4();
        assert_ne!(a, b);

        let rt2 = TestRuntime::new();
        let a2 = rt2.new_uuid_v4();
        assert_eq!(a, a2);
    }
}
