//! Runtime abstraction for the request-lifecycle core.
//!
//! Everything in the request manager that touches wall-clock time, spawns a
//! task, or draws randomness goes through a `Runtime` implementation instead
//! of calling `tokio`/`std` directly. That lets deadline and rendezvous
//! timing be driven deterministically in tests (see [`testing::TestRuntime`])
//! instead of relying on real sleeps.

use std::{
    future::Future,
    pin::Pin,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use futures::future::{
    BoxFuture,
    FusedFuture,
};
use rand::RngCore;
use uuid::Uuid;

pub mod prod;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Abstracts the bits of the outside world the request-lifecycle core needs:
/// wall-clock and monotonic time, task/thread spawning, and randomness.
pub trait Runtime: Clone + Send + Sync + 'static {
    type Handle: SpawnHandle;

    /// A future that completes after `duration` has elapsed.
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send>>;

    /// Spawn an async task under the given diagnostic name.
    fn spawn(&self, name: &'static str, f: impl Future<Output = ()> + Send + 'static)
        -> Self::Handle;

    /// Spawn a dedicated OS thread running the given future to completion
    /// (used for the hard-deadline watchdog, which must keep running even if
    /// the async executor itself is wedged).
    fn spawn_thread<Fut, F>(&self, f: F) -> Self::Handle
    where
        Fut: Future<Output = ()>,
        F: FnOnce() -> Fut + Send + 'static;

    fn system_time(&self) -> SystemTime;

    fn unix_timestamp(&self) -> UnixTimestamp {
        UnixTimestamp::try_from(self.system_time()).unwrap_or(UnixTimestamp::ZERO)
    }

    /// Monotonic clock, used for computing elapsed durations. Unlike
    /// `system_time`, this never goes backwards.
    fn monotonic_now(&self) -> tokio::time::Instant;

    fn rng(&self) -> Box<dyn RngCore + Send>;

    fn new_uuid_v4(&self) -> Uuid;
}

/// A handle to a spawned task or thread.
pub trait SpawnHandle: Send + 'static {
    /// Request cancellation. Does not block for the task to actually stop.
    fn shutdown(&mut self);

    /// Wait for the task to finish, returning how it finished.
    fn join(&mut self) -> BoxFuture<'static, Result<(), JoinError>>;
}

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("task was canceled")]
    Canceled,
    #[error("task panicked: {0}")]
    Panicked(anyhow::Error),
}

/// Request shutdown and wait for completion, swallowing cancellation (but
/// not panics, which are bugs).
pub async fn shutdown_and_join(mut handle: impl SpawnHandle) -> anyhow::Result<()> {
    handle.shutdown();
    match handle.join().await {
        Ok(()) | Err(JoinError::Canceled) => Ok(()),
        Err(JoinError::Panicked(e)) => Err(e),
    }
}

/// Milliseconds since the Unix epoch. Distinct from `SystemTime` so the
/// request lifecycle has a compact, comparable, serializable timestamp type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnixTimestamp(u64);

impl UnixTimestamp {
    pub const ZERO: UnixTimestamp = UnixTimestamp(0);

    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1000.0
    }
}

impl TryFrom<SystemTime> for UnixTimestamp {
    type Error = std::time::SystemTimeError;

    fn try_from(t: SystemTime) -> Result<Self, Self::Error> {
        Ok(UnixTimestamp(t.duration_since(UNIX_EPOCH)?.as_millis() as u64))
    }
}

impl std::ops::Add<Duration> for UnixTimestamp {
    type Output = UnixTimestamp;

    fn add(self, rhs: Duration) -> UnixTimestamp {
        UnixTimestamp(self.0 + rhs.as_millis() as u64)
    }
}

impl std::ops::Sub for UnixTimestamp {
    type Output = Duration;

    fn sub(self, rhs: UnixTimestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(rhs.0))
    }
}
