//! Production implementation of the `Runtime` trait, backed by a real tokio
//! multi-threaded executor.

use std::{
    future::Future,
    pin::Pin,
    sync::LazyLock,
    thread,
    time::{
        Duration,
        SystemTime,
    },
};

use futures::{
    channel::oneshot,
    future::{
        BoxFuture,
        FusedFuture,
    },
    FutureExt,
};
use rand::{
    rngs::ThreadRng,
    RngCore,
};
use tokio::{
    runtime::{
        Builder,
        Handle as TokioHandle,
        Runtime as TokioRuntime,
    },
    time::sleep,
};
use uuid::Uuid;

use crate::{
    JoinError,
    Runtime,
    SpawnHandle,
};

/// Set a consistent thread stack size regardless of environment. This is 2x
/// Rust's default.
pub const STACK_SIZE: usize = 4 * 1024 * 1024;

pub struct FutureHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl SpawnHandle for FutureHandle {
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

pub struct ThreadHandle {
    cancel: Option<oneshot::Sender<()>>,
    done: oneshot::Receiver<bool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl SpawnHandle for ThreadHandle {
    fn shutdown(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    fn join(&mut self) -> BoxFuture<'static, Result<(), JoinError>> {
        let mut done = std::mem::replace(&mut self.done, oneshot::channel().1);
        let handle = self.handle.take();
        async move {
            if let Ok(was_canceled) = (&mut done).await {
                return if was_canceled {
                    Err(JoinError::Canceled)
                } else {
                    Ok(())
                };
            }
            let Some(handle) = handle else {
                return Ok(());
            };
            let join_r = handle.join();
            let join_err = join_r.expect_err("thread finished without signaling `done`?");
            Err(JoinError::Panicked(anyhow::anyhow!("{:?}", join_err)))
        }
        .boxed()
    }
}

impl ThreadHandle {
    fn spawn<Fut, F>(tokio_handle: TokioHandle, f: F) -> Self
    where
        Fut: Future<Output = ()>,
        F: FnOnce() -> Fut + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let thread_handle = thread::Builder::new()
            .stack_size(STACK_SIZE)
            .spawn(move || {
                let _guard = tokio_handle.enter();
                let thread_body = async move {
                    let future = f();
                    let was_canceled = futures::select! {
                        _ = cancel_rx.fuse() => true,
                        _ = future.fuse() => false,
                    };
                    let _ = done_tx.send(was_canceled);
                };
                tokio_handle.block_on(thread_body);
            })
            .expect("failed to spawn OS thread");
        ThreadHandle {
            handle: Some(thread_handle),
            cancel: Some(cancel_tx),
            done: done_rx,
        }
    }
}

static INSTANT_EPOCH: LazyLock<tokio::time::Instant> = LazyLock::new(tokio::time::Instant::now);

/// Runtime for production use: sleeps for wall-clock time and spawns real
/// tokio tasks/OS threads.
#[derive(Clone)]
pub struct TokioRuntimeHandle {
    rt: TokioHandle,
}

impl TokioRuntimeHandle {
    pub fn init_tokio() -> anyhow::Result<TokioRuntime> {
        anyhow::ensure!(
            TokioHandle::try_current().is_err(),
            "Tried to create a `TokioRuntimeHandle` from within a Tokio context. Are you using \
             `#[tokio::main]` or `#[tokio::test]`?"
        );
        let mut builder = Builder::new_multi_thread();
        builder.thread_stack_size(STACK_SIZE);
        let tokio_rt = builder.enable_all().build()?;
        Ok(tokio_rt)
    }

    /// Create a new runtime handle backed by the given tokio runtime. The
    /// `tokio_rt` should outlive every `TokioRuntimeHandle` built from it --
    /// once it's dropped, using this handle will panic.
    pub fn new(tokio_rt: &TokioRuntime) -> Self {
        Self {
            rt: tokio_rt.handle().clone(),
        }
    }

    pub fn block_on<F: Future>(&self, f: F) -> F::Output {
        self.rt.block_on(f)
    }
}

/// Either side of a spawned unit of work: an async task or a dedicated OS
/// thread. `Runtime` fixes a single associated `Handle` type, so both
/// `spawn` and `spawn_thread` return this.
pub enum TaskHandle {
    Future(FutureHandle),
    Thread(ThreadHandle),
}

impl SpawnHandle for TaskHandle {
    fn shutdown(&mut self) {
        match self {
            TaskHandle::Future(h) => h.shutdown(),
            TaskHandle::Thread(h) => h.shutdown(),
        }
    }

    fn join(&mut self) -> BoxFuture<'static, Result<(), JoinError>> {
        match self {
            TaskHandle::Future(h) => h.join(),
            TaskHandle::Thread(h) => h.join(),
        }
    }
}

impl Runtime for TokioRuntimeHandle {
    type Handle = TaskHandle;

    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send>> {
        Box::pin(sleep(duration).fuse())
    }

    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> TaskHandle {
        tracing::trace!(task = name, "spawning task");
        TaskHandle::Future(FutureHandle {
            handle: self.rt.spawn(f),
        })
    }

    fn spawn_thread<Fut, F>(&self, f: F) -> TaskHandle
    where
        Fut: Future<Output = ()>,
        F: FnOnce() -> Fut + Send + 'static,
    {
        TaskHandle::Thread(ThreadHandle::spawn(self.rt.clone(), f))
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        LazyLock::force(&INSTANT_EPOCH);
        tokio::time::Instant::now()
    }

    fn rng(&self) -> Box<dyn RngCore + Send> {
        Box::new(ThreadRng::default())
    }

    fn new_uuid_v4(&self) -> Uuid {
        Uuid::new_v4()
    }
}
