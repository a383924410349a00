//! Symmetric rendezvous between the API call that asks for a background
//! worker and the fake request that delivers one.
//!
//! Two call sites, each on its own task, must meet: one has a payload (the
//! user's `Runnable`-equivalent) and wants a worker handle back
//! ([`BackgroundRequestCoordinator::wait_for_thread_start`]); the other has a
//! worker handle and wants the payload
//! ([`BackgroundRequestCoordinator::wait_for_user_runnable`]). Either may
//! arrive first. Each rendezvous cell is single-use: it is created lazily on
//! first access and removed once both sides have collected their half of the
//! exchange.

use std::{
    collections::HashMap,
    sync::Arc,
};

use errors::ErrorMetadata;
use futures::{
    channel::oneshot,
    future::FusedFuture,
    select_biased,
    FutureExt,
};
use parking_lot::Mutex;
use request_context::RequestId;
use runtime::Runtime;

struct Cell<R, T> {
    runnable_tx: Option<oneshot::Sender<R>>,
    runnable_rx: Option<oneshot::Receiver<R>>,
    thread_tx: Option<oneshot::Sender<T>>,
    thread_rx: Option<oneshot::Receiver<T>>,
}

impl<R, T> Cell<R, T> {
    fn new() -> Self {
        let (runnable_tx, runnable_rx) = oneshot::channel();
        let (thread_tx, thread_rx) = oneshot::channel();
        Self {
            runnable_tx: Some(runnable_tx),
            runnable_rx: Some(runnable_rx),
            thread_tx: Some(thread_tx),
            thread_rx: Some(thread_rx),
        }
    }

    fn is_empty(&self) -> bool {
        self.runnable_tx.is_none()
            && self.runnable_rx.is_none()
            && self.thread_tx.is_none()
            && self.thread_rx.is_none()
    }
}

/// `R` is the payload handed from the API-call side to the fake-request
/// side; `T` is the worker handle handed back in the opposite direction.
pub struct BackgroundRequestCoordinator<RT: Runtime, R, T> {
    rt: RT,
    cells: Arc<Mutex<HashMap<RequestId, Cell<R, T>>>>,
}

impl<RT: Runtime, R: Send + 'static, T: Send + 'static> BackgroundRequestCoordinator<RT, R, T> {
    pub fn new(rt: RT) -> Self {
        Self {
            rt,
            cells: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// API-call side: deposit `runnable` and wait up to `deadline` for the
    /// worker handle the fake-request side delivers.
    pub async fn wait_for_thread_start(
        &self,
        request_id: RequestId,
        runnable: R,
        deadline: std::time::Duration,
    ) -> anyhow::Result<T> {
        let (runnable_tx, thread_rx) = {
            let mut cells = self.cells.lock();
            let cell = cells.entry(request_id).or_insert_with(Cell::new);
            let runnable_tx = cell
                .runnable_tx
                .take()
                .expect("wait_for_thread_start called twice for the same request id");
            let thread_rx = cell
                .thread_rx
                .take()
                .expect("wait_for_thread_start called twice for the same request id");
            if cell.is_empty() {
                cells.remove(&request_id);
            }
            (runnable_tx, thread_rx)
        };
        // The oneshot channel always has capacity for its one value; a send
        // only fails if the counterparty already dropped its receiver, which
        // happens on its own timeout -- in which case our result is the same
        // timeout below.
        let _ = runnable_tx.send(runnable);
        let result = self.race_against_deadline(thread_rx, deadline).await;
        self.cells.lock().remove(&request_id);
        result
    }

    /// Fake-request side: deposit `thread` and wait up to `deadline` for the
    /// payload the API-call side delivers.
    pub async fn wait_for_user_runnable(
        &self,
        request_id: RequestId,
        thread: T,
        deadline: std::time::Duration,
    ) -> anyhow::Result<R> {
        let (thread_tx, runnable_rx) = {
            let mut cells = self.cells.lock();
            let cell = cells.entry(request_id).or_insert_with(Cell::new);
            let thread_tx = cell
                .thread_tx
                .take()
                .expect("wait_for_user_runnable called twice for the same request id");
            let runnable_rx = cell
                .runnable_rx
                .take()
                .expect("wait_for_user_runnable called twice for the same request id");
            if cell.is_empty() {
                cells.remove(&request_id);
            }
            (thread_tx, runnable_rx)
        };
        let _ = thread_tx.send(thread);
        let result = self.race_against_deadline(runnable_rx, deadline).await;
        self.cells.lock().remove(&request_id);
        result
    }

    async fn race_against_deadline<V>(
        &self,
        rx: oneshot::Receiver<V>,
        deadline: std::time::Duration,
    ) -> anyhow::Result<V> {
        let mut rx = rx.fuse();
        let mut timeout = self.rt.wait(deadline);
        select_biased! {
            value = rx => value.map_err(|_| rendezvous_timed_out()),
            () = timeout => Err(rendezvous_timed_out()),
        }
    }
}

impl<RT: Runtime, R, T> Clone for BackgroundRequestCoordinator<RT, R, T> {
    fn clone(&self) -> Self {
        Self {
            rt: self.rt.clone(),
            cells: self.cells.clone(),
        }
    }
}

fn rendezvous_timed_out() -> anyhow::Error {
    anyhow::anyhow!(ErrorMetadata::overloaded(
        "BackgroundRendezvousTimedOut",
        "timed out waiting for the counterpart side of a background request rendezvous",
    ))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use request_context::RequestId;
    use runtime::testing::TestRuntime;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn api_side_arrives_first_and_both_sides_complete_the_exchange() {
        let rt = TestRuntime::new();
        let coordinator: BackgroundRequestCoordinator<TestRuntime, &'static str, u64> =
            BackgroundRequestCoordinator::new(rt.clone());
        let request_id = RequestId::new_for_test();

        let coordinator_clone = coordinator.clone();
        let api_side = tokio::spawn(async move {
            coordinator_clone
                .wait_for_thread_start(request_id, "do-the-thing", Duration::from_secs(5))
                .await
        });

        rt.advance(Duration::from_millis(100)).await;

        let runnable = coordinator
            .wait_for_user_runnable(request_id, 42u64, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(runnable, "do-the-thing");

        let thread = api_side.await.unwrap().unwrap();
        assert_eq!(thread, 42);
        assert!(coordinator.cells.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fake_request_side_arrives_first_and_both_sides_complete_the_exchange() {
        let rt = TestRuntime::new();
        let coordinator: BackgroundRequestCoordinator<TestRuntime, &'static str, u64> =
            BackgroundRequestCoordinator::new(rt.clone());
        let request_id = RequestId::new_for_test();

        let coordinator_clone = coordinator.clone();
        let fake_side = tokio::spawn(async move {
            coordinator_clone
                .wait_for_user_runnable(request_id, 7u64, Duration::from_secs(5))
                .await
        });

        rt.advance(Duration::from_millis(100)).await;

        let thread = coordinator
            .wait_for_thread_start(request_id, "other-thing", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(thread, 7);

        let runnable = fake_side.await.unwrap().unwrap();
        assert_eq!(runnable, "other-thing");
        assert!(coordinator.cells.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lone_arrival_times_out_and_leaves_no_cell_behind() {
        let rt = TestRuntime::new();
        let coordinator: BackgroundRequestCoordinator<TestRuntime, &'static str, u64> =
            BackgroundRequestCoordinator::new(rt.clone());
        let request_id = RequestId::new_for_test();

        let coordinator_clone = coordinator.clone();
        let rt_clone = rt.clone();
        let api_side = tokio::spawn(async move {
            coordinator_clone
                .wait_for_thread_start(request_id, "orphaned", Duration::from_millis(200))
                .await
        });
        rt_clone.advance(Duration::from_millis(200)).await;

        let result = api_side.await.unwrap();
        assert!(result.is_err());
        assert!(coordinator.cells.lock().is_empty());
    }
}
