//! Dynamically resizable semaphore bounding the number of outstanding API
//! RPCs a clone may have in flight at once (`maxOutstandingApiRpcs`,
//! adjustable at runtime via `CloneSettings`). Built on `async-channel`
//! rather than `tokio::sync::Semaphore`, whose permit count can't shrink: a
//! bounded channel pre-loaded with one token per permit serves as the
//! waiting queue, and a pending-shrink counter lets `resize` shrink the
//! pool by simply not recycling tokens as they're returned.

use std::sync::atomic::{
    AtomicIsize,
    Ordering,
};

use errors::{
    ErrorMetadata,
    RuntimeErrorKind,
};
use futures::FutureExt;

struct Token;

/// Held while an API RPC is in flight; dropping it returns the permit to the
/// pool, unless a pending shrink consumes it instead.
pub struct ApiRpcPermit<'a> {
    limiter: &'a ApiRpcLimiter,
    token: Option<Token>,
}

impl Drop for ApiRpcPermit<'_> {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        if self
            .limiter
            .permits_to_drop
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then_some(n - 1)
            })
            .is_ok()
        {
            return;
        }
        let _ = self.limiter.tokens.0.try_send(token);
    }
}

pub struct ApiRpcLimiter {
    tokens: (async_channel::Sender<Token>, async_channel::Receiver<Token>),
    permits_to_drop: AtomicIsize,
}

impl ApiRpcLimiter {
    pub fn new(max_outstanding: usize) -> Self {
        let (tx, rx) = async_channel::bounded(max_outstanding.max(1));
        for _ in 0..max_outstanding {
            tx.try_send(Token).expect("channel sized for max_outstanding");
        }
        Self {
            tokens: (tx, rx),
            permits_to_drop: AtomicIsize::new(0),
        }
    }

    /// Acquire a permit, waiting as long as it takes.
    pub async fn acquire(&self) -> anyhow::Result<ApiRpcPermit<'_>> {
        let token = self
            .tokens
            .1
            .recv()
            .await
            .map_err(|_| anyhow::anyhow!(ErrorMetadata::overloaded(
                "ApiRpcLimiterClosed",
                "the API RPC concurrency limiter was shut down",
            )))?;
        Ok(ApiRpcPermit {
            limiter: self,
            token: Some(token),
        })
    }

    /// Acquire a permit, or fail with `CancelledRpc` if `cancelled` resolves
    /// first -- the interruptible form callers should use while servicing a
    /// request, so a request that's being torn down doesn't keep a caller
    /// queued on a permit no one will ever read the result of.
    pub async fn acquire_interruptible<F>(&self, cancelled: F) -> anyhow::Result<ApiRpcPermit<'_>>
    where
        F: std::future::Future<Output = ()>,
    {
        let mut recv = self.tokens.1.recv().fuse();
        let mut cancelled = cancelled.fuse();
        futures::select_biased! {
            token = recv => {
                let token = token.map_err(|_| anyhow::anyhow!(ErrorMetadata::overloaded(
                    "ApiRpcLimiterClosed",
                    "the API RPC concurrency limiter was shut down",
                )))?;
                Ok(ApiRpcPermit {
                    limiter: self,
                    token: Some(token),
                })
            },
            () = cancelled => Err(anyhow::Error::new(RuntimeErrorKind::CancelledRpc)),
        }
    }

    /// Resize the pool to `new_max`. Growing adds fresh permits immediately;
    /// shrinking arms a counter that consumes returned permits (rather than
    /// recycling them) until the pool has shrunk to the new size.
    pub fn resize(&self, new_max: usize, current_outstanding_estimate: usize) {
        let current_capacity = current_outstanding_estimate + self.tokens.1.len();
        if new_max > current_capacity {
            for _ in 0..(new_max - current_capacity) {
                let _ = self.tokens.0.try_send(Token);
            }
        } else if new_max < current_capacity {
            self.permits_to_drop
                .fetch_add((current_capacity - new_max) as isize, Ordering::SeqCst);
        }
    }

    pub fn available_permits(&self) -> usize {
        self.tokens.1.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release_round_trips_a_permit() {
        let limiter = ApiRpcLimiter::new(1);
        assert_eq!(limiter.available_permits(), 1);
        let permit = limiter.acquire().await.unwrap();
        assert_eq!(limiter.available_permits(), 0);
        drop(permit);
        assert_eq!(limiter.available_permits(), 1);
    }

    #[tokio::test]
    async fn growing_adds_permits_immediately() {
        let limiter = ApiRpcLimiter::new(1);
        limiter.resize(3, 0);
        assert_eq!(limiter.available_permits(), 3);
    }

    #[tokio::test]
    async fn shrinking_consumes_returned_permits_instead_of_recycling_them() {
        let limiter = ApiRpcLimiter::new(2);
        let a = limiter.acquire().await.unwrap();
        let b = limiter.acquire().await.unwrap();
        limiter.resize(0, 2);
        drop(a);
        assert_eq!(limiter.available_permits(), 0);
        drop(b);
        assert_eq!(limiter.available_permits(), 0);
    }

    #[tokio::test]
    async fn acquire_interruptible_fails_with_cancelled_rpc_once_exhausted_and_cancelled() {
        let limiter = ApiRpcLimiter::new(1);
        let _held = limiter.acquire().await.unwrap();
        let err = limiter
            .acquire_interruptible(futures::future::ready(()))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<RuntimeErrorKind>().is_some());
    }

    #[tokio::test]
    async fn acquire_interruptible_succeeds_when_a_permit_is_free() {
        let limiter = ApiRpcLimiter::new(1);
        let permit = limiter
            .acquire_interruptible(futures::future::pending())
            .await
            .unwrap();
        assert_eq!(limiter.available_permits(), 0);
        drop(permit);
        assert_eq!(limiter.available_permits(), 1);
    }
}
