//! Drives one request through [`RequestManager`] end to end: start it,
//! dispatch it to a [`ServletEngine`], classify and finish it, and report the
//! outcome to a [`Transport`]. The one piece of state specific to the
//! driving task itself -- which request id it's currently driving, checked
//! as `finish_request`'s precondition -- lives in a `tokio::task_local!`
//! rather than on `RequestManager`, since it's a property of the task, not
//! the request.

use std::{
    io::Write,
    sync::Arc,
    time::Duration,
};

use errors::{
    should_terminate_clone,
    ErrorMetadataAnyhowExt,
};
use flate2::{
    write::GzEncoder,
    Compression,
};
use request_context::RequestId;

use crate::{
    engine::ServletEngine,
    manager::{
        BackgroundRunnable,
        RequestManager,
    },
    request::{
        Request,
        RequestToken,
    },
    state::WorkerHandle,
    transport::Transport,
};

tokio::task_local! {
    static CURRENT_REQUEST_ID: RequestId;
}

/// §4.7's `waitForUserRunnableDeadline`: how long the fake-request side
/// waits at the rendezvous for the API-call side's runnable before giving
/// up.
pub const WAIT_FOR_USER_RUNNABLE_DEADLINE: Duration = Duration::from_secs(60);

/// Header carrying the id of the user request that asked for this
/// background worker -- the key the two sides of
/// [`crate::background_coordinator`]'s rendezvous meet under.
const BACKGROUND_REQUEST_HEADER: &str = "X-AppEngine-BackgroundRequest";

/// Whether a worker thread/task that just ran a background runnable may be
/// handed back to serve a future request. A worker that picked up background
/// work is never returned: it may still be running the runnable well past
/// this rendezvous, since the runnable's actual lifetime is the application's
/// concern, not the core's.
pub struct WorkerOutcome {
    pub runnable: BackgroundRunnable,
    pub return_to_pool: bool,
}

pub struct RequestRunner<RT: runtime::Runtime> {
    manager: RequestManager<RT>,
}

impl<RT: runtime::Runtime> RequestRunner<RT> {
    pub fn new(manager: RequestManager<RT>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &RequestManager<RT> {
        &self.manager
    }

    /// Full user-request lifecycle: `start_request`, dispatch to `engine`
    /// bound to this task's driver identity, classify the outcome,
    /// `finish_request`, and report the result to `transport`.
    pub async fn run_user_request<E: ServletEngine, Tr: Transport>(
        &self,
        engine: &E,
        transport: &Tr,
        request: Request,
    ) -> anyhow::Result<()> {
        let token = match self.manager.start_request(request.clone()).await {
            Ok(token) => token,
            Err(err) => {
                transport.finish_with_app_error(err.short_msg(), &err.user_facing_message());
                return Ok(());
            },
        };

        let request_id = token.request_id;
        let token_for_dispatch = token.clone();
        let outcome = CURRENT_REQUEST_ID
            .scope(
                request_id,
                Self::dispatch(engine, &request, token_for_dispatch),
            )
            .await;

        if let Err(err) = &outcome {
            if should_terminate_clone(err) {
                token.response_sink.set_terminate_clone();
            }
            token
                .response_sink
                .set_error(err.short_msg().to_string(), err.user_facing_message());
            tracing::error!(request_id = %request_id, error = %err, "request handler failed");
        }

        Self::maybe_compress_response(&request, &token.response_sink);

        self.assert_driving(request_id);
        self.manager.finish_request(&token).await;
        Self::report_to_transport(transport, &token);
        Ok(())
    }

    /// If the request advertises gzip support and the servlet engine left a
    /// response behind, gzip its body in place. A compression failure is
    /// non-fatal: the uncompressed body is left untouched and a warning is
    /// logged, per §7's recovery policy.
    fn maybe_compress_response(request: &Request, response_sink: &response_sink::MutableUpResponse) {
        let accepts_gzip = request
            .header("Accept-Encoding")
            .is_some_and(|v| v.split(',').any(|enc| enc.trim().eq_ignore_ascii_case("gzip")));
        if !accepts_gzip {
            return;
        }
        let Some(mut response) = response_sink.take_http_response() else {
            return;
        };
        if response.compressed || response.body.is_empty() {
            response_sink.set_http_response(response);
            return;
        }
        match gzip(&response.body) {
            Ok(compressed) => {
                response.body = compressed;
                response.compressed = true;
                response
                    .headers
                    .push(("Content-Encoding".to_string(), "gzip".to_string()));
            },
            Err(err) => {
                tracing::warn!(
                    request_id = %response_sink.request_id(),
                    error = %err,
                    "response compression failed, serving uncompressed body"
                );
            },
        }
        response_sink.set_http_response(response);
    }

    /// Shutdown-notification lifecycle: no servlet dispatch, just the
    /// manager's own shutdown bookkeeping run under the driver identity.
    pub async fn run_shutdown_notification(&self, request: Request) -> anyhow::Result<()> {
        let token = self.manager.start_request(request).await?;
        let request_id = token.request_id;
        CURRENT_REQUEST_ID
            .scope(request_id, self.manager.shutdown_requests(&token))
            .await;
        Ok(())
    }

    /// API-call side of a background-worker handoff: deposit `runnable`
    /// under `request_id` (the user request that asked for background work)
    /// and wait for the worker handle the fake-request side delivers.
    pub async fn offer_background_runnable(
        &self,
        request_id: RequestId,
        runnable: BackgroundRunnable,
        rendezvous_deadline: Duration,
    ) -> anyhow::Result<WorkerHandle> {
        self.manager
            .coordinator()
            .wait_for_thread_start(request_id, runnable, rendezvous_deadline)
            .await
    }

    /// Fake-request side: a background worker reports `worker_handle` under
    /// `request_id`, receives the runnable the API call deposited, and is
    /// told whether it may return to its pool afterward. It never may: see
    /// [`WorkerOutcome`].
    pub async fn run_background_worker(
        &self,
        request_id: RequestId,
        worker_handle: WorkerHandle,
        rendezvous_deadline: Duration,
    ) -> anyhow::Result<WorkerOutcome> {
        let runnable = self
            .manager
            .coordinator()
            .wait_for_user_runnable(request_id, worker_handle, rendezvous_deadline)
            .await?;
        tracing::debug!(
            worker_handle,
            "background worker picked up a runnable, will not return to pool"
        );
        Ok(WorkerOutcome {
            runnable,
            return_to_pool: false,
        })
    }

    /// Full fake-request lifecycle for a background worker delivered by the
    /// transport: `start_request`, read the background-request id off
    /// [`BACKGROUND_REQUEST_HEADER`], rendezvous for the runnable, run it
    /// through `engine`, default to 200/OK if it produced no HTTP response,
    /// then `finish_request` and report to `transport`.
    pub async fn run_background_worker_request<E: ServletEngine, Tr: Transport>(
        &self,
        engine: &E,
        transport: &Tr,
        request: Request,
    ) -> anyhow::Result<()> {
        let token = match self.manager.start_request(request.clone()).await {
            Ok(token) => token,
            Err(err) => {
                transport.finish_with_app_error(err.short_msg(), &err.user_facing_message());
                return Ok(());
            },
        };
        let request_id = token.request_id;

        let outcome: anyhow::Result<()> = async {
            let background_request_id: RequestId = request
                .header(BACKGROUND_REQUEST_HEADER)
                .ok_or_else(|| anyhow::anyhow!("background worker request is missing {BACKGROUND_REQUEST_HEADER}"))?
                .parse()?;
            let worker_handle = self.manager.register_worker(&token)?;
            let WorkerOutcome { runnable, .. } = self
                .run_background_worker(background_request_id, worker_handle, WAIT_FOR_USER_RUNNABLE_DEADLINE)
                .await?;
            let result = engine.run_background_runnable(&runnable, &token.response_sink).await;
            // The runnable ran synchronously to completion from this task's
            // point of view; forget it regardless of outcome so finalization
            // doesn't wait out its join grace for a worker that already
            // finished.
            token.state.forget_worker(worker_handle);
            result?;
            if !token.response_sink.has_http_response() {
                token
                    .response_sink
                    .set_http_response(response_sink::HttpResponsePayload::new(200, Vec::new()));
            }
            Ok(())
        }
        .await;

        if let Err(err) = &outcome {
            if should_terminate_clone(err) {
                token.response_sink.set_terminate_clone();
            }
            token
                .response_sink
                .set_error(err.short_msg().to_string(), err.user_facing_message());
            tracing::error!(request_id = %request_id, error = %err, "background worker failed");
        }

        self.assert_driving(request_id);
        self.manager.finish_request(&token).await;
        Self::report_to_transport(transport, &token);
        Ok(())
    }

    async fn dispatch<E: ServletEngine>(
        engine: &E,
        request: &Request,
        token: Arc<RequestToken<RT>>,
    ) -> anyhow::Result<()> {
        token
            .race_with_deadline(engine.service_request(request, &token.response_sink))
            .await
    }

    fn report_to_transport<Tr: Transport>(transport: &Tr, token: &RequestToken<RT>) {
        let response = token.response_sink.build();
        if let Some(err) = &response.error {
            transport.finish_with_app_error(&err.code, &err.detail);
            return;
        }
        let body = response.http_response.map(|r| r.body).unwrap_or_default();
        transport.finish_with_response(body);
    }

    /// Precondition for `finish_request`: the caller must be running on the
    /// task that actually drove this request's handler.
    fn assert_driving(&self, request_id: RequestId) {
        let on_driver = CURRENT_REQUEST_ID
            .try_with(|id| *id == request_id)
            .unwrap_or(false);
        debug_assert!(
            on_driver,
            "finish_request must be called from the task that drove the request"
        );
    }
}

fn gzip(body: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    Ok(encoder.finish()?)
}
