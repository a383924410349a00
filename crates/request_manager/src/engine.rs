//! The servlet/HTTP-engine boundary: whatever actually interprets the
//! user's application code and produces an HTTP response. Out of scope per
//! this crate's charter; this module exposes only the trait the request
//! core drives it through, plus an `EchoEngine` test double that exercises
//! the dispatch paths without a real application bundle.

use async_trait::async_trait;
use response_sink::{
    HttpResponsePayload,
    MutableUpResponse,
};

use crate::{
    app_version::AppVersion,
    manager::BackgroundRunnable,
    request::Request,
};

#[async_trait]
pub trait ServletEngine: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;
    async fn add_app_version(&self, app_version: &AppVersion) -> anyhow::Result<()>;
    async fn service_request(
        &self,
        request: &Request,
        response_sink: &MutableUpResponse,
    ) -> anyhow::Result<()>;
    /// Run a background-worker's runnable once the API-call side and the
    /// fake-request side have rendezvoused and exchanged it (§4.7's
    /// "run it with the application classloader bound").
    async fn run_background_runnable(
        &self,
        runnable: &BackgroundRunnable,
        response_sink: &MutableUpResponse,
    ) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
}

/// Test double that echoes the request URL back as the response body, with
/// no HTTP response at all for requests whose URL contains "no-response" --
/// used to exercise `RequestRunner`'s default-200 fallback.
pub struct EchoEngine;

#[async_trait]
impl ServletEngine for EchoEngine {
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn add_app_version(&self, _app_version: &AppVersion) -> anyhow::Result<()> {
        Ok(())
    }

    async fn service_request(
        &self,
        request: &Request,
        response_sink: &MutableUpResponse,
    ) -> anyhow::Result<()> {
        if request.url.contains("no-response") {
            return Ok(());
        }
        response_sink.set_http_response(HttpResponsePayload::new(
            200,
            request.url.clone().into_bytes(),
        ));
        Ok(())
    }

    async fn run_background_runnable(
        &self,
        runnable: &BackgroundRunnable,
        response_sink: &MutableUpResponse,
    ) -> anyhow::Result<()> {
        response_sink.set_http_response(HttpResponsePayload::new(200, runnable.0.clone()));
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
