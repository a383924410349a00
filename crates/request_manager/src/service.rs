//! The top-level external surface named in §6: the handful of RPCs a
//! transport dispatches straight into the core, one call per inbound
//! message type. [`RuntimeCoreService`] is the composition of
//! [`RequestManager`] and [`RequestRunner`] that gives each of those RPCs a
//! single entry point, matching the shape of a generated service impl even
//! though no wire protocol is generated here (the transport itself is out
//! of scope -- see [`crate::transport::Transport`]).

use request_context::RequestId;

use crate::{
    app_version::AppVersion,
    clone_settings::CloneSettings,
    engine::ServletEngine,
    manager::RequestManager,
    request::{
        Request,
        RequestType,
    },
    runner::RequestRunner,
    transport::Transport,
};

/// What `addAppVersion` is handed over the wire: everything needed to
/// install an [`AppVersion`], expressed independently of the registry's own
/// type so callers don't need to depend on `request_manager` internals to
/// build one.
#[derive(Clone, Debug)]
pub struct AppInfo {
    pub app_id: String,
    pub version_id: String,
    pub root_directory: String,
    pub environment: Vec<(String, String)>,
}

impl From<AppInfo> for AppVersion {
    fn from(info: AppInfo) -> Self {
        AppVersion {
            app_id: info.app_id,
            version_id: info.version_id,
            root_directory: info.root_directory,
            environment: info.environment,
        }
    }
}

/// Best-effort diagnostic snapshot returned by `getPerformanceData`. The
/// source system's own performance RPC pulls live OS-level figures this
/// core has no equivalent source for (it owns request lifecycle, not
/// process metrics); this reports the one figure it does own plus whether
/// the clone has already been marked for retirement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PerformanceData {
    pub requests_in_flight: usize,
    pub terminate_clone_requested: bool,
}

/// A deadline notification as reported by the transport: which request it's
/// for, and whether it's the hard deadline (a soft-deadline notification
/// from the transport is never expected -- soft deadlines are the core's
/// own internally scheduled action -- but the field exists so the boundary
/// matches what `sendDeadline` takes on the wire).
#[derive(Clone, Copy, Debug)]
pub struct DeadlineNotification {
    pub request_id: RequestId,
    pub is_hard: bool,
}

/// Composition of [`RequestManager`] and [`RequestRunner`] exposing every
/// operation §6 lists against the `Transport` boundary. A real deployment's
/// RPC dispatch loop decodes each inbound frame to the right `Request`/
/// settings type and calls straight through to one of these methods.
pub struct RuntimeCoreService<RT: runtime::Runtime> {
    runner: RequestRunner<RT>,
}

impl<RT: runtime::Runtime> RuntimeCoreService<RT> {
    pub fn new(manager: RequestManager<RT>) -> Self {
        Self {
            runner: RequestRunner::new(manager),
        }
    }

    pub fn manager(&self) -> &RequestManager<RT> {
        self.runner.manager()
    }

    /// Dispatch one inbound request to the right lifecycle path based on its
    /// `request_type`, exactly the "handleRequest" entry point of §6.
    pub async fn handle_request<E: ServletEngine, Tr: Transport>(
        &self,
        engine: &E,
        transport: &Tr,
        request: Request,
    ) -> anyhow::Result<()> {
        match request.request_type {
            RequestType::UserHandler => self.runner.run_user_request(engine, transport, request).await,
            RequestType::BackgroundWorker => {
                self.runner
                    .run_background_worker_request(engine, transport, request)
                    .await
            },
            RequestType::ShutdownNotification => self.runner.run_shutdown_notification(request).await,
        }
    }

    /// Install the process's one and only application version. Fails if one
    /// is already installed, per [`crate::app_version::AppVersionRegistry`].
    pub fn add_app_version(&self, app_info: AppInfo) -> anyhow::Result<()> {
        self.manager().app_versions().install(app_info.into())
    }

    /// Always fails: removing an installed application version has no
    /// supported implementation in this core, matching §6's "returns
    /// unimplemented failure" contract.
    pub fn delete_app_version(&self, _app_info: AppInfo) -> anyhow::Result<()> {
        anyhow::bail!(errors::ErrorMetadata::bad_request(
            "Unimplemented",
            "deleteAppVersion is not implemented",
        ))
    }

    /// Push new [`CloneSettings`] over the wire: resizes the API-RPC
    /// semaphore and replaces the per-package deadline tables.
    pub fn apply_clone_settings(&self, settings: CloneSettings) {
        self.manager().apply_clone_settings(settings);
    }

    /// A deadline notification arriving from the transport (e.g. it detected
    /// its own hard timeout independently of the core's scheduler).
    pub async fn send_deadline(&self, notification: DeadlineNotification) {
        self.manager()
            .send_deadline(notification.request_id, notification.is_hard)
            .await
    }

    /// The one performance figure this core can report without a real
    /// process-metrics collector plugged in: how many requests it currently
    /// has live. A real deployment would extend this with OS-level CPU/
    /// memory figures gathered outside this crate's scope.
    pub fn get_performance_data(&self, _request: &Request) -> PerformanceData {
        PerformanceData {
            requests_in_flight: self.manager().live_request_count(),
            terminate_clone_requested: false,
        }
    }

    /// Always fails: this core has no sandboxed-execution wait to perform,
    /// matching §6's "returns unimplemented failure" contract.
    pub fn wait_for_sandbox(&self, _request: &Request) -> anyhow::Result<()> {
        anyhow::bail!(errors::ErrorMetadata::bad_request(
            "Unimplemented",
            "waitForSandbox is not implemented",
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use runtime::testing::TestRuntime;
    use runtime_log_sink::RuntimeLogSink;

    use super::*;
    use crate::{
        engine::EchoEngine,
        manager::RequestManagerConfig,
        transport::FakeTransport,
    };

    fn service() -> RuntimeCoreService<TestRuntime> {
        let rt = TestRuntime::new();
        let manager = RequestManager::new(
            rt,
            RequestManagerConfig::default(),
            RuntimeLogSink::new(1_000_000, "service_test"),
            CloneSettings {
                max_outstanding_api_rpcs: 10,
                ..Default::default()
            },
        );
        RuntimeCoreService::new(manager)
    }

    fn app_info() -> AppInfo {
        AppInfo {
            app_id: "app".to_string(),
            version_id: "v1".to_string(),
            root_directory: "/app".to_string(),
            environment: Vec::new(),
        }
    }

    #[test]
    fn add_app_version_then_second_install_fails() {
        let svc = service();
        svc.add_app_version(app_info()).unwrap();
        let err = svc.add_app_version(app_info()).unwrap_err();
        assert!(format!("{err:#}").contains("AddAppVersion already called"));
    }

    #[test]
    fn delete_and_wait_for_sandbox_are_unimplemented() {
        let svc = service();
        assert!(svc.delete_app_version(app_info()).is_err());
        let request = Request {
            security_ticket: "t".to_string(),
            global_id: 1,
            request_type: RequestType::UserHandler,
            deadline: Duration::from_secs(1),
            url: "/x".to_string(),
            headers: Vec::new(),
            trace_context_header: None,
            app_id: "app".to_string(),
            version_id: "v1".to_string(),
        };
        assert!(svc.wait_for_sandbox(&request).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn handle_request_dispatches_user_handler_through_the_runner() {
        let svc = service();
        svc.add_app_version(app_info()).unwrap();
        let engine = EchoEngine;
        let transport = FakeTransport::new(Duration::from_secs(30), 1);
        let request = Request {
            security_ticket: "t".to_string(),
            global_id: 1,
            request_type: RequestType::UserHandler,
            deadline: Duration::from_secs(30),
            url: "/hello".to_string(),
            headers: Vec::new(),
            trace_context_header: None,
            app_id: "app".to_string(),
            version_id: "v1".to_string(),
        };
        svc.handle_request(&engine, &transport, request).await.unwrap();
        assert_eq!(
            transport.result(),
            Some(crate::transport::FakeTransportResult::Response(
                b"/hello".to_vec()
            ))
        );
    }

    #[test]
    fn performance_data_reports_zero_in_flight_when_idle() {
        let svc = service();
        let request = Request {
            security_ticket: "t".to_string(),
            global_id: 1,
            request_type: RequestType::UserHandler,
            deadline: Duration::from_secs(1),
            url: "/x".to_string(),
            headers: Vec::new(),
            trace_context_header: None,
            app_id: "app".to_string(),
            version_id: "v1".to_string(),
        };
        let data = svc.get_performance_data(&request);
        assert_eq!(data.requests_in_flight, 0);
    }
}
