//! Composition root for the request-lifecycle core: parses the CLI surface,
//! wires up tracing (with `RuntimeLogSink` installed as a subscriber layer),
//! and constructs a `RequestManager` ready to be driven by an RPC transport.
//!
//! The transport and servlet-engine adapters that would actually deliver
//! requests are out of this crate's scope (see the crate-level docs); this
//! binary stops at standing the core up and idling until told to shut down,
//! which is as far as a caller without a real transport can usefully go.

use std::sync::Arc;

use app_logs::RecordingLogFlusher;
use request_manager::{
    clone_settings::CloneSettings,
    flags::RuntimeFlags,
    manager::{
        RequestManager,
        RequestManagerConfig,
    },
};
use runtime::prod::TokioRuntimeHandle;
use runtime_log_sink::RuntimeLogSink;
use tracing_subscriber::{
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Installs stdout logging the way `cmd_util::config_service` does, plus a
/// `RuntimeLogSink` layer feeding runtime logs into in-flight responses --
/// the two can't share `config_service` itself, since it calls `.init()` on
/// a registry that doesn't know about the sink.
fn init_tracing(log_sink: RuntimeLogSink) {
    let format_layer = tracing_subscriber::fmt::layer()
        .with_ansi(std::env::var("NO_COLOR").is_err())
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::registry()
        .with(format_layer)
        .with(log_sink)
        .init();
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let flags = RuntimeFlags::parse_args(args);

    let log_sink = RuntimeLogSink::new(flags.max_runtime_log_per_request, "runtime_core");
    init_tracing(log_sink.clone());

    tracing::info!(?flags, "starting runtime-core");

    let tokio_rt = TokioRuntimeHandle::init_tokio()?;
    let rt = TokioRuntimeHandle::new(&tokio_rt);

    let clone_settings = CloneSettings {
        max_outstanding_api_rpcs: flags.clone_max_outstanding_api_rpcs,
        ..Default::default()
    };
    let mut manager_config = RequestManagerConfig::default();
    manager_config.thread_join_grace = std::time::Duration::from_millis(cmd_util::env_config(
        "RUNTIME_CORE_THREAD_JOIN_GRACE_MS",
        manager_config.thread_join_grace.as_millis() as u64,
    ));
    let manager = RequestManager::new(rt.clone(), manager_config, log_sink, clone_settings);

    // `RecordingLogFlusher` stands in for the real log-service boundary,
    // which arrives over the RPC transport this crate doesn't implement.
    let _app_log_flusher: Arc<dyn app_logs::LogFlusher> = Arc::new(RecordingLogFlusher::new());

    rt.block_on(async move {
        tracing::info!("runtime-core ready, waiting for a transport to drive it");
        let _ = tokio::signal::ctrl_c().await;
        manager.shutdown().await;
        tracing::info!("runtime-core shut down");
    });

    Ok(())
}
