//! Process entry point: logging, settings, application assembly, and the
//! graceful-shutdown signal wiring (SPEC_FULL.md §A.1, §A.3, §B).

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use opc_edge_gateway::diagnostics::{DiagnosticsCollector, DiagnosticsLayer};
use opc_edge_gateway::error::{GatewayError, Result};
use opc_edge_gateway::hub::{HubClient, NullHubClient};
use opc_edge_gateway::model::{AuthMode, NodeId};
use opc_edge_gateway::opcua::adapter::{
    MonitoredItemHandle, OpcUaSession, OpcUaStack, RawNotification,
};
use opc_edge_gateway::settings::Settings;
use opc_edge_gateway::GatewayApp;

/// Placeholder [`OpcUaStack`] wired in until a real OPC UA client crate is
/// integrated at this seam (Design Notes §9: the stack is an external
/// collaborator, consumed only through [`OpcUaStack`]/[`OpcUaSession`]).
/// Every connect attempt fails, which drives the session supervisor's
/// ordinary reconnect-with-backoff path (§4.2) rather than crashing the
/// process — a missing backend looks like a server that is simply
/// unreachable.
struct UnintegratedStack;

#[async_trait]
impl OpcUaStack for UnintegratedStack {
    async fn connect(
        &self,
        endpoint_url: &str,
        _use_security: bool,
        _auth: &AuthMode,
    ) -> Result<Box<dyn OpcUaSession>> {
        Err(GatewayError::Other(anyhow::anyhow!(
            "no OPC UA stack adapter is wired in for {endpoint_url}"
        )))
    }
}

/// Dummy session type to satisfy the trait object return above; never
/// constructed since `connect` always errors.
#[allow(dead_code)]
struct UnreachableSession;

#[async_trait]
impl OpcUaSession for UnreachableSession {
    async fn namespace_array(&self) -> Vec<String> {
        Vec::new()
    }

    async fn create_monitored_item(
        &self,
        _node: &NodeId,
        _sampling_interval_ms: i32,
    ) -> Result<MonitoredItemHandle> {
        unreachable!()
    }

    async fn delete_monitored_item(&self, _handle: MonitoredItemHandle) -> Result<()> {
        unreachable!()
    }

    async fn poll_notification(&self) -> Option<RawNotification> {
        None
    }

    async fn keep_alive(&self) -> Result<()> {
        unreachable!()
    }

    async fn close(&self) {}
}

fn init_tracing(diagnostics: Arc<DiagnosticsCollector>) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(DiagnosticsLayer::new(diagnostics))
        .init();
}

fn build_hub(settings: &Settings) -> Arc<dyn HubClient> {
    match &settings.hub_connection_string {
        Some(conn) => {
            warn!(
                "GATEWAY_HUB_CONNECTION_STRING is set but no hub transport is wired in yet ({} chars); \
                 falling back to the null hub client, which discards batches",
                conn.len()
            );
            Arc::new(NullHubClient)
        }
        None => Arc::new(NullHubClient),
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let settings = Settings::from_env();
    let diagnostics = Arc::new(DiagnosticsCollector::new());
    init_tracing(diagnostics.clone());

    info!(
        config_file = %settings.configuration_file,
        "starting opc-edge-gateway"
    );

    let cancel = CancellationToken::new();
    let stack: Arc<dyn OpcUaStack> = Arc::new(UnintegratedStack);
    let hub = build_hub(&settings);

    let app = match GatewayApp::new(settings, stack, hub, cancel.clone()).await {
        Ok(app) => app,
        Err(e) => {
            // Configuration parse failure at startup is fatal (§7).
            error!("fatal: failed to assemble gateway application: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    if let Err(e) = app.restore_configured_sessions().await {
        error!("fatal: failed to restore configured sessions: {e}");
        return std::process::ExitCode::FAILURE;
    }

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_cancel.cancel();
    });

    app.run().await;
    info!("opc-edge-gateway shut down cleanly");
    std::process::ExitCode::SUCCESS
}
