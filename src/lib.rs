//! Industrial telemetry edge gateway library: OPC UA session supervision,
//! batched telemetry dispatch, and remote-control methods.
//!
//! [`GatewayApp`] is the root application struct (Design Notes §9.1):
//! singletons in the original design become owned fields here, constructed
//! once in `main` and passed down explicitly — there is no process-wide
//! mutable global.

pub mod config_store;
pub mod crypto;
pub mod diagnostics;
pub mod error;
pub mod hub;
pub mod method;
pub mod model;
pub mod opcua;
pub mod settings;
pub mod status_codes;
pub mod telemetry;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use config_store::ConfigStore;
use crypto::CredentialKey;
use diagnostics::DiagnosticsCollector;
use error::Result;
use hub::HubClient;
use method::MethodDispatcher;
use opcua::adapter::OpcUaStack;
use opcua::SessionRegistry;
use settings::Settings;
use telemetry::{DispatchConfig, DispatchPipeline, TelemetryFieldConfig};

/// Owns every long-lived component and wires them together (§2 System
/// Overview, §9.1). Constructed once at startup; `run` drives the process
/// until `cancel` fires.
pub struct GatewayApp {
    pub settings: Arc<Settings>,
    pub config: Arc<ConfigStore>,
    pub registry: Arc<SessionRegistry>,
    pub diagnostics: Arc<DiagnosticsCollector>,
    pub dispatcher: Arc<MethodDispatcher>,
    cancel: CancellationToken,
    dispatch_pipeline: Option<DispatchPipeline>,
}

impl GatewayApp {
    /// Assemble the application from its settings, a concrete OPC UA stack
    /// adapter, and a concrete hub client. `cancel` is the process-wide
    /// cancellation token (wired to SIGINT/SIGTERM in `main`, §B).
    pub async fn new(
        settings: Settings,
        stack: Arc<dyn OpcUaStack>,
        hub: Arc<dyn HubClient>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let settings = Arc::new(settings);
        let config = Arc::new(ConfigStore::load(settings.configuration_file.clone()).await?);
        let credential_key = CredentialKey::ephemeral();

        let (producer, consumer, queue_counters) =
            telemetry::bounded(settings.monitored_items_queue_capacity);

        let registry = Arc::new(SessionRegistry::new(
            stack,
            settings.clone(),
            config.clone(),
            credential_key.clone(),
            producer,
            cancel.clone(),
        ));

        let diagnostics = Arc::new(DiagnosticsCollector::new());

        let dispatch_config = DispatchConfig {
            hub_message_size: settings.hub_message_size,
            send_interval: settings.send_interval,
            field_config: TelemetryFieldConfig {
                iot_central_mode: false,
                ..TelemetryFieldConfig::default()
            },
        };
        let dispatch_pipeline = DispatchPipeline::new(consumer, hub, dispatch_config);
        let dispatch_counters = dispatch_pipeline.counters();

        let dispatcher = Arc::new(MethodDispatcher::new(
            config.clone(),
            registry.clone(),
            diagnostics.clone(),
            settings.clone(),
            credential_key,
            queue_counters.clone(),
            dispatch_counters.clone(),
            cancel.clone(),
        ));

        diagnostics.clone().spawn_periodic_log(
            queue_counters,
            dispatch_counters,
            registry.clone(),
            settings.clone(),
            cancel.clone(),
        );
        registry
            .clone()
            .spawn_periodic_prune(settings.session_connect_wait, cancel.clone());

        Ok(Self {
            settings,
            config,
            registry,
            diagnostics,
            dispatcher,
            cancel,
            dispatch_pipeline: Some(dispatch_pipeline),
        })
    }

    /// Bootstrap sessions for every endpoint already present in the loaded
    /// configuration (§4.1 "Load", §4.2).
    pub async fn restore_configured_sessions(&self) -> Result<()> {
        let (entries, _version) = self.config.enumerate(None);
        for endpoint in entries {
            let session = self
                .registry
                .get_or_create(&endpoint.endpoint_url, endpoint.use_security, &endpoint.auth)
                .await?;
            for node in &endpoint.nodes {
                session
                    .request_add(
                        node.id.raw(),
                        node.id.clone(),
                        node.overrides.clone(),
                        &self.settings,
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Run the dispatch pipeline until cancellation, then tear every session
    /// down. Consumes `self` since the dispatch pipeline is a one-shot task.
    pub async fn run(mut self) {
        self.diagnostics.mark_startup_complete();
        if let Some(pipeline) = self.dispatch_pipeline.take() {
            pipeline.run(self.cancel.clone()).await;
        }
        self.registry.shutdown_all().await;
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
