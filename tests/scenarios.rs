//! Crate-level end-to-end scenarios (spec.md §8 S1-S4), driven against the
//! fake OPC UA stack and fake hub client behind the `test-support` feature.
//! S5 (heartbeat) and S6 (skip-first) are exercised at the unit level in
//! `opcua::monitored_item` since they are pure per-item behavior with no
//! cross-module wiring left to verify here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use opc_edge_gateway::config_store::ConfigStore;
use opc_edge_gateway::crypto::CredentialKey;
use opc_edge_gateway::error::{GatewayError, Result};
use opc_edge_gateway::hub::test_support::FakeHubClient;
use opc_edge_gateway::hub::HubClient;
use opc_edge_gateway::method::MethodDispatcher;
use opc_edge_gateway::model::AuthMode;
use opc_edge_gateway::opcua::SessionRegistry;
use opc_edge_gateway::settings::Settings;
use opc_edge_gateway::telemetry::{self, DispatchConfig, DispatchCounters, DispatchPipeline, TelemetryFieldConfig, TelemetryRecord};

fn dummy_record(value: &str) -> TelemetryRecord {
    TelemetryRecord {
        endpoint_url: "opc.tcp://srv:4840".to_string(),
        node_id: "ns=2;i=10".to_string(),
        expanded_node_id: String::new(),
        application_uri: String::new(),
        display_name: "temp".to_string(),
        value_json: value.to_string(),
        preserve_value_quotes: false,
        source_timestamp: Utc::now(),
        status_code: 0,
        status_symbolic: "Good".to_string(),
    }
}

/// S1 — single node, batched send: 30 notifications grouped into 3 batches
/// of 10 by the send-interval timer, each message a JSON array of 10
/// objects, `sent-bytes > 0`, `failed-messages = 0`.
#[tokio::test]
async fn s1_single_node_batched_send() {
    let (producer, consumer, _queue_counters) = telemetry::bounded(64);
    let hub = FakeHubClient::new();
    let config = DispatchConfig {
        hub_message_size: 1_000_000,
        send_interval: Duration::from_millis(30),
        field_config: TelemetryFieldConfig::default(),
    };
    let pipeline = DispatchPipeline::new(consumer, Arc::new(hub.clone()), config);
    let counters = pipeline.counters();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(pipeline.run(cancel.clone()));

    for batch in 0..3 {
        for i in 1..=10 {
            producer.try_enqueue(dummy_record(&(batch * 10 + i).to_string()));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cancel.cancel();
    handle.await.unwrap();

    let batches = hub.batches();
    assert_eq!(batches.len(), 3, "expected exactly 3 hub messages");
    for body in &batches {
        let parsed: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 10);
    }
    assert_eq!(counters.records_sent.get(), 30);
    assert_eq!(counters.send_failures.get(), 0);
    assert!(counters.sent_bytes.get() > 0);
}

async fn test_dispatcher() -> (MethodDispatcher, Arc<ConfigStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(
        ConfigStore::load(dir.path().join("nodes.json").to_str().unwrap())
            .await
            .unwrap(),
    );
    let settings = Arc::new(Settings::default());
    let (producer, _consumer, queue_counters) = telemetry::bounded(16);
    let registry = Arc::new(SessionRegistry::new(
        opc_edge_gateway::opcua::adapter::test_support::FakeStack::new(),
        settings.clone(),
        config.clone(),
        CredentialKey::ephemeral(),
        producer,
        CancellationToken::new(),
    ));
    let diagnostics = Arc::new(opc_edge_gateway::diagnostics::DiagnosticsCollector::new());
    let dispatcher = MethodDispatcher::new(
        config.clone(),
        registry,
        diagnostics,
        settings,
        CredentialKey::ephemeral(),
        queue_counters,
        DispatchCounters::default(),
        CancellationToken::new(),
    );
    (dispatcher, config, dir)
}

/// S2 — PublishNodes against an empty configuration adds one item: status
/// 202, per-node status "added", config version incremented by 1, and the
/// node is present in the persisted file once the write lands.
#[tokio::test]
async fn s2_publish_nodes_adds_item() {
    let (dispatcher, config, dir) = test_dispatcher().await;
    let payload = serde_json::to_vec(&serde_json::json!({
        "endpointUrl": "opc.tcp://s:1",
        "nodes": [{ "id": "ns=1;i=2" }],
    }))
    .unwrap();

    let response = dispatcher.dispatch("PublishNodes", &payload).await;
    assert_eq!(response.status, opc_edge_gateway::method::MethodStatus::Accepted);

    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    let results = body["results"].as_array().unwrap();
    assert_eq!(results[0]["status"], "added");
    assert_eq!(config.version(), 1);

    config.persist().await;
    let on_disk = tokio::fs::read_to_string(dir.path().join("nodes.json"))
        .await
        .unwrap();
    assert!(on_disk.contains("ns=1;i=2"));
}

/// S3 — a continuation token captured before a structural mutation is
/// rejected with Gone afterward, and the error names both the token's
/// version and the current one.
#[tokio::test]
async fn s3_continuation_token_invalidated_by_mutation() {
    let (dispatcher, config, _dir) = test_dispatcher().await;
    let get_endpoints = serde_json::to_vec(&serde_json::json!({})).unwrap();
    let first = dispatcher.dispatch("GetConfiguredEndpoints", &get_endpoints).await;
    let first_body: serde_json::Value = serde_json::from_slice(&first.body).unwrap();
    let token = first_body["continuationToken"].as_u64().unwrap();
    let version_before = config.version();

    let publish = serde_json::to_vec(&serde_json::json!({
        "endpointUrl": "opc.tcp://s:1",
        "nodes": [{ "id": "ns=1;i=2" }],
    }))
    .unwrap();
    dispatcher.dispatch("PublishNodes", &publish).await;
    assert_eq!(config.version(), version_before + 1);

    let retry_payload = serde_json::to_vec(&serde_json::json!({ "continuationToken": token })).unwrap();
    let retry = dispatcher.dispatch("GetConfiguredEndpoints", &retry_payload).await;
    assert_eq!(retry.status, opc_edge_gateway::method::MethodStatus::Gone);

    let retry_body: serde_json::Value = serde_json::from_slice(&retry.body).unwrap();
    let message = retry_body["error"].as_str().unwrap();
    assert!(message.contains(&version_before.to_string()));
    assert!(message.contains(&config.version().to_string()));
}

/// A [`HubClient`] that fails every send, standing in for a disconnected
/// cloud hub (S4).
struct AlwaysFailingHub;

#[async_trait]
impl HubClient for AlwaysFailingHub {
    async fn send_batch(&self, _message: opc_edge_gateway::hub::HubMessage) -> Result<()> {
        Err(GatewayError::Other(anyhow::anyhow!("hub unreachable")))
    }
}

/// S4 — queue overflow: capacity 4, 100 notifications fed with nothing
/// draining yet. Expect 4 successful enqueues and 96 failures, then the
/// dispatch pipeline observes send failures for the records that did make
/// it in without the process dying.
#[tokio::test]
async fn s4_queue_overflow_with_failing_hub() {
    let (producer, consumer, queue_counters) = telemetry::bounded(4);
    for i in 0..100 {
        producer.try_enqueue(dummy_record(&i.to_string()));
    }
    assert_eq!(queue_counters.enqueued.get(), 4);
    assert_eq!(queue_counters.enqueue_failures.get(), 96);

    let config = DispatchConfig {
        hub_message_size: 0,
        send_interval: Duration::ZERO,
        field_config: TelemetryFieldConfig::default(),
    };
    let pipeline = DispatchPipeline::new(consumer, Arc::new(AlwaysFailingHub), config);
    let counters = pipeline.counters();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(pipeline.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    handle.await.unwrap();

    assert!(counters.send_failures.get() >= 1);
}

/// Sanity check that an unreachable OPC UA stack never panics the session
/// registry; it just leaves the session disconnected and ready to retry,
/// consistent with "transient endpoint error" handling (§7).
#[tokio::test]
async fn connect_failure_leaves_session_retryable_not_crashed() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(
        ConfigStore::load(dir.path().join("nodes.json").to_str().unwrap())
            .await
            .unwrap(),
    );
    let (producer, _consumer, _) = telemetry::bounded(16);
    let stack = opc_edge_gateway::opcua::adapter::test_support::FakeStack::new();
    stack
        .fail_next_connect
        .store(true, std::sync::atomic::Ordering::Relaxed);
    let registry = SessionRegistry::new(
        stack,
        Arc::new(Settings::default()),
        config,
        CredentialKey::ephemeral(),
        producer,
        CancellationToken::new(),
    );

    let session = registry
        .get_or_create("opc.tcp://unreachable:4840", false, &AuthMode::Anonymous)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        session.state().await,
        opc_edge_gateway::opcua::SessionState::Disconnected
    );
}
