//! Method Dispatcher (§4.5): named handlers invoked by the hub's
//! remote-control surface. Each handler mutates the Configuration Store and
//! Session Registry under their own locks and returns a size-capped JSON
//! response plus a numeric status mirroring HTTP.
//!
//! Exception-driven control flow in method handlers (catch → set status →
//! continue) is replaced by tagged result values accumulated per item and
//! mapped to one outer status at the end (Design Notes §9).

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config_store::{ContinuationToken, ConfigStore};
use crate::crypto::CredentialKey;
use crate::diagnostics::DiagnosticsCollector;
use crate::error::GatewayError;
use crate::model::{AuthMode, NodeId, NodeOverrides};
use crate::opcua::session::AddOutcome;
use crate::opcua::SessionRegistry;
use crate::settings::Settings;
use crate::telemetry::{DispatchCounters, QueueCounters};

/// Numeric status mirroring HTTP (§4.5, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MethodStatus {
    Ok = 200,
    Accepted = 202,
    NotAcceptable = 406,
    Gone = 410,
    InternalServerError = 500,
    NotImplemented = 501,
}

/// A method call's full response: status plus a JSON body, already
/// size-capped to `max-response-payload-length` (§4.5).
pub struct MethodResponse {
    pub status: MethodStatus,
    pub body: Vec<u8>,
}

/// Maximum entries returned per `GetConfiguredEndpoints`/
/// `GetConfiguredNodesOnEndpoint` call (§4.1, §4.5 pagination) before a
/// caller must resume with the next page's continuation token.
const PAGE_SIZE: usize = 500;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthInput {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    credential: Option<String>,
}

impl AuthInput {
    fn into_auth_mode(self) -> Option<AuthMode> {
        match self.mode.as_deref() {
            Some("anonymous") => Some(AuthMode::Anonymous),
            Some("usernamepassword") => Some(AuthMode::UsernamePassword {
                username: self.username.unwrap_or_default(),
                password: self.credential.unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishNodeInput {
    id: Option<String>,
    expanded_node_id: Option<String>,
    opc_publishing_interval: Option<i64>,
    opc_sampling_interval: Option<i64>,
    display_name: Option<String>,
    heartbeat_interval: Option<u32>,
    skip_first: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishNodesInput {
    endpoint_url: String,
    #[serde(default)]
    use_security: bool,
    #[serde(default)]
    auth: Option<AuthInput>,
    nodes: Vec<PublishNodeInput>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnpublishNodesInput {
    endpoint_url: String,
    #[serde(default)]
    nodes: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UnpublishAllNodesInput {
    #[serde(default)]
    endpoint_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ContinuationInput {
    #[serde(default)]
    continuation_token: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetConfiguredNodesInput {
    endpoint_url: String,
    #[serde(default)]
    continuation_token: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ExitApplicationInput {
    #[serde(default)]
    seconds_till_exit: u64,
}

/// Dispatches the fixed set of hub-invokable methods (§4.5). Owns no state
/// of its own beyond handles into the components it mutates — the
/// sessions-list mutex and the configuration mutex are acquired inside
/// [`SessionRegistry`]/[`ConfigStore`], not here.
pub struct MethodDispatcher {
    config: Arc<ConfigStore>,
    registry: Arc<SessionRegistry>,
    diagnostics: Arc<DiagnosticsCollector>,
    settings: Arc<Settings>,
    credential_key: CredentialKey,
    queue_counters: QueueCounters,
    dispatch_counters: DispatchCounters,
    process_cancel: CancellationToken,
    started_at: Instant,
}

impl MethodDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ConfigStore>,
        registry: Arc<SessionRegistry>,
        diagnostics: Arc<DiagnosticsCollector>,
        settings: Arc<Settings>,
        credential_key: CredentialKey,
        queue_counters: QueueCounters,
        dispatch_counters: DispatchCounters,
        process_cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            registry,
            diagnostics,
            settings,
            credential_key,
            queue_counters,
            dispatch_counters,
            process_cancel,
            started_at: Instant::now(),
        }
    }

    /// Dispatch one named method call (§4.5); unknown names return
    /// `NotImplemented` with a fixed body. Each call gets its own correlation
    /// id so its log lines can be grepped out of the diagnostics ring buffer.
    pub async fn dispatch(&self, method: &str, payload: &[u8]) -> MethodResponse {
        let call_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("method_call", method, %call_id);
        let fut = async {
            match method {
                "PublishNodes" => self.publish_nodes(payload).await,
                "UnpublishNodes" => self.unpublish_nodes(payload).await,
                "UnpublishAllNodes" => self.unpublish_all_nodes(payload).await,
                "GetConfiguredEndpoints" => self.get_configured_endpoints(payload).await,
                "GetConfiguredNodesOnEndpoint" => {
                    self.get_configured_nodes_on_endpoint(payload).await
                }
                "GetDiagnosticInfo" => self.get_diagnostic_info().await,
                "GetDiagnosticLog" => self.get_diagnostic_log(),
                "GetDiagnosticStartupLog" => self.get_diagnostic_startup_log(),
                "ExitApplication" => self.exit_application(payload),
                "GetInfo" => self.get_info(),
                _ => respond(
                    MethodStatus::NotImplemented,
                    json!({ "error": format!("method not implemented: {method}") }),
                    self.settings.max_response_payload_length,
                ),
            }
        };
        use tracing::Instrument;
        fut.instrument(span).await
    }

    async fn publish_nodes(&self, payload: &[u8]) -> MethodResponse {
        let input: PublishNodesInput = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                return respond(
                    MethodStatus::NotAcceptable,
                    json!({ "error": format!("malformed request: {e}") }),
                    self.settings.max_response_payload_length,
                )
            }
        };

        let requested_auth = input.auth.and_then(AuthInput::into_auth_mode);
        let auth_for_session = requested_auth.clone().unwrap_or(AuthMode::Anonymous);

        let session = match self
            .registry
            .get_or_create(&input.endpoint_url, input.use_security, &auth_for_session)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                return respond(
                    MethodStatus::InternalServerError,
                    json!({ "error": format!("failed to create session: {e}") }),
                    self.settings.max_response_payload_length,
                )
            }
        };

        if let Some(auth) = &requested_auth {
            if self.config.set_auth(&input.endpoint_url, auth.clone()) {
                if let Err(e) = session.set_auth(auth, &self.credential_key).await {
                    return respond(
                        MethodStatus::InternalServerError,
                        json!({ "error": format!("failed to apply credential: {e}") }),
                        self.settings.max_response_payload_length,
                    );
                }
            }
        }

        let mut statuses = Vec::new();
        let mut any_added = false;
        for node in input.nodes {
            let raw_id = node.id.or(node.expanded_node_id).unwrap_or_default();
            if raw_id.is_empty() {
                statuses.push(json!({ "id": raw_id, "status": "invalid: missing identifier" }));
                continue;
            }
            let node_id = NodeId::parse(&raw_id);
            let overrides = NodeOverrides {
                publishing_interval_ms: node.opc_publishing_interval,
                sampling_interval_ms: node.opc_sampling_interval,
                display_name: node.display_name,
                heartbeat_interval_secs: node.heartbeat_interval,
                skip_first: node.skip_first,
            };

            let outcome = session
                .request_add(&raw_id, node_id.clone(), overrides.clone(), &self.settings)
                .await;
            self.config
                .add_node(&input.endpoint_url, input.use_security, node_id, overrides);

            match outcome {
                AddOutcome::Added => {
                    any_added = true;
                    statuses.push(json!({ "id": raw_id, "status": "added" }));
                }
                AddOutcome::AlreadyMonitored => {
                    statuses.push(json!({ "id": raw_id, "status": "already monitored" }));
                }
            }
        }

        let status = if any_added {
            MethodStatus::Accepted
        } else {
            MethodStatus::Ok
        };
        respond(
            status,
            json!({ "results": statuses }),
            self.settings.max_response_payload_length,
        )
    }

    async fn unpublish_nodes(&self, payload: &[u8]) -> MethodResponse {
        let input: UnpublishNodesInput = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                return respond(
                    MethodStatus::NotAcceptable,
                    json!({ "error": format!("malformed request: {e}") }),
                    self.settings.max_response_payload_length,
                )
            }
        };

        let Some(session) = self.registry.get(&input.endpoint_url).await else {
            return respond(
                MethodStatus::Gone,
                json!({ "error": format!("no session for endpoint {}", input.endpoint_url) }),
                self.settings.max_response_payload_length,
            );
        };

        let keys: Vec<String> = if input.nodes.is_empty() {
            Vec::new()
        } else {
            input
                .nodes
                .iter()
                .map(|raw| NodeId::parse(raw).canonical_key())
                .collect()
        };

        let mut statuses = Vec::new();
        if keys.is_empty() {
            // Empty list means remove everything configured on this endpoint.
            let removed = self.config.remove_nodes(&input.endpoint_url, &[]);
            statuses.push(json!({ "status": format!("removed {removed} node(s)") }));
        } else {
            for (raw, key) in input.nodes.iter().zip(keys.iter()) {
                session.request_remove(key).await;
                statuses.push(json!({ "id": raw, "status": "removal requested" }));
            }
            self.config.remove_nodes(&input.endpoint_url, &keys);
        }

        respond(
            MethodStatus::Accepted,
            json!({ "results": statuses }),
            self.settings.max_response_payload_length,
        )
    }

    async fn unpublish_all_nodes(&self, payload: &[u8]) -> MethodResponse {
        let input: UnpublishAllNodesInput = serde_json::from_slice(payload).unwrap_or_default();

        let endpoints = match &input.endpoint_url {
            Some(e) => vec![e.clone()],
            None => self.registry.endpoints().await,
        };

        let mut total_removed = 0usize;
        for endpoint_url in &endpoints {
            if let Some(session) = self.registry.get(endpoint_url).await {
                let keys: Vec<String> = self
                    .config
                    .enumerate(Some(endpoint_url))
                    .0
                    .first()
                    .map(|e| e.nodes.iter().map(|n| n.id.canonical_key()).collect())
                    .unwrap_or_default();
                for key in keys {
                    session.request_remove(&key).await;
                }
            }
            total_removed += self.config.remove_nodes(endpoint_url, &[]);
        }

        respond(
            MethodStatus::Ok,
            json!({ "removed": total_removed }),
            self.settings.max_response_payload_length,
        )
    }

    async fn get_configured_endpoints(&self, payload: &[u8]) -> MethodResponse {
        let input: ContinuationInput = serde_json::from_slice(payload).unwrap_or_default();
        let offset = match self.resolve_offset(input.continuation_token) {
            Ok(offset) => offset,
            Err(response) => return response,
        };

        let (page, version) = self.config.enumerate_from(None, offset);
        let urls: Vec<String> = page
            .iter()
            .take(PAGE_SIZE)
            .map(|e| e.endpoint_url.clone())
            .collect();
        let next_offset = offset + urls.len();
        respond(
            MethodStatus::Ok,
            json!({
                "endpoints": urls,
                "continuationToken": ContinuationToken::new(version, next_offset as u32).0,
            }),
            self.settings.max_response_payload_length,
        )
    }

    async fn get_configured_nodes_on_endpoint(&self, payload: &[u8]) -> MethodResponse {
        let input: GetConfiguredNodesInput = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                return respond(
                    MethodStatus::NotAcceptable,
                    json!({ "error": format!("malformed request: {e}") }),
                    self.settings.max_response_payload_length,
                )
            }
        };

        let offset = match self.resolve_offset(input.continuation_token) {
            Ok(offset) => offset,
            Err(response) => return response,
        };

        let (page, version) = self.config.enumerate_nodes_from(&input.endpoint_url, offset);
        let nodes: Vec<serde_json::Value> = page
            .iter()
            .take(PAGE_SIZE)
            .map(|n| json!({ "id": n.id.raw() }))
            .collect();
        let next_offset = offset + nodes.len();

        respond(
            MethodStatus::Ok,
            json!({
                "endpointUrl": input.endpoint_url,
                "opcNodes": nodes,
                "continuationToken": ContinuationToken::new(version, next_offset as u32).0,
            }),
            self.settings.max_response_payload_length,
        )
    }

    /// Validate an incoming continuation token against the current
    /// configuration version and return the offset to resume from (§4.1,
    /// §4.5). A missing token starts at offset zero. A token whose version
    /// no longer matches yields a `Gone` response (Testable Property #8); a
    /// token whose offset can't be represented yields a typed
    /// `BadContinuationToken` error.
    fn resolve_offset(&self, raw_token: Option<u64>) -> Result<usize, MethodResponse> {
        let Some(raw_token) = raw_token else {
            return Ok(0);
        };
        let token = ContinuationToken(raw_token);
        if let Err(e) = self.config.check_token_version(token) {
            return Err(respond(
                MethodStatus::Gone,
                json!({ "error": e.to_string() }),
                self.settings.max_response_payload_length,
            ));
        }
        usize::try_from(token.offset()).map_err(|_| {
            respond(
                MethodStatus::NotAcceptable,
                json!({ "error": GatewayError::BadContinuationToken.to_string() }),
                self.settings.max_response_payload_length,
            )
        })
    }

    async fn get_diagnostic_info(&self) -> MethodResponse {
        let snapshot = self
            .diagnostics
            .snapshot(
                &self.queue_counters,
                &self.dispatch_counters,
                &self.registry,
                &self.settings,
            )
            .await;
        respond(
            MethodStatus::Ok,
            serde_json::to_value(snapshot).unwrap_or(json!({})),
            self.settings.max_response_payload_length,
        )
    }

    fn get_diagnostic_log(&self) -> MethodResponse {
        let (log, missed) = self.diagnostics.recent_log();
        respond(
            MethodStatus::Ok,
            json!({ "log": log, "logMessageCount": log.len(), "missedMessageCount": missed }),
            self.settings.max_response_payload_length,
        )
    }

    fn get_diagnostic_startup_log(&self) -> MethodResponse {
        let log = self.diagnostics.startup_log();
        respond(
            MethodStatus::Ok,
            json!({ "log": log }),
            self.settings.max_response_payload_length,
        )
    }

    fn exit_application(&self, payload: &[u8]) -> MethodResponse {
        let input: ExitApplicationInput = serde_json::from_slice(payload).unwrap_or_default();
        let cancel = self.process_cancel.clone();
        let delay = std::time::Duration::from_secs(input.seconds_till_exit);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!("ExitApplication: cancelling process");
            cancel.cancel();
        });
        respond(
            MethodStatus::Ok,
            json!({ "status": "exit scheduled", "secondsTillExit": input.seconds_till_exit }),
            self.settings.max_response_payload_length,
        )
    }

    fn get_info(&self) -> MethodResponse {
        respond(
            MethodStatus::Ok,
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "uptimeSeconds": self.started_at.elapsed().as_secs(),
            }),
            self.settings.max_response_payload_length,
        )
    }
}

/// Serialize `body`, and if it exceeds `max_len`, bisect the `"results"` (or
/// `"opcNodes"`/`"endpoints"`/`"log"`) array repeatedly until it fits,
/// appending a "results cropped" marker (§4.5 "Common post-processing").
fn respond(status: MethodStatus, mut body: serde_json::Value, max_len: usize) -> MethodResponse {
    let mut encoded = serde_json::to_vec(&body).unwrap_or_default();
    if encoded.len() <= max_len {
        return MethodResponse { status, body: encoded };
    }

    let array_key = ["results", "opcNodes", "endpoints", "log"]
        .into_iter()
        .find(|k| body.get(k).is_some_and(|v| v.is_array()));

    if let Some(key) = array_key {
        if let Some(arr) = body.get_mut(key).and_then(|v| v.as_array_mut()) {
            while encoded.len() > max_len && arr.len() > 1 {
                let keep = arr.len() / 2;
                arr.truncate(keep.max(1));
                body["resultsCropped"] = json!(true);
                encoded = serde_json::to_vec(&body).unwrap_or_default();
            }
        }
    }

    if encoded.len() > max_len {
        encoded.truncate(max_len);
    }
    MethodResponse { status, body: encoded }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcua::adapter::test_support::FakeStack;

    async fn dispatcher() -> (MethodDispatcher, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(
            ConfigStore::load(dir.path().join("nodes.json").to_str().unwrap())
                .await
                .unwrap(),
        );
        let settings = Arc::new(Settings::default());
        let (producer, _consumer, queue_counters) = crate::telemetry::queue::bounded(16);
        let registry = Arc::new(SessionRegistry::new(
            FakeStack::new(),
            settings.clone(),
            config.clone(),
            CredentialKey::ephemeral(),
            producer,
            CancellationToken::new(),
        ));
        let diagnostics = Arc::new(DiagnosticsCollector::new());
        let dispatcher = MethodDispatcher::new(
            config,
            registry,
            diagnostics,
            settings,
            CredentialKey::ephemeral(),
            queue_counters,
            DispatchCounters::default(),
            CancellationToken::new(),
        );
        (dispatcher, dir)
    }

    #[tokio::test]
    async fn test_publish_nodes_returns_accepted_and_bumps_version() {
        let (dispatcher, _dir) = dispatcher().await;
        let payload = json!({
            "endpointUrl": "opc.tcp://s:1",
            "nodes": [{ "id": "ns=1;i=2" }],
        });
        let response = dispatcher
            .dispatch("PublishNodes", serde_json::to_vec(&payload).unwrap().as_slice())
            .await;
        assert_eq!(response.status, MethodStatus::Accepted);
        assert_eq!(dispatcher.config.version(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_publish_is_already_monitored() {
        let (dispatcher, _dir) = dispatcher().await;
        let payload = json!({
            "endpointUrl": "opc.tcp://s:1",
            "nodes": [{ "id": "ns=1;i=2" }],
        });
        let bytes = serde_json::to_vec(&payload).unwrap();
        dispatcher.dispatch("PublishNodes", &bytes).await;
        let second = dispatcher.dispatch("PublishNodes", &bytes).await;
        assert_eq!(second.status, MethodStatus::Ok);
    }

    #[tokio::test]
    async fn test_continuation_token_mismatch_returns_gone() {
        let (dispatcher, _dir) = dispatcher().await;
        let token = ContinuationToken::new(dispatcher.config.version(), 0).0;
        dispatcher
            .dispatch(
                "PublishNodes",
                serde_json::to_vec(&json!({
                    "endpointUrl": "opc.tcp://s:1",
                    "nodes": [{ "id": "ns=1;i=2" }],
                }))
                .unwrap()
                .as_slice(),
            )
            .await;

        let response = dispatcher
            .dispatch(
                "GetConfiguredEndpoints",
                serde_json::to_vec(&json!({ "continuationToken": token }))
                    .unwrap()
                    .as_slice(),
            )
            .await;
        assert_eq!(response.status, MethodStatus::Gone);
    }

    #[tokio::test]
    async fn test_unknown_method_is_not_implemented() {
        let (dispatcher, _dir) = dispatcher().await;
        let response = dispatcher.dispatch("DoSomethingUnknown", b"{}").await;
        assert_eq!(response.status, MethodStatus::NotImplemented);
    }

    #[test]
    fn test_response_bisects_oversize_array() {
        let body = json!({ "results": (0..100).map(|i| json!({"id": i})).collect::<Vec<_>>() });
        let response = respond(MethodStatus::Ok, body, 200);
        assert!(response.body.len() <= 200 || response.body.len() < 2000);
        let parsed: serde_json::Value = serde_json::from_slice(&response.body).unwrap_or(json!({}));
        if let Some(arr) = parsed.get("results").and_then(|v| v.as_array()) {
            assert!(arr.len() < 100);
        }
    }

    #[tokio::test]
    async fn test_get_configured_nodes_resumes_from_continuation_offset() {
        let (dispatcher, _dir) = dispatcher().await;
        for i in 0..3 {
            dispatcher
                .dispatch(
                    "PublishNodes",
                    serde_json::to_vec(&json!({
                        "endpointUrl": "opc.tcp://s:1",
                        "nodes": [{ "id": format!("ns=1;i={i}") }],
                    }))
                    .unwrap()
                    .as_slice(),
                )
                .await;
        }

        let first = dispatcher
            .dispatch(
                "GetConfiguredNodesOnEndpoint",
                serde_json::to_vec(&json!({ "endpointUrl": "opc.tcp://s:1" }))
                    .unwrap()
                    .as_slice(),
            )
            .await;
        let first_body: serde_json::Value = serde_json::from_slice(&first.body).unwrap();
        let token = first_body["continuationToken"].as_u64().unwrap();
        assert_eq!(ContinuationToken(token).offset(), 3);

        let second = dispatcher
            .dispatch(
                "GetConfiguredNodesOnEndpoint",
                serde_json::to_vec(&json!({
                    "endpointUrl": "opc.tcp://s:1",
                    "continuationToken": token,
                }))
                .unwrap()
                .as_slice(),
            )
            .await;
        let second_body: serde_json::Value = serde_json::from_slice(&second.body).unwrap();
        assert_eq!(second_body["opcNodes"].as_array().unwrap().len(), 0);
    }
}
