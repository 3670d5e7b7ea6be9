//! Session Registry (§4.2, §5 "Sessions-list mutex"): owns the map from
//! endpoint URL to [`Session`], find-or-creates sessions on demand for the
//! Method Dispatcher, spawns one [`SessionSupervisor`] task per session, and
//! prunes sessions left with zero subscriptions (§3 invariant, §4.2 step 5).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config_store::ConfigStore;
use crate::crypto::CredentialKey;
use crate::model::AuthMode;
use crate::settings::Settings;
use crate::telemetry::QueueProducer;

use super::adapter::OpcUaStack;
use super::session::{Session, SessionSupervisor};

struct RegistryEntry {
    session: Arc<Session>,
    supervisor_task: JoinHandle<()>,
}

/// The sessions-list: one entry per distinct endpoint URL (§3 invariant 1).
pub struct SessionRegistry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
    stack: Arc<dyn OpcUaStack>,
    settings: Arc<Settings>,
    config: Arc<ConfigStore>,
    credential_key: CredentialKey,
    producer: QueueProducer,
    process_cancel: CancellationToken,
}

impl SessionRegistry {
    pub fn new(
        stack: Arc<dyn OpcUaStack>,
        settings: Arc<Settings>,
        config: Arc<ConfigStore>,
        credential_key: CredentialKey,
        producer: QueueProducer,
        process_cancel: CancellationToken,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            stack,
            settings,
            config,
            credential_key,
            producer,
            process_cancel,
        }
    }

    /// Find the session for `endpoint_url`, if any, without creating one.
    pub async fn get(&self, endpoint_url: &str) -> Option<Arc<Session>> {
        self.entries
            .lock()
            .await
            .get(endpoint_url)
            .map(|e| e.session.clone())
    }

    pub async fn endpoints(&self) -> Vec<String> {
        self.entries.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Find or create the session for `endpoint_url`, spawning its
    /// supervisor task on creation (§4.5 "Find or create a session for the
    /// endpoint").
    pub async fn get_or_create(
        &self,
        endpoint_url: &str,
        use_security: bool,
        auth: &AuthMode,
    ) -> crate::error::Result<Arc<Session>> {
        let mut guard = self.entries.lock().await;
        if let Some(entry) = guard.get(endpoint_url) {
            return Ok(entry.session.clone());
        }

        let session = Session::with_parent_cancel(
            endpoint_url.to_string(),
            use_security,
            auth,
            &self.credential_key,
            &self.process_cancel,
        )?;

        let supervisor = SessionSupervisor::new(
            session.clone(),
            self.stack.clone(),
            self.settings.clone(),
            self.config.clone(),
            self.credential_key.clone(),
            self.producer.clone(),
            self.settings
                .suppressed_opc_status_codes
                .iter()
                .filter_map(|name| crate::status_codes::symbolic_to_code(name))
                .collect(),
        );
        let supervisor_task = tokio::spawn(supervisor.run());

        info!(endpoint = endpoint_url, "created session");
        guard.insert(
            endpoint_url.to_string(),
            RegistryEntry {
                session: session.clone(),
                supervisor_task,
            },
        );
        Ok(session)
    }

    /// Prune sessions whose subscription count has reached zero (§3
    /// invariant, §4.2 step 5). Each removal shuts the session down,
    /// aborts its supervisor task, and advances the configuration version.
    pub async fn prune_empty_sessions(&self) {
        let mut empty = Vec::new();
        {
            let guard = self.entries.lock().await;
            for (endpoint, entry) in guard.iter() {
                if entry.session.subscription_count().await == 0 {
                    empty.push(endpoint.clone());
                }
            }
        }
        for endpoint in empty {
            let mut guard = self.entries.lock().await;
            if let Some(entry) = guard.remove(&endpoint) {
                entry.session.shutdown().await;
                entry.supervisor_task.abort();
                self.config.bump_version();
                info!(endpoint = %endpoint, "pruned empty session");
            }
        }
    }

    /// Spawn the periodic "prune empty sessions" task (§3 invariant: "A
    /// session with zero subscriptions must be removed within one
    /// supervisor cycle", §4.2 step 5), running every `interval` until
    /// `cancel` fires. Mirrors [`crate::diagnostics::DiagnosticsCollector::spawn_periodic_log`].
    pub fn spawn_periodic_prune(
        self: Arc<Self>,
        interval: std::time::Duration,
        cancel: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                self.prune_empty_sessions().await;
            }
        });
    }

    /// Shut down every session, for process exit.
    pub async fn shutdown_all(&self) {
        let mut guard = self.entries.lock().await;
        for (_, entry) in guard.drain() {
            entry.session.shutdown().await;
            entry.supervisor_task.abort();
        }
    }
}
