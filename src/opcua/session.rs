//! Session Supervisor (§4.2): a per-endpoint cooperative state machine that
//! connects, recovers from faults, resolves namespace identifiers, installs
//! subscriptions keyed by publishing interval, and attaches monitored items.
//!
//! The `tokio::select!` loop over a wakeup `Notify`, a periodic interval,
//! and the process cancellation token mirrors the teacher's long-running
//! background tasks (`ServerMemberManager`'s member-list refresh loop):
//! cooperative, cancellation-aware, driven by both an event and a timeout.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config_store::ConfigStore;
use crate::crypto::{CredentialKey, EncryptedSecret};
use crate::error::{GatewayError, Result};
use crate::model::{AuthMode, NodeId, NodeOverrides};
use crate::settings::Settings;
use crate::telemetry::QueueProducer;

use super::adapter::{OpcUaSession, OpcUaStack};
use super::monitored_item::{MonitoredItem, MonitoredItemState, ResolvedIds};
use super::subscription::Subscription;

/// Session connection state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Authentication descriptor held by a live session: the password is never
/// retained in plaintext (§3) — it stays sealed until the one call that
/// builds a stack identity needs it.
#[derive(Clone)]
pub enum SessionAuth {
    Anonymous,
    UsernamePassword { username: String, sealed: EncryptedSecret },
}

impl SessionAuth {
    fn seal(auth: &AuthMode, key: &CredentialKey) -> Result<Self> {
        match auth {
            AuthMode::Anonymous => Ok(SessionAuth::Anonymous),
            AuthMode::UsernamePassword { username, password } => Ok(SessionAuth::UsernamePassword {
                username: username.clone(),
                sealed: EncryptedSecret::seal(key, password)?,
            }),
        }
    }

    fn unseal(&self, key: &CredentialKey) -> Result<AuthMode> {
        match self {
            SessionAuth::Anonymous => Ok(AuthMode::Anonymous),
            SessionAuth::UsernamePassword { username, sealed } => Ok(AuthMode::UsernamePassword {
                username: username.clone(),
                password: sealed.unseal(key)?,
            }),
        }
    }
}

/// Outcome of a single `add` request against a session (§4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    AlreadyMonitored,
    Added,
}

struct SessionInner {
    state: SessionState,
    use_security: bool,
    auth: SessionAuth,
    namespace_table: Vec<String>,
    subscriptions: Vec<Subscription>,
    live: Option<Box<dyn OpcUaSession>>,
}

/// One live (or reconnecting) session against a single endpoint (§3).
pub struct Session {
    pub endpoint_url: String,
    inner: Mutex<SessionInner>,
    pub cancel: CancellationToken,
    wakeup: Notify,
    failure_count: AtomicU32,
    missed_keep_alive: AtomicU32,
}

impl Session {
    pub fn new(endpoint_url: String, use_security: bool, auth: &AuthMode, key: &CredentialKey) -> Result<Arc<Self>> {
        Self::with_parent_cancel(endpoint_url, use_security, auth, key, &CancellationToken::new())
    }

    /// As [`Session::new`], but the session's cancellation token is a child
    /// of `parent` (the process-wide cancellation signal, §5) so a global
    /// shutdown tears every session down without the registry having to
    /// cancel each one individually.
    pub fn with_parent_cancel(
        endpoint_url: String,
        use_security: bool,
        auth: &AuthMode,
        key: &CredentialKey,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            endpoint_url,
            inner: Mutex::new(SessionInner {
                state: SessionState::Disconnected,
                use_security,
                auth: SessionAuth::seal(auth, key)?,
                namespace_table: Vec::new(),
                subscriptions: Vec::new(),
                live: None,
            }),
            cancel: parent.child_token(),
            wakeup: Notify::new(),
            failure_count: AtomicU32::new(0),
            missed_keep_alive: AtomicU32::new(0),
        }))
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub fn wake(&self) {
        self.wakeup.notify_one();
    }

    /// Update the endpoint's auth descriptor and force a reconnect (§4.2
    /// "Reconnect on auth change").
    pub async fn set_auth(&self, auth: &AuthMode, key: &CredentialKey) -> Result<()> {
        let sealed = SessionAuth::seal(auth, key)?;
        let mut guard = self.inner.lock().await;
        guard.auth = sealed;
        drop(guard);
        self.disconnect_internal().await;
        self.wake();
        Ok(())
    }

    /// Queue `node` for monitoring at the given publishing interval,
    /// creating the subscription bucket if this is the first node at that
    /// interval. Returns whether the node was newly added (§4.5).
    pub async fn request_add(
        &self,
        raw_id: &str,
        node_id: NodeId,
        overrides: NodeOverrides,
        settings: &Settings,
    ) -> AddOutcome {
        let key = node_id.canonical_key();
        let publishing_interval_ms = overrides
            .publishing_interval_ms
            .unwrap_or(settings.opc_publishing_interval_ms);
        let sampling_interval_ms = overrides
            .sampling_interval_ms
            .unwrap_or(settings.opc_sampling_interval_ms);
        let heartbeat_default = settings.heartbeat_interval_default;
        let skip_first = overrides
            .skip_first
            .unwrap_or(settings.skip_first_default);

        let mut guard = self.inner.lock().await;
        let awaiting_namespace = guard.namespace_table.is_empty();
        if guard
            .subscriptions
            .iter()
            .any(|s| s.reconfigure_if_failed(&key, awaiting_namespace))
        {
            // §4.2/§7: a node stuck in `FailedPermanently` is retried once
            // it is reconfigured — re-publishing the same identifier is
            // that reconfiguration (Design Notes §9 resolved open question:
            // the response status for a duplicate publish stays
            // "already monitored" either way).
            return AddOutcome::AlreadyMonitored;
        }

        let sub_idx = guard
            .subscriptions
            .iter()
            .position(|s| s.requested_publishing_interval_ms == publishing_interval_ms);
        let sub_idx = match sub_idx {
            Some(i) => i,
            None => {
                guard.subscriptions.push(Subscription::new(publishing_interval_ms));
                guard.subscriptions.len() - 1
            }
        };

        let item = MonitoredItem::new(
            key,
            raw_id.to_string(),
            node_id,
            overrides,
            self.endpoint_url.clone(),
            sampling_interval_ms,
            heartbeat_default,
        );
        if skip_first {
            item.arm_skip_first();
        }
        if guard.namespace_table.is_empty() {
            item.set_state(MonitoredItemState::UnmonitoredAwaitingNamespaceResolution);
        }
        guard.subscriptions[sub_idx].add_item(item);
        AddOutcome::Added
    }

    /// Mark a node for removal; actual stack teardown happens on the next
    /// supervisor cycle (§4.2 step 3).
    pub async fn request_remove(&self, key: &str) -> bool {
        let guard = self.inner.lock().await;
        for sub in &guard.subscriptions {
            if sub.with_items(|items| items.iter().any(|i| i.key == key)) {
                sub.with_items(|items| {
                    if let Some(item) = items.iter().find(|i| i.key == key) {
                        item.set_state(MonitoredItemState::RemovalRequested);
                    }
                });
                return true;
            }
        }
        false
    }

    pub async fn subscription_count(&self) -> usize {
        self.inner.lock().await.subscriptions.len()
    }

    pub async fn monitored_item_count(&self) -> (usize, usize, usize) {
        let guard = self.inner.lock().await;
        let mut configured = 0;
        let mut monitored = 0;
        let mut to_remove = 0;
        for sub in &guard.subscriptions {
            sub.with_items(|items| {
                for item in items {
                    configured += 1;
                    match item.state() {
                        MonitoredItemState::Monitored => monitored += 1,
                        MonitoredItemState::RemovalRequested => to_remove += 1,
                        _ => {}
                    }
                }
            });
        }
        (configured, monitored, to_remove)
    }

    async fn disconnect_internal(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(live) = guard.live.take() {
            live.close().await;
        }
        guard.state = SessionState::Disconnected;
        guard.namespace_table.clear();
        for sub in &guard.subscriptions {
            sub.with_items(|items| {
                for item in items {
                    item.set_state(MonitoredItemState::UnmonitoredAwaitingNamespaceResolution);
                }
            });
        }
    }

    /// Called by the keep-alive channel on each round (§4.2 "Keep-alive").
    fn note_keep_alive(&self, ok: bool, threshold: u32) -> bool {
        if ok {
            self.missed_keep_alive.store(0, Ordering::SeqCst);
            false
        } else {
            let missed = self.missed_keep_alive.fetch_add(1, Ordering::SeqCst) + 1;
            missed >= threshold
        }
    }

    /// Tear down every subscription and monitored item, close the stack
    /// session, and stop all heartbeat timers (§4.2 "Shutdown").
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut guard = self.inner.lock().await;
        for sub in &guard.subscriptions {
            sub.with_items(|items| {
                for item in items {
                    item.stop_heartbeat();
                }
            });
        }
        guard.subscriptions.clear();
        if let Some(live) = guard.live.take() {
            live.close().await;
        }
        guard.state = SessionState::Disconnected;
    }
}

/// Drives one [`Session`]'s cooperative connect/monitor/prune loop (§4.2).
pub struct SessionSupervisor {
    pub session: Arc<Session>,
    stack: Arc<dyn OpcUaStack>,
    settings: Arc<Settings>,
    config: Arc<ConfigStore>,
    credential_key: CredentialKey,
    producer: QueueProducer,
    suppressed_status_codes: Arc<SyncMutex<HashSet<u32>>>,
}

impl SessionSupervisor {
    pub fn new(
        session: Arc<Session>,
        stack: Arc<dyn OpcUaStack>,
        settings: Arc<Settings>,
        config: Arc<ConfigStore>,
        credential_key: CredentialKey,
        producer: QueueProducer,
        suppressed_status_codes: HashSet<u32>,
    ) -> Self {
        Self {
            session,
            stack,
            settings,
            config,
            credential_key,
            producer,
            suppressed_status_codes: Arc::new(SyncMutex::new(suppressed_status_codes)),
        }
    }

    /// Run the supervisor loop until the process cancellation token fires.
    /// Each iteration performs connect / monitor / remove / prune / persist
    /// in order (§4.2).
    pub async fn run(self) {
        let span = tracing::info_span!("session_supervisor", endpoint = %self.session.endpoint_url);
        let _enter = span.enter();
        loop {
            let version_before = self.config.version();

            if let Err(e) = self.cycle().await {
                warn!("supervisor cycle error: {e}");
            }

            if self.config.version() != version_before {
                self.config.persist().await;
            }

            tokio::select! {
                _ = self.session.cancel.cancelled() => break,
                _ = self.session.wakeup.notified() => {}
                _ = tokio::time::sleep(self.settings.session_connect_wait) => {}
            }
        }
        info!("supervisor loop exiting");
    }

    async fn cycle(&self) -> Result<()> {
        if matches!(self.session.state().await, SessionState::Disconnected) {
            self.try_connect().await;
        }
        self.poll_notifications().await;
        self.monitor_unmonitored_items().await?;
        self.remove_requested_items().await;
        self.prune_empty_subscriptions().await;
        Ok(())
    }

    async fn try_connect(&self) {
        let (use_security, auth) = {
            let guard = self.session.inner.lock().await;
            let auth = match guard.auth.unseal(&self.credential_key) {
                Ok(a) => a,
                Err(e) => {
                    error!("failed to unseal credential: {e}");
                    return;
                }
            };
            (guard.use_security, auth)
        };

        {
            let mut guard = self.session.inner.lock().await;
            guard.state = SessionState::Connecting;
        }

        let failures = self.session.failure_count.load(Ordering::SeqCst);
        let _timeout = self.settings.opc_session_creation_timeout
            * failures.min(self.settings.opc_session_creation_backoff_max).max(1);

        // Long blocking network call: released per-session lock for the
        // duration (§4.2 "Per-session mutex").
        let connect_result = self
            .stack
            .connect(&self.session.endpoint_url, use_security, &auth)
            .await;

        match connect_result {
            Ok(live) => {
                let namespace_table = live.namespace_array().await;
                let mut guard = self.session.inner.lock().await;
                guard.live = Some(live);
                guard.namespace_table = namespace_table;
                guard.state = SessionState::Connected;
                drop(guard);
                self.session.failure_count.store(0, Ordering::SeqCst);
                info!("connected");
            }
            Err(e) => {
                self.session.failure_count.fetch_add(1, Ordering::SeqCst);
                let mut guard = self.session.inner.lock().await;
                guard.state = SessionState::Disconnected;
                drop(guard);
                debug!("connect failed: {e}");
            }
        }
    }

    /// Drain notifications from the live session and keep-alive, routing
    /// each to its owning monitored item (§4.3) and checking the keep-alive
    /// disconnect threshold (§4.2).
    async fn poll_notifications(&self) {
        let guard = self.session.inner.lock().await;
        if guard.state != SessionState::Connected {
            return;
        }
        let Some(live) = guard.live.as_ref() else { return };

        let keep_alive_ok = live.keep_alive().await.is_ok();
        let should_disconnect = self
            .session
            .note_keep_alive(keep_alive_ok, self.settings.opc_keep_alive_disconnect_threshold);

        let suppressed = self.suppressed_status_codes.lock().clone();
        loop {
            let Some(notification) = live.poll_notification().await else { break };
            for sub in &guard.subscriptions {
                sub.route_notification(&notification, &suppressed, &self.producer);
            }
        }
        drop(guard);

        if should_disconnect {
            warn!("missed keep-alive threshold exceeded, disconnecting");
            self.session.disconnect_internal().await;
        }
    }

    /// §4.2 step 2: resolve namespaces, attach stack monitored items, arm
    /// heartbeat/skip-first, and advance the configuration version.
    async fn monitor_unmonitored_items(&self) -> Result<()> {
        let guard = self.session.inner.lock().await;
        if guard.state != SessionState::Connected {
            return Ok(());
        }
        let Some(live) = guard.live.as_ref() else { return Ok(()) };
        let namespace_table = guard.namespace_table.clone();

        for sub in &guard.subscriptions {
            let keys: Vec<String> = sub.with_items(|items| {
                items
                    .iter()
                    .filter(|i| {
                        matches!(
                            i.state(),
                            MonitoredItemState::Unmonitored
                                | MonitoredItemState::UnmonitoredAwaitingNamespaceResolution
                        )
                    })
                    .map(|i| i.key.clone())
                    .collect()
            });

            for key in keys {
                let outcome = sub.with_items(|items| {
                    items.iter().find(|i| i.key == key).map(|item| {
                        (
                            item.node_id.clone(),
                            item.sampling_interval_requested_ms,
                        )
                    })
                });
                let Some((node_id, sampling_ms)) = outcome else { continue };

                let resolved = match node_id.resolve(&namespace_table) {
                    Ok((nid, expanded)) => ResolvedIds {
                        node_id: nid,
                        expanded_node_id: expanded,
                    },
                    Err(e) => {
                        // §4.2 step 2 / §7: a namespace that can't be mapped
                        // is a permanent failure for this identifier — log
                        // once and stop retrying until reconfigured.
                        warn!("namespace resolution failed for {key}: {e}, will not retry until reconfigured");
                        sub.with_items(|items| {
                            if let Some(item) = items.iter().find(|i| i.key == key) {
                                item.set_state(MonitoredItemState::FailedPermanently);
                            }
                        });
                        continue;
                    }
                };

                match live.create_monitored_item(&node_id, sampling_ms as i32).await {
                    Ok(handle) => {
                        sub.with_items(|items| {
                            if let Some(item) = items.iter().find(|i| i.key == key) {
                                item.set_resolved(resolved.clone());
                                item.set_handle(handle);
                                item.set_sampling_interval_revised(sampling_ms);
                                item.spawn_heartbeat(self.producer.clone(), &self.session.cancel);
                                item.set_state(MonitoredItemState::Monitored);
                            }
                        });
                        self.config.bump_version();
                        debug!("monitoring {key}");
                    }
                    Err(GatewayError::SessionNotFound(_)) => {
                        return Err(GatewayError::SessionNotFound(
                            self.session.endpoint_url.clone(),
                        ));
                    }
                    Err(GatewayError::BadNodeId(msg)) => {
                        // §4.2 step 2: "On BadNodeIdInvalid / BadNodeIdUnknown:
                        // log; item remains Unmonitored (will not be retried
                        // until reconfigured)."
                        warn!("bad node id for {key}: {msg}, will not retry until reconfigured");
                        sub.with_items(|items| {
                            if let Some(item) = items.iter().find(|i| i.key == key) {
                                item.set_state(MonitoredItemState::FailedPermanently);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("failed to create monitored item for {key}: {e}");
                    }
                }
            }
        }
        Ok(())
    }

    /// §4.2 step 3.
    async fn remove_requested_items(&self) {
        let guard = self.session.inner.lock().await;
        let Some(live) = guard.live.as_ref() else { return };

        for sub in &guard.subscriptions {
            let removal_keys: Vec<String> = sub.with_items(|items| {
                items
                    .iter()
                    .filter(|i| i.state() == MonitoredItemState::RemovalRequested)
                    .map(|i| i.key.clone())
                    .collect()
            });
            for key in removal_keys {
                if let Some(item) = sub.remove_item(&key) {
                    if let Some(handle) = item.handle() {
                        if let Err(e) = live.delete_monitored_item(handle).await {
                            warn!("failed to delete monitored item {key}: {e}");
                        }
                    }
                    item.stop_heartbeat();
                    self.config.bump_version();
                }
            }
        }
    }

    /// §4.2 step 4: a subscription with zero monitored items is removed
    /// within one supervisor cycle (§3 invariant).
    async fn prune_empty_subscriptions(&self) {
        let mut guard = self.session.inner.lock().await;
        let before = guard.subscriptions.len();
        guard.subscriptions.retain(|s| !s.is_empty());
        let removed = before - guard.subscriptions.len();
        drop(guard);
        for _ in 0..removed {
            self.config.bump_version();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcua::adapter::test_support::FakeStack;
    use crate::opcua::adapter::{MonitoredItemHandle, RawNotification};
    use crate::telemetry::queue::bounded;

    fn settings() -> Arc<Settings> {
        Arc::new(Settings::default())
    }

    #[tokio::test]
    async fn test_connect_and_monitor_one_item() {
        let key = CredentialKey::ephemeral();
        let session = Session::new("opc.tcp://s:1".to_string(), false, &AuthMode::Anonymous, &key).unwrap();
        let stack = FakeStack::new();
        let (producer, mut consumer, _) = bounded(16);
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(
            ConfigStore::load(dir.path().join("nodes.json").to_str().unwrap())
                .await
                .unwrap(),
        );

        session
            .request_add(
                "ns=1;i=1",
                NodeId::parse("ns=1;i=1"),
                NodeOverrides::default(),
                &settings(),
            )
            .await;

        let supervisor = SessionSupervisor::new(
            session.clone(),
            stack.clone(),
            settings(),
            config,
            key,
            producer,
            Default::default(),
        );

        supervisor.cycle().await.unwrap();
        assert_eq!(session.state().await, SessionState::Connected);
        let (configured, monitored, _) = session.monitored_item_count().await;
        assert_eq!(configured, 1);
        assert_eq!(monitored, 1);

        // Feed a notification through the fake stack and confirm it routes
        // through to the telemetry queue.
        let fake_session = stack.last_session.lock().as_ref().unwrap().clone();
        fake_session.notifications.lock().push_back(RawNotification {
            handle: MonitoredItemHandle(1),
            encoded_value: r#"{"Value":{"Value":42}}"#.to_string(),
            source_timestamp: chrono::Utc::now(),
            status_code: 0,
            status_symbolic: "Good".to_string(),
        });
        supervisor.poll_notifications().await;
        let record = consumer.try_recv().unwrap();
        assert_eq!(record.value_json, "42");
    }

    #[tokio::test]
    async fn test_empty_subscription_is_pruned() {
        let key = CredentialKey::ephemeral();
        let session = Session::new("opc.tcp://s:1".to_string(), false, &AuthMode::Anonymous, &key).unwrap();
        let stack = FakeStack::new();
        let (producer, _consumer, _) = bounded(16);
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(
            ConfigStore::load(dir.path().join("nodes.json").to_str().unwrap())
                .await
                .unwrap(),
        );
        session
            .request_add("ns=1;i=1", NodeId::parse("ns=1;i=1"), NodeOverrides::default(), &settings())
            .await;
        let supervisor = SessionSupervisor::new(
            session.clone(), stack, settings(), config.clone(), key, producer, Default::default(),
        );
        supervisor.cycle().await.unwrap();
        assert_eq!(session.subscription_count().await, 1);

        session.request_remove("ns=1;i=1").await;
        supervisor.cycle().await.unwrap();
        assert_eq!(session.subscription_count().await, 0);
    }
}
