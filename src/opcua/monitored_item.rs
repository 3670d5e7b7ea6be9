//! Monitored Item (§3, §4.3): per-node lifecycle state, heartbeat timer, and
//! the value-change notification handler invoked from the session's
//! notification pump (the stand-in for the stack's own callback, since
//! [`crate::opcua::adapter::OpcUaSession`] exposes notifications as a poll
//! rather than a push — see Design Notes §9 on the adapter seam).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::model::{NodeId, NodeOverrides};
use crate::opcua::adapter::{MonitoredItemHandle, RawNotification};
use crate::telemetry::{extract_value_fragment, QueueProducer, TelemetryRecord};

/// Lifecycle state of one configured node (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoredItemState {
    Unmonitored,
    UnmonitoredAwaitingNamespaceResolution,
    Monitored,
    RemovalRequested,
    /// Namespace resolution or monitored-item creation failed with a
    /// permanent error (bad/unknown node id, unknown namespace uri). The
    /// supervisor's per-cycle scan (§4.2 step 2) skips items in this state
    /// forever — §4.2: "will not be retried until reconfigured", §7:
    /// "do not retry until reconfigured". Cleared only by
    /// [`MonitoredItem::reconfigure`], invoked when the same node is
    /// re-added through a method call.
    FailedPermanently,
}

/// Both identifier forms for a resolved item: populated once the session's
/// namespace table is available and the identifier has been resolved in
/// both directions (§3 "resolved node-id or expanded node-id (both
/// populated once connected)").
#[derive(Debug, Clone, Default)]
pub struct ResolvedIds {
    pub node_id: String,
    pub expanded_node_id: String,
}

struct HeartbeatState {
    cached: Option<TelemetryRecord>,
    deadline: Option<tokio::time::Instant>,
}

/// Per-item heartbeat timer (§4.3 point 6, "Heartbeat timer fire"): replays
/// the last-known value on a fixed cadence whenever no real notification
/// arrives to reset it.
pub struct HeartbeatTimer {
    interval: std::time::Duration,
    state: Mutex<HeartbeatState>,
    notify: Notify,
}

impl HeartbeatTimer {
    fn new(interval: std::time::Duration) -> Arc<Self> {
        Arc::new(Self {
            interval,
            state: Mutex::new(HeartbeatState {
                cached: None,
                deadline: None,
            }),
            notify: Notify::new(),
        })
    }

    /// Cache `record` as the last-known value and (re)arm for `interval`
    /// from now. Folds "stop the heartbeat timer" (§4.3 point 2) and "rearm
    /// the heartbeat timer" (point 6) into one update: a disarmed timer has
    /// no pending fire to race with a real notification.
    ///
    /// Guarantees the cached timestamp is strictly increasing (§4.3 point
    /// 6: "if the new record's timestamp is not strictly greater than the
    /// cached heartbeat's, bump by 1 ms").
    fn record_and_rearm(&self, mut record: TelemetryRecord) {
        let mut guard = self.state.lock();
        if let Some(prev) = &guard.cached {
            if record.source_timestamp <= prev.source_timestamp {
                record.source_timestamp = prev.source_timestamp + ChronoDuration::milliseconds(1);
            }
        }
        guard.deadline = Some(tokio::time::Instant::now() + self.interval);
        guard.cached = Some(record);
        drop(guard);
        self.notify.notify_one();
    }

    /// Background loop: waits for the current deadline (or indefinitely
    /// while disarmed), enqueues the cached record with its source
    /// timestamp advanced by one interval, and rearms for another interval.
    /// Exits when `cancel` fires (item removed, §3 "tears down ... heartbeat
    /// timers deterministically").
    async fn run(self: Arc<Self>, producer: QueueProducer, cancel: CancellationToken) {
        loop {
            let deadline = self.state.lock().deadline;
            match deadline {
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => continue,
                        _ = cancel.cancelled() => return,
                    }
                }
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = self.notify.notified() => continue,
                        _ = cancel.cancelled() => return,
                    }
                }
            }

            let fired = {
                let mut guard = self.state.lock();
                guard.cached.take().map(|mut record| {
                    record.source_timestamp +=
                        ChronoDuration::from_std(self.interval).unwrap_or_default();
                    guard.cached = Some(record.clone());
                    guard.deadline = Some(tokio::time::Instant::now() + self.interval);
                    record
                })
            };
            if let Some(record) = fired {
                producer.try_enqueue(record);
            }
        }
    }
}

/// One configured node, tracked per session (§3).
pub struct MonitoredItem {
    pub key: String,
    pub raw_id: String,
    pub node_id: NodeId,
    pub overrides: NodeOverrides,
    pub endpoint_url: String,
    application_uri: Mutex<String>,
    display_name: Mutex<String>,
    state: Mutex<MonitoredItemState>,
    handle: Mutex<Option<MonitoredItemHandle>>,
    resolved: Mutex<Option<ResolvedIds>>,
    pub sampling_interval_requested_ms: i64,
    sampling_interval_revised_ms: Mutex<Option<i64>>,
    heartbeat: Option<Arc<HeartbeatTimer>>,
    heartbeat_cancel: CancellationToken,
    skip_next: AtomicBool,
}

impl MonitoredItem {
    pub fn new(
        key: String,
        raw_id: String,
        node_id: NodeId,
        overrides: NodeOverrides,
        endpoint_url: String,
        sampling_interval_requested_ms: i64,
        default_heartbeat_secs: u32,
    ) -> Self {
        let heartbeat_secs = overrides.heartbeat_interval_secs.unwrap_or(default_heartbeat_secs);
        let heartbeat = if heartbeat_secs > 0 {
            Some(HeartbeatTimer::new(std::time::Duration::from_secs(
                heartbeat_secs as u64,
            )))
        } else {
            None
        };
        let display_name = overrides.display_name.clone().unwrap_or_default();
        Self {
            key,
            raw_id,
            node_id,
            overrides,
            endpoint_url,
            application_uri: Mutex::new(String::new()),
            display_name: Mutex::new(display_name),
            state: Mutex::new(MonitoredItemState::Unmonitored),
            handle: Mutex::new(None),
            resolved: Mutex::new(None),
            sampling_interval_requested_ms,
            sampling_interval_revised_ms: Mutex::new(None),
            heartbeat,
            heartbeat_cancel: CancellationToken::new(),
            skip_next: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> MonitoredItemState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: MonitoredItemState) {
        *self.state.lock() = state;
    }

    /// Clear a permanent-failure state so the node is retried on the next
    /// supervisor cycle (§4.2, §7: "will not be retried until
    /// reconfigured" — re-adding the node through a method call is that
    /// reconfiguration). `awaiting_namespace` mirrors the state a freshly
    /// added item would start in, depending on whether the namespace table
    /// is already available.
    pub fn reconfigure(&self, awaiting_namespace: bool) {
        let mut guard = self.state.lock();
        if *guard == MonitoredItemState::FailedPermanently {
            *guard = if awaiting_namespace {
                MonitoredItemState::UnmonitoredAwaitingNamespaceResolution
            } else {
                MonitoredItemState::Unmonitored
            };
        }
    }

    pub fn handle(&self) -> Option<MonitoredItemHandle> {
        *self.handle.lock()
    }

    pub fn set_handle(&self, handle: MonitoredItemHandle) {
        *self.handle.lock() = Some(handle);
    }

    pub fn set_resolved(&self, resolved: ResolvedIds) {
        *self.resolved.lock() = Some(resolved);
    }

    pub fn resolved(&self) -> Option<ResolvedIds> {
        self.resolved.lock().clone()
    }

    pub fn set_display_name(&self, name: String) {
        *self.display_name.lock() = name;
    }

    pub fn display_name(&self) -> String {
        self.display_name.lock().clone()
    }

    pub fn set_application_uri(&self, uri: String) {
        *self.application_uri.lock() = uri;
    }

    pub fn set_sampling_interval_revised(&self, ms: i64) {
        *self.sampling_interval_revised_ms.lock() = Some(ms);
    }

    pub fn sampling_interval_revised(&self) -> Option<i64> {
        *self.sampling_interval_revised_ms.lock()
    }

    /// Arm skip-first (§4.2 step 2, "Arm skip-first by setting 'skip next
    /// event'"). The next notification this item receives is dropped.
    pub fn arm_skip_first(&self) {
        self.skip_next.store(true, Ordering::SeqCst);
    }

    /// Start the background heartbeat task, if this item has heartbeats
    /// configured. A no-op otherwise. `session_cancel` is the session's
    /// cancellation token; the heartbeat task additionally stops on the
    /// item's own removal via [`MonitoredItem::stop_heartbeat`].
    pub fn spawn_heartbeat(&self, producer: QueueProducer, session_cancel: &CancellationToken) {
        if let Some(hb) = &self.heartbeat {
            let hb = hb.clone();
            let cancel = self.heartbeat_cancel.clone();
            let session_cancel = session_cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = hb.run(producer, cancel) => {}
                    _ = session_cancel.cancelled() => {}
                }
            });
        }
    }

    /// Tear down the heartbeat task deterministically (§3 lifecycle).
    pub fn stop_heartbeat(&self) {
        self.heartbeat_cancel.cancel();
    }

    /// Handle one raw value-change notification from the session's
    /// notification pump (§4.3).
    pub fn handle_notification(
        &self,
        raw: &RawNotification,
        suppressed_status_codes: &std::collections::HashSet<u32>,
        producer: &QueueProducer,
    ) {
        // Point 1: suppressed status codes never reach the queue or the
        // heartbeat cache.
        if suppressed_status_codes.contains(&raw.status_code) {
            return;
        }

        // Points 3-4: build the record (field selection is applied later,
        // at encode time in the dispatch pipeline — see record.rs).
        let (value_json, preserve_value_quotes) = extract_value_fragment(&raw.encoded_value);
        let resolved = self.resolved();
        let record = TelemetryRecord {
            endpoint_url: self.endpoint_url.clone(),
            node_id: resolved
                .as_ref()
                .map(|r| r.node_id.clone())
                .unwrap_or_else(|| self.raw_id.clone()),
            expanded_node_id: resolved.map(|r| r.expanded_node_id).unwrap_or_default(),
            application_uri: self.application_uri.lock().clone(),
            display_name: self.display_name(),
            value_json,
            preserve_value_quotes,
            source_timestamp: raw.source_timestamp,
            status_code: raw.status_code,
            status_symbolic: raw.status_symbolic.clone(),
        };

        // Point 6: heartbeat caching happens regardless of skip-first, so a
        // skipped first value still seeds the heartbeat replay.
        if let Some(hb) = &self.heartbeat {
            hb.record_and_rearm(record.clone());
        }

        // Point 7: skip-first.
        if self.skip_next.swap(false, Ordering::SeqCst) {
            debug!(node = %self.raw_id, "skip-first: suppressing initial notification");
            return;
        }

        // Point 8: enqueue.
        producer.try_enqueue(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeId;
    use crate::telemetry::queue::bounded;
    use chrono::Utc;

    fn raw(value: &str, ts: chrono::DateTime<Utc>) -> RawNotification {
        RawNotification {
            handle: MonitoredItemHandle(1),
            encoded_value: format!(r#"{{"Value":{{"Value":{value}}}}}"#),
            source_timestamp: ts,
            status_code: 0,
            status_symbolic: "Good".to_string(),
        }
    }

    fn item() -> MonitoredItem {
        MonitoredItem::new(
            "ns=1;i=1".to_string(),
            "ns=1;i=1".to_string(),
            NodeId::parse("ns=1;i=1"),
            NodeOverrides::default(),
            "opc.tcp://s:1".to_string(),
            1000,
            0,
        )
    }

    #[tokio::test]
    async fn test_suppressed_status_code_is_dropped() {
        let item = item();
        let (producer, mut consumer, _) = bounded(8);
        let mut n = raw("1", Utc::now());
        n.status_code = 0x80AA0000; // BadNoCommunication
        let mut suppressed = std::collections::HashSet::new();
        suppressed.insert(0x80AA0000);
        item.handle_notification(&n, &suppressed, &producer);
        assert!(consumer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_skip_first_drops_exactly_one() {
        let item = item();
        item.arm_skip_first();
        let (producer, mut consumer, _) = bounded(8);
        let suppressed = std::collections::HashSet::new();

        item.handle_notification(&raw("1", Utc::now()), &suppressed, &producer);
        item.handle_notification(&raw("2", Utc::now()), &suppressed, &producer);
        item.handle_notification(&raw("3", Utc::now()), &suppressed, &producer);

        let first = consumer.try_recv().unwrap();
        assert_eq!(first.value_json, "2");
        let second = consumer.try_recv().unwrap();
        assert_eq!(second.value_json, "3");
        assert!(consumer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_replays_cached_value_and_advances_timestamp() {
        let mut item = item();
        item.heartbeat = Some(HeartbeatTimer::new(std::time::Duration::from_millis(30)));
        let (producer, mut consumer, _) = bounded(8);
        let suppressed = std::collections::HashSet::new();
        let t0 = Utc::now();

        item.handle_notification(&raw("42", t0), &suppressed, &producer);
        let real = consumer.try_recv().unwrap();
        assert_eq!(real.value_json, "42");

        item.spawn_heartbeat(producer.clone(), &CancellationToken::new());
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;

        let hb1 = consumer.recv().await.unwrap();
        assert_eq!(hb1.value_json, "42");
        assert!(hb1.source_timestamp > t0);
        item.stop_heartbeat();
    }
}
