//! Diagnostics Collector (§4.6): an in-memory ring buffer of recent log
//! lines, a separate unbounded startup-log list, and a periodic counters
//! snapshot aggregated from every other component.
//!
//! The ring buffer and startup log are bridged from `tracing` via a
//! [`tracing_subscriber::Layer`] (`DiagnosticsLayer`) rather than duplicated
//! logging call sites, so `GetDiagnosticLog`/`GetDiagnosticStartupLog` never
//! drift from what actually got logged. Prometheus gauges/counters are
//! registered alongside the ring buffer the way the teacher's
//! `MetricsMonitor` (`batata-client/src/metrics.rs`) registers its own —
//! `register_int_gauge!`/`register_int_counter!` once at construction, one
//! `Registry` per process, `gather()` for a scrape endpoint.

use std::collections::VecDeque;

use parking_lot::Mutex;
use prometheus::{IntCounter, IntGauge, Registry, TextEncoder};
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::opcua::SessionRegistry;
use crate::settings::Settings;
use crate::telemetry::{DispatchCounters, QueueCounters};

const RING_BUFFER_CAPACITY: usize = 100;

struct LogRing {
    ring: VecDeque<String>,
    missed: u64,
    startup: Vec<String>,
    startup_complete: bool,
}

/// Owns the ring buffer, the startup log, and the Prometheus registry.
pub struct DiagnosticsCollector {
    log: Mutex<LogRing>,
    registry: Registry,
    queue_depth_gauge: IntGauge,
    sent_messages: IntCounter,
    failed_messages: IntCounter,
    too_large: IntCounter,
    missed_send_interval: IntCounter,
}

impl DiagnosticsCollector {
    pub fn new() -> Self {
        let registry = Registry::new();
        let queue_depth_gauge =
            IntGauge::new("gateway_queue_depth", "current telemetry queue depth").unwrap();
        let sent_messages =
            IntCounter::new("gateway_sent_messages_total", "hub messages sent").unwrap();
        let failed_messages =
            IntCounter::new("gateway_failed_messages_total", "hub messages that failed to send")
                .unwrap();
        let too_large =
            IntCounter::new("gateway_records_too_large_total", "records discarded for exceeding the buffer budget").unwrap();
        let missed_send_interval = IntCounter::new(
            "gateway_missed_send_interval_total",
            "dispatch cycles where the send-interval deadline had already passed",
        )
        .unwrap();

        registry.register(Box::new(queue_depth_gauge.clone())).ok();
        registry.register(Box::new(sent_messages.clone())).ok();
        registry.register(Box::new(failed_messages.clone())).ok();
        registry.register(Box::new(too_large.clone())).ok();
        registry
            .register(Box::new(missed_send_interval.clone()))
            .ok();

        Self {
            log: Mutex::new(LogRing {
                ring: VecDeque::with_capacity(RING_BUFFER_CAPACITY),
                missed: 0,
                startup: Vec::new(),
                startup_complete: false,
            }),
            registry,
            queue_depth_gauge,
            sent_messages,
            failed_messages,
            too_large,
            missed_send_interval,
        }
    }

    /// Called once the process has finished its startup sequence (config
    /// loaded, sessions created); subsequent log lines stop accumulating in
    /// the startup log (§4.6 "writes before startup completion").
    pub fn mark_startup_complete(&self) {
        self.log.lock().startup_complete = true;
    }

    fn push_line(&self, line: String) {
        let mut guard = self.log.lock();
        if !guard.startup_complete {
            guard.startup.push(line.clone());
        }
        if guard.ring.len() == RING_BUFFER_CAPACITY {
            guard.ring.pop_front();
            guard.missed += 1;
        }
        guard.ring.push_back(line);
    }

    /// The last `RING_BUFFER_CAPACITY` log lines, oldest first, plus the
    /// number evicted since the buffer filled (`GetDiagnosticLog`).
    pub fn recent_log(&self) -> (Vec<String>, u64) {
        let guard = self.log.lock();
        (guard.ring.iter().cloned().collect(), guard.missed)
    }

    /// The full startup-phase log (`GetDiagnosticStartupLog`).
    pub fn startup_log(&self) -> Vec<String> {
        self.log.lock().startup.clone()
    }

    /// Prometheus text-format scrape of every registered gauge/counter.
    pub fn gather_prometheus(&self) -> String {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf).ok();
        String::from_utf8(buf).unwrap_or_default()
    }

    /// Build the counters snapshot named in §4.6, refreshing the Prometheus
    /// gauges/counters to match as a side effect.
    pub async fn snapshot(
        &self,
        queue_counters: &QueueCounters,
        dispatch_counters: &DispatchCounters,
        registry: &SessionRegistry,
        settings: &Settings,
    ) -> CountersSnapshot {
        let depth = queue_counters.depth();
        self.queue_depth_gauge.set(depth as i64);

        let sent = dispatch_counters.batches_sent.get();
        let failed = dispatch_counters.send_failures.get();
        let too_large = dispatch_counters.too_large.get();
        let missed = dispatch_counters.missed_send_interval.get();
        self.sent_messages.reset();
        self.sent_messages.inc_by(sent);
        self.failed_messages.reset();
        self.failed_messages.inc_by(failed);
        self.too_large.reset();
        self.too_large.inc_by(too_large);
        self.missed_send_interval.reset();
        self.missed_send_interval.inc_by(missed);

        let sessions_configured = registry.len().await;
        let mut sessions_connected = 0;
        let mut subscriptions_configured = 0;
        let mut monitored_items_configured = 0;
        let mut monitored_items_monitored = 0;
        let mut monitored_items_to_remove = 0;
        for endpoint in registry.endpoints().await {
            if let Some(session) = registry.get(&endpoint).await {
                if session.state().await == crate::opcua::SessionState::Connected {
                    sessions_connected += 1;
                }
                subscriptions_configured += session.subscription_count().await;
                let (configured, monitored, to_remove) = session.monitored_item_count().await;
                monitored_items_configured += configured;
                monitored_items_monitored += monitored;
                monitored_items_to_remove += to_remove;
            }
        }

        CountersSnapshot {
            queue_depth: depth,
            enqueued: queue_counters.enqueued.get(),
            enqueue_failures: queue_counters.enqueue_failures.get(),
            sent_messages: sent,
            sent_bytes: dispatch_counters.sent_bytes.get(),
            failed_messages: failed,
            too_large,
            missed_send_interval: missed,
            working_set_mb: working_set_mb(),
            sessions_configured,
            sessions_connected,
            subscriptions_configured,
            monitored_items_configured,
            monitored_items_monitored,
            monitored_items_to_remove,
            send_interval_seconds: settings.send_interval.as_secs(),
            hub_message_size: settings.hub_message_size,
        }
    }

    /// Spawn the periodic "log the counters snapshot" task (§4.6), running
    /// until `cancel` fires. A non-positive `diagnostics_interval` disables
    /// it entirely (§6: "0 disables periodic only").
    pub fn spawn_periodic_log(
        self: std::sync::Arc<Self>,
        queue_counters: QueueCounters,
        dispatch_counters: DispatchCounters,
        registry: std::sync::Arc<SessionRegistry>,
        settings: std::sync::Arc<Settings>,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        if settings.diagnostics_interval <= 0 {
            return;
        }
        let interval = std::time::Duration::from_secs(settings.diagnostics_interval as u64);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let snapshot = self
                    .snapshot(&queue_counters, &dispatch_counters, &registry, &settings)
                    .await;
                tracing::info!(?snapshot, "diagnostics snapshot");
            }
        });
    }
}

impl Default for DiagnosticsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters snapshot (§4.6), returned by `GetDiagnosticInfo`.
#[derive(Debug, Clone, Serialize)]
pub struct CountersSnapshot {
    pub queue_depth: u64,
    pub enqueued: u64,
    pub enqueue_failures: u64,
    pub sent_messages: u64,
    pub sent_bytes: u64,
    pub failed_messages: u64,
    pub too_large: u64,
    pub missed_send_interval: u64,
    pub working_set_mb: u64,
    pub sessions_configured: usize,
    pub sessions_connected: usize,
    pub subscriptions_configured: usize,
    pub monitored_items_configured: usize,
    pub monitored_items_monitored: usize,
    pub monitored_items_to_remove: usize,
    pub send_interval_seconds: u64,
    pub hub_message_size: usize,
}

/// Best-effort resident set size in MiB; `0` where unavailable — matches
/// the "working-set MB" field being advisory, not precise (no external
/// metrics-agent dependency is pulled in just for this one field).
fn working_set_mb() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status.lines().find_map(|line| {
                line.strip_prefix("VmRSS:")
                    .and_then(|rest| rest.trim().split_whitespace().next())
                    .and_then(|kb| kb.parse::<u64>().ok())
            })
        })
        .map(|kb| kb / 1024)
        .unwrap_or(0)
}

struct MessageVisitor {
    message: Option<String>,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        }
    }
}

/// A `tracing_subscriber::Layer` that forwards every formatted event into
/// the diagnostics ring buffer, so the ring buffer never needs its own
/// logging call sites (§A.1).
pub struct DiagnosticsLayer {
    collector: std::sync::Arc<DiagnosticsCollector>,
}

impl DiagnosticsLayer {
    pub fn new(collector: std::sync::Arc<DiagnosticsCollector>) -> Self {
        Self { collector }
    }
}

impl<S: Subscriber> Layer<S> for DiagnosticsLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor { message: None };
        event.record(&mut visitor);
        let Some(message) = visitor.message else { return };
        let line = format!("{} {}", event.metadata().level(), message);
        self.collector.push_line(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_evicts_oldest_and_counts_missed() {
        let collector = DiagnosticsCollector::new();
        for i in 0..(RING_BUFFER_CAPACITY + 5) {
            collector.push_line(format!("line {i}"));
        }
        let (lines, missed) = collector.recent_log();
        assert_eq!(lines.len(), RING_BUFFER_CAPACITY);
        assert_eq!(missed, 5);
        assert_eq!(lines[0], "line 5");
    }

    #[test]
    fn test_startup_log_stops_after_mark_complete() {
        let collector = DiagnosticsCollector::new();
        collector.push_line("before".to_string());
        collector.mark_startup_complete();
        collector.push_line("after".to_string());
        let startup = collector.startup_log();
        assert_eq!(startup, vec!["before".to_string()]);
    }

    #[tokio::test]
    async fn test_snapshot_reflects_queue_depth() {
        let collector = DiagnosticsCollector::new();
        let (_producer, _consumer, queue_counters) = crate::telemetry::queue::bounded(16);
        queue_counters.enqueued.add(5);
        queue_counters.dequeued.add(2);
        let dispatch_counters = DispatchCounters::default();
        let settings = Settings::default();
        let dir = tempfile::tempdir().unwrap();
        let config = std::sync::Arc::new(
            crate::config_store::ConfigStore::load(dir.path().join("nodes.json").to_str().unwrap())
                .await
                .unwrap(),
        );
        let (producer, _consumer2, _) = crate::telemetry::queue::bounded(16);
        let registry = SessionRegistry::new(
            crate::opcua::adapter::test_support::FakeStack::new(),
            std::sync::Arc::new(settings.clone()),
            config,
            crate::crypto::CredentialKey::ephemeral(),
            producer,
            tokio_util::sync::CancellationToken::new(),
        );

        let snapshot = collector
            .snapshot(&queue_counters, &dispatch_counters, &registry, &settings)
            .await;
        assert_eq!(snapshot.queue_depth, 3);
        assert_eq!(snapshot.sessions_configured, 0);
    }
}
