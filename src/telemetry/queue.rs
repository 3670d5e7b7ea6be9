//! Telemetry Queue (§4.4): a bounded FIFO between notification callbacks and
//! the dispatch pipeline, with non-blocking producers.
//!
//! Counters follow the teacher's `SimpleCounter` (`metrics.rs`): a bare
//! `AtomicU64` behind a small `Clone`-able wrapper, cheap to share across the
//! many producer call sites (notification callbacks run on the stack's I/O
//! threads and must never block on a mutex here).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use super::record::TelemetryRecord;
use crate::error::GatewayError;

/// A plain atomic counter, shared cheaply across threads.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(0)))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters tracked by the queue and consulted by the Diagnostics Collector.
#[derive(Clone, Default)]
pub struct QueueCounters {
    pub enqueued: Counter,
    pub enqueue_failures: Counter,
    pub dequeued: Counter,
}

impl QueueCounters {
    /// Current queue depth: successfully enqueued minus dequeued. Surfaced
    /// in the Diagnostics Collector's counters snapshot (§4.6).
    pub fn depth(&self) -> u64 {
        self.enqueued.get().saturating_sub(self.dequeued.get())
    }
}

/// Producer handle: cheap to clone, one per monitored item / heartbeat timer.
#[derive(Clone)]
pub struct QueueProducer {
    tx: mpsc::Sender<TelemetryRecord>,
    counters: QueueCounters,
}

impl QueueProducer {
    /// Non-blocking enqueue. On overflow, increments the enqueue-failure
    /// counter, logs every 10,000 failures (§4.4), and returns
    /// [`GatewayError::QueueFull`] — never blocks the caller, which may be
    /// the stack's I/O thread.
    pub fn try_enqueue(&self, record: TelemetryRecord) -> Result<(), GatewayError> {
        match self.tx.try_send(record) {
            Ok(()) => {
                self.counters.enqueued.increment();
                Ok(())
            }
            Err(_) => {
                self.counters.enqueue_failures.increment();
                let failures = self.counters.enqueue_failures.get();
                if failures % 10_000 == 0 {
                    warn!(failures, "telemetry queue overflow");
                }
                Err(GatewayError::QueueFull)
            }
        }
    }
}

/// Consumer handle, held solely by the dispatch pipeline.
pub struct QueueConsumer {
    rx: mpsc::Receiver<TelemetryRecord>,
    counters: QueueCounters,
}

impl QueueConsumer {
    pub async fn recv(&mut self) -> Option<TelemetryRecord> {
        let record = self.rx.recv().await;
        if record.is_some() {
            self.counters.dequeued.increment();
        }
        record
    }

    pub fn try_recv(&mut self) -> Option<TelemetryRecord> {
        let record = self.rx.try_recv().ok();
        if record.is_some() {
            self.counters.dequeued.increment();
        }
        record
    }
}

/// Create a bounded telemetry queue with the given capacity (§6
/// `monitored-items-queue-capacity`, default 8192, minimum 1024).
pub fn bounded(capacity: usize) -> (QueueProducer, QueueConsumer, QueueCounters) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let counters = QueueCounters::default();
    (
        QueueProducer {
            tx,
            counters: counters.clone(),
        },
        QueueConsumer {
            rx,
            counters: counters.clone(),
        },
        counters,
    )
}
