//! Dispatch Pipeline (§4.4): drains the Telemetry Queue into batched JSON
//! array messages, flushing when either the byte budget or the send-interval
//! timer fires — whichever comes first. Mode selection and the loop steps
//! follow §4.4 "Loop semantics" literally (manual deadline tracking rather
//! than a fixed-cadence ticker, since a missed deadline must be counted,
//! and `send-interval = 0` needs an infinite wait rather than an immediate
//! tick).
//!
//! The `tokio::select!` loop over a queue receiver and a computed deadline
//! mirrors the teacher's `TtlMonitor` background task shape (periodic work
//! plus an event channel, both cooperatively polled on one task).

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::queue::{Counter, QueueConsumer};
use super::record::{encode_record, to_json_string, TelemetryFieldConfig, TelemetryRecord};
use crate::error::GatewayError;
use crate::hub::{HubClient, HubMessage};

/// Counters tracked by the pipeline and surfaced to the Diagnostics Collector.
#[derive(Clone, Default)]
pub struct DispatchCounters {
    pub batches_sent: Counter,
    pub records_sent: Counter,
    pub send_failures: Counter,
    /// A single encoded record exceeded the buffer budget on its own and
    /// was discarded (§4.4 step 2, §7 "oversize record").
    pub too_large: Counter,
    /// The computed wait was already in the past when the loop reached it
    /// (§4.4 step 1).
    pub missed_send_interval: Counter,
    pub sent_bytes: Counter,
}

/// Configuration for batch flushing (§6, §4.4 mode selection).
#[derive(Clone)]
pub struct DispatchConfig {
    /// Maximum serialized size of one batch, in bytes. `0` together with
    /// `send_interval == 0` selects single-message mode.
    pub hub_message_size: usize,
    /// Maximum time a non-empty batch may sit before being flushed. `0`
    /// means "wait forever for the byte budget" unless single-message mode
    /// also applies.
    pub send_interval: Duration,
    pub field_config: TelemetryFieldConfig,
}

/// Fixed overhead of the enclosing `[` `]` a batch is wrapped in.
const ARRAY_BRACKET_OVERHEAD: usize = 2;

impl DispatchConfig {
    fn single_message_mode(&self) -> bool {
        self.send_interval.is_zero() && self.hub_message_size == 0
    }

    /// Effective JSON buffer budget: the configured message size minus the
    /// two bytes of outer `[` `]` overhead (§4.4). Single-message mode has
    /// no meaningful budget since there is no outer array.
    fn buffer_budget(&self) -> usize {
        self.hub_message_size.saturating_sub(ARRAY_BRACKET_OVERHEAD)
    }
}

/// Drains `consumer`, encodes each record per `field_config`, and flushes
/// accumulated batches to `hub` under the byte/time constraints in `config`.
pub struct DispatchPipeline {
    consumer: QueueConsumer,
    hub: Arc<dyn HubClient>,
    config: DispatchConfig,
    counters: DispatchCounters,
}

impl DispatchPipeline {
    pub fn new(consumer: QueueConsumer, hub: Arc<dyn HubClient>, config: DispatchConfig) -> Self {
        Self {
            consumer,
            hub,
            config,
            counters: DispatchCounters::default(),
        }
    }

    pub fn counters(&self) -> DispatchCounters {
        self.counters.clone()
    }

    /// Run the pipeline loop until `cancel` fires or the queue closes,
    /// flushing any partial batch before returning (§4.4 steps 1-7).
    pub async fn run(mut self, cancel: CancellationToken) {
        if self.config.single_message_mode() {
            self.run_single_message(cancel).await;
            return;
        }

        let mut buffer: Vec<String> = Vec::new();
        let mut buffer_bytes: usize = 0;
        let mut next_deadline = Instant::now() + self.send_interval_or_far_future();

        loop {
            // Step 1: compute wait.
            let now = Instant::now();
            let wait = if self.config.send_interval.is_zero() {
                None // wait indefinitely for the byte budget (unless cancelled)
            } else if next_deadline <= now {
                self.counters.missed_send_interval.increment();
                Some(Duration::ZERO)
            } else {
                Some(next_deadline - now)
            };

            // Step 2: try-take with timeout = wait.
            let maybe_record = match wait {
                None => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    r = self.consumer.recv() => r,
                },
                Some(d) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        r = self.consumer.recv() => r,
                        _ = tokio::time::sleep(d) => None,
                    }
                }
            };

            match maybe_record {
                Some(record) => {
                    let encoded = to_json_string(&encode_record(&record, &self.config.field_config));
                    if encoded.len() > self.config.buffer_budget() {
                        self.counters.too_large.increment();
                        let err = GatewayError::RecordTooLarge;
                        warn!(
                            size = encoded.len(),
                            budget = self.config.buffer_budget(),
                            "{err}"
                        );
                        continue;
                    }

                    let added = encoded.len() + if buffer.is_empty() { 0 } else { 1 };
                    if !buffer.is_empty() && buffer_bytes + added > self.config.buffer_budget() {
                        // Step 3: must-send-then-buffer.
                        self.flush(&mut buffer, &mut buffer_bytes).await;
                        next_deadline = Instant::now() + self.send_interval_or_far_future();
                    }
                    buffer_bytes += encoded.len() + if buffer.is_empty() { 0 } else { 1 };
                    buffer.push(encoded);
                }
                None if cancel.is_cancelled() => {
                    self.flush(&mut buffer, &mut buffer_bytes).await;
                    break;
                }
                None => {
                    // Steps 4-5: timeout/shutdown with nothing new read —
                    // flush a non-empty buffer, otherwise just advance.
                    if !buffer.is_empty() {
                        self.flush(&mut buffer, &mut buffer_bytes).await;
                    }
                    next_deadline = Instant::now() + self.send_interval_or_far_future();
                }
            }
        }
    }

    fn send_interval_or_far_future(&self) -> Duration {
        if self.config.send_interval.is_zero() {
            Duration::from_secs(365 * 24 * 3600)
        } else {
            self.config.send_interval
        }
    }

    /// §4.4 testable property 6: `send_interval == 0 && hub_message_size ==
    /// 0` sends every record as its own message, no outer array.
    async fn run_single_message(&mut self, cancel: CancellationToken) {
        loop {
            let maybe_record = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = self.consumer.recv() => r,
            };
            let Some(record) = maybe_record else { break };
            let encoded = to_json_string(&encode_record(&record, &self.config.field_config));
            self.send(encoded.into_bytes(), 1).await;
        }
    }

    async fn flush(&mut self, buffer: &mut Vec<String>, buffer_bytes: &mut usize) {
        if buffer.is_empty() {
            return;
        }
        let body = format!("[{}]", buffer.join(","));
        let count = buffer.len() as u64;
        buffer.clear();
        *buffer_bytes = 0;
        self.send(body.into_bytes(), count).await;
    }

    async fn send(&mut self, body: Vec<u8>, record_count: u64) {
        let bytes = body.len() as u64;
        match self.hub.send_batch(HubMessage::new(body)).await {
            Ok(()) => {
                self.counters.batches_sent.increment();
                self.counters.records_sent.add(record_count);
                self.counters.sent_bytes.add(bytes);
                debug!(records = record_count, bytes, "batch sent to hub");
            }
            Err(e) => {
                self.counters.send_failures.increment();
                warn!("batch send failed, dropping {record_count} record(s): {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::test_support::FakeHubClient;
    use crate::telemetry::queue::bounded;
    use chrono::Utc;

    fn dummy_record(value: &str) -> TelemetryRecord {
        TelemetryRecord {
            endpoint_url: "opc.tcp://s:1".to_string(),
            node_id: "ns=1;i=1".to_string(),
            expanded_node_id: String::new(),
            application_uri: String::new(),
            display_name: "x".to_string(),
            value_json: value.to_string(),
            preserve_value_quotes: false,
            source_timestamp: Utc::now(),
            status_code: 0,
            status_symbolic: "Good".to_string(),
        }
    }

    #[tokio::test]
    async fn test_interval_flush_sends_partial_batch() {
        let (producer, consumer, _) = bounded(16);
        let hub = FakeHubClient::new();
        let config = DispatchConfig {
            hub_message_size: 1_000_000,
            send_interval: Duration::from_millis(20),
            field_config: TelemetryFieldConfig::default(),
        };
        let pipeline = DispatchPipeline::new(consumer, Arc::new(hub.clone()), config);
        let counters = pipeline.counters();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        let handle = tokio::spawn(pipeline.run(cancel_clone));

        producer.try_enqueue(dummy_record("1"));
        producer.try_enqueue(dummy_record("2"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(hub.batches().len(), 1);
        assert_eq!(counters.records_sent.get(), 2);
    }

    #[tokio::test]
    async fn test_byte_budget_triggers_early_flush() {
        let (producer, consumer, _) = bounded(16);
        let hub = FakeHubClient::new();
        let config = DispatchConfig {
            hub_message_size: 40,
            send_interval: Duration::from_secs(60),
            field_config: TelemetryFieldConfig::default(),
        };
        let pipeline = DispatchPipeline::new(consumer, Arc::new(hub.clone()), config);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(pipeline.run(cancel_clone));

        for i in 0..10 {
            producer.try_enqueue(dummy_record(&i.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(
            hub.batches().len() >= 2,
            "expected byte budget to force multiple batches"
        );
    }

    #[tokio::test]
    async fn test_single_message_mode_sends_bare_objects() {
        let (producer, consumer, _) = bounded(16);
        let hub = FakeHubClient::new();
        let config = DispatchConfig {
            hub_message_size: 0,
            send_interval: Duration::ZERO,
            field_config: TelemetryFieldConfig::default(),
        };
        let pipeline = DispatchPipeline::new(consumer, Arc::new(hub.clone()), config);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(pipeline.run(cancel_clone));

        producer.try_enqueue(dummy_record("7"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        handle.await.unwrap();

        let batches = hub.batches();
        assert_eq!(batches.len(), 1);
        let body = String::from_utf8(batches[0].clone()).unwrap();
        assert!(!body.starts_with('['));
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["Value"]["Value"], 7);
    }

    #[tokio::test]
    async fn test_oversize_record_is_discarded_and_counted() {
        let (producer, consumer, _) = bounded(16);
        let hub = FakeHubClient::new();
        let config = DispatchConfig {
            hub_message_size: 10, // budget smaller than any real encoded record
            send_interval: Duration::from_millis(20),
            field_config: TelemetryFieldConfig::default(),
        };
        let pipeline = DispatchPipeline::new(consumer, Arc::new(hub.clone()), config);
        let counters = pipeline.counters();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(pipeline.run(cancel_clone));

        producer.try_enqueue(dummy_record("1"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(counters.too_large.get(), 1);
        assert!(hub.batches().is_empty());
    }

    #[tokio::test]
    async fn test_batches_carry_content_type_and_encoding() {
        let (producer, consumer, _) = bounded(16);
        let hub = FakeHubClient::new();
        let config = DispatchConfig {
            hub_message_size: 1_000_000,
            send_interval: Duration::from_millis(20),
            field_config: TelemetryFieldConfig::default(),
        };
        let pipeline = DispatchPipeline::new(consumer, Arc::new(hub.clone()), config);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(pipeline.run(cancel_clone));

        producer.try_enqueue(dummy_record("1"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        let messages = hub.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content_type, crate::hub::CONTENT_TYPE);
        assert_eq!(messages[0].content_encoding, crate::hub::CONTENT_ENCODING);
    }
}
