//! Telemetry Queue and Dispatch Pipeline (§4.4).

pub mod dispatch;
pub mod queue;
pub mod record;

pub use dispatch::{DispatchConfig, DispatchCounters, DispatchPipeline};
pub use queue::{bounded, QueueCounters, QueueConsumer, QueueProducer};
pub use record::{encode_record, extract_value_fragment, TelemetryFieldConfig, TelemetryRecord};
