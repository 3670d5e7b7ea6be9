//! OPC UA session, subscription, and monitored-item management (§4.2, §4.3).
//!
//! The OPC UA stack itself (secure channel negotiation, binary encoding,
//! namespace tables) is an external collaborator (§1 Non-goals): these
//! modules only consume it through the narrow [`adapter::OpcUaStack`] /
//! [`adapter::OpcUaSession`] traits, the way the teacher's `GrpcClient` only
//! consumes `tonic`-generated clients through its own connection seam.

pub mod adapter;
pub mod monitored_item;
pub mod registry;
pub mod session;
pub mod subscription;

pub use adapter::{MonitoredItemHandle, OpcUaSession, OpcUaStack, RawNotification};
pub use registry::SessionRegistry;
pub use session::{SessionState, SessionSupervisor};
