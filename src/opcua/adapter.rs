//! Narrow adapter interface to the external OPC UA stack.
//!
//! Mirrors the relationship between the teacher's `GrpcClient` and the
//! `tonic`-generated `RequestClient`/`BiRequestStreamClient`: the stack's own
//! connection/session types are never named by the supervisor above this
//! module, only this trait pair, so the supervisor can be driven by a fake
//! stack in tests (§4.2 Design Notes).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{AuthMode, NodeId};

/// Opaque handle to a monitored item created on a session, returned by the
/// stack and threaded back in on delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitoredItemHandle(pub u32);

/// One value-change (or heartbeat) notification surfaced by the stack.
#[derive(Debug, Clone)]
pub struct RawNotification {
    pub handle: MonitoredItemHandle,
    /// The stack's raw encoder output, still wrapped in
    /// `{"Value":{"Value":...}}` (see [`crate::telemetry::extract_value_fragment`]).
    pub encoded_value: String,
    pub source_timestamp: DateTime<Utc>,
    pub status_code: u32,
    pub status_symbolic: String,
}

/// A live OPC UA session against one endpoint.
#[async_trait]
pub trait OpcUaSession: Send + Sync {
    /// Fetch the server's namespace array (index = position), once, right
    /// after connect (§4.2 step 1: "fetch the namespace array"). The
    /// session supervisor caches the result and resolves individual
    /// `nsu=`/`ns=` conversions against it without further stack calls.
    async fn namespace_array(&self) -> Vec<String>;

    /// Create a monitored item for `node` at the given sampling interval
    /// (milliseconds; -1 requests the publishing interval, per §4.3).
    async fn create_monitored_item(
        &self,
        node: &NodeId,
        sampling_interval_ms: i32,
    ) -> Result<MonitoredItemHandle>;

    async fn delete_monitored_item(&self, handle: MonitoredItemHandle) -> Result<()>;

    /// Non-blocking poll for the next queued notification, if any.
    async fn poll_notification(&self) -> Option<RawNotification>;

    /// Perform one keep-alive round trip (a read of the server's
    /// `ServerStatus` node in the real stack). An error counts toward the
    /// disconnect threshold (§4.2).
    async fn keep_alive(&self) -> Result<()>;

    async fn close(&self);
}

/// Factory for establishing new [`OpcUaSession`]s.
#[async_trait]
pub trait OpcUaStack: Send + Sync {
    async fn connect(
        &self,
        endpoint_url: &str,
        use_security: bool,
        auth: &AuthMode,
    ) -> Result<Box<dyn OpcUaSession>>;
}

#[cfg(feature = "test-support")]
pub mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    /// A fake session that hands out sequential handles and replays a
    /// caller-supplied queue of notifications and keep-alive outcomes.
    pub struct FakeSession {
        next_handle: AtomicU32,
        pub notifications: Mutex<VecDeque<RawNotification>>,
        pub keep_alive_should_fail: AtomicBool,
        pub closed: AtomicBool,
        /// When set, every `create_monitored_item` call fails with
        /// `GatewayError::BadNodeId`, for exercising the permanent-failure
        /// path in the session supervisor.
        pub fail_create_with_bad_node_id: AtomicBool,
    }

    impl FakeSession {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                next_handle: AtomicU32::new(1),
                notifications: Mutex::new(VecDeque::new()),
                keep_alive_should_fail: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                fail_create_with_bad_node_id: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl OpcUaSession for Arc<FakeSession> {
        async fn namespace_array(&self) -> Vec<String> {
            (0..4)
                .map(|i| format!("urn:fake:ns:{i}"))
                .collect()
        }

        async fn create_monitored_item(
            &self,
            node: &NodeId,
            _sampling_interval_ms: i32,
        ) -> Result<MonitoredItemHandle> {
            if self.fail_create_with_bad_node_id.load(Ordering::Relaxed) {
                return Err(crate::error::GatewayError::BadNodeId(
                    node.raw().to_string(),
                ));
            }
            Ok(MonitoredItemHandle(
                self.next_handle.fetch_add(1, Ordering::Relaxed),
            ))
        }

        async fn delete_monitored_item(&self, _handle: MonitoredItemHandle) -> Result<()> {
            Ok(())
        }

        async fn poll_notification(&self) -> Option<RawNotification> {
            self.notifications.lock().pop_front()
        }

        async fn keep_alive(&self) -> Result<()> {
            if self.keep_alive_should_fail.load(Ordering::Relaxed) {
                Err(crate::error::GatewayError::Other(anyhow::anyhow!(
                    "simulated keep-alive failure"
                )))
            } else {
                Ok(())
            }
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::Relaxed);
        }
    }

    /// A fake stack that always hands out a fresh [`FakeSession`], and can
    /// be told to fail the next `connect` call.
    #[derive(Default)]
    pub struct FakeStack {
        pub fail_next_connect: AtomicBool,
        pub last_session: Mutex<Option<Arc<FakeSession>>>,
    }

    impl FakeStack {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }
    }

    #[async_trait]
    impl OpcUaStack for FakeStack {
        async fn connect(
            &self,
            _endpoint_url: &str,
            _use_security: bool,
            _auth: &AuthMode,
        ) -> Result<Box<dyn OpcUaSession>> {
            if self.fail_next_connect.swap(false, Ordering::Relaxed) {
                return Err(crate::error::GatewayError::Other(anyhow::anyhow!(
                    "simulated connect failure"
                )));
            }
            let session = FakeSession::new();
            *self.last_session.lock() = Some(session.clone());
            Ok(Box::new(session))
        }
    }
}
