//! The cloud hub connection is an external collaborator (§1, §6): this
//! module defines only the narrow interface the Dispatch Pipeline sends
//! batched messages through, mirroring the teacher's `ServerPushHandler`
//! trait — a thin seam that lets the pipeline be driven by a fake client in
//! tests instead of a real device SDK connection.

use async_trait::async_trait;

use crate::error::Result;

/// Content type used for every hub send (§4.4): a JSON array of encoded
/// telemetry records, UTF-8 encoded.
pub const CONTENT_TYPE: &str = "application/opcua+uajson";

/// Content encoding used for every hub send (§4.4 step 5).
pub const CONTENT_ENCODING: &str = "UTF-8";

/// One batched send to the cloud hub: the encoded body plus the
/// content-type/content-encoding pair attached to it (§4.4 step 5,
/// Testable Property #4).
#[derive(Debug, Clone)]
pub struct HubMessage {
    pub content_type: &'static str,
    pub content_encoding: &'static str,
    pub body: Vec<u8>,
}

impl HubMessage {
    /// Build a message with the gateway's standard content-type/encoding.
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            content_type: CONTENT_TYPE,
            content_encoding: CONTENT_ENCODING,
            body,
        }
    }
}

/// A batched send to the cloud hub.
#[async_trait]
pub trait HubClient: Send + Sync {
    /// Send one batch. Implementations own their own retry/backoff policy; a
    /// returned error means the batch was not delivered and is dropped by
    /// the pipeline (§4.4 — no redelivery guarantee beyond the in-process
    /// queue).
    async fn send_batch(&self, message: HubMessage) -> Result<()>;
}

/// A [`HubClient`] that discards everything it is given, logging at debug
/// level. Useful as a default when no connection string is configured, so
/// the rest of the pipeline can run unconditionally.
pub struct NullHubClient;

#[async_trait]
impl HubClient for NullHubClient {
    async fn send_batch(&self, message: HubMessage) -> Result<()> {
        tracing::debug!(
            bytes = message.body.len(),
            content_type = message.content_type,
            "discarding batch: no hub configured"
        );
        Ok(())
    }
}

#[cfg(feature = "test-support")]
pub mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// A [`HubClient`] that records every batch it receives, for assertions
    /// in integration tests.
    #[derive(Clone, Default)]
    pub struct FakeHubClient {
        pub sent: Arc<Mutex<Vec<HubMessage>>>,
        pub fail_next: Arc<Mutex<bool>>,
    }

    impl FakeHubClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn batches(&self) -> Vec<Vec<u8>> {
            self.sent.lock().iter().map(|m| m.body.clone()).collect()
        }

        /// Full messages (body plus content-type/encoding), for asserting
        /// the attached metadata rather than just the body.
        pub fn messages(&self) -> Vec<HubMessage> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl HubClient for FakeHubClient {
        async fn send_batch(&self, message: HubMessage) -> Result<()> {
            if std::mem::take(&mut *self.fail_next.lock()) {
                return Err(crate::error::GatewayError::Other(anyhow::anyhow!(
                    "simulated hub failure"
                )));
            }
            self.sent.lock().push(message);
            Ok(())
        }
    }
}
