//! Subscription (§3, §4.2): one per (session, distinct publishing interval),
//! grouping monitored items that share a server-side publishing cadence.
//!
//! The OPC UA stack's own subscription object is behind the narrow
//! [`crate::opcua::adapter::OpcUaSession`] seam, which creates monitored
//! items directly on the session rather than exposing a separate
//! stack-level subscription handle (Design Notes §9: "stack types are
//! accessed through a narrow adapter interface"). `stack_handle` here is a
//! supervisor-local bookkeeping id assigned at creation, standing in for
//! the handle the real stack would return from `CreateSubscription`.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;

use super::monitored_item::MonitoredItem;

static NEXT_HANDLE: AtomicU32 = AtomicU32::new(1);

/// A subscription grouping monitored items by publishing interval (§3).
pub struct Subscription {
    pub requested_publishing_interval_ms: i64,
    pub revised_publishing_interval_ms: i64,
    pub stack_handle: u32,
    items: RwLock<Vec<MonitoredItem>>,
}

impl Subscription {
    pub fn new(requested_publishing_interval_ms: i64) -> Self {
        Self {
            requested_publishing_interval_ms,
            // No real negotiation happens across the adapter seam; the
            // revised interval mirrors the request until the stack is
            // consulted for real (see module doc).
            revised_publishing_interval_ms: requested_publishing_interval_ms,
            stack_handle: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
            items: RwLock::new(Vec::new()),
        }
    }

    pub fn add_item(&self, item: MonitoredItem) {
        self.items.write().push(item);
    }

    pub fn remove_item(&self, key: &str) -> Option<MonitoredItem> {
        let mut guard = self.items.write();
        let idx = guard.iter().position(|i| i.key == key)?;
        Some(guard.remove(idx))
    }

    pub fn find(&self, key: &str) -> bool {
        self.items.read().iter().any(|i| i.key == key)
    }

    /// Reconfigure an existing item matching `key` if it is stuck in
    /// `FailedPermanently` (§4.2, §7 "reconfigured"), returning whether a
    /// matching item exists at all (regardless of whether it needed
    /// reconfiguring).
    pub fn reconfigure_if_failed(&self, key: &str, awaiting_namespace: bool) -> bool {
        let guard = self.items.read();
        match guard.iter().find(|i| i.key == key) {
            Some(item) => {
                item.reconfigure(awaiting_namespace);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn with_items<R>(&self, f: impl FnOnce(&[MonitoredItem]) -> R) -> R {
        f(&self.items.read())
    }

    pub fn item_keys(&self) -> Vec<String> {
        self.items.read().iter().map(|i| i.key.clone()).collect()
    }

    pub fn find_handle(&self, handle: super::adapter::MonitoredItemHandle) -> Option<usize> {
        self.items.read().iter().position(|i| i.handle() == Some(handle))
    }

    /// Dispatch a raw notification to whichever item owns `handle`, if any.
    pub fn route_notification(
        &self,
        notification: &super::adapter::RawNotification,
        suppressed: &std::collections::HashSet<u32>,
        producer: &crate::telemetry::QueueProducer,
    ) {
        let guard = self.items.read();
        if let Some(item) = guard.iter().find(|i| i.handle() == Some(notification.handle)) {
            item.handle_notification(notification, suppressed, producer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeId, NodeOverrides};

    fn sample_item(key: &str) -> MonitoredItem {
        MonitoredItem::new(
            key.to_string(),
            key.to_string(),
            NodeId::parse(key),
            NodeOverrides::default(),
            "opc.tcp://s:1".to_string(),
            1000,
            0,
        )
    }

    #[test]
    fn test_add_and_remove_item() {
        let sub = Subscription::new(1000);
        sub.add_item(sample_item("ns=1;i=1"));
        assert_eq!(sub.len(), 1);
        assert!(sub.remove_item("ns=1;i=1").is_some());
        assert!(sub.is_empty());
    }

    #[test]
    fn test_distinct_subscriptions_get_distinct_stack_handles() {
        let a = Subscription::new(1000);
        let b = Subscription::new(1000);
        assert_ne!(a.stack_handle, b.stack_handle);
    }
}
