//! Notification fan-out
//!
//! Broadcasts state transitions to every party subscribed to a request's
//! channel (the client plus offering drivers) and pool-wide announcements
//! to all drivers. Delivery is at-least-once and best-effort with no
//! ordering guarantee across event names: there is no retry or
//! persistence, a disconnected subscriber simply misses events and
//! reconciles through a status query. Distinct from the persisted chat
//! transcript - these are fire-and-forget UI hints.
//!
//! Uses DashMap for concurrent access; supports multiple subscriptions
//! per channel (e.g., mobile + web).

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::core_types::{RequestId, SubscriberId};

/// One published event
#[derive(Debug, Clone)]
pub struct Notification {
    /// Channel the event was published on; `None` for pool-wide broadcasts
    pub request_id: Option<RequestId>,
    pub event: &'static str,
    pub payload: serde_json::Value,
}

type Sender = mpsc::UnboundedSender<Notification>;

/// Per-request channel registry
pub struct NotificationHub {
    /// request_id -> list of (subscriber_id, sender)
    channels: DashMap<RequestId, Vec<(SubscriberId, Sender)>>,
    /// Pool-wide subscribers (the driver pool watching for new requests)
    pool: DashMap<SubscriberId, Sender>,
    next_sub_id: AtomicU64,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            pool: DashMap::new(),
            next_sub_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to one request's channel
    pub fn subscribe(
        &self,
        request_id: RequestId,
    ) -> (SubscriberId, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub_id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.channels
            .entry(request_id)
            .or_default()
            .push((sub_id, tx));
        tracing::debug!(%request_id, sub_id, "Channel subscription added");
        (sub_id, rx)
    }

    /// Subscribe to pool-wide announcements
    pub fn subscribe_pool(&self) -> (SubscriberId, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub_id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.pool.insert(sub_id, tx);
        (sub_id, rx)
    }

    /// Drop a request-channel subscription; cleans up empty channels.
    pub fn unsubscribe(&self, request_id: RequestId, sub_id: SubscriberId) {
        if let Some(mut subs) = self.channels.get_mut(&request_id) {
            subs.retain(|(id, _)| *id != sub_id);
            if subs.is_empty() {
                drop(subs);
                self.channels.remove(&request_id);
            }
        }
    }

    pub fn unsubscribe_pool(&self, sub_id: SubscriberId) {
        self.pool.remove(&sub_id);
    }

    /// Publish to one request's channel. Failed sends (receiver dropped)
    /// are pruned; nobody listening is not an error.
    pub fn publish(&self, request_id: RequestId, event: &'static str, payload: serde_json::Value) {
        let notification = Notification {
            request_id: Some(request_id),
            event,
            payload,
        };

        if let Some(mut subs) = self.channels.get_mut(&request_id) {
            subs.retain(|(sub_id, tx)| {
                let delivered = tx.send(notification.clone()).is_ok();
                if !delivered {
                    tracing::warn!(%request_id, sub_id, event, "Subscriber gone, dropping");
                }
                delivered
            });
            tracing::debug!(%request_id, event, recipients = subs.len(), "Event published");
        }
    }

    /// Publish to every pool subscriber (new-request / request-gone
    /// announcements for the driver pool).
    pub fn publish_all(&self, event: &'static str, payload: serde_json::Value) {
        let notification = Notification {
            request_id: None,
            event,
            payload,
        };

        self.pool.retain(|_, tx| tx.send(notification.clone()).is_ok());
        tracing::debug!(event, recipients = self.pool.len(), "Pool event published");
    }

    /// (channels, total request-channel subscribers, pool subscribers)
    pub fn stats(&self) -> (usize, usize, usize) {
        let total: usize = self.channels.iter().map(|e| e.value().len()).sum();
        (self.channels.len(), total, self.pool.len())
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}
