//! Notifier broadcasting store notifications to subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use tracing::warn;

use super::types::{
    DropReason, NotificationConfig, NotificationHandle, StoreNotification, SubscriptionId,
};
use crate::collection::Operation;
use crate::error::CollectionError;
use crate::types::{Identity, Revision};

struct Subscription {
    config: NotificationConfig,
    sender: Sender<StoreNotification>,
}

impl Subscription {
    /// Returns false if the buffer is full or the receiver is gone.
    fn try_send(&self, notification: StoreNotification) -> bool {
        self.sender.try_send(notification).is_ok()
    }

    fn wants(&self, notification: &StoreNotification) -> bool {
        let filter = &self.config.filter;
        match notification {
            StoreNotification::Error { .. } => filter.include_errors,
            StoreNotification::Committed { .. } => filter.include_commits,
            StoreNotification::Snapshotted { .. } => filter.include_snapshots,
            StoreNotification::Dropped { .. } => true,
        }
    }
}

/// Fan-out of store notifications.
pub struct Notifier {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    next_id: AtomicU64,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, config: NotificationConfig) -> NotificationHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size);

        self.subscriptions
            .write()
            .insert(id, Subscription { config, sender });

        NotificationHandle { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(sub) = self.subscriptions.write().remove(&id) {
            let _ = sub.sender.try_send(StoreNotification::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Report a storage failure. Database adapters use this for failures
    /// that happen outside any repository call (e.g. a lost connection).
    pub fn report_error(&self, operation: Operation, collection: &str, error: &CollectionError) {
        warn!(?operation, collection, error = %error, "storage operation failed");
        self.broadcast(StoreNotification::Error {
            operation,
            collection: collection.to_string(),
            message: error.to_string(),
        });
    }

    pub fn broadcast_commit(&self, entity: &str, id: &Identity, revision: Revision, events: usize) {
        self.broadcast(StoreNotification::Committed {
            entity: entity.to_string(),
            id: id.clone(),
            revision,
            events,
        });
    }

    pub fn broadcast_snapshot(&self, entity: &str, id: &Identity, revision: Revision) {
        self.broadcast(StoreNotification::Snapshotted {
            entity: entity.to_string(),
            id: id.clone(),
            revision,
        });
    }

    /// Send to every interested subscriber, dropping those that can't keep up.
    fn broadcast(&self, notification: StoreNotification) {
        let mut to_remove = Vec::new();

        {
            let subs = self.subscriptions.read();
            for (id, sub) in subs.iter() {
                if sub.wants(&notification) && !sub.try_send(notification.clone()) {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subs = self.subscriptions.write();
            for id in to_remove {
                if let Some(sub) = subs.remove(&id) {
                    let _ = sub.sender.try_send(StoreNotification::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
