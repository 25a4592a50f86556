//! Notification types.

use serde::{Deserialize, Serialize};

use crate::collection::Operation;
use crate::types::{Identity, Revision};

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct NotificationConfig {
    /// Max buffered notifications before dropping the subscriber.
    /// Default: 1000
    pub buffer_size: usize,

    /// Filter criteria.
    pub filter: NotificationFilter,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filter: NotificationFilter::all(),
        }
    }
}

/// Which notifications a subscriber wants.
#[derive(Clone, Debug, Default)]
pub struct NotificationFilter {
    pub include_errors: bool,
    pub include_commits: bool,
    pub include_snapshots: bool,
}

impl NotificationFilter {
    /// Storage failures only.
    pub fn errors() -> Self {
        Self {
            include_errors: true,
            ..Default::default()
        }
    }

    pub fn commits() -> Self {
        Self {
            include_commits: true,
            include_snapshots: true,
            ..Default::default()
        }
    }

    pub fn all() -> Self {
        Self {
            include_errors: true,
            include_commits: true,
            include_snapshots: true,
        }
    }
}

/// Notifications broadcast by the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreNotification {
    /// A setup operation (index creation, connection) failed.
    Error {
        operation: Operation,
        collection: String,
        message: String,
    },

    /// An entity's pending events were appended.
    Committed {
        entity: String,
        id: Identity,
        revision: Revision,
        events: usize,
    },

    /// A snapshot was written.
    Snapshotted {
        entity: String,
        id: Identity,
        revision: Revision,
    },

    /// Subscription was dropped.
    Dropped { reason: DropReason },
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Receiving end of a subscription.
pub struct NotificationHandle {
    pub id: SubscriptionId,
    pub receiver: crossbeam_channel::Receiver<StoreNotification>,
}

impl NotificationHandle {
    /// Receive the next notification (blocking).
    pub fn recv(&self) -> Result<StoreNotification, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a notification (non-blocking).
    pub fn try_recv(&self) -> Result<StoreNotification, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<StoreNotification, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything currently buffered.
    pub fn drain(&self) -> Vec<StoreNotification> {
        self.receiver.try_iter().collect()
    }
}
