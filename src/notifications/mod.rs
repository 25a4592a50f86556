//! Store-level notifications.
//!
//! The repository owns a [`Notifier`] and broadcasts on it:
//! - setup failures: index creation and connection errors
//! - committed entities
//! - written snapshots
//!
//! Each subscriber gets a bounded queue; a subscriber that falls behind is
//! dropped rather than slowing the store down.
//!
//! # Example
//!
//! ```ignore
//! let handle = repository.notifier().subscribe(NotificationConfig {
//!     filter: NotificationFilter::errors(),
//!     ..Default::default()
//! });
//!
//! while let Ok(notification) = handle.recv() {
//!     if let StoreNotification::Error { message, .. } = notification {
//!         eprintln!("store error: {}", message);
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::Notifier;
pub use types::{
    DropReason, NotificationConfig, NotificationFilter, NotificationHandle, StoreNotification,
    SubscriptionId,
};
