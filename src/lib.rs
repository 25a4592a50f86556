//! # Snapstore
//!
//! Event-sourced persistence for domain entities: every state change is an
//! event appended to a per-entity-type log, and snapshots are taken every
//! few revisions so loading an entity never replays the whole history.
//!
//! ## Core Concepts
//!
//! - **Entities**: Domain types that embed an [`EntityCore`] and fold events via [`Entity::apply`]
//! - **Event log**: Append-only `<name>.events` collection keyed by `(id, revision)`
//! - **Snapshots**: `<name>.snapshots` collection written on a revision cadence
//! - **Repository**: Loads entities from snapshot plus newer events, commits snapshots then events
//!
//! ## Example
//!
//! ```ignore
//! use snapstore::{CommitOptions, Repository};
//!
//! let repo = Repository::<Task>::builder()
//!     .factory(|id| Task::new(id))
//!     .uri("file://./data")
//!     .open()
//!     .await?;
//!
//! let mut task = repo.cast("t1".into());
//! task.start()?;
//! repo.commit(&mut task, CommitOptions::default()).await?;
//!
//! let loaded = repo.get("t1").await?;
//! ```

pub mod collection;
pub mod entity;
pub mod error;
pub mod event;
pub mod notifications;
pub mod query;
pub mod repository;
pub mod snapshot;
pub mod types;

// Re-exports
pub use collection::{
    connect, Collection, Database, FileCollection, FileDatabase, MemoryCollection,
    MemoryDatabase, Operation,
};
pub use entity::{Entity, EntityCore, Listener, Notification};
pub use error::{CollectionError, CollectionResult, Result, StoreError};
pub use event::EventLog;
pub use notifications::{
    DropReason, NotificationConfig, NotificationFilter, NotificationHandle, Notifier,
    StoreNotification, SubscriptionId,
};
pub use query::{
    Accumulator, Document, Filter, FindOptions, IndexSpec, Pipeline, SortOrder, Stage,
};
pub use repository::{CommitOptions, Factory, Repository, RepositoryBuilder, RepositoryConfig};
pub use snapshot::{Cadence, SnapshotStore, DEFAULT_ROUNDS};
pub use types::*;
