//! Entity capability set.
//!
//! Domain types embed an [`EntityCore`] for bookkeeping and implement
//! [`Entity`]. State changes go through [`Entity::apply`] only: recording a
//! new event applies it, and replaying a stored event applies it the same
//! way, so a fold from any baseline reaches the same state.
//!
//! ```ignore
//! #[derive(Default)]
//! struct Task {
//!     core: EntityCore,
//!     status: String,
//! }
//!
//! impl Entity for Task {
//!     fn core(&self) -> &EntityCore { &self.core }
//!     fn core_mut(&mut self) -> &mut EntityCore { &mut self.core }
//!     fn state(&self) -> Result<Value> { Ok(json!({ "status": self.status })) }
//!     fn restore_state(&mut self, state: &Value) -> Result<()> { ... }
//!     fn apply(&mut self, event: &EventRecord) -> Result<()> {
//!         self.status = event.name.clone();
//!         Ok(())
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::types::{EventRecord, Identity, Revision, SnapshotRecord, Timestamp};

/// Callback registered for an emitted notification name.
pub type Listener = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// A notification queued on an entity, emitted after a successful commit.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub name: String,
    pub args: Vec<Value>,
}

/// Bookkeeping shared by every entity.
#[derive(Clone, Default)]
pub struct EntityCore {
    id: Option<Identity>,
    revision: Revision,
    version: Revision,
    events: Vec<EventRecord>,
    queue: Vec<Notification>,
    listeners: HashMap<String, Vec<Listener>>,
}

impl EntityCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: impl Into<Identity>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn id(&self) -> Option<&Identity> {
        self.id.as_ref()
    }

    pub fn set_id(&mut self, id: Identity) {
        self.id = Some(id);
    }

    /// True when the entity carries a usable identity.
    pub fn has_valid_id(&self) -> bool {
        self.id.as_ref().map_or(false, Identity::is_valid)
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn set_revision(&mut self, revision: Revision) {
        self.revision = revision;
    }

    /// Revision of the most recent snapshot.
    pub fn version(&self) -> Revision {
        self.version
    }

    pub fn set_version(&mut self, version: Revision) {
        self.version = version;
    }

    /// Uncommitted events, oldest first.
    pub fn events(&self) -> &[EventRecord] {
        &self.events
    }

    pub fn push_event(&mut self, event: EventRecord) {
        self.events.push(event);
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    /// Notifications waiting for the next successful commit.
    pub fn queued(&self) -> &[Notification] {
        &self.queue
    }

    pub fn enqueue(&mut self, name: impl Into<String>, args: Vec<Value>) {
        self.queue.push(Notification {
            name: name.into(),
            args,
        });
    }

    /// Take every queued notification, in enqueue order.
    pub fn drain_queue(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.queue)
    }

    /// Register a listener for `name`.
    pub fn on(&mut self, name: impl Into<String>, listener: Listener) {
        self.listeners.entry(name.into()).or_default().push(listener);
    }

    /// Invoke every listener registered for `name`, in registration order.
    pub fn emit(&self, name: &str, args: &[Value]) {
        if let Some(listeners) = self.listeners.get(name) {
            for listener in listeners {
                listener(args);
            }
        }
    }
}

impl fmt::Debug for EntityCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityCore")
            .field("id", &self.id)
            .field("revision", &self.revision)
            .field("version", &self.version)
            .field("events", &self.events.len())
            .field("queue", &self.queue.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Capabilities the repository needs from a domain type.
pub trait Entity: Send + 'static {
    fn core(&self) -> &EntityCore;

    fn core_mut(&mut self) -> &mut EntityCore;

    /// Serializable domain state (bookkeeping excluded).
    fn state(&self) -> Result<Value>;

    /// Replace domain state with a previously captured [`Entity::state`].
    fn restore_state(&mut self, state: &Value) -> Result<()>;

    /// Fold one event into domain state.
    fn apply(&mut self, event: &EventRecord) -> Result<()>;

    /// Name used for the backing collections. Defaults to the lower-cased
    /// type name, e.g. `TestEntity` -> `testentity`.
    fn type_name() -> String
    where
        Self: Sized,
    {
        let full = std::any::type_name::<Self>();
        let base = full.split('<').next().unwrap_or(full);
        base.rsplit("::").next().unwrap_or(base).to_lowercase()
    }

    fn id(&self) -> Option<&Identity> {
        self.core().id()
    }

    fn revision(&self) -> Revision {
        self.core().revision()
    }

    fn version(&self) -> Revision {
        self.core().version()
    }

    /// Record a new event: advance the revision, apply it and buffer it for
    /// the next commit.
    fn record(&mut self, name: &str, payload: Value) -> Result<()> {
        let id = self
            .core()
            .id()
            .filter(|id| id.is_valid())
            .cloned()
            .ok_or(StoreError::InvalidEntityId)?;
        let revision = self.core().revision().next();
        let event = EventRecord::new(id, revision, name, payload);

        self.apply(&event)?;
        let core = self.core_mut();
        core.set_revision(revision);
        core.push_event(event);
        Ok(())
    }

    /// Queue a notification for emission after the next successful commit.
    fn enqueue(&mut self, name: &str, args: Vec<Value>) {
        self.core_mut().enqueue(name, args);
    }

    fn emit(&self, name: &str, args: &[Value]) {
        self.core().emit(name, args);
    }

    /// Capture a snapshot at the current revision.
    fn snap(&self) -> Result<SnapshotRecord> {
        let id = self.core().id().cloned().ok_or(StoreError::InvalidEntityId)?;
        Ok(SnapshotRecord {
            storage_id: None,
            id,
            revision: self.revision(),
            version: self.version(),
            state: self.state()?,
            timestamp: Timestamp::now(),
        })
    }

    /// Load a snapshot as the replay baseline.
    fn restore(&mut self, snapshot: &SnapshotRecord) -> Result<()> {
        self.restore_state(&snapshot.state)?;
        let core = self.core_mut();
        core.set_revision(snapshot.revision);
        core.set_version(snapshot.revision);
        Ok(())
    }

    /// Fold persisted events onto the current state without buffering them.
    fn replay(&mut self, events: &[EventRecord]) -> Result<()> {
        for event in events {
            self.apply(event)?;
            self.core_mut().set_revision(event.revision);
        }
        Ok(())
    }
}
