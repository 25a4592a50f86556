//! Repository tying the event log and snapshot store together.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::collection::{connect, Database, Operation};
use crate::entity::Entity;
use crate::error::{Result, StoreError};
use crate::event::EventLog;
use crate::notifications::Notifier;
use crate::snapshot::{Cadence, SnapshotStore, DEFAULT_ROUNDS};
use crate::types::{EventRecord, Identity, SnapshotRecord};

/// Allocates a blank entity for an identity.
pub type Factory<E> = Arc<dyn Fn(Identity) -> E + Send + Sync>;

/// Repository configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Collection prefix. Defaults to the lower-cased entity type name.
    pub name: Option<String>,

    /// Connection string, used when no database handle is supplied.
    pub uri: Option<String>,

    /// Revisions between automatic snapshots.
    pub rounds: u64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            name: None,
            uri: None,
            rounds: DEFAULT_ROUNDS,
        }
    }
}

/// Per-commit options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommitOptions {
    /// Write a snapshot regardless of cadence.
    pub snap: bool,
}

impl CommitOptions {
    pub fn snapshot() -> Self {
        Self { snap: true }
    }
}

/// Builder validating everything a repository needs before any I/O.
pub struct RepositoryBuilder<E> {
    factory: Option<Factory<E>>,
    database: Option<Arc<dyn Database>>,
    notifier: Option<Arc<Notifier>>,
    config: RepositoryConfig,
}

impl<E: Entity> RepositoryBuilder<E> {
    fn new() -> Self {
        Self {
            factory: None,
            database: None,
            notifier: None,
            config: RepositoryConfig::default(),
        }
    }

    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(Identity) -> E + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    pub fn database(mut self, database: Arc<dyn Database>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.config.uri = Some(uri.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    pub fn rounds(mut self, rounds: u64) -> Self {
        self.config.rounds = rounds;
        self
    }

    pub fn config(mut self, config: RepositoryConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing notifier, e.g. to observe failures during `open`.
    pub fn notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Validate the configuration, resolve the database and create indexes.
    pub async fn open(self) -> Result<Repository<E>> {
        let factory = self.factory.ok_or(StoreError::MissingEntity)?;

        let name = self.config.name.unwrap_or_else(E::type_name);
        if name.trim().is_empty() {
            return Err(StoreError::InvalidEntityName(name));
        }
        if self.config.rounds == 0 {
            return Err(StoreError::InvalidRounds);
        }

        let database = match (self.database, self.config.uri.as_deref()) {
            (Some(db), _) => db,
            (None, Some(uri)) => connect(uri)?,
            (None, None) => return Err(StoreError::MissingDatabase),
        };
        let notifier = self.notifier.unwrap_or_default();

        let events_name = format!("{}.events", name);
        let snapshots_name = format!("{}.snapshots", name);
        let events_coll = database.collection(&events_name).map_err(|e| {
            notifier.report_error(Operation::Connection, &events_name, &e);
            e
        })?;
        let snapshots_coll = database.collection(&snapshots_name).map_err(|e| {
            notifier.report_error(Operation::Connection, &snapshots_name, &e);
            e
        })?;

        let events = EventLog::new(events_coll, Arc::clone(&notifier));
        let snapshots = SnapshotStore::new(
            snapshots_coll,
            Arc::clone(&notifier),
            Cadence::new(self.config.rounds),
            name.clone(),
        );
        events.init().await?;
        snapshots.init().await?;

        info!(entity = %name, rounds = self.config.rounds, "repository opened");

        Ok(Repository {
            name,
            factory,
            events,
            snapshots,
            notifier,
        })
    }
}

/// Loads and persists entities of type `E`.
///
/// Reads restore the latest snapshot and replay newer events on top; writes
/// go to the snapshot store first (when the cadence calls for it) and to the
/// event log second.
///
/// Commits to the same identity must be serialized by the caller: there is
/// no revision check on write.
pub struct Repository<E> {
    name: String,
    factory: Factory<E>,
    events: EventLog,
    snapshots: SnapshotStore,
    notifier: Arc<Notifier>,
}

impl<E: Entity> Repository<E> {
    pub fn builder() -> RepositoryBuilder<E> {
        RepositoryBuilder::new()
    }

    /// Collection prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rounds(&self) -> u64 {
        self.snapshots.cadence().rounds
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// A blank entity stamped with `id`.
    pub fn cast(&self, id: Identity) -> E {
        let mut entity = (self.factory)(id.clone());
        entity.core_mut().set_id(id);
        entity
    }

    /// Load one entity. `None` when it has neither snapshot nor events.
    pub async fn get(&self, id: impl Into<Identity>) -> Result<Option<E>> {
        let id = id.into();
        let snapshot = self.snapshots.latest(&id).await?;
        let events = self.events.fetch(&id, snapshot.as_ref()).await?;

        if snapshot.is_none() && events.is_empty() {
            debug!(entity = %self.name, %id, "entity not found");
            return Ok(None);
        }

        debug!(
            entity = %self.name,
            %id,
            snapshot = ?snapshot.as_ref().map(|s| s.revision),
            events = events.len(),
            "rebuilding entity"
        );
        self.rebuild(id, snapshot.as_ref(), &events).map(Some)
    }

    /// Load several entities in two snapshot and one event round trip.
    ///
    /// The result lines up with `ids`: slot `i` holds the entity for
    /// `ids[i]`, or `None` when nothing is stored for it.
    pub async fn get_many(&self, ids: &[Identity]) -> Result<Vec<Option<E>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let snapshots = self.snapshots.latest_many(ids).await?;
        let events = self.events.fetch_many(ids, &snapshots).await?;
        debug!(
            entity = %self.name,
            ids = ids.len(),
            snapshots = snapshots.len(),
            events = events.len(),
            "rebuilding entities"
        );

        let mut events_by_id: HashMap<Identity, Vec<EventRecord>> = HashMap::new();
        for event in events {
            events_by_id.entry(event.id.clone()).or_default().push(event);
        }
        let snapshots_by_id: HashMap<Identity, SnapshotRecord> = snapshots
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();

        ids.iter()
            .map(|id| {
                let snapshot = snapshots_by_id.get(id);
                let events = events_by_id.get(id).map(Vec::as_slice).unwrap_or_default();
                if snapshot.is_none() && events.is_empty() {
                    return Ok(None);
                }
                self.rebuild(id.clone(), snapshot, events).map(Some)
            })
            .collect()
    }

    /// Load every entity that has events.
    ///
    /// Scans the whole event log for identities; meant for small data sets
    /// and administrative use.
    pub async fn get_all(&self) -> Result<Vec<E>> {
        let ids = self.events.identities().await?;
        let entities = self.get_many(&ids).await?;
        Ok(entities.into_iter().flatten().collect())
    }

    /// Persist one entity.
    pub async fn commit(&self, entity: &mut E, options: CommitOptions) -> Result<()> {
        self.commit_many(std::slice::from_mut(entity), options).await
    }

    /// Persist several entities: snapshots first, events second, then emit
    /// each entity's queued notifications. `Committed` is broadcast only for
    /// entities that had events to write.
    ///
    /// Every entity must carry a valid identity; otherwise nothing is
    /// written. If the event write fails after snapshots were written, the
    /// snapshots stay and the pending events stay on the entities, so the
    /// whole commit can be retried.
    pub async fn commit_many(&self, entities: &mut [E], options: CommitOptions) -> Result<()> {
        if entities.iter().any(|e| !e.core().has_valid_id()) {
            return Err(StoreError::InvalidEntityId);
        }

        self.snapshots.commit_many(entities, options.snap).await?;

        let pending: Vec<usize> = entities.iter().map(|e| e.core().events().len()).collect();
        self.events.append_many(entities).await?;

        for (entity, count) in entities.iter_mut().zip(pending) {
            if let Some(id) = entity.id().filter(|_| count > 0) {
                self.notifier
                    .broadcast_commit(&self.name, id, entity.revision(), count);
            }
            for notification in entity.core_mut().drain_queue() {
                entity.emit(&notification.name, &notification.args);
            }
        }
        debug!(entity = %self.name, count = entities.len(), snap = options.snap, "committed");
        Ok(())
    }

    fn rebuild(
        &self,
        id: Identity,
        snapshot: Option<&SnapshotRecord>,
        events: &[EventRecord],
    ) -> Result<E> {
        let mut entity = self.cast(id);
        if let Some(snapshot) = snapshot {
            entity.restore(snapshot)?;
        }
        entity.replay(events)?;
        Ok(entity)
    }
}

impl<E> fmt::Debug for Repository<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("name", &self.name)
            .field("events", &self.events.collection_name())
            .field("snapshots", &self.snapshots.collection_name())
            .finish()
    }
}
