//! Snapshot store with cadence-driven writes.
//!
//! Snapshots live in the `<entity>.snapshots` collection. Several may exist
//! per identity; reads always pick the one with the highest revision.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::collection::{Collection, Operation};
use crate::entity::Entity;
use crate::error::{CollectionError, Result};
use crate::notifications::Notifier;
use crate::query::{Accumulator, Filter, FindOptions, IndexSpec, Pipeline, SortOrder, Stage};
use crate::types::{Identity, Revision, SnapshotRecord, ID_FIELD, REVISION_FIELD, VERSION_FIELD};

/// Default number of revisions between automatic snapshots.
pub const DEFAULT_ROUNDS: u64 = 10;

/// When to persist a new snapshot.
///
/// A snapshot is due when forced, or when the entity has advanced at least
/// `rounds` revisions past its last snapshot watermark. This bounds replay
/// on load to fewer than `rounds` events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cadence {
    pub rounds: u64,
}

impl Cadence {
    pub fn new(rounds: u64) -> Self {
        Self { rounds }
    }

    pub fn is_due(&self, revision: Revision, version: Revision, force: bool) -> bool {
        force || revision.since(version) >= self.rounds
    }
}

impl Default for Cadence {
    fn default() -> Self {
        Self::new(DEFAULT_ROUNDS)
    }
}

/// Snapshot store over one collection.
pub struct SnapshotStore {
    collection: Arc<dyn Collection>,
    notifier: Arc<Notifier>,
    cadence: Cadence,
    entity: String,
}

impl SnapshotStore {
    pub fn new(
        collection: Arc<dyn Collection>,
        notifier: Arc<Notifier>,
        cadence: Cadence,
        entity: impl Into<String>,
    ) -> Self {
        Self {
            collection,
            notifier,
            cadence,
            entity: entity.into(),
        }
    }

    /// Create the `{id, revision}` and `{version}` indexes.
    pub async fn init(&self) -> Result<()> {
        for index in [
            IndexSpec::ascending(&[ID_FIELD, REVISION_FIELD]),
            IndexSpec::ascending(&[VERSION_FIELD]),
        ] {
            self.collection
                .ensure_index(index)
                .await
                .map_err(|e| self.fail(Operation::EnsureIndex, e))?;
        }
        Ok(())
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    pub fn collection_name(&self) -> &str {
        self.collection.name()
    }

    /// Most recent snapshot for one identity.
    pub async fn latest(&self, id: &Identity) -> Result<Option<SnapshotRecord>> {
        let options = FindOptions::sorted(&[(REVISION_FIELD, SortOrder::Descending)]).with_limit(1);
        let docs = self
            .collection
            .find(&Filter::eq(ID_FIELD, id.to_value()), &options)
            .await
            .map_err(|e| self.fail(Operation::Find, e))?;

        docs.into_iter()
            .next()
            .map(SnapshotRecord::from_document)
            .transpose()
    }

    /// Most recent snapshot for each of several identities, in two round
    /// trips: one aggregation for the per-identity max revision, then one
    /// find for exactly those rows. Identities without snapshots are absent.
    pub async fn latest_many(&self, ids: &[Identity]) -> Result<Vec<SnapshotRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let pipeline = Pipeline::new(vec![
            Stage::Match(Filter::is_in(
                ID_FIELD,
                ids.iter().map(Identity::to_value).collect(),
            )),
            Stage::Group {
                key: ID_FIELD.into(),
                accumulators: vec![(REVISION_FIELD.into(), Accumulator::Max(REVISION_FIELD.into()))],
            },
            Stage::Project(vec![
                (ID_FIELD.into(), "_id".into()),
                (REVISION_FIELD.into(), REVISION_FIELD.into()),
            ]),
        ]);
        let pairs = self
            .collection
            .aggregate(&pipeline)
            .await
            .map_err(|e| self.fail(Operation::Aggregate, e))?;

        if pairs.is_empty() {
            return Ok(Vec::new());
        }

        let mut clauses: Vec<Filter> = pairs
            .iter()
            .map(|pair| {
                Filter::and(vec![
                    Filter::eq(ID_FIELD, pair.get(ID_FIELD).cloned().unwrap_or(Value::Null)),
                    Filter::eq(
                        REVISION_FIELD,
                        pair.get(REVISION_FIELD).cloned().unwrap_or(Value::Null),
                    ),
                ])
            })
            .collect();
        let filter = if clauses.len() == 1 {
            clauses.remove(0)
        } else {
            Filter::or(clauses)
        };

        let docs = self
            .collection
            .find(&filter, &FindOptions::default())
            .await
            .map_err(|e| self.fail(Operation::Find, e))?;

        // Duplicate rows at the same (id, revision) collapse to the last one.
        let mut seen = HashSet::new();
        let mut snapshots = Vec::with_capacity(docs.len());
        for doc in docs.into_iter().rev() {
            let snap = SnapshotRecord::from_document(doc)?;
            if seen.insert(snap.id.clone()) {
                snapshots.push(snap);
            }
        }
        snapshots.reverse();
        debug!(
            collection = self.collection.name(),
            ids = ids.len(),
            found = snapshots.len(),
            "fetched latest snapshots"
        );
        Ok(snapshots)
    }

    /// Snapshot one entity if the cadence calls for it. Skipping is not an
    /// error.
    pub async fn commit<E: Entity>(&self, entity: &mut E, force: bool) -> Result<()> {
        self.commit_many(std::slice::from_mut(entity), force).await
    }

    /// Snapshot every entity the cadence selects, in a single batch write.
    /// Written entities have their watermark advanced to their revision.
    pub async fn commit_many<E: Entity>(&self, entities: &mut [E], force: bool) -> Result<()> {
        let mut due = Vec::new();
        let mut docs = Vec::new();
        for (idx, entity) in entities.iter().enumerate() {
            if self.cadence.is_due(entity.revision(), entity.version(), force) {
                docs.push(entity.snap()?.to_document()?);
                due.push(idx);
            }
        }

        if docs.is_empty() {
            return Ok(());
        }

        let count = docs.len();
        self.collection
            .insert(docs)
            .await
            .map_err(|e| self.fail(Operation::Insert, e))?;
        debug!(collection = self.collection.name(), count, force, "wrote snapshots");

        for idx in due {
            let entity = &mut entities[idx];
            let revision = entity.revision();
            entity.core_mut().set_version(revision);
            if let Some(id) = entity.id() {
                self.notifier.broadcast_snapshot(&self.entity, id, revision);
            }
        }
        Ok(())
    }

    fn fail(&self, operation: Operation, error: CollectionError) -> CollectionError {
        if operation.is_setup() {
            self.notifier
                .report_error(operation, self.collection.name(), &error);
        } else {
            warn!(?operation, collection = self.collection.name(), error = %error, "storage operation failed");
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::MemoryCollection;
    use crate::entity::EntityCore;
    use crate::notifications::{NotificationConfig, NotificationFilter, StoreNotification};
    use crate::types::EventRecord;
    use serde_json::json;

    #[derive(Default)]
    struct Gauge {
        core: EntityCore,
        level: i64,
    }

    impl Entity for Gauge {
        fn core(&self) -> &EntityCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut EntityCore {
            &mut self.core
        }
        fn state(&self) -> Result<Value> {
            Ok(json!({ "level": self.level }))
        }
        fn restore_state(&mut self, state: &Value) -> Result<()> {
            self.level = state["level"].as_i64().unwrap_or_default();
            Ok(())
        }
        fn apply(&mut self, event: &EventRecord) -> Result<()> {
            self.level = event.payload.as_i64().unwrap_or_default();
            Ok(())
        }
    }

    fn gauge(id: &str, steps: i64) -> Gauge {
        let mut g = Gauge {
            core: EntityCore::with_id(id),
            level: 0,
        };
        for n in 1..=steps {
            g.record("set", json!(n)).unwrap();
        }
        g
    }

    fn store(rounds: u64) -> (SnapshotStore, Arc<MemoryCollection>) {
        let coll = Arc::new(MemoryCollection::new("gauge.snapshots"));
        let store = SnapshotStore::new(
            coll.clone(),
            Arc::new(Notifier::new()),
            Cadence::new(rounds),
            "gauge",
        );
        (store, coll)
    }

    #[tokio::test]
    async fn test_init_indexes() {
        let (store, coll) = store(10);
        store.init().await.unwrap();

        let names: Vec<String> = coll.indexes().iter().map(IndexSpec::name).collect();
        assert_eq!(names, vec!["id_1_revision_1".to_string(), "version_1".to_string()]);
    }

    #[tokio::test]
    async fn test_read_failure_is_not_broadcast() {
        let coll = Arc::new(MemoryCollection::new("gauge.snapshots"));
        let notifier = Arc::new(Notifier::new());
        let handle = notifier.subscribe(NotificationConfig {
            filter: NotificationFilter::errors(),
            ..Default::default()
        });
        let store = SnapshotStore::new(coll.clone(), notifier, Cadence::default(), "gauge");
        coll.set_fail_on(Operation::Find, true);
        coll.set_fail_on(Operation::EnsureIndex, true);

        assert!(store.latest(&"g1".into()).await.is_err());
        assert!(handle.try_recv().is_err());

        assert!(store.init().await.is_err());
        assert!(matches!(
            handle.try_recv(),
            Ok(StoreNotification::Error { operation: Operation::EnsureIndex, .. })
        ));
    }

    #[test]
    fn test_cadence_boundary() {
        let cadence = Cadence::default();
        assert!(!cadence.is_due(Revision(9), Revision(0), false));
        assert!(cadence.is_due(Revision(10), Revision(0), false));
        assert!(!cadence.is_due(Revision(19), Revision(10), false));
        assert!(cadence.is_due(Revision(25), Revision(10), false));
        assert!(cadence.is_due(Revision(1), Revision(0), true));
    }

    #[tokio::test]
    async fn test_commit_below_cadence_writes_nothing() {
        let (store, coll) = store(10);
        let mut g = gauge("g1", 9);

        store.commit(&mut g, false).await.unwrap();

        assert_eq!(coll.insert_calls(), 0);
        assert_eq!(g.version(), Revision(0));
    }

    #[tokio::test]
    async fn test_commit_at_cadence_advances_watermark() {
        let (store, coll) = store(10);
        let mut g = gauge("g1", 10);

        store.commit(&mut g, false).await.unwrap();

        assert_eq!(coll.len(), 1);
        assert_eq!(g.version(), Revision(10));

        // No further snapshot until ten more revisions accumulate.
        g.record("set", json!(11)).unwrap();
        store.commit(&mut g, false).await.unwrap();
        assert_eq!(coll.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_watermark() {
        let (store, coll) = store(10);
        coll.set_fail_on(Operation::Insert, true);
        let mut g = gauge("g1", 3);

        assert!(store.commit(&mut g, true).await.is_err());
        assert_eq!(g.version(), Revision(0));
    }

    #[tokio::test]
    async fn test_commit_many_writes_only_due_subset() {
        let (store, coll) = store(5);
        let mut entities = vec![gauge("a", 2), gauge("b", 6), gauge("c", 5)];

        store.commit_many(&mut entities, false).await.unwrap();

        assert_eq!(coll.insert_calls(), 1);
        let ids: Vec<_> = coll.documents().iter().map(|d| d["id"].clone()).collect();
        assert_eq!(ids, vec![json!("b"), json!("c")]);
        assert_eq!(entities[0].version(), Revision(0));
        assert_eq!(entities[1].version(), Revision(6));
    }

    #[tokio::test]
    async fn test_latest_picks_highest_revision() {
        let (store, _) = store(1);
        let mut g = gauge("g1", 2);
        store.commit(&mut g, false).await.unwrap();
        g.record("set", json!(7)).unwrap();
        store.commit(&mut g, false).await.unwrap();

        let snap = store.latest(&"g1".into()).await.unwrap().unwrap();
        assert_eq!(snap.revision, Revision(3));
        assert_eq!(snap.state, json!({ "level": 7 }));
        assert!(store.latest(&"missing".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_many() {
        let (store, coll) = store(1);
        let mut entities = vec![gauge("a", 1), gauge("b", 2)];
        store.commit_many(&mut entities, false).await.unwrap();
        entities[0].record("set", json!(40)).unwrap();
        store.commit_many(&mut entities, false).await.unwrap();
        assert_eq!(coll.len(), 3);

        let snaps = store
            .latest_many(&["a".into(), "b".into(), "z".into()])
            .await
            .unwrap();
        let mut found: Vec<_> = snaps.iter().map(|s| (s.id.to_string(), s.revision.0)).collect();
        found.sort();
        assert_eq!(found, vec![("a".to_string(), 2), ("b".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_latest_many_without_snapshots_skips_second_query() {
        let (store, coll) = store(10);
        coll.set_fail_on(Operation::Find, true);

        let snaps = store.latest_many(&["a".into()]).await.unwrap();
        assert!(snaps.is_empty());
    }
}
