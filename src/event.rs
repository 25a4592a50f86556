//! Append-only event log.
//!
//! Events live in the `<entity>.events` collection, one document per event,
//! keyed by `(id, revision)`. Reads always come back in replay order:
//! revision-ascending for one identity, identity-major then revision-minor
//! for several.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::collection::{Collection, Operation};
use crate::entity::Entity;
use crate::error::{CollectionError, Result};
use crate::notifications::Notifier;
use crate::query::{Filter, FindOptions, IndexSpec, SortOrder};
use crate::types::{EventRecord, Identity, SnapshotRecord, ID_FIELD, REVISION_FIELD};

/// Event log over one collection.
pub struct EventLog {
    collection: Arc<dyn Collection>,
    notifier: Arc<Notifier>,
}

impl EventLog {
    pub fn new(collection: Arc<dyn Collection>, notifier: Arc<Notifier>) -> Self {
        Self {
            collection,
            notifier,
        }
    }

    /// Create the `{id, revision}` and `{revision}` indexes.
    pub async fn init(&self) -> Result<()> {
        for index in [
            IndexSpec::ascending(&[ID_FIELD, REVISION_FIELD]),
            IndexSpec::ascending(&[REVISION_FIELD]),
        ] {
            self.collection
                .ensure_index(index)
                .await
                .map_err(|e| self.fail(Operation::EnsureIndex, e))?;
        }
        Ok(())
    }

    pub fn collection_name(&self) -> &str {
        self.collection.name()
    }

    /// Events for one identity newer than `baseline`, or all of them when
    /// there is no baseline.
    pub async fn fetch(
        &self,
        id: &Identity,
        baseline: Option<&SnapshotRecord>,
    ) -> Result<Vec<EventRecord>> {
        let filter = match baseline {
            Some(snap) => Filter::and(vec![
                Filter::eq(ID_FIELD, id.to_value()),
                Filter::gt(REVISION_FIELD, snap.revision.0),
            ]),
            None => Filter::eq(ID_FIELD, id.to_value()),
        };
        let options = FindOptions::sorted(&[(REVISION_FIELD, SortOrder::Ascending)]);

        let docs = self
            .collection
            .find(&filter, &options)
            .await
            .map_err(|e| self.fail(Operation::Find, e))?;
        debug!(collection = self.collection.name(), %id, count = docs.len(), "fetched events");

        docs.into_iter().map(EventRecord::from_document).collect()
    }

    /// Events for several identities in one round trip. Each identity is
    /// filtered against its own baseline, found in `baselines` by id.
    pub async fn fetch_many(
        &self,
        ids: &[Identity],
        baselines: &[SnapshotRecord],
    ) -> Result<Vec<EventRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let clauses = ids
            .iter()
            .map(|id| match baselines.iter().find(|s| &s.id == id) {
                Some(snap) => Filter::and(vec![
                    Filter::eq(ID_FIELD, id.to_value()),
                    Filter::gt(REVISION_FIELD, snap.revision.0),
                ]),
                None => Filter::eq(ID_FIELD, id.to_value()),
            })
            .collect();
        let options = FindOptions::sorted(&[
            (ID_FIELD, SortOrder::Ascending),
            (REVISION_FIELD, SortOrder::Ascending),
        ]);

        let docs = self
            .collection
            .find(&Filter::or(clauses), &options)
            .await
            .map_err(|e| self.fail(Operation::Find, e))?;
        debug!(
            collection = self.collection.name(),
            ids = ids.len(),
            count = docs.len(),
            "fetched events for batch"
        );

        docs.into_iter().map(EventRecord::from_document).collect()
    }

    /// Every identity that has at least one event.
    pub async fn identities(&self) -> Result<Vec<Identity>> {
        let values = self
            .collection
            .distinct(ID_FIELD, &Filter::All)
            .await
            .map_err(|e| self.fail(Operation::Distinct, e))?;
        Ok(values.iter().filter_map(Identity::from_value).collect())
    }

    /// Append one entity's pending events.
    pub async fn append<E: Entity>(&self, entity: &mut E) -> Result<()> {
        self.append_many(std::slice::from_mut(entity)).await
    }

    /// Append the pending events of several entities as a single batch.
    ///
    /// Nothing is written when no entity has pending events. Pending
    /// buffers are cleared only once the write succeeds.
    pub async fn append_many<E: Entity>(&self, entities: &mut [E]) -> Result<()> {
        let docs = entities
            .iter()
            .flat_map(|e| e.core().events())
            .map(EventRecord::to_document)
            .collect::<Result<Vec<_>>>()?;

        if docs.is_empty() {
            return Ok(());
        }

        let count = docs.len();
        self.collection
            .insert(docs)
            .await
            .map_err(|e| self.fail(Operation::Insert, e))?;
        debug!(collection = self.collection.name(), count, "appended events");

        for entity in entities.iter_mut() {
            entity.core_mut().clear_events();
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
