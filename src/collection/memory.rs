//! Process-local collection backend.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::{reject_empty_batch, Collection, Database, DocumentSet, IdGenerator, Operation};
use crate::error::{CollectionError, CollectionResult};
use crate::query::{Document, Filter, FindOptions, IndexSpec, Pipeline};

/// Database whose collections live in memory.
///
/// Collections are created on first use and shared by name, so a test can
/// reach the same collection the repository writes to.
#[derive(Default)]
pub struct MemoryDatabase {
    collections: RwLock<HashMap<String, Arc<MemoryCollection>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Typed handle to a collection (created if missing).
    pub fn memory_collection(&self, name: &str) -> Arc<MemoryCollection> {
        if let Some(existing) = self.collections.read().get(name) {
            return Arc::clone(existing);
        }
        let mut collections = self.collections.write();
        Arc::clone(
            collections
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(MemoryCollection::new(name))),
        )
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Database for MemoryDatabase {
    fn collection(&self, name: &str) -> CollectionResult<Arc<dyn Collection>> {
        Ok(self.memory_collection(name))
    }
}

/// In-memory collection.
///
/// Failures can be injected per operation to exercise error paths.
pub struct MemoryCollection {
    name: String,
    set: RwLock<DocumentSet>,
    ids: IdGenerator,
    failing: RwLock<HashSet<Operation>>,
    insert_calls: AtomicUsize,
}

impl MemoryCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            set: RwLock::new(DocumentSet::default()),
            ids: IdGenerator::starting_at(1),
            failing: RwLock::new(HashSet::new()),
            insert_calls: AtomicUsize::new(0),
        }
    }

    /// Make every subsequent `op` fail (or succeed again).
    pub fn set_fail_on(&self, op: Operation, fail: bool) {
        let mut failing = self.failing.write();
        if fail {
            failing.insert(op);
        } else {
            failing.remove(&op);
        }
    }

    /// Number of successful insert batches.
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.set.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn indexes(&self) -> Vec<IndexSpec> {
        self.set.read().indexes()
    }

    /// Every stored document, in insertion order.
    pub fn documents(&self) -> Vec<Document> {
        self.set.read().find(&Filter::All, &FindOptions::default())
    }

    fn check(&self, op: Operation) -> CollectionResult<()> {
        if self.failing.read().contains(&op) {
            return Err(CollectionError::Unavailable {
                collection: self.name.clone(),
                reason: format!("injected {:?} failure", op),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find(&self, filter: &Filter, options: &FindOptions) -> CollectionResult<Vec<Document>> {
        self.check(Operation::Find)?;
        Ok(self.set.read().find(filter, options))
    }

    async fn insert(&self, docs: Vec<Document>) -> CollectionResult<()> {
        self.check(Operation::Insert)?;
        reject_empty_batch(&self.name, &docs)?;

        let mut set = self.set.write();
        for mut doc in docs {
            self.ids.assign(&mut doc);
            set.push(doc);
        }
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn aggregate(&self, pipeline: &Pipeline) -> CollectionResult<Vec<Document>> {
        self.check(Operation::Aggregate)?;
        Ok(self.set.read().aggregate(pipeline))
    }

    async fn distinct(&self, field: &str, filter: &Filter) -> CollectionResult<Vec<Value>> {
        self.check(Operation::Distinct)?;
        Ok(self.set.read().distinct(field, filter))
    }

    async fn ensure_index(&self, index: IndexSpec) -> CollectionResult<()> {
        self.check(Operation::EnsureIndex)?;
        self.set.write().ensure_index(index);
        Ok(())
    }
}
