//! Document collection capability consumed by the event and snapshot logs.
//!
//! A [`Database`] hands out named [`Collection`]s. Two backends ship with the
//! crate:
//! - [`MemoryDatabase`]: process-local, used for tests and ephemeral stores
//! - [`FileDatabase`]: one durable append-only log file per collection
//!
//! Other document stores plug in by implementing the two traits.

mod file;
mod memory;

pub use file::{FileCollection, FileDatabase};
pub use memory::{MemoryCollection, MemoryDatabase};

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{CollectionError, CollectionResult, Result, StoreError};
use crate::query::{compare_values, Document, Filter, FindOptions, IndexSpec, Pipeline};
use crate::types::STORAGE_ID_FIELD;

/// Collection operations, for error reporting and failure injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Find,
    Insert,
    Aggregate,
    Distinct,
    EnsureIndex,
    Connection,
}

impl Operation {
    /// Setup operations, whose failures are broadcast to subscribers.
    /// Failures of every other operation reach only the caller.
    pub fn is_setup(self) -> bool {
        matches!(self, Operation::EnsureIndex | Operation::Connection)
    }
}

/// A named set of documents.
#[async_trait]
pub trait Collection: Send + Sync {
    /// Collection name, e.g. `task.events`.
    fn name(&self) -> &str;

    /// Documents matching `filter`, sorted and limited per `options`.
    async fn find(&self, filter: &Filter, options: &FindOptions) -> CollectionResult<Vec<Document>>;

    /// Insert a batch. Each stored document is assigned an `_id`.
    /// An empty batch is rejected.
    async fn insert(&self, docs: Vec<Document>) -> CollectionResult<()>;

    async fn aggregate(&self, pipeline: &Pipeline) -> CollectionResult<Vec<Document>>;

    /// Distinct values of `field` among documents matching `filter`.
    async fn distinct(&self, field: &str, filter: &Filter) -> CollectionResult<Vec<Value>>;

    /// Declare an index. Idempotent.
    async fn ensure_index(&self, index: IndexSpec) -> CollectionResult<()>;
}

/// Source of named collections.
pub trait Database: Send + Sync {
    fn collection(&self, name: &str) -> CollectionResult<Arc<dyn Collection>>;
}

/// Open a database from a connection string.
///
/// - `memory://` opens a fresh process-local database
/// - `file://<dir>` opens (or creates) a durable database rooted at `<dir>`
pub fn connect(uri: &str) -> Result<Arc<dyn Database>> {
    if let Some(rest) = uri.strip_prefix("memory://") {
        if !rest.is_empty() {
            return Err(StoreError::UnsupportedUri(uri.to_string()));
        }
        return Ok(Arc::new(MemoryDatabase::new()));
    }
    if let Some(path) = uri.strip_prefix("file://") {
        if path.is_empty() {
            return Err(StoreError::UnsupportedUri(uri.to_string()));
        }
        return Ok(Arc::new(FileDatabase::open(PathBuf::from(path))?));
    }
    Err(StoreError::UnsupportedUri(uri.to_string()))
}

/// In-memory document set shared by both backends.
///
/// Documents are kept in insertion order, which is what makes sorts on
/// equal keys fall back to insertion order.
#[derive(Default)]
pub(crate) struct DocumentSet {
    docs: Vec<Document>,
    indexes: Vec<IndexSpec>,
}

impl DocumentSet {
    pub(crate) fn len(&self) -> usize {
        self.docs.len()
    }

    pub(crate) fn push(&mut self, doc: Document) {
        self.docs.push(doc);
    }

    pub(crate) fn find(&self, filter: &Filter, options: &FindOptions) -> Vec<Document> {
        let mut found: Vec<Document> = self
            .docs
            .iter()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        options.apply(&mut found);
        found
    }

    pub(crate) fn aggregate(&self, pipeline: &Pipeline) -> Vec<Document> {
        pipeline.run(self.docs.clone())
    }

    pub(crate) fn distinct(&self, field: &str, filter: &Filter) -> Vec<Value> {
        let mut values: Vec<Value> = Vec::new();
        for doc in self.docs.iter().filter(|d| filter.matches(d)) {
            if let Some(v) = doc.get(field) {
                if !values
                    .iter()
                    .any(|seen| compare_values(seen, v) == std::cmp::Ordering::Equal)
                {
                    values.push(v.clone());
                }
            }
        }
        values
    }

    pub(crate) fn ensure_index(&mut self, index: IndexSpec) -> bool {
        if self.indexes.contains(&index) {
            return false;
        }
        self.indexes.push(index);
        true
    }

    pub(crate) fn indexes(&self) -> Vec<IndexSpec> {
        self.indexes.clone()
    }
}

/// Generates storage identifiers: 16 hex chars, unique per process.
pub(crate) struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub(crate) fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    pub(crate) fn assign(&self, doc: &mut Document) {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        doc.insert(
            STORAGE_ID_FIELD.to_string(),
            Value::from(hex::encode(n.to_be_bytes())),
        );
    }
}

/// Parse a storage identifier back to its counter value.
pub(crate) fn parse_storage_id(doc: &Document) -> Option<u64> {
    let raw = doc.get(STORAGE_ID_FIELD)?.as_str()?;
    let bytes: [u8; 8] = hex::decode(raw).ok()?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

pub(crate) fn reject_empty_batch(collection: &str, docs: &[Document]) -> CollectionResult<()> {
    if docs.is_empty() {
        return Err(CollectionError::InvalidQuery {
            collection: collection.to_string(),
            reason: "cannot insert an empty batch".into(),
        });
    }
    Ok(())
}
