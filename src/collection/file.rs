//! Durable collection backend: one append-only document log per collection.
//!
//! Frame layout (little endian):
//!
//! ```text
//! magic "DOC\0" | version u8 | len u32 | MessagePack(document) | crc32(payload)
//! ```
//!
//! The full document set is loaded into memory on open; queries are served
//! from memory and only inserts touch the disk.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{
    parse_storage_id, reject_empty_batch, Collection, Database, DocumentSet, IdGenerator,
};
use crate::error::{CollectionError, CollectionResult};
use crate::query::{Document, Filter, FindOptions, IndexSpec, Pipeline};

/// Magic bytes for a document frame.
const FRAME_MAGIC: &[u8; 4] = b"DOC\0";

/// Current frame format version.
const FRAME_VERSION: u8 = 1;

/// magic + version + payload length
const FRAME_HEADER_SIZE: u64 = 4 + 1 + 4;

const CHECKSUM_SIZE: u64 = 4;

const LOCK_FILE: &str = "LOCK";

/// Database rooted at a directory, holding the directory lock.
pub struct FileDatabase {
    dir: PathBuf,
    _lock_file: File,
    collections: RwLock<HashMap<String, Arc<FileCollection>>>,
}

impl FileDatabase {
    /// Open or create a database directory.
    pub fn open(dir: impl AsRef<Path>) -> CollectionResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| CollectionError::Locked)?;

        info!(path = %dir.display(), "opened file database");

        Ok(Self {
            dir,
            _lock_file: lock_file,
            collections: RwLock::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Typed handle to a collection (opened on first use).
    pub fn file_collection(&self, name: &str) -> CollectionResult<Arc<FileCollection>> {
        if let Some(existing) = self.collections.read().get(name) {
            return Ok(Arc::clone(existing));
        }
        let mut collections = self.collections.write();
        if let Some(existing) = collections.get(name) {
            return Ok(Arc::clone(existing));
        }
        let path = self.dir.join(format!("{}.log", name));
        let collection = Arc::new(FileCollection::open(name, path)?);
        collections.insert(name.to_string(), Arc::clone(&collection));
        Ok(collection)
    }
}

impl Database for FileDatabase {
    fn collection(&self, name: &str) -> CollectionResult<Arc<dyn Collection>> {
        let collection: Arc<dyn Collection> = self.file_collection(name)?;
        Ok(collection)
    }
}

/// Collection persisted as an append-only frame log.
pub struct FileCollection {
    name: String,
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    file: Mutex<File>,
    set: RwLock<DocumentSet>,
    ids: IdGenerator,
    poisoned: RwLock<Option<Poison>>,
}

/// A failed batch that could not be cut back off the log.
#[derive(Clone, Debug)]
struct Poison {
    offset: u64,
    reason: String,
}

impl FileCollection {
    /// Open or create the log at `path`, loading every stored document.
    ///
    /// An incomplete trailing frame (a torn write) is cut off. A complete
    /// frame with a bad checksum is reported as corruption.
    pub fn open(name: impl Into<String>, path: impl AsRef<Path>) -> CollectionResult<Self> {
        let name = name.into();
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let (docs, valid_len) = read_frames(&mut file)?;
        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            warn!(
                collection = %name,
                valid_len,
                file_len,
                "discarding torn tail of document log"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        let max_id = docs.iter().filter_map(parse_storage_id).max().unwrap_or(0);
        let mut set = DocumentSet::default();
        for doc in docs {
            set.push(doc);
        }
        debug!(collection = %name, documents = set.len(), "loaded document log");

        Ok(Self {
            name,
            inner: Arc::new(Inner {
                path,
                file: Mutex::new(file),
                set: RwLock::new(set),
                ids: IdGenerator::starting_at(max_id + 1),
                poisoned: RwLock::new(None),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn len(&self) -> usize {
        self.inner.set.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    /// Frame and write a whole batch, then sync. Documents become visible
    /// to readers only after the batch is on disk.
    ///
    /// A failed batch is truncated away. If the truncate fails too, the
    /// bytes on disk no longer match what readers see, so every later
    /// insert is refused until the collection is reopened.
    fn append(&self, docs: Vec<Document>) -> CollectionResult<()> {
        let mut file = self.file.lock();
        if let Some(poison) = self.poisoned.read().clone() {
            return Err(self.poisoned_error(poison));
        }

        let mut stamped = Vec::with_capacity(docs.len());
        let mut buf = Vec::new();
        for mut doc in docs {
            self.ids.assign(&mut doc);
            encode_frame(&mut buf, &doc)?;
            stamped.push(doc);
        }

        match append_batch(&mut *file, &buf) {
            Ok(()) => {}
            Err(BatchError::RolledBack(e)) => return Err(e.into()),
            Err(BatchError::Stranded {
                offset,
                write,
                truncate,
            }) => {
                warn!(
                    path = %self.path.display(),
                    offset,
                    error = %write,
                    truncate_error = %truncate,
                    "failed batch could not be rolled back, refusing further writes"
                );
                let poison = Poison {
                    offset,
                    reason: format!("{}; truncate failed: {}", write, truncate),
                };
                *self.poisoned.write() = Some(poison.clone());
                return Err(self.poisoned_error(poison));
            }
        }

        let mut set = self.set.write();
        for doc in stamped {
            set.push(doc);
        }
        Ok(())
    }

    fn poisoned_error(&self, poison: Poison) -> CollectionError {
        CollectionError::Poisoned {
            path: self.path.display().to_string(),
            offset: poison.offset,
            reason: poison.reason,
        }
    }
}

/// What the frame log needs from its backing file.
trait LogFile: Write + Seek {
    fn sync(&mut self) -> io::Result<()>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

enum BatchError {
    /// The write failed and the log is back at its previous length.
    RolledBack(io::Error),
    /// The write failed and so did the truncate; bytes from `offset` on
    /// may hold an unacknowledged batch.
    Stranded {
        offset: u64,
        write: io::Error,
        truncate: io::Error,
    },
}

/// Append `buf` at the end of `file` and sync it.
fn append_batch<F: LogFile>(file: &mut F, buf: &[u8]) -> Result<(), BatchError> {
    let end = file.seek(SeekFrom::End(0)).map_err(BatchError::RolledBack)?;
    if let Err(write) = file.write_all(buf).and_then(|_| file.sync()) {
        return match file.truncate(end) {
            Ok(()) => Err(BatchError::RolledBack(write)),
            Err(truncate) => Err(BatchError::Stranded {
                offset: end,
                write,
                truncate,
            }),
        };
    }
    Ok(())
}

fn encode_frame(buf: &mut Vec<u8>, doc: &Document) -> CollectionResult<()> {
    let payload = rmp_serde::to_vec_named(doc)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| CollectionError::Encode("document exceeds 4 GiB".into()))?;

    buf.extend_from_slice(FRAME_MAGIC);
    buf.push(FRAME_VERSION);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(())
}

/// Read all complete frames. Returns the documents and the byte length of
/// the valid prefix.
fn read_frames(file: &mut File) -> CollectionResult<(Vec<Document>, u64)> {
    let file_len = file.metadata()?.len();
    file.seek(SeekFrom::Start(0))?;

    let mut docs = Vec::new();
    let mut offset = 0u64;

    while offset + FRAME_HEADER_SIZE <= file_len {
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != FRAME_MAGIC {
            return Err(CollectionError::InvalidFormat(format!(
                "bad frame magic at offset {}",
                offset
            )));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != FRAME_VERSION {
            return Err(CollectionError::InvalidFormat(format!(
                "unsupported frame version {} at offset {}",
                version[0], offset
            )));
        }

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from(u32::from_le_bytes(len_bytes));

        let frame_end = offset + FRAME_HEADER_SIZE + len + CHECKSUM_SIZE;
        if frame_end > file_len {
            break;
        }

        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&payload);
        if expected != got {
            return Err(CollectionError::ChecksumMismatch {
                offset,
                expected,
                got,
            });
        }

        docs.push(rmp_serde::from_slice(&payload)?);
        offset = frame_end;
    }

    Ok((docs, offset))
}

#[async_trait]
impl Collection for FileCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find(&self, filter: &Filter, options: &FindOptions) -> CollectionResult<Vec<Document>> {
        Ok(self.inner.set.read().find(filter, options))
    }

    async fn insert(&self, docs: Vec<Document>) -> CollectionResult<()> {
        reject_empty_batch(&self.name, &docs)?;

        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.append(docs))
            .await
            .map_err(|e| CollectionError::Unavailable {
                collection: self.name.clone(),
                reason: e.to_string(),
            })?
    }

    async fn aggregate(&self, pipeline: &Pipeline) -> CollectionResult<Vec<Document>> {
        Ok(self.inner.set.read().aggregate(pipeline))
    }

    async fn distinct(&self, field: &str, filter: &Filter) -> CollectionResult<Vec<Value>> {
        Ok(self.inner.set.read().distinct(field, filter))
    }

    async fn ensure_index(&self, index: IndexSpec) -> CollectionResult<()> {
        let name = index.name();
        if self.inner.set.write().ensure_index(index) {
            debug!(collection = %self.name, index = %name, "index declared");
        }
        Ok(())
    }
}
