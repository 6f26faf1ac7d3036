//! Minimal file-backed JSON document store.
//!
//! Documents live at `documents/<collection>/<id>.json`. Every mutation takes
//! an exclusive per-document lock file so read-modify-write sequences are
//! atomic across threads and processes.

use std::{
    fs, io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, SystemTime},
};

use serde_json::{to_writer_pretty, Map, Value};
use thiserror::Error;

/// A JSON object stored under a document id.
pub type Document = Map<String, Value>;

/// How long a writer waits for a document lock before giving up.
const LOCK_WAIT: Duration = Duration::from_secs(5);
/// Locks older than this are assumed to belong to a crashed writer.
const LOCK_STALE: Duration = Duration::from_secs(30);
const LOCK_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("document {collection}/{id} not found")]
    NotFound { collection: String, id: String },
    #[error("document {0} is not a JSON object")]
    NotAnObject(PathBuf),
    #[error("field `{0}` is not an array")]
    NotAnArray(String),
    #[error("invalid document id `{0}`")]
    InvalidId(String),
    #[error("timed out waiting for lock {0}")]
    LockTimeout(PathBuf),
}

/// What [`Store::transact`] does with the document once the closure returns.
#[derive(Debug)]
pub enum Change {
    Keep,
    Write(Document),
    Delete,
}

/// Persistent document store rooted at `root`.
#[derive(Clone, Debug)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Create a new store rooted at `root`.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Ensure the on-disk directory structure exists.
    pub fn init(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.root.join("documents"))?;
        Ok(())
    }

    /// Fetch a document, or `None` when it does not exist.
    pub fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let path = self.document_path(collection, id)?;
        read_document(&path)
    }

    /// Write `fields` to a document. With `merge` the fields are folded into
    /// any existing document; without it the document is replaced.
    pub fn set(
        &self,
        collection: &str,
        id: &str,
        fields: Document,
        merge: bool,
    ) -> Result<(), StoreError> {
        let path = self.document_path(collection, id)?;
        let _lock = DocLock::acquire(&path)?;
        let doc = if merge {
            let mut doc = read_document(&path)?.unwrap_or_default();
            doc.extend(fields);
            doc
        } else {
            fields
        };
        write_document(&path, &doc)
    }

    /// Merge `fields` into an existing document; fails when it is absent.
    pub fn update(&self, collection: &str, id: &str, fields: Document) -> Result<(), StoreError> {
        let path = self.document_path(collection, id)?;
        let _lock = DocLock::acquire(&path)?;
        let mut doc = read_document(&path)?.ok_or_else(|| not_found(collection, id))?;
        doc.extend(fields);
        write_document(&path, &doc)
    }

    /// Atomically append `value` to the array `field` unless it is already
    /// present. Returns `true` when the value was appended.
    ///
    /// A missing field is treated as an empty array. The document itself must
    /// exist.
    pub fn array_union(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        value: Value,
    ) -> Result<bool, StoreError> {
        let path = self.document_path(collection, id)?;
        let _lock = DocLock::acquire(&path)?;
        let mut doc = read_document(&path)?.ok_or_else(|| not_found(collection, id))?;
        let entry = doc
            .entry(field.to_string())
            .or_insert_with(|| Value::Array(vec![]));
        let arr = entry
            .as_array_mut()
            .ok_or_else(|| StoreError::NotAnArray(field.to_string()))?;
        if arr.contains(&value) {
            return Ok(false);
        }
        arr.push(value);
        write_document(&path, &doc)?;
        Ok(true)
    }

    /// Run `f` on the current document while holding its lock, then apply
    /// the returned [`Change`]. `f` sees `None` when the document is absent.
    pub fn transact<T>(
        &self,
        collection: &str,
        id: &str,
        f: impl FnOnce(Option<Document>) -> (Change, T),
    ) -> Result<T, StoreError> {
        let path = self.document_path(collection, id)?;
        let _lock = DocLock::acquire(&path)?;
        let (change, out) = f(read_document(&path)?);
        match change {
            Change::Keep => {}
            Change::Write(doc) => write_document(&path, &doc)?,
            Change::Delete => match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        Ok(out)
    }

    /// List every document id in `collection`.
    pub fn list(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.collection_dir(collection)?;
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut ids = vec![];
        for entry in walkdir::WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| {
                StoreError::Io(e.into_io_error().unwrap_or_else(|| io::Error::other("walk")))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn collection_dir(&self, collection: &str) -> Result<PathBuf, StoreError> {
        validate_id(collection)?;
        Ok(self.root.join("documents").join(collection))
    }

    /// Compute the canonical path for a document.
    fn document_path(&self, collection: &str, id: &str) -> Result<PathBuf, StoreError> {
        validate_id(id)?;
        Ok(self.collection_dir(collection)?.join(format!("{id}.json")))
    }
}

/// Ids become file names, so only a conservative character set is allowed.
pub fn validate_id(id: &str) -> Result<(), StoreError> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}

fn not_found(collection: &str, id: &str) -> StoreError {
    StoreError::NotFound {
        collection: collection.to_string(),
        id: id.to_string(),
    }
}

fn read_document(path: &Path) -> Result<Option<Document>, StoreError> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_str::<Value>(&data)? {
        Value::Object(map) => Ok(Some(map)),
        _ => Err(StoreError::NotAnObject(path.to_path_buf())),
    }
}

/// Write the document atomically to its canonical path.
fn write_document(path: &Path, doc: &Document) -> Result<(), StoreError> {
    let parent_dir = path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent_dir)?;
    let tmp = tempfile::NamedTempFile::new_in(&parent_dir)?;
    to_writer_pretty(&tmp, doc)?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

/// Exclusive lock on a single document, released on drop.
struct DocLock {
    path: PathBuf,
}

impl DocLock {
    fn acquire(doc_path: &Path) -> Result<Self, StoreError> {
        let path = doc_path.with_extension("lock");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let deadline = SystemTime::now() + LOCK_WAIT;
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) && break_stale(&path)? {
                        continue;
                    }
                    if SystemTime::now() >= deadline {
                        return Err(StoreError::LockTimeout(path));
                    }
                    thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for DocLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Move a stale lock aside before deleting it. The rename is atomic, so only
/// one waiter breaks a given lock. Returns `false` when the file moved turned
/// out to be a live lock, which is then put back.
fn break_stale(path: &Path) -> Result<bool, StoreError> {
    let aside = path.with_extension(format!("stale-{:016x}", rand::random::<u64>()));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    }
    if !lock_is_stale(&aside) {
        match fs::hard_link(&aside, path) {
            Ok(()) => {
                let _ = fs::remove_file(&aside);
                return Ok(false);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                tracing::warn!(lock = %path.display(), "live lock replaced while restoring");
            }
            Err(e) => return Err(e.into()),
        }
    } else {
        tracing::warn!(lock = %path.display(), "broke stale document lock");
    }
    let _ = fs::remove_file(&aside);
    Ok(true)
}

fn lock_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map_or(false, |age| age > LOCK_STALE)
}
