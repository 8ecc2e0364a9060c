//! Bucketed key/value database with atomic commits.
//!
//! State is held as a JSON document and committed with a
//! write-to-temp-then-rename strategy. A lock file guards the database
//! against concurrent processes; acquisition times out after one second.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::store::Persister;
use crate::error::{Error, Result};

const CURRENT_VERSION: u32 = 1;
const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Bucket prefix for general operator state
const OPERATORS_PREFIX: &str = "operators/";
/// Reserved bucket prefix for input operator offsets, kept separate so
/// administrative tooling can enumerate and delete them without knowing
/// operator internals
const OFFSETS_PREFIX: &str = "offsets/";

#[derive(Debug, Serialize, Deserialize)]
struct DatabaseDoc {
    version: u32,
    #[serde(default)]
    buckets: HashMap<String, HashMap<String, Vec<u8>>>,
}

impl Default for DatabaseDoc {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            buckets: HashMap::new(),
        }
    }
}

/// Exclusive lock file, removed when the database handle is dropped
#[derive(Debug)]
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(db_path: &Path) -> Result<Self> {
        let path = db_path.with_extension("lock");
        let deadline = Instant::now() + LOCK_ACQUIRE_TIMEOUT;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(Error::PersisterBusy(format!(
                            "could not acquire {} within {:?}",
                            path.display(),
                            LOCK_ACQUIRE_TIMEOUT
                        )));
                    }
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// A shared handle to the embedded database. Cloning is cheap; all clones
/// share the same in-memory state and lock.
#[derive(Clone, Debug)]
pub struct Database {
    path: PathBuf,
    state: Arc<RwLock<DatabaseDoc>>,
    _lock: Arc<Option<LockFile>>,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::Persistence(format!("failed to create database directory: {}", e))
                })?;
            }
        }

        let lock = LockFile::acquire(&path)?;

        let doc = if path.exists() {
            let file = File::open(&path)
                .map_err(|e| Error::Persistence(format!("failed to open database: {}", e)))?;
            serde_json::from_reader(BufReader::new(file))
                .map_err(|e| Error::Persistence(format!("failed to parse database: {}", e)))?
        } else {
            DatabaseDoc::default()
        };

        Ok(Self {
            path,
            state: Arc::new(RwLock::new(doc)),
            _lock: Arc::new(Some(lock)),
        })
    }

    /// Create an in-memory database with no durable backing.
    pub fn open_in_memory() -> Self {
        Self {
            path: PathBuf::new(),
            state: Arc::new(RwLock::new(DatabaseDoc::default())),
            _lock: Arc::new(None),
        }
    }

    fn scoped(&self, bucket: String) -> ScopedPersister {
        ScopedPersister {
            path: self.path.clone(),
            state: self.state.clone(),
            bucket,
            cache: HashMap::new(),
        }
    }

    /// Persister for general operator state, scoped to `operators/<id>`
    pub fn persister(&self, operator_id: &str) -> ScopedPersister {
        self.scoped(format!("{}{}", OPERATORS_PREFIX, operator_id))
    }

    /// Persister for input operator offsets, scoped to the reserved
    /// `offsets/<id>` bucket
    pub fn offsets_persister(&self, operator_id: &str) -> ScopedPersister {
        self.scoped(format!("{}{}", OFFSETS_PREFIX, operator_id))
    }

    /// Operator ids that have persisted offsets
    pub fn offset_operator_ids(&self) -> Result<Vec<String>> {
        let state = read_lock(&self.state)?;
        let mut ids: Vec<String> = state
            .buckets
            .keys()
            .filter_map(|b| b.strip_prefix(OFFSETS_PREFIX))
            .map(|s| s.to_string())
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Delete persisted offsets for the given operator ids
    pub fn clear_offsets<I, S>(&self, operator_ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        {
            let mut state = write_lock(&self.state)?;
            for id in operator_ids {
                state
                    .buckets
                    .remove(&format!("{}{}", OFFSETS_PREFIX, id.as_ref()));
            }
        }
        self.flush()
    }

    /// Delete all persisted offsets
    pub fn clear_all_offsets(&self) -> Result<()> {
        {
            let mut state = write_lock(&self.state)?;
            state.buckets.retain(|b, _| !b.starts_with(OFFSETS_PREFIX));
        }
        self.flush()
    }

    /// Commit the current state to disk
    pub fn flush(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let state = read_lock(&self.state)?;
        atomic_write(&self.path, &state)
    }
}

/// A persister backed by one named bucket of the database.
pub struct ScopedPersister {
    path: PathBuf,
    state: Arc<RwLock<DatabaseDoc>>,
    bucket: String,
    cache: HashMap<String, Vec<u8>>,
}

impl Persister for ScopedPersister {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.cache.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Vec<u8>) {
        self.cache.insert(key.to_string(), value);
    }

    fn delete(&mut self, key: &str) {
        self.cache.remove(key);
    }

    fn load(&mut self) -> Result<()> {
        let state = read_lock(&self.state)?;
        self.cache.clear();
        if let Some(bucket) = state.buckets.get(&self.bucket) {
            self.cache
                .extend(bucket.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        {
            let mut state = write_lock(&self.state)?;
            let bucket = state.buckets.entry(self.bucket.clone()).or_default();
            bucket.clear();
            bucket.extend(self.cache.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let state = read_lock(&self.state)?;
        atomic_write(&self.path, &state)
    }
}

fn read_lock(
    state: &Arc<RwLock<DatabaseDoc>>,
) -> Result<std::sync::RwLockReadGuard<'_, DatabaseDoc>> {
    state
        .read()
        .map_err(|e| Error::Persistence(format!("database lock poisoned: {}", e)))
}

fn write_lock(
    state: &Arc<RwLock<DatabaseDoc>>,
) -> Result<std::sync::RwLockWriteGuard<'_, DatabaseDoc>> {
    state
        .write()
        .map_err(|e| Error::Persistence(format!("database lock poisoned: {}", e)))
}

/// Write the document to a temp file, then rename over the target
fn atomic_write(path: &Path, doc: &DatabaseDoc) -> Result<()> {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let unique = COUNTER.fetch_add(1, Ordering::SeqCst);
    let temp_path = path.with_extension(format!("tmp.{}.{}", std::process::id(), unique));

    let file = File::create(&temp_path)
        .map_err(|e| Error::Persistence(format!("failed to create temp file: {}", e)))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, doc)
        .map_err(|e| Error::Persistence(format!("failed to write database: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Persistence(format!("failed to flush database: {}", e)))?;
    drop(writer);

    fs::rename(&temp_path, path)
        .map_err(|e| Error::Persistence(format!("failed to rename database file: {}", e)))
}
