//! Entry Stores
//!
//! Key-value persistence behind the durable backend. A store maps absolute
//! paths to flat entries (mode, mtime and, for files, the bytes); the
//! reconcile pass in the durable backend decides what moves where.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;

/// Snapshot format version; mismatches refuse to load.
const STORE_VERSION: u32 = 21;

/// A stored filesystem entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEntry {
    pub timestamp_ms: i64,
    pub mode: u32,
    /// File bodies; directories carry none.
    pub contents: Option<Vec<u8>>,
}

#[async_trait]
pub trait EntryStore: Send {
    /// Every stored path with its modification time.
    async fn keys(&mut self) -> Result<Vec<(String, i64)>, StoreError>;

    async fn get(&mut self, path: &str) -> Result<Option<StoreEntry>, StoreError>;

    async fn put(&mut self, path: &str, entry: StoreEntry) -> Result<(), StoreError>;

    async fn delete(&mut self, path: &str) -> Result<(), StoreError>;

    /// Make prior writes durable.
    async fn flush(&mut self) -> Result<(), StoreError>;
}

// ============================================================================
// Gzipped JSON snapshot on the host filesystem
// ============================================================================

#[derive(Serialize, Deserialize)]
struct SnapshotEntry {
    timestamp_ms: i64,
    mode: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    contents: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: BTreeMap<String, SnapshotEntry>,
}

/// Store backed by one gzipped JSON snapshot file. The snapshot is read
/// lazily on first use and rewritten whole on flush.
pub struct JsonFileStore {
    path: PathBuf,
    entries: HashMap<String, StoreEntry>,
    loaded: bool,
    dirty: bool,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileStore {
            path: path.into(),
            entries: HashMap::new(),
            loaded: false,
            dirty: false,
        }
    }

    fn load(&mut self) -> Result<(), StoreError> {
        if self.loaded {
            return Ok(());
        }
        self.loaded = true;
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(StoreError::Io(err)),
        };
        let mut decoder = GzDecoder::new(raw.as_slice());
        let mut json = Vec::new();
        decoder.read_to_end(&mut json)?;
        let snapshot: Snapshot = serde_json::from_slice(&json)?;
        if snapshot.version != STORE_VERSION {
            log::warn!(
                "snapshot '{}' is version {}, this build reads {}",
                self.path.display(),
                snapshot.version,
                STORE_VERSION
            );
            return Err(StoreError::Version {
                found: snapshot.version,
                expected: STORE_VERSION,
            });
        }
        for (path, entry) in snapshot.entries {
            let contents = match entry.contents {
                Some(encoded) => Some(STANDARD.decode(encoded.as_bytes()).map_err(|err| {
                    StoreError::Entry(format!("{}: bad contents encoding: {}", path, err))
                })?),
                None => None,
            };
            self.entries.insert(
                path,
                StoreEntry {
                    timestamp_ms: entry.timestamp_ms,
                    mode: entry.mode,
                    contents,
                },
            );
        }
        Ok(())
    }

    fn persist(&mut self) -> Result<(), StoreError> {
        let mut entries = BTreeMap::new();
        for (path, entry) in &self.entries {
            entries.insert(
                path.clone(),
                SnapshotEntry {
                    timestamp_ms: entry.timestamp_ms,
                    mode: entry.mode,
                    contents: entry.contents.as_ref().map(|bytes| STANDARD.encode(bytes)),
                },
            );
        }
        let snapshot = Snapshot {
            version: STORE_VERSION,
            entries,
        };
        let json = serde_json::to_vec(&snapshot)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        let compressed = encoder.finish()?;
        std::fs::write(&self.path, compressed)?;
        self.dirty = false;
        Ok(())
    }
}

#[async_trait]
impl EntryStore for JsonFileStore {
    async fn keys(&mut self) -> Result<Vec<(String, i64)>, StoreError> {
        self.load()?;
        let mut keys: Vec<(String, i64)> = self
            .entries
            .iter()
            .map(|(path, entry)| (path.clone(), entry.timestamp_ms))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get(&mut self, path: &str) -> Result<Option<StoreEntry>, StoreError> {
        self.load()?;
        Ok(self.entries.get(path).cloned())
    }

    async fn put(&mut self, path: &str, entry: StoreEntry) -> Result<(), StoreError> {
        self.load()?;
        self.entries.insert(path.to_string(), entry);
        self.dirty = true;
        Ok(())
    }

    async fn delete(&mut self, path: &str) -> Result<(), StoreError> {
        self.load()?;
        self.entries.remove(path);
        self.dirty = true;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        self.load()?;
        if self.dirty {
            self.persist()?;
        }
        Ok(())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Volatile store, mostly for tests. Can be told to fail writes so error
/// paths in the reconcile pass are reachable.
#[derive(Default)]
pub struct MemoryStore {
    entries: HashMap<String, StoreEntry>,
    fail_writes: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn entry(&self, path: &str) -> Option<&StoreEntry> {
        self.entries.get(path)
    }

    pub fn insert(&mut self, path: &str, entry: StoreEntry) {
        self.entries.insert(path.to_string(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl EntryStore for MemoryStore {
    async fn keys(&mut self) -> Result<Vec<(String, i64)>, StoreError> {
        let mut keys: Vec<(String, i64)> = self
            .entries
            .iter()
            .map(|(path, entry)| (path.clone(), entry.timestamp_ms))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get(&mut self, path: &str) -> Result<Option<StoreEntry>, StoreError> {
        Ok(self.entries.get(path).cloned())
    }

    async fn put(&mut self, path: &str, entry: StoreEntry) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Entry(format!("{}: write rejected", path)));
        }
        self.entries.insert(path.to_string(), entry);
        Ok(())
    }

    async fn delete(&mut self, path: &str) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Entry(format!("{}: delete rejected", path)));
        }
        self.entries.remove(path);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}
