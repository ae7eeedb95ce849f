use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::capture::sanitize_game_name;
use crate::error::TableError;
use crate::title_ids::{metadata_path, read_metadata};

/// Capture ID (32 upper-case hex) -> folder-safe game name.
#[derive(Debug, Clone, Default)]
pub struct CaptureTable {
    names: HashMap<String, String>,
}

impl CaptureTable {
    /// Build a table from raw `{capture_id: name}` pairs.
    /// IDs are upper-cased, names sanitized, malformed IDs dropped.
    pub fn from_map(raw: HashMap<String, String>) -> Self {
        let mut names = HashMap::with_capacity(raw.len());
        for (id, name) in raw {
            if id.len() != 32 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
                debug!(id = %id, "skipping malformed capture ID");
                continue;
            }
            names.insert(id.to_ascii_uppercase(), sanitize_game_name(&name));
        }
        Self { names }
    }

    pub fn display_name(&self, capture_id: &str) -> Option<&str> {
        self.names.get(capture_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Where a capture table comes from.
pub trait TableSource: Send + Sync {
    fn fetch(&self) -> Result<CaptureTable, TableError>;
}

/// A `captureIds.json` file on disk.
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TableSource for JsonFileSource {
    fn fetch(&self) -> Result<CaptureTable, TableError> {
        let file = File::open(&self.path)
            .map_err(|e| TableError::Io(format!("{}: {}", self.path.display(), e)))?;
        let raw: HashMap<String, String> = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| TableError::Malformed(format!("{}: {}", self.path.display(), e)))?;
        let meta_path = metadata_path(&self.path);
        if meta_path.exists() {
            match read_metadata(&meta_path) {
                Ok(meta) => info!(
                    total = meta.total_count,
                    generated_at = %meta.generated_at,
                    sources = ?meta.sources.keys().collect::<Vec<_>>(),
                    "capture ID table metadata"
                ),
                Err(e) => debug!(error = %e, "unreadable capture ID table metadata"),
            }
        }
        Ok(CaptureTable::from_map(raw))
    }
}

/// An in-memory table, mostly for tests and embedding.
pub struct StaticSource(pub HashMap<String, String>);

impl TableSource for StaticSource {
    fn fetch(&self) -> Result<CaptureTable, TableError> {
        Ok(CaptureTable::from_map(self.0.clone()))
    }
}

enum Slot {
    Empty,
    Loading,
    Loaded(Arc<CaptureTable>),
    Failed(TableError),
}

/// Cached, single-flight table loader.
///
/// Callers arriving while a load is in flight wait for that load and get its
/// result. Success is cached for the loader's lifetime; failure is handed to
/// the waiters and then retried by the next fresh call.
pub struct CaptureTableLoader {
    source: Box<dyn TableSource>,
    slot: Mutex<Slot>,
    done: Condvar,
}

impl CaptureTableLoader {
    pub fn new(source: impl TableSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            slot: Mutex::new(Slot::Empty),
            done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The table if a load already finished successfully.
    pub fn cached(&self) -> Option<Arc<CaptureTable>> {
        match &*self.lock() {
            Slot::Loaded(table) => Some(Arc::clone(table)),
            _ => None,
        }
    }

    pub fn load(&self) -> Result<Arc<CaptureTable>, TableError> {
        let mut slot = self.lock();
        let mut waited = false;
        loop {
            match &*slot {
                Slot::Loaded(table) => return Ok(Arc::clone(table)),
                Slot::Failed(err) if waited => return Err(err.clone()),
                Slot::Empty | Slot::Failed(_) => break,
                Slot::Loading => {}
            }
            waited = true;
            slot = self.done.wait(slot).unwrap_or_else(|e| e.into_inner());
        }
        *slot = Slot::Loading;
        drop(slot);

        let result = self.source.fetch().map(Arc::new);

        let mut slot = self.lock();
        match &result {
            Ok(table) => {
                info!(entries = table.len(), "capture ID table loaded");
                *slot = Slot::Loaded(Arc::clone(table));
            }
            Err(err) => {
                warn!(error = %err, "capture ID table load failed");
                *slot = Slot::Failed(err.clone());
            }
        }
        drop(slot);
        self.done.notify_all();
        result
    }
}
