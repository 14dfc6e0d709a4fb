//! Persistence backends for the mutation queue.

use crate::error::{QueueError, Result};
use pantry_core::QueuedMutation;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Version written into every persisted queue document.
pub const QUEUE_FORMAT_VERSION: u32 = 1;

/// Storage for the ordered list of queued mutations.
///
/// `save` replaces the whole list. It must only return `Ok` once the data
/// would survive a process kill.
pub trait QueueBackend: Send + Sync {
    /// Load the persisted entries, oldest first.
    fn load(&self) -> Result<Vec<QueuedMutation>>;

    /// Persist `entries` as the complete queue.
    fn save(&self, entries: &[QueuedMutation]) -> Result<()>;
}

#[derive(Serialize)]
struct QueueDocumentRef<'a> {
    version: u32,
    entries: &'a [QueuedMutation],
}

#[derive(Deserialize)]
struct QueueDocument {
    version: u32,
    entries: Vec<QueuedMutation>,
}

fn encode(entries: &[QueuedMutation]) -> Result<String> {
    serde_json::to_string_pretty(&QueueDocumentRef {
        version: QUEUE_FORMAT_VERSION,
        entries,
    })
    .map_err(|e| QueueError::Persistence(e.to_string()))
}

fn decode(raw: &str) -> Result<Vec<QueuedMutation>> {
    let doc: QueueDocument = serde_json::from_str(raw)?;
    if doc.version != QUEUE_FORMAT_VERSION {
        return Err(QueueError::UnsupportedVersion(doc.version));
    }
    Ok(doc.entries)
}

/// In-memory backend.
///
/// Clones share the same storage, so dropping a queue and reopening it on a
/// clone of the backend behaves like a process restart. Entries still go
/// through serialization so restored data is exactly what a real store
/// would return.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    document: Arc<Mutex<Option<String>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the storage becoming unavailable (or available again).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Raw persisted document, if anything was saved.
    pub fn raw(&self) -> Option<String> {
        self.document.lock().clone()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(QueueError::Persistence("storage unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

impl QueueBackend for MemoryBackend {
    fn load(&self) -> Result<Vec<QueuedMutation>> {
        self.check_available()?;
        match self.document.lock().as_deref() {
            Some(raw) => decode(raw),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, entries: &[QueuedMutation]) -> Result<()> {
        self.check_available()?;
        let raw = encode(entries)?;
        *self.document.lock() = Some(raw);
        Ok(())
    }
}

/// JSON file backend.
///
/// Writes go to a sibling temporary file which is synced and then renamed
/// over the target, so a crash mid-write leaves the previous queue intact.
#[derive(Clone, Debug)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "queue".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl QueueBackend for FileBackend {
    fn load(&self) -> Result<Vec<QueuedMutation>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => decode(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, entries: &[QueuedMutation]) -> Result<()> {
        let raw = encode(entries)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.temp_path();
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(raw.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
