//! File-backed checkpoint store.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::checkpoint::FlowCheckpoint;
use crate::error::StoreError;
use crate::identity::{FlowIdentity, PartyId};
use crate::store::{CheckpointStore, check_version};

/// On-disk directory layout for checkpoints.
///
/// The layout follows this structure:
/// ```text
/// <base_dir>/
///     checkpoints/
///         <party>/               -- party id, percent-encoded
///             <flow_id>.json     -- latest checkpoint of one flow
///             <flow_id>.tombstone -- last version of a deleted checkpoint
/// ```
///
/// `CheckpointLayout` is cheap to clone (it wraps a single `PathBuf`).
#[derive(Debug, Clone)]
pub struct CheckpointLayout {
    base_dir: PathBuf,
}

impl CheckpointLayout {
    /// Create a layout rooted at `base_dir`.
    ///
    /// # Arguments
    ///
    /// * `base_dir` - Root directory for all checkpoint data. It does not
    ///   need to exist yet; directories are created on the first save.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this layout.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the directory holding one party's checkpoints.
    ///
    /// # Returns
    ///
    /// `<base_dir>/checkpoints/<encoded party>`
    pub fn party_dir(&self, party: &PartyId) -> PathBuf {
        self.base_dir
            .join("checkpoints")
            .join(encode_component(party.as_str()))
    }

    /// Returns the path of one flow's checkpoint file.
    ///
    /// # Returns
    ///
    /// `<base_dir>/checkpoints/<encoded party>/<flow_id>.json`
    pub fn checkpoint_path(&self, identity: &FlowIdentity) -> PathBuf {
        self.party_dir(&identity.party)
            .join(format!("{}.json", identity.flow_id))
    }

    /// Returns the path of one flow's tombstone file.
    ///
    /// # Returns
    ///
    /// `<base_dir>/checkpoints/<encoded party>/<flow_id>.tombstone`
    pub fn tombstone_path(&self, identity: &FlowIdentity) -> PathBuf {
        self.party_dir(&identity.party)
            .join(format!("{}.tombstone", identity.flow_id))
    }
}

/// Percent-encode everything outside `[A-Za-z0-9._-]` so a party id is
/// always a single, portable path component.
fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_') || (byte == b'.' && raw != "." && raw != "..") {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    if out.is_empty() {
        out.push_str("%00");
    }
    out
}

/// Checkpoint store that keeps one JSON file per flow.
///
/// Writes are atomic via a temp-rename pattern, so readers never see a
/// partially written checkpoint. The version check and the write happen
/// under one lock, which makes optimistic versioning hold for every handle
/// cloned from the same store.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    layout: CheckpointLayout,
    write_lock: Arc<Mutex<()>>,
}

impl FileCheckpointStore {
    /// Open (or lazily create) a store under `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            layout: CheckpointLayout::new(base_dir),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// The directory layout in use.
    pub fn layout(&self) -> &CheckpointLayout {
        &self.layout
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(CheckpointLayout, Arc<Mutex<()>>) -> Result<T, StoreError> + Send + 'static,
    {
        let layout = self.layout.clone();
        let lock = Arc::clone(&self.write_lock);
        tokio::task::spawn_blocking(move || op(layout, lock))
            .await
            .map_err(|e| StoreError::Unavailable(format!("checkpoint I/O task failed: {e}")))?
    }
}

/// The version field alone. Tombstone files hold exactly this; checkpoint
/// files carry it among their other fields.
#[derive(Debug, Serialize, Deserialize)]
struct VersionStamp {
    version: u64,
}

/// Read a file.
///
/// # Returns
///
/// `Ok(None)` if the file does not exist.
fn read_bytes(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Version recorded in checkpoint or tombstone bytes, 0 if unreadable.
fn version_of(bytes: &[u8]) -> u64 {
    serde_json::from_slice::<VersionStamp>(bytes)
        .map(|stamp| stamp.version)
        .unwrap_or(0)
}

/// Write `bytes` to `path` through a temp file and a rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");
    fs::write(&tmp_path, bytes)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Checkpoint files directly inside `dir`, skipping temp files.
fn checkpoint_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    Ok(files)
}

#[async_trait::async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &FlowCheckpoint) -> Result<(), StoreError> {
        let bytes = checkpoint.to_bytes()?;
        let identity = checkpoint.identity.clone();
        let version = checkpoint.version;
        self.blocking(move |layout, lock| {
            let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());
            let path = layout.checkpoint_path(&identity);
            let tombstone_path = layout.tombstone_path(&identity);
            let stored = match read_bytes(&path)? {
                Some(current) => Some(version_of(&current)),
                None => read_bytes(&tombstone_path)?.map(|stamp| version_of(&stamp)),
            };
            check_version(&identity, stored, version)?;

            fs::create_dir_all(layout.party_dir(&identity.party))?;
            write_atomic(&path, &bytes)?;
            remove_if_present(&tombstone_path)?;
            debug!(flow = %identity, version, path = %path.display(), "checkpoint written");
            Ok(())
        })
        .await
    }

    async fn load(&self, identity: &FlowIdentity) -> Result<Option<FlowCheckpoint>, StoreError> {
        let identity = identity.clone();
        self.blocking(move |layout, _| match read_bytes(&layout.checkpoint_path(&identity))? {
            Some(bytes) => FlowCheckpoint::from_bytes(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    identity: identity.clone(),
                    version: version_of(&bytes),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        })
        .await
    }

    async fn delete(&self, identity: &FlowIdentity) -> Result<(), StoreError> {
        let identity = identity.clone();
        self.blocking(move |layout, lock| {
            let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());
            let path = layout.checkpoint_path(&identity);
            let Some(bytes) = read_bytes(&path)? else {
                return Ok(());
            };
            let stamp = serde_json::to_vec(&VersionStamp {
                version: version_of(&bytes),
            })?;
            write_atomic(&layout.tombstone_path(&identity), &stamp)?;
            remove_if_present(&path)
        })
        .await
    }

    async fn tombstone(&self, identity: &FlowIdentity) -> Result<Option<u64>, StoreError> {
        let identity = identity.clone();
        self.blocking(move |layout, _| {
            if layout.checkpoint_path(&identity).exists() {
                return Ok(None);
            }
            Ok(read_bytes(&layout.tombstone_path(&identity))?.map(|stamp| version_of(&stamp)))
        })
        .await
    }

    async fn list(&self, party: Option<&PartyId>) -> Result<Vec<FlowCheckpoint>, StoreError> {
        let party = party.cloned();
        self.blocking(move |layout, _| {
            let dirs = match &party {
                Some(party) => vec![layout.party_dir(party)],
                None => match fs::read_dir(layout.base_dir().join("checkpoints")) {
                    Ok(entries) => entries
                        .filter_map(Result::ok)
                        .map(|entry| entry.path())
                        .filter(|path| path.is_dir())
                        .collect(),
                    Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
                    Err(e) => return Err(e.into()),
                },
            };
            let mut checkpoints = Vec::new();
            for dir in dirs {
                for file in checkpoint_files(&dir)? {
                    // Deleted between listing and reading.
                    let Some(bytes) = read_bytes(&file)? else {
                        continue;
                    };
                    match FlowCheckpoint::from_bytes(&bytes) {
                        Ok(checkpoint) => checkpoints.push(checkpoint),
                        Err(err) => warn!(path = %file.display(), error = %err, "unreadable checkpoint skipped"),
                    }
                }
            }
            checkpoints.sort_by(|a, b| a.identity.cmp(&b.identity));
            Ok(checkpoints)
        })
        .await
    }
}
