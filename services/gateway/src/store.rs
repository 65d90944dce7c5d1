//! Hierarchical instance store.
//!
//! Instances live at `{root}/{study}/{series}/{instance}.dcm`; external tools
//! read this layout directly. Every file the engine writes goes through
//! [`write_atomic`]: bytes land in `{root}/.staging`, are fsynced, and are then
//! renamed into place, so a reader sees either the old slot or the complete new
//! one. Identity components never start with `.`, which keeps the engine's own
//! directories (`.staging`, `.meta`, `.state`, `.pending`) out of the hierarchy.

use crate::instance::{Instance, InstanceKey, SeriesInstance};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const INSTANCE_EXTENSION: &str = "dcm";
pub const STAGING_DIR: &str = ".staging";
pub const META_DIR: &str = ".meta";

/// Errors raised by durable writes and reads
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Outcome of a successful [`HierarchicalStore::put`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreResult {
    /// False when the identity was already present and the slot was overwritten
    pub is_new_instance: bool,
    /// Final location of the payload
    pub path: PathBuf,
}

/// Per-study attributes captured from the first instances of a study
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudyMeta {
    pub expected_instance_count: Option<u32>,
    pub patient_id: String,
    pub modality: String,
    pub first_received_at: Option<DateTime<Utc>>,
}

/// Consistent view of one study used by the completion detector
#[derive(Debug, Clone, Default)]
pub struct StudySnapshot {
    pub received_count: usize,
    pub expected_instance_count: Option<u32>,
    pub last_received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct StudyIndex {
    loaded: bool,
    instances: BTreeSet<SeriesInstance>,
    meta: StudyMeta,
    last_received_at: Option<DateTime<Utc>>,
}

type IndexSlot = Arc<tokio::sync::Mutex<StudyIndex>>;

/// Identity-addressed, crash-atomic instance store
pub struct HierarchicalStore {
    root: PathBuf,
    staging_dir: PathBuf,
    meta_dir: PathBuf,
    studies: Mutex<HashMap<String, IndexSlot>>,
}

impl HierarchicalStore {
    /// Open (creating if needed) the store under `root`.
    ///
    /// Failure here means the storage root is unusable, which is fatal at startup.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let staging_dir = root.join(STAGING_DIR);
        let meta_dir = root.join(META_DIR);

        fs::create_dir_all(&root).await.map_err(StoreError::io(&root))?;
        fs::create_dir_all(&meta_dir)
            .await
            .map_err(StoreError::io(&meta_dir))?;

        // Staged files from a previous run were never promoted; drop them.
        if fs::try_exists(&staging_dir).await.unwrap_or(false) {
            fs::remove_dir_all(&staging_dir)
                .await
                .map_err(StoreError::io(&staging_dir))?;
        }
        fs::create_dir_all(&staging_dir)
            .await
            .map_err(StoreError::io(&staging_dir))?;

        info!(root = %root.display(), "Instance store opened");

        Ok(Self {
            root,
            staging_dir,
            meta_dir,
            studies: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn study_path(&self, study_id: &str) -> PathBuf {
        self.root.join(study_id)
    }

    pub fn instance_path(&self, key: &InstanceKey) -> PathBuf {
        self.root
            .join(&key.study_id)
            .join(&key.series_id)
            .join(format!("{}.{}", key.instance_id, INSTANCE_EXTENSION))
    }

    fn meta_path(&self, study_id: &str) -> PathBuf {
        self.meta_dir.join(format!("{}.json", study_id))
    }

    fn slot(&self, study_id: &str) -> IndexSlot {
        self.studies
            .lock()
            .entry(study_id.to_string())
            .or_default()
            .clone()
    }

    /// Durably store an instance.
    ///
    /// Re-delivery of an identity overwrites the slot and reports
    /// `is_new_instance = false`. The membership check and the promotion happen
    /// under the study's lock, so concurrent puts of one identity report "new"
    /// exactly once.
    #[instrument(skip(self, instance), fields(instance = %instance.key))]
    pub async fn put(&self, instance: &Instance) -> Result<StoreResult, StoreError> {
        let started = Instant::now();
        let staged = self.stage(&instance.payload).await?;

        let result = self.promote(instance, &staged).await;
        if result.is_err() {
            if let Err(e) = fs::remove_file(&staged).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %staged.display(), error = %e, "Failed to remove staged payload");
                }
            }
        }

        metrics::histogram!("gateway.store.write_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    async fn promote(&self, instance: &Instance, staged: &Path) -> Result<StoreResult, StoreError> {
        let key = &instance.key;
        let slot = self.slot(&key.study_id);
        let mut index = slot.lock().await;
        self.ensure_loaded(&key.study_id, &mut index).await?;

        // Study attributes are persisted before the payload becomes visible.
        let mut meta = index.meta.clone();
        if meta.first_received_at.is_none() {
            meta.patient_id = instance.patient_id.clone();
            meta.modality = instance.modality.clone();
            meta.first_received_at = Some(instance.received_at);
        }
        if meta.expected_instance_count.is_none() {
            meta.expected_instance_count = instance.expected_instance_count;
        } else if instance.expected_instance_count.is_some()
            && instance.expected_instance_count != meta.expected_instance_count
        {
            debug!(
                declared = ?meta.expected_instance_count,
                ignored = ?instance.expected_instance_count,
                "Ignoring conflicting expected instance count"
            );
        }
        if meta != index.meta {
            let bytes = serde_json::to_vec_pretty(&meta)?;
            write_atomic(&self.staging_dir, &self.meta_path(&key.study_id), &bytes).await?;
            index.meta = meta;
        }

        let path = self.instance_path(key);
        let study_dir = self.study_path(&key.study_id);
        let series_dir = study_dir.join(&key.series_id);
        let new_series = !fs::try_exists(&series_dir).await.unwrap_or(false);
        fs::create_dir_all(&series_dir)
            .await
            .map_err(StoreError::io(&series_dir))?;
        fs::rename(staged, &path).await.map_err(StoreError::io(&path))?;

        // The rename is only durable once the directory entries are.
        sync_dir(&series_dir).await?;
        if new_series {
            sync_dir(&study_dir).await?;
            sync_dir(&self.root).await?;
        }

        let is_new_instance = index.instances.insert(SeriesInstance {
            series_id: key.series_id.clone(),
            instance_id: key.instance_id.clone(),
        });
        if is_new_instance {
            index.last_received_at = Some(instance.received_at);
        }

        debug!(
            path = %path.display(),
            is_new_instance,
            received = index.instances.len(),
            "Instance promoted"
        );

        Ok(StoreResult {
            is_new_instance,
            path,
        })
    }

    async fn stage(&self, payload: &[u8]) -> Result<PathBuf, StoreError> {
        let path = self.staging_dir.join(format!("{}.part", Uuid::new_v4()));
        write_synced(&path, payload).await?;
        Ok(path)
    }

    /// Rebuild a study's index from disk the first time it is touched.
    async fn ensure_loaded(&self, study_id: &str, index: &mut StudyIndex) -> Result<(), StoreError> {
        if index.loaded {
            return Ok(());
        }

        let meta_path = self.meta_path(study_id);
        if let Some(bytes) = read_optional(&meta_path).await? {
            index.meta = serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: meta_path.clone(),
                source,
            })?;
        }

        let study_dir = self.study_path(study_id);
        for series_dir in list_dirs(&study_dir).await? {
            let Some(series_id) = file_name(&series_dir) else {
                continue;
            };
            let mut entries = fs::read_dir(&series_dir)
                .await
                .map_err(StoreError::io(&series_dir))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(StoreError::io(&series_dir))?
            {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(INSTANCE_EXTENSION) {
                    continue;
                }
                let Some(instance_id) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                index.instances.insert(SeriesInstance {
                    series_id: series_id.clone(),
                    instance_id: instance_id.to_string(),
                });
                if let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) {
                    let modified = DateTime::<Utc>::from(modified);
                    if index.last_received_at.map_or(true, |t| modified > t) {
                        index.last_received_at = Some(modified);
                    }
                }
            }
        }

        if !index.instances.is_empty() {
            debug!(study_id, received = index.instances.len(), "Study index rebuilt from disk");
        }
        index.loaded = true;
        Ok(())
    }

    async fn with_index<T>(
        &self,
        study_id: &str,
        read: impl FnOnce(&StudyIndex) -> T,
    ) -> Result<T, StoreError> {
        let slot = self.slot(study_id);
        let mut index = slot.lock().await;
        self.ensure_loaded(study_id, &mut index).await?;
        Ok(read(&index))
    }

    /// Every (series, instance) durably stored for a study
    pub async fn list_instances(&self, study_id: &str) -> Result<BTreeSet<SeriesInstance>, StoreError> {
        self.with_index(study_id, |index| index.instances.clone()).await
    }

    pub async fn declared_expected_count(&self, study_id: &str) -> Result<Option<u32>, StoreError> {
        self.with_index(study_id, |index| index.meta.expected_instance_count)
            .await
    }

    /// Time the most recent new instance of the study was received
    pub async fn last_received_at(&self, study_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.with_index(study_id, |index| index.last_received_at).await
    }

    pub async fn study_meta(&self, study_id: &str) -> Result<StudyMeta, StoreError> {
        self.with_index(study_id, |index| index.meta.clone()).await
    }

    pub async fn snapshot(&self, study_id: &str) -> Result<StudySnapshot, StoreError> {
        self.with_index(study_id, |index| StudySnapshot {
            received_count: index.instances.len(),
            expected_instance_count: index.meta.expected_instance_count,
            last_received_at: index.last_received_at,
        })
        .await
    }

    /// Drop the cached index of a study; the next access rebuilds it from disk.
    ///
    /// Skipped while another task holds the study's slot.
    pub fn release(&self, study_id: &str) -> bool {
        let mut studies = self.studies.lock();
        match studies.get(study_id) {
            Some(slot) if Arc::strong_count(slot) == 1 => {
                studies.remove(study_id);
                debug!(study_id, "Study index released");
                true
            }
            _ => false,
        }
    }

    /// Number of studies with a cached index
    pub fn cached_studies(&self) -> usize {
        self.studies.lock().len()
    }

    /// Study directories present under the root
    pub async fn list_studies(&self) -> Result<Vec<String>, StoreError> {
        let mut studies: Vec<String> = list_dirs(&self.root)
            .await?
            .iter()
            .filter_map(|p| file_name(p))
            .filter(|name| !name.starts_with('.'))
            .collect();
        studies.sort();
        Ok(studies)
    }
}

/// Write `bytes` to `target` through a staged, fsynced file and a rename.
pub(crate) async fn write_atomic(staging_dir: &Path, target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let staged = staging_dir.join(format!("{}.part", Uuid::new_v4()));
    write_synced(&staged, bytes).await?;
    if let Err(e) = fs::rename(&staged, target).await {
        let _ = fs::remove_file(&staged).await;
        return Err(StoreError::Io {
            path: target.to_path_buf(),
            source: e,
        });
    }
    match target.parent() {
        Some(dir) => sync_dir(dir).await,
        None => Ok(()),
    }
}

/// Flush a directory so entries renamed into it survive a crash.
#[cfg(unix)]
pub(crate) async fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    let handle = fs::File::open(dir).await.map_err(StoreError::io(dir))?;
    handle.sync_all().await.map_err(StoreError::io(dir))
}

#[cfg(not(unix))]
pub(crate) async fn sync_dir(_dir: &Path) -> Result<(), StoreError> {
    Ok(())
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = fs::File::create(path).await.map_err(StoreError::io(path))?;
    file.write_all(bytes).await.map_err(StoreError::io(path))?;
    file.sync_all().await.map_err(StoreError::io(path))?;
    Ok(())
}

/// Read a file, treating absence as `None`
pub(crate) async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

async fn list_dirs(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(StoreError::Io {
                path: dir.to_path_buf(),
                source: e,
            })
        }
    };

    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(StoreError::io(dir))? {
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).map(String::from)
}
