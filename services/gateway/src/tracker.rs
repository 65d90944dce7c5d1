//! Per-study state machine: PENDING -> COMPLETE -> PUBLISHED.
//!
//! Transitions are compare-and-swap operations on a per-study lock, so among
//! any number of concurrent callers exactly one observes `JustCompleted` (and
//! later `JustPublished`). Records that left PENDING are persisted under
//! `{root}/.state` so the forward-only rule holds across restarts.

use crate::completion::Completeness;
use crate::store::{read_optional, write_atomic, StoreError};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

pub const STATE_DIR: &str = ".state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StudyState {
    Pending,
    Complete,
    Published,
}

/// Outcome of [`StudyStateTracker::try_mark_complete`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Another caller already moved the study past PENDING
    AlreadyComplete,
    /// This caller performed the PENDING -> COMPLETE transition
    JustCompleted,
    StillPending,
}

/// Outcome of [`StudyStateTracker::try_mark_published`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    AlreadyPublished,
    JustPublished,
    /// The study never reached COMPLETE; nothing changed
    NotComplete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyRecord {
    pub study_id: String,
    pub state: StudyState,
    pub completed_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
}

impl StudyRecord {
    fn pending(study_id: &str) -> Self {
        Self {
            study_id: study_id.to_string(),
            state: StudyState::Pending,
            completed_at: None,
            published_at: None,
        }
    }
}

struct StudyEntry {
    record: Mutex<StudyRecord>,
    // Orders writes of this study's record so a later state is never
    // overwritten by an earlier snapshot.
    persist: tokio::sync::Mutex<()>,
}

impl StudyEntry {
    fn new(record: StudyRecord) -> Arc<Self> {
        Arc::new(Self {
            record: Mutex::new(record),
            persist: tokio::sync::Mutex::new(()),
        })
    }
}

/// Sole owner of study state
pub struct StudyStateTracker {
    dir: PathBuf,
    staging_dir: PathBuf,
    studies: RwLock<HashMap<String, Arc<StudyEntry>>>,
}

impl StudyStateTracker {
    /// Open the tracker, loading persisted records from `{root}/.state`.
    pub async fn open(root: &Path, staging_dir: &Path) -> Result<Self, StoreError> {
        let dir = root.join(STATE_DIR);
        fs::create_dir_all(&dir).await.map_err(StoreError::io(&dir))?;

        let mut studies = HashMap::new();
        let mut entries = fs::read_dir(&dir).await.map_err(StoreError::io(&dir))?;
        while let Some(entry) = entries.next_entry().await.map_err(StoreError::io(&dir))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(bytes) = read_optional(&path).await? else {
                continue;
            };
            match serde_json::from_slice::<StudyRecord>(&bytes) {
                Ok(record) => {
                    studies.insert(record.study_id.clone(), StudyEntry::new(record));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable study record");
                }
            }
        }

        info!(studies = studies.len(), "Study state tracker loaded");

        Ok(Self {
            dir,
            staging_dir: staging_dir.to_path_buf(),
            studies: RwLock::new(studies),
        })
    }

    fn entry(&self, study_id: &str) -> Arc<StudyEntry> {
        if let Some(entry) = self.studies.read().get(study_id) {
            return entry.clone();
        }
        self.studies
            .write()
            .entry(study_id.to_string())
            .or_insert_with(|| StudyEntry::new(StudyRecord::pending(study_id)))
            .clone()
    }

    /// Make a study known to the tracker (PENDING unless already further along).
    pub fn register(&self, study_id: &str) -> StudyState {
        self.entry(study_id).record.lock().state
    }

    pub fn state(&self, study_id: &str) -> Option<StudyState> {
        self.studies
            .read()
            .get(study_id)
            .map(|entry| entry.record.lock().state)
    }

    pub fn record(&self, study_id: &str) -> Option<StudyRecord> {
        self.studies
            .read()
            .get(study_id)
            .map(|entry| entry.record.lock().clone())
    }

    /// Studies currently in `state`, sorted by id
    pub fn studies_in(&self, state: StudyState) -> Vec<String> {
        let mut ids: Vec<String> = self
            .studies
            .read()
            .iter()
            .filter(|(_, entry)| entry.record.lock().state == state)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// PENDING -> COMPLETE if `completeness` says so.
    pub async fn try_mark_complete(&self, study_id: &str, completeness: &Completeness) -> CompletionOutcome {
        let entry = self.entry(study_id);

        let outcome = {
            let mut record = entry.record.lock();
            match record.state {
                StudyState::Pending if completeness.complete => {
                    record.state = StudyState::Complete;
                    record.completed_at = Some(Utc::now());
                    CompletionOutcome::JustCompleted
                }
                StudyState::Pending => CompletionOutcome::StillPending,
                StudyState::Complete | StudyState::Published => CompletionOutcome::AlreadyComplete,
            }
        };

        if outcome == CompletionOutcome::JustCompleted {
            info!(
                study_id,
                received = completeness.received_count,
                expected = ?completeness.expected_count,
                "Study complete"
            );
            metrics::counter!("gateway.studies.completed").increment(1);
            self.persist(&entry).await;
        }

        outcome
    }

    /// COMPLETE -> PUBLISHED
    pub async fn try_mark_published(&self, study_id: &str) -> PublishOutcome {
        let entry = self.entry(study_id);

        let outcome = {
            let mut record = entry.record.lock();
            match record.state {
                StudyState::Complete => {
                    record.state = StudyState::Published;
                    record.published_at = Some(Utc::now());
                    PublishOutcome::JustPublished
                }
                StudyState::Published => PublishOutcome::AlreadyPublished,
                StudyState::Pending => PublishOutcome::NotComplete,
            }
        };

        match outcome {
            PublishOutcome::JustPublished => {
                debug!(study_id, "Study published");
                metrics::counter!("gateway.studies.published").increment(1);
                self.persist(&entry).await;
            }
            PublishOutcome::NotComplete => {
                warn!(study_id, "Publish acknowledged for a study that never completed");
            }
            PublishOutcome::AlreadyPublished => {}
        }

        outcome
    }

    /// Write the current record. In-memory state stays authoritative if this fails.
    async fn persist(&self, entry: &StudyEntry) {
        let _ordered = entry.persist.lock().await;
        let record = entry.record.lock().clone();
        let path = self.dir.join(format!("{}.json", record.study_id));

        let result = match serde_json::to_vec_pretty(&record) {
            Ok(bytes) => write_atomic(&self.staging_dir, &path, &bytes).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(study_id = %record.study_id, error = %e, "Failed to persist study state");
        }
    }
}
