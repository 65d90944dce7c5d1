//! Completion notifications with durable pending-publish tracking.
//!
//! A [`PendingPublish`] record is journaled under `{root}/.pending` before the
//! first delivery attempt and removed only after the sink acknowledges it. A
//! record that survives a crash is redelivered verbatim on the next start.

use crate::sink::{EventSink, OutgoingMessage, SinkError};
use crate::store::{read_optional, write_atomic, StoreError};
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub const PENDING_DIR: &str = ".pending";
pub const STUDY_COMPLETED: &str = "study_completed";

/// Errors that keep a notification from being handed to the sink at all.
///
/// Sink failures are retried and never surface here; exhausting the retry
/// budget is reported as `delivered: false`.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to journal pending publish: {0}")]
    Journal(#[from] StoreError),

    #[error("Failed to serialize study summary: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Notification payload describing a complete study
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudySummary {
    pub study_uid: String,
    pub patient_id: String,
    pub modality: String,
    pub slice_count: usize,
    pub storage_path: String,
}

/// Durable record of a notification not yet acknowledged by the sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPublish {
    pub study_id: String,
    pub destination: String,
    /// Exact JSON body to deliver
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishResult {
    pub delivered: bool,
    pub attempts: u32,
}

/// Exponential backoff settings for delivery retries
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before giving up; 0 retries forever
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub(crate) fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            multiplier: self.multiplier,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }
}

/// On-disk set of pending publishes, one file per study
pub struct PendingPublishJournal {
    dir: PathBuf,
    staging_dir: PathBuf,
}

impl PendingPublishJournal {
    pub async fn open(root: &Path, staging_dir: &Path) -> Result<Self, StoreError> {
        let dir = root.join(PENDING_DIR);
        fs::create_dir_all(&dir).await.map_err(StoreError::io(&dir))?;
        Ok(Self {
            dir,
            staging_dir: staging_dir.to_path_buf(),
        })
    }

    fn path(&self, study_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", study_id))
    }

    pub async fn record(&self, pending: &PendingPublish) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(pending)?;
        write_atomic(&self.staging_dir, &self.path(&pending.study_id), &bytes).await
    }

    pub async fn clear(&self, study_id: &str) -> Result<(), StoreError> {
        let path = self.path(study_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io { path, source: e }),
        }
    }

    pub async fn get(&self, study_id: &str) -> Result<Option<PendingPublish>, StoreError> {
        let path = self.path(study_id);
        match read_optional(&path).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Corrupt { path, source }),
            None => Ok(None),
        }
    }

    /// All journaled records, oldest first
    pub async fn list(&self) -> Result<Vec<PendingPublish>, StoreError> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(StoreError::io(&self.dir))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(StoreError::io(&self.dir))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(bytes) = read_optional(&path).await? else {
                continue;
            };
            match serde_json::from_slice::<PendingPublish>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable pending publish"),
            }
        }

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}

/// Removes a study from the in-flight set when the delivery ends
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    study_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.study_id);
    }
}

/// Delivers study summaries to the sink
pub struct EventPublisher {
    sink: Arc<dyn EventSink>,
    journal: PendingPublishJournal,
    destination: String,
    retry: RetryPolicy,
    in_flight: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
}

impl EventPublisher {
    pub fn new(
        sink: Arc<dyn EventSink>,
        journal: PendingPublishJournal,
        destination: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            sink,
            journal,
            destination: destination.into(),
            retry,
            in_flight: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop retrying once `shutdown` is cancelled.
    ///
    /// An abandoned delivery reports `delivered: false` and keeps its journal
    /// record.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn journal(&self) -> &PendingPublishJournal {
        &self.journal
    }

    fn begin(&self, study_id: &str) -> Option<InFlight<'_>> {
        if !self.in_flight.lock().insert(study_id.to_string()) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            study_id: study_id.to_string(),
        })
    }

    /// Journal the summary, then deliver it with retries.
    #[instrument(skip(self, summary), fields(study_id = %summary.study_uid))]
    pub async fn publish(&self, summary: &StudySummary) -> Result<PublishResult, PublishError> {
        // Claim the study before the record becomes visible to redelivery sweeps.
        let Some(_flight) = self.begin(&summary.study_uid) else {
            debug!("Delivery already in flight");
            return Ok(PublishResult {
                delivered: false,
                attempts: 0,
            });
        };

        let pending = PendingPublish {
            study_id: summary.study_uid.clone(),
            destination: self.destination.clone(),
            payload: serde_json::to_string(summary)?,
            created_at: Utc::now(),
        };
        self.journal.record(&pending).await?;

        Ok(self.deliver(&pending).await)
    }

    /// Redeliver every journaled record not currently in flight.
    ///
    /// Returns the studies whose records were acknowledged.
    pub async fn redeliver_pending(&self) -> Result<Vec<String>, PublishError> {
        let mut delivered = Vec::new();

        for pending in self.journal.list().await? {
            let Some(_flight) = self.begin(&pending.study_id) else {
                continue;
            };
            info!(study_id = %pending.study_id, since = %pending.created_at, "Redelivering pending publish");
            if self.deliver(&pending).await.delivered {
                delivered.push(pending.study_id.clone());
            }
        }

        Ok(delivered)
    }

    async fn deliver(&self, pending: &PendingPublish) -> PublishResult {
        let message = OutgoingMessage::new(
            pending.destination.clone(),
            pending.study_id.clone(),
            pending.payload.clone().into_bytes(),
        )
        .with_message_type(STUDY_COMPLETED);

        let mut backoff = self.retry.backoff();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            metrics::counter!("gateway.publish.attempts").increment(1);

            let error: SinkError = match self.sink.send(&message).await {
                Ok(()) => {
                    if let Err(e) = self.journal.clear(&pending.study_id).await {
                        // The record will be redelivered later; consumers must tolerate it.
                        warn!(study_id = %pending.study_id, error = %e, "Failed to clear pending publish");
                    }
                    info!(
                        study_id = %pending.study_id,
                        destination = %pending.destination,
                        attempts,
                        "Study summary delivered"
                    );
                    return PublishResult {
                        delivered: true,
                        attempts,
                    };
                }
                Err(e) => e,
            };

            if self.retry.max_attempts > 0 && attempts >= self.retry.max_attempts {
                metrics::counter!("gateway.publish.failures").increment(1);
                error!(
                    study_id = %pending.study_id,
                    attempts,
                    error = %error,
                    "Delivery attempts exhausted, notification left pending"
                );
                return PublishResult {
                    delivered: false,
                    attempts,
                };
            }

            if self.shutdown.is_cancelled() {
                info!(study_id = %pending.study_id, attempts, "Shutting down, notification left pending");
                return PublishResult {
                    delivered: false,
                    attempts,
                };
            }

            let delay = backoff.next_backoff().unwrap_or(self.retry.max_interval);
            warn!(
                study_id = %pending.study_id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Delivery failed, retrying"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
