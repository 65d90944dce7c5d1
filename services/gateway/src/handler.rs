//! Ingest entry point.
//!
//! [`IngestHandler::on_instance_received`] is called once per decoded instance,
//! from as many concurrent sources as the transport runs. It stores the
//! instance, re-evaluates the study when the instance is new, and hands a newly
//! completed study to the publisher on a tracked background task so a slow sink
//! never delays the acknowledgment.

use crate::completion::{Completeness, CompletionDetector};
use crate::config::Config;
use crate::instance::{AckCode, InstanceReceived};
use crate::publisher::{
    EventPublisher, PendingPublishJournal, PublishError, RetryPolicy, StudySummary,
};
use crate::sink::EventSink;
use crate::store::{HierarchicalStore, StoreError};
use crate::tracker::{CompletionOutcome, PublishOutcome, StudyState, StudyStateTracker};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Failures that prevent the handler from starting
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Storage root unavailable: {0}")]
    Storage(#[from] StoreError),

    #[error("Recovery failed: {0}")]
    Recovery(#[from] PublishError),
}

/// Settings the engine needs, independent of how they were loaded
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub root: PathBuf,
    pub quiescence_window: Duration,
    pub destination: String,
    pub retry: RetryPolicy,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            root: config.storage.root.clone(),
            quiescence_window: config.completion.quiescence_window(),
            destination: config.publisher.destination.clone(),
            retry: config.publisher.retry_policy(),
        }
    }
}

pub struct IngestHandler {
    store: Arc<HierarchicalStore>,
    detector: CompletionDetector,
    tracker: Arc<StudyStateTracker>,
    publisher: Arc<EventPublisher>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl IngestHandler {
    /// Open all durable state under the storage root and run recovery.
    ///
    /// The returned handler has already redelivered every pending publish left
    /// by a previous run.
    pub async fn open(settings: EngineSettings, sink: Arc<dyn EventSink>) -> Result<Self, StartupError> {
        let store = Arc::new(HierarchicalStore::open(&settings.root).await?);
        let tracker = Arc::new(StudyStateTracker::open(store.root(), store.staging_dir()).await?);
        let journal = PendingPublishJournal::open(store.root(), store.staging_dir()).await?;
        let shutdown = CancellationToken::new();
        let publisher = Arc::new(
            EventPublisher::new(sink, journal, settings.destination, settings.retry)
                .with_shutdown(shutdown.clone()),
        );

        let handler = Self {
            detector: CompletionDetector::new(store.clone(), settings.quiescence_window),
            store,
            tracker,
            publisher,
            tasks: TaskTracker::new(),
            shutdown,
        };

        handler.recover().await?;
        Ok(handler)
    }

    pub fn store(&self) -> &HierarchicalStore {
        &self.store
    }

    pub fn tracker(&self) -> &StudyStateTracker {
        &self.tracker
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    /// Token cancelled when the handler stops accepting instances
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn on_instance_received(&self, event: InstanceReceived) -> AckCode {
        if self.shutdown.is_cancelled() {
            return AckCode::Refused;
        }
        self.tasks.track_future(self.ingest(event)).await
    }

    #[instrument(
        skip(self, event),
        fields(study_id = %event.study_id, series_id = %event.series_id, instance_id = %event.instance_id)
    )]
    async fn ingest(&self, event: InstanceReceived) -> AckCode {
        let instance = match event.into_instance(Utc::now()) {
            Ok(instance) => instance,
            Err(e) => {
                warn!(error = %e, "Rejecting malformed instance");
                metrics::counter!("gateway.instances.rejected").increment(1);
                return AckCode::MalformedRequest;
            }
        };

        let stored = match self.store.put(&instance).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(error = %e, "Failed to store instance");
                metrics::counter!("gateway.instances.failed").increment(1);
                return AckCode::ProcessingFailure;
            }
        };

        let study_id = instance.study_id();
        self.tracker.register(study_id);

        if !stored.is_new_instance {
            debug!(path = %stored.path.display(), "Duplicate instance overwritten");
            metrics::counter!("gateway.instances.duplicate").increment(1);
            return AckCode::Success;
        }

        info!(path = %stored.path.display(), "Stored instance");
        metrics::counter!("gateway.instances.stored").increment(1);

        self.check_study(study_id).await;
        AckCode::Success
    }

    /// Evaluate a study and, if this caller completes it, start publishing.
    async fn check_study(&self, study_id: &str) -> Option<CompletionOutcome> {
        let completeness = match self.detector.evaluate(study_id).await {
            Ok(completeness) => completeness,
            Err(e) => {
                warn!(study_id, error = %e, "Completeness evaluation failed");
                return None;
            }
        };
        if !completeness.complete {
            return Some(CompletionOutcome::StillPending);
        }

        let outcome = self.tracker.try_mark_complete(study_id, &completeness).await;
        if outcome == CompletionOutcome::JustCompleted {
            match self.summarize(study_id, &completeness).await {
                Ok(summary) => self.spawn_publish(summary),
                Err(e) => {
                    // Recovery on the next start publishes studies left COMPLETE.
                    error!(study_id, error = %e, "Failed to build study summary");
                }
            }
        }
        Some(outcome)
    }

    async fn summarize(&self, study_id: &str, completeness: &Completeness) -> Result<StudySummary, StoreError> {
        let meta = self.store.study_meta(study_id).await?;
        Ok(StudySummary {
            study_uid: study_id.to_string(),
            patient_id: meta.patient_id,
            modality: meta.modality,
            slice_count: completeness.received_count,
            storage_path: self.store.study_path(study_id).display().to_string(),
        })
    }

    fn spawn_publish(&self, summary: StudySummary) {
        let store = self.store.clone();
        let tracker = self.tracker.clone();
        let publisher = self.publisher.clone();
        self.tasks.spawn(async move {
            publish_and_confirm(&store, &tracker, &publisher, &summary).await;
        });
    }

    /// Bring durable state back in line after a restart.
    ///
    /// Order matters: journaled notifications go out first, then studies that
    /// completed without reaching the journal, then pending studies on disk
    /// are re-evaluated.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<(), PublishError> {
        let redelivered = self.publisher.redeliver_pending().await?;
        for study_id in &redelivered {
            self.confirm_published(study_id).await;
        }

        let mut republished = 0;
        for study_id in self.tracker.studies_in(StudyState::Complete) {
            if self.republish_completed(&study_id).await {
                republished += 1;
            }
        }

        let studies = self.store.list_studies().await?;
        for study_id in &studies {
            if self.tracker.register(study_id) == StudyState::Pending {
                self.check_study(study_id).await;
            }
        }

        info!(
            redelivered = redelivered.len(),
            republished,
            studies = studies.len(),
            "Recovery finished"
        );
        Ok(())
    }

    /// Publish a COMPLETE study that has no deliverable journal record.
    ///
    /// Failures are confined to the study; recovery moves on to the next one.
    async fn republish_completed(&self, study_id: &str) -> bool {
        match self.publisher.journal().get(study_id).await {
            // Still undeliverable; the monitor keeps retrying it.
            Ok(Some(_)) => return false,
            Ok(None) => {}
            Err(StoreError::Corrupt { path, source }) => {
                warn!(
                    study_id,
                    path = %path.display(),
                    error = %source,
                    "Replacing unreadable pending publish"
                );
            }
            Err(e) => {
                warn!(study_id, error = %e, "Cannot read pending publish, skipping study");
                return false;
            }
        }

        let summary = match self.detector.evaluate(study_id).await {
            Ok(completeness) => self.summarize(study_id, &completeness).await,
            Err(e) => Err(e),
        };
        match summary {
            Ok(summary) => {
                publish_and_confirm(&self.store, &self.tracker, &self.publisher, &summary).await;
                true
            }
            Err(e) => {
                warn!(study_id, error = %e, "Cannot rebuild summary for completed study");
                false
            }
        }
    }

    /// One monitor pass: complete quiet studies and retry stuck notifications.
    pub async fn sweep(&self) {
        for study_id in self.tracker.studies_in(StudyState::Pending) {
            self.check_study(&study_id).await;
        }

        match self.publisher.redeliver_pending().await {
            Ok(delivered) => {
                for study_id in &delivered {
                    self.confirm_published(study_id).await;
                }
            }
            Err(e) => warn!(error = %e, "Pending publish sweep failed"),
        }
    }

    async fn confirm_published(&self, study_id: &str) {
        if self.tracker.try_mark_published(study_id).await != PublishOutcome::NotComplete {
            self.store.release(study_id);
            return;
        }
        // The state record was lost; the acknowledged notification proves completion.
        let received_count = self
            .store
            .snapshot(study_id)
            .await
            .map(|s| s.received_count)
            .unwrap_or_default();
        let completeness = Completeness {
            complete: true,
            received_count,
            expected_count: None,
        };
        self.tracker.try_mark_complete(study_id, &completeness).await;
        self.tracker.try_mark_published(study_id).await;
        self.store.release(study_id);
    }

    /// Refuse new instances and wait for in-flight ingests and publishes.
    ///
    /// Publishes still backing off are abandoned; their journal records are
    /// redelivered on the next start.
    pub async fn shutdown(&self) {
        info!("Ingest handler shutting down");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Ingest handler drained");
    }

    #[cfg(test)]
    async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

async fn publish_and_confirm(
    store: &HierarchicalStore,
    tracker: &StudyStateTracker,
    publisher: &EventPublisher,
    summary: &StudySummary,
) {
    match publisher.publish(summary).await {
        Ok(result) if result.delivered => {
            tracker.try_mark_published(&summary.study_uid).await;
            store.release(&summary.study_uid);
        }
        Ok(result) => {
            warn!(
                study_id = %summary.study_uid,
                attempts = result.attempts,
                "Study summary not delivered, left for retry"
            );
        }
        Err(e) => {
            error!(study_id = %summary.study_uid, error = %e, "Failed to publish study summary");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::PendingPublish;
    use crate::sink::{OutgoingMessage, SinkError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Records every message; fails the first `failures` sends.
    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<OutgoingMessage>>,
        failures: AtomicUsize,
    }

    impl RecordingSink {
        fn failing(failures: usize) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                failures: AtomicUsize::new(failures),
            }
        }

        fn summaries(&self) -> Vec<StudySummary> {
            self.sent
                .lock()
                .iter()
                .map(|m| serde_json::from_slice(&m.payload).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn send(&self, message: &OutgoingMessage) -> Result<(), SinkError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(SinkError::Connection("unreachable".to_string()));
            }
            self.sent.lock().push(message.clone());
            Ok(())
        }
    }

    fn settings(dir: &TempDir, quiescence_window: Duration, max_attempts: u32) -> EngineSettings {
        EngineSettings {
            root: dir.path().to_path_buf(),
            quiescence_window,
            destination: "new_study".to_string(),
            retry: RetryPolicy {
                max_attempts,
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(2),
                multiplier: 2.0,
            },
        }
    }

    fn event(study: &str, series: &str, instance: &str, expected: Option<u32>) -> InstanceReceived {
        InstanceReceived {
            study_id: study.to_string(),
            series_id: series.to_string(),
            instance_id: instance.to_string(),
            patient_id: "PAT-1".to_string(),
            modality: "CT".to_string(),
            expected_instance_count: expected,
            payload: format!("{}/{}", series, instance).into_bytes(),
        }
    }

    async fn open(dir: &TempDir, sink: Arc<RecordingSink>, window: Duration, attempts: u32) -> IngestHandler {
        IngestHandler::open(settings(dir, window, attempts), sink).await.unwrap()
    }

    #[tokio::test]
    async fn test_declared_study_publishes_once() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let handler = open(&dir, sink.clone(), Duration::from_secs(60), 3).await;

        for (series, instance) in [("seriesB", "i1"), ("seriesA", "i2"), ("seriesA", "i1")] {
            let ack = handler.on_instance_received(event("S1", series, instance, Some(3))).await;
            assert_eq!(ack, AckCode::Success);
        }
        handler.drain().await;

        let summaries = sink.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].study_uid, "S1");
        assert_eq!(summaries[0].slice_count, 3);
        assert_eq!(summaries[0].patient_id, "PAT-1");
        assert_eq!(summaries[0].storage_path, dir.path().join("S1").display().to_string());
        assert_eq!(handler.tracker().state("S1"), Some(StudyState::Published));

        // A late duplicate changes nothing
        let ack = handler.on_instance_received(event("S1", "seriesA", "i1", Some(3))).await;
        assert_eq!(ack, AckCode::Success);
        handler.drain().await;
        assert_eq!(sink.summaries().len(), 1);
        assert_eq!(handler.store().list_instances("S1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_partial_study_stays_pending() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let handler = open(&dir, sink.clone(), Duration::from_secs(60), 3).await;

        handler.on_instance_received(event("S1", "A", "i1", Some(3))).await;
        handler.on_instance_received(event("S1", "A", "i2", None)).await;
        handler.on_instance_received(event("S1", "A", "i2", None)).await;
        handler.drain().await;

        assert!(sink.summaries().is_empty());
        assert_eq!(handler.tracker().state("S1"), Some(StudyState::Pending));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_completion_initiates_one_publish() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let handler = Arc::new(open(&dir, sink.clone(), Duration::from_secs(60), 3).await);

        const N: u32 = 24;
        let handles: Vec<_> = (0..N)
            .map(|i| {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let series = if i % 2 == 0 { "A" } else { "B" };
                    handler
                        .on_instance_received(event("S1", series, &format!("i{}", i), Some(N)))
                        .await
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), AckCode::Success);
        }
        handler.drain().await;

        let summaries = sink.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].slice_count, N as usize);
    }

    #[tokio::test]
    async fn test_unrelated_studies_complete_independently() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let handler = open(&dir, sink.clone(), Duration::from_secs(60), 3).await;

        handler.on_instance_received(event("S1", "A", "i1", Some(2))).await;
        handler.on_instance_received(event("S2", "A", "i1", Some(1))).await;
        handler.drain().await;

        let summaries = sink.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].study_uid, "S2");
        assert_eq!(handler.tracker().state("S1"), Some(StudyState::Pending));
    }

    #[tokio::test]
    async fn test_malformed_instance_is_rejected_before_write() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let handler = open(&dir, sink.clone(), Duration::from_secs(60), 3).await;

        let ack = handler.on_instance_received(event("", "A", "i1", Some(1))).await;

        assert_eq!(ack, AckCode::MalformedRequest);
        assert!(handler.store().list_studies().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_does_not_advance_state() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let handler = open(&dir, sink.clone(), Duration::from_secs(60), 3).await;

        // A plain file where the study directory should be
        std::fs::write(dir.path().join("S1"), b"not a directory").unwrap();

        let ack = handler.on_instance_received(event("S1", "A", "i1", Some(1))).await;
        assert_eq!(ack, AckCode::ProcessingFailure);
        assert_eq!(handler.tracker().state("S1"), None);

        // Other studies are unaffected
        let ack = handler.on_instance_received(event("S2", "A", "i1", Some(1))).await;
        assert_eq!(ack, AckCode::Success);
        handler.drain().await;
        assert_eq!(sink.summaries().len(), 1);
    }

    #[tokio::test]
    async fn test_quiescence_completes_undeclared_study() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let handler = open(&dir, sink.clone(), Duration::from_millis(500), 3).await;

        handler.on_instance_received(event("S1", "A", "i1", None)).await;
        handler.on_instance_received(event("S1", "A", "i2", None)).await;
        handler.sweep().await;
        handler.drain().await;
        assert!(sink.summaries().is_empty());

        tokio::time::sleep(Duration::from_millis(800)).await;
        handler.sweep().await;
        handler.drain().await;
        handler.sweep().await;
        handler.drain().await;

        let summaries = sink.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].slice_count, 2);
    }

    #[tokio::test]
    async fn test_sweep_redelivers_after_exhausted_retries() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::failing(2));
        let handler = open(&dir, sink.clone(), Duration::from_secs(60), 2).await;

        handler.on_instance_received(event("S1", "A", "i1", Some(1))).await;
        handler.drain().await;

        assert!(sink.summaries().is_empty());
        assert_eq!(handler.tracker().state("S1"), Some(StudyState::Complete));
        assert!(handler.publisher().journal().get("S1").await.unwrap().is_some());

        handler.sweep().await;

        assert_eq!(sink.summaries().len(), 1);
        assert_eq!(handler.tracker().state("S1"), Some(StudyState::Published));
        assert!(handler.publisher().journal().get("S1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restart_redelivers_pending_before_new_traffic() {
        let dir = TempDir::new().unwrap();

        // First run: the sink never acknowledges, so the record stays journaled.
        {
            let sink = Arc::new(RecordingSink::failing(usize::MAX));
            let handler = open(&dir, sink, Duration::from_secs(60), 1).await;
            handler.on_instance_received(event("S1", "A", "i1", Some(1))).await;
            handler.shutdown().await;
        }
        let journaled: PendingPublish = serde_json::from_slice(
            &std::fs::read(dir.path().join(".pending").join("S1.json")).unwrap(),
        )
        .unwrap();

        let sink = Arc::new(RecordingSink::default());
        let handler = open(&dir, sink.clone(), Duration::from_secs(60), 1).await;

        // Delivered during open, before any new instance is accepted
        let sent = sink.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, journaled.payload.as_bytes());
        assert_eq!(handler.tracker().state("S1"), Some(StudyState::Published));

        handler.on_instance_received(event("S2", "A", "i1", Some(1))).await;
        handler.drain().await;
        let summaries = sink.summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[1].study_uid, "S2");
    }

    #[tokio::test]
    async fn test_recovery_publishes_completed_study_without_record() {
        let dir = TempDir::new().unwrap();
        {
            // Completed, but the process died before the journal write
            let store = HierarchicalStore::open(dir.path()).await.unwrap();
            let instance = event("S1", "A", "i1", Some(1)).into_instance(Utc::now()).unwrap();
            store.put(&instance).await.unwrap();
            let tracker = StudyStateTracker::open(dir.path(), store.staging_dir()).await.unwrap();
            let completeness = Completeness {
                complete: true,
                received_count: 1,
                expected_count: Some(1),
            };
            tracker.try_mark_complete("S1", &completeness).await;
        }

        let sink = Arc::new(RecordingSink::default());
        let handler = open(&dir, sink.clone(), Duration::from_secs(60), 3).await;

        assert_eq!(sink.summaries().len(), 1);
        assert_eq!(handler.tracker().state("S1"), Some(StudyState::Published));
    }

    #[tokio::test]
    async fn test_recovery_evaluates_studies_left_on_disk() {
        let dir = TempDir::new().unwrap();
        {
            // Last instance stored, but the process died before evaluation
            let store = HierarchicalStore::open(dir.path()).await.unwrap();
            for id in ["i1", "i2"] {
                let instance = event("S1", "A", id, Some(2)).into_instance(Utc::now()).unwrap();
                store.put(&instance).await.unwrap();
            }
        }

        let sink = Arc::new(RecordingSink::default());
        let handler = open(&dir, sink.clone(), Duration::from_secs(60), 3).await;
        handler.drain().await;

        let summaries = sink.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].slice_count, 2);
    }

    #[tokio::test]
    async fn test_unreadable_pending_record_does_not_block_startup() {
        let dir = TempDir::new().unwrap();
        {
            let sink = Arc::new(RecordingSink::failing(usize::MAX));
            let handler = open(&dir, sink, Duration::from_secs(60), 1).await;
            handler.on_instance_received(event("S1", "A", "i1", Some(1))).await;
            handler.on_instance_received(event("S2", "A", "i1", Some(2))).await;
            handler.shutdown().await;

            // Second S2 instance stored, but never evaluated before the crash
            let instance = event("S2", "A", "i2", Some(2)).into_instance(Utc::now()).unwrap();
            handler.store().put(&instance).await.unwrap();
        }
        std::fs::write(dir.path().join(".pending").join("S1.json"), b"{trunc").unwrap();

        let sink = Arc::new(RecordingSink::default());
        let handler = IngestHandler::open(settings(&dir, Duration::from_secs(60), 1), sink.clone())
            .await
            .expect("one unreadable record must not stop startup");
        handler.drain().await;

        let mut studies: Vec<String> = sink.summaries().into_iter().map(|s| s.study_uid).collect();
        studies.sort();
        assert_eq!(studies, vec!["S1".to_string(), "S2".to_string()]);
        assert_eq!(handler.tracker().state("S1"), Some(StudyState::Published));
        assert_eq!(handler.tracker().state("S2"), Some(StudyState::Published));
        assert!(handler.publisher().journal().get("S1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_abandons_endless_retries() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::failing(usize::MAX));
        let handler = open(&dir, sink, Duration::from_secs(60), 0).await;

        handler.on_instance_received(event("S1", "A", "i1", Some(1))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(3), handler.shutdown())
            .await
            .expect("shutdown must not wait on an unreachable sink");

        assert_eq!(handler.tracker().state("S1"), Some(StudyState::Complete));
        assert!(handler.publisher().journal().get("S1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_published_study_is_reread_from_disk() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let handler = open(&dir, sink.clone(), Duration::from_secs(60), 3).await;

        handler.on_instance_received(event("S1", "A", "i1", Some(2))).await;
        handler.on_instance_received(event("S1", "A", "i2", Some(2))).await;
        handler.drain().await;
        assert_eq!(handler.tracker().state("S1"), Some(StudyState::Published));

        // Retention removed a file after publication
        std::fs::remove_file(dir.path().join("S1").join("A").join("i1.dcm")).unwrap();
        assert_eq!(handler.store().list_instances("S1").await.unwrap().len(), 1);

        // A late duplicate neither counts as new nor republishes
        let ack = handler.on_instance_received(event("S1", "A", "i2", Some(2))).await;
        assert_eq!(ack, AckCode::Success);
        handler.drain().await;
        assert_eq!(sink.summaries().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_instances() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let handler = open(&dir, sink.clone(), Duration::from_secs(60), 3).await;

        handler.shutdown().await;

        let ack = handler.on_instance_received(event("S1", "A", "i1", Some(1))).await;
        assert_eq!(ack, AckCode::Refused);
        assert!(handler.store().list_studies().await.unwrap().is_empty());
    }
}
