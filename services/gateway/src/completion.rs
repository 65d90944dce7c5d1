//! Study completeness evaluation.
//!
//! A study with a declared instance count is complete once that many distinct
//! instances are stored. Without a declared count the only safe signal is
//! silence: the study completes after the quiescence window passes with no new
//! instance.

use crate::store::{HierarchicalStore, StoreError, StudySnapshot};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Answer from [`CompletionDetector::evaluate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completeness {
    pub complete: bool,
    pub received_count: usize,
    pub expected_count: Option<u32>,
}

/// Read-only completeness check over the store
pub struct CompletionDetector {
    store: Arc<HierarchicalStore>,
    quiescence_window: Duration,
}

impl CompletionDetector {
    pub fn new(store: Arc<HierarchicalStore>, quiescence_window: Duration) -> Self {
        Self {
            store,
            quiescence_window,
        }
    }

    pub fn quiescence_window(&self) -> Duration {
        self.quiescence_window
    }

    pub async fn evaluate(&self, study_id: &str) -> Result<Completeness, StoreError> {
        self.evaluate_at(study_id, Utc::now()).await
    }

    /// Evaluate as of `now`
    pub async fn evaluate_at(
        &self,
        study_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Completeness, StoreError> {
        let snapshot = self.store.snapshot(study_id).await?;
        let completeness = assess(&snapshot, now, self.quiescence_window);

        trace!(
            study_id,
            complete = completeness.complete,
            received = completeness.received_count,
            expected = ?completeness.expected_count,
            "Evaluated study completeness"
        );

        Ok(completeness)
    }
}

fn assess(snapshot: &StudySnapshot, now: DateTime<Utc>, window: Duration) -> Completeness {
    let received = snapshot.received_count;

    let complete = match snapshot.expected_instance_count {
        Some(expected) => received >= expected as usize,
        None => {
            received > 0
                && snapshot.last_received_at.map_or(false, |last| {
                    now.signed_duration_since(last)
                        .to_std()
                        .map(|idle| idle >= window)
                        .unwrap_or(false)
                })
        }
    };

    Completeness {
        complete,
        received_count: received,
        expected_count: snapshot.expected_instance_count,
    }
}
