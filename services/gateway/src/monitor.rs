//! Periodic completion sweep.
//!
//! Studies without a declared count only complete once they go quiet, and
//! nothing arrives to trigger that evaluation. The monitor re-checks pending
//! studies and retries stuck notifications on a fixed interval.

use crate::handler::IngestHandler;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct CompletionMonitor {
    handler: Arc<IngestHandler>,
    interval: Duration,
}

impl CompletionMonitor {
    pub fn new(handler: Arc<IngestHandler>, interval: Duration) -> Self {
        Self { handler, interval }
    }

    /// Sweep until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "Completion monitor started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    debug!("Completion sweep");
                    self.handler.sweep().await;
                }
            }
        }

        info!("Completion monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::EngineSettings;
    use crate::instance::{AckCode, InstanceReceived};
    use crate::publisher::RetryPolicy;
    use crate::sink::MockEventSink;
    use crate::tracker::StudyState;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_monitor_completes_quiet_study() {
        let dir = TempDir::new().unwrap();
        let mut sink = MockEventSink::new();
        sink.expect_send()
            .times(1)
            .withf(|m| m.key == "S1")
            .returning(|_| Ok(()));

        let settings = EngineSettings {
            root: dir.path().to_path_buf(),
            quiescence_window: Duration::from_millis(30),
            destination: "new_study".to_string(),
            retry: RetryPolicy::default(),
        };
        let handler = Arc::new(IngestHandler::open(settings, Arc::new(sink)).await.unwrap());

        let ack = handler
            .on_instance_received(InstanceReceived {
                study_id: "S1".to_string(),
                series_id: "A".to_string(),
                instance_id: "i1".to_string(),
                patient_id: "P1".to_string(),
                modality: "MR".to_string(),
                expected_instance_count: None,
                payload: vec![0u8; 16],
            })
            .await;
        assert_eq!(ack, AckCode::Success);

        let token = CancellationToken::new();
        let monitor = tokio::spawn(
            CompletionMonitor::new(handler.clone(), Duration::from_millis(10)).run(token.clone()),
        );

        let mut published = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if handler.tracker().state("S1") == Some(StudyState::Published) {
                published = true;
                break;
            }
        }

        token.cancel();
        monitor.await.unwrap();
        handler.shutdown().await;
        assert!(published);
    }
}
