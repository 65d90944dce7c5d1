use crate::config::KafkaConfig;
use crate::handler::IngestHandler;
use crate::instance::{AckCode, InstanceReceived};
use crate::publisher::RetryPolicy;
use anyhow::{Context, Result};
use backoff::backoff::Backoff;
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Decode an instance event from a Kafka payload
pub fn decode_event(payload: Option<&[u8]>) -> Result<InstanceReceived> {
    let payload = payload.context("Message has no payload")?;
    serde_json::from_slice(payload).context("Failed to deserialize instance event")
}

/// Whether the offset of a message answered with `ack` may be committed.
pub fn should_commit(ack: AckCode) -> bool {
    !matches!(ack, AckCode::ProcessingFailure | AckCode::Refused)
}

/// Hand `event` to the handler until it is accepted.
///
/// Committing a later offset implicitly commits every earlier one on the
/// partition, so a failed instance is retried here instead of being skipped.
/// Returns `None` when the handler refuses (shutting down) or `shutdown` fires;
/// the caller must then stop without committing.
pub async fn deliver_until_accepted(
    handler: &IngestHandler,
    event: InstanceReceived,
    retry: &RetryPolicy,
    shutdown: &CancellationToken,
) -> Option<AckCode> {
    let mut backoff = retry.backoff();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let ack = handler.on_instance_received(event.clone()).await;
        if should_commit(ack) {
            return Some(ack);
        }
        if ack == AckCode::Refused || shutdown.is_cancelled() {
            return None;
        }

        let delay = backoff.next_backoff().unwrap_or(retry.max_interval);
        warn!(
            study_id = %event.study_id,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            "Instance not stored, retrying"
        );
        tokio::select! {
            _ = shutdown.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// One consumer-group member feeding decoded instances into the handler
pub struct InstanceConsumer {
    consumer: StreamConsumer,
    handler: Arc<IngestHandler>,
    retry: RetryPolicy,
    worker: usize,
}

impl InstanceConsumer {
    pub fn new(config: &KafkaConfig, handler: Arc<IngestHandler>, worker: usize) -> Result<Self> {
        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[&config.instance_topic])
            .context("Failed to subscribe to instance topic")?;

        info!(
            topic = %config.instance_topic,
            group = %config.consumer_group,
            worker,
            "Subscribed to Kafka topic"
        );

        Ok(Self {
            consumer,
            handler,
            retry: RetryPolicy::default(),
            worker,
        })
    }

    /// Consume until `shutdown` is cancelled or the stream ends
    #[instrument(skip(self, shutdown), fields(worker = self.worker))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("Starting instance consumer");

        let mut message_stream = self.consumer.stream();

        loop {
            let message_result = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = message_stream.next() => match next {
                    Some(result) => result,
                    None => break,
                },
            };

            match message_result {
                Ok(message) => match self.process_message(&message, &shutdown).await {
                    Some(_) => {
                        if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                            warn!(error = %e, "Failed to commit offset");
                        }
                    }
                    None => {
                        warn!(
                            partition = message.partition(),
                            offset = message.offset(),
                            "Stopping before instance was accepted, offset left uncommitted"
                        );
                        break;
                    }
                },
                Err(e) => {
                    error!(error = %e, "Kafka consumer error");
                    metrics::counter!("gateway.kafka.errors").increment(1);
                }
            }
        }

        info!("Instance consumer stopped");
        Ok(())
    }

    #[instrument(skip(self, message, shutdown), fields(partition = message.partition(), offset = message.offset()))]
    async fn process_message(&self, message: &BorrowedMessage<'_>, shutdown: &CancellationToken) -> Option<AckCode> {
        let event = match decode_event(message.payload()) {
            Ok(event) => event,
            Err(e) => {
                // Undecodable messages are skipped; redelivery cannot fix them.
                error!(error = %e, "Dropping undecodable message");
                metrics::counter!("gateway.instances.rejected").increment(1);
                return Some(AckCode::MalformedRequest);
            }
        };

        let ack = deliver_until_accepted(&self.handler, event, &self.retry, shutdown).await;
        debug!(status = ?ack.map(|a| a.status()), "Instance handled");
        ack
    }
}
