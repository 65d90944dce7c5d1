//! Outbound event sink.
//!
//! [`EventSink`] is the seam the publisher talks to. [`KafkaSink`] is the
//! production implementation: it owns one producer, creates it on first use,
//! and drops it after a transport failure so the next attempt reconnects.

use crate::config::KafkaConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors reported by a sink for a single delivery attempt
#[derive(Error, Debug, Clone)]
pub enum SinkError {
    #[error("Failed to connect to sink: {0}")]
    Connection(String),

    #[error("Sink rejected message for {destination}: {message}")]
    Rejected { destination: String, message: String },

    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),
}

/// Message handed to a sink
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    /// Topic or queue name
    pub destination: String,
    /// Partitioning key
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    pub fn new(destination: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            destination: destination.into(),
            key: key.into(),
            payload,
            headers: Vec::new(),
        }
    }

    /// Add a header to the message
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_message_type(self, msg_type: impl Into<String>) -> Self {
        self.with_header("message-type", msg_type)
    }
}

/// A destination that acknowledges or rejects each message.
///
/// `Ok(())` means the sink has durably accepted the message.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, message: &OutgoingMessage) -> Result<(), SinkError>;
}

/// Kafka-backed sink with a lazily (re)created producer
pub struct KafkaSink {
    config: KafkaConfig,
    delivery_timeout: Duration,
    producer: Mutex<Option<FutureProducer>>,
}

impl KafkaSink {
    pub fn new(config: KafkaConfig, delivery_timeout: Duration) -> Self {
        info!(
            bootstrap_servers = %config.bootstrap_servers,
            "Kafka sink configured"
        );

        Self {
            config,
            delivery_timeout,
            producer: Mutex::new(None),
        }
    }

    /// Borrow the shared producer, creating it if there is none.
    fn acquire(&self) -> Result<FutureProducer, SinkError> {
        let mut slot = self.producer.lock();
        if let Some(producer) = slot.as_ref() {
            return Ok(producer.clone());
        }

        let producer: FutureProducer = self
            .config
            .build_producer_config()
            .create()
            .map_err(|e| SinkError::Connection(e.to_string()))?;

        debug!(bootstrap_servers = %self.config.bootstrap_servers, "Kafka producer created");
        *slot = Some(producer.clone());
        Ok(producer)
    }

    /// Forget the current producer so the next attempt builds a fresh one.
    fn invalidate(&self) {
        let stale = self.producer.lock().take();
        if stale.is_some() {
            warn!("Dropping Kafka producer after transport failure");
        }
        drop(stale);
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), SinkError> {
        let producer = self.producer.lock().clone();
        match producer {
            Some(producer) => producer
                .flush(Timeout::After(timeout))
                .map_err(|_| SinkError::Timeout(timeout)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl EventSink for KafkaSink {
    #[instrument(skip(self, message), fields(topic = %message.destination, key = %message.key))]
    async fn send(&self, message: &OutgoingMessage) -> Result<(), SinkError> {
        let producer = self.acquire()?;

        let mut headers = OwnedHeaders::new();
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let record = FutureRecord::to(&message.destination)
            .key(message.key.as_str())
            .payload(message.payload.as_slice())
            .headers(headers);

        match producer.send(record, Timeout::After(self.delivery_timeout)).await {
            Ok((partition, offset)) => {
                debug!(partition, offset, "Message acknowledged");
                Ok(())
            }
            Err((e, _)) => {
                let error = classify(&e, &message.destination, self.delivery_timeout);
                if !matches!(error, SinkError::Rejected { .. }) {
                    self.invalidate();
                }
                Err(error)
            }
        }
    }
}

/// Whether a production error code means the broker link, not the message, failed
fn is_transport_failure(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::Resolve
            | RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::BrokerNotAvailable
            | RDKafkaErrorCode::NetworkException
    )
}

fn classify(error: &KafkaError, destination: &str, delivery_timeout: Duration) -> SinkError {
    match error {
        KafkaError::MessageProduction(
            RDKafkaErrorCode::MessageTimedOut | RDKafkaErrorCode::OperationTimedOut | RDKafkaErrorCode::RequestTimedOut,
        ) => SinkError::Timeout(delivery_timeout),
        KafkaError::MessageProduction(code) if is_transport_failure(*code) => SinkError::Connection(code.to_string()),
        KafkaError::MessageProduction(code) => SinkError::Rejected {
            destination: destination.to_string(),
            message: code.to_string(),
        },
        other => SinkError::Connection(other.to_string()),
    }
}

impl Drop for KafkaSink {
    fn drop(&mut self) {
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!("Failed to flush Kafka sink on shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_message_builder() {
        let message = OutgoingMessage::new("dicom.studies", "S1", vec![1, 2, 3])
            .with_message_type("study_completed")
            .with_header("source", "gateway");

        assert_eq!(message.key, "S1");
        assert_eq!(
            message.headers,
            vec![
                ("message-type".to_string(), "study_completed".to_string()),
                ("source".to_string(), "gateway".to_string()),
            ]
        );
    }

    #[test]
    fn test_kafka_sink_is_lazy() {
        let sink = KafkaSink::new(KafkaConfig::default(), Duration::from_secs(1));
        assert!(sink.producer.lock().is_none());
        assert!(sink.flush(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_transport_failures_are_not_rejections() {
        let timeout = Duration::from_secs(1);

        for code in [
            RDKafkaErrorCode::BrokerTransportFailure,
            RDKafkaErrorCode::AllBrokersDown,
            RDKafkaErrorCode::NetworkException,
        ] {
            let error = classify(&KafkaError::MessageProduction(code), "new_study", timeout);
            assert!(matches!(error, SinkError::Connection(_)), "{:?}", code);
        }

        let error = classify(
            &KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut),
            "new_study",
            timeout,
        );
        assert!(matches!(error, SinkError::Timeout(d) if d == timeout));

        let error = classify(
            &KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge),
            "new_study",
            timeout,
        );
        assert!(matches!(error, SinkError::Rejected { ref destination, .. } if destination == "new_study"));
    }
}
