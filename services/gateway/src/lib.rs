//! DICOM Gateway - study assembly and completion engine
//!
//! Instances arrive one at a time, from many concurrent senders, in any order.
//! The gateway:
//!
//! - Stores each instance durably under `{root}/{study}/{series}/{instance}.dcm`
//! - Decides when a study is complete (declared count reached, or quiet for a
//!   configured window)
//! - Publishes exactly one "study complete" summary per study, surviving
//!   restarts and sink outages
//!
//! # Example
//!
//! ```rust,no_run
//! use dicom_gateway::{Config, EngineSettings, IngestHandler, InstanceReceived, KafkaSink};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let sink = Arc::new(KafkaSink::new(config.kafka.clone(), config.publisher.delivery_timeout()));
//!     let handler = IngestHandler::open(EngineSettings::from_config(&config), sink).await?;
//!
//!     let ack = handler.on_instance_received(InstanceReceived::default()).await;
//!     println!("status {:#06X}", ack.status());
//!
//!     handler.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod completion;
pub mod config;
pub mod consumer;
pub mod handler;
pub mod instance;
pub mod monitor;
pub mod publisher;
pub mod sink;
pub mod store;
pub mod tracker;

pub use completion::{Completeness, CompletionDetector};
pub use config::{Config, ConfigValidationError, KafkaConfig};
pub use consumer::InstanceConsumer;
pub use handler::{EngineSettings, IngestHandler, StartupError};
pub use instance::{AckCode, Instance, InstanceKey, InstanceReceived, MetadataError, SeriesInstance};
pub use monitor::CompletionMonitor;
pub use publisher::{EventPublisher, PendingPublish, PublishError, PublishResult, RetryPolicy, StudySummary};
pub use sink::{EventSink, KafkaSink, OutgoingMessage, SinkError};
pub use store::{HierarchicalStore, StoreError, StoreResult, StudyMeta};
pub use tracker::{CompletionOutcome, PublishOutcome, StudyRecord, StudyState, StudyStateTracker};
