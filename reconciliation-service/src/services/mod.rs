//! Services module for reconciliation-service.

pub mod database;
pub mod events;
pub mod ingest;
pub mod metrics;
pub mod settlement;

pub use database::Database;
pub use events::{EventPublisher, EventTopics, LogPublisher, PubSubPublisher, RecordingPublisher};
pub use metrics::{get_metrics, init_metrics};
