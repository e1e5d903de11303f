//! Completion event publishing
//!
//! One [`UploadEvent`] is published per finished task. Publishing is best
//! effort: failures are logged by the caller and never undo delivery.

mod error;
mod rabbitmq;
mod types;

pub use error::{PublishError, PublishResult};
pub use rabbitmq::RabbitMqPublisher;
pub use types::UploadEvent;

use async_trait::async_trait;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &UploadEvent) -> PublishResult<()>;

    async fn health_check(&self) -> PublishResult<()>;
}
