use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Event publisher not configured")]
    NotConfigured,

    #[error("Broker connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Broker did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type PublishResult<T> = Result<T, PublishError>;
