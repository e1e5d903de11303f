use crate::metrics::{DependencyStatus, HealthSnapshot};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

/// Envelope used by every JSON response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonResponse<T> {
    pub code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> JsonResponse<T> {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code: status.as_u16(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(status: StatusCode, message: impl Into<String>, data: T) -> Self {
        Self {
            code: status.as_u16(),
            message: message.into(),
            data: Some(data),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Dependencies {
    pub s3_storage: DependencyStatus,
    pub rabbitmq: DependencyStatus,
}

impl Dependencies {
    /// Any collaborator that is switched on but unreachable
    pub fn degraded(&self) -> bool {
        self.s3_storage.is_error() || self.rabbitmq.is_error()
    }
}

/// `data` of `GET /health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    #[serde(flatten)]
    pub counters: HealthSnapshot,
    pub dependencies: Dependencies,
}
