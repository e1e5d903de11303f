use crate::api::types::JsonResponse;
use crate::metrics::recorder;
use crate::metrics::HealthState;
use crate::naming::NamingError;
use crate::staging::StagingError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Reasons an upload is rejected before a task exists
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Expected multipart/form-data")]
    NotMultipart,

    #[error("File is required")]
    MissingFile,

    #[error("File is empty")]
    EmptyFile,

    #[error("Too many form fields")]
    TooManyFields,

    #[error("File name too long")]
    NameTooLong,

    #[error("Invalid file name")]
    InvalidName,

    #[error("Signature error")]
    SignatureMismatch,

    #[error("Error reading upload stream: {0}")]
    ReadStream(String),

    #[error("Failed to receive file content: {0}")]
    Interrupted(String),

    #[error("Failed to save file: {0}")]
    Staging(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotMultipart
            | ApiError::MissingFile
            | ApiError::EmptyFile
            | ApiError::TooManyFields
            | ApiError::NameTooLong
            | ApiError::InvalidName
            | ApiError::SignatureMismatch => StatusCode::BAD_REQUEST,
            ApiError::ReadStream(_)
            | ApiError::Interrupted(_)
            | ApiError::Staging(_)
            | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message sent to the device; infrastructure details stay in the logs
    fn public_message(&self) -> &'static str {
        match self {
            ApiError::NotMultipart => "Expected multipart/form-data",
            ApiError::MissingFile => "File is required",
            ApiError::EmptyFile => "File is empty",
            ApiError::TooManyFields => "Too many form fields",
            ApiError::NameTooLong => "File name too long",
            ApiError::InvalidName => "Invalid file name",
            ApiError::SignatureMismatch => "Signature error",
            ApiError::ReadStream(_) => "Error reading upload stream",
            ApiError::Interrupted(_) => "Failed to receive file content",
            ApiError::Staging(_) => "Failed to save file",
            ApiError::Internal(_) => "Internal server error",
        }
    }

    /// Metric label
    pub fn reason(&self) -> &'static str {
        match self {
            ApiError::NotMultipart => "not_multipart",
            ApiError::MissingFile => "missing_file",
            ApiError::EmptyFile => "empty_file",
            ApiError::TooManyFields => "too_many_fields",
            ApiError::NameTooLong => "name_too_long",
            ApiError::InvalidName => "invalid_name",
            ApiError::SignatureMismatch => "signature",
            ApiError::ReadStream(_) => "read_stream",
            ApiError::Interrupted(_) => "interrupted",
            ApiError::Staging(_) => "staging",
            ApiError::Internal(_) => "internal",
        }
    }

    /// Count the rejection; an aborted body is an interruption, not a failure
    pub fn record(&self, health: &HealthState) {
        match self {
            ApiError::Interrupted(_) => {
                health.record_interrupted();
                recorder::record_upload_interrupted();
            }
            _ => {
                health.record_failure();
                recorder::record_upload_rejected(self.reason());
            }
        }
    }
}

impl From<StagingError> for ApiError {
    fn from(e: StagingError) -> Self {
        match e {
            StagingError::Stream { .. } => ApiError::Interrupted(e.to_string()),
            StagingError::EmptyPayload => ApiError::EmptyFile,
            StagingError::Io(_) => ApiError::Staging(e.to_string()),
        }
    }
}

impl From<NamingError> for ApiError {
    fn from(e: NamingError) -> Self {
        match e {
            NamingError::NameTooLong(_) => ApiError::NameTooLong,
            _ => ApiError::InvalidName,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(JsonResponse::<()>::new(status, self.public_message()));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_errors_map_to_status() {
        let interrupted = ApiError::from(StagingError::Stream {
            bytes_written: 10,
            reason: "reset".into(),
        });
        assert!(matches!(interrupted, ApiError::Interrupted(_)));
        assert_eq!(interrupted.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let empty = ApiError::from(StagingError::EmptyPayload);
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_naming_errors_are_client_errors() {
        let too_long = ApiError::from(NamingError::NameTooLong(300));
        assert_eq!(too_long.public_message(), "File name too long");
        assert_eq!(too_long.status(), StatusCode::BAD_REQUEST);
        assert!(matches!(
            ApiError::from(NamingError::InvalidName),
            ApiError::InvalidName
        ));
    }

    #[test]
    fn test_record_separates_interruptions() {
        let health = HealthState::new();
        ApiError::Interrupted("reset".into()).record(&health);
        ApiError::SignatureMismatch.record(&health);
        let snapshot = health.snapshot();
        assert_eq!(snapshot.interrupted_uploads, 1);
        assert_eq!(snapshot.failed_uploads, 1);
    }
}
