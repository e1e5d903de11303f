use thiserror::Error;

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upload stream aborted after {bytes_written} bytes: {reason}")]
    Stream { bytes_written: u64, reason: String },

    #[error("Uploaded file is empty")]
    EmptyPayload,
}

pub type StagingResult<T> = Result<T, StagingError>;
