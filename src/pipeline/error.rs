use crate::pipeline::types::Stage;
use crate::storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid stage transition from {from} to {to}")]
    InvalidTransition { from: Stage, to: Stage },

    #[error("Upload failed: {0}")]
    Upload(#[from] StorageError),

    #[error("Failed to finalize {}: {source}", .path.display())]
    Finalize {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Task panicked: {0}")]
    Panicked(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
