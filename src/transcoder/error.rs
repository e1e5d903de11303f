use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{program} timed out after {elapsed:?}")]
    Timeout { program: String, elapsed: Duration },

    #[error("Input has no video stream")]
    NoVideoStream,

    #[error("Transcoder produced no output")]
    EmptyOutput,
}

pub type TranscodeResult<T> = Result<T, TranscodeError>;
