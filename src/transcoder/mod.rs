//! External media transcoder
//!
//! The pipeline talks to [`Transcoder`]; [`FfmpegTranscoder`] drives the
//! `ffmpeg`/`ffprobe` executables. Implementations write to the output path
//! they are given and never touch the input.

mod error;
mod ffmpeg;

pub use error::{TranscodeError, TranscodeResult};
pub use ffmpeg::FfmpegTranscoder;

use async_trait::async_trait;
use std::path::Path;

/// Invocation used for a remux attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemuxStrategy {
    /// Plain stream copy into the target container
    StreamCopy,
    /// Stream copy with the ADTS to ASC audio bitstream filter
    AacBitstreamFilter,
}

impl RemuxStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemuxStrategy::StreamCopy => "stream_copy",
            RemuxStrategy::AacBitstreamFilter => "aac_adtstoasc",
        }
    }
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Change container to MP4 without re-encoding
    async fn remux(&self, input: &Path, output: &Path, strategy: RemuxStrategy)
        -> TranscodeResult<()>;

    /// Re-encode video at the fixed quality preset.
    ///
    /// Returns `TranscodeError::NoVideoStream` when there is nothing to encode.
    async fn compress(&self, input: &Path, output: &Path) -> TranscodeResult<()>;
}
