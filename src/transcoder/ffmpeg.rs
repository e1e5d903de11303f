use crate::transcoder::error::{TranscodeError, TranscodeResult};
use crate::transcoder::{RemuxStrategy, Transcoder};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

/// Keep only the end of stderr in errors; ffmpeg prints its banner first
const STDERR_TAIL_BYTES: usize = 2048;

/// `ffmpeg`/`ffprobe` subprocess transcoder
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg: String,
    ffprobe: String,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            timeout,
        }
    }

    fn remux_args(input: &Path, output: &Path, strategy: RemuxStrategy) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-y".into(), "-i".into(), input.into()];
        args.extend(["-map", "0", "-c", "copy"].map(OsString::from));
        if strategy == RemuxStrategy::AacBitstreamFilter {
            args.extend(["-bsf:a", "aac_adtstoasc"].map(OsString::from));
        }
        args.extend(["-movflags", "+faststart", "-f", "mp4"].map(OsString::from));
        args.push(output.into());
        args
    }

    fn compress_args(input: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-y".into(), "-i".into(), input.into()];
        args.extend(
            [
                "-c:v",
                "libx264",
                "-crf",
                "30",
                "-preset",
                "ultrafast",
                "-threads",
                "1",
                "-movflags",
                "+faststart",
                "-pix_fmt",
                "yuv420p",
                "-f",
                "mp4",
            ]
            .map(OsString::from),
        );
        args.push(output.into());
        args
    }

    /// Run one subprocess under the configured timeout; the child is killed if the timeout fires
    async fn run(&self, program: &str, args: &[OsString]) -> TranscodeResult<Output> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result.map_err(|source| TranscodeError::Spawn {
                program: program.to_string(),
                source,
            })?,
            Err(_) => {
                return Err(TranscodeError::Timeout {
                    program: program.to_string(),
                    elapsed: self.timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(TranscodeError::Failed {
                program: program.to_string(),
                status: output.status.to_string(),
                stderr: stderr_tail(&output.stderr),
            });
        }
        Ok(output)
    }

    /// Whether the first video stream exists. Probe failures count as "no".
    async fn has_video_stream(&self, input: &Path) -> bool {
        let mut args: Vec<OsString> = [
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=codec_type",
            "-of",
            "csv=p=0",
        ]
        .map(OsString::from)
        .to_vec();
        args.push(input.into());

        match self.run(&self.ffprobe, &args).await {
            Ok(output) => !String::from_utf8_lossy(&output.stdout).trim().is_empty(),
            Err(e) => {
                tracing::info!(
                    path = %input.display(),
                    error = %e,
                    "ffprobe failed, treating input as having no video"
                );
                false
            }
        }
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

async fn ensure_output(output: &Path) -> TranscodeResult<()> {
    match tokio::fs::metadata(output).await {
        Ok(meta) if meta.len() > 0 => Ok(()),
        _ => Err(TranscodeError::EmptyOutput),
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn remux(
        &self,
        input: &Path,
        output: &Path,
        strategy: RemuxStrategy,
    ) -> TranscodeResult<()> {
        let args = Self::remux_args(input, output, strategy);
        self.run(&self.ffmpeg, &args).await?;
        ensure_output(output).await
    }

    async fn compress(&self, input: &Path, output: &Path) -> TranscodeResult<()> {
        if !self.has_video_stream(input).await {
            return Err(TranscodeError::NoVideoStream);
        }
        let args = Self::compress_args(input, output);
        self.run(&self.ffmpeg, &args).await?;
        ensure_output(output).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(args: &[OsString]) -> String {
        args.iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_remux_args() {
        let args = FfmpegTranscoder::remux_args(
            Path::new("in.ts"),
            Path::new("out.part"),
            RemuxStrategy::StreamCopy,
        );
        assert_eq!(
            joined(&args),
            "-y -i in.ts -map 0 -c copy -movflags +faststart -f mp4 out.part"
        );

        let args = FfmpegTranscoder::remux_args(
            Path::new("in.ts"),
            Path::new("out.part"),
            RemuxStrategy::AacBitstreamFilter,
        );
        assert!(joined(&args).contains("-c copy -bsf:a aac_adtstoasc -movflags"));
    }

    #[test]
    fn test_compress_args() {
        let args = FfmpegTranscoder::compress_args(Path::new("in.mp4"), Path::new("out.part"));
        let line = joined(&args);
        assert!(line.starts_with("-y -i in.mp4 -c:v libx264 -crf 30 -preset ultrafast"));
        assert!(line.ends_with("-pix_fmt yuv420p -f mp4 out.part"));
    }

    #[test]
    fn test_stderr_tail() {
        assert_eq!(stderr_tail(b"  short  "), "short");
        let long = "x".repeat(STDERR_TAIL_BYTES + 100);
        let tail = stderr_tail(long.as_bytes());
        assert!(tail.starts_with("..."));
        assert_eq!(tail.len(), STDERR_TAIL_BYTES + 3);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let transcoder = FfmpegTranscoder::new(
            "/nonexistent/ffmpeg-binary",
            "/nonexistent/ffprobe-binary",
            Duration::from_secs(5),
        );
        let result = transcoder
            .remux(
                Path::new("in.ts"),
                Path::new("out.part"),
                RemuxStrategy::StreamCopy,
            )
            .await;
        assert!(matches!(result, Err(TranscodeError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_compress_without_ffprobe_skips() {
        let transcoder = FfmpegTranscoder::new(
            "/nonexistent/ffmpeg-binary",
            "/nonexistent/ffprobe-binary",
            Duration::from_secs(5),
        );
        let result = transcoder
            .compress(Path::new("in.mp4"), Path::new("out.part"))
            .await;
        assert!(matches!(result, Err(TranscodeError::NoVideoStream)));
    }
}
