//! Stream Stager
//!
//! Writes an upload body straight into the hidden staging directory. The
//! returned [`StagedFile`] owns the on-disk file: dropping it without calling
//! [`StagedFile::keep`] removes the file, so no early return on the request
//! path can leave an orphan behind.

use crate::staging::error::{StagingError, StagingResult};
use crate::staging::layout::{parse_partial_name, parse_staged_name, staged_name};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

/// Write buffer for staging copies (1 MiB)
pub const COPY_BUFFER_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, Default)]
pub struct StreamStager;

impl StreamStager {
    pub fn new() -> Self {
        Self
    }

    /// Stage `stream` as `<file_name>.<request_id>.tmp` inside `staging_dir`.
    ///
    /// On a stream error the partial file is removed before returning
    /// `StagingError::Stream`. An empty body is removed and rejected.
    pub async fn stage<S, E>(
        &self,
        staging_dir: &Path,
        file_name: &str,
        request_id: &str,
        stream: S,
    ) -> StagingResult<StagedFile>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        fs::create_dir_all(staging_dir).await?;

        let path = staging_dir.join(staged_name(file_name, request_id));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        // From here on the guard removes the file on every error path
        let mut staged = StagedFile::new(path);
        let mut writer = BufWriter::with_capacity(COPY_BUFFER_SIZE, file);
        let mut bytes_written: u64 = 0;

        futures::pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| StagingError::Stream {
                bytes_written,
                reason: e.to_string(),
            })?;
            writer.write_all(&chunk).await?;
            bytes_written += chunk.len() as u64;
        }

        writer.flush().await?;
        writer.into_inner().sync_data().await?;

        if bytes_written == 0 {
            return Err(StagingError::EmptyPayload);
        }

        staged.bytes = bytes_written;
        tracing::debug!(
            path = %staged.path.display(),
            bytes_written,
            "Upload stream staged"
        );
        Ok(staged)
    }
}

/// A staged payload owned by the request that wrote it
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    bytes: u64,
    armed: bool,
}

impl StagedFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            bytes: 0,
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Rename within the staging area; the guard follows the file
    pub async fn rename(&mut self, new_path: PathBuf) -> std::io::Result<()> {
        if new_path != self.path {
            fs::rename(&self.path, &new_path).await?;
            self.path = new_path;
        }
        Ok(())
    }

    /// Release ownership; the file now belongs to whoever takes the path
    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.armed {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {
                    tracing::warn!(path = %self.path.display(), "Removed abandoned staged file")
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::error!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to remove abandoned staged file"
                ),
            }
        }
    }
}

/// Remove every staged or partial file in `dir` that belongs to `request_id`
pub async fn remove_request_files(dir: &Path, request_id: &str) -> usize {
    let mut removed = 0;
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return removed;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        let owned = parse_staged_name(&name)
            .or_else(|| parse_partial_name(&name))
            .is_some_and(|parsed| parsed.request_id == request_id);
        if owned && fs::remove_file(entry.path()).await.is_ok() {
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tempfile::TempDir;

    fn ok_chunks(chunks: Vec<&'static str>) -> impl Stream<Item = Result<Bytes, String>> {
        stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))))
    }

    async fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        if let Ok(mut entries) = fs::read_dir(dir).await {
            while let Some(entry) = entries.next_entry().await.unwrap() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names
    }

    #[tokio::test]
    async fn test_stage_writes_one_uniquely_named_file() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join(".processing");
        let stager = StreamStager::new();

        let staged = stager
            .stage(&staging, "clip.ts", "req-1", ok_chunks(vec!["hello ", "world"]))
            .await
            .unwrap();

        assert_eq!(staged.bytes(), 11);
        assert_eq!(dir_entries(&staging).await, vec!["clip.ts.req-1.tmp".to_string()]);
        assert_eq!(fs::read(staged.path()).await.unwrap(), b"hello world");

        let kept = staged.keep();
        assert!(kept.exists());
    }

    #[tokio::test]
    async fn test_stream_failure_removes_partial_file() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join(".processing");
        let stager = StreamStager::new();

        let broken = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err("connection reset".to_string()),
        ]);
        let result = stager.stage(&staging, "clip.ts", "req-2", broken).await;

        match result {
            Err(StagingError::Stream { bytes_written, reason }) => {
                assert_eq!(bytes_written, 7);
                assert!(reason.contains("reset"));
            }
            other => panic!("expected stream failure, got {other:?}"),
        }
        assert!(dir_entries(&staging).await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_payload_rejected_and_removed() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join(".processing");
        let stager = StreamStager::new();

        let result = stager
            .stage(&staging, "clip.ts", "req-3", ok_chunks(Vec::new()))
            .await;
        assert!(matches!(result, Err(StagingError::EmptyPayload)));
        assert!(dir_entries(&staging).await.is_empty());
    }

    #[tokio::test]
    async fn test_dropping_guard_removes_file() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join(".processing");
        let stager = StreamStager::new();

        let mut staged = stager
            .stage(&staging, "a.jpg", "req-4", ok_chunks(vec!["x"]))
            .await
            .unwrap();
        let renamed = staging.join("b.jpg.req-4.tmp");
        staged.rename(renamed.clone()).await.unwrap();
        assert!(renamed.exists());

        drop(staged);
        assert!(!renamed.exists());
    }

    #[tokio::test]
    async fn test_remove_request_files_only_touches_owner() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path();
        let mine = "0123456789abcdef0123456789abcdef";
        let other = "fedcba9876543210fedcba9876543210";
        for name in [
            format!("a.ts.{mine}.tmp"),
            format!("a.mp4.{mine}.part"),
            format!("b.ts.{other}.tmp"),
            "unrelated.txt".to_string(),
        ] {
            std::fs::write(dir.join(name), b"x").unwrap();
        }

        assert_eq!(remove_request_files(dir, mine).await, 2);
        let mut left = dir_entries(dir).await;
        left.sort();
        assert_eq!(left, vec![format!("b.ts.{other}.tmp"), "unrelated.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_uncreatable_directory_is_io_error() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("file");
        std::fs::write(&blocker, b"not a dir").unwrap();

        let result = StreamStager::new()
            .stage(&blocker.join("sub"), "a.jpg", "req-5", ok_chunks(vec!["x"]))
            .await;
        assert!(matches!(result, Err(StagingError::Io(_))));
    }
}
