//! Remote object storage
//!
//! The pipeline uploads through [`ObjectStore`]. [`S3ObjectStore`] sends
//! presigned S3 requests, which covers OCI, MinIO and AWS.

mod error;
mod s3;

pub use error::{StorageError, StorageResult};
pub use s3::S3ObjectStore;

use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use std::path::Path;
use std::time::Duration;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload the file at `local_path` under `key`
    async fn put(&self, local_path: &Path, key: &str, content_type: &str) -> StorageResult<()>;

    /// Cheap reachability check for `/health`
    async fn health_check(&self) -> StorageResult<()>;
}

/// Content type sent with an upload, by file extension
pub fn content_type_for(filename: &str) -> &'static str {
    let ext = Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" => "video/mp4",
        "ts" => "video/MP2T",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// Upload with up to `max_retries` extra attempts, spaced by exponential backoff.
///
/// With `max_retries == 0` the first failure is returned as is.
pub async fn put_with_retry(
    store: &dyn ObjectStore,
    local_path: &Path,
    key: &str,
    content_type: &str,
    max_retries: u32,
) -> StorageResult<()> {
    let mut backoff = ExponentialBackoff {
        initial_interval: Duration::from_millis(500),
        max_interval: Duration::from_secs(10),
        max_elapsed_time: None,
        ..Default::default()
    };

    let mut attempt = 0u32;
    loop {
        match store.put(local_path, key, content_type).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= max_retries => return Err(e),
            Err(e) => {
                attempt += 1;
                let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                tracing::warn!(
                    key,
                    attempt,
                    max_retries,
                    error = %e,
                    "Upload failed, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyStore {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn put(&self, _: &Path, _: &str, _: &str) -> StorageResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(StorageError::Request("boom".into()));
            }
            Ok(())
        }

        async fn health_check(&self) -> StorageResult<()> {
            Ok(())
        }
    }

    fn flaky(failures: u32) -> FlakyStore {
        FlakyStore {
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("a.mp4"), "video/mp4");
        assert_eq!(content_type_for("a.TS"), "video/MP2T");
        assert_eq!(content_type_for("a.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("a.jpg"), "image/jpeg");
        assert_eq!(content_type_for("a.dat"), "application/octet-stream");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_zero_retries_fails_immediately() {
        let store = flaky(1);
        let result = put_with_retry(&store, Path::new("x"), "k", "video/mp4", 0).await;
        assert!(result.is_err());
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let store = flaky(2);
        put_with_retry(&store, Path::new("x"), "k", "video/mp4", 3)
            .await
            .unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let store = flaky(10);
        let result = put_with_retry(&store, Path::new("x"), "k", "video/mp4", 2).await;
        assert!(result.is_err());
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }
}
