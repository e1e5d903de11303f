use crate::config::ObjectStoreConfig;
use crate::staging::COPY_BUFFER_SIZE;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::ObjectStore;
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::StatusCode;
use rusty_s3::{Bucket, Credentials, S3Action, UrlStyle};
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use url::Url;

/// Longest error body kept from a failed response
const ERROR_BODY_LIMIT: usize = 512;

/// Lifetime of a presigned request URL
const PRESIGN_TTL: Duration = Duration::from_secs(3600);

/// S3-compatible object store client.
///
/// Requests are presigned by `rusty_s3` and sent with `reqwest`.
pub struct S3ObjectStore {
    client: reqwest::Client,
    bucket: Bucket,
    credentials: Credentials,
    timeout: Duration,
}

impl S3ObjectStore {
    pub fn new(config: ObjectStoreConfig) -> StorageResult<Self> {
        if !config.is_configured() {
            return Err(StorageError::NotConfigured);
        }
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|e| StorageError::InvalidEndpoint(format!("{}: {e}", config.endpoint)))?;
        if endpoint.host_str().is_none() {
            return Err(StorageError::InvalidEndpoint(config.endpoint.clone()));
        }

        let style = if config.use_path_style {
            UrlStyle::Path
        } else {
            UrlStyle::VirtualHost
        };
        let bucket = Bucket::new(endpoint, style, config.bucket.clone(), config.region.clone())
            .map_err(|e| StorageError::InvalidEndpoint(format!("{}: {e}", config.endpoint)))?;
        let credentials = Credentials::new(config.access_key.clone(), config.secret_key.clone());

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StorageError::Request(e.to_string()))?;

        tracing::info!(
            bucket = %config.bucket,
            endpoint = %config.endpoint,
            region = %config.region,
            use_path_style = config.use_path_style,
            "S3-compatible client initialized"
        );

        Ok(Self {
            client,
            bucket,
            credentials,
            timeout: config.timeout,
        })
    }

    fn put_url(&self, key: &str) -> Url {
        self.bucket
            .put_object(Some(&self.credentials), key)
            .sign(PRESIGN_TTL)
    }

    fn head_bucket_url(&self) -> Url {
        self.bucket
            .head_bucket(Some(&self.credentials))
            .sign(PRESIGN_TTL)
    }

    fn map_send_error(&self, e: reqwest::Error) -> StorageError {
        if e.is_timeout() {
            StorageError::Timeout(self.timeout)
        } else {
            StorageError::Request(e.to_string())
        }
    }
}

async fn status_error(response: reqwest::Response) -> StorageError {
    let status = response.status().as_u16();
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > ERROR_BODY_LIMIT {
        let mut end = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    StorageError::Status { status, body }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, local_path: &Path, key: &str, content_type: &str) -> StorageResult<()> {
        let file = tokio::fs::File::open(local_path).await?;
        let size = file.metadata().await?.len();

        // Streamed bodies are not chunk-encoded: S3 needs the length up front
        let body = reqwest::Body::wrap_stream(ReaderStream::with_capacity(file, COPY_BUFFER_SIZE));
        let response = self
            .client
            .put(self.put_url(key))
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        tracing::info!(
            bucket = %self.bucket.name(),
            key,
            size,
            content_type,
            "Object uploaded"
        );
        Ok(())
    }

    async fn health_check(&self) -> StorageResult<()> {
        let response = self
            .client
            .head(self.head_bucket_url())
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(StorageError::Status {
                status: 404,
                body: format!("bucket {} not found", self.bucket.name()),
            }),
            _ => Err(status_error(response).await),
        }
    }
}
