mod error;
mod rest;
mod types;

pub use error::{ApiError, ApiResult};
pub use rest::RestApi;
pub use types::*;

use crate::config::Config;
use crate::events::EventPublisher;
use crate::pipeline::TaskMode;
use crate::pool::WorkerPool;
use crate::staging::{StagingLayout, StreamStager};
use crate::storage::ObjectStore;
use axum::extract::DefaultBodyLimit;
use axum::Router;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Ingestion parameters fixed at startup
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub secret_key: String,
    pub enable_secret: bool,
    /// Hidden directory new uploads are streamed into
    pub staging_dir: PathBuf,
    pub final_directory: Option<PathBuf>,
    pub mode: TaskMode,
    pub enable_s3_upload: bool,
    pub enable_rabbitmq: bool,
    pub max_upload_bytes: usize,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        let base = config.ingest_base_dir();
        let layout = if config.enable_local_storage {
            StagingLayout::Sibling
        } else {
            StagingLayout::Nested
        };
        Self {
            secret_key: config.secret_key.clone(),
            enable_secret: config.enable_secret,
            staging_dir: layout.dir(&base),
            final_directory: config.final_directory(),
            mode: TaskMode {
                local_storage: config.enable_local_storage,
                disaster_recovery: config.disaster_recovery_mode,
            },
            enable_s3_upload: config.enable_s3_upload,
            enable_rabbitmq: config.enable_rabbitmq,
            max_upload_bytes: config.max_upload_bytes,
        }
    }
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<IngestSettings>,
    pub stager: StreamStager,
    pub pool: WorkerPool,
    pub object_store: Option<Arc<dyn ObjectStore>>,
    pub publisher: Option<Arc<dyn EventPublisher>>,
}

/// Create the HTTP server: upload, health, ping and metrics endpoints
pub fn create_api_server(state: AppState) -> Router {
    let body_limit = state.settings.max_upload_bytes;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    RestApi::new(state)
        .router()
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn config(pairs: &[(&str, &str)]) -> Config {
        Config::from_lookup(|key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        })
        .unwrap()
    }

    #[test]
    fn test_settings_stage_next_to_video_dir() {
        let settings = IngestSettings::from_config(&config(&[("LOCAL_VIDEO_PATH", "/data/upload")]));
        assert_eq!(settings.staging_dir, Path::new("/data/.processing_upload"));
        assert_eq!(settings.final_directory.as_deref(), Some(Path::new("/data/upload")));
        assert!(settings.mode.local_storage);
        assert!(!settings.mode.disaster_recovery);
    }

    #[test]
    fn test_settings_disaster_recovery_uses_backup() {
        let settings = IngestSettings::from_config(&config(&[
            ("DISASTER_RECOVERY_MODE", "true"),
            ("BACKUP_VIDEO_PATH", "/data/backup"),
        ]));
        assert_eq!(settings.staging_dir, Path::new("/data/.processing_backup"));
        assert!(settings.mode.disaster_recovery);
    }

    #[test]
    fn test_settings_without_local_storage_use_temp() {
        let settings = IngestSettings::from_config(&config(&[("ENABLE_LOCAL_STORAGE", "false")]));
        assert_eq!(
            settings.staging_dir,
            std::env::temp_dir().join(crate::staging::STAGING_DIR_NAME)
        );
        assert_eq!(settings.final_directory, None);
    }
}
