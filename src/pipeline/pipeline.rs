//! Per-task processing pipeline
//!
//! remux -> compress -> upload -> finalize -> publish
//!
//! Each stage takes the task by value and hands back the updated snapshot.
//! Remux and compress degrade to the previous payload on failure; an upload
//! failure ends the task and removes its staged file; a publish failure is
//! only logged.

use crate::config::Config;
use crate::events::{EventPublisher, UploadEvent};
use crate::metrics::recorder;
use crate::metrics::{HealthState, StageTimer};
use crate::pipeline::error::PipelineError;
use crate::pipeline::state_machine::advance;
use crate::pipeline::types::{Stage, UploadTask};
use crate::staging::{partial_name, staged_name};
use crate::storage::{content_type_for, put_with_retry, ObjectStore};
use crate::transcoder::{RemuxStrategy, TranscodeError, Transcoder};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::Instrument;

/// Feature switches, copied from configuration at startup
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub enable_ts_to_mp4: bool,
    pub enable_compression: bool,
    pub enable_upload: bool,
    pub enable_publish: bool,
    pub upload_max_retries: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            enable_ts_to_mp4: true,
            enable_compression: true,
            enable_upload: true,
            enable_publish: true,
            upload_max_retries: 0,
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enable_ts_to_mp4: config.enable_ts_to_mp4,
            enable_compression: config.enable_compression,
            enable_upload: config.enable_s3_upload,
            enable_publish: config.enable_rabbitmq,
            upload_max_retries: config.object_store.max_retries,
        }
    }
}

/// Last known snapshot of a running task.
///
/// Lives outside the task future, so it is still readable after a stage
/// panics. `stage` is the stage entered most recently; the other fields are
/// as of the last stage that returned.
#[derive(Debug)]
pub struct Progress(Mutex<UploadTask>);

impl Progress {
    pub fn new(task: &UploadTask) -> Self {
        Self(Mutex::new(task.clone()))
    }

    pub fn snapshot(&self) -> UploadTask {
        self.0.lock().clone()
    }

    fn enter(&self, stage: Stage) {
        self.0.lock().stage = stage;
    }

    fn record(&self, task: &UploadTask) {
        self.0.lock().clone_from(task);
    }
}

pub struct ProcessingPipeline {
    settings: PipelineSettings,
    transcoder: Arc<dyn Transcoder>,
    object_store: Option<Arc<dyn ObjectStore>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    health: Arc<HealthState>,
}

impl ProcessingPipeline {
    pub fn new(
        settings: PipelineSettings,
        transcoder: Arc<dyn Transcoder>,
        object_store: Option<Arc<dyn ObjectStore>>,
        publisher: Option<Arc<dyn EventPublisher>>,
        health: Arc<HealthState>,
    ) -> Self {
        Self {
            settings,
            transcoder,
            object_store,
            publisher,
            health,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn health(&self) -> &Arc<HealthState> {
        &self.health
    }

    /// Name an upload is delivered under if every enabled stage succeeds
    pub fn expected_delivery_name(&self, canonical_filename: &str) -> String {
        let is_ts = Path::new(canonical_filename)
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("ts"));
        if self.settings.enable_ts_to_mp4 && is_ts {
            remux_target_name(canonical_filename)
        } else {
            canonical_filename.to_string()
        }
    }

    /// Run every stage; the returned task is `Completed` or `Failed`
    pub async fn run(&self, task: UploadTask) -> UploadTask {
        let progress = Progress::new(&task);
        self.run_tracked(task, &progress).await
    }

    /// Like [`run`](Self::run), mirroring each step into `progress`
    pub async fn run_tracked(&self, task: UploadTask, progress: &Progress) -> UploadTask {
        let span = tracing::info_span!(
            "task",
            request_id = %task.request_id,
            filename = %task.canonical_filename
        );
        self.run_stages(task, progress).instrument(span).await
    }

    async fn run_stages(&self, task: UploadTask, progress: &Progress) -> UploadTask {
        progress.enter(Stage::Remuxing);
        let task = match self.remux(task).await {
            Ok(task) => task,
            Err((task, e)) => return self.fail(task, e).await,
        };
        progress.record(&task);

        progress.enter(Stage::Compressing);
        let task = match self.compress(task).await {
            Ok(task) => task,
            Err((task, e)) => return self.fail(task, e).await,
        };
        progress.record(&task);

        progress.enter(Stage::Uploading);
        let task = match self.upload(task).await {
            Ok(task) => task,
            Err((task, e)) => return self.fail(task, e).await,
        };
        progress.record(&task);

        progress.enter(Stage::Finalizing);
        let task = match self.finalize(task).await {
            Ok(task) => task,
            Err((task, e)) => return self.fail(task, e).await,
        };
        progress.record(&task);

        self.publish(&task).await;

        let elapsed = task.accepted_at.elapsed();
        recorder::record_task_completed(elapsed);
        tracing::info!(
            filename = %task.canonical_filename,
            size = task.current_size,
            total_duration = ?elapsed,
            "Upload and processing finished"
        );
        task
    }

    /// Convert a `.ts` payload to `.mp4`. Never fails the task on a transcoder error.
    pub async fn remux(&self, task: UploadTask) -> StageResult {
        if !self.settings.enable_ts_to_mp4 || task.extension() != "ts" {
            return Ok(task);
        }
        let mut task = advance_or_return(task, Stage::Remuxing)?;

        let target_name = remux_target_name(&task.canonical_filename);
        let part = task
            .staging_dir()
            .join(partial_name(&target_name, &task.request_id));
        let committed = task
            .staging_dir()
            .join(staged_name(&target_name, &task.request_id));

        let timer = StageTimer::start("remux");
        let mut remuxed = false;
        for strategy in [RemuxStrategy::StreamCopy, RemuxStrategy::AacBitstreamFilter] {
            match self
                .transcoder
                .remux(&task.staging_path, &part, strategy)
                .await
            {
                Ok(()) => {
                    remuxed = true;
                    break;
                }
                Err(e) => {
                    remove_if_exists(&part).await;
                    tracing::warn!(
                        strategy = strategy.as_str(),
                        error = %e,
                        "TS->MP4 remux attempt failed"
                    );
                }
            }
        }

        if !remuxed {
            timer.stop();
            recorder::record_transform_fallback("remux");
            tracing::warn!("TS->MP4 conversion failed, will upload original as TS");
            return Ok(task);
        }

        let size = match commit(&part, &committed).await {
            Ok(size) => size,
            Err(e) => {
                timer.stop();
                remove_if_exists(&part).await;
                recorder::record_transform_fallback("remux");
                tracing::warn!(error = %e, "Could not commit remux output, keeping original");
                return Ok(task);
            }
        };
        self.health.record_conversion(timer.stop());

        let previous = std::mem::replace(&mut task.staging_path, committed);
        remove_if_exists(&previous).await;
        task.canonical_filename = target_name;
        task.current_size = size;

        tracing::info!(
            filename = %task.canonical_filename,
            size,
            "TS->MP4 remux complete"
        );
        Ok(task)
    }

    /// Re-encode an `.mp4` payload, keeping the result only when it is smaller
    pub async fn compress(&self, task: UploadTask) -> StageResult {
        if !self.settings.enable_compression || task.extension() != "mp4" {
            return Ok(task);
        }
        let mut task = advance_or_return(task, Stage::Compressing)?;

        let part = task
            .staging_dir()
            .join(partial_name(&task.canonical_filename, &task.request_id));

        let timer = StageTimer::start("compress");
        match self.transcoder.compress(&task.staging_path, &part).await {
            Ok(()) => {}
            Err(TranscodeError::NoVideoStream) => {
                remove_if_exists(&part).await;
                tracing::info!("No video stream, skipping compression");
                return Ok(task);
            }
            Err(e) => {
                timer.stop();
                remove_if_exists(&part).await;
                recorder::record_transform_fallback("compress");
                tracing::warn!(error = %e, "Compression failed, keeping original");
                return Ok(task);
            }
        }
        self.health.record_conversion(timer.stop());

        let original_size = fs::metadata(&task.staging_path).await.map(|m| m.len());
        let compressed_size = fs::metadata(&part).await.map(|m| m.len());
        let (original_size, compressed_size) = match (original_size, compressed_size) {
            (Ok(o), Ok(c)) => (o, c),
            _ => {
                remove_if_exists(&part).await;
                tracing::warn!("Could not stat compression result, keeping original");
                return Ok(task);
            }
        };

        if compressed_size == 0 || compressed_size >= original_size {
            remove_if_exists(&part).await;
            tracing::info!(
                original_size,
                compressed_size,
                "Compressed output not smaller, keeping original"
            );
            return Ok(task);
        }

        // Replaces the staged file in one rename
        if let Err(e) = fs::rename(&part, &task.staging_path).await {
            remove_if_exists(&part).await;
            tracing::warn!(error = %e, "Could not commit compressed output, keeping original");
            return Ok(task);
        }
        task.current_size = compressed_size;

        tracing::info!(original_size, compressed_size, "Compression applied");
        Ok(task)
    }

    /// Deliver to the object store. Failure here is terminal.
    pub async fn upload(&self, task: UploadTask) -> StageResult {
        let task = advance_or_return(task, Stage::Uploading)?;

        let store = match (&self.object_store, self.settings.enable_upload) {
            (Some(store), true) => store,
            (None, true) => {
                tracing::warn!("Object store enabled but not configured, skipping upload");
                self.health.record_success();
                return Ok(task);
            }
            (_, false) => {
                self.health.record_success();
                return Ok(task);
            }
        };

        let timer = StageTimer::start("upload");
        let content_type = content_type_for(&task.canonical_filename);
        let result = put_with_retry(
            store.as_ref(),
            &task.staging_path,
            &task.canonical_filename,
            content_type,
            self.settings.upload_max_retries,
        )
        .await;

        match result {
            Ok(()) => {
                self.health.record_object_upload(timer.stop());
                self.health.record_success();
                Ok(task)
            }
            Err(e) => {
                timer.stop();
                Err((task, PipelineError::Upload(e)))
            }
        }
    }

    /// Move the payload into the visible directory, or drop it without local storage
    pub async fn finalize(&self, task: UploadTask) -> StageResult {
        let mut task = advance_or_return(task, Stage::Finalizing)?;

        match task.final_directory.clone() {
            Some(dir) => {
                let dest = final_path_for(&dir, &task);
                if let Err(source) = move_file(&task.staging_path, &dest).await {
                    return Err((task, PipelineError::Finalize { path: dest, source }));
                }
                task.staging_path = dest.clone();
                task.final_path = Some(dest);
            }
            None => remove_if_exists(&task.staging_path).await,
        }

        self.health.record_media_processed();
        advance_or_return(task, Stage::Completed)
    }

    /// Best-effort completion event
    pub async fn publish(&self, task: &UploadTask) {
        if !self.settings.enable_publish {
            return;
        }
        let Some(publisher) = &self.publisher else {
            return;
        };

        let event = UploadEvent {
            filename: task.canonical_filename.clone(),
            size: task.current_size,
            path: task
                .final_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        match publisher.publish(&event).await {
            Ok(()) => recorder::record_event_published(true),
            Err(e) => {
                recorder::record_event_published(false);
                tracing::error!(error = %e, "Failed to publish event after processing");
            }
        }
    }

    /// Terminal failure: remove whatever is left in staging and count it.
    ///
    /// A failed finalize keeps the staged file so recovery can deliver it again.
    /// From `Finalizing` on the upload is already counted as successful, so
    /// `failed_uploads` is left alone.
    pub async fn fail(&self, mut task: UploadTask, error: PipelineError) -> UploadTask {
        let failed_stage = task.stage;
        match &error {
            PipelineError::Finalize { .. } => {}
            _ => remove_if_exists(&task.staging_path).await,
        }

        if failed_stage.rank() < Stage::Finalizing.rank() {
            self.health.record_failure();
        }
        recorder::record_task_failed(failed_stage.as_str());
        tracing::error!(
            stage = %failed_stage,
            error = %error,
            duration = ?task.accepted_at.elapsed(),
            "Task failed"
        );

        if !task.stage.is_terminal() {
            task.stage = Stage::Failed;
        }
        task
    }
}

/// `clip.ts` -> `clip.mp4`
fn remux_target_name(name: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    format!("{stem}.mp4")
}

/// A stage hands back the task either way; on error, with the reason
pub type StageResult = Result<UploadTask, (UploadTask, PipelineError)>;

fn advance_or_return(task: UploadTask, next: Stage) -> StageResult {
    let snapshot = task.clone();
    advance(task, next).map_err(|e| (snapshot, e))
}

/// Rename `part` over `committed` and return its size
async fn commit(part: &Path, committed: &Path) -> std::io::Result<u64> {
    let size = fs::metadata(part).await?.len();
    if size == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "transcoder output is empty",
        ));
    }
    fs::rename(part, committed).await?;
    Ok(size)
}

/// Rename, falling back to copy and delete across filesystems
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).await?;
    }
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            tracing::warn!(
                error = %rename_err,
                "Failed to move file to final destination, attempting copy"
            );
            if let Err(copy_err) = fs::copy(from, to).await {
                remove_if_exists(to).await;
                return Err(copy_err);
            }
            remove_if_exists(from).await;
            Ok(())
        }
    }
}

pub(crate) async fn remove_if_exists(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}

/// Path a finished task's payload would have in `dir`
pub fn final_path_for(dir: &Path, task: &UploadTask) -> PathBuf {
    dir.join(&task.canonical_filename)
}
