use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
pub enum Stage {
    Staged,
    Remuxing,
    Compressing,
    Uploading,
    Finalizing,
    Completed,
    Failed,
}

impl Stage {
    /// Position in the forward order; `Failed` sits after everything
    pub fn rank(&self) -> u8 {
        match self {
            Stage::Staged => 0,
            Stage::Remuxing => 1,
            Stage::Compressing => 2,
            Stage::Uploading => 3,
            Stage::Finalizing => 4,
            Stage::Completed => 5,
            Stage::Failed => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Staged => "staged",
            Stage::Remuxing => "remuxing",
            Stage::Compressing => "compressing",
            Stage::Uploading => "uploading",
            Stage::Finalizing => "finalizing",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operating mode captured when the task is created
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct TaskMode {
    pub local_storage: bool,
    pub disaster_recovery: bool,
}

/// One upload moving through the pipeline
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub request_id: String,
    pub original_filename: String,
    /// Name the artifact is delivered under; the extension changes after a remux
    pub canonical_filename: String,
    /// Current payload inside the staging directory
    pub staging_path: PathBuf,
    /// Visible directory for the finished artifact; `None` without local storage
    pub final_directory: Option<PathBuf>,
    /// Where the artifact ended up, once finalized locally
    pub final_path: Option<PathBuf>,
    pub declared_size: u64,
    pub current_size: u64,
    pub stage: Stage,
    pub mode: TaskMode,
    pub accepted_at: Instant,
}

impl UploadTask {
    /// `final_directory` is ignored when the mode has no local storage
    pub fn new(
        request_id: impl Into<String>,
        original_filename: impl Into<String>,
        canonical_filename: impl Into<String>,
        staging_path: PathBuf,
        size: u64,
        mode: TaskMode,
        final_directory: Option<PathBuf>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            original_filename: original_filename.into(),
            canonical_filename: canonical_filename.into(),
            staging_path,
            final_directory: final_directory.filter(|_| mode.local_storage),
            final_path: None,
            declared_size: size,
            current_size: size,
            stage: Stage::Staged,
            mode,
            accepted_at: Instant::now(),
        }
    }

    /// Lowercased extension of the canonical filename, without the dot
    pub fn extension(&self) -> String {
        Path::new(&self.canonical_filename)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default()
    }

    /// Directory holding the staged payload
    pub fn staging_dir(&self) -> &Path {
        self.staging_path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(local: bool) -> TaskMode {
        TaskMode {
            local_storage: local,
            disaster_recovery: false,
        }
    }

    #[test]
    fn test_new_task() {
        let task = UploadTask::new(
            "rid",
            "orig.TS",
            "EVENT_1.TS",
            PathBuf::from("/s/.processing_v/EVENT_1.TS.rid.tmp"),
            10,
            mode(true),
            Some(PathBuf::from("/s/v")),
        );
        assert_eq!(task.stage, Stage::Staged);
        assert_eq!(task.extension(), "ts");
        assert_eq!(task.staging_dir(), Path::new("/s/.processing_v"));
        assert_eq!(task.current_size, task.declared_size);
        assert!(!task.is_terminal());
    }

    #[test]
    fn test_final_directory_dropped_without_local_storage() {
        let task = UploadTask::new(
            "rid",
            "a.jpg",
            "a.jpg",
            PathBuf::from("/tmp/.processing/a.jpg.rid.tmp"),
            1,
            mode(false),
            Some(PathBuf::from("/s/v")),
        );
        assert!(task.final_directory.is_none());
    }

    #[test]
    fn test_stage_order() {
        assert!(Stage::Staged.rank() < Stage::Remuxing.rank());
        assert!(Stage::Finalizing.rank() < Stage::Completed.rank());
        assert!(Stage::Failed.is_terminal());
        assert_eq!(Stage::Uploading.to_string(), "uploading");
    }
}
