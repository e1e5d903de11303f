//! Recovery Scanner
//!
//! Walks the hidden staging directories for files left behind by a previous
//! run and resubmits them to the worker pool. Every staged name carries its
//! request id, so no state beyond the filesystem is needed:
//!
//! - `<name>.<rid>.part` older than the grace window is incomplete transcoder
//!   output and is deleted
//! - `<name>.<rid>.tmp` is resubmitted as `<name>`; when several share a rid,
//!   the newest wins and the rest are deleted
//! - anything else is renamed to a fresh rid first
//!
//! Request ids the pool already holds are skipped, so a rescan while tasks
//! are running never submits the same file twice.

use crate::config::Config;
use crate::metrics::recorder;
use crate::pipeline::{remove_if_exists, TaskMode, UploadTask};
use crate::pool::{Reservation, WorkerPool};
use crate::staging::{
    new_request_id, parse_partial_name, parse_staged_name, staged_name, StagingLayout,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::task::JoinHandle;

/// Files modified more recently than this may still be written to
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(10);

/// One staging directory and the mode its files are resubmitted under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryTarget {
    pub staging_dir: PathBuf,
    pub mode: TaskMode,
    pub final_directory: Option<PathBuf>,
}

impl RecoveryTarget {
    /// Every staging directory a deployment may have left files in.
    ///
    /// Video and backup bases are scanned under both layouts; the temp base
    /// only ever used the nested one.
    pub fn from_config(config: &Config) -> Vec<RecoveryTarget> {
        let mut targets: Vec<RecoveryTarget> = Vec::new();

        for base in config.recovery_bases() {
            let mode = TaskMode {
                local_storage: true,
                disaster_recovery: base != config.video_path,
            };
            for layout in [StagingLayout::Sibling, StagingLayout::Nested] {
                push_unique(
                    &mut targets,
                    RecoveryTarget {
                        staging_dir: layout.dir(&base),
                        mode,
                        final_directory: Some(base.clone()),
                    },
                );
            }
        }

        push_unique(
            &mut targets,
            RecoveryTarget {
                staging_dir: StagingLayout::Nested.dir(&std::env::temp_dir()),
                mode: TaskMode {
                    local_storage: false,
                    disaster_recovery: false,
                },
                final_directory: None,
            },
        );
        targets
    }
}

fn push_unique(targets: &mut Vec<RecoveryTarget>, target: RecoveryTarget) {
    if !targets.iter().any(|t| t.staging_dir == target.staging_dir) {
        targets.push(target);
    }
}

/// Outcome of one scan
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub resubmitted: usize,
    pub skipped_recent: usize,
    pub skipped_in_flight: usize,
    pub partials_removed: usize,
    pub duplicates_removed: usize,
    pub renamed: usize,
    /// Handles of the resubmitted tasks
    pub tasks: Vec<JoinHandle<UploadTask>>,
}

#[derive(Debug)]
struct Orphan {
    path: PathBuf,
    name: String,
    modified: SystemTime,
    size: u64,
}

pub struct RecoveryScanner {
    targets: Vec<RecoveryTarget>,
    pool: WorkerPool,
    grace: Duration,
}

impl RecoveryScanner {
    pub fn new(targets: Vec<RecoveryTarget>, pool: WorkerPool) -> Self {
        Self {
            targets,
            pool,
            grace: DEFAULT_GRACE_WINDOW,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn targets(&self) -> &[RecoveryTarget] {
        &self.targets
    }

    /// Scan every target once and resubmit what was abandoned
    pub async fn scan_once(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        for target in &self.targets {
            if let Err(e) = self.scan_target(target, &mut report).await {
                tracing::warn!(
                    dir = %target.staging_dir.display(),
                    error = %e,
                    "Failed to scan staging directory"
                );
            }
        }

        if report.resubmitted > 0 {
            self.pool.health().record_recovered(report.resubmitted as u64);
            recorder::record_recovered(report.resubmitted);
        }
        if report.resubmitted + report.partials_removed + report.duplicates_removed > 0 {
            tracing::info!(
                resubmitted = report.resubmitted,
                renamed = report.renamed,
                partials_removed = report.partials_removed,
                duplicates_removed = report.duplicates_removed,
                skipped_recent = report.skipped_recent,
                skipped_in_flight = report.skipped_in_flight,
                "Recovery scan finished"
            );
        }
        report
    }

    /// Rescan every `every`; the first scan happens one period after the call
    pub fn spawn(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.scan_once().await;
            }
        })
    }

    async fn scan_target(
        &self,
        target: &RecoveryTarget,
        report: &mut RecoveryReport,
    ) -> std::io::Result<()> {
        let mut entries = match fs::read_dir(&target.staging_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        let now = SystemTime::now();
        let mut staged: HashMap<String, Vec<Orphan>> = HashMap::new();
        let mut partials: Vec<(String, PathBuf)> = Vec::new();
        let mut unparsed: Vec<Orphan> = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let modified = metadata.modified().unwrap_or(now);
            if now.duration_since(modified).unwrap_or_default() < self.grace {
                report.skipped_recent += 1;
                continue;
            }

            let file_name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            if let Some(partial) = parse_partial_name(&file_name) {
                partials.push((partial.request_id, path));
            } else if let Some(parsed) = parse_staged_name(&file_name) {
                staged.entry(parsed.request_id).or_default().push(Orphan {
                    path,
                    name: parsed.name,
                    modified,
                    size: metadata.len(),
                });
            } else {
                let name = file_name
                    .strip_suffix(".tmp")
                    .unwrap_or(&file_name)
                    .to_string();
                if name.is_empty() || name.starts_with('.') {
                    continue;
                }
                unparsed.push(Orphan {
                    path,
                    name,
                    modified,
                    size: metadata.len(),
                });
            }
        }

        for (request_id, path) in partials {
            let Some(_reservation) = self.pool.reserve(&request_id) else {
                report.skipped_in_flight += 1;
                continue;
            };
            remove_if_exists(&path).await;
            report.partials_removed += 1;
            tracing::info!(path = %path.display(), "Removed incomplete transcoder output");
        }

        for (request_id, mut group) in staged {
            let Some(reservation) = self.pool.reserve(&request_id) else {
                report.skipped_in_flight += 1;
                continue;
            };

            // The owning task may have finished between listing and reserving
            let mut present = Vec::with_capacity(group.len());
            for orphan in group {
                if fs::try_exists(&orphan.path).await.unwrap_or(false) {
                    present.push(orphan);
                }
            }
            let mut group = present;
            if group.is_empty() {
                report.skipped_in_flight += 1;
                continue;
            }

            group.sort_by_key(|o| o.modified);
            let Some(newest) = group.pop() else {
                continue;
            };
            for stale in group {
                remove_if_exists(&stale.path).await;
                report.duplicates_removed += 1;
                tracing::info!(
                    request_id = %request_id,
                    path = %stale.path.display(),
                    "Removed superseded staging file"
                );
            }

            self.resubmit(reservation, newest, target, report);
        }

        for orphan in unparsed {
            let request_id = new_request_id();
            let Some(reservation) = self.pool.reserve(&request_id) else {
                continue;
            };
            let renamed = target
                .staging_dir
                .join(staged_name(&orphan.name, &request_id));
            if let Err(e) = fs::rename(&orphan.path, &renamed).await {
                tracing::warn!(
                    path = %orphan.path.display(),
                    error = %e,
                    "Failed to rename unrecognized staging file"
                );
                continue;
            }
            report.renamed += 1;
            self.resubmit(
                reservation,
                Orphan {
                    path: renamed,
                    ..orphan
                },
                target,
                report,
            );
        }

        Ok(())
    }

    fn resubmit(
        &self,
        reservation: Reservation,
        orphan: Orphan,
        target: &RecoveryTarget,
        report: &mut RecoveryReport,
    ) {
        tracing::info!(
            request_id = %reservation.request_id(),
            filename = %orphan.name,
            path = %orphan.path.display(),
            size = orphan.size,
            local_storage = target.mode.local_storage,
            disaster_recovery = target.mode.disaster_recovery,
            "Resubmitting orphaned staging file"
        );

        let task = UploadTask::new(
            reservation.request_id().to_string(),
            &orphan.name,
            &orphan.name,
            orphan.path,
            orphan.size,
            target.mode,
            target.final_directory.clone(),
        );
        report.tasks.push(self.pool.submit(reservation, task));
        report.resubmitted += 1;
    }
}
