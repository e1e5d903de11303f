//! Process-wide health counters
//!
//! Every field is an independent atomic; there is no composite invariant
//! across fields, so readers may observe counters from slightly different
//! instants.

use chrono::{TimeZone, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct HealthState {
    total_incoming: AtomicU64,
    active_uploads: AtomicI64,
    media_total_count: AtomicU64,
    successful_uploads: AtomicU64,
    failed_uploads: AtomicU64,
    interrupted_uploads: AtomicU64,
    recovered_files: AtomicU64,
    waiting_processors: AtomicI64,
    active_processors: AtomicI64,
    last_processed_at: AtomicI64,

    // Timing sums in nanoseconds
    camera_send_nanos: AtomicU64,
    camera_send_count: AtomicU64,
    conversion_nanos: AtomicU64,
    conversion_count: AtomicU64,
    object_upload_nanos: AtomicU64,
    object_upload_count: AtomicU64,

    start_time: Instant,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            total_incoming: AtomicU64::new(0),
            active_uploads: AtomicI64::new(0),
            media_total_count: AtomicU64::new(0),
            successful_uploads: AtomicU64::new(0),
            failed_uploads: AtomicU64::new(0),
            interrupted_uploads: AtomicU64::new(0),
            recovered_files: AtomicU64::new(0),
            waiting_processors: AtomicI64::new(0),
            active_processors: AtomicI64::new(0),
            last_processed_at: AtomicI64::new(0),
            camera_send_nanos: AtomicU64::new(0),
            camera_send_count: AtomicU64::new(0),
            conversion_nanos: AtomicU64::new(0),
            conversion_count: AtomicU64::new(0),
            object_upload_nanos: AtomicU64::new(0),
            object_upload_count: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Count an incoming request and mark it active until the guard drops
    pub fn begin_upload(self: &Arc<Self>) -> ActiveUploadGuard {
        self.total_incoming.fetch_add(1, Ordering::Relaxed);
        self.active_uploads.fetch_add(1, Ordering::Relaxed);
        ActiveUploadGuard {
            state: Arc::clone(self),
        }
    }

    /// Mark a task as waiting for a worker slot until the guard drops
    pub fn begin_waiting(self: &Arc<Self>) -> WaitingGuard {
        self.waiting_processors.fetch_add(1, Ordering::Relaxed);
        WaitingGuard {
            state: Arc::clone(self),
        }
    }

    /// Mark a task as holding a worker slot until the guard drops
    pub fn begin_processing(self: &Arc<Self>) -> ProcessorGuard {
        self.active_processors.fetch_add(1, Ordering::Relaxed);
        ProcessorGuard {
            state: Arc::clone(self),
        }
    }

    /// Request rejected at ingestion, or task failed in the background
    pub fn record_failure(&self) {
        self.failed_uploads.fetch_add(1, Ordering::Relaxed);
    }

    /// Client aborted the body mid-transfer
    pub fn record_interrupted(&self) {
        self.interrupted_uploads.fetch_add(1, Ordering::Relaxed);
    }

    /// Payload delivered (or delivery disabled by configuration)
    pub fn record_success(&self) {
        self.successful_uploads.fetch_add(1, Ordering::Relaxed);
        self.last_processed_at
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Artifact finalized
    pub fn record_media_processed(&self) {
        self.media_total_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovered(&self, files: u64) {
        self.recovered_files.fetch_add(files, Ordering::Relaxed);
    }

    /// Time the device spent sending the body
    pub fn record_camera_send(&self, elapsed: Duration) {
        self.camera_send_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.camera_send_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Successful remux or compression run
    pub fn record_conversion(&self, elapsed: Duration) {
        self.conversion_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.conversion_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Successful object store upload
    pub fn record_object_upload(&self, elapsed: Duration) {
        self.object_upload_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.object_upload_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn successful_uploads(&self) -> u64 {
        self.successful_uploads.load(Ordering::Relaxed)
    }

    pub fn failed_uploads(&self) -> u64 {
        self.failed_uploads.load(Ordering::Relaxed)
    }

    pub fn media_total_count(&self) -> u64 {
        self.media_total_count.load(Ordering::Relaxed)
    }

    pub fn active_processors(&self) -> i64 {
        self.active_processors.load(Ordering::Relaxed)
    }

    pub fn waiting_processors(&self) -> i64 {
        self.waiting_processors.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> HealthSnapshot {
        let last = self.last_processed_at.load(Ordering::Relaxed);
        let last_processed_at = if last > 0 {
            Utc.timestamp_opt(last, 0)
                .single()
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string())
        } else {
            "never".to_string()
        };

        HealthSnapshot {
            status: "running",
            uptime: format_duration(self.uptime()),
            media_total_count: self.media_total_count(),
            successful_uploads: self.successful_uploads(),
            failed_uploads: self.failed_uploads(),
            interrupted_uploads: self.interrupted_uploads.load(Ordering::Relaxed),
            total_incoming: self.total_incoming.load(Ordering::Relaxed),
            active_uploads: self.active_uploads.load(Ordering::Relaxed),
            active_processors: self.active_processors(),
            waiting_processors: self.waiting_processors(),
            recovered_files: self.recovered_files.load(Ordering::Relaxed),
            last_processed_at,
            metrics: TimingSnapshot {
                avg_camera_send_time: average(&self.camera_send_nanos, &self.camera_send_count),
                avg_conversion_time: average(&self.conversion_nanos, &self.conversion_count),
                avg_s3_upload_time: average(&self.object_upload_nanos, &self.object_upload_count),
            },
        }
    }
}

fn average(total: &AtomicU64, count: &AtomicU64) -> String {
    let count = count.load(Ordering::Relaxed);
    if count == 0 {
        return "0s".to_string();
    }
    format_duration(Duration::from_nanos(total.load(Ordering::Relaxed) / count))
}

/// Compact duration rendering: `1h2m3s`, `4.5s`, `120ms`, `0s`
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 60 {
        let h = secs / 3600;
        let m = (secs % 3600) / 60;
        let s = secs % 60;
        if h > 0 {
            format!("{h}h{m}m{s}s")
        } else {
            format!("{m}m{s}s")
        }
    } else if secs >= 1 {
        format!("{:.3}s", d.as_secs_f64())
    } else if d.as_millis() >= 1 {
        format!("{}ms", d.as_millis())
    } else if d.is_zero() {
        "0s".to_string()
    } else {
        format!("{}µs", d.as_micros())
    }
}

pub struct ActiveUploadGuard {
    state: Arc<HealthState>,
}

impl Drop for ActiveUploadGuard {
    fn drop(&mut self) {
        self.state.active_uploads.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct WaitingGuard {
    state: Arc<HealthState>,
}

impl Drop for WaitingGuard {
    fn drop(&mut self) {
        self.state.waiting_processors.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct ProcessorGuard {
    state: Arc<HealthState>,
}

impl Drop for ProcessorGuard {
    fn drop(&mut self) {
        self.state.active_processors.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TimingSnapshot {
    pub avg_camera_send_time: String,
    pub avg_conversion_time: String,
    pub avg_s3_upload_time: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub uptime: String,
    pub media_total_count: u64,
    pub successful_uploads: u64,
    pub failed_uploads: u64,
    pub interrupted_uploads: u64,
    pub total_incoming: u64,
    pub active_uploads: i64,
    pub active_processors: i64,
    pub waiting_processors: i64,
    pub recovered_files: u64,
    pub last_processed_at: String,
    pub metrics: TimingSnapshot,
}

/// Reachability of an external collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyStatus {
    Ok,
    NotConfigured,
    Error(String),
}

impl DependencyStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, DependencyStatus::Ok)
    }

    /// Whether this status should degrade `/health`; a switched-off feature does not
    pub fn is_error(&self) -> bool {
        matches!(self, DependencyStatus::Error(_))
    }
}

impl fmt::Display for DependencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyStatus::Ok => write!(f, "ok"),
            DependencyStatus::NotConfigured => write!(f, "not_configured"),
            DependencyStatus::Error(e) => write!(f, "error: {e}"),
        }
    }
}

impl Serialize for DependencyStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}
