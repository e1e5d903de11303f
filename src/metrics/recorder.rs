//! Metrics recorder for ingestion and pipeline operations
//!
//! Thin wrappers over the `metrics` facade. Without an installed recorder
//! every call is a no-op, which keeps tests free of global exporter state.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    describe_counter!(
        "dvr_uploads_received_total",
        "Total number of upload requests received"
    );
    describe_counter!(
        "dvr_uploads_accepted_total",
        "Uploads staged and handed to the worker pool"
    );
    describe_counter!(
        "dvr_uploads_rejected_total",
        "Uploads rejected at ingestion, by reason"
    );
    describe_counter!(
        "dvr_uploads_interrupted_total",
        "Uploads whose body stream was aborted by the client"
    );
    describe_counter!("dvr_staged_bytes_total", "Total bytes written to staging");

    describe_counter!(
        "dvr_tasks_completed_total",
        "Tasks that reached the Completed stage"
    );
    describe_counter!(
        "dvr_tasks_failed_total",
        "Tasks that ended Failed, by stage"
    );
    describe_counter!(
        "dvr_transform_fallbacks_total",
        "Remux or compression runs that fell back to the previous payload"
    );
    describe_counter!(
        "dvr_events_published_total",
        "Completion events published, by outcome"
    );
    describe_counter!(
        "dvr_recovered_files_total",
        "Orphaned staging files resubmitted by recovery"
    );

    describe_gauge!(
        "dvr_worker_slots_in_use",
        "Worker pool slots currently held"
    );
    describe_gauge!(
        "dvr_worker_slots_waiting",
        "Tasks waiting for a worker pool slot"
    );

    describe_histogram!(
        "dvr_stage_duration_seconds",
        "Duration of each pipeline stage"
    );
    describe_histogram!(
        "dvr_task_duration_seconds",
        "Total time from acceptance to terminal stage"
    );
    describe_histogram!("dvr_upload_size_bytes", "Size of staged payloads");
}

// ============== Ingestion ==============

pub fn record_upload_received() {
    counter!("dvr_uploads_received_total").increment(1);
}

pub fn record_upload_accepted(bytes: u64) {
    counter!("dvr_uploads_accepted_total").increment(1);
    counter!("dvr_staged_bytes_total").increment(bytes);
    histogram!("dvr_upload_size_bytes").record(bytes as f64);
}

pub fn record_upload_rejected(reason: &'static str) {
    counter!("dvr_uploads_rejected_total", "reason" => reason).increment(1);
}

pub fn record_upload_interrupted() {
    counter!("dvr_uploads_interrupted_total").increment(1);
}

// ============== Pipeline ==============

pub fn record_task_completed(duration: Duration) {
    counter!("dvr_tasks_completed_total").increment(1);
    histogram!("dvr_task_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_task_failed(stage: &'static str) {
    counter!("dvr_tasks_failed_total", "stage" => stage).increment(1);
}

pub fn record_transform_fallback(stage: &'static str) {
    counter!("dvr_transform_fallbacks_total", "stage" => stage).increment(1);
}

pub fn record_event_published(ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    counter!("dvr_events_published_total", "outcome" => outcome).increment(1);
}

pub fn record_recovered(files: usize) {
    counter!("dvr_recovered_files_total").increment(files as u64);
}

pub fn set_worker_slots(in_use: usize, waiting: usize) {
    gauge!("dvr_worker_slots_in_use").set(in_use as f64);
    gauge!("dvr_worker_slots_waiting").set(waiting as f64);
}

/// Times one pipeline stage and records it on `stop`
pub struct StageTimer {
    stage: &'static str,
    start_time: Instant,
}

impl StageTimer {
    pub fn start(stage: &'static str) -> Self {
        Self {
            stage,
            start_time: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Record the duration and hand it back for the health counters
    pub fn stop(self) -> Duration {
        let elapsed = self.start_time.elapsed();
        histogram!("dvr_stage_duration_seconds", "stage" => self.stage)
            .record(elapsed.as_secs_f64());
        elapsed
    }
}
