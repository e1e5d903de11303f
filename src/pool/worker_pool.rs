use crate::config::DEFAULT_WORKER_COUNT;
use crate::metrics::recorder;
use crate::metrics::HealthState;
use crate::pipeline::{PipelineError, ProcessingPipeline, Progress, Stage, UploadTask};
use crate::staging::remove_request_files;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Fixed-capacity gate in front of the processing pipeline.
///
/// Every submitted task runs on its own tokio task but must hold one
/// semaphore permit while the pipeline runs. The permit is owned by the
/// spawned task, so it is released on every exit path, panics included.
#[derive(Clone)]
pub struct WorkerPool {
    pipeline: Arc<ProcessingPipeline>,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Exclusive claim on a request id while its task is staged or running
#[derive(Debug)]
pub struct Reservation {
    request_id: String,
    registry: Arc<Mutex<HashSet<String>>>,
}

impl Reservation {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.request_id);
    }
}

impl WorkerPool {
    /// `capacity` of zero falls back to the default worker count
    pub fn new(pipeline: Arc<ProcessingPipeline>, capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_WORKER_COUNT
        } else {
            capacity
        };
        Self {
            pipeline,
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn pipeline(&self) -> &Arc<ProcessingPipeline> {
        &self.pipeline
    }

    pub fn health(&self) -> &Arc<HealthState> {
        self.pipeline.health()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots held right now
    pub fn slots_in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Request ids reserved by ingestion, recovery or a running task
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_in_flight(&self, request_id: &str) -> bool {
        self.in_flight.lock().contains(request_id)
    }

    /// Claim `request_id`; `None` if it is already claimed
    pub fn reserve(&self, request_id: &str) -> Option<Reservation> {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.insert(request_id.to_string()) {
            return None;
        }
        Some(Reservation {
            request_id: request_id.to_string(),
            registry: Arc::clone(&self.in_flight),
        })
    }

    /// Run `task` in the background once a slot is free.
    ///
    /// The handle resolves to the task's terminal snapshot. Callers on the
    /// request path drop it; tests await it.
    pub fn submit(&self, reservation: Reservation, task: UploadTask) -> JoinHandle<UploadTask> {
        debug_assert_eq!(reservation.request_id(), task.request_id);

        let pipeline = Arc::clone(&self.pipeline);
        let semaphore = Arc::clone(&self.semaphore);
        let capacity = self.capacity;

        tokio::spawn(async move {
            let _reservation = reservation;
            let health = Arc::clone(pipeline.health());

            let permit = {
                let _waiting = health.begin_waiting();
                report_slots(&semaphore, capacity, &health);
                Arc::clone(&semaphore).acquire_owned().await
            };
            let Ok(_permit) = permit else {
                tracing::error!(
                    request_id = %task.request_id,
                    "Worker pool closed, leaving staged file for recovery"
                );
                return task;
            };

            let _active = health.begin_processing();
            report_slots(&semaphore, capacity, &health);

            let progress = Progress::new(&task);
            let outcome = AssertUnwindSafe(pipeline.run_tracked(task, &progress))
                .catch_unwind()
                .await;
            let done = match outcome {
                Ok(done) => done,
                Err(payload) => recover_from_panic(&pipeline, progress.snapshot(), payload).await,
            };

            drop(_active);
            drop(_permit);
            report_slots(&semaphore, capacity, &health);
            done
        })
    }
}

/// A panic after the task reached `Completed` leaves the result standing;
/// anything earlier fails the task at the stage it was in.
async fn recover_from_panic(
    pipeline: &ProcessingPipeline,
    last: UploadTask,
    payload: Box<dyn Any + Send>,
) -> UploadTask {
    let message = panic_message(payload.as_ref());
    if last.stage == Stage::Completed {
        tracing::error!(
            request_id = %last.request_id,
            panic = %message,
            "Panic after task completed, keeping result"
        );
        recorder::record_task_completed(last.accepted_at.elapsed());
        return last;
    }

    tracing::error!(
        request_id = %last.request_id,
        stage = %last.stage,
        panic = %message,
        "Panic in processing task"
    );
    remove_request_files(last.staging_dir(), &last.request_id).await;
    pipeline.fail(last, PipelineError::Panicked(message)).await
}

fn report_slots(semaphore: &Semaphore, capacity: usize, health: &HealthState) {
    let in_use = capacity.saturating_sub(semaphore.available_permits());
    let waiting = health.waiting_processors().max(0) as usize;
    recorder::set_worker_slots(in_use, waiting);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
