//! Forward-only stage transitions
//!
//! Stages may be skipped but never revisited. Two edges are fixed:
//! `Finalizing` is entered only from `Uploading`, and `Completed` only from
//! `Finalizing`, so nothing is finalized without passing the upload stage.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::types::{Stage, UploadTask};

pub fn can_transition(from: Stage, to: Stage) -> bool {
    if from.is_terminal() {
        return false;
    }
    match to {
        Stage::Failed => true,
        Stage::Finalizing => from == Stage::Uploading,
        Stage::Completed => from == Stage::Finalizing,
        _ => to.rank() > from.rank(),
    }
}

/// Return `task` moved to `next`
pub fn advance(mut task: UploadTask, next: Stage) -> PipelineResult<UploadTask> {
    if !can_transition(task.stage, next) {
        return Err(PipelineError::InvalidTransition {
            from: task.stage,
            to: next,
        });
    }
    tracing::debug!(
        request_id = %task.request_id,
        from = %task.stage,
        to = %next,
        "Stage transition"
    );
    task.stage = next;
    Ok(task)
}
