//! Processing pipeline
//!
//! The fixed per-task sequence run inside a worker pool slot. See
//! [`ProcessingPipeline`] for the stage contracts and [`state_machine`] for
//! the allowed transitions.

mod error;
#[allow(clippy::module_inception)]
mod pipeline;
pub mod state_machine;
mod types;

pub use error::{PipelineError, PipelineResult};
pub use pipeline::{final_path_for, PipelineSettings, ProcessingPipeline, Progress, StageResult};
pub(crate) use pipeline::remove_if_exists;
pub use types::{Stage, TaskMode, UploadTask};
