mod error;
pub mod layout;
mod stager;

pub use error::{StagingError, StagingResult};
pub use layout::{
    new_request_id, parse_partial_name, parse_staged_name, partial_name, staged_name, StagedName,
    StagingLayout, STAGING_DIR_NAME,
};
pub use stager::{remove_request_files, StagedFile, StreamStager, COPY_BUFFER_SIZE};
