use serde::{Deserialize, Serialize};

/// Completion notice for one delivered artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadEvent {
    pub filename: String,
    pub size: u64,
    /// Final local path; omitted when nothing was kept on this host
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}
