//! Staging directory layout and staged filename format
//!
//! Staged files are named `<name>.<request-id>.tmp`. Transcoder output that
//! has not been committed yet is named `<name>.<request-id>.part`. The request
//! id in every name lets recovery map a file back to its task after a crash
//! without any other state.
//!
//! A name too long to fit one path component together with the request id
//! has its stem shortened inside the staging name only. The task keeps the
//! full name for delivery.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

/// Hidden directory name used by the nested layout and as the sibling prefix
pub const STAGING_DIR_NAME: &str = ".processing";

const STAGED_SUFFIX: &str = ".tmp";
const PARTIAL_SUFFIX: &str = ".part";

/// Longest single path component accepted by common filesystems
pub const MAX_COMPONENT_BYTES: usize = 255;

/// Where the hidden staging directory sits relative to its base directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingLayout {
    /// `<base>/.processing`, used for the system temp base and by older deployments
    Nested,
    /// `<parent>/.processing_<base-name>`, keeps the visible directory free of hidden entries
    Sibling,
}

impl StagingLayout {
    /// Staging directory for `base` under this layout
    pub fn dir(self, base: &Path) -> PathBuf {
        match self {
            StagingLayout::Nested => base.join(STAGING_DIR_NAME),
            StagingLayout::Sibling => {
                let parent = base.parent().filter(|p| !p.as_os_str().is_empty());
                match (parent, base.file_name()) {
                    (Some(parent), Some(name)) => parent.join(format!(
                        "{STAGING_DIR_NAME}_{}",
                        name.to_string_lossy()
                    )),
                    // Root-like bases have no sibling
                    _ => base.join(STAGING_DIR_NAME),
                }
            }
        }
    }
}

/// Generate a request identifier (hyphenated UUID, 36 characters)
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// `<name>.<request-id>.tmp`
pub fn staged_name(name: &str, request_id: &str) -> String {
    let name = fit_name(name, request_id, STAGED_SUFFIX);
    format!("{name}.{request_id}{STAGED_SUFFIX}")
}

/// `<name>.<request-id>.part`
pub fn partial_name(name: &str, request_id: &str) -> String {
    let name = fit_name(name, request_id, PARTIAL_SUFFIX);
    format!("{name}.{request_id}{PARTIAL_SUFFIX}")
}

/// Cut the stem of `name` so `<name>.<request-id><suffix>` stays within
/// [`MAX_COMPONENT_BYTES`]; the extension survives when it fits
fn fit_name<'a>(name: &'a str, request_id: &str, suffix: &str) -> Cow<'a, str> {
    let budget = MAX_COMPONENT_BYTES.saturating_sub(request_id.len() + 1 + suffix.len());
    if name.len() <= budget {
        return Cow::Borrowed(name);
    }

    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 && name.len() - dot < budget => name.split_at(dot),
        _ => (name, ""),
    };
    let mut end = budget - ext.len();
    while !stem.is_char_boundary(end) {
        end -= 1;
    }
    Cow::Owned(format!("{}{ext}", &stem[..end]))
}

/// A staged filename split back into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedName {
    pub name: String,
    pub request_id: String,
}

/// Parse `<name>.<request-id>.tmp`; `None` if the name does not have that shape
pub fn parse_staged_name(file_name: &str) -> Option<StagedName> {
    parse_with_suffix(file_name, STAGED_SUFFIX)
}

/// Parse `<name>.<request-id>.part`
pub fn parse_partial_name(file_name: &str) -> Option<StagedName> {
    parse_with_suffix(file_name, PARTIAL_SUFFIX)
}

fn parse_with_suffix(file_name: &str, suffix: &str) -> Option<StagedName> {
    let stem = file_name.strip_suffix(suffix)?;
    let (name, token) = stem.rsplit_once('.')?;
    if name.is_empty() || !is_request_token(token) {
        return None;
    }
    Some(StagedName {
        name: name.to_string(),
        request_id: token.to_string(),
    })
}

/// 32-char simple or 36-char hyphenated UUID text
fn is_request_token(token: &str) -> bool {
    match token.len() {
        32 => token.chars().all(|c| c.is_ascii_hexdigit()),
        36 => token.chars().all(|c| c.is_ascii_hexdigit() || c == '-'),
        _ => false,
    }
}
