//! Task descriptor naming
//!
//! Builds the canonical filename an upload is delivered under, and checks
//! the request signature.

mod builder;
mod error;
pub mod signature;

pub use builder::{
    bare_filename, build_canonical_name, build_canonical_name_at, derive_extension,
    parse_datetime, resolve_final_name, DeclaredFields, ResolvedName, DEFAULT_EXTENSION,
    MAX_FILENAME_LENGTH,
};
pub use error::{NamingError, NamingResult};
pub use signature::{sign, signature_base, verify};
