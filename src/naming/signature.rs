//! Request signature
//!
//! `sign = base64(hex(md5(base + timestamp + secret)))`, where `base` is the
//! declared `filename` field when present, otherwise the final name.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use md5::{Digest, Md5};

/// Compute the token a device is expected to send
pub fn sign(base: &str, timestamp: &str, secret: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(base.as_bytes());
    hasher.update(timestamp.as_bytes());
    hasher.update(secret.as_bytes());
    let digest = hex::encode(hasher.finalize());
    STANDARD.encode(digest.as_bytes())
}

/// Check a caller-supplied token
pub fn verify(provided: &str, base: &str, timestamp: &str, secret: &str) -> bool {
    provided == sign(base, timestamp, secret)
}

/// The string the signature covers: the override when non-blank, else the final name
pub fn signature_base<'a>(override_name: &'a str, final_name: &'a str) -> &'a str {
    if override_name.trim().is_empty() {
        final_name
    } else {
        override_name
    }
}
