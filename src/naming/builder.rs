//! Canonical filename construction
//!
//! Two templates:
//! - event: `EVENT_<imei>_00000000_<YYYY_MM_DD_HH_MM_SS>_<I|F>_<channel><ext>`
//! - snapshot: `<imei>_<raw-hex>_<channel>_<index:02><ext>`
//!
//! The template is chosen by the `pattern` field, or by which fields are present.

use crate::naming::error::{NamingError, NamingResult};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// Longest name accepted for a staged or finalized file
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Extension used when neither the filename nor the content type says anything
pub const DEFAULT_EXTENSION: &str = ".dat";

const EVENT_RESERVED: &str = "00000000";

/// Non-file form fields sent alongside the upload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclaredFields {
    /// Explicit filename override
    pub filename: String,
    pub timestamp: String,
    pub sign: String,
    pub imei: String,
    /// Segment type, `I` or `F`
    pub kind: String,
    pub channel: String,
    pub datetime: String,
    /// `event` or `snapshot`; empty means infer from the fields present
    pub pattern: String,
    pub raw: String,
    pub index: String,
}

impl DeclaredFields {
    /// Store a form field by its multipart name; unknown names are ignored
    pub fn set(&mut self, name: &str, value: String) -> bool {
        let slot = match name {
            "filename" => &mut self.filename,
            "timestamp" => &mut self.timestamp,
            "sign" => &mut self.sign,
            "imei" => &mut self.imei,
            "type" => &mut self.kind,
            "channel" => &mut self.channel,
            "datetime" => &mut self.datetime,
            "pattern" => &mut self.pattern,
            "raw" => &mut self.raw,
            "index" => &mut self.index,
            _ => return false,
        };
        *slot = value;
        true
    }
}

/// Final name chosen for an upload, with the template error if the template was not used
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedName {
    pub name: String,
    pub build_error: Option<NamingError>,
}

fn compiled(cell: &'static OnceLock<Regex>, re: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(re).expect("static pattern compiles"))
}

fn imei_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    compiled(&RE, r"^[0-9]{8,20}$")
}

fn short_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    compiled(&RE, r"^[0-9]{1,3}$")
}

fn hex_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    compiled(&RE, r"^[0-9A-Fa-f]+$")
}

/// Build the canonical name from the declared fields
pub fn build_canonical_name(
    fields: &DeclaredFields,
    original_filename: &str,
    content_type: Option<&str>,
) -> NamingResult<String> {
    build_canonical_name_at(fields, original_filename, content_type, Utc::now())
}

/// Same as [`build_canonical_name`] with an explicit clock for the missing-datetime case
pub fn build_canonical_name_at(
    fields: &DeclaredFields,
    original_filename: &str,
    content_type: Option<&str>,
    now: DateTime<Utc>,
) -> NamingResult<String> {
    let imei = fields.imei.trim();
    let kind = fields.kind.trim().to_ascii_uppercase();
    let channel = fields.channel.trim();
    let pattern = fields.pattern.trim().to_ascii_lowercase();
    let raw = fields.raw.trim();
    let index = fields.index.trim();

    let ext = derive_extension(original_filename, content_type);

    let event_fields = !imei.is_empty() && !kind.is_empty() && !channel.is_empty();
    if pattern == "event" || event_fields {
        if !event_fields {
            return Err(NamingError::InsufficientData);
        }
        check_imei(imei)?;
        if kind != "I" && kind != "F" {
            return Err(NamingError::InvalidField(
                "invalid type (expect I or F)".into(),
            ));
        }
        check_short_number("channel", channel)?;

        let at = parse_datetime(fields.datetime.trim(), now)?;
        return Ok(format!(
            "EVENT_{imei}_{EVENT_RESERVED}_{}_{kind}_{channel}{ext}",
            at.format("%Y_%m_%d_%H_%M_%S")
        ));
    }

    let snapshot_fields = !imei.is_empty() && !raw.is_empty();
    if pattern == "snapshot" || snapshot_fields {
        if !snapshot_fields {
            return Err(NamingError::InsufficientData);
        }
        check_imei(imei)?;
        if !hex_re().is_match(raw) {
            return Err(NamingError::InvalidField("invalid raw hex block".into()));
        }
        if !channel.is_empty() {
            check_short_number("channel", channel)?;
        }
        if !index.is_empty() {
            check_short_number("index", index)?;
        }
        return Ok(format!("{imei}_{raw}_{channel}_{index:0>2}{ext}"));
    }

    Err(NamingError::InsufficientData)
}

fn check_imei(imei: &str) -> NamingResult<()> {
    if imei_re().is_match(imei) {
        Ok(())
    } else {
        Err(NamingError::InvalidField("invalid imei".into()))
    }
}

fn check_short_number(field: &str, value: &str) -> NamingResult<()> {
    if short_number_re().is_match(value) {
        Ok(())
    } else {
        Err(NamingError::InvalidField(format!("invalid {field}")))
    }
}

/// Accepts 10-digit unix seconds, 14-digit `YYYYMMDDHHMMSS` or RFC 3339; empty is `now`
pub fn parse_datetime(value: &str, now: DateTime<Utc>) -> NamingResult<DateTime<Utc>> {
    if value.is_empty() {
        return Ok(now);
    }

    let all_digits = value.bytes().all(|b| b.is_ascii_digit());
    if all_digits && value.len() == 10 {
        if let Some(t) = value
            .parse::<i64>()
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        {
            return Ok(t);
        }
    }
    if all_digits && value.len() == 14 {
        if let Ok(t) = NaiveDateTime::parse_from_str(value, "%Y%m%d%H%M%S") {
            return Ok(t.and_utc());
        }
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Ok(t.with_timezone(&Utc));
    }

    Err(NamingError::InvalidField(format!(
        "unsupported datetime format: {value}"
    )))
}

/// Lowercased extension of `original_filename`, else one implied by the content type
pub fn derive_extension(original_filename: &str, content_type: Option<&str>) -> String {
    if let Some(ext) = Path::new(original_filename)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .filter(|e| !e.is_empty())
    {
        return format!(".{ext}");
    }

    let from_type = match content_type.map(str::trim) {
        Some("video/mp4") => Some(".mp4"),
        Some("video/MP2T") | Some("video/mp2t") | Some("application/octet-stream") => Some(".ts"),
        Some("image/jpeg") => Some(".jpg"),
        _ => None,
    };
    from_type.unwrap_or(DEFAULT_EXTENSION).to_string()
}

/// Strip directory components and enforce the length limit.
///
/// Trailing separators are ignored, so `dir/` names `dir`.
pub fn bare_filename(name: &str) -> NamingResult<String> {
    let base = name
        .trim()
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        return Err(NamingError::InvalidName);
    }
    if base.len() > MAX_FILENAME_LENGTH {
        return Err(NamingError::NameTooLong(base.len()));
    }
    Ok(base.to_string())
}

/// Pick the final name for an upload.
///
/// A non-blank `filename` override wins; otherwise the template result;
/// otherwise the sender's original filename. The result is always a bare,
/// length-checked filename.
pub fn resolve_final_name(
    fields: &DeclaredFields,
    original_filename: &str,
    content_type: Option<&str>,
) -> NamingResult<ResolvedName> {
    let built = build_canonical_name(fields, original_filename, content_type);
    let override_name = fields.filename.trim();

    let (candidate, build_error) = match (override_name.is_empty(), built) {
        (false, _) => (override_name.to_string(), None),
        (true, Ok(name)) => (name, None),
        (true, Err(e)) => (original_filename.to_string(), Some(e)),
    };

    Ok(ResolvedName {
        name: bare_filename(&candidate)?,
        build_error,
    })
}
