//! Capture record model
//!
//! A `CaptureRecord` describes one capture event and where its artifact lives.
//! Records are immutable once persisted; both stores serialise them the same way
//! so a record read back from either one compares equal to what was written.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::{LedgerError, Result};

/// Stable unique identifier of a capture. Never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaptureId(String);

impl CaptureId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaptureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CaptureId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CaptureId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl ToSql for CaptureId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        self.0.to_sql()
    }
}

impl FromSql for CaptureId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        String::column_result(value).map(CaptureId)
    }
}

/// Container/codec of the captured artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    Jpeg,
    Png,
    Webp,
    Mp4,
    Other,
}

impl MediaFormat {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Self::Jpeg,
            "png" => Self::Png,
            "webp" => Self::Webp,
            "mp4" => Self::Mp4,
            _ => Self::Other,
        }
    }
}

/// Scalar value for free-form metadata keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetaValue {
    /// JSON has no NaN or infinity; such a float would come back as `null`.
    pub fn is_encodable(&self) -> bool {
        match self {
            Self::Float(f) => f.is_finite(),
            _ => true,
        }
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Keys owned by the typed fields of [`CaptureMetadata`].
pub const RESERVED_METADATA_KEYS: &[&str] =
    &["width", "height", "format", "quality", "resolution", "mood", "notes"];

/// Typed capture metadata with an open map of scalars for anything else.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<MediaFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, MetaValue>,
}

impl CaptureMetadata {
    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self.resolution = Some(format!("{}x{}", width, height));
        self
    }

    /// Add a free-form key. Keys owned by a typed field and non-finite floats
    /// are rejected.
    pub fn with_extra(mut self, key: &str, value: impl Into<MetaValue>) -> Result<Self> {
        let value = value.into();
        check_extra(key, &value)?;
        self.extra.insert(key.to_string(), value);
        Ok(self)
    }

    /// Checks `extra` as filled directly, since the field is public. A record
    /// that passes serialises to JSON that decodes back to an equal value.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in &self.extra {
            check_extra(key, value)?;
        }
        Ok(())
    }
}

fn check_extra(key: &str, value: &MetaValue) -> Result<()> {
    if RESERVED_METADATA_KEYS.contains(&key) {
        return Err(LedgerError::InvalidRecord(format!(
            "metadata key '{}' is reserved for a typed field",
            key
        )));
    }
    if !value.is_encodable() {
        return Err(LedgerError::InvalidRecord(format!(
            "metadata key '{}' holds a non-finite number",
            key
        )));
    }
    Ok(())
}

/// One capture event. Immutable once handed to the recorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub id: CaptureId,
    #[serde(with = "utc_micros")]
    pub captured_at: DateTime<Utc>,
    pub session_id: String,
    /// Empty for metadata-only captures.
    #[serde(default)]
    pub artifact_path: PathBuf,
    pub camera_index: u32,
    #[serde(default)]
    pub metadata: CaptureMetadata,
}

impl CaptureRecord {
    /// New record stamped now with a fresh id.
    pub fn new(session_id: &str, artifact_path: impl Into<PathBuf>, camera_index: u32) -> Self {
        Self {
            id: CaptureId::generate(),
            captured_at: normalize_timestamp(Utc::now()),
            session_id: session_id.to_string(),
            artifact_path: artifact_path.into(),
            camera_index,
            metadata: CaptureMetadata::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<CaptureId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn captured_at(mut self, ts: DateTime<Utc>) -> Self {
        self.captured_at = normalize_timestamp(ts);
        self
    }

    pub fn with_metadata(mut self, metadata: CaptureMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Structural checks both stores rely on.
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().is_empty() {
            return Err(LedgerError::InvalidRecord("empty capture id".into()));
        }
        if self.artifact_path.to_str().is_none() {
            return Err(LedgerError::InvalidRecord(format!(
                "artifact path is not valid UTF-8: {}",
                self.artifact_path.display()
            )));
        }
        self.metadata.validate()
    }

    /// True when the artifact is absent by design or present on disk.
    pub fn is_complete(&self) -> bool {
        self.artifact_path.as_os_str().is_empty() || self.artifact_path.exists()
    }
}

impl fmt::Display for CaptureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (camera: {}, at: {}, artifact: {})",
            self.id,
            self.camera_index,
            format_timestamp(&self.captured_at),
            self.artifact_path.display()
        )
    }
}

/// Truncate to the precision both stores keep.
pub fn normalize_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

/// Fixed-width RFC 3339 (`2025-12-12T07:45:12.123456Z`); sorts chronologically as text.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    Ok(normalize_timestamp(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc)))
}

mod utc_micros {
    use super::*;

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}
