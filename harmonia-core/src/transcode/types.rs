use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Deterministic identifier for one (track, quality, profile, source-version)
/// combination's on-disk asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeQuality {
    Original,
    High,
    Medium,
    Low,
}

impl TranscodeQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscodeQuality::Original => "original",
            TranscodeQuality::High => "high",
            TranscodeQuality::Medium => "medium",
            TranscodeQuality::Low => "low",
        }
    }
}

impl std::str::FromStr for TranscodeQuality {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "original" => Ok(TranscodeQuality::Original),
            "high" => Ok(TranscodeQuality::High),
            "medium" => Ok(TranscodeQuality::Medium),
            "low" => Ok(TranscodeQuality::Low),
            other => Err(format!("unknown quality: {other}")),
        }
    }
}

impl fmt::Display for TranscodeQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const DEFAULT_MANIFEST_PROFILE: &str = "dash-ondemand";

/// Immutable description of one asset to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRequest {
    pub track_id: String,
    /// Local filesystem path or remote http(s) URL handed to the transcoder.
    pub source_path: String,
    pub source_modified: DateTime<Utc>,
    pub quality: TranscodeQuality,
    pub manifest_profile: String,
}

impl AssetRequest {
    pub fn new(
        track_id: impl Into<String>,
        source_path: impl Into<String>,
        source_modified: DateTime<Utc>,
        quality: TranscodeQuality,
    ) -> Self {
        Self {
            track_id: track_id.into(),
            source_path: source_path.into(),
            source_modified,
            quality,
            manifest_profile: DEFAULT_MANIFEST_PROFILE.to_string(),
        }
    }

    pub fn with_manifest_profile(mut self, profile: impl Into<String>) -> Self {
        self.manifest_profile = profile.into();
        self
    }

    pub fn is_remote_source(&self) -> bool {
        Url::parse(&self.source_path)
            .map(|url| matches!(url.scheme(), "http" | "https"))
            .unwrap_or(false)
    }
}

/// Where one cache key's asset lives on disk. Derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashAssetPaths {
    pub cache_key: CacheKey,
    pub output_dir: PathBuf,
    pub manifest_path: PathBuf,
}

/// Returned to callers once an asset is known good.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildResult {
    pub cache_key: CacheKey,
    pub output_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest_profile: String,
    pub quality: TranscodeQuality,
}

impl BuildResult {
    pub fn from_paths(paths: &DashAssetPaths, request: &AssetRequest) -> Self {
        Self {
            cache_key: paths.cache_key.clone(),
            output_dir: paths.output_dir.clone(),
            manifest_path: paths.manifest_path.clone(),
            manifest_profile: request.manifest_profile.clone(),
            quality: request.quality,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Cheap gate for immediate reuse: byte-probes only the first and last
    /// media segment.
    Startup,
    /// Byte-probes every media segment.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationFailureReason {
    ManifestMissing,
    SegmentsMissing,
    SegmentNotFile,
    SegmentTooSmall,
    SegmentMissingMoof,
    SegmentMissingMdat,
    Unknown,
}

impl ValidationFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationFailureReason::ManifestMissing => "manifest_missing",
            ValidationFailureReason::SegmentsMissing => "segments_missing",
            ValidationFailureReason::SegmentNotFile => "segment_not_file",
            ValidationFailureReason::SegmentTooSmall => "segment_too_small",
            ValidationFailureReason::SegmentMissingMoof => "segment_missing_moof",
            ValidationFailureReason::SegmentMissingMdat => "segment_missing_mdat",
            ValidationFailureReason::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ValidationFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub reason: Option<ValidationFailureReason>,
    pub segment_name: Option<String>,
    pub segment_count: usize,
    /// Degraded but still servable; background repair is sufficient.
    pub recoverable: bool,
}

impl ValidationResult {
    pub fn valid(segment_count: usize) -> Self {
        Self {
            valid: true,
            reason: None,
            segment_name: None,
            segment_count,
            recoverable: false,
        }
    }

    pub fn failure(
        reason: ValidationFailureReason,
        segment_name: Option<String>,
        segment_count: usize,
    ) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            segment_name,
            segment_count,
            recoverable: false,
        }
    }

    pub fn recoverable_failure(
        reason: ValidationFailureReason,
        segment_name: Option<String>,
        segment_count: usize,
    ) -> Self {
        Self {
            recoverable: true,
            ..Self::failure(reason, segment_name, segment_count)
        }
    }
}

/// Last build error recorded for a cache key; cleared on the next success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildFailure {
    pub cache_key: CacheKey,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// A degraded-but-usable asset scheduled for background repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoverableValidationFailure {
    pub reason: ValidationFailureReason,
    pub segment_name: Option<String>,
    pub segment_count: usize,
    pub detected_at: DateTime<Utc>,
}

/// Lifecycle of one cache key as seen by a single coordinator instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetState {
    Absent,
    Building,
    Valid,
    Degraded(RecoverableValidationFailure),
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BuildInFlightStatus {
    pub local_in_flight: bool,
    pub distributed_in_flight: bool,
    pub in_flight: bool,
}
