use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::resolver::CacheResolver;

use super::types::{DashAssetPaths, ValidationFailureReason, ValidationMode, ValidationResult};

/// Segments smaller than this cannot hold a playable fMP4 fragment.
pub const MIN_SEGMENT_BYTES: u64 = 1024;

/// The `moof`/`mdat` markers of an audio segment sit well within this window.
const PROBE_WINDOW_BYTES: u64 = 16 * 1024;

fn media_segment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^chunk-\d+-\d+\.m4s$").unwrap())
}

fn is_media_segment(name: &str) -> bool {
    !name.starts_with("init-") && media_segment_pattern().is_match(name)
}

fn contains_box(window: &[u8], marker: &[u8; 4]) -> bool {
    window.windows(4).any(|bytes| bytes == marker)
}

/// Inspects a cache key's on-disk manifest and segment set. Never fails with
/// an error: every problem collapses into a `ValidationResult`.
pub struct AssetValidator {
    resolver: Arc<dyn CacheResolver>,
}

impl AssetValidator {
    pub fn new(resolver: Arc<dyn CacheResolver>) -> Self {
        Self { resolver }
    }

    pub async fn validate(&self, paths: &DashAssetPaths, mode: ValidationMode) -> ValidationResult {
        let manifest_ok = fs::metadata(&paths.manifest_path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        if !manifest_ok {
            return ValidationResult::failure(ValidationFailureReason::ManifestMissing, None, 0);
        }

        let segments = match self.resolver.list_segments(paths).await {
            Ok(segments) => segments,
            Err(err) => {
                debug!(cache_key = %paths.cache_key, error = %err, "segment listing failed");
                return ValidationResult::failure(ValidationFailureReason::Unknown, None, 0);
            }
        };
        if segments.is_empty() {
            return ValidationResult::failure(ValidationFailureReason::SegmentsMissing, None, 0);
        }
        let segment_count = segments.len();

        let media_indices: Vec<usize> = segments
            .iter()
            .enumerate()
            .filter(|(_, path)| {
                path.file_name()
                    .map(|name| is_media_segment(&name.to_string_lossy()))
                    .unwrap_or(false)
            })
            .map(|(index, _)| index)
            .collect();
        let tail_media_index = media_indices.last().copied();
        let probe_indices: HashSet<usize> = match mode {
            ValidationMode::Full => media_indices.iter().copied().collect(),
            ValidationMode::Startup => media_indices
                .first()
                .into_iter()
                .chain(media_indices.last())
                .copied()
                .collect(),
        };

        for (index, segment) in segments.iter().enumerate() {
            let name = segment
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            let metadata = match fs::metadata(segment).await {
                Ok(metadata) => metadata,
                Err(_) => {
                    return ValidationResult::failure(
                        ValidationFailureReason::SegmentNotFile,
                        Some(name),
                        segment_count,
                    );
                }
            };
            if !metadata.is_file() {
                return ValidationResult::failure(
                    ValidationFailureReason::SegmentNotFile,
                    Some(name),
                    segment_count,
                );
            }
            if metadata.len() < MIN_SEGMENT_BYTES {
                // an undersized tail segment is still playable up to its end
                if tail_media_index == Some(index) {
                    return ValidationResult::recoverable_failure(
                        ValidationFailureReason::SegmentTooSmall,
                        Some(name),
                        segment_count,
                    );
                }
                return ValidationResult::failure(
                    ValidationFailureReason::SegmentTooSmall,
                    Some(name),
                    segment_count,
                );
            }
            if !probe_indices.contains(&index) {
                continue;
            }
            match probe_segment_boxes(segment).await {
                Ok(None) => {}
                Ok(Some(reason)) => {
                    return ValidationResult::failure(reason, Some(name), segment_count);
                }
                Err(_) => {
                    return ValidationResult::failure(
                        ValidationFailureReason::Unknown,
                        Some(name),
                        segment_count,
                    );
                }
            }
        }

        ValidationResult::valid(segment_count)
    }
}

async fn probe_segment_boxes(
    segment: &Path,
) -> std::io::Result<Option<ValidationFailureReason>> {
    let file = fs::File::open(segment).await?;
    let mut window = Vec::with_capacity(PROBE_WINDOW_BYTES as usize);
    file.take(PROBE_WINDOW_BYTES).read_to_end(&mut window).await?;
    if !contains_box(&window, b"moof") {
        return Ok(Some(ValidationFailureReason::SegmentMissingMoof));
    }
    if !contains_box(&window, b"mdat") {
        return Ok(Some(ValidationFailureReason::SegmentMissingMdat));
    }
    Ok(None)
}
