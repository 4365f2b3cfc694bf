use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::TranscoderSection;

use super::args::{build_dash_args, GatedFlag};
use super::capability::TranscoderCapabilities;
use super::error::{TranscodeError, TranscodeResult};
use super::runner::{classify_transcoder_failure, CommandExecutor, TranscoderRunner};
use super::types::{AssetRequest, BuildResult, DashAssetPaths, TranscodeQuality};

/// The dash muxer tags lossless passthrough with the encoder name; players
/// expect the canonical fMP4 codec string.
const LOSSLESS_CODEC_TAG: &str = "codecs=\"flac\"";
const CANONICAL_LOSSLESS_TAG: &str = "codecs=\"fLaC\"";

/// Runs the transcoder for one asset, withdrawing at most one argument per
/// unsupported-flag category before giving up.
pub struct DashAssetGenerator {
    config: TranscoderSection,
    capabilities: TranscoderCapabilities,
    runner: TranscoderRunner,
}

impl DashAssetGenerator {
    pub fn new(
        config: TranscoderSection,
        capabilities: TranscoderCapabilities,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        let runner = TranscoderRunner::new(config.ffmpeg_path.clone(), executor);
        Self {
            config,
            capabilities,
            runner,
        }
    }

    pub async fn generate(
        &self,
        request: &AssetRequest,
        paths: &DashAssetPaths,
    ) -> TranscodeResult<BuildResult> {
        fs::create_dir_all(&paths.output_dir)
            .await
            .map_err(|source| TranscodeError::io(&paths.output_dir, source))?;

        let mut disabled: HashSet<GatedFlag> = HashSet::new();
        loop {
            let args = build_dash_args(request, paths, &self.config, &self.capabilities, &disabled);
            match self.runner.run(&args).await {
                Ok(()) => break,
                Err(TranscodeError::Transcoder { status, stderr }) => {
                    let failure = classify_transcoder_failure(&stderr);
                    match failure.gated_flag() {
                        Some(flag) if !disabled.contains(&flag) => {
                            warn!(
                                cache_key = %paths.cache_key,
                                ?flag,
                                "transcoder rejected option; retrying without it"
                            );
                            disabled.insert(flag);
                        }
                        _ => return Err(TranscodeError::Transcoder { status, stderr }),
                    }
                }
                Err(other) => return Err(other),
            }
        }

        if request.quality == TranscodeQuality::Original {
            patch_lossless_codec_tag(&paths.manifest_path).await?;
        }
        info!(cache_key = %paths.cache_key, quality = %request.quality, "dash asset built");
        Ok(BuildResult::from_paths(paths, request))
    }
}

async fn patch_lossless_codec_tag(manifest_path: &Path) -> TranscodeResult<()> {
    let manifest = fs::read_to_string(manifest_path)
        .await
        .map_err(|source| TranscodeError::io(manifest_path, source))?;
    if !manifest.contains(LOSSLESS_CODEC_TAG) {
        return Ok(());
    }
    let patched = manifest.replace(LOSSLESS_CODEC_TAG, CANONICAL_LOSSLESS_TAG);
    fs::write(manifest_path, patched)
        .await
        .map_err(|source| TranscodeError::io(manifest_path, source))?;
    debug!(manifest = %manifest_path.display(), "rewrote lossless codec tag");
    Ok(())
}
