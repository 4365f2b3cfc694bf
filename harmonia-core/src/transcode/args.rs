use std::collections::HashSet;

use crate::config::TranscoderSection;

use super::capability::TranscoderCapabilities;
use super::types::{AssetRequest, DashAssetPaths, TranscodeQuality};

/// Argument categories that can be withdrawn after an unsupported-flag retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatedFlag {
    Streaming,
    Ldash,
    Reconnect,
}

const LOCAL_SEGMENT_SECONDS: u32 = 1;
const REMOTE_SEGMENT_SECONDS: u32 = 2;
const REMOTE_RW_TIMEOUT_MICROS: &str = "15000000";

const INIT_SEGMENT_TEMPLATE: &str = "init-$RepresentationID$.m4s";
const MEDIA_SEGMENT_TEMPLATE: &str = "chunk-$RepresentationID$-$Number%05d$.m4s";

/// Builds the complete transcoder argument vector for one asset request.
/// Pure: the same inputs always produce the same vector.
pub fn build_dash_args(
    request: &AssetRequest,
    paths: &DashAssetPaths,
    config: &TranscoderSection,
    capabilities: &TranscoderCapabilities,
    disabled: &HashSet<GatedFlag>,
) -> Vec<String> {
    let remote = request.is_remote_source();
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
    ];

    if remote && include_flag(capabilities.reconnect, GatedFlag::Reconnect, disabled) {
        args.extend([
            "-reconnect".into(),
            "1".into(),
            "-reconnect_streamed".into(),
            "1".into(),
            "-reconnect_on_network_error".into(),
            "1".into(),
            "-rw_timeout".into(),
            REMOTE_RW_TIMEOUT_MICROS.into(),
        ]);
    }

    args.extend(["-i".into(), request.source_path.clone()]);
    // one source stream mapped onto two representations
    args.extend(["-map".into(), "0:a".into(), "-map".into(), "0:a".into()]);
    args.extend(representation_args(request.quality));
    args.push("-vn".into());

    let segment_duration = config.segment_duration_seconds.unwrap_or(if remote {
        REMOTE_SEGMENT_SECONDS
    } else {
        LOCAL_SEGMENT_SECONDS
    });
    args.extend(["-f".into(), "dash".into()]);
    args.extend(["-seg_duration".into(), segment_duration.to_string()]);

    let streaming = include_flag(capabilities.streaming, GatedFlag::Streaming, disabled);
    if streaming {
        args.extend(["-streaming".into(), "1".into()]);
        // ldash only makes sense on top of streaming output
        if include_flag(capabilities.ldash, GatedFlag::Ldash, disabled) {
            args.extend(["-ldash".into(), "1".into()]);
        }
    }

    args.extend(["-use_template".into(), "1".into()]);
    args.extend(["-use_timeline".into(), "1".into()]);
    args.extend(["-adaptation_sets".into(), "id=0,streams=a".into()]);
    args.extend(["-init_seg_name".into(), INIT_SEGMENT_TEMPLATE.into()]);
    args.extend(["-media_seg_name".into(), MEDIA_SEGMENT_TEMPLATE.into()]);
    args.push(paths.manifest_path.to_string_lossy().to_string());
    args
}

fn include_flag(capability: Option<bool>, flag: GatedFlag, disabled: &HashSet<GatedFlag>) -> bool {
    // inconclusive probes include the flag optimistically
    capability != Some(false) && !disabled.contains(&flag)
}

fn representation_args(quality: TranscodeQuality) -> Vec<String> {
    let lossy = |first: &str, second: &str| -> Vec<String> {
        vec![
            "-c:a:0".into(),
            "aac".into(),
            "-b:a:0".into(),
            first.into(),
            "-c:a:1".into(),
            "aac".into(),
            "-b:a:1".into(),
            second.into(),
        ]
    };
    match quality {
        // lossless passthrough on the first leg: no bitrate flag
        TranscodeQuality::Original => vec![
            "-c:a:0".into(),
            "flac".into(),
            "-c:a:1".into(),
            "aac".into(),
            "-b:a:1".into(),
            "320k".into(),
        ],
        TranscodeQuality::High => lossy("320k", "192k"),
        TranscodeQuality::Medium => lossy("192k", "128k"),
        TranscodeQuality::Low => lossy("128k", "96k"),
    }
}
