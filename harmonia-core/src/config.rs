use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HarmoniaConfig {
    pub transcoder: TranscoderSection,
    pub cache: CacheSection,
    pub lock: LockSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscoderSection {
    pub ffmpeg_path: String,
    /// Overrides the 1s (local) / 2s (remote) segment duration defaults.
    pub segment_duration_seconds: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    pub root_dir: String,
    pub retention_hours: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockSection {
    pub redis_url: String,
    pub namespace: String,
    pub ttl_seconds: u64,
}

pub fn load_harmonia_config<P: AsRef<Path>>(path: P) -> Result<HarmoniaConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
