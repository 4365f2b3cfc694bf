use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use hex::encode as hex_encode;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::CacheSection;
use crate::transcode::{AssetRequest, CacheKey, DashAssetPaths};

pub const MANIFEST_NAME: &str = "manifest.mpd";

const STAGING_MARKER: &str = "-staging-";

/// Maps asset requests to cache keys and on-disk locations, and owns the
/// bulk operations over the shared cache store (listing, removal, pruning).
#[async_trait]
pub trait CacheResolver: Send + Sync {
    /// Deterministic: two requests with equal semantic content resolve to the
    /// same cache key.
    fn resolve(&self, request: &AssetRequest) -> DashAssetPaths;

    fn paths_for_key(&self, key: &CacheKey) -> DashAssetPaths;

    /// Derives a fresh temporary cache key whose output directory can later
    /// be renamed over the live one.
    fn staging_paths(&self, live: &DashAssetPaths) -> DashAssetPaths;

    /// Segment files under the asset's output directory, sorted by name.
    async fn list_segments(&self, paths: &DashAssetPaths) -> io::Result<Vec<PathBuf>>;

    async fn remove_asset(&self, paths: &DashAssetPaths) -> io::Result<()>;

    /// Removes cache entries older than the retention window, keeping the
    /// given key. Returns the number of entries removed.
    async fn prune_stale(&self, keep: &CacheKey) -> io::Result<usize>;
}

#[derive(Debug, Clone)]
pub struct HashedCacheResolver {
    root: PathBuf,
    retention: Duration,
}

impl HashedCacheResolver {
    pub fn new(root: impl Into<PathBuf>, retention: Duration) -> Self {
        Self {
            root: root.into(),
            retention,
        }
    }

    pub fn from_config(section: &CacheSection) -> Self {
        Self::new(
            &section.root_dir,
            Duration::from_secs(section.retention_hours * 3600),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn derive_key(request: &AssetRequest) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(request.track_id.as_bytes());
        hasher.update(b"|");
        hasher.update(request.quality.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(request.manifest_profile.as_bytes());
        hasher.update(b"|");
        hasher.update(request.source_modified.timestamp_millis().to_be_bytes());
        let digest = hex_encode(hasher.finalize());
        CacheKey::new(&digest[..32])
    }
}

#[async_trait]
impl CacheResolver for HashedCacheResolver {
    fn resolve(&self, request: &AssetRequest) -> DashAssetPaths {
        self.paths_for_key(&Self::derive_key(request))
    }

    fn paths_for_key(&self, key: &CacheKey) -> DashAssetPaths {
        let output_dir = self.root.join(key.as_str());
        let manifest_path = output_dir.join(MANIFEST_NAME);
        DashAssetPaths {
            cache_key: key.clone(),
            output_dir,
            manifest_path,
        }
    }

    fn staging_paths(&self, live: &DashAssetPaths) -> DashAssetPaths {
        let staged = CacheKey::new(format!(
            "{}{}{}",
            live.cache_key,
            STAGING_MARKER,
            Uuid::new_v4().simple()
        ));
        self.paths_for_key(&staged)
    }

    async fn list_segments(&self, paths: &DashAssetPaths) -> io::Result<Vec<PathBuf>> {
        let mut segments = Vec::new();
        let mut entries = fs::read_dir(&paths.output_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|ext| ext == "m4s").unwrap_or(false) {
                segments.push(path);
            }
        }
        segments.sort();
        Ok(segments)
    }

    async fn remove_asset(&self, paths: &DashAssetPaths) -> io::Result<()> {
        match fs::remove_dir_all(&paths.output_dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn prune_stale(&self, keep: &CacheKey) -> io::Result<usize> {
        let root = self.root.clone();
        let retention = self.retention;
        let keep = keep.as_str().to_string();
        tokio::task::spawn_blocking(move || {
            let mut removed = 0usize;
            for entry in WalkDir::new(&root).min_depth(1).max_depth(1) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(_) => continue,
                };
                if !entry.file_type().is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if name == keep || name.starts_with(&format!("{keep}{STAGING_MARKER}")) {
                    continue;
                }
                let stale = entry
                    .metadata()
                    .ok()
                    .and_then(|meta| meta.modified().ok())
                    .and_then(|modified| modified.elapsed().ok())
                    .map(|age| age > retention)
                    .unwrap_or(false);
                if stale && std::fs::remove_dir_all(entry.path()).is_ok() {
                    debug!(entry = %name, "pruned stale cache entry");
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
    }
}
