use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::fs;
use tracing::{info, warn};

use super::error::{TranscodeError, TranscodeResult};

/// `<outputDir>.previous.<timestamp>`
fn backup_path(live_dir: &Path) -> PathBuf {
    let mut name = live_dir.as_os_str().to_os_string();
    name.push(format!(".previous.{}", Utc::now().timestamp_millis()));
    PathBuf::from(name)
}

/// Swaps a fully-validated staged directory into the live path. The live
/// asset stays servable until the final rename; a failed promote restores
/// the backup so the cache key is never left without a usable asset.
pub async fn promote_staged(live_dir: &Path, staged_dir: &Path) -> TranscodeResult<()> {
    let live_exists = fs::try_exists(live_dir).await.unwrap_or(false);
    if !live_exists {
        return fs::rename(staged_dir, live_dir)
            .await
            .map_err(|source| TranscodeError::Promote {
                live: live_dir.to_path_buf(),
                source: Arc::new(source),
            });
    }

    let backup = backup_path(live_dir);
    fs::rename(live_dir, &backup)
        .await
        .map_err(|source| TranscodeError::Promote {
            live: live_dir.to_path_buf(),
            source: Arc::new(source),
        })?;

    if let Err(source) = fs::rename(staged_dir, live_dir).await {
        if let Err(restore) = fs::rename(&backup, live_dir).await {
            warn!(
                live = %live_dir.display(),
                backup = %backup.display(),
                error = %restore,
                "failed to restore backup after aborted promote"
            );
        }
        return Err(TranscodeError::Promote {
            live: live_dir.to_path_buf(),
            source: Arc::new(source),
        });
    }

    if let Err(err) = fs::remove_dir_all(&backup).await {
        // orphaned backup directory; harmless beyond disk usage
        warn!(backup = %backup.display(), error = %err, "failed to delete promote backup");
    }
    info!(live = %live_dir.display(), "promoted staged asset");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn write_dir(dir: &Path, marker: &str) {
        fs::create_dir_all(dir).await.unwrap();
        fs::write(dir.join("manifest.mpd"), marker).await.unwrap();
    }

    #[tokio::test]
    async fn promotes_directly_when_no_live_directory_exists() {
        let root = tempdir().unwrap();
        let live = root.path().join("live");
        let staged = root.path().join("staged");
        write_dir(&staged, "staged").await;

        promote_staged(&live, &staged).await.unwrap();

        assert_eq!(fs::read_to_string(live.join("manifest.mpd")).await.unwrap(), "staged");
        assert!(!staged.exists());
        // no backup directory was created
        let entries: Vec<_> = std::fs::read_dir(root.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["live"]);
    }

    #[tokio::test]
    async fn replaces_live_directory_and_removes_backup() {
        let root = tempdir().unwrap();
        let live = root.path().join("live");
        let staged = root.path().join("staged");
        write_dir(&live, "old").await;
        write_dir(&staged, "new").await;

        promote_staged(&live, &staged).await.unwrap();

        assert_eq!(fs::read_to_string(live.join("manifest.mpd")).await.unwrap(), "new");
        let backups: Vec<_> = std::fs::read_dir(root.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name.contains(".previous."))
            .collect();
        assert!(backups.is_empty(), "backup left behind: {backups:?}");
    }

    #[tokio::test]
    async fn failed_promote_restores_the_live_directory() {
        let root = tempdir().unwrap();
        let live = root.path().join("live");
        let staged = root.path().join("staged");
        write_dir(&live, "old").await;
        // staged directory deliberately missing: the second rename must fail

        let err = promote_staged(&live, &staged).await.unwrap_err();
        assert!(matches!(err, TranscodeError::Promote { .. }));

        // rollback restored the original contents
        assert_eq!(fs::read_to_string(live.join("manifest.mpd")).await.unwrap(), "old");
        let backups: Vec<_> = std::fs::read_dir(root.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name.contains(".previous."))
            .collect();
        assert!(backups.is_empty());
    }
}
