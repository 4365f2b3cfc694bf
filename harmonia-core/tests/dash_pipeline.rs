//! End-to-end coordinator tests against a scripted transcoder: cache reuse,
//! in-flight dedupe, lock behaviour, staged regeneration, and degraded-asset
//! repair, all on a real temp-dir cache.

use std::path::PathBuf;
use std::process::{ExitStatus, Output};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::Semaphore;

use harmonia_core::lock::{BuildLock, InMemoryBuildLock, LockError};
use harmonia_core::resolver::{CacheResolver, HashedCacheResolver};
use harmonia_core::transcode::{
    AssetRequest, AssetState, AssetValidator, BuildCoordinator, CommandExecutor,
    DashAssetGenerator, TranscodeError, TranscodeQuality, TranscoderCapabilities,
    ValidationFailureReason,
};
use harmonia_core::config::TranscoderSection;

const SEGMENT_NAMES: [&str; 8] = [
    "init-0.m4s",
    "init-1.m4s",
    "chunk-0-00001.m4s",
    "chunk-0-00002.m4s",
    "chunk-0-00003.m4s",
    "chunk-1-00001.m4s",
    "chunk-1-00002.m4s",
    "chunk-1-00003.m4s",
];

fn segment_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    if len >= 120 {
        bytes[8..12].copy_from_slice(b"moof");
        bytes[116..120].copy_from_slice(b"mdat");
    }
    bytes
}

#[derive(Clone, Copy, PartialEq)]
enum FakeMode {
    /// Write a complete, validating asset.
    Valid,
    /// Write the asset but leave the final media segment truncated.
    TruncatedTail,
    /// Exit non-zero without writing anything.
    Fail,
}

/// Stands in for ffmpeg: writes the manifest plus a fixed segment set at the
/// output location named by the argument vector.
struct FakeTranscoder {
    spawns: AtomicUsize,
    mode: Mutex<FakeMode>,
    gate: Option<Arc<Semaphore>>,
}

impl FakeTranscoder {
    fn new() -> Self {
        Self {
            spawns: AtomicUsize::new(0),
            mode: Mutex::new(FakeMode::Valid),
            gate: None,
        }
    }

    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }

    fn set_mode(&self, mode: FakeMode) {
        *self.mode.lock().unwrap() = mode;
    }

    fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandExecutor for FakeTranscoder {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }

        let mode = *self.mode.lock().unwrap();
        if mode == FakeMode::Fail {
            use std::os::unix::process::ExitStatusExt;
            return Ok(Output {
                status: ExitStatus::from_raw(256),
                stdout: Vec::new(),
                stderr: b"Invalid data found when processing input".to_vec(),
            });
        }

        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect();
        let manifest = PathBuf::from(args.last().unwrap());
        let output_dir = manifest.parent().unwrap();
        std::fs::write(
            &manifest,
            "<MPD><Representation id=\"0\" codecs=\"mp4a.40.2\"/></MPD>",
        )?;
        for name in SEGMENT_NAMES {
            let truncated = mode == FakeMode::TruncatedTail && name == "chunk-1-00003.m4s";
            let len = if truncated { 64 } else { 2048 };
            std::fs::write(output_dir.join(name), segment_bytes(len))?;
        }

        use std::os::unix::process::ExitStatusExt;
        Ok(Output {
            status: ExitStatus::from_raw(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }
}

/// Counts distributed-probe round trips on top of the in-memory lock.
struct CountingLock {
    inner: InMemoryBuildLock,
    is_held_calls: AtomicUsize,
}

impl CountingLock {
    fn new() -> Self {
        Self {
            inner: InMemoryBuildLock::new(),
            is_held_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BuildLock for CountingLock {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        self.inner.try_acquire(key, token, ttl).await
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        self.inner.release(key, token).await
    }

    async fn is_held(&self, key: &str) -> Result<bool, LockError> {
        self.is_held_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.is_held(key).await
    }
}

/// Lock backend that is permanently down.
struct FailingLock;

#[async_trait]
impl BuildLock for FailingLock {
    async fn try_acquire(&self, _: &str, _: &str, _: Duration) -> Result<bool, LockError> {
        Err(LockError::Backend("connection refused".into()))
    }

    async fn release(&self, _: &str, _: &str) -> Result<bool, LockError> {
        Err(LockError::Backend("connection refused".into()))
    }

    async fn is_held(&self, _: &str) -> Result<bool, LockError> {
        Err(LockError::Backend("connection refused".into()))
    }
}

struct Harness {
    coordinator: Arc<BuildCoordinator>,
    executor: Arc<FakeTranscoder>,
    resolver: Arc<HashedCacheResolver>,
    lock: Arc<dyn BuildLock>,
    root: TempDir,
}

impl Harness {
    fn request(&self) -> AssetRequest {
        AssetRequest::new(
            "track-77",
            "/music/track-77.flac",
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            TranscodeQuality::High,
        )
    }

    fn paths(&self) -> harmonia_core::transcode::DashAssetPaths {
        self.resolver.resolve(&self.request())
    }

    fn lock_key(&self) -> String {
        format!("harmonia:dash-build-lock:{}", self.paths().cache_key)
    }

    fn staging_dirs(&self) -> Vec<String> {
        std::fs::read_dir(self.root.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name.contains("-staging-"))
            .collect()
    }
}

fn harness_with(executor: Arc<FakeTranscoder>, lock: Arc<dyn BuildLock>) -> Harness {
    let root = TempDir::new().unwrap();
    let resolver = Arc::new(HashedCacheResolver::new(
        root.path(),
        Duration::from_secs(3600),
    ));
    let generator = Arc::new(DashAssetGenerator::new(
        TranscoderSection {
            ffmpeg_path: "ffmpeg".into(),
            segment_duration_seconds: None,
        },
        TranscoderCapabilities::assume_all(),
        executor.clone(),
    ));
    let validator = Arc::new(AssetValidator::new(resolver.clone()));
    let coordinator = Arc::new(BuildCoordinator::new(
        resolver.clone(),
        lock.clone(),
        generator,
        validator,
        "harmonia",
        Duration::from_secs(600),
    ));
    Harness {
        coordinator,
        executor,
        resolver,
        lock,
        root,
    }
}

fn harness() -> Harness {
    harness_with(
        Arc::new(FakeTranscoder::new()),
        Arc::new(InMemoryBuildLock::new()),
    )
}

#[tokio::test]
async fn second_request_is_served_from_cache_without_a_spawn() {
    let h = harness();
    let request = h.request();

    let built = h
        .coordinator
        .ensure_local_dash_segments(&request)
        .await
        .unwrap();
    assert!(built.manifest_path.is_file());
    assert_eq!(built.quality, TranscodeQuality::High);
    assert_eq!(h.executor.spawns(), 1);
    h.coordinator.drain_background_tasks(&built.cache_key).await;

    let cached = h
        .coordinator
        .ensure_local_dash_segments(&request)
        .await
        .unwrap();
    assert_eq!(cached, built);
    assert_eq!(h.executor.spawns(), 1, "cache hit must not spawn");
    h.coordinator.drain_background_tasks(&built.cache_key).await;
    assert_eq!(h.executor.spawns(), 1, "full validation passed; no rebuild");
    assert_eq!(
        h.coordinator.asset_state(&built.cache_key),
        AssetState::Valid
    );
}

#[tokio::test]
async fn concurrent_requests_share_a_single_build() {
    let h = harness();
    let request = h.request();

    let (a, b) = tokio::join!(
        h.coordinator.ensure_local_dash_segments(&request),
        h.coordinator.ensure_local_dash_segments(&request),
    );
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(h.executor.spawns(), 1);
}

#[tokio::test]
async fn foreign_lock_holder_does_not_block_serving() {
    let h = harness();
    let request = h.request();
    assert!(h
        .lock
        .try_acquire(&h.lock_key(), "foreign", Duration::from_secs(600))
        .await
        .unwrap());

    let built = h
        .coordinator
        .ensure_local_dash_segments(&request)
        .await
        .unwrap();
    assert!(built.manifest_path.is_file());
    assert_eq!(h.executor.spawns(), 1);
    // the foreign token was never stolen or released
    assert!(h.lock.is_held(&h.lock_key()).await.unwrap());
}

#[tokio::test]
async fn unavailable_lock_backend_does_not_fail_the_build() {
    let h = harness_with(Arc::new(FakeTranscoder::new()), Arc::new(FailingLock));
    let built = h
        .coordinator
        .ensure_local_dash_segments(&h.request())
        .await
        .unwrap();
    assert!(built.manifest_path.is_file());
}

#[tokio::test]
async fn force_regenerate_promotes_a_fresh_asset() {
    let h = harness();
    let request = h.request();

    h.coordinator.force_regenerate_dash_segments(&request).await;

    let paths = h.paths();
    assert!(paths.manifest_path.is_file());
    assert!(h.staging_dirs().is_empty(), "staged dir left behind");
    assert!(h.coordinator.build_failure(&paths.cache_key).is_none());
    assert_eq!(
        h.coordinator.asset_state(&paths.cache_key),
        AssetState::Valid
    );
}

#[tokio::test]
async fn invalid_staged_output_never_replaces_the_live_asset() {
    let h = harness();
    let request = h.request();
    let built = h
        .coordinator
        .ensure_local_dash_segments(&request)
        .await
        .unwrap();
    h.coordinator.drain_background_tasks(&built.cache_key).await;

    h.executor.set_mode(FakeMode::TruncatedTail);
    h.coordinator.force_regenerate_dash_segments(&request).await;

    let failure = h
        .coordinator
        .build_failure(&built.cache_key)
        .expect("staged validation failure must be recorded");
    assert!(failure.message.contains("staged asset failed validation"));
    assert!(h.staging_dirs().is_empty(), "rejected staged dir not discarded");

    // the live asset is intact, tail segment included
    assert!(built.manifest_path.is_file());
    let tail = built.output_dir.join("chunk-1-00003.m4s");
    assert_eq!(std::fs::metadata(&tail).unwrap().len(), 2048);
}

#[tokio::test]
async fn degraded_asset_is_served_and_repaired_in_the_background() {
    let h = harness();
    let request = h.request();
    let built = h
        .coordinator
        .ensure_local_dash_segments(&request)
        .await
        .unwrap();
    h.coordinator.drain_background_tasks(&built.cache_key).await;

    // truncate the tail media segment below the playable minimum
    let tail = built.output_dir.join("chunk-1-00003.m4s");
    std::fs::write(&tail, segment_bytes(64)).unwrap();

    let served = h
        .coordinator
        .ensure_local_dash_segments(&request)
        .await
        .unwrap();
    assert_eq!(served.cache_key, built.cache_key);
    assert_eq!(h.executor.spawns(), 1, "degraded asset served as-is");
    let degraded = h
        .coordinator
        .recoverable_validation_failure(&built.cache_key)
        .expect("degradation must be recorded");
    assert_eq!(degraded.reason, ValidationFailureReason::SegmentTooSmall);
    assert_eq!(degraded.segment_name.as_deref(), Some("chunk-1-00003.m4s"));

    h.coordinator.drain_background_tasks(&built.cache_key).await;
    assert_eq!(h.executor.spawns(), 2, "repair rebuild ran in the background");
    assert_eq!(
        h.coordinator.asset_state(&built.cache_key),
        AssetState::Valid
    );
    assert!(h
        .coordinator
        .recoverable_validation_failure(&built.cache_key)
        .is_none());
    assert_eq!(std::fs::metadata(&tail).unwrap().len(), 2048);
}

#[tokio::test]
async fn build_failures_are_recorded_and_cleared_on_the_next_success() {
    let h = harness();
    let request = h.request();
    let key = h.paths().cache_key;

    h.executor.set_mode(FakeMode::Fail);
    let err = h
        .coordinator
        .ensure_local_dash_segments(&request)
        .await
        .unwrap_err();
    assert!(matches!(err, TranscodeError::Transcoder { .. }));
    let failure = h.coordinator.build_failure(&key).expect("failure recorded");
    assert!(failure.message.contains("Invalid data"));
    assert!(!h.paths().output_dir.exists(), "partial output not removed");

    h.executor.set_mode(FakeMode::Valid);
    h.coordinator
        .ensure_local_dash_segments(&request)
        .await
        .unwrap();
    assert!(h.coordinator.build_failure(&key).is_none());
    assert_eq!(h.executor.spawns(), 2);
    h.coordinator.shutdown().await;
}

#[tokio::test]
async fn in_flight_status_skips_the_distributed_probe_during_local_builds() {
    let gate = Arc::new(Semaphore::new(0));
    let lock = Arc::new(CountingLock::new());
    let h = harness_with(Arc::new(FakeTranscoder::gated(gate.clone())), lock.clone());
    let request = h.request();
    let key = h.paths().cache_key;

    let coordinator = h.coordinator.clone();
    let pending = {
        let request = request.clone();
        tokio::spawn(async move { coordinator.ensure_local_dash_segments(&request).await })
    };
    while !h.coordinator.has_in_flight_build(&key) {
        tokio::task::yield_now().await;
    }

    let status = h.coordinator.build_in_flight_status(&key).await;
    assert!(status.local_in_flight);
    assert!(status.in_flight);
    assert_eq!(lock.is_held_calls.load(Ordering::SeqCst), 0);

    gate.add_permits(1);
    pending.await.unwrap().unwrap();

    let status = h.coordinator.build_in_flight_status(&key).await;
    assert!(!status.in_flight);
    assert_eq!(lock.is_held_calls.load(Ordering::SeqCst), 1);

    // a foreign holder shows up as a distributed build
    assert!(h
        .lock
        .try_acquire(&h.lock_key(), "foreign", Duration::from_secs(600))
        .await
        .unwrap());
    let status = h.coordinator.build_in_flight_status(&key).await;
    assert!(!status.local_in_flight);
    assert!(status.distributed_in_flight);
    assert!(status.in_flight);
}
