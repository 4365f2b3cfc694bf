use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::HarmoniaConfig;
use crate::lock::{BuildLock, InMemoryBuildLock, LockError, RedisBuildLock};
use crate::resolver::{CacheResolver, HashedCacheResolver};

use super::capability::TranscoderCapabilities;
use super::error::{TranscodeError, TranscodeResult};
use super::generator::DashAssetGenerator;
use super::runner::{CommandExecutor, SystemCommandExecutor};
use super::stage;
use super::types::{
    AssetRequest, AssetState, BuildFailure, BuildInFlightStatus, BuildResult, CacheKey,
    DashAssetPaths, RecoverableValidationFailure, ValidationFailureReason, ValidationMode,
};
use super::validate::AssetValidator;

type SharedBuild = Shared<BoxFuture<'static, TranscodeResult<BuildResult>>>;

/// Deduplicates and drives asset builds for one service instance. The
/// in-flight, state, and failure maps are private to this instance; all
/// cross-instance coordination goes through the filesystem and the
/// distributed lock, never through shared memory.
pub struct BuildCoordinator {
    resolver: Arc<dyn CacheResolver>,
    lock: Arc<dyn BuildLock>,
    generator: Arc<DashAssetGenerator>,
    validator: Arc<AssetValidator>,
    lock_namespace: String,
    lock_ttl: Duration,
    in_flight: Mutex<HashMap<CacheKey, SharedBuild>>,
    states: Mutex<HashMap<CacheKey, AssetState>>,
    failures: Mutex<HashMap<CacheKey, BuildFailure>>,
    background: Mutex<HashMap<CacheKey, Vec<JoinHandle<()>>>>,
}

impl BuildCoordinator {
    pub fn new(
        resolver: Arc<dyn CacheResolver>,
        lock: Arc<dyn BuildLock>,
        generator: Arc<DashAssetGenerator>,
        validator: Arc<AssetValidator>,
        lock_namespace: impl Into<String>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            resolver,
            lock,
            generator,
            validator,
            lock_namespace: lock_namespace.into(),
            lock_ttl,
            in_flight: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            background: Mutex::new(HashMap::new()),
        }
    }

    /// Production wiring: hashed resolver, redis lock (in-memory when no
    /// redis url is configured is a deliberate non-goal; operators run redis),
    /// system executor, one capability probe per process.
    pub async fn from_config(config: &HarmoniaConfig) -> Result<Self, LockError> {
        let executor: Arc<dyn CommandExecutor> = Arc::new(SystemCommandExecutor);
        let resolver = Arc::new(HashedCacheResolver::from_config(&config.cache));
        let lock: Arc<dyn BuildLock> = if config.lock.redis_url.is_empty() {
            warn!("no redis url configured; build locks are per-process only");
            Arc::new(InMemoryBuildLock::new())
        } else {
            Arc::new(RedisBuildLock::connect(&config.lock.redis_url)?)
        };
        let capabilities =
            TranscoderCapabilities::probe_cached(&config.transcoder.ffmpeg_path, &executor).await;
        let generator = Arc::new(DashAssetGenerator::new(
            config.transcoder.clone(),
            capabilities,
            executor,
        ));
        let validator = Arc::new(AssetValidator::new(resolver.clone()));
        Ok(Self::new(
            resolver,
            lock,
            generator,
            validator,
            config.lock.namespace.clone(),
            Duration::from_secs(config.lock.ttl_seconds),
        ))
    }

    fn lock_key(&self, key: &CacheKey) -> String {
        format!("{}:dash-build-lock:{}", self.lock_namespace, key)
    }

    /// Returns a cached asset without spawning a transcoder when possible;
    /// otherwise builds exactly once per cache key within this process, and
    /// advisorily once across instances.
    pub async fn ensure_local_dash_segments(
        self: &Arc<Self>,
        request: &AssetRequest,
    ) -> TranscodeResult<BuildResult> {
        let paths = self.resolver.resolve(request);
        let key = paths.cache_key.clone();

        // joining an in-flight build skips every lock and cache check
        if let Some(build) = self.existing_in_flight(&key) {
            debug!(cache_key = %key, "joining in-flight build");
            return build.await;
        }

        let manifest_exists = fs::try_exists(&paths.manifest_path).await.unwrap_or(false);
        let marked_invalid = matches!(self.stored_state(&key), Some(AssetState::Invalid));

        if manifest_exists && !marked_invalid {
            let startup = self
                .validator
                .validate(&paths, ValidationMode::Startup)
                .await;
            if startup.valid {
                debug!(cache_key = %key, segments = startup.segment_count, "serving cached dash asset");
                self.spawn_full_validation(request.clone(), paths.clone());
                self.spawn_prune(key.clone());
                return Ok(BuildResult::from_paths(&paths, request));
            }
            if startup.recoverable {
                // degraded but servable: repair in the background instead of
                // blocking this and future callers on a rebuild
                info!(
                    cache_key = %key,
                    reason = ?startup.reason,
                    segment = ?startup.segment_name,
                    "cached asset degraded; serving while repair runs"
                );
                self.set_state(
                    &key,
                    AssetState::Degraded(RecoverableValidationFailure {
                        reason: startup.reason.unwrap_or(ValidationFailureReason::Unknown),
                        segment_name: startup.segment_name.clone(),
                        segment_count: startup.segment_count,
                        detected_at: Utc::now(),
                    }),
                );
                self.spawn_repair(request.clone(), key.clone());
                self.spawn_prune(key.clone());
                return Ok(BuildResult::from_paths(&paths, request));
            }
            warn!(
                cache_key = %key,
                reason = ?startup.reason,
                segment = ?startup.segment_name,
                "startup validation failed; rebuilding"
            );
        }

        self.start_or_join_build(request.clone(), paths).await
    }

    /// Rebuilds an asset in isolation and atomically swaps it in, keeping the
    /// live asset servable throughout. Never rejects: failures are recorded
    /// and queryable via [`build_failure`](Self::build_failure), so
    /// fire-and-forget callers do not leak unhandled errors.
    pub async fn force_regenerate_dash_segments(self: &Arc<Self>, request: &AssetRequest) {
        let paths = self.resolver.resolve(request);
        let key = paths.cache_key.clone();

        if self.has_in_flight_build(&key) {
            debug!(cache_key = %key, "skipping force regenerate; local build already in flight");
            return;
        }

        let lock_key = self.lock_key(&key);
        let token = Uuid::new_v4().to_string();
        match self.lock.try_acquire(&lock_key, &token, self.lock_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                // two promotes racing for one rename target are unsafe
                info!(cache_key = %key, "force regenerate skipped; another instance holds the build lock");
                return;
            }
            Err(err) => {
                warn!(cache_key = %key, error = %err, "force regenerate skipped; lock backend unavailable");
                return;
            }
        }

        let outcome = self.regenerate_staged(request, &paths).await;
        if let Err(err) = self.lock.release(&lock_key, &token).await {
            warn!(cache_key = %key, error = %err, "failed to release distributed build lock");
        }
        match outcome {
            Ok(()) => {
                info!(cache_key = %key, "regenerated dash asset in place");
                self.set_state(&key, AssetState::Valid);
                self.clear_build_failure(&key);
            }
            Err(err) => {
                error!(cache_key = %key, error = %err, "force regenerate failed");
                self.record_build_failure(&key, &err);
            }
        }
    }

    pub fn has_in_flight_build(&self, key: &CacheKey) -> bool {
        self.in_flight.lock().unwrap().contains_key(key)
    }

    /// Short-circuits the distributed probe whenever a local build is in
    /// flight, avoiding a redundant backend round trip.
    pub async fn build_in_flight_status(&self, key: &CacheKey) -> BuildInFlightStatus {
        let local_in_flight = self.has_in_flight_build(key);
        let distributed_in_flight = if local_in_flight {
            false
        } else {
            match self.lock.is_held(&self.lock_key(key)).await {
                Ok(held) => held,
                Err(err) => {
                    warn!(cache_key = %key, error = %err, "distributed in-flight probe failed");
                    false
                }
            }
        };
        BuildInFlightStatus {
            local_in_flight,
            distributed_in_flight,
            in_flight: local_in_flight || distributed_in_flight,
        }
    }

    pub fn build_failure(&self, key: &CacheKey) -> Option<BuildFailure> {
        self.failures.lock().unwrap().get(key).cloned()
    }

    pub fn recoverable_validation_failure(
        &self,
        key: &CacheKey,
    ) -> Option<RecoverableValidationFailure> {
        match self.stored_state(key) {
            Some(AssetState::Degraded(failure)) => Some(failure),
            _ => None,
        }
    }

    /// Lifecycle of a cache key as seen by this instance.
    pub fn asset_state(&self, key: &CacheKey) -> AssetState {
        if self.has_in_flight_build(key) {
            return AssetState::Building;
        }
        self.stored_state(key).unwrap_or(AssetState::Absent)
    }

    /// Awaits every background task spawned for the key (full validation,
    /// repair, prune). Tests use this instead of sleeping.
    pub async fn drain_background_tasks(&self, key: &CacheKey) {
        let handles = self
            .background
            .lock()
            .unwrap()
            .remove(key)
            .unwrap_or_default();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(cache_key = %key, error = %err, "background task panicked");
            }
        }
    }

    /// Drains all tracked background work; called on shutdown.
    pub async fn shutdown(&self) {
        let keys: Vec<CacheKey> = self.background.lock().unwrap().keys().cloned().collect();
        for key in keys {
            self.drain_background_tasks(&key).await;
        }
    }

    async fn start_or_join_build(
        self: &Arc<Self>,
        request: AssetRequest,
        paths: DashAssetPaths,
    ) -> TranscodeResult<BuildResult> {
        let key = paths.cache_key.clone();
        let build = {
            let mut in_flight = self.in_flight.lock().unwrap();
            if let Some(existing) = in_flight.get(&key) {
                existing.clone()
            } else {
                let this = Arc::clone(self);
                let task_key = key.clone();
                // spawned so the build (and its lock release) completes even
                // if every caller is cancelled
                let handle = tokio::spawn(async move {
                    let outcome = this.run_locked_build(&request, &paths).await;
                    this.in_flight.lock().unwrap().remove(&task_key);
                    match &outcome {
                        Ok(_) => {
                            this.set_state(&task_key, AssetState::Valid);
                            this.clear_build_failure(&task_key);
                        }
                        Err(err) => {
                            error!(cache_key = %task_key, error = %err, "dash build failed");
                            this.record_build_failure(&task_key, err);
                            // leave no partial output behind for the retry
                            if let Err(cleanup) = this.resolver.remove_asset(&paths).await {
                                warn!(cache_key = %task_key, error = %cleanup, "failed to remove partial build output");
                            }
                        }
                    }
                    outcome
                });
                let build: SharedBuild = async move {
                    match handle.await {
                        Ok(outcome) => outcome,
                        Err(err) => Err(TranscodeError::Background(err.to_string())),
                    }
                }
                .boxed()
                .shared();
                in_flight.insert(key.clone(), build.clone());
                build
            }
        };
        build.await
    }

    async fn run_locked_build(
        self: &Arc<Self>,
        request: &AssetRequest,
        paths: &DashAssetPaths,
    ) -> TranscodeResult<BuildResult> {
        // clear stale or invalidated output before spawning the transcoder
        if let Err(err) = self.resolver.remove_asset(paths).await {
            warn!(cache_key = %paths.cache_key, error = %err, "failed to remove stale asset before rebuild");
        }

        let lock_key = self.lock_key(&paths.cache_key);
        let token = Uuid::new_v4().to_string();
        let acquired = match self.lock.try_acquire(&lock_key, &token, self.lock_ttl).await {
            Ok(true) => true,
            Ok(false) => {
                // availability over strict exclusivity: a duplicate build on
                // another instance is tolerated
                warn!(cache_key = %paths.cache_key, "distributed build lock held elsewhere; proceeding with local rebuild");
                false
            }
            Err(err) => {
                warn!(cache_key = %paths.cache_key, error = %err, "lock backend unavailable; continuing without cross-instance coordination");
                false
            }
        };

        let result = self.generator.generate(request, paths).await;

        if acquired {
            if let Err(err) = self.lock.release(&lock_key, &token).await {
                warn!(cache_key = %paths.cache_key, error = %err, "failed to release distributed build lock");
            }
        }
        result
    }

    async fn regenerate_staged(
        self: &Arc<Self>,
        request: &AssetRequest,
        live: &DashAssetPaths,
    ) -> TranscodeResult<()> {
        let staged = self.resolver.staging_paths(live);
        debug!(cache_key = %live.cache_key, staged = %staged.cache_key, "building staged replacement");

        if let Err(err) = self.generator.generate(request, &staged).await {
            self.discard_staged(&staged).await;
            return Err(err);
        }

        let validation = self.validator.validate(&staged, ValidationMode::Full).await;
        if !validation.valid {
            self.discard_staged(&staged).await;
            return Err(TranscodeError::StagedValidation {
                reason: validation
                    .reason
                    .unwrap_or(ValidationFailureReason::Unknown),
                segment: validation.segment_name,
            });
        }

        stage::promote_staged(&live.output_dir, &staged.output_dir).await
    }

    async fn discard_staged(&self, staged: &DashAssetPaths) {
        if let Err(err) = self.resolver.remove_asset(staged).await {
            warn!(cache_key = %staged.cache_key, error = %err, "failed to discard staged asset");
        }
    }

    /// Exhaustive validation behind a cache hit. Fatal findings invalidate
    /// the key and trigger regeneration; recoverable findings record the
    /// degradation and schedule repair without disturbing current callers.
    fn spawn_full_validation(self: &Arc<Self>, request: AssetRequest, paths: DashAssetPaths) {
        let this = Arc::clone(self);
        let key = paths.cache_key.clone();
        self.spawn_tracked(key, async move {
            let result = this.validator.validate(&paths, ValidationMode::Full).await;
            if result.valid {
                return;
            }
            let key = paths.cache_key.clone();
            if result.recoverable {
                info!(
                    cache_key = %key,
                    reason = ?result.reason,
                    segment = ?result.segment_name,
                    "cached asset degraded; scheduling background repair"
                );
                this.set_state(
                    &key,
                    AssetState::Degraded(RecoverableValidationFailure {
                        reason: result.reason.unwrap_or(ValidationFailureReason::Unknown),
                        segment_name: result.segment_name.clone(),
                        segment_count: result.segment_count,
                        detected_at: Utc::now(),
                    }),
                );
            } else {
                warn!(
                    cache_key = %key,
                    reason = ?result.reason,
                    segment = ?result.segment_name,
                    "full validation failed; invalidating cached asset"
                );
                this.set_state(&key, AssetState::Invalid);
            }
            this.force_regenerate_dash_segments(&request).await;
        });
    }

    fn spawn_repair(self: &Arc<Self>, request: AssetRequest, key: CacheKey) {
        let this = Arc::clone(self);
        self.spawn_tracked(key, async move {
            this.force_regenerate_dash_segments(&request).await;
        });
    }

    fn spawn_prune(self: &Arc<Self>, key: CacheKey) {
        let this = Arc::clone(self);
        let keep = key.clone();
        self.spawn_tracked(key, async move {
            match this.resolver.prune_stale(&keep).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "pruned stale dash cache entries"),
                Err(err) => warn!(error = %err, "cache prune failed"),
            }
        });
    }

    fn spawn_tracked<F>(&self, key: CacheKey, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.background
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .push(handle);
    }

    fn existing_in_flight(&self, key: &CacheKey) -> Option<SharedBuild> {
        self.in_flight.lock().unwrap().get(key).cloned()
    }

    fn stored_state(&self, key: &CacheKey) -> Option<AssetState> {
        self.states.lock().unwrap().get(key).cloned()
    }

    fn set_state(&self, key: &CacheKey, state: AssetState) {
        self.states.lock().unwrap().insert(key.clone(), state);
    }

    fn record_build_failure(&self, key: &CacheKey, error: &TranscodeError) {
        self.failures.lock().unwrap().insert(
            key.clone(),
            BuildFailure {
                cache_key: key.clone(),
                message: error.to_string(),
                occurred_at: Utc::now(),
            },
        );
    }

    fn clear_build_failure(&self, key: &CacheKey) {
        self.failures.lock().unwrap().remove(key);
    }
}
