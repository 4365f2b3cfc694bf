pub mod config;
pub mod error;
pub mod lock;
pub mod resolver;
pub mod transcode;

pub use config::{
    load_harmonia_config, CacheSection, HarmoniaConfig, LockSection, TranscoderSection,
};
pub use error::{ConfigError, Result};
pub use lock::{BuildLock, InMemoryBuildLock, LockError, RedisBuildLock};
pub use resolver::{CacheResolver, HashedCacheResolver, MANIFEST_NAME};
pub use transcode::{
    AssetRequest, AssetState, AssetValidator, BuildCoordinator, BuildFailure, BuildInFlightStatus,
    BuildResult, CacheKey, CommandExecutor, DashAssetGenerator, SystemCommandExecutor,
    TranscodeError, TranscodeQuality, TranscodeResult, TranscoderCapabilities, ValidationMode,
};
