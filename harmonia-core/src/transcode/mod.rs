pub mod args;
mod capability;
mod coordinator;
mod error;
mod generator;
mod runner;
mod stage;
mod types;
mod validate;

pub use args::{build_dash_args, GatedFlag};
pub use capability::TranscoderCapabilities;
pub use coordinator::BuildCoordinator;
pub use error::{TranscodeError, TranscodeResult};
pub use generator::DashAssetGenerator;
pub use runner::{
    classify_transcoder_failure, CommandExecutor, SystemCommandExecutor, TranscoderFailure,
    TranscoderRunner,
};
pub use stage::promote_staged;
pub use types::{
    AssetRequest, AssetState, BuildFailure, BuildInFlightStatus, BuildResult, CacheKey,
    DashAssetPaths, RecoverableValidationFailure, TranscodeQuality, ValidationFailureReason,
    ValidationMode, ValidationResult, DEFAULT_MANIFEST_PROFILE,
};
pub use validate::{AssetValidator, MIN_SEGMENT_BYTES};
