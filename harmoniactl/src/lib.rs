use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use thiserror::Error;

use harmonia_core::lock::LockError;
use harmonia_core::resolver::{CacheResolver, HashedCacheResolver};
use harmonia_core::transcode::{
    AssetRequest, AssetValidator, BuildCoordinator, CommandExecutor, SystemCommandExecutor,
    TranscodeError, TranscodeQuality, TranscoderCapabilities, ValidationMode, ValidationResult,
};
use harmonia_core::load_harmonia_config;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] harmonia_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("transcode error: {0}")]
    Transcode(#[from] TranscodeError),
    #[error("lock backend error: {0}")]
    Lock(#[from] LockError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("asset failed validation: {0}")]
    ValidationFailed(String),
    #[error("regeneration failed: {0}")]
    RegenerationFailed(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Harmonia DASH cache control interface", long_about = None)]
pub struct Cli {
    /// Path to the main harmonia.toml
    #[arg(long, default_value = "configs/harmonia.toml")]
    pub config: PathBuf,
    /// Override for the dash cache root directory
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Interrogate the configured transcoder binary for gated options
    Probe,
    /// Report cache and build state for one asset
    Status(AssetArgs),
    /// Validate an asset's on-disk manifest and segments
    Validate(ValidateArgs),
    /// Build an asset (or serve it from cache) and print its location
    Build(AssetArgs),
    /// Rebuild an asset in staging and atomically swap it in
    Regenerate(AssetArgs),
    /// Remove cache entries past the retention window, keeping one asset
    Prune(AssetArgs),
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug, Clone)]
pub struct AssetArgs {
    /// Track identifier
    #[arg(long)]
    pub track_id: String,
    /// Source file path or http(s) url
    #[arg(long)]
    pub source: String,
    /// Source modification time, RFC 3339; defaults to the file's mtime
    #[arg(long)]
    pub modified: Option<String>,
    /// Quality tier: original, high, medium, low
    #[arg(long, default_value = "high")]
    pub quality: String,
    /// Manifest profile override
    #[arg(long)]
    pub profile: Option<String>,
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub asset: AssetArgs,
    /// Byte-probe every media segment instead of only the first and last
    #[arg(long, default_value_t = false)]
    pub full: bool,
}

pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        let name = command.get_name().to_string();
        clap_complete::generate(*shell, &mut command, name, &mut std::io::stdout());
        return Ok(());
    }

    let mut config = load_harmonia_config(&cli.config)?;
    if let Some(dir) = &cli.cache_dir {
        config.cache.root_dir = dir.display().to_string();
    }

    match &cli.command {
        Commands::Probe => {
            let executor: Arc<dyn CommandExecutor> = Arc::new(SystemCommandExecutor);
            let capabilities =
                TranscoderCapabilities::probe(&config.transcoder.ffmpeg_path, &executor).await;
            let report = ProbeReport {
                program: config.transcoder.ffmpeg_path.clone(),
                streaming: capabilities.streaming,
                ldash: capabilities.ldash,
                reconnect: capabilities.reconnect,
            };
            render(&report, cli.format)
        }
        Commands::Status(args) => {
            let request = asset_request(args)?;
            let resolver = Arc::new(HashedCacheResolver::from_config(&config.cache));
            let validator = AssetValidator::new(resolver.clone());
            let coordinator = Arc::new(BuildCoordinator::from_config(&config).await?);
            let paths = resolver.resolve(&request);
            let validation = validator.validate(&paths, ValidationMode::Startup).await;
            let in_flight = coordinator.build_in_flight_status(&paths.cache_key).await;
            let report = StatusReport {
                cache_key: paths.cache_key.to_string(),
                output_dir: paths.output_dir.clone(),
                manifest_present: paths.manifest_path.is_file(),
                validation,
                distributed_build_in_flight: in_flight.distributed_in_flight,
            };
            render(&report, cli.format)
        }
        Commands::Validate(args) => {
            let request = asset_request(&args.asset)?;
            let resolver = Arc::new(HashedCacheResolver::from_config(&config.cache));
            let validator = AssetValidator::new(resolver.clone());
            let paths = resolver.resolve(&request);
            let mode = if args.full {
                ValidationMode::Full
            } else {
                ValidationMode::Startup
            };
            let validation = validator.validate(&paths, mode).await;
            let report = ValidateReport {
                cache_key: paths.cache_key.to_string(),
                validation: validation.clone(),
            };
            render(&report, cli.format)?;
            if validation.valid {
                Ok(())
            } else {
                Err(AppError::ValidationFailed(
                    validation
                        .reason
                        .map(|reason| reason.to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                ))
            }
        }
        Commands::Build(args) => {
            let request = asset_request(args)?;
            let coordinator = Arc::new(BuildCoordinator::from_config(&config).await?);
            let result = coordinator.ensure_local_dash_segments(&request).await?;
            coordinator.shutdown().await;
            render(&result, cli.format)
        }
        Commands::Regenerate(args) => {
            let request = asset_request(args)?;
            let resolver = HashedCacheResolver::from_config(&config.cache);
            let coordinator = Arc::new(BuildCoordinator::from_config(&config).await?);
            coordinator.force_regenerate_dash_segments(&request).await;
            let paths = resolver.resolve(&request);
            let failure = coordinator.build_failure(&paths.cache_key);
            let report = RegenerateReport {
                cache_key: paths.cache_key.to_string(),
                failure: failure.as_ref().map(|failure| failure.message.clone()),
            };
            render(&report, cli.format)?;
            match failure {
                Some(failure) => Err(AppError::RegenerationFailed(failure.message)),
                None => Ok(()),
            }
        }
        Commands::Prune(args) => {
            let request = asset_request(args)?;
            let resolver = Arc::new(HashedCacheResolver::from_config(&config.cache));
            let paths = resolver.resolve(&request);
            let removed = resolver.prune_stale(&paths.cache_key).await?;
            render(&PruneReport { removed }, cli.format)
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }
}

fn asset_request(args: &AssetArgs) -> Result<AssetRequest> {
    let quality: TranscodeQuality = args
        .quality
        .parse()
        .map_err(AppError::InvalidArgument)?;

    let modified: DateTime<Utc> = match &args.modified {
        Some(value) => DateTime::parse_from_rfc3339(value)
            .map_err(|err| AppError::InvalidArgument(format!("--modified: {err}")))?
            .with_timezone(&Utc),
        None => {
            let metadata = std::fs::metadata(&args.source).map_err(|err| {
                AppError::InvalidArgument(format!(
                    "--modified is required when the source is not a local file ({err})"
                ))
            })?;
            DateTime::<Utc>::from(metadata.modified()?)
        }
    };

    let mut request = AssetRequest::new(&args.track_id, &args.source, modified, quality);
    if let Some(profile) = &args.profile {
        request = request.with_manifest_profile(profile);
    }
    Ok(request)
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug, Serialize)]
pub struct ProbeReport {
    pub program: String,
    pub streaming: Option<bool>,
    pub ldash: Option<bool>,
    pub reconnect: Option<bool>,
}

impl DisplayFallback for ProbeReport {
    fn display(&self) -> String {
        let describe = |value: Option<bool>| match value {
            Some(true) => "supported",
            Some(false) => "unsupported",
            None => "unknown",
        };
        format!(
            "{}\n  streaming: {}\n  ldash: {}\n  reconnect: {}",
            self.program,
            describe(self.streaming),
            describe(self.ldash),
            describe(self.reconnect)
        )
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub cache_key: String,
    pub output_dir: PathBuf,
    pub manifest_present: bool,
    pub validation: ValidationResult,
    pub distributed_build_in_flight: bool,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("key: {}", self.cache_key),
            format!("dir: {}", self.output_dir.display()),
            format!("manifest: {}", if self.manifest_present { "present" } else { "absent" }),
            format!("valid: {}", self.validation.valid),
        ];
        if let Some(reason) = self.validation.reason {
            lines.push(format!("reason: {reason}"));
        }
        if self.distributed_build_in_flight {
            lines.push("build in flight on another instance".to_string());
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ValidateReport {
    pub cache_key: String,
    pub validation: ValidationResult,
}

impl DisplayFallback for ValidateReport {
    fn display(&self) -> String {
        if self.validation.valid {
            return format!(
                "{}: valid ({} segments)",
                self.cache_key, self.validation.segment_count
            );
        }
        let reason = self
            .validation
            .reason
            .map(|reason| reason.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        match &self.validation.segment_name {
            Some(segment) => format!("{}: invalid — {reason} ({segment})", self.cache_key),
            None => format!("{}: invalid — {reason}", self.cache_key),
        }
    }
}

impl DisplayFallback for harmonia_core::transcode::BuildResult {
    fn display(&self) -> String {
        format!(
            "{} ({})\n{}",
            self.cache_key,
            self.quality,
            self.manifest_path.display()
        )
    }
}

#[derive(Debug, Serialize)]
pub struct RegenerateReport {
    pub cache_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl DisplayFallback for RegenerateReport {
    fn display(&self) -> String {
        match &self.failure {
            Some(message) => format!("{}: failed — {message}", self.cache_key),
            None => format!("{}: regenerated", self.cache_key),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PruneReport {
    pub removed: usize,
}

impl DisplayFallback for PruneReport {
    fn display(&self) -> String {
        format!("removed {} stale cache entries", self.removed)
    }
}
