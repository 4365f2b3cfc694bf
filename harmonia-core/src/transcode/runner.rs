use std::process::Output;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::debug;

use super::args::GatedFlag;
use super::error::{TranscodeError, TranscodeResult};

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
        command.output().await
    }
}

/// What a failed transcoder invocation choked on, derived from the
/// `Unrecognized option '<flag>'` stderr signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranscoderFailure {
    UnsupportedStreaming,
    UnsupportedLdash,
    UnsupportedReconnect,
    Other,
}

impl TranscoderFailure {
    /// The argument category a retry should drop, if any.
    pub fn gated_flag(&self) -> Option<GatedFlag> {
        match self {
            TranscoderFailure::UnsupportedStreaming => Some(GatedFlag::Streaming),
            TranscoderFailure::UnsupportedLdash => Some(GatedFlag::Ldash),
            TranscoderFailure::UnsupportedReconnect => Some(GatedFlag::Reconnect),
            TranscoderFailure::Other => None,
        }
    }
}

pub fn classify_transcoder_failure(stderr: &str) -> TranscoderFailure {
    static SIGNATURE: OnceLock<Regex> = OnceLock::new();
    let signature =
        SIGNATURE.get_or_init(|| Regex::new(r"Unrecognized option '([^']+)'").unwrap());
    let Some(flag) = signature.captures(stderr).map(|capture| capture[1].to_string()) else {
        return TranscoderFailure::Other;
    };
    match flag.as_str() {
        "streaming" => TranscoderFailure::UnsupportedStreaming,
        "ldash" => TranscoderFailure::UnsupportedLdash,
        flag if flag.starts_with("reconnect") || flag == "rw_timeout" => {
            TranscoderFailure::UnsupportedReconnect
        }
        _ => TranscoderFailure::Other,
    }
}

/// Spawns the transcoder binary and resolves on its exit code; a non-zero
/// exit surfaces the collected stderr for classification.
pub struct TranscoderRunner {
    program: String,
    executor: Arc<dyn CommandExecutor>,
}

impl TranscoderRunner {
    pub fn new(program: impl Into<String>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            program: program.into(),
            executor,
        }
    }

    pub async fn run(&self, args: &[String]) -> TranscodeResult<()> {
        debug!(program = %self.program, args = %args.join(" "), "spawning transcoder");
        let mut command = Command::new(&self.program);
        for arg in args {
            command.arg(arg);
        }
        let output = self
            .executor
            .run(&mut command)
            .await
            .map_err(|source| TranscodeError::Spawn {
                program: self.program.clone(),
                source: Arc::new(source),
            })?;
        if output.status.success() {
            return Ok(());
        }
        Err(TranscodeError::Transcoder {
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_unsupported_flags() {
        assert_eq!(
            classify_transcoder_failure("Unrecognized option 'streaming'.\nError splitting"),
            TranscoderFailure::UnsupportedStreaming
        );
        assert_eq!(
            classify_transcoder_failure("Unrecognized option 'ldash'."),
            TranscoderFailure::UnsupportedLdash
        );
        assert_eq!(
            classify_transcoder_failure("Unrecognized option 'reconnect_on_network_error'."),
            TranscoderFailure::UnsupportedReconnect
        );
        assert_eq!(
            classify_transcoder_failure("Unrecognized option 'rw_timeout'."),
            TranscoderFailure::UnsupportedReconnect
        );
    }

    #[test]
    fn other_failures_are_not_retryable() {
        assert_eq!(
            classify_transcoder_failure("No such file or directory"),
            TranscoderFailure::Other
        );
        assert_eq!(
            classify_transcoder_failure("Unrecognized option 'frobnicate'."),
            TranscoderFailure::Other
        );
        assert!(classify_transcoder_failure("").gated_flag().is_none());
    }
}
