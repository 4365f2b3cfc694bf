use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::runner::CommandExecutor;

/// What the transcoder binary advertised for the options we gate on.
/// `None` means the probe was inconclusive; the argument builder then
/// includes the flag optimistically and relies on retry-without-flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscoderCapabilities {
    pub streaming: Option<bool>,
    pub ldash: Option<bool>,
    pub reconnect: Option<bool>,
}

static PROBED: OnceCell<TranscoderCapabilities> = OnceCell::const_new();

impl TranscoderCapabilities {
    pub fn assume_all() -> Self {
        Self {
            streaming: Some(true),
            ldash: Some(true),
            reconnect: Some(true),
        }
    }

    pub fn unknown() -> Self {
        Self {
            streaming: None,
            ldash: None,
            reconnect: None,
        }
    }

    /// Interrogates the binary's dash muxer and http protocol help output.
    pub async fn probe(program: &str, executor: &Arc<dyn CommandExecutor>) -> Self {
        let muxer_help = help_output(program, &["-hide_banner", "-h", "muxer=dash"], executor).await;
        let protocol_help =
            help_output(program, &["-hide_banner", "-h", "protocol=http"], executor).await;
        let capabilities = Self {
            streaming: muxer_help.as_deref().map(|help| help.contains("-streaming")),
            ldash: muxer_help.as_deref().map(|help| help.contains("-ldash")),
            reconnect: protocol_help
                .as_deref()
                .map(|help| help.contains("reconnect")),
        };
        debug!(?capabilities, "probed transcoder capabilities");
        capabilities
    }

    /// Process-wide probe: the binary is interrogated once, subsequent calls
    /// return the cached result.
    pub async fn probe_cached(program: &str, executor: &Arc<dyn CommandExecutor>) -> Self {
        *PROBED
            .get_or_init(|| Self::probe(program, executor))
            .await
    }
}

async fn help_output(
    program: &str,
    args: &[&str],
    executor: &Arc<dyn CommandExecutor>,
) -> Option<String> {
    let mut command = Command::new(program);
    for arg in args {
        command.arg(arg);
    }
    match executor.run(&mut command).await {
        Ok(output) if output.status.success() => {
            let mut text = String::from_utf8_lossy(&output.stdout).to_string();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            Some(text)
        }
        Ok(output) => {
            warn!(
                program,
                status = output.status.code(),
                "capability probe command failed"
            );
            None
        }
        Err(err) => {
            warn!(program, error = %err, "failed to spawn capability probe");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};

    struct HelpExecutor {
        muxer_help: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl CommandExecutor for HelpExecutor {
        async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
            let args: Vec<String> = command
                .as_std()
                .get_args()
                .map(|arg| arg.to_string_lossy().to_string())
                .collect();
            let code = if self.fail { 1 } else { 0 };
            let stdout = if args.iter().any(|arg| arg == "muxer=dash") {
                self.muxer_help
            } else {
                "reconnect  reconnect_streamed  reconnect_on_network_error"
            };
            Ok(Output {
                status: ExitStatus::from_raw(code),
                stdout: stdout.as_bytes().to_vec(),
                stderr: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn probe_reads_help_output() {
        let executor: Arc<dyn CommandExecutor> = Arc::new(HelpExecutor {
            muxer_help: "-seg_duration <duration>\n-streaming <boolean>\n-ldash <boolean>",
            fail: false,
        });
        let caps = TranscoderCapabilities::probe("ffmpeg", &executor).await;
        assert_eq!(caps.streaming, Some(true));
        assert_eq!(caps.ldash, Some(true));
        assert_eq!(caps.reconnect, Some(true));
    }

    #[tokio::test]
    async fn probe_reports_missing_options() {
        let executor: Arc<dyn CommandExecutor> = Arc::new(HelpExecutor {
            muxer_help: "-seg_duration <duration>",
            fail: false,
        });
        let caps = TranscoderCapabilities::probe("ffmpeg", &executor).await;
        assert_eq!(caps.streaming, Some(false));
        assert_eq!(caps.ldash, Some(false));
    }

    #[tokio::test]
    async fn failed_probe_is_inconclusive() {
        let executor: Arc<dyn CommandExecutor> = Arc::new(HelpExecutor {
            muxer_help: "",
            fail: true,
        });
        let caps = TranscoderCapabilities::probe("ffmpeg", &executor).await;
        assert_eq!(caps, TranscoderCapabilities::unknown());
    }
}
