use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use super::types::ValidationFailureReason;

/// Errors are `Clone` so concurrent callers joined on one in-flight build all
/// observe the same failure; io sources sit behind an `Arc` for that reason.
#[derive(Debug, Clone, Error)]
pub enum TranscodeError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("transcoder exited with status {status:?}: {stderr}")]
    Transcoder {
        status: Option<i32>,
        stderr: String,
    },
    #[error("failed to spawn transcoder {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("staged asset failed validation: {reason}")]
    StagedValidation {
        reason: ValidationFailureReason,
        segment: Option<String>,
    },
    #[error("failed to promote staged asset into {live}: {source}")]
    Promote {
        live: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("build task failed: {0}")]
    Background(String),
}

impl TranscodeError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TranscodeError::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }
}

pub type TranscodeResult<T> = Result<T, TranscodeError>;
