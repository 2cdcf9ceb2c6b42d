//! Errors - エラー型と分類
//!
//! - `TransferError`: chunked transfer の失敗（remote / local を区別）
//! - `WrapperError`: 1 回の起動を止める致命的エラー
//! - `RollupError`: ConcurrentRollup の失敗

use std::path::PathBuf;

use thiserror::Error;

use super::outcome::INTERNAL_ERROR_EXIT_CODE;

/// ErrorKind は致命的エラーの運用分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Blob service / network failure.
    Transfer,
    /// Disk or permission failure on this host.
    LocalIo,
    /// The wrapped process never started.
    Launch,
    /// Job result submission failed.
    Reporting,
    /// Envelope could not be written to the boundary.
    Serialization,
    Cancelled,
    Config,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("blob service error: {0}")]
    Remote(String),

    #[error("local i/o error on {path}: {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("source not found: {0}")]
    MissingSource(PathBuf),

    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote(message.into())
    }

    /// Wrap an I/O error, keeping "file is absent" distinguishable.
    pub fn local(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::MissingSource(path)
        } else {
            Self::LocalIo { path, source }
        }
    }

    /// I/O failure on a path we write to; absence is not special there.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::LocalIo {
            path: path.into(),
            source,
        }
    }

    pub fn is_missing_source(&self) -> bool {
        matches!(self, Self::MissingSource(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Remote(_) => ErrorKind::Transfer,
            Self::LocalIo { .. } | Self::MissingSource(_) => ErrorKind::LocalIo,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

#[derive(Debug, Error)]
pub enum WrapperError {
    #[error("transfer of `{name}` failed: {source}")]
    Transfer {
        name: String,
        #[source]
        source: TransferError,
    },

    /// Several declared outputs failed; all of them were attempted.
    #[error("{} output upload(s) failed: {}", .0.len(), summarize(.0))]
    Uploads(Vec<WrapperError>),

    #[error("declared output `{name}` missing at {path} after unsuccessful exit")]
    MissingOutput { name: String, path: PathBuf },

    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("job result submission failed for job {job_id}: {reason}")]
    Reporting { job_id: String, reason: String },

    #[error("failed to write result envelope: {0}")]
    Serialization(String),

    #[error("failed to forward stderr: {0}")]
    Forward(#[source] std::io::Error),

    #[error("invocation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),
}

fn summarize(errors: &[WrapperError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl WrapperError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transfer { source, .. } => source.kind(),
            Self::Uploads(errors) => errors
                .first()
                .map(Self::kind)
                .unwrap_or(ErrorKind::Transfer),
            Self::MissingOutput { .. } | Self::Forward(_) => ErrorKind::LocalIo,
            Self::Launch { .. } => ErrorKind::Launch,
            Self::Reporting { .. } => ErrorKind::Reporting,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Every wrapper failure exits with the reserved internal code so it
    /// cannot be confused with the wrapped tool's own failures.
    pub fn exit_code(&self) -> i32 {
        INTERNAL_ERROR_EXIT_CODE
    }
}

#[derive(Debug, Error)]
pub enum RollupError {
    #[error("failed to describe sub-resource {id}: {reason}")]
    Describe { id: String, reason: String },

    #[error("rollup worker failed: {0}")]
    Worker(String),

    #[error("rollup cancelled")]
    Cancelled,
}
