//! Outcome model: how a wrapped process terminated and what that means for
//! the orchestrator.

use std::process::ExitStatus;

use serde::{Deserialize, Serialize};

/// Exit code recorded in the envelope when the process never started.
pub const NEVER_STARTED_EXIT_CODE: i32 = -1;

/// Process exit code used for every failure of the wrapper itself
/// (launch, transfer, reporting, serialization).
///
/// This is what `exit(-1)` surfaces as on unix, so an envelope saying
/// `exit_code: -1` and the wrapper's own status agree.
pub const INTERNAL_ERROR_EXIT_CODE: i32 = 255;

/// Default sentinel for retryable failures. External schedulers depend on it.
pub const DEFAULT_RETRYABLE_EXIT_CODE: i32 = 2;

/// How the wrapped process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The process ran and returned this code.
    Exited { code: i32 },

    /// Launch failed (binary missing, permission denied, ...).
    NeverStarted { error: String },
}

impl ProcessOutcome {
    pub fn exited(code: i32) -> Self {
        Self::Exited { code }
    }

    pub fn never_started(error: impl Into<String>) -> Self {
        Self::NeverStarted {
            error: error.into(),
        }
    }

    /// Code as recorded in the envelope (`-1` if never started).
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exited { code } => *code,
            Self::NeverStarted { .. } => NEVER_STARTED_EXIT_CODE,
        }
    }

    pub fn exec_error(&self) -> Option<&str> {
        match self {
            Self::Exited { .. } => None,
            Self::NeverStarted { error } => Some(error),
        }
    }

    pub fn started(&self) -> bool {
        matches!(self, Self::Exited { .. })
    }
}

impl From<ExitStatus> for ProcessOutcome {
    fn from(status: ExitStatus) -> Self {
        Self::Exited {
            code: exit_code_of(status),
        }
    }
}

/// Numeric code of a finished process. Signal deaths follow the shell
/// convention of `128 + signal`.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Retry-relevant classification of a process outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Success,
    RetryableFailure,
    /// Carries the wrapped process's own exit code.
    FatalFailure { code: i32 },
    InternalError,
}

impl Classification {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}
