//! Configuration for one wrapped invocation.
//!
//! The CLI fills these from flags and environment variables; library users
//! can deserialize them or build them directly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{
    DEFAULT_RETRYABLE_EXIT_CODE, DeclaredOutput, ExitClassifier, InputDescriptor, PatternPreset,
    PatternSet,
};

/// Job id variable; when set, the envelope is submitted to the job tracker.
pub const JOB_ID_ENV: &str = "TETHER_JOB_ID";

/// Base URL of the remote service (blobs and job results).
pub const ENDPOINT_ENV: &str = "TETHER_ENDPOINT";

/// Log filter for the CLI.
pub const LOG_ENV: &str = "TETHER_LOG";

pub const RETRYABLE_EXIT_CODE_ENV: &str = "TETHER_RETRYABLE_EXIT_CODE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub endpoint: String,
    pub connect_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            connect_timeout_secs: 30,
        }
    }
}

impl RemoteConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Exit-code rules shared by both wrapper modes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitCodePolicy {
    pub retryable_exit_code: i32,
    pub retryable_patterns: Vec<String>,
    /// Exit codes under which a missing declared output is tolerated.
    pub success_exit_codes: Vec<i32>,
}

impl Default for ExitCodePolicy {
    fn default() -> Self {
        Self {
            retryable_exit_code: DEFAULT_RETRYABLE_EXIT_CODE,
            retryable_patterns: Vec::new(),
            success_exit_codes: vec![0],
        }
    }
}

impl ExitCodePolicy {
    pub fn with_preset(mut self, preset: PatternPreset) -> Self {
        self.retryable_patterns
            .extend(preset.patterns().iter().map(|p| p.to_string()));
        self
    }

    pub fn classifier(&self) -> ExitClassifier {
        let patterns = self
            .retryable_patterns
            .iter()
            .fold(PatternSet::new(), |set, p| set.with_pattern(p.clone()));
        ExitClassifier::new(patterns, self.retryable_exit_code)
    }

    pub fn is_success(&self, code: i32) -> bool {
        self.success_exit_codes.contains(&code)
    }
}

/// Everything the envelope-mode pipeline needs besides its collaborators.
#[derive(Debug, Clone, Default)]
pub struct WrapperConfig {
    pub program: String,
    pub args: Vec<String>,
    pub inputs: Vec<InputDescriptor>,
    pub outputs: Vec<DeclaredOutput>,
    pub policy: ExitCodePolicy,
}

impl WrapperConfig {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ..Self::default()
        }
    }
}
