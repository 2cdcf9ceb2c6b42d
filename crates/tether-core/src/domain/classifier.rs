//! Exit classification: turns a process outcome plus captured stderr into a
//! retry-relevant signal and the exit code the wrapper should re-exit with.
//!
//! The replacement codes are an inter-process protocol. Schedulers retry on
//! the retryable sentinel (default 2) and treat anything else as final, so
//! the matching rules here (plain substring search over stderr) must not
//! drift.

use std::fmt;
use std::str::FromStr;

use super::outcome::{
    Classification, DEFAULT_RETRYABLE_EXIT_CODE, INTERNAL_ERROR_EXIT_CODE, ProcessOutcome,
};

/// Built-in sets of retryable stderr markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternPreset {
    /// Stale saved plans and state-lock contention.
    TerraformApply,
    /// Stack lock contention.
    PulumiUp,
}

impl PatternPreset {
    pub fn patterns(&self) -> &'static [&'static str] {
        match self {
            Self::TerraformApply => &["Saved plan is stale", "Error acquiring the state lock"],
            Self::PulumiUp => &["the stack is currently locked"],
        }
    }
}

impl FromStr for PatternPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "terraform-apply" => Ok(Self::TerraformApply),
            "pulumi-up" => Ok(Self::PulumiUp),
            other => Err(format!(
                "unknown preset `{other}` (expected terraform-apply or pulumi-up)"
            )),
        }
    }
}

impl fmt::Display for PatternPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TerraformApply => f.write_str("terraform-apply"),
            Self::PulumiUp => f.write_str("pulumi-up"),
        }
    }
}

/// Case-sensitive substrings that mark a failure as retryable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternSet {
    patterns: Vec<String>,
}

impl PatternSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        // an empty pattern would match every stderr
        if !pattern.is_empty() && !self.patterns.contains(&pattern) {
            self.patterns.push(pattern);
        }
        self
    }

    pub fn with_preset(self, preset: PatternPreset) -> Self {
        preset
            .patterns()
            .iter()
            .fold(self, |set, p| set.with_pattern(*p))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// First configured pattern found in `stderr`, if any.
    pub fn find_match(&self, stderr: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|p| stderr.contains(p.as_str()))
            .map(String::as_str)
    }
}

/// Pure classifier: identical inputs always give identical results.
#[derive(Debug, Clone)]
pub struct ExitClassifier {
    patterns: PatternSet,
    retryable_exit_code: i32,
}

impl Default for ExitClassifier {
    fn default() -> Self {
        Self::new(PatternSet::new(), DEFAULT_RETRYABLE_EXIT_CODE)
    }
}

impl ExitClassifier {
    pub fn new(patterns: PatternSet, retryable_exit_code: i32) -> Self {
        Self {
            patterns,
            retryable_exit_code,
        }
    }

    pub fn patterns(&self) -> &PatternSet {
        &self.patterns
    }

    pub fn retryable_exit_code(&self) -> i32 {
        self.retryable_exit_code
    }

    pub fn classify(&self, outcome: &ProcessOutcome, stderr: &[u8]) -> Classification {
        match outcome {
            ProcessOutcome::NeverStarted { .. } => Classification::InternalError,
            ProcessOutcome::Exited { code: 0 } => Classification::Success,
            ProcessOutcome::Exited { code } => {
                let text = String::from_utf8_lossy(stderr);
                if self.patterns.find_match(&text).is_some() {
                    Classification::RetryableFailure
                } else {
                    Classification::FatalFailure { code: *code }
                }
            }
        }
    }

    /// Exit code the wrapper re-exits with for a classification.
    pub fn replacement_code(&self, classification: Classification) -> i32 {
        match classification {
            Classification::Success => 0,
            Classification::RetryableFailure => self.retryable_exit_code,
            Classification::FatalFailure { code } => code,
            Classification::InternalError => INTERNAL_ERROR_EXIT_CODE,
        }
    }

    pub fn classify_code(&self, outcome: &ProcessOutcome, stderr: &[u8]) -> (Classification, i32) {
        let classification = self.classify(outcome, stderr);
        (classification, self.replacement_code(classification))
    }
}
