//! CommandSource - describes a sub-resource by running an external command.
//!
//! `program args... <id>` must print one `SubResourceDetail` JSON object on
//! stdout. A nonzero exit is a describe error carrying the command's stderr.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::domain::{RollupError, SubResourceDetail};
use crate::ports::SubResourceSource;

#[derive(Debug, Clone)]
pub struct CommandSource {
    program: String,
    args: Vec<String>,
}

impl CommandSource {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl SubResourceSource for CommandSource {
    async fn describe(&self, id: &str) -> Result<SubResourceDetail, RollupError> {
        let describe_err = |reason: String| RollupError::Describe {
            id: id.to_string(),
            reason,
        };

        debug!("[rollup] running {} {:?} {}", self.program, self.args, id);
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(id)
            // aborted rollup workers must not leave describe commands behind
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| describe_err(format!("failed to run {}: {e}", self.program)))?;

        if !output.status.success() {
            return Err(describe_err(format!(
                "{} exited with {}:\n{}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end()
            )));
        }

        let mut detail: SubResourceDetail = serde_json::from_slice(&output.stdout)
            .map_err(|e| describe_err(format!("invalid detail JSON: {e}")))?;
        detail.validate().map_err(describe_err)?;
        if detail.id.is_empty() {
            detail.id = id.to_string();
        }
        Ok(detail)
    }
}
