//! ResultReporter - envelope の提出と出力
//!
//! - job id があれば JobTracker に提出（失敗は致命的）
//! - envelope は常に 1 行の JSON として stdout に書き出す

use std::io::Write;
use std::sync::Arc;

use tracing::{info, warn};

use crate::domain::{JobId, ResultEnvelope, WrapperError};
use crate::ports::JobTracker;

#[derive(Clone)]
pub struct ResultReporter {
    tracker: Option<Arc<dyn JobTracker>>,
    job_id: Option<JobId>,
}

impl ResultReporter {
    pub fn new(tracker: Option<Arc<dyn JobTracker>>, job_id: Option<JobId>) -> Self {
        Self { tracker, job_id }
    }

    /// Reporter that only emits the envelope.
    pub fn local() -> Self {
        Self::new(None, None)
    }

    pub fn job_id(&self) -> Option<&JobId> {
        self.job_id.as_ref()
    }

    /// Submit the envelope when a job id is configured.
    pub async fn report(&self, envelope: &ResultEnvelope) -> Result<(), WrapperError> {
        let Some(job_id) = &self.job_id else {
            return Ok(());
        };
        let Some(tracker) = &self.tracker else {
            return Err(WrapperError::Config(format!(
                "job id {job_id} is set but no job tracker is configured"
            )));
        };

        match tracker.submit(job_id, envelope).await {
            Ok(()) => {
                info!("[report] submitted result for job {}", job_id);
                Ok(())
            }
            Err(reason) => {
                warn!("[report] job {} rejected result: {}", job_id, reason);
                Err(WrapperError::Reporting {
                    job_id: job_id.to_string(),
                    reason,
                })
            }
        }
    }

    /// Write the envelope as one JSON line.
    pub fn emit(&self, envelope: &ResultEnvelope, out: &mut dyn Write) -> Result<(), WrapperError> {
        let line = serde_json::to_string(envelope)
            .map_err(|e| WrapperError::Serialization(e.to_string()))?;
        writeln!(out, "{line}")
            .and_then(|_| out.flush())
            .map_err(|e| WrapperError::Serialization(e.to_string()))
    }
}
