//! JobTracker port - remote job-result submission

use async_trait::async_trait;

use crate::domain::{JobId, ResultEnvelope};

/// Accepts the final envelope of a job. An `Err` means the result was not
/// acknowledged.
#[async_trait]
pub trait JobTracker: Send + Sync {
    async fn submit(&self, job_id: &JobId, envelope: &ResultEnvelope) -> Result<(), String>;
}
