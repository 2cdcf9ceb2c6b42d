//! InMemoryJobTracker - 開発用・テスト用の job result 受け口

use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::{JobId, ResultEnvelope};
use crate::ports::JobTracker;

#[derive(Default)]
pub struct InMemoryJobTracker {
    submissions: Mutex<Vec<(JobId, ResultEnvelope)>>,
    fail_with: Option<String>,
}

impl InMemoryJobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A tracker that refuses every submission with `reason`.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            submissions: Mutex::new(Vec::new()),
            fail_with: Some(reason.into()),
        }
    }

    pub fn submissions(&self) -> Vec<(JobId, ResultEnvelope)> {
        self.submissions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl JobTracker for InMemoryJobTracker {
    async fn submit(&self, job_id: &JobId, envelope: &ResultEnvelope) -> Result<(), String> {
        if let Some(reason) = &self.fail_with {
            return Err(reason.clone());
        }
        self.submissions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((job_id.clone(), envelope.clone()));
        Ok(())
    }
}
