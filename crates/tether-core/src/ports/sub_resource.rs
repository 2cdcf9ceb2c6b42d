//! SubResourceSource port - per sub-resource detail lookup for rollups

use async_trait::async_trait;

use crate::domain::{RollupError, SubResourceDetail};

#[async_trait]
pub trait SubResourceSource: Send + Sync {
    async fn describe(&self, id: &str) -> Result<SubResourceDetail, RollupError>;
}
