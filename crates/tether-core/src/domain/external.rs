//! External object model: the health/version view of one deployed object,
//! rolled up from the sub-resources (e.g. deployments) backing it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectStatus {
    #[default]
    Unknown,
    Pending,
    Succeeded,
    Failed,
}

/// Replica counts for one version of an external object.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExternalObjectVersion {
    /// Empty when the version is unknown (not owned by us).
    pub version: String,
    pub active: bool,
    pub replicas: i32,
    pub available_replicas: i32,
    pub target_replicas: i32,
}

impl ExternalObjectVersion {
    /// Fold another record with the same version string into this one.
    pub fn absorb(&mut self, other: &Self) {
        debug_assert_eq!(self.version, other.version);
        self.active |= other.active;
        self.replicas = self.replicas.saturating_add(other.replicas);
        self.available_replicas = self.available_replicas.saturating_add(other.available_replicas);
        self.target_replicas = self.target_replicas.saturating_add(other.target_replicas);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalObject {
    pub name: String,
    pub object_type: String,
    pub status: ObjectStatus,
    /// Sorted by version string.
    pub versions: Vec<ExternalObjectVersion>,
}

/// Rollout progress of one sub-resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RolloutState {
    #[default]
    InProgress,
    Completed,
    Failed,
}

impl RolloutState {
    pub fn as_status(&self) -> ObjectStatus {
        match self {
            Self::Completed => ObjectStatus::Succeeded,
            Self::Failed => ObjectStatus::Failed,
            Self::InProgress => ObjectStatus::Unknown,
        }
    }
}

/// What a source reports about one sub-resource.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubResourceDetail {
    pub id: String,
    pub primary: bool,
    pub rollout_state: RolloutState,
    /// Who deployed it; compared against the rollup's owner id.
    pub owner: Option<String>,
    pub version: Option<String>,
    pub pending_count: i32,
    pub running_count: i32,
    pub desired_count: i32,
}

impl SubResourceDetail {
    pub fn live_replicas(&self) -> i32 {
        self.pending_count.saturating_add(self.running_count)
    }

    /// Counts come from outside the process; negative ones are rejected.
    pub fn validate(&self) -> Result<(), String> {
        for (field, count) in [
            ("pending_count", self.pending_count),
            ("running_count", self.running_count),
            ("desired_count", self.desired_count),
        ] {
            if count < 0 {
                return Err(format!("negative {field}: {count}"));
            }
        }
        Ok(())
    }
}

/// Parameters of one rollup.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RollupRequest {
    pub name: String,
    pub object_type: String,
    pub sub_resources: Vec<String>,
    /// When set, sub-resources owned by someone else report an unknown version.
    pub owner_id: Option<String>,
}
