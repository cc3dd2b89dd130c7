use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::metrics::{Fitness, PromptContent};

/// Lifecycle status of a prompt version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Candidate,
    Approved,
    Production,
    Retired,
}

/// Who created a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatedBy {
    Evolution,
    Manual,
}

/// A concrete prompt content snapshot with a sequential integer version
/// number within its branch. `parent_ids.len() >= 2` marks a merge node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptVersion {
    pub id: Uuid,
    pub agent_id: String,
    pub branch_id: Uuid,
    pub version: i64,
    pub content: PromptContent,
    pub parent_ids: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_details: Option<String>,
    pub fitness: Fitness,
    pub status: VersionStatus,
    pub created_at: DateTime<Utc>,
    pub created_by: CreatedBy,
    #[serde(default)]
    pub approved_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
}

impl PromptVersion {
    pub fn is_merge(&self) -> bool {
        self.parent_ids.len() >= 2
    }
}
