use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A human pairwise preference between two versions' trajectories, the raw
/// input to fitness's `winRate` aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preference {
    A,
    B,
    Tie,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonFeedback {
    pub id: Uuid,
    pub version_a_id: Uuid,
    pub version_b_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preference: Option<Preference>,
    pub skipped: bool,
    pub created_at: DateTime<Utc>,
}
