use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One recorded execution trace of an agent against a prompt version.
///
/// Ingestion of trajectories is out of scope for this service (owned by an
/// external collaborator); this type and the store's read-only aggregates
/// over it are in scope, since the Metrics Service and Regression Detector
/// depend on them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trajectory {
    pub id: Uuid,
    pub agent_id: String,
    pub version_id: Uuid,
    pub success: bool,
    pub error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efficiency: Option<f64>,
    pub steps: u32,
    pub duration_ms: u64,
    pub occurred_at: DateTime<Utc>,
}
