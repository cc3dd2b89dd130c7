use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::metrics::MetricsComparison;

/// Deployment lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Active,
    RolledBack,
    Superseded,
}

/// Regression severity, ordered low to critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// One production deployment of a prompt version for an agent.
///
/// Invariant: at most one deployment per `agent_id` has `status = Active` at
/// any observable instant; `previous_deployment_id` forms a linear history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: Uuid,
    pub version_id: Uuid,
    pub agent_id: String,
    pub deployed_by: Uuid,
    pub deployed_at: DateTime<Utc>,
    pub status: DeploymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_deployment_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_baseline: Option<super::metrics::MetricsWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_post_deployment: Option<super::metrics::MetricsWindow>,
    pub regression_detected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolled_back_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolled_back_by: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_reason: Option<String>,
}

/// The outcome of one regression evaluation for a deployment. Multiple
/// reports may exist per deployment; the most recent one wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegressionReport {
    pub deployment_id: Uuid,
    pub detected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    pub metrics: MetricsComparison,
    pub recommendations: Vec<String>,
    pub evaluated_at: DateTime<Utc>,
    pub auto_rollback_triggered: bool,
}
