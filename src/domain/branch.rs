use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named line of prompt evolution for one agent.
///
/// Unique per `(agent_id, name)`; exactly one branch per agent has
/// `is_main = true`, auto-created the first time `getMainBranch` is called
/// for an agent that has none yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub id: Uuid,
    pub agent_id: String,
    pub name: String,
    pub parent_branch_id: Option<Uuid>,
    pub is_main: bool,
    pub created_at: DateTime<Utc>,
}

impl Branch {
    pub const MAIN_NAME: &'static str = "main";

    pub fn main(agent_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            name: Self::MAIN_NAME.to_string(),
            parent_branch_id: None,
            is_main: true,
            created_at: Utc::now(),
        }
    }

    pub fn child(
        agent_id: impl Into<String>,
        name: impl Into<String>,
        parent_branch_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            name: name.into(),
            parent_branch_id: Some(parent_branch_id),
            is_main: false,
            created_at: Utc::now(),
        }
    }
}
