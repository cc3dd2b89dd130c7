use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An LLM agent whose prompts are being evolved and released.
///
/// `id` is the stable, externally-chosen agent identifier (not a UUID —
/// ingestion clients and the mutator key everything off this string).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub current_production_version_id: Option<Uuid>,
}

impl Agent {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            current_production_version_id: None,
        }
    }
}
