use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The content of a prompt version: the system prompt plus per-tool and
/// per-subagent prompt text. Stored as JSONB; typed here (rather than a raw
/// `serde_json::Value`) so writes always round-trip through a known shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PromptContent {
    pub system_prompt: String,
    #[serde(default)]
    pub tool_descriptions: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subagent_prompts: Option<BTreeMap<String, String>>,
}

/// Aggregated fitness of a prompt version, recomputed from comparison
/// feedback and trajectory outcomes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Fitness {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub win_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_efficiency: Option<f64>,
    pub comparison_count: u64,
}

/// A windowed aggregate of trajectory outcomes. Computed on demand — never
/// persisted as its own row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsWindow {
    pub success_rate: f64,
    pub avg_efficiency: f64,
    pub error_rate: f64,
    pub trajectory_count: u64,
    pub avg_steps: f64,
    pub avg_duration_ms: f64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl MetricsWindow {
    pub fn empty(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            success_rate: 0.0,
            avg_efficiency: 0.0,
            error_rate: 0.0,
            trajectory_count: 0,
            avg_steps: 0.0,
            avg_duration_ms: 0.0,
            period_start: start,
            period_end: end,
        }
    }
}

/// Relative comparison between a baseline and a post-deployment window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsComparison {
    pub success_rate_change: f64,
    pub error_rate_change: f64,
    pub efficiency_change: f64,
    pub sample_size_sufficient: bool,
    pub statistically_significant: bool,
    pub before: MetricsWindow,
    pub after: MetricsWindow,
}
