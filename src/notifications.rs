//! Notification gateway: fan-out of typed release events to registered
//! sinks. Grounded on `agentkern-arbiter::escalation::webhook::WebhookNotifier`'s
//! per-event formatting and "demo mode unless credentials configured"
//! fallback, with a real `reqwest` POST behind it.
//!
//! Sending is fire-and-forget: a delivery failure is logged and never
//! propagated back to the caller, so core operations never block on it.

use serde::Serialize;
use std::time::Duration;

/// Event types emitted by the release-engineering engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ApprovalNeeded,
    ApprovalReceived,
    ApprovalRejected,
    Deployed,
    RegressionDetected,
    Rollback,
    RollbackComplete,
}

impl EventType {
    fn as_str(self) -> &'static str {
        match self {
            EventType::ApprovalNeeded => "approval_needed",
            EventType::ApprovalReceived => "approval_received",
            EventType::ApprovalRejected => "approval_rejected",
            EventType::Deployed => "deployed",
            EventType::RegressionDetected => "regression_detected",
            EventType::Rollback => "rollback",
            EventType::RollbackComplete => "rollback_complete",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event_type: EventType,
    pub agent_id: String,
    pub message: String,
    pub timestamp: String,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(
        event_type: EventType,
        agent_id: impl Into<String>,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            agent_id: agent_id.into(),
            message: message.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            data,
        }
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    event_type: &'static str,
    agent_id: &'a str,
    message: &'a str,
    timestamp: &'a str,
    data: &'a serde_json::Value,
}

/// Fire-and-forget fan-out to an optional external webhook, built once at
/// startup from config and shared by every service.
#[derive(Clone)]
pub struct NotificationGateway {
    client: reqwest::Client,
    webhook_url: Option<String>,
    enabled: bool,
}

impl NotificationGateway {
    pub fn new(webhook_url: Option<String>, enabled: bool) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            webhook_url,
            enabled,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, false)
    }

    pub fn emit(&self, event: Event) {
        if !self.enabled {
            tracing::debug!(event_type = event.event_type.as_str(), agent_id = %event.agent_id, "notification (demo mode, no webhook configured)");
            return;
        }
        let Some(url) = self.webhook_url.clone() else {
            tracing::debug!(event_type = event.event_type.as_str(), agent_id = %event.agent_id, "notification (demo mode, no webhook url)");
            return;
        };
        let client = self.client.clone();
        tokio::spawn(async move {
            let payload = WebhookPayload {
                event_type: event.event_type.as_str(),
                agent_id: &event.agent_id,
                message: &event.message,
                timestamp: &event.timestamp,
                data: &event.data,
            };
            match client.post(&url).json(&payload).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::info!(event_type = payload.event_type, "notification delivered");
                }
                Ok(resp) => {
                    tracing::warn!(event_type = payload.event_type, status = %resp.status(), "notification rejected by sink");
                }
                Err(err) => {
                    tracing::warn!(event_type = payload.event_type, error = %err, "notification delivery failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_gateway_never_panics_on_emit() {
        let gateway = NotificationGateway::disabled();
        gateway.emit(Event::new(
            EventType::Deployed,
            "agent-1",
            "deployed",
            serde_json::json!({}),
        ));
    }
}
