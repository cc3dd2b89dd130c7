//! Post-deployment regression detection. `scheduleEvaluation`'s
//! deferred-timer shape is grounded on `agentkern-arbiter::dr_scheduler`'s
//! `tokio::time` + `parking_lot::Mutex`-guarded handle map.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domain::{Deployment, RegressionReport, Severity};
use crate::error::{EngineError, EngineResult};
use crate::notifications::{Event, EventType, NotificationGateway};
use crate::services::metrics::MetricsService;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct RegressionConfig {
    pub success_rate_threshold: f64,
    pub efficiency_threshold: f64,
    pub min_sample_size: u64,
    pub evaluation_window_minutes: i64,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            success_rate_threshold: 0.05,
            efficiency_threshold: 0.10,
            min_sample_size: 50,
            evaluation_window_minutes: 30,
        }
    }
}

pub struct RegressionDetector {
    store: Arc<dyn Store>,
    metrics: Arc<MetricsService>,
    notifications: Arc<NotificationGateway>,
    config: RegressionConfig,
    scheduled: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl RegressionDetector {
    pub fn new(
        store: Arc<dyn Store>,
        metrics: Arc<MetricsService>,
        notifications: Arc<NotificationGateway>,
        config: RegressionConfig,
    ) -> Self {
        Self {
            store,
            metrics,
            notifications,
            config,
            scheduled: Mutex::new(HashMap::new()),
        }
    }

    pub async fn evaluate(&self, deployment_id: Uuid) -> EngineResult<RegressionReport> {
        let deployment = self
            .store
            .get_deployment(deployment_id)
            .await?
            .ok_or(EngineError::DeploymentNotFound(deployment_id))?;

        let Some(baseline) = deployment.metrics_baseline else {
            let now = Utc::now();
            let current = self
                .metrics
                .window_for_version(deployment.version_id, deployment.deployed_at, now)
                .await?;
            self.store
                .update_deployment_metrics(deployment_id, Some(current), None, false)
                .await?;
            return Ok(RegressionReport {
                deployment_id,
                detected: false,
                severity: None,
                metrics: crate::domain::MetricsComparison {
                    success_rate_change: 0.0,
                    error_rate_change: 0.0,
                    efficiency_change: 0.0,
                    sample_size_sufficient: false,
                    statistically_significant: false,
                    before: current,
                    after: current,
                },
                recommendations: vec!["no baseline captured yet".to_string()],
                evaluated_at: now,
                auto_rollback_triggered: false,
            });
        };

        let window_end = deployment.deployed_at
            + Duration::minutes(self.config.evaluation_window_minutes);
        let end = window_end.min(Utc::now());
        let post = self
            .metrics
            .window_for_version(deployment.version_id, deployment.deployed_at, end)
            .await?;
        let comparison = self.metrics.compare(baseline, post);

        let report = self.classify(deployment_id, comparison, Utc::now());

        self.store.create_regression_report(report.clone()).await?;
        self.store
            .update_deployment_metrics(deployment_id, Some(baseline), Some(post), report.detected)
            .await?;

        if report.detected {
            self.notifications.emit(Event::new(
                EventType::RegressionDetected,
                &deployment.agent_id,
                format!("regression detected on deployment {deployment_id}"),
                serde_json::json!({
                    "deploymentId": deployment_id,
                    "severity": report.severity,
                }),
            ));
        }
        Ok(report)
    }

    fn classify(
        &self,
        deployment_id: Uuid,
        metrics: crate::domain::MetricsComparison,
        evaluated_at: DateTime<Utc>,
    ) -> RegressionReport {
        if !metrics.sample_size_sufficient {
            return RegressionReport {
                deployment_id,
                detected: false,
                severity: None,
                recommendations: vec![format!(
                    "Insufficient sample size ({}/{})",
                    metrics.after.trajectory_count, self.config.min_sample_size
                )],
                metrics,
                evaluated_at,
                auto_rollback_triggered: false,
            };
        }

        let success_drop = -metrics.success_rate_change;
        let efficiency_drop = -metrics.efficiency_change;
        let error_increase = metrics.error_rate_change;
        let threshold = self.config.success_rate_threshold;

        let detected = success_drop > threshold
            || efficiency_drop > self.config.efficiency_threshold
            || error_increase > threshold;

        if !detected {
            return RegressionReport {
                deployment_id,
                detected: false,
                severity: None,
                metrics,
                recommendations: vec![],
                evaluated_at,
                auto_rollback_triggered: false,
            };
        }

        let severity = if success_drop > 0.20 || error_increase > 0.20 {
            Severity::Critical
        } else if success_drop > 0.10 || error_increase > 0.10 {
            Severity::High
        } else if success_drop > threshold || efficiency_drop > self.config.efficiency_threshold {
            Severity::Medium
        } else {
            Severity::Low
        };

        let mut recommendations = Vec::new();
        match severity {
            Severity::Critical => recommendations.push("critical regression: roll back immediately".to_string()),
            Severity::High => recommendations.push("high-severity regression: roll back recommended".to_string()),
            _ => {}
        }
        if success_drop > threshold {
            recommendations.push(format!("success rate dropped {:.1}%", success_drop * 100.0));
        }
        if efficiency_drop > self.config.efficiency_threshold {
            recommendations.push(format!("efficiency dropped {:.1}%", efficiency_drop * 100.0));
        }
        if error_increase > threshold {
            recommendations.push(format!("error rate increased {:.1}%", error_increase * 100.0));
        }
        if metrics.statistically_significant {
            recommendations.push("change is statistically significant".to_string());
        }

        let auto_rollback_triggered = severity == Severity::Critical && metrics.statistically_significant;

        RegressionReport {
            deployment_id,
            detected: true,
            severity: Some(severity),
            metrics,
            recommendations,
            evaluated_at,
            auto_rollback_triggered,
        }
    }

    /// Schedules a deferred `evaluate` after the evaluation window elapses,
    /// cancelling any evaluation already scheduled for this deployment.
    pub fn schedule_evaluation(self: &Arc<Self>, deployment: &Deployment) {
        self.cancel_scheduled_evaluation(deployment.id);
        let detector = self.clone();
        let deployment_id = deployment.id;
        let delay = Duration::minutes(self.config.evaluation_window_minutes)
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(1800));
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = detector.evaluate(deployment_id).await {
                tracing::warn!(deployment_id = %deployment_id, error = %err, "scheduled evaluation failed");
            }
            detector.scheduled.lock().remove(&deployment_id);
        });
        self.scheduled.lock().insert(deployment_id, handle);
    }

    pub fn cancel_scheduled_evaluation(&self, deployment_id: Uuid) {
        if let Some(handle) = self.scheduled.lock().remove(&deployment_id) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MetricsComparison, MetricsWindow};

    fn window(success_rate: f64, error_rate: f64, efficiency: f64, n: u64) -> MetricsWindow {
        let now = Utc::now();
        MetricsWindow {
            success_rate,
            avg_efficiency: efficiency,
            error_rate,
            trajectory_count: n,
            avg_steps: 5.0,
            avg_duration_ms: 1000.0,
            period_start: now - Duration::minutes(30),
            period_end: now,
        }
    }

    fn detector() -> RegressionDetector {
        let store: Arc<dyn Store> = Arc::new(crate::store::memory::InMemoryStore::new());
        let metrics = Arc::new(MetricsService::new(store.clone(), 50));
        RegressionDetector::new(
            store,
            metrics,
            Arc::new(NotificationGateway::disabled()),
            RegressionConfig::default(),
        )
    }

    fn comparison(before: MetricsWindow, after: MetricsWindow, min_sample: u64) -> MetricsComparison {
        crate::services::metrics::compare_metrics(before, after, min_sample)
    }

    #[test]
    fn critical_drop_triggers_auto_rollback() {
        let d = detector();
        let metrics = comparison(window(0.95, 0.02, 0.8, 100), window(0.60, 0.30, 0.8, 100), 50);
        let report = d.classify(Uuid::new_v4(), metrics, Utc::now());
        assert!(report.detected);
        assert_eq!(report.severity, Some(Severity::Critical));
        assert!(report.auto_rollback_triggered);
    }

    #[test]
    fn insufficient_sample_never_detects() {
        let d = detector();
        let metrics = comparison(window(0.95, 0.02, 0.8, 100), window(0.10, 0.80, 0.1, 20), 50);
        let report = d.classify(Uuid::new_v4(), metrics, Utc::now());
        assert!(!report.detected);
        assert_eq!(
            report.recommendations,
            vec!["Insufficient sample size (20/50)".to_string()]
        );
    }

    #[test]
    fn medium_drop_is_not_auto_rolled_back() {
        let d = detector();
        let metrics = comparison(window(0.90, 0.05, 0.8, 100), window(0.80, 0.08, 0.8, 100), 50);
        let report = d.classify(Uuid::new_v4(), metrics, Utc::now());
        assert!(report.detected);
        assert_eq!(report.severity, Some(Severity::Medium));
        assert!(!report.auto_rollback_triggered);
    }

    #[test]
    fn no_change_is_not_detected() {
        let d = detector();
        let metrics = comparison(window(0.90, 0.05, 0.8, 100), window(0.90, 0.05, 0.8, 100), 50);
        let report = d.classify(Uuid::new_v4(), metrics, Utc::now());
        assert!(!report.detected);
        assert!(report.recommendations.is_empty());
    }
}
