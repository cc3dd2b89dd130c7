//! Periodic expiration and deployment-monitor sweeps. Grounded
//! on `agentkern-arbiter::dr_scheduler::DRScheduler`'s `tokio::time::interval`
//! background-task pattern, generalized from a single monthly drill to two
//! independent recurring sweeps, each guarded so overlapping runs never fire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use crate::services::approval::ApprovalService;
use crate::services::deployment::DeploymentController;
use crate::services::regression::RegressionDetector;
use crate::store::Store;

pub struct SchedulerConfig {
    pub evaluation_window_minutes: i64,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    approval: Arc<ApprovalService>,
    detector: Arc<RegressionDetector>,
    deployment: Arc<DeploymentController>,
    config: SchedulerConfig,
    expiry_running: Arc<AtomicBool>,
    monitor_running: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        approval: Arc<ApprovalService>,
        detector: Arc<RegressionDetector>,
        deployment: Arc<DeploymentController>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            approval,
            detector,
            deployment,
            config,
            expiry_running: Arc::new(AtomicBool::new(false)),
            monitor_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns both background sweeps. Returns their join handles so callers
    /// can hold or abort them (e.g. on shutdown).
    pub fn spawn(self: &Arc<Self>) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let expiry = self.clone();
        let expiry_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(StdDuration::from_secs(3600));
            loop {
                ticker.tick().await;
                expiry.run_expiry_sweep().await;
            }
        });

        let monitor = self.clone();
        let monitor_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(StdDuration::from_secs(900));
            loop {
                ticker.tick().await;
                monitor.run_monitor_sweep().await;
            }
        });

        (expiry_handle, monitor_handle)
    }

    async fn run_expiry_sweep(&self) {
        if self.expiry_running.swap(true, Ordering::SeqCst) {
            tracing::debug!("expiry sweep already running, skipping tick");
            return;
        }
        let result = self.approval.expire_stale().await;
        self.expiry_running.store(false, Ordering::SeqCst);
        match result {
            Ok(count) if count > 0 => tracing::info!(expired = count, "expired stale approval requests"),
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "expiry sweep failed"),
        }
    }

    async fn run_monitor_sweep(&self) {
        if self.monitor_running.swap(true, Ordering::SeqCst) {
            tracing::debug!("monitor sweep already running, skipping tick");
            return;
        }
        let now = Utc::now();
        let window_start = now - Duration::minutes(self.config.evaluation_window_minutes);
        let window_end = now - Duration::minutes(5);

        let due = self
            .store
            .list_active_deployments_due_for_evaluation(window_start, window_end)
            .await;

        match due {
            Ok(deployments) => {
                for deployment in deployments {
                    match self.detector.evaluate(deployment.id).await {
                        Ok(report) if report.auto_rollback_triggered => {
                            if let Err(err) = self
                                .deployment
                                .auto_rollback(deployment.id, "regression evaluation triggered auto-rollback")
                                .await
                            {
                                tracing::warn!(deployment_id = %deployment.id, error = %err, "auto-rollback failed");
                            }
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(deployment_id = %deployment.id, error = %err, "scheduled regression evaluation failed");
                        }
                    }
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to list deployments due for evaluation"),
        }
        self.monitor_running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::NotificationGateway;
    use crate::services::metrics::MetricsService;
    use crate::services::regression::RegressionConfig;
    use crate::store::memory::InMemoryStore;

    #[tokio::test]
    async fn expiry_sweep_is_idempotent_when_nothing_pending() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let notifications = Arc::new(NotificationGateway::disabled());
        let approval = Arc::new(ApprovalService::new(store.clone(), notifications.clone()));
        let metrics = Arc::new(MetricsService::new(store.clone(), 50));
        let detector = Arc::new(RegressionDetector::new(
            store.clone(),
            metrics.clone(),
            notifications.clone(),
            RegressionConfig::default(),
        ));
        let deployment = Arc::new(DeploymentController::new(
            store.clone(),
            metrics,
            detector.clone(),
            notifications,
            crate::services::deployment::DeploymentConfig::default(),
        ));
        let scheduler = Scheduler::new(
            store,
            approval,
            detector,
            deployment,
            SchedulerConfig { evaluation_window_minutes: 30 },
        );
        scheduler.run_expiry_sweep().await;
        assert!(!scheduler.expiry_running.load(Ordering::SeqCst));
    }
}
