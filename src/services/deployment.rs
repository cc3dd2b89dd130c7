//! Atomic deploy / rollback / auto-rollback. Grounded on
//! `agentkern-arbiter::coordinator::Coordinator` and `::locks::LockManager`'s
//! "acquire atomically, supersede the previous holder, release on
//! completion" shape, generalized from a single resource lock to the
//! agent-scoped "at most one active deployment" invariant.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::domain::{Deployment, DeploymentStatus, Reviewer, VersionStatus};
use crate::error::{EngineError, EngineResult};
use crate::notifications::{Event, EventType, NotificationGateway};
use crate::services::metrics::MetricsService;
use crate::services::regression::RegressionDetector;
use crate::store::{BoxFuture, Store, StoreTx};

pub struct DeploymentConfig {
    pub baseline_window_minutes: i64,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self { baseline_window_minutes: 60 }
    }
}

pub struct DeploymentController {
    store: Arc<dyn Store>,
    metrics: Arc<MetricsService>,
    detector: Arc<RegressionDetector>,
    notifications: Arc<NotificationGateway>,
    config: DeploymentConfig,
}

impl DeploymentController {
    pub fn new(
        store: Arc<dyn Store>,
        metrics: Arc<MetricsService>,
        detector: Arc<RegressionDetector>,
        notifications: Arc<NotificationGateway>,
        config: DeploymentConfig,
    ) -> Self {
        Self { store, metrics, detector, notifications, config }
    }

    pub async fn deploy(&self, version_id: Uuid, deployed_by: &Reviewer) -> EngineResult<Deployment> {
        if !deployed_by.role.can_act_on_releases() {
            return Err(EngineError::PermissionDenied(deployed_by.id));
        }
        let version = self
            .store
            .get_prompt_version(version_id)
            .await?
            .ok_or(EngineError::VersionNotFound(version_id))?;

        let approval = self
            .store
            .get_approval_request(version_id)
            .await?
            .ok_or(EngineError::NotApproved(version_id))?;
        if !approval.can_deploy() {
            return Err(EngineError::NotApproved(version_id));
        }

        let agent_id = version.agent_id.clone();
        let current_deployment = self.store.get_current_deployment(&agent_id).await?;
        let metrics_baseline = self
            .metrics
            .capture_baseline(&agent_id, self.config.baseline_window_minutes)
            .await?;

        let agent = self
            .store
            .get_agent(&agent_id)
            .await?
            .ok_or_else(|| EngineError::AgentNotFound(agent_id.clone()))?;
        let previous_production_version_id = agent.current_production_version_id;

        let new_deployment = Deployment {
            id: Uuid::new_v4(),
            version_id,
            agent_id: agent_id.clone(),
            deployed_by: deployed_by.id,
            deployed_at: Utc::now(),
            status: DeploymentStatus::Active,
            previous_deployment_id: current_deployment.as_ref().map(|d| d.id),
            metrics_baseline: Some(metrics_baseline),
            metrics_post_deployment: None,
            regression_detected: false,
            rolled_back_at: None,
            rolled_back_by: None,
            rollback_reason: None,
        };

        let result: EngineResult<Deployment> = {
            let new_deployment = new_deployment.clone();
            let current_deployment = current_deployment.clone();
            let agent_id = agent_id.clone();
            self.store
                .with_transaction(Box::new(move |tx| {
                    run_deploy(tx, new_deployment, current_deployment, agent_id, version_id, previous_production_version_id)
                }))
                .await
                .map(|_| new_deployment)
        };

        let deployment = match result {
            Ok(d) => d,
            Err(err) => {
                // Best-effort safety net: the transaction already rolled back
                // any partial write, but restore the agent pointer in case a
                // non-transactional caller observed the intermediate state.
                let _ = self
                    .store
                    .set_agent_production_version(&agent_id, previous_production_version_id)
                    .await;
                return Err(err);
            }
        };

        self.detector.schedule_evaluation(&deployment);
        self.notifications.emit(Event::new(
            EventType::Deployed,
            &agent_id,
            format!("version {version_id} deployed"),
            serde_json::json!({ "deploymentId": deployment.id, "versionId": version_id }),
        ));
        Ok(deployment)
    }

    pub async fn rollback(
        &self,
        deployment_id: Uuid,
        rolled_back_by: &Reviewer,
        reason: Option<String>,
    ) -> EngineResult<Deployment> {
        if !rolled_back_by.role.can_act_on_releases() {
            return Err(EngineError::PermissionDenied(rolled_back_by.id));
        }
        let deployment = self
            .store
            .get_deployment(deployment_id)
            .await?
            .ok_or(EngineError::DeploymentNotFound(deployment_id))?;
        if deployment.rolled_back_at.is_some() {
            return Err(EngineError::AlreadyRolledBack(deployment_id));
        }
        let previous_id = deployment
            .previous_deployment_id
            .ok_or(EngineError::NoPreviousDeployment(deployment_id))?;
        let previous = self
            .store
            .get_deployment(previous_id)
            .await?
            .ok_or(EngineError::DeploymentNotFound(previous_id))?;

        self.detector.cancel_scheduled_evaluation(deployment_id);

        let now = Utc::now();
        let rolled_back_by_id = rolled_back_by.id;
        let agent_id = deployment.agent_id.clone();
        {
            let deployment = deployment.clone();
            let previous = previous.clone();
            self.store
                .with_transaction(Box::new(move |tx| {
                    run_rollback(tx, deployment, previous, now, rolled_back_by_id, reason)
                }))
                .await?;
        }

        self.notifications.emit(Event::new(
            EventType::RollbackComplete,
            &agent_id,
            format!("deployment {deployment_id} rolled back"),
            serde_json::json!({ "deploymentId": deployment_id, "revertedTo": previous_id }),
        ));
        self.store
            .get_deployment(deployment_id)
            .await?
            .ok_or(EngineError::DeploymentNotFound(deployment_id))
    }

    pub async fn auto_rollback(&self, deployment_id: Uuid, reason: &str) -> EngineResult<Deployment> {
        let admin = self
            .store
            .any_admin_reviewer()
            .await?
            .ok_or(EngineError::NoAdmin)?;
        let deployment = self
            .store
            .get_deployment(deployment_id)
            .await?
            .ok_or(EngineError::DeploymentNotFound(deployment_id))?;
        self.notifications.emit(Event::new(
            EventType::Rollback,
            &deployment.agent_id,
            format!("auto-rollback triggered for deployment {deployment_id}"),
            serde_json::json!({ "deploymentId": deployment_id, "reason": reason }),
        ));
        self.rollback(deployment_id, &admin, Some(format!("[AUTO] {reason}"))).await
    }

    pub async fn is_deployed(&self, version_id: Uuid) -> EngineResult<bool> {
        let version = self
            .store
            .get_prompt_version(version_id)
            .await?
            .ok_or(EngineError::VersionNotFound(version_id))?;
        let current = self.store.get_current_deployment(&version.agent_id).await?;
        Ok(current.is_some_and(|d| d.version_id == version_id))
    }
}

fn run_deploy<'a>(
    tx: &'a mut dyn StoreTx,
    new_deployment: Deployment,
    current_deployment: Option<Deployment>,
    agent_id: String,
    version_id: Uuid,
    previous_production_version_id: Option<Uuid>,
) -> BoxFuture<'a, EngineResult<()>> {
    Box::pin(async move {
        if let Some(current) = &current_deployment {
            tx.set_deployment_status(current.id, DeploymentStatus::Superseded).await?;
        }
        tx.create_deployment(new_deployment).await?;
        tx.set_version_status(version_id, VersionStatus::Production).await?;
        tx.set_version_deployed_at(version_id, Utc::now()).await?;
        if let Some(previous_version_id) = previous_production_version_id {
            if previous_version_id != version_id {
                tx.set_version_status(previous_version_id, VersionStatus::Retired).await?;
            }
        }
        tx.set_agent_production_version(&agent_id, Some(version_id)).await?;
        Ok(())
    })
}

fn run_rollback<'a>(
    tx: &'a mut dyn StoreTx,
    deployment: Deployment,
    previous: Deployment,
    now: chrono::DateTime<Utc>,
    rolled_back_by: Uuid,
    reason: Option<String>,
) -> BoxFuture<'a, EngineResult<()>> {
    Box::pin(async move {
        tx.rollback_deployment(deployment.id, now, rolled_back_by, reason).await?;
        tx.set_version_status(deployment.version_id, VersionStatus::Candidate).await?;
        tx.set_deployment_status(previous.id, DeploymentStatus::Active).await?;
        tx.set_version_status(previous.version_id, VersionStatus::Production).await?;
        tx.set_agent_production_version(&deployment.agent_id, Some(previous.version_id)).await?;
        Ok(())
    })
}
