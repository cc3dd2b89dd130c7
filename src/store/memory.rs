//! In-memory `Store` implementation used by service-level tests.
//!
//! Grounded on `maple-storage`'s `InMemoryMapleStorage`: a single
//! `Mutex`-guarded data struct standing in for the database, with every
//! `Store` method taking the lock for the duration of one call.
//! `with_transaction` takes the lock once for the whole closure, giving the
//! same atomicity guarantee the Postgres adapter gets from a real
//! transaction. Uses `tokio::sync::Mutex` rather than `parking_lot`'s: the
//! guard has to stay held across the `.await` of the transaction closure,
//! and only a `Send` guard can cross that await point inside a `dyn Store`
//! future.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{
    Agent, ApprovalRequest, ApprovalStatus, ApprovalVote, Branch, ComparisonFeedback, Deployment,
    DeploymentStatus, Fitness, MetricsWindow, PromptVersion, RegressionReport, Reviewer,
    Trajectory, VersionStatus,
};
use crate::error::{EngineError, EngineResult};

use super::{BoxFuture, NewPromptVersion, Store, StoreTx};

#[derive(Default)]
struct MemoryData {
    agents: HashMap<String, Agent>,
    branches: HashMap<Uuid, Branch>,
    versions: HashMap<Uuid, PromptVersion>,
    approval_requests: HashMap<Uuid, ApprovalRequest>,
    approval_request_by_version: HashMap<Uuid, Uuid>,
    approval_votes: HashMap<Uuid, Vec<ApprovalVote>>,
    deployments: HashMap<Uuid, Deployment>,
    deployments_by_agent: HashMap<String, Vec<Uuid>>,
    reviewers: HashMap<Uuid, Reviewer>,
    trajectories: Vec<Trajectory>,
    feedback: Vec<ComparisonFeedback>,
    regression_reports: HashMap<Uuid, Vec<RegressionReport>>,
}

#[derive(Default)]
pub struct InMemoryStore {
    data: Mutex<MemoryData>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: seed a reviewer so approval/deployment paths have an
    /// actor to check roles against.
    pub async fn seed_reviewer(&self, reviewer: Reviewer) {
        self.data.lock().await.reviewers.insert(reviewer.id, reviewer);
    }

    /// Test helper: append a trajectory directly, bypassing the (out of
    /// scope) ingestion endpoints.
    pub async fn seed_trajectory(&self, trajectory: Trajectory) {
        self.data.lock().await.trajectories.push(trajectory);
    }

    pub async fn seed_feedback(&self, feedback: ComparisonFeedback) {
        self.data.lock().await.feedback.push(feedback);
    }
}

fn next_version_number(data: &MemoryData, branch_id: Uuid) -> i64 {
    data.versions
        .values()
        .filter(|v| v.branch_id == branch_id)
        .map(|v| v.version)
        .max()
        .unwrap_or(0)
        + 1
}

fn insert_prompt_version(
    data: &mut MemoryData,
    agent_id: &str,
    branch_id: Uuid,
    new_version: NewPromptVersion,
) -> PromptVersion {
    let version = next_version_number(data, branch_id);
    let record = PromptVersion {
        id: new_version.id,
        agent_id: agent_id.to_string(),
        branch_id,
        version,
        content: new_version.content,
        parent_ids: new_version.parent_ids,
        mutation_type: new_version.mutation_type,
        mutation_details: new_version.mutation_details,
        fitness: Fitness::default(),
        status: VersionStatus::Candidate,
        created_at: new_version.created_at,
        created_by: new_version.created_by,
        approved_by: Vec::new(),
        deployed_at: None,
    };
    data.versions.insert(record.id, record.clone());
    record
}

struct MemoryTx<'a> {
    data: &'a mut MemoryData,
}

#[async_trait]
impl<'a> StoreTx for MemoryTx<'a> {
    async fn get_prompt_version(&mut self, id: Uuid) -> EngineResult<Option<PromptVersion>> {
        Ok(self.data.versions.get(&id).cloned())
    }

    async fn create_prompt_version(
        &mut self,
        agent_id: &str,
        branch_id: Uuid,
        new_version: NewPromptVersion,
    ) -> EngineResult<PromptVersion> {
        Ok(insert_prompt_version(self.data, agent_id, branch_id, new_version))
    }

    async fn set_version_status(&mut self, id: Uuid, status: VersionStatus) -> EngineResult<()> {
        if let Some(v) = self.data.versions.get_mut(&id) {
            v.status = status;
        }
        Ok(())
    }

    async fn set_version_deployed_at(
        &mut self,
        id: Uuid,
        deployed_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        if let Some(v) = self.data.versions.get_mut(&id) {
            v.deployed_at = Some(deployed_at);
        }
        Ok(())
    }

    async fn get_approval_request(
        &mut self,
        version_id: Uuid,
    ) -> EngineResult<Option<ApprovalRequest>> {
        Ok(self
            .data
            .approval_request_by_version
            .get(&version_id)
            .and_then(|id| self.data.approval_requests.get(id))
            .cloned())
    }

    async fn update_approval_request_status(
        &mut self,
        id: Uuid,
        status: ApprovalStatus,
        current_approvals: u32,
    ) -> EngineResult<()> {
        if let Some(r) = self.data.approval_requests.get_mut(&id) {
            r.status = status;
            r.current_approvals = current_approvals;
        }
        Ok(())
    }

    async fn create_approval_vote(&mut self, vote: ApprovalVote) -> EngineResult<()> {
        self.data
            .approval_votes
            .entry(vote.request_id)
            .or_default()
            .push(vote);
        Ok(())
    }

    async fn has_voted(&mut self, request_id: Uuid, approver_id: Uuid) -> EngineResult<bool> {
        Ok(self
            .data
            .approval_votes
            .get(&request_id)
            .is_some_and(|votes| votes.iter().any(|v| v.approver_id == approver_id)))
    }

    async fn get_current_deployment(&mut self, agent_id: &str) -> EngineResult<Option<Deployment>> {
        Ok(self
            .data
            .deployments_by_agent
            .get(agent_id)
            .and_then(|ids| ids.iter().rev().find_map(|id| self.data.deployments.get(id)))
            .filter(|d| d.status == DeploymentStatus::Active)
            .cloned())
    }

    async fn create_deployment(&mut self, deployment: Deployment) -> EngineResult<Deployment> {
        self.data
            .deployments_by_agent
            .entry(deployment.agent_id.clone())
            .or_default()
            .push(deployment.id);
        self.data.deployments.insert(deployment.id, deployment.clone());
        Ok(deployment)
    }

    async fn set_deployment_status(
        &mut self,
        id: Uuid,
        status: DeploymentStatus,
    ) -> EngineResult<()> {
        if let Some(d) = self.data.deployments.get_mut(&id) {
            d.status = status;
        }
        Ok(())
    }

    async fn rollback_deployment(
        &mut self,
        id: Uuid,
        rolled_back_at: DateTime<Utc>,
        rolled_back_by: Uuid,
        reason: Option<String>,
    ) -> EngineResult<()> {
        if let Some(d) = self.data.deployments.get_mut(&id) {
            d.status = DeploymentStatus::RolledBack;
            d.rolled_back_at = Some(rolled_back_at);
            d.rolled_back_by = Some(rolled_back_by);
            d.rollback_reason = reason;
        }
        Ok(())
    }

    async fn update_deployment_metrics(
        &mut self,
        id: Uuid,
        baseline: Option<MetricsWindow>,
        post_deployment: Option<MetricsWindow>,
        regression_detected: bool,
    ) -> EngineResult<()> {
        if let Some(d) = self.data.deployments.get_mut(&id) {
            if baseline.is_some() {
                d.metrics_baseline = baseline;
            }
            if post_deployment.is_some() {
                d.metrics_post_deployment = post_deployment;
            }
            d.regression_detected = regression_detected;
        }
        Ok(())
    }

    async fn set_agent_production_version(
        &mut self,
        agent_id: &str,
        version_id: Option<Uuid>,
    ) -> EngineResult<()> {
        if let Some(a) = self.data.agents.get_mut(agent_id) {
            a.current_production_version_id = version_id;
        }
        Ok(())
    }

    async fn get_agent(&mut self, agent_id: &str) -> EngineResult<Option<Agent>> {
        Ok(self.data.agents.get(agent_id).cloned())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn ping(&self) -> bool {
        true
    }

    async fn get_or_create_agent(&self, agent_id: &str, name: &str) -> EngineResult<Agent> {
        let mut data = self.data.lock().await;
        if let Some(a) = data.agents.get(agent_id) {
            return Ok(a.clone());
        }
        let agent = Agent::new(agent_id, name);
        data.agents.insert(agent_id.to_string(), agent.clone());
        Ok(agent)
    }

    async fn get_agent(&self, agent_id: &str) -> EngineResult<Option<Agent>> {
        Ok(self.data.lock().await.agents.get(agent_id).cloned())
    }

    async fn get_main_branch(&self, agent_id: &str) -> EngineResult<Branch> {
        let mut data = self.data.lock().await;
        if let Some(b) = data
            .branches
            .values()
            .find(|b| b.agent_id == agent_id && b.is_main)
        {
            return Ok(b.clone());
        }
        let branch = Branch::main(agent_id);
        data.branches.insert(branch.id, branch.clone());
        Ok(branch)
    }

    async fn create_branch(&self, branch: Branch) -> EngineResult<Branch> {
        let mut data = self.data.lock().await;
        if data
            .branches
            .values()
            .any(|b| b.agent_id == branch.agent_id && b.name == branch.name)
        {
            return Err(EngineError::InvalidInput(format!(
                "branch {} already exists for agent {}",
                branch.name, branch.agent_id
            )));
        }
        data.branches.insert(branch.id, branch.clone());
        Ok(branch)
    }

    async fn list_branches(&self, agent_id: &str) -> EngineResult<Vec<Branch>> {
        Ok(self
            .data
            .lock()
            .await
            .branches
            .values()
            .filter(|b| b.agent_id == agent_id)
            .cloned()
            .collect())
    }

    async fn get_branch(&self, id: Uuid) -> EngineResult<Option<Branch>> {
        Ok(self.data.lock().await.branches.get(&id).cloned())
    }

    async fn branch_has_versions(&self, branch_id: Uuid) -> EngineResult<bool> {
        Ok(self
            .data
            .lock()
            .await
            .versions
            .values()
            .any(|v| v.branch_id == branch_id))
    }

    async fn delete_branch(&self, id: Uuid) -> EngineResult<()> {
        self.data.lock().await.branches.remove(&id);
        Ok(())
    }

    async fn get_prompt_version(&self, id: Uuid) -> EngineResult<Option<PromptVersion>> {
        Ok(self.data.lock().await.versions.get(&id).cloned())
    }

    async fn create_prompt_version(
        &self,
        agent_id: &str,
        branch_id: Uuid,
        new_version: NewPromptVersion,
    ) -> EngineResult<PromptVersion> {
        let mut data = self.data.lock().await;
        Ok(insert_prompt_version(&mut data, agent_id, branch_id, new_version))
    }

    async fn list_versions_for_agent(&self, agent_id: &str) -> EngineResult<Vec<PromptVersion>> {
        Ok(self
            .data
            .lock()
            .await
            .versions
            .values()
            .filter(|v| v.agent_id == agent_id)
            .cloned()
            .collect())
    }

    async fn list_versions_for_branch(&self, branch_id: Uuid) -> EngineResult<Vec<PromptVersion>> {
        Ok(self
            .data
            .lock()
            .await
            .versions
            .values()
            .filter(|v| v.branch_id == branch_id)
            .cloned()
            .collect())
    }

    async fn set_version_status(&self, id: Uuid, status: VersionStatus) -> EngineResult<()> {
        if let Some(v) = self.data.lock().await.versions.get_mut(&id) {
            v.status = status;
        }
        Ok(())
    }

    async fn update_fitness(&self, id: Uuid, fitness: Fitness) -> EngineResult<()> {
        if let Some(v) = self.data.lock().await.versions.get_mut(&id) {
            v.fitness = fitness;
        }
        Ok(())
    }

    async fn create_approval_request(
        &self,
        request: ApprovalRequest,
    ) -> EngineResult<ApprovalRequest> {
        let mut data = self.data.lock().await;
        data.approval_request_by_version
            .insert(request.version_id, request.id);
        data.approval_requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn get_approval_request(
        &self,
        version_id: Uuid,
    ) -> EngineResult<Option<ApprovalRequest>> {
        let data = self.data.lock().await;
        Ok(data
            .approval_request_by_version
            .get(&version_id)
            .and_then(|id| data.approval_requests.get(id))
            .cloned())
    }

    async fn update_approval_request_status(
        &self,
        id: Uuid,
        status: ApprovalStatus,
        current_approvals: u32,
    ) -> EngineResult<()> {
        if let Some(r) = self.data.lock().await.approval_requests.get_mut(&id) {
            r.status = status;
            r.current_approvals = current_approvals;
        }
        Ok(())
    }

    async fn create_approval_vote(&self, vote: ApprovalVote) -> EngineResult<()> {
        self.data
            .lock()
            .await
            .approval_votes
            .entry(vote.request_id)
            .or_default()
            .push(vote);
        Ok(())
    }

    async fn has_voted(&self, request_id: Uuid, approver_id: Uuid) -> EngineResult<bool> {
        Ok(self
            .data
            .lock()
            .await
            .approval_votes
            .get(&request_id)
            .is_some_and(|votes| votes.iter().any(|v| v.approver_id == approver_id)))
    }

    async fn get_approval_votes(&self, request_id: Uuid) -> EngineResult<Vec<ApprovalVote>> {
        Ok(self
            .data
            .lock()
            .await
            .approval_votes
            .get(&request_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_pending_approvals(&self) -> EngineResult<Vec<ApprovalRequest>> {
        Ok(self
            .data
            .lock()
            .await
            .approval_requests
            .values()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .cloned()
            .collect())
    }

    async fn expire_pending_approvals_before(&self, now: DateTime<Utc>) -> EngineResult<u64> {
        let mut data = self.data.lock().await;
        let mut count = 0u64;
        for r in data.approval_requests.values_mut() {
            if r.status == ApprovalStatus::Pending && r.is_expired(now) {
                r.status = ApprovalStatus::Expired;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn create_deployment(&self, deployment: Deployment) -> EngineResult<Deployment> {
        let mut data = self.data.lock().await;
        data.deployments_by_agent
            .entry(deployment.agent_id.clone())
            .or_default()
            .push(deployment.id);
        data.deployments.insert(deployment.id, deployment.clone());
        Ok(deployment)
    }

    async fn get_deployment(&self, id: Uuid) -> EngineResult<Option<Deployment>> {
        Ok(self.data.lock().await.deployments.get(&id).cloned())
    }

    async fn get_current_deployment(&self, agent_id: &str) -> EngineResult<Option<Deployment>> {
        let data = self.data.lock().await;
        Ok(data
            .deployments_by_agent
            .get(agent_id)
            .and_then(|ids| ids.iter().rev().find_map(|id| data.deployments.get(id)))
            .filter(|d| d.status == DeploymentStatus::Active)
            .cloned())
    }

    async fn get_deployment_history(
        &self,
        agent_id: &str,
        limit: u32,
    ) -> EngineResult<Vec<Deployment>> {
        let data = self.data.lock().await;
        Ok(data
            .deployments_by_agent
            .get(agent_id)
            .map(|ids| {
                ids.iter()
                    .rev()
                    .filter_map(|id| data.deployments.get(id).cloned())
                    .take(limit as usize)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_active_deployments_due_for_evaluation(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> EngineResult<Vec<Deployment>> {
        Ok(self
            .data
            .lock()
            .await
            .deployments
            .values()
            .filter(|d| {
                d.status == DeploymentStatus::Active
                    && !d.regression_detected
                    && d.deployed_at >= window_start
                    && d.deployed_at <= window_end
            })
            .cloned()
            .collect())
    }

    async fn update_deployment_metrics(
        &self,
        id: Uuid,
        baseline: Option<MetricsWindow>,
        post_deployment: Option<MetricsWindow>,
        regression_detected: bool,
    ) -> EngineResult<()> {
        if let Some(d) = self.data.lock().await.deployments.get_mut(&id) {
            if baseline.is_some() {
                d.metrics_baseline = baseline;
            }
            if post_deployment.is_some() {
                d.metrics_post_deployment = post_deployment;
            }
            d.regression_detected = regression_detected;
        }
        Ok(())
    }

    async fn get_reviewer(&self, id: Uuid) -> EngineResult<Option<Reviewer>> {
        Ok(self.data.lock().await.reviewers.get(&id).cloned())
    }

    async fn any_admin_reviewer(&self) -> EngineResult<Option<Reviewer>> {
        Ok(self
            .data
            .lock()
            .await
            .reviewers
            .values()
            .find(|r| r.role == crate::domain::Role::Admin)
            .cloned())
    }

    async fn get_trajectory_metrics(
        &self,
        agent_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<Trajectory>> {
        Ok(self
            .data
            .lock()
            .await
            .trajectories
            .iter()
            .filter(|t| t.agent_id == agent_id && t.occurred_at >= start && t.occurred_at <= end)
            .cloned()
            .collect())
    }

    async fn get_version_metrics(
        &self,
        version_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<Trajectory>> {
        Ok(self
            .data
            .lock()
            .await
            .trajectories
            .iter()
            .filter(|t| {
                t.version_id == version_id && t.occurred_at >= start && t.occurred_at <= end
            })
            .cloned()
            .collect())
    }

    async fn list_comparison_feedback_for_version(
        &self,
        version_id: Uuid,
    ) -> EngineResult<Vec<ComparisonFeedback>> {
        Ok(self
            .data
            .lock()
            .await
            .feedback
            .iter()
            .filter(|f| f.version_a_id == version_id || f.version_b_id == version_id)
            .cloned()
            .collect())
    }

    async fn list_trajectories_for_version(&self, version_id: Uuid) -> EngineResult<Vec<Trajectory>> {
        Ok(self
            .data
            .lock()
            .await
            .trajectories
            .iter()
            .filter(|t| t.version_id == version_id)
            .cloned()
            .collect())
    }

    async fn create_regression_report(&self, report: RegressionReport) -> EngineResult<()> {
        self.data
            .lock()
            .await
            .regression_reports
            .entry(report.deployment_id)
            .or_default()
            .push(report);
        Ok(())
    }

    async fn get_latest_regression_report(
        &self,
        deployment_id: Uuid,
    ) -> EngineResult<Option<RegressionReport>> {
        Ok(self
            .data
            .lock()
            .await
            .regression_reports
            .get(&deployment_id)
            .and_then(|reports| reports.last().cloned()))
    }

    async fn with_transaction(
        &self,
        f: Box<dyn FnOnce(&mut dyn StoreTx) -> BoxFuture<'_, EngineResult<()>> + Send + '_>,
    ) -> EngineResult<()> {
        let mut data = self.data.lock().await;
        let mut tx = MemoryTx { data: &mut data };
        f(&mut tx).await
    }
}
