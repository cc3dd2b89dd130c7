//! Storage interface for the release-engineering engine.
//!
//! Defined as an `#[async_trait]` so `services::*` stay generic over the
//! backend, mirroring the `CommitmentStore`/`AuditStore` trait-plus-adapters
//! shape in `maple-storage`. Two adapters implement it: `postgres::PostgresStore`
//! for production and `memory::InMemoryStore` for tests.

pub mod memory;
pub mod postgres;

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    Agent, ApprovalRequest, ApprovalStatus, ApprovalVote, Branch, ComparisonFeedback, Deployment,
    DeploymentStatus, PromptVersion, RegressionReport, Reviewer, Trajectory, VersionStatus,
};
use crate::error::EngineResult;

/// A boxed, `Send` future, the shape `async_trait` itself expands to —
/// used here so the transaction closure below stays callable through
/// `dyn Store`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A handle to one open transaction-scoped unit of work, passed into the
/// closure given to `Store::with_transaction`. Every method here behaves
/// exactly like its `Store` counterpart, but all calls made through the same
/// `StoreTx` commit or roll back together.
#[async_trait]
pub trait StoreTx: Send + Sync {
    async fn get_prompt_version(&mut self, id: Uuid) -> EngineResult<Option<PromptVersion>>;
    async fn create_prompt_version(
        &mut self,
        agent_id: &str,
        branch_id: Uuid,
        new_version: NewPromptVersion,
    ) -> EngineResult<PromptVersion>;
    async fn set_version_status(&mut self, id: Uuid, status: VersionStatus) -> EngineResult<()>;
    async fn set_version_deployed_at(
        &mut self,
        id: Uuid,
        deployed_at: DateTime<Utc>,
    ) -> EngineResult<()>;

    async fn get_approval_request(&mut self, version_id: Uuid)
        -> EngineResult<Option<ApprovalRequest>>;
    async fn update_approval_request_status(
        &mut self,
        id: Uuid,
        status: ApprovalStatus,
        current_approvals: u32,
    ) -> EngineResult<()>;
    async fn create_approval_vote(&mut self, vote: ApprovalVote) -> EngineResult<()>;
    async fn has_voted(&mut self, request_id: Uuid, approver_id: Uuid) -> EngineResult<bool>;

    async fn get_current_deployment(&mut self, agent_id: &str) -> EngineResult<Option<Deployment>>;
    async fn create_deployment(&mut self, deployment: Deployment) -> EngineResult<Deployment>;
    async fn set_deployment_status(
        &mut self,
        id: Uuid,
        status: DeploymentStatus,
    ) -> EngineResult<()>;
    async fn rollback_deployment(
        &mut self,
        id: Uuid,
        rolled_back_at: DateTime<Utc>,
        rolled_back_by: Uuid,
        reason: Option<String>,
    ) -> EngineResult<()>;
    async fn update_deployment_metrics(
        &mut self,
        id: Uuid,
        baseline: Option<crate::domain::MetricsWindow>,
        post_deployment: Option<crate::domain::MetricsWindow>,
        regression_detected: bool,
    ) -> EngineResult<()>;

    async fn set_agent_production_version(
        &mut self,
        agent_id: &str,
        version_id: Option<Uuid>,
    ) -> EngineResult<()>;
    async fn get_agent(&mut self, agent_id: &str) -> EngineResult<Option<Agent>>;
}

/// Fields required to allocate a new `PromptVersion`; `version` itself is
/// assigned by the store via `nextVersion` inside the active transaction.
#[derive(Debug, Clone)]
pub struct NewPromptVersion {
    pub id: Uuid,
    pub content: crate::domain::PromptContent,
    pub parent_ids: Vec<Uuid>,
    pub mutation_type: Option<String>,
    pub mutation_details: Option<String>,
    pub created_by: crate::domain::CreatedBy,
    pub created_at: DateTime<Utc>,
}

/// The persistence boundary. All multi-step writes that must commit
/// atomically go through `with_transaction`; everything else is a direct,
/// single-statement call.
#[async_trait]
pub trait Store: Send + Sync {
    /// `GET /health`'s DB reachability check. `true` on a successful
    /// round-trip, `false` on any failure — never an error, since a failed
    /// ping is itself the signal the caller wants.
    async fn ping(&self) -> bool;

    async fn get_or_create_agent(&self, agent_id: &str, name: &str) -> EngineResult<Agent>;
    async fn get_agent(&self, agent_id: &str) -> EngineResult<Option<Agent>>;

    async fn get_main_branch(&self, agent_id: &str) -> EngineResult<Branch>;
    async fn create_branch(&self, branch: Branch) -> EngineResult<Branch>;
    async fn list_branches(&self, agent_id: &str) -> EngineResult<Vec<Branch>>;
    async fn get_branch(&self, id: Uuid) -> EngineResult<Option<Branch>>;
    async fn branch_has_versions(&self, branch_id: Uuid) -> EngineResult<bool>;
    async fn delete_branch(&self, id: Uuid) -> EngineResult<()>;

    async fn get_prompt_version(&self, id: Uuid) -> EngineResult<Option<PromptVersion>>;
    async fn create_prompt_version(
        &self,
        agent_id: &str,
        branch_id: Uuid,
        new_version: NewPromptVersion,
    ) -> EngineResult<PromptVersion>;
    async fn list_versions_for_agent(&self, agent_id: &str) -> EngineResult<Vec<PromptVersion>>;
    async fn list_versions_for_branch(&self, branch_id: Uuid) -> EngineResult<Vec<PromptVersion>>;
    async fn set_version_status(&self, id: Uuid, status: VersionStatus) -> EngineResult<()>;
    async fn update_fitness(&self, id: Uuid, fitness: crate::domain::Fitness) -> EngineResult<()>;

    async fn create_approval_request(
        &self,
        request: ApprovalRequest,
    ) -> EngineResult<ApprovalRequest>;
    async fn get_approval_request(
        &self,
        version_id: Uuid,
    ) -> EngineResult<Option<ApprovalRequest>>;
    async fn update_approval_request_status(
        &self,
        id: Uuid,
        status: ApprovalStatus,
        current_approvals: u32,
    ) -> EngineResult<()>;
    async fn create_approval_vote(&self, vote: ApprovalVote) -> EngineResult<()>;
    async fn has_voted(&self, request_id: Uuid, approver_id: Uuid) -> EngineResult<bool>;
    async fn get_approval_votes(&self, request_id: Uuid) -> EngineResult<Vec<ApprovalVote>>;
    async fn list_pending_approvals(&self) -> EngineResult<Vec<ApprovalRequest>>;
    async fn expire_pending_approvals_before(&self, now: DateTime<Utc>) -> EngineResult<u64>;

    async fn create_deployment(&self, deployment: Deployment) -> EngineResult<Deployment>;
    async fn get_deployment(&self, id: Uuid) -> EngineResult<Option<Deployment>>;
    async fn get_current_deployment(&self, agent_id: &str) -> EngineResult<Option<Deployment>>;
    async fn get_deployment_history(
        &self,
        agent_id: &str,
        limit: u32,
    ) -> EngineResult<Vec<Deployment>>;
    async fn list_active_deployments_due_for_evaluation(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> EngineResult<Vec<Deployment>>;
    async fn update_deployment_metrics(
        &self,
        id: Uuid,
        baseline: Option<crate::domain::MetricsWindow>,
        post_deployment: Option<crate::domain::MetricsWindow>,
        regression_detected: bool,
    ) -> EngineResult<()>;

    async fn get_reviewer(&self, id: Uuid) -> EngineResult<Option<Reviewer>>;
    async fn any_admin_reviewer(&self) -> EngineResult<Option<Reviewer>>;

    async fn get_trajectory_metrics(
        &self,
        agent_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<Trajectory>>;
    async fn get_version_metrics(
        &self,
        version_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<Trajectory>>;
    async fn list_comparison_feedback_for_version(
        &self,
        version_id: Uuid,
    ) -> EngineResult<Vec<ComparisonFeedback>>;
    async fn list_trajectories_for_version(&self, version_id: Uuid) -> EngineResult<Vec<Trajectory>>;

    async fn create_regression_report(&self, report: RegressionReport) -> EngineResult<()>;
    async fn get_latest_regression_report(
        &self,
        deployment_id: Uuid,
    ) -> EngineResult<Option<RegressionReport>>;

    /// Run `f` against a transaction-scoped view of the store. All writes
    /// issued through the `StoreTx` commit together; an `Err` returned from
    /// `f` rolls the whole unit of work back. Boxing the closure (rather than
    /// taking it generic) is what keeps this callable through `dyn Store`.
    async fn with_transaction(
        &self,
        f: Box<dyn FnOnce(&mut dyn StoreTx) -> BoxFuture<'_, EngineResult<()>> + Send + '_>,
    ) -> EngineResult<()>;
}
