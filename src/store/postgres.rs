//! PostgreSQL-backed `Store` implementation.
//!
//! Grounded on `maple-storage`'s `PostgresMapleStorage`: `init_schema` as an
//! array of `CREATE TABLE IF NOT EXISTS` statements plus a handful of
//! additive `ALTER TABLE ... ADD COLUMN IF NOT EXISTS` migrations, status
//! columns stored as `TEXT` rather than native Postgres enums, and JSONB for
//! the typed blob fields (`content`, `fitness`, the metrics windows).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::domain::{
    Agent, ApprovalRequest, ApprovalStatus, ApprovalVote, Branch, ComparisonFeedback, CreatedBy,
    Deployment, DeploymentStatus, Fitness, MetricsWindow, Preference, PromptContent, PromptVersion,
    RegressionReport, Reviewer, Role, Severity, Trajectory, VersionStatus, Vote,
};
use crate::error::{EngineError, EngineResult};

use super::{BoxFuture, NewPromptVersion, Store, StoreTx};

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> EngineResult<Self> {
        Self::connect_with_options(database_url, 10, 10, 20).await
    }

    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
        idle_timeout_secs: u64,
    ) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .idle_timeout(std::time::Duration::from_secs(idle_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| EngineError::StoreFailure(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Pings the database; used by `GET /health`.
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn init_schema(&self) -> EngineResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                current_production_version_id UUID
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS branches (
                id UUID PRIMARY KEY,
                agent_id TEXT NOT NULL,
                name TEXT NOT NULL,
                parent_branch_id UUID,
                is_main BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (agent_id, name)
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS branches_one_main_per_agent
                ON branches (agent_id) WHERE is_main
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS prompt_versions (
                id UUID PRIMARY KEY,
                agent_id TEXT NOT NULL,
                branch_id UUID NOT NULL REFERENCES branches(id),
                version BIGINT NOT NULL,
                content JSONB NOT NULL,
                parent_ids UUID[] NOT NULL DEFAULT '{}',
                mutation_type TEXT,
                mutation_details TEXT,
                fitness JSONB NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                created_by TEXT NOT NULL,
                approved_by TEXT[] NOT NULL DEFAULT '{}',
                deployed_at TIMESTAMPTZ,
                UNIQUE (agent_id, branch_id, version)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS approval_requests (
                id UUID PRIMARY KEY,
                version_id UUID NOT NULL UNIQUE REFERENCES prompt_versions(id),
                agent_id TEXT NOT NULL,
                requested_by TEXT NOT NULL,
                requested_at TIMESTAMPTZ NOT NULL,
                required_approvals INTEGER NOT NULL,
                current_approvals INTEGER NOT NULL,
                status TEXT NOT NULL,
                expires_at TIMESTAMPTZ
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS approval_votes (
                id UUID PRIMARY KEY,
                request_id UUID NOT NULL REFERENCES approval_requests(id),
                approver_id UUID NOT NULL,
                vote TEXT NOT NULL,
                reason TEXT,
                voted_at TIMESTAMPTZ NOT NULL,
                UNIQUE (request_id, approver_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id UUID PRIMARY KEY,
                version_id UUID NOT NULL REFERENCES prompt_versions(id),
                agent_id TEXT NOT NULL,
                deployed_by UUID NOT NULL,
                deployed_at TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL,
                previous_deployment_id UUID,
                metrics_baseline JSONB,
                metrics_post_deployment JSONB,
                regression_detected BOOLEAN NOT NULL DEFAULT FALSE,
                rolled_back_at TIMESTAMPTZ,
                rolled_back_by UUID,
                rollback_reason TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS reviewers (
                id UUID PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                role TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                last_active_at TIMESTAMPTZ
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS trajectories (
                id UUID PRIMARY KEY,
                agent_id TEXT NOT NULL,
                version_id UUID NOT NULL,
                success BOOLEAN NOT NULL,
                error BOOLEAN NOT NULL,
                efficiency DOUBLE PRECISION,
                steps INTEGER NOT NULL,
                duration_ms BIGINT NOT NULL,
                occurred_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS comparison_feedback (
                id UUID PRIMARY KEY,
                version_a_id UUID NOT NULL,
                version_b_id UUID NOT NULL,
                preference TEXT,
                skipped BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS regression_reports (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                deployment_id UUID NOT NULL REFERENCES deployments(id),
                detected BOOLEAN NOT NULL,
                severity TEXT,
                metrics JSONB NOT NULL,
                recommendations TEXT[] NOT NULL DEFAULT '{}',
                evaluated_at TIMESTAMPTZ NOT NULL,
                auto_rollback_triggered BOOLEAN NOT NULL
            )
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| EngineError::StoreFailure(format!("schema init failed: {e}")))?;
        }

        // Columns added after the initial release; additive so existing
        // deployments migrate without downtime.
        sqlx::query("ALTER TABLE reviewers ADD COLUMN IF NOT EXISTS last_active_at TIMESTAMPTZ")
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::StoreFailure(format!("schema migration failed: {e}")))?;
        sqlx::query(
            "ALTER TABLE prompt_versions ADD COLUMN IF NOT EXISTS mutation_details TEXT",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::StoreFailure(format!("schema migration failed: {e}")))?;

        Ok(())
    }
}

fn version_status_str(s: VersionStatus) -> &'static str {
    match s {
        VersionStatus::Candidate => "candidate",
        VersionStatus::Approved => "approved",
        VersionStatus::Production => "production",
        VersionStatus::Retired => "retired",
    }
}

fn parse_version_status(s: &str) -> VersionStatus {
    match s {
        "approved" => VersionStatus::Approved,
        "production" => VersionStatus::Production,
        "retired" => VersionStatus::Retired,
        _ => VersionStatus::Candidate,
    }
}

fn created_by_str(c: CreatedBy) -> &'static str {
    match c {
        CreatedBy::Evolution => "evolution",
        CreatedBy::Manual => "manual",
    }
}

fn parse_created_by(s: &str) -> CreatedBy {
    match s {
        "evolution" => CreatedBy::Evolution,
        _ => CreatedBy::Manual,
    }
}

fn approval_status_str(s: ApprovalStatus) -> &'static str {
    match s {
        ApprovalStatus::Pending => "pending",
        ApprovalStatus::Approved => "approved",
        ApprovalStatus::Rejected => "rejected",
        ApprovalStatus::Expired => "expired",
    }
}

fn parse_approval_status(s: &str) -> ApprovalStatus {
    match s {
        "approved" => ApprovalStatus::Approved,
        "rejected" => ApprovalStatus::Rejected,
        "expired" => ApprovalStatus::Expired,
        _ => ApprovalStatus::Pending,
    }
}

fn vote_str(v: Vote) -> &'static str {
    match v {
        Vote::Approve => "approve",
        Vote::Reject => "reject",
    }
}

fn deployment_status_str(s: DeploymentStatus) -> &'static str {
    match s {
        DeploymentStatus::Pending => "pending",
        DeploymentStatus::Deploying => "deploying",
        DeploymentStatus::Active => "active",
        DeploymentStatus::RolledBack => "rolled_back",
        DeploymentStatus::Superseded => "superseded",
    }
}

fn parse_deployment_status(s: &str) -> DeploymentStatus {
    match s {
        "deploying" => DeploymentStatus::Deploying,
        "active" => DeploymentStatus::Active,
        "rolled_back" => DeploymentStatus::RolledBack,
        "superseded" => DeploymentStatus::Superseded,
        _ => DeploymentStatus::Pending,
    }
}

fn role_str(r: Role) -> &'static str {
    match r {
        Role::Reviewer => "reviewer",
        Role::Developer => "developer",
        Role::Admin => "admin",
    }
}

fn parse_role(s: &str) -> Role {
    match s {
        "developer" => Role::Developer,
        "admin" => Role::Admin,
        _ => Role::Reviewer,
    }
}

fn severity_str(s: Severity) -> &'static str {
    match s {
        Severity::Low => "low",
        Severity::Medium => "medium",
        Severity::High => "high",
        Severity::Critical => "critical",
    }
}

fn parse_severity(s: &str) -> Severity {
    match s {
        "medium" => Severity::Medium,
        "high" => Severity::High,
        "critical" => Severity::Critical,
        _ => Severity::Low,
    }
}

fn version_row(row: &sqlx::postgres::PgRow) -> EngineResult<PromptVersion> {
    let content: serde_json::Value = row.try_get("content")?;
    let fitness: serde_json::Value = row.try_get("fitness")?;
    Ok(PromptVersion {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        branch_id: row.try_get("branch_id")?,
        version: row.try_get("version")?,
        content: serde_json::from_value(content)
            .map_err(|e| EngineError::StoreFailure(e.to_string()))?,
        parent_ids: row.try_get("parent_ids")?,
        mutation_type: row.try_get("mutation_type")?,
        mutation_details: row.try_get("mutation_details")?,
        fitness: serde_json::from_value(fitness)
            .map_err(|e| EngineError::StoreFailure(e.to_string()))?,
        status: parse_version_status(row.try_get("status")?),
        created_at: row.try_get("created_at")?,
        created_by: parse_created_by(row.try_get("created_by")?),
        approved_by: row.try_get("approved_by")?,
        deployed_at: row.try_get("deployed_at")?,
    })
}

fn deployment_row(row: &sqlx::postgres::PgRow) -> EngineResult<Deployment> {
    let baseline: Option<serde_json::Value> = row.try_get("metrics_baseline")?;
    let post: Option<serde_json::Value> = row.try_get("metrics_post_deployment")?;
    Ok(Deployment {
        id: row.try_get("id")?,
        version_id: row.try_get("version_id")?,
        agent_id: row.try_get("agent_id")?,
        deployed_by: row.try_get("deployed_by")?,
        deployed_at: row.try_get("deployed_at")?,
        status: parse_deployment_status(row.try_get("status")?),
        previous_deployment_id: row.try_get("previous_deployment_id")?,
        metrics_baseline: baseline
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| EngineError::StoreFailure(e.to_string()))?,
        metrics_post_deployment: post
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| EngineError::StoreFailure(e.to_string()))?,
        regression_detected: row.try_get("regression_detected")?,
        rolled_back_at: row.try_get("rolled_back_at")?,
        rolled_back_by: row.try_get("rolled_back_by")?,
        rollback_reason: row.try_get("rollback_reason")?,
    })
}

fn approval_request_row(row: &sqlx::postgres::PgRow) -> EngineResult<ApprovalRequest> {
    Ok(ApprovalRequest {
        id: row.try_get("id")?,
        version_id: row.try_get("version_id")?,
        agent_id: row.try_get("agent_id")?,
        requested_by: row.try_get("requested_by")?,
        requested_at: row.try_get("requested_at")?,
        required_approvals: row.try_get::<i32, _>("required_approvals")? as u32,
        current_approvals: row.try_get::<i32, _>("current_approvals")? as u32,
        status: parse_approval_status(row.try_get("status")?),
        expires_at: row.try_get("expires_at")?,
    })
}

fn trajectory_row(row: &sqlx::postgres::PgRow) -> EngineResult<Trajectory> {
    Ok(Trajectory {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        version_id: row.try_get("version_id")?,
        success: row.try_get("success")?,
        error: row.try_get("error")?,
        efficiency: row.try_get("efficiency")?,
        steps: row.try_get::<i32, _>("steps")? as u32,
        duration_ms: row.try_get::<i64, _>("duration_ms")? as u64,
        occurred_at: row.try_get("occurred_at")?,
    })
}

async fn next_version_number<'e, E>(executor: E, branch_id: Uuid) -> EngineResult<i64>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let row = sqlx::query("SELECT COALESCE(MAX(version), 0) + 1 AS next FROM prompt_versions WHERE branch_id = $1")
        .bind(branch_id)
        .fetch_one(executor)
        .await?;
    Ok(row.try_get::<i64, _>("next")?)
}

async fn insert_prompt_version<'e, E>(
    executor: E,
    agent_id: &str,
    branch_id: Uuid,
    new_version: NewPromptVersion,
    version: i64,
) -> EngineResult<PromptVersion>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let content_json = serde_json::to_value(&new_version.content)
        .map_err(|e| EngineError::StoreFailure(e.to_string()))?;
    let fitness_json =
        serde_json::to_value(&Fitness::default()).map_err(|e| EngineError::StoreFailure(e.to_string()))?;
    let row = sqlx::query(
        r#"
        INSERT INTO prompt_versions
            (id, agent_id, branch_id, version, content, parent_ids, mutation_type,
             mutation_details, fitness, status, created_at, created_by, approved_by, deployed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'candidate', $10, $11, '{}', NULL)
        RETURNING *
        "#,
    )
    .bind(new_version.id)
    .bind(agent_id)
    .bind(branch_id)
    .bind(version)
    .bind(content_json)
    .bind(&new_version.parent_ids)
    .bind(&new_version.mutation_type)
    .bind(&new_version.mutation_details)
    .bind(fitness_json)
    .bind(new_version.created_at)
    .bind(created_by_str(new_version.created_by))
    .fetch_one(executor)
    .await?;
    version_row(&row)
}

struct PgTx<'t, 'c> {
    tx: &'t mut Transaction<'c, Postgres>,
}

#[async_trait]
impl<'t, 'c> StoreTx for PgTx<'t, 'c> {
    async fn get_prompt_version(&mut self, id: Uuid) -> EngineResult<Option<PromptVersion>> {
        let row = sqlx::query("SELECT * FROM prompt_versions WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut **self.tx)
            .await?;
        row.as_ref().map(version_row).transpose()
    }

    async fn create_prompt_version(
        &mut self,
        agent_id: &str,
        branch_id: Uuid,
        new_version: NewPromptVersion,
    ) -> EngineResult<PromptVersion> {
        let version = next_version_number(&mut **self.tx, branch_id).await?;
        insert_prompt_version(&mut **self.tx, agent_id, branch_id, new_version, version).await
    }

    async fn set_version_status(&mut self, id: Uuid, status: VersionStatus) -> EngineResult<()> {
        sqlx::query("UPDATE prompt_versions SET status = $1 WHERE id = $2")
            .bind(version_status_str(status))
            .bind(id)
            .execute(&mut **self.tx)
            .await?;
        Ok(())
    }

    async fn set_version_deployed_at(
        &mut self,
        id: Uuid,
        deployed_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        sqlx::query("UPDATE prompt_versions SET deployed_at = $1 WHERE id = $2")
            .bind(deployed_at)
            .bind(id)
            .execute(&mut **self.tx)
            .await?;
        Ok(())
    }

    async fn get_approval_request(
        &mut self,
        version_id: Uuid,
    ) -> EngineResult<Option<ApprovalRequest>> {
        let row = sqlx::query("SELECT * FROM approval_requests WHERE version_id = $1")
            .bind(version_id)
            .fetch_optional(&mut **self.tx)
            .await?;
        row.as_ref().map(approval_request_row).transpose()
    }

    async fn update_approval_request_status(
        &mut self,
        id: Uuid,
        status: ApprovalStatus,
        current_approvals: u32,
    ) -> EngineResult<()> {
        sqlx::query(
            "UPDATE approval_requests SET status = $1, current_approvals = $2 WHERE id = $3",
        )
        .bind(approval_status_str(status))
        .bind(current_approvals as i32)
        .bind(id)
        .execute(&mut **self.tx)
        .await?;
        Ok(())
    }

    async fn create_approval_vote(&mut self, vote: ApprovalVote) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO approval_votes (id, request_id, approver_id, vote, reason, voted_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(vote.id)
        .bind(vote.request_id)
        .bind(vote.approver_id)
        .bind(vote_str(vote.vote))
        .bind(&vote.reason)
        .bind(vote.voted_at)
        .execute(&mut **self.tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                EngineError::AlreadyVoted(vote.approver_id)
            }
            other => EngineError::from(other),
        })?;
        Ok(())
    }

    async fn has_voted(&mut self, request_id: Uuid, approver_id: Uuid) -> EngineResult<bool> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM approval_votes WHERE request_id = $1 AND approver_id = $2",
        )
        .bind(request_id)
        .bind(approver_id)
        .fetch_optional(&mut **self.tx)
        .await?;
        Ok(row.is_some())
    }

    async fn get_current_deployment(&mut self, agent_id: &str) -> EngineResult<Option<Deployment>> {
        let row = sqlx::query(
            "SELECT * FROM deployments WHERE agent_id = $1 AND status = 'active' LIMIT 1",
        )
        .bind(agent_id)
        .fetch_optional(&mut **self.tx)
        .await?;
        row.as_ref().map(deployment_row).transpose()
    }

    async fn create_deployment(&mut self, deployment: Deployment) -> EngineResult<Deployment> {
        let row = sqlx::query(
            r#"
            INSERT INTO deployments
                (id, version_id, agent_id, deployed_by, deployed_at, status, previous_deployment_id,
                 metrics_baseline, metrics_post_deployment, regression_detected,
                 rolled_back_at, rolled_back_by, rollback_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING *
            "#,
        )
        .bind(deployment.id)
        .bind(deployment.version_id)
        .bind(&deployment.agent_id)
        .bind(deployment.deployed_by)
        .bind(deployment.deployed_at)
        .bind(deployment_status_str(deployment.status))
        .bind(deployment.previous_deployment_id)
        .bind(
            deployment
                .metrics_baseline
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| EngineError::StoreFailure(e.to_string()))?,
        )
        .bind(
            deployment
                .metrics_post_deployment
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| EngineError::StoreFailure(e.to_string()))?,
        )
        .bind(deployment.regression_detected)
        .bind(deployment.rolled_back_at)
        .bind(deployment.rolled_back_by)
        .bind(&deployment.rollback_reason)
        .fetch_one(&mut **self.tx)
        .await?;
        deployment_row(&row)
    }

    async fn set_deployment_status(
        &mut self,
        id: Uuid,
        status: DeploymentStatus,
    ) -> EngineResult<()> {
        sqlx::query("UPDATE deployments SET status = $1 WHERE id = $2")
            .bind(deployment_status_str(status))
            .bind(id)
            .execute(&mut **self.tx)
            .await?;
        Ok(())
    }

    async fn rollback_deployment(
        &mut self,
        id: Uuid,
        rolled_back_at: DateTime<Utc>,
        rolled_back_by: Uuid,
        reason: Option<String>,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE deployments
               SET status = 'rolled_back', rolled_back_at = $1, rolled_back_by = $2, rollback_reason = $3
             WHERE id = $4
            "#,
        )
        .bind(rolled_back_at)
        .bind(rolled_back_by)
        .bind(reason)
        .bind(id)
        .execute(&mut **self.tx)
        .await?;
        Ok(())
    }

    async fn update_deployment_metrics(
        &mut self,
        id: Uuid,
        baseline: Option<MetricsWindow>,
        post_deployment: Option<MetricsWindow>,
        regression_detected: bool,
    ) -> EngineResult<()> {
        let baseline_json = baseline
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| EngineError::StoreFailure(e.to_string()))?;
        let post_json = post_deployment
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| EngineError::StoreFailure(e.to_string()))?;
        sqlx::query(
            r#"
            UPDATE deployments
               SET metrics_baseline = COALESCE($1, metrics_baseline),
                   metrics_post_deployment = COALESCE($2, metrics_post_deployment),
                   regression_detected = $3
             WHERE id = $4
            "#,
        )
        .bind(baseline_json)
        .bind(post_json)
        .bind(regression_detected)
        .bind(id)
        .execute(&mut **self.tx)
        .await?;
        Ok(())
    }

    async fn set_agent_production_version(
        &mut self,
        agent_id: &str,
        version_id: Option<Uuid>,
    ) -> EngineResult<()> {
        sqlx::query("UPDATE agents SET current_production_version_id = $1 WHERE id = $2")
            .bind(version_id)
            .bind(agent_id)
            .execute(&mut **self.tx)
            .await?;
        Ok(())
    }

    async fn get_agent(&mut self, agent_id: &str) -> EngineResult<Option<Agent>> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = $1")
            .bind(agent_id)
            .fetch_optional(&mut **self.tx)
            .await?;
        Ok(row.map(|r| Agent {
            id: r.get("id"),
            name: r.get("name"),
            current_production_version_id: r.get("current_production_version_id"),
        }))
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn ping(&self) -> bool {
        PostgresStore::ping(self).await
    }

    async fn get_or_create_agent(&self, agent_id: &str, name: &str) -> EngineResult<Agent> {
        let row = sqlx::query(
            r#"
            INSERT INTO agents (id, name, current_production_version_id)
            VALUES ($1, $2, NULL)
            ON CONFLICT (id) DO UPDATE SET id = agents.id
            RETURNING *
            "#,
        )
        .bind(agent_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(Agent {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            current_production_version_id: row.try_get("current_production_version_id")?,
        })
    }

    async fn get_agent(&self, agent_id: &str) -> EngineResult<Option<Agent>> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = $1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Agent {
            id: r.get("id"),
            name: r.get("name"),
            current_production_version_id: r.get("current_production_version_id"),
        }))
    }

    async fn get_main_branch(&self, agent_id: &str) -> EngineResult<Branch> {
        if let Some(row) = sqlx::query("SELECT * FROM branches WHERE agent_id = $1 AND is_main")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(Branch {
                id: row.try_get("id")?,
                agent_id: row.try_get("agent_id")?,
                name: row.try_get("name")?,
                parent_branch_id: row.try_get("parent_branch_id")?,
                is_main: row.try_get("is_main")?,
                created_at: row.try_get("created_at")?,
            });
        }
        let branch = Branch::main(agent_id);
        self.create_branch(branch).await
    }

    async fn create_branch(&self, branch: Branch) -> EngineResult<Branch> {
        let row = sqlx::query(
            r#"
            INSERT INTO branches (id, agent_id, name, parent_branch_id, is_main, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(branch.id)
        .bind(&branch.agent_id)
        .bind(&branch.name)
        .bind(branch.parent_branch_id)
        .bind(branch.is_main)
        .bind(branch.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                EngineError::InvalidInput(format!(
                    "branch {} already exists for agent {}",
                    branch.name, branch.agent_id
                ))
            }
            other => EngineError::from(other),
        })?;
        Ok(Branch {
            id: row.try_get("id")?,
            agent_id: row.try_get("agent_id")?,
            name: row.try_get("name")?,
            parent_branch_id: row.try_get("parent_branch_id")?,
            is_main: row.try_get("is_main")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn list_branches(&self, agent_id: &str) -> EngineResult<Vec<Branch>> {
        let rows = sqlx::query("SELECT * FROM branches WHERE agent_id = $1")
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(Branch {
                    id: row.try_get("id")?,
                    agent_id: row.try_get("agent_id")?,
                    name: row.try_get("name")?,
                    parent_branch_id: row.try_get("parent_branch_id")?,
                    is_main: row.try_get("is_main")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn get_branch(&self, id: Uuid) -> EngineResult<Option<Branch>> {
        let row = sqlx::query("SELECT * FROM branches WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(Branch {
                id: row.try_get("id")?,
                agent_id: row.try_get("agent_id")?,
                name: row.try_get("name")?,
                parent_branch_id: row.try_get("parent_branch_id")?,
                is_main: row.try_get("is_main")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn branch_has_versions(&self, branch_id: Uuid) -> EngineResult<bool> {
        let row = sqlx::query("SELECT 1 AS present FROM prompt_versions WHERE branch_id = $1 LIMIT 1")
            .bind(branch_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn delete_branch(&self, id: Uuid) -> EngineResult<()> {
        sqlx::query("DELETE FROM branches WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_prompt_version(&self, id: Uuid) -> EngineResult<Option<PromptVersion>> {
        let row = sqlx::query("SELECT * FROM prompt_versions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(version_row).transpose()
    }

    async fn create_prompt_version(
        &self,
        agent_id: &str,
        branch_id: Uuid,
        new_version: NewPromptVersion,
    ) -> EngineResult<PromptVersion> {
        let mut tx = self.pool.begin().await?;
        let version = next_version_number(&mut *tx, branch_id).await?;
        let created = insert_prompt_version(&mut *tx, agent_id, branch_id, new_version, version).await?;
        tx.commit().await?;
        Ok(created)
    }

    async fn list_versions_for_agent(&self, agent_id: &str) -> EngineResult<Vec<PromptVersion>> {
        let rows = sqlx::query("SELECT * FROM prompt_versions WHERE agent_id = $1")
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(version_row).collect()
    }

    async fn list_versions_for_branch(&self, branch_id: Uuid) -> EngineResult<Vec<PromptVersion>> {
        let rows = sqlx::query("SELECT * FROM prompt_versions WHERE branch_id = $1")
            .bind(branch_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(version_row).collect()
    }

    async fn set_version_status(&self, id: Uuid, status: VersionStatus) -> EngineResult<()> {
        sqlx::query("UPDATE prompt_versions SET status = $1 WHERE id = $2")
            .bind(version_status_str(status))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_fitness(&self, id: Uuid, fitness: Fitness) -> EngineResult<()> {
        let fitness_json =
            serde_json::to_value(&fitness).map_err(|e| EngineError::StoreFailure(e.to_string()))?;
        sqlx::query("UPDATE prompt_versions SET fitness = $1 WHERE id = $2")
            .bind(fitness_json)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_approval_request(
        &self,
        request: ApprovalRequest,
    ) -> EngineResult<ApprovalRequest> {
        let row = sqlx::query(
            r#"
            INSERT INTO approval_requests
                (id, version_id, agent_id, requested_by, requested_at,
                 required_approvals, current_approvals, status, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(request.id)
        .bind(request.version_id)
        .bind(&request.agent_id)
        .bind(&request.requested_by)
        .bind(request.requested_at)
        .bind(request.required_approvals as i32)
        .bind(request.current_approvals as i32)
        .bind(approval_status_str(request.status))
        .bind(request.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                EngineError::AlreadyPending(request.version_id)
            }
            other => EngineError::from(other),
        })?;
        approval_request_row(&row)
    }

    async fn get_approval_request(
        &self,
        version_id: Uuid,
    ) -> EngineResult<Option<ApprovalRequest>> {
        let row = sqlx::query("SELECT * FROM approval_requests WHERE version_id = $1")
            .bind(version_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(approval_request_row).transpose()
    }

    async fn update_approval_request_status(
        &self,
        id: Uuid,
        status: ApprovalStatus,
        current_approvals: u32,
    ) -> EngineResult<()> {
        sqlx::query(
            "UPDATE approval_requests SET status = $1, current_approvals = $2 WHERE id = $3",
        )
        .bind(approval_status_str(status))
        .bind(current_approvals as i32)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_approval_vote(&self, vote: ApprovalVote) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO approval_votes (id, request_id, approver_id, vote, reason, voted_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(vote.id)
        .bind(vote.request_id)
        .bind(vote.approver_id)
        .bind(vote_str(vote.vote))
        .bind(&vote.reason)
        .bind(vote.voted_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                EngineError::AlreadyVoted(vote.approver_id)
            }
            other => EngineError::from(other),
        })?;
        Ok(())
    }

    async fn has_voted(&self, request_id: Uuid, approver_id: Uuid) -> EngineResult<bool> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM approval_votes WHERE request_id = $1 AND approver_id = $2",
        )
        .bind(request_id)
        .bind(approver_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn get_approval_votes(&self, request_id: Uuid) -> EngineResult<Vec<ApprovalVote>> {
        let rows = sqlx::query("SELECT * FROM approval_votes WHERE request_id = $1")
            .bind(request_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let vote_text: String = row.try_get("vote")?;
                Ok(ApprovalVote {
                    id: row.try_get("id")?,
                    request_id: row.try_get("request_id")?,
                    approver_id: row.try_get("approver_id")?,
                    vote: if vote_text == "reject" { Vote::Reject } else { Vote::Approve },
                    reason: row.try_get("reason")?,
                    voted_at: row.try_get("voted_at")?,
                })
            })
            .collect()
    }

    async fn list_pending_approvals(&self) -> EngineResult<Vec<ApprovalRequest>> {
        let rows = sqlx::query("SELECT * FROM approval_requests WHERE status = 'pending'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(approval_request_row).collect()
    }

    async fn expire_pending_approvals_before(&self, now: DateTime<Utc>) -> EngineResult<u64> {
        let result = sqlx::query(
            "UPDATE approval_requests SET status = 'expired' WHERE status = 'pending' AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn create_deployment(&self, deployment: Deployment) -> EngineResult<Deployment> {
        let mut tx = self.pool.begin().await?;
        let mut pg_tx = PgTx { tx: &mut tx };
        let created = pg_tx.create_deployment(deployment).await?;
        tx.commit().await?;
        Ok(created)
    }

    async fn get_deployment(&self, id: Uuid) -> EngineResult<Option<Deployment>> {
        let row = sqlx::query("SELECT * FROM deployments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(deployment_row).transpose()
    }

    async fn get_current_deployment(&self, agent_id: &str) -> EngineResult<Option<Deployment>> {
        let row = sqlx::query(
            "SELECT * FROM deployments WHERE agent_id = $1 AND status = 'active' LIMIT 1",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(deployment_row).transpose()
    }

    async fn get_deployment_history(
        &self,
        agent_id: &str,
        limit: u32,
    ) -> EngineResult<Vec<Deployment>> {
        let rows = sqlx::query(
            "SELECT * FROM deployments WHERE agent_id = $1 ORDER BY deployed_at DESC LIMIT $2",
        )
        .bind(agent_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(deployment_row).collect()
    }

    async fn list_active_deployments_due_for_evaluation(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> EngineResult<Vec<Deployment>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM deployments
             WHERE status = 'active' AND NOT regression_detected
               AND deployed_at BETWEEN $1 AND $2
            "#,
        )
        .bind(window_start)
        .bind(window_end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(deployment_row).collect()
    }

    async fn update_deployment_metrics(
        &self,
        id: Uuid,
        baseline: Option<MetricsWindow>,
        post_deployment: Option<MetricsWindow>,
        regression_detected: bool,
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        let mut pg_tx = PgTx { tx: &mut tx };
        pg_tx
            .update_deployment_metrics(id, baseline, post_deployment, regression_detected)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_reviewer(&self, id: Uuid) -> EngineResult<Option<Reviewer>> {
        let row = sqlx::query("SELECT * FROM reviewers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(Reviewer {
                id: row.try_get("id")?,
                email: row.try_get("email")?,
                name: row.try_get("name")?,
                role: parse_role(row.try_get("role")?),
                created_at: row.try_get("created_at")?,
                last_active_at: row.try_get("last_active_at")?,
            })
        })
        .transpose()
    }

    async fn any_admin_reviewer(&self) -> EngineResult<Option<Reviewer>> {
        let row = sqlx::query("SELECT * FROM reviewers WHERE role = 'admin' LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(Reviewer {
                id: row.try_get("id")?,
                email: row.try_get("email")?,
                name: row.try_get("name")?,
                role: parse_role(row.try_get("role")?),
                created_at: row.try_get("created_at")?,
                last_active_at: row.try_get("last_active_at")?,
            })
        })
        .transpose()
    }

    async fn get_trajectory_metrics(
        &self,
        agent_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<Trajectory>> {
        let rows = sqlx::query(
            "SELECT * FROM trajectories WHERE agent_id = $1 AND occurred_at BETWEEN $2 AND $3",
        )
        .bind(agent_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trajectory_row).collect()
    }

    async fn get_version_metrics(
        &self,
        version_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<Trajectory>> {
        let rows = sqlx::query(
            "SELECT * FROM trajectories WHERE version_id = $1 AND occurred_at BETWEEN $2 AND $3",
        )
        .bind(version_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trajectory_row).collect()
    }

    async fn list_comparison_feedback_for_version(
        &self,
        version_id: Uuid,
    ) -> EngineResult<Vec<ComparisonFeedback>> {
        let rows = sqlx::query(
            "SELECT * FROM comparison_feedback WHERE version_a_id = $1 OR version_b_id = $1",
        )
        .bind(version_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let preference: Option<String> = row.try_get("preference")?;
                Ok(ComparisonFeedback {
                    id: row.try_get("id")?,
                    version_a_id: row.try_get("version_a_id")?,
                    version_b_id: row.try_get("version_b_id")?,
                    preference: preference.map(|p| match p.as_str() {
                        "a" => Preference::A,
                        "b" => Preference::B,
                        _ => Preference::Tie,
                    }),
                    skipped: row.try_get("skipped")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn list_trajectories_for_version(&self, version_id: Uuid) -> EngineResult<Vec<Trajectory>> {
        let rows = sqlx::query("SELECT * FROM trajectories WHERE version_id = $1")
            .bind(version_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(trajectory_row).collect()
    }

    async fn create_regression_report(&self, report: RegressionReport) -> EngineResult<()> {
        let metrics_json = serde_json::to_value(&report.metrics)
            .map_err(|e| EngineError::StoreFailure(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO regression_reports
                (deployment_id, detected, severity, metrics, recommendations, evaluated_at, auto_rollback_triggered)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(report.deployment_id)
        .bind(report.detected)
        .bind(report.severity.map(severity_str))
        .bind(metrics_json)
        .bind(&report.recommendations)
        .bind(report.evaluated_at)
        .bind(report.auto_rollback_triggered)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_latest_regression_report(
        &self,
        deployment_id: Uuid,
    ) -> EngineResult<Option<RegressionReport>> {
        let row = sqlx::query(
            "SELECT * FROM regression_reports WHERE deployment_id = $1 ORDER BY evaluated_at DESC LIMIT 1",
        )
        .bind(deployment_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            let metrics: serde_json::Value = row.try_get("metrics")?;
            let severity: Option<String> = row.try_get("severity")?;
            Ok(RegressionReport {
                deployment_id: row.try_get("deployment_id")?,
                detected: row.try_get("detected")?,
                severity: severity.map(|s| parse_severity(&s)),
                metrics: serde_json::from_value(metrics)
                    .map_err(|e| EngineError::StoreFailure(e.to_string()))?,
                recommendations: row.try_get("recommendations")?,
                evaluated_at: row.try_get("evaluated_at")?,
                auto_rollback_triggered: row.try_get("auto_rollback_triggered")?,
            })
        })
        .transpose()
    }

    async fn with_transaction(
        &self,
        f: Box<dyn FnOnce(&mut dyn StoreTx) -> BoxFuture<'_, EngineResult<()>> + Send + '_>,
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        let result = {
            let mut pg_tx = PgTx { tx: &mut tx };
            f(&mut pg_tx).await
        };
        match result {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }
}
