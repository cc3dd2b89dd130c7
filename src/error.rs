//! Domain error taxonomy and its mapping onto the HTTP boundary.
//!
//! Every fallible operation in `services::*` and `store::*` returns
//! `Result<T, EngineError>`. Handlers in `http` never construct a
//! `StatusCode` themselves — `IntoResponse` below is the single place that
//! decision is made, since this service has far more error-producing call
//! sites than a single-endpoint server would.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("version not found: {0}")]
    VersionNotFound(Uuid),

    #[error("branch not found: {0}")]
    BranchNotFound(Uuid),

    #[error("approval request not found for version {0}")]
    ApprovalRequestNotFound(Uuid),

    #[error("deployment not found: {0}")]
    DeploymentNotFound(Uuid),

    #[error("reviewer not found: {0}")]
    ReviewerNotFound(Uuid),

    #[error("actor {0} lacks the required role for this action")]
    PermissionDenied(Uuid),

    #[error("no admin reviewer is available to act as auto-rollback actor")]
    NoAdmin,

    #[error("approval request for version {0} is already pending")]
    AlreadyPending(Uuid),

    #[error("version {0} is already approved")]
    AlreadyApproved(Uuid),

    #[error("approval request for version {0} is not pending")]
    NotPending(Uuid),

    #[error("approver {0} has already voted on this request")]
    AlreadyVoted(Uuid),

    #[error("version {0} has not been approved for deployment")]
    NotApproved(Uuid),

    #[error("deployment {0} has already been rolled back")]
    AlreadyRolledBack(Uuid),

    #[error("deployment {0} has no previous deployment to roll back to")]
    NoPreviousDeployment(Uuid),

    #[error("branch {0} still owns versions and cannot be deleted")]
    BranchNotEmpty(Uuid),

    #[error("source and target branch tips are already merged")]
    AlreadyMerged,

    #[error("branch {0} has no versions to merge")]
    EmptyBranch(Uuid),

    #[error("approval request for version {0} has expired")]
    Expired(Uuid),

    #[error("{0}")]
    InvalidInput(String),

    #[error("store failure: {0}")]
    StoreFailure(String),
}

impl EngineError {
    fn status_code(&self) -> StatusCode {
        use EngineError::*;
        match self {
            AgentNotFound(_)
            | VersionNotFound(_)
            | BranchNotFound(_)
            | ApprovalRequestNotFound(_)
            | DeploymentNotFound(_)
            | ReviewerNotFound(_) => StatusCode::NOT_FOUND,

            PermissionDenied(_) | NoAdmin => StatusCode::FORBIDDEN,

            AlreadyPending(_)
            | AlreadyApproved(_)
            | NotPending(_)
            | AlreadyVoted(_)
            | NotApproved(_)
            | AlreadyRolledBack(_)
            | NoPreviousDeployment(_)
            | BranchNotEmpty(_)
            | AlreadyMerged
            | EmptyBranch(_)
            | Expired(_) => StatusCode::CONFLICT,

            InvalidInput(_) => StatusCode::BAD_REQUEST,

            StoreFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal error");
        } else {
            tracing::warn!(error = %self, "request rejected");
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::StoreFailure(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
