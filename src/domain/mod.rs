//! Core data model shared by every service.
//!
//! These types mirror the persisted shape of the release-engineering store:
//! agents, branches, prompt versions, approvals, deployments, regression
//! reports, and reviewers. Nothing here talks to a database or the network —
//! that belongs to `store` and `http` respectively.

pub mod agent;
pub mod approval;
pub mod branch;
pub mod deployment;
pub mod feedback;
pub mod metrics;
pub mod reviewer;
pub mod trajectory;
pub mod version;

pub use agent::Agent;
pub use approval::{ApprovalRequest, ApprovalStatus, ApprovalVote, Vote};
pub use branch::Branch;
pub use deployment::{Deployment, DeploymentStatus, RegressionReport, Severity};
pub use feedback::{ComparisonFeedback, Preference};
pub use metrics::{Fitness, MetricsComparison, MetricsWindow, PromptContent};
pub use reviewer::{Reviewer, Role};
pub use trajectory::Trajectory;
pub use version::{CreatedBy, PromptVersion, VersionStatus};
