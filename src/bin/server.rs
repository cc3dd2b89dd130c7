//! promptops-engine server binary: wires up the Postgres store, every
//! service, the notification gateway, and the background scheduler, then
//! serves the HTTP surface.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use promptops_engine::http::{router, AppState};
use promptops_engine::notifications::NotificationGateway;
use promptops_engine::services::approval::ApprovalService;
use promptops_engine::services::deployment::{DeploymentConfig, DeploymentController};
use promptops_engine::services::metrics::MetricsService;
use promptops_engine::services::regression::{RegressionConfig, RegressionDetector};
use promptops_engine::services::version_graph::VersionGraph;
use promptops_engine::store::postgres::PostgresStore;
use promptops_engine::store::Store;
use promptops_engine::{scheduler::{Scheduler, SchedulerConfig}, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let postgres = PostgresStore::connect(&config.database_url).await?;
    let store: Arc<dyn Store> = Arc::new(postgres);

    let notifications = Arc::new(NotificationGateway::new(
        config.webhook_url.clone(),
        config.notification_enabled,
    ));

    let version_graph = Arc::new(VersionGraph::new(store.clone()));
    let approval = Arc::new(ApprovalService::new(store.clone(), notifications.clone()));
    let metrics = Arc::new(MetricsService::new(store.clone(), config.min_sample_size));
    let detector = Arc::new(RegressionDetector::new(
        store.clone(),
        metrics.clone(),
        notifications.clone(),
        RegressionConfig {
            success_rate_threshold: config.success_rate_threshold,
            efficiency_threshold: config.efficiency_threshold,
            min_sample_size: config.min_sample_size,
            evaluation_window_minutes: config.evaluation_window_minutes,
        },
    ));
    let deployment = Arc::new(DeploymentController::new(
        store.clone(),
        metrics.clone(),
        detector.clone(),
        notifications.clone(),
        DeploymentConfig { baseline_window_minutes: config.baseline_window_minutes },
    ));

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        approval.clone(),
        detector.clone(),
        deployment.clone(),
        SchedulerConfig { evaluation_window_minutes: config.evaluation_window_minutes },
    ));
    let _scheduler_handles = scheduler.spawn();

    let port = config.port;
    let state = Arc::new(AppState {
        store,
        version_graph,
        approval,
        metrics,
        regression: detector,
        deployment,
        notifications,
        config: Arc::new(config),
    });

    let app = router(state);
    let addr = format!("0.0.0.0:{port}");
    tracing::info!(%addr, "promptops-engine listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
