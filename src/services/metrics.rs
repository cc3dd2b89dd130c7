//! Window-based trajectory aggregation, comparison arithmetic, and the
//! statistical tests backing the regression detector.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::domain::{MetricsComparison, MetricsWindow, Trajectory};
use crate::error::EngineResult;
use crate::store::Store;

pub struct MetricsService {
    store: Arc<dyn Store>,
    min_sample_size: u64,
}

impl MetricsService {
    pub fn new(store: Arc<dyn Store>, min_sample_size: u64) -> Self {
        Self { store, min_sample_size }
    }

    pub async fn capture_baseline(
        &self,
        agent_id: &str,
        baseline_window_minutes: i64,
    ) -> EngineResult<MetricsWindow> {
        let end = Utc::now();
        let start = end - Duration::minutes(baseline_window_minutes);
        let trajectories = self.store.get_trajectory_metrics(agent_id, start, end).await?;
        Ok(aggregate_window(&trajectories, start, end))
    }

    pub async fn window_for_agent(
        &self,
        agent_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<MetricsWindow> {
        let trajectories = self.store.get_trajectory_metrics(agent_id, start, end).await?;
        Ok(aggregate_window(&trajectories, start, end))
    }

    pub async fn window_for_version(
        &self,
        version_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<MetricsWindow> {
        let trajectories = self.store.get_version_metrics(version_id, start, end).await?;
        Ok(aggregate_window(&trajectories, start, end))
    }

    pub fn compare(&self, before: MetricsWindow, after: MetricsWindow) -> MetricsComparison {
        compare_metrics(before, after, self.min_sample_size)
    }
}

fn relative_change(before: f64, after: f64) -> f64 {
    if before > 0.0 {
        (after - before) / before
    } else if after > 0.0 {
        1.0
    } else {
        0.0
    }
}

pub fn aggregate_window(
    trajectories: &[Trajectory],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> MetricsWindow {
    let total = trajectories.len() as u64;
    if total == 0 {
        return MetricsWindow::empty(start, end);
    }
    let success_count = trajectories.iter().filter(|t| t.success).count() as u64;
    let error_count = trajectories.iter().filter(|t| t.error).count() as u64;
    let efficiencies: Vec<f64> = trajectories.iter().filter_map(|t| t.efficiency).collect();
    let avg_efficiency = if efficiencies.is_empty() {
        0.0
    } else {
        efficiencies.iter().sum::<f64>() / efficiencies.len() as f64
    };
    let avg_steps = trajectories.iter().map(|t| t.steps as f64).sum::<f64>() / total as f64;
    let avg_duration_ms =
        trajectories.iter().map(|t| t.duration_ms as f64).sum::<f64>() / total as f64;

    MetricsWindow {
        success_rate: success_count as f64 / total as f64,
        avg_efficiency,
        error_rate: error_count as f64 / total as f64,
        trajectory_count: total,
        avg_steps,
        avg_duration_ms,
        period_start: start,
        period_end: end,
    }
}

/// Two-proportion z-test on `successRate`, requiring `n1, n2 >= 30`.
pub fn is_statistically_significant(before: MetricsWindow, after: MetricsWindow) -> bool {
    let n1 = before.trajectory_count as f64;
    let n2 = after.trajectory_count as f64;
    if n1 < 30.0 || n2 < 30.0 {
        return false;
    }
    let p1 = before.success_rate;
    let p2 = after.success_rate;
    let p_pool = (p1 * n1 + p2 * n2) / (n1 + n2);
    let se = (p_pool * (1.0 - p_pool) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if se == 0.0 {
        return false;
    }
    let z = (p1 - p2).abs() / se;
    z > 1.96
}

pub fn compare_metrics(
    before: MetricsWindow,
    after: MetricsWindow,
    min_sample_size: u64,
) -> MetricsComparison {
    MetricsComparison {
        success_rate_change: relative_change(before.success_rate, after.success_rate),
        error_rate_change: relative_change(before.error_rate, after.error_rate),
        efficiency_change: relative_change(before.avg_efficiency, after.avg_efficiency),
        sample_size_sufficient: after.trajectory_count >= min_sample_size,
        statistically_significant: is_statistically_significant(before, after),
        before,
        after,
    }
}

/// `z` for a two-sided confidence level; only the three supported levels are
/// supported.
fn z_for_level(level: f64) -> f64 {
    if (level - 0.99).abs() < f64::EPSILON {
        2.576
    } else if (level - 0.90).abs() < f64::EPSILON {
        1.645
    } else {
        1.96
    }
}

/// Confidence interval around `metrics.after.success_rate`, clamped to
/// `[0, 1]`.
pub fn confidence_interval(metrics: &MetricsComparison, level: f64) -> (f64, f64) {
    let p = metrics.after.success_rate;
    let n = metrics.after.trajectory_count as f64;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let z = z_for_level(level);
    let se = (p * (1.0 - p) / n).sqrt();
    ((p - z * se).clamp(0.0, 1.0), (p + z * se).clamp(0.0, 1.0))
}

/// Weighted mean of a metric across windows, weighted by `trajectoryCount`.
pub fn trend<F: Fn(&MetricsWindow) -> f64>(windows: &[MetricsWindow], metric: F) -> Option<f64> {
    let total_weight: u64 = windows.iter().map(|w| w.trajectory_count).sum();
    if total_weight == 0 {
        return None;
    }
    let weighted_sum: f64 = windows
        .iter()
        .map(|w| metric(w) * w.trajectory_count as f64)
        .sum();
    Some(weighted_sum / total_weight as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(success_rate: f64, trajectory_count: u64) -> MetricsWindow {
        let now = Utc::now();
        MetricsWindow {
            success_rate,
            avg_efficiency: 0.5,
            error_rate: 1.0 - success_rate,
            trajectory_count,
            avg_steps: 5.0,
            avg_duration_ms: 1000.0,
            period_start: now - Duration::minutes(30),
            period_end: now,
        }
    }

    #[test]
    fn below_thirty_samples_is_never_significant() {
        assert!(!is_statistically_significant(window(0.9, 29), window(0.5, 100)));
        assert!(!is_statistically_significant(window(0.9, 100), window(0.5, 29)));
    }

    #[test]
    fn critical_drop_is_significant() {
        assert!(is_statistically_significant(window(0.90, 100), window(0.65, 80)));
    }

    #[test]
    fn zero_before_and_after_yields_zero_change() {
        let cmp = compare_metrics(window(0.0, 50), window(0.0, 50), 50);
        assert_eq!(cmp.success_rate_change, 0.0);
    }

    #[test]
    fn sample_size_sufficiency_uses_post_window_count() {
        let cmp = compare_metrics(window(0.8, 100), window(0.4, 20), 50);
        assert!(!cmp.sample_size_sufficient);
    }
}
