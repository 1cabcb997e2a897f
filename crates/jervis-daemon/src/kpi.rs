use anyhow::Result;
use jervis_core::staging::StagingStore;
use jervis_core::types::KpiSnapshot;
use jervis_telemetry::metrics::global_metrics;
use tracing::info;

/// Collects KPI snapshots from the staging store and surfaces them through
/// both structured logs and the in-process metrics collector.
pub struct KpiCollector;

impl KpiCollector {
    pub fn new() -> Self {
        Self
    }

    /// Compute a snapshot, log it, and publish gauges for the counters that
    /// matter for alerting (queue depth, failure count).
    pub async fn collect_snapshot(&self, store: &StagingStore) -> Result<KpiSnapshot> {
        let snapshot = store
            .compute_kpi_snapshot()
            .await
            .map_err(|e| anyhow::anyhow!("failed to compute kpi snapshot: {}", e))?;

        info!(
            artifacts_new = snapshot.artifacts_new,
            artifacts_indexing = snapshot.artifacts_indexing,
            artifacts_indexed = snapshot.artifacts_indexed,
            artifacts_failed = snapshot.artifacts_failed,
            tasks_ready_for_qualification = snapshot.tasks_ready_for_qualification,
            tasks_qualifying = snapshot.tasks_qualifying,
            tasks_ready_for_gpu = snapshot.tasks_ready_for_gpu,
            tasks_dispatched_gpu = snapshot.tasks_dispatched_gpu,
            tasks_python_orchestrating = snapshot.tasks_python_orchestrating,
            tasks_done = snapshot.tasks_done,
            tasks_error = snapshot.tasks_error,
            timestamp = %snapshot.timestamp,
            "kpi snapshot"
        );

        let metrics = global_metrics();
        metrics.set_gauge("jervis_artifacts_new", snapshot.artifacts_new as i64);
        metrics.set_gauge("jervis_artifacts_indexing", snapshot.artifacts_indexing as i64);
        metrics.set_gauge("jervis_artifacts_failed", snapshot.artifacts_failed as i64);
        metrics.set_gauge(
            "jervis_tasks_ready_for_qualification",
            snapshot.tasks_ready_for_qualification as i64,
        );
        metrics.set_gauge("jervis_tasks_ready_for_gpu", snapshot.tasks_ready_for_gpu as i64);
        metrics.set_gauge(
            "jervis_tasks_python_orchestrating",
            snapshot.tasks_python_orchestrating as i64,
        );
        metrics.set_gauge("jervis_tasks_error", snapshot.tasks_error as i64);

        Ok(snapshot)
    }
}

impl Default for KpiCollector {
    fn default() -> Self {
        Self::new()
    }
}
