use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// GET /metrics: Prometheus text exposition of pipeline counters.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every metric the server and worker emit.
pub fn describe_metrics() {
    metrics::describe_counter!("release_submissions_total", "Release submissions, by created or reused");
    metrics::describe_counter!("capture_tasks_enqueued_total", "Capture tasks put on the queue");
    metrics::describe_counter!("capture_attempts_total", "Capture attempts started");
    metrics::describe_counter!("capture_retries_total", "Capture attempts scheduled for retry");
    metrics::describe_counter!("capture_failures_total", "Capture tasks finalized as failed");
    metrics::describe_counter!("capture_deferrals_total", "Tasks requeued because their host was saturated");
    metrics::describe_histogram!("capture_duration_seconds", "Time spent in one capture attempt");
    metrics::describe_counter!("tasks_reported_total", "Task outcomes recorded in the completion ledger");
    metrics::describe_counter!("duplicate_reports_total", "Reports ignored because the task already had an outcome");
    metrics::describe_counter!("comparisons_total", "Comparison results recorded, by classification");
    metrics::describe_histogram!("comparison_duration_seconds", "Time to diff one screenshot pair");
    metrics::describe_counter!("releases_completed_total", "Releases that reached done");
    metrics::describe_counter!("releases_cancelled_total", "Releases cancelled");
    metrics::describe_histogram!("release_duration_seconds", "Time from submission to done");
    metrics::describe_counter!("notifications_total", "Notification events, by outcome");
    metrics::describe_counter!("retention_blobs_deleted_total", "Blobs removed by the retention sweep");
    metrics::describe_gauge!("capture_queue_depth", "Capture tasks waiting in the queue");
}
