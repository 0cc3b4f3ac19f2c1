//! API request handlers

use anyhow::Result;
use serde_json::Value;

use super::models::RunOptions;
use crate::catalog::ItemStore;
use crate::queue::{BatchSummary, EnqueueResult, ProcessingQueueController};

/// Handle health check requests
pub async fn health_check(controller: &ProcessingQueueController) -> Result<Value> {
    Ok(serde_json::json!({
        "status": "healthy",
        "service": "credits-detector",
        "version": env!("CARGO_PKG_VERSION"),
        "worker_active": controller.is_worker_active(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Queue one episode; `None` when the id is unknown
pub async fn process_episode(
    controller: &ProcessingQueueController,
    store: &dyn ItemStore,
    episode_id: &str,
    options: RunOptions,
) -> Result<Option<Value>> {
    let Some(episode) = store.get_by_id(episode_id).await? else {
        return Ok(None);
    };

    let label = episode.label();
    let result = controller.enqueue(episode, options.manual, options.dry_run).await;
    Ok(Some(serde_json::json!({
        "episode": label,
        "result": enqueue_result_name(result),
        "queued": controller.queued_len(),
    })))
}

pub async fn process_series(
    controller: &ProcessingQueueController,
    series_id: &str,
    options: RunOptions,
) -> Result<Value> {
    let summary = controller.enqueue_series(series_id, options.dry_run).await?;
    Ok(summary_json(&summary))
}

pub async fn process_library(
    controller: &ProcessingQueueController,
    options: RunOptions,
) -> Result<Value> {
    let summary = controller.enqueue_library(options.dry_run).await?;
    Ok(summary_json(&summary))
}

pub fn cancel(controller: &ProcessingQueueController) -> Value {
    controller.cancel();
    serde_json::json!({ "cancelled": true })
}

pub fn clear_queue(controller: &ProcessingQueueController) -> Value {
    let removed = controller.clear_queue();
    serde_json::json!({ "removed": removed })
}

pub fn progress(controller: &ProcessingQueueController) -> Result<Value> {
    Ok(serde_json::to_value(controller.get_progress())?)
}

pub fn start_debug(controller: &ProcessingQueueController) -> Value {
    controller.start_debug_capture();
    serde_json::json!({ "capturing": true })
}

/// One-shot read of the debug log
pub fn debug_log(controller: &ProcessingQueueController) -> Option<String> {
    controller.retrieve_debug_log()
}

fn enqueue_result_name(result: EnqueueResult) -> &'static str {
    match result {
        EnqueueResult::Queued => "queued",
        EnqueueResult::AlreadyExists => "already exists",
        EnqueueResult::Duplicate => "duplicate",
        EnqueueResult::Dropped => "dropped",
    }
}

fn summary_json(summary: &BatchSummary) -> Value {
    serde_json::json!({
        "queued": summary.queued,
        "already_exists": summary.already_exists,
        "duplicates": summary.duplicates,
        "dropped": summary.dropped,
        "mode": if summary.precompute { "batch" } else { "sequential" },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_json() {
        let summary = BatchSummary {
            queued: 4,
            dropped: 1,
            precompute: true,
            ..BatchSummary::default()
        };
        let json = summary_json(&summary);
        assert_eq!(json["queued"], 4);
        assert_eq!(json["dropped"], 1);
        assert_eq!(json["mode"], "batch");
        assert_eq!(enqueue_result_name(EnqueueResult::AlreadyExists), "already exists");
    }
}
