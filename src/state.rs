use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use tracing::debug;

pub const STATUS_IDLE: &str = "Idle";
pub const STATUS_PRECOMPUTING: &str = "Pre-computing";
pub const STATUS_PROCESSING: &str = "Processing";
pub const STATUS_COMPLETE: &str = "Complete";
pub const STATUS_DRY_RUN_COMPLETE: &str = "Dry Run Complete";
pub const STATUS_CANCELLED: &str = "Cancelled";

/// Progress of the current or most recent processing run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProgressState {
    pub is_running: bool,
    pub total_items: usize,
    pub processed_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,

    /// Label of the episode being processed
    pub current_item: Option<String>,

    /// Progress of the current item or pre-compute phase, 0..=100
    pub current_item_progress: f64,

    pub status: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    /// Episode label -> failure reason
    pub failure_reasons: BTreeMap<String, String>,

    /// Episode label -> detected credits start as HH:MM:SS
    pub success_details: BTreeMap<String, String>,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            is_running: false,
            total_items: 0,
            processed_items: 0,
            successful_items: 0,
            failed_items: 0,
            current_item: None,
            current_item_progress: 0.0,
            status: STATUS_IDLE.to_string(),
            start_time: None,
            end_time: None,
            failure_reasons: BTreeMap::new(),
            success_details: BTreeMap::new(),
        }
    }
}

impl ProgressState {
    pub fn remaining(&self) -> usize {
        self.total_items.saturating_sub(self.processed_items)
    }

    pub fn success_rate(&self) -> f64 {
        if self.processed_items == 0 {
            0.0
        } else {
            self.successful_items as f64 / self.processed_items as f64 * 100.0
        }
    }
}

/// Shared progress behind a lock; observers only ever get snapshots
#[derive(Debug, Default)]
pub struct ProgressTracker {
    state: RwLock<ProgressState>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ProgressState {
        self.state.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut ProgressState) -> R) -> R {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        f(&mut state)
    }

    /// Start a fresh run with `total` expected items
    pub fn begin_run(&self, total: usize, status: &str) {
        self.update(|state| {
            *state = ProgressState {
                is_running: true,
                total_items: total,
                status: status.to_string(),
                start_time: Some(Utc::now()),
                ..ProgressState::default()
            };
        });
        debug!("📊 Progress reset for {} items", total);
    }

    pub fn add_expected(&self, count: usize) {
        self.update(|state| state.total_items += count);
    }

    pub fn set_status(&self, status: &str) {
        self.update(|state| state.status = status.to_string());
    }

    pub fn set_current(&self, label: Option<String>, progress: f64) {
        self.update(|state| {
            state.current_item = label;
            state.current_item_progress = progress.clamp(0.0, 100.0);
        });
    }

    pub fn record_success(&self, label: &str, timestamp_seconds: f64) {
        self.update(|state| {
            state.processed_items += 1;
            state.successful_items += 1;
            state
                .success_details
                .insert(label.to_string(), format_timestamp(timestamp_seconds));
        });
    }

    /// Count an item that was skipped because it already has a credits marker
    pub fn record_existing(&self, label: &str) {
        self.update(|state| {
            state.total_items += 1;
            state.processed_items += 1;
            state.successful_items += 1;
            state
                .success_details
                .insert(label.to_string(), "already exists".to_string());
        });
    }

    pub fn record_failure(&self, label: &str, reason: impl Into<String>) {
        self.update(|state| {
            state.processed_items += 1;
            state.failed_items += 1;
            state.failure_reasons.insert(label.to_string(), reason.into());
        });
    }

    pub fn finish(&self, status: &str) {
        self.update(|state| {
            state.is_running = false;
            state.current_item = None;
            state.current_item_progress = 0.0;
            state.status = status.to_string();
            state.end_time = Some(Utc::now());
        });
    }
}

/// Format seconds as HH:MM:SS
pub fn format_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}
