/// Credits detection: pluggable methods, candidate fusion and cross-episode coordination
///
/// Every method looks at one video and proposes at most one timestamp. The
/// coordinator runs the enabled methods, optionally compares the proposals
/// with sibling episodes, and fuses everything into a single answer.

pub mod coordinator;
pub mod fusion;
pub mod ocr_method;

pub use coordinator::{ComparisonEpisode, DetectionCoordinator};
pub use fusion::CandidateGroup;
pub use ocr_method::OcrDetectionMethod;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// One timestamp proposal from one method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionCandidate {
    /// Name of the method that produced it
    pub method: String,
    /// Proposed credits start in seconds
    pub timestamp: f64,
    /// Confidence in 0..=1
    pub confidence: f64,
    /// Lower numbers win under the Priority strategy
    pub priority: i32,
}

impl DetectionCandidate {
    pub fn new(method: impl Into<String>, timestamp: f64, confidence: f64, priority: i32) -> Self {
        Self {
            method: method.into(),
            timestamp,
            confidence,
            priority,
        }
    }
}

/// Raw per-method result kept in the batch cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDetection {
    pub method: String,
    pub timestamp: f64,
}

/// Result of one coordinator call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionOutcome {
    /// Credits start in seconds, 0 when nothing was found
    pub timestamp: f64,
    /// Why nothing was found
    pub failure_reason: Option<String>,
    /// Strategy or path that produced the timestamp
    pub source: String,
    /// Detection was aborted by a cancellation
    #[serde(default)]
    pub cancelled: bool,
}

impl DetectionOutcome {
    pub fn found(timestamp: f64, source: impl Into<String>) -> Self {
        Self {
            timestamp,
            failure_reason: None,
            source: source.into(),
            cancelled: false,
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self {
            timestamp: 0.0,
            failure_reason: Some(reason.into()),
            source: String::new(),
            cancelled: false,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Self::not_found("Cancelled")
        }
    }

    pub fn is_found(&self) -> bool {
        self.timestamp > 0.0
    }
}

/// A way of locating the start of end credits in one video
#[async_trait]
pub trait DetectionMethod: Send + Sync {
    /// Stable name used in logs, cache entries and error labels
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool {
        true
    }

    /// Confidence before agreement bonuses
    fn base_confidence(&self) -> f64;

    fn priority(&self) -> i32;

    /// Returns the credits start in seconds, or 0 when nothing was found.
    /// Fails with [`ProcessingError::Cancelled`](crate::error::ProcessingError::Cancelled)
    /// once `cancel` fires.
    async fn detect_credits(
        &self,
        video_path: &Path,
        duration_seconds: f64,
        cancel: &CancellationToken,
    ) -> Result<f64>;
}
