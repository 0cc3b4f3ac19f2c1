/// Credits Detector
///
/// Finds where end credits start in TV episodes and stores the position as a
/// chapter marker. Detection samples frames near the end of each episode, reads
/// them through an OCR service and fuses the results across episodes of the
/// same season.

pub mod backup;
pub mod catalog;
pub mod config;
pub mod debug_capture;
pub mod detection;
pub mod error;
pub mod library;
pub mod ocr;
pub mod pipeline;
pub mod queue;
pub mod state;
pub mod video;

#[cfg(feature = "api")]
pub mod api;

// Re-export main types for easy access
pub use crate::catalog::{Episode, ItemFilter, ItemStore, Marker, MarkerAdapter, MarkerKind};
pub use crate::config::{Config, ConfigBuilder, FusionStrategy};
pub use crate::debug_capture::DebugCapture;
pub use crate::detection::{
    DetectionCandidate, DetectionCoordinator, DetectionMethod, DetectionOutcome, OcrDetectionMethod,
};
pub use crate::error::{ProcessingError, ProcessingResult};
pub use crate::library::FileItemStore;
pub use crate::ocr::{OcrClient, TesseractClient};
pub use crate::pipeline::{EpisodeProcessingPipeline, ProcessOutcome};
pub use crate::queue::{BatchSummary, EnqueueResult, ProcessingQueueController};
pub use crate::state::{ProgressState, ProgressTracker};
pub use crate::video::{FfmpegToolkit, MediaToolkit, ProcessPriority};
