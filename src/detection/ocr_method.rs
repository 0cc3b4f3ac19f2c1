/// OCR-based credits detection
///
/// Samples frames from the tail of an episode, sends them to the OCR service
/// and looks for credit keywords. The credits start is the earliest keyword
/// hit that is followed by enough further hits within a short window.
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Level};

use super::DetectionMethod;
use crate::config::OcrConfig;
use crate::debug_capture::DebugCapture;
use crate::error::ProcessingError;
use crate::ocr::OcrClient;
use crate::video::{FrameExtractionRequest, MediaToolkit};

pub const METHOD_NAME: &str = "OCR";

const CLEANUP_ATTEMPTS: u32 = 3;
const CLEANUP_BACKOFF: Duration = Duration::from_millis(200);
/// A lone hit is still accepted when it matches at least this many keywords
const STRONG_SINGLE_MATCH: usize = 2;

/// One frame whose text matched at least one keyword
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordMatch {
    pub timestamp: f64,
    pub match_count: usize,
    pub keywords: Vec<String>,
}

/// Portion of the video that gets sampled
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisWindow {
    pub start: f64,
    pub length: f64,
}

pub struct OcrDetectionMethod {
    config: OcrConfig,
    keywords: Vec<String>,
    client: Arc<dyn OcrClient>,
    toolkit: Arc<dyn MediaToolkit>,
    debug_capture: Arc<DebugCapture>,
}

impl OcrDetectionMethod {
    pub fn new(
        config: OcrConfig,
        client: Arc<dyn OcrClient>,
        toolkit: Arc<dyn MediaToolkit>,
        debug_capture: Arc<DebugCapture>,
    ) -> Self {
        let keywords = parse_keywords(&config.keywords);
        info!("🔤 OCR detection initialized with {} keywords", keywords.len());

        Self {
            config,
            keywords,
            client,
            toolkit,
            debug_capture,
        }
    }

    fn trace(&self, level: Level, message: String) {
        self.debug_capture.trace(level, message);
    }

    async fn scan(
        &self,
        video_path: &Path,
        window: AnalysisWindow,
        frame_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<f64> {
        let request = FrameExtractionRequest {
            video_path: video_path.to_path_buf(),
            start_seconds: window.start,
            duration_seconds: window.length,
            fps: self.config.frame_rate,
            format: self.config.image_format.clone(),
            output_dir: frame_dir.to_path_buf(),
        };

        let mut frames = tokio::select! {
            _ = cancel.cancelled() => return Err(ProcessingError::Cancelled.into()),
            frames = self.toolkit.extract_frames(&request) => frames?,
        };

        if self.config.max_frames > 0 && frames.len() > self.config.max_frames {
            frames.truncate(self.config.max_frames);
        }

        self.trace(
            Level::DEBUG,
            format!("OCR: scanning {} frames from {:.1}s", frames.len(), window.start),
        );

        let timed_frames: Vec<(f64, PathBuf)> = frames
            .into_iter()
            .enumerate()
            .map(|(i, frame)| (window.start + i as f64 / self.config.frame_rate, frame))
            .collect();

        let concurrency = self.config.frame_concurrency.max(1);
        let mut results = stream::iter(timed_frames)
            .map(|(timestamp, frame)| async move {
                if cancel.is_cancelled() {
                    return (timestamp, None);
                }
                match self.client.recognize(&frame).await {
                    Ok(text) => (timestamp, Some(text)),
                    Err(e) => {
                        self.trace(
                            Level::WARN,
                            format!("OCR: frame at {:.1}s failed: {}", timestamp, e),
                        );
                        (timestamp, None)
                    }
                }
            })
            .buffered(concurrency);

        let mut matches: Vec<KeywordMatch> = Vec::new();
        while let Some((timestamp, text)) = results.next().await {
            if cancel.is_cancelled() {
                self.trace(Level::INFO, "OCR: cancelled".to_string());
                return Err(ProcessingError::Cancelled.into());
            }

            let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
                continue;
            };

            let found = match_keywords(&text, &self.keywords);
            if found.is_empty() {
                continue;
            }

            self.trace(
                Level::DEBUG,
                format!("OCR: {:.1}s matched [{}]", timestamp, found.join(", ")),
            );
            matches.push(KeywordMatch {
                timestamp,
                match_count: found.len(),
                keywords: found,
            });

            if matches.len() >= self.config.min_keyword_matches {
                if let Some(start) = resolve_credits_start(
                    &matches,
                    self.config.min_keyword_matches,
                    self.config.match_window_seconds,
                ) {
                    self.trace(Level::INFO, format!("OCR: early stop, credits at {:.1}s", start));
                    return Ok(start);
                }
            }
        }

        let start = resolve_credits_start(
            &matches,
            self.config.min_keyword_matches,
            self.config.match_window_seconds,
        )
        .unwrap_or(0.0);

        self.trace(
            Level::INFO,
            format!(
                "OCR: scan finished with {} matching frames, result {:.1}s",
                matches.len(),
                start
            ),
        );
        Ok(start)
    }
}

#[async_trait]
impl DetectionMethod for OcrDetectionMethod {
    fn name(&self) -> &str {
        METHOD_NAME
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn base_confidence(&self) -> f64 {
        self.config.base_confidence
    }

    fn priority(&self) -> i32 {
        self.config.priority
    }

    async fn detect_credits(
        &self,
        video_path: &Path,
        duration_seconds: f64,
        cancel: &CancellationToken,
    ) -> Result<f64> {
        if self.config.endpoint.trim().is_empty() || self.keywords.is_empty() {
            self.trace(Level::WARN, "OCR: endpoint or keywords not configured".to_string());
            return Ok(0.0);
        }

        if !self.client.is_reachable().await {
            self.trace(Level::WARN, format!("OCR: endpoint {} unreachable", self.config.endpoint));
            return Ok(0.0);
        }

        if cancel.is_cancelled() {
            return Err(ProcessingError::Cancelled.into());
        }

        let Some(window) = analysis_window(duration_seconds, &self.config) else {
            self.trace(
                Level::WARN,
                format!("OCR: empty analysis window for {:.1}s runtime", duration_seconds),
            );
            return Ok(0.0);
        };

        let frame_dir = tempfile::Builder::new()
            .prefix("credits-frames-")
            .tempdir()?
            .keep();

        let result = self.scan(video_path, window, &frame_dir, cancel).await;
        remove_dir_with_retries(&frame_dir).await;
        result
    }
}

/// Split a comma/semicolon list into lowercase, deduplicated keywords
pub fn parse_keywords(raw: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for keyword in raw.split([',', ';']) {
        let keyword = keyword.trim().to_lowercase();
        if !keyword.is_empty() && !keywords.contains(&keyword) {
            keywords.push(keyword);
        }
    }
    keywords
}

/// Keywords contained in `text`, case-insensitively
pub fn match_keywords(text: &str, keywords: &[String]) -> Vec<String> {
    let text = text.to_lowercase();
    keywords
        .iter()
        .filter(|k| text.contains(k.as_str()))
        .cloned()
        .collect()
}

/// Start and length of the scanned span, `None` when it is empty
pub fn analysis_window(duration: f64, config: &OcrConfig) -> Option<AnalysisWindow> {
    if duration <= 0.0 {
        return None;
    }

    let start = if config.minutes_from_end > 0.0 {
        duration - config.minutes_from_end * 60.0
    } else {
        duration * config.search_start_fraction
    }
    .max(0.0);

    let mut end = duration;
    if config.stop_seconds_from_end > 0.0 {
        end = duration - config.stop_seconds_from_end;
    }

    let mut length = end - start;
    if config.max_analysis_seconds > 0.0 {
        length = length.min(config.max_analysis_seconds);
    }

    (length > 0.0).then_some(AnalysisWindow { start, length })
}

/// Earliest match whose trailing window holds at least `min_matches` matches.
/// Falls back to the first match alone when it hit several keywords.
pub fn resolve_credits_start(
    matches: &[KeywordMatch],
    min_matches: usize,
    window: f64,
) -> Option<f64> {
    let mut ordered: Vec<&KeywordMatch> = matches.iter().collect();
    ordered.sort_by(|a, b| {
        a.timestamp
            .partial_cmp(&b.timestamp)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    for (i, candidate) in ordered.iter().enumerate() {
        let in_window = ordered[i..]
            .iter()
            .take_while(|m| m.timestamp <= candidate.timestamp + window)
            .count();
        if in_window >= min_matches {
            return Some(candidate.timestamp);
        }
    }

    ordered
        .first()
        .filter(|first| first.match_count >= STRONG_SINGLE_MATCH)
        .map(|first| first.timestamp)
}

async fn remove_dir_with_retries(dir: &Path) {
    let mut delay = CLEANUP_BACKOFF;
    for attempt in 1..=CLEANUP_ATTEMPTS {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => return,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) if attempt == CLEANUP_ATTEMPTS => {
                warn!("🧹 Could not remove frame directory {}: {}", dir.display(), e);
            }
            Err(e) => {
                debug!("Retrying removal of {} after error: {}", dir.display(), e);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}
