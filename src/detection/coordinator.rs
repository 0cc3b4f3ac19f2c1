/// Detection coordinator that orchestrates the enabled detection methods
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

use super::fusion::{fallback_estimate, fuse, score_with_comparison};
use super::{DetectionCandidate, DetectionMethod, DetectionOutcome, MethodDetection};
use crate::config::DetectionConfig;
use crate::debug_capture::DebugCapture;
use crate::error::ProcessingError;

const NO_DETECTION: &str = "No credits detected by any method";

/// Episode handed to the coordinator for comparison or batch work
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonEpisode {
    pub id: String,
    pub path: PathBuf,
    pub duration_seconds: f64,
}

/// Runs detection methods and fuses their candidates.
///
/// Holds the batch cache used for cross-episode correlation: raw per-method
/// detections keyed by episode id, filled by
/// [`pre_compute_batch_detections`](Self::pre_compute_batch_detections) and read by
/// [`analyze_batch_detection_results`](Self::analyze_batch_detection_results).
pub struct DetectionCoordinator {
    config: DetectionConfig,
    methods: Vec<Arc<dyn DetectionMethod>>,
    batch_cache: RwLock<HashMap<String, Vec<MethodDetection>>>,
    cancel: Mutex<CancellationToken>,
    debug_capture: Arc<DebugCapture>,
}

impl DetectionCoordinator {
    pub fn new(
        config: DetectionConfig,
        methods: Vec<Arc<dyn DetectionMethod>>,
        debug_capture: Arc<DebugCapture>,
    ) -> Self {
        info!(
            "🔍 Detection coordinator initialized with {} methods ({} strategy)",
            methods.len(),
            config.strategy
        );
        Self {
            config,
            methods,
            batch_cache: RwLock::new(HashMap::new()),
            cancel: Mutex::new(CancellationToken::new()),
            debug_capture,
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Abort in-flight detection work
    pub fn cancel(&self) {
        self.current_token().cancel();
        info!("🛑 Detection cancelled");
    }

    /// Arm a fresh token after a cancellation so new work can run
    pub fn reset_cancellation(&self) {
        let mut token = self.cancel.lock().unwrap_or_else(|p| p.into_inner());
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.current_token().is_cancelled()
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn clear_batch_cache(&self) {
        self.batch_cache
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    pub fn batch_cache_len(&self) -> usize {
        self.batch_cache.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Run every enabled method once, keeping nonzero results and labelled errors.
    /// Stops at the first method that reports a cancellation.
    async fn run_methods(
        &self,
        path: &Path,
        duration: f64,
        token: &CancellationToken,
    ) -> (Vec<DetectionCandidate>, Vec<String>) {
        let mut candidates = Vec::new();
        let mut errors = Vec::new();

        for method in self.methods.iter().filter(|m| m.is_enabled()) {
            if token.is_cancelled() {
                break;
            }

            match method.detect_credits(path, duration, token).await {
                Ok(timestamp) if timestamp > 0.0 => {
                    self.debug_capture.trace(
                        Level::DEBUG,
                        format!(
                            "{}: candidate at {:.1}s for {}",
                            method.name(),
                            timestamp,
                            path.display()
                        ),
                    );
                    candidates.push(DetectionCandidate::new(
                        method.name(),
                        timestamp,
                        method.base_confidence(),
                        method.priority(),
                    ));
                }
                Ok(_) => {}
                Err(e) if ProcessingError::is_cancellation(&e) => {
                    self.debug_capture.trace(
                        Level::INFO,
                        format!("{} cancelled for {}", method.name(), path.display()),
                    );
                    break;
                }
                Err(e) => {
                    self.debug_capture.trace(
                        Level::WARN,
                        format!("{} failed for {}: {}", method.name(), path.display(), e),
                    );
                    errors.push(format!("{}: {}", method.name(), e));
                }
            }
        }

        (candidates, errors)
    }

    fn failure_reason(errors: &[String]) -> String {
        if errors.is_empty() {
            NO_DETECTION.to_string()
        } else {
            errors.join("; ")
        }
    }

    /// Detect credits in one episode on its own
    pub async fn detect_credits(
        &self,
        path: &Path,
        duration: f64,
        episode_id: &str,
    ) -> DetectionOutcome {
        let token = self.current_token();
        let (candidates, errors) = self.run_methods(path, duration, &token).await;
        if token.is_cancelled() {
            return DetectionOutcome::cancelled();
        }

        match fuse(&candidates, self.config.strategy, self.config.correlation_window_seconds) {
            Some(timestamp) if timestamp > 0.0 => {
                self.debug_capture.trace(
                    Level::INFO,
                    format!(
                        "{}: {} candidates fused to {:.1}s ({})",
                        episode_id,
                        candidates.len(),
                        timestamp,
                        self.config.strategy
                    ),
                );
                DetectionOutcome::found(timestamp, self.config.strategy.to_string())
            }
            _ => DetectionOutcome::not_found(Self::failure_reason(&errors)),
        }
    }

    /// Detect credits in one episode, weighing agreement with sibling episodes
    pub async fn detect_credits_with_comparison(
        &self,
        episode: &ComparisonEpisode,
        comparison_episodes: &[ComparisonEpisode],
    ) -> DetectionOutcome {
        let token = self.current_token();
        let (primary, errors) = self
            .run_methods(&episode.path, episode.duration_seconds, &token)
            .await;

        let mut comparisons = Vec::with_capacity(comparison_episodes.len());
        for other in comparison_episodes.iter().filter(|c| c.id != episode.id) {
            if token.is_cancelled() {
                return DetectionOutcome::cancelled();
            }
            let (candidates, _) = self
                .run_methods(&other.path, other.duration_seconds, &token)
                .await;
            comparisons.push(candidates);
        }

        self.resolve(&episode.id, primary, &comparisons, &errors, &token)
    }

    /// Run single-episode detection for every episode up front into the batch
    /// cache. `on_progress` receives the completed fraction after each episode.
    pub async fn pre_compute_batch_detections<F>(
        &self,
        episodes: &[ComparisonEpisode],
        on_progress: F,
    ) -> usize
    where
        F: Fn(f64) + Send + Sync,
    {
        let token = self.current_token();
        let total = episodes.len();
        let mut with_detections = 0;
        info!("🧮 Pre-computing detections for {} episodes", total);

        for (index, episode) in episodes.iter().enumerate() {
            if token.is_cancelled() {
                info!("🛑 Batch pre-computation cancelled after {}/{}", index, total);
                break;
            }

            let (candidates, errors) = self
                .run_methods(&episode.path, episode.duration_seconds, &token)
                .await;
            // Partial results from an aborted scan never enter the cache
            if token.is_cancelled() {
                info!("🛑 Batch pre-computation cancelled after {}/{}", index, total);
                break;
            }
            if !errors.is_empty() {
                self.debug_capture
                    .trace(Level::DEBUG, format!("{}: {}", episode.id, errors.join("; ")));
            }
            if !candidates.is_empty() {
                with_detections += 1;
            }

            let detections = candidates
                .into_iter()
                .map(|c| MethodDetection {
                    method: c.method,
                    timestamp: c.timestamp,
                })
                .collect();
            self.batch_cache
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .insert(episode.id.clone(), detections);

            on_progress((index + 1) as f64 / total as f64);
        }

        info!(
            "✅ Pre-computation finished: {}/{} episodes with detections",
            with_detections, total
        );
        with_detections
    }

    /// Fuse an episode's cached detections with those of its comparison set.
    /// Reads the cache only, so repeated calls give the same answer.
    pub fn analyze_batch_detection_results(
        &self,
        episode_id: &str,
        comparison_ids: &[String],
    ) -> DetectionOutcome {
        let (primary, comparisons, cached) = {
            let cache = self.batch_cache.read().unwrap_or_else(|p| p.into_inner());
            let to_candidates = |id: &str| -> Vec<DetectionCandidate> {
                cache
                    .get(id)
                    .map(|detections| {
                        detections
                            .iter()
                            .map(|d| self.candidate_from_cache(d))
                            .collect()
                    })
                    .unwrap_or_default()
            };

            let primary = to_candidates(episode_id);
            let comparisons: Vec<_> = comparison_ids
                .iter()
                .filter(|id| id.as_str() != episode_id)
                .map(|id| to_candidates(id))
                .collect();
            (primary, comparisons, cache.contains_key(episode_id))
        };

        let errors = if cached {
            Vec::new()
        } else {
            vec!["No cached detections for episode".to_string()]
        };
        self.resolve(episode_id, primary, &comparisons, &errors, &self.current_token())
    }

    fn candidate_from_cache(&self, detection: &MethodDetection) -> DetectionCandidate {
        let method = self.methods.iter().find(|m| m.name() == detection.method);
        DetectionCandidate::new(
            detection.method.clone(),
            detection.timestamp,
            method.map_or(0.5, |m| m.base_confidence()),
            method.map_or(i32::MAX, |m| m.priority()),
        )
    }

    fn resolve(
        &self,
        episode_id: &str,
        primary: Vec<DetectionCandidate>,
        comparisons: &[Vec<DetectionCandidate>],
        errors: &[String],
        token: &CancellationToken,
    ) -> DetectionOutcome {
        if token.is_cancelled() {
            return DetectionOutcome::cancelled();
        }
        let window = self.config.correlation_window_seconds;

        if primary.is_empty() {
            let reason = Self::failure_reason(errors);
            if !self.config.enable_fallback {
                return DetectionOutcome::not_found(reason);
            }

            return match fallback_estimate(comparisons, self.config.fallback_min_success_rate) {
                Ok(timestamp) => {
                    self.debug_capture.trace(
                        Level::INFO,
                        format!("{}: using season fallback at {:.1}s", episode_id, timestamp),
                    );
                    let source = format!("{} (Fallback)", self.config.strategy);
                    DetectionOutcome::found(timestamp, source)
                }
                Err(why) => {
                    self.debug_capture.trace(Level::DEBUG, format!("{}: {}", episode_id, why));
                    DetectionOutcome::not_found(format!("{}; {}", reason, why))
                }
            };
        }

        let scored = if self.config.enable_correlation_scoring {
            score_with_comparison(&primary, comparisons, window)
        } else {
            primary
        };

        match fuse(&scored, self.config.strategy, window) {
            Some(timestamp) if timestamp > 0.0 => {
                self.debug_capture.trace(
                    Level::INFO,
                    format!(
                        "{}: fused {} candidates against {} siblings to {:.1}s",
                        episode_id,
                        scored.len(),
                        comparisons.len(),
                        timestamp
                    ),
                );
                DetectionOutcome::found(timestamp, self.config.strategy.to_string())
            }
            _ => DetectionOutcome::not_found(Self::failure_reason(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FusionStrategy;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;

    /// Returns a fixed timestamp per file name
    struct TableMethod {
        name: &'static str,
        table: HashMap<&'static str, f64>,
        confidence: f64,
    }

    #[async_trait]
    impl DetectionMethod for TableMethod {
        fn name(&self) -> &str {
            self.name
        }

        fn base_confidence(&self) -> f64 {
            self.confidence
        }

        fn priority(&self) -> i32 {
            1
        }

        async fn detect_credits(
            &self,
            path: &Path,
            _duration: f64,
            _cancel: &CancellationToken,
        ) -> Result<f64> {
            let key = path.file_name().unwrap().to_str().unwrap();
            Ok(self.table.get(key).copied().unwrap_or(0.0))
        }
    }

    struct FailingMethod;

    #[async_trait]
    impl DetectionMethod for FailingMethod {
        fn name(&self) -> &str {
            "Broken"
        }

        fn base_confidence(&self) -> f64 {
            0.5
        }

        fn priority(&self) -> i32 {
            9
        }

        async fn detect_credits(
            &self,
            _path: &Path,
            _duration: f64,
            _cancel: &CancellationToken,
        ) -> Result<f64> {
            Err(anyhow!("service exploded"))
        }
    }

    /// Cancels the shared token on its first call, as an operator would mid-scan
    struct CancellingMethod {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl DetectionMethod for CancellingMethod {
        fn name(&self) -> &str {
            "Cancelling"
        }

        fn base_confidence(&self) -> f64 {
            0.9
        }

        fn priority(&self) -> i32 {
            0
        }

        async fn detect_credits(
            &self,
            _path: &Path,
            _duration: f64,
            cancel: &CancellationToken,
        ) -> Result<f64> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            cancel.cancel();
            Err(ProcessingError::Cancelled.into())
        }
    }

    fn episode(id: &str) -> ComparisonEpisode {
        ComparisonEpisode {
            id: id.to_string(),
            path: PathBuf::from(format!("/tv/{}.mkv", id)),
            duration_seconds: 1500.0,
        }
    }

    fn coordinator(
        config: DetectionConfig,
        methods: Vec<Arc<dyn DetectionMethod>>,
    ) -> DetectionCoordinator {
        DetectionCoordinator::new(config, methods, Arc::new(DebugCapture::new()))
    }

    fn ocr_table(entries: &[(&'static str, f64)]) -> Arc<dyn DetectionMethod> {
        Arc::new(TableMethod {
            name: "OCR",
            table: entries.iter().copied().collect(),
            confidence: 0.8,
        })
    }

    #[tokio::test]
    async fn test_single_episode_detection() {
        let coordinator = coordinator(
            DetectionConfig::default(),
            vec![ocr_table(&[("e1.mkv", 1234.0)])],
        );
        let outcome = coordinator.detect_credits(Path::new("/tv/e1.mkv"), 1500.0, "e1").await;
        assert_eq!(outcome.timestamp, 1234.0);
        assert_eq!(outcome.source, "CorrelationScoring");
        assert!(outcome.failure_reason.is_none());
    }

    #[tokio::test]
    async fn test_errors_are_labelled_without_aborting() {
        let coordinator = coordinator(
            DetectionConfig::default(),
            vec![Arc::new(FailingMethod), ocr_table(&[("e1.mkv", 1234.0)])],
        );
        let outcome = coordinator.detect_credits(Path::new("/tv/e1.mkv"), 1500.0, "e1").await;
        assert_eq!(outcome.timestamp, 1234.0);

        let outcome = coordinator.detect_credits(Path::new("/tv/e2.mkv"), 1500.0, "e2").await;
        assert_eq!(outcome.timestamp, 0.0);
        assert_eq!(outcome.failure_reason.as_deref(), Some("Broken: service exploded"));
    }

    #[tokio::test]
    async fn test_no_candidates_without_fallback() {
        let config = DetectionConfig {
            enable_fallback: false,
            ..DetectionConfig::default()
        };
        let coordinator = coordinator(
            config,
            vec![ocr_table(&[("e2.mkv", 1200.0), ("e3.mkv", 1210.0)])],
        );

        let outcome = coordinator
            .detect_credits_with_comparison(&episode("e1"), &[episode("e2"), episode("e3")])
            .await;
        assert_eq!(outcome.timestamp, 0.0);
        assert!(!outcome.failure_reason.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_uses_sibling_median() {
        let coordinator = coordinator(
            DetectionConfig::default(),
            vec![ocr_table(&[("e2.mkv", 1200.0), ("e3.mkv", 1210.0), ("e4.mkv", 1300.0)])],
        );

        let outcome = coordinator
            .detect_credits_with_comparison(
                &episode("e1"),
                &[episode("e2"), episode("e3"), episode("e4")],
            )
            .await;
        assert_eq!(outcome.timestamp, 1210.0);
        assert_eq!(outcome.source, "CorrelationScoring (Fallback)");
    }

    #[tokio::test]
    async fn test_comparison_agreement_picks_consistent_candidate() {
        let black = Arc::new(TableMethod {
            name: "Black",
            table: [("e1.mkv", 1500.0), ("e2.mkv", 1501.0), ("e3.mkv", 1499.0)]
                .into_iter()
                .collect(),
            confidence: 0.5,
        });
        let ocr = ocr_table(&[("e1.mkv", 1300.0)]);
        let coordinator = coordinator(DetectionConfig::default(), vec![ocr, black]);

        // Alone, OCR's higher base confidence wins
        let alone = coordinator.detect_credits(Path::new("/tv/e1.mkv"), 1600.0, "e1").await;
        assert_eq!(alone.timestamp, 1300.0);

        // Siblings agree with the black-frame candidate, which overtakes OCR
        let compared = coordinator
            .detect_credits_with_comparison(&episode("e1"), &[episode("e2"), episode("e3")])
            .await;
        assert_eq!(compared.timestamp, 1500.0);
    }

    #[tokio::test]
    async fn test_batch_precompute_and_analysis() {
        let coordinator = coordinator(
            DetectionConfig::default(),
            vec![ocr_table(&[("e1.mkv", 1200.0), ("e2.mkv", 1203.0), ("e3.mkv", 1198.0)])],
        );

        let episodes = vec![episode("e1"), episode("e2"), episode("e3"), episode("e4")];
        let progress = Mutex::new(Vec::new());
        let found = coordinator
            .pre_compute_batch_detections(&episodes, |fraction| {
                progress.lock().unwrap().push(fraction)
            })
            .await;

        assert_eq!(found, 3);
        assert_eq!(coordinator.batch_cache_len(), 4);
        assert_eq!(*progress.lock().unwrap(), vec![0.25, 0.5, 0.75, 1.0]);

        let ids: Vec<String> = episodes.iter().map(|e| e.id.clone()).collect();
        let first = coordinator.analyze_batch_detection_results("e1", &ids);
        let second = coordinator.analyze_batch_detection_results("e1", &ids);
        assert_eq!(first, second);
        assert_eq!(first.timestamp, 1200.0);

        // e4 has nothing cached and falls back to the season median
        let fallback = coordinator.analyze_batch_detection_results("e4", &ids);
        assert_eq!(fallback.timestamp, 1200.0);
        assert!(fallback.source.ends_with("(Fallback)"));

        coordinator.clear_batch_cache();
        assert_eq!(coordinator.batch_cache_len(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_coordinator_skips_methods() {
        let coordinator = coordinator(
            DetectionConfig::default(),
            vec![ocr_table(&[("e1.mkv", 1200.0)])],
        );
        coordinator.cancel();

        let outcome = coordinator.detect_credits(Path::new("/tv/e1.mkv"), 1500.0, "e1").await;
        assert_eq!(outcome.failure_reason.as_deref(), Some("Cancelled"));
        assert!(outcome.cancelled);

        coordinator.reset_cancellation();
        let outcome = coordinator.detect_credits(Path::new("/tv/e1.mkv"), 1500.0, "e1").await;
        assert_eq!(outcome.timestamp, 1200.0);
    }

    #[tokio::test]
    async fn test_cancellation_mid_method_is_not_a_miss() {
        let cancelling = Arc::new(CancellingMethod {
            calls: Default::default(),
        });
        let coordinator = coordinator(
            DetectionConfig::default(),
            vec![
                cancelling.clone() as Arc<dyn DetectionMethod>,
                ocr_table(&[("e1.mkv", 1200.0), ("e2.mkv", 1200.0)]),
            ],
        );

        // Fallback would otherwise answer from the sibling
        let outcome = coordinator
            .detect_credits_with_comparison(&episode("e1"), &[episode("e2")])
            .await;
        assert!(outcome.cancelled);
        assert!(!outcome.is_found());
        assert_eq!(outcome.failure_reason.as_deref(), Some("Cancelled"));
        assert_eq!(cancelling.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        coordinator.reset_cancellation();
        let found = coordinator
            .pre_compute_batch_detections(&[episode("e1"), episode("e2")], |_| {})
            .await;
        assert_eq!(found, 0);
        assert_eq!(coordinator.batch_cache_len(), 0);
    }

    #[tokio::test]
    async fn test_alternative_strategy_is_used() {
        let config = DetectionConfig {
            strategy: FusionStrategy::Latest,
            ..DetectionConfig::default()
        };
        let black = Arc::new(TableMethod {
            name: "Black",
            table: [("e1.mkv", 1400.0)].into_iter().collect(),
            confidence: 0.5,
        });
        let coordinator = coordinator(config, vec![ocr_table(&[("e1.mkv", 1300.0)]), black]);
        let outcome = coordinator.detect_credits(Path::new("/tv/e1.mkv"), 1600.0, "e1").await;
        assert_eq!(outcome.timestamp, 1400.0);
        assert_eq!(outcome.source, "Latest");
    }
}
