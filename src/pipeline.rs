use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::catalog::{Episode, ItemFilter, ItemStore, MarkerAdapter};
use crate::config::{Config, PathMapping};
use crate::detection::{ComparisonEpisode, DetectionCoordinator, DetectionOutcome};
use crate::error::{ProcessingError, ProcessingResult};
use crate::video::{MediaToolkit, ProcessPriority};

const THROTTLE_POLL: Duration = Duration::from_secs(1);
const THROTTLE_MAX_WAITS: u32 = 30;

/// Result of processing one episode
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub success: bool,
    /// Credits start in seconds, 0 on failure
    pub timestamp: f64,
    pub failure_reason: Option<String>,
}

impl ProcessOutcome {
    fn succeeded(timestamp: f64) -> Self {
        Self {
            success: true,
            timestamp,
            failure_reason: None,
        }
    }

    fn failed(error: &ProcessingError) -> Self {
        Self {
            success: false,
            timestamp: 0.0,
            failure_reason: Some(error.to_string()),
        }
    }
}

/// Episodes of a pre-computed batch with the file and runtime resolved for each
#[derive(Debug, Default)]
pub struct BatchContext {
    episodes: Vec<Episode>,
    entries: HashMap<String, ComparisonEpisode>,
}

impl BatchContext {
    pub fn new(episodes: Vec<Episode>, entries: Vec<ComparisonEpisode>) -> Self {
        Self {
            episodes,
            entries: entries.into_iter().map(|entry| (entry.id.clone(), entry)).collect(),
        }
    }

    pub fn episodes(&self) -> &[Episode] {
        &self.episodes
    }

    pub fn entry(&self, episode_id: &str) -> Option<&ComparisonEpisode> {
        self.entries.get(episode_id)
    }
}

/// Drives one episode from file lookup to a persisted credits marker
pub struct EpisodeProcessingPipeline {
    config: Config,
    store: Arc<dyn ItemStore>,
    media: Arc<dyn MediaToolkit>,
    coordinator: Arc<DetectionCoordinator>,
    markers: MarkerAdapter,
    priority: Arc<ProcessPriority>,
}

impl EpisodeProcessingPipeline {
    pub fn new(
        config: Config,
        store: Arc<dyn ItemStore>,
        media: Arc<dyn MediaToolkit>,
        coordinator: Arc<DetectionCoordinator>,
        priority: Arc<ProcessPriority>,
    ) -> Self {
        let markers = MarkerAdapter::negotiate(store.as_ref());
        Self {
            config,
            store,
            media,
            coordinator,
            markers,
            priority,
        }
    }

    pub fn markers(&self) -> &MarkerAdapter {
        &self.markers
    }

    /// Process one episode. `batch` is set when the detections of the current
    /// batch were pre-computed into the coordinator cache.
    pub async fn process(
        &self,
        episode: &Episode,
        dry_run: bool,
        batch: Option<&BatchContext>,
    ) -> ProcessOutcome {
        let _priority = self.config.processing.lower_priority.then(|| self.priority.lower());

        match self.run(episode, dry_run, batch).await {
            Ok(timestamp) => ProcessOutcome::succeeded(timestamp),
            Err(e) => {
                warn!("❌ {}: {}", episode.label(), e);
                ProcessOutcome::failed(&e)
            }
        }
    }

    async fn run(
        &self,
        episode: &Episode,
        dry_run: bool,
        batch: Option<&BatchContext>,
    ) -> ProcessingResult<f64> {
        let target = match batch.and_then(|context| context.entry(&episode.id)) {
            Some(entry) => entry.clone(),
            None => self.comparison_entry(episode).await?,
        };
        if self.coordinator.is_cancelled() {
            return Err(ProcessingError::Cancelled);
        }

        info!("🎬 Detecting credits for {} ({:.0}s)", episode.label(), target.duration_seconds);
        let outcome = self.detect(episode, &target, batch).await;

        if outcome.cancelled {
            return Err(ProcessingError::Cancelled);
        }
        if !outcome.is_found() {
            let reason = outcome
                .failure_reason
                .unwrap_or_else(|| "No credits detected".to_string());
            return Err(ProcessingError::DetectionFailed(reason));
        }

        if dry_run {
            info!(
                "🧪 Dry run: {} credits at {:.1}s via {} (not saved)",
                episode.label(),
                outcome.timestamp,
                outcome.source
            );
        } else {
            self.save_marker(episode, outcome.timestamp).await?;
            info!(
                "✅ {} credits at {:.1}s via {}",
                episode.label(),
                outcome.timestamp,
                outcome.source
            );
        }

        Ok(outcome.timestamp)
    }

    async fn detect(
        &self,
        episode: &Episode,
        target: &ComparisonEpisode,
        batch: Option<&BatchContext>,
    ) -> DetectionOutcome {
        let detection = &self.config.detection;
        if !detection.enable_cross_episode || episode.series_id.is_none() {
            return self
                .coordinator
                .detect_credits(&target.path, target.duration_seconds, &episode.id)
                .await;
        }

        if let Some(batch) = batch {
            let siblings: Vec<String> = batch
                .episodes()
                .iter()
                .filter(|other| other.id != episode.id && other.is_same_season(episode))
                .map(|other| other.id.clone())
                .collect();
            debug!(
                "{}: analysing cached detections against {} siblings",
                episode.id,
                siblings.len()
            );
            return self.coordinator.analyze_batch_detection_results(&episode.id, &siblings);
        }

        let siblings = self.comparison_episodes(episode).await;
        if siblings.len() < 2 {
            debug!(
                "{}: only {} comparison episodes, using single-episode detection",
                episode.id,
                siblings.len()
            );
            return self
                .coordinator
                .detect_credits(&target.path, target.duration_seconds, &episode.id)
                .await;
        }

        self.coordinator.detect_credits_with_comparison(target, &siblings).await
    }

    /// Same-season siblings with files on disk, nearest episode numbers first
    async fn comparison_episodes(&self, episode: &Episode) -> Vec<ComparisonEpisode> {
        let (Some(series_id), Some(season)) = (&episode.series_id, episode.season_number) else {
            return Vec::new();
        };

        let filter = ItemFilter::season(series_id.clone(), season);
        let mut siblings = match self.store.list(&filter).await {
            Ok(list) => list,
            Err(e) => {
                warn!("Could not list siblings of {}: {}", episode.label(), e);
                return Vec::new();
            }
        };
        siblings.retain(|other| other.id != episode.id);

        let number = episode.episode_number.unwrap_or(0);
        siblings.sort_by_key(|other| other.episode_number.unwrap_or(u32::MAX).abs_diff(number));

        let limit = self.config.detection.max_comparison_episodes;
        let mut comparisons = Vec::with_capacity(limit);
        for sibling in siblings {
            if comparisons.len() >= limit {
                break;
            }
            match self.comparison_entry(&sibling).await {
                Ok(entry) => comparisons.push(entry),
                Err(e) => debug!("Skipping comparison episode {}: {}", sibling.label(), e),
            }
        }

        comparisons
    }

    /// Resolve an episode's file and runtime for use by the coordinator
    pub async fn comparison_entry(&self, episode: &Episode) -> ProcessingResult<ComparisonEpisode> {
        let path = self.resolve_path(&episode.path);
        if !file_exists(&path).await {
            return Err(ProcessingError::FileNotFound(path));
        }
        let duration = self.duration_of(episode, &path).await?;
        Ok(ComparisonEpisode {
            id: episode.id.clone(),
            path,
            duration_seconds: duration,
        })
    }

    async fn duration_of(&self, episode: &Episode, path: &Path) -> ProcessingResult<f64> {
        let duration = match episode.duration_seconds {
            Some(known) if known > 0.0 => known,
            _ => self
                .media
                .probe_duration(path)
                .await
                .map_err(|e| ProcessingError::DurationProbe(e.to_string()))?,
        };

        if !duration.is_finite() || duration <= 0.0 {
            return Err(ProcessingError::InvalidDuration(duration));
        }
        Ok(duration)
    }

    /// Replace any existing credits marker with one at `timestamp`
    async fn save_marker(&self, episode: &Episode, timestamp: f64) -> ProcessingResult<()> {
        let mut chapters = self
            .store
            .get_chapters(&episode.id)
            .await
            .map_err(|e| ProcessingError::Store(e.to_string()))?;

        chapters.retain(|marker| !self.markers.is_credits_marker(marker));
        chapters.push(self.markers.credits_marker(timestamp));
        chapters.sort_by(|a, b| a.start_seconds.total_cmp(&b.start_seconds));

        self.store
            .save_chapters(&episode.id, chapters)
            .await
            .map_err(|e| ProcessingError::Store(e.to_string()))
    }

    /// Apply configured path mappings and normalise separators
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        map_path(path, &self.config.processing.path_mappings)
    }

    /// Inter-episode delay plus optional load-based throttling
    pub async fn pause_between_items(&self) {
        let delay = self.config.processing.episode_delay_ms;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let threshold = self.config.processing.cpu_throttle_percent;
        if threshold <= 0.0 {
            return;
        }

        wait_for_load(threshold, THROTTLE_POLL, THROTTLE_MAX_WAITS, cpu_load_percent).await;
    }
}

/// Sleep in `poll` steps while `read_load` reports more than `threshold`
/// percent, at most `max_waits` times. Returns how often it waited.
pub async fn wait_for_load<F, Fut>(
    threshold: f64,
    poll: Duration,
    max_waits: u32,
    mut read_load: F,
) -> u32
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<f64>>,
{
    for waits in 0..max_waits {
        match read_load().await {
            Some(load) if load > threshold => {
                debug!("⏳ CPU load {:.0}% above {:.0}%, waiting", load, threshold);
                tokio::time::sleep(poll).await;
            }
            _ => return waits,
        }
    }
    warn!("CPU load stayed above {:.0}%, continuing anyway", threshold);
    max_waits
}

/// Rewrite a path through the first matching prefix mapping
pub fn map_path(path: &Path, mappings: &[PathMapping]) -> PathBuf {
    let raw = path.to_string_lossy();
    for mapping in mappings {
        if mapping.from.is_empty() {
            continue;
        }
        if let Some(rest) = raw.strip_prefix(mapping.from.as_str()) {
            return PathBuf::from(normalize_separators(&format!("{}{}", mapping.to, rest)));
        }
    }
    PathBuf::from(normalize_separators(&raw))
}

fn normalize_separators(raw: &str) -> String {
    if std::path::MAIN_SEPARATOR == '/' {
        raw.replace('\\', "/")
    } else {
        raw.to_string()
    }
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// One-minute load average as a percentage of available cores
async fn cpu_load_percent() -> Option<f64> {
    let loadavg = tokio::fs::read_to_string("/proc/loadavg").await.ok()?;
    let load: f64 = loadavg.split_whitespace().next()?.parse().ok()?;
    Some(load / num_cpus::get().max(1) as f64 * 100.0)
}
