use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use credits_detector::state::{STATUS_CANCELLED, STATUS_COMPLETE, STATUS_DRY_RUN_COMPLETE};
use credits_detector::video::FrameExtractionRequest;
use credits_detector::{
    Config, ConfigBuilder, EnqueueResult, Episode, ItemFilter, ItemStore, Marker, MarkerKind,
    MediaToolkit, OcrClient, ProcessPriority, ProcessingQueueController, ProgressState,
};

const DURATION: f64 = 1500.0;

/// In-memory catalog with kind-aware chapters
#[derive(Default)]
struct MemoryStore {
    episodes: Mutex<Vec<Episode>>,
    chapters: Mutex<HashMap<String, Vec<Marker>>>,
}

impl MemoryStore {
    fn add(&self, episode: Episode) {
        self.episodes.lock().unwrap().push(episode);
    }

    fn credits_of(&self, id: &str) -> Option<f64> {
        self.chapters
            .lock()
            .unwrap()
            .get(id)?
            .iter()
            .find(|m| m.kind == Some(MarkerKind::CreditsStart))
            .map(|m| m.start_seconds)
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn list(&self, filter: &ItemFilter) -> Result<Vec<Episode>> {
        Ok(self
            .episodes
            .lock()
            .unwrap()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Episode>> {
        Ok(self.episodes.lock().unwrap().iter().find(|e| e.id == id).cloned())
    }

    async fn get_chapters(&self, item_id: &str) -> Result<Vec<Marker>> {
        Ok(self.chapters.lock().unwrap().get(item_id).cloned().unwrap_or_default())
    }

    async fn save_chapters(&self, item_id: &str, markers: Vec<Marker>) -> Result<()> {
        self.chapters.lock().unwrap().insert(item_id.to_string(), markers);
        Ok(())
    }

    fn supports_marker_kind(&self) -> bool {
        true
    }
}

/// Writes one small file per sampled frame holding `<video stem>|<timestamp>`
#[derive(Default)]
struct FakeMedia {
    extract_delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    extractions: AtomicUsize,
    duration_lookups: AtomicUsize,
}

impl FakeMedia {
    fn slow(delay: Duration) -> Self {
        Self {
            extract_delay: delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl MediaToolkit for FakeMedia {
    async fn probe_duration(&self, _path: &Path) -> Result<f64> {
        self.duration_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(DURATION)
    }

    async fn extract_frames(&self, request: &FrameExtractionRequest) -> Result<Vec<PathBuf>> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.extractions.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.extract_delay).await;

        let stem = request
            .video_path
            .file_stem()
            .ok_or_else(|| anyhow!("no file stem"))?
            .to_string_lossy()
            .to_string();
        let count = (request.duration_seconds * request.fps).floor() as usize;
        let mut frames = Vec::with_capacity(count);
        for i in 0..count {
            let timestamp = request.start_seconds + i as f64 / request.fps;
            let frame = request.output_dir.join(format!("frame_{:05}.{}", i, request.format));
            tokio::fs::write(&frame, format!("{}|{}", stem, timestamp)).await?;
            frames.push(frame);
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(frames)
    }
}

/// Shows credit text from a per-video start time onward
struct FakeOcr {
    credits: HashMap<String, f64>,
}

impl FakeOcr {
    fn new(credits: &[(&str, f64)]) -> Self {
        Self {
            credits: credits.iter().map(|(stem, t)| (stem.to_string(), *t)).collect(),
        }
    }
}

#[async_trait]
impl OcrClient for FakeOcr {
    async fn is_reachable(&self) -> bool {
        true
    }

    async fn recognize(&self, image_path: &Path) -> Result<String> {
        let content = tokio::fs::read_to_string(image_path).await?;
        let (stem, timestamp) = content.split_once('|').ok_or_else(|| anyhow!("bad frame"))?;
        let timestamp: f64 = timestamp.parse()?;

        match self.credits.get(stem) {
            Some(start) if timestamp >= *start => {
                Ok("Directed by A. Person\nProduced by B. Person".to_string())
            }
            _ => Ok("Where were you last night?".to_string()),
        }
    }
}

struct Harness {
    _dir: TempDir,
    root: PathBuf,
    store: Arc<MemoryStore>,
    media: Arc<FakeMedia>,
    controller: ProcessingQueueController,
}

fn test_config() -> Config {
    let mut config = ConfigBuilder::new().with_episode_delay_ms(0).build();
    // Two minutes before the end at 1 fps keeps the frame count small
    config.ocr.minutes_from_end = 2.0;
    config.ocr.frame_rate = 1.0;
    config
}

fn harness(config: Config, media: FakeMedia, credits: &[(&str, f64)]) -> Harness {
    let dir = TempDir::new().unwrap();
    let root = dir.path().to_path_buf();
    let store = Arc::new(MemoryStore::default());
    let media = Arc::new(media);
    let controller = ProcessingQueueController::with_services(
        config,
        store.clone(),
        media.clone(),
        Arc::new(FakeOcr::new(credits)),
        Arc::new(ProcessPriority::new()),
    );

    Harness {
        _dir: dir,
        root,
        store,
        media,
        controller,
    }
}

impl Harness {
    /// Create the video file and register the episode
    fn episode(&self, stem: &str, number: u32) -> Episode {
        let path = self.root.join(format!("{}.mkv", stem));
        std::fs::write(&path, b"video").unwrap();
        let episode = Episode::new(stem, format!("Episode {}", number), path)
            .with_series("show", "Show", 1, number);
        self.store.add(episode.clone());
        episode
    }

    async fn wait(&self) -> ProgressState {
        for _ in 0..500 {
            let progress = self.controller.get_progress();
            if !progress.is_running && !self.controller.is_worker_active() {
                return progress;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("processing did not finish: {:?}", self.controller.get_progress());
    }
}

#[tokio::test]
async fn test_single_episode_is_detected_and_saved() {
    let h = harness(test_config(), FakeMedia::default(), &[("e1", 1400.0)]);
    let episode = h.episode("e1", 1);

    let result = h.controller.enqueue(episode, false, false).await;
    assert_eq!(result, EnqueueResult::Queued);

    let progress = h.wait().await;
    assert_eq!(progress.status, STATUS_COMPLETE);
    assert_eq!(progress.successful_items, 1);
    assert_eq!(progress.success_details["Show S01E01 - Episode 1"], "00:23:20");
    assert_eq!(h.store.credits_of("e1"), Some(1400.0));
}

#[tokio::test]
async fn test_dry_run_does_not_save() {
    let h = harness(test_config(), FakeMedia::default(), &[("e1", 1400.0), ("e2", 1410.0)]);
    let episodes = vec![h.episode("e1", 1), h.episode("e2", 2)];

    let summary = h.controller.enqueue_batch(episodes, true).await;
    assert_eq!(summary.queued, 2);
    assert!(!summary.precompute);

    let progress = h.wait().await;
    assert_eq!(progress.status, STATUS_DRY_RUN_COMPLETE);
    assert_eq!(progress.successful_items, 2);
    assert_eq!(h.store.credits_of("e1"), None);
    assert_eq!(h.store.credits_of("e2"), None);
}

#[tokio::test]
async fn test_existing_credits_are_skipped_unless_manual() {
    let h = harness(test_config(), FakeMedia::default(), &[("e1", 1400.0)]);
    let episode = h.episode("e1", 1);
    h.store
        .save_chapters(
            "e1",
            vec![Marker {
                name: "Credits".to_string(),
                start_seconds: 1300.0,
                kind: Some(MarkerKind::CreditsStart),
            }],
        )
        .await
        .unwrap();

    let result = h.controller.enqueue(episode.clone(), false, false).await;
    assert_eq!(result, EnqueueResult::AlreadyExists);
    let progress = h.wait().await;
    assert_eq!(progress.success_details["Show S01E01 - Episode 1"], "already exists");
    assert_eq!(h.media.extractions.load(Ordering::SeqCst), 0);

    let result = h.controller.enqueue(episode, true, false).await;
    assert_eq!(result, EnqueueResult::Queued);
    h.wait().await;
    assert_eq!(h.store.credits_of("e1"), Some(1400.0));
    assert_eq!(h.store.get_chapters("e1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_queue_cap_drops_overflow() {
    let mut config = test_config();
    config.processing.only_process_missing = false;
    let h = harness(config, FakeMedia::slow(Duration::from_millis(50)), &[]);

    let episodes: Vec<Episode> = (0..1001)
        .map(|i| {
            let path = h.root.join(format!("missing{}.mkv", i));
            Episode::new(format!("id{}", i), format!("Item {}", i), path)
        })
        .collect();

    let summary = h.controller.enqueue_batch(episodes, false).await;
    assert_eq!(summary.queued, 1000);
    assert_eq!(summary.dropped, 1);
    assert_eq!(h.controller.queued_len(), 1000);
    assert_eq!(h.controller.get_progress().total_items, 1000);

    h.controller.cancel();
    h.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_only_one_worker_drains_the_queue() {
    let h = harness(
        test_config(),
        FakeMedia::slow(Duration::from_millis(100)),
        &[("e1", 1400.0), ("e2", 1400.0), ("e3", 1400.0)],
    );
    let episodes = vec![h.episode("e1", 1), h.episode("e2", 2), h.episode("e3", 3)];

    let enqueues = episodes
        .into_iter()
        .map(|episode| {
            let controller = h.controller.clone();
            tokio::spawn(async move { controller.enqueue(episode, true, true).await })
        })
        .collect::<Vec<_>>();
    for handle in enqueues {
        assert_eq!(handle.await.unwrap(), EnqueueResult::Queued);
    }

    let starts = futures::future::join_all((0..8).map(|_| {
        let controller = h.controller.clone();
        async move { controller.try_start_worker() }
    }))
    .await;
    assert!(starts.iter().all(|started| !started));

    let progress = h.wait().await;
    assert_eq!(progress.processed_items, 3);
    assert_eq!(h.media.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancel_drains_queue_and_finalises() {
    let h = harness(
        test_config(),
        FakeMedia::slow(Duration::from_millis(200)),
        &[("e1", 1400.0), ("e2", 1400.0), ("e3", 1400.0)],
    );
    let episodes = vec![h.episode("e1", 1), h.episode("e2", 2), h.episode("e3", 3)];
    let first_two = episodes[..2].to_vec();

    h.controller.enqueue_batch(first_two, false).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.controller.is_worker_active());

    h.controller.cancel();
    assert_eq!(h.controller.queued_len(), 0);

    let progress = h.wait().await;
    assert_eq!(progress.status, STATUS_CANCELLED);
    assert!(!progress.is_running);
    assert_eq!(h.store.credits_of("e2"), None);

    // A new run after cancelling starts cleanly
    let result = h.controller.enqueue(episodes[2].clone(), false, false).await;
    assert_eq!(result, EnqueueResult::Queued);
    let progress = h.wait().await;
    assert_eq!(progress.status, STATUS_COMPLETE);
    assert_eq!(progress.processed_items, 1);
    assert_eq!(h.store.credits_of("e3"), Some(1400.0));
}

#[tokio::test]
async fn test_cancel_then_immediate_enqueue_starts_clean_run() {
    let h = harness(
        test_config(),
        FakeMedia::slow(Duration::from_millis(300)),
        &[("e1", 1400.0), ("e2", 1400.0)],
    );
    let first = h.episode("e1", 1);
    let second = h.episode("e2", 2);

    h.controller.enqueue(first, false, false).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.controller.is_worker_active());

    h.controller.cancel();
    let result = h.controller.enqueue(second, false, false).await;
    assert_eq!(result, EnqueueResult::Queued);

    let progress = h.wait().await;
    assert_eq!(progress.status, STATUS_COMPLETE);
    assert_eq!(progress.total_items, 1);
    assert_eq!(progress.processed_items, 1);
    assert!(progress.failure_reasons.is_empty(), "{:?}", progress.failure_reasons);
    assert_eq!(progress.success_details.len(), 1);
    assert!(progress.success_details.contains_key("Show S01E02 - Episode 2"));
    assert_eq!(h.store.credits_of("e1"), None);
    assert_eq!(h.store.credits_of("e2"), Some(1400.0));
}

#[tokio::test]
async fn test_cancel_during_precompute_skips_popped_entry() {
    let h = harness(
        test_config(),
        FakeMedia::slow(Duration::from_millis(200)),
        &[("e1", 1400.0), ("e2", 1400.0), ("e3", 1400.0)],
    );
    for (stem, number) in [("e1", 1), ("e2", 2), ("e3", 3)] {
        h.episode(stem, number);
    }

    let summary = h.controller.enqueue_series("show", false).await.unwrap();
    assert!(summary.precompute);
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.controller.cancel();

    let progress = h.wait().await;
    assert_eq!(progress.status, STATUS_CANCELLED);
    assert_eq!(progress.processed_items, 0);
    assert_eq!(h.media.duration_lookups.load(Ordering::SeqCst), 3);
    assert_eq!(h.media.extractions.load(Ordering::SeqCst), 1);
    assert_eq!(h.controller.coordinator().batch_cache_len(), 0);
    assert_eq!(h.store.credits_of("e1"), None);
}

#[tokio::test]
async fn test_series_batch_precomputes_and_falls_back() {
    let h = harness(
        test_config(),
        FakeMedia::default(),
        &[("e1", 1400.0), ("e2", 1402.0), ("e3", 1401.0)],
    );
    for (stem, number) in [("e1", 1), ("e2", 2), ("e3", 3), ("e4", 4)] {
        h.episode(stem, number);
    }

    let summary = h.controller.enqueue_series("show", false).await.unwrap();
    assert_eq!(summary.queued, 4);
    assert!(summary.precompute);

    let progress = h.wait().await;
    assert_eq!(progress.status, STATUS_COMPLETE);
    assert_eq!(progress.successful_items, 4, "{:?}", progress.failure_reasons);
    // Pre-compute extracts every episode once; analysis reuses the cache
    assert_eq!(h.media.extractions.load(Ordering::SeqCst), 4);
    // Runtimes resolved during pre-compute are reused when processing
    assert_eq!(h.media.duration_lookups.load(Ordering::SeqCst), 4);
    assert_eq!(h.controller.coordinator().batch_cache_len(), 4);

    assert_eq!(h.store.credits_of("e2"), Some(1402.0));
    // e4 shows no credits of its own and gets the season median
    assert_eq!(h.store.credits_of("e4"), Some(1401.0));
}

#[tokio::test]
async fn test_failures_are_recorded_with_reasons() {
    let mut config = test_config();
    config.detection.enable_fallback = false;
    let h = harness(config, FakeMedia::default(), &[]);

    let silent = h.episode("e1", 1);
    let missing = Episode::new("gone", "Gone", h.root.join("gone.mkv"));

    h.controller.enqueue(silent, false, false).await;
    h.controller.enqueue(missing, false, false).await;

    let progress = h.wait().await;
    assert_eq!(progress.failed_items, 2);
    assert_eq!(
        progress.failure_reasons["Show S01E01 - Episode 1"],
        "No credits detected by any method"
    );
    assert!(progress.failure_reasons["Gone"].starts_with("File not found"));
}

#[tokio::test]
async fn test_new_items_only_when_enabled() {
    let h = harness(test_config(), FakeMedia::default(), &[("e1", 1400.0)]);
    let episode = h.episode("e1", 1);
    assert_eq!(h.controller.on_item_added(episode.clone()).await, None);

    let mut config = test_config();
    config.processing.process_new_items = true;
    let h = harness(config, FakeMedia::default(), &[("e1", 1400.0)]);
    let episode = h.episode("e1", 1);
    assert_eq!(h.controller.on_item_added(episode).await, Some(EnqueueResult::Queued));
    h.wait().await;
    assert_eq!(h.store.credits_of("e1"), Some(1400.0));
}

#[tokio::test]
async fn test_debug_capture_records_one_run() {
    let h = harness(test_config(), FakeMedia::default(), &[("e1", 1400.0)]);
    let episode = h.episode("e1", 1);

    h.controller.start_debug_capture();
    h.controller.enqueue(episode, false, true).await;
    h.wait().await;

    let log = h.controller.retrieve_debug_log().unwrap();
    assert!(log.contains("OCR: early stop, credits at 1400.0s"));
    assert!(h.controller.retrieve_debug_log().is_none());
}
