//! Bounded processing queue drained by at most one background worker.
//!
//! Producers (API calls, CLI, library events) only append entries and bump the
//! expected total. The worker is started on demand through a non-blocking
//! acquire on a single-permit semaphore, so a second start attempt while a
//! drain loop is alive returns immediately.

use futures::FutureExt;
use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::catalog::{Episode, ItemFilter, ItemStore, MarkerAdapter};
use crate::config::Config;
use crate::debug_capture::DebugCapture;
use crate::detection::{DetectionCoordinator, DetectionMethod, OcrDetectionMethod};
use crate::ocr::OcrClient;
use crate::error::ProcessingError;
use crate::pipeline::{BatchContext, EpisodeProcessingPipeline};
use crate::state::{
    ProgressState, ProgressTracker, STATUS_CANCELLED, STATUS_COMPLETE, STATUS_DRY_RUN_COMPLETE,
    STATUS_PRECOMPUTING, STATUS_PROCESSING,
};
use crate::video::{MediaToolkit, ProcessPriority};

/// One queued unit of work
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub episode: Episode,
    /// Requested explicitly by a user; bypasses skip and dedup rules
    pub is_manual: bool,
    pub is_dry_run: bool,
}

/// What happened to an enqueue request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Queued,
    /// Already has a credits marker; recorded as success without queueing
    AlreadyExists,
    /// Already queued or in flight
    Duplicate,
    /// Queue at capacity
    Dropped,
}

/// Counts for a batch enqueue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub queued: usize,
    pub already_exists: usize,
    pub duplicates: usize,
    pub dropped: usize,
    pub precompute: bool,
}

struct BatchRun {
    episodes: Arc<Vec<Episode>>,
    /// Set once the detections were pre-computed
    context: Option<Arc<BatchContext>>,
}

struct QueueInner {
    config: Config,
    store: Arc<dyn ItemStore>,
    markers: MarkerAdapter,
    pipeline: Arc<EpisodeProcessingPipeline>,
    coordinator: Arc<DetectionCoordinator>,
    debug_capture: Arc<DebugCapture>,
    progress: ProgressTracker,
    queue: Mutex<VecDeque<QueueEntry>>,
    /// Ids queued or in flight
    seen: Mutex<HashSet<String>>,
    worker: Arc<Semaphore>,
    cancelled: AtomicBool,
    /// Bumped under the queue lock whenever a run starts or is cancelled
    generation: AtomicU64,
    run_is_dry: AtomicBool,
    batch: Mutex<Option<BatchRun>>,
}

/// Handle to the processing queue; clones share one queue and one worker
#[derive(Clone)]
pub struct ProcessingQueueController {
    inner: Arc<QueueInner>,
}

impl ProcessingQueueController {
    pub fn new(
        config: Config,
        store: Arc<dyn ItemStore>,
        pipeline: Arc<EpisodeProcessingPipeline>,
        coordinator: Arc<DetectionCoordinator>,
        debug_capture: Arc<DebugCapture>,
    ) -> Self {
        let markers = *pipeline.markers();
        info!(
            "📋 Processing queue ready (capacity {}, batch threshold {})",
            config.processing.queue_capacity, config.processing.batch_precompute_threshold
        );

        Self {
            inner: Arc::new(QueueInner {
                config,
                store,
                markers,
                pipeline,
                coordinator,
                debug_capture,
                progress: ProgressTracker::new(),
                queue: Mutex::new(VecDeque::new()),
                seen: Mutex::new(HashSet::new()),
                worker: Arc::new(Semaphore::new(1)),
                cancelled: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                run_is_dry: AtomicBool::new(false),
                batch: Mutex::new(None),
            }),
        }
    }

    /// Wire the standard OCR detection stack around the given services
    pub fn with_services(
        config: Config,
        store: Arc<dyn ItemStore>,
        media: Arc<dyn MediaToolkit>,
        ocr: Arc<dyn OcrClient>,
        priority: Arc<ProcessPriority>,
    ) -> Self {
        let debug_capture = Arc::new(DebugCapture::with_limits(
            config.output.debug_log_max_bytes,
            std::time::Duration::from_secs(config.output.debug_log_idle_seconds),
        ));

        let methods: Vec<Arc<dyn DetectionMethod>> = vec![Arc::new(OcrDetectionMethod::new(
            config.ocr.clone(),
            ocr,
            Arc::clone(&media),
            Arc::clone(&debug_capture),
        ))];
        let coordinator = Arc::new(DetectionCoordinator::new(
            config.detection.clone(),
            methods,
            Arc::clone(&debug_capture),
        ));
        let pipeline = Arc::new(EpisodeProcessingPipeline::new(
            config.clone(),
            Arc::clone(&store),
            media,
            Arc::clone(&coordinator),
            priority,
        ));

        Self::new(config, store, pipeline, coordinator, debug_capture)
    }

    pub fn coordinator(&self) -> &Arc<DetectionCoordinator> {
        &self.inner.coordinator
    }

    /// Queue one episode and start the worker if it is idle
    pub async fn enqueue(
        &self,
        episode: Episode,
        is_manual: bool,
        is_dry_run: bool,
    ) -> EnqueueResult {
        self.begin_run_if_idle(is_dry_run);
        let result = self.push(episode, is_manual, is_dry_run).await;
        self.try_start_worker();
        result
    }

    /// Replace the queue with a batch. Large batches with cross-episode
    /// scoring get their detections pre-computed before processing starts.
    pub async fn enqueue_batch(&self, episodes: Vec<Episode>, is_dry_run: bool) -> BatchSummary {
        let inner = &self.inner;
        inner.coordinator.clear_batch_cache();
        let cleared = {
            let mut queue = self.queue();
            let cleared = queue.len();
            queue.clear();
            cleared
        };
        self.seen().clear();
        *self.batch() = None;
        if cleared > 0 {
            debug!("Cleared {} queued entries for new batch", cleared);
        }

        self.start_run(is_dry_run, STATUS_PROCESSING);

        let mut summary = BatchSummary::default();
        let mut admitted = Vec::with_capacity(episodes.len());
        for episode in episodes {
            if self.skip_existing(&episode, false).await {
                summary.already_exists += 1;
            } else {
                admitted.push(episode);
            }
        }

        // Queue and batch mode are published together so the worker never
        // sees part of a batch without its mode
        {
            let mut queue = self.queue();
            let mut seen = self.seen();
            let mut queued = Vec::with_capacity(admitted.len());
            for episode in admitted {
                let entry = QueueEntry {
                    episode: episode.clone(),
                    is_manual: false,
                    is_dry_run,
                };
                match self.push_locked(&mut queue, &mut seen, entry) {
                    EnqueueResult::Queued => queued.push(episode),
                    EnqueueResult::Duplicate => summary.duplicates += 1,
                    EnqueueResult::Dropped => summary.dropped += 1,
                    EnqueueResult::AlreadyExists => summary.already_exists += 1,
                }
            }
            summary.queued = queued.len();

            let processing = &inner.config.processing;
            let detection = &inner.config.detection;
            summary.precompute = queued.len() >= processing.batch_precompute_threshold
                && detection.enable_cross_episode
                && detection.enable_correlation_scoring;

            if summary.precompute {
                *self.batch() = Some(BatchRun {
                    episodes: Arc::new(queued),
                    context: None,
                });
                inner.progress.set_status(STATUS_PRECOMPUTING);
            }
        }

        info!(
            "📥 Batch enqueued: {} queued, {} already done, {} dropped ({} mode)",
            summary.queued,
            summary.already_exists,
            summary.dropped,
            if summary.precompute { "batch" } else { "sequential" }
        );

        self.try_start_worker();
        summary
    }

    /// Queue every episode of a series in season/episode order
    pub async fn enqueue_series(
        &self,
        series_id: &str,
        is_dry_run: bool,
    ) -> anyhow::Result<BatchSummary> {
        let mut episodes = self.inner.store.list(&ItemFilter::series(series_id)).await?;
        sort_episodes(&mut episodes);
        info!("📺 Queueing series {} ({} episodes)", series_id, episodes.len());
        Ok(self.enqueue_batch(episodes, is_dry_run).await)
    }

    /// Queue the whole library
    pub async fn enqueue_library(&self, is_dry_run: bool) -> anyhow::Result<BatchSummary> {
        let mut episodes = self.inner.store.list(&ItemFilter::all()).await?;
        sort_episodes(&mut episodes);
        info!("📚 Queueing library ({} episodes)", episodes.len());
        Ok(self.enqueue_batch(episodes, is_dry_run).await)
    }

    /// Library event hook; ignored unless new items are processed automatically
    pub async fn on_item_added(&self, episode: Episode) -> Option<EnqueueResult> {
        if !self.inner.config.processing.process_new_items {
            return None;
        }
        debug!("New library item: {}", episode.label());
        Some(self.enqueue(episode, false, false).await)
    }

    /// Stop processing: abort in-flight detection, drain the queue and forget
    /// queued ids. The progress is finalised as cancelled.
    pub fn cancel(&self) {
        let inner = &self.inner;
        inner.cancelled.store(true, Ordering::SeqCst);
        inner.coordinator.cancel();

        let drained = {
            let mut queue = self.queue();
            inner.generation.fetch_add(1, Ordering::SeqCst);
            let drained = queue.len();
            queue.clear();
            drained
        };
        self.seen().clear();
        *self.batch() = None;

        inner.progress.finish(STATUS_CANCELLED);
        info!("🛑 Processing cancelled, {} queued entries dropped", drained);
    }

    /// Drop queued entries without cancelling the item in flight
    pub fn clear_queue(&self) -> usize {
        let removed: Vec<QueueEntry> = self.queue().drain(..).collect();
        {
            let mut seen = self.seen();
            for entry in &removed {
                seen.remove(&entry.episode.id);
            }
        }
        self.inner.progress.update(|state| {
            state.total_items = state.total_items.saturating_sub(removed.len());
        });
        info!("🧹 Cleared {} queued entries", removed.len());
        removed.len()
    }

    /// Snapshot of the current progress
    pub fn get_progress(&self) -> ProgressState {
        self.inner.debug_capture.purge_if_idle();
        self.inner.progress.snapshot()
    }

    pub fn queued_len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_worker_active(&self) -> bool {
        self.inner.worker.available_permits() == 0
    }

    pub fn start_debug_capture(&self) {
        self.inner.debug_capture.start();
    }

    /// One-shot read of the debug log; ends the capture
    pub fn retrieve_debug_log(&self) -> Option<String> {
        self.inner.debug_capture.retrieve()
    }

    /// Spawn the drain loop unless one is already running
    pub fn try_start_worker(&self) -> bool {
        let Ok(permit) = Arc::clone(&self.inner.worker).try_acquire_owned() else {
            return false;
        };

        let controller = self.clone();
        tokio::spawn(async move { controller.run_worker(permit).await });
        true
    }

    async fn run_worker(self, mut permit: OwnedSemaphorePermit) {
        loop {
            {
                let _run = RunGuard {
                    controller: &self,
                    _permit: permit,
                };
                self.drain().await;
            }

            // An entry may have been pushed after the drain saw an empty queue
            // but before the permit was released
            if self.inner.cancelled.load(Ordering::SeqCst) || self.queued_len() == 0 {
                return;
            }
            match Arc::clone(&self.inner.worker).try_acquire_owned() {
                Ok(next) => {
                    debug!("Worker picking up late entries");
                    self.inner.progress.update(|state| {
                        if !state.is_running {
                            state.is_running = true;
                            state.status = STATUS_PROCESSING.to_string();
                            state.end_time = None;
                        }
                    });
                    permit = next;
                }
                Err(_) => return,
            }
        }
    }

    async fn drain(&self) {
        let inner = &self.inner;
        loop {
            if inner.cancelled.load(Ordering::SeqCst) {
                break;
            }
            let Some((entry, generation)) = self.pop_entry() else {
                break;
            };
            let label = entry.episode.label();

            let batch = self.prepare_batch().await;
            if self.is_stale(generation) {
                debug!("Dropping {} after cancellation", label);
                continue;
            }

            inner.progress.set_current(Some(label.clone()), 0.0);
            debug!("▶️ Processing {}", label);

            let process = inner
                .pipeline
                .process(&entry.episode, entry.is_dry_run, batch.as_deref());
            let outcome = AssertUnwindSafe(process).catch_unwind().await;

            // A newer run owns the progress and the seen set now
            if self.is_stale(generation) {
                debug!("Discarding result for {} after cancellation", label);
                continue;
            }
            self.seen().remove(&entry.episode.id);

            match outcome {
                Ok(outcome) if outcome.success => {
                    inner.progress.record_success(&label, outcome.timestamp)
                }
                Ok(outcome) => inner.progress.record_failure(
                    &label,
                    outcome.failure_reason.unwrap_or_else(|| "Unknown error".to_string()),
                ),
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!("💥 Unexpected error while processing {}: {}", label, reason);
                    inner
                        .progress
                        .record_failure(&label, ProcessingError::Unexpected(reason).to_string());
                }
            }
            inner.progress.set_current(Some(label), 100.0);

            inner.pipeline.pause_between_items().await;
        }
    }

    /// Pop the next entry together with the generation current at dequeue
    fn pop_entry(&self) -> Option<(QueueEntry, u64)> {
        let mut queue = self.queue();
        let entry = queue.pop_front()?;
        Some((entry, self.inner.generation.load(Ordering::SeqCst)))
    }

    /// Whether work from `generation` was cancelled or superseded
    fn is_stale(&self, generation: u64) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
            || self.inner.generation.load(Ordering::SeqCst) != generation
    }

    /// Run the batch pre-compute once per batch and hand back its context
    async fn prepare_batch(&self) -> Option<Arc<BatchContext>> {
        let episodes = {
            let batch = self.batch();
            let run = batch.as_ref()?;
            if let Some(context) = &run.context {
                return Some(Arc::clone(context));
            }
            Arc::clone(&run.episodes)
        };

        let inner = &self.inner;
        inner.progress.set_status(STATUS_PRECOMPUTING);
        info!("🧮 Pre-computing detections for {} episodes", episodes.len());

        let result = AssertUnwindSafe(async {
            let mut entries = Vec::with_capacity(episodes.len());
            for episode in episodes.iter() {
                if inner.cancelled.load(Ordering::SeqCst) {
                    break;
                }
                match inner.pipeline.comparison_entry(episode).await {
                    Ok(entry) => entries.push(entry),
                    Err(e) => debug!("Not pre-computing {}: {}", episode.label(), e),
                }
            }

            let progress = &inner.progress;
            inner
                .coordinator
                .pre_compute_batch_detections(&entries, |fraction| {
                    let label = Some("Pre-computing detections".to_string());
                    progress.set_current(label, fraction * 100.0)
                })
                .await;
            entries
        })
        .catch_unwind()
        .await;

        if !inner.cancelled.load(Ordering::SeqCst) {
            inner.progress.set_status(STATUS_PROCESSING);
        }
        let mut batch = self.batch();
        match result {
            Ok(entries) => match batch.as_mut() {
                Some(run) if Arc::ptr_eq(&run.episodes, &episodes) => {
                    let context = Arc::new(BatchContext::new(episodes.to_vec(), entries));
                    run.context = Some(Arc::clone(&context));
                    Some(context)
                }
                // Batch was replaced or cancelled meanwhile
                _ => None,
            },
            Err(panic) => {
                error!(
                    "💥 Batch pre-compute failed, processing sequentially: {}",
                    panic_message(panic.as_ref())
                );
                *batch = None;
                None
            }
        }
    }

    fn begin_run_if_idle(&self, is_dry_run: bool) {
        let idle = !self.inner.progress.snapshot().is_running;
        if idle {
            *self.batch() = None;
            self.start_run(is_dry_run, STATUS_PROCESSING);
        }
    }

    fn start_run(&self, is_dry_run: bool, status: &str) {
        let inner = &self.inner;
        {
            let _queue = self.queue();
            inner.generation.fetch_add(1, Ordering::SeqCst);
        }
        inner.cancelled.store(false, Ordering::SeqCst);
        inner.coordinator.reset_cancellation();
        inner.run_is_dry.store(is_dry_run, Ordering::SeqCst);
        inner.progress.begin_run(self.queued_len(), status);
    }

    async fn push(&self, episode: Episode, is_manual: bool, is_dry_run: bool) -> EnqueueResult {
        if self.skip_existing(&episode, is_manual).await {
            return EnqueueResult::AlreadyExists;
        }

        let mut queue = self.queue();
        let mut seen = self.seen();
        self.push_locked(
            &mut queue,
            &mut seen,
            QueueEntry {
                episode,
                is_manual,
                is_dry_run,
            },
        )
    }

    /// Record non-manual episodes that already have credits as done
    async fn skip_existing(&self, episode: &Episode, is_manual: bool) -> bool {
        let inner = &self.inner;
        if is_manual || !inner.config.processing.only_process_missing {
            return false;
        }
        if !self.has_credits(episode).await {
            return false;
        }

        let label = episode.label();
        debug!("⏭️ {} already has credits", label);
        inner.progress.record_existing(&label);
        true
    }

    fn push_locked(
        &self,
        queue: &mut VecDeque<QueueEntry>,
        seen: &mut HashSet<String>,
        entry: QueueEntry,
    ) -> EnqueueResult {
        let capacity = self.inner.config.processing.queue_capacity;
        if !entry.is_manual && seen.contains(&entry.episode.id) {
            debug!("{} is already queued", entry.episode.label());
            return EnqueueResult::Duplicate;
        }
        if queue.len() >= capacity {
            warn!("⚠️ Queue full ({} entries), dropping {}", capacity, entry.episode.label());
            return EnqueueResult::Dropped;
        }

        seen.insert(entry.episode.id.clone());
        queue.push_back(entry);
        self.inner.progress.add_expected(1);
        EnqueueResult::Queued
    }

    async fn has_credits(&self, episode: &Episode) -> bool {
        match self.inner.store.get_chapters(&episode.id).await {
            Ok(chapters) => self.inner.markers.find_credits(&chapters).is_some(),
            Err(e) => {
                warn!("Could not read chapters for {}: {}", episode.label(), e);
                false
            }
        }
    }

    fn finalize_run(&self) {
        let inner = &self.inner;
        let status = if inner.cancelled.load(Ordering::SeqCst) {
            STATUS_CANCELLED
        } else if inner.run_is_dry.load(Ordering::SeqCst) {
            STATUS_DRY_RUN_COMPLETE
        } else {
            STATUS_COMPLETE
        };
        inner.progress.finish(status);

        let state = inner.progress.snapshot();
        info!(
            "🏁 {}: {}/{} succeeded, {} failed",
            status, state.successful_items, state.processed_items, state.failed_items
        );
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<QueueEntry>> {
        self.inner.queue.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn seen(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inner.seen.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn batch(&self) -> MutexGuard<'_, Option<BatchRun>> {
        self.inner.batch.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Finalises the run and then releases the worker permit, even on unwind
struct RunGuard<'a> {
    controller: &'a ProcessingQueueController,
    _permit: OwnedSemaphorePermit,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.controller.finalize_run();
    }
}

fn sort_episodes(episodes: &mut [Episode]) {
    episodes.sort_by(|a, b| {
        (&a.series_name, a.season_number, a.episode_number, &a.name).cmp(&(
            &b.series_name,
            b.season_number,
            b.episode_number,
            &b.name,
        ))
    });
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}
