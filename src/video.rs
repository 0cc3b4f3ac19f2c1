use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::MediaConfig;

/// Parameters for one frame extraction run
#[derive(Debug, Clone)]
pub struct FrameExtractionRequest {
    pub video_path: PathBuf,
    pub start_seconds: f64,
    pub duration_seconds: f64,
    pub fps: f64,
    /// Image extension, e.g. `jpg`
    pub format: String,
    pub output_dir: PathBuf,
}

/// External transcoding toolchain
#[async_trait]
pub trait MediaToolkit: Send + Sync {
    /// Runtime of a media file in seconds
    async fn probe_duration(&self, path: &Path) -> Result<f64>;

    /// Extract frames into `request.output_dir`, returning them in chronological order
    async fn extract_frames(&self, request: &FrameExtractionRequest) -> Result<Vec<PathBuf>>;
}

/// Shared switch that runs media subprocesses under `nice` while lowered
#[derive(Debug, Default)]
pub struct ProcessPriority {
    lowered: AtomicBool,
}

impl ProcessPriority {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_lowered(&self) -> bool {
        self.lowered.load(Ordering::SeqCst)
    }

    /// Lower priority until the returned guard is dropped
    pub fn lower(&self) -> PriorityGuard<'_> {
        let previous = self.lowered.swap(true, Ordering::SeqCst);
        debug!("🔽 Lowered media process priority");
        PriorityGuard {
            priority: self,
            previous,
        }
    }
}

/// Restores the previous priority on drop
#[derive(Debug)]
pub struct PriorityGuard<'a> {
    priority: &'a ProcessPriority,
    previous: bool,
}

impl Drop for PriorityGuard<'_> {
    fn drop(&mut self) {
        self.priority.lowered.store(self.previous, Ordering::SeqCst);
        debug!("🔼 Restored media process priority");
    }
}

/// FFmpeg-backed media toolkit
#[derive(Clone)]
pub struct FfmpegToolkit {
    config: MediaConfig,
    priority: Arc<ProcessPriority>,
}

impl FfmpegToolkit {
    pub fn new(config: MediaConfig, priority: Arc<ProcessPriority>) -> Self {
        Self { config, priority }
    }

    fn command(&self, program: &Path) -> Command {
        let mut cmd = if cfg!(unix) && self.priority.is_lowered() {
            let mut cmd = Command::new("nice");
            cmd.args(["-n", "10"]).arg(program);
            cmd
        } else {
            Command::new(program)
        };
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl MediaToolkit for FfmpegToolkit {
    async fn probe_duration(&self, path: &Path) -> Result<f64> {
        let mut cmd = self.command(&self.config.ffprobe_path);
        cmd.args([
            "-v", "error",
            "-show_entries", "format=duration",
            "-of", "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path);

        let timeout = Duration::from_secs(self.config.probe_timeout_seconds);
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("ffprobe timed out after {}s", timeout.as_secs()))?
            .context("failed to run ffprobe")?;

        if !output.status.success() {
            return Err(anyhow!(
                "ffprobe failed for {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        parse_duration_output(&String::from_utf8_lossy(&output.stdout))
    }

    async fn extract_frames(&self, request: &FrameExtractionRequest) -> Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(&request.output_dir).await?;

        let pattern = request
            .output_dir
            .join(format!("frame_%05d.{}", request.format));

        info!(
            "🎞️ Extracting frames from {} ({:.1}s..{:.1}s at {} fps)",
            request.video_path.display(),
            request.start_seconds,
            request.start_seconds + request.duration_seconds,
            request.fps
        );

        let mut cmd = self.command(&self.config.ffmpeg_path);
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin"])
            .args(["-ss", &format!("{:.3}", request.start_seconds)])
            .arg("-i")
            .arg(&request.video_path)
            .args(["-t", &format!("{:.3}", request.duration_seconds)])
            .args(["-vf", &format!("fps={}", request.fps)])
            .args(["-q:v", "2", "-y"])
            .arg(&pattern);

        let timeout = Duration::from_secs(self.config.extract_timeout_seconds);
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("frame extraction timed out after {}s", timeout.as_secs()))?
            .context("failed to run ffmpeg")?;

        if !output.status.success() {
            return Err(anyhow!(
                "Frame extraction failed for {}: {}",
                request.video_path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        list_frames(&request.output_dir, &request.format).await
    }
}

fn parse_duration_output(stdout: &str) -> Result<f64> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse::<f64>().ok())
        .ok_or_else(|| anyhow!("ffprobe returned no duration"))
}

/// Frames in `dir` with the given extension, sorted by file name
pub async fn list_frames(dir: &Path, format: &str) -> Result<Vec<PathBuf>> {
    let mut frames = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(format))
        {
            frames.push(path);
        }
    }

    frames.sort();
    Ok(frames)
}
