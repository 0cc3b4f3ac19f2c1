//! Opt-in capture of detection log lines for one run.
//!
//! The capture lives next to the regular `tracing` output: callers that want a
//! line to show up in a user-facing debug log append it here as well. The
//! buffer is bounded; when it grows past its cap roughly the oldest fifth is
//! dropped and a single truncation marker is placed at the head. The line
//! just appended always survives a truncation.

use chrono::Local;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn, Level};

pub const TRUNCATION_MARKER: &str = "[... earlier debug output truncated ...]\n";

const DEFAULT_MAX_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
struct CaptureBuffer {
    text: String,
    last_activity: Instant,
    truncations: usize,
}

/// Bounded, head-truncating debug log
#[derive(Debug)]
pub struct DebugCapture {
    max_bytes: usize,
    idle_timeout: Duration,
    buffer: Mutex<Option<CaptureBuffer>>,
}

impl DebugCapture {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_BYTES, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_limits(max_bytes: usize, idle_timeout: Duration) -> Self {
        Self {
            max_bytes: max_bytes.max(64),
            idle_timeout,
            buffer: Mutex::new(None),
        }
    }

    /// Begin a fresh capture, discarding any previous one
    pub fn start(&self) {
        let mut guard = self.lock();
        *guard = Some(CaptureBuffer {
            text: String::new(),
            last_activity: Instant::now(),
            truncations: 0,
        });
        debug!("🐞 Debug capture started");
    }

    pub fn is_active(&self) -> bool {
        let mut guard = self.lock();
        self.expire_if_idle(&mut guard);
        guard.is_some()
    }

    /// Append a timestamped line; a no-op when no capture is active
    pub fn log(&self, level: Level, message: impl AsRef<str>) {
        let mut guard = self.lock();
        self.expire_if_idle(&mut guard);

        let Some(buffer) = guard.as_mut() else {
            return;
        };

        let line = format!(
            "[{}] [{}] {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level,
            message.as_ref()
        );
        let newest_line = buffer.text.len();
        buffer.text.push_str(&line);
        buffer.last_activity = Instant::now();

        if buffer.text.len() > self.max_bytes {
            truncate_head(&mut buffer.text, newest_line);
            buffer.truncations += 1;
        }
    }

    /// Emit through `tracing` and append to the capture
    pub fn trace(&self, level: Level, message: impl AsRef<str>) {
        let message = message.as_ref();
        if level == Level::ERROR {
            error!("{}", message);
        } else if level == Level::WARN {
            warn!("{}", message);
        } else if level == Level::INFO {
            info!("{}", message);
        } else {
            debug!("{}", message);
        }
        self.log(level, message);
    }

    /// Take the captured text and end the capture
    pub fn retrieve(&self) -> Option<String> {
        let mut guard = self.lock();
        self.expire_if_idle(&mut guard);
        guard.take().map(|buffer| buffer.text)
    }

    /// Number of truncations in the active capture
    pub fn truncation_count(&self) -> usize {
        self.lock().as_ref().map_or(0, |b| b.truncations)
    }

    /// Drop the capture if it sat unretrieved past the idle timeout
    pub fn purge_if_idle(&self) -> bool {
        let mut guard = self.lock();
        self.expire_if_idle(&mut guard)
    }

    fn expire_if_idle(&self, guard: &mut Option<CaptureBuffer>) -> bool {
        let expired = guard
            .as_ref()
            .is_some_and(|b| b.last_activity.elapsed() >= self.idle_timeout);
        if expired {
            *guard = None;
            debug!("🧹 Debug capture discarded after idle timeout");
        }
        expired
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<CaptureBuffer>> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for DebugCapture {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace roughly the oldest fifth of `text` with the marker. Bytes from
/// `newest_line` on are never removed.
fn truncate_head(text: &mut String, mut newest_line: usize) {
    if let Some(rest) = text.strip_prefix(TRUNCATION_MARKER) {
        *text = rest.to_string();
        newest_line = newest_line.saturating_sub(TRUNCATION_MARKER.len());
    }

    let mut fifth = text.len() / 5;
    while fifth < text.len() && !text.is_char_boundary(fifth) {
        fifth += 1;
    }
    // Prefer a line boundary, unless the next one lies past the middle
    let cut = match text[fifth..].find('\n') {
        Some(newline) if fifth + newline + 1 <= text.len() / 2 => fifth + newline + 1,
        _ => fifth,
    };

    text.replace_range(..cut.min(newest_line), TRUNCATION_MARKER);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_capture_ignores_lines() {
        let capture = DebugCapture::new();
        capture.log(Level::INFO, "nobody is listening");
        assert!(capture.retrieve().is_none());
    }

    #[test]
    fn test_retrieve_returns_and_clears() {
        let capture = DebugCapture::new();
        capture.start();
        capture.log(Level::INFO, "first");
        capture.log(Level::WARN, "second");

        let text = capture.retrieve().unwrap();
        assert!(text.contains("[INFO] first"));
        assert!(text.contains("[WARN] second"));
        assert_eq!(text.lines().count(), 2);

        assert!(capture.retrieve().is_none());
        assert!(!capture.is_active());
    }

    #[test]
    fn test_single_overflow_inserts_one_marker() {
        let capture = DebugCapture::with_limits(1000, DEFAULT_IDLE_TIMEOUT);
        capture.start();

        let mut logged = 0;
        while capture.truncation_count() == 0 {
            capture.log(Level::DEBUG, format!("line {:04} with some padding text", logged));
            logged += 1;
        }

        assert_eq!(capture.truncation_count(), 1);
        let text = capture.retrieve().unwrap();
        assert!(text.starts_with(TRUNCATION_MARKER));
        assert_eq!(text.matches(TRUNCATION_MARKER).count(), 1);
        assert!(text.len() <= 1000);
        assert!(text.contains(&format!("line {:04}", logged - 1)));
        assert!(!text.contains("line 0000"));
    }

    #[test]
    fn test_repeated_overflow_keeps_single_marker() {
        let capture = DebugCapture::with_limits(500, DEFAULT_IDLE_TIMEOUT);
        capture.start();
        for i in 0..200 {
            capture.log(Level::INFO, format!("entry {}", i));
        }

        assert!(capture.truncation_count() > 1);
        let text = capture.retrieve().unwrap();
        assert_eq!(text.matches(TRUNCATION_MARKER).count(), 1);
        assert!(text.contains("entry 199"));
    }

    #[test]
    fn test_oversized_line_survives_truncation() {
        let capture = DebugCapture::with_limits(1000, DEFAULT_IDLE_TIMEOUT);
        capture.start();
        for i in 0..10 {
            capture.log(Level::INFO, format!("short {:02}", i));
        }
        let big = "x".repeat(5000);
        capture.log(Level::DEBUG, &big);

        assert_eq!(capture.truncation_count(), 1);
        let text = capture.retrieve().unwrap();
        assert!(text.starts_with(TRUNCATION_MARKER));
        assert_eq!(text.matches(TRUNCATION_MARKER).count(), 1);
        assert!(text.contains(&format!("{}\n", big)));
        assert!(!text.contains("short 09"));
    }

    #[test]
    fn test_long_line_at_the_cut_is_split_near_a_fifth() {
        let mut text = format!("{}\n{}", "a".repeat(700), "short line\n".repeat(30));
        assert_eq!(text.len(), 1031);
        let newest_line = text.len() - "short line\n".len();

        truncate_head(&mut text, newest_line);
        assert!(text.starts_with(TRUNCATION_MARKER));
        assert_eq!(text.len() - TRUNCATION_MARKER.len(), 1031 - 206);
        assert!(text.ends_with("short line\n"));
    }

    #[test]
    fn test_truncation_never_reaches_the_newest_line() {
        let mut text = format!("{}{}\n", "old\n".repeat(3), "x".repeat(5000));
        truncate_head(&mut text, 12);
        assert_eq!(text, format!("{}{}\n", TRUNCATION_MARKER, "x".repeat(5000)));

        // An existing marker is replaced, not stacked
        truncate_head(&mut text, TRUNCATION_MARKER.len());
        assert_eq!(text.matches(TRUNCATION_MARKER).count(), 1);
        assert!(text.ends_with("x\n"));
    }

    #[test]
    fn test_idle_capture_is_discarded() {
        let capture = DebugCapture::with_limits(1000, Duration::from_millis(0));
        capture.start();
        assert!(capture.purge_if_idle());
        assert!(capture.retrieve().is_none());
    }
}
