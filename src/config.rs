use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for the credits detector
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// OCR detection method settings
    pub ocr: OcrConfig,

    /// Detection coordination and fusion settings
    pub detection: DetectionConfig,

    /// Queue and per-episode processing settings
    pub processing: ProcessingConfig,

    /// External media toolchain settings
    pub media: MediaConfig,

    /// Logging and debug capture settings
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    /// Enable the OCR detection method
    pub enabled: bool,

    /// Base URL of the tesseract HTTP service
    pub endpoint: String,

    /// Tesseract language codes sent with each frame
    pub languages: Vec<String>,

    /// Comma or semicolon separated keyword list
    pub keywords: String,

    /// Keyword hits needed inside the match window
    pub min_keyword_matches: usize,

    /// Trailing window (seconds) used to confirm a run of matches
    pub match_window_seconds: f64,

    /// Fraction of the runtime where scanning starts when minutes_from_end is 0
    pub search_start_fraction: f64,

    /// Start scanning this many minutes before the end (0 = use fraction)
    pub minutes_from_end: f64,

    /// Stop scanning this many seconds before the end
    pub stop_seconds_from_end: f64,

    /// Upper bound on the scanned span in seconds (0 = no limit)
    pub max_analysis_seconds: f64,

    /// Frames sampled per second
    pub frame_rate: f64,

    /// Upper bound on extracted frames (0 = no limit)
    pub max_frames: usize,

    /// Image format for extracted frames
    pub image_format: String,

    /// Timeout per OCR request (seconds)
    pub request_timeout_seconds: u64,

    /// Timeout for the reachability check (seconds)
    pub probe_timeout_seconds: u64,

    /// Confidence assigned to every OCR candidate before bonuses
    pub base_confidence: f64,

    /// Priority for the Priority fusion strategy (lower wins)
    pub priority: i32,

    /// OCR requests in flight per episode (1 = sequential)
    pub frame_concurrency: usize,
}

/// How candidates from several methods are reduced to one timestamp
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum FusionStrategy {
    #[default]
    CorrelationScoring,
    Earliest,
    Latest,
    Average,
    Median,
    Priority,
}

impl std::fmt::Display for FusionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FusionStrategy::CorrelationScoring => "CorrelationScoring",
            FusionStrategy::Earliest => "Earliest",
            FusionStrategy::Latest => "Latest",
            FusionStrategy::Average => "Average",
            FusionStrategy::Median => "Median",
            FusionStrategy::Priority => "Priority",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for FusionStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "correlationscoring" | "correlation" => Ok(FusionStrategy::CorrelationScoring),
            "earliest" => Ok(FusionStrategy::Earliest),
            "latest" => Ok(FusionStrategy::Latest),
            "average" => Ok(FusionStrategy::Average),
            "median" => Ok(FusionStrategy::Median),
            "priority" => Ok(FusionStrategy::Priority),
            other => Err(anyhow!("Unknown fusion strategy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Strategy used to fuse candidates
    pub strategy: FusionStrategy,

    /// Seconds within which two detections count as the same event
    pub correlation_window_seconds: f64,

    /// Compare against sibling episodes of the same season
    pub enable_cross_episode: bool,

    /// Weigh cross-episode agreement when scoring candidates
    pub enable_correlation_scoring: bool,

    /// Maximum number of siblings used for comparison
    pub max_comparison_episodes: usize,

    /// Substitute a season estimate when an episode yields nothing
    pub enable_fallback: bool,

    /// Fraction of comparison episodes that must have a detection for fallback
    pub fallback_min_success_rate: f64,
}

/// Rewrites a path prefix, used for network shares seen differently by the catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathMapping {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Skip episodes that already carry a credits marker
    pub only_process_missing: bool,

    /// Queue newly added library items automatically
    pub process_new_items: bool,

    /// Hard cap on queued entries
    pub queue_capacity: usize,

    /// Minimum batch size that switches to pre-computed detection
    pub batch_precompute_threshold: usize,

    /// Pause after every episode (milliseconds)
    pub episode_delay_ms: u64,

    /// Run media subprocesses at reduced priority while processing
    pub lower_priority: bool,

    /// Wait while system load is above this percentage (0 = disabled)
    pub cpu_throttle_percent: f64,

    /// Prefix rewrites applied to episode paths before use
    pub path_mappings: Vec<PathMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// ffmpeg binary
    pub ffmpeg_path: PathBuf,

    /// ffprobe binary
    pub ffprobe_path: PathBuf,

    /// Timeout for duration probes (seconds)
    pub probe_timeout_seconds: u64,

    /// Timeout for frame extraction (seconds)
    pub extract_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Log level
    pub log_level: String,

    /// Debug capture buffer cap in bytes
    pub debug_log_max_bytes: usize,

    /// Debug capture is discarded after this many idle seconds
    pub debug_log_idle_seconds: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://localhost:8884".to_string(),
            languages: vec!["eng".to_string()],
            keywords: "directed by, produced by, executive producer, written by, cast, crew, \
                       music by, edited by, casting by, production designer, \
                       director of photography"
                .to_string(),
            min_keyword_matches: 3,
            match_window_seconds: 10.0,
            search_start_fraction: 0.65,
            minutes_from_end: 0.0,
            stop_seconds_from_end: 0.0,
            max_analysis_seconds: 600.0,
            frame_rate: 1.0,
            max_frames: 0,
            image_format: "jpg".to_string(),
            request_timeout_seconds: 10,
            probe_timeout_seconds: 3,
            base_confidence: 0.8,
            priority: 1,
            frame_concurrency: 1,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            strategy: FusionStrategy::CorrelationScoring,
            correlation_window_seconds: 5.0,
            enable_cross_episode: true,
            enable_correlation_scoring: true,
            max_comparison_episodes: 4,
            enable_fallback: true,
            fallback_min_success_rate: 0.5,
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            only_process_missing: true,
            process_new_items: false,
            queue_capacity: 1000,
            batch_precompute_threshold: 3,
            episode_delay_ms: 500,
            lower_priority: false,
            cpu_throttle_percent: 0.0,
            path_mappings: Vec::new(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            probe_timeout_seconds: 30,
            extract_timeout_seconds: 300,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            debug_log_max_bytes: 10 * 1024 * 1024,
            debug_log_idle_seconds: 300,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load() -> Result<Self> {
        let config_paths = [
            "credits-detector.toml",
            "config/credits-detector.toml",
            "/etc/credits-detector/config.toml",
        ];

        for path in &config_paths {
            if Path::new(path).exists() {
                match Self::load_from(Path::new(path)) {
                    Ok(config) => return Ok(config),
                    Err(e) => tracing::warn!("Failed to parse config file {}: {}", path, e),
                }
            }
        }

        Self::from_env()
    }

    /// Load configuration from an explicit path, then apply environment overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Cannot read {}: {}", path.display(), e))?;
        let mut config: Config = toml::from_str(&config_str)?;
        config.apply_env();
        tracing::info!("📄 Loaded configuration from: {}", path.display());
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(endpoint) = std::env::var("CREDITS_DETECTOR_OCR_ENDPOINT") {
            self.ocr.endpoint = endpoint;
        }

        if let Ok(keywords) = std::env::var("CREDITS_DETECTOR_KEYWORDS") {
            self.ocr.keywords = keywords;
        }

        if let Ok(strategy) = std::env::var("CREDITS_DETECTOR_STRATEGY") {
            match strategy.parse() {
                Ok(strategy) => self.detection.strategy = strategy,
                Err(e) => tracing::warn!("Ignoring CREDITS_DETECTOR_STRATEGY: {}", e),
            }
        }

        if let Ok(ffmpeg) = std::env::var("CREDITS_DETECTOR_FFMPEG") {
            self.media.ffmpeg_path = PathBuf::from(ffmpeg);
        }

        if let Ok(ffprobe) = std::env::var("CREDITS_DETECTOR_FFPROBE") {
            self.media.ffprobe_path = PathBuf::from(ffprobe);
        }

        if let Ok(log_level) = std::env::var("CREDITS_DETECTOR_LOG_LEVEL") {
            self.output.log_level = log_level;
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let config_str = toml::to_string_pretty(self)?;
        std::fs::write(path, config_str)?;
        tracing::info!("💾 Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.ocr.enabled {
            if self.ocr.endpoint.trim().is_empty() {
                return Err(anyhow!("ocr.endpoint is required when OCR detection is enabled"));
            }
            url::Url::parse(&self.ocr.endpoint)
                .map_err(|e| anyhow!("ocr.endpoint is not a valid URL: {}", e))?;
            if self.ocr.frame_rate <= 0.0 {
                return Err(anyhow!("ocr.frame_rate must be greater than 0"));
            }
            if self.ocr.min_keyword_matches == 0 {
                return Err(anyhow!("ocr.min_keyword_matches must be at least 1"));
            }
        }

        if !(0.0..=1.0).contains(&self.ocr.search_start_fraction) {
            return Err(anyhow!("ocr.search_start_fraction must be within 0..=1"));
        }

        if self.detection.correlation_window_seconds < 0.0 {
            return Err(anyhow!("detection.correlation_window_seconds must not be negative"));
        }

        if !(0.0..=1.0).contains(&self.detection.fallback_min_success_rate) {
            return Err(anyhow!("detection.fallback_min_success_rate must be within 0..=1"));
        }

        if self.processing.queue_capacity == 0 {
            return Err(anyhow!("processing.queue_capacity must be greater than 0"));
        }

        tracing::info!("✅ Configuration validation passed");
        Ok(())
    }

    /// Get runtime configuration summary
    pub fn summary(&self) -> String {
        format!(
            "Credits Detector Configuration:\n\
            - OCR Endpoint: {}\n\
            - OCR Enabled: {}\n\
            - Fusion Strategy: {}\n\
            - Correlation Window: {:.1}s\n\
            - Cross-Episode Comparison: {}\n\
            - Fallback Enabled: {}\n\
            - Only Process Missing: {}\n\
            - Queue Capacity: {}",
            self.ocr.endpoint,
            self.ocr.enabled,
            self.detection.strategy,
            self.detection.correlation_window_seconds,
            self.detection.enable_cross_episode,
            self.detection.enable_fallback,
            self.processing.only_process_missing,
            self.processing.queue_capacity
        )
    }
}

/// Configuration builder for programmatic config creation
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_ocr_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.ocr.endpoint = endpoint.into();
        self
    }

    pub fn with_keywords(mut self, keywords: impl Into<String>) -> Self {
        self.config.ocr.keywords = keywords.into();
        self
    }

    pub fn with_strategy(mut self, strategy: FusionStrategy) -> Self {
        self.config.detection.strategy = strategy;
        self
    }

    pub fn with_correlation_window(mut self, seconds: f64) -> Self {
        self.config.detection.correlation_window_seconds = seconds;
        self
    }

    pub fn enable_cross_episode(mut self, enable: bool) -> Self {
        self.config.detection.enable_cross_episode = enable;
        self
    }

    pub fn enable_fallback(mut self, enable: bool) -> Self {
        self.config.detection.enable_fallback = enable;
        self
    }

    pub fn only_process_missing(mut self, enable: bool) -> Self {
        self.config.processing.only_process_missing = enable;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.processing.queue_capacity = capacity;
        self
    }

    pub fn with_episode_delay_ms(mut self, delay: u64) -> Self {
        self.config.processing.episode_delay_ms = delay;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.processing.queue_capacity, 1000);
        assert_eq!(config.detection.strategy, FusionStrategy::CorrelationScoring);
        assert_eq!(config.ocr.match_window_seconds, 10.0);
        assert!(config.processing.only_process_missing);
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .with_strategy(FusionStrategy::Median)
            .with_correlation_window(8.0)
            .enable_fallback(false)
            .build();

        assert_eq!(config.detection.strategy, FusionStrategy::Median);
        assert_eq!(config.detection.correlation_window_seconds, 8.0);
        assert!(!config.detection.enable_fallback);
    }

    #[test]
    fn test_config_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());

        let broken = ConfigBuilder::new().with_ocr_endpoint("").build();
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [detection]
            strategy = "Latest"

            [ocr]
            keywords = "cast; crew"
            "#,
        )
        .unwrap();

        assert_eq!(config.detection.strategy, FusionStrategy::Latest);
        assert_eq!(config.ocr.keywords, "cast; crew");
        assert_eq!(config.detection.max_comparison_episodes, 4);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("median".parse::<FusionStrategy>().unwrap(), FusionStrategy::Median);
        assert!("loudest".parse::<FusionStrategy>().is_err());
    }
}
