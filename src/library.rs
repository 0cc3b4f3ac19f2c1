use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::fs;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::catalog::{Episode, ItemFilter, ItemStore, Marker};

const VIDEO_EXTENSIONS: &[&str] = &["mkv", "mp4", "m4v", "avi", "mov", "ts", "webm", "wmv"];
const CHAPTERS_SUFFIX: &str = ".chapters.json";

/// Item store over a `Series/Season N/Show S01E02 - Title.mkv` directory tree.
///
/// Chapters live next to each video as `<video>.chapters.json`.
pub struct FileItemStore {
    root: PathBuf,
    episode_pattern: Regex,
    season_pattern: Regex,
    episodes: RwLock<Vec<Episode>>,
}

impl FileItemStore {
    /// Scan `root` and build the catalog
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(anyhow!("Library directory does not exist: {}", root.display()));
        }

        let store = Self {
            root,
            episode_pattern: Regex::new(r"(?i)s(\d{1,2})\s*e(\d{1,3})|(\d{1,2})x(\d{2,3})")?,
            season_pattern: Regex::new(r"(?i)^(?:season|series|s)\s*(\d{1,3})$")?,
            episodes: RwLock::new(Vec::new()),
        };
        store.rescan()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the library again, replacing the cached catalog
    pub fn rescan(&self) -> Result<usize> {
        let mut episodes = Vec::new();

        for entry in WalkDir::new(&self.root).min_depth(1).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable library entry: {}", e);
                    continue;
                }
            };
            if entry.file_type().is_file() && is_video_file(entry.path()) {
                if let Some(episode) = self.episode_from_path(entry.path()) {
                    episodes.push(episode);
                }
            }
        }

        episodes.sort_by(|a, b| a.path.cmp(&b.path));
        let count = episodes.len();
        *self.episodes.write().unwrap_or_else(|p| p.into_inner()) = episodes;
        info!("📚 Library scan found {} episodes in {}", count, self.root.display());
        Ok(count)
    }

    fn episode_from_path(&self, path: &Path) -> Option<Episode> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let stem = path.file_stem()?.to_string_lossy().to_string();
        let mut episode = Episode::new(path_id(path), stem.clone(), path);

        let components: Vec<String> = relative
            .parent()
            .map(|parent| {
                parent
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect()
            })
            .unwrap_or_default();

        // Series is the top-level directory; loose files have no series
        let Some(series_name) = components.first().cloned() else {
            return Some(episode);
        };

        let season_from_dir = components
            .iter()
            .skip(1)
            .find_map(|dir| self.season_pattern.captures(dir.trim()))
            .and_then(|caps| caps.get(1)?.as_str().parse::<u32>().ok());

        let (season, number, title) = match self.episode_pattern.captures(&stem) {
            Some(caps) => {
                let group = |a: usize, b: usize| caps.get(a).or_else(|| caps.get(b));
                let season = group(1, 3).and_then(|m| m.as_str().parse().ok());
                let number = group(2, 4).and_then(|m| m.as_str().parse().ok());
                let end = caps.get(0).map_or(0, |m| m.end());
                let title =
                    stem[end..].trim_matches(|c: char| c.is_whitespace() || "-._".contains(c));
                (season, number, title.to_string())
            }
            None => (None, None, String::new()),
        };

        let season = season.or(season_from_dir);
        if let (Some(season), Some(number)) = (season, number) {
            let series_id = path_id(&self.root.join(&series_name));
            episode = episode.with_series(series_id, series_name, season, number);
            if !title.is_empty() {
                episode.name = title;
            }
        } else {
            debug!("No season/episode numbers in {}", path.display());
            episode.series_id = Some(path_id(&self.root.join(&series_name)));
            episode.series_name = Some(series_name);
        }

        Some(episode)
    }

    fn find(&self, id: &str) -> Option<Episode> {
        self.episodes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    fn chapters_path(&self, id: &str) -> Result<PathBuf> {
        let episode = self.find(id).ok_or_else(|| anyhow!("Unknown episode id: {}", id))?;
        Ok(chapters_path(&episode.path))
    }
}

#[async_trait]
impl ItemStore for FileItemStore {
    async fn list(&self, filter: &ItemFilter) -> Result<Vec<Episode>> {
        Ok(self
            .episodes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Episode>> {
        Ok(self.find(id))
    }

    async fn get_chapters(&self, item_id: &str) -> Result<Vec<Marker>> {
        let path = self.chapters_path(item_id)?;
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let markers = serde_json::from_str(&content)
            .with_context(|| format!("Invalid chapter file {}", path.display()))?;
        Ok(markers)
    }

    async fn save_chapters(&self, item_id: &str, markers: Vec<Marker>) -> Result<()> {
        let path = self.chapters_path(item_id)?;
        let content = serde_json::to_string_pretty(&markers)?;
        fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        debug!("💾 Saved {} chapters to {}", markers.len(), path.display());
        Ok(())
    }

    fn supports_marker_kind(&self) -> bool {
        true
    }
}

/// Stable id derived from the path
pub fn path_id(path: &Path) -> String {
    format!("{:x}", md5::compute(path.to_string_lossy().as_bytes()))
}

pub fn chapters_path(video: &Path) -> PathBuf {
    let mut name = video.as_os_str().to_os_string();
    name.push(CHAPTERS_SUFFIX);
    PathBuf::from(name)
}

fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MarkerKind;
    use tempfile::TempDir;

    fn touch(root: &Path, relative: &str) -> PathBuf {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"video").unwrap();
        path
    }

    #[tokio::test]
    async fn test_scan_parses_series_layout() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "Show/Season 1/Show - S01E01 - Pilot.mkv");
        touch(dir.path(), "Show/Season 1/Show - S01E02 - Second.mkv");
        touch(dir.path(), "Show/Season 2/Show 2x01.mp4");
        touch(dir.path(), "Show/Season 1/notes.txt");
        touch(dir.path(), "Other/Specials/Extra.mkv");

        let store = FileItemStore::open(dir.path()).unwrap();
        let all = store.list(&ItemFilter::all()).await.unwrap();
        assert_eq!(all.len(), 4);

        let pilot = all.iter().find(|e| e.name == "Pilot").unwrap();
        assert_eq!(pilot.series_name.as_deref(), Some("Show"));
        assert_eq!(pilot.season_number, Some(1));
        assert_eq!(pilot.episode_number, Some(1));
        assert_eq!(pilot.label(), "Show S01E01 - Pilot");

        let series_id = pilot.series_id.clone().unwrap();
        let season_one = store.list(&ItemFilter::season(series_id.clone(), 1)).await.unwrap();
        assert_eq!(season_one.len(), 2);
        let season_two = store.list(&ItemFilter::season(series_id, 2)).await.unwrap();
        assert_eq!(season_two[0].episode_number, Some(1));

        let extra = all.iter().find(|e| e.name == "Extra").unwrap();
        assert_eq!(extra.season_number, None);
    }

    #[tokio::test]
    async fn test_ids_are_stable_across_scans() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "Show/Season 1/Show S01E01.mkv");

        let first = FileItemStore::open(dir.path()).unwrap();
        let second = FileItemStore::open(dir.path()).unwrap();
        let a = first.list(&ItemFilter::all()).await.unwrap();
        let b = second.list(&ItemFilter::all()).await.unwrap();
        assert_eq!(a[0].id, b[0].id);
        assert!(second.get_by_id(&a[0].id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_chapters_round_trip_through_sidecar() {
        let dir = TempDir::new().unwrap();
        let video = touch(dir.path(), "Show/Season 1/Show S01E01.mkv");
        let store = FileItemStore::open(dir.path()).unwrap();
        let id = store.list(&ItemFilter::all()).await.unwrap()[0].id.clone();

        assert!(store.get_chapters(&id).await.unwrap().is_empty());

        let markers = vec![Marker {
            name: "Credits".to_string(),
            start_seconds: 1250.0,
            kind: Some(MarkerKind::CreditsStart),
        }];
        store.save_chapters(&id, markers.clone()).await.unwrap();

        assert!(chapters_path(&video).exists());
        assert_eq!(store.get_chapters(&id).await.unwrap(), markers);
        assert!(store.get_chapters("missing").await.is_err());
    }

    #[test]
    fn test_missing_root_is_an_error() {
        assert!(FileItemStore::open("/definitely/not/here").is_err());
    }
}
