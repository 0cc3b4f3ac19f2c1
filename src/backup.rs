//! Credits marker export and import.
//!
//! Backups are versioned JSON with PascalCase keys. Timestamps are stored as
//! ticks, 10,000,000 per second.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::catalog::{Episode, ItemFilter, ItemStore, MarkerAdapter};

pub const BACKUP_VERSION: u32 = 1;
pub const TICKS_PER_SECOND: f64 = 10_000_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreditsBackup {
    pub version: u32,
    pub backup_date: DateTime<Utc>,
    pub total_episodes: usize,
    pub episodes_with_credits: usize,
    pub entries: Vec<BackupEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BackupEntry {
    pub series_name: Option<String>,
    pub series_id: Option<String>,
    #[serde(default)]
    pub provider_ids: BTreeMap<String, String>,
    pub season_number: Option<u32>,
    pub episode_number: Option<u32>,
    pub episode_name: String,
    pub episode_id: String,
    pub file_path: String,
    pub credits_start_ticks: i64,
}

impl BackupEntry {
    pub fn credits_start_seconds(&self) -> f64 {
        self.credits_start_ticks as f64 / TICKS_PER_SECOND
    }
}

/// Outcome of a restore
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    pub restored: usize,
    pub skipped_existing: usize,
    pub not_found: usize,
}

pub fn seconds_to_ticks(seconds: f64) -> i64 {
    (seconds * TICKS_PER_SECOND).round() as i64
}

/// Collect every credits marker in the store
pub async fn create_backup(store: &dyn ItemStore) -> Result<CreditsBackup> {
    let markers = MarkerAdapter::negotiate(store);
    let episodes = store.list(&ItemFilter::all()).await?;
    let mut entries = Vec::new();

    for episode in &episodes {
        let chapters = match store.get_chapters(&episode.id).await {
            Ok(chapters) => chapters,
            Err(e) => {
                warn!("Skipping {} in backup: {}", episode.label(), e);
                continue;
            }
        };
        if let Some(credits) = markers.find_credits(&chapters) {
            entries.push(entry_for(episode, credits.start_seconds));
        }
    }

    info!("💾 Backup covers {} of {} episodes", entries.len(), episodes.len());
    Ok(CreditsBackup {
        version: BACKUP_VERSION,
        backup_date: Utc::now(),
        total_episodes: episodes.len(),
        episodes_with_credits: entries.len(),
        entries,
    })
}

fn entry_for(episode: &Episode, start_seconds: f64) -> BackupEntry {
    BackupEntry {
        series_name: episode.series_name.clone(),
        series_id: episode.series_id.clone(),
        provider_ids: episode.provider_ids.clone(),
        season_number: episode.season_number,
        episode_number: episode.episode_number,
        episode_name: episode.name.clone(),
        episode_id: episode.id.clone(),
        file_path: episode.path.to_string_lossy().to_string(),
        credits_start_ticks: seconds_to_ticks(start_seconds),
    }
}

/// Write backup entries back as credits markers. Entries are matched by
/// episode id first and by file path second.
pub async fn restore_backup(
    store: &dyn ItemStore,
    backup: &CreditsBackup,
    overwrite: bool,
) -> Result<RestoreSummary> {
    if backup.version > BACKUP_VERSION {
        return Err(anyhow!(
            "Backup version {} is newer than supported version {}",
            backup.version,
            BACKUP_VERSION
        ));
    }

    let markers = MarkerAdapter::negotiate(store);
    let episodes = store.list(&ItemFilter::all()).await?;
    let by_path: HashMap<String, &Episode> = episodes
        .iter()
        .map(|e| (e.path.to_string_lossy().to_string(), e))
        .collect();

    let mut summary = RestoreSummary::default();
    for entry in &backup.entries {
        let episode = match store.get_by_id(&entry.episode_id).await? {
            Some(episode) => episode,
            None => match by_path.get(&entry.file_path) {
                Some(episode) => (*episode).clone(),
                None => {
                    debug!("No episode for backup entry {}", entry.file_path);
                    summary.not_found += 1;
                    continue;
                }
            },
        };

        let mut chapters = store.get_chapters(&episode.id).await?;
        if markers.find_credits(&chapters).is_some() && !overwrite {
            summary.skipped_existing += 1;
            continue;
        }

        chapters.retain(|m| !markers.is_credits_marker(m));
        chapters.push(markers.credits_marker(entry.credits_start_seconds()));
        chapters.sort_by(|a, b| a.start_seconds.total_cmp(&b.start_seconds));
        store.save_chapters(&episode.id, chapters).await?;
        summary.restored += 1;
    }

    info!(
        "♻️ Restore finished: {} restored, {} kept, {} unmatched",
        summary.restored, summary.skipped_existing, summary.not_found
    );
    Ok(summary)
}

pub async fn write_backup(backup: &CreditsBackup, path: &Path) -> Result<()> {
    let content = serde_json::to_string_pretty(backup)?;
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write backup {}", path.display()))
}

pub async fn read_backup(path: &Path) -> Result<CreditsBackup> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read backup {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid backup file {}", path.display()))
}
