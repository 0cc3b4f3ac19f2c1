//! Media catalog contracts: episode references, chapter markers and the store
//! that owns them.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Reference to one episode owned by the catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Episode {
    /// Catalog id
    pub id: String,
    /// Episode title
    pub name: String,
    /// Media file path as the catalog sees it
    pub path: PathBuf,
    /// Runtime in seconds, when already known
    pub duration_seconds: Option<f64>,
    pub series_id: Option<String>,
    pub series_name: Option<String>,
    pub season_number: Option<u32>,
    pub episode_number: Option<u32>,
    /// External provider ids (tvdb, tmdb, imdb ...)
    #[serde(default)]
    pub provider_ids: BTreeMap<String, String>,
}

impl Episode {
    pub fn new(id: impl Into<String>, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            path: path.into(),
            duration_seconds: None,
            series_id: None,
            series_name: None,
            season_number: None,
            episode_number: None,
            provider_ids: BTreeMap::new(),
        }
    }

    pub fn with_series(
        mut self,
        series_id: impl Into<String>,
        series_name: impl Into<String>,
        season: u32,
        episode: u32,
    ) -> Self {
        self.series_id = Some(series_id.into());
        self.series_name = Some(series_name.into());
        self.season_number = Some(season);
        self.episode_number = Some(episode);
        self
    }

    /// Human label used as key in progress reports, e.g. `Show S01E02 - Pilot`
    pub fn label(&self) -> String {
        match (&self.series_name, self.season_number, self.episode_number) {
            (Some(series), Some(season), Some(episode)) => {
                format!("{} S{:02}E{:02} - {}", series, season, episode, self.name)
            }
            _ => self.name.clone(),
        }
    }

    /// True when both episodes belong to the same season of the same series
    pub fn is_same_season(&self, other: &Episode) -> bool {
        self.series_id.is_some()
            && self.series_id == other.series_id
            && self.season_number == other.season_number
    }
}

/// Marker kinds a store may know about
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MarkerKind {
    Chapter,
    IntroStart,
    IntroEnd,
    CreditsStart,
}

/// A chapter marker on an episode
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Marker {
    pub name: String,
    pub start_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MarkerKind>,
}

/// Selection passed to [`ItemStore::list`]
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub series_id: Option<String>,
    pub season_number: Option<u32>,
}

impl ItemFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn series(series_id: impl Into<String>) -> Self {
        Self {
            series_id: Some(series_id.into()),
            season_number: None,
        }
    }

    pub fn season(series_id: impl Into<String>, season: u32) -> Self {
        Self {
            series_id: Some(series_id.into()),
            season_number: Some(season),
        }
    }

    pub fn matches(&self, episode: &Episode) -> bool {
        if let Some(series_id) = &self.series_id {
            if episode.series_id.as_ref() != Some(series_id) {
                return false;
            }
        }
        if let Some(season) = self.season_number {
            if episode.season_number != Some(season) {
                return false;
            }
        }
        true
    }
}

/// Catalog and chapter persistence owned by the host
#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn list(&self, filter: &ItemFilter) -> Result<Vec<Episode>>;
    async fn get_by_id(&self, id: &str) -> Result<Option<Episode>>;
    async fn get_chapters(&self, item_id: &str) -> Result<Vec<Marker>>;
    async fn save_chapters(&self, item_id: &str, markers: Vec<Marker>) -> Result<()>;

    /// Whether markers round-trip their [`MarkerKind`]
    fn supports_marker_kind(&self) -> bool {
        false
    }
}

/// Returned when the store cannot carry a marker kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unsupported;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKindCapability {
    Supported,
    Unsupported,
}

/// Name written on credits markers and used to recognise them on stores
/// without kind support
pub const CREDITS_MARKER_NAME: &str = "Credits";

/// Marker-kind access negotiated once against a store
#[derive(Debug, Clone, Copy)]
pub struct MarkerAdapter {
    capability: MarkerKindCapability,
}

impl MarkerAdapter {
    pub fn negotiate(store: &dyn ItemStore) -> Self {
        let capability = if store.supports_marker_kind() {
            MarkerKindCapability::Supported
        } else {
            MarkerKindCapability::Unsupported
        };
        tracing::debug!("Marker kind capability: {:?}", capability);
        Self { capability }
    }

    pub fn try_get_marker_kind(&self, marker: &Marker) -> Result<Option<MarkerKind>, Unsupported> {
        match self.capability {
            MarkerKindCapability::Supported => Ok(marker.kind),
            MarkerKindCapability::Unsupported => Err(Unsupported),
        }
    }

    pub fn try_set_marker_kind(
        &self,
        marker: &mut Marker,
        kind: MarkerKind,
    ) -> Result<(), Unsupported> {
        match self.capability {
            MarkerKindCapability::Supported => {
                marker.kind = Some(kind);
                Ok(())
            }
            MarkerKindCapability::Unsupported => Err(Unsupported),
        }
    }

    pub fn is_credits_marker(&self, marker: &Marker) -> bool {
        match self.try_get_marker_kind(marker) {
            Ok(Some(kind)) => kind == MarkerKind::CreditsStart,
            Ok(None) | Err(Unsupported) => marker.name.eq_ignore_ascii_case(CREDITS_MARKER_NAME),
        }
    }

    pub fn credits_marker(&self, start_seconds: f64) -> Marker {
        let mut marker = Marker {
            name: CREDITS_MARKER_NAME.to_string(),
            start_seconds,
            kind: None,
        };
        // Stores without kind support identify the marker by name alone
        let _ = self.try_set_marker_kind(&mut marker, MarkerKind::CreditsStart);
        marker
    }

    pub fn find_credits<'a>(&self, markers: &'a [Marker]) -> Option<&'a Marker> {
        markers.iter().find(|m| self.is_credits_marker(m))
    }
}
