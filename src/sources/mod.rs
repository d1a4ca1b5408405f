//! # Sources Module
//!
//! Turning user queries into playable media.
//!
//! - [`resolver`]: query or link → [`TrackMetadata`] (no downloads)
//! - [`fetcher`]: media id → [`ResolvedSource`] through ordered fallback tiers
//! - [`tiers`]: the individual strategies (cache, remote APIs, yt-dlp)
//! - [`store`]: the shared downloads directory keyed by media id
//! - [`youtube`]: link parsing and the yt-dlp search backend

pub mod cookies;
pub mod fetcher;
pub mod resolver;
pub mod store;
pub mod tiers;
pub mod youtube;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use fetcher::{FetcherConfig, SourceFetcher};
pub use resolver::MediaResolver;
pub use youtube::YtDlpSearch;

/// Metadata canónica de un track ya resuelto.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub id: String,
    pub title: String,
    pub duration_secs: u64,
    pub thumbnail_url: String,
    pub source_link: String,
}

impl TrackMetadata {
    /// Duración en formato `m:ss` o `h:mm:ss`.
    pub fn duration_label(&self) -> String {
        let total = self.duration_secs;
        let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
        if h > 0 {
            format!("{}:{:02}:{:02}", h, m, s)
        } else {
            format!("{}:{:02}", m, s)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    LocalFile,
    DirectUrl,
}

/// Lo que la llamada de voz puede reproducir: un archivo local o una URL directa.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSource {
    pub kind: SourceKind,
    pub location: String,
    pub is_video: bool,
}

impl ResolvedSource {
    pub fn local_file(path: impl Into<String>, is_video: bool) -> Self {
        Self {
            kind: SourceKind::LocalFile,
            location: path.into(),
            is_video,
        }
    }

    pub fn direct_url(url: impl Into<String>, is_video: bool) -> Self {
        Self {
            kind: SourceKind::DirectUrl,
            location: url.into(),
            is_video,
        }
    }
}

/// Resultado crudo del backend de búsqueda.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    pub duration_secs: Option<u64>,
    pub thumbnail: Option<String>,
    pub link: String,
}

/// Backend de búsqueda (externo). Devuelve hits ordenados por relevancia.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>>;

    /// Ids de los videos de una playlist, en orden.
    async fn playlist_ids(&self, link: &str, limit: usize) -> Result<Vec<String>>;

    #[allow(dead_code)]
    fn source_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_label_formats_hours_and_minutes() {
        let mut meta = TrackMetadata {
            id: "abc".into(),
            title: "t".into(),
            duration_secs: 225,
            thumbnail_url: String::new(),
            source_link: String::new(),
        };
        assert_eq!(meta.duration_label(), "3:45");
        meta.duration_secs = 3725;
        assert_eq!(meta.duration_label(), "1:02:05");
        meta.duration_secs = 0;
        assert_eq!(meta.duration_label(), "0:00");
    }
}
