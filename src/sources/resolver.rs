use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::youtube::{extract_video_id, is_youtube_link, playlist_url, strip_query, trim_link, watch_url};
use super::{SearchHit, SearchProvider, TrackMetadata};
use crate::cache::MusicCache;
use crate::config::Config;
use crate::error::SourceError;

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub cache_size: usize,
    pub cache_ttl: Duration,
}

impl From<&Config> for ResolverConfig {
    fn from(config: &Config) -> Self {
        Self {
            cache_size: config.cache_size,
            cache_ttl: Duration::from_secs(config.cache_ttl),
        }
    }
}

/// Convierte consultas o enlaces en [`TrackMetadata`] canónica.
///
/// No descarga nada: el único efecto es la búsqueda saliente.
pub struct MediaResolver {
    provider: Arc<dyn SearchProvider>,
    cache: MusicCache,
}

impl MediaResolver {
    pub fn new(provider: Arc<dyn SearchProvider>, config: ResolverConfig) -> Self {
        Self {
            provider,
            cache: MusicCache::with_ttl(config.cache_size, config.cache_ttl),
        }
    }

    pub fn cache(&self) -> &MusicCache {
        &self.cache
    }

    pub async fn resolve(&self, query: &str) -> Result<TrackMetadata, SourceError> {
        let query = query.trim();

        if is_youtube_link(query) {
            if let Some(id) = extract_video_id(query) {
                return self.resolve_id(&id).await;
            }
            // Enlace sin id reconocible: se busca tal cual, sin el ruido tras '&'
            return self.top_hit(trim_link(query)).await;
        }

        self.top_hit(query).await
    }

    /// Hasta `limit` candidatos para que el usuario elija.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<TrackMetadata>, SourceError> {
        let hits = self.lookup(query.trim(), limit).await?;
        Ok(hits.into_iter().map(into_metadata).collect())
    }

    /// Ids de una playlist en orden. Acepta un enlace o el id de la lista.
    pub async fn playlist(&self, link: &str, limit: usize) -> anyhow::Result<Vec<String>> {
        let link = link.trim();
        let target = if is_youtube_link(link) || link.starts_with("http") {
            trim_link(link).to_string()
        } else {
            playlist_url(link)
        };

        let ids = self.provider.playlist_ids(&target, limit).await?;
        info!("📋 Playlist con {} videos: {}", ids.len(), target);
        Ok(ids)
    }

    async fn resolve_id(&self, id: &str) -> Result<TrackMetadata, SourceError> {
        if let Some(cached) = self.cache.get(&id.to_string()) {
            debug!("📦 Metadata en caché: {}", id);
            return Ok(cached);
        }

        let hit = self
            .lookup(&watch_url(id), 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SourceError::NotFound(id.to_string()))?;

        // El id del enlace manda sobre el del resultado
        let metadata = TrackMetadata {
            id: id.to_string(),
            source_link: watch_url(id),
            ..into_metadata(hit)
        };
        self.cache.insert(metadata.id.clone(), metadata.clone());
        Ok(metadata)
    }

    async fn top_hit(&self, query: &str) -> Result<TrackMetadata, SourceError> {
        let hit = self
            .lookup(query, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SourceError::NotFound(query.to_string()))?;

        let metadata = into_metadata(hit);
        self.cache.insert(metadata.id.clone(), metadata.clone());
        Ok(metadata)
    }

    async fn lookup(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, SourceError> {
        match self.provider.search(query, limit).await {
            Ok(hits) if hits.is_empty() => Err(SourceError::NotFound(query.to_string())),
            Ok(hits) => Ok(hits),
            Err(e) => {
                warn!("❌ Búsqueda fallida para '{}': {:#}", query, e);
                Err(SourceError::NotFound(query.to_string()))
            }
        }
    }
}

fn into_metadata(hit: SearchHit) -> TrackMetadata {
    TrackMetadata {
        duration_secs: hit.duration_secs.unwrap_or(0),
        thumbnail_url: hit.thumbnail.as_deref().map(strip_query).unwrap_or_default().to_string(),
        source_link: hit.link,
        title: hit.title,
        id: hit.id,
    }
}
