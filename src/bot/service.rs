use anyhow::Result;
use dashmap::DashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::audio::player::{PlayOutcome, SessionManager};
use crate::audio::queue::QueueEntry;
use crate::sources::tiers::{MediaFormat, SongKind};
use crate::sources::{MediaResolver, TrackMetadata};

/// Punto de entrada para los pedidos de reproducción de los usuarios.
///
/// El parseo de comandos vive fuera de este crate; aquí sólo se aplican los
/// bloqueos, se resuelve la consulta y se encola.
#[derive(Clone)]
pub struct MusicService {
    resolver: Arc<MediaResolver>,
    manager: Arc<SessionManager>,
    banned: Arc<DashSet<i64>>,
}

impl MusicService {
    pub fn new(resolver: Arc<MediaResolver>, manager: Arc<SessionManager>, banned: Arc<DashSet<i64>>) -> Self {
        Self {
            resolver,
            manager,
            banned,
        }
    }

    #[allow(dead_code)]
    pub async fn request(
        &self,
        chat_id: i64,
        user_id: i64,
        query: &str,
        want_video: bool,
    ) -> Result<(TrackMetadata, PlayOutcome)> {
        self.ensure_allowed(user_id)?;

        let metadata = self.resolver.resolve(query).await.inspect_err(|e| {
            if e.is_not_found() {
                info!("🔍 Sin resultados para '{}'", query);
            }
        })?;
        info!("🔍 '{}' → {} ({})", query, metadata.title, metadata.id);

        let outcome = self
            .manager
            .play(chat_id, QueueEntry::new(metadata.clone(), user_id, want_video))
            .await?;
        Ok((metadata, outcome))
    }

    /// Encola los videos de una playlist. Los que no se pueden resolver se saltan.
    #[allow(dead_code)]
    pub async fn request_playlist(
        &self,
        chat_id: i64,
        user_id: i64,
        link: &str,
        limit: usize,
        want_video: bool,
    ) -> Result<usize> {
        self.ensure_allowed(user_id)?;

        let mut added = 0;
        for id in self.resolver.playlist(link, limit).await? {
            let metadata = match self.resolver.resolve(&format!("v={}", id)).await {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!("⚠️ Saltando {} de la playlist: {}", id, e);
                    continue;
                }
            };

            match self.manager.play(chat_id, QueueEntry::new(metadata, user_id, want_video)).await {
                Ok(_) => added += 1,
                Err(e) => {
                    warn!("⚠️ No se pudo encolar {}: {:#}", id, e);
                    // Cola llena: no tiene sentido seguir
                    if e.downcast_ref::<crate::error::QueueError>().is_some() {
                        break;
                    }
                }
            }
        }

        info!("➕ {} canciones de la playlist agregadas en chat {}", added, chat_id);
        Ok(added)
    }

    /// Formatos disponibles para descargar la canción pedida.
    #[allow(dead_code)]
    pub async fn formats(&self, user_id: i64, query: &str) -> Result<(TrackMetadata, Vec<MediaFormat>)> {
        self.ensure_allowed(user_id)?;

        let metadata = self.resolver.resolve(query).await?;
        let formats = self.manager.fetcher().formats(&metadata.id).await?;
        Ok((metadata, formats))
    }

    /// Descarga la canción en el formato elegido y devuelve el archivo para enviarlo.
    #[allow(dead_code)]
    pub async fn download_song(&self, user_id: i64, id: &str, format_id: &str, kind: SongKind) -> Result<PathBuf> {
        self.ensure_allowed(user_id)?;

        let path = self.manager.fetcher().download_song(id, format_id, kind).await?;
        info!("📥 Canción {} lista para el usuario {}: {}", id, user_id, path.display());
        Ok(path)
    }

    fn ensure_allowed(&self, user_id: i64) -> Result<()> {
        if self.banned.contains(&user_id) {
            anyhow::bail!("el usuario {} está bloqueado", user_id);
        }
        Ok(())
    }
}
