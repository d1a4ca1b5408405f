use anyhow::{Context, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::cookies::CredentialPool;
use super::store::LocalStore;
use super::tiers::{
    CacheTier, Extractor, ExtractorTier, FetchRequest, FetchTier, LegacyApiTier, MediaFormat, RemoteApiTier,
    SizeGuardTier, SongKind, StreamUrlTier, TierError,
};
use super::youtube::watch_url;
use super::ResolvedSource;
use crate::config::Config;
use crate::error::SourceError;

type FetchResult = std::result::Result<ResolvedSource, SourceError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;
type WeakFetch = WeakShared<BoxFuture<'static, FetchResult>>;

/// Configuración inyectada al fetcher (nada se lee de variables globales).
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub download_dir: PathBuf,
    pub cookies_dir: PathBuf,
    pub ytdlp_bin: String,
    pub extraction_timeout: Duration,
    pub max_concurrent_extractions: usize,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub api_retries: u32,
    pub api_retry_delay: Duration,
    pub legacy_poll_delay: Duration,
    pub legacy_max_polls: u32,
    pub video_download: bool,
    pub max_video_size_mb: u64,
}

impl From<&Config> for FetcherConfig {
    fn from(config: &Config) -> Self {
        Self {
            download_dir: config.download_dir.clone(),
            cookies_dir: config.cookies_dir.clone(),
            ytdlp_bin: config.ytdlp_bin.clone(),
            extraction_timeout: config.extraction_timeout(),
            max_concurrent_extractions: config.max_concurrent_extractions,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            api_retries: config.api_retries,
            api_retry_delay: Duration::from_millis(config.api_retry_delay_ms),
            legacy_poll_delay: Duration::from_millis(config.legacy_poll_delay_ms),
            legacy_max_polls: config.legacy_max_polls,
            video_download: config.video_download,
            max_video_size_mb: config.max_video_size_mb,
        }
    }
}

/// Obtiene fuentes reproducibles probando tiers en orden.
///
/// Pedidos concurrentes para el mismo `(id, video)` comparten una única
/// operación en vuelo. El mapa sólo guarda referencias débiles: cuando todos
/// los que esperan se cancelan, la operación (y su subproceso) se descarta.
pub struct SourceFetcher {
    tiers: Arc<Vec<Arc<dyn FetchTier>>>,
    in_flight: Arc<DashMap<FetchRequest, WeakFetch>>,
    // Para listar formatos y descargar canciones fuera de la cadena de tiers
    extraction: Option<(Arc<Extractor>, LocalStore)>,
}

impl SourceFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()?;

        let store = LocalStore::new(&config.download_dir);
        let extractor = Arc::new(Extractor::new(
            config.ytdlp_bin.clone(),
            CredentialPool::new(&config.cookies_dir),
            config.extraction_timeout,
            config.max_concurrent_extractions,
        ));

        let mut tiers: Vec<Arc<dyn FetchTier>> = vec![Arc::new(CacheTier::new(store.clone()))];

        // Video sin descarga: URL directa primero, y control de tamaño antes de descargar
        if !config.video_download {
            tiers.push(Arc::new(StreamUrlTier::new(extractor.clone())));
            tiers.push(Arc::new(SizeGuardTier::new(extractor.clone(), config.max_video_size_mb)));
        }

        if let (Some(base), Some(key)) = (&config.api_url, &config.api_key) {
            tiers.push(Arc::new(RemoteApiTier::new(
                client.clone(),
                base.clone(),
                config.api_retries,
                config.api_retry_delay,
                store.clone(),
            )));
            tiers.push(Arc::new(LegacyApiTier::new(
                client,
                base.clone(),
                key.clone(),
                config.legacy_poll_delay,
                config.legacy_max_polls,
                store.clone(),
            )));
        }

        tiers.push(Arc::new(ExtractorTier::new(extractor.clone(), store.clone())));

        info!(
            "🧩 Fetcher listo con tiers: {}",
            tiers.iter().map(|t| t.name()).collect::<Vec<_>>().join(" → ")
        );
        Ok(Self {
            extraction: Some((extractor, store)),
            ..Self::with_tiers(tiers)
        })
    }

    pub fn with_tiers(tiers: Vec<Arc<dyn FetchTier>>) -> Self {
        Self {
            tiers: Arc::new(tiers),
            in_flight: Arc::new(DashMap::new()),
            extraction: None,
        }
    }

    /// Formatos descargables del video `id` (sin DASH).
    pub async fn formats(&self, id: &str) -> Result<Vec<MediaFormat>> {
        let (extractor, _) = self.extraction()?;
        extractor.formats(&watch_url(id)).await
    }

    /// Descarga `id` en el formato elegido como archivo de canción.
    pub async fn download_song(&self, id: &str, format_id: &str, kind: SongKind) -> Result<PathBuf> {
        let (extractor, store) = self.extraction()?;
        extractor.download_song(store, id, format_id, kind).await
    }

    fn extraction(&self) -> Result<(&Extractor, &LocalStore)> {
        self.extraction
            .as_ref()
            .map(|(extractor, store)| (extractor.as_ref(), store))
            .context("el fetcher no tiene yt-dlp configurado")
    }

    pub async fn fetch(&self, id: &str, want_video: bool) -> FetchResult {
        let request = FetchRequest::new(id, want_video);
        let shared = self.join_or_start(&request);

        let result = shared.clone().await;

        self.in_flight.remove_if(&request, |_, weak| {
            weak.upgrade().map_or(true, |current| current.ptr_eq(&shared))
        });
        result
    }

    /// Número de obtenciones en curso (incluye entradas ya canceladas sin limpiar).
    #[allow(dead_code)]
    pub fn in_flight(&self) -> usize {
        self.in_flight.iter().filter(|e| e.value().upgrade().is_some()).count()
    }

    fn join_or_start(&self, request: &FetchRequest) -> SharedFetch {
        match self.in_flight.entry(request.clone()) {
            Entry::Occupied(mut entry) => {
                if let Some(existing) = entry.get().upgrade() {
                    debug!("🔗 Reutilizando obtención en curso para {}", request.id);
                    return existing;
                }
                let shared = self.start(request.clone());
                if let Some(weak) = shared.downgrade() {
                    entry.insert(weak);
                }
                shared
            }
            Entry::Vacant(entry) => {
                let shared = self.start(request.clone());
                if let Some(weak) = shared.downgrade() {
                    entry.insert(weak);
                }
                shared
            }
        }
    }

    fn start(&self, request: FetchRequest) -> SharedFetch {
        let tiers = self.tiers.clone();
        async move { run_tiers(&tiers, &request).await }.boxed().shared()
    }
}

/// Prueba cada tier aplicable en orden; el primer éxito gana.
async fn run_tiers(tiers: &[Arc<dyn FetchTier>], request: &FetchRequest) -> FetchResult {
    let mut attempts = Vec::new();

    for tier in tiers.iter().filter(|t| t.applies(request)) {
        match tier.fetch(request).await {
            Ok(source) => {
                info!("✅ {} obtenido vía {}: {}", request.id, tier.name(), source.location);
                return Ok(source);
            }
            Err(TierError::Skip(reason)) => {
                warn!("↪️ {} falló para {}: {}", tier.name(), request.id, reason);
                attempts.push(format!("{}: {}", tier.name(), reason));
            }
            Err(TierError::Abort(err)) => {
                warn!("⛔ {} abortó la obtención de {}: {}", tier.name(), request.id, err);
                return Err(err);
            }
        }
    }

    Err(SourceError::Fetch {
        id: request.id.clone(),
        attempts,
    })
}
