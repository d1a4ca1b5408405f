//! Estrategias de obtención que [`SourceFetcher`](super::SourceFetcher) prueba en orden.
//!
//! Cada tier devuelve un resultado tipado: `Ok` corta la cadena, `Skip` pasa
//! al siguiente tier y `Abort` termina la obtención con ese error.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Output;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::cookies::CredentialPool;
use super::store::{extension_from_url, LocalStore};
use super::youtube::{run_ytdlp, watch_url};
use super::ResolvedSource;
use crate::error::SourceError;

const AUDIO_FORMAT: &str = "bestaudio[ext=m4a]/bestaudio[ext=mp4]/bestaudio[ext=webm]/bestaudio/best";
const VIDEO_FORMAT: &str = "bestvideo[ext=mp4][height<=1080]+bestaudio[ext=m4a]/best[ext=mp4][height<=1080]";
const STREAM_FORMAT: &str = "best[height<=?720][width<=?1280]";

static TELEGRAM_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://t\.me/([a-zA-Z0-9_]{5,})/(\d+)$").expect("regex de t.me válido")
});

/// Pedido de obtención para un id ya resuelto.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchRequest {
    pub id: String,
    pub want_video: bool,
}

impl FetchRequest {
    pub fn new(id: impl Into<String>, want_video: bool) -> Self {
        Self {
            id: id.into(),
            want_video,
        }
    }

    pub fn link(&self) -> String {
        watch_url(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TierError {
    /// El tier no pudo producir la fuente; se prueba el siguiente.
    Skip(String),
    /// La obtención no debe continuar.
    Abort(SourceError),
}

impl TierError {
    fn skip(err: impl std::fmt::Display) -> Self {
        TierError::Skip(err.to_string())
    }
}

pub type TierResult = std::result::Result<ResolvedSource, TierError>;

#[async_trait]
pub trait FetchTier: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies(&self, _request: &FetchRequest) -> bool {
        true
    }

    async fn fetch(&self, request: &FetchRequest) -> TierResult;
}

/// Es un deep link a un mensaje de Telegram (no es un archivo de medios).
pub fn is_telegram_link(url: &str) -> bool {
    TELEGRAM_LINK_RE.is_match(url)
}

// ---------------------------------------------------------------------------
// Caché local
// ---------------------------------------------------------------------------

pub struct CacheTier {
    store: LocalStore,
}

impl CacheTier {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl FetchTier for CacheTier {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn fetch(&self, request: &FetchRequest) -> TierResult {
        match self.store.find_cached(&request.id, request.want_video).await {
            Some(path) => {
                debug!("📦 Acierto de caché: {}", path.display());
                Ok(ResolvedSource::local_file(path.to_string_lossy(), request.want_video))
            }
            None => Err(TierError::Skip("sin archivo local".into())),
        }
    }
}

// ---------------------------------------------------------------------------
// yt-dlp
// ---------------------------------------------------------------------------

/// Invocaciones de yt-dlp compartidas por los tiers de extracción.
///
/// Las extracciones corren fuera del scheduler (subprocesos) y se limitan con
/// un semáforo para no acaparar la máquina. Todo lo que yt-dlp escribe va a
/// una carpeta temporal del store y sólo un archivo terminado se mueve a su
/// nombre final.
pub struct Extractor {
    bin: String,
    credentials: CredentialPool,
    timeout: Duration,
    workers: Semaphore,
}

#[derive(Debug, Deserialize)]
struct FormatsProbe {
    #[serde(default)]
    formats: Vec<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    format: Option<String>,
    filesize: Option<u64>,
    format_id: Option<String>,
    ext: Option<String>,
    format_note: Option<String>,
}

/// Formato descargable de un video, tal como lo lista `yt-dlp -J`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaFormat {
    pub format: String,
    pub filesize: u64,
    pub format_id: String,
    pub ext: String,
    pub format_note: String,
}

impl ProbeFormat {
    /// Descarta los formatos DASH y los que no traen todos los campos.
    fn into_media_format(self) -> Option<MediaFormat> {
        let format = self.format?;
        if format.to_lowercase().contains("dash") {
            return None;
        }
        Some(MediaFormat {
            format,
            filesize: self.filesize?,
            format_id: self.format_id?,
            ext: self.ext?,
            format_note: self.format_note?,
        })
    }
}

/// Tipo de descarga de canción con un formato elegido por el usuario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SongKind {
    /// Audio convertido a mp3
    Audio,
    /// El formato elegido mezclado con el audio m4a (itag 140) en mp4
    Video,
}

impl SongKind {
    fn extension(self) -> &'static str {
        match self {
            SongKind::Audio => "mp3",
            SongKind::Video => "mp4",
        }
    }
}

fn valid_format_id(format_id: &str) -> bool {
    !format_id.is_empty() && format_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl Extractor {
    pub fn new(bin: impl Into<String>, credentials: CredentialPool, timeout: Duration, workers: usize) -> Self {
        Self {
            bin: bin.into(),
            credentials,
            timeout,
            workers: Semaphore::new(workers.max(1)),
        }
    }

    /// Corre yt-dlp y falla si el proceso no termina bien.
    async fn run_checked(&self, args: &[String]) -> Result<Output> {
        let output = run_ytdlp(&self.bin, args, self.timeout).await?;
        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("yt-dlp falló: {}", error.trim());
        }
        Ok(output)
    }

    /// Descarga con yt-dlp y deja el resultado en `<store>/<id>.<ext>`.
    pub async fn download(&self, store: &LocalStore, request: &FetchRequest) -> Result<PathBuf> {
        let _permit = self.workers.acquire().await?;
        let staging = store.staging().await?;
        let staged = LocalStore::new(staging.path());

        let format = if request.want_video { VIDEO_FORMAT } else { AUDIO_FORMAT };
        let mut args: Vec<String> = [
            "--no-warnings",
            "--quiet",
            "--geo-bypass",
            "--retries",
            "2",
            "--continue",
            "--no-part",
            "-o",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(staged.output_template(&request.id));
        args.push("-f".into());
        args.push(format.into());
        args.extend(self.credentials.args().await);
        if request.want_video {
            args.push("--merge-output-format".into());
            args.push("mp4".into());
        }
        args.push(request.link());

        info!("⬇️ Extrayendo {} con yt-dlp (video={})", request.id, request.want_video);
        self.run_checked(&args).await?;

        let produced = staged
            .find_cached(&request.id, request.want_video)
            .await
            .with_context(|| format!("yt-dlp terminó pero no hay archivo para {}", request.id))?;
        let name = produced
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("ruta inválida: {}", produced.display()))?;
        store.adopt(&produced, &name).await
    }

    /// Descarga una canción en el formato elegido a `<store>/<id>.<format_id>.<ext>`.
    ///
    /// No pisa el archivo de reproducción `<id>.<ext>`; si la canción ya fue
    /// descargada en ese formato se reutiliza.
    pub async fn download_song(&self, store: &LocalStore, id: &str, format_id: &str, kind: SongKind) -> Result<PathBuf> {
        if !valid_format_id(format_id) {
            anyhow::bail!("format_id inválido: {:?}", format_id);
        }

        let name = format!("{}.{}.{}", id, format_id, kind.extension());
        let target = store.dir().join(&name);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            debug!("📦 Canción ya descargada: {}", target.display());
            return Ok(target);
        }

        let _permit = self.workers.acquire().await?;
        let staging = store.staging().await?;
        let staged = LocalStore::new(staging.path());

        let mut args: Vec<String> = ["--no-warnings", "--quiet", "--geo-bypass", "--no-part", "-o"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push(staged.output_template(id));
        match kind {
            SongKind::Audio => args.extend([
                "-f".to_string(),
                format_id.to_string(),
                "-x".to_string(),
                "--audio-format".to_string(),
                "mp3".to_string(),
            ]),
            SongKind::Video => args.extend([
                "-f".to_string(),
                format!("{}+140", format_id),
                "--merge-output-format".to_string(),
                "mp4".to_string(),
            ]),
        }
        args.extend(self.credentials.args().await);
        args.push(watch_url(id));

        info!("🎧 Descargando {} en formato {} ({:?})", id, format_id, kind);
        self.run_checked(&args).await?;

        let produced = staged.path_for(id, kind.extension());
        if !tokio::fs::try_exists(&produced).await.unwrap_or(false) {
            anyhow::bail!("yt-dlp terminó pero no produjo {}.{}", id, kind.extension());
        }
        store.adopt(&produced, &name).await
    }

    /// URL directa de stream (`yt-dlp -g`), primera línea de la salida.
    pub async fn stream_url(&self, link: &str) -> Result<String> {
        let mut args = self.credentials.args().await;
        args.extend(["-g".to_string(), "-f".to_string(), STREAM_FORMAT.to_string(), link.to_string()]);

        let output = run_ytdlp(&self.bin, &args, self.timeout).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        match stdout.lines().map(str::trim).find(|line| !line.is_empty()) {
            Some(url) if output.status.success() => Ok(url.to_string()),
            _ => anyhow::bail!(
                "yt-dlp no devolvió URL de stream: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
    }

    async fn probe(&self, link: &str) -> Result<Vec<ProbeFormat>> {
        let mut args = self.credentials.args().await;
        args.extend(["-J".to_string(), link.to_string()]);

        let output = self.run_checked(&args).await?;
        let probe: FormatsProbe = serde_json::from_slice(&output.stdout).context("JSON de formatos inválido")?;
        Ok(probe.formats)
    }

    /// Tamaño estimado en bytes: suma de `filesize` de todos los formatos (`yt-dlp -J`).
    pub async fn probe_size(&self, link: &str) -> Result<Option<u64>> {
        let formats = self.probe(link).await?;
        if formats.is_empty() {
            return Ok(None);
        }
        Ok(Some(formats.iter().filter_map(|f| f.filesize).sum()))
    }

    /// Formatos descargables de un video, sin DASH.
    pub async fn formats(&self, link: &str) -> Result<Vec<MediaFormat>> {
        let formats: Vec<MediaFormat> = self
            .probe(link)
            .await?
            .into_iter()
            .filter_map(ProbeFormat::into_media_format)
            .collect();
        debug!("🎚️ {} formatos disponibles para {}", formats.len(), link);
        Ok(formats)
    }
}

/// Último recurso: descarga local con yt-dlp.
pub struct ExtractorTier {
    extractor: Arc<Extractor>,
    store: LocalStore,
}

impl ExtractorTier {
    pub fn new(extractor: Arc<Extractor>, store: LocalStore) -> Self {
        Self { extractor, store }
    }
}

#[async_trait]
impl FetchTier for ExtractorTier {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn fetch(&self, request: &FetchRequest) -> TierResult {
        let path = self.extractor.download(&self.store, request).await.map_err(TierError::skip)?;
        Ok(ResolvedSource::local_file(path.to_string_lossy(), request.want_video))
    }
}

/// Video sin descarga: se reproduce directamente la URL de stream.
pub struct StreamUrlTier {
    extractor: Arc<Extractor>,
}

impl StreamUrlTier {
    pub fn new(extractor: Arc<Extractor>) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl FetchTier for StreamUrlTier {
    fn name(&self) -> &'static str {
        "stream-url"
    }

    fn applies(&self, request: &FetchRequest) -> bool {
        request.want_video
    }

    async fn fetch(&self, request: &FetchRequest) -> TierResult {
        let url = self.extractor.stream_url(&request.link()).await.map_err(TierError::skip)?;
        Ok(ResolvedSource::direct_url(url, true))
    }
}

/// Antes de caer a una descarga de video, rechaza archivos demasiado grandes.
pub struct SizeGuardTier {
    extractor: Arc<Extractor>,
    limit_mb: u64,
}

impl SizeGuardTier {
    pub fn new(extractor: Arc<Extractor>, limit_mb: u64) -> Self {
        Self { extractor, limit_mb }
    }
}

#[async_trait]
impl FetchTier for SizeGuardTier {
    fn name(&self) -> &'static str {
        "size-guard"
    }

    fn applies(&self, request: &FetchRequest) -> bool {
        request.want_video
    }

    async fn fetch(&self, request: &FetchRequest) -> TierResult {
        let size = match self.extractor.probe_size(&request.link()).await {
            Ok(Some(size)) => size,
            Ok(None) => return Err(TierError::Skip("sin estimación de tamaño".into())),
            Err(e) => return Err(TierError::skip(e)),
        };

        let size_mb = size as f64 / (1024.0 * 1024.0);
        if size_mb > self.limit_mb as f64 {
            warn!("📏 {} pesa {:.2} MB, supera el límite de {} MB", request.id, size_mb, self.limit_mb);
            return Err(TierError::Abort(SourceError::SizeLimitExceeded {
                size_mb,
                limit_mb: self.limit_mb,
            }));
        }

        Err(TierError::Skip(format!("tamaño aceptable ({:.2} MB)", size_mb)))
    }
}

// ---------------------------------------------------------------------------
// APIs remotas
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiResponse {
    results: Option<String>,
}

/// API rápida: `GET {base}/yt?id=<id>&video=<bool>` → `{"results": <url>}`.
pub struct RemoteApiTier {
    client: reqwest::Client,
    base: String,
    retries: u32,
    retry_delay: Duration,
    store: LocalStore,
}

impl RemoteApiTier {
    pub fn new(client: reqwest::Client, base: impl Into<String>, retries: u32, retry_delay: Duration, store: LocalStore) -> Self {
        Self {
            client,
            base: base.into(),
            retries: retries.max(1),
            retry_delay,
            store,
        }
    }

    /// Pide la URL de descarga con reintentos acotados.
    async fn request_url(&self, request: &FetchRequest) -> Option<String> {
        let url = format!(
            "{}/yt?id={}&video={}",
            self.base,
            urlencoding::encode(&request.id),
            request.want_video
        );

        for attempt in 1..=self.retries {
            match self.client.get(&url).send().await {
                Ok(response) if response.status().is_success() => match response.json::<ApiResponse>().await {
                    Ok(body) => return body.results.filter(|r| !r.is_empty()),
                    Err(e) => warn!("❌ Respuesta de API inválida: {}", e),
                },
                Ok(response) => warn!("❌ API respondió {} (intento {})", response.status(), attempt),
                Err(e) => warn!("❌ Intento {} contra la API falló: {}", attempt, e),
            }

            if attempt < self.retries {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        None
    }
}

#[async_trait]
impl FetchTier for RemoteApiTier {
    fn name(&self) -> &'static str {
        "remote-api"
    }

    async fn fetch(&self, request: &FetchRequest) -> TierResult {
        let dl_url = self
            .request_url(request)
            .await
            .ok_or_else(|| TierError::Skip("la API no devolvió URL de descarga".into()))?;

        if is_telegram_link(&dl_url) {
            return Err(TierError::skip(SourceError::UnsupportedLink(dl_url)));
        }

        let default_ext = if request.want_video { "mp4" } else { "mp3" };
        let ext = extension_from_url(&dl_url).unwrap_or(default_ext);
        let path = self
            .store
            .download(&self.client, &dl_url, &request.id, ext)
            .await
            .map_err(TierError::skip)?;

        Ok(ResolvedSource::local_file(path.to_string_lossy(), request.want_video))
    }
}

#[derive(Debug, Deserialize)]
struct LegacyStatus {
    #[serde(default)]
    status: String,
    link: Option<String>,
    format: Option<String>,
    error: Option<String>,
}

/// API legada con trabajo asíncrono: `GET {base}/song/<id>?api=<key>`.
///
/// Sólo audio; el número de consultas está acotado por `max_polls`.
pub struct LegacyApiTier {
    client: reqwest::Client,
    base: String,
    key: String,
    poll_delay: Duration,
    max_polls: u32,
    store: LocalStore,
}

impl LegacyApiTier {
    pub fn new(
        client: reqwest::Client,
        base: impl Into<String>,
        key: impl Into<String>,
        poll_delay: Duration,
        max_polls: u32,
        store: LocalStore,
    ) -> Self {
        Self {
            client,
            base: base.into(),
            key: key.into(),
            poll_delay,
            max_polls: max_polls.max(1),
            store,
        }
    }

    async fn poll(&self, url: &str) -> std::result::Result<LegacyStatus, String> {
        let response = self.client.get(url).send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("API legada respondió {}", response.status()));
        }
        response.json::<LegacyStatus>().await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl FetchTier for LegacyApiTier {
    fn name(&self) -> &'static str {
        "legacy-api"
    }

    fn applies(&self, request: &FetchRequest) -> bool {
        !request.want_video
    }

    async fn fetch(&self, request: &FetchRequest) -> TierResult {
        let url = format!(
            "{}/song/{}?api={}",
            self.base,
            urlencoding::encode(&request.id),
            urlencoding::encode(&self.key)
        );

        for poll in 1..=self.max_polls {
            let data = self.poll(&url).await.map_err(TierError::Skip)?;

            match data.status.to_lowercase().as_str() {
                "downloading" => {
                    debug!("⏳ API legada preparando {} (consulta {})", request.id, poll);
                    tokio::time::sleep(self.poll_delay).await;
                }
                "error" => {
                    let reason = data.error.unwrap_or_else(|| "Unknown error".to_string());
                    return Err(TierError::Skip(format!("API legada: {}", reason)));
                }
                "done" => {
                    let link = data
                        .link
                        .ok_or_else(|| TierError::Skip("API legada terminó sin link".into()))?;
                    let ext = data.format.unwrap_or_else(|| "mp3".to_string()).to_lowercase();
                    let path = self
                        .store
                        .download(&self.client, &link, &request.id, &ext)
                        .await
                        .map_err(TierError::skip)?;
                    return Ok(ResolvedSource::local_file(path.to_string_lossy(), false));
                }
                other => return Err(TierError::Skip(format!("estado desconocido: {:?}", other))),
            }
        }

        Err(TierError::Skip(format!(
            "la API legada siguió descargando tras {} consultas",
            self.max_polls
        )))
    }
}

/// Escribe un yt-dlp falso que ejecuta `body` en sh.
#[cfg(all(test, unix))]
pub(crate) fn fake_ytdlp(dir: &std::path::Path, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-yt-dlp");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use pretty_assertions::assert_eq;

    fn store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn telegram_deep_links_are_detected() {
        assert!(is_telegram_link("https://t.me/somechannel/1234"));
        assert!(!is_telegram_link("https://t.me/abc/1"));
        assert!(!is_telegram_link("https://cdn.example/abc.mp3"));
    }

    #[tokio::test]
    async fn remote_api_downloads_result() {
        let mut server = mockito::Server::new_async().await;
        let file_url = format!("{}/files/abc123.m4a", server.url());
        let api = server
            .mock("GET", "/yt")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("id".into(), "abc123".into()),
                Matcher::UrlEncoded("video".into(), "false".into()),
            ]))
            .with_status(200)
            .with_body(format!(r#"{{"results":"{}"}}"#, file_url))
            .create_async()
            .await;
        let file = server
            .mock("GET", "/files/abc123.m4a")
            .with_status(200)
            .with_body("m4a-bytes")
            .create_async()
            .await;

        let (_dir, store) = store();
        let tier = RemoteApiTier::new(reqwest::Client::new(), server.url(), 3, Duration::from_millis(1), store.clone());
        let source = tier.fetch(&FetchRequest::new("abc123", false)).await.unwrap();

        api.assert_async().await;
        file.assert_async().await;
        assert_eq!(source.location, store.path_for("abc123", "m4a").to_string_lossy());
    }

    #[tokio::test]
    async fn remote_api_retries_a_bounded_number_of_times() {
        let mut server = mockito::Server::new_async().await;
        let api = server
            .mock("GET", "/yt")
            .match_query(Matcher::Any)
            .with_status(500)
            .expect(3)
            .create_async()
            .await;

        let (_dir, store) = store();
        let tier = RemoteApiTier::new(reqwest::Client::new(), server.url(), 3, Duration::from_millis(1), store);
        let err = tier.fetch(&FetchRequest::new("abc123", false)).await.unwrap_err();

        api.assert_async().await;
        assert!(matches!(err, TierError::Skip(_)));
    }

    #[tokio::test]
    async fn remote_api_never_fetches_telegram_links() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/yt")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"results":"https://t.me/somechannel/42"}"#)
            .create_async()
            .await;

        let (_dir, store) = store();
        let tier = RemoteApiTier::new(reqwest::Client::new(), server.url(), 1, Duration::from_millis(1), store.clone());
        let err = tier.fetch(&FetchRequest::new("abc123", false)).await.unwrap_err();

        assert_eq!(
            err,
            TierError::Skip(SourceError::UnsupportedLink("https://t.me/somechannel/42".into()).to_string())
        );
        assert!(store.find_cached("abc123", false).await.is_none());
    }

    #[tokio::test]
    async fn legacy_api_polls_until_done() {
        let mut server = mockito::Server::new_async().await;
        let link = format!("{}/dl/abc123", server.url());

        // mockito atiende primero al mock creado antes que aún no completó sus `expect`
        let downloading = server
            .mock("GET", "/song/abc123")
            .match_query(Matcher::UrlEncoded("api".into(), "key".into()))
            .with_status(200)
            .with_body(r#"{"status":"downloading"}"#)
            .expect(2)
            .create_async()
            .await;
        let done = server
            .mock("GET", "/song/abc123")
            .match_query(Matcher::UrlEncoded("api".into(), "key".into()))
            .with_status(200)
            .with_body(format!(r#"{{"status":"done","link":"{}","format":"M4A"}}"#, link))
            .expect(1)
            .create_async()
            .await;
        let file = server
            .mock("GET", "/dl/abc123")
            .with_status(200)
            .with_body("audio")
            .create_async()
            .await;

        let (_dir, store) = store();
        let tier = LegacyApiTier::new(reqwest::Client::new(), server.url(), "key", Duration::from_millis(1), 10, store.clone());
        let source = tier.fetch(&FetchRequest::new("abc123", false)).await.unwrap();

        downloading.assert_async().await;
        done.assert_async().await;
        file.assert_async().await;
        assert_eq!(source.location, store.path_for("abc123", "m4a").to_string_lossy());
    }

    #[tokio::test]
    async fn legacy_api_error_status_skips() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/song/abc123")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"status":"error","error":"quota"}"#)
            .create_async()
            .await;

        let (_dir, store) = store();
        let tier = LegacyApiTier::new(reqwest::Client::new(), server.url(), "key", Duration::from_millis(1), 10, store);
        let err = tier.fetch(&FetchRequest::new("abc123", false)).await.unwrap_err();
        assert_eq!(err, TierError::Skip("API legada: quota".into()));
    }

    #[tokio::test]
    async fn legacy_api_poll_count_is_capped() {
        let mut server = mockito::Server::new_async().await;
        let polls = server
            .mock("GET", "/song/abc123")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"status":"downloading"}"#)
            .expect(4)
            .create_async()
            .await;

        let (_dir, store) = store();
        let tier = LegacyApiTier::new(reqwest::Client::new(), server.url(), "key", Duration::from_millis(1), 4, store);
        let err = tier.fetch(&FetchRequest::new("abc123", false)).await.unwrap_err();

        polls.assert_async().await;
        assert!(matches!(err, TierError::Skip(reason) if reason.contains("4 consultas")));
    }

    #[test]
    fn legacy_api_is_audio_only() {
        let (_dir, store) = store();
        let tier = LegacyApiTier::new(reqwest::Client::new(), "http://x", "key", Duration::ZERO, 1, store);
        assert!(tier.applies(&FetchRequest::new("a", false)));
        assert!(!tier.applies(&FetchRequest::new("a", true)));
    }

    #[cfg(unix)]
    mod ytdlp {
        use super::*;
        use crate::sources::tiers::fake_ytdlp;
        use pretty_assertions::assert_eq;

        /// Escribe en la plantilla `-o <dir>/<id>.%(ext)s` con la extensión dada.
        fn writes_output(ext: &str) -> String {
            format!(
                r#"while [ "$1" != "-o" ]; do shift; done; out=$(echo "$2" | sed 's/%(ext)s/{}/'); echo data > "$out""#,
                ext
            )
        }

        fn entries(dir: &std::path::Path) -> Vec<String> {
            let mut names: Vec<String> = std::fs::read_dir(dir)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }

        fn extractor(bin: String, timeout: Duration) -> Arc<Extractor> {
            Arc::new(Extractor::new(bin, CredentialPool::new("/nonexistent"), timeout, 2))
        }

        #[tokio::test]
        async fn extractor_locates_produced_file() {
            let bin_dir = tempfile::tempdir().unwrap();
            let (_dir, store) = store();
            let tier = ExtractorTier::new(
                extractor(fake_ytdlp(bin_dir.path(), &writes_output("webm")), Duration::from_secs(5)),
                store.clone(),
            );

            let source = tier.fetch(&FetchRequest::new("abc123", false)).await.unwrap();
            assert_eq!(source, ResolvedSource::local_file(store.path_for("abc123", "webm").to_string_lossy(), false));
            assert_eq!(entries(store.dir()), vec!["abc123.webm"]);
        }

        #[tokio::test]
        async fn interrupted_extraction_leaves_no_cache_hit() {
            let bin_dir = tempfile::tempdir().unwrap();
            let (_dir, store) = store();
            let script = format!("{}; sleep 10", writes_output("m4a"));
            let tier = ExtractorTier::new(
                extractor(fake_ytdlp(bin_dir.path(), &script), Duration::from_millis(300)),
                store.clone(),
            );

            let err = tier.fetch(&FetchRequest::new("abc123", false)).await.unwrap_err();
            assert!(matches!(&err, TierError::Skip(reason) if reason.contains("300ms")), "{:?}", err);

            assert!(store.find_cached("abc123", false).await.is_none());
            assert!(CacheTier::new(store.clone()).fetch(&FetchRequest::new("abc123", false)).await.is_err());
            assert!(entries(store.dir()).is_empty());
        }

        #[tokio::test]
        async fn failed_extraction_discards_partial_output() {
            let bin_dir = tempfile::tempdir().unwrap();
            let (_dir, store) = store();
            let script = format!("{}; exit 1", writes_output("webm"));
            let tier = ExtractorTier::new(extractor(fake_ytdlp(bin_dir.path(), &script), Duration::from_secs(5)), store.clone());

            assert!(tier.fetch(&FetchRequest::new("abc123", false)).await.is_err());
            assert!(entries(store.dir()).is_empty());
        }

        #[tokio::test]
        async fn video_extraction_ignores_audio_already_in_store() {
            let bin_dir = tempfile::tempdir().unwrap();
            let (_dir, store) = store();
            std::fs::write(store.path_for("abc123", "m4a"), b"audio").unwrap();
            let tier = ExtractorTier::new(
                extractor(fake_ytdlp(bin_dir.path(), &writes_output("mp4")), Duration::from_secs(5)),
                store.clone(),
            );

            let source = tier.fetch(&FetchRequest::new("abc123", true)).await.unwrap();
            assert_eq!(source, ResolvedSource::local_file(store.path_for("abc123", "mp4").to_string_lossy(), true));
        }

        #[tokio::test]
        async fn video_extraction_without_mp4_fails() {
            let bin_dir = tempfile::tempdir().unwrap();
            let (_dir, store) = store();
            let tier = ExtractorTier::new(
                extractor(fake_ytdlp(bin_dir.path(), &writes_output("webm")), Duration::from_secs(5)),
                store.clone(),
            );

            let err = tier.fetch(&FetchRequest::new("abc123", true)).await.unwrap_err();
            assert!(matches!(err, TierError::Skip(reason) if reason.contains("no hay archivo")));
            assert!(entries(store.dir()).is_empty());
        }

        #[tokio::test]
        async fn formats_skip_dash_and_incomplete_entries() {
            let bin_dir = tempfile::tempdir().unwrap();
            let json = r#"{"formats":[
                {"format":"137 - 1920x1080 (DASH video)","filesize":1000,"format_id":"137","ext":"mp4","format_note":"1080p"},
                {"format":"251 - audio only (medium)","filesize":2000,"format_id":"251","ext":"webm","format_note":"medium"},
                {"format":"18 - 640x360 (360p)","filesize":null,"format_id":"18","ext":"mp4","format_note":"360p"},
                {"format":"22 - 1280x720 (720p)","filesize":3000,"format_id":"22","ext":"mp4"}
            ]}"#;
            let bin = fake_ytdlp(bin_dir.path(), &format!("echo '{}'", json.replace('\n', "")));

            let formats = extractor(bin, Duration::from_secs(5))
                .formats(&watch_url("abc123"))
                .await
                .unwrap();
            assert_eq!(
                formats,
                vec![MediaFormat {
                    format: "251 - audio only (medium)".into(),
                    filesize: 2000,
                    format_id: "251".into(),
                    ext: "webm".into(),
                    format_note: "medium".into(),
                }]
            );
        }

        #[tokio::test]
        async fn song_download_uses_the_chosen_format() {
            let bin_dir = tempfile::tempdir().unwrap();
            let (_dir, store) = store();
            let args_file = bin_dir.path().join("args");
            let script = format!(r#"echo "$@" > "{}"; {}"#, args_file.display(), writes_output("mp3"));
            let extractor = extractor(fake_ytdlp(bin_dir.path(), &script), Duration::from_secs(5));

            let path = extractor.download_song(&store, "abc123", "251", SongKind::Audio).await.unwrap();
            assert_eq!(path, store.dir().join("abc123.251.mp3"));
            let args = std::fs::read_to_string(&args_file).unwrap();
            assert!(args.contains("-f 251 -x --audio-format mp3"), "{}", args);

            // La canción no se confunde con el archivo de reproducción
            assert!(store.find_cached("abc123", false).await.is_none());

            // Segunda vez: ya está en disco, no se vuelve a invocar yt-dlp
            std::fs::remove_file(&args_file).unwrap();
            let again = extractor.download_song(&store, "abc123", "251", SongKind::Audio).await.unwrap();
            assert_eq!(again, path);
            assert!(!args_file.exists());
        }

        #[tokio::test]
        async fn song_video_merges_with_m4a_audio() {
            let bin_dir = tempfile::tempdir().unwrap();
            let (_dir, store) = store();
            let args_file = bin_dir.path().join("args");
            let script = format!(r#"echo "$@" > "{}"; {}"#, args_file.display(), writes_output("mp4"));
            let extractor = extractor(fake_ytdlp(bin_dir.path(), &script), Duration::from_secs(5));

            let path = extractor.download_song(&store, "abc123", "22", SongKind::Video).await.unwrap();
            assert_eq!(path, store.dir().join("abc123.22.mp4"));
            let args = std::fs::read_to_string(&args_file).unwrap();
            assert!(args.contains("-f 22+140 --merge-output-format mp4"), "{}", args);
        }

        #[tokio::test]
        async fn song_download_rejects_odd_format_ids() {
            let (_dir, store) = store();
            let extractor = extractor("/nonexistent/yt-dlp".into(), Duration::from_secs(5));
            let err = extractor
                .download_song(&store, "abc123", "../x", SongKind::Audio)
                .await
                .unwrap_err();
            assert!(err.to_string().contains("format_id inválido"));
        }

        #[tokio::test]
        async fn extractor_nonzero_exit_skips() {
            let bin_dir = tempfile::tempdir().unwrap();
            let (_dir, store) = store();
            let tier = ExtractorTier::new(
                extractor(fake_ytdlp(bin_dir.path(), "echo 'Sign in to confirm' >&2; exit 1"), Duration::from_secs(5)),
                store,
            );

            let err = tier.fetch(&FetchRequest::new("abc123", false)).await.unwrap_err();
            assert!(matches!(err, TierError::Skip(reason) if reason.contains("Sign in")));
        }

        #[tokio::test]
        async fn stream_url_takes_first_line() {
            let bin_dir = tempfile::tempdir().unwrap();
            let bin = fake_ytdlp(bin_dir.path(), "echo https://media.example/v.mp4; echo https://media.example/a.m4a");
            let tier = StreamUrlTier::new(extractor(bin, Duration::from_secs(5)));

            assert!(!tier.applies(&FetchRequest::new("abc123", false)));
            let source = tier.fetch(&FetchRequest::new("abc123", true)).await.unwrap();
            assert_eq!(source, ResolvedSource::direct_url("https://media.example/v.mp4", true));
        }

        #[tokio::test]
        async fn size_guard_aborts_over_limit() {
            let bin_dir = tempfile::tempdir().unwrap();
            // 200 MB + 100 MB
            let bin = fake_ytdlp(
                bin_dir.path(),
                r#"echo '{"formats":[{"filesize":209715200},{"filesize":null},{"filesize":104857600}]}'"#,
            );
            let tier = SizeGuardTier::new(extractor(bin, Duration::from_secs(5)), 250);

            let err = tier.fetch(&FetchRequest::new("abc123", true)).await.unwrap_err();
            assert_eq!(
                err,
                TierError::Abort(SourceError::SizeLimitExceeded {
                    size_mb: 300.0,
                    limit_mb: 250
                })
            );
        }

        #[tokio::test]
        async fn size_guard_lets_small_files_through() {
            let bin_dir = tempfile::tempdir().unwrap();
            let bin = fake_ytdlp(bin_dir.path(), r#"echo '{"formats":[{"filesize":1048576}]}'"#);
            let tier = SizeGuardTier::new(extractor(bin, Duration::from_secs(5)), 250);

            let err = tier.fetch(&FetchRequest::new("abc123", true)).await.unwrap_err();
            assert!(matches!(err, TierError::Skip(_)));
        }
    }
}
