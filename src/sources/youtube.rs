use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::process::{Output, Stdio};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::cookies::CredentialPool;
use super::{SearchHit, SearchProvider};
use crate::error::SourceError;

const WATCH_BASE: &str = "https://www.youtube.com/watch?v=";
const PLAYLIST_BASE: &str = "https://youtube.com/playlist?list=";

static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:youtube\.com|youtu\.be)|(?:^|[?&])v=").expect("regex de enlace válido")
});

static ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:(?:^|[?&])v=|youtu\.be/|/shorts/|/embed/|/live/|/v/)([A-Za-z0-9_-]+)")
        .expect("regex de id válido")
});

/// Verifica si la consulta es un enlace de YouTube (o un fragmento `v=...`).
pub fn is_youtube_link(query: &str) -> bool {
    LINK_RE.is_match(query.trim())
}

/// Extrae el id de video ignorando ruido como `&list=...` o `?si=...`.
pub fn extract_video_id(query: &str) -> Option<String> {
    ID_RE
        .captures(query.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn watch_url(id: &str) -> String {
    format!("{}{}", WATCH_BASE, id)
}

pub fn playlist_url(list_id: &str) -> String {
    format!("{}{}", PLAYLIST_BASE, urlencoding::encode(list_id))
}

/// Quita el query string (`?sqp=...`) de las miniaturas.
pub fn strip_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

/// Corta todo lo que sigue al primer `&` de un enlace.
pub fn trim_link(link: &str) -> &str {
    link.split('&').next().unwrap_or(link)
}

/// Ejecuta yt-dlp con una lista explícita de argumentos y un límite duro de tiempo.
///
/// Al vencer el límite el proceso hijo se mata (`kill_on_drop`).
pub(crate) async fn run_ytdlp(bin: &str, args: &[String], limit: Duration) -> Result<Output> {
    debug!("🔧 {} {}", bin, args.join(" "));

    let child = Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Error al ejecutar {}", bin))?;

    match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(output) => Ok(output.context("Error esperando a yt-dlp")?),
        Err(_) => {
            warn!("⏰ {} superó el límite de {:?}, proceso terminado", bin, limit);
            Err(SourceError::Timeout { limit }.into())
        }
    }
}

/// Información extraída de yt-dlp (`--dump-json`)
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: String,
    title: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    thumbnails: Option<Vec<Thumbnail>>,
    webpage_url: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

impl YtDlpInfo {
    fn into_hit(self) -> SearchHit {
        let thumbnail = self
            .thumbnail
            .or_else(|| self.thumbnails.and_then(|t| t.into_iter().next().map(|t| t.url)));
        let link = self
            .webpage_url
            .or(self.url.filter(|u| u.starts_with("http")))
            .unwrap_or_else(|| watch_url(&self.id));

        SearchHit {
            title: self.title.unwrap_or_else(|| "Unknown".to_string()),
            duration_secs: self.duration.filter(|d| *d >= 0.0).map(|d| d.round() as u64),
            thumbnail,
            link,
            id: self.id,
        }
    }
}

/// Backend de búsqueda basado en yt-dlp
pub struct YtDlpSearch {
    bin: String,
    credentials: CredentialPool,
    timeout: Duration,
    // Limitar requests concurrentes para evitar rate limiting
    rate_limiter: Semaphore,
}

impl YtDlpSearch {
    pub fn new(bin: impl Into<String>, credentials: CredentialPool) -> Self {
        Self {
            bin: bin.into(),
            credentials,
            timeout: Duration::from_secs(30),
            rate_limiter: Semaphore::new(3),
        }
    }

    async fn search_args(&self, query: &str, limit: usize) -> Vec<String> {
        let mut args: Vec<String> = ["--dump-json", "--no-playlist", "--skip-download", "--no-warnings"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(self.credentials.args().await);

        if is_youtube_link(query) {
            let target = extract_video_id(query)
                .map(|id| watch_url(&id))
                .unwrap_or_else(|| trim_link(query).to_string());
            args.push(target);
        } else {
            args.push("--flat-playlist".to_string());
            args.push(format!("ytsearch{}:{}", limit.max(1), query));
        }
        args
    }

    async fn playlist_args(&self, link: &str, limit: usize) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-i".into(),
            "--get-id".into(),
            "--flat-playlist".into(),
            "--playlist-end".into(),
            limit.to_string(),
            "--skip-download".into(),
        ];
        args.extend(self.credentials.args().await);
        args.push(link.to_string());
        args
    }
}

/// Parsea la salida línea por línea de `--dump-json`.
fn parse_dump(stdout: &str, limit: usize) -> Vec<SearchHit> {
    stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<YtDlpInfo>(line).ok())
        .map(YtDlpInfo::into_hit)
        .take(limit.max(1))
        .collect()
}

/// Parsea la salida de `--get-id`, descartando líneas vacías.
fn parse_ids(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl SearchProvider for YtDlpSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let _permit = self.rate_limiter.acquire().await?;

        info!("🔍 Buscando en YouTube: {}", query);

        let output = run_ytdlp(&self.bin, &self.search_args(query, limit).await, self.timeout).await?;
        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("yt-dlp error: {}", error.trim());
        }

        let hits = parse_dump(&String::from_utf8_lossy(&output.stdout), limit);
        debug!("🔍 {} resultados para: {}", hits.len(), query);
        Ok(hits)
    }

    async fn playlist_ids(&self, link: &str, limit: usize) -> Result<Vec<String>> {
        let _permit = self.rate_limiter.acquire().await?;

        info!("📋 Obteniendo playlist: {}", link);

        let output = run_ytdlp(&self.bin, &self.playlist_args(link, limit).await, self.timeout).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        // yt-dlp avisa de videos ocultos por stderr pero la lista sigue siendo válida
        if !output.status.success() && !stderr.to_lowercase().contains("unavailable videos are hidden") {
            anyhow::bail!("yt-dlp playlist error: {}", stderr.trim());
        }

        Ok(parse_ids(&String::from_utf8_lossy(&output.stdout)))
    }

    fn source_name(&self) -> &'static str {
        "YouTube"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_youtube_link_detection() {
        assert!(is_youtube_link("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(is_youtube_link("https://youtu.be/dQw4w9WgXcQ"));
        assert!(is_youtube_link("https://music.youtube.com/watch?v=test"));
        assert!(is_youtube_link("v=abc123&list=PL1"));
        assert!(!is_youtube_link("https://example.com/video"));
        assert!(!is_youtube_link("never gonna give you up"));
    }

    #[test]
    fn id_extraction_ignores_query_noise() {
        let expected = Some("abc123".to_string());
        assert_eq!(extract_video_id("v=abc123&list=PL1"), expected);
        assert_eq!(extract_video_id("https://www.youtube.com/watch?v=abc123&list=PL1&index=2"), expected);
        assert_eq!(extract_video_id("https://youtube.com/watch?feature=share&v=abc123"), expected);
        assert_eq!(extract_video_id("https://youtu.be/abc123?si=xyz"), expected);
        assert_eq!(extract_video_id("https://www.youtube.com/shorts/abc123"), expected);
        assert_eq!(extract_video_id("https://example.com/video"), None);
    }

    #[test]
    fn thumbnails_and_links_are_trimmed() {
        assert_eq!(strip_query("https://i.ytimg.com/vi/x/hq.jpg?sqp=abc"), "https://i.ytimg.com/vi/x/hq.jpg");
        assert_eq!(trim_link("https://youtube.com/playlist?list=PL1&si=2"), "https://youtube.com/playlist?list=PL1");
        assert_eq!(playlist_url("PL1"), "https://youtube.com/playlist?list=PL1");
    }

    #[test]
    fn dump_json_lines_become_hits() {
        let stdout = concat!(
            r#"{"id":"abc123","title":"Song","duration":212.6,"thumbnails":[{"url":"https://i.ytimg.com/a.jpg?x=1"}],"url":"https://www.youtube.com/watch?v=abc123"}"#,
            "\n",
            "not json\n",
            r#"{"id":"live1","title":"Live","duration":null}"#,
            "\n"
        );

        let hits = parse_dump(stdout, 5);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "abc123");
        assert_eq!(hits[0].duration_secs, Some(213));
        assert_eq!(hits[0].thumbnail.as_deref(), Some("https://i.ytimg.com/a.jpg?x=1"));
        assert_eq!(hits[1].duration_secs, None);
        assert_eq!(hits[1].link, "https://www.youtube.com/watch?v=live1");
    }

    #[test]
    fn playlist_ids_drop_blank_lines() {
        assert_eq!(parse_ids("a1\n\nb2\n  \nc3\n"), vec!["a1", "b2", "c3"]);
    }

    #[tokio::test]
    async fn search_args_use_direct_url_for_links() {
        let search = YtDlpSearch::new("yt-dlp", CredentialPool::new("/nonexistent"));
        let args = search.search_args("v=abc123&list=PL1", 1).await;
        assert_eq!(args.last().unwrap(), "https://www.youtube.com/watch?v=abc123");

        let args = search.search_args("lofi beats", 10).await;
        assert_eq!(args.last().unwrap(), "ytsearch10:lofi beats");
        assert!(args.contains(&"--flat-playlist".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_ytdlp_times_out_instead_of_hanging() {
        let started = std::time::Instant::now();
        let err = run_ytdlp("sleep", &["5".to_string()], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(3));
        let timeout = err.downcast_ref::<SourceError>().unwrap();
        assert_eq!(
            timeout,
            &SourceError::Timeout {
                limit: Duration::from_millis(200)
            }
        );
        // Los límites menores a un segundo no se redondean a 0
        assert_eq!(timeout.to_string(), "la extracción superó el límite de 200ms");
    }
}
