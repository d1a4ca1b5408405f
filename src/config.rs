use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Clip que se transmite al grupo de logs para comprobar el chat de voz.
pub const DEFAULT_STARTUP_STREAM: &str = "https://te.legra.ph/file/29f784eb49d230ab62e9e.mp4";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Telegram
    pub bot_token: String,
    pub assistant_sessions: Vec<String>,
    pub log_group_id: i64,
    pub telegram_api_url: String,
    pub startup_stream_url: String,

    // Puente de llamadas (cliente asistente)
    pub call_bridge_url: String,

    // APIs de descarga (opcionales)
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub api_retries: u32,
    pub api_retry_delay_ms: u64,
    pub legacy_poll_delay_ms: u64,
    pub legacy_max_polls: u32,

    // Extracción
    pub ytdlp_bin: String,
    pub extraction_timeout: u64, // En segundos
    pub max_concurrent_extractions: usize,
    pub video_download: bool,
    pub max_video_size_mb: u64,

    // Cola y caché
    pub max_queue_size: usize,
    pub cache_size: usize,
    pub cache_ttl: u64, // En segundos

    // Paths
    pub download_dir: PathBuf,
    pub cookies_dir: PathBuf,
    pub data_dir: PathBuf,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let assistant_sessions = (1..=5)
            .filter_map(|i| env_opt(&format!("STRING{}", i)))
            .collect();

        let config = Self {
            // Telegram
            bot_token: std::env::var("BOT_TOKEN").context("BOT_TOKEN no definido")?,
            assistant_sessions,
            log_group_id: std::env::var("LOG_GROUP_ID")
                .context("LOG_GROUP_ID no definido")?
                .parse()
                .context("LOG_GROUP_ID debe ser numérico")?,
            telegram_api_url: env_or("TELEGRAM_API_URL", &defaults.telegram_api_url),
            startup_stream_url: env_or("STARTUP_STREAM_URL", DEFAULT_STARTUP_STREAM),

            call_bridge_url: env_or("CALL_BRIDGE_URL", &defaults.call_bridge_url),

            // APIs
            api_url: env_opt("API_URL").map(|u| u.trim_end_matches('/').to_string()),
            api_key: env_opt("API_KEY"),
            api_retries: env_or("API_RETRIES", "3").parse()?,
            api_retry_delay_ms: env_or("API_RETRY_DELAY_MS", "1000").parse()?,
            legacy_poll_delay_ms: env_or("LEGACY_POLL_DELAY_MS", "2000").parse()?,
            legacy_max_polls: env_or("LEGACY_MAX_POLLS", "60").parse()?,

            // Extracción
            ytdlp_bin: env_or("YTDLP_BIN", "yt-dlp"),
            extraction_timeout: env_or("EXTRACTION_TIMEOUT", "300").parse()?,
            max_concurrent_extractions: match std::env::var("MAX_CONCURRENT_EXTRACTIONS") {
                Ok(val) if !val.trim().is_empty() => val.parse()?,
                _ => num_cpus::get(),
            },
            video_download: env_or("VIDEO_DOWNLOAD", "false").parse()?,
            max_video_size_mb: env_or("MAX_VIDEO_SIZE_MB", "250").parse()?,

            // Cola y caché
            max_queue_size: env_or("MAX_QUEUE_SIZE", "1000").parse()?,
            cache_size: env_or("CACHE_SIZE", "100").parse()?,
            cache_ttl: env_or("CACHE_TTL", "3600").parse()?,

            // Paths
            download_dir: env_or("DOWNLOAD_DIR", "downloads").into(),
            cookies_dir: env_or("COOKIES_DIR", "cookies").into(),
            data_dir: env_or("DATA_DIR", "data").into(),
        };

        config.validate()?;

        std::fs::create_dir_all(&config.download_dir)?;
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// The assistant check mirrors the bot's startup contract: without at
    /// least one assistant session there is nobody to join voice chats, so
    /// the process must not start.
    pub fn validate(&self) -> Result<()> {
        if self.assistant_sessions.is_empty() {
            anyhow::bail!("Assistant client variables not defined (STRING1..STRING5)");
        }

        if self.bot_token.trim().is_empty() {
            anyhow::bail!("BOT_TOKEN must not be empty");
        }

        if self.api_url.is_some() != self.api_key.is_some() {
            anyhow::bail!("API_URL and API_KEY must be set together");
        }

        if self.api_retries == 0 {
            anyhow::bail!("API retries must be greater than 0");
        }

        if self.legacy_max_polls == 0 {
            anyhow::bail!("Legacy poll cap must be greater than 0");
        }

        if self.extraction_timeout == 0 {
            anyhow::bail!("Extraction timeout must be greater than 0");
        }

        if self.max_concurrent_extractions == 0 {
            anyhow::bail!("Max concurrent extractions must be greater than 0");
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.cache_size == 0 {
            anyhow::bail!("Cache size must be greater than 0");
        }

        Ok(())
    }

    pub fn api_configured(&self) -> bool {
        self.api_url.is_some() && self.api_key.is_some()
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout)
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Excludes tokens and session strings.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Telegram: {} assistant(s), log group {}\n  \
            Bridge: {}\n  \
            API: {}\n  \
            Extraction: {} (timeout {}, {} workers, video download={})\n  \
            Limits: {} queue, {} MB video, {} cached tracks",
            self.assistant_sessions.len(),
            self.log_group_id,
            self.call_bridge_url,
            if self.api_configured() { self.api_url.as_deref().unwrap_or_default() } else { "disabled" },
            self.ytdlp_bin,
            humantime::format_duration(self.extraction_timeout()),
            self.max_concurrent_extractions,
            self.video_download,
            self.max_queue_size,
            self.max_video_size_mb,
            self.cache_size,
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Telegram (sin defaults para credenciales)
            bot_token: String::new(),
            assistant_sessions: Vec::new(),
            log_group_id: 0,
            telegram_api_url: "https://api.telegram.org".to_string(),
            startup_stream_url: DEFAULT_STARTUP_STREAM.to_string(),

            call_bridge_url: "http://127.0.0.1:8765".to_string(),

            api_url: None,
            api_key: None,
            api_retries: 3,
            api_retry_delay_ms: 1000,
            legacy_poll_delay_ms: 2000,
            legacy_max_polls: 60,

            ytdlp_bin: "yt-dlp".to_string(),
            extraction_timeout: 300,
            max_concurrent_extractions: num_cpus::get(),
            video_download: false,
            max_video_size_mb: 250,

            max_queue_size: 1000,
            cache_size: 100,
            cache_ttl: 3600,

            download_dir: "downloads".into(),
            cookies_dir: "cookies".into(),
            data_dir: "data".into(),
        }
    }
}
