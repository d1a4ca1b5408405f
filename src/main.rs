use anyhow::Result;
use std::sync::Arc;
use tracing::info;

mod audio;
mod bot;
mod cache;
mod call;
mod config;
mod error;
mod sources;
mod storage;

use crate::audio::player::SessionManager;
use crate::bot::{Bootstrap, TelegramClient};
use crate::call::{CallTransport, HttpCallBridge};
use crate::config::Config;
use crate::sources::cookies::CredentialPool;
use crate::sources::resolver::ResolverConfig;
use crate::sources::{FetcherConfig, MediaResolver, SourceFetcher, YtDlpSearch};
use crate::storage::JsonStorage;

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tg_music=debug".parse()?)
                .add_directive("reqwest=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando tg-music v{}", env!("CARGO_PKG_VERSION"));

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check().await;
    }

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    let storage = JsonStorage::new(config.data_dir.clone()).await?;

    let search = Arc::new(YtDlpSearch::new(
        config.ytdlp_bin.clone(),
        CredentialPool::new(&config.cookies_dir),
    ));
    let resolver = Arc::new(MediaResolver::new(search, ResolverConfig::from(&config)));
    let fetcher = Arc::new(SourceFetcher::new(FetcherConfig::from(&config))?);

    let transport: Arc<dyn CallTransport> = Arc::new(HttpCallBridge::new(
        &config.call_bridge_url,
        config.assistant_sessions.clone(),
    )?);
    let manager = Arc::new(SessionManager::new(fetcher, transport.clone(), config.max_queue_size));
    let telegram = TelegramClient::new(&config.telegram_api_url, config.bot_token.clone())?;

    Bootstrap::new(config, telegram, storage, transport, resolver, manager)
        .run()
        .await
}

async fn health_check() -> Result<()> {
    let ytdlp_bin = std::env::var("YTDLP_BIN").unwrap_or_else(|_| "yt-dlp".to_string());

    // Verificar dependencias críticas
    let yt_dlp = async_process::Command::new(&ytdlp_bin)
        .arg("--version")
        .output()
        .await?;

    let ffmpeg = async_process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .await?;

    if yt_dlp.status.success() && ffmpeg.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Dependencias faltantes");
    }
}
