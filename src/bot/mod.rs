//! # Bot Module
//!
//! Process lifecycle for the music bot.
//!
//! [`Bootstrap`] wires the pieces together and runs the startup sequence:
//!
//! 1. Validate credentials (at least one assistant session)
//! 2. Load banned users from [`JsonStorage`] (a failure here is only a warning)
//! 3. Start the bot client and the call transport
//! 4. Probe the log group's voice chat with the startup clip
//! 5. Dispatch call events until Ctrl-C, then shut everything down
//!
//! Any failure before step 5 aborts the process with a non-zero exit code.

pub mod events;
pub mod service;
pub mod telegram;

use anyhow::{Context, Result};
use dashmap::DashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    audio::player::SessionManager,
    call::CallTransport,
    config::Config,
    sources::{MediaResolver, ResolvedSource},
    storage::JsonStorage,
};

pub use service::MusicService;
pub use telegram::TelegramClient;

const CACHE_CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

pub struct Bootstrap {
    config: Arc<Config>,
    telegram: TelegramClient,
    storage: JsonStorage,
    transport: Arc<dyn CallTransport>,
    resolver: Arc<MediaResolver>,
    manager: Arc<SessionManager>,
    banned: Arc<DashSet<i64>>,
}

impl Bootstrap {
    pub fn new(
        config: Config,
        telegram: TelegramClient,
        storage: JsonStorage,
        transport: Arc<dyn CallTransport>,
        resolver: Arc<MediaResolver>,
        manager: Arc<SessionManager>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            telegram,
            storage,
            transport,
            resolver,
            manager,
            banned: Arc::new(DashSet::new()),
        }
    }

    /// Servicio de pedidos para quien atienda los comandos.
    #[allow(dead_code)]
    pub fn service(&self) -> MusicService {
        MusicService::new(self.resolver.clone(), self.manager.clone(), self.banned.clone())
    }

    /// Corre hasta Ctrl-C.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Error al registrar Ctrl+C: {}", e);
            }
            info!("⚠️ Señal de shutdown recibida, cerrando...");
        })
        .await
    }

    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        self.config.validate()?;

        self.load_banned_users().await;

        let me = self.telegram.get_me().await.context("No se pudo iniciar el cliente del bot")?;
        info!(
            "🤖 Bot conectado como @{} ({})",
            me.username.as_deref().unwrap_or(&me.first_name),
            me.id
        );
        info!("📦 Módulos cargados: resolver, fetcher, sesiones, eventos");

        self.transport
            .start()
            .await
            .context("No se pudieron iniciar los clientes asistentes")?;

        self.probe_log_group().await?;

        let token = CancellationToken::new();
        let dispatcher = events::spawn_dispatcher(self.transport.events(), self.manager.clone(), token.clone());
        self.spawn_cache_cleanup(token.clone());

        info!("🚀 Bot iniciado exitosamente");
        shutdown.await;

        token.cancel();
        if let Err(e) = dispatcher.await {
            warn!("Despachador terminó con error: {}", e);
        }
        for chat_id in self.manager.active_chats().await {
            if let Err(e) = self.manager.stop(chat_id).await {
                warn!("Error al detener chat {}: {:#}", chat_id, e);
            }
        }
        if let Err(e) = self.transport.stop().await {
            warn!("Error al detener el transporte: {:#}", e);
        }

        info!("👋 Deteniendo el bot...");
        Ok(())
    }

    async fn load_banned_users(&self) {
        match self.storage.load_banned().await {
            Ok(users) => {
                let count = users.len();
                for user_id in users {
                    self.banned.insert(user_id);
                }
                info!("🚫 {} usuarios bloqueados cargados", count);
            }
            Err(e) => warn!("Error obteniendo usuarios bloqueados: {:#}", e),
        }
    }

    /// Transmite el clip de arranque en el chat de voz del grupo de logs y sale.
    async fn probe_log_group(&self) -> Result<()> {
        let chat_id = self.config.log_group_id;
        let clip = ResolvedSource::direct_url(self.config.startup_stream_url.clone(), true);

        if let Err(e) = self.transport.play(chat_id, clip).await {
            error!("❌ Inicia el chat de video en tu grupo/canal de logs primero. Deteniendo el bot...");
            return Err(e.context(format!("No se pudo transmitir en el grupo de logs {}", chat_id)));
        }

        if let Err(e) = self.transport.leave(chat_id).await {
            warn!("No se pudo salir del grupo de logs tras la prueba: {:#}", e);
        }
        info!("✅ Prueba de llamada en el grupo de logs completada");
        Ok(())
    }

    fn spawn_cache_cleanup(&self, token: CancellationToken) {
        let resolver = self.resolver.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CACHE_CLEANUP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => resolver.cache().cleanup_old_entries(),
                }
            }
        });
    }
}
