use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Cliente mínimo de la Bot API de Telegram.
pub struct TelegramClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BotUser {
    pub id: i64,
    pub first_name: String,
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiReply<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

impl TelegramClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Error al construir cliente de Telegram")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Valida el token y devuelve la identidad del bot.
    pub async fn get_me(&self) -> Result<BotUser> {
        let url = format!("{}/bot{}/getMe", self.base_url, self.token);
        debug!("🤖 Consultando getMe");

        let reply: ApiReply<BotUser> = self
            .client
            .get(&url)
            .send()
            .await
            .context("Telegram no responde")?
            .json()
            .await
            .context("Respuesta inválida de Telegram")?;

        match reply {
            ApiReply { ok: true, result: Some(user), .. } => Ok(user),
            ApiReply { description, .. } => anyhow::bail!(
                "Telegram rechazó el token: {}",
                description.unwrap_or_else(|| "sin descripción".to_string())
            ),
        }
    }
}
