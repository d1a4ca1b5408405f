use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CallEvent, CallTransport};
use crate::sources::ResolvedSource;

/// Cliente REST del sidecar de llamadas.
///
/// Los eventos llegan como NDJSON por `GET /events` y se reenvían a un canal
/// `flume`. Si el stream se corta, se reconecta tras `reconnect_delay`.
pub struct HttpCallBridge {
    client: reqwest::Client,
    base_url: String,
    sessions: Vec<String>,
    reconnect_delay: Duration,
    events_tx: flume::Sender<CallEvent>,
    events_rx: flume::Receiver<CallEvent>,
    pump: Mutex<Option<CancellationToken>>,
}

impl HttpCallBridge {
    pub fn new(base_url: &str, sessions: Vec<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Error al construir cliente HTTP del puente")?;
        let (events_tx, events_rx) = flume::unbounded();

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            sessions,
            reconnect_delay: Duration::from_secs(2),
            events_tx,
            events_rx,
            pump: Mutex::new(None),
        })
    }

    #[allow(dead_code)]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        self.client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Error contactando el puente en {}", url))?
            .error_for_status()
            .with_context(|| format!("El puente rechazó {}", path))?;
        Ok(())
    }

    fn spawn_event_pump(&self) {
        let token = CancellationToken::new();
        if let Some(previous) = self.pump.lock().replace(token.clone()) {
            previous.cancel();
        }

        let client = self.client.clone();
        let url = format!("{}/events", self.base_url);
        let tx = self.events_tx.clone();
        let delay = self.reconnect_delay;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = pump_events(&client, &url, &tx) => match result {
                        Ok(()) => warn!("📡 Stream de eventos cerrado, reconectando"),
                        Err(e) => warn!("📡 Error en stream de eventos: {:#}", e),
                    },
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            debug!("📡 Bomba de eventos detenida");
        });
    }
}

/// Lee el stream NDJSON hasta que termina, enviando cada evento al canal.
async fn pump_events(client: &reqwest::Client, url: &str, tx: &flume::Sender<CallEvent>) -> Result<()> {
    let response = client.get(url).send().await?.error_for_status()?;
    let mut stream = response.bytes_stream();
    let mut buffer = BytesMut::new();

    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);

        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line = buffer.split_to(pos);
            buffer.advance(1);
            dispatch_line(&line, tx);
        }
    }

    if !buffer.is_empty() {
        dispatch_line(&buffer, tx);
    }
    Ok(())
}

fn dispatch_line(line: &[u8], tx: &flume::Sender<CallEvent>) {
    if line.iter().all(u8::is_ascii_whitespace) {
        return;
    }

    match serde_json::from_slice::<CallEvent>(line) {
        Ok(event) => {
            debug!("📡 Evento de llamada: {:?}", event);
            if tx.send(event).is_err() {
                error!("Canal de eventos cerrado");
            }
        }
        Err(e) => warn!("Evento ilegible del puente: {} ({})", String::from_utf8_lossy(line), e),
    }
}

#[async_trait]
impl CallTransport for HttpCallBridge {
    async fn start(&self) -> Result<()> {
        info!("📞 Iniciando {} cliente(s) asistente(s)", self.sessions.len());
        self.post("/start", json!({ "sessions": self.sessions })).await?;
        self.spawn_event_pump();
        Ok(())
    }

    async fn play(&self, chat_id: i64, source: ResolvedSource) -> Result<()> {
        self.post(&format!("/calls/{}/play", chat_id), serde_json::to_value(&source)?)
            .await
            .context("Error al reproducir en la llamada")
    }

    async fn pause(&self, chat_id: i64) -> Result<()> {
        self.post(&format!("/calls/{}/pause", chat_id), json!({})).await
    }

    async fn resume(&self, chat_id: i64) -> Result<()> {
        self.post(&format!("/calls/{}/resume", chat_id), json!({})).await
    }

    async fn leave(&self, chat_id: i64) -> Result<()> {
        self.post(&format!("/calls/{}/leave", chat_id), json!({}))
            .await
            .context("Error al salir de la llamada")
    }

    async fn stop(&self) -> Result<()> {
        let pump = self.pump.lock().take();
        if let Some(token) = pump {
            token.cancel();
        }
        self.post("/stop", json!({})).await
    }

    fn events(&self) -> flume::Receiver<CallEvent> {
        self.events_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn start_posts_sessions_and_pumps_events() {
        let mut server = mockito::Server::new_async().await;
        let start = server
            .mock("POST", "/start")
            .match_body(Matcher::Json(json!({ "sessions": ["s1", "s2"] })))
            .with_status(200)
            .create_async()
            .await;
        server
            .mock("GET", "/events")
            .with_status(200)
            .with_body(concat!(
                r#"{"type":"stream_ended","chat_id":-1001}"#,
                "\n\nbasura\n",
                r#"{"type":"closed","chat_id":7}"#
            ))
            .create_async()
            .await;

        let bridge = HttpCallBridge::new(&format!("{}/", server.url()), vec!["s1".into(), "s2".into()])
            .unwrap()
            .with_reconnect_delay(Duration::from_secs(60));
        let events = bridge.events();
        bridge.start().await.unwrap();
        start.assert_async().await;

        let first = tokio::time::timeout(Duration::from_secs(5), events.recv_async()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), events.recv_async()).await.unwrap().unwrap();
        assert_eq!(first, CallEvent::StreamEnded { chat_id: -1001 });
        assert_eq!(second, CallEvent::Closed { chat_id: 7 });
    }

    #[tokio::test]
    async fn play_sends_the_resolved_source() {
        let mut server = mockito::Server::new_async().await;
        let play = server
            .mock("POST", "/calls/-1001/play")
            .match_body(Matcher::Json(json!({
                "kind": "direct_url",
                "location": "https://media.example/v.mp4",
                "is_video": true
            })))
            .with_status(200)
            .create_async()
            .await;

        let bridge = HttpCallBridge::new(&server.url(), Vec::new()).unwrap();
        bridge
            .play(-1001, ResolvedSource::direct_url("https://media.example/v.mp4", true))
            .await
            .unwrap();
        play.assert_async().await;
    }

    #[tokio::test]
    async fn sidecar_errors_surface() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/calls/5/leave")
            .with_status(500)
            .create_async()
            .await;

        let bridge = HttpCallBridge::new(&server.url(), Vec::new()).unwrap();
        let err = bridge.leave(5).await.unwrap_err();
        assert!(format!("{:#}", err).contains("salir de la llamada"));
    }
}
