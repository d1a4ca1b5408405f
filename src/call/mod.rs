//! # Call Module
//!
//! The voice-call transport is an external collaborator (the assistant
//! userbot joined to the group's video chat). The rest of the crate only sees
//! the [`CallTransport`] trait; [`bridge::HttpCallBridge`] talks to a calling
//! sidecar over HTTP.

pub mod bridge;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::sources::ResolvedSource;

pub use bridge::HttpCallBridge;

/// Eventos que emite el transporte de llamadas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    /// Terminó el stream actual del chat.
    StreamEnded { chat_id: i64 },
    /// La llamada se cerró o el asistente fue expulsado.
    Closed { chat_id: i64 },
    Error { chat_id: i64, message: String },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CallTransport: Send + Sync {
    /// Inicia los clientes asistentes.
    async fn start(&self) -> Result<()>;

    /// Une la llamada si hace falta y reproduce `source`.
    async fn play(&self, chat_id: i64, source: ResolvedSource) -> Result<()>;

    async fn pause(&self, chat_id: i64) -> Result<()>;

    async fn resume(&self, chat_id: i64) -> Result<()>;

    async fn leave(&self, chat_id: i64) -> Result<()>;

    /// Detiene todos los clientes asistentes.
    async fn stop(&self) -> Result<()>;

    fn events(&self) -> flume::Receiver<CallEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn events_use_tagged_json() {
        let event: CallEvent = serde_json::from_str(r#"{"type":"stream_ended","chat_id":-1001}"#).unwrap();
        assert_eq!(event, CallEvent::StreamEnded { chat_id: -1001 });

        let json = serde_json::to_string(&CallEvent::Error {
            chat_id: 5,
            message: "boom".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"error","chat_id":5,"message":"boom"}"#);
    }
}
