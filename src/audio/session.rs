use serde::{Deserialize, Serialize};
use tracing::debug;

use super::queue::QueueEntry;
use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Playing,
    Paused,
}

/// Máquina de estados de la llamada de voz de un chat.
///
/// ```text
/// Idle ──start──▶ Connecting ──source_ready──▶ Playing ◀──resume── Paused
///                     ▲                           │ ──pause──▶
///                     └──── end_of_track(Some) ───┘
/// ```
///
/// `end_of_track(None)` y `stop` vuelven a `Idle` desde cualquier estado activo.
#[derive(Debug, Clone)]
pub struct CallSession {
    chat_id: i64,
    status: SessionStatus,
    current: Option<QueueEntry>,
}

impl CallSession {
    pub fn new(chat_id: i64) -> Self {
        Self {
            chat_id,
            status: SessionStatus::Idle,
            current: None,
        }
    }

    #[allow(dead_code)]
    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn current(&self) -> Option<&QueueEntry> {
        self.current.as_ref()
    }

    pub fn start(&mut self, entry: QueueEntry) -> Result<(), SessionError> {
        self.require(&[SessionStatus::Idle], "start")?;
        self.current = Some(entry);
        self.set(SessionStatus::Connecting);
        Ok(())
    }

    pub fn source_ready(&mut self) -> Result<(), SessionError> {
        self.require(&[SessionStatus::Connecting], "source_ready")?;
        self.set(SessionStatus::Playing);
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), SessionError> {
        self.require(&[SessionStatus::Playing], "pause")?;
        self.set(SessionStatus::Paused);
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), SessionError> {
        self.require(&[SessionStatus::Paused], "resume")?;
        self.set(SessionStatus::Playing);
        Ok(())
    }

    /// Terminó el track actual: pasa al siguiente o queda inactiva.
    pub fn end_of_track(&mut self, next: Option<QueueEntry>) -> Result<(), SessionError> {
        self.require(
            &[SessionStatus::Playing, SessionStatus::Paused, SessionStatus::Connecting],
            "end_of_track",
        )?;

        match next {
            Some(entry) => {
                self.current = Some(entry);
                self.set(SessionStatus::Connecting);
            }
            None => {
                self.current = None;
                self.set(SessionStatus::Idle);
            }
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.current = None;
        self.set(SessionStatus::Idle);
    }

    fn require(&self, allowed: &[SessionStatus], action: &'static str) -> Result<(), SessionError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                from: self.status,
                action,
            })
        }
    }

    fn set(&mut self, status: SessionStatus) {
        debug!("🔄 Chat {}: {:?} → {:?}", self.chat_id, self.status, status);
        self.status = status;
    }
}
