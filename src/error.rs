use std::time::Duration;
use thiserror::Error;

/// Errores de resolución y obtención de medios.
///
/// `Clone` es necesario porque un mismo fetch en vuelo entrega su resultado
/// a todos los chats que lo esperan.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    #[error("no se encontraron resultados para: {0}")]
    NotFound(String),

    #[error("no se pudo obtener {id}: todos los métodos fallaron ({})", attempts.join("; "))]
    Fetch { id: String, attempts: Vec<String> },

    #[error("la extracción superó el límite de {}", humantime::format_duration(*limit))]
    Timeout { limit: Duration },

    #[error("enlace no soportado: {0}")]
    UnsupportedLink(String),

    #[error("el archivo pesa {size_mb:.2} MB y supera el límite de {limit_mb} MB")]
    SizeLimitExceeded { size_mb: f64, limit_mb: u64 },
}

impl SourceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SourceError::NotFound(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("la cola está llena (máximo {max} canciones)")]
    Full { max: usize },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("transición inválida: no se puede {action} en estado {from:?}")]
    InvalidTransition {
        from: crate::audio::session::SessionStatus,
        action: &'static str,
    },

    #[error("no hay sesión activa en el chat {0}")]
    NoSession(i64),
}
