use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::player::SessionManager;
use crate::call::CallEvent;

/// Reenvía los eventos del transporte al [`SessionManager`] hasta `shutdown`.
pub fn spawn_dispatcher(
    events: flume::Receiver<CallEvent>,
    manager: Arc<SessionManager>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv_async() => match event {
                    Ok(event) => event,
                    Err(_) => {
                        warn!("📡 Canal de eventos cerrado");
                        break;
                    }
                },
            };

            // Cada evento en su propia tarea: un chat lento no frena a los demás
            let manager = manager.clone();
            tokio::spawn(async move { handle_event(&manager, event).await });
        }
        debug!("Despachador de eventos detenido");
    })
}

pub async fn handle_event(manager: &SessionManager, event: CallEvent) {
    match event {
        CallEvent::StreamEnded { chat_id } => {
            info!("🎵 Stream terminó en chat {}", chat_id);
            if let Err(e) = manager.end_of_track(chat_id).await {
                error!("Error al reproducir siguiente track en chat {}: {:#}", chat_id, e);
            }
        }
        CallEvent::Closed { chat_id } => {
            warn!("🔌 Llamada cerrada en chat {}", chat_id);
            if let Err(e) = manager.stop(chat_id).await {
                error!("Error al detener chat {}: {:#}", chat_id, e);
            }
        }
        CallEvent::Error { chat_id, message } => {
            error!("❌ Error de llamada en chat {}: {}", chat_id, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{queue::entry, session::SessionStatus};
    use crate::call::MockCallTransport;
    use crate::sources::tiers::{CacheTier, FetchTier};
    use crate::sources::{store::LocalStore, SourceFetcher};
    use std::time::Duration;

    fn manager(transport: MockCallTransport, downloads: &std::path::Path) -> Arc<SessionManager> {
        let tiers: Vec<Arc<dyn FetchTier>> = vec![Arc::new(CacheTier::new(LocalStore::new(downloads)))];
        Arc::new(SessionManager::new(
            Arc::new(SourceFetcher::with_tiers(tiers)),
            Arc::new(transport),
            10,
        ))
    }

    #[tokio::test]
    async fn stream_end_advances_and_close_stops() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.mp3"), b"a").unwrap();
        std::fs::write(dir.path().join("b.mp3"), b"b").unwrap();

        let mut transport = MockCallTransport::new();
        transport.expect_play().times(2).returning(|_, _| Ok(()));
        transport.expect_leave().times(1).returning(|_| Ok(()));

        let manager = manager(transport, dir.path());
        manager.play(5, entry("a")).await.unwrap();
        manager.play(5, entry("b")).await.unwrap();

        handle_event(&manager, CallEvent::StreamEnded { chat_id: 5 }).await;
        assert_eq!(manager.now_playing(5).await.unwrap().metadata.id, "b");

        handle_event(&manager, CallEvent::Error { chat_id: 5, message: "glitch".into() }).await;
        assert_eq!(manager.status(5).await, SessionStatus::Playing);

        handle_event(&manager, CallEvent::Closed { chat_id: 5 }).await;
        assert_eq!(manager.status(5).await, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn dispatcher_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = flume::unbounded();
        let shutdown = CancellationToken::new();

        let handle = spawn_dispatcher(rx, manager(MockCallTransport::new(), dir.path()), shutdown.clone());
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
