use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    audio::{
        queue::{PlaybackQueue, QueueEntry},
        session::{CallSession, SessionStatus},
    },
    call::CallTransport,
    error::SessionError,
    sources::SourceFetcher,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    /// La sesión estaba inactiva y empezó con este track.
    Started,
    /// Quedó en cola en esta posición.
    Queued(usize),
}

/// Estado por chat. La cola usa un lock corto; la sesión un `Mutex` de tokio
/// que serializa los avances del chat.
struct ChatSlot {
    queue: parking_lot::Mutex<PlaybackQueue>,
    state: Mutex<SlotState>,
    shutdown: CancellationToken,
}

struct SlotState {
    session: CallSession,
    // Cada carga recibe un epoch; una carga vieja no puede pisar a una nueva
    epoch: u64,
    in_flight: Option<CancellationToken>,
    // El slot ya salió del mapa: quien lo tenga debe pedir uno nuevo
    retired: bool,
}

impl SlotState {
    fn issue(&mut self, parent: &CancellationToken, entry: QueueEntry) -> Ticket {
        if let Some(previous) = self.in_flight.take() {
            previous.cancel();
        }
        self.epoch += 1;
        let token = parent.child_token();
        self.in_flight = Some(token.clone());
        Ticket {
            epoch: self.epoch,
            entry,
            token,
        }
    }
}

/// Carga pendiente de un track: obtener la fuente y entregarla a la llamada.
struct Ticket {
    epoch: u64,
    entry: QueueEntry,
    token: CancellationToken,
}

/// Orquesta colas, sesiones y transporte para todos los chats.
///
/// No hay lock global: cada chat tiene su propio slot y las fallas de un chat
/// no afectan a los demás.
pub struct SessionManager {
    fetcher: Arc<SourceFetcher>,
    transport: Arc<dyn CallTransport>,
    max_queue_size: usize,
    slots: DashMap<i64, Arc<ChatSlot>>,
}

impl SessionManager {
    pub fn new(fetcher: Arc<SourceFetcher>, transport: Arc<dyn CallTransport>, max_queue_size: usize) -> Self {
        Self {
            fetcher,
            transport,
            max_queue_size,
            slots: DashMap::new(),
        }
    }

    pub fn fetcher(&self) -> &Arc<SourceFetcher> {
        &self.fetcher
    }

    /// Encola `entry` y, si la llamada estaba inactiva, empieza a reproducir.
    ///
    /// Si el track pedido no se puede obtener se intenta con el siguiente de la
    /// cola y el error se devuelve a quien lo pidió.
    pub async fn play(&self, chat_id: i64, entry: QueueEntry) -> Result<PlayOutcome> {
        let (slot, ticket) = loop {
            let slot = self.slot(chat_id);
            let mut state = slot.state.lock().await;
            if state.retired {
                continue;
            }
            let position = slot.queue.lock().enqueue(entry)?;

            if state.session.status() != SessionStatus::Idle {
                info!("📝 Chat {}: en cola en posición {}", chat_id, position);
                return Ok(PlayOutcome::Queued(position));
            }

            let Some(next) = slot.queue.lock().pop_next() else {
                return Ok(PlayOutcome::Queued(position));
            };
            state.session.start(next.clone())?;
            let ticket = state.issue(&slot.shutdown, next);
            drop(state);
            break (slot, ticket);
        };

        match self.drive(chat_id, &slot, ticket).await {
            Some(err) => Err(err),
            None => Ok(PlayOutcome::Started),
        }
    }

    /// El track actual terminó: sigue con la cola o sale de la llamada.
    pub async fn end_of_track(&self, chat_id: i64) -> Result<Option<QueueEntry>> {
        let Some(slot) = self.existing(chat_id) else {
            debug!("Fin de track en chat {} sin sesión", chat_id);
            return Ok(None);
        };

        let ticket = {
            let mut state = slot.state.lock().await;
            if state.session.status() == SessionStatus::Idle {
                return Ok(None);
            }
            self.next_ticket(chat_id, &slot, &mut state).await?
        };

        if let Some(ticket) = ticket {
            if let Some(err) = self.drive(chat_id, &slot, ticket).await {
                warn!("❌ Chat {}: {:#}", chat_id, err);
            }
        }
        Ok(self.now_playing(chat_id).await)
    }

    pub async fn skip(&self, chat_id: i64) -> Result<Option<QueueEntry>> {
        info!("⏭️ Saltando track en chat {}", chat_id);
        self.end_of_track(chat_id).await
    }

    pub async fn pause(&self, chat_id: i64) -> Result<()> {
        let slot = self.existing(chat_id).ok_or(SessionError::NoSession(chat_id))?;
        let mut state = slot.state.lock().await;

        let mut next = state.session.clone();
        next.pause()?;
        self.transport.pause(chat_id).await?;
        state.session = next;

        info!("⏸️ Pausado en chat {}", chat_id);
        Ok(())
    }

    pub async fn resume(&self, chat_id: i64) -> Result<()> {
        let slot = self.existing(chat_id).ok_or(SessionError::NoSession(chat_id))?;
        let mut state = slot.state.lock().await;

        let mut next = state.session.clone();
        next.resume()?;
        self.transport.resume(chat_id).await?;
        state.session = next;

        info!("▶️ Reanudado en chat {}", chat_id);
        Ok(())
    }

    /// Cancela la carga en curso, vacía la cola y sale de la llamada.
    pub async fn stop(&self, chat_id: i64) -> Result<()> {
        let Some((_, slot)) = self.slots.remove(&chat_id) else {
            return Ok(());
        };

        slot.shutdown.cancel();
        {
            let mut state = slot.state.lock().await;
            state.retired = true;
            state.session.stop();
            state.in_flight = None;
            slot.queue.lock().clear();
        }

        info!("⏹️ Detenido en chat {}", chat_id);
        self.transport.leave(chat_id).await
    }

    pub async fn status(&self, chat_id: i64) -> SessionStatus {
        match self.existing(chat_id) {
            Some(slot) => slot.state.lock().await.session.status(),
            None => SessionStatus::Idle,
        }
    }

    pub async fn now_playing(&self, chat_id: i64) -> Option<QueueEntry> {
        let slot = self.existing(chat_id)?;
        let state = slot.state.lock().await;
        state.session.current().cloned()
    }

    #[allow(dead_code)]
    pub fn queue_snapshot(&self, chat_id: i64) -> Vec<QueueEntry> {
        self.existing(chat_id)
            .map(|slot| slot.queue.lock().entries().cloned().collect())
            .unwrap_or_default()
    }

    /// Chats con una sesión que no está inactiva.
    pub async fn active_chats(&self) -> Vec<i64> {
        let slots: Vec<(i64, Arc<ChatSlot>)> = self
            .slots
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut active = Vec::new();
        for (chat_id, slot) in slots {
            if slot.state.lock().await.session.status() != SessionStatus::Idle {
                active.push(chat_id);
            }
        }
        active.sort_unstable();
        active
    }

    fn slot(&self, chat_id: i64) -> Arc<ChatSlot> {
        self.slots
            .entry(chat_id)
            .or_insert_with(|| {
                Arc::new(ChatSlot {
                    queue: parking_lot::Mutex::new(PlaybackQueue::new(self.max_queue_size)),
                    state: Mutex::new(SlotState {
                        session: CallSession::new(chat_id),
                        epoch: 0,
                        in_flight: None,
                        retired: false,
                    }),
                    shutdown: CancellationToken::new(),
                })
            })
            .clone()
    }

    fn existing(&self, chat_id: i64) -> Option<Arc<ChatSlot>> {
        self.slots.get(&chat_id).map(|slot| slot.clone())
    }

    /// Avanza la sesión al siguiente de la cola. Con la cola vacía queda
    /// inactiva, sale de la llamada y el slot se descarta.
    async fn next_ticket(&self, chat_id: i64, slot: &ChatSlot, state: &mut SlotState) -> Result<Option<Ticket>> {
        let next = slot.queue.lock().pop_next();
        state.session.end_of_track(next.clone())?;

        match next {
            Some(entry) => Ok(Some(state.issue(&slot.shutdown, entry))),
            None => {
                if let Some(previous) = state.in_flight.take() {
                    previous.cancel();
                }
                info!("📭 Cola vacía en chat {}, saliendo de la llamada", chat_id);
                if let Err(e) = self.transport.leave(chat_id).await {
                    warn!("❌ Error al salir de la llamada en chat {}: {:#}", chat_id, e);
                }
                self.retire(chat_id, slot, state);
                Ok(None)
            }
        }
    }

    /// Saca el slot del mapa con su lock de estado tomado. Si un `stop` y un
    /// `play` concurrentes ya lo reemplazaron, el slot nuevo no se toca.
    fn retire(&self, chat_id: i64, slot: &ChatSlot, state: &mut SlotState) {
        state.retired = true;
        let removed = self
            .slots
            .remove_if(&chat_id, |_, current| std::ptr::eq(Arc::as_ptr(current), slot))
            .is_some();
        if removed {
            debug!("🧹 Sesión del chat {} descartada", chat_id);
        }
    }

    /// Carga tickets hasta que uno suena, la cola se agota o alguien más
    /// avanzó la sesión. Devuelve el primer error encontrado.
    async fn drive(&self, chat_id: i64, slot: &ChatSlot, mut ticket: Ticket) -> Option<anyhow::Error> {
        let mut first_error = None;

        loop {
            let err = match self.load(chat_id, slot, &ticket).await {
                Ok(()) => break,
                Err(e) => e,
            };
            warn!("❌ No se pudo reproducir {} en chat {}: {:#}", ticket.entry.metadata.title, chat_id, err);
            first_error.get_or_insert(err);

            let mut state = slot.state.lock().await;
            if state.epoch != ticket.epoch {
                break;
            }
            match self.next_ticket(chat_id, slot, &mut state).await {
                Ok(Some(next)) => ticket = next,
                Ok(None) => break,
                Err(e) => {
                    warn!("❌ Chat {}: {}", chat_id, e);
                    break;
                }
            }
        }

        first_error
    }

    async fn load(&self, chat_id: i64, slot: &ChatSlot, ticket: &Ticket) -> Result<()> {
        let metadata = &ticket.entry.metadata;
        let source = tokio::select! {
            _ = ticket.token.cancelled() => {
                debug!("🚫 Carga de {} cancelada en chat {}", metadata.id, chat_id);
                return Ok(());
            }
            result = self.fetcher.fetch(&metadata.id, ticket.entry.want_video) => result?,
        };

        let mut state = slot.state.lock().await;
        if state.epoch != ticket.epoch || ticket.token.is_cancelled() {
            debug!("Carga de {} descartada, la sesión ya avanzó", metadata.id);
            return Ok(());
        }

        self.transport.play(chat_id, source).await?;
        state.session.source_ready()?;
        state.in_flight = None;

        info!("🎵 Reproduciendo en chat {}: {} ({})", chat_id, metadata.title, metadata.duration_label());
        Ok(())
    }
}
