use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tracing::{debug, info};

use crate::error::QueueError;
use crate::sources::TrackMetadata;

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub metadata: TrackMetadata,
    pub requested_by: i64,
    pub enqueued_at: DateTime<Utc>,
    pub want_video: bool,
}

impl QueueEntry {
    pub fn new(metadata: TrackMetadata, requested_by: i64, want_video: bool) -> Self {
        Self {
            metadata,
            requested_by,
            enqueued_at: Utc::now(),
            want_video,
        }
    }
}

/// Cola FIFO de un chat. Sin prioridades ni reordenamiento.
#[derive(Debug)]
pub struct PlaybackQueue {
    items: VecDeque<QueueEntry>,
    max_size: usize,
}

impl PlaybackQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
        }
    }

    /// Agrega al final y devuelve la posición (1 = siguiente en sonar)
    pub fn enqueue(&mut self, entry: QueueEntry) -> Result<usize, QueueError> {
        if self.items.len() >= self.max_size {
            return Err(QueueError::Full { max: self.max_size });
        }

        info!("➕ Agregado a la cola: {}", entry.metadata.title);
        self.items.push_back(entry);
        Ok(self.items.len())
    }

    /// Obtiene el siguiente track (FIFO - First In, First Out)
    pub fn pop_next(&mut self) -> Option<QueueEntry> {
        let next = self.items.pop_front();
        match &next {
            Some(entry) => debug!("➡️ Siguiente en cola: {}", entry.metadata.title),
            None => debug!("📭 Cola vacía, no hay siguiente track"),
        }
        next
    }

    #[allow(dead_code)]
    pub fn peek(&self) -> Option<&QueueEntry> {
        self.items.front()
    }

    /// Limpia la cola y devuelve cuántas entradas se descartaron
    pub fn clear(&mut self) -> usize {
        let removed = self.items.len();
        self.items.clear();
        if removed > 0 {
            info!("🗑️ Cola limpiada ({} canciones)", removed);
        }
        removed
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.items.iter()
    }

    #[allow(dead_code)]
    pub fn total_duration_secs(&self) -> u64 {
        self.items.iter().map(|e| e.metadata.duration_secs).sum()
    }
}

#[cfg(test)]
pub(crate) fn entry(id: &str) -> QueueEntry {
    QueueEntry::new(
        TrackMetadata {
            id: id.to_string(),
            title: format!("Track {}", id),
            duration_secs: 120,
            thumbnail_url: String::new(),
            source_link: format!("https://www.youtube.com/watch?v={}", id),
        },
        42,
        false,
    )
}
