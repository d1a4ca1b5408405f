use dashmap::DashMap;
use std::{
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::debug;

/// Entrada de caché con TTL opcional
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    // Orden de inserción, para desalojar la más antigua
    seq: u64,
    ttl: Option<Duration>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self) -> bool {
        self.ttl.is_some_and(|ttl| self.inserted_at.elapsed() > ttl)
    }
}

/// Caché acotada sobre `DashMap`.
///
/// Al llegar a `capacity` se desaloja la entrada insertada hace más tiempo.
/// Las entradas vencidas se descartan al leerlas o en `cleanup_expired`.
#[derive(Debug)]
pub struct LRUCache<K: Clone + Eq + Hash, V> {
    data: Arc<DashMap<K, CacheEntry<V>>>,
    capacity: usize,
    default_ttl: Option<Duration>,
    next_seq: Arc<AtomicU64>,
}

impl<K, V> LRUCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
            default_ttl: None,
            next_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_ttl(capacity: usize, ttl: Duration) -> Self {
        Self {
            default_ttl: Some(ttl),
            ..Self::new(capacity)
        }
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.insert_with_ttl(key, value, self.default_ttl)
    }

    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Option<Duration>) -> Option<V> {
        if !self.data.contains_key(&key) && self.data.len() >= self.capacity {
            self.evict_oldest();
        }

        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            ttl,
        };
        self.data.insert(key, entry).map(|old| old.value)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.data.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.data.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[allow(dead_code)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Limpia entradas expiradas y retorna el número de elementos removidos
    pub fn cleanup_expired(&self) -> usize {
        let before = self.data.len();
        self.data.retain(|_, entry| !entry.is_expired());
        let removed = before.saturating_sub(self.data.len());

        if removed > 0 {
            debug!("Limpiadas {} entradas expiradas del cache", removed);
        }
        removed
    }

    fn evict_oldest(&self) {
        let oldest = self
            .data
            .iter()
            .min_by_key(|entry| entry.value().seq)
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            self.data.remove(&key);
        }
    }
}

impl<K, V> Clone for LRUCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            capacity: self.capacity,
            default_ttl: self.default_ttl,
            next_seq: self.next_seq.clone(),
        }
    }
}
