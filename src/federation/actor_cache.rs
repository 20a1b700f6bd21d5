//! Remote actor caching
//!
//! Caches fetched actor documents so that signature checks and deliveries
//! to the same peer do not refetch the actor every time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::types::Actor;

/// Cached actor entry
#[derive(Debug, Clone)]
struct CachedActor {
    actor: Actor,
    /// When this entry was cached
    cached_at: Instant,
}

/// Actor document cache
///
/// Thread-safe, bounded by both TTL and entry count.
#[derive(Debug, Clone)]
pub struct ActorCache {
    /// Cache storage: actor ID -> cached document
    cache: Arc<RwLock<HashMap<String, CachedActor>>>,
    ttl: Duration,
    capacity: usize,
}

impl ActorCache {
    /// Create new actor cache
    ///
    /// # Arguments
    /// * `ttl` - How long an entry is served before refetching
    /// * `capacity` - Maximum entries; zero disables caching
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            capacity,
        }
    }

    /// Get a cached actor if present and fresh
    pub async fn get(&self, actor_id: &str) -> Option<Actor> {
        let cache = self.cache.read().await;
        match cache.get(actor_id) {
            Some(cached) if cached.cached_at.elapsed() < self.ttl => {
                tracing::debug!("Actor cache hit for {}", actor_id);
                Some(cached.actor.clone())
            }
            Some(_) => {
                tracing::debug!("Actor cache expired for {}", actor_id);
                None
            }
            None => None,
        }
    }

    /// Insert or refresh an entry
    ///
    /// When full, expired entries are dropped first, then the oldest one.
    pub async fn insert(&self, actor_id: &str, actor: Actor) {
        if self.capacity == 0 {
            return;
        }

        let mut cache = self.cache.write().await;
        if cache.len() >= self.capacity && !cache.contains_key(actor_id) {
            let ttl = self.ttl;
            cache.retain(|_, v| v.cached_at.elapsed() < ttl);

            if cache.len() >= self.capacity {
                let oldest = cache
                    .iter()
                    .min_by_key(|(_, v)| v.cached_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    cache.remove(&oldest);
                }
            }
        }

        cache.insert(
            actor_id.to_string(),
            CachedActor {
                actor,
                cached_at: Instant::now(),
            },
        );
    }

    /// Invalidate a cached actor
    pub async fn invalidate(&self, actor_id: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(actor_id);
        tracing::debug!("Invalidated actor cache for {}", actor_id);
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.cache.read().await.len()
    }
}
