//! Cached read-through view of the backend's live-session list

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::backend::Backend;
use crate::metrics::{self, Metrics};
use crate::types::Session;

#[derive(Default)]
struct Cache {
    sessions: Vec<Session>,
    fetched_at: Option<Instant>,
}

/// Cached client for the live-session list.
///
/// A fetch that returns an empty list never overwrites a non-empty cache;
/// an empty reply from the backend is more likely a transient failure than
/// every session disappearing at once.
pub struct SessionClient<B: Backend> {
    backend: Arc<B>,
    cache_ttl: Duration,
    cache: Mutex<Cache>,
    metrics: Arc<Metrics>,
}

impl<B: Backend> SessionClient<B> {
    /// Create a client over `backend` caching results for `cache_ttl`.
    pub fn new(backend: Arc<B>, cache_ttl: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            backend,
            cache_ttl,
            cache: Mutex::new(Cache::default()),
            metrics,
        }
    }

    /// Fetch the live-session list straight from the backend, bypassing the
    /// cache. A failed fetch is logged and returned as an empty list.
    pub async fn fetch_live(&self) -> Vec<Session> {
        match self.backend.fetch_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                log::error!("Failed to fetch sessions: {e}");
                Vec::new()
            }
        }
    }

    /// Cached live-session list. Returns the cached value when it is fresh
    /// and non-empty, otherwise refetches.
    pub async fn list(&self) -> Vec<Session> {
        {
            let cache = self.cache.lock();
            if let Some(at) = cache.fetched_at
                && at.elapsed() < self.cache_ttl
                && !cache.sessions.is_empty()
            {
                self.metrics.inc(metrics::CACHE_HITS);
                return cache.sessions.clone();
            }
        }

        self.metrics.inc(metrics::CACHE_MISSES);
        let sessions = self.fetch_live().await;
        if !sessions.is_empty() {
            let mut cache = self.cache.lock();
            cache.sessions = sessions.clone();
            cache.fetched_at = Some(Instant::now());
        }
        sessions
    }

    /// Force the next [`SessionClient::list`] call to refetch.
    pub fn invalidate(&self) {
        self.cache.lock().fetched_at = None;
    }
}
