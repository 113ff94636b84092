//! In-memory session store. Nothing here survives a restart.

use crate::models::UserSession;
use crate::services::metrics;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<DashMap<String, Arc<Mutex<UserSession>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, user_id: &str) -> Arc<Mutex<UserSession>> {
        self.inner
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(UserSession::new(Utc::now()))))
            .clone()
    }

    /// Lock the user's session, creating it if needed.
    ///
    /// Holding the guard serializes that user's requests; other users are not
    /// blocked. The map shard lock is released before awaiting.
    pub async fn lock(&self, user_id: &str) -> OwnedMutexGuard<UserSession> {
        let session = self.entry(user_id);
        let guard = session.lock_owned().await;
        metrics::set_active_sessions(self.inner.len());
        guard
    }

    /// Copy of the current session, if the user has one.
    pub async fn snapshot(&self, user_id: &str) -> Option<UserSession> {
        let session = self.inner.get(user_id).map(|s| s.value().clone())?;
        let guard = session.lock().await;
        Some(guard.clone())
    }

    pub async fn reset(&self, user_id: &str) {
        let mut guard = self.lock(user_id).await;
        guard.reset(Utc::now());
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Drop sessions idle for longer than `max_idle`. Sessions locked by an
    /// in-flight request are kept.
    pub fn purge_idle(&self, max_idle: Duration, now: DateTime<Utc>) -> usize {
        let before = self.inner.len();
        self.inner.retain(|_, session| match session.try_lock() {
            Ok(guard) => now - guard.updated_at <= max_idle,
            Err(_) => true,
        });
        let removed = before.saturating_sub(self.inner.len());
        metrics::set_active_sessions(self.inner.len());
        removed
    }

    /// Evict idle sessions once a minute until the process exits.
    pub fn spawn_eviction(&self, max_idle: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                let removed = store.purge_idle(max_idle, Utc::now());
                if removed > 0 {
                    tracing::info!(removed, remaining = store.len(), "Evicted idle sessions");
                }
            }
        })
    }
}
