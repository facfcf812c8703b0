//! In-memory session store.
//!
//! Reference implementation of [`SessionStore`], used by the test suites and
//! suitable for single-process deployments. TTLs are enforced lazily on read.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use super::{SessionStore, StoredSession};
use crate::SessionResult;

struct Entry {
    value: StoredSession,
    expires_at: Option<OffsetDateTime>,
}

/// A [`SessionStore`] backed by a process-local map.
#[derive(Default)]
pub struct MemorySessionStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemorySessionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) entries.
    pub async fn len(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.expires_at.is_none_or(|at| at > now))
            .count()
    }

    /// Returns `true` when no live entries remain.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, id: &str) -> SessionResult<Option<StoredSession>> {
        let entries = self.entries.read().await;
        Ok(entries.get(id).and_then(|entry| {
            let live = entry
                .expires_at
                .is_none_or(|at| at > OffsetDateTime::now_utc());
            live.then(|| entry.value.clone())
        }))
    }

    async fn set(
        &self,
        id: &str,
        value: StoredSession,
        ttl: Option<Duration>,
    ) -> SessionResult<()> {
        let expires_at = ttl.map(|ttl| OffsetDateTime::now_utc() + ttl);
        self.entries
            .write()
            .await
            .insert(id.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn destroy(&self, id: &str) -> SessionResult<()> {
        self.entries.write().await.remove(id);
        Ok(())
    }
}
