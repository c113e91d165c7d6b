use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::protocol::Playlist;

/// Last known-good schedule and when it was fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fetched_at: DateTime<Utc>,
    pub payload: Playlist,
}

impl CacheEntry {
    pub fn new(fetched_at: DateTime<Utc>, payload: Playlist) -> Self {
        Self { fetched_at, payload }
    }
}

/// `now - fetched_at < max_age`.  An entry stamped in the future (clock
/// stepped back) counts as fresh.
pub fn is_fresh(entry: &CacheEntry, max_age: Duration, now: DateTime<Utc>) -> bool {
    let age = now.signed_duration_since(entry.fetched_at);
    match age.to_std() {
        Ok(age) => age < max_age,
        Err(_) => true,
    }
}

/// Owns the schedule.  Writers swap the whole entry; readers get an `Arc`
/// snapshot, so nobody ever sees a half-written schedule.
pub struct ScheduleStore {
    entry: RwLock<Option<Arc<CacheEntry>>>,
    cache_file: Option<PathBuf>,
}

impl ScheduleStore {
    /// Purely in-memory store.
    pub fn in_memory() -> Self {
        Self {
            entry: RwLock::new(None),
            cache_file: None,
        }
    }

    /// Store backed by a JSON file.  Whatever the file holds is loaded now;
    /// a missing or corrupt file just means an empty cache.
    pub fn with_cache_file(cache_file: PathBuf) -> Self {
        let entry = Self::load_cache_file(&cache_file).map(Arc::new);
        if let Some(e) = entry.as_ref() {
            info!(
                "store: loaded cached schedule ({} items, fetched {})",
                e.payload.len(),
                e.fetched_at
            );
        }
        Self {
            entry: RwLock::new(entry),
            cache_file: Some(cache_file),
        }
    }

    pub async fn read(&self) -> Option<Arc<CacheEntry>> {
        self.entry.read().await.clone()
    }

    /// Replace the stored entry.  Persistence is best-effort: the in-memory
    /// swap has already happened when the file write is attempted.
    pub async fn write(&self, entry: CacheEntry) {
        let entry = Arc::new(entry);
        {
            let mut guard = self.entry.write().await;
            *guard = Some(Arc::clone(&entry));
        }
        debug!(
            "store: replaced schedule ({} items, fetched {})",
            entry.payload.len(),
            entry.fetched_at
        );

        if let Some(path) = self.cache_file.as_ref() {
            if let Err(e) = Self::save_cache_file(path, &entry).await {
                warn!("store: failed to persist cache to {}: {}", path.display(), e);
            }
        }
    }

    async fn save_cache_file(path: &Path, entry: &CacheEntry) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(entry)?;
        // Write-then-rename so a crash never leaves a truncated cache.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    fn load_cache_file(path: &Path) -> Option<CacheEntry> {
        let content = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str::<CacheEntry>(&content) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("store: ignoring unreadable cache {}: {}", path.display(), e);
                None
            }
        }
    }
}
