use crate::gateway::{GuildPreview, PublicData};
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// Cached public data for one guild
#[derive(Clone, Debug, Serialize)]
pub struct CachedPublicData {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<GuildPreview>,
    /// Unix millis
    pub fetched_at: i64,
}

impl CachedPublicData {
    pub fn new(data: PublicData) -> Self {
        Self {
            available: data.available,
            preview: data.preview,
            fetched_at: Utc::now().timestamp_millis(),
        }
    }
}

/// Per-guild public data plus the time of the last successful refresh run.
#[derive(Debug, Default)]
pub struct PublicDataCache {
    entries: DashMap<String, CachedPublicData>,
    /// Unix millis, 0 when no run has completed
    last_run: AtomicI64,
}

impl PublicDataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, guild_id: &str) -> Option<CachedPublicData> {
        self.entries.get(guild_id).map(|entry| entry.clone())
    }

    pub fn contains(&self, guild_id: &str) -> bool {
        self.entries.contains_key(guild_id)
    }

    pub fn insert(&self, data: PublicData) {
        let guild_id = data.guild_id.clone();
        self.entries.insert(guild_id, CachedPublicData::new(data));
    }

    /// Drop every cached entry. The last-run timestamp is kept.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Ids from `ids` with no cached entry, in input order.
    pub fn missing(&self, ids: &[String]) -> Vec<String> {
        ids.iter()
            .filter(|id| !self.contains(id))
            .cloned()
            .collect()
    }

    /// Copy of every cached entry keyed by guild id.
    pub fn entries(&self) -> HashMap<String, CachedPublicData> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn record_run(&self, at_ms: i64) {
        self.last_run.store(at_ms, Ordering::Relaxed);
    }

    pub fn last_run(&self) -> Option<i64> {
        match self.last_run.load(Ordering::Relaxed) {
            0 => None,
            at => Some(at),
        }
    }

    /// Newest of the last run and any entry's fetch time.
    pub fn last_activity(&self) -> Option<i64> {
        self.entries
            .iter()
            .map(|entry| entry.fetched_at)
            .chain(self.last_run())
            .max()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_activity() {
        let cache = PublicDataCache::new();
        assert_eq!(cache.last_activity(), None);

        cache.record_run(1_000);
        assert_eq!(cache.last_activity(), Some(1_000));

        cache.insert(PublicData::unavailable("1"));
        assert!(cache.last_activity().unwrap() > 1_000);
    }

    #[test]
    fn test_missing_preserves_order() {
        let cache = PublicDataCache::new();
        cache.insert(PublicData::unavailable("2"));

        let ids: Vec<String> = ["1", "2", "3"].iter().map(|s| s.to_string()).collect();
        assert_eq!(cache.missing(&ids), vec!["1".to_string(), "3".to_string()]);
    }

    #[test]
    fn test_clear_keeps_last_run() {
        let cache = PublicDataCache::new();
        assert_eq!(cache.last_run(), None);

        cache.insert(PublicData::unavailable("1"));
        cache.record_run(1_700_000_000_000);
        cache.clear();

        assert!(cache.is_empty());
        assert_eq!(cache.last_run(), Some(1_700_000_000_000));
    }
}
