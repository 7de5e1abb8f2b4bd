use crate::batch::{
    BatchConfig, BatchOrchestrator, ItemFetcher, PublicDataCache, StopHandle,
};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Per-user refresh state kept across requests
pub struct RefreshRegistry {
    config: BatchConfig,
    caches: DashMap<String, Arc<PublicDataCache>>,
    stops: DashMap<String, StopHandle>,
    orchestrators: DashMap<String, Arc<Mutex<BatchOrchestrator>>>,
}

impl std::fmt::Debug for RefreshRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshRegistry")
            .field("config", &self.config)
            .field("users", &self.caches.len())
            .finish()
    }
}

impl RefreshRegistry {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            caches: DashMap::new(),
            stops: DashMap::new(),
            orchestrators: DashMap::new(),
        }
    }

    /// Public data cache for a user
    pub fn cache_for(&self, user_id: &str) -> Arc<PublicDataCache> {
        self.caches
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(PublicDataCache::new()))
            .clone()
    }

    fn stop_handle_for(&self, user_id: &str) -> StopHandle {
        self.stops
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    /// The user's orchestrator, running on `fetcher`.
    ///
    /// Lock it for the duration of a run; a failed `try_lock` means a run is
    /// already in progress.
    pub fn orchestrator_for(
        &self,
        user_id: &str,
        fetcher: Arc<dyn ItemFetcher>,
    ) -> Arc<Mutex<BatchOrchestrator>> {
        if let Some(existing) = self.orchestrators.get(user_id) {
            return existing.clone();
        }

        let cache = self.cache_for(user_id);
        let stop = self.stop_handle_for(user_id);
        self.orchestrators
            .entry(user_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(
                    BatchOrchestrator::new(fetcher, cache, self.config.clone())
                        .with_stop_handle(stop),
                ))
            })
            .clone()
    }

    /// Seconds left on the user's cooldown. `None` while a run holds the
    /// orchestrator or no cooldown is active.
    pub fn cooldown_secs(&self, user_id: &str) -> Option<u64> {
        let orchestrator = self.orchestrators.get(user_id)?.clone();
        let guard = orchestrator.try_lock().ok()?;
        guard.cooldown().map(|timer| timer.remaining_secs())
    }

    /// Forget users with no activity since `max_idle` before `now_ms`.
    ///
    /// A user whose orchestrator is running, cooling down, or held by a
    /// request is kept, as is a cache still referenced elsewhere.
    pub fn evict_idle(&self, max_idle: Duration, now_ms: i64) -> usize {
        let cutoff = now_ms.saturating_sub(max_idle.as_millis() as i64);
        let candidates: Vec<String> = self
            .caches
            .iter()
            .filter(|entry| entry.value().last_activity().map_or(true, |at| at < cutoff))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for user_id in candidates {
            if self.orchestrators.contains_key(&user_id) {
                let removed = self.orchestrators.remove_if(&user_id, |_, orchestrator| {
                    Arc::strong_count(orchestrator) == 1
                        && orchestrator
                            .try_lock()
                            .map(|guard| guard.cooldown().is_none())
                            .unwrap_or(false)
                });
                if removed.is_none() {
                    continue;
                }
            }

            if self
                .caches
                .remove_if(&user_id, |_, cache| Arc::strong_count(cache) == 1)
                .is_some()
            {
                self.stops.remove(&user_id);
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!(evicted, users = self.caches.len(), "Idle refresh state evicted");
        }
        evicted
    }

    /// Request a cooperative stop of the user's run. Returns false when the
    /// user never started one.
    pub fn stop(&self, user_id: &str) -> bool {
        match self.stops.get(user_id) {
            Some(stop) => {
                stop.stop();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::FetchError;
    use crate::gateway::PublicData;
    use async_trait::async_trait;

    struct Unavailable;

    #[async_trait]
    impl ItemFetcher for Unavailable {
        async fn fetch(&self, guild_id: &str) -> Result<PublicData, FetchError> {
            Ok(PublicData::unavailable(guild_id))
        }
    }

    #[tokio::test]
    async fn test_orchestrator_shares_user_cache() {
        let registry = RefreshRegistry::new(BatchConfig::default());
        assert!(!registry.stop("42"));

        let orchestrator = registry.orchestrator_for("42", Arc::new(Unavailable));
        let again = registry.orchestrator_for("42", Arc::new(Unavailable));
        assert!(Arc::ptr_eq(&orchestrator, &again));

        let summary = orchestrator
            .lock()
            .await
            .run(&["1".to_string()], Default::default())
            .await;
        assert_eq!(summary.without_data, 1);
        assert!(registry.cache_for("42").contains("1"));
        assert!(registry.cache_for("7").is_empty());
        assert!(registry.stop("42"));
    }

    fn no_cooldown() -> BatchConfig {
        BatchConfig {
            refresh_cooldown: Duration::ZERO,
            ..BatchConfig::default()
        }
    }

    #[tokio::test]
    async fn test_idle_users_evicted() {
        let registry = RefreshRegistry::new(no_cooldown());
        registry.cache_for("7");

        let orchestrator = registry.orchestrator_for("42", Arc::new(Unavailable));
        orchestrator
            .lock()
            .await
            .run(&["1".to_string()], Default::default())
            .await;
        drop(orchestrator);

        let held = registry.orchestrator_for("9", Arc::new(Unavailable));

        let now = chrono::Utc::now().timestamp_millis();
        let max_idle = Duration::from_secs(600);
        // Only the empty cache has nothing recent
        assert_eq!(registry.evict_idle(max_idle, now), 1);
        assert!(!registry.caches.contains_key("7"));

        let later = now + 3_600_000;
        assert_eq!(registry.evict_idle(max_idle, later), 1);
        assert!(!registry.stop("42"));
        assert!(registry.cache_for("42").is_empty());

        // Still referenced by a request
        assert!(registry.stop("9"));
        drop(held);
        assert_eq!(registry.evict_idle(max_idle, later), 2);
    }

    #[tokio::test]
    async fn test_cooldown_keeps_user_and_is_reported() {
        let registry = RefreshRegistry::new(BatchConfig::default());
        assert_eq!(registry.cooldown_secs("42"), None);

        let orchestrator = registry.orchestrator_for("42", Arc::new(Unavailable));
        orchestrator
            .lock()
            .await
            .run(&["1".to_string()], Default::default())
            .await;
        drop(orchestrator);

        assert!(registry.cooldown_secs("42").is_some_and(|secs| secs > 0));
        let later = chrono::Utc::now().timestamp_millis() + 3_600_000;
        assert_eq!(registry.evict_idle(Duration::from_secs(600), later), 0);
    }

    #[tokio::test]
    async fn test_running_orchestrator_is_exclusive() {
        let registry = RefreshRegistry::new(BatchConfig::default());
        let orchestrator = registry.orchestrator_for("42", Arc::new(Unavailable));
        let _guard = orchestrator.lock().await;
        assert!(registry
            .orchestrator_for("42", Arc::new(Unavailable))
            .try_lock()
            .is_err());
    }
}
