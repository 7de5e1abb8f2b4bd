//! Bulk refresh of per-guild public data.
//!
//! Targets are fetched in small batches. Each batch is fanned out and joined,
//! then its results are recorded in order. A stop request ends the run between
//! batches: in-flight requests are never interrupted and their results are
//! kept. A rate limit ends it right away, skipping the rest of the batch.

use super::cache::PublicDataCache;
use super::cooldown::CooldownTimer;
use super::fetcher::{FetchError, ItemFetcher};
use crate::config::BatchSettings;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Orchestrator pacing
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub inter_batch_delay: Duration,
    pub refresh_cooldown: Duration,
    /// Used when a rate limit carries no retry-after hint
    pub rate_limit_cooldown: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::from(&BatchSettings::default())
    }
}

impl From<&BatchSettings> for BatchConfig {
    fn from(settings: &BatchSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            inter_batch_delay: settings.inter_batch_delay(),
            refresh_cooldown: Duration::from_secs(settings.refresh_cooldown_secs),
            rate_limit_cooldown: Duration::from_secs(settings.rate_limit_cooldown_secs),
        }
    }
}

/// Cooperative cancellation flag shared with whoever may stop the run.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Counters reported after each batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    pub with_data: usize,
    pub without_data: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RunOptions {
    /// Drop every cached entry and refetch all targets
    #[serde(default)]
    pub force_refresh: bool,
}

/// Outcome of one run. Abnormal endings are flags, never errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub nothing_to_do: bool,
    pub total: usize,
    pub completed: usize,
    pub with_data: usize,
    pub without_data: usize,
    pub errors: usize,
    pub stopped: bool,
    pub rate_limited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
    pub auth_expired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_secs: Option<u64>,
}

impl RunSummary {
    fn from_progress(progress: &BatchProgress) -> Self {
        Self {
            total: progress.total,
            completed: progress.completed,
            with_data: progress.with_data,
            without_data: progress.without_data,
            errors: progress.errors,
            ..Self::default()
        }
    }
}

type ProgressFn = Box<dyn Fn(&BatchProgress) + Send + Sync>;

/// Drives one user's refresh runs against an [`ItemFetcher`].
pub struct BatchOrchestrator {
    fetcher: Arc<dyn ItemFetcher>,
    cache: Arc<PublicDataCache>,
    config: BatchConfig,
    stop: StopHandle,
    cooldown: Option<CooldownTimer>,
    on_progress: Option<ProgressFn>,
}

impl std::fmt::Debug for BatchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOrchestrator")
            .field("config", &self.config)
            .field("cached", &self.cache.len())
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}

fn sanitize_retry_after(retry_after: Option<f64>) -> Option<f64> {
    retry_after.filter(|secs| secs.is_finite() && *secs >= 0.0)
}

impl BatchOrchestrator {
    pub fn new(
        fetcher: Arc<dyn ItemFetcher>,
        cache: Arc<PublicDataCache>,
        config: BatchConfig,
    ) -> Self {
        Self {
            fetcher,
            cache,
            config,
            stop: StopHandle::new(),
            cooldown: None,
            on_progress: None,
        }
    }

    /// Swap the fetcher, e.g. after the session's credentials were refreshed.
    pub fn set_fetcher(&mut self, fetcher: Arc<dyn ItemFetcher>) {
        self.fetcher = fetcher;
    }

    /// Share an externally owned stop flag.
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_progress<F>(mut self, on_progress: F) -> Self
    where
        F: Fn(&BatchProgress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Box::new(on_progress));
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn cache(&self) -> &Arc<PublicDataCache> {
        &self.cache
    }

    /// The active cooldown, if any.
    pub fn cooldown(&self) -> Option<&CooldownTimer> {
        self.cooldown.as_ref().filter(|timer| timer.is_active())
    }

    fn cooldown_secs(&self) -> Option<u64> {
        self.cooldown().map(CooldownTimer::remaining_secs)
    }

    /// Start a cooldown unless a longer one is already running.
    fn start_cooldown(&mut self, duration: Duration) {
        if let Some(current) = self.cooldown() {
            if current.remaining() >= duration {
                return;
            }
        }
        debug!(secs = duration.as_secs_f64(), "Cooldown started");
        self.cooldown = Some(CooldownTimer::start(duration));
    }

    fn report(&self, progress: &BatchProgress) {
        if let Some(on_progress) = &self.on_progress {
            on_progress(progress);
        }
    }

    /// Fetch public data for `guild_ids`.
    ///
    /// Without `force_refresh` only ids missing from the cache are fetched.
    pub async fn run(&mut self, guild_ids: &[String], options: RunOptions) -> RunSummary {
        self.stop.reset();

        let targets = if options.force_refresh {
            self.cache.clear();
            guild_ids.to_vec()
        } else {
            self.cache.missing(guild_ids)
        };

        if targets.is_empty() {
            debug!(requested = guild_ids.len(), "Refresh has nothing to do");
            return RunSummary {
                nothing_to_do: true,
                last_run_at: self.cache.last_run(),
                cooldown_secs: self.cooldown_secs(),
                ..RunSummary::default()
            };
        }

        let batch_size = self.config.batch_size.max(1);
        let batch_count = targets.len().div_ceil(batch_size);
        info!(
            targets = targets.len(),
            batches = batch_count,
            force = options.force_refresh,
            "Refresh run started"
        );

        let mut progress = BatchProgress {
            total: targets.len(),
            ..BatchProgress::default()
        };
        let mut stopped = false;
        let mut rate_limited = false;
        let mut retry_after = None;

        for (index, batch) in targets.chunks(batch_size).enumerate() {
            if self.stop.is_stopped() {
                stopped = true;
                break;
            }

            let fetcher = &self.fetcher;
            let results = join_all(batch.iter().map(|id| fetcher.fetch(id))).await;

            for (guild_id, result) in batch.iter().zip(results) {
                if rate_limited {
                    break;
                }

                match result {
                    Ok(data) => {
                        if data.available {
                            progress.with_data += 1;
                        } else {
                            progress.without_data += 1;
                        }
                        self.cache.insert(data);
                    }
                    Err(FetchError::Unauthorized) => {
                        warn!(guild_id = %guild_id, "Credentials rejected, aborting refresh run");
                        return RunSummary {
                            auth_expired: true,
                            ..RunSummary::from_progress(&progress)
                        };
                    }
                    Err(FetchError::RateLimited { retry_after: hint }) => {
                        rate_limited = true;
                        retry_after = sanitize_retry_after(hint);
                        warn!(guild_id = %guild_id, ?retry_after, "Refresh run rate limited");
                    }
                    Err(FetchError::Other(message)) => {
                        progress.errors += 1;
                        debug!(guild_id = %guild_id, error = %message, "Guild fetch failed");
                    }
                }
                progress.completed += 1;
            }

            self.report(&progress);

            if rate_limited {
                break;
            }
            if self.stop.is_stopped() {
                stopped = true;
                break;
            }
            if index + 1 < batch_count {
                tokio::time::sleep(self.config.inter_batch_delay).await;
            }
        }

        if rate_limited {
            let wait = retry_after
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .unwrap_or(self.config.rate_limit_cooldown);
            self.start_cooldown(wait);
        }

        let mut summary = RunSummary {
            stopped,
            rate_limited,
            retry_after,
            ..RunSummary::from_progress(&progress)
        };

        if progress.with_data + progress.without_data > 0 {
            let now = Utc::now().timestamp_millis();
            self.cache.record_run(now);
            self.start_cooldown(self.config.refresh_cooldown);
            summary.last_run_at = Some(now);
        } else {
            summary.last_run_at = self.cache.last_run();
        }
        summary.cooldown_secs = self.cooldown_secs();

        info!(
            completed = summary.completed,
            with_data = summary.with_data,
            without_data = summary.without_data,
            errors = summary.errors,
            stopped,
            rate_limited,
            "Refresh run finished"
        );
        summary
    }
}
