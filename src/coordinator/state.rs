//! Admission state machine.
//!
//! Everything here is synchronous and owned by exactly one actor task, so no
//! locking is needed. Callers hand in a reply channel; a grant is delivered
//! either immediately or later when capacity frees up.

use crate::config::CoordinatorSettings;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

/// Wait hint returned when the reset time is unknown or already past.
const FALLBACK_WAIT_MS: u64 = 1_000;

/// Coordinator policy
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub reserve_buffer: i64,
    pub queue_timeout: Duration,
    pub max_queue_size: usize,
    pub default_limit: i64,
    pub staleness_ms: i64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&CoordinatorSettings::default())
    }
}

impl From<&CoordinatorSettings> for CoordinatorConfig {
    fn from(settings: &CoordinatorSettings) -> Self {
        Self {
            reserve_buffer: settings.reserve_buffer,
            queue_timeout: Duration::from_millis(settings.queue_timeout_ms),
            max_queue_size: settings.max_queue_size,
            default_limit: settings.default_limit,
            staleness_ms: settings.staleness_ms as i64,
        }
    }
}

/// Live view of the provider's quota.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitState {
    pub limit: i64,
    /// As last reported; may be negative, consumers clamp
    pub remaining: i64,
    /// Unix seconds, 0 when unknown
    pub reset_at: f64,
    pub reset_after: f64,
    pub bucket: Option<String>,
    pub is_global: bool,
    pub scope: Option<String>,
    /// Unix millis, 0 when never updated
    pub last_updated: i64,
    pub active_requests: i64,
}

impl RateLimitState {
    fn initial(default_limit: i64) -> Self {
        Self {
            limit: default_limit,
            remaining: default_limit,
            reset_at: 0.0,
            reset_after: 0.0,
            bucket: None,
            is_global: false,
            scope: None,
            last_updated: 0,
            active_requests: 0,
        }
    }
}

/// Raw rate-limit header values from one provider response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitHeaders {
    pub limit: Option<String>,
    pub remaining: Option<String>,
    pub reset: Option<String>,
    #[serde(rename = "reset-after")]
    pub reset_after: Option<String>,
    pub bucket: Option<String>,
    pub global: Option<String>,
    pub scope: Option<String>,
}

impl RateLimitHeaders {
    /// Pull the `x-ratelimit-*` headers off a response.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        };

        Self {
            limit: get("x-ratelimit-limit"),
            remaining: get("x-ratelimit-remaining"),
            reset: get("x-ratelimit-reset"),
            reset_after: get("x-ratelimit-reset-after"),
            bucket: get("x-ratelimit-bucket"),
            global: get("x-ratelimit-global"),
            scope: get("x-ratelimit-scope"),
        }
    }

    /// Only responses carrying quota numbers are worth merging.
    pub fn has_quota(&self) -> bool {
        self.limit.is_some() || self.remaining.is_some()
    }
}

fn parse_number(value: &Option<String>) -> Option<f64> {
    value
        .as_deref()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Opaque identifier of a queued caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct QueueId(pub u64);

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Why a caller was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionError {
    QueueFull,
    QueueTimeout,
    /// The coordinator actor is no longer running
    Unavailable,
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueFull => write!(f, "queue full"),
            Self::QueueTimeout => write!(f, "queue timeout"),
            Self::Unavailable => write!(f, "coordinator unavailable"),
        }
    }
}

/// Answer to an `acquire_slot` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotGrant {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<QueueId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AdmissionError>,
}

impl SlotGrant {
    pub fn granted(queue_id: Option<QueueId>) -> Self {
        Self {
            allowed: true,
            wait_ms: None,
            queue_id,
            error: None,
        }
    }

    pub fn denied(error: AdmissionError, wait_ms: Option<u64>, queue_id: Option<QueueId>) -> Self {
        Self {
            allowed: false,
            wait_ms,
            queue_id,
            error: Some(error),
        }
    }
}

/// Read-only view for diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorSnapshot {
    #[serde(flatten)]
    pub state: RateLimitState,
    pub queue_length: usize,
    pub effective_remaining: i64,
    /// Nothing in flight or queued, and no provider data still in force
    pub idle: bool,
}

struct QueuedRequest {
    id: QueueId,
    enqueued_at_ms: i64,
    responder: oneshot::Sender<SlotGrant>,
    timer: Option<AbortHandle>,
}

/// Rate-limit state plus the FIFO wait queue.
pub struct Coordinator {
    config: CoordinatorConfig,
    state: RateLimitState,
    queue: VecDeque<QueuedRequest>,
    next_id: u64,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("state", &self.state)
            .field("queue_length", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let state = RateLimitState::initial(config.default_limit);
        Self {
            config,
            state,
            queue: VecDeque::new(),
            next_id: 0,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn state(&self) -> &RateLimitState {
        &self.state
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn reset_passed(&self, now_ms: i64) -> bool {
        self.state.reset_at > 0.0 && (now_ms as f64) / 1000.0 >= self.state.reset_at
    }

    fn is_stale(&self, now_ms: i64) -> bool {
        self.state.last_updated == 0 || now_ms - self.state.last_updated > self.config.staleness_ms
    }

    /// True when dropping this coordinator loses nothing a fresh one would
    /// not assume anyway.
    pub fn is_idle(&self, now_ms: i64) -> bool {
        self.state.active_requests == 0
            && self.queue.is_empty()
            && (self.is_stale(now_ms) || self.reset_passed(now_ms))
    }

    /// Slots that can be handed out right now.
    pub fn effective_remaining(&self, now_ms: i64) -> i64 {
        let base = if self.reset_passed(now_ms) {
            self.state.limit
        } else if self.is_stale(now_ms) {
            self.config.default_limit
        } else {
            self.state.remaining.max(0)
        };
        (base - self.config.reserve_buffer - self.state.active_requests).max(0)
    }

    fn wait_hint_ms(&self, now_ms: i64) -> u64 {
        let reset_ms = self.state.reset_at * 1000.0 - now_ms as f64;
        if reset_ms > 0.0 {
            reset_ms.ceil() as u64
        } else {
            FALLBACK_WAIT_MS
        }
    }

    /// Grant, queue, or reject a caller.
    ///
    /// Returns the queue id when the caller was parked; the actor must then arm
    /// a timeout for it. In every other case `responder` has been answered.
    pub fn acquire(&mut self, responder: oneshot::Sender<SlotGrant>, now_ms: i64) -> Option<QueueId> {
        if self.effective_remaining(now_ms) > 0 {
            self.state.active_requests += 1;
            if responder.send(SlotGrant::granted(None)).is_err() {
                self.state.active_requests -= 1;
                debug!("Caller gone before its grant, slot returned");
                return None;
            }
            trace!(active = self.state.active_requests, "Slot granted");
            return None;
        }

        let wait_ms = self.wait_hint_ms(now_ms);
        if self.queue.len() >= self.config.max_queue_size {
            warn!(queue_length = self.queue.len(), wait_ms, "Admission queue full");
            let _ = responder.send(SlotGrant::denied(
                AdmissionError::QueueFull,
                Some(wait_ms),
                None,
            ));
            return None;
        }

        self.next_id += 1;
        let id = QueueId(self.next_id);
        self.queue.push_back(QueuedRequest {
            id,
            enqueued_at_ms: now_ms,
            responder,
            timer: None,
        });
        debug!(queue_id = %id, queue_length = self.queue.len(), "Caller queued");
        Some(id)
    }

    /// Attach the cancellation timer for a queued caller.
    pub fn attach_timer(&mut self, id: QueueId, timer: AbortHandle) {
        match self.queue.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => entry.timer = Some(timer),
            // Already resolved before the timer was armed
            None => timer.abort(),
        }
    }

    /// Return a slot and hand freed capacity to the oldest waiters.
    pub fn release(&mut self, now_ms: i64) {
        self.state.active_requests = (self.state.active_requests - 1).max(0);
        self.advance_queue(now_ms);
    }

    /// Drop a queued caller whose timeout fired. Returns false if it was
    /// already granted.
    pub fn expire(&mut self, id: QueueId, now_ms: i64) -> bool {
        let Some(position) = self.queue.iter().position(|entry| entry.id == id) else {
            return false;
        };
        let Some(entry) = self.queue.remove(position) else {
            return false;
        };

        debug!(
            queue_id = %id,
            waited_ms = now_ms - entry.enqueued_at_ms,
            "Queued caller timed out"
        );
        let wait_ms = self.wait_hint_ms(now_ms);
        let _ = entry.responder.send(SlotGrant::denied(
            AdmissionError::QueueTimeout,
            Some(wait_ms),
            Some(id),
        ));
        true
    }

    /// Merge provider headers. Returns whether anything changed.
    pub fn update_from_response(&mut self, headers: &RateLimitHeaders, now_ms: i64) -> bool {
        if !headers.has_quota() {
            return false;
        }

        if let Some(limit) = parse_number(&headers.limit) {
            self.state.limit = limit as i64;
        }
        if let Some(remaining) = parse_number(&headers.remaining) {
            self.state.remaining = remaining as i64;
        }
        if let Some(reset) = parse_number(&headers.reset) {
            self.state.reset_at = reset;
        }
        if let Some(reset_after) = parse_number(&headers.reset_after) {
            self.state.reset_after = reset_after;
        }
        if let Some(bucket) = &headers.bucket {
            self.state.bucket = Some(bucket.clone());
        }
        if let Some(global) = &headers.global {
            self.state.is_global = global.eq_ignore_ascii_case("true");
        }
        if let Some(scope) = &headers.scope {
            self.state.scope = Some(scope.clone());
        }
        self.state.last_updated = now_ms;

        trace!(
            limit = self.state.limit,
            remaining = self.state.remaining,
            reset_at = self.state.reset_at,
            "Rate limit state updated"
        );
        self.advance_queue(now_ms);
        true
    }

    /// The provider rejected a call outright.
    pub fn handle_rate_limited(&mut self, retry_after_secs: f64, now_ms: i64) {
        let retry_after = retry_after_secs.max(0.0);
        self.state.remaining = 0;
        self.state.reset_at = (now_ms as f64) / 1000.0 + retry_after;
        self.state.reset_after = retry_after;
        self.state.last_updated = now_ms;
        warn!(retry_after, "Provider rate limit hit");
    }

    pub fn snapshot(&self, now_ms: i64) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            state: self.state.clone(),
            queue_length: self.queue.len(),
            effective_remaining: self.effective_remaining(now_ms),
            idle: self.is_idle(now_ms),
        }
    }

    fn advance_queue(&mut self, now_ms: i64) {
        while !self.queue.is_empty() && self.effective_remaining(now_ms) > 0 {
            let Some(entry) = self.queue.pop_front() else {
                break;
            };
            if let Some(timer) = &entry.timer {
                timer.abort();
            }

            self.state.active_requests += 1;
            if entry.responder.send(SlotGrant::granted(Some(entry.id))).is_err() {
                // Caller went away while waiting
                self.state.active_requests -= 1;
                continue;
            }
            debug!(
                queue_id = %entry.id,
                waited_ms = now_ms - entry.enqueued_at_ms,
                "Queued caller admitted"
            );
        }
    }
}
