//! Serialized coordinator actor and its handles.
//!
//! One task owns a [`Coordinator`] and processes commands one at a time off an
//! mpsc channel. Handles are cheap clones of the sender; the task exits once
//! every handle is dropped. The registry holds one handle per scope until
//! [`CoordinatorRegistry::evict_idle`] lets it go.

use super::state::{
    AdmissionError, Coordinator, CoordinatorConfig, CoordinatorSnapshot, QueueId,
    RateLimitHeaders, SlotGrant,
};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const COMMAND_BUFFER: usize = 256;

enum Command {
    Acquire { reply: oneshot::Sender<SlotGrant> },
    Release,
    Update { headers: RateLimitHeaders },
    RateLimited { retry_after_secs: f64 },
    Snapshot { reply: oneshot::Sender<CoordinatorSnapshot> },
    Expire { id: QueueId },
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Handle to one running coordinator actor.
#[derive(Clone)]
pub struct CoordinatorHandle {
    scope: Arc<str>,
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for CoordinatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorHandle")
            .field("scope", &self.scope)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl CoordinatorHandle {
    /// Spawn a coordinator actor for `scope` on the current runtime.
    pub fn spawn(scope: &str, config: CoordinatorConfig) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);

        // The actor keeps its own copy so `scope` counts handles only
        tokio::spawn(run_coordinator(
            Arc::from(scope),
            Coordinator::new(config),
            rx,
            tx.downgrade(),
        ));

        Self {
            scope: Arc::from(scope),
            tx,
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Ask for a slot. Suspends while queued, up to the queue timeout.
    ///
    /// A caller that gets `allowed == false` must not call [`release_slot`](Self::release_slot).
    /// If this future is dropped before it resolves, a slot granted in the
    /// meantime is returned.
    pub async fn acquire_slot(&self) -> SlotGrant {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Acquire { reply }).await.is_err() {
            return SlotGrant::denied(AdmissionError::Unavailable, None, None);
        }

        let mut pending = PendingGrant {
            handle: self,
            rx,
            settled: false,
        };
        let grant = (&mut pending.rx)
            .await
            .unwrap_or_else(|_| SlotGrant::denied(AdmissionError::Unavailable, None, None));
        pending.settled = true;
        grant
    }

    /// Acquire a slot tied to a [`SlotPermit`]. The denial is returned as-is.
    pub async fn acquire_permit(&self) -> Result<SlotPermit, SlotGrant> {
        let grant = self.acquire_slot().await;
        if !grant.allowed {
            return Err(grant);
        }
        Ok(SlotPermit {
            handle: Some(self.clone()),
            grant,
        })
    }

    pub async fn release_slot(&self) {
        let _ = self.tx.send(Command::Release).await;
    }

    /// Release without awaiting, for use from `Drop`.
    fn release_detached(&self) {
        match self.tx.try_send(Command::Release) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(command)) => match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let tx = self.tx.clone();
                    runtime.spawn(async move {
                        let _ = tx.send(command).await;
                    });
                }
                Err(_) => warn!(scope = %self.scope, "Slot release lost, no runtime"),
            },
        }
    }

    pub async fn update_from_response(&self, headers: RateLimitHeaders) {
        let _ = self.tx.send(Command::Update { headers }).await;
    }

    pub async fn handle_rate_limited(&self, retry_after_secs: f64) {
        let _ = self
            .tx
            .send(Command::RateLimited { retry_after_secs })
            .await;
    }

    /// Diagnostic snapshot; `None` once the actor has stopped.
    pub async fn get_state(&self) -> Option<CoordinatorSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Snapshot { reply }).await.ok()?;
        rx.await.ok()
    }
}

/// Reply side of an in-flight `acquire_slot`.
struct PendingGrant<'a> {
    handle: &'a CoordinatorHandle,
    rx: oneshot::Receiver<SlotGrant>,
    settled: bool,
}

impl Drop for PendingGrant<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // After close the actor's send fails and it rolls the grant back;
        // a grant that already arrived is returned here instead.
        self.rx.close();
        if let Ok(grant) = self.rx.try_recv() {
            if grant.allowed {
                self.handle.release_detached();
            }
        }
    }
}

/// A granted admission slot. Dropping it returns the slot.
#[derive(Debug)]
#[must_use = "dropping the permit releases the slot"]
pub struct SlotPermit {
    handle: Option<CoordinatorHandle>,
    grant: SlotGrant,
}

impl SlotPermit {
    pub fn grant(&self) -> &SlotGrant {
        &self.grant
    }

    /// Return the slot and wait until the actor has it.
    pub async fn release(mut self) {
        if let Some(handle) = &self.handle {
            handle.release_slot().await;
        }
        self.handle = None;
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!(scope = %handle.scope, "Slot permit dropped unreleased");
            handle.release_detached();
        }
    }
}

/// Actor loop.
async fn run_coordinator(
    scope: Arc<str>,
    mut coordinator: Coordinator,
    mut rx: mpsc::Receiver<Command>,
    weak_tx: mpsc::WeakSender<Command>,
) {
    debug!(scope = %scope, "Coordinator started");

    while let Some(command) = rx.recv().await {
        match command {
            Command::Acquire { reply } => {
                if let Some(id) = coordinator.acquire(reply, now_ms()) {
                    let timeout = coordinator.config().queue_timeout;
                    let weak = weak_tx.clone();
                    let timer = tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        if let Some(tx) = weak.upgrade() {
                            let _ = tx.send(Command::Expire { id }).await;
                        }
                    });
                    coordinator.attach_timer(id, timer.abort_handle());
                }
            }
            Command::Release => coordinator.release(now_ms()),
            Command::Update { headers } => {
                coordinator.update_from_response(&headers, now_ms());
            }
            Command::RateLimited { retry_after_secs } => {
                coordinator.handle_rate_limited(retry_after_secs, now_ms());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(coordinator.snapshot(now_ms()));
            }
            Command::Expire { id } => {
                coordinator.expire(id, now_ms());
            }
        }
    }

    debug!(scope = %scope, "Coordinator stopped");
}

/// One coordinator per rate-limit scope, spawned on first use.
pub struct CoordinatorRegistry {
    config: CoordinatorConfig,
    coordinators: DashMap<String, CoordinatorHandle>,
}

impl std::fmt::Debug for CoordinatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorRegistry")
            .field("scopes", &self.coordinators.len())
            .finish()
    }
}

impl CoordinatorRegistry {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            coordinators: DashMap::new(),
        }
    }

    /// Handle for `scope`, spawning the actor on first use.
    pub fn for_scope(&self, scope: &str) -> CoordinatorHandle {
        if let Some(handle) = self.coordinators.get(scope) {
            return handle.clone();
        }

        let handle = self
            .coordinators
            .entry(scope.to_string())
            .or_insert_with(|| CoordinatorHandle::spawn(scope, self.config.clone()))
            .clone();
        debug!(scope, "Coordinator scope resolved");
        handle
    }

    /// Drop scopes whose coordinator is idle and has no handle outside the
    /// registry. Their actors exit. Returns how many were dropped.
    pub async fn evict_idle(&self) -> usize {
        let handles: Vec<CoordinatorHandle> = self
            .coordinators
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut evicted = 0;
        for handle in handles {
            let idle = handle.get_state().await.map_or(true, |state| state.idle);
            let scope = handle.scope().to_string();
            drop(handle);
            if !idle {
                continue;
            }
            let removed = self
                .coordinators
                .remove_if(&scope, |_, h| Arc::strong_count(&h.scope) == 1);
            if removed.is_some() {
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!(evicted, remaining = self.coordinators.len(), "Idle coordinators evicted");
        }
        evicted
    }

    /// Snapshot for `scope` without spawning a new actor.
    pub async fn state_of(&self, scope: &str) -> Option<CoordinatorSnapshot> {
        let handle = self.coordinators.get(scope).map(|h| h.clone())?;
        handle.get_state().await
    }

    pub fn len(&self) -> usize {
        self.coordinators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinators.is_empty()
    }
}
