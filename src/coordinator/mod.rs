//! Admission coordination for provider calls.
//!
//! Every outbound Discord request for a rate-limit scope goes through one
//! coordinator actor. The actor tracks the provider's advertised quota, hands
//! out slots while capacity remains above a reserve buffer, and parks the rest
//! in a bounded FIFO queue until capacity frees up or their timeout fires.
//!
//! ```ignore
//! let registry = CoordinatorRegistry::new(CoordinatorConfig::default());
//! let coordinator = registry.for_scope("user:42");
//!
//! if let Ok(permit) = coordinator.acquire_permit().await {
//!     // send request, then:
//!     coordinator.update_from_response(RateLimitHeaders::from_headers(resp.headers())).await;
//!     permit.release().await;
//! }
//! ```

pub mod actor;
pub mod state;

pub use actor::{CoordinatorHandle, CoordinatorRegistry, SlotPermit};
pub use state::{
    AdmissionError, Coordinator, CoordinatorConfig, CoordinatorSnapshot, QueueId,
    RateLimitHeaders, RateLimitState, SlotGrant,
};
