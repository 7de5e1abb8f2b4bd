//! Client-side bulk refresh of guild public data.
//!
//! [`BatchOrchestrator`] walks a list of guild ids in fixed-size batches over
//! any [`ItemFetcher`]: in-process through the gateway, or remotely against a
//! running dashboard with [`DashboardClient`].

pub mod cache;
pub mod cooldown;
pub mod fetcher;
pub mod orchestrator;

pub use cache::{CachedPublicData, PublicDataCache};
pub use cooldown::CooldownTimer;
pub use fetcher::{DashboardClient, FetchError, GatewayFetcher, ItemFetcher};
pub use orchestrator::{
    BatchConfig, BatchOrchestrator, BatchProgress, RunOptions, RunSummary, StopHandle,
};
