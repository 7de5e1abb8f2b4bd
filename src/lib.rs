pub mod batch;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod vault;
pub mod web;

pub use config::AppConfig;
pub use error::{AppError, AppResult};
