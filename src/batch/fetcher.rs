//! Per-item fetchers the orchestrator drives.

use crate::error::AppError;
use crate::gateway::{DiscordGateway, PublicData};
use crate::vault::{CookieContext, CookiePolicy, SessionCredentials, SESSION_COOKIE};
use async_trait::async_trait;
use reqwest::header::COOKIE;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// How a single item fetch failed, as far as the orchestrator cares.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("credentials rejected")]
    Unauthorized,

    #[error("rate limited")]
    RateLimited { retry_after: Option<f64> },

    #[error("{0}")]
    Other(String),
}

impl From<AppError> for FetchError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::AuthExpired | AppError::AuthRequired => Self::Unauthorized,
            err if err.is_rate_limit() => Self::RateLimited {
                retry_after: err.retry_after(),
            },
            err => Self::Other(err.to_string()),
        }
    }
}

/// Fetches the public data for one guild.
#[async_trait]
pub trait ItemFetcher: Send + Sync {
    async fn fetch(&self, guild_id: &str) -> Result<PublicData, FetchError>;
}

/// In-process fetcher bound to one session's credentials.
pub struct GatewayFetcher {
    gateway: Arc<DiscordGateway>,
    credentials: SessionCredentials,
}

impl GatewayFetcher {
    pub fn new(gateway: Arc<DiscordGateway>, credentials: SessionCredentials) -> Self {
        Self {
            gateway,
            credentials,
        }
    }
}

#[async_trait]
impl ItemFetcher for GatewayFetcher {
    async fn fetch(&self, guild_id: &str) -> Result<PublicData, FetchError> {
        self.gateway
            .guild_public_data(&self.credentials, guild_id)
            .await
            .map_err(FetchError::from)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    retry_after: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for a running dashboard server, authenticated by session id.
pub struct DashboardClient {
    http: Client,
    base_url: String,
    cookie: String,
}

impl std::fmt::Debug for DashboardClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DashboardClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl DashboardClient {
    pub fn new(base_url: &str, context: CookieContext, session_id: &str) -> Result<Self, FetchError> {
        let http = Client::builder()
            .build()
            .map_err(|e| FetchError::Other(e.to_string()))?;
        let name = CookiePolicy::new(context).name(SESSION_COOKIE);

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            cookie: format!("{}={}", name, session_id),
        })
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, FetchError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .header(COOKIE, &self.cookie)
            .send()
            .await
            .map_err(|e| FetchError::Other(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED => Err(FetchError::Unauthorized),
            status => {
                let body = response.json::<ErrorBody>().await.ok();
                if status == StatusCode::TOO_MANY_REQUESTS {
                    return Err(FetchError::RateLimited {
                        retry_after: body.and_then(|b| b.retry_after),
                    });
                }
                let message = body
                    .and_then(|b| b.error)
                    .unwrap_or_else(|| format!("server returned {}", status));
                Err(FetchError::Other(message))
            }
        }
    }
}

#[async_trait]
impl ItemFetcher for DashboardClient {
    async fn fetch(&self, guild_id: &str) -> Result<PublicData, FetchError> {
        debug!(guild_id, "Fetching guild public data");
        self.get(&format!("/api/guilds/{}/public", guild_id))
            .await?
            .json()
            .await
            .map_err(|e| FetchError::Other(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_errors_classified() {
        assert_eq!(FetchError::from(AppError::AuthExpired), FetchError::Unauthorized);
        assert_eq!(
            FetchError::from(AppError::RateLimited { retry_after: Some(3.0) }),
            FetchError::RateLimited { retry_after: Some(3.0) }
        );
        assert_eq!(
            FetchError::from(AppError::QueueFull { wait_ms: Some(2000) }),
            FetchError::RateLimited { retry_after: Some(2.0) }
        );
        assert_eq!(
            FetchError::from(AppError::QueueTimeout),
            FetchError::RateLimited { retry_after: None }
        );
        assert!(matches!(
            FetchError::from(AppError::Provider { status: 500, message: "boom".into() }),
            FetchError::Other(_)
        ));
    }

    #[test]
    fn test_client_uses_context_cookie_name() {
        let secure = DashboardClient::new("https://board.example.com/", CookieContext::Secure, "abc").unwrap();
        assert_eq!(secure.cookie, "__Host-guildboard_session=abc");
        assert_eq!(secure.base_url, "https://board.example.com");

        let local = DashboardClient::new("http://localhost:8080", CookieContext::Insecure, "abc").unwrap();
        assert_eq!(local.cookie, "guildboard_session=abc");
    }
}
