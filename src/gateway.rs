//! Request gateway in front of the Discord REST API.
//!
//! Every outbound call resolves credentials through the [`SessionVault`], takes
//! an admission slot from the caller's coordinator, feeds the response's
//! rate-limit headers back, and returns the slot.

use crate::coordinator::{
    AdmissionError, CoordinatorRegistry, CoordinatorSnapshot, RateLimitHeaders, SlotGrant,
};
use crate::error::{AppError, AppResult};
use crate::vault::{CookieDirective, SessionCredentials, SessionVault};
use axum_extra::extract::cookie::CookieJar;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Coordinator scope for calls made before a user id is known.
pub const IDENTITY_SCOPE: &str = "identity";

/// Retry hint handed to the coordinator when a 429 carries none.
const DEFAULT_RETRY_AFTER_SECS: f64 = 1.0;

const USER_AGENT: &str = concat!("guildboard/", env!("CARGO_PKG_VERSION"));

/// Coordinator scope for one user's token.
pub fn scope_for(user_id: &str) -> String {
    format!("user:{}", user_id)
}

/// `GET /users/@me`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

/// Entry of `GET /users/@me/guilds`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialGuild {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub owner: bool,
    #[serde(default)]
    pub permissions: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
}

/// `GET /guilds/{id}/preview`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildPreview {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub approximate_member_count: Option<u64>,
    #[serde(default)]
    pub approximate_presence_count: Option<u64>,
    #[serde(default)]
    pub features: Vec<String>,
}

/// Result of a per-guild public data fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicData {
    pub guild_id: String,
    /// False when the guild exposes no preview to this user
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<GuildPreview>,
}

impl PublicData {
    pub fn unavailable(guild_id: &str) -> Self {
        Self {
            guild_id: guild_id.to_string(),
            available: false,
            preview: None,
        }
    }
}

/// Credentials resolved for one request.
#[derive(Debug)]
pub struct Authorized {
    pub session_id: String,
    pub credentials: SessionCredentials,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    #[serde(default)]
    retry_after: Option<f64>,
}

fn admission_error(grant: SlotGrant) -> AppError {
    match grant.error {
        Some(AdmissionError::QueueTimeout) => AppError::QueueTimeout,
        Some(AdmissionError::Unavailable) => AppError::internal("rate-limit coordinator unavailable"),
        Some(AdmissionError::QueueFull) | None => AppError::QueueFull {
            wait_ms: grant.wait_ms,
        },
    }
}

fn retry_after_header(headers: &HeaderMap) -> Option<f64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
}

/// Map a non-success status to the error taxonomy.
async fn status_error(response: Response) -> AppError {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return AppError::AuthExpired;
    }
    let message = response.text().await.unwrap_or_default();
    AppError::Provider {
        status: status.as_u16(),
        message: message.chars().take(200).collect(),
    }
}

/// Coordinated client for the Discord REST API.
pub struct DiscordGateway {
    http: Client,
    api_base: String,
    coordinators: Arc<CoordinatorRegistry>,
    vault: Arc<SessionVault>,
}

impl std::fmt::Debug for DiscordGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordGateway")
            .field("api_base", &self.api_base)
            .field("coordinators", &self.coordinators)
            .finish_non_exhaustive()
    }
}

impl DiscordGateway {
    pub fn new(
        api_base: &str,
        coordinators: Arc<CoordinatorRegistry>,
        vault: Arc<SessionVault>,
    ) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            coordinators,
            vault,
        })
    }

    pub fn vault(&self) -> &Arc<SessionVault> {
        &self.vault
    }

    pub fn coordinators(&self) -> &Arc<CoordinatorRegistry> {
        &self.coordinators
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    /// Resolve live credentials for the request's session cookie.
    ///
    /// The returned jar carries the vault's cookie instruction whether or not
    /// a session was found.
    pub async fn authorize(&self, jar: CookieJar) -> (CookieJar, AppResult<Authorized>) {
        let context = match self.vault.get_session_context(&jar).await {
            Ok(context) => context,
            Err(e) => return (jar, Err(e)),
        };

        let expired = matches!(context.cookie, CookieDirective::Clear(_));
        let jar = context.cookie.apply(jar);
        match (context.session_id, context.credentials) {
            (Some(session_id), Some(credentials)) => (
                jar,
                Ok(Authorized {
                    session_id,
                    credentials,
                }),
            ),
            _ if expired => (jar, Err(AppError::AuthExpired)),
            _ => (jar, Err(AppError::AuthRequired)),
        }
    }

    /// Drop a session the provider no longer accepts.
    pub async fn invalidate(&self, session_id: &str, jar: CookieJar) -> CookieJar {
        if let Err(e) = self.vault.delete_session(session_id).await {
            warn!(error = %e, "Failed to delete rejected session");
        }
        jar.add(self.vault.clear_cookie())
    }

    /// One coordinated GET. Non-429 statuses are left to the caller.
    async fn send(&self, scope: &str, access_token: &str, path: &str) -> AppResult<Response> {
        let coordinator = self.coordinators.for_scope(scope);

        // The permit returns the slot even if this future is dropped mid-call
        let permit = match coordinator.acquire_permit().await {
            Ok(permit) => permit,
            Err(grant) => {
                debug!(scope, path, error = ?grant.error, "Admission denied");
                return Err(admission_error(grant));
            }
        };

        let response = match self
            .http
            .get(self.url(path))
            .bearer_auth(access_token)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                permit.release().await;
                warn!(scope, path, error = %e, "Discord request failed");
                return Err(e.into());
            }
        };

        coordinator
            .update_from_response(RateLimitHeaders::from_headers(response.headers()))
            .await;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let header_hint = retry_after_header(response.headers());
            let body_hint = response
                .json::<RateLimitBody>()
                .await
                .ok()
                .and_then(|body| body.retry_after);
            let retry_after = body_hint.or(header_hint);

            coordinator
                .handle_rate_limited(retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS))
                .await;
            permit.release().await;
            warn!(scope, path, ?retry_after, "Discord rate limited request");
            return Err(AppError::RateLimited { retry_after });
        }

        permit.release().await;
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        scope: &str,
        access_token: &str,
        path: &str,
    ) -> AppResult<T> {
        let response = self.send(scope, access_token, path).await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(response.json().await?)
    }

    /// The token owner. Used right after the code exchange, before a user
    /// scope exists.
    pub async fn current_user(&self, access_token: &str) -> AppResult<DiscordUser> {
        self.get_json(IDENTITY_SCOPE, access_token, "/users/@me")
            .await
    }

    /// The session's own user, counted against the user's scope.
    pub async fn session_user(&self, credentials: &SessionCredentials) -> AppResult<DiscordUser> {
        self.get_json(
            &scope_for(&credentials.user_id),
            &credentials.access_token,
            "/users/@me",
        )
        .await
    }

    pub async fn user_guilds(&self, credentials: &SessionCredentials) -> AppResult<Vec<PartialGuild>> {
        self.get_json(
            &scope_for(&credentials.user_id),
            &credentials.access_token,
            "/users/@me/guilds",
        )
        .await
    }

    /// Public preview of one guild. 403 and 404 mean the guild has none.
    pub async fn guild_public_data(
        &self,
        credentials: &SessionCredentials,
        guild_id: &str,
    ) -> AppResult<PublicData> {
        let response = self
            .send(
                &scope_for(&credentials.user_id),
                &credentials.access_token,
                &format!("/guilds/{}/preview", guild_id),
            )
            .await?;

        match response.status() {
            status if status.is_success() => Ok(PublicData {
                guild_id: guild_id.to_string(),
                available: true,
                preview: Some(response.json().await?),
            }),
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                debug!(guild_id, "Guild has no public preview");
                Ok(PublicData::unavailable(guild_id))
            }
            _ => Err(status_error(response).await),
        }
    }

    /// Coordinator snapshot for a user, if one has been started.
    pub async fn coordinator_state(&self, user_id: &str) -> Option<CoordinatorSnapshot> {
        self.coordinators.state_of(&scope_for(user_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::coordinator::CoordinatorConfig;
    use crate::vault::{CookieContext, MemoryKvStore, TokenGrant, TokenIssuer};
    use async_trait::async_trait;

    struct NoIssuer;

    #[async_trait]
    impl TokenIssuer for NoIssuer {
        fn authorize_url(&self) -> (String, String) {
            (String::new(), String::new())
        }

        async fn exchange_code(&self, _code: &str) -> AppResult<TokenGrant> {
            Err(AppError::oauth("unused"))
        }

        async fn refresh(&self, _refresh_token: &str) -> AppResult<TokenGrant> {
            Err(AppError::AuthExpired)
        }
    }

    fn gateway(api_base: &str) -> DiscordGateway {
        let vault = SessionVault::new(
            Arc::new(MemoryKvStore::new()),
            Arc::new(NoIssuer),
            &SessionConfig::with_secret("gateway-test"),
            CookieContext::Insecure,
        );
        DiscordGateway::new(
            api_base,
            Arc::new(CoordinatorRegistry::new(CoordinatorConfig::default())),
            Arc::new(vault),
        )
        .unwrap()
    }

    #[test]
    fn test_url_joins_cleanly() {
        let gw = gateway("https://discord.com/api/v10/");
        assert_eq!(gw.url("/users/@me"), "https://discord.com/api/v10/users/@me");
        assert_eq!(
            gw.url("guilds/1/preview"),
            "https://discord.com/api/v10/guilds/1/preview"
        );
    }

    #[test]
    fn test_admission_denials_map_to_backpressure() {
        let full = admission_error(SlotGrant::denied(AdmissionError::QueueFull, Some(750), None));
        assert!(matches!(full, AppError::QueueFull { wait_ms: Some(750) }));

        let timeout = admission_error(SlotGrant::denied(AdmissionError::QueueTimeout, None, None));
        assert!(matches!(timeout, AppError::QueueTimeout));
        assert!(timeout.is_rate_limit());

        let gone = admission_error(SlotGrant::denied(AdmissionError::Unavailable, None, None));
        assert!(!gone.is_rate_limit());
    }

    #[test]
    fn test_retry_after_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after_header(&headers), None);
        headers.insert(RETRY_AFTER, "2.5".parse().unwrap());
        assert_eq!(retry_after_header(&headers), Some(2.5));
        headers.insert(RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(retry_after_header(&headers), None);
    }

    #[tokio::test]
    async fn test_authorize_without_cookie_requires_login() {
        let gw = gateway("http://127.0.0.1:9");
        let (_, result) = gw.authorize(CookieJar::new()).await;
        assert!(matches!(result, Err(AppError::AuthRequired)));
    }

    #[test]
    fn test_scope_per_user() {
        assert_eq!(scope_for("42"), "user:42");
    }
}
