//! OAuth2 token issuing against Discord.

use crate::config::DiscordConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use oauth2::basic::{BasicClient, BasicTokenResponse};
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl,
    RefreshToken, Scope, TokenResponse, TokenUrl,
};
use tracing::{debug, warn};

/// Lifetime assumed when the provider omits `expires_in` (Discord's default).
const DEFAULT_EXPIRES_IN_SECS: u64 = 7 * 24 * 60 * 60;

/// Token pair returned by a code exchange or refresh grant.
#[derive(Clone)]
pub struct TokenGrant {
    pub access_token: String,
    /// Providers may omit a new refresh token on refresh
    pub refresh_token: Option<String>,
    pub expires_in_secs: u64,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in_secs", &self.expires_in_secs)
            .finish_non_exhaustive()
    }
}

/// Endpoint that issues and refreshes OAuth credentials.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Authorization URL to redirect the browser to, plus the CSRF `state`.
    fn authorize_url(&self) -> (String, String);

    /// Exchange an authorization code for tokens.
    async fn exchange_code(&self, code: &str) -> AppResult<TokenGrant>;

    /// Perform the refresh-token grant.
    async fn refresh(&self, refresh_token: &str) -> AppResult<TokenGrant>;
}

/// Discord OAuth2 client
pub struct DiscordOAuth {
    client: BasicClient,
    client_id: String,
    scopes: Vec<String>,
}

impl std::fmt::Debug for DiscordOAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordOAuth")
            .field("client_id", &self.client_id)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

impl DiscordOAuth {
    pub fn new(config: &DiscordConfig) -> AppResult<Self> {
        let auth_url = AuthUrl::new(config.authorize_url.clone())
            .map_err(|e| AppError::oauth(format!("invalid authorize url: {}", e)))?;
        let token_url = TokenUrl::new(config.token_url.clone())
            .map_err(|e| AppError::oauth(format!("invalid token url: {}", e)))?;
        let redirect_url = RedirectUrl::new(config.redirect_url.clone())
            .map_err(|e| AppError::oauth(format!("invalid redirect url: {}", e)))?;

        let client = BasicClient::new(
            ClientId::new(config.client_id.clone()),
            Some(ClientSecret::new(config.client_secret.clone())),
            auth_url,
            Some(token_url),
        )
        .set_auth_type(AuthType::RequestBody)
        .set_redirect_uri(redirect_url);

        Ok(Self {
            client,
            client_id: config.client_id.clone(),
            scopes: config.scopes.clone(),
        })
    }

    fn into_grant(token: &BasicTokenResponse) -> TokenGrant {
        TokenGrant {
            access_token: token.access_token().secret().clone(),
            refresh_token: token.refresh_token().map(|t| t.secret().clone()),
            expires_in_secs: token
                .expires_in()
                .map(|d| d.as_secs())
                .unwrap_or(DEFAULT_EXPIRES_IN_SECS),
        }
    }
}

#[async_trait]
impl TokenIssuer for DiscordOAuth {
    fn authorize_url(&self) -> (String, String) {
        let mut request = self.client.authorize_url(CsrfToken::new_random);
        for scope in &self.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        let (url, state) = request.url();
        (url.to_string(), state.secret().clone())
    }

    async fn exchange_code(&self, code: &str) -> AppResult<TokenGrant> {
        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| {
                warn!(error = %e, "Authorization code exchange failed");
                AppError::oauth(e.to_string())
            })?;

        debug!("Authorization code exchanged");
        Ok(Self::into_grant(&token))
    }

    async fn refresh(&self, refresh_token: &str) -> AppResult<TokenGrant> {
        let token = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| {
                warn!(error = %e, "Refresh token grant failed");
                AppError::AuthExpired
            })?;

        debug!("Access token refreshed");
        Ok(Self::into_grant(&token))
    }
}
