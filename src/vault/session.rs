//! Session vault: encrypted OAuth credentials behind an opaque session id.
//!
//! Only the session id ever reaches the browser. Access and refresh tokens are
//! encrypted independently before they touch the backing store, and are
//! refreshed inline when they get close to expiry.

use crate::config::SessionConfig;
use crate::error::{AppError, AppResult};
use crate::vault::cookie::{CookieContext, CookiePolicy, SESSION_COOKIE};
use crate::vault::crypto::{CryptoError, TokenCipher};
use crate::vault::oauth::{TokenGrant, TokenIssuer};
use crate::vault::store::KvStore;
use axum_extra::extract::cookie::{Cookie, CookieJar};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

const KEY_PREFIX: &str = "session:";

/// Record as persisted in the key-value store. Tokens are ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Access token expiry, unix millis
    pub expires_at: i64,
    /// Unix millis
    pub created_at: i64,
}

/// Decrypted credentials for one session. Token strings are wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionCredentials {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    pub created_at: i64,
}

impl SessionCredentials {
    /// Whether the access token expires within `window_ms` of `now_ms`.
    pub fn expires_within(&self, window_ms: i64, now_ms: i64) -> bool {
        self.expires_at - now_ms < window_ms
    }
}

impl std::fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("user_id", &self.user_id)
            .field("expires_at", &self.expires_at)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// What the response should do with the session cookie.
#[derive(Debug, Clone)]
pub enum CookieDirective {
    /// No session cookie was presented; leave cookies alone.
    Untouched,
    /// Re-issue the cookie to roll its expiry forward.
    Refresh(Cookie<'static>),
    /// The session is gone; tell the browser to drop the cookie.
    Clear(Cookie<'static>),
}

impl CookieDirective {
    pub fn apply(self, jar: CookieJar) -> CookieJar {
        match self {
            Self::Untouched => jar,
            Self::Refresh(cookie) | Self::Clear(cookie) => jar.add(cookie),
        }
    }
}

/// Outcome of resolving the session cookie on a request.
#[derive(Debug)]
pub struct SessionContext {
    pub session_id: Option<String>,
    pub credentials: Option<SessionCredentials>,
    pub cookie: CookieDirective,
}

impl SessionContext {
    fn anonymous() -> Self {
        Self {
            session_id: None,
            credentials: None,
            cookie: CookieDirective::Untouched,
        }
    }

    fn cleared(policy: &CookiePolicy) -> Self {
        Self {
            session_id: None,
            credentials: None,
            cookie: CookieDirective::Clear(policy.clear(SESSION_COOKIE)),
        }
    }
}

/// Manages encrypted session records and the session cookie lifecycle.
pub struct SessionVault {
    store: Arc<dyn KvStore>,
    issuer: Arc<dyn TokenIssuer>,
    cipher: TokenCipher,
    cookies: CookiePolicy,
    cookie_max_age_secs: u64,
    refresh_window_ms: i64,
}

impl std::fmt::Debug for SessionVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionVault")
            .field("cookies", &self.cookies)
            .field("cookie_max_age_secs", &self.cookie_max_age_secs)
            .field("refresh_window_ms", &self.refresh_window_ms)
            .finish_non_exhaustive()
    }
}

/// Shortened session id for log lines.
fn short_id(session_id: &str) -> String {
    session_id.chars().take(8).collect()
}

fn store_key(session_id: &str) -> String {
    format!("{}{}", KEY_PREFIX, session_id)
}

impl SessionVault {
    pub fn new(
        store: Arc<dyn KvStore>,
        issuer: Arc<dyn TokenIssuer>,
        config: &SessionConfig,
        context: CookieContext,
    ) -> Self {
        Self {
            store,
            issuer,
            cipher: TokenCipher::new(&config.secret),
            cookies: CookiePolicy::new(context),
            cookie_max_age_secs: config.cookie_max_age_secs,
            refresh_window_ms: (config.refresh_window_secs as i64) * 1000,
        }
    }

    pub fn cookies(&self) -> &CookiePolicy {
        &self.cookies
    }

    pub fn issuer(&self) -> &Arc<dyn TokenIssuer> {
        &self.issuer
    }

    /// Session cookie carrying `session_id` with the rolling max age.
    pub fn session_cookie(&self, session_id: &str) -> Cookie<'static> {
        self.cookies
            .build(SESSION_COOKIE, session_id, self.cookie_max_age_secs)
    }

    /// Cookie that removes the session id from the browser.
    pub fn clear_cookie(&self) -> Cookie<'static> {
        self.cookies.clear(SESSION_COOKIE)
    }

    /// Create a session after a successful code exchange. Returns the new id.
    pub async fn create_session(&self, user_id: &str, grant: TokenGrant) -> AppResult<String> {
        let now = Utc::now().timestamp_millis();
        let session_id = Uuid::new_v4().to_string();
        let credentials = SessionCredentials {
            user_id: user_id.to_string(),
            access_token: grant.access_token.clone(),
            refresh_token: grant.refresh_token.clone().unwrap_or_default(),
            expires_at: now + (grant.expires_in_secs as i64) * 1000,
            created_at: now,
        };

        self.persist_session(&session_id, &credentials).await?;
        info!(user_id, session = %short_id(&session_id), "Session created");
        Ok(session_id)
    }

    /// Resolve the request's session cookie into live credentials.
    pub async fn get_session_context(&self, jar: &CookieJar) -> AppResult<SessionContext> {
        let Some(session_id) = self.cookies.read(jar, SESSION_COOKIE) else {
            return Ok(SessionContext::anonymous());
        };

        let Some(raw) = self.store.get(&store_key(&session_id)).await? else {
            debug!(session = %short_id(&session_id), "Session cookie without backing record");
            return Ok(SessionContext::cleared(&self.cookies));
        };

        let credentials = match self.open_record(&raw) {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(session = %short_id(&session_id), error = %e, "Unreadable session record, discarding");
                self.delete_session(&session_id).await?;
                return Ok(SessionContext::cleared(&self.cookies));
            }
        };

        let now = Utc::now().timestamp_millis();
        let credentials = if credentials.expires_within(self.refresh_window_ms, now) {
            match self.refresh_session(&session_id, &credentials).await {
                Some(refreshed) => refreshed,
                None => {
                    self.delete_session(&session_id).await?;
                    return Ok(SessionContext::cleared(&self.cookies));
                }
            }
        } else {
            // Re-persisting renews the store TTL alongside the rolling cookie.
            self.persist_session(&session_id, &credentials).await?;
            credentials
        };

        Ok(SessionContext {
            cookie: CookieDirective::Refresh(self.session_cookie(&session_id)),
            session_id: Some(session_id),
            credentials: Some(credentials),
        })
    }

    /// Encrypt both tokens and write the record with the cookie's max age as TTL.
    pub async fn persist_session(
        &self,
        session_id: &str,
        session: &SessionCredentials,
    ) -> AppResult<()> {
        let record = SessionRecord {
            user_id: session.user_id.clone(),
            access_token: self.cipher.encrypt(&session.access_token)?,
            refresh_token: self.cipher.encrypt(&session.refresh_token)?,
            expires_at: session.expires_at,
            created_at: session.created_at,
        };

        let value = serde_json::to_string(&record)?;
        self.store
            .put(&store_key(session_id), value, self.cookie_max_age_secs)
            .await
    }

    /// Run the refresh-token grant. `None` means the session is unrecoverable.
    pub async fn refresh_session(
        &self,
        session_id: &str,
        session: &SessionCredentials,
    ) -> Option<SessionCredentials> {
        let grant = match self.issuer.refresh(&session.refresh_token).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!(session = %short_id(session_id), error = %e, "Session refresh failed");
                return None;
            }
        };

        let refreshed = SessionCredentials {
            user_id: session.user_id.clone(),
            access_token: grant.access_token.clone(),
            refresh_token: grant
                .refresh_token
                .clone()
                .unwrap_or_else(|| session.refresh_token.clone()),
            expires_at: Utc::now().timestamp_millis() + (grant.expires_in_secs as i64) * 1000,
            created_at: session.created_at,
        };

        if let Err(e) = self.persist_session(session_id, &refreshed).await {
            warn!(session = %short_id(session_id), error = %e, "Failed to store refreshed session");
            return None;
        }

        info!(user_id = %refreshed.user_id, session = %short_id(session_id), "Session refreshed");
        Some(refreshed)
    }

    /// Remove the backing record. Idempotent.
    pub async fn delete_session(&self, session_id: &str) -> AppResult<()> {
        self.store.delete(&store_key(session_id)).await?;
        debug!(session = %short_id(session_id), "Session deleted");
        Ok(())
    }

    fn open_record(&self, raw: &str) -> AppResult<SessionCredentials> {
        let record: SessionRecord = serde_json::from_str(raw)
            .map_err(|_| AppError::Decryption(CryptoError::InvalidPayload))?;

        Ok(SessionCredentials {
            access_token: self.cipher.decrypt(&record.access_token)?,
            refresh_token: self.cipher.decrypt(&record.refresh_token)?,
            user_id: record.user_id,
            expires_at: record.expires_at,
            created_at: record.created_at,
        })
    }
}
