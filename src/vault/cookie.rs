//! Cookie naming and attributes for the session identifier.
//!
//! Every cookie the server sets goes through [`CookiePolicy`] so the secure
//! and local-development variants cannot drift apart between handlers.

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};

/// Base name of the opaque session identifier cookie.
pub const SESSION_COOKIE: &str = "guildboard_session";

/// Base name of the short-lived OAuth `state` cookie.
pub const OAUTH_STATE_COOKIE: &str = "guildboard_oauth_state";

/// Prefix that makes browsers require `Secure`, `Path=/` and no `Domain`.
pub const SECURE_PREFIX: &str = "__Host-";

/// Whether cookies are served over HTTPS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieContext {
    /// HTTPS deployment: prefixed names, `Secure` always set.
    Secure,
    /// Plain-HTTP local development: bare names, `Secure` unset.
    Insecure,
}

impl CookieContext {
    pub fn from_secure(secure: bool) -> Self {
        if secure {
            Self::Secure
        } else {
            Self::Insecure
        }
    }
}

/// Single decision point for cookie names and attributes.
#[derive(Debug, Clone, Copy)]
pub struct CookiePolicy {
    context: CookieContext,
}

impl CookiePolicy {
    pub fn new(context: CookieContext) -> Self {
        Self { context }
    }

    /// Wire name for a cookie base name in the current context.
    pub fn name(&self, base: &str) -> String {
        match self.context {
            CookieContext::Secure => format!("{}{}", SECURE_PREFIX, base),
            CookieContext::Insecure => base.to_string(),
        }
    }

    /// Build a cookie with the context's attributes.
    pub fn build(&self, base: &str, value: impl Into<String>, max_age_secs: u64) -> Cookie<'static> {
        let secure = self.context == CookieContext::Secure;
        Cookie::build((self.name(base), value.into()))
            .path("/")
            .http_only(true)
            .secure(secure)
            .same_site(SameSite::Lax)
            .max_age(time::Duration::seconds(max_age_secs as i64))
            .build()
    }

    /// Build an already-expired cookie that makes the browser drop `base`.
    pub fn clear(&self, base: &str) -> Cookie<'static> {
        self.build(base, "", 0)
    }

    /// Read the value of `base` from the request's cookies.
    pub fn read(&self, jar: &CookieJar, base: &str) -> Option<String> {
        jar.get(&self.name(base))
            .map(|c| c.value().to_string())
            .filter(|v| !v.is_empty())
    }
}
