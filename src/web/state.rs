use crate::error::AppError;
use crate::gateway::{Authorized, DiscordGateway};
use crate::vault::SessionVault;
use crate::web::refresh::RefreshRegistry;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use std::sync::Arc;

/// Application state for web handlers
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<DiscordGateway>,
    pub refreshes: Arc<RefreshRegistry>,
}

impl AppState {
    pub fn new(gateway: Arc<DiscordGateway>, refreshes: Arc<RefreshRegistry>) -> Self {
        Self { gateway, refreshes }
    }

    pub fn vault(&self) -> &Arc<SessionVault> {
        self.gateway.vault()
    }

    /// Resolve the session or produce the response that rejects the request.
    pub async fn session(&self, jar: CookieJar) -> Result<(CookieJar, Authorized), Response> {
        match self.gateway.authorize(jar).await {
            (jar, Ok(auth)) => Ok((jar, auth)),
            (jar, Err(e)) => Err((jar, e).into_response()),
        }
    }

    /// Error response for an authorized request. A provider-side rejection of
    /// the credentials ends the session.
    pub async fn reject(&self, jar: CookieJar, auth: &Authorized, err: AppError) -> Response {
        let jar = match err {
            AppError::AuthExpired => self.gateway.invalidate(&auth.session_id, jar).await,
            _ => jar,
        };
        (jar, err).into_response()
    }
}
