//! OAuth login flow handlers.

use crate::error::AppError;
use crate::vault::{OAUTH_STATE_COOKIE, SESSION_COOKIE};
use crate::web::state::AppState;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use tracing::{info, warn};

/// Lifetime of the CSRF state cookie
const OAUTH_STATE_MAX_AGE_SECS: u64 = 10 * 60;

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// Redirect to the provider's consent screen.
pub async fn login(State(state): State<AppState>, jar: CookieJar) -> Response {
    let vault = state.vault();
    let (url, csrf_state) = vault.issuer().authorize_url();
    let cookie = vault
        .cookies()
        .build(OAUTH_STATE_COOKIE, csrf_state, OAUTH_STATE_MAX_AGE_SECS);

    (jar.add(cookie), Redirect::to(&url)).into_response()
}

/// Finish the code exchange and start a session.
pub async fn callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
    jar: CookieJar,
) -> Response {
    let vault = state.vault();
    let expected = vault.cookies().read(&jar, OAUTH_STATE_COOKIE);
    let jar = jar.add(vault.cookies().clear(OAUTH_STATE_COOKIE));

    if let Some(error) = params.error {
        warn!(error = %error, "Authorization denied by provider");
        return (jar, AppError::oauth(error)).into_response();
    }

    let (Some(code), Some(returned)) = (params.code, params.state) else {
        return (jar, AppError::BadRequest("missing code or state".into())).into_response();
    };
    if expected.as_deref() != Some(returned.as_str()) {
        warn!("OAuth state mismatch");
        return (jar, AppError::BadRequest("state mismatch".into())).into_response();
    }

    let grant = match vault.issuer().exchange_code(&code).await {
        Ok(grant) => grant,
        Err(e) => return (jar, e).into_response(),
    };
    let user = match state.gateway.current_user(&grant.access_token).await {
        Ok(user) => user,
        Err(e) => return (jar, e).into_response(),
    };
    let session_id = match vault.create_session(&user.id, grant).await {
        Ok(id) => id,
        Err(e) => return (jar, e).into_response(),
    };

    info!(user_id = %user.id, username = %user.username, "User signed in");
    (jar.add(vault.session_cookie(&session_id)), Redirect::to("/")).into_response()
}

/// End the session. Safe to call without one.
pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> Response {
    let vault = state.vault();
    if let Some(session_id) = vault.cookies().read(&jar, SESSION_COOKIE) {
        if let Err(e) = vault.delete_session(&session_id).await {
            return (jar, e).into_response();
        }
    }
    (jar.add(vault.clear_cookie()), StatusCode::NO_CONTENT).into_response()
}
