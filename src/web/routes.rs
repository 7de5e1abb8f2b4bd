use crate::batch::{CachedPublicData, GatewayFetcher, RunOptions};
use crate::error::AppError;
use crate::web::auth;
use crate::web::state::AppState;
use axum::{
    extract::{Path, State},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

macro_rules! session_or_return {
    ($state:expr, $jar:expr) => {
        match $state.session($jar).await {
            Ok(session) => session,
            Err(response) => return response,
        }
    };
}

/// Signed-in user
pub async fn me(State(state): State<AppState>, jar: CookieJar) -> Response {
    let (jar, auth) = session_or_return!(state, jar);
    match state.gateway.session_user(&auth.credentials).await {
        Ok(user) => (jar, Json(user)).into_response(),
        Err(e) => state.reject(jar, &auth, e).await,
    }
}

/// Guilds the signed-in user belongs to
pub async fn list_guilds(State(state): State<AppState>, jar: CookieJar) -> Response {
    let (jar, auth) = session_or_return!(state, jar);
    match state.gateway.user_guilds(&auth.credentials).await {
        Ok(guilds) => (jar, Json(guilds)).into_response(),
        Err(e) => state.reject(jar, &auth, e).await,
    }
}

/// Public data for one guild; also stored in the user's cache.
pub async fn guild_public(
    State(state): State<AppState>,
    Path(guild_id): Path<String>,
    jar: CookieJar,
) -> Response {
    let (jar, auth) = session_or_return!(state, jar);
    match state
        .gateway
        .guild_public_data(&auth.credentials, &guild_id)
        .await
    {
        Ok(data) => {
            state
                .refreshes
                .cache_for(&auth.credentials.user_id)
                .insert(data.clone());
            (jar, Json(data)).into_response()
        }
        Err(e) => state.reject(jar, &auth, e).await,
    }
}

/// Cached public data response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedGuilds {
    pub last_run_at: Option<i64>,
    /// Seconds until another refresh is worthwhile
    pub cooldown_secs: Option<u64>,
    pub entries: HashMap<String, CachedPublicData>,
}

/// Everything cached for the user so far
pub async fn cached_public(State(state): State<AppState>, jar: CookieJar) -> Response {
    let (jar, auth) = session_or_return!(state, jar);
    let user_id = &auth.credentials.user_id;
    let cache = state.refreshes.cache_for(user_id);
    let body = CachedGuilds {
        last_run_at: cache.last_run(),
        cooldown_secs: state.refreshes.cooldown_secs(user_id),
        entries: cache.entries(),
    };
    (jar, Json(body)).into_response()
}

/// Refresh request body
#[derive(Debug, Default, Deserialize)]
pub struct RefreshRequest {
    #[serde(default)]
    pub force_refresh: bool,
    /// Defaults to every guild the user belongs to
    #[serde(default)]
    pub guild_ids: Option<Vec<String>>,
}

/// Run the batch refresh for the signed-in user.
pub async fn refresh_guilds(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Option<Json<RefreshRequest>>,
) -> Response {
    let (jar, auth) = session_or_return!(state, jar);
    let request = body.map(|Json(request)| request).unwrap_or_default();

    let guild_ids = match request.guild_ids {
        Some(ids) => ids,
        None => match state.gateway.user_guilds(&auth.credentials).await {
            Ok(guilds) => guilds.into_iter().map(|g| g.id).collect(),
            Err(e) => return state.reject(jar, &auth, e).await,
        },
    };

    let user_id = auth.credentials.user_id.clone();
    let fetcher = Arc::new(GatewayFetcher::new(
        Arc::clone(&state.gateway),
        auth.credentials.clone(),
    ));
    let orchestrator = state.refreshes.orchestrator_for(&user_id, fetcher.clone());
    let Ok(mut orchestrator) = orchestrator.try_lock() else {
        return (jar, AppError::Conflict("refresh already running".into())).into_response();
    };
    orchestrator.set_fetcher(fetcher);

    info!(user_id = %user_id, guilds = guild_ids.len(), "Refresh requested");
    let summary = orchestrator
        .run(
            &guild_ids,
            RunOptions {
                force_refresh: request.force_refresh,
            },
        )
        .await;

    if summary.auth_expired {
        return state.reject(jar, &auth, AppError::AuthExpired).await;
    }
    (jar, Json(summary)).into_response()
}

#[derive(Serialize)]
pub struct StopResponse {
    pub stopped: bool,
}

/// Ask the user's running refresh to stop at its next checkpoint.
pub async fn stop_refresh(State(state): State<AppState>, jar: CookieJar) -> Response {
    let (jar, auth) = session_or_return!(state, jar);
    let stopped = state.refreshes.stop(&auth.credentials.user_id);
    (jar, Json(StopResponse { stopped })).into_response()
}

/// Diagnostic view of the user's admission coordinator
pub async fn rate_limit_state(State(state): State<AppState>, jar: CookieJar) -> Response {
    let (jar, auth) = session_or_return!(state, jar);
    let snapshot = state
        .gateway
        .coordinator_state(&auth.credentials.user_id)
        .await;
    (jar, Json(snapshot)).into_response()
}

/// Create the web router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/auth/login", get(auth::login))
        .route("/auth/callback", get(auth::callback))
        .route("/auth/logout", post(auth::logout))
        .route("/api/me", get(me))
        .route("/api/guilds", get(list_guilds))
        .route("/api/guilds/public", get(cached_public))
        .route("/api/guilds/refresh", post(refresh_guilds))
        .route("/api/guilds/refresh/stop", post(stop_refresh))
        .route("/api/guilds/{guild_id}/public", get(guild_public))
        .route("/api/ratelimit", get(rate_limit_state))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
