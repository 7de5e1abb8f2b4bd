//! Shared fixtures: a mock Discord API and a wired-up gateway.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use guildboard::batch::BatchConfig;
use guildboard::config::SessionConfig;
use guildboard::coordinator::{CoordinatorConfig, CoordinatorRegistry};
use guildboard::gateway::DiscordGateway;
use guildboard::vault::{
    CookieContext, KvStore, MemoryKvStore, SessionVault, TokenGrant, TokenIssuer,
};
use guildboard::web::{AppState, RefreshRegistry};
use guildboard::{AppError, AppResult};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

pub const USER_ID: &str = "42";
pub const ACCESS_TOKEN: &str = "token-42";
pub const REVOKED_TOKEN: &str = "revoked";
pub const GUILD_COUNT: usize = 7;

/// Preview that takes far longer than any test waits.
pub const SLOW_GUILD: &str = "slow";

/// Retry hint the mock puts in a 429 body; the header says 3.
pub const BODY_RETRY_AFTER: f64 = 2.0;

#[derive(Default)]
pub struct MockStats {
    pub requests: AtomicUsize,
    pub previews: AtomicUsize,
}

/// Mock of the Discord REST API.
///
/// Guild ids pick the preview outcome: `403`/`404`/`401`/`429`/`500`
/// answer with that status, [`SLOW_GUILD`] hangs, anything else returns a
/// preview.
pub struct MockDiscord {
    pub base_url: String,
    pub stats: Arc<MockStats>,
    _task: tokio::task::JoinHandle<()>,
}

fn rate_limit_headers() -> [(&'static str, String); 5] {
    let reset = chrono::Utc::now().timestamp() + 60;
    [
        ("x-ratelimit-limit", "50".to_string()),
        ("x-ratelimit-remaining", "49".to_string()),
        ("x-ratelimit-reset", reset.to_string()),
        ("x-ratelimit-reset-after", "60.000".to_string()),
        ("x-ratelimit-bucket", "mock-bucket".to_string()),
    ]
}

fn with_limits(status: StatusCode, body: serde_json::Value) -> Response {
    let mut response = (status, Json(body)).into_response();
    for (name, value) in rate_limit_headers() {
        response
            .headers_mut()
            .insert(name, value.parse().unwrap());
    }
    response
}

fn revoked(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", REVOKED_TOKEN))
        .unwrap_or(true)
}

async fn me(State(stats): State<Arc<MockStats>>, headers: HeaderMap) -> Response {
    stats.requests.fetch_add(1, Ordering::SeqCst);
    if revoked(&headers) {
        return with_limits(StatusCode::UNAUTHORIZED, json!({"message": "401: Unauthorized"}));
    }
    with_limits(
        StatusCode::OK,
        json!({"id": USER_ID, "username": "tester", "global_name": "Tester", "avatar": null}),
    )
}

async fn guilds(State(stats): State<Arc<MockStats>>, headers: HeaderMap) -> Response {
    stats.requests.fetch_add(1, Ordering::SeqCst);
    if revoked(&headers) {
        return with_limits(StatusCode::UNAUTHORIZED, json!({"message": "401: Unauthorized"}));
    }
    let list: Vec<_> = (1..=GUILD_COUNT)
        .map(|i| json!({"id": i.to_string(), "name": format!("Guild {}", i), "owner": i == 1}))
        .collect();
    with_limits(StatusCode::OK, json!(list))
}

async fn preview(
    State(stats): State<Arc<MockStats>>,
    Path(guild_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    stats.requests.fetch_add(1, Ordering::SeqCst);
    stats.previews.fetch_add(1, Ordering::SeqCst);
    if revoked(&headers) {
        return with_limits(StatusCode::UNAUTHORIZED, json!({"message": "401: Unauthorized"}));
    }
    match guild_id.as_str() {
        "401" => with_limits(StatusCode::UNAUTHORIZED, json!({"message": "401: Unauthorized"})),
        "403" => with_limits(StatusCode::FORBIDDEN, json!({"message": "Missing Access"})),
        "404" => with_limits(StatusCode::NOT_FOUND, json!({"message": "Unknown Guild"})),
        "500" => with_limits(StatusCode::INTERNAL_SERVER_ERROR, json!({"message": "oops"})),
        SLOW_GUILD => {
            tokio::time::sleep(Duration::from_secs(60)).await;
            with_limits(StatusCode::NOT_FOUND, json!({"message": "Unknown Guild"}))
        }
        "429" => {
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({"message": "You are being rate limited.", "retry_after": BODY_RETRY_AFTER, "global": false})),
            )
                .into_response();
            response
                .headers_mut()
                .insert("retry-after", "3".parse().unwrap());
            response
        }
        id => with_limits(
            StatusCode::OK,
            json!({
                "id": id,
                "name": format!("Guild {}", id),
                "description": "a public guild",
                "approximate_member_count": 120,
                "approximate_presence_count": 12,
                "features": ["DISCOVERABLE"]
            }),
        ),
    }
}

impl MockDiscord {
    pub async fn start() -> Self {
        let stats = Arc::new(MockStats::default());
        let app = Router::new()
            .route("/users/@me", get(me))
            .route("/users/@me/guilds", get(guilds))
            .route("/guilds/{guild_id}/preview", get(preview))
            .with_state(Arc::clone(&stats));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base_url: format!("http://{}", addr),
            stats,
            _task: task,
        }
    }

    pub fn requests(&self) -> usize {
        self.stats.requests.load(Ordering::SeqCst)
    }

    pub fn previews(&self) -> usize {
        self.stats.previews.load(Ordering::SeqCst)
    }
}

/// Issuer that accepts any code and hands out `ACCESS_TOKEN`.
pub struct StubIssuer;

pub const CSRF_STATE: &str = "csrf-state";

#[async_trait]
impl TokenIssuer for StubIssuer {
    fn authorize_url(&self) -> (String, String) {
        (
            format!("https://discord.test/oauth2/authorize?state={}", CSRF_STATE),
            CSRF_STATE.to_string(),
        )
    }

    async fn exchange_code(&self, code: &str) -> AppResult<TokenGrant> {
        if code == "bad" {
            return Err(AppError::oauth("invalid_grant"));
        }
        Ok(TokenGrant {
            access_token: ACCESS_TOKEN.to_string(),
            refresh_token: Some("refresh-42".to_string()),
            expires_in_secs: 3600,
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> AppResult<TokenGrant> {
        Err(AppError::AuthExpired)
    }
}

pub struct Harness {
    pub discord: MockDiscord,
    pub store: Arc<MemoryKvStore>,
    pub gateway: Arc<DiscordGateway>,
    pub state: AppState,
}

impl Harness {
    pub async fn start() -> Self {
        let discord = MockDiscord::start().await;
        let store = Arc::new(MemoryKvStore::new());
        let vault = Arc::new(SessionVault::new(
            Arc::clone(&store) as Arc<dyn KvStore>,
            Arc::new(StubIssuer),
            &SessionConfig::with_secret("integration-secret"),
            CookieContext::Insecure,
        ));
        let coordinators = Arc::new(CoordinatorRegistry::new(CoordinatorConfig::default()));
        let gateway = Arc::new(DiscordGateway::new(&discord.base_url, coordinators, vault).unwrap());
        let refreshes = Arc::new(RefreshRegistry::new(fast_batches()));
        let state = AppState::new(Arc::clone(&gateway), refreshes);

        Self {
            discord,
            store,
            gateway,
            state,
        }
    }

    /// Create a session directly in the vault. Returns its id.
    pub async fn session_with_token(&self, access_token: &str) -> String {
        self.gateway
            .vault()
            .create_session(
                USER_ID,
                TokenGrant {
                    access_token: access_token.to_string(),
                    refresh_token: Some("refresh-42".to_string()),
                    expires_in_secs: 3600,
                },
            )
            .await
            .unwrap()
    }

    pub async fn session(&self) -> String {
        self.session_with_token(ACCESS_TOKEN).await
    }
}

pub fn fast_batches() -> BatchConfig {
    BatchConfig {
        inter_batch_delay: std::time::Duration::from_millis(10),
        ..BatchConfig::default()
    }
}

pub fn guild_ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}
