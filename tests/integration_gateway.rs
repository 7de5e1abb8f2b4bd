//! Gateway behaviour against a mock Discord API.

mod common;

use common::{Harness, ACCESS_TOKEN, BODY_RETRY_AFTER, REVOKED_TOKEN, SLOW_GUILD, USER_ID};
use std::time::Duration;
use guildboard::gateway::scope_for;
use guildboard::vault::SessionCredentials;
use guildboard::AppError;

fn credentials(access_token: &str) -> SessionCredentials {
    let now = chrono::Utc::now().timestamp_millis();
    SessionCredentials {
        user_id: USER_ID.to_string(),
        access_token: access_token.to_string(),
        refresh_token: "refresh-42".to_string(),
        expires_at: now + 3_600_000,
        created_at: now,
    }
}

#[tokio::test]
async fn test_response_headers_feed_coordinator() {
    let h = Harness::start().await;

    let guilds = h.gateway.user_guilds(&credentials(ACCESS_TOKEN)).await.unwrap();
    assert_eq!(guilds.len(), common::GUILD_COUNT);

    let snapshot = h.gateway.coordinator_state(USER_ID).await.unwrap();
    assert_eq!(snapshot.state.limit, 50);
    assert_eq!(snapshot.state.remaining, 49);
    assert_eq!(snapshot.state.bucket.as_deref(), Some("mock-bucket"));
    assert_ne!(snapshot.state.last_updated, 0);
    // Slot returned after the call
    assert_eq!(snapshot.state.active_requests, 0);
    assert_eq!(snapshot.effective_remaining, 47);
}

#[tokio::test]
async fn test_login_lookup_uses_identity_scope() {
    let h = Harness::start().await;

    let user = h.gateway.current_user(ACCESS_TOKEN).await.unwrap();
    assert_eq!(user.id, USER_ID);
    assert!(h.gateway.coordinator_state(USER_ID).await.is_none());
    assert!(h
        .gateway
        .coordinators()
        .state_of(guildboard::gateway::IDENTITY_SCOPE)
        .await
        .is_some());
}

#[tokio::test]
async fn test_missing_preview_is_not_an_error() {
    let h = Harness::start().await;
    let creds = credentials(ACCESS_TOKEN);

    for id in ["403", "404"] {
        let data = h.gateway.guild_public_data(&creds, id).await.unwrap();
        assert!(!data.available);
        assert!(data.preview.is_none());
    }

    let data = h.gateway.guild_public_data(&creds, "7").await.unwrap();
    assert!(data.available);
    assert_eq!(data.preview.unwrap().approximate_member_count, Some(120));
}

#[tokio::test]
async fn test_provider_429_blocks_scope() {
    let h = Harness::start().await;
    let creds = credentials(ACCESS_TOKEN);

    let err = h.gateway.guild_public_data(&creds, "429").await.unwrap_err();
    match err {
        AppError::RateLimited { retry_after } => assert_eq!(retry_after, Some(BODY_RETRY_AFTER)),
        other => panic!("expected rate limit, got {:?}", other),
    }

    let snapshot = h
        .gateway
        .coordinators()
        .state_of(&scope_for(USER_ID))
        .await
        .unwrap();
    assert_eq!(snapshot.state.remaining, 0);
    assert_eq!(snapshot.state.reset_after, BODY_RETRY_AFTER);
    assert_eq!(snapshot.state.active_requests, 0);
    assert_eq!(snapshot.effective_remaining, 0);
}

#[tokio::test]
async fn test_status_mapping() {
    let h = Harness::start().await;
    let creds = credentials(ACCESS_TOKEN);

    assert!(matches!(
        h.gateway.guild_public_data(&creds, "401").await,
        Err(AppError::AuthExpired)
    ));
    assert!(matches!(
        h.gateway.guild_public_data(&creds, "500").await,
        Err(AppError::Provider { status: 500, .. })
    ));
    assert!(matches!(
        h.gateway.session_user(&credentials(REVOKED_TOKEN)).await,
        Err(AppError::AuthExpired)
    ));

    let snapshot = h.gateway.coordinator_state(USER_ID).await.unwrap();
    assert_eq!(snapshot.state.active_requests, 0);
}

#[tokio::test]
async fn test_concurrent_calls_are_admitted() {
    let h = Harness::start().await;
    let creds = credentials(ACCESS_TOKEN);

    // A fresh scope admits three at once; the rest queue until headers arrive.
    let calls = (1..=8).map(|i| {
        let gateway = h.gateway.clone();
        let creds = creds.clone();
        tokio::spawn(async move { gateway.guild_public_data(&creds, &i.to_string()).await })
    });
    for call in futures::future::join_all(calls).await {
        assert!(call.unwrap().unwrap().available);
    }

    assert_eq!(h.discord.previews(), 8);
    let snapshot = h.gateway.coordinator_state(USER_ID).await.unwrap();
    assert_eq!(snapshot.state.active_requests, 0);
    assert_eq!(snapshot.queue_length, 0);
}

#[tokio::test]
async fn test_abandoned_calls_return_their_slots() {
    let h = Harness::start().await;

    // A fresh scope admits three calls; hold all of them on a hanging preview
    let mut calls = Vec::new();
    for _ in 0..3 {
        let gateway = h.gateway.clone();
        calls.push(tokio::spawn(async move {
            gateway
                .guild_public_data(&credentials(ACCESS_TOKEN), SLOW_GUILD)
                .await
        }));
    }
    loop {
        let active = h
            .gateway
            .coordinator_state(USER_ID)
            .await
            .map_or(0, |s| s.state.active_requests);
        if active == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for call in &calls {
        call.abort();
    }
    for call in calls {
        assert!(call.await.unwrap_err().is_cancelled());
    }

    let data = h
        .gateway
        .guild_public_data(&credentials(ACCESS_TOKEN), "7")
        .await
        .unwrap();
    assert!(data.available);
    let snapshot = h.gateway.coordinator_state(USER_ID).await.unwrap();
    assert_eq!(snapshot.state.active_requests, 0);
}
