mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{connect, credentials, test_config, MockTransport, Reply, BUCKET};
use dog_b2::{B2Client, B2Error, EndpointScope, UploadRequest, UploadSource};

/// B1. Connect stores the authorization context
#[tokio::test]
async fn test_connect_stores_context() {
    let mock = MockTransport::new();
    let client = connect(&mock, test_config(1024)).await;

    let ctx = client.auth().current_context().unwrap();
    assert_eq!(ctx.account_id, "account-1");
    assert_eq!(ctx.authorization_token, "token-1");
    assert_eq!(ctx.endpoint("b2_get_upload_url"), "https://api.mock.b2/b2api/v2/b2_get_upload_url");
    assert!(ctx.has_capability("writeFiles"));
    assert!(!ctx.has_capability("deleteFiles"));

    let auth = &mock.requests("b2_authorize_account")[0];
    assert!(auth.header("authorization").unwrap().starts_with("Basic "));
}

/// B2. Bad credentials are not retried
#[tokio::test]
async fn test_bad_credentials_fail_without_retry() {
    let mock = MockTransport::new();
    mock.script(
        "b2_authorize_account",
        [Reply::Status(401, "unauthorized", "invalid key")],
    );

    let result = B2Client::connect_with_transport(mock.clone(), credentials(), test_config(1024)).await;

    assert!(matches!(result, Err(B2Error::InvalidAuthorization(_))));
    assert_eq!(mock.count("b2_authorize_account"), 1);
}

/// B3. Transport failures during authorization back off then surface as ConnectionFailed
#[tokio::test]
async fn test_unreachable_auth_surfaces_connection_failed() {
    let mock = MockTransport::new();
    mock.script(
        "b2_authorize_account",
        [Reply::Disconnect, Reply::Status(503, "service_unavailable", "busy"), Reply::Disconnect],
    );

    let result = B2Client::connect_with_transport(mock.clone(), credentials(), test_config(1024)).await;

    assert!(matches!(result, Err(B2Error::ConnectionFailed(_))));
    assert_eq!(mock.count("b2_authorize_account"), 3);
}

/// B4. A transient authorization failure is recovered transparently
#[tokio::test]
async fn test_transient_auth_failure_recovers() {
    let mock = MockTransport::new();
    mock.script("b2_authorize_account", [Reply::Disconnect]);

    let client = connect(&mock, test_config(1024)).await;

    assert_eq!(client.auth().current_context().unwrap().authorization_token, "token-1");
    assert_eq!(mock.count("b2_authorize_account"), 2);
}

/// B5. Concurrent refreshes coalesce into one authorization call
#[tokio::test]
async fn test_concurrent_refreshes_share_one_call() {
    let mock = MockTransport::new();
    let client = connect(&mock, test_config(1024)).await;
    mock.set_latency("b2_authorize_account", Duration::from_millis(50));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let auth = client.auth().clone();
        handles.push(tokio::spawn(async move { auth.invalidate_and_refresh().await }));
    }

    let mut contexts = Vec::new();
    for handle in handles {
        contexts.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(mock.count("b2_authorize_account"), 2);
    for ctx in &contexts {
        assert!(Arc::ptr_eq(ctx, &contexts[0]));
        assert_eq!(ctx.authorization_token, "token-2");
    }
    assert_eq!(client.auth().current_context().unwrap().generation, 2);
}

/// B6. An expired account token is refreshed once and the call replayed
#[tokio::test]
async fn test_expired_token_refreshes_and_replays() {
    let mock = MockTransport::new();
    let client = connect(&mock, test_config(1024)).await;
    mock.script(
        "b2_get_upload_url",
        [Reply::Status(401, "expired_auth_token", "token expired")],
    );

    let lease = client
        .cache()
        .acquire(&EndpointScope::Bucket(BUCKET.to_string()))
        .await
        .unwrap();

    assert_eq!(mock.count("b2_authorize_account"), 2);
    let mints = mock.requests("b2_get_upload_url");
    assert_eq!(mints.len(), 2);
    assert_eq!(mints[0].header("Authorization"), Some("token-1"));
    assert_eq!(mints[1].header("Authorization"), Some("token-2"));
    assert!(lease.endpoint().upload_url.contains("/upload/bucket-1/"));
}

/// B7. Expiry seen by many callers at once still costs one refresh
#[tokio::test]
async fn test_expiry_seen_by_many_callers_refreshes_once() {
    let mock = MockTransport::new();
    let client = connect(&mock, test_config(1024).with_max_cache(4)).await;
    mock.set_latency("b2_authorize_account", Duration::from_millis(50));
    mock.set_latency("b2_get_upload_url", Duration::from_millis(20));
    mock.script(
        "b2_get_upload_url",
        (0..4).map(|_| Reply::Status(401, "expired_auth_token", "token expired")),
    );

    let mut handles = Vec::new();
    for _ in 0..4 {
        let cache = client.cache().clone();
        handles.push(tokio::spawn(async move {
            cache.acquire(&EndpointScope::Bucket(BUCKET.to_string())).await.map(|lease| lease.id())
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(mock.count("b2_authorize_account"), 2);
}

/// B8. Tokens past the refresh window are renewed before use
#[tokio::test]
async fn test_stale_token_is_refreshed_proactively() {
    let mock = MockTransport::new();
    let client = connect(&mock, test_config(1024).with_token_refresh_after(Duration::ZERO)).await;

    let ctx = client.auth().fresh_context().await.unwrap();

    assert_eq!(ctx.authorization_token, "token-2");
    assert_eq!(mock.count("b2_authorize_account"), 2);
}

/// B9. Close makes every later operation fail with NotConnected
#[tokio::test]
async fn test_close_disconnects() {
    let mock = MockTransport::new();
    let client = connect(&mock, test_config(1024)).await;

    client.close().await;

    assert!(!client.is_connected());
    assert_eq!(client.auth().current_context(), Err(B2Error::NotConnected));
    assert!(matches!(
        client.auth().invalidate_and_refresh().await,
        Err(B2Error::NotConnected)
    ));
    let result = client
        .upload(BUCKET, UploadRequest::new("late.txt"), UploadSource::bytes("late"))
        .await;
    assert!(matches!(result, Err(B2Error::NotConnected)));
    assert_eq!(mock.count("upload_file"), 0);
}

/// B10. Invalid configuration is rejected before any network call
#[tokio::test]
async fn test_invalid_config_rejected() {
    let mock = MockTransport::new();

    let result = B2Client::connect_with_transport(mock.clone(), credentials(), test_config(0)).await;

    assert!(matches!(result, Err(B2Error::InvalidConfig(_))));
    assert_eq!(mock.count("b2_authorize_account"), 0);
}
