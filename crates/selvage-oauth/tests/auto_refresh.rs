mod common;

use std::sync::Arc;

use http::{Method, Request, StatusCode};

use common::{
    MockClient, ok_json, test_config, test_session, token_refresh_ok, unauthorized_invalid_token,
};
use selvage_oauth::authstore::{ClientAuthStore, MemoryAuthStore};
use selvage_oauth::client::OAuthSession;
use selvage_oauth::registry::{DeleteCause, SessionEvent, SessionRegistry};

type TestRegistry = SessionRegistry<MockClient, MemoryAuthStore>;

async fn setup() -> (Arc<MockClient>, Arc<TestRegistry>, OAuthSession<MockClient, MemoryAuthStore>)
{
    let client = Arc::new(MockClient::default());
    let store = MemoryAuthStore::default();
    let session = test_session(Some("rt1"), None);
    store.upsert_session(session.clone()).await.unwrap();
    let registry = Arc::new(SessionRegistry::new(store, client.clone(), test_config()));
    let handle = OAuthSession::new(registry.clone(), client.clone(), session);
    (client, registry, handle)
}

fn get_session_request() -> Request<Vec<u8>> {
    Request::builder()
        .method(Method::GET)
        .uri("/xrpc/com.atproto.server.getSession")
        .body(Vec::new())
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_token_triggers_refresh_and_one_retry() {
    let (client, _registry, session) = setup().await;

    client.push(unauthorized_invalid_token()).await;
    client.push(token_refresh_ok()).await;
    client
        .push(ok_json(serde_json::json!({
            "did": "did:plc:alice",
            "handle": "alice.example.com",
            "active": true
        })))
        .await;

    let response = session.fetch(get_session_request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let log = client.log.lock().await;
    assert_eq!(log.len(), 3, "original, refresh, retry — nothing more");

    // 0: original request with the old token and a proof
    assert_eq!(log[0].method(), Method::GET);
    assert!(
        log[0]
            .uri()
            .to_string()
            .ends_with("/xrpc/com.atproto.server.getSession")
    );
    assert_eq!(
        log[0]
            .headers()
            .get(http::header::AUTHORIZATION)
            .unwrap()
            .to_str()
            .unwrap(),
        "DPoP at1"
    );
    assert!(log[0].headers().contains_key("DPoP"));

    // 1: the refresh grant
    assert_eq!(log[1].method(), Method::POST);
    assert!(log[1].uri().to_string().ends_with("/token"));
    assert!(log[1].headers().contains_key("DPoP"));
    let body = String::from_utf8(log[1].body().clone()).unwrap();
    assert!(body.contains("grant_type=refresh_token"));
    assert!(body.contains("refresh_token=rt1"));

    // 2: the single retry carries the replacement token and a new proof
    assert_eq!(log[2].method(), Method::GET);
    assert_eq!(
        log[2]
            .headers()
            .get(http::header::AUTHORIZATION)
            .unwrap()
            .to_str()
            .unwrap(),
        "DPoP newacc"
    );
    let first_proof = log[0].headers().get("DPoP").unwrap();
    let retry_proof = log[2].headers().get("DPoP").unwrap();
    assert_ne!(first_proof, retry_proof, "proofs are never reused");
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_fresh_token_deletes_session_and_returns_response() {
    let (client, registry, session) = setup().await;
    let mut events = registry.subscribe();

    client.push(unauthorized_invalid_token()).await;
    client.push(token_refresh_ok()).await;
    // even the fresh token is rejected
    client.push(unauthorized_invalid_token()).await;

    let response = session
        .fetch(get_session_request())
        .await
        .expect("a rejected retry is an application-visible outcome, not an error");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(client.requests().await, 3, "exactly one retry");

    // the dead session is gone from the store
    assert!(
        registry
            .store()
            .get_session(session.did())
            .await
            .unwrap()
            .is_none()
    );

    // and its removal was announced with the right cause
    let mut saw_deletion = false;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Deleted { did, cause } = event {
            assert_eq!(&did, session.did());
            assert_eq!(cause, DeleteCause::TokenRejected);
            saw_deletion = true;
        }
    }
    assert!(saw_deletion, "deletion must be observable");
}

#[tokio::test(flavor = "multi_thread")]
async fn successful_response_needs_no_retry() {
    let (client, _registry, session) = setup().await;
    client.push(ok_json(serde_json::json!({"ok": true}))).await;

    let response = session.fetch(get_session_request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(client.requests().await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn sign_out_revokes_and_always_deletes() {
    let (client, registry, session) = setup().await;
    let mut events = registry.subscribe();

    client
        .push(
            http::Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(Vec::new())
                .unwrap(),
        )
        .await;

    session.sign_out().await.unwrap();

    let log = client.log.lock().await;
    assert_eq!(log.len(), 1);
    assert!(log[0].uri().to_string().ends_with("/revoke"), "revocation endpoint");
    drop(log);

    assert!(
        registry
            .store()
            .get_session(session.did())
            .await
            .unwrap()
            .is_none()
    );
    match events.try_recv().unwrap() {
        SessionEvent::Deleted { cause, .. } => assert_eq!(cause, DeleteCause::SignedOut),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn token_info_reports_without_refreshing_when_asked() {
    let (client, _registry, session) = setup().await;

    let info = session
        .token_info(selvage_oauth::TokenRefresh::Skip)
        .await
        .unwrap();
    assert_eq!(info.sub.as_str(), "did:plc:alice");
    assert_eq!(info.aud, "https://pds/");
    assert_eq!(info.expires_at, None);
    assert_eq!(client.requests().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn token_info_force_refreshes() {
    let (client, _registry, session) = setup().await;
    client.push(token_refresh_ok()).await;

    let info = session
        .token_info(selvage_oauth::TokenRefresh::Force)
        .await
        .unwrap();
    assert!(info.expires_at.is_some(), "refreshed tokens carry an expiry");
    assert_eq!(client.requests().await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn sign_out_deletes_even_when_revocation_fails() {
    let (client, registry, session) = setup().await;

    client
        .push(
            http::Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Vec::new())
                .unwrap(),
        )
        .await;

    session.sign_out().await.unwrap();
    assert!(
        registry
            .store()
            .get_session(session.did())
            .await
            .unwrap()
            .is_none(),
        "local deletion is unconditional"
    );
}
