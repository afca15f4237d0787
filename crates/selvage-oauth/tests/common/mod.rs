#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use http::{Request, Response, StatusCode};
use tokio::sync::Mutex;
use url::Url;

use selvage_common::http::HttpClient;
use selvage_common::{Did, DidDocument, Handle};
use selvage_identity::resolver::{
    IdentityError, IdentityResolver, ResolveOpts, ResolverOptions,
};
use selvage_oauth::discovery::{DiscoveryError, ServerDiscovery};
use selvage_oauth::session::ClientSession;
use selvage_oauth::types::{AuthServerMetadata, ClientConfig, TokenSet, TokenType};

/// Queue-backed transport: tests enqueue responses and inspect the
/// request log afterwards.
#[derive(Clone, Default)]
pub struct MockClient {
    pub queue: Arc<Mutex<VecDeque<Response<Vec<u8>>>>>,
    pub log: Arc<Mutex<Vec<Request<Vec<u8>>>>>,
}

impl MockClient {
    pub async fn push(&self, response: Response<Vec<u8>>) {
        self.queue.lock().await.push_back(response);
    }

    pub async fn requests(&self) -> usize {
        self.log.lock().await.len()
    }
}

impl HttpClient for MockClient {
    type Error = std::convert::Infallible;
    fn send_http(
        &self,
        request: Request<Vec<u8>>,
    ) -> impl core::future::Future<Output = Result<Response<Vec<u8>>, Self::Error>> + Send {
        let queue = self.queue.clone();
        let log = self.log.clone();
        async move {
            log.lock().await.push(request);
            Ok(queue.lock().await.pop_front().expect("no queued response"))
        }
    }
}

impl IdentityResolver for MockClient {
    fn options(&self) -> &ResolverOptions {
        use std::sync::LazyLock;
        static OPTS: LazyLock<ResolverOptions> = LazyLock::new(ResolverOptions::default);
        &OPTS
    }

    async fn resolve_handle(
        &self,
        _handle: &Handle,
        _opts: &ResolveOpts,
    ) -> Result<Did, IdentityError> {
        Ok(Did::new("did:plc:alice").unwrap())
    }

    async fn resolve_did_doc(
        &self,
        _did: &Did,
        _opts: &ResolveOpts,
    ) -> Result<DidDocument, IdentityError> {
        Ok(serde_json::from_value(serde_json::json!({
            "id": "did:plc:alice",
            "alsoKnownAs": ["at://alice.example.com"],
            "service": [{
                "id": "#atproto_pds",
                "type": "AtprotoPersonalDataServer",
                "serviceEndpoint": "https://pds"
            }]
        }))
        .unwrap())
    }
}

impl ServerDiscovery for MockClient {
    // Metadata fetches are stubbed so only token/resource traffic hits
    // the mock transport.
    async fn get_authorization_server_metadata(
        &self,
        issuer: &Url,
    ) -> Result<AuthServerMetadata, DiscoveryError> {
        let mut metadata = AuthServerMetadata::default();
        metadata.issuer = issuer.as_str().into();
        metadata.authorization_endpoint = format!("{issuer}authorize").into();
        metadata.token_endpoint = format!("{issuer}token").into();
        metadata.revocation_endpoint = Some(format!("{issuer}revoke").into());
        metadata.pushed_authorization_request_endpoint = Some(format!("{issuer}par").into());
        metadata.require_pushed_authorization_requests = Some(true);
        metadata.token_endpoint_auth_methods_supported = Some(vec!["none".into()]);
        metadata.dpop_signing_alg_values_supported = Some(vec!["ES256".into()]);
        Ok(metadata)
    }

    async fn get_resource_server_metadata(
        &self,
        _pds: &Url,
    ) -> Result<AuthServerMetadata, DiscoveryError> {
        self.get_authorization_server_metadata(&Url::parse("https://issuer").unwrap())
            .await
    }

    async fn verify_token_issuer(
        &self,
        _server_metadata: &AuthServerMetadata,
        _sub: &Did,
    ) -> Result<Url, DiscoveryError> {
        Ok(Url::parse("https://pds").unwrap())
    }
}

pub fn test_config() -> ClientConfig {
    ClientConfig::localhost(None, "atproto").unwrap()
}

pub fn test_session(
    refresh_token: Option<&str>,
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
) -> ClientSession {
    ClientSession {
        account_did: Did::new("did:plc:alice").unwrap(),
        host_url: Url::parse("https://pds").unwrap(),
        authserver_issuer: "https://issuer/".into(),
        dpop_key: selvage_oauth::keys::generate_key(&["ES256".into()]).unwrap(),
        dpop_authserver_nonce: None,
        dpop_host_nonce: None,
        token_set: TokenSet {
            iss: "https://issuer/".into(),
            sub: Did::new("did:plc:alice").unwrap(),
            aud: "https://pds/".into(),
            scope: None,
            refresh_token: refresh_token.map(Into::into),
            access_token: "at1".into(),
            token_type: TokenType::DPoP,
            expires_at,
        },
    }
}

pub fn token_refresh_ok() -> Response<Vec<u8>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(
            serde_json::to_vec(&serde_json::json!({
                "access_token": "newacc",
                "token_type": "DPoP",
                "refresh_token": "newref",
                "expires_in": 3600
            }))
            .unwrap(),
        )
        .unwrap()
}

pub fn invalid_grant() -> Response<Vec<u8>> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(
            serde_json::to_vec(&serde_json::json!({
                "error": "invalid_grant",
                "error_description": "refresh token already used"
            }))
            .unwrap(),
        )
        .unwrap()
}

pub fn unauthorized_invalid_token() -> Response<Vec<u8>> {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(
            http::header::WWW_AUTHENTICATE,
            r#"DPoP realm="pds", error="invalid_token""#,
        )
        .body(Vec::new())
        .unwrap()
}

pub fn ok_json(body: serde_json::Value) -> Response<Vec<u8>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(serde_json::to_vec(&body).unwrap())
        .unwrap()
}
