//! The authorization-flow coordinator and the per-user authenticated
//! session handle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use serde::Serialize;
use smol_str::SmolStr;
use url::Url;

use selvage_common::Did;
use selvage_common::lock::ProcessLock;

use crate::authstore::ClientAuthStore;
use crate::discovery::{ServerDiscovery, issuer_equivalent};
use crate::dpop::DpopEngine;
use crate::error::{CallbackError, OAuthError};
use crate::getter::GetOptions;
use crate::keys::{generate_dpop_key, generate_nonce, generate_pkce};
use crate::registry::{DeleteCause, SessionRegistry};
use crate::request::{RequestError, exchange_code, push_authorization_request};
use crate::session::{AuthRequestState, ClientSession};
use crate::types::{
    AuthorizeOptions, CallbackParams, ClientConfig, CodeChallengeMethod, ParParameters,
    ResponseType, TokenSet, TokenType,
};

/// Drives the interactive login sequence and materializes sessions.
pub struct OAuthClient<T, S>
where
    T: ServerDiscovery + Send + Sync + 'static,
    S: ClientAuthStore + 'static,
{
    pub registry: Arc<SessionRegistry<T, S>>,
    pub client: Arc<T>,
}

impl<T, S> OAuthClient<T, S>
where
    T: ServerDiscovery + Send + Sync + 'static,
    S: ClientAuthStore + 'static,
{
    pub fn new(store: S, client: T, config: ClientConfig) -> Self {
        let client = Arc::new(client);
        let registry = Arc::new(SessionRegistry::new(store, client.clone(), config));
        Self { registry, client }
    }

    /// Like [`OAuthClient::new`], with refresh guarded by a cross-process
    /// lock (the store-reconciliation fallback stays active regardless).
    pub fn new_with_lock(
        store: S,
        client: T,
        config: ClientConfig,
        lock: Arc<dyn ProcessLock>,
    ) -> Self {
        let client = Arc::new(client);
        let registry =
            Arc::new(SessionRegistry::new(store, client.clone(), config).with_lock(lock));
        Self { registry, client }
    }

    fn config(&self) -> &ClientConfig {
        self.registry.config()
    }

    /// Begin an authorization attempt for `input` (handle, DID, or
    /// `https://` server URL). Returns the URL to send the user's
    /// browser to.
    ///
    /// The attempt's ephemeral state (PKCE verifier, DPoP key, anti-CSRF
    /// state, the caller's `app_state`) is persisted keyed by the state
    /// value, to be consumed exactly once by the matching callback.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(input = %input)))]
    pub async fn start_auth(
        &self,
        input: &str,
        options: AuthorizeOptions,
    ) -> Result<Url, OAuthError> {
        // validates redirect_uris among other things
        let metadata_doc = self.config().client_metadata()?;
        let (server, identity) = self.client.resolve_for_login(input).await?;

        let login_hint = identity.is_some().then(|| SmolStr::new(input));
        let state = generate_nonce();
        let (code_challenge, pkce_verifier) = generate_pkce();
        let Some(dpop_key) = generate_dpop_key(&server) else {
            return Err(RequestError::KeyGeneration.into());
        };
        let engine = DpopEngine::new(dpop_key.clone());
        let redirect_uri = options
            .redirect_uri
            .unwrap_or_else(|| metadata_doc.redirect_uris[0].clone());

        let parameters = ParParameters {
            response_type: ResponseType::Code,
            redirect_uri: redirect_uri.as_str().into(),
            state: state.clone(),
            scope: Some(self.config().scope.clone()),
            code_challenge,
            code_challenge_method: CodeChallengeMethod::S256,
            login_hint,
            prompt: options.prompt.map(|p| p.as_str().into()),
        };
        let par = push_authorization_request(
            self.client.as_ref(),
            &engine,
            self.config(),
            &server,
            parameters,
        )
        .await?;

        let authserver_url = Url::parse(&server.issuer)?;
        let request = AuthRequestState {
            state: state.clone(),
            authserver_url: authserver_url.clone(),
            dpop_authserver_nonce: engine.nonce_for(&authserver_url),
            dpop_key,
            pkce_verifier,
            redirect_uri,
            app_state: options.app_state,
        };
        self.registry.store().save_auth_request(&request).await?;

        #[derive(Serialize)]
        struct Parameters<'a> {
            client_id: &'a Url,
            request_uri: &'a str,
        }
        let query = serde_html_form::to_string(Parameters {
            client_id: &metadata_doc.client_id,
            request_uri: &par.request_uri,
        })
        .map_err(RequestError::from)?;
        Ok(Url::parse(&format!(
            "{}?{query}",
            server.authorization_endpoint
        ))?)
    }

    /// Complete an authorization attempt from redirect parameters.
    ///
    /// The matching ephemeral state is deleted before anything else can
    /// fail, so a state value can never be replayed. On success the
    /// caller gets a usable session handle plus their original
    /// `app_state`.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all))]
    pub async fn callback(
        &self,
        params: CallbackParams,
    ) -> Result<(OAuthSession<T, S>, Option<SmolStr>), OAuthError> {
        let Some(state) = params.state else {
            return Err(CallbackError::MissingState.into());
        };
        let Some(request) = self.registry.store().get_auth_request(&state).await? else {
            return Err(CallbackError::UnknownState(state).into());
        };
        // consumed exactly once, success or failure
        self.registry.store().delete_auth_request(&state).await?;

        if let Some(error) = params.error {
            return Err(CallbackError::Server {
                error,
                description: params.error_description,
                app_state: request.app_state,
            }
            .into());
        }
        let Some(code) = params.code else {
            return Err(CallbackError::MissingCode.into());
        };

        let metadata = self
            .client
            .get_authorization_server_metadata(&request.authserver_url)
            .await?;
        match &params.iss {
            Some(iss) => {
                if !issuer_equivalent(iss, &metadata.issuer) {
                    return Err(CallbackError::IssuerMismatch {
                        expected: metadata.issuer.clone(),
                        got: iss.clone(),
                    }
                    .into());
                }
            }
            None => {
                if metadata.authorization_response_iss_parameter_supported == Some(true) {
                    return Err(CallbackError::MissingIssuer.into());
                }
            }
        }

        let engine = DpopEngine::new(request.dpop_key.clone());
        if let Some(nonce) = &request.dpop_authserver_nonce {
            engine.seed_nonce(&request.authserver_url, nonce.clone());
        }
        let token_set = exchange_code(
            self.client.as_ref(),
            &engine,
            self.config(),
            &metadata,
            &code,
            &request.pkce_verifier,
            &request.redirect_uri,
        )
        .await?;

        let session = ClientSession {
            account_did: token_set.sub.clone(),
            host_url: Url::parse(&token_set.aud)?,
            authserver_issuer: metadata.issuer.clone(),
            dpop_authserver_nonce: engine.nonce_for(&request.authserver_url),
            dpop_host_nonce: None,
            dpop_key: request.dpop_key,
            token_set,
        };
        self.registry.set(session.clone()).await?;

        Ok((
            OAuthSession::new(self.registry.clone(), self.client.clone(), session),
            request.app_state,
        ))
    }

    /// Restore a previously persisted session, refreshing only if its
    /// tokens are stale.
    pub async fn restore(&self, did: &Did) -> Result<OAuthSession<T, S>, OAuthError> {
        let session = self.registry.get(did, GetOptions::default()).await?;
        Ok(OAuthSession::new(
            self.registry.clone(),
            self.client.clone(),
            session,
        ))
    }

    /// Revoke and delete a stored session without materializing it.
    pub async fn revoke(&self, did: &Did) -> Result<(), OAuthError> {
        self.registry.revoke(did).await
    }
}

/// How eagerly [`OAuthSession::token_info`] refreshes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TokenRefresh {
    /// Refresh only when the tokens are stale
    #[default]
    Auto,
    /// Refresh unconditionally
    Force,
    /// Never refresh; return whatever is stored
    Skip,
}

impl From<TokenRefresh> for GetOptions {
    fn from(mode: TokenRefresh) -> Self {
        match mode {
            TokenRefresh::Auto => GetOptions::default(),
            TokenRefresh::Force => GetOptions::force(),
            TokenRefresh::Skip => GetOptions::stale_ok(),
        }
    }
}

/// A point-in-time view of a session's tokens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenInfo {
    pub iss: SmolStr,
    pub sub: Did,
    pub aud: SmolStr,
    pub scope: Option<SmolStr>,
    pub token_type: TokenType,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&TokenSet> for TokenInfo {
    fn from(token_set: &TokenSet) -> Self {
        Self {
            iss: token_set.iss.clone(),
            sub: token_set.sub.clone(),
            aud: token_set.aud.clone(),
            scope: token_set.scope.clone(),
            token_type: token_set.token_type,
            expires_at: token_set.expires_at,
        }
    }
}

/// Per-user façade for making authenticated requests and signing out.
pub struct OAuthSession<T, S>
where
    T: ServerDiscovery + Send + Sync + 'static,
    S: ClientAuthStore + 'static,
{
    registry: Arc<SessionRegistry<T, S>>,
    client: Arc<T>,
    did: Did,
    host: Url,
    engine: DpopEngine,
}

impl<T, S> std::fmt::Debug for OAuthSession<T, S>
where
    T: ServerDiscovery + Send + Sync + 'static,
    S: ClientAuthStore + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthSession")
            .field("did", &self.did)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl<T, S> OAuthSession<T, S>
where
    T: ServerDiscovery + Send + Sync + 'static,
    S: ClientAuthStore + 'static,
{
    pub fn new(
        registry: Arc<SessionRegistry<T, S>>,
        client: Arc<T>,
        session: ClientSession,
    ) -> Self {
        let engine = DpopEngine::new(session.dpop_key.clone());
        if let Some(nonce) = &session.dpop_host_nonce {
            engine.seed_nonce(&session.host_url, nonce.clone());
        }
        Self {
            registry,
            client,
            did: session.account_did,
            host: session.host_url,
            engine,
        }
    }

    pub fn did(&self) -> &Did {
        &self.did
    }

    pub fn host(&self) -> &Url {
        &self.host
    }

    /// Current token data, refreshing per `mode`.
    pub async fn token_info(&self, mode: TokenRefresh) -> Result<TokenInfo, OAuthError> {
        let session = self.registry.get(&self.did, mode.into()).await?;
        Ok(TokenInfo::from(&session.token_set))
    }

    /// Send an authenticated request to the user's authoritative server.
    ///
    /// Relative request URIs are resolved against the session host. The
    /// request is sent with the current access token and a fresh proof;
    /// on a 401 `invalid_token` challenge the token is force-refreshed
    /// and the request retried exactly once. If the retry is rejected
    /// the same way, the session is deleted (observably) and the failing
    /// response is returned — re-authentication is an application
    /// decision, not an error.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(did = %self.did)))]
    pub async fn fetch(
        &self,
        request: Request<Vec<u8>>,
    ) -> Result<Response<Vec<u8>>, OAuthError> {
        let (parts, body) = request.into_parts();
        let url = match parts.uri.scheme() {
            Some(_) => Url::parse(&parts.uri.to_string())?,
            None => {
                let path = parts
                    .uri
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/");
                self.host.join(path)?
            }
        };

        let session = self.registry.get(&self.did, GetOptions::default()).await?;
        let response = self
            .send_authenticated(&session, &parts.method, &url, &parts.headers, body.clone())
            .await?;
        if !invalid_token_challenge(&response) {
            return Ok(response);
        }

        // The server rejected the token outright. Refresh past staleness
        // and retry once with the replacement.
        let session = self.registry.get(&self.did, GetOptions::force()).await?;
        let response = self
            .send_authenticated(&session, &parts.method, &url, &parts.headers, body)
            .await?;
        if invalid_token_challenge(&response) {
            // a just-refreshed token was rejected; nothing further to
            // retry with
            self.registry.del(&self.did, DeleteCause::TokenRejected).await?;
        }
        Ok(response)
    }

    async fn send_authenticated(
        &self,
        session: &ClientSession,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: Vec<u8>,
    ) -> Result<Response<Vec<u8>>, OAuthError> {
        let mut builder = Request::builder().method(method.clone()).uri(url.as_str());
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        builder = builder.header(
            http::header::AUTHORIZATION,
            format!(
                "{} {}",
                session.token_set.token_type.as_str(),
                session.token_set.access_token
            ),
        );
        let request = builder.body(body)?;
        Ok(self.engine.send(self.client.as_ref(), request, false).await?)
    }

    /// Best-effort revoke at the authorization server, then always
    /// delete the local session.
    pub async fn sign_out(&self) -> Result<(), OAuthError> {
        self.registry.revoke(&self.did).await
    }
}

/// Does this response explicitly reject the presented token?
///
/// Both challenge forms count: the `WWW-Authenticate` header
/// (RFC 6750 / RFC 9449) and JSON error bodies.
fn invalid_token_challenge(response: &Response<Vec<u8>>) -> bool {
    if response.status() != StatusCode::UNAUTHORIZED {
        return false;
    }
    if let Some(www_auth) = response
        .headers()
        .get(http::header::WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
    {
        if www_auth.contains(r#"error="invalid_token""#) {
            return true;
        }
    }
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        error: SmolStr,
    }
    if let Ok(body) = serde_json::from_slice::<ErrorBody>(response.body()) {
        return matches!(body.error.as_str(), "invalid_token" | "InvalidToken" | "ExpiredToken");
    }
    false
}
