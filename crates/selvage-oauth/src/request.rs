//! Token-endpoint plumbing: client authentication, PAR, code exchange,
//! refresh, and revocation.

use chrono::{Duration as TimeDelta, Utc};
use http::{Method, Request, StatusCode};
use jose_jwa::{Algorithm, Signing};
use miette::Diagnostic;
use serde::Serialize;
use serde_json::Value;
use smol_str::SmolStr;
use url::Url;

use selvage_common::Did;
use selvage_common::http::HttpClient;
use selvage_common::types::IdentifierError;

use crate::FALLBACK_ALG;
use crate::discovery::{DiscoveryError, ServerDiscovery};
use crate::dpop::{DpopEngine, DpopError};
use crate::jose::{JwsHeader, RegisteredClaims, create_signed_jwt};
use crate::keys::{KeyError, compare_algos, es256_signer, generate_nonce};
use crate::session::ClientSession;
use crate::types::{
    AuthServerMetadata, ClientConfig, ConfigError, GrantType, ParParameters, ParResponse,
    RefreshRequestParameters, RevocationRequestParameters, TokenRequestParameters, TokenResponse,
    TokenSet,
};

// https://datatracker.ietf.org/doc/html/rfc7523#section-2.2
const CLIENT_ASSERTION_TYPE_JWT_BEARER: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Errors from token-endpoint operations.
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum RequestError {
    /// Server does not advertise the endpoint this operation needs
    #[error("no {0} endpoint available")]
    #[diagnostic(
        code(selvage_oauth::request::no_endpoint),
        help("server does not advertise this endpoint")
    )]
    NoEndpoint(&'static str),

    /// Token response failed verification (e.g., missing `sub`)
    #[error("token response verification failed")]
    #[diagnostic(code(selvage_oauth::request::token_verification))]
    TokenVerification,

    /// No client-authentication method both sides support
    #[error("no mutually supported client authentication method")]
    #[diagnostic(
        code(selvage_oauth::request::auth_method),
        help("server must support `private_key_jwt` or `none`; configure client metadata accordingly")
    )]
    AuthMethodUnsatisfiable,

    /// Session holds no refresh token; detected before any network call
    #[error("no refresh token available")]
    #[diagnostic(code(selvage_oauth::request::no_refresh_token))]
    NoRefreshToken,

    /// Server cannot mint a key for any algorithm it advertises
    #[error("server advertises no supported proof-of-possession algorithm")]
    #[diagnostic(code(selvage_oauth::request::key_generation))]
    KeyGeneration,

    /// Server reports the grant (e.g. a single-use refresh token) is no
    /// longer valid
    #[error("invalid grant{}", .description.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    #[diagnostic(
        code(selvage_oauth::request::invalid_grant),
        help("the refresh token was already used or revoked")
    )]
    InvalidGrant {
        /// Server-supplied detail, if any
        description: Option<SmolStr>,
    },

    /// Client error with a JSON body other than `invalid_grant`
    #[error("http status {status}, body: {body:?}")]
    #[diagnostic(
        code(selvage_oauth::request::http_status_body),
        help("inspect the server's `error` and `error_description` fields")
    )]
    HttpStatusWithBody {
        status: StatusCode,
        body: Value,
    },

    /// Unexpected status with no usable body
    #[error("http status {0}")]
    #[diagnostic(code(selvage_oauth::request::http_status))]
    HttpStatus(StatusCode),

    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::request::dpop))]
    Dpop(#[from] DpopError),

    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::request::key))]
    Key(#[from] KeyError),

    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::request::discovery))]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::request::identifier))]
    Identifier(#[from] IdentifierError),

    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::request::config))]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::request::http_build))]
    HttpBuild(#[from] http::Error),

    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::request::serde_form))]
    SerdeHtmlForm(#[from] serde_html_form::ser::Error),

    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::request::serde_json))]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::request::url))]
    Url(#[from] url::ParseError),
}

impl RequestError {
    /// Whether this is the server telling us the grant itself is dead.
    pub fn is_invalid_grant(&self) -> bool {
        matches!(self, RequestError::InvalidGrant { .. })
    }
}

pub type Result<T> = core::result::Result<T, RequestError>;

/// One of the POST operations a token endpoint family supports.
pub enum TokenEndpointRequest {
    Token(TokenRequestParameters),
    Refresh(RefreshRequestParameters),
    Revocation(RevocationRequestParameters),
    Par(ParParameters),
}

impl TokenEndpointRequest {
    fn name(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::Refresh(_) => "refresh",
            Self::Revocation(_) => "revocation",
            Self::Par(_) => "pushed_authorization_request",
        }
    }

    fn expected_status(&self) -> StatusCode {
        match self {
            Self::Token(_) | Self::Refresh(_) => StatusCode::OK,
            Self::Par(_) => StatusCode::CREATED,
            // Unlike https://datatracker.ietf.org/doc/html/rfc7009#section-2.2,
            // implementations in the wild return 204.
            Self::Revocation(_) => StatusCode::NO_CONTENT,
        }
    }

    fn endpoint<'m>(&self, metadata: &'m AuthServerMetadata) -> Option<&'m SmolStr> {
        match self {
            Self::Token(_) | Self::Refresh(_) => Some(&metadata.token_endpoint),
            Self::Revocation(_) => metadata.revocation_endpoint.as_ref(),
            Self::Par(_) => metadata.pushed_authorization_request_endpoint.as_ref(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RequestPayload<T>
where
    T: Serialize,
{
    client_id: SmolStr,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_assertion_type: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_assertion: Option<SmolStr>,
    #[serde(flatten)]
    parameters: T,
}

#[derive(Debug, Clone, Default)]
struct ClientAuth {
    client_id: SmolStr,
    assertion_type: Option<SmolStr>,
    assertion: Option<SmolStr>,
}

/// Pick a client-authentication method both sides support and produce
/// the credentials for it.
fn build_auth(config: &ClientConfig, metadata: &AuthServerMetadata) -> Result<ClientAuth> {
    let supported = metadata.token_endpoint_auth_methods_supported.as_deref();
    let client_id: SmolStr = config.client_id.as_str().into();
    let server_supports =
        |method: &str| supported.is_some_and(|methods| methods.iter().any(|m| m.as_str() == method));

    match config.token_endpoint_auth_method {
        crate::types::AuthMethod::None if server_supports("none") => Ok(ClientAuth {
            client_id,
            assertion_type: None,
            assertion: None,
        }),
        crate::types::AuthMethod::PrivateKeyJwt if server_supports("private_key_jwt") => {
            let Some(key) = &config.signing_key else {
                return Err(ConfigError::MissingSigningKey.into());
            };
            let mut algs = metadata
                .token_endpoint_auth_signing_alg_values_supported
                .clone()
                .unwrap_or_else(|| vec![FALLBACK_ALG.into()]);
            algs.sort_by(compare_algos);
            if !algs.iter().any(|alg| alg.as_str() == "ES256") {
                return Err(RequestError::AuthMethodUnsatisfiable);
            }
            let iat = Utc::now().timestamp();
            let mut header = JwsHeader::from(Algorithm::Signing(Signing::Es256));
            header.kid = None;
            // https://datatracker.ietf.org/doc/html/rfc7523#section-3
            let claims = RegisteredClaims {
                iss: Some(client_id.clone()),
                sub: Some(client_id.clone()),
                aud: Some(metadata.issuer.clone()),
                exp: Some(iat + 60),
                // "iat" MUST be less than one minute old
                // https://datatracker.ietf.org/doc/html/rfc9101
                iat: Some(iat),
                // atproto oauth providers require "jti" to be present
                jti: Some(generate_nonce()),
                ..Default::default()
            };
            let assertion = create_signed_jwt(es256_signer(key)?, &header, &claims.into())?;
            Ok(ClientAuth {
                client_id,
                assertion_type: Some(CLIENT_ASSERTION_TYPE_JWT_BEARER.into()),
                assertion: Some(assertion),
            })
        }
        _ => Err(RequestError::AuthMethodUnsatisfiable),
    }
}

fn build_body<S: Serialize>(auth: ClientAuth, parameters: S) -> Result<String> {
    Ok(serde_html_form::to_string(RequestPayload {
        client_id: auth.client_id,
        client_assertion_type: auth.assertion_type,
        client_assertion: auth.assertion,
        parameters,
    })?)
}

/// POST a request to the appropriate endpoint with client authentication
/// and a DPoP proof, mapping error responses to typed failures.
pub async fn token_endpoint_request<T, O>(
    client: &T,
    engine: &DpopEngine,
    config: &ClientConfig,
    metadata: &AuthServerMetadata,
    request: TokenEndpointRequest,
) -> Result<O>
where
    T: HttpClient + Sync,
    O: serde::de::DeserializeOwned,
{
    let Some(endpoint) = request.endpoint(metadata) else {
        return Err(RequestError::NoEndpoint(request.name()));
    };
    let auth = build_auth(config, metadata)?;
    let body = match &request {
        TokenEndpointRequest::Token(params) => build_body(auth, params)?,
        TokenEndpointRequest::Refresh(params) => build_body(auth, params)?,
        TokenEndpointRequest::Revocation(params) => build_body(auth, params)?,
        TokenEndpointRequest::Par(params) => build_body(auth, params)?,
    };
    let req = Request::builder()
        .uri(endpoint.as_str())
        .method(Method::POST)
        .header(http::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body.into_bytes())?;
    let res = engine.send(client, req, true).await?;

    if res.status() == request.expected_status() {
        if res.body().is_empty() {
            // an empty body cannot be deserialized; substitute "null" so
            // `()` outputs work
            Ok(serde_json::from_slice(b"null")?)
        } else {
            Ok(serde_json::from_slice(res.body())?)
        }
    } else if res.status().is_client_error() {
        let body: Value = serde_json::from_slice(res.body()).unwrap_or(Value::Null);
        if body.get("error").and_then(Value::as_str) == Some("invalid_grant") {
            Err(RequestError::InvalidGrant {
                description: body
                    .get("error_description")
                    .and_then(Value::as_str)
                    .map(SmolStr::new),
            })
        } else {
            Err(RequestError::HttpStatusWithBody {
                status: res.status(),
                body,
            })
        }
    } else {
        Err(RequestError::HttpStatus(res.status()))
    }
}

/// Push the authorization parameters, returning the request URI to send
/// the user's browser to. PAR is mandatory in this profile; a server
/// without the endpoint is rejected.
#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all))]
pub async fn push_authorization_request<T>(
    client: &T,
    engine: &DpopEngine,
    config: &ClientConfig,
    metadata: &AuthServerMetadata,
    parameters: ParParameters,
) -> Result<ParResponse>
where
    T: HttpClient + Sync,
{
    token_endpoint_request(client, engine, config, metadata, TokenEndpointRequest::Par(parameters))
        .await
}

/// Exchange an authorization code for tokens.
#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all))]
pub async fn exchange_code<T>(
    client: &T,
    engine: &DpopEngine,
    config: &ClientConfig,
    metadata: &AuthServerMetadata,
    code: &str,
    verifier: &str,
    redirect_uri: &Url,
) -> Result<TokenSet>
where
    T: ServerDiscovery + Sync,
{
    let response: TokenResponse = token_endpoint_request(
        client,
        engine,
        config,
        metadata,
        TokenEndpointRequest::Token(TokenRequestParameters {
            grant_type: GrantType::AuthorizationCode,
            code: code.into(),
            redirect_uri: redirect_uri.as_str().into(),
            code_verifier: verifier.into(),
        }),
    )
    .await?;
    let Some(sub) = response.sub else {
        return Err(RequestError::TokenVerification);
    };
    let sub = Did::new(&sub)?;
    // The token response MUST be valid before the "sub" it contains can
    // be trusted: the issuer must really govern that subject's server.
    let aud = client.verify_token_issuer(metadata, &sub).await?;

    let expires_at = response
        .expires_in
        .and_then(|expires_in| Utc::now().checked_add_signed(TimeDelta::seconds(expires_in)));
    Ok(TokenSet {
        iss: metadata.issuer.clone(),
        sub,
        aud: aud.as_str().into(),
        scope: response.scope,
        access_token: response.access_token,
        refresh_token: response.refresh_token,
        token_type: response.token_type,
        expires_at,
    })
}

/// Refresh a session's tokens, returning the replacement session.
///
/// Fails with [`RequestError::NoRefreshToken`] before any network call
/// when the session has nothing to refresh with. The session's DPoP key
/// is reused; only the token set (and the latest authserver nonce) are
/// replaced.
#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(did = %session.account_did)))]
pub async fn refresh_token_grant<T>(
    client: &T,
    config: &ClientConfig,
    metadata: &AuthServerMetadata,
    mut session: ClientSession,
) -> Result<ClientSession>
where
    T: ServerDiscovery + Sync,
{
    let Some(refresh_token) = session.token_set.refresh_token.clone() else {
        return Err(RequestError::NoRefreshToken);
    };

    // The "sub" MUST be a DID whose issuer authority is the server we are
    // about to ask for credentials. Checked *before* the refresh so the
    // refresh is the last async operation and its result gets stored with
    // as few suspension points as possible after the single-use token is
    // consumed.
    let aud = client
        .verify_token_issuer(metadata, &session.token_set.sub)
        .await?;

    let engine = DpopEngine::new(session.dpop_key.clone());
    let token_endpoint = Url::parse(&metadata.token_endpoint)?;
    if let Some(nonce) = &session.dpop_authserver_nonce {
        engine.seed_nonce(&token_endpoint, nonce.clone());
    }

    let response: TokenResponse = token_endpoint_request(
        client,
        &engine,
        config,
        metadata,
        TokenEndpointRequest::Refresh(RefreshRequestParameters {
            grant_type: GrantType::RefreshToken,
            refresh_token,
            scope: None,
        }),
    )
    .await?;

    let expires_at = response
        .expires_in
        .and_then(|expires_in| Utc::now().checked_add_signed(TimeDelta::seconds(expires_in)));
    session.token_set = TokenSet {
        iss: metadata.issuer.clone(),
        sub: session.token_set.sub.clone(),
        aud: aud.as_str().into(),
        scope: response.scope,
        access_token: response.access_token,
        refresh_token: response.refresh_token,
        token_type: response.token_type,
        expires_at,
    };
    session.dpop_authserver_nonce = engine.nonce_for(&token_endpoint);
    Ok(session)
}

/// Best-effort token revocation.
#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all))]
pub async fn revoke_token<T>(
    client: &T,
    engine: &DpopEngine,
    config: &ClientConfig,
    metadata: &AuthServerMetadata,
    token: &str,
) -> Result<()>
where
    T: HttpClient + Sync,
{
    token_endpoint_request::<T, ()>(
        client,
        engine,
        config,
        metadata,
        TokenEndpointRequest::Revocation(RevocationRequestParameters {
            token: token.into(),
        }),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AuthMethod;

    fn base_metadata() -> AuthServerMetadata {
        let mut metadata = AuthServerMetadata::default();
        metadata.issuer = "https://issuer".into();
        metadata.authorization_endpoint = "https://issuer/authorize".into();
        metadata.token_endpoint = "https://issuer/token".into();
        metadata.token_endpoint_auth_methods_supported = Some(vec!["none".into()]);
        metadata
    }

    fn config() -> ClientConfig {
        ClientConfig::localhost(None, "atproto").unwrap()
    }

    #[test]
    fn auth_none_sends_client_id_only() {
        let auth = build_auth(&config(), &base_metadata()).unwrap();
        assert_eq!(auth.client_id, "http://localhost/");
        assert!(auth.assertion.is_none());
        assert!(auth.assertion_type.is_none());
    }

    #[test]
    fn auth_method_must_be_mutual() {
        let mut metadata = base_metadata();
        metadata.token_endpoint_auth_methods_supported = Some(vec!["private_key_jwt".into()]);
        // client wants "none", server only offers private_key_jwt
        let err = build_auth(&config(), &metadata).unwrap_err();
        assert!(matches!(err, RequestError::AuthMethodUnsatisfiable));

        // and with nothing advertised at all
        metadata.token_endpoint_auth_methods_supported = None;
        let err = build_auth(&config(), &metadata).unwrap_err();
        assert!(matches!(err, RequestError::AuthMethodUnsatisfiable));
    }

    #[test]
    fn private_key_jwt_assertion_shape() {
        let mut metadata = base_metadata();
        metadata.token_endpoint_auth_methods_supported = Some(vec!["private_key_jwt".into()]);
        metadata.token_endpoint_auth_signing_alg_values_supported = Some(vec!["ES256".into()]);
        let mut config = config();
        config.token_endpoint_auth_method = AuthMethod::PrivateKeyJwt;
        config.signing_key = Some(crate::keys::generate_key(&["ES256".into()]).unwrap());
        config.token_endpoint_auth_signing_alg = Some("ES256".into());

        let auth = build_auth(&config, &metadata).unwrap();
        assert_eq!(
            auth.assertion_type.as_deref(),
            Some(CLIENT_ASSERTION_TYPE_JWT_BEARER)
        );
        let assertion = auth.assertion.unwrap();
        assert_eq!(assertion.split('.').count(), 3);
    }

    #[test]
    fn form_body_flattens_parameters() {
        let auth = build_auth(&config(), &base_metadata()).unwrap();
        let body = build_body(
            auth,
            RefreshRequestParameters {
                grant_type: GrantType::RefreshToken,
                refresh_token: "rt1".into(),
                scope: None,
            },
        )
        .unwrap();
        assert!(body.contains("grant_type=refresh_token"));
        assert!(body.contains("refresh_token=rt1"));
        assert!(body.contains("client_id="));
        assert!(!body.contains("scope="));
    }
}
