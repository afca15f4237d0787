//! DPoP proof construction and the nonce-retry protocol.
//!
//! The engine binds every outgoing request to a private key: each proof
//! carries a fresh single-use `jti`, the method and full target URL, the
//! server-issued nonce when one is cached for that origin, and the hash
//! of the access token when one is attached. Proofs are never reused,
//! even for identical requests.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use dashmap::DashMap;
use http::{Request, Response, header::InvalidHeaderValue};
use jose_jwa::{Algorithm, Signing};
use jose_jwk::Key;
use miette::Diagnostic;
use rand::{RngCore, SeedableRng};
use smol_str::SmolStr;
use url::Url;

use selvage_common::http::HttpClient;

use crate::jose::{Claims, DpopClaims, JwsHeader, RegisteredClaims, create_signed_jwt};
use crate::keys::{KeyError, es256_signer, public_jwk};

pub const JWT_HEADER_TYP_DPOP: &str = "dpop+jwt";

#[derive(serde::Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Errors from proof construction or proof-carrying requests.
#[derive(thiserror::Error, Debug, Diagnostic)]
pub enum DpopError {
    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::dpop::header))]
    InvalidHeaderValue(#[from] InvalidHeaderValue),
    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::dpop::key))]
    Key(#[from] KeyError),
    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::dpop::serde))]
    SerdeJson(#[from] serde_json::Error),
    #[error("transport: {0}")]
    #[diagnostic(code(selvage_oauth::dpop::transport))]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

type Result<T> = core::result::Result<T, DpopError>;

/// Proof engine bound to one key, with a per-origin replay-nonce cache.
///
/// Server-issued nonces have no fixed lifetime; whenever a response
/// carries a fresher one for its origin, the cache is superseded.
pub struct DpopEngine {
    key: Key,
    nonces: DashMap<SmolStr, SmolStr>,
}

impl DpopEngine {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            nonces: DashMap::new(),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    fn origin(url: &Url) -> SmolStr {
        url.origin().ascii_serialization().into()
    }

    /// The cached nonce for a URL's origin, if any.
    pub fn nonce_for(&self, url: &Url) -> Option<SmolStr> {
        self.nonces.get(&Self::origin(url)).map(|n| n.clone())
    }

    /// Seed the nonce cache, e.g. from a persisted session.
    pub fn seed_nonce(&self, url: &Url, nonce: impl Into<SmolStr>) {
        self.nonces.insert(Self::origin(url), nonce.into());
    }

    /// Build a compact signed proof for one request.
    ///
    /// `url` keeps its query string; fragments never reach this layer
    /// (`http::Uri` cannot carry one). `ath` is the raw access token and
    /// is hashed here.
    pub fn proof(
        &self,
        method: &str,
        url: &str,
        nonce: Option<SmolStr>,
        access_token: Option<&str>,
    ) -> Result<SmolStr> {
        let mut header = JwsHeader::from(Algorithm::Signing(Signing::Es256));
        header.typ = Some(JWT_HEADER_TYP_DPOP.into());
        header.jwk = Some(public_jwk(&self.key)?);

        let claims = Claims {
            registered: RegisteredClaims {
                jti: Some(generate_jti()),
                iat: Some(Utc::now().timestamp()),
                ..Default::default()
            },
            dpop: DpopClaims {
                htm: Some(method.into()),
                htu: Some(url.into()),
                ath: access_token.map(crate::keys::token_hash),
                nonce,
            },
        };
        Ok(create_signed_jwt(es256_signer(&self.key)?, &header, &claims)?)
    }

    /// Send a request with a proof attached, retrying exactly once when
    /// the server demands a fresh nonce.
    ///
    /// `is_to_auth_server` selects which `use_dpop_nonce` signalling form
    /// applies (400 JSON body vs 401 `WWW-Authenticate`).
    pub async fn send<T: HttpClient + Sync>(
        &self,
        client: &T,
        mut request: Request<Vec<u8>>,
        is_to_auth_server: bool,
    ) -> Result<Response<Vec<u8>>> {
        let method = request.method().as_str().to_owned();
        let uri = request.uri().to_string();
        let url = Url::parse(&uri).ok();
        // https://datatracker.ietf.org/doc/html/rfc9449#section-4.2
        let ath = request
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("DPoP "))
            .map(SmolStr::new);

        let init_nonce = url.as_ref().and_then(|u| self.nonce_for(u));
        let init_proof = self.proof(&method, &uri, init_nonce.clone(), ath.as_deref())?;
        request.headers_mut().insert("DPoP", init_proof.parse()?);
        let retry = clone_request(&request);
        let response = client
            .send_http(request)
            .await
            .map_err(|e| DpopError::Transport(e.into()))?;

        let next_nonce = response
            .headers()
            .get("DPoP-Nonce")
            .and_then(|v| v.to_str().ok())
            .map(SmolStr::new);
        match &next_nonce {
            Some(nonce) if next_nonce != init_nonce => {
                // Store the fresh nonce for future requests
                if let Some(url) = &url {
                    self.seed_nonce(url, nonce.clone());
                }
            }
            _ => {
                // No nonce was returned or it is the same as the one we
                // sent; nothing to update and no reason to retry.
                return Ok(response);
            }
        }

        if !is_use_dpop_nonce_error(is_to_auth_server, &response) {
            return Ok(response);
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(uri = %uri, "retrying with fresh DPoP nonce");
        let mut request = retry;
        let next_proof = self.proof(&method, &uri, next_nonce, ath.as_deref())?;
        request.headers_mut().insert("DPoP", next_proof.parse()?);
        client
            .send_http(request)
            .await
            .map_err(|e| DpopError::Transport(e.into()))
    }
}

/// Rebuild a request for the single nonce retry (`http::Request` is not
/// clonable).
fn clone_request(request: &Request<Vec<u8>>) -> Request<Vec<u8>> {
    let mut builder = Request::builder()
        .method(request.method().clone())
        .uri(request.uri().clone());
    for (name, value) in request.headers() {
        builder = builder.header(name, value);
    }
    builder
        .body(request.body().clone())
        .expect("rebuilding a valid request cannot fail")
}

#[inline]
fn is_use_dpop_nonce_error(is_to_auth_server: bool, response: &Response<Vec<u8>>) -> bool {
    // https://datatracker.ietf.org/doc/html/rfc9449#name-authorization-server-provid
    if is_to_auth_server {
        if response.status() == 400 {
            if let Ok(res) = serde_json::from_slice::<ErrorResponse>(response.body()) {
                return res.error == "use_dpop_nonce";
            }
        }
    }
    // https://datatracker.ietf.org/doc/html/rfc6750#section-3
    // https://datatracker.ietf.org/doc/html/rfc9449#name-resource-server-provided-no
    else if response.status() == 401 {
        if let Some(www_auth) = response
            .headers()
            .get(http::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
        {
            return www_auth.starts_with("DPoP") && www_auth.contains(r#"error="use_dpop_nonce""#);
        }
    }
    false
}

#[inline]
pub(crate) fn generate_jti() -> SmolStr {
    let mut rng = rand::rngs::SmallRng::from_entropy();
    let mut bytes = [0u8; 12];
    rng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes).into()
}
