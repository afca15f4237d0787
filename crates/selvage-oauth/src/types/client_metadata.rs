use std::str::FromStr;

use jose_jwk::{JwkSet, Key};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;
use url::{Host, Url};

/// The client metadata document published at the client id URL.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientMetadata {
    pub client_id: Url,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_uri: Option<Url>,
    pub redirect_uris: Vec<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_types: Option<Vec<SmolStr>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_method: Option<SmolStr>,
    // https://datatracker.ietf.org/doc/html/rfc9449#section-5.2
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dpop_bound_access_tokens: Option<bool>,
    // https://datatracker.ietf.org/doc/html/rfc7591#section-2
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks: Option<JwkSet>,
    // https://openid.net/specs/openid-connect-registration-1_0.html#ClientMetadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_signing_alg: Option<SmolStr>,
}

/// Errors producing a client metadata document from a [`ClientConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("`redirect_uris` must not be empty")]
    EmptyRedirectUris,
    #[error("`grant_types` must include `authorization_code`")]
    InvalidGrantTypes,
    #[error("`private_key_jwt` auth method requires a signing key")]
    MissingSigningKey,
    #[error(
        "`private_key_jwt` auth method requires `token_endpoint_auth_signing_alg`, otherwise it must not be provided"
    )]
    AuthSigningAlg,
    #[error("signing key must be an EC P-256 (ES256) key")]
    UnsupportedSigningKey,
    #[error("loopback client redirect_uri must use `http:` scheme")]
    NotHttpScheme,
    #[error("loopback client must not use `localhost` as redirect_uri hostname")]
    Localhost,
    #[error("loopback client redirect_uri host must be a loopback address")]
    NotLoopbackHost,
}

/// Client authentication method negotiated with the token endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    None,
    // https://openid.net/specs/openid-connect-core-1_0.html#ClientAuthentication
    PrivateKeyJwt,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::PrivateKeyJwt => "private_key_jwt",
        }
    }
}

/// Grant types a client may request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::RefreshToken => "refresh_token",
        }
    }
}

/// Application-supplied client configuration.
///
/// [`ClientConfig::client_metadata`] validates it and produces the
/// document form; validation failures here are local and never reach the
/// network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    pub client_id: Url,
    pub client_uri: Option<Url>,
    pub redirect_uris: Vec<Url>,
    pub token_endpoint_auth_method: AuthMethod,
    pub grant_types: Vec<GrantType>,
    /// Space-separated scope string requested at authorization
    pub scope: SmolStr,
    /// ES256 private key for `private_key_jwt` client assertions
    pub signing_key: Option<Key>,
    pub token_endpoint_auth_signing_alg: Option<SmolStr>,
}

impl ClientConfig {
    /// Loopback development client (`http://localhost` client id).
    ///
    /// Redirect URIs default to `http://127.0.0.1/` and `http://[::1]/`;
    /// explicit ones must be plain-http loopback addresses, and the
    /// literal hostname `localhost` is rejected per the atproto profile.
    pub fn localhost(
        redirect_uris: Option<Vec<Url>>,
        scope: impl Into<SmolStr>,
    ) -> Result<Self, ConfigError> {
        if let Some(redirect_uris) = &redirect_uris {
            for redirect_uri in redirect_uris {
                if redirect_uri.scheme() != "http" {
                    return Err(ConfigError::NotHttpScheme);
                }
                let host = redirect_uri.host().map(|h| h.to_owned());
                if host == Some(Host::parse("localhost").unwrap()) {
                    return Err(ConfigError::Localhost);
                }
                if host.map_or(true, |host| {
                    host != Host::parse("127.0.0.1").unwrap()
                        && host != Host::parse("[::1]").unwrap()
                }) {
                    return Err(ConfigError::NotLoopbackHost);
                }
            }
        }
        Ok(Self {
            client_id: Url::parse("http://localhost").unwrap(),
            client_uri: None,
            redirect_uris: redirect_uris.unwrap_or_else(|| {
                vec![
                    Url::from_str("http://127.0.0.1/").unwrap(),
                    Url::from_str("http://[::1]/").unwrap(),
                ]
            }),
            token_endpoint_auth_method: AuthMethod::None,
            grant_types: vec![GrantType::AuthorizationCode, GrantType::RefreshToken],
            scope: scope.into(),
            signing_key: None,
            token_endpoint_auth_signing_alg: None,
        })
    }

    /// Validate the configuration and produce the published metadata
    /// document.
    pub fn client_metadata(&self) -> Result<ClientMetadata, ConfigError> {
        if self.redirect_uris.is_empty() {
            return Err(ConfigError::EmptyRedirectUris);
        }
        if !self.grant_types.contains(&GrantType::AuthorizationCode) {
            return Err(ConfigError::InvalidGrantTypes);
        }
        let mut jwks = None;
        match self.token_endpoint_auth_method {
            AuthMethod::None => {
                if self.token_endpoint_auth_signing_alg.is_some() {
                    return Err(ConfigError::AuthSigningAlg);
                }
            }
            AuthMethod::PrivateKeyJwt => {
                let Some(key) = &self.signing_key else {
                    return Err(ConfigError::MissingSigningKey);
                };
                if self.token_endpoint_auth_signing_alg.is_none() {
                    return Err(ConfigError::AuthSigningAlg);
                }
                // only the public half is ever published
                let public = crate::keys::public_jwk(key)
                    .map_err(|_| ConfigError::UnsupportedSigningKey)?;
                jwks = Some(JwkSet { keys: vec![public] });
            }
        }
        Ok(ClientMetadata {
            client_id: self.client_id.clone(),
            client_uri: self.client_uri.clone(),
            redirect_uris: self.redirect_uris.clone(),
            scope: Some(self.scope.clone()),
            grant_types: Some(self.grant_types.iter().map(|g| g.as_str().into()).collect()),
            token_endpoint_auth_method: Some(self.token_endpoint_auth_method.as_str().into()),
            dpop_bound_access_tokens: Some(true),
            jwks_uri: None,
            jwks,
            token_endpoint_auth_signing_alg: self.token_endpoint_auth_signing_alg.clone(),
        })
    }
}
