//! Server discovery: from an authoritative-server URL to validated OAuth
//! metadata.

use std::future::Future;

use http::{Request, StatusCode};
use miette::Diagnostic;
use url::Url;

use selvage_common::http::HttpClient;
use selvage_common::{AtIdentifier, Did};
use selvage_identity::ResolvedIdentity;
use selvage_identity::resolver::{IdentityError, IdentityResolver, ResolveOpts};

use crate::types::{AuthServerMetadata, ProtectedResourceMetadata};

/// Compare two issuer strings strictly but without spuriously failing on
/// trivial differences.
///
/// Rules:
/// - Schemes must match exactly.
/// - Hostnames and effective ports must match (treat missing port the same as default port).
/// - Path must match, except that an empty path and `/` are equivalent.
/// - Query/fragment are not considered; if present on either side, the comparison fails.
pub fn issuer_equivalent(a: &str, b: &str) -> bool {
    fn normalize(url: &Url) -> Option<(String, String, u16, String)> {
        if url.query().is_some() || url.fragment().is_some() {
            return None;
        }
        let scheme = url.scheme().to_string();
        let host = url.host_str()?.to_string();
        let port = url.port_or_known_default()?;
        let path = match url.path() {
            "" | "/" => "/".to_string(),
            other => other.to_string(),
        };
        Some((scheme, host, port, path))
    }

    match (Url::parse(a), Url::parse(b)) {
        (Ok(ua), Ok(ub)) => match (normalize(&ua), normalize(&ub)) {
            (Some((sa, ha, pa, path_a)), Some((sb, hb, pb, path_b))) => {
                sa == sb && ha == hb && pa == pb && path_a == path_b
            }
            _ => false,
        },
        _ => a == b,
    }
}

/// Errors from metadata discovery and validation.
#[derive(thiserror::Error, Debug, Diagnostic)]
pub enum DiscoveryError {
    #[error("login input is neither an identifier nor a service URL")]
    #[diagnostic(
        code(selvage_oauth::discovery::bad_input),
        help("supply a handle, a DID, or an https:// server URL")
    )]
    BadLoginInput,
    #[error("protected resource metadata is invalid: {0}")]
    #[diagnostic(
        code(selvage_oauth::discovery::protected_resource),
        help("the PDS must advertise exactly one authorization server")
    )]
    ProtectedResourceMetadata(String),
    #[error("authorization server metadata is invalid: {0}")]
    #[diagnostic(
        code(selvage_oauth::discovery::authorization_server),
        help("issuer must match the metadata URL and cover the PDS resource")
    )]
    AuthorizationServerMetadata(String),
    #[error("error resolving identity: {0}")]
    #[diagnostic(code(selvage_oauth::discovery::identity))]
    Identity(#[from] IdentityError),
    #[error("HTTP status {0}")]
    #[diagnostic(
        code(selvage_oauth::discovery::http_status),
        help("check the well-known paths and server configuration")
    )]
    HttpStatus(StatusCode),
    #[error("transport: {0}")]
    #[diagnostic(code(selvage_oauth::discovery::transport))]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::discovery::serde))]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::discovery::url))]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::discovery::http))]
    Http(#[from] http::Error),
}

async fn verify_token_issuer_impl<T: ServerDiscovery + Sync + ?Sized>(
    resolver: &T,
    server_metadata: &AuthServerMetadata,
    sub: &Did,
) -> Result<Url, DiscoveryError> {
    let (metadata, identity) = resolver.resolve_from_identity(sub.as_str()).await?;
    if !issuer_equivalent(&metadata.issuer, &server_metadata.issuer) {
        return Err(DiscoveryError::AuthorizationServerMetadata(
            "issuer mismatch".to_string(),
        ));
    }
    Ok(identity.pds)
}

async fn resolve_for_login_impl<T: ServerDiscovery + Sync + ?Sized>(
    resolver: &T,
    input: &str,
) -> Result<(AuthServerMetadata, Option<ResolvedIdentity>), DiscoveryError> {
    // Allow a PDS (or entryway) URL directly as login input, e.g. when the
    // user forgot their handle or the handle does not resolve
    if input.starts_with("https://") {
        let url = Url::parse(input).map_err(|_| DiscoveryError::BadLoginInput)?;
        Ok((resolver.resolve_from_service(&url).await?, None))
    } else {
        let (metadata, identity) = resolver.resolve_from_identity(input).await?;
        Ok((metadata, Some(identity)))
    }
}

async fn resolve_from_service_impl<T: ServerDiscovery + Sync + ?Sized>(
    resolver: &T,
    input: &Url,
) -> Result<AuthServerMetadata, DiscoveryError> {
    // Assume first that the input is a PDS URL (as the protocol requires)
    if let Ok(metadata) = resolver.get_resource_server_metadata(input).await {
        return Ok(metadata);
    }
    // Fall back to treating it as an issuer
    resolver.get_authorization_server_metadata(input).await
}

async fn resolve_from_identity_impl<T: ServerDiscovery + Sync + ?Sized>(
    resolver: &T,
    input: &str,
) -> Result<(AuthServerMetadata, ResolvedIdentity), DiscoveryError> {
    let ident = AtIdentifier::new(input)
        .map_err(|e| DiscoveryError::Identity(IdentityError::Identifier(e)))?;
    let identity = resolver.resolve(&ident, &ResolveOpts::default()).await?;
    let metadata = resolver.get_resource_server_metadata(&identity.pds).await?;
    Ok((metadata, identity))
}

async fn get_authorization_server_metadata_impl<T: HttpClient + Sync + ?Sized>(
    client: &T,
    issuer: &Url,
) -> Result<AuthServerMetadata, DiscoveryError> {
    let url = issuer.join("/.well-known/oauth-authorization-server")?;
    let req = Request::builder().uri(url.to_string()).body(Vec::new())?;
    let res = client
        .send_http(req)
        .await
        .map_err(|e| DiscoveryError::Transport(Box::new(e)))?;
    if res.status() != StatusCode::OK {
        return Err(DiscoveryError::HttpStatus(res.status()));
    }
    let mut metadata: AuthServerMetadata = serde_json::from_slice(res.body())?;
    // https://datatracker.ietf.org/doc/html/rfc8414#section-3.3
    // Accept a semantically equivalent issuer; normalize to the requested
    // URL form to avoid slash quirks downstream
    if issuer_equivalent(&metadata.issuer, issuer.as_str()) {
        metadata.issuer = issuer.as_str().into();
        Ok(metadata)
    } else {
        Err(DiscoveryError::AuthorizationServerMetadata(format!(
            "invalid issuer: {}",
            metadata.issuer
        )))
    }
}

async fn get_resource_server_metadata_impl<T: ServerDiscovery + Sync + ?Sized>(
    resolver: &T,
    pds: &Url,
) -> Result<AuthServerMetadata, DiscoveryError> {
    let rs_metadata = fetch_protected_resource_metadata(resolver, pds).await?;
    // The protocol requires one, and only one, authorization server entry
    let issuer = match &rs_metadata.authorization_servers {
        Some(servers) if !servers.is_empty() => {
            if servers.len() > 1 {
                return Err(DiscoveryError::ProtectedResourceMetadata(format!(
                    "unable to determine authorization server for PDS: {pds}"
                )));
            }
            &servers[0]
        }
        _ => {
            return Err(DiscoveryError::ProtectedResourceMetadata(format!(
                "no authorization server found for PDS: {pds}"
            )));
        }
    };
    let as_metadata = resolver.get_authorization_server_metadata(issuer).await?;
    // https://datatracker.ietf.org/doc/html/draft-ietf-oauth-resource-metadata-08#name-authorization-server-metada
    if let Some(protected_resources) = &as_metadata.protected_resources {
        let resource_url = rs_metadata
            .resource
            .strip_suffix('/')
            .unwrap_or(rs_metadata.resource.as_str());
        if !protected_resources.iter().any(|r| r.as_str() == resource_url) {
            return Err(DiscoveryError::AuthorizationServerMetadata(format!(
                "pds {pds}, resource {0} not protected by issuer {issuer}, protected resources: {1:?}",
                rs_metadata.resource, protected_resources
            )));
        }
    }
    Ok(as_metadata)
}

/// Fetch and validate a server's protected-resource metadata.
pub async fn fetch_protected_resource_metadata<T: HttpClient + ?Sized>(
    client: &T,
    server: &Url,
) -> Result<ProtectedResourceMetadata, DiscoveryError> {
    let url = server.join("/.well-known/oauth-protected-resource")?;
    let req = Request::builder().uri(url.to_string()).body(Vec::new())?;
    let res = client
        .send_http(req)
        .await
        .map_err(|e| DiscoveryError::Transport(Box::new(e)))?;
    if res.status() != StatusCode::OK {
        return Err(DiscoveryError::HttpStatus(res.status()));
    }
    let mut metadata: ProtectedResourceMetadata = serde_json::from_slice(res.body())?;
    // Accept a semantically equivalent resource URL, normalized to the
    // requested form
    if issuer_equivalent(&metadata.resource, server.as_str()) {
        metadata.resource = server.as_str().into();
        Ok(metadata)
    } else {
        Err(DiscoveryError::ProtectedResourceMetadata(format!(
            "invalid resource: {}",
            metadata.resource
        )))
    }
}

/// Discovery operations layered over identity resolution and HTTP.
///
/// Every method has a default implementation; mocks override the leaf
/// fetches in tests.
pub trait ServerDiscovery: IdentityResolver + HttpClient {
    /// Check that a subject's authoritative server really is governed by
    /// the issuer we hold metadata for, returning the PDS URL (the token
    /// audience).
    fn verify_token_issuer(
        &self,
        server_metadata: &AuthServerMetadata,
        sub: &Did,
    ) -> impl Future<Output = Result<Url, DiscoveryError>> + Send
    where
        Self: Sync,
    {
        verify_token_issuer_impl(self, server_metadata, sub)
    }

    /// Resolve login-box input (handle, DID, or `https://` service URL)
    /// to authorization-server metadata, plus the verified identity when
    /// the input named one.
    fn resolve_for_login(
        &self,
        input: &str,
    ) -> impl Future<Output = Result<(AuthServerMetadata, Option<ResolvedIdentity>), DiscoveryError>>
    + Send
    where
        Self: Sync,
    {
        resolve_for_login_impl(self, input)
    }

    /// Metadata for a bare service URL (PDS first, issuer as fallback).
    fn resolve_from_service(
        &self,
        input: &Url,
    ) -> impl Future<Output = Result<AuthServerMetadata, DiscoveryError>> + Send
    where
        Self: Sync,
    {
        resolve_from_service_impl(self, input)
    }

    /// Resolve an identifier to its PDS and that server's authorization
    /// metadata.
    fn resolve_from_identity(
        &self,
        input: &str,
    ) -> impl Future<Output = Result<(AuthServerMetadata, ResolvedIdentity), DiscoveryError>> + Send
    where
        Self: Sync,
    {
        resolve_from_identity_impl(self, input)
    }

    /// Fetch and validate `/.well-known/oauth-authorization-server`.
    fn get_authorization_server_metadata(
        &self,
        issuer: &Url,
    ) -> impl Future<Output = Result<AuthServerMetadata, DiscoveryError>> + Send
    where
        Self: Sync,
    {
        get_authorization_server_metadata_impl(self, issuer)
    }

    /// Fetch a PDS's protected-resource metadata and follow it to the
    /// (single) authorization server, validating both directions.
    fn get_resource_server_metadata(
        &self,
        pds: &Url,
    ) -> impl Future<Output = Result<AuthServerMetadata, DiscoveryError>> + Send
    where
        Self: Sync,
    {
        get_resource_server_metadata_impl(self, pds)
    }
}

impl ServerDiscovery for selvage_identity::PublicResolver {}
