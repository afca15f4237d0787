//! Identity resolution: handle → DID and DID → document, with mutual
//! validation between the two directions.
//!
//! Resolution never follows HTTP redirects: a server that could bounce a
//! document fetch to another origin could otherwise substitute an
//! attacker-controlled identity. The bundled [`crate::PublicResolver`]
//! pins a no-redirect HTTP client for this reason.

use std::future::Future;
use std::time::Duration;

use bon::Builder;
use http::StatusCode;
use miette::Diagnostic;
use smol_str::SmolStr;
use thiserror::Error;
use url::Url;

use selvage_common::types::IdentifierError;
use selvage_common::{AtIdentifier, Did, DidDocument, Handle};

/// Errors that can occur during identity resolution.
///
/// Every kind is distinct so callers can tell "try again" (transport,
/// status) from "reject" (mismatch, unsupported method) without string
/// matching.
#[derive(Debug, Error, Diagnostic)]
pub enum IdentityError {
    /// Input failed local validation; no network call was made
    #[error(transparent)]
    #[diagnostic(code(selvage_identity::identifier))]
    Identifier(#[from] IdentifierError),
    /// No configured method produced a DID for this handle
    #[error("could not resolve handle {0}")]
    #[diagnostic(
        code(selvage_identity::handle_resolution),
        help("check the handle's well-known endpoint or configure a resolution service")
    )]
    HandleResolution(Handle),
    /// Well-known atproto-did body was not a DID
    #[error("invalid well-known atproto-did content")]
    #[diagnostic(
        code(selvage_identity::invalid_well_known),
        help("expected first non-empty line to be a DID")
    )]
    InvalidWellKnown,
    /// DID uses a method this resolver has no fetcher for
    #[error("unsupported DID method: {0}")]
    #[diagnostic(
        code(selvage_identity::unsupported_did_method),
        help("supported DID methods: did:web, did:plc")
    )]
    UnsupportedDidMethod(SmolStr),
    /// Document contains no usable authoritative-server entry
    #[error("missing PDS endpoint in DID document")]
    #[diagnostic(code(selvage_identity::missing_pds_endpoint))]
    MissingPdsEndpoint,
    /// The document's claimed handle does not match the handle that
    /// initiated resolution. Neither side is trusted.
    #[error("handle mismatch: resolved {input} but document claims {claimed:?}")]
    #[diagnostic(
        code(selvage_identity::handle_mismatch),
        help("the handle and the DID document disagree; do not trust this identity")
    )]
    HandleMismatch {
        /// Handle the caller asked to resolve
        input: Handle,
        /// Handle the document claims, if any parsed
        claimed: Option<Handle>,
    },
    /// Document `id` differs from the DID that was fetched
    #[error("DID document id mismatch: requested {expected}, document says {found}")]
    #[diagnostic(
        code(selvage_identity::doc_id_mismatch),
        help("document id differs from the requested DID; do not trust this document")
    )]
    DocIdMismatch {
        /// DID used for the fetch
        expected: Did,
        /// DID the document asserts
        found: Did,
    },
    /// Non-success HTTP status from a resolution endpoint
    #[error("HTTP status {0}")]
    #[diagnostic(
        code(selvage_identity::http_status),
        help("verify well-known paths or the directory endpoint")
    )]
    HttpStatus(StatusCode),
    /// Transport-level failure
    #[error("transport error: {0}")]
    #[diagnostic(code(selvage_identity::transport))]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// DNS lookup failure
    #[error("DNS error: {0}")]
    #[cfg(feature = "dns")]
    #[diagnostic(code(selvage_identity::dns))]
    Dns(#[from] hickory_resolver::error::ResolveError),
    /// Serialize/deserialize error
    #[error("serialize/deserialize error: {0}")]
    #[diagnostic(code(selvage_identity::serde))]
    Serde(#[from] serde_json::Error),
    /// URL construction error
    #[error("URL parse error: {0}")]
    #[diagnostic(code(selvage_identity::url))]
    Url(#[from] url::ParseError),
}

impl From<reqwest::Error> for IdentityError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(Box::new(e))
    }
}

/// Result alias for identity resolution.
pub type Result<T> = core::result::Result<T, IdentityError>;

/// Configurable resolver options.
///
/// - `plc_directory`: base URL of the centralized `did:plc` directory.
/// - `handle_endpoint`: optional XRPC-style service used to resolve
///   handles after the well-known method; disabled when `None`.
/// - `handle_ttl` / `doc_ttl`: cache lifetimes. Handles can be repointed
///   at any time, so their cache is short; documents are comparatively
///   stable and get a long one.
/// - `validate_doc_id`: require the fetched document's `id` to equal the
///   requested DID (default true).
#[derive(Debug, Clone, Builder)]
#[builder(start_fn = new)]
pub struct ResolverOptions {
    /// Base URL for the did:plc directory
    pub plc_directory: Url,
    /// Optional resolution service for handles
    pub handle_endpoint: Option<Url>,
    /// Cache lifetime for handle → DID entries
    pub handle_ttl: Duration,
    /// Cache lifetime for DID → document entries
    pub doc_ttl: Duration,
    /// Validate that the fetched document id matches the requested DID
    pub validate_doc_id: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self::new()
            .plc_directory(Url::parse("https://plc.directory/").expect("valid url"))
            .handle_endpoint(Url::parse("https://public.api.bsky.app/").expect("valid url"))
            .handle_ttl(Duration::from_secs(5 * 60))
            .doc_ttl(Duration::from_secs(60 * 60))
            .validate_doc_id(true)
            .build()
    }
}

/// Per-call resolution options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOpts {
    /// Skip cache reads (results are still written back)
    pub no_cache: bool,
}

impl ResolveOpts {
    /// Options that bypass cache reads.
    pub fn fresh() -> Self {
        Self { no_cache: true }
    }
}

/// The verified output of resolution.
///
/// Constructed once per resolution call and never mutated. Whatever layer
/// performed the underlying lookups owns caching; this value does not
/// cache itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedIdentity {
    /// The account's DID
    pub did: Did,
    /// The document's claimed handle, normalized, if any
    pub handle: Option<Handle>,
    /// The authoritative personal data server (no trailing slash)
    pub pds: Url,
    /// True only when resolution started from a handle and the document's
    /// claim matched it. DID-initiated resolution carries the claimed
    /// handle unverified.
    pub handle_is_verified: bool,
}

/// Trait for identity resolution, for pluggable implementations.
///
/// Implementors supply the two primitive lookups; the verified
/// [`resolve`](IdentityResolver::resolve) flow is provided.
pub trait IdentityResolver {
    /// Access options for validation decisions in provided methods
    fn options(&self) -> &ResolverOptions;

    /// Resolve a handle to its DID
    fn resolve_handle(
        &self,
        handle: &Handle,
        opts: &ResolveOpts,
    ) -> impl Future<Output = Result<Did>> + Send
    where
        Self: Sync;

    /// Fetch the DID document for a DID
    fn resolve_did_doc(
        &self,
        did: &Did,
        opts: &ResolveOpts,
    ) -> impl Future<Output = Result<DidDocument>> + Send
    where
        Self: Sync;

    /// Resolve an identifier to a verified identity.
    ///
    /// For handle input the document's claimed handle must equal the input
    /// (case-insensitively, both sides normalized); on mismatch resolution
    /// fails with [`IdentityError::HandleMismatch`] rather than trusting
    /// either side.
    fn resolve(
        &self,
        ident: &AtIdentifier,
        opts: &ResolveOpts,
    ) -> impl Future<Output = Result<ResolvedIdentity>> + Send
    where
        Self: Sync,
    {
        async move {
            match ident {
                AtIdentifier::Handle(handle) => {
                    let did = self.resolve_handle(handle, opts).await?;
                    let doc = self.resolve_did_doc(&did, opts).await?;
                    if self.options().validate_doc_id && doc.id != did {
                        return Err(IdentityError::DocIdMismatch {
                            expected: did,
                            found: doc.id,
                        });
                    }
                    let pds = doc.pds_endpoint().ok_or(IdentityError::MissingPdsEndpoint)?;
                    let claimed = doc.handle();
                    // Bi-directional check: handles are lowercased on
                    // construction, so equality here is case-insensitive.
                    if claimed.as_ref() != Some(handle) {
                        return Err(IdentityError::HandleMismatch {
                            input: handle.clone(),
                            claimed,
                        });
                    }
                    Ok(ResolvedIdentity {
                        did,
                        handle: claimed,
                        pds,
                        handle_is_verified: true,
                    })
                }
                AtIdentifier::Did(did) => {
                    let doc = self.resolve_did_doc(did, opts).await?;
                    if self.options().validate_doc_id && &doc.id != did {
                        return Err(IdentityError::DocIdMismatch {
                            expected: did.clone(),
                            found: doc.id,
                        });
                    }
                    let pds = doc.pds_endpoint().ok_or(IdentityError::MissingPdsEndpoint)?;
                    Ok(ResolvedIdentity {
                        did: did.clone(),
                        handle: doc.handle(),
                        pds,
                        handle_is_verified: false,
                    })
                }
            }
        }
    }

    /// Resolve an identifier straight to its authoritative-server URL.
    fn resolve_pds_url(
        &self,
        ident: &AtIdentifier,
        opts: &ResolveOpts,
    ) -> impl Future<Output = Result<Url>> + Send
    where
        Self: Sync,
    {
        async move { Ok(self.resolve(ident, opts).await?.pds) }
    }
}

impl<T: IdentityResolver + Sync> IdentityResolver for std::sync::Arc<T> {
    fn options(&self) -> &ResolverOptions {
        self.as_ref().options()
    }

    async fn resolve_handle(&self, handle: &Handle, opts: &ResolveOpts) -> Result<Did> {
        self.as_ref().resolve_handle(handle, opts).await
    }

    async fn resolve_did_doc(&self, did: &Did, opts: &ResolveOpts) -> Result<DidDocument> {
        self.as_ref().resolve_did_doc(did, opts).await
    }
}
