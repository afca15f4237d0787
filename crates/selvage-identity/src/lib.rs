//! Identity resolution for the AT Protocol.
//!
//! Resolves a handle or DID to the verified authoritative server that
//! holds the account's data, with mutual validation between the handle
//! and the DID document to prevent either side from spoofing the other.
//!
//! ## Quick start
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use selvage_identity::{PublicResolver, resolver::{IdentityResolver, ResolveOpts}};
//! use selvage_common::AtIdentifier;
//!
//! let resolver = PublicResolver::default();
//! let ident = AtIdentifier::new("alice.bsky.social")?;
//! let resolved = resolver.resolve(&ident, &ResolveOpts::default()).await?;
//! println!("{} lives at {}", resolved.did, resolved.pds);
//! # Ok(())
//! # }
//! ```
//!
//! ## Resolution methods
//!
//! **Handle → DID**:
//! 1. DNS TXT record at `_atproto.{handle}` (if the `dns` feature is enabled)
//! 2. HTTPS well-known at `https://{handle}/.well-known/atproto-did`
//! 3. The configured resolution endpoint (`com.atproto.identity.resolveHandle`)
//!
//! **DID → Document** (per method namespace; anything else is a hard error):
//! - `did:web` — HTTPS well-known document URL
//! - `did:plc` — the configured PLC directory
//!
//! Handle→DID results are cached with a short TTL (handles can be
//! repointed); DID→document results with a long one. Both caches honor a
//! bypass flag. No HTTP redirects are ever followed.

pub mod cache;
pub mod resolver;

use bytes::Bytes;
use percent_encoding::percent_decode_str;
use reqwest::StatusCode;
use serde::Serialize;
use url::{ParseError, Url};

use selvage_common::http::HttpClient;
use selvage_common::{Did, DidDocument, Handle};

use crate::cache::TtlCache;
use crate::resolver::{
    IdentityError, IdentityResolver, ResolveOpts, ResolverOptions, Result,
};

pub use crate::resolver::ResolvedIdentity;

#[cfg(feature = "dns")]
use {
    hickory_resolver::{TokioAsyncResolver, config::ResolverConfig},
    std::sync::Arc,
};

/// Default resolver implementation over `reqwest`, with TTL caching.
#[derive(Clone)]
pub struct PublicResolver {
    http: reqwest::Client,
    opts: ResolverOptions,
    handles: TtlCache<Handle, Did>,
    docs: TtlCache<Did, DidDocument>,
    #[cfg(feature = "dns")]
    dns: Option<Arc<TokioAsyncResolver>>,
}

impl PublicResolver {
    /// Create a resolver from an HTTP client and options.
    ///
    /// The client should have redirects disabled (see
    /// [`PublicResolver::http_client`]); a redirect-following client lets
    /// a compromised origin bounce document fetches elsewhere.
    pub fn new(http: reqwest::Client, opts: ResolverOptions) -> Self {
        #[cfg(feature = "tracing")]
        tracing::info!(
            plc_directory = %opts.plc_directory,
            validate_doc_id = opts.validate_doc_id,
            "identity resolver created"
        );

        let handles = TtlCache::new(opts.handle_ttl);
        let docs = TtlCache::new(opts.doc_ttl);
        Self {
            http,
            opts,
            handles,
            docs,
            #[cfg(feature = "dns")]
            dns: None,
        }
    }

    /// An HTTP client configured the way resolution requires: redirects
    /// disabled.
    pub fn http_client() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("failed to build HTTP client")
    }

    #[cfg(feature = "dns")]
    /// Add system-config DNS TXT resolution.
    pub fn with_system_dns(mut self) -> Self {
        self.dns = Some(Arc::new(TokioAsyncResolver::tokio(
            ResolverConfig::default(),
            Default::default(),
        )));
        self
    }

    /// Construct the well-known HTTPS URL for a `did:web` DID.
    ///
    /// - `did:web:example.com` → `https://example.com/.well-known/did.json`
    /// - `did:web:example.com:user:alice` → `https://example.com/user/alice/did.json`
    fn did_web_url(&self, did: &Did) -> Result<Url> {
        let s = did.as_str();
        let rest = s
            .strip_prefix("did:web:")
            .ok_or_else(|| IdentityError::UnsupportedDidMethod(s.into()))?;
        let mut parts = rest.split(':');
        let host = parts
            .next()
            .ok_or_else(|| IdentityError::UnsupportedDidMethod(s.into()))?;
        let mut url = Url::parse(&format!("https://{host}/"))?;
        let path: Vec<&str> = parts.collect();
        if path.is_empty() {
            url.set_path(".well-known/did.json");
        } else {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| IdentityError::Url(ParseError::SetHostOnCannotBeABaseUrl))?;
            for seg in path {
                // Minimally percent-decode each segment per spec guidance
                let decoded = percent_decode_str(seg).decode_utf8_lossy();
                segments.push(&decoded);
            }
            segments.push("did.json");
        }
        Ok(url)
    }

    async fn get_json_bytes(&self, url: Url) -> Result<(Bytes, StatusCode)> {
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        let buf = resp.bytes().await?;
        Ok((buf, status))
    }

    async fn get_text(&self, url: Url) -> Result<String> {
        let resp = self.http.get(url).send().await?;
        if resp.status() == StatusCode::OK {
            Ok(resp.text().await?)
        } else {
            Err(IdentityError::HttpStatus(resp.status()))
        }
    }

    #[cfg(feature = "dns")]
    async fn dns_txt(&self, name: &str) -> Result<Vec<String>> {
        let Some(dns) = &self.dns else {
            return Ok(vec![]);
        };
        let fqdn = format!("_atproto.{name}.");
        let response = dns.txt_lookup(fqdn).await?;
        let mut out = Vec::new();
        for txt in response.iter() {
            for data in txt.txt_data().iter() {
                out.push(String::from_utf8_lossy(data).to_string());
            }
        }
        Ok(out)
    }

    fn parse_atproto_did_body(body: &str) -> Result<Did> {
        let line = body
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or(IdentityError::InvalidWellKnown)?;
        Did::new(line.trim()).map_err(|_| IdentityError::InvalidWellKnown)
    }

    async fn resolve_handle_uncached(&self, handle: &Handle) -> Result<Did> {
        #[cfg(feature = "dns")]
        if let Ok(txts) = self.dns_txt(handle.as_str()).await {
            for txt in txts {
                if let Some(did_str) = txt.strip_prefix("did=") {
                    if let Ok(did) = Did::new(did_str) {
                        return Ok(did);
                    }
                }
            }
        }

        let well_known =
            Url::parse(&format!("https://{}/.well-known/atproto-did", handle.as_str()))?;
        if let Ok(text) = self.get_text(well_known).await {
            if let Ok(did) = Self::parse_atproto_did_body(&text) {
                return Ok(did);
            }
        }

        if let Some(base) = &self.opts.handle_endpoint {
            #[derive(Serialize)]
            struct Params<'a> {
                handle: &'a str,
            }
            #[derive(serde::Deserialize)]
            struct Output {
                did: Did,
            }
            let mut url = base.clone();
            url.set_path("/xrpc/com.atproto.identity.resolveHandle");
            if let Ok(query) = serde_html_form::to_string(Params {
                handle: handle.as_str(),
            }) {
                url.set_query(Some(&query));
                if let Ok((buf, status)) = self.get_json_bytes(url).await {
                    if status.is_success() {
                        if let Ok(out) = serde_json::from_slice::<Output>(&buf) {
                            return Ok(out.did);
                        }
                    }
                }
            }
        }

        Err(IdentityError::HandleResolution(handle.clone()))
    }

    async fn resolve_did_doc_uncached(&self, did: &Did) -> Result<DidDocument> {
        let url = match did.method() {
            "web" => self.did_web_url(did)?,
            "plc" => self.opts.plc_directory.join(did.as_str())?,
            _ => return Err(IdentityError::UnsupportedDidMethod(did.as_str().into())),
        };
        let (buf, status) = self.get_json_bytes(url).await?;
        if !status.is_success() {
            return Err(IdentityError::HttpStatus(status));
        }
        let doc: DidDocument = serde_json::from_slice(&buf)?;
        if self.opts.validate_doc_id && &doc.id != did {
            return Err(IdentityError::DocIdMismatch {
                expected: did.clone(),
                found: doc.id,
            });
        }
        Ok(doc)
    }
}

impl IdentityResolver for PublicResolver {
    fn options(&self) -> &ResolverOptions {
        &self.opts
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self, opts), fields(handle = %handle)))]
    async fn resolve_handle(&self, handle: &Handle, opts: &ResolveOpts) -> Result<Did> {
        if !opts.no_cache {
            if let Some(did) = self.handles.get(handle) {
                #[cfg(feature = "tracing")]
                tracing::debug!(did = %did, "handle cache hit");
                return Ok(did);
            }
        }
        let did = self.resolve_handle_uncached(handle).await?;
        self.handles.put(handle.clone(), did.clone());
        Ok(did)
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self, opts), fields(did = %did)))]
    async fn resolve_did_doc(&self, did: &Did, opts: &ResolveOpts) -> Result<DidDocument> {
        if !opts.no_cache {
            if let Some(doc) = self.docs.get(did) {
                #[cfg(feature = "tracing")]
                tracing::debug!("document cache hit");
                return Ok(doc);
            }
        }
        let doc = self.resolve_did_doc_uncached(did).await?;
        self.docs.put(did.clone(), doc.clone());
        Ok(doc)
    }
}

impl HttpClient for PublicResolver {
    type Error = reqwest::Error;

    async fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> core::result::Result<http::Response<Vec<u8>>, Self::Error> {
        self.http.send_http(request).await
    }
}

impl Default for PublicResolver {
    /// Resolver with a no-redirect reqwest client and default options
    /// (public handle-resolution endpoint enabled, DNS off until
    /// [`PublicResolver::with_system_dns`]).
    fn default() -> Self {
        Self::new(Self::http_client(), ResolverOptions::default())
    }
}
