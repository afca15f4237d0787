//! Persisted session state.

use jose_jwk::Key;
use selvage_common::Did;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use url::Url;

use crate::types::TokenSet;

/// A persisted credential session: the DPoP key the tokens are bound to,
/// where they came from, and the tokens themselves.
///
/// Mutated only by whole-object replacement. The key under which a
/// session is stored must equal `token_set.sub` (and `account_did`); the
/// registry treats any mismatch as fatal for the entry.
///
/// The DPoP key survives refreshes: the replacement token set stays bound
/// to the key the session was authorized with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSession {
    /// Account this session belongs to
    pub account_did: Did,
    /// The account's authoritative server (requests go here)
    pub host_url: Url,
    /// Issuer that minted the tokens
    pub authserver_issuer: SmolStr,
    /// Proof-of-possession key; never logged
    pub dpop_key: Key,
    /// Last replay nonce seen from the authorization server
    pub dpop_authserver_nonce: Option<SmolStr>,
    /// Last replay nonce seen from the host
    pub dpop_host_nonce: Option<SmolStr>,
    /// Current credential material
    pub token_set: TokenSet,
}

/// Short-lived record of an authorization attempt, keyed by its
/// anti-CSRF `state` value.
///
/// Consumed exactly once by the matching callback and discarded whether
/// or not that callback succeeds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequestState {
    /// Anti-CSRF state value (also the storage key)
    pub state: SmolStr,
    /// Issuer the attempt was started against
    pub authserver_url: Url,
    /// Proof-of-possession key generated for this attempt
    pub dpop_key: Key,
    /// Replay nonce picked up during the pushed authorization request
    pub dpop_authserver_nonce: Option<SmolStr>,
    /// PKCE code verifier
    pub pkce_verifier: SmolStr,
    /// Redirect URI used for this attempt
    pub redirect_uri: Url,
    /// Opaque caller-supplied application state
    pub app_state: Option<SmolStr>,
}
