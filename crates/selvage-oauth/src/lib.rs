//! OAuth 2.1 (AT Protocol profile) client for Selvage.
//!
//! Discovery of per-server OAuth metadata, DPoP proof-of-possession, the
//! PAR + PKCE authorization flow, and the concurrent session lifecycle
//! (single-flight refresh, staleness with jitter, deterministic teardown).

pub mod authstore;
pub mod client;
pub mod discovery;
pub mod dpop;
pub mod error;
pub mod getter;
pub mod jose;
pub mod keys;
pub mod registry;
pub mod request;
pub mod session;
pub mod types;

/// Signing algorithm assumed when a server advertises none.
pub const FALLBACK_ALG: &str = "ES256";

pub use client::{OAuthClient, OAuthSession, TokenInfo, TokenRefresh};
pub use getter::GetOptions;
pub use registry::{DeleteCause, SessionEvent, SessionRegistry};
