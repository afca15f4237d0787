//! Crate-wide error aggregation.

use std::sync::Arc;

use miette::Diagnostic;
use smol_str::SmolStr;

use selvage_common::Did;
use selvage_common::store::StateStoreError;
use selvage_common::types::IdentifierError;
use selvage_identity::resolver::IdentityError;

use crate::discovery::DiscoveryError;
use crate::dpop::DpopError;
use crate::request::RequestError;
use crate::types::ConfigError;

/// Errors reported by authorization callbacks.
///
/// Variants that can recover the caller-supplied application state carry
/// it, so the hosting UI can route back to where the user started.
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum CallbackError {
    /// The authorization server redirected back with an OAuth error code
    #[error("authorization server returned `{error}`")]
    #[diagnostic(
        code(selvage_oauth::callback::server),
        help("the user may have denied the request; see `description`")
    )]
    Server {
        /// OAuth error code
        error: SmolStr,
        /// Optional server-supplied detail
        description: Option<SmolStr>,
        /// Application state recovered from the matching attempt, if any
        app_state: Option<SmolStr>,
    },
    /// Callback carried no `state` parameter
    #[error("missing `state` parameter")]
    #[diagnostic(code(selvage_oauth::callback::missing_state))]
    MissingState,
    /// Callback carried no `code` parameter
    #[error("missing `code` parameter")]
    #[diagnostic(code(selvage_oauth::callback::missing_code))]
    MissingCode,
    /// No pending authorization matches this `state` (or it was already
    /// consumed)
    #[error("unknown authorization state: {0}")]
    #[diagnostic(
        code(selvage_oauth::callback::unknown_state),
        help("authorization state is single-use; a replayed or expired callback lands here")
    )]
    UnknownState(SmolStr),
    /// `iss` parameter does not match the authorization server
    #[error("issuer mismatch: expected {expected}, got {got}")]
    #[diagnostic(code(selvage_oauth::callback::issuer_mismatch))]
    IssuerMismatch {
        expected: SmolStr,
        got: SmolStr,
    },
    /// Server requires the `iss` parameter but none was provided
    #[error("missing `iss` parameter")]
    #[diagnostic(code(selvage_oauth::callback::missing_issuer))]
    MissingIssuer,
}

/// Top-level error for client and session operations.
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum OAuthError {
    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::identity))]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::discovery))]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::request))]
    Request(#[from] RequestError),

    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::dpop))]
    Dpop(#[from] DpopError),

    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::store))]
    Store(#[from] StateStoreError),

    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::callback))]
    Callback(#[from] CallbackError),

    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::identifier))]
    Identifier(#[from] IdentifierError),

    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::config))]
    Config(#[from] ConfigError),

    /// Nothing stored under this subject
    #[error("no stored session for {0}")]
    #[diagnostic(
        code(selvage_oauth::session_not_found),
        help("the user must authorize (again) before this session can be used")
    )]
    SessionNotFound(Did),

    /// Stored entry's subject does not match the key it is stored under;
    /// fatal for that entry
    #[error("stored session subject {found} does not match key {expected}")]
    #[diagnostic(
        code(selvage_oauth::subject_mismatch),
        help("the store entry is corrupt; it has been removed")
    )]
    SubjectMismatch {
        expected: Did,
        found: Did,
    },

    /// The bounded get-or-refresh sequence did not finish in time
    #[error("session refresh deadline exceeded")]
    #[diagnostic(code(selvage_oauth::deadline))]
    Deadline,

    /// The detached refresh task failed to run to completion
    #[error("session refresh task failed: {0}")]
    #[diagnostic(code(selvage_oauth::task))]
    TaskFailed(SmolStr),

    /// A failure shared by every caller joined to the same in-flight
    /// retrieval; see [`OAuthError::as_root`]
    #[error("{0}")]
    Shared(Arc<OAuthError>),

    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::url))]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    #[diagnostic(code(selvage_oauth::http))]
    Http(#[from] http::Error),
}

impl OAuthError {
    /// Unwrap any [`OAuthError::Shared`] layers added by single-flight
    /// result sharing.
    pub fn as_root(&self) -> &OAuthError {
        match self {
            OAuthError::Shared(inner) => inner.as_root(),
            other => other,
        }
    }
}

pub type Result<T> = core::result::Result<T, OAuthError>;
