mod client_metadata;
mod metadata;
mod request;
mod response;
mod token;

pub use self::client_metadata::*;
pub use self::metadata::*;
pub use self::request::*;
pub use self::response::*;
pub use self::token::*;

use serde::Deserialize;
use smol_str::SmolStr;
use url::Url;

/// Prompt hint forwarded to the authorization server.
#[derive(Debug, Clone, Copy, Deserialize)]
pub enum AuthorizePrompt {
    Login,
    None,
    Consent,
    SelectAccount,
}

impl AuthorizePrompt {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorizePrompt::Login => "login",
            AuthorizePrompt::None => "none",
            AuthorizePrompt::Consent => "consent",
            AuthorizePrompt::SelectAccount => "select_account",
        }
    }
}

/// Options for starting an authorization attempt.
#[derive(Debug, Default)]
pub struct AuthorizeOptions {
    /// Override the first configured redirect URI
    pub redirect_uri: Option<Url>,
    /// Prompt hint for the authorization UI
    pub prompt: Option<AuthorizePrompt>,
    /// Opaque caller-supplied application state, returned by the callback
    /// (and attached to callback errors for UI continuity)
    pub app_state: Option<SmolStr>,
}

/// Query parameters delivered to the redirect URI by the authorization
/// server.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackParams {
    /// Authorization code (absent on error callbacks)
    pub code: Option<SmolStr>,
    /// Anti-CSRF state value from the matching authorization request
    pub state: Option<SmolStr>,
    /// Issuer identity assertion (RFC 9207)
    pub iss: Option<SmolStr>,
    /// OAuth error code reported by the server
    pub error: Option<SmolStr>,
    /// Optional human-readable error detail
    pub error_description: Option<SmolStr>,
}
