use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Response to a pushed authorization request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ParResponse {
    pub request_uri: SmolStr,
    pub expires_in: Option<u32>,
}

/// How the access token is presented to resource servers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    DPoP,
    Bearer,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::DPoP => "DPoP",
            TokenType::Bearer => "Bearer",
        }
    }
}

/// Token endpoint response body.
// https://datatracker.ietf.org/doc/html/rfc6749#section-5.1
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: SmolStr,
    pub token_type: TokenType,
    pub expires_in: Option<i64>,
    pub refresh_token: Option<SmolStr>,
    pub scope: Option<SmolStr>,
    // ATPROTO extension: the token response carries the `sub` claim so
    // clients can resolve the PDS (audience) through identity resolution.
    pub sub: Option<SmolStr>,
}
