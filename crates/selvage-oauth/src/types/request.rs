use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use super::client_metadata::GrantType;

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Code,
    Token,
    // OIDC (https://openid.net/specs/oauth-v2-multiple-response-types-1_0.html)
    IdToken,
}

#[derive(Serialize, Deserialize, Debug)]
pub enum CodeChallengeMethod {
    S256,
    #[serde(rename = "plain")]
    Plain,
}

/// Pushed authorization request body.
#[derive(Serialize, Deserialize, Debug)]
pub struct ParParameters {
    // https://datatracker.ietf.org/doc/html/rfc6749#section-4.1.1
    pub response_type: ResponseType,
    pub redirect_uri: SmolStr,
    pub state: SmolStr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<SmolStr>,
    // https://datatracker.ietf.org/doc/html/rfc7636#section-4.3
    pub code_challenge: SmolStr,
    pub code_challenge_method: CodeChallengeMethod,
    // https://openid.net/specs/openid-connect-core-1_0.html#AuthRequest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_hint: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<SmolStr>,
}

/// Authorization-code exchange body.
#[derive(Serialize, Deserialize, Debug)]
pub struct TokenRequestParameters {
    // https://datatracker.ietf.org/doc/html/rfc6749#section-4.1.3
    pub grant_type: GrantType,
    pub code: SmolStr,
    pub redirect_uri: SmolStr,
    // https://datatracker.ietf.org/doc/html/rfc7636#section-4.5
    pub code_verifier: SmolStr,
}

/// Refresh-token grant body.
#[derive(Serialize, Deserialize, Debug)]
pub struct RefreshRequestParameters {
    // https://datatracker.ietf.org/doc/html/rfc6749#section-6
    pub grant_type: GrantType,
    pub refresh_token: SmolStr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<SmolStr>,
}

/// Revocation request body.
// https://datatracker.ietf.org/doc/html/rfc7009#section-2.1
#[derive(Serialize, Deserialize, Debug)]
pub struct RevocationRequestParameters {
    pub token: SmolStr,
}
