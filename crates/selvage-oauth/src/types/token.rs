use chrono::{DateTime, Utc};
use selvage_common::Did;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use super::response::TokenType;

/// The credential material of a session.
///
/// `sub` must always equal the key the containing session is stored
/// under; the registry enforces that invariant. Replaced wholesale on
/// refresh, never field-mutated.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub iss: SmolStr,
    pub sub: Did,
    pub aud: SmolStr,
    pub scope: Option<SmolStr>,

    pub refresh_token: Option<SmolStr>,
    pub access_token: SmolStr,
    pub token_type: TokenType,

    /// Absolute expiry; `None` means the token never goes stale
    pub expires_at: Option<DateTime<Utc>>,
}
