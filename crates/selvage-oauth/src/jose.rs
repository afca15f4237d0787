//! Compact JWS construction for DPoP proofs and client assertions.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jose_jwa::Algorithm;
use jose_jwk::Jwk;
use p256::ecdsa::{Signature, SigningKey, signature::Signer};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// JWS protected header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwsHeader {
    pub alg: Algorithm,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typ: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwk: Option<Jwk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<SmolStr>,
}

impl From<Algorithm> for JwsHeader {
    fn from(alg: Algorithm) -> Self {
        Self {
            alg,
            typ: None,
            jwk: None,
            kid: None,
        }
    }
}

/// JWT claim set: the registered claims plus the DPoP-specific ones.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Claims {
    #[serde(flatten)]
    pub registered: RegisteredClaims,
    #[serde(flatten)]
    pub dpop: DpopClaims,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RegisteredClaims {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<SmolStr>,
}

// https://datatracker.ietf.org/doc/html/rfc9449#section-4.2
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DpopClaims {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub htm: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub htu: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ath: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<SmolStr>,
}

impl From<RegisteredClaims> for Claims {
    fn from(registered: RegisteredClaims) -> Self {
        Self {
            registered,
            dpop: DpopClaims::default(),
        }
    }
}

/// Build a compact JWS (ES256): `base64url(header).base64url(claims).base64url(sig)`.
pub fn create_signed_jwt(
    key: SigningKey,
    header: &JwsHeader,
    claims: &Claims,
) -> serde_json::Result<SmolStr> {
    let header = URL_SAFE_NO_PAD.encode(serde_json::to_string(header)?);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_string(claims)?);
    let signature: Signature = key.sign(format!("{header}.{payload}").as_bytes());
    Ok(format!(
        "{header}.{payload}.{}",
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    )
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jose_jwa::Signing;

    #[test]
    fn compact_jws_structure() {
        let key = crate::keys::generate_key(&["ES256".into()]).unwrap();
        let signer = crate::keys::es256_signer(&key).unwrap();
        let mut header = JwsHeader::from(Algorithm::Signing(Signing::Es256));
        header.typ = Some("dpop+jwt".into());
        let claims = Claims {
            registered: RegisteredClaims {
                jti: Some("abc".into()),
                iat: Some(1_700_000_000),
                ..Default::default()
            },
            dpop: DpopClaims {
                htm: Some("POST".into()),
                htu: Some("https://pds.example/xrpc/test".into()),
                ..Default::default()
            },
        };
        let jwt = create_signed_jwt(signer, &header, &claims).unwrap();
        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);

        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(parts[1])
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value["htm"], "POST");
        assert_eq!(value["jti"], "abc");
        assert_eq!(value["iat"], 1_700_000_000);
        // unset claims are omitted entirely
        assert!(value.get("nonce").is_none());
        assert!(value.get("ath").is_none());
    }
}
