//! Key generation, PKCE, and the small pieces of randomness the flows
//! need.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use elliptic_curve::SecretKey;
use jose_jwk::{Key, crypto};
use miette::Diagnostic;
use rand::{CryptoRng, RngCore, rngs::ThreadRng};
use sha2::{Digest, Sha256};
use smol_str::SmolStr;
use std::cmp::Ordering;

use crate::FALLBACK_ALG;
use crate::types::AuthServerMetadata;

/// Errors turning a stored JWK into a usable signer.
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum KeyError {
    /// JWK could not be interpreted as key material
    #[error("crypto error: {0:?}")]
    #[diagnostic(code(selvage_oauth::keys::jwk_crypto))]
    JwkCrypto(crypto::Error),
    /// Key algorithm is not one this client can sign with
    #[error("key does not match any supported signing algorithm")]
    #[diagnostic(
        code(selvage_oauth::keys::unsupported),
        help("only EC P-256 (ES256) keys are supported")
    )]
    UnsupportedKey,
}

/// Generate a private key for the first algorithm in `allowed_algos` we
/// can produce. Returns `None` when no listed algorithm is supported.
pub fn generate_key(allowed_algos: &[SmolStr]) -> Option<Key> {
    for alg in allowed_algos {
        #[allow(clippy::single_match)]
        match alg.as_str() {
            "ES256" => {
                return Some(Key::from(&crypto::Key::from(
                    SecretKey::<p256::NistP256>::random(&mut ThreadRng::default()),
                )));
            }
            _ => {}
        }
    }
    None
}

/// Generate a DPoP key acceptable to the given server, preferring
/// stronger algorithms.
pub fn generate_dpop_key(metadata: &AuthServerMetadata) -> Option<Key> {
    let mut algs = metadata
        .dpop_signing_alg_values_supported
        .clone()
        .unwrap_or_else(|| vec![FALLBACK_ALG.into()]);
    algs.sort_by(compare_algos);
    generate_key(&algs)
}

/// Extract the ES256 signer from a stored JWK.
pub(crate) fn es256_signer(key: &Key) -> Result<p256::ecdsa::SigningKey, KeyError> {
    match crypto::Key::try_from(key).map_err(KeyError::JwkCrypto)? {
        crypto::Key::P256(crypto::Kind::Secret(secret)) => {
            Ok(p256::ecdsa::SigningKey::from(secret))
        }
        _ => Err(KeyError::UnsupportedKey),
    }
}

/// The public JWK for a stored private key.
pub(crate) fn public_jwk(key: &Key) -> Result<jose_jwk::Jwk, KeyError> {
    match crypto::Key::try_from(key).map_err(KeyError::JwkCrypto)? {
        crypto::Key::P256(crypto::Kind::Secret(secret)) => Ok(jose_jwk::Jwk {
            key: Key::from(&crypto::Key::from(secret.public_key())),
            prm: Default::default(),
        }),
        _ => Err(KeyError::UnsupportedKey),
    }
}

/// A fresh URL-safe random value, usable as state or nonce.
pub fn generate_nonce() -> SmolStr {
    URL_SAFE_NO_PAD
        .encode(get_random_values::<_, 16>(&mut ThreadRng::default()))
        .into()
}

fn generate_verifier() -> SmolStr {
    URL_SAFE_NO_PAD
        .encode(get_random_values::<_, 43>(&mut ThreadRng::default()))
        .into()
}

pub(crate) fn get_random_values<R, const LEN: usize>(rng: &mut R) -> [u8; LEN]
where
    R: RngCore + CryptoRng,
{
    let mut bytes = [0u8; LEN];
    rng.fill_bytes(&mut bytes);
    bytes
}

// 256K > ES (256 > 384 > 512) > PS (256 > 384 > 512) > RS (256 > 384 > 512) > other (in original order)
pub fn compare_algos(a: &SmolStr, b: &SmolStr) -> Ordering {
    if a.as_str() == "ES256K" {
        return Ordering::Less;
    }
    if b.as_str() == "ES256K" {
        return Ordering::Greater;
    }
    for prefix in ["ES", "PS", "RS"] {
        if let Some(stripped_a) = a.strip_prefix(prefix) {
            if let Some(stripped_b) = b.strip_prefix(prefix) {
                if let (Ok(len_a), Ok(len_b)) =
                    (stripped_a.parse::<u32>(), stripped_b.parse::<u32>())
                {
                    return len_a.cmp(&len_b);
                }
            } else {
                return Ordering::Less;
            }
        } else if b.starts_with(prefix) {
            return Ordering::Greater;
        }
    }
    Ordering::Equal
}

/// PKCE S256 pair: `(code_challenge, code_verifier)`.
// https://datatracker.ietf.org/doc/html/rfc7636#section-4.1
pub fn generate_pkce() -> (SmolStr, SmolStr) {
    let verifier = generate_verifier();
    (
        URL_SAFE_NO_PAD
            .encode(Sha256::digest(verifier.as_bytes()))
            .into(),
        verifier,
    )
}

/// Base64url SHA-256 of an access token, for DPoP `ath` binding.
// https://datatracker.ietf.org/doc/html/rfc9449#section-4.2
pub fn token_hash(token: &str) -> SmolStr {
    URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes())).into()
}
