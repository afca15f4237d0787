use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use smol_str::SmolStr;

use super::IdentifierError;

/// A decentralized identifier (`did:<method>:<method-specific-id>`).
///
/// Validated on construction; the method and method-specific segment must
/// both satisfy the DID grammar before the value can be used anywhere.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Did(SmolStr);

/// Regex for DID validation per the AT Protocol flavor of the DID spec.
///
/// Allows `%` inside the identifier but rejects DIDs ending in `:` or `%`.
/// Well-formedness of percent-escapes is not enforced at validation time,
/// matching the reference implementations.
pub static DID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^did:[a-z]+:[a-zA-Z0-9._:%-]*[a-zA-Z0-9._-]$").unwrap());

const MAX_LEN: usize = 2048;

impl Did {
    /// Fallible constructor; validates the full grammar.
    pub fn new(did: impl AsRef<str>) -> Result<Self, IdentifierError> {
        let did = did.as_ref();
        if did.len() > MAX_LEN {
            Err(IdentifierError::TooLong {
                kind: "did",
                len: did.len(),
                max: MAX_LEN,
            })
        } else if !DID_REGEX.is_match(did) {
            Err(IdentifierError::Invalid {
                kind: "did",
                value: did.into(),
            })
        } else {
            Ok(Self(SmolStr::new(did)))
        }
    }

    /// The DID method name (`plc` in `did:plc:abc123`).
    pub fn method(&self) -> &str {
        let rest = &self.0.as_str()[4..];
        rest.split_once(':').map(|(method, _)| method).unwrap_or(rest)
    }

    /// The underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Did {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Did {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: SmolStr = Deserialize::deserialize(deserializer)?;
        Self::new(&value).map_err(D::Error::custom)
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Did {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_dids() {
        for input in [
            "did:plc:hdhoaan3xa3jiuq4fg4mefid",
            "did:web:example.com",
            "did:web:example.com:user:alice",
            "did:key:zQ3shpq1g134o7",
        ] {
            let did = Did::new(input).expect(input);
            assert_eq!(did.as_str(), input);
        }
    }

    #[test]
    fn invalid_dids() {
        for input in [
            "",
            "did:",
            "did:plc",
            "did:plc:",
            "did:PLC:abc",
            "plc:abc",
            "did:plc:abc:",
            "did:plc:abc%",
        ] {
            assert!(Did::new(input).is_err(), "accepted {input:?}");
        }
    }

    #[test]
    fn method_extraction() {
        assert_eq!(Did::new("did:plc:abc").unwrap().method(), "plc");
        assert_eq!(Did::new("did:web:example.com:u:a").unwrap().method(), "web");
    }

    #[test]
    fn serde_validates() {
        let did: Did = serde_json::from_str(r#""did:plc:abc123""#).unwrap();
        assert_eq!(did.as_str(), "did:plc:abc123");
        assert!(serde_json::from_str::<Did>(r#""not-a-did""#).is_err());
    }
}
