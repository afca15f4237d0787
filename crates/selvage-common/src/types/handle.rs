use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use smol_str::SmolStr;

use super::IdentifierError;

/// A domain-name-shaped human identifier.
///
/// Handles always normalize to lowercase on construction, so two `Handle`
/// values compare equal whenever the identifiers they name are the same.
/// A leading `@` is accepted and stripped.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Handle(SmolStr);

/// Domain-name grammar: two or more labels, each 1-63 chars, last label
/// starting with a letter.
pub static HANDLE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?$").unwrap()
});

const MAX_LEN: usize = 253;

impl Handle {
    /// Fallible constructor; validates and lowercases.
    pub fn new(handle: impl AsRef<str>) -> Result<Self, IdentifierError> {
        let handle = handle.as_ref();
        let handle = handle.strip_prefix('@').unwrap_or(handle);
        if handle.len() > MAX_LEN {
            Err(IdentifierError::TooLong {
                kind: "handle",
                len: handle.len(),
                max: MAX_LEN,
            })
        } else if !HANDLE_REGEX.is_match(handle) {
            Err(IdentifierError::Invalid {
                kind: "handle",
                value: handle.into(),
            })
        } else {
            Ok(Self(SmolStr::new(handle.to_ascii_lowercase())))
        }
    }

    /// The underlying (lowercased) string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Handle {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: SmolStr = Deserialize::deserialize(deserializer)?;
        Self::new(&value).map_err(D::Error::custom)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

impl AsRef<str> for Handle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
