//! Validated archive URLs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Reasons a string is not accepted as an archive [`Url`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UrlError {
    #[error("invalid url '{url}': {reason}")]
    Malformed { url: String, reason: String },

    #[error("url '{0}' is not absolute")]
    NotAbsolute(String),
}

/// An absolute URL with no trailing slash.
///
/// Archive file locations are formed by appending `/<path>` to the base,
/// so the trailing slash is trimmed on construction.
///
/// ```rust
/// use henyey_common::Url;
///
/// let url = Url::new("https://history.example.org/prd/core-live-001/").unwrap();
/// assert_eq!(url.as_str(), "https://history.example.org/prd/core-live-001");
/// assert!(Url::new("not a url").is_err());
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Url(String);

impl Url {
    pub fn new(raw: &str) -> Result<Self, UrlError> {
        let trimmed = raw.trim();
        let parsed = ::url::Url::parse(trimmed).map_err(|e| UrlError::Malformed {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;
        if parsed.cannot_be_a_base() || parsed.host_str().is_none() {
            return Err(UrlError::NotAbsolute(raw.to_string()));
        }
        Ok(Self(trimmed.trim_end_matches('/').to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append a relative path. `path` must not start with `/`.
    pub fn join(&self, path: &str) -> Url {
        Url(format!("{}/{}", self.0, path))
    }

    /// Parsed form, for callers that need to edit query parameters.
    pub fn to_parsed(&self) -> Result<::url::Url, UrlError> {
        ::url::Url::parse(&self.0).map_err(|e| UrlError::Malformed {
            url: self.0.clone(),
            reason: e.to_string(),
        })
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Url({})", self.0)
    }
}

impl FromStr for Url {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Url::new(s)
    }
}

impl AsRef<str> for Url {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for Url {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Url {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Url::new(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trims_trailing_slashes() {
        let url = Url::new("http://127.0.0.1:8080/archive//").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8080/archive");
        assert_eq!(
            url.join("history/00/00/00/history-0000003f.json").as_str(),
            "http://127.0.0.1:8080/archive/history/00/00/00/history-0000003f.json"
        );
    }

    #[test]
    fn test_rejects_relative_and_malformed() {
        assert!(matches!(
            Url::new("history/00/00"),
            Err(UrlError::Malformed { .. })
        ));
        assert!(matches!(
            Url::new("mailto:ops@example.org"),
            Err(UrlError::NotAbsolute(_))
        ));
        assert!(Url::new("http://").is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let url: Url = serde_json::from_str("\"https://example.org/\"").unwrap();
        assert_eq!(url.as_str(), "https://example.org");
        assert!(serde_json::from_str::<Url>("\"::nope\"").is_err());
    }
}
