use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use url::Url;

use super::CacheError;

/// The canonical identity of a fetchable resource: its absolute request URL.
///
/// Two keys are equal exactly when their URL strings are equal. Parsing normalizes what the
/// [`url`] crate normalizes (scheme and host case, default ports, empty paths) and nothing more.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    url: Arc<str>,
}

impl ResourceKey {
    /// Parses a key from a URL string.
    ///
    /// Relative or otherwise unparseable URLs are rejected with [`CacheError::NoResource`].
    pub fn parse(input: &str) -> Result<Self, CacheError> {
        let url = Url::parse(input.trim())
            .map_err(|e| CacheError::NoResource(format!("{input:?}: {e}")))?;
        Ok(Self::from_url(&url))
    }

    /// Creates a key from an already parsed URL.
    pub fn from_url(url: &Url) -> Self {
        Self {
            url: url.as_str().into(),
        }
    }

    /// Returns the canonical URL string.
    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// Returns the key as a parsed [`Url`].
    pub fn url(&self) -> Result<Url, CacheError> {
        Url::parse(&self.url).map_err(|e| CacheError::NoResource(e.to_string()))
    }

    /// Returns the relative path of this key in the persistent store.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `aa/bbccdd/eeff...`
    pub fn cache_path(&self) -> String {
        let hash: [u8; 32] = Sha256::digest(self.url.as_bytes()).into();

        let mut path = format!("{:02x}/", hash[0]);
        for b in &hash[1..4] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
