//! Stable credential identifiers.
//!
//! An identifier is derived from the provider name and the leading key
//! material, so the same key maps to the same id across restarts while the id
//! itself never reveals more than a truncated hash. The prefix is long enough
//! to cover whole API keys: providers put fixed markers such as `sk-` up
//! front, and a short prefix would collapse distinct keys into one id.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of secret characters mixed into the identifier.
const SECRET_PREFIX_CHARS: usize = 64;
/// Number of hex characters kept from the digest.
const DIGEST_HEX_CHARS: usize = 16;

/// Identifier of a credential, e.g. `iflow-3f2a9c0d1b7e4a55`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialId(String);

impl CredentialId {
    /// Derive the identifier for `secret` issued by `provider`.
    #[must_use]
    pub fn derive(provider: &str, secret: &str) -> Self {
        let provider = provider.to_lowercase();
        let prefix: String = secret.chars().take(SECRET_PREFIX_CHARS).collect();

        let mut hasher = Sha256::new();
        hasher.update(provider.as_bytes());
        hasher.update(b":");
        hasher.update(prefix.as_bytes());
        let digest = hex::encode(hasher.finalize());

        Self(format!("{provider}-{}", &digest[..DIGEST_HEX_CHARS]))
    }

    /// Wrap an identifier received from an external caller.
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CredentialId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
