//! OAuth token files.
//!
//! Provider CLIs persist OAuth credentials as small JSON documents
//! (`~/.qwen/oauth_creds.json`, `~/.iflow/oauth_creds.json`). This module reads
//! them, resolves the secret a pipeline should present, and writes refreshed
//! tokens back atomically so a concurrent reader never sees a torn file.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};

/// On-disk OAuth token document.
///
/// Unknown fields are preserved so a rewrite never drops provider data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Expiry in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<i64>,
    /// Long-lived API key minted from the OAuth session (iFlow).
    #[serde(default, rename = "apiKey", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TokenFile {
    /// Load a token file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| GuardError::ConfigParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Persist the token file via temp file + rename.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &content)?;
        tracing::debug!(path = %path.display(), "Token file saved");
        Ok(())
    }

    /// Secret a pipeline presents: the API key when one exists, else the access token.
    #[must_use]
    pub fn secret(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .or(self.access_token.as_deref())
            .filter(|s| !s.is_empty())
    }

    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expiry_date
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }
}

/// Expand a leading `~/` against the home directory.
#[must_use]
pub fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = super::paths::home_dir()
    {
        return home.join(rest);
    }
    path.to_path_buf()
}

/// Write bytes atomically using temp file + rename.
fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("token"),
        std::process::id()
    ));

    {
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    std::fs::rename(&temp_path, path)?;

    Ok(())
}
