//! OAuth refresh-token exchange.
//!
//! Shared by every provider whose pipelines run on OAuth access tokens. The
//! refresher reads the credential's token file, posts a `refresh_token` grant
//! to the provider's token endpoint, and writes the new tokens back.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;

use crate::core::http::build_client;
use crate::core::models::Credential;
use crate::core::ports::{CredentialRefresher, RefreshOutcome};
use crate::core::provider::summarize_body;
use crate::error::Result;
use crate::storage::token_file::TokenFile;

/// Token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    /// Lifetime in seconds.
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Refresh-token grant against one provider's token endpoint.
#[derive(Debug, Clone)]
pub struct OAuthTokenRefresher {
    client: Client,
    provider: String,
    token_endpoint: String,
    client_id: String,
    client_secret: Option<String>,
    timeout: Duration,
}

impl OAuthTokenRefresher {
    /// Create a refresher.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        provider: &str,
        token_endpoint: impl Into<String>,
        client_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            provider: provider.to_lowercase(),
            token_endpoint: token_endpoint.into(),
            client_id: client_id.into(),
            client_secret: None,
            timeout,
        })
    }

    #[must_use]
    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    async fn exchange(&self, path: &Path) -> std::result::Result<RefreshOutcome, String> {
        let mut tokens = TokenFile::load(path).map_err(|e| e.to_string())?;
        let refresh_token = tokens
            .refresh_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| format!("{} has no refresh_token", path.display()))?;

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.clone()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let response = tokio::time::timeout(
            self.timeout,
            self.client
                .post(&self.token_endpoint)
                .header(reqwest::header::ACCEPT, "application/json")
                .form(&form)
                .send(),
        )
        .await
        .map_err(|_| format!("token endpoint timed out after {}s", self.timeout.as_secs()))?
        .map_err(|e| format!("token endpoint unreachable: {e}"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| format!("failed to read token response: {e}"))?;

        if !status.is_success() {
            return Err(format!(
                "token endpoint returned HTTP {}: {}",
                status.as_u16(),
                summarize_body(&body)
            ));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| format!("unrecognized token response: {e}"))?;

        let expires_at = parsed
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));

        tokens.access_token = Some(parsed.access_token.clone());
        if let Some(rt) = parsed.refresh_token {
            tokens.refresh_token = Some(rt);
        }
        if parsed.token_type.is_some() {
            tokens.token_type = parsed.token_type;
        }
        tokens.expiry_date = expires_at.map(|t| t.timestamp_millis());
        tokens.save(path).map_err(|e| e.to_string())?;

        let secret = tokens
            .secret()
            .map_or(parsed.access_token, str::to_string);
        Ok(RefreshOutcome::refreshed(secret, expires_at))
    }
}

#[async_trait]
impl CredentialRefresher for OAuthTokenRefresher {
    async fn refresh(&self, credential: &Credential) -> RefreshOutcome {
        let Some(path) = credential.token_file.as_deref() else {
            return RefreshOutcome::failed(format!(
                "credential {} has no token file to refresh",
                credential.id
            ));
        };

        tracing::info!(
            provider = %self.provider,
            credential_id = %credential.id,
            token_file = %path.display(),
            "Exchanging refresh token"
        );

        match self.exchange(path).await {
            Ok(outcome) => {
                tracing::info!(
                    provider = %self.provider,
                    credential_id = %credential.id,
                    "Refresh token exchange succeeded"
                );
                outcome
            }
            Err(message) => {
                tracing::warn!(
                    provider = %self.provider,
                    credential_id = %credential.id,
                    error = %message,
                    "Refresh token exchange failed"
                );
                RefreshOutcome::failed(message)
            }
        }
    }
}
