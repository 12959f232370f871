//! Credential validation.
//!
//! Two tiers: an offline format check against the provider's key rules, then
//! a one-token chat completion probe against the provider endpoint. Keys that
//! fail the format check never reach the network.
//!
//! The validator owns no shared state. Callers record the outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::json;

use super::http::{DEFAULT_PROBE_TIMEOUT, build_client};
use super::models::{Credential, CredentialStatus};
use super::provider::{ProbeVerdict, ProviderRegistry};
use crate::error::{GuardError, Result};

// =============================================================================
// Probe Target
// =============================================================================

/// Pipeline-level probe settings. Unset fields fall back to provider defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeTarget {
    pub endpoint: Option<String>,
    pub model: Option<String>,
}

impl ProbeTarget {
    #[must_use]
    pub fn for_credential(credential: &Credential) -> Self {
        Self {
            endpoint: credential.endpoint.clone(),
            model: credential.test_model.clone(),
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

// =============================================================================
// Validation Outcome
// =============================================================================

/// Result of one validation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    /// Rate limited. Counts as valid: the key authenticated.
    RateLimited,
    /// Rejected offline; no request was sent.
    FormatInvalid { rule: String },
    Rejected {
        status: u16,
        message: String,
        expired: bool,
    },
    NetworkFailure { message: String, timed_out: bool },
}

impl ValidationOutcome {
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid | Self::RateLimited)
    }

    /// Credential status this outcome implies.
    #[must_use]
    pub const fn credential_status(&self) -> CredentialStatus {
        match self {
            Self::Valid | Self::RateLimited => CredentialStatus::Valid,
            Self::Rejected { expired: true, .. } => CredentialStatus::Expired,
            Self::FormatInvalid { .. } | Self::Rejected { .. } | Self::NetworkFailure { .. } => {
                CredentialStatus::Invalid
            }
        }
    }

    /// Error describing a failed outcome; `None` for valid outcomes.
    #[must_use]
    pub fn into_error(self, provider: &str, timeout: Duration) -> Option<GuardError> {
        let provider = provider.to_string();
        match self {
            Self::Valid | Self::RateLimited => None,
            Self::FormatInvalid { rule } => Some(GuardError::FormatInvalid {
                provider,
                reason: format!("expected {rule}"),
            }),
            Self::Rejected {
                status, message, ..
            } => Some(GuardError::ProviderRejected {
                provider,
                status,
                message,
            }),
            Self::NetworkFailure {
                timed_out: true, ..
            } => Some(GuardError::Timeout {
                provider,
                seconds: timeout.as_secs(),
            }),
            Self::NetworkFailure { message, .. } => Some(GuardError::Network { provider, message }),
        }
    }
}

// =============================================================================
// Validator
// =============================================================================

/// Provider-level probe defaults taken from configuration.
#[derive(Debug, Clone, Default)]
struct ProbeDefaults {
    endpoint: Option<String>,
    model: Option<String>,
}

/// Format checks and live probes for provider credentials.
#[derive(Debug, Clone)]
pub struct CredentialValidator {
    client: Client,
    registry: Arc<ProviderRegistry>,
    timeout: Duration,
    defaults: HashMap<String, ProbeDefaults>,
}

impl CredentialValidator {
    /// Create a validator with the given probe timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(registry: Arc<ProviderRegistry>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            registry,
            timeout,
            defaults: HashMap::new(),
        })
    }

    /// Validator with the default 15 second timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_default_timeout(registry: Arc<ProviderRegistry>) -> Result<Self> {
        Self::new(registry, DEFAULT_PROBE_TIMEOUT)
    }

    /// Override the probe endpoint and/or model for every credential of `provider`.
    #[must_use]
    pub fn with_provider_defaults(
        mut self,
        provider: &str,
        endpoint: Option<String>,
        model: Option<String>,
    ) -> Self {
        self.defaults
            .insert(provider.to_lowercase(), ProbeDefaults { endpoint, model });
        self
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether `secret` passes `provider`'s format rules.
    #[must_use]
    pub fn check_format(&self, provider: &str, secret: &str) -> bool {
        self.registry.backend(provider).check_format(secret)
    }

    /// Validate with provider-level defaults.
    pub async fn validate(&self, provider: &str, secret: &str) -> bool {
        self.probe(provider, secret, &ProbeTarget::default())
            .await
            .is_valid()
    }

    /// Format check, then live probe.
    pub async fn probe(&self, provider: &str, secret: &str, target: &ProbeTarget) -> ValidationOutcome {
        let provider = provider.to_lowercase();
        let backend = self.registry.backend(&provider);

        if !backend.check_format(secret) {
            tracing::info!(
                provider = %provider,
                rule = backend.format_rule(),
                "Credential failed format check; skipping probe"
            );
            return ValidationOutcome::FormatInvalid {
                rule: backend.format_rule().to_string(),
            };
        }

        let defaults = self.defaults.get(&provider);
        let endpoint = target
            .endpoint
            .as_deref()
            .or_else(|| defaults.and_then(|d| d.endpoint.as_deref()))
            .unwrap_or_else(|| backend.default_endpoint());
        let model = target
            .model
            .as_deref()
            .or_else(|| defaults.and_then(|d| d.model.as_deref()))
            .unwrap_or_else(|| backend.default_test_model());

        let body = json!({
            "model": model,
            "messages": [{ "role": "user", "content": "ping" }],
            "max_tokens": 1,
            "stream": false,
        });

        let started = Instant::now();
        let request = async {
            let response = self
                .client
                .post(endpoint)
                .bearer_auth(secret)
                .json(&body)
                .send()
                .await?;
            let status = response.status().as_u16();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };

        let (status, text) = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) if err.is_timeout() => return self.timed_out(&provider, endpoint),
            Ok(Err(err)) => {
                tracing::warn!(
                    provider = %provider,
                    endpoint = %endpoint,
                    error = %err,
                    "Probe connection failed"
                );
                return ValidationOutcome::NetworkFailure {
                    message: err.to_string(),
                    timed_out: false,
                };
            }
            Err(_) => return self.timed_out(&provider, endpoint),
        };

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis() as u64;

        match backend.interpret_probe(status, &text) {
            ProbeVerdict::Valid => {
                tracing::debug!(provider = %provider, status, duration_ms, "Probe succeeded");
                ValidationOutcome::Valid
            }
            ProbeVerdict::RateLimited => {
                tracing::debug!(
                    provider = %provider,
                    status,
                    duration_ms,
                    "Probe rate limited; treating credential as valid"
                );
                ValidationOutcome::RateLimited
            }
            ProbeVerdict::Rejected {
                status,
                message,
                expired,
            } => {
                tracing::info!(
                    provider = %provider,
                    status,
                    expired,
                    duration_ms,
                    message = %message,
                    "Provider rejected credential"
                );
                ValidationOutcome::Rejected {
                    status,
                    message,
                    expired,
                }
            }
        }
    }

    fn timed_out(&self, provider: &str, endpoint: &str) -> ValidationOutcome {
        tracing::warn!(
            provider = %provider,
            endpoint = %endpoint,
            timeout_secs = self.timeout.as_secs(),
            timed_out = true,
            "Probe timed out"
        );
        ValidationOutcome::NetworkFailure {
            message: format!("no response within {}s", self.timeout.as_secs()),
            timed_out: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> CredentialValidator {
        CredentialValidator::new(
            Arc::new(ProviderRegistry::with_defaults()),
            Duration::from_secs(2),
        )
        .expect("client")
    }

    #[tokio::test]
    async fn format_failure_short_circuits() {
        // Unroutable endpoint: a probe would fail as a network error, not a format error.
        let target = ProbeTarget::default().with_endpoint("http://127.0.0.1:9/v1/chat/completions");
        let outcome = validator().probe("iflow", "sk-short", &target).await;
        assert!(matches!(outcome, ValidationOutcome::FormatInvalid { .. }));
        assert_eq!(outcome.credential_status(), CredentialStatus::Invalid);
    }

    #[test]
    fn outcome_statuses() {
        assert_eq!(
            ValidationOutcome::RateLimited.credential_status(),
            CredentialStatus::Valid
        );
        assert_eq!(
            ValidationOutcome::Rejected {
                status: 401,
                message: "token expired".into(),
                expired: true,
            }
            .credential_status(),
            CredentialStatus::Expired
        );
        assert_eq!(
            ValidationOutcome::NetworkFailure {
                message: "refused".into(),
                timed_out: false,
            }
            .credential_status(),
            CredentialStatus::Invalid
        );
    }

    #[test]
    fn into_error_keeps_timeout_distinct() {
        let timeout = Duration::from_secs(15);
        let err = ValidationOutcome::NetworkFailure {
            message: "no response".into(),
            timed_out: true,
        }
        .into_error("qwen", timeout)
        .expect("error");
        assert!(matches!(err, GuardError::Timeout { seconds: 15, .. }));

        let err = ValidationOutcome::NetworkFailure {
            message: "connection refused".into(),
            timed_out: false,
        }
        .into_error("qwen", timeout)
        .expect("error");
        assert!(matches!(err, GuardError::Network { .. }));

        assert!(ValidationOutcome::Valid.into_error("qwen", timeout).is_none());
    }

    #[test]
    fn check_format_uses_registry() {
        let v = validator();
        assert!(v.check_format("iflow", "sk-aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"));
        assert!(!v.check_format("iflow", "pk-aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"));
        assert!(v.check_format("mystery", "abcdefghij"));
    }
}
