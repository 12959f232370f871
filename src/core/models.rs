//! Data models shared across the self-check engine.
//!
//! All types serialize with `serde` so run statistics and pipeline results
//! can be emitted as JSON by the CLI or an embedding gateway.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::credential_id::CredentialId;

/// Maximum number of diagnostic messages retained in run statistics.
pub const MAX_DIAGNOSTICS: usize = 20;

// =============================================================================
// Credentials
// =============================================================================

/// Validity of a credential as last observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    Valid,
    Invalid,
    Expired,
    #[default]
    Unknown,
}

impl CredentialStatus {
    /// Whether pipelines depending on this credential must not be active.
    #[must_use]
    pub const fn blocks_pipelines(self) -> bool {
        matches!(self, Self::Invalid | Self::Expired)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Expired => "expired",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An upstream API key or OAuth-derived access token.
#[derive(Clone, Serialize)]
pub struct Credential {
    /// Stable identifier derived from provider and key prefix.
    pub id: CredentialId,
    /// Lowercase provider name.
    pub provider: String,
    /// Raw secret material.
    #[serde(skip_serializing)]
    pub secret: String,
    /// Last observed validity.
    pub status: CredentialStatus,
    /// When the credential was last validated.
    pub last_checked: Option<DateTime<Utc>>,
    /// Expiry of the secret, when known (OAuth tokens).
    pub expires_at: Option<DateTime<Utc>>,
    /// Pipelines that authenticate with this credential.
    pub pipelines: BTreeSet<String>,
    /// Token file backing an OAuth credential.
    pub token_file: Option<PathBuf>,
    /// Pipeline-configured probe endpoint.
    pub endpoint: Option<String>,
    /// Pipeline-configured probe model.
    pub test_model: Option<String>,
}

impl Credential {
    /// Create a credential in the `unknown` state.
    #[must_use]
    pub fn new(provider: &str, secret: impl Into<String>) -> Self {
        let provider = provider.to_lowercase();
        let secret = secret.into();
        Self {
            id: CredentialId::derive(&provider, &secret),
            provider,
            secret,
            status: CredentialStatus::Unknown,
            last_checked: None,
            expires_at: None,
            pipelines: BTreeSet::new(),
            token_file: None,
            endpoint: None,
            test_model: None,
        }
    }

    /// Whether the secret expires within `margin` of `now` (or already has).
    #[must_use]
    pub fn is_expiring(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        self.expires_at.is_some_and(|at| at <= now + margin)
    }

    /// Whether the secret is past its expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Short, log-safe prefix of the secret.
    #[must_use]
    pub fn redacted(&self) -> String {
        let prefix: String = self.secret.chars().take(4).collect();
        format!("{prefix}…")
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("secret", &self.redacted())
            .field("status", &self.status)
            .field("last_checked", &self.last_checked)
            .field("expires_at", &self.expires_at)
            .field("pipelines", &self.pipelines)
            .field("token_file", &self.token_file)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Classified Errors
// =============================================================================

/// Authentication error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorKind {
    TokenExpired,
    TokenInvalid,
    OAuthServerError,
    PermissionDenied,
}

impl AuthErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TokenExpired => "token_expired",
            Self::TokenInvalid => "token_invalid",
            Self::OAuthServerError => "oauth_server_error",
            Self::PermissionDenied => "permission_denied",
        }
    }
}

impl fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authentication failure attributed to a provider and its pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub kind: AuthErrorKind,
    pub provider: String,
    pub timestamp: DateTime<Utc>,
    pub affected_pipelines: Vec<String>,
    pub message: String,
}

// =============================================================================
// Health Verdicts
// =============================================================================

/// Aggregate authentication health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    /// Status for `count` errors against `threshold`.
    #[must_use]
    pub const fn from_count(count: usize, threshold: usize) -> Self {
        if count >= threshold && count > 0 {
            Self::Critical
        } else if count > 0 {
            Self::Warning
        } else {
            Self::Healthy
        }
    }
}

/// Health of a single provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderVerdict {
    pub provider: String,
    pub status: HealthStatus,
    pub errors: Vec<ClassifiedError>,
    pub affected_pipeline_count: usize,
}

/// Health across all providers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthVerdict {
    pub status: HealthStatus,
    pub errors: Vec<ClassifiedError>,
    pub affected_pipeline_count: usize,
    pub providers: BTreeMap<String, ProviderVerdict>,
}

impl HealthVerdict {
    /// Verdict for one provider, if it has any buffered errors.
    #[must_use]
    pub fn provider(&self, name: &str) -> Option<&ProviderVerdict> {
        self.providers.get(name)
    }
}

// =============================================================================
// Pipeline Check Results
// =============================================================================

/// Lifecycle status of a pipeline as seen by the self-check engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineCheckStatus {
    Active,
    Pending,
    Destroyed,
    Blacklisted,
}

impl fmt::Display for PipelineCheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Pending => "pending",
            Self::Destroyed => "destroyed",
            Self::Blacklisted => "blacklisted",
        };
        f.write_str(s)
    }
}

/// Latest check outcome for one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCheckResult {
    pub pipeline_id: String,
    pub status: PipelineCheckStatus,
    pub last_checked: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineCheckResult {
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>, status: PipelineCheckStatus) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            status,
            last_checked: Utc::now(),
            error: None,
        }
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

// =============================================================================
// Run Statistics
// =============================================================================

/// Counters for self-check cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfCheckRunStatistics {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub last_run: DateTime<Utc>,
    pub average_duration_ms: f64,
    pub diagnostics: Vec<String>,
}

impl Default for SelfCheckRunStatistics {
    fn default() -> Self {
        Self {
            total_runs: 0,
            successful_runs: 0,
            failed_runs: 0,
            last_run: DateTime::UNIX_EPOCH,
            average_duration_ms: 0.0,
            diagnostics: Vec::new(),
        }
    }
}

impl SelfCheckRunStatistics {
    /// Record a successful cycle and fold its duration into the running mean.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_success(&mut self, duration_ms: f64, at: DateTime<Utc>) {
        self.total_runs += 1;
        self.successful_runs += 1;
        self.last_run = at;
        self.average_duration_ms +=
            (duration_ms - self.average_duration_ms) / self.successful_runs as f64;
    }

    /// Record a failed cycle with a diagnostic message.
    pub fn record_failure(&mut self, message: impl Into<String>, at: DateTime<Utc>) {
        self.total_runs += 1;
        self.failed_runs += 1;
        self.last_run = at;
        self.push_diagnostic(message);
    }

    /// Append a diagnostic, dropping the oldest past [`MAX_DIAGNOSTICS`].
    pub fn push_diagnostic(&mut self, message: impl Into<String>) {
        self.diagnostics.push(message.into());
        if self.diagnostics.len() > MAX_DIAGNOSTICS {
            let excess = self.diagnostics.len() - MAX_DIAGNOSTICS;
            self.diagnostics.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_status_from_count() {
        assert_eq!(HealthStatus::from_count(0, 3), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_count(2, 3), HealthStatus::Warning);
        assert_eq!(HealthStatus::from_count(3, 3), HealthStatus::Critical);
        assert_eq!(HealthStatus::from_count(7, 3), HealthStatus::Critical);
    }

    #[test]
    fn running_average_is_incremental() {
        let mut stats = SelfCheckRunStatistics::default();
        let now = Utc::now();
        stats.record_success(100.0, now);
        stats.record_success(200.0, now);
        stats.record_success(300.0, now);
        assert!((stats.average_duration_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(stats.successful_runs, 3);
    }

    #[test]
    fn failures_do_not_move_the_average() {
        let mut stats = SelfCheckRunStatistics::default();
        let now = Utc::now();
        stats.record_success(50.0, now);
        stats.record_failure("boom", now);
        assert!((stats.average_duration_ms - 50.0).abs() < f64::EPSILON);
        assert_eq!(stats.failed_runs, 1);
        assert_eq!(stats.total_runs, 2);
        assert_eq!(stats.diagnostics, vec!["boom".to_string()]);
    }

    #[test]
    fn diagnostics_are_bounded() {
        let mut stats = SelfCheckRunStatistics::default();
        for i in 0..(MAX_DIAGNOSTICS + 5) {
            stats.push_diagnostic(format!("d{i}"));
        }
        assert_eq!(stats.diagnostics.len(), MAX_DIAGNOSTICS);
        assert_eq!(stats.diagnostics[0], "d5");
    }

    #[test]
    fn default_statistics_start_at_epoch() {
        let stats = SelfCheckRunStatistics::default();
        assert_eq!(stats.last_run.timestamp(), 0);
        assert_eq!(stats.total_runs, 0);
    }

    #[test]
    fn credential_debug_redacts_secret() {
        let cred = Credential::new("iflow", "sk-supersecretvalue1234567890abcd");
        let debug = format!("{cred:?}");
        assert!(!debug.contains("supersecret"));
        assert!(debug.contains("sk-s"));
    }

    #[test]
    fn expiry_checks() {
        let now = Utc::now();
        let mut cred = Credential::new("qwen", "token-value-abcdefghijkl");
        assert!(!cred.is_expiring(now, chrono::Duration::minutes(10)));
        cred.expires_at = Some(now + chrono::Duration::minutes(5));
        assert!(cred.is_expiring(now, chrono::Duration::minutes(10)));
        assert!(!cred.is_expired(now));
        cred.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(cred.is_expired(now));
    }
}
