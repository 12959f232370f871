//! Error types for credguard.
//!
//! Uses `thiserror` for structured error types that map to exit codes.
//!
//! ## Error Taxonomy
//!
//! Errors are categorized into six categories:
//! - **Authentication**: malformed keys, explicit provider rejections
//! - **Network**: timeouts and connection failures during probes or refreshes
//! - **Configuration**: config file problems, missing collaborators
//! - **Provider**: rate limits and unexpected provider responses
//! - **Recovery**: refresh unavailable, manual re-authorization required
//! - **Internal**: I/O, JSON, and unclassified failures
//!
//! Each error has a stable error code (e.g., `CG-A001`) for programmatic handling.

use std::path::PathBuf;

use thiserror::Error;

// =============================================================================
// Error Categories
// =============================================================================

/// High-level error categories for classification and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Credential format or provider rejection.
    Authentication,
    /// Timeout or connection failure.
    Network,
    /// Configuration issues (parse errors, invalid values, missing collaborators).
    Configuration,
    /// Provider-side conditions that are not authentication failures.
    Provider,
    /// Recovery workflow outcomes that need attention.
    Recovery,
    /// Internal errors (I/O, serialization, unexpected state).
    Internal,
}

impl ErrorCategory {
    /// Returns a human-readable description of the category.
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::Authentication => "Authentication error",
            Self::Network => "Network error",
            Self::Configuration => "Configuration error",
            Self::Provider => "Provider error",
            Self::Recovery => "Recovery error",
            Self::Internal => "Internal error",
        }
    }

    /// Returns a short code prefix for this category.
    #[must_use]
    pub const fn code_prefix(&self) -> &'static str {
        match self {
            Self::Authentication => "A",
            Self::Network => "N",
            Self::Configuration => "C",
            Self::Provider => "P",
            Self::Recovery => "R",
            Self::Internal => "X",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

// =============================================================================
// Exit Codes
// =============================================================================

/// Process exit codes for the `credguard` binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    /// Success
    Success = 0,
    /// Unexpected failure or failed self-check cycle
    GeneralError = 1,
    /// Configuration could not be loaded or is invalid
    ConfigError = 2,
    /// Credential is invalid
    InvalidCredential = 3,
    /// Timeout
    Timeout = 4,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as Self
    }
}

/// Main error type for credguard operations.
#[derive(Error, Debug)]
pub enum GuardError {
    // ==========================================================================
    // Authentication errors
    // ==========================================================================
    /// Credential failed the provider's format rules; no network call was made.
    #[error("credential for {provider} has an invalid format: {reason}")]
    FormatInvalid { provider: String, reason: String },

    /// Provider explicitly rejected the credential.
    #[error("{provider} rejected the credential (HTTP {status}): {message}")]
    ProviderRejected {
        provider: String,
        status: u16,
        message: String,
    },

    // ==========================================================================
    // Network errors
    // ==========================================================================
    /// Probe or refresh timed out.
    #[error("request to {provider} timed out after {seconds}s")]
    Timeout { provider: String, seconds: u64 },

    /// Connection-level failure talking to a provider.
    #[error("network error talking to {provider}: {message}")]
    Network { provider: String, message: String },

    // ==========================================================================
    // Provider errors
    // ==========================================================================
    /// Provider rate limited the probe. The key authenticated.
    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    // ==========================================================================
    // Recovery errors
    // ==========================================================================
    /// No refresh mechanism is registered for the provider.
    #[error("no refresh mechanism available for {provider}")]
    RefreshUnavailable { provider: String },

    /// Refresh attempt ran but did not produce a usable credential.
    #[error("refresh failed for {provider}: {message}")]
    RefreshFailed { provider: String, message: String },

    /// Credential cannot be recovered automatically.
    #[error("credential {credential_id} for {provider} must be re-authorized manually")]
    RecreateRequired {
        provider: String,
        credential_id: String,
        auth_url: Option<String>,
        credential_file: Option<PathBuf>,
    },

    // ==========================================================================
    // Configuration errors
    // ==========================================================================
    /// No pipeline manager was configured.
    #[error("pipeline manager is not configured")]
    PipelineManagerUnavailable,

    /// The pipeline manager returned an error.
    #[error("pipeline manager error: {0}")]
    PipelineManager(String),

    /// Credential id is not known to the engine.
    #[error("unknown credential: {0}")]
    UnknownCredential(String),

    /// Error parsing configuration file.
    #[error("config parse error at {path}: {message}")]
    ConfigParse { path: String, message: String },

    /// Generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    // ==========================================================================
    // Internal errors
    // ==========================================================================
    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for other errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GuardError {
    /// Map error to a process exit code.
    #[must_use]
    pub const fn exit_code(&self) -> ExitCode {
        match self {
            Self::FormatInvalid { .. }
            | Self::ProviderRejected { .. }
            | Self::RecreateRequired { .. } => ExitCode::InvalidCredential,

            Self::Timeout { .. } => ExitCode::Timeout,

            Self::PipelineManagerUnavailable | Self::ConfigParse { .. } | Self::Config(_) => {
                ExitCode::ConfigError
            }

            Self::Network { .. }
            | Self::RateLimited { .. }
            | Self::RefreshUnavailable { .. }
            | Self::RefreshFailed { .. }
            | Self::PipelineManager(_)
            | Self::UnknownCredential(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Other(_) => ExitCode::GeneralError,
        }
    }

    /// Returns the error category for classification and routing.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::FormatInvalid { .. } | Self::ProviderRejected { .. } => {
                ErrorCategory::Authentication
            }
            Self::Timeout { .. } | Self::Network { .. } => ErrorCategory::Network,
            Self::RateLimited { .. } | Self::PipelineManager(_) => ErrorCategory::Provider,
            Self::RefreshUnavailable { .. }
            | Self::RefreshFailed { .. }
            | Self::RecreateRequired { .. } => ErrorCategory::Recovery,
            Self::PipelineManagerUnavailable
            | Self::UnknownCredential(_)
            | Self::ConfigParse { .. }
            | Self::Config(_) => ErrorCategory::Configuration,
            Self::Io(_) | Self::Json(_) | Self::Other(_) => ErrorCategory::Internal,
        }
    }

    /// Returns a stable error code for programmatic handling.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::FormatInvalid { .. } => "CG-A001",
            Self::ProviderRejected { .. } => "CG-A002",
            Self::Timeout { .. } => "CG-N001",
            Self::Network { .. } => "CG-N002",
            Self::RateLimited { .. } => "CG-P001",
            Self::PipelineManager(_) => "CG-P010",
            Self::RefreshUnavailable { .. } => "CG-R001",
            Self::RefreshFailed { .. } => "CG-R002",
            Self::RecreateRequired { .. } => "CG-R003",
            Self::PipelineManagerUnavailable => "CG-C001",
            Self::UnknownCredential(_) => "CG-C002",
            Self::ConfigParse { .. } => "CG-C003",
            Self::Config(_) => "CG-C004",
            Self::Io(_) => "CG-X001",
            Self::Json(_) => "CG-X002",
            Self::Other(_) => "CG-X099",
        }
    }

    /// Returns whether the error is potentially recoverable by retrying later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Network { .. } | Self::RateLimited { .. }
        )
    }

    /// Whether this error is an authentication failure for classification purposes.
    ///
    /// Recovery outcomes count too: a failed refresh or a required re-authorization
    /// is evidence that the credential does not authenticate.
    #[must_use]
    pub const fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::FormatInvalid { .. }
                | Self::ProviderRejected { .. }
                | Self::RefreshFailed { .. }
                | Self::RecreateRequired { .. }
        )
    }

    /// Returns the provider name if this error is provider-specific.
    #[must_use]
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::FormatInvalid { provider, .. }
            | Self::ProviderRejected { provider, .. }
            | Self::Timeout { provider, .. }
            | Self::Network { provider, .. }
            | Self::RateLimited { provider }
            | Self::RefreshUnavailable { provider }
            | Self::RefreshFailed { provider, .. }
            | Self::RecreateRequired { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// Human-actionable instruction, when the error needs an operator.
    #[must_use]
    pub fn required_action(&self) -> Option<String> {
        match self {
            Self::RecreateRequired {
                provider,
                auth_url,
                credential_file,
                ..
            } => {
                let mut action = format!("complete the authorization flow for {provider}");
                if let Some(url) = auth_url {
                    action.push_str(&format!(" at {url}"));
                }
                if let Some(file) = credential_file {
                    action.push_str(&format!(" and refresh {}", file.display()));
                }
                Some(action)
            }
            Self::FormatInvalid { provider, .. } => {
                Some(format!("replace the malformed {provider} API key"))
            }
            Self::PipelineManagerUnavailable => {
                Some("configure a pipeline manager before running self-checks".to_string())
            }
            _ => None,
        }
    }
}

/// Result type alias for credguard operations.
pub type Result<T> = std::result::Result<T, GuardError>;

// =============================================================================
// Tests
// =============================================================================
