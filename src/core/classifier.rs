//! Authentication error classification.
//!
//! Turns a raw failure (from a probe, a refresh, or live traffic) into a
//! [`ClassifiedError`] attributed to a provider and the pipelines it affects.
//! Failures outside the authentication category are ignored.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use super::models::{AuthErrorKind, ClassifiedError};
use super::provider::UNKNOWN_PROVIDER;
use crate::error::GuardError;

/// Wording that marks free-form error text as an authentication failure.
static AUTH_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(401|403|unauthori[sz]ed|unauthenticated|authenticat\w*|oauth|access token|refresh token|api[ _-]?key|credentials?|expired|forbidden|permission denied)\b",
    )
    .expect("auth marker pattern")
});

/// Ordered substring rules; first match wins.
const KIND_RULES: &[(&str, AuthErrorKind)] = &[
    ("expired", AuthErrorKind::TokenExpired),
    ("invalid", AuthErrorKind::TokenInvalid),
    ("permission denied", AuthErrorKind::PermissionDenied),
    ("forbidden", AuthErrorKind::PermissionDenied),
];

// =============================================================================
// Error Context
// =============================================================================

/// A failure as reported to the classifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub message: String,
    /// Explicit provider attribution, when the reporter knows it.
    pub provider: Option<String>,
    /// Pipeline the failure was observed on.
    pub pipeline_id: Option<String>,
    /// Reporter asserts this is an authentication failure.
    pub auth_failure: bool,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ErrorContext {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Context for a typed engine error.
    #[must_use]
    pub fn from_error(error: &GuardError) -> Self {
        Self {
            message: error.to_string(),
            provider: error.provider().map(str::to_string),
            pipeline_id: None,
            auth_failure: error.is_auth_failure(),
            timestamp: None,
        }
    }

    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    #[must_use]
    pub fn with_pipeline(mut self, pipeline_id: impl Into<String>) -> Self {
        self.pipeline_id = Some(pipeline_id.into());
        self
    }

    #[must_use]
    pub const fn auth_failure(mut self, auth_failure: bool) -> Self {
        self.auth_failure = auth_failure;
        self
    }

    #[must_use]
    pub const fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Whether this context describes an authentication failure.
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        self.auth_failure || AUTH_MARKERS.is_match(&self.message)
    }
}

// =============================================================================
// Classifier
// =============================================================================

/// Maps failures onto the authentication error taxonomy.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    enabled: bool,
    /// Lowercase provider names, longest first so specific names win.
    known_providers: Vec<String>,
}

impl ErrorClassifier {
    #[must_use]
    pub fn new(enabled: bool, known_providers: impl IntoIterator<Item = String>) -> Self {
        let mut known_providers: Vec<String> = known_providers
            .into_iter()
            .map(|p| p.to_lowercase())
            .collect();
        known_providers.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        known_providers.dedup();
        Self {
            enabled,
            known_providers,
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Kind for an authentication failure message.
    #[must_use]
    pub fn kind_for(message: &str) -> AuthErrorKind {
        let lower = message.to_lowercase();
        KIND_RULES
            .iter()
            .find(|(needle, _)| lower.contains(needle))
            .map_or(AuthErrorKind::OAuthServerError, |(_, kind)| *kind)
    }

    /// Provider the failure belongs to.
    #[must_use]
    pub fn attribute_provider(&self, context: &ErrorContext) -> String {
        if let Some(provider) = context
            .provider
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            return provider.to_lowercase();
        }
        let lower = context.message.to_lowercase();
        self.known_providers
            .iter()
            .find(|name| lower.contains(name.as_str()))
            .cloned()
            .unwrap_or_else(|| UNKNOWN_PROVIDER.to_string())
    }

    /// Classify a failure.
    ///
    /// `configured_pipelines` returns the pipelines currently configured for a
    /// provider; they are unioned with the context's own pipeline.
    pub fn classify<F>(&self, context: &ErrorContext, configured_pipelines: F) -> Option<ClassifiedError>
    where
        F: FnOnce(&str) -> BTreeSet<String>,
    {
        if !self.enabled || !context.is_auth_failure() {
            return None;
        }

        let kind = Self::kind_for(&context.message);
        let provider = self.attribute_provider(context);

        let mut affected = configured_pipelines(&provider);
        if let Some(pipeline_id) = &context.pipeline_id {
            affected.insert(pipeline_id.clone());
        }

        tracing::debug!(
            provider = %provider,
            kind = %kind,
            affected = affected.len(),
            "Classified authentication failure"
        );

        Some(ClassifiedError {
            kind,
            provider,
            timestamp: context.timestamp.unwrap_or_else(Utc::now),
            affected_pipelines: affected.into_iter().collect(),
            message: context.message.clone(),
        })
    }
}
