//! Provider backends and registry.
//!
//! Each upstream provider contributes a small capability set: a format rule
//! for its keys, a default probe endpoint and model, an interpretation of probe
//! responses, and optionally a refresh mechanism. Adding a provider means
//! registering a backend, never editing a match on the provider name.

use std::collections::HashMap;
use std::sync::Arc;

use super::ports::CredentialRefresher;
use crate::providers::{generic::GenericBackend, iflow::IflowBackend, qwen::QwenBackend};

/// Name reported for errors that cannot be attributed to a provider.
pub const UNKNOWN_PROVIDER: &str = "unknown";

// =============================================================================
// Probe Verdict
// =============================================================================

/// Provider-specific reading of a probe response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// Recognizable success envelope.
    Valid,
    /// Rate limited. The key authenticated.
    RateLimited,
    /// Provider does not accept the key (bad or revoked key, 401/403 style).
    Rejected {
        status: u16,
        message: String,
        expired: bool,
    },
}

impl ProbeVerdict {
    /// Rejection carrying the response body as the message.
    #[must_use]
    pub fn rejected(status: u16, body: &str) -> Self {
        let message = summarize_body(body);
        let expired = message.to_lowercase().contains("expired");
        Self::Rejected {
            status,
            message,
            expired,
        }
    }
}

/// Trim a response body to something fit for logs and reports.
#[must_use]
pub fn summarize_body(body: &str) -> String {
    const MAX: usize = 200;
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response body".to_string();
    }
    if trimmed.chars().count() <= MAX {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(MAX).collect();
        format!("{head}…")
    }
}

/// Whether an OpenAI-style chat completion envelope is present.
#[must_use]
pub fn has_choices(json: &serde_json::Value) -> bool {
    json.get("choices").is_some_and(serde_json::Value::is_array)
}

// =============================================================================
// Provider Backend
// =============================================================================

/// Capabilities a provider contributes to credential validation.
pub trait ProviderBackend: Send + Sync {
    /// Lowercase provider name.
    fn name(&self) -> &'static str;

    /// Cheap offline check of the key's shape. Failing keys are never probed.
    fn check_format(&self, secret: &str) -> bool;

    /// Human-readable description of the format rule.
    fn format_rule(&self) -> &'static str;

    /// Chat completion endpoint used for live probes.
    fn default_endpoint(&self) -> &'static str;

    /// Model used for live probes when the pipeline doesn't name one.
    fn default_test_model(&self) -> &'static str;

    /// Interpret an HTTP status and body returned by a probe.
    fn interpret_probe(&self, status: u16, body: &str) -> ProbeVerdict;

    /// Where an operator re-authorizes a credential, for OAuth providers.
    fn authorization_url(&self) -> Option<&'static str> {
        None
    }
}

impl std::fmt::Debug for dyn ProviderBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderBackend")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Maps provider names to their backends and refresh mechanisms.
pub struct ProviderRegistry {
    backends: HashMap<String, Arc<dyn ProviderBackend>>,
    refreshers: HashMap<String, Arc<dyn CredentialRefresher>>,
    fallback: Arc<dyn ProviderBackend>,
}

impl ProviderRegistry {
    /// Empty registry that routes every provider to the generic backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            refreshers: HashMap::new(),
            fallback: Arc::new(GenericBackend::new("generic")),
        }
    }

    /// Registry with the built-in provider backends.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(IflowBackend));
        registry.register(Arc::new(QwenBackend));
        registry.register(Arc::new(GenericBackend::new("openai")));
        registry
    }

    /// Register (or replace) a backend under its own name.
    pub fn register(&mut self, backend: Arc<dyn ProviderBackend>) {
        self.backends.insert(backend.name().to_lowercase(), backend);
    }

    /// Register (or replace) the refresh mechanism for a provider.
    pub fn register_refresher(&mut self, provider: &str, refresher: Arc<dyn CredentialRefresher>) {
        self.refreshers.insert(provider.to_lowercase(), refresher);
    }

    /// Backend for `provider`, falling back to the generic rules.
    #[must_use]
    pub fn backend(&self, provider: &str) -> Arc<dyn ProviderBackend> {
        self.backends
            .get(&provider.to_lowercase())
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    #[must_use]
    pub fn refresher(&self, provider: &str) -> Option<Arc<dyn CredentialRefresher>> {
        self.refreshers.get(&provider.to_lowercase()).cloned()
    }

    /// Whether the provider has a refresh mechanism.
    #[must_use]
    pub fn is_refreshable(&self, provider: &str) -> bool {
        self.refreshers.contains_key(&provider.to_lowercase())
    }

    /// Whether a backend was registered explicitly for `provider`.
    #[must_use]
    pub fn is_known(&self, provider: &str) -> bool {
        self.backends.contains_key(&provider.to_lowercase())
    }

    /// Registered provider names, sorted.
    #[must_use]
    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut refreshable: Vec<&String> = self.refreshers.keys().collect();
        refreshable.sort();
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.provider_names())
            .field("refreshable", &refreshable)
            .finish()
    }
}
