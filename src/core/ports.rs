//! Collaborator ports consumed by the self-check engine.
//!
//! The pipeline manager, the error-notification sink, and per-provider refresh
//! mechanisms live outside this crate. They are modelled as object-safe async
//! traits so the gateway (or a test) can plug its own implementation in.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::models::{AuthErrorKind, Credential};
use crate::error::Result;

// =============================================================================
// Pipeline Manager
// =============================================================================

/// Static description of a pipeline as configured in the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDescriptor {
    pub provider: String,
    #[serde(skip_serializing)]
    pub credential: String,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub token_file: Option<PathBuf>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PipelineDescriptor {
    #[must_use]
    pub fn new(provider: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            credential: credential.into(),
            model: None,
            endpoint: None,
            token_file: None,
            expires_at: None,
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    #[must_use]
    pub fn with_token_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_file = Some(path.into());
        self
    }
}

/// Health reported by the pipeline manager for one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Error,
}

/// Per-pipeline entry of a status sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStatusReport {
    Reported(PipelineHealth),
    Failed { message: String },
}

/// Aggregate counts from the pipeline manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatistics {
    pub total_pipelines: usize,
    pub healthy_pipelines: usize,
}

/// The gateway component that owns pipeline instances.
///
/// Implementations serialize their own internal state.
#[async_trait]
pub trait PipelineManager: Send + Sync {
    /// All configured pipelines keyed by id.
    async fn get_all_pipelines(&self) -> Result<HashMap<String, PipelineDescriptor>>;

    /// Current health for every pipeline.
    async fn get_all_pipeline_status(&self) -> Result<HashMap<String, PipelineStatusReport>>;

    /// Tear down a pipeline. `Ok(false)` means the manager declined.
    async fn destroy_pipeline(&self, pipeline_id: &str) -> Result<bool>;

    async fn get_pipeline(&self, pipeline_id: &str) -> Result<Option<PipelineDescriptor>>;

    async fn get_statistics(&self) -> Result<PipelineStatistics>;
}

// =============================================================================
// Error Sink
// =============================================================================

/// Kind of structured error reported to the notification sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuredErrorKind {
    /// Repeated authentication failures crossed the notification threshold.
    AuthHealthDegraded(AuthErrorKind),
    /// A credential cannot be recovered without a human.
    RecreateRequired,
    /// Pipeline manager missing or failing.
    Configuration,
}

/// Error event delivered to the external notification sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredError {
    pub kind: StructuredErrorKind,
    pub provider: String,
    pub credential_id: Option<String>,
    pub affected_pipelines: Vec<String>,
    pub message: String,
    pub requires_action: bool,
    pub action_url: Option<String>,
    pub credential_file: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
}

/// General-purpose error reporting collaborator.
#[async_trait]
pub trait ErrorSink: Send + Sync {
    async fn report(&self, error: StructuredError);
}

// =============================================================================
// Refresh Mechanism
// =============================================================================

/// Result of a provider refresh attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub success: bool,
    pub refreshed_count: u32,
    pub error: Option<String>,
    /// New secret, when the refresh replaced the access token.
    pub refreshed_secret: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RefreshOutcome {
    #[must_use]
    pub fn refreshed(secret: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            success: true,
            refreshed_count: 1,
            error: None,
            refreshed_secret: Some(secret.into()),
            expires_at,
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            refreshed_count: 0,
            error: Some(error.into()),
            refreshed_secret: None,
            expires_at: None,
        }
    }
}

/// Provider-specific credential refresh, e.g. an OAuth refresh-token exchange.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self, credential: &Credential) -> RefreshOutcome;
}
