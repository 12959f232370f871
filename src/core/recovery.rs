//! Credential recovery workflow.
//!
//! ```text
//! Idle ─trigger─▶ Refreshing ─ok─▶ Validating ─ok─▶ Recovered
//!                     │                 │
//!                     └──fail──┬────────┘
//!                              ▼
//!                       RecreateRequired (terminal, reported once)
//! ```
//!
//! Every run is dispatched onto its own task; the caller gets the credential's
//! pre-recovery status back immediately. At most one run per credential is in
//! flight. A run makes exactly one refresh attempt and never retries: an
//! unrecoverable credential is surfaced to an operator instead.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::credential_id::CredentialId;
use super::credentials::CredentialStore;
use super::lifecycle::PipelineLifecycleCoordinator;
use super::logging;
use super::models::{Credential, CredentialStatus};
use super::ports::{ErrorSink, StructuredError, StructuredErrorKind};
use super::provider::ProviderRegistry;
use super::validator::{CredentialValidator, ProbeTarget};
use crate::error::GuardError;

/// Finished runs kept for inspection.
pub const MAX_RECOVERY_HISTORY: usize = 50;

// =============================================================================
// States and Reports
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    Idle,
    Refreshing,
    Validating,
    Recovered,
    RecreateRequired,
}

impl RecoveryState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Recovered | Self::RecreateRequired)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Refreshing => "refreshing",
            Self::Validating => "validating",
            Self::Recovered => "recovered",
            Self::RecreateRequired => "recreate_required",
        }
    }
}

impl std::fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one finished workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub credential_id: CredentialId,
    pub provider: String,
    pub outcome: RecoveryState,
    /// Why recreation is required, or `None` when recovered.
    pub reason: Option<String>,
    pub refresh_attempts: u32,
    pub restored_pipelines: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// What a trigger did.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// A new run was spawned.
    Dispatched(JoinHandle<RecoveryReport>),
    /// A run for this credential is already in flight; nothing was spawned.
    AlreadyInFlight,
    UnknownCredential,
}

/// Returned from [`RecoveryWorkflow::trigger`] without waiting on the run.
#[derive(Debug)]
pub struct RecoveryDispatch {
    /// Credential status before any recovery step ran.
    pub snapshot: CredentialStatus,
    pub outcome: DispatchOutcome,
}

impl RecoveryDispatch {
    #[must_use]
    pub const fn was_dispatched(&self) -> bool {
        matches!(self.outcome, DispatchOutcome::Dispatched(_))
    }

    /// Wait for the spawned run, if any.
    pub async fn wait(self) -> Option<RecoveryReport> {
        match self.outcome {
            DispatchOutcome::Dispatched(handle) => handle.await.ok(),
            DispatchOutcome::AlreadyInFlight | DispatchOutcome::UnknownCredential => None,
        }
    }
}

// =============================================================================
// Workflow
// =============================================================================

struct Shared {
    credentials: Arc<CredentialStore>,
    validator: Arc<CredentialValidator>,
    registry: Arc<ProviderRegistry>,
    lifecycle: Arc<PipelineLifecycleCoordinator>,
    sink: Option<Arc<dyn ErrorSink>>,
    in_flight: Mutex<HashMap<CredentialId, RecoveryState>>,
    history: Mutex<VecDeque<RecoveryReport>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Dispatches and tracks per-credential recovery runs.
#[derive(Clone)]
pub struct RecoveryWorkflow {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RecoveryWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryWorkflow")
            .field("in_flight", &lock(&self.shared.in_flight).len())
            .field("history", &lock(&self.shared.history).len())
            .finish_non_exhaustive()
    }
}

impl RecoveryWorkflow {
    #[must_use]
    pub fn new(
        credentials: Arc<CredentialStore>,
        validator: Arc<CredentialValidator>,
        registry: Arc<ProviderRegistry>,
        lifecycle: Arc<PipelineLifecycleCoordinator>,
        sink: Option<Arc<dyn ErrorSink>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                credentials,
                validator,
                registry,
                lifecycle,
                sink,
                in_flight: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Start recovery for a credential without waiting for it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn trigger(&self, credential_id: &CredentialId) -> RecoveryDispatch {
        let Some(credential) = self.shared.credentials.get(credential_id) else {
            tracing::warn!(credential_id = %credential_id, "Recovery requested for unknown credential");
            return RecoveryDispatch {
                snapshot: CredentialStatus::Unknown,
                outcome: DispatchOutcome::UnknownCredential,
            };
        };
        let snapshot = credential.status;

        {
            let mut in_flight = lock(&self.shared.in_flight);
            if in_flight.contains_key(credential_id) {
                tracing::debug!(credential_id = %credential_id, "Recovery already in flight");
                return RecoveryDispatch {
                    snapshot,
                    outcome: DispatchOutcome::AlreadyInFlight,
                };
            }
            in_flight.insert(credential_id.clone(), RecoveryState::Refreshing);
        }

        tracing::info!(
            credential_id = %credential_id,
            provider = %credential.provider,
            snapshot = %snapshot,
            "Dispatching recovery"
        );

        let shared = Arc::clone(&self.shared);
        let span = logging::credential_span(credential_id, &credential.provider);
        let task = async move {
            let id = credential.id.clone();
            let provider = credential.provider.clone();
            let started_at = Utc::now();

            let report = match AssertUnwindSafe(shared.run(credential.clone(), started_at))
                .catch_unwind()
                .await
            {
                Ok(report) => report,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(credential_id = %id, panic = %message, "Recovery task panicked");
                    let reason = format!("recovery task panicked: {message}");
                    shared.escalate(&credential, &reason).await;
                    RecoveryReport {
                        credential_id: id.clone(),
                        provider,
                        outcome: RecoveryState::RecreateRequired,
                        reason: Some(reason),
                        refresh_attempts: 0,
                        restored_pipelines: Vec::new(),
                        started_at,
                        finished_at: Utc::now(),
                    }
                }
            };

            lock(&shared.in_flight).remove(&id);
            let mut history = lock(&shared.history);
            history.push_back(report.clone());
            while history.len() > MAX_RECOVERY_HISTORY {
                history.pop_front();
            }
            drop(history);
            report
        };
        let handle = tokio::spawn(task.instrument(span));

        RecoveryDispatch {
            snapshot,
            outcome: DispatchOutcome::Dispatched(handle),
        }
    }

    /// State of the in-flight run for a credential, or `Idle`.
    #[must_use]
    pub fn state(&self, credential_id: &CredentialId) -> RecoveryState {
        lock(&self.shared.in_flight)
            .get(credential_id)
            .copied()
            .unwrap_or(RecoveryState::Idle)
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        lock(&self.shared.in_flight).len()
    }

    /// Finished runs, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<RecoveryReport> {
        lock(&self.shared.history).iter().cloned().collect()
    }

    /// Most recent finished run for a credential.
    #[must_use]
    pub fn last_report(&self, credential_id: &CredentialId) -> Option<RecoveryReport> {
        lock(&self.shared.history)
            .iter()
            .rev()
            .find(|r| &r.credential_id == credential_id)
            .cloned()
    }

    /// Forget finished runs. In-flight runs are unaffected.
    pub fn clear_history(&self) {
        lock(&self.shared.history).clear();
    }
}

impl Shared {
    fn set_state(&self, id: &CredentialId, state: RecoveryState) {
        if let Some(entry) = lock(&self.in_flight).get_mut(id) {
            *entry = state;
        }
        tracing::debug!(credential_id = %id, state = %state, "Recovery state changed");
    }

    async fn run(&self, credential: Credential, started_at: DateTime<Utc>) -> RecoveryReport {
        let id = credential.id.clone();
        let provider = credential.provider.clone();
        let report = |outcome: RecoveryState,
                      reason: Option<String>,
                      refresh_attempts: u32,
                      restored_pipelines: Vec<String>| {
            RecoveryReport {
                credential_id: id.clone(),
                provider: provider.clone(),
                outcome,
                reason,
                refresh_attempts,
                restored_pipelines,
                started_at,
                finished_at: Utc::now(),
            }
        };

        // Refreshing
        let Some(refresher) = self.registry.refresher(&provider) else {
            let reason = GuardError::RefreshUnavailable {
                provider: provider.clone(),
            }
            .to_string();
            self.escalate(&credential, &reason).await;
            return report(RecoveryState::RecreateRequired, Some(reason), 0, Vec::new());
        };

        let refreshed = refresher.refresh(&credential).await;
        if !refreshed.success {
            let reason = GuardError::RefreshFailed {
                provider: provider.clone(),
                message: refreshed
                    .error
                    .unwrap_or_else(|| "refresh reported failure".to_string()),
            }
            .to_string();
            self.escalate(&credential, &reason).await;
            return report(RecoveryState::RecreateRequired, Some(reason), 1, Vec::new());
        }

        let mut candidate = credential.clone();
        if let Some(secret) = refreshed.refreshed_secret {
            self.credentials
                .update_secret(&id, secret.clone(), refreshed.expires_at);
            candidate.secret = secret;
        }
        if refreshed.expires_at.is_some() {
            candidate.expires_at = refreshed.expires_at;
        }

        // Validating
        self.set_state(&id, RecoveryState::Validating);
        let outcome = self
            .validator
            .probe(&provider, &candidate.secret, &ProbeTarget::for_credential(&candidate))
            .await;
        let now = Utc::now();
        self.credentials
            .record_validation(&id, outcome.credential_status(), now);

        if outcome.is_valid() {
            let restored = self.lifecycle.restore_recovered(&id).await;
            self.set_state(&id, RecoveryState::Recovered);
            tracing::info!(
                credential_id = %id,
                provider = %provider,
                restored = restored.len(),
                "Credential recovered"
            );
            return report(RecoveryState::Recovered, None, 1, restored);
        }

        let reason = outcome
            .into_error(&provider, self.validator.timeout())
            .map_or_else(|| "re-validation failed".to_string(), |e| e.to_string());
        let reason = format!("refreshed credential failed validation: {reason}");
        self.escalate(&candidate, &reason).await;
        self.lifecycle.pin_failed_secret(&id, &credential.secret);
        report(RecoveryState::RecreateRequired, Some(reason), 1, Vec::new())
    }

    /// Terminal failure: maintenance, log, and report once.
    async fn escalate(&self, credential: &Credential, reason: &str) {
        self.set_state(&credential.id, RecoveryState::RecreateRequired);

        let backend = self.registry.backend(&credential.provider);
        let error = GuardError::RecreateRequired {
            provider: credential.provider.clone(),
            credential_id: credential.id.to_string(),
            auth_url: backend.authorization_url().map(str::to_string),
            credential_file: credential.token_file.clone(),
        };

        let marked = self.lifecycle.mark_maintenance(&credential.id, reason).await;
        let action = error.required_action().unwrap_or_default();
        let auth_url = backend.authorization_url().unwrap_or("");
        let credential_file = credential
            .token_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        tracing::warn!(
            event = "recreate_required",
            credential_id = %credential.id,
            provider = %credential.provider,
            auth_url,
            credential_file = %credential_file,
            pipelines = marked.len(),
            reason,
            "{action}"
        );

        if let Some(sink) = &self.sink {
            let affected: Vec<String> = self
                .credentials
                .dependents(&credential.id)
                .into_iter()
                .collect();
            sink.report(StructuredError {
                kind: StructuredErrorKind::RecreateRequired,
                provider: credential.provider.clone(),
                credential_id: Some(credential.id.to_string()),
                affected_pipelines: affected,
                message: format!("{error}: {reason}; {action}"),
                requires_action: true,
                action_url: backend.authorization_url().map(str::to_string),
                credential_file: credential.token_file.clone(),
                timestamp: Utc::now(),
            })
            .await;
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(RecoveryState::Recovered.is_terminal());
        assert!(RecoveryState::RecreateRequired.is_terminal());
        assert!(!RecoveryState::Refreshing.is_terminal());
        assert_eq!(RecoveryState::RecreateRequired.to_string(), "recreate_required");
    }

    #[test]
    fn panic_messages_are_extracted() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
