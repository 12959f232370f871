//! The self-check engine.
//!
//! One explicitly constructed instance owns every cache the self-check
//! subsystem needs: the credential store, the per-provider error buffers,
//! the pipeline check results, the recovery bookkeeping, and the run
//! statistics. Callers share it behind an `Arc`; there is no ambient state.
//!
//! A cycle validates every known credential, feeds failures through the
//! classifier into the health aggregator, blacklists dependent pipelines,
//! dispatches recovery where it can help, and finishes with a pipeline
//! health sweep. Unexpected errors and panics inside a cycle are folded into
//! the run statistics; they never escape to the caller.

use std::collections::{BTreeSet, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::classifier::{ErrorClassifier, ErrorContext};
use super::credential_id::CredentialId;
use super::credentials::CredentialStore;
use super::health::HealthAggregator;
use super::lifecycle::PipelineLifecycleCoordinator;
use super::logging;
use super::models::{
    AuthErrorKind, ClassifiedError, Credential, CredentialStatus, HealthStatus, HealthVerdict,
    PipelineCheckResult, ProviderVerdict, SelfCheckRunStatistics,
};
use super::ports::{ErrorSink, PipelineManager, StructuredError, StructuredErrorKind};
use super::provider::ProviderRegistry;
use super::recovery::{DispatchOutcome, RecoveryReport, RecoveryWorkflow, panic_message};
use super::validator::{CredentialValidator, ProbeTarget, ValidationOutcome};
use crate::error::{GuardError, Result};
use crate::providers::OAuthTokenRefresher;
use crate::storage::config::{Config, SelfCheckConfig};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

// =============================================================================
// Cycle Summary
// =============================================================================

/// What one self-check cycle did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleSummary {
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub credentials_checked: usize,
    pub valid: usize,
    pub invalid: usize,
    pub expired: usize,
    pub errors_classified: usize,
    pub recoveries_dispatched: usize,
    pub blacklisted: Vec<String>,
    pub destroyed: Vec<String>,
    pub restored: Vec<String>,
    pub pipelines_checked: usize,
}

impl CycleSummary {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            ..Self::default()
        }
    }

    fn count(&mut self, status: CredentialStatus) {
        self.credentials_checked += 1;
        match status {
            CredentialStatus::Valid => self.valid += 1,
            CredentialStatus::Invalid => self.invalid += 1,
            CredentialStatus::Expired => self.expired += 1,
            CredentialStatus::Unknown => {}
        }
    }
}

/// Rejections that a refresh cannot fix: malformed or revoked keys.
const fn is_unrecoverable(outcome: &ValidationOutcome) -> bool {
    matches!(
        outcome,
        ValidationOutcome::FormatInvalid { .. } | ValidationOutcome::Rejected { expired: false, .. }
    )
}

/// Most frequent kind; ties go to the earliest seen.
fn dominant_kind(errors: &[ClassifiedError]) -> AuthErrorKind {
    let mut counts: Vec<(AuthErrorKind, usize)> = Vec::new();
    for error in errors {
        match counts.iter_mut().find(|(kind, _)| *kind == error.kind) {
            Some((_, n)) => *n += 1,
            None => counts.push((error.kind, 1)),
        }
    }
    counts
        .into_iter()
        .rev()
        .max_by_key(|(_, n)| *n)
        .map_or(AuthErrorKind::OAuthServerError, |(kind, _)| kind)
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`SelfCheckEngine`] from configuration and collaborators.
pub struct SelfCheckEngineBuilder {
    config: Config,
    registry: Option<ProviderRegistry>,
    manager: Option<Arc<dyn PipelineManager>>,
    sink: Option<Arc<dyn ErrorSink>>,
}

impl SelfCheckEngineBuilder {
    #[must_use]
    pub fn pipeline_manager(mut self, manager: Arc<dyn PipelineManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    #[must_use]
    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Replace the built-in provider registry.
    #[must_use]
    pub fn registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the engine.
    ///
    /// Providers configured with a token endpoint and client id get an OAuth
    /// refresh-token refresher unless the registry already has one.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be built.
    pub fn build(self) -> Result<SelfCheckEngine> {
        let Self {
            config,
            registry,
            manager,
            sink,
        } = self;
        let settings = config.selfcheck.clone();

        let mut registry = registry.unwrap_or_else(ProviderRegistry::with_defaults);
        for (name, provider) in &config.providers {
            if registry.is_refreshable(name) {
                continue;
            }
            if let (Some(endpoint), Some(client_id)) = (&provider.token_endpoint, &provider.client_id) {
                let mut refresher = OAuthTokenRefresher::new(
                    name,
                    endpoint.clone(),
                    client_id.clone(),
                    settings.refresh_timeout(),
                )?;
                if let Some(secret) = &provider.client_secret {
                    refresher = refresher.with_client_secret(secret.clone());
                }
                tracing::debug!(provider = %name, "Registered OAuth refresher");
                registry.register_refresher(name, Arc::new(refresher));
            }
        }
        let registry = Arc::new(registry);

        let mut validator =
            CredentialValidator::new(Arc::clone(&registry), settings.validation_timeout())?;
        for (name, provider) in &config.providers {
            if provider.endpoint.is_some() || provider.test_model.is_some() {
                validator = validator.with_provider_defaults(
                    name,
                    provider.endpoint.clone(),
                    provider.test_model.clone(),
                );
            }
        }
        let validator = Arc::new(validator);

        let known_providers = registry
            .provider_names()
            .into_iter()
            .chain(config.providers.keys().cloned())
            .chain(config.pipelines.iter().map(|p| p.provider.clone()));
        let classifier = ErrorClassifier::new(config.oauth.detection_enabled, known_providers);

        let credentials = Arc::new(CredentialStore::new());
        let lifecycle = Arc::new(PipelineLifecycleCoordinator::new(
            Arc::clone(&credentials),
            manager,
        ));
        let recovery = RecoveryWorkflow::new(
            Arc::clone(&credentials),
            Arc::clone(&validator),
            Arc::clone(&registry),
            Arc::clone(&lifecycle),
            sink.clone(),
        );

        Ok(SelfCheckEngine {
            settings,
            registry,
            credentials,
            validator,
            classifier,
            health: HealthAggregator::new(config.oauth.health_settings()),
            lifecycle,
            recovery,
            sink,
            stats: Mutex::new(SelfCheckRunStatistics::default()),
            last_cycle: Mutex::new(None),
            dispatched: Mutex::new(Vec::new()),
            manager_missing_reported: AtomicBool::new(false),
        })
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Credential validation, auth-health aggregation, recovery, and pipeline
/// lifecycle coordination for one gateway.
pub struct SelfCheckEngine {
    settings: SelfCheckConfig,
    registry: Arc<ProviderRegistry>,
    credentials: Arc<CredentialStore>,
    validator: Arc<CredentialValidator>,
    classifier: ErrorClassifier,
    health: HealthAggregator,
    lifecycle: Arc<PipelineLifecycleCoordinator>,
    recovery: RecoveryWorkflow,
    sink: Option<Arc<dyn ErrorSink>>,
    stats: Mutex<SelfCheckRunStatistics>,
    last_cycle: Mutex<Option<CycleSummary>>,
    dispatched: Mutex<Vec<JoinHandle<RecoveryReport>>>,
    /// The missing-manager configuration error goes to the sink once.
    manager_missing_reported: AtomicBool,
}

impl std::fmt::Debug for SelfCheckEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfCheckEngine")
            .field("registry", &self.registry)
            .field("credentials", &self.credentials.len())
            .field("recovery", &self.recovery)
            .field("has_sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

impl SelfCheckEngine {
    #[must_use]
    pub fn builder(config: &Config) -> SelfCheckEngineBuilder {
        SelfCheckEngineBuilder {
            config: config.clone(),
            registry: None,
            manager: None,
            sink: None,
        }
    }

    #[must_use]
    pub const fn settings(&self) -> &SelfCheckConfig {
        &self.settings
    }

    #[must_use]
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn recovery(&self) -> &RecoveryWorkflow {
        &self.recovery
    }

    // -------------------------------------------------------------------------
    // Exposed operations
    // -------------------------------------------------------------------------

    /// Run one full cycle. Returns whether it succeeded.
    ///
    /// Never panics and never returns an error: failures are recorded in the
    /// run statistics and the next cycle proceeds normally.
    pub async fn perform_self_check_cycle(&self) -> bool {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.run_cycle()).catch_unwind().await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        let now = Utc::now();

        match outcome {
            Ok(Ok(mut summary)) => {
                summary.duration_ms = duration_ms;
                lock(&self.stats).record_success(duration_ms, now);
                tracing::info!(
                    duration_ms,
                    checked = summary.credentials_checked,
                    valid = summary.valid,
                    invalid = summary.invalid,
                    expired = summary.expired,
                    recoveries = summary.recoveries_dispatched,
                    blacklisted = summary.blacklisted.len(),
                    destroyed = summary.destroyed.len(),
                    "Self-check cycle complete"
                );
                *lock(&self.last_cycle) = Some(summary);
                true
            }
            Ok(Err(err)) => {
                tracing::error!(
                    error_code = err.error_code(),
                    duration_ms,
                    "Self-check cycle failed: {err}"
                );
                self.record_failure(format!("[{}] {err}", err.error_code()));
                false
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(panic = %message, "Self-check cycle panicked");
                self.record_failure(format!("cycle panicked: {message}"));
                false
            }
        }
    }

    /// Validation status for one credential, served from cache when fresh.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::UnknownCredential`] for ids the engine has not observed.
    pub async fn validate_credential(&self, id: &CredentialId) -> Result<CredentialStatus> {
        let credential = self
            .credentials
            .get(id)
            .ok_or_else(|| GuardError::UnknownCredential(id.to_string()))?;

        let now = Utc::now();
        let ttl = to_chrono(self.settings.cache_ttl());
        if credential.status != CredentialStatus::Unknown
            && credential.last_checked.is_some_and(|at| now - at < ttl)
        {
            tracing::trace!(credential_id = %id, status = %credential.status, "Validation cache hit");
            return Ok(credential.status);
        }

        let outcome = self
            .validator
            .probe(&credential.provider, &credential.secret, &ProbeTarget::for_credential(&credential))
            .instrument(logging::credential_span(id, &credential.provider))
            .await;
        let status = outcome.credential_status();
        self.credentials.record_validation(id, status, now);

        if status.blocks_pipelines() {
            self.lifecycle
                .blacklist_expired(std::slice::from_ref(id))
                .await;
        } else if status == CredentialStatus::Valid && !self.lifecycle.is_under_maintenance(id) {
            self.lifecycle.restore_recovered(id).await;
        }

        if let Some(error) = outcome.into_error(&credential.provider, self.validator.timeout()) {
            self.report_error(&ErrorContext::from_error(&error).at(now));
        }
        Ok(status)
    }

    #[must_use]
    pub fn run_statistics(&self) -> SelfCheckRunStatistics {
        lock(&self.stats).clone()
    }

    #[must_use]
    pub fn pipeline_check_results(&self) -> Vec<PipelineCheckResult> {
        self.lifecycle.results()
    }

    /// Clear every cache, buffer, and counter.
    ///
    /// Recovery runs already in flight finish on their own; their reports
    /// land in the (now empty) history.
    pub fn reset_state(&self) {
        self.credentials.clear();
        self.health.clear();
        self.lifecycle.reset();
        self.recovery.clear_history();
        *lock(&self.stats) = SelfCheckRunStatistics::default();
        *lock(&self.last_cycle) = None;
        lock(&self.dispatched).clear();
        self.manager_missing_reported.store(false, Ordering::SeqCst);
        tracing::info!("Self-check state reset");
    }

    // -------------------------------------------------------------------------
    // Building blocks
    // -------------------------------------------------------------------------

    /// Pull the pipeline inventory and (re)attach credentials to pipelines.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::PipelineManagerUnavailable`] without a manager,
    /// or [`GuardError::PipelineManager`] when the inventory query fails.
    pub async fn sync_credentials(&self) -> Result<usize> {
        let manager = self.lifecycle.manager()?;
        let pipelines = manager.get_all_pipelines().await.map_err(|e| match e {
            GuardError::PipelineManager(_) => e,
            other => GuardError::PipelineManager(other.to_string()),
        })?;

        let mut ids: Vec<&String> = pipelines.keys().collect();
        ids.sort();
        for pipeline_id in &ids {
            self.credentials.observe(pipeline_id, &pipelines[*pipeline_id]);
        }
        let live: HashSet<String> = pipelines.keys().cloned().collect();
        self.credentials.retain_pipelines(&live);

        tracing::debug!(
            pipelines = pipelines.len(),
            credentials = self.credentials.len(),
            "Synced credentials from pipeline manager"
        );
        Ok(pipelines.len())
    }

    /// Classify a failure and buffer it for aggregation.
    ///
    /// Returns `None` for failures that are not authentication errors or when
    /// detection is disabled. Notifications are sent by
    /// [`Self::evaluate_oauth_health`], not here.
    pub fn report_error(&self, context: &ErrorContext) -> Option<ClassifiedError> {
        let classified = self
            .classifier
            .classify(context, |provider| self.credentials.pipelines_for_provider(provider))?;
        self.health.record(classified.clone());
        Some(classified)
    }

    /// Timer 3: aggregate buffered auth errors and notify once per provider
    /// whose recent count reached the threshold.
    ///
    /// The returned verdict is computed before any buffer is cleared.
    pub async fn evaluate_oauth_health(&self) -> HealthVerdict {
        let now = Utc::now();
        let verdict = self.health.verdict_at(now);

        match verdict.status {
            HealthStatus::Healthy => tracing::debug!("OAuth health: healthy"),
            HealthStatus::Warning => tracing::info!(
                errors = verdict.errors.len(),
                affected = verdict.affected_pipeline_count,
                "OAuth health: warning"
            ),
            HealthStatus::Critical => tracing::warn!(
                errors = verdict.errors.len(),
                affected = verdict.affected_pipeline_count,
                "OAuth health: critical"
            ),
        }

        for provider in verdict.providers.keys() {
            if let Some(due) = self.health.take_notification_at(provider, now) {
                self.notify_degraded(due, now).await;
            }
        }
        verdict
    }

    async fn notify_degraded(&self, verdict: ProviderVerdict, now: DateTime<Utc>) {
        let kind = dominant_kind(&verdict.errors);
        let affected: BTreeSet<String> = verdict
            .errors
            .iter()
            .flat_map(|e| e.affected_pipelines.iter().cloned())
            .collect();
        let action_url = self
            .registry
            .backend(&verdict.provider)
            .authorization_url()
            .map(str::to_string);
        let window_secs = self.health.settings().window.num_seconds();
        let message = format!(
            "{} authentication failures for {} within {window_secs}s (mostly {kind})",
            verdict.errors.len(),
            verdict.provider
        );

        tracing::warn!(
            event = "auth_health_degraded",
            provider = %verdict.provider,
            kind = %kind,
            errors = verdict.errors.len(),
            affected = verdict.affected_pipeline_count,
            "{message}"
        );

        if let Some(sink) = &self.sink {
            sink.report(StructuredError {
                kind: StructuredErrorKind::AuthHealthDegraded(kind),
                provider: verdict.provider.clone(),
                credential_id: None,
                affected_pipelines: affected.into_iter().collect(),
                message,
                requires_action: kind != AuthErrorKind::OAuthServerError,
                action_url,
                credential_file: None,
                timestamp: now,
            })
            .await;
        }
    }

    async fn report_missing_manager(&self, err: &GuardError) {
        if self.manager_missing_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(sink) = &self.sink {
            sink.report(StructuredError {
                kind: StructuredErrorKind::Configuration,
                provider: String::new(),
                credential_id: None,
                affected_pipelines: Vec::new(),
                message: format!(
                    "{err}: {}",
                    err.required_action().unwrap_or_default()
                ),
                requires_action: true,
                action_url: None,
                credential_file: None,
                timestamp: Utc::now(),
            })
            .await;
        }
    }

    /// Timer 2: pipeline health sweep.
    ///
    /// # Errors
    ///
    /// Returns an error when the pipeline manager's status query fails.
    pub async fn check_pipeline_health(&self) -> Result<Vec<PipelineCheckResult>> {
        self.lifecycle.check_health().await
    }

    /// Dispatch recovery for a credential and return its pre-recovery status.
    ///
    /// Does not wait for the run; see [`Self::wait_for_recoveries`].
    pub fn trigger_recovery(&self, id: &CredentialId) -> CredentialStatus {
        self.dispatch_recovery(id).0
    }

    fn dispatch_recovery(&self, id: &CredentialId) -> (CredentialStatus, bool) {
        let dispatch = self.recovery.trigger(id);
        let snapshot = dispatch.snapshot;
        match dispatch.outcome {
            DispatchOutcome::Dispatched(handle) => {
                let mut dispatched = lock(&self.dispatched);
                dispatched.retain(|h| !h.is_finished());
                dispatched.push(handle);
                (snapshot, true)
            }
            DispatchOutcome::AlreadyInFlight | DispatchOutcome::UnknownCredential => {
                (snapshot, false)
            }
        }
    }

    /// Wait for every recovery dispatched by this engine so far.
    pub async fn wait_for_recoveries(&self) -> Vec<RecoveryReport> {
        let handles: Vec<JoinHandle<RecoveryReport>> = lock(&self.dispatched).drain(..).collect();
        join_all(handles)
            .await
            .into_iter()
            .filter_map(std::result::Result::ok)
            .collect()
    }

    pub async fn destroy_invalid_pipelines(&self, ids: &[CredentialId]) -> Vec<String> {
        self.lifecycle.destroy_invalid(ids).await
    }

    #[must_use]
    pub fn health_verdict(&self) -> HealthVerdict {
        self.health.verdict()
    }

    /// Count a failed cycle that never reached [`Self::perform_self_check_cycle`]'s
    /// own bookkeeping, e.g. a panicking timer tick.
    pub fn record_failure(&self, message: impl Into<String>) {
        lock(&self.stats).record_failure(message, Utc::now());
    }

    #[must_use]
    pub fn credential(&self, id: &CredentialId) -> Option<Credential> {
        self.credentials.get(id)
    }

    /// Every known credential, ordered by id.
    #[must_use]
    pub fn credentials(&self) -> Vec<Credential> {
        self.credentials.all()
    }

    #[must_use]
    pub fn last_cycle(&self) -> Option<CycleSummary> {
        lock(&self.last_cycle).clone()
    }

    // -------------------------------------------------------------------------
    // Cycle
    // -------------------------------------------------------------------------

    async fn run_cycle(&self) -> Result<CycleSummary> {
        let mut summary = CycleSummary::new(Utc::now());

        match self.sync_credentials().await {
            Ok(_) => {}
            Err(err @ GuardError::PipelineManagerUnavailable) => {
                tracing::error!(
                    error_code = err.error_code(),
                    "{err}; validating previously observed credentials only"
                );
                self.report_missing_manager(&err).await;
            }
            Err(err) => return Err(err),
        }

        let credentials = self.credentials.all();
        let targets: Vec<ProbeTarget> =
            credentials.iter().map(ProbeTarget::for_credential).collect();
        let outcomes = join_all(
            credentials
                .iter()
                .zip(&targets)
                .map(|(c, target)| {
                    self.validator
                        .probe(&c.provider, &c.secret, target)
                        .instrument(logging::credential_span(&c.id, &c.provider))
                }),
        )
        .await;

        let now = Utc::now();
        let margin = to_chrono(self.settings.expiry_margin());
        let mut failing: Vec<(Credential, ValidationOutcome)> = Vec::new();

        for (credential, outcome) in credentials.into_iter().zip(outcomes) {
            let status = outcome.credential_status();
            self.credentials.record_validation(&credential.id, status, now);
            summary.count(status);

            if outcome.is_valid() {
                // A plain re-probe never lifts maintenance; only a recovery or a new secret does.
                if self.lifecycle.is_under_maintenance(&credential.id) {
                    tracing::debug!(
                        credential_id = %credential.id,
                        "Credential valid but awaiting re-authorization"
                    );
                    continue;
                }
                let restored = self.lifecycle.restore_recovered(&credential.id).await;
                summary.restored.extend(restored);
                if credential.is_expiring(now, margin)
                    && self.registry.is_refreshable(&credential.provider)
                    && self.dispatch_recovery(&credential.id).1
                {
                    summary.recoveries_dispatched += 1;
                }
                continue;
            }

            if let Some(error) = outcome
                .clone()
                .into_error(&credential.provider, self.validator.timeout())
            {
                let context = ErrorContext::from_error(&error)
                    .with_provider(credential.provider.clone())
                    .at(now);
                if self.report_error(&context).is_some() {
                    summary.errors_classified += 1;
                }
            }
            failing.push((credential, outcome));
        }

        let blocked: Vec<CredentialId> = failing.iter().map(|(c, _)| c.id.clone()).collect();
        summary.blacklisted = self.lifecycle.blacklist_expired(&blocked).await;

        let verdict = self.health.verdict_at(now);
        let mut destroy = Vec::new();
        for (credential, outcome) in &failing {
            let refreshable = self.registry.is_refreshable(&credential.provider);
            if !refreshable && self.settings.auto_destroy_invalid && is_unrecoverable(outcome) {
                destroy.push(credential.id.clone());
                continue;
            }
            let critical = verdict
                .provider(&credential.provider)
                .is_some_and(|p| p.status == HealthStatus::Critical);
            if (refreshable || critical)
                && !self.lifecycle.is_under_maintenance(&credential.id)
                && self.dispatch_recovery(&credential.id).1
            {
                summary.recoveries_dispatched += 1;
            }
        }

        if !destroy.is_empty() {
            summary.destroyed = self.lifecycle.destroy_invalid(&destroy).await;
        }

        summary.pipelines_checked = self.check_pipeline_health().await?.len();
        Ok(summary)
    }
}
