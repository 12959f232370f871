//! Pipeline lifecycle coordination.
//!
//! The coordinator is the only writer of [`PipelineCheckResult`]s. It maps
//! credentials to their dependent pipelines and destroys, blacklists, or
//! restores those pipelines as validation and recovery outcomes arrive.
//!
//! Actions on the same pipeline are serialized through a per-pipeline async
//! lock so a destroy can never interleave with a restore. Batch operations
//! isolate failures: one pipeline failing never aborts the others.
//!
//! Only pipelines held back on account of their credential are ever restored.
//! A pipeline the manager itself reports unhealthy or degraded keeps that
//! status until the manager says otherwise.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use tracing::Instrument;

use super::credential_id::CredentialId;
use super::credentials::CredentialStore;
use super::logging;
use super::models::{PipelineCheckResult, PipelineCheckStatus};
use super::ports::{PipelineHealth, PipelineManager, PipelineStatusReport};
use crate::error::{GuardError, Result};

/// Check status for a health reported by the pipeline manager.
#[must_use]
pub const fn status_for_health(health: PipelineHealth) -> PipelineCheckStatus {
    match health {
        PipelineHealth::Healthy => PipelineCheckStatus::Active,
        PipelineHealth::Degraded => PipelineCheckStatus::Pending,
        PipelineHealth::Unhealthy | PipelineHealth::Error => PipelineCheckStatus::Blacklisted,
    }
}

/// A credential awaiting manual re-authorization.
///
/// The digests pin the secrets that failed; once the stored secret is none of
/// them the entry no longer applies.
#[derive(Debug, Clone)]
struct Maintenance {
    reason: String,
    failed_digests: Vec<String>,
}

fn secret_digest(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Destroys, blacklists, and restores pipelines for credential outcomes.
pub struct PipelineLifecycleCoordinator {
    credentials: Arc<CredentialStore>,
    manager: Option<Arc<dyn PipelineManager>>,
    results: Mutex<HashMap<String, PipelineCheckResult>>,
    maintenance: Mutex<HashMap<CredentialId, Maintenance>>,
    /// Pipelines blacklisted because of their credential rather than the manager.
    held: Mutex<HashSet<String>>,
    /// Last manager-reported result per pipeline, kept underneath any hold.
    reported: Mutex<HashMap<String, PipelineCheckResult>>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl std::fmt::Debug for PipelineLifecycleCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLifecycleCoordinator")
            .field("has_manager", &self.manager.is_some())
            .field("results", &lock(&self.results).len())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PipelineLifecycleCoordinator {
    #[must_use]
    pub fn new(credentials: Arc<CredentialStore>, manager: Option<Arc<dyn PipelineManager>>) -> Self {
        Self {
            credentials,
            manager,
            results: Mutex::new(HashMap::new()),
            maintenance: Mutex::new(HashMap::new()),
            held: Mutex::new(HashSet::new()),
            reported: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The configured pipeline manager.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::PipelineManagerUnavailable`] when none was configured.
    pub fn manager(&self) -> Result<&Arc<dyn PipelineManager>> {
        self.manager
            .as_ref()
            .ok_or(GuardError::PipelineManagerUnavailable)
    }

    fn manager_or_log(&self, operation: &str) -> Option<&Arc<dyn PipelineManager>> {
        let manager = self.manager.as_ref();
        if manager.is_none() {
            let err = GuardError::PipelineManagerUnavailable;
            tracing::error!(
                operation,
                error_code = err.error_code(),
                "{err}; returning empty result"
            );
        }
        manager
    }

    fn pipeline_lock(&self, pipeline_id: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            lock(&self.locks)
                .entry(pipeline_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    fn current_status(&self, pipeline_id: &str) -> Option<PipelineCheckStatus> {
        lock(&self.results).get(pipeline_id).map(|r| r.status)
    }

    fn store(&self, result: PipelineCheckResult) {
        lock(&self.results).insert(result.pipeline_id.clone(), result);
    }

    /// Store a blacklist caused by the pipeline's credential.
    fn store_held(&self, result: PipelineCheckResult) {
        lock(&self.held).insert(result.pipeline_id.clone());
        self.store(result);
    }

    /// Store a status that reflects the manager's view, or a destroy.
    fn store_released(&self, result: PipelineCheckResult) {
        lock(&self.held).remove(&result.pipeline_id);
        self.store(result);
    }

    fn dependents_of(&self, credential_ids: &[CredentialId]) -> BTreeSet<String> {
        credential_ids
            .iter()
            .flat_map(|id| self.credentials.dependents(id))
            .collect()
    }

    /// Whether the credential is still awaiting re-authorization.
    ///
    /// A maintenance entry lapses as soon as the stored secret differs from
    /// the one that failed, e.g. after the token file was rewritten.
    #[must_use]
    pub fn is_under_maintenance(&self, credential_id: &CredentialId) -> bool {
        self.maintenance_reason(credential_id).is_some()
    }

    fn maintenance_reason(&self, credential_id: &CredentialId) -> Option<String> {
        let mut maintenance = lock(&self.maintenance);
        let entry = maintenance.get(credential_id)?;
        let current = self
            .credentials
            .get(credential_id)
            .map(|c| secret_digest(&c.secret));
        if current.is_some_and(|digest| entry.failed_digests.contains(&digest)) {
            return Some(entry.reason.clone());
        }
        maintenance.remove(credential_id);
        tracing::info!(credential_id = %credential_id, "Secret replaced; lifting maintenance");
        None
    }

    /// Destroy every pipeline depending on the given credentials.
    ///
    /// Each affected pipeline is destroyed at most once, even when several
    /// credentials share it. Returns the ids actually destroyed.
    pub async fn destroy_invalid(&self, credential_ids: &[CredentialId]) -> Vec<String> {
        let Some(manager) = self.manager_or_log("destroy_invalid") else {
            return Vec::new();
        };

        let mut destroyed = Vec::new();
        for pipeline_id in self.dependents_of(credential_ids) {
            let guard = self.pipeline_lock(&pipeline_id);
            let _held = guard.lock().await;

            if self.current_status(&pipeline_id) == Some(PipelineCheckStatus::Destroyed) {
                continue;
            }

            match manager
                .destroy_pipeline(&pipeline_id)
                .instrument(logging::pipeline_span(&pipeline_id))
                .await
            {
                Ok(true) => {
                    tracing::info!(pipeline_id = %pipeline_id, "Destroyed pipeline");
                    self.store_released(PipelineCheckResult::new(
                        &pipeline_id,
                        PipelineCheckStatus::Destroyed,
                    ));
                    destroyed.push(pipeline_id);
                }
                Ok(false) => {
                    tracing::warn!(pipeline_id = %pipeline_id, "Pipeline manager declined destroy");
                    self.store_held(
                        PipelineCheckResult::new(&pipeline_id, PipelineCheckStatus::Blacklisted)
                            .with_error("destroy declined by pipeline manager"),
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        pipeline_id = %pipeline_id,
                        error = %e,
                        "Failed to destroy pipeline; continuing with the rest"
                    );
                    self.store_held(
                        PipelineCheckResult::new(&pipeline_id, PipelineCheckStatus::Blacklisted)
                            .with_error(format!("destroy failed: {e}")),
                    );
                }
            }
        }
        destroyed
    }

    /// Mark dependent pipelines blacklisted without touching their resources.
    pub async fn blacklist_expired(&self, credential_ids: &[CredentialId]) -> Vec<String> {
        let mut blacklisted = Vec::new();
        for id in credential_ids {
            let reason = self.credentials.get(id).map_or_else(
                || format!("credential {id} is unusable"),
                |c| format!("credential {id} is {}", c.status),
            );
            for pipeline_id in self.credentials.dependents(id) {
                if self.blacklist_one(&pipeline_id, &reason).await {
                    blacklisted.push(pipeline_id);
                }
            }
        }
        blacklisted.sort();
        blacklisted.dedup();
        blacklisted
    }

    async fn blacklist_one(&self, pipeline_id: &str, reason: &str) -> bool {
        let guard = self.pipeline_lock(pipeline_id);
        let _held = guard.lock().await;
        if self.current_status(pipeline_id) == Some(PipelineCheckStatus::Destroyed) {
            return false;
        }
        self.store_held(
            PipelineCheckResult::new(pipeline_id, PipelineCheckStatus::Blacklisted).with_error(reason),
        );
        tracing::info!(pipeline_id = %pipeline_id, reason, "Blacklisted pipeline");
        true
    }

    /// Put a credential under maintenance and blacklist its pipelines.
    ///
    /// Maintenance lasts until a recovery succeeds or the secret is replaced.
    pub async fn mark_maintenance(&self, credential_id: &CredentialId, reason: &str) -> Vec<String> {
        let failed_digests = self
            .credentials
            .get(credential_id)
            .map(|c| vec![secret_digest(&c.secret)])
            .unwrap_or_default();
        lock(&self.maintenance).insert(
            credential_id.clone(),
            Maintenance {
                reason: reason.to_string(),
                failed_digests,
            },
        );
        let message = format!("maintenance: {reason}");
        let mut marked = Vec::new();
        for pipeline_id in self.credentials.dependents(credential_id) {
            if self.blacklist_one(&pipeline_id, &message).await {
                marked.push(pipeline_id);
            }
        }
        marked
    }

    /// Also keep maintenance in place while `secret` is the stored secret.
    ///
    /// Used when a refresh swapped in a secret that then failed too: seeing
    /// the pre-refresh secret again is no re-authorization.
    pub fn pin_failed_secret(&self, credential_id: &CredentialId, secret: &str) {
        if let Some(entry) = lock(&self.maintenance).get_mut(credential_id) {
            let digest = secret_digest(secret);
            if !entry.failed_digests.contains(&digest) {
                entry.failed_digests.push(digest);
            }
        }
    }

    /// Lift maintenance and return the credential's held pipelines to active.
    ///
    /// Only pipelines blacklisted on account of the credential are restored.
    /// Destroyed pipelines stay destroyed. A held pipeline the manager last
    /// reported unhealthy or degraded falls back to that report instead.
    pub async fn restore_recovered(&self, credential_id: &CredentialId) -> Vec<String> {
        lock(&self.maintenance).remove(credential_id);

        let mut restored = Vec::new();
        for pipeline_id in self.credentials.dependents(credential_id) {
            let guard = self.pipeline_lock(&pipeline_id);
            let _held = guard.lock().await;
            if !lock(&self.held).contains(&pipeline_id) {
                continue;
            }
            if self.current_status(&pipeline_id) != Some(PipelineCheckStatus::Blacklisted) {
                continue;
            }
            let manager_view = lock(&self.reported)
                .get(&pipeline_id)
                .filter(|r| r.status != PipelineCheckStatus::Active)
                .cloned();
            if let Some(view) = manager_view {
                tracing::info!(
                    pipeline_id = %pipeline_id,
                    status = %view.status,
                    "Credential hold lifted; keeping manager-reported status"
                );
                self.store_released(view);
                continue;
            }
            self.store_released(PipelineCheckResult::new(
                &pipeline_id,
                PipelineCheckStatus::Active,
            ));
            tracing::info!(pipeline_id = %pipeline_id, "Restored pipeline");
            restored.push(pipeline_id);
        }
        restored
    }

    /// Sweep pipeline health from the manager.
    ///
    /// A pipeline whose credential is invalid, expired, or under maintenance
    /// is reported blacklisted regardless of what the manager says. Destroyed
    /// pipelines are left as they are.
    ///
    /// # Errors
    ///
    /// Returns an error when the status query as a whole fails. A missing
    /// pipeline manager yields an empty sweep instead.
    pub async fn check_health(&self) -> Result<Vec<PipelineCheckResult>> {
        let Some(manager) = self.manager_or_log("check_health") else {
            return Ok(Vec::new());
        };

        let statuses = manager
            .get_all_pipeline_status()
            .await
            .map_err(|e| GuardError::PipelineManager(e.to_string()))?;

        let mut ids: Vec<&String> = statuses.keys().collect();
        ids.sort();

        let mut swept = Vec::with_capacity(ids.len());
        for pipeline_id in ids {
            let guard = self.pipeline_lock(pipeline_id);
            let _held = guard.lock().await;

            if self.current_status(pipeline_id) == Some(PipelineCheckStatus::Destroyed) {
                if let Some(existing) = lock(&self.results).get(pipeline_id) {
                    swept.push(existing.clone());
                }
                continue;
            }

            let reported = match &statuses[pipeline_id] {
                PipelineStatusReport::Failed { message } => {
                    PipelineCheckResult::new(pipeline_id, PipelineCheckStatus::Pending)
                        .with_error(message.clone())
                }
                PipelineStatusReport::Reported(health) => result_for_health(pipeline_id, *health),
            };
            lock(&self.reported).insert(pipeline_id.clone(), reported.clone());

            if let Some(held) = self.held_by_credential(pipeline_id) {
                self.store_held(held.clone());
                swept.push(held);
            } else {
                self.store_released(reported.clone());
                swept.push(reported);
            }
        }

        tracing::debug!(pipelines = swept.len(), "Pipeline health sweep complete");
        Ok(swept)
    }

    /// Blacklist result when the pipeline's credential keeps it out of service.
    fn held_by_credential(&self, pipeline_id: &str) -> Option<PipelineCheckResult> {
        let (owner, status) = self.credentials.owner_status(pipeline_id)?;
        let blacklisted = PipelineCheckResult::new(pipeline_id, PipelineCheckStatus::Blacklisted);
        if let Some(reason) = self.maintenance_reason(&owner) {
            return Some(blacklisted.with_error(format!("maintenance: {reason}")));
        }
        status
            .blocks_pipelines()
            .then(|| blacklisted.with_error(format!("credential {owner} is {status}")))
    }

    /// All recorded results, ordered by pipeline id.
    #[must_use]
    pub fn results(&self) -> Vec<PipelineCheckResult> {
        let mut results: Vec<PipelineCheckResult> = lock(&self.results).values().cloned().collect();
        results.sort_by(|a, b| a.pipeline_id.cmp(&b.pipeline_id));
        results
    }

    #[must_use]
    pub fn result(&self, pipeline_id: &str) -> Option<PipelineCheckResult> {
        lock(&self.results).get(pipeline_id).cloned()
    }

    pub fn reset(&self) {
        lock(&self.results).clear();
        lock(&self.maintenance).clear();
        lock(&self.held).clear();
        lock(&self.reported).clear();
        lock(&self.locks).clear();
    }

    /// Timestamp of the most recent result, if any.
    #[must_use]
    pub fn last_checked(&self) -> Option<chrono::DateTime<Utc>> {
        lock(&self.results).values().map(|r| r.last_checked).max()
    }
}

fn result_for_health(pipeline_id: &str, health: PipelineHealth) -> PipelineCheckResult {
    let result = PipelineCheckResult::new(pipeline_id, status_for_health(health));
    match health {
        PipelineHealth::Healthy => result,
        PipelineHealth::Degraded => result.with_error("pipeline reported degraded"),
        PipelineHealth::Unhealthy => result.with_error("pipeline reported unhealthy"),
        PipelineHealth::Error => result.with_error("pipeline reported error"),
    }
}
