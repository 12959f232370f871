//! Credential store.
//!
//! Owns every credential the engine has observed and the reverse map from
//! pipeline to owning credential. Credentials are never forgotten once
//! observed; only [`CredentialStore::clear`] drops them.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use super::credential_id::CredentialId;
use super::models::{Credential, CredentialStatus};
use super::ports::PipelineDescriptor;

#[derive(Debug, Default)]
struct StoreInner {
    credentials: HashMap<CredentialId, Credential>,
    owners: HashMap<String, CredentialId>,
}

impl StoreInner {
    fn detach(&mut self, pipeline_id: &str) {
        if let Some(previous) = self.owners.remove(pipeline_id)
            && let Some(cred) = self.credentials.get_mut(&previous)
        {
            cred.pipelines.remove(pipeline_id);
        }
    }
}

/// Mutex-guarded credential cache shared by the engine and recovery tasks.
#[derive(Debug, Default)]
pub struct CredentialStore {
    inner: Mutex<StoreInner>,
}

impl CredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that `pipeline_id` authenticates with the descriptor's credential.
    ///
    /// A pipeline backed by a token file keeps its credential identity when
    /// the token rotates; the new secret replaces the old one in place.
    pub fn observe(&self, pipeline_id: &str, descriptor: &PipelineDescriptor) -> CredentialId {
        let mut inner = self.lock();

        if let Some(token_file) = descriptor.token_file.as_ref()
            && let Some(owner) = inner.owners.get(pipeline_id).cloned()
            && let Some(cred) = inner.credentials.get_mut(&owner)
            && cred.token_file.as_ref() == Some(token_file)
        {
            if cred.secret != descriptor.credential {
                cred.secret.clone_from(&descriptor.credential);
                cred.status = CredentialStatus::Unknown;
                cred.last_checked = None;
            }
            if descriptor.expires_at.is_some() {
                cred.expires_at = descriptor.expires_at;
            }
            return owner;
        }

        let id = CredentialId::derive(&descriptor.provider, &descriptor.credential);
        if inner.owners.get(pipeline_id) != Some(&id) {
            inner.detach(pipeline_id);
        }

        let cred = inner.credentials.entry(id.clone()).or_insert_with(|| {
            tracing::debug!(
                credential_id = %id,
                provider = %descriptor.provider,
                "Observed new credential"
            );
            Credential::new(&descriptor.provider, descriptor.credential.clone())
        });

        if cred.secret != descriptor.credential {
            // A refreshed secret derives a different id; only a derived match is a real clash.
            if CredentialId::derive(&cred.provider, &cred.secret) == id
                && cred.pipelines.iter().any(|p| p != pipeline_id)
            {
                tracing::warn!(
                    credential_id = %id,
                    pipeline_id,
                    "Different secrets share a credential id; the latest one wins"
                );
            }
            cred.secret.clone_from(&descriptor.credential);
            cred.status = CredentialStatus::Unknown;
            cred.last_checked = None;
        }
        if descriptor.expires_at.is_some() {
            cred.expires_at = descriptor.expires_at;
        }
        if descriptor.token_file.is_some() {
            cred.token_file.clone_from(&descriptor.token_file);
        }
        if descriptor.endpoint.is_some() {
            cred.endpoint.clone_from(&descriptor.endpoint);
        }
        if descriptor.model.is_some() {
            cred.test_model.clone_from(&descriptor.model);
        }
        cred.pipelines.insert(pipeline_id.to_string());

        inner.owners.insert(pipeline_id.to_string(), id.clone());
        id
    }

    /// Drop pipeline attachments for pipelines no longer configured.
    ///
    /// Credentials stay; only their dependent sets shrink.
    pub fn retain_pipelines(&self, live: &HashSet<String>) {
        let mut inner = self.lock();
        let stale: Vec<String> = inner
            .owners
            .keys()
            .filter(|p| !live.contains(*p))
            .cloned()
            .collect();
        for pipeline_id in stale {
            inner.detach(&pipeline_id);
        }
    }

    #[must_use]
    pub fn get(&self, id: &CredentialId) -> Option<Credential> {
        self.lock().credentials.get(id).cloned()
    }

    /// Snapshot of all credentials, ordered by id.
    #[must_use]
    pub fn all(&self) -> Vec<Credential> {
        let mut all: Vec<Credential> = self.lock().credentials.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Store a validation result. Returns the updated credential.
    pub fn record_validation(
        &self,
        id: &CredentialId,
        status: CredentialStatus,
        at: DateTime<Utc>,
    ) -> Option<Credential> {
        let mut inner = self.lock();
        let cred = inner.credentials.get_mut(id)?;
        cred.status = status;
        cred.last_checked = Some(at);
        Some(cred.clone())
    }

    /// Replace the secret after a refresh. The credential keeps its id.
    pub fn update_secret(
        &self,
        id: &CredentialId,
        secret: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> bool {
        let mut inner = self.lock();
        let Some(cred) = inner.credentials.get_mut(id) else {
            return false;
        };
        cred.secret = secret;
        cred.status = CredentialStatus::Unknown;
        cred.last_checked = None;
        if expires_at.is_some() {
            cred.expires_at = expires_at;
        }
        true
    }

    /// Pipelines that depend on the credential.
    #[must_use]
    pub fn dependents(&self, id: &CredentialId) -> BTreeSet<String> {
        self.lock()
            .credentials
            .get(id)
            .map(|c| c.pipelines.clone())
            .unwrap_or_default()
    }

    /// All pipelines whose credential belongs to `provider`.
    #[must_use]
    pub fn pipelines_for_provider(&self, provider: &str) -> BTreeSet<String> {
        let provider = provider.to_lowercase();
        self.lock()
            .credentials
            .values()
            .filter(|c| c.provider == provider)
            .flat_map(|c| c.pipelines.iter().cloned())
            .collect()
    }

    #[must_use]
    pub fn owner_of(&self, pipeline_id: &str) -> Option<CredentialId> {
        self.lock().owners.get(pipeline_id).cloned()
    }

    /// Status of the credential owning `pipeline_id`.
    #[must_use]
    pub fn owner_status(&self, pipeline_id: &str) -> Option<(CredentialId, CredentialStatus)> {
        let inner = self.lock();
        let id = inner.owners.get(pipeline_id)?;
        inner
            .credentials
            .get(id)
            .map(|c| (id.clone(), c.status))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().credentials.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().credentials.is_empty()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.credentials.clear();
        inner.owners.clear();
    }
}
