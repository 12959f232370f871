//! Pipeline manager backed by the `[[pipelines]]` config section.
//!
//! Used by the standalone binary, where no gateway owns the pipelines.
//! Credentials are resolved on every call (literal, then environment
//! variable, then token file) so a rotated token file or re-exported
//! variable is picked up by the next cycle without a restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::ports::{
    PipelineDescriptor, PipelineHealth, PipelineManager, PipelineStatistics, PipelineStatusReport,
};
use crate::error::{GuardError, Result};
use crate::storage::config::{Config, PipelineConfig};
use crate::storage::token_file::{TokenFile, expand_home};

/// In-memory pipeline inventory built from configuration.
#[derive(Debug, Default)]
pub struct StaticPipelineManager {
    pipelines: Mutex<BTreeMap<String, PipelineConfig>>,
}

impl StaticPipelineManager {
    #[must_use]
    pub fn new(pipelines: impl IntoIterator<Item = PipelineConfig>) -> Self {
        Self {
            pipelines: Mutex::new(
                pipelines
                    .into_iter()
                    .map(|p| (p.id.clone(), p))
                    .collect(),
            ),
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.pipelines.iter().cloned())
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, PipelineConfig>> {
        self.pipelines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn snapshot(&self) -> Vec<PipelineConfig> {
        self.lock().values().cloned().collect()
    }
}

/// Resolve a configured pipeline into the descriptor the engine sees.
///
/// # Errors
///
/// Returns an error when no configured source yields a credential.
pub fn resolve_pipeline(pipeline: &PipelineConfig) -> Result<PipelineDescriptor> {
    let token_path = pipeline.token_file.as_deref().map(expand_home);
    let tokens = token_path.as_deref().map(TokenFile::load);

    let from_env = pipeline
        .credential_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    let secret = if let Some(literal) = pipeline.credential.as_ref().filter(|c| !c.trim().is_empty()) {
        literal.trim().to_string()
    } else if let Some(value) = from_env {
        value
    } else {
        match (&token_path, &tokens) {
            (Some(path), Some(Ok(file))) => file.secret().map(str::to_string).ok_or_else(|| {
                GuardError::Config(format!(
                    "{} has no access_token or apiKey",
                    path.display()
                ))
            })?,
            (Some(path), Some(Err(err))) => {
                return Err(GuardError::Config(format!(
                    "pipeline \"{}\": cannot read token file {}: {err}",
                    pipeline.id,
                    path.display()
                )));
            }
            _ => {
                return Err(GuardError::Config(format!(
                    "pipeline \"{}\" has no credential (set credential, {}, or token_file)",
                    pipeline.id,
                    pipeline.credential_env.as_deref().unwrap_or("credential_env"),
                )));
            }
        }
    };

    let mut descriptor = PipelineDescriptor::new(pipeline.provider.to_lowercase(), secret);
    descriptor.model.clone_from(&pipeline.model);
    descriptor.endpoint.clone_from(&pipeline.endpoint);
    descriptor.expires_at = tokens
        .as_ref()
        .and_then(|t| t.as_ref().ok())
        .and_then(TokenFile::expires_at);
    descriptor.token_file = token_path;
    Ok(descriptor)
}

#[async_trait]
impl PipelineManager for StaticPipelineManager {
    async fn get_all_pipelines(&self) -> Result<HashMap<String, PipelineDescriptor>> {
        let mut resolved = HashMap::new();
        for pipeline in self.snapshot() {
            match resolve_pipeline(&pipeline) {
                Ok(descriptor) => {
                    resolved.insert(pipeline.id, descriptor);
                }
                Err(err) => {
                    tracing::warn!(pipeline_id = %pipeline.id, "Skipping pipeline: {err}");
                }
            }
        }
        Ok(resolved)
    }

    async fn get_all_pipeline_status(&self) -> Result<HashMap<String, PipelineStatusReport>> {
        Ok(self
            .snapshot()
            .into_iter()
            .map(|pipeline| {
                let report = match resolve_pipeline(&pipeline) {
                    Ok(_) => PipelineStatusReport::Reported(PipelineHealth::Healthy),
                    Err(err) => PipelineStatusReport::Failed {
                        message: err.to_string(),
                    },
                };
                (pipeline.id, report)
            })
            .collect())
    }

    async fn destroy_pipeline(&self, pipeline_id: &str) -> Result<bool> {
        let removed = self.lock().remove(pipeline_id).is_some();
        if removed {
            tracing::info!(pipeline_id, "Removed pipeline from inventory");
        }
        Ok(removed)
    }

    async fn get_pipeline(&self, pipeline_id: &str) -> Result<Option<PipelineDescriptor>> {
        let pipeline = self.lock().get(pipeline_id).cloned();
        pipeline.as_ref().map(resolve_pipeline).transpose()
    }

    async fn get_statistics(&self) -> Result<PipelineStatistics> {
        let pipelines = self.snapshot();
        Ok(PipelineStatistics {
            total_pipelines: pipelines.len(),
            healthy_pipelines: pipelines
                .iter()
                .filter(|p| resolve_pipeline(p).is_ok())
                .count(),
        })
    }
}
