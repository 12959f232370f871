//! Built-in error sink that writes structured errors to the log.

use async_trait::async_trait;

use super::ports::{ErrorSink, StructuredError, StructuredErrorKind};

/// Reports structured errors as `tracing` events.
///
/// Used when the embedding gateway supplies no sink of its own. Events carry
/// `event = "structured_error"` so log shippers can route them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorSink;

#[async_trait]
impl ErrorSink for TracingErrorSink {
    async fn report(&self, error: StructuredError) {
        let kind = match error.kind {
            StructuredErrorKind::AuthHealthDegraded(kind) => format!("auth_health_degraded:{kind}"),
            StructuredErrorKind::RecreateRequired => "recreate_required".to_string(),
            StructuredErrorKind::Configuration => "configuration".to_string(),
        };
        let credential_file = error
            .credential_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        if error.requires_action {
            tracing::error!(
                event = "structured_error",
                kind = %kind,
                provider = %error.provider,
                credential_id = error.credential_id.as_deref().unwrap_or(""),
                affected = ?error.affected_pipelines,
                action_url = error.action_url.as_deref().unwrap_or(""),
                credential_file = %credential_file,
                "{}",
                error.message
            );
        } else {
            tracing::warn!(
                event = "structured_error",
                kind = %kind,
                provider = %error.provider,
                affected = ?error.affected_pipelines,
                "{}",
                error.message
            );
        }
    }
}
