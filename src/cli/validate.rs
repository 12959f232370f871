//! `credguard validate`: check one credential from the command line.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::cli::args::{OutputFormat, ValidateArgs};
use crate::core::credential_id::CredentialId;
use crate::core::models::CredentialStatus;
use crate::core::provider::ProviderRegistry;
use crate::core::validator::{CredentialValidator, ProbeTarget, ValidationOutcome};
use crate::error::{GuardError, Result};
use crate::storage::config::ResolvedConfig;

/// Result of a single validation.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub provider: String,
    pub credential_id: CredentialId,
    pub status: CredentialStatus,
    /// Whether a live probe was sent.
    pub probed: bool,
    pub detail: String,
}

/// Execute the validate command.
///
/// Prints the report, then returns the failure as an error so the process
/// exits non-zero (3 for invalid credentials).
///
/// # Errors
///
/// Returns the validation failure, or a configuration error when the key
/// cannot be read.
pub async fn execute(
    resolved: &ResolvedConfig,
    args: &ValidateArgs,
    format: OutputFormat,
    pretty: bool,
) -> Result<()> {
    let secret = read_secret(args)?;
    let provider = args.provider.trim().to_lowercase();
    let timeout = args
        .timeout
        .map_or_else(|| resolved.config.selfcheck.validation_timeout(), Duration::from_secs);

    let registry = Arc::new(ProviderRegistry::with_defaults());
    let mut validator = CredentialValidator::new(registry, timeout)?;
    if let Some(defaults) = resolved.config.providers.get(&provider) {
        validator = validator.with_provider_defaults(
            &provider,
            defaults.endpoint.clone(),
            defaults.test_model.clone(),
        );
    }

    let (report, outcome) = validate(&validator, &provider, &secret, args).await;

    match format {
        OutputFormat::Human => println!("{}", render_human(&report)),
        OutputFormat::Json => {
            let json = if pretty {
                serde_json::to_string_pretty(&report)?
            } else {
                serde_json::to_string(&report)?
            };
            println!("{json}");
        }
    }

    match outcome.and_then(|o| o.into_error(&provider, validator.timeout())) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn read_secret(args: &ValidateArgs) -> Result<String> {
    let secret = match (&args.key, &args.key_env) {
        (Some(key), _) => key.clone(),
        (None, Some(var)) => std::env::var(var).map_err(|_| {
            GuardError::Config(format!("environment variable {var} is not set"))
        })?,
        (None, None) => {
            return Err(GuardError::Config("provide --key or --key-env".to_string()));
        }
    };
    let secret = secret.trim().to_string();
    if secret.is_empty() {
        return Err(GuardError::Config("credential is empty".to_string()));
    }
    Ok(secret)
}

/// Run the format check, and the probe unless offline.
///
/// The outcome is `None` for an offline check that passed.
pub async fn validate(
    validator: &CredentialValidator,
    provider: &str,
    secret: &str,
    args: &ValidateArgs,
) -> (ValidationReport, Option<ValidationOutcome>) {
    let credential_id = CredentialId::derive(provider, secret);

    if args.offline && validator.check_format(provider, secret) {
        let report = ValidationReport {
            provider: provider.to_string(),
            credential_id,
            status: CredentialStatus::Unknown,
            probed: false,
            detail: "format check passed; not probed".to_string(),
        };
        return (report, None);
    }

    let mut target = ProbeTarget::default();
    if let Some(endpoint) = &args.endpoint {
        target = target.with_endpoint(endpoint.clone());
    }
    if let Some(model) = &args.model {
        target = target.with_model(model.clone());
    }

    // A format failure returns before any request, so offline stays offline.
    let outcome = validator.probe(provider, secret, &target).await;
    let probed = !matches!(outcome, ValidationOutcome::FormatInvalid { .. });
    let report = ValidationReport {
        provider: provider.to_string(),
        credential_id,
        status: outcome.credential_status(),
        probed,
        detail: describe(&outcome),
    };
    (report, Some(outcome))
}

fn describe(outcome: &ValidationOutcome) -> String {
    match outcome {
        ValidationOutcome::Valid => "provider accepted the credential".to_string(),
        ValidationOutcome::RateLimited => "rate limited (credential authenticated)".to_string(),
        ValidationOutcome::FormatInvalid { rule } => format!("format check failed: expected {rule}"),
        ValidationOutcome::Rejected {
            status, message, ..
        } => format!("rejected (HTTP {status}): {message}"),
        ValidationOutcome::NetworkFailure {
            message,
            timed_out: true,
        } => format!("probe timed out: {message}"),
        ValidationOutcome::NetworkFailure { message, .. } => format!("probe failed: {message}"),
    }
}

#[must_use]
pub fn render_human(report: &ValidationReport) -> String {
    format!(
        "{} {} [{}]: {}",
        report.provider, report.credential_id, report.status, report.detail
    )
}
