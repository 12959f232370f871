//! `credguard config`: show the resolved configuration and where it came from.

use std::fmt::Write as _;

use serde::Serialize;

use crate::cli::args::OutputFormat;
use crate::error::Result;
use crate::storage::config::{Config, ConfigSources, ResolvedConfig};

#[derive(Debug, Serialize)]
struct ConfigReport<'a> {
    config_path: String,
    config_file_exists: bool,
    log_level: &'static str,
    sources: &'a ConfigSources,
    config: &'a Config,
}

/// Execute the config command.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn execute(resolved: &ResolvedConfig, format: OutputFormat, pretty: bool) -> Result<()> {
    match format {
        OutputFormat::Human => print!("{}", render_human(resolved)),
        OutputFormat::Json => {
            let report = ConfigReport {
                config_path: resolved.config_path.display().to_string(),
                config_file_exists: resolved.config_path.exists(),
                log_level: resolved.log_level.as_filter(),
                sources: &resolved.sources,
                config: &resolved.config,
            };
            let json = if pretty {
                serde_json::to_string_pretty(&report)?
            } else {
                serde_json::to_string(&report)?
            };
            println!("{json}");
        }
    }
    Ok(())
}

#[must_use]
pub fn render_human(resolved: &ResolvedConfig) -> String {
    let config = &resolved.config;
    let s = &config.selfcheck;
    let sources = &resolved.sources;
    let mut out = String::new();

    let exists = if resolved.config_path.exists() { "" } else { " (not found, using defaults)" };
    let _ = writeln!(
        out,
        "Config file:            {}{exists} [{}]",
        resolved.config_path.display(),
        sources.config_path
    );
    let _ = writeln!(
        out,
        "Log level:              {} [{}]",
        resolved.log_level.as_filter(),
        sources.log_level
    );
    let _ = writeln!(
        out,
        "Validation timeout:     {}s [{}]",
        s.validation_timeout_secs, sources.validation_timeout
    );
    let _ = writeln!(
        out,
        "Credential interval:    {}s [{}]",
        s.credential_interval_secs, sources.credential_interval
    );
    let _ = writeln!(out, "Pipeline interval:      {}s", s.pipeline_interval_secs);
    let _ = writeln!(out, "OAuth interval:         {}s", s.oauth_interval_secs);
    let _ = writeln!(
        out,
        "Notification threshold: {} [{}]",
        config.oauth.notification_threshold, sources.notification_threshold
    );
    let _ = writeln!(
        out,
        "Auto-destroy invalid:   {} [{}]",
        s.auto_destroy_invalid, sources.auto_destroy_invalid
    );

    if !config.providers.is_empty() {
        let _ = writeln!(out, "\nProviders:");
        for (name, provider) in &config.providers {
            let refresh = if provider.is_refreshable() { "oauth refresh" } else { "no refresh" };
            let _ = writeln!(
                out,
                "  {name:<12} {refresh:<14} {}",
                provider.endpoint.as_deref().unwrap_or("default endpoint")
            );
        }
    }

    let _ = writeln!(out, "\nPipelines: {}", config.pipelines.len());
    for pipeline in &config.pipelines {
        let source = if pipeline.credential.is_some() {
            "literal".to_string()
        } else if let Some(var) = &pipeline.credential_env {
            format!("${var}")
        } else {
            pipeline
                .token_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        };
        let _ = writeln!(out, "  {:<20} {:<10} {source}", pipeline.id, pipeline.provider);
    }
    out
}
