//! `credguard run`: scheduled self-checks, or a single cycle with `--once`.

use std::fmt::Write as _;
use std::sync::Arc;

use serde::Serialize;

use crate::cli::args::{OutputFormat, RunArgs};
use crate::core::engine::{CycleSummary, SelfCheckEngine};
use crate::core::models::{Credential, HealthVerdict, PipelineCheckResult, SelfCheckRunStatistics};
use crate::core::notify::TracingErrorSink;
use crate::core::recovery::RecoveryReport;
use crate::core::scheduler::SelfCheckScheduler;
use crate::core::static_pipelines::StaticPipelineManager;
use crate::error::{GuardError, Result};
use crate::storage::config::ResolvedConfig;

/// Everything `run --once` reports.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub success: bool,
    pub statistics: SelfCheckRunStatistics,
    pub cycle: Option<CycleSummary>,
    pub credentials: Vec<Credential>,
    pub pipelines: Vec<PipelineCheckResult>,
    pub health: HealthVerdict,
    pub recoveries: Vec<RecoveryReport>,
}

/// Execute the run command.
///
/// # Errors
///
/// Returns an error if the engine cannot be built, if a `--once` cycle
/// fails, or if the Ctrl+C handler cannot be installed.
pub async fn execute(
    resolved: &ResolvedConfig,
    args: &RunArgs,
    format: OutputFormat,
    pretty: bool,
) -> Result<()> {
    let config = &resolved.config;
    let manager = Arc::new(StaticPipelineManager::from_config(config));
    if manager.is_empty() {
        tracing::warn!(
            config = %resolved.config_path.display(),
            "No pipelines configured; add [[pipelines]] entries to the config file"
        );
    }

    let engine = Arc::new(
        SelfCheckEngine::builder(config)
            .pipeline_manager(manager)
            .error_sink(Arc::new(TracingErrorSink))
            .build()?,
    );

    if args.once {
        let report = run_once(&engine).await;
        match format {
            OutputFormat::Human => print!("{}", render_human(&report)),
            OutputFormat::Json => println!("{}", render_json(&report, pretty)?),
        }
        if !report.success {
            let reason = report
                .statistics
                .diagnostics
                .last()
                .cloned()
                .unwrap_or_else(|| "unknown failure".to_string());
            return Err(GuardError::Other(anyhow::anyhow!(
                "self-check cycle failed: {reason}"
            )));
        }
        return Ok(());
    }

    let handle = SelfCheckScheduler::start(Arc::clone(&engine), &config.selfcheck);
    tracing::info!(checks = ?handle.checks(), "credguard running; press Ctrl+C to stop");

    let signal = tokio::signal::ctrl_c().await;
    handle.shutdown().await;
    signal?;

    let stats = engine.run_statistics();
    tracing::info!(
        total_runs = stats.total_runs,
        successful_runs = stats.successful_runs,
        failed_runs = stats.failed_runs,
        average_duration_ms = stats.average_duration_ms,
        "Stopped"
    );
    Ok(())
}

/// One cycle, then wait for the recoveries it dispatched and evaluate auth health.
pub async fn run_once(engine: &SelfCheckEngine) -> RunReport {
    let success = engine.perform_self_check_cycle().await;
    let recoveries = engine.wait_for_recoveries().await;
    let health = engine.evaluate_oauth_health().await;

    RunReport {
        success,
        statistics: engine.run_statistics(),
        cycle: engine.last_cycle(),
        credentials: engine.credentials(),
        pipelines: engine.pipeline_check_results(),
        health,
        recoveries,
    }
}

/// Render the report as JSON.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn render_json(report: &RunReport, pretty: bool) -> Result<String> {
    let json = if pretty {
        serde_json::to_string_pretty(report)?
    } else {
        serde_json::to_string(report)?
    };
    Ok(json)
}

/// Render the report as plain text.
#[must_use]
pub fn render_human(report: &RunReport) -> String {
    let mut out = String::new();
    let verdict = if report.success { "ok" } else { "FAILED" };
    let _ = writeln!(out, "Self-check cycle: {verdict}");

    if let Some(cycle) = &report.cycle {
        let _ = writeln!(
            out,
            "  {} credentials checked ({} valid, {} invalid, {} expired) in {:.0} ms",
            cycle.credentials_checked, cycle.valid, cycle.invalid, cycle.expired, cycle.duration_ms
        );
        for (label, ids) in [
            ("blacklisted", &cycle.blacklisted),
            ("destroyed", &cycle.destroyed),
            ("restored", &cycle.restored),
        ] {
            if !ids.is_empty() {
                let _ = writeln!(out, "  {label}: {}", ids.join(", "));
            }
        }
    }

    if !report.credentials.is_empty() {
        let _ = writeln!(out, "\nCredentials:");
        for credential in &report.credentials {
            let pipelines: Vec<&str> = credential.pipelines.iter().map(String::as_str).collect();
            let _ = writeln!(
                out,
                "  {:<28} {:<8} {}",
                credential.id.as_str(),
                credential.status.as_str(),
                pipelines.join(", ")
            );
        }
    }

    if !report.pipelines.is_empty() {
        let _ = writeln!(out, "\nPipelines:");
        for result in &report.pipelines {
            let _ = write!(out, "  {:<24} {}", result.pipeline_id, result.status);
            if let Some(error) = &result.error {
                let _ = write!(out, " ({error})");
            }
            out.push('\n');
        }
    }

    for recovery in &report.recoveries {
        let _ = write!(
            out,
            "\nRecovery {} ({}): {}",
            recovery.credential_id, recovery.provider, recovery.outcome
        );
        if let Some(reason) = &recovery.reason {
            let _ = write!(out, " - {reason}");
        }
        out.push('\n');
    }

    let _ = writeln!(
        out,
        "\nAuth health: {:?} ({} recent errors)",
        report.health.status,
        report.health.errors.len()
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{HealthStatus, PipelineCheckStatus};

    fn report() -> RunReport {
        RunReport {
            success: true,
            statistics: SelfCheckRunStatistics::default(),
            cycle: None,
            credentials: vec![Credential::new("iflow", "sk-aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")],
            pipelines: vec![
                PipelineCheckResult::new("p1", PipelineCheckStatus::Active),
                PipelineCheckResult::new("p2", PipelineCheckStatus::Blacklisted)
                    .with_error("credential is invalid"),
            ],
            health: HealthVerdict::default(),
            recoveries: Vec::new(),
        }
    }

    #[test]
    fn human_output_lists_pipelines() {
        let text = render_human(&report());
        assert!(text.starts_with("Self-check cycle: ok"));
        assert!(text.contains("p1"));
        assert!(text.contains("blacklisted (credential is invalid)"));
        assert!(text.contains("Auth health: Healthy"));
        assert_eq!(report().health.status, HealthStatus::Healthy);
    }

    #[test]
    fn json_output_never_contains_secrets() {
        let json = render_json(&report(), false).unwrap();
        assert!(!json.contains("sk-aaaa"));
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["pipelines"][1]["status"], "blacklisted");
        assert_eq!(value["statistics"]["total_runs"], 0);
    }
}
