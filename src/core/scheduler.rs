//! Periodic self-check timers.
//!
//! One task per enabled check type. Each task awaits its check inline, so
//! ticks of the same type never overlap; different types run concurrently.
//! Every tick runs behind a panic boundary that records the failure in the
//! engine's statistics and lets the next tick proceed.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use super::engine::SelfCheckEngine;
use super::recovery::panic_message;
use crate::storage::config::SelfCheckConfig;

/// The independently scheduled checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    CredentialValidation,
    PipelineHealth,
    OAuthHealth,
}

impl CheckKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CredentialValidation => "credential_validation",
            Self::PipelineHealth => "pipeline_health",
            Self::OAuthHealth => "oauth_health",
        }
    }
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enabled checks and their intervals.
#[must_use]
pub fn planned_checks(settings: &SelfCheckConfig) -> Vec<(CheckKind, Duration)> {
    if !settings.enabled {
        return Vec::new();
    }
    [
        (
            CheckKind::CredentialValidation,
            settings.credential_validation,
            settings.credential_interval(),
        ),
        (
            CheckKind::PipelineHealth,
            settings.pipeline_health,
            settings.pipeline_interval(),
        ),
        (
            CheckKind::OAuthHealth,
            settings.oauth_health,
            settings.oauth_interval(),
        ),
    ]
    .into_iter()
    .filter(|(_, enabled, _)| *enabled)
    .map(|(kind, _, period)| (kind, period))
    .collect()
}

/// Starts the self-check timers.
pub struct SelfCheckScheduler;

impl SelfCheckScheduler {
    /// Spawn one timer task per enabled check.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(engine: Arc<SelfCheckEngine>, settings: &SelfCheckConfig) -> SchedulerHandle {
        let (shutdown, _) = broadcast::channel(1);
        let checks = planned_checks(settings);
        if checks.is_empty() {
            tracing::warn!("Self-check is disabled; no timers started");
        }

        let tasks = checks
            .into_iter()
            .map(|(kind, period)| {
                let engine = Arc::clone(&engine);
                let shutdown = shutdown.subscribe();
                tracing::info!(check = %kind, interval_secs = period.as_secs(), "Starting self-check timer");
                (kind, tokio::spawn(run_timer(engine, kind, period, shutdown)))
            })
            .collect();

        SchedulerHandle { shutdown, tasks }
    }
}

async fn run_timer(
    engine: Arc<SelfCheckEngine>,
    kind: CheckKind,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(panic) = AssertUnwindSafe(run_tick(&engine, kind)).catch_unwind().await {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(check = %kind, panic = %message, "Self-check tick panicked");
                    engine.record_failure(format!("{kind} tick panicked: {message}"));
                }
            }
            _ = shutdown.recv() => {
                tracing::debug!(check = %kind, "Self-check timer stopping");
                break;
            }
        }
    }
}

async fn run_tick(engine: &SelfCheckEngine, kind: CheckKind) {
    match kind {
        CheckKind::CredentialValidation => {
            engine.perform_self_check_cycle().await;
        }
        CheckKind::PipelineHealth => {
            if let Err(err) = engine.check_pipeline_health().await {
                tracing::warn!(error_code = err.error_code(), "Pipeline health sweep failed: {err}");
                engine.record_failure(format!("[{}] pipeline health: {err}", err.error_code()));
            }
        }
        CheckKind::OAuthHealth => {
            engine.evaluate_oauth_health().await;
        }
    }
}

/// Running timers. Dropping the handle leaves them running.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: broadcast::Sender<()>,
    tasks: Vec<(CheckKind, JoinHandle<()>)>,
}

impl SchedulerHandle {
    /// Checks that have a timer.
    #[must_use]
    pub fn checks(&self) -> Vec<CheckKind> {
        self.tasks.iter().map(|(kind, _)| *kind).collect()
    }

    /// Stop every timer and wait for in-progress ticks to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        for (kind, task) in self.tasks {
            if let Err(err) = task.await {
                tracing::error!(check = %kind, "Self-check timer ended abnormally: {err}");
            }
        }
        tracing::info!("Self-check scheduler stopped");
    }
}
