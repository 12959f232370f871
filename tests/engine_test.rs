//! End-to-end self-check cycles against mock providers and a mock pipeline
//! manager.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use credguard::assert_contains;
use credguard::core::classifier::ErrorContext;
use credguard::core::models::{AuthErrorKind, CredentialStatus, HealthStatus, PipelineCheckStatus};
use credguard::core::ports::{PipelineHealth, RefreshOutcome, StructuredErrorKind};
use credguard::core::recovery::RecoveryState;
use credguard::core::scheduler::SelfCheckScheduler;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod common;

use common::fixtures::*;
use common::log_capture::TestLogCapture;
use common::logger::TestLogger;

async fn iflow_fleet(server: &MockServer) -> MockPipelineManager {
    mount_valid(server, IFLOW_TEST_KEY).await;
    mount_iflow_invalid(server, IFLOW_TEST_KEY_2).await;
    MockPipelineManager::new()
        .with_pipeline("good", mock_descriptor(server, "iflow", IFLOW_TEST_KEY))
        .with_pipeline("revoked", mock_descriptor(server, "iflow", IFLOW_TEST_KEY_2))
        .with_pipeline("malformed", mock_descriptor(server, "iflow", "sk-short"))
}

// =============================================================================
// Cycles
// =============================================================================

#[tokio::test]
async fn cycle_destroys_unrecoverable_pipelines_when_enabled() {
    let log = TestLogger::new("cycle_destroys_unrecoverable_pipelines_when_enabled");
    let server = MockServer::start().await;
    let manager = Arc::new(iflow_fleet(&server).await);
    let sink = Arc::new(RecordingErrorSink::new());
    let mut config = make_test_config();
    config.selfcheck.auto_destroy_invalid = true;
    let engine = build_engine(&config, &manager, &sink, None);

    log.phase("execute");
    assert!(engine.perform_self_check_cycle().await);

    log.phase("verify");
    let summary = engine.last_cycle().expect("summary");
    assert_eq!(summary.credentials_checked, 3);
    assert_eq!((summary.valid, summary.invalid, summary.expired), (1, 2, 0));
    assert_eq!(summary.errors_classified, 2);
    assert_eq!(summary.blacklisted, vec!["malformed", "revoked"]);
    assert_eq!(summary.destroyed, vec!["malformed", "revoked"]);
    assert_eq!(summary.recoveries_dispatched, 0);
    assert_eq!(summary.pipelines_checked, 1);

    let mut calls = manager.destroy_calls();
    calls.sort();
    assert_eq!(calls, vec!["malformed", "revoked"]);

    let results = engine.pipeline_check_results();
    let statuses: Vec<(&str, PipelineCheckStatus)> = results
        .iter()
        .map(|r| (r.pipeline_id.as_str(), r.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("good", PipelineCheckStatus::Active),
            ("malformed", PipelineCheckStatus::Destroyed),
            ("revoked", PipelineCheckStatus::Destroyed),
        ]
    );

    let stats = engine.run_statistics();
    assert_eq!((stats.total_runs, stats.successful_runs, stats.failed_runs), (1, 1, 0));
    log.finish_ok();
}

#[tokio::test]
async fn cycle_blacklists_without_destroying_by_default() {
    let server = MockServer::start().await;
    let manager = Arc::new(iflow_fleet(&server).await);
    let sink = Arc::new(RecordingErrorSink::new());
    let engine = build_engine(&make_test_config(), &manager, &sink, None);

    assert!(engine.perform_self_check_cycle().await);

    assert!(manager.destroy_calls().is_empty());
    let summary = engine.last_cycle().expect("summary");
    assert!(summary.destroyed.is_empty());
    for id in ["malformed", "revoked"] {
        let result = engine
            .pipeline_check_results()
            .into_iter()
            .find(|r| r.pipeline_id == id)
            .expect("result");
        assert_eq!(result.status, PipelineCheckStatus::Blacklisted);
    }
    // Two failures stay below the notification threshold.
    assert_eq!(engine.health_verdict().status, HealthStatus::Warning);
    assert!(sink.is_empty());
}

#[tokio::test]
async fn recovered_key_is_restored_on_the_next_cycle() {
    let server = MockServer::start().await;
    // First cycle: rejected.
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(
            ResponseTemplate::new(434)
                .set_body_json(serde_json::json!({ "status": "434", "msg": "Invalid apiKey" })),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    // Afterwards: accepted.
    mount_valid(&server, IFLOW_TEST_KEY).await;

    let manager = Arc::new(
        MockPipelineManager::new()
            .with_pipeline("p1", mock_descriptor(&server, "iflow", IFLOW_TEST_KEY)),
    );
    let sink = Arc::new(RecordingErrorSink::new());
    let engine = build_engine(&make_test_config(), &manager, &sink, None);

    assert!(engine.perform_self_check_cycle().await);
    assert_eq!(engine.last_cycle().expect("summary").blacklisted, vec!["p1"]);

    assert!(engine.perform_self_check_cycle().await);
    let summary = engine.last_cycle().expect("summary");
    assert_eq!(summary.restored, vec!["p1"]);
    assert_eq!(
        engine.pipeline_check_results()[0].status,
        PipelineCheckStatus::Active
    );
}

#[tokio::test]
async fn degraded_and_unhealthy_pipelines_are_reported() {
    let server = MockServer::start().await;
    mount_valid(&server, IFLOW_TEST_KEY).await;
    let manager = Arc::new(
        MockPipelineManager::new()
            .with_pipeline("p1", mock_descriptor(&server, "iflow", IFLOW_TEST_KEY))
            .with_pipeline("p2", mock_descriptor(&server, "iflow", IFLOW_TEST_KEY))
            .with_health("p2", PipelineHealth::Unhealthy),
    );
    let sink = Arc::new(RecordingErrorSink::new());
    let engine = build_engine(&make_test_config(), &manager, &sink, None);

    assert!(engine.perform_self_check_cycle().await);
    let statuses: Vec<PipelineCheckStatus> = engine
        .check_pipeline_health()
        .await
        .expect("sweep")
        .into_iter()
        .map(|r| r.status)
        .collect();
    assert_eq!(
        statuses,
        vec![PipelineCheckStatus::Active, PipelineCheckStatus::Blacklisted]
    );
}

// =============================================================================
// Expiry-driven recovery
// =============================================================================

const REFRESHED_TOKEN: &str = "qwen_refreshed_token_fedcba9876543210";

/// A qwen pipeline whose token is still accepted but expires within the margin.
fn expiring_qwen_descriptor(server: &MockServer) -> PipelineDescriptor {
    let mut descriptor = mock_descriptor(server, "qwen", QWEN_TEST_TOKEN);
    descriptor.expires_at = Some(Utc::now() + chrono::Duration::seconds(60));
    descriptor
}

#[tokio::test]
async fn expiring_credential_is_refreshed_ahead_of_time() {
    let log = TestLogger::new("expiring_credential_is_refreshed_ahead_of_time");
    let server = MockServer::start().await;
    mount_valid(&server, QWEN_TEST_TOKEN).await;
    mount_valid(&server, REFRESHED_TOKEN).await;

    let manager = Arc::new(
        MockPipelineManager::new().with_pipeline("q1", expiring_qwen_descriptor(&server)),
    );
    let sink = Arc::new(RecordingErrorSink::new());
    let new_expiry = Utc::now() + chrono::Duration::hours(1);
    let refresher = Arc::new(StubRefresher::with_outcome(RefreshOutcome::refreshed(
        REFRESHED_TOKEN,
        Some(new_expiry),
    )));
    let registry = registry_with_refresher("qwen", Arc::clone(&refresher) as Arc<dyn credguard::core::ports::CredentialRefresher>);
    let engine = build_engine(&make_test_config(), &manager, &sink, Some(registry));

    log.phase("execute");
    assert!(engine.perform_self_check_cycle().await);
    let summary = engine.last_cycle().expect("summary");
    let reports = engine.wait_for_recoveries().await;

    log.phase("verify");
    assert_eq!(summary.valid, 1);
    assert!(summary.blacklisted.is_empty());
    assert_eq!(summary.recoveries_dispatched, 1);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, RecoveryState::Recovered);
    assert_eq!(refresher.calls(), 1);

    let credential = engine.credential(&reports[0].credential_id).expect("credential");
    assert_eq!(credential.secret, REFRESHED_TOKEN);
    assert_eq!(credential.expires_at, Some(new_expiry));
    assert_eq!(credential.status, CredentialStatus::Valid);
    assert_eq!(
        engine.pipeline_check_results()[0].status,
        PipelineCheckStatus::Active
    );
    assert!(sink.is_empty());
    log.finish_ok();
}

#[tokio::test]
async fn failed_expiry_refresh_escalates_once_across_cycles() {
    let log = TestLogger::new("failed_expiry_refresh_escalates_once_across_cycles");
    let server = MockServer::start().await;
    mount_valid(&server, QWEN_TEST_TOKEN).await;

    let manager = Arc::new(
        MockPipelineManager::new().with_pipeline("q1", expiring_qwen_descriptor(&server)),
    );
    let sink = Arc::new(RecordingErrorSink::new());
    let refresher = Arc::new(StubRefresher::failing("refresh token revoked"));
    let registry = registry_with_refresher("qwen", Arc::clone(&refresher) as Arc<dyn credguard::core::ports::CredentialRefresher>);
    let engine = build_engine(&make_test_config(), &manager, &sink, Some(registry));

    log.phase("execute");
    let mut dispatched = Vec::new();
    let mut restored = Vec::new();
    for _ in 0..3 {
        assert!(engine.perform_self_check_cycle().await);
        let summary = engine.last_cycle().expect("summary");
        assert_eq!(summary.valid, 1);
        dispatched.push(summary.recoveries_dispatched);
        restored.extend(summary.restored);
        engine.wait_for_recoveries().await;
    }

    log.phase("verify");
    assert_eq!(dispatched, vec![1, 0, 0]);
    assert!(restored.is_empty(), "a plain valid probe lifted maintenance: {restored:?}");
    assert_eq!(refresher.calls(), 1);
    assert_eq!(
        sink.of_kind(|k| *k == StructuredErrorKind::RecreateRequired).len(),
        1
    );

    let id = engine.credentials()[0].id.clone();
    assert_eq!(
        engine.recovery().last_report(&id).expect("report").outcome,
        RecoveryState::RecreateRequired
    );
    let result = &engine.pipeline_check_results()[0];
    assert_eq!(result.status, PipelineCheckStatus::Blacklisted);
    assert_contains!(result.error.as_deref().unwrap_or(""), "maintenance");
    log.finish_ok();
}

// =============================================================================
// Validation cache and state
// =============================================================================

#[tokio::test]
async fn validate_credential_is_served_from_cache() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_body()))
        .expect(1)
        .mount(&server)
        .await;

    let manager = Arc::new(
        MockPipelineManager::new()
            .with_pipeline("p1", mock_descriptor(&server, "iflow", IFLOW_TEST_KEY)),
    );
    let sink = Arc::new(RecordingErrorSink::new());
    let mut config = make_test_config();
    config.selfcheck.cache_ttl_secs = 300;
    let engine = build_engine(&config, &manager, &sink, None);
    engine.sync_credentials().await.expect("sync");
    let id = engine.credentials()[0].id.clone();

    let first = engine.validate_credential(&id).await.expect("first");
    let checked_at = engine.credential(&id).expect("credential").last_checked;
    let second = engine.validate_credential(&id).await.expect("second");

    assert_eq!(first, CredentialStatus::Valid);
    assert_eq!(first, second);
    assert_eq!(engine.credential(&id).expect("credential").last_checked, checked_at);
    // `expect(1)` on the mock proves the second call never hit the network.
}

#[tokio::test]
async fn rejected_credential_blacklists_its_pipelines_at_once() {
    let server = MockServer::start().await;
    mount_iflow_invalid(&server, IFLOW_TEST_KEY).await;

    let manager = Arc::new(
        MockPipelineManager::new()
            .with_pipeline("p1", mock_descriptor(&server, "iflow", IFLOW_TEST_KEY)),
    );
    let sink = Arc::new(RecordingErrorSink::new());
    let engine = build_engine(&make_test_config(), &manager, &sink, None);
    engine.sync_credentials().await.expect("sync");
    engine.check_pipeline_health().await.expect("sweep");
    assert_eq!(
        engine.pipeline_check_results()[0].status,
        PipelineCheckStatus::Active
    );

    let id = engine.credentials()[0].id.clone();
    let status = engine.validate_credential(&id).await.expect("validate");

    // No health sweep in between: the rejection alone takes p1 out of service.
    assert_eq!(status, CredentialStatus::Invalid);
    let result = &engine.pipeline_check_results()[0];
    assert_eq!(result.status, PipelineCheckStatus::Blacklisted);
    assert_contains!(result.error.as_deref().unwrap_or(""), "invalid");
    assert!(manager.destroy_calls().is_empty());
}

#[tokio::test]
async fn reset_state_clears_everything() {
    let server = MockServer::start().await;
    let manager = Arc::new(iflow_fleet(&server).await);
    let sink = Arc::new(RecordingErrorSink::new());
    let engine = build_engine(&make_test_config(), &manager, &sink, None);

    assert!(engine.perform_self_check_cycle().await);
    assert!(!engine.credentials().is_empty());
    assert!(!engine.pipeline_check_results().is_empty());

    engine.reset_state();

    let stats = engine.run_statistics();
    assert_eq!((stats.total_runs, stats.successful_runs, stats.failed_runs), (0, 0, 0));
    assert_eq!(stats.last_run, DateTime::UNIX_EPOCH);
    assert!(stats.diagnostics.is_empty());
    assert!(engine.credentials().is_empty());
    assert!(engine.pipeline_check_results().is_empty());
    assert!(engine.last_cycle().is_none());
    assert_eq!(engine.health_verdict().status, HealthStatus::Healthy);
}

// =============================================================================
// Auth health aggregation
// =============================================================================

#[tokio::test]
async fn repeated_qwen_expiry_goes_critical_and_notifies_once() {
    let log = TestLogger::new("repeated_qwen_expiry_goes_critical_and_notifies_once");
    let server = MockServer::start().await;
    let manager = Arc::new(
        MockPipelineManager::new()
            .with_pipeline("q1", mock_descriptor(&server, "qwen", QWEN_TEST_TOKEN)),
    );
    let sink = Arc::new(RecordingErrorSink::new());
    let engine = build_engine(&make_test_config(), &manager, &sink, None);
    engine.sync_credentials().await.expect("sync");

    log.phase("execute");
    let context = ErrorContext::new("qwen: OAuth token expired").with_pipeline("q1");
    let first = engine.report_error(&context).expect("classified");
    assert_eq!(first.kind, AuthErrorKind::TokenExpired);
    assert_eq!(first.provider, "qwen");
    assert_eq!(first.affected_pipelines, vec!["q1"]);
    assert_eq!(engine.health_verdict().status, HealthStatus::Warning);

    engine.report_error(&context).expect("classified");
    assert_eq!(engine.health_verdict().status, HealthStatus::Warning);
    engine.report_error(&context).expect("classified");
    assert_eq!(engine.health_verdict().status, HealthStatus::Critical);
    assert!(sink.is_empty(), "report_error never notifies on its own");

    let verdict = engine.evaluate_oauth_health().await;

    log.phase("verify");
    assert_eq!(verdict.status, HealthStatus::Critical);
    assert_eq!(verdict.errors.len(), 3);
    assert_eq!(verdict.affected_pipeline_count, 3);

    let reports = sink.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(
        reports[0].kind,
        StructuredErrorKind::AuthHealthDegraded(AuthErrorKind::TokenExpired)
    );
    assert_eq!(reports[0].affected_pipelines, vec!["q1"]);
    assert!(reports[0].requires_action);

    // The buffer was drained: nothing left to alert on.
    let verdict = engine.evaluate_oauth_health().await;
    assert_eq!(verdict.status, HealthStatus::Healthy);
    assert_eq!(sink.len(), 1);
    log.finish_ok();
}

#[tokio::test]
async fn non_auth_failures_are_not_classified() {
    let engine = build_engine(
        &make_test_config(),
        &Arc::new(MockPipelineManager::new()),
        &Arc::new(RecordingErrorSink::new()),
        None,
    );
    assert!(
        engine
            .report_error(&ErrorContext::new("connection reset by peer"))
            .is_none()
    );
    assert_eq!(engine.health_verdict().status, HealthStatus::Healthy);
}

#[tokio::test]
async fn disabled_detection_classifies_nothing() {
    let mut config = make_test_config();
    config.oauth.detection_enabled = false;
    let engine = build_engine(
        &config,
        &Arc::new(MockPipelineManager::new()),
        &Arc::new(RecordingErrorSink::new()),
        None,
    );
    assert!(
        engine
            .report_error(&ErrorContext::new("iflow: invalid api key").auth_failure(true))
            .is_none()
    );
}

// =============================================================================
// Failure isolation
// =============================================================================

#[tokio::test]
async fn missing_manager_is_reported_once() {
    let sink = Arc::new(RecordingErrorSink::new());
    let engine = SelfCheckEngine::builder(&make_test_config())
        .error_sink(Arc::clone(&sink) as Arc<dyn ErrorSink>)
        .build()
        .expect("engine");

    assert!(engine.perform_self_check_cycle().await);
    assert!(engine.perform_self_check_cycle().await);

    let reports = sink.of_kind(|k| *k == StructuredErrorKind::Configuration);
    assert_eq!(reports.len(), 1);
    assert!(reports[0].requires_action);
    assert_eq!(engine.run_statistics().successful_runs, 2);
}

#[tokio::test]
async fn manager_outage_fails_the_cycle_and_the_next_one_recovers() {
    let server = MockServer::start().await;
    mount_valid(&server, IFLOW_TEST_KEY).await;
    let manager = Arc::new(
        MockPipelineManager::new()
            .with_pipeline("p1", mock_descriptor(&server, "iflow", IFLOW_TEST_KEY)),
    );
    let sink = Arc::new(RecordingErrorSink::new());
    let engine = build_engine(&make_test_config(), &manager, &sink, None);

    manager.set_fail_queries(true);
    assert!(!engine.perform_self_check_cycle().await);
    let stats = engine.run_statistics();
    assert_eq!(stats.failed_runs, 1);
    assert!(stats.diagnostics[0].contains("simulated pipeline manager outage"));

    manager.set_fail_queries(false);
    assert!(engine.perform_self_check_cycle().await);
    let stats = engine.run_statistics();
    assert_eq!((stats.total_runs, stats.successful_runs, stats.failed_runs), (2, 1, 1));
}

#[tokio::test]
async fn panicking_manager_is_contained() {
    let manager = Arc::new(MockPipelineManager::new().panicking());
    let sink = Arc::new(RecordingErrorSink::new());
    let engine = build_engine(&make_test_config(), &manager, &sink, None);

    assert!(!engine.perform_self_check_cycle().await);
    let stats = engine.run_statistics();
    assert_eq!(stats.failed_runs, 1);
    assert!(stats.diagnostics[0].contains("panicked"));
}

#[tokio::test(start_paused = true)]
async fn scheduler_keeps_ticking_through_panics() {
    let manager = Arc::new(MockPipelineManager::new().panicking());
    let sink = Arc::new(RecordingErrorSink::new());
    let config = make_test_config();
    let engine = Arc::new(build_engine(&config, &manager, &sink, None));

    let handle = SelfCheckScheduler::start(Arc::clone(&engine), &config.selfcheck);
    tokio::time::sleep(Duration::from_secs(121)).await;
    handle.shutdown().await;

    // Credential ticks at 0s; pipeline health ticks at 0s, 60s, 120s.
    let stats = engine.run_statistics();
    assert_eq!(stats.successful_runs, 0);
    assert!(stats.failed_runs >= 4, "stats: {stats:?}");
    assert!(
        stats
            .diagnostics
            .iter()
            .any(|d| d.contains("pipeline_health tick panicked"))
    );
}

#[tokio::test]
async fn secrets_never_reach_the_logs() {
    let capture = TestLogCapture::start();
    let server = MockServer::start().await;
    let manager = Arc::new(iflow_fleet(&server).await);
    let sink = Arc::new(RecordingErrorSink::new());
    let mut config = make_test_config();
    config.selfcheck.auto_destroy_invalid = true;
    let engine = build_engine(&config, &manager, &sink, None);

    assert!(engine.perform_self_check_cycle().await);

    capture.assert_logged("Self-check cycle complete");
    capture.assert_never_logged(IFLOW_TEST_KEY);
    capture.assert_never_logged(IFLOW_TEST_KEY_2);
    let rendered = format!("{:?}", engine.credentials());
    assert!(!rendered.contains(IFLOW_TEST_KEY));
}
