//! Test utilities for credguard.
//!
//! Provides collaborator doubles (pipeline manager, error sink, refresher),
//! test data factories, and assertion macros for use across unit and
//! integration tests.
//!
//! # Usage
//!
//! ```rust,ignore
//! use credguard::test_utils::*;
//!
//! let manager = MockPipelineManager::new()
//!     .with_pipeline("p1", make_test_descriptor("iflow", IFLOW_TEST_KEY));
//! let sink = RecordingErrorSink::new();
//! let dir = TestDir::new();
//! dir.create_file("config.toml", "[selfcheck]\nenabled = false");
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::{self, Write as IoWrite};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::models::{AuthErrorKind, ClassifiedError, Credential};
use crate::core::ports::{
    CredentialRefresher, ErrorSink, PipelineDescriptor, PipelineHealth, PipelineManager,
    PipelineStatistics, PipelineStatusReport, RefreshOutcome, StructuredError,
    StructuredErrorKind,
};
use crate::error::{GuardError, Result};
use crate::storage::config::{Config, PipelineConfig};

/// Serializes tests that mutate process environment variables.
pub static ENV_LOCK: Mutex<()> = Mutex::new(());

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Test Data Factories
// =============================================================================

/// An iFlow-shaped key: `sk-` plus 32 alphanumerics.
pub const IFLOW_TEST_KEY: &str = "sk-aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

/// A second iFlow-shaped key with a different prefix.
pub const IFLOW_TEST_KEY_2: &str = "sk-bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

/// An opaque Qwen OAuth access token.
pub const QWEN_TEST_TOKEN: &str = "qwen_access_token_0123456789abcdef";

/// Create a pipeline descriptor for `provider` authenticating with `secret`.
#[must_use]
pub fn make_test_descriptor(provider: &str, secret: &str) -> PipelineDescriptor {
    PipelineDescriptor::new(provider, secret).with_model("test-model")
}

/// Create a pipeline config entry with a literal credential.
#[must_use]
pub fn make_test_pipeline_config(id: &str, provider: &str, credential: &str) -> PipelineConfig {
    PipelineConfig {
        id: id.to_string(),
        provider: provider.to_string(),
        credential: Some(credential.to_string()),
        ..PipelineConfig::default()
    }
}

/// Default configuration with short timeouts suitable for tests.
///
/// The validation cache is disabled so every call probes.
#[must_use]
pub fn make_test_config() -> Config {
    let mut config = Config::default();
    config.selfcheck.validation_timeout_secs = 2;
    config.selfcheck.refresh_timeout_secs = 2;
    config.selfcheck.cache_ttl_secs = 0;
    config
}

/// Create a classified error for `provider`.
#[must_use]
pub fn make_test_classified_error(provider: &str, kind: AuthErrorKind) -> ClassifiedError {
    ClassifiedError {
        kind,
        provider: provider.to_string(),
        timestamp: Utc::now(),
        affected_pipelines: Vec::new(),
        message: kind.to_string(),
    }
}

/// A minimal OpenAI-style chat completion response.
#[must_use]
pub fn chat_completion_body() -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": "pong" },
            "finish_reason": "length"
        }]
    })
}

/// OAuth token file contents as written by provider CLIs.
#[must_use]
pub fn token_file_json(access_token: &str, refresh_token: &str, expiry: DateTime<Utc>) -> String {
    serde_json::json!({
        "access_token": access_token,
        "refresh_token": refresh_token,
        "token_type": "Bearer",
        "expiry_date": expiry.timestamp_millis(),
    })
    .to_string()
}

// =============================================================================
// Mock Pipeline Manager
// =============================================================================

#[derive(Debug, Default)]
struct MockState {
    pipelines: BTreeMap<String, PipelineDescriptor>,
    health: HashMap<String, PipelineStatusReport>,
    failing_destroys: BTreeSet<String>,
    declined_destroys: BTreeSet<String>,
    destroy_calls: Vec<String>,
    fail_queries: bool,
    panic_on_query: bool,
}

/// In-memory [`PipelineManager`] with scriptable failures.
///
/// Pipelines report `healthy` unless told otherwise. Destroy calls are
/// recorded whether or not they succeed.
#[derive(Debug, Default)]
pub struct MockPipelineManager {
    state: Mutex<MockState>,
}

impl MockPipelineManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_pipeline(self, pipeline_id: &str, descriptor: PipelineDescriptor) -> Self {
        self.add_pipeline(pipeline_id, descriptor);
        self
    }

    #[must_use]
    pub fn with_health(self, pipeline_id: &str, health: PipelineHealth) -> Self {
        self.set_health(pipeline_id, health);
        self
    }

    /// The status sweep reports a per-pipeline query failure for this id.
    #[must_use]
    pub fn with_status_failure(self, pipeline_id: &str, message: &str) -> Self {
        lock(&self.state).health.insert(
            pipeline_id.to_string(),
            PipelineStatusReport::Failed {
                message: message.to_string(),
            },
        );
        self
    }

    /// Destroying this pipeline returns an error.
    #[must_use]
    pub fn failing_destroy(self, pipeline_id: &str) -> Self {
        lock(&self.state)
            .failing_destroys
            .insert(pipeline_id.to_string());
        self
    }

    /// Destroying this pipeline returns `Ok(false)`.
    #[must_use]
    pub fn declining_destroy(self, pipeline_id: &str) -> Self {
        lock(&self.state)
            .declined_destroys
            .insert(pipeline_id.to_string());
        self
    }

    /// Inventory and status queries panic.
    #[must_use]
    pub fn panicking(self) -> Self {
        lock(&self.state).panic_on_query = true;
        self
    }

    pub fn add_pipeline(&self, pipeline_id: &str, descriptor: PipelineDescriptor) {
        lock(&self.state)
            .pipelines
            .insert(pipeline_id.to_string(), descriptor);
    }

    pub fn set_health(&self, pipeline_id: &str, health: PipelineHealth) {
        lock(&self.state).health.insert(
            pipeline_id.to_string(),
            PipelineStatusReport::Reported(health),
        );
    }

    /// Make every inventory and status query fail until reset.
    pub fn set_fail_queries(&self, fail: bool) {
        lock(&self.state).fail_queries = fail;
    }

    /// Every pipeline id passed to `destroy_pipeline`, in call order.
    #[must_use]
    pub fn destroy_calls(&self) -> Vec<String> {
        lock(&self.state).destroy_calls.clone()
    }

    #[must_use]
    pub fn contains(&self, pipeline_id: &str) -> bool {
        lock(&self.state).pipelines.contains_key(pipeline_id)
    }

    fn check_query(&self) -> Result<()> {
        let (fail, panic) = {
            let state = lock(&self.state);
            (state.fail_queries, state.panic_on_query)
        };
        assert!(!panic, "mock pipeline manager panicked");
        if fail {
            return Err(GuardError::PipelineManager(
                "simulated pipeline manager outage".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineManager for MockPipelineManager {
    async fn get_all_pipelines(&self) -> Result<HashMap<String, PipelineDescriptor>> {
        self.check_query()?;
        Ok(lock(&self.state)
            .pipelines
            .iter()
            .map(|(id, d)| (id.clone(), d.clone()))
            .collect())
    }

    async fn get_all_pipeline_status(&self) -> Result<HashMap<String, PipelineStatusReport>> {
        self.check_query()?;
        let state = lock(&self.state);
        Ok(state
            .pipelines
            .keys()
            .map(|id| {
                let report = state
                    .health
                    .get(id)
                    .cloned()
                    .unwrap_or(PipelineStatusReport::Reported(PipelineHealth::Healthy));
                (id.clone(), report)
            })
            .collect())
    }

    async fn destroy_pipeline(&self, pipeline_id: &str) -> Result<bool> {
        let mut state = lock(&self.state);
        state.destroy_calls.push(pipeline_id.to_string());
        if state.failing_destroys.contains(pipeline_id) {
            return Err(GuardError::PipelineManager(format!(
                "simulated destroy failure for {pipeline_id}"
            )));
        }
        if state.declined_destroys.contains(pipeline_id) {
            return Ok(false);
        }
        Ok(state.pipelines.remove(pipeline_id).is_some())
    }

    async fn get_pipeline(&self, pipeline_id: &str) -> Result<Option<PipelineDescriptor>> {
        self.check_query()?;
        Ok(lock(&self.state).pipelines.get(pipeline_id).cloned())
    }

    async fn get_statistics(&self) -> Result<PipelineStatistics> {
        self.check_query()?;
        let state = lock(&self.state);
        let healthy = state
            .pipelines
            .keys()
            .filter(|id| {
                state.health.get(*id).is_none_or(|h| {
                    *h == PipelineStatusReport::Reported(PipelineHealth::Healthy)
                })
            })
            .count();
        Ok(PipelineStatistics {
            total_pipelines: state.pipelines.len(),
            healthy_pipelines: healthy,
        })
    }
}

// =============================================================================
// Recording Error Sink
// =============================================================================

/// [`ErrorSink`] that keeps every report for later inspection.
#[derive(Debug, Default)]
pub struct RecordingErrorSink {
    reports: Mutex<Vec<StructuredError>>,
}

impl RecordingErrorSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reports(&self) -> Vec<StructuredError> {
        lock(&self.reports).clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.reports).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.reports).is_empty()
    }

    /// Reports whose kind matches `predicate`.
    #[must_use]
    pub fn of_kind(&self, predicate: impl Fn(&StructuredErrorKind) -> bool) -> Vec<StructuredError> {
        lock(&self.reports)
            .iter()
            .filter(|r| predicate(&r.kind))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ErrorSink for RecordingErrorSink {
    async fn report(&self, error: StructuredError) {
        lock(&self.reports).push(error);
    }
}

// =============================================================================
// Stub Refresher
// =============================================================================

/// [`CredentialRefresher`] returning a fixed outcome and counting calls.
#[derive(Debug)]
pub struct StubRefresher {
    outcome: RefreshOutcome,
    delay: Duration,
    calls: AtomicUsize,
}

impl StubRefresher {
    /// Refresh succeeds and swaps in `secret`.
    #[must_use]
    pub fn succeeding(secret: &str) -> Self {
        Self::with_outcome(RefreshOutcome::refreshed(secret, None))
    }

    /// Refresh succeeds without replacing the secret.
    #[must_use]
    pub fn succeeding_in_place() -> Self {
        Self::with_outcome(RefreshOutcome {
            success: true,
            refreshed_count: 1,
            ..RefreshOutcome::default()
        })
    }

    #[must_use]
    pub fn failing(message: &str) -> Self {
        Self::with_outcome(RefreshOutcome::failed(message))
    }

    #[must_use]
    pub const fn with_outcome(outcome: RefreshOutcome) -> Self {
        Self {
            outcome,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Hold each refresh for `delay` before answering.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialRefresher for StubRefresher {
    async fn refresh(&self, _credential: &Credential) -> RefreshOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcome.clone()
    }
}

// =============================================================================
// Temp Directory Utilities
// =============================================================================

/// A temporary directory for tests with automatic cleanup.
///
/// # Examples
///
/// ```rust,ignore
/// use credguard::test_utils::TestDir;
///
/// let dir = TestDir::new();
/// dir.create_file("oauth_creds.json", r#"{"access_token":"abc"}"#);
/// assert!(dir.file_exists("oauth_creds.json"));
/// ```
pub struct TestDir {
    inner: tempfile::TempDir,
}

impl TestDir {
    /// Create a new isolated temporary directory.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: tempfile::tempdir().expect("Failed to create temp directory"),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Create a file with the given content, creating parent directories.
    ///
    /// Returns the full path.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be created or written.
    pub fn create_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.inner.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent directories");
        }
        let mut file = fs::File::create(&path).expect("Failed to create test file");
        file.write_all(content.as_bytes())
            .expect("Failed to write test file");
        path
    }

    /// Read a file from the temporary directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn read_file(&self, name: &str) -> io::Result<String> {
        fs::read_to_string(self.inner.path().join(name))
    }

    #[must_use]
    pub fn file_exists(&self, name: &str) -> bool {
        self.inner.path().join(name).exists()
    }

    #[must_use]
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.inner.path().join(name)
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Assertion Macros
// =============================================================================

/// Assert that a string contains a substring.
#[macro_export]
macro_rules! assert_contains {
    ($haystack:expr, $needle:expr) => {
        assert!(
            $haystack.contains($needle),
            "Expected string to contain {:?}\nActual: {:?}",
            $needle,
            $haystack
        );
    };
}

/// Assert that a string does not contain a substring.
#[macro_export]
macro_rules! assert_not_contains {
    ($haystack:expr, $needle:expr) => {
        assert!(
            !$haystack.contains($needle),
            "Expected string NOT to contain {:?}\nActual: {:?}",
            $needle,
            $haystack
        );
    };
}

// =============================================================================
// Tests for Test Utilities
// =============================================================================
