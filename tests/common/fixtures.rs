//! Fixtures for integration tests: wiremock provider endpoints and engine
//! assembly.
#![allow(dead_code)]

use std::sync::Arc;

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub use credguard::core::ports::{
    CredentialRefresher, ErrorSink, PipelineDescriptor, PipelineManager,
};
pub use credguard::core::provider::ProviderRegistry;
pub use credguard::storage::Config;
pub use credguard::test_utils::*;
pub use credguard::SelfCheckEngine;

/// Path the mock provider serves chat completions on.
pub const CHAT_PATH: &str = "/v1/chat/completions";

/// Path the mock provider serves OAuth token exchanges on.
pub const TOKEN_PATH: &str = "/oauth/token";

#[must_use]
pub fn chat_url(server: &MockServer) -> String {
    format!("{}{CHAT_PATH}", server.uri())
}

#[must_use]
pub fn token_url(server: &MockServer) -> String {
    format!("{}{TOKEN_PATH}", server.uri())
}

/// Answer probes authenticated with `secret` with `status` and a JSON body.
pub async fn mount_probe(
    server: &MockServer,
    secret: &str,
    status: u16,
    body: serde_json::Value,
) {
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .and(header("authorization", format!("Bearer {secret}").as_str()))
        .respond_with(ResponseTemplate::new(status).set_body_json(body))
        .mount(server)
        .await;
}

/// Probes with `secret` succeed.
pub async fn mount_valid(server: &MockServer, secret: &str) {
    mount_probe(server, secret, 200, chat_completion_body()).await;
}

/// Probes with `secret` get iFlow's invalid-key status.
pub async fn mount_iflow_invalid(server: &MockServer, secret: &str) {
    mount_probe(
        server,
        secret,
        434,
        serde_json::json!({ "status": "434", "msg": "Invalid apiKey" }),
    )
    .await;
}

/// Probes with `secret` get a 401 whose body marks the token expired.
pub async fn mount_expired(server: &MockServer, secret: &str) {
    mount_probe(
        server,
        secret,
        401,
        serde_json::json!({
            "error": { "code": "invalid_token", "message": "access token expired" }
        }),
    )
    .await;
}

/// Descriptor pointing its probes at the mock server.
#[must_use]
pub fn mock_descriptor(server: &MockServer, provider: &str, secret: &str) -> PipelineDescriptor {
    make_test_descriptor(provider, secret).with_endpoint(chat_url(server))
}

/// Registry with the built-in backends plus a refresher for `provider`.
#[must_use]
pub fn registry_with_refresher(
    provider: &str,
    refresher: Arc<dyn CredentialRefresher>,
) -> ProviderRegistry {
    let mut registry = ProviderRegistry::with_defaults();
    registry.register_refresher(provider, refresher);
    registry
}

/// Engine over a mock manager and a recording sink.
#[must_use]
pub fn build_engine(
    config: &Config,
    manager: &Arc<MockPipelineManager>,
    sink: &Arc<RecordingErrorSink>,
    registry: Option<ProviderRegistry>,
) -> SelfCheckEngine {
    let manager: Arc<dyn PipelineManager> = Arc::clone(manager) as Arc<dyn PipelineManager>;
    let sink: Arc<dyn ErrorSink> = Arc::clone(sink) as Arc<dyn ErrorSink>;
    let mut builder = SelfCheckEngine::builder(config)
        .pipeline_manager(manager)
        .error_sink(sink);
    if let Some(registry) = registry {
        builder = builder.registry(registry);
    }
    builder.build().expect("engine builds")
}
