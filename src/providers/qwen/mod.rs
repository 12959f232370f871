//! Qwen provider backend.
//!
//! Qwen pipelines authenticate either with DashScope-style `sk-` keys or with
//! OAuth access tokens obtained through the device flow. Access tokens are
//! opaque and have no prefix, so the format rule accepts anything that is
//! either `sk-` prefixed or long enough to be a token.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::provider::{ProbeVerdict, ProviderBackend, has_choices};

/// Qwen portal chat completion endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://portal.qwen.ai/v1/chat/completions";

/// Model used for probes.
pub const DEFAULT_TEST_MODEL: &str = "qwen3-coder-plus";

/// Where an operator completes the device authorization flow.
pub const AUTHORIZATION_URL: &str = "https://chat.qwen.ai/authorize";

/// Token endpoint for refresh-token exchange.
pub const TOKEN_ENDPOINT: &str = "https://chat.qwen.ai/api/v1/oauth2/token";

/// Minimum length of an unprefixed token.
const MIN_TOKEN_LEN: usize = 20;

static TOKEN_CHARSET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("qwen token charset"));

/// Backend for `qwen`.
#[derive(Debug, Clone, Copy, Default)]
pub struct QwenBackend;

impl ProviderBackend for QwenBackend {
    fn name(&self) -> &'static str {
        "qwen"
    }

    fn check_format(&self, secret: &str) -> bool {
        TOKEN_CHARSET.is_match(secret) && (secret.starts_with("sk-") || secret.len() >= MIN_TOKEN_LEN)
    }

    fn format_rule(&self) -> &'static str {
        "sk- prefix or at least 20 token characters"
    }

    fn default_endpoint(&self) -> &'static str {
        DEFAULT_ENDPOINT
    }

    fn default_test_model(&self) -> &'static str {
        DEFAULT_TEST_MODEL
    }

    fn interpret_probe(&self, status: u16, body: &str) -> ProbeVerdict {
        match status {
            429 => ProbeVerdict::RateLimited,
            200..=299 => match serde_json::from_str::<serde_json::Value>(body) {
                Ok(json) if has_choices(&json) => ProbeVerdict::Valid,
                _ => ProbeVerdict::rejected(status, body),
            },
            _ => ProbeVerdict::rejected(status, body),
        }
    }

    fn authorization_url(&self) -> Option<&'static str> {
        Some(AUTHORIZATION_URL)
    }
}
