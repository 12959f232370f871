//! iFlow provider backend.
//!
//! iFlow issues `sk-` prefixed keys. Its API reports a bad key with the
//! non-standard status 434, either as the HTTP status or inside a 200
//! envelope of the form `{"status":"434","msg":"..."}`.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::provider::{ProbeVerdict, ProviderBackend, has_choices, summarize_body};

/// iFlow chat completion endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://apis.iflow.cn/v1/chat/completions";

/// Model used for probes.
pub const DEFAULT_TEST_MODEL: &str = "qwen3-coder-plus";

/// Where an operator signs in again.
pub const AUTHORIZATION_URL: &str = "https://iflow.cn/oauth";

/// Token endpoint for refresh-token exchange.
pub const TOKEN_ENDPOINT: &str = "https://iflow.cn/oauth/token";

/// Minimum total key length, prefix included.
const MIN_KEY_LEN: usize = 32;

/// iFlow's "invalid API key" status.
const STATUS_INVALID_KEY: u16 = 434;

/// iFlow's envelope status for rate limiting.
const STATUS_RATE_LIMITED_ENVELOPE: &str = "449";

static KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sk-[A-Za-z0-9]+$").expect("iflow key pattern"));

/// Backend for `iflow`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IflowBackend;

impl IflowBackend {
    fn envelope_status(json: &serde_json::Value) -> Option<String> {
        match json.get("status")? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn envelope_message(json: &serde_json::Value, body: &str) -> String {
        json.get("msg")
            .or_else(|| json.get("message"))
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| summarize_body(body), str::to_string)
    }
}

impl ProviderBackend for IflowBackend {
    fn name(&self) -> &'static str {
        "iflow"
    }

    fn check_format(&self, secret: &str) -> bool {
        secret.len() >= MIN_KEY_LEN && KEY_PATTERN.is_match(secret)
    }

    fn format_rule(&self) -> &'static str {
        "sk- prefix followed by alphanumerics, at least 32 characters"
    }

    fn default_endpoint(&self) -> &'static str {
        DEFAULT_ENDPOINT
    }

    fn default_test_model(&self) -> &'static str {
        DEFAULT_TEST_MODEL
    }

    fn interpret_probe(&self, status: u16, body: &str) -> ProbeVerdict {
        let json = serde_json::from_str::<serde_json::Value>(body).ok();

        match status {
            429 => return ProbeVerdict::RateLimited,
            STATUS_INVALID_KEY => {
                let message = json.as_ref().map_or_else(
                    || summarize_body(body),
                    |j| Self::envelope_message(j, body),
                );
                return ProbeVerdict::Rejected {
                    status,
                    message,
                    expired: false,
                };
            }
            401 | 403 => return ProbeVerdict::rejected(status, body),
            _ => {}
        }

        if !(200..300).contains(&status) {
            return ProbeVerdict::rejected(status, body);
        }

        let Some(json) = json else {
            return ProbeVerdict::rejected(status, body);
        };

        if has_choices(&json) {
            return ProbeVerdict::Valid;
        }

        match Self::envelope_status(&json).as_deref() {
            Some("434") => ProbeVerdict::Rejected {
                status: STATUS_INVALID_KEY,
                message: Self::envelope_message(&json, body),
                expired: false,
            },
            Some("429" | STATUS_RATE_LIMITED_ENVELOPE) => ProbeVerdict::RateLimited,
            _ => ProbeVerdict::rejected(status, body),
        }
    }

    fn authorization_url(&self) -> Option<&'static str> {
        Some(AUTHORIZATION_URL)
    }
}
