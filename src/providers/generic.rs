//! Generic OpenAI-compatible backend.
//!
//! Used for `openai` and as the fallback for any provider without a
//! registered backend.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::provider::{ProbeVerdict, ProviderBackend, has_choices};

/// OpenAI chat completion endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

/// Model used for probes.
pub const DEFAULT_TEST_MODEL: &str = "gpt-4o-mini";

static KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_\-]{10,}$").expect("generic key pattern"));

/// OpenAI-compatible rules under a caller-chosen name.
#[derive(Debug, Clone, Copy)]
pub struct GenericBackend {
    name: &'static str,
}

impl GenericBackend {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl ProviderBackend for GenericBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn check_format(&self, secret: &str) -> bool {
        KEY_PATTERN.is_match(secret)
    }

    fn format_rule(&self) -> &'static str {
        "at least 10 alphanumeric characters"
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
}
