//! Provider-specific backends.
//!
//! Each provider has its own submodule implementing format rules and probe
//! interpretation; `oauth` holds the shared refresh-token exchange.

pub mod generic;
pub mod iflow;
pub mod oauth;
pub mod qwen;

pub use crate::core::provider::{ProbeVerdict, ProviderBackend, ProviderRegistry};
pub use generic::GenericBackend;
pub use iflow::IflowBackend;
pub use oauth::OAuthTokenRefresher;
pub use qwen::QwenBackend;
