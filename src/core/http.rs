//! HTTP client utilities.
//!
//! Provides the shared HTTP client used for probes and token refreshes.

use std::time::Duration;

use reqwest::{Client, ClientBuilder};

use crate::error::{GuardError, Result};

/// Default timeout for credential probes.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Build a configured HTTP client.
///
/// # Errors
///
/// Returns error if client construction fails.
pub fn build_client(timeout: Duration) -> Result<Client> {
    ClientBuilder::new()
        .timeout(timeout)
        .user_agent(format!("credguard/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| GuardError::Config(format!("failed to build HTTP client: {e}")))
}

