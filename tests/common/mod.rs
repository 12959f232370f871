//! Common test utilities for integration tests.
//!
//! # Modules
//!
//! - `fixtures`: wiremock provider stubs and engine assembly helpers
//! - `log_capture`: tracing capture for asserting on structured events
//! - `logger`: per-test structured progress logging

pub mod fixtures;
pub mod log_capture;
pub mod logger;
