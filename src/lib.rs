//! credguard - credential self-check engine for AI routing gateways.
//!
//! Validates provider credentials, aggregates authentication failures into a
//! health verdict, recovers expiring OAuth credentials, and retires or
//! restores the pipelines that depend on them.

// Note: deny (not forbid) to allow #[allow(unsafe_code)] in test helpers for env var manipulation
#![deny(unsafe_code)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod core;
pub mod error;
pub mod providers;
pub mod storage;

/// Test utilities module - included in test builds or when test-utils feature is enabled.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use core::engine::{SelfCheckEngine, SelfCheckEngineBuilder};
pub use error::{ExitCode, GuardError, Result};

// Re-export test utilities for external test crates
#[cfg(any(test, feature = "test-utils"))]
pub use test_utils::*;
