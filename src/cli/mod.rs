//! CLI argument parsing and command dispatch.

pub mod args;
pub mod config;
pub mod run;
pub mod validate;

pub use args::{Cli, Commands, OutputFormat, RunArgs, ValidateArgs};
