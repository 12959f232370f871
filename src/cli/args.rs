//! CLI argument definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Credential health and pipeline lifecycle guard for AI gateways.
#[derive(Parser, Debug)]
#[command(name = "credguard")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    // === Global flags ===
    /// Config file (overrides CREDGUARD_CONFIG and the default location)
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value = "human", global = true)]
    pub format: OutputFormat,

    /// Shorthand for --format json
    #[arg(long, global = true)]
    pub json: bool,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pub pretty: bool,

    /// Log level
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Emit JSONL logs to stderr
    #[arg(long, global = true)]
    pub json_output: bool,

    /// Verbose output (sets log level to debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl Cli {
    /// Resolve the effective output format.
    #[must_use]
    pub fn effective_format(&self) -> OutputFormat {
        if self.json {
            OutputFormat::Json
        } else {
            self.format
        }
    }
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run self-check cycles (daemon, or a single cycle with --once)
    Run(RunArgs),

    /// Validate a single credential
    Validate(ValidateArgs),

    /// Show the resolved configuration and where each value came from
    Config,
}

/// Arguments for the `run` command.
#[derive(Args, Debug, Default, Clone)]
pub struct RunArgs {
    /// Run one self-check cycle, print the results, and exit
    #[arg(long)]
    pub once: bool,

    /// Probe timeout in seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Credential validation interval in seconds
    #[arg(long, value_name = "SECONDS")]
    pub interval: Option<u64>,

    /// Destroy pipelines whose credentials are invalid and cannot be refreshed
    #[arg(long)]
    pub auto_destroy: bool,
}

/// Arguments for the `validate` command.
#[derive(Args, Debug, Clone)]
pub struct ValidateArgs {
    /// Provider that issued the credential
    #[arg(long, value_name = "PROVIDER")]
    pub provider: String,

    /// Credential to check
    #[arg(long, value_name = "KEY", conflicts_with = "key_env", required_unless_present = "key_env")]
    pub key: Option<String>,

    /// Environment variable holding the credential
    #[arg(long, value_name = "VAR")]
    pub key_env: Option<String>,

    /// Probe endpoint (defaults to the provider's chat completion endpoint)
    #[arg(long, value_name = "URL")]
    pub endpoint: Option<String>,

    /// Model used for the probe
    #[arg(long, value_name = "MODEL")]
    pub model: Option<String>,

    /// Format check only; no network request
    #[arg(long)]
    pub offline: bool,

    /// Probe timeout in seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Human,
    /// JSON
    Json,
}
