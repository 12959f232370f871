//! Log output for the engine and the CLI.
//!
//! Engine work on one credential or one pipeline runs inside the spans built
//! here, so validator and lifecycle events carry `credential_id` or
//! `pipeline_id` without threading the ids through every call. The `run`
//! daemon defaults to JSONL on stderr for log shippers; one-shot commands
//! default to human-readable output.

use std::fs::OpenOptions;
use std::path::PathBuf;

use tracing::Span;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use super::credential_id::CredentialId;

const LEVEL_ENV: &str = "CREDGUARD_LOG";
const FORMAT_ENV: &str = "CREDGUARD_LOG_FORMAT";
const FILE_ENV: &str = "CREDGUARD_LOG_FILE";

/// HTTP stack crates whose debug output buries the engine's own events.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "h2", "reqwest", "rustls"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    /// One JSON object per line.
    Json,
    Compact,
}

impl LogFormat {
    #[must_use]
    pub fn from_arg(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "human" | "text" => Some(Self::Human),
            "json" | "jsonl" => Some(Self::Json),
            "compact" => Some(Self::Compact),
            _ => None,
        }
    }
}

/// Verbosity threshold for `credguard` events, quietest last.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a level name. `verbose`, `warning`, and `critical` are accepted
    /// as aliases so gateway-style level names work unchanged.
    #[must_use]
    pub fn from_arg(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "verbose" | "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" | "critical" => Some(Self::Error),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_filter(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Level named by `CREDGUARD_LOG`, if set to a known level.
#[must_use]
pub fn level_from_env() -> Option<LogLevel> {
    env_value(LEVEL_ENV).and_then(|v| LogLevel::from_arg(&v))
}

/// Span for work on one credential. Records the id and provider, never the secret.
#[must_use]
pub fn credential_span(id: &CredentialId, provider: &str) -> Span {
    tracing::info_span!("credential", credential_id = %id, provider)
}

/// Span for a lifecycle action on one pipeline.
#[must_use]
pub fn pipeline_span(pipeline_id: &str) -> Span {
    tracing::info_span!("pipeline", pipeline_id)
}

/// Logging settings resolved from command-line flags and the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LogLevel,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
    /// Lifts anything quieter than debug to debug.
    pub verbose: bool,
}

impl LogSettings {
    /// Flags win over `CREDGUARD_LOG*`. Without either, `daemon` selects JSONL.
    #[must_use]
    pub fn resolve(level_flag: Option<&str>, json_flag: bool, verbose: bool, daemon: bool) -> Self {
        let level = level_flag
            .and_then(LogLevel::from_arg)
            .or_else(level_from_env)
            .unwrap_or_default();
        let format = if json_flag {
            LogFormat::Json
        } else {
            env_value(FORMAT_ENV)
                .and_then(|v| LogFormat::from_arg(&v))
                .unwrap_or(if daemon { LogFormat::Json } else { LogFormat::Human })
        };
        Self {
            level,
            format,
            file: env_value(FILE_ENV).map(PathBuf::from),
            verbose,
        }
    }

    /// Replace the level, e.g. with the one resolved from the config file.
    #[must_use]
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    #[must_use]
    pub fn effective_level(&self) -> LogLevel {
        if self.verbose {
            self.level.min(LogLevel::Debug)
        } else {
            self.level
        }
    }

    /// Filter directives used when `RUST_LOG` is unset.
    #[must_use]
    pub fn directives(&self) -> String {
        std::iter::once(format!("credguard={}", self.effective_level().as_filter()))
            .chain(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn writer(&self) -> BoxMakeWriter {
        let file = self
            .file
            .as_ref()
            .and_then(|path| OpenOptions::new().create(true).append(true).open(path).ok());
        match file {
            Some(file) => BoxMakeWriter::new(file),
            None => BoxMakeWriter::new(std::io::stderr),
        }
    }

    /// Install the global subscriber. A log file that cannot be opened falls
    /// back to stderr; a second call is a no-op.
    pub fn init(&self) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.directives()));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(self.writer());

        let installed = match self.format {
            LogFormat::Json => builder
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .try_init(),
            LogFormat::Compact => builder.compact().with_target(true).try_init(),
            LogFormat::Human => builder.with_target(false).try_init(),
        };
        if installed.is_ok() {
            tracing::debug!(
                level = self.effective_level().as_filter(),
                format = ?self.format,
                "Logging initialized"
            );
        }
    }
}
