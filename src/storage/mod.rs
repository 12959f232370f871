//! Storage for configuration and OAuth token files.

pub mod config;
pub mod paths;
pub mod token_file;

pub use config::{
    Config, ConfigSource, ConfigSources, OAuthConfig, PipelineConfig, ProviderConfig,
    ResolvedConfig, SelfCheckConfig, ENV_AUTO_DESTROY, ENV_CONFIG, ENV_CREDENTIAL_INTERVAL,
    ENV_NOTIFY_THRESHOLD, ENV_VALIDATION_TIMEOUT,
};
pub use paths::AppPaths;
pub use token_file::{TokenFile, expand_home};
