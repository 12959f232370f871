//! The self-check engine and its building blocks.

pub mod classifier;
pub mod credential_id;
pub mod credentials;
pub mod engine;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod logging;
pub mod models;
pub mod notify;
pub mod ports;
pub mod provider;
pub mod recovery;
pub mod scheduler;
pub mod static_pipelines;
pub mod validator;

pub use classifier::{ErrorClassifier, ErrorContext};
pub use credential_id::CredentialId;
pub use credentials::CredentialStore;
pub use engine::{CycleSummary, SelfCheckEngine, SelfCheckEngineBuilder};
pub use health::{HealthAggregator, HealthSettings};
pub use lifecycle::{PipelineLifecycleCoordinator, status_for_health};
pub use models::{
    AuthErrorKind, ClassifiedError, Credential, CredentialStatus, HealthStatus, HealthVerdict,
    PipelineCheckResult, PipelineCheckStatus, ProviderVerdict, SelfCheckRunStatistics,
};
pub use notify::TracingErrorSink;
pub use ports::{
    CredentialRefresher, ErrorSink, PipelineDescriptor, PipelineHealth, PipelineManager,
    PipelineStatistics, PipelineStatusReport, RefreshOutcome, StructuredError,
    StructuredErrorKind,
};
pub use provider::{ProbeVerdict, ProviderBackend, ProviderRegistry};
pub use recovery::{RecoveryDispatch, RecoveryReport, RecoveryState, RecoveryWorkflow};
pub use scheduler::{CheckKind, SchedulerHandle, SelfCheckScheduler};
pub use static_pipelines::StaticPipelineManager;
pub use validator::{CredentialValidator, ProbeTarget, ValidationOutcome};
