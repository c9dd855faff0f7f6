//! Core library for the Ephemera instance lifecycle tool.
//!
//! The crate orchestrates short-lived cloud compute instances through a
//! remote control-plane API: a typed gateway, a backward-navigable
//! configuration wizard, bounded readiness polling and shell-port
//! reachability probing, and a single refreshable resource cache that every
//! presentation collaborator reads from.

pub mod cache;
pub mod config;
pub mod gateway;
pub mod model;
pub mod orchestrator;
pub mod poller;
pub mod probe;
pub mod script_log;
pub mod test_support;
pub mod ui;
pub mod wizard;

pub use cache::{CacheUpdate, ResourceCache, Snapshot};
pub use config::{ConfigError, EphemeraConfig};
pub use gateway::{
    ApiFuture, ControlPlane, Gateway, GatewayError, ProvisionReceipt, RebuildReceipt,
};
pub use model::{
    AutoConnectPolicy, CollectedPlan, Credentials, Instance, InstanceTelemetry, OsImage,
    Permissions, Plan, PlanDraft, PlanSubmission, PowerAction, RebuildSubmission, SshKey,
};
pub use orchestrator::{
    LifecycleError, LifecycleOrchestrator, ProvisionReport, RefreshScope, ScriptLogSink,
    filter_plans,
};
pub use poller::{PollOutcome, ReadinessPoller};
pub use probe::{
    DEFAULT_SHELL_PORT, Handshake, HandshakeOutcome, ReachabilityProbe, TcpHandshake,
};
pub use script_log::{
    BootScript, JsonFileStore, LogEntry, LogStore, ScriptLibrary, ScriptLog, ScriptLogError,
    ScriptOperation, ScriptStatus,
};
pub use ui::{Answer, Choice, ConnectLauncher, ProgressHandle, UiFuture, UserInterface};
pub use wizard::{ConfigurationWizard, WizardMode, WizardOutcome, WizardStep, validate_duration};
