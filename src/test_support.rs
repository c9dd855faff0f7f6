//! Test support utilities shared across unit and integration tests.
//!
//! Scripted doubles return pre-seeded responses in FIFO order and record
//! every invocation, so flows can be driven deterministically without a
//! network or a terminal.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::gateway::{
    ApiFuture, ControlPlane, GatewayError, ProvisionReceipt, RebuildReceipt,
};
use crate::model::{
    Credentials, Instance, InstanceTelemetry, Permissions, Plan, PlanSubmission, PowerAction,
    SshKey, TelemetryState,
};
use crate::probe::{Handshake, HandshakeFuture, HandshakeOutcome};
use crate::script_log::{LogEntry, LogStore, ScriptLogError};
use crate::ui::{Answer, Choice, ConnectLauncher, ProgressHandle, UiFuture, UserInterface};

fn pop<T>(queue: &Mutex<VecDeque<T>>) -> Option<T> {
    queue.lock().ok().and_then(|mut responses| responses.pop_front())
}

fn push<T>(queue: &Mutex<VecDeque<T>>, value: T) {
    if let Ok(mut responses) = queue.lock() {
        responses.push_back(value);
    }
}

/// Control-plane double with one response queue per operation.
///
/// A call with no queued response falls back to the operation's default
/// (`no scripted response` network error, or the last telemetry fallback).
#[derive(Debug, Default)]
pub struct ScriptedControlPlane {
    instances: Mutex<VecDeque<Result<Vec<Instance>, GatewayError>>>,
    plans: Mutex<VecDeque<Result<Vec<Plan>, GatewayError>>>,
    ssh_keys: Mutex<VecDeque<Result<Vec<SshKey>, GatewayError>>>,
    permissions: Mutex<VecDeque<Result<Permissions, GatewayError>>>,
    telemetry: Mutex<VecDeque<Result<InstanceTelemetry, GatewayError>>>,
    telemetry_fallback: Mutex<Option<InstanceTelemetry>>,
    creates: Mutex<VecDeque<Result<ProvisionReceipt, GatewayError>>>,
    rebuilds: Mutex<VecDeque<Result<RebuildReceipt, GatewayError>>>,
    acks: Mutex<VecDeque<Result<(), GatewayError>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedControlPlane {
    /// Creates a double with empty queues.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an instance-list response.
    pub fn push_instances(&self, response: Result<Vec<Instance>, GatewayError>) {
        push(&self.instances, response);
    }

    /// Queues a plan-list response.
    pub fn push_plans(&self, response: Result<Vec<Plan>, GatewayError>) {
        push(&self.plans, response);
    }

    /// Queues an SSH-key-list response.
    pub fn push_ssh_keys(&self, response: Result<Vec<SshKey>, GatewayError>) {
        push(&self.ssh_keys, response);
    }

    /// Queues a permissions response.
    pub fn push_permissions(&self, response: Result<Permissions, GatewayError>) {
        push(&self.permissions, response);
    }

    /// Queues one telemetry response.
    pub fn push_telemetry(&self, response: Result<InstanceTelemetry, GatewayError>) {
        push(&self.telemetry, response);
    }

    /// Sets the telemetry returned once the queue runs dry.
    pub fn set_telemetry_fallback(&self, telemetry: InstanceTelemetry) {
        if let Ok(mut fallback) = self.telemetry_fallback.lock() {
            *fallback = Some(telemetry);
        }
    }

    /// Queues a create response.
    pub fn push_create(&self, response: Result<ProvisionReceipt, GatewayError>) {
        push(&self.creates, response);
    }

    /// Queues a rebuild response.
    pub fn push_rebuild(&self, response: Result<RebuildReceipt, GatewayError>) {
        push(&self.rebuilds, response);
    }

    /// Queues an acknowledgement (destroy/renew/power) response.
    pub fn push_ack(&self, response: Result<(), GatewayError>) {
        push(&self.acks, response);
    }

    /// Names of all operations invoked so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    /// Number of telemetry fetches made so far.
    #[must_use]
    pub fn telemetry_fetches(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with("telemetry"))
            .count()
    }

    fn record(&self, call: impl Into<String>) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call.into());
        }
    }

    fn missing<T>() -> Result<T, GatewayError> {
        Err(GatewayError::Network {
            message: String::from("no scripted response available"),
        })
    }
}

impl ControlPlane for ScriptedControlPlane {
    fn list_instances<'a>(
        &'a self,
        _credentials: Option<&'a Credentials>,
    ) -> ApiFuture<'a, Vec<Instance>> {
        self.record("list_instances");
        let response = pop(&self.instances).unwrap_or_else(Self::missing);
        Box::pin(async move { response })
    }

    fn list_plans<'a>(
        &'a self,
        _credentials: Option<&'a Credentials>,
    ) -> ApiFuture<'a, Vec<Plan>> {
        self.record("list_plans");
        let response = pop(&self.plans).unwrap_or_else(Self::missing);
        Box::pin(async move { response })
    }

    fn list_ssh_keys<'a>(
        &'a self,
        _credentials: Option<&'a Credentials>,
    ) -> ApiFuture<'a, Vec<SshKey>> {
        self.record("list_ssh_keys");
        let response = pop(&self.ssh_keys).unwrap_or_else(Self::missing);
        Box::pin(async move { response })
    }

    fn permissions<'a>(
        &'a self,
        _credentials: Option<&'a Credentials>,
    ) -> ApiFuture<'a, Permissions> {
        self.record("permissions");
        let response = pop(&self.permissions).unwrap_or_else(Self::missing);
        Box::pin(async move { response })
    }

    fn instance_telemetry<'a>(
        &'a self,
        _credentials: Option<&'a Credentials>,
        instance_id: &'a str,
    ) -> ApiFuture<'a, InstanceTelemetry> {
        self.record(format!("telemetry:{instance_id}"));
        let response = pop(&self.telemetry).unwrap_or_else(|| {
            self.telemetry_fallback
                .lock()
                .ok()
                .and_then(|fallback| fallback.clone())
                .map_or_else(Self::missing, Ok)
        });
        Box::pin(async move { response })
    }

    fn create_instance<'a>(
        &'a self,
        _credentials: Option<&'a Credentials>,
        _submission: &'a PlanSubmission,
        boot_script: Option<&'a str>,
    ) -> ApiFuture<'a, ProvisionReceipt> {
        self.record(if boot_script.is_some() {
            "create+script"
        } else {
            "create"
        });
        let response = pop(&self.creates).unwrap_or_else(Self::missing);
        Box::pin(async move { response })
    }

    fn rebuild_instance<'a>(
        &'a self,
        _credentials: Option<&'a Credentials>,
        instance_id: &'a str,
        _os_id: &'a str,
        _ssh_key_id: Option<&'a str>,
        _boot_script: Option<&'a str>,
    ) -> ApiFuture<'a, RebuildReceipt> {
        self.record(format!("rebuild:{instance_id}"));
        let response = pop(&self.rebuilds).unwrap_or_else(Self::missing);
        Box::pin(async move { response })
    }

    fn destroy_instance<'a>(
        &'a self,
        _credentials: Option<&'a Credentials>,
        instance_id: &'a str,
    ) -> ApiFuture<'a, ()> {
        self.record(format!("destroy:{instance_id}"));
        let response = pop(&self.acks).unwrap_or_else(Self::missing);
        Box::pin(async move { response })
    }

    fn renew_instance<'a>(
        &'a self,
        _credentials: Option<&'a Credentials>,
        instance_id: &'a str,
        hours: u64,
    ) -> ApiFuture<'a, ()> {
        self.record(format!("renew:{instance_id}:{hours}"));
        let response = pop(&self.acks).unwrap_or_else(Self::missing);
        Box::pin(async move { response })
    }

    fn power_instance<'a>(
        &'a self,
        _credentials: Option<&'a Credentials>,
        instance_id: &'a str,
        action: PowerAction,
    ) -> ApiFuture<'a, ()> {
        self.record(format!("power:{instance_id}:{}", action.as_str()));
        let response = pop(&self.acks).unwrap_or_else(Self::missing);
        Box::pin(async move { response })
    }
}

/// One recorded notification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Notification {
    /// Message shown to the operator.
    pub message: String,
    /// Follow-up actions offered with the message.
    pub actions: Vec<String>,
}

/// Presentation double replaying scripted prompt answers and recording
/// every notification.
#[derive(Debug, Default)]
pub struct RecordingUi {
    picks: Mutex<VecDeque<Answer<usize>>>,
    inputs: Mutex<VecDeque<Answer<String>>>,
    confirms: Mutex<VecDeque<bool>>,
    error_selections: Mutex<VecDeque<Option<usize>>>,
    warning_selections: Mutex<VecDeque<Option<usize>>>,
    errors: Mutex<Vec<Notification>>,
    warnings: Mutex<Vec<Notification>>,
    infos: Mutex<Vec<String>>,
    settings_opened: AtomicUsize,
}

impl RecordingUi {
    /// Creates a double with empty queues; unanswered prompts dismiss.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a pick answer.
    pub fn push_pick(&self, answer: Answer<usize>) {
        push(&self.picks, answer);
    }

    /// Queues a text input answer.
    pub fn push_input(&self, answer: Answer<String>) {
        push(&self.inputs, answer);
    }

    /// Queues a confirmation answer.
    pub fn push_confirm(&self, answer: bool) {
        push(&self.confirms, answer);
    }

    /// Queues the action selected on the next error notification.
    pub fn push_error_selection(&self, selection: Option<usize>) {
        push(&self.error_selections, selection);
    }

    /// Queues the action selected on the next warning notification.
    pub fn push_warning_selection(&self, selection: Option<usize>) {
        push(&self.warning_selections, selection);
    }

    /// Error notifications shown so far.
    #[must_use]
    pub fn errors(&self) -> Vec<Notification> {
        self.errors.lock().map(|errors| errors.clone()).unwrap_or_default()
    }

    /// Warning notifications shown so far.
    #[must_use]
    pub fn warnings(&self) -> Vec<Notification> {
        self.warnings
            .lock()
            .map(|warnings| warnings.clone())
            .unwrap_or_default()
    }

    /// Informational notices shown so far.
    #[must_use]
    pub fn infos(&self) -> Vec<String> {
        self.infos.lock().map(|infos| infos.clone()).unwrap_or_default()
    }

    /// How many times the settings surface was opened.
    #[must_use]
    pub fn settings_opened(&self) -> usize {
        self.settings_opened.load(Ordering::SeqCst)
    }
}

/// Progress handle that does nothing.
#[derive(Debug)]
pub struct NullProgress;

impl ProgressHandle for NullProgress {
    fn set_message(&self, _message: &str) {}
    fn finish(&self) {}
}

impl UserInterface for RecordingUi {
    fn pick<'a>(
        &'a self,
        _prompt: &'a str,
        _options: &'a [Choice],
    ) -> UiFuture<'a, Answer<usize>> {
        let answer = pop(&self.picks).unwrap_or(Answer::Dismissed);
        Box::pin(async move { answer })
    }

    fn input<'a>(
        &'a self,
        _prompt: &'a str,
        _initial: Option<&'a str>,
        _validate: &'a (dyn Fn(&str) -> Option<String> + Sync),
    ) -> UiFuture<'a, Answer<String>> {
        let answer = pop(&self.inputs).unwrap_or(Answer::Dismissed);
        Box::pin(async move { answer })
    }

    fn confirm<'a>(&'a self, _prompt: &'a str) -> UiFuture<'a, bool> {
        let answer = pop(&self.confirms).unwrap_or(false);
        Box::pin(async move { answer })
    }

    fn begin_progress(&self, _title: &str) -> Box<dyn ProgressHandle> {
        Box::new(NullProgress)
    }

    fn show_error<'a>(
        &'a self,
        message: &'a str,
        actions: &'a [&'a str],
    ) -> UiFuture<'a, Option<usize>> {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(Notification {
                message: message.to_owned(),
                actions: actions.iter().map(|&action| action.to_owned()).collect(),
            });
        }
        let selection = pop(&self.error_selections).unwrap_or(None);
        Box::pin(async move { selection })
    }

    fn show_warning<'a>(
        &'a self,
        message: &'a str,
        actions: &'a [&'a str],
    ) -> UiFuture<'a, Option<usize>> {
        if let Ok(mut warnings) = self.warnings.lock() {
            warnings.push(Notification {
                message: message.to_owned(),
                actions: actions.iter().map(|&action| action.to_owned()).collect(),
            });
        }
        let selection = pop(&self.warning_selections).unwrap_or(None);
        Box::pin(async move { selection })
    }

    fn show_info(&self, message: &str) {
        if let Ok(mut infos) = self.infos.lock() {
            infos.push(message.to_owned());
        }
    }

    fn open_settings(&self) {
        self.settings_opened.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connect collaborator double that records invocations.
#[derive(Debug, Default)]
pub struct CountingLauncher {
    connects: Mutex<Vec<(String, bool)>>,
}

impl CountingLauncher {
    /// Creates a launcher with no recorded connections.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hosts connected to so far, with the new-window flag.
    #[must_use]
    pub fn connects(&self) -> Vec<(String, bool)> {
        self.connects
            .lock()
            .map(|connects| connects.clone())
            .unwrap_or_default()
    }
}

impl ConnectLauncher for CountingLauncher {
    fn connect(&self, host: &str, new_window: bool) {
        if let Ok(mut connects) = self.connects.lock() {
            connects.push((host.to_owned(), new_window));
        }
    }
}

/// Handshake double replaying scripted outcomes, then a fallback.
#[derive(Debug)]
pub struct ScriptedHandshake {
    outcomes: Mutex<VecDeque<HandshakeOutcome>>,
    fallback: HandshakeOutcome,
    attempts: AtomicUsize,
}

impl ScriptedHandshake {
    /// Creates a double that replays `outcomes`, then repeats `fallback`.
    #[must_use]
    pub fn new(outcomes: Vec<HandshakeOutcome>, fallback: HandshakeOutcome) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            fallback,
            attempts: AtomicUsize::new(0),
        }
    }

    /// A double whose every attempt proves the host alive.
    #[must_use]
    pub fn always_reachable() -> Self {
        Self::new(Vec::new(), HandshakeOutcome::Established)
    }

    /// A double whose every attempt is refused.
    #[must_use]
    pub fn never_reachable() -> Self {
        Self::new(
            Vec::new(),
            HandshakeOutcome::Unreachable {
                reason: String::from("connection refused"),
            },
        )
    }

    /// Number of attempts made so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Handshake for ScriptedHandshake {
    fn attempt<'a>(&'a self, _host: &'a str, _port: u16) -> HandshakeFuture<'a> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = pop(&self.outcomes).unwrap_or_else(|| self.fallback.clone());
        Box::pin(async move { outcome })
    }
}

/// In-memory [`LogStore`] for script-log tests.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the stored entries.
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

impl LogStore for MemoryLogStore {
    fn read(&self) -> Result<Vec<LogEntry>, ScriptLogError> {
        Ok(self.entries())
    }

    fn write(&self, entries: &[LogEntry]) -> Result<(), ScriptLogError> {
        if let Ok(mut stored) = self.entries.lock() {
            *stored = entries.to_vec();
        }
        Ok(())
    }
}

/// Builds a telemetry snapshot reporting the given lifecycle state.
#[must_use]
pub fn telemetry_in_state(state: &str) -> InstanceTelemetry {
    InstanceTelemetry {
        status: String::from("complete"),
        state: Some(TelemetryState {
            state: state.to_owned(),
            ..TelemetryState::default()
        }),
    }
}

/// Builds a minimal instance record for tests.
#[must_use]
pub fn sample_instance(id: &str, hostname: &str) -> Instance {
    Instance {
        id: id.to_owned(),
        plan_id: String::from("1"),
        plan: String::from("starter"),
        hostname: hostname.to_owned(),
        ipv4: String::from("192.0.2.10"),
        ipv6: None,
        os: Some(String::from("debian-12")),
        cpu: 2,
        memory_mb: 2048,
        disk_gb: 40,
        network_speed: None,
        creation_at: String::from("2026-03-01 10:00:00"),
        expiration_at: String::from("2026-03-01 22:00:00"),
        status: Some(String::from("running")),
    }
}
