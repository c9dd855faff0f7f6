//! Lifecycle orchestration over the control plane.
//!
//! One entry point per lifecycle intent (create, rebuild, renew, delete,
//! power). Each intent validates its preconditions, invokes the gateway,
//! classifies failure, and on success drives the readiness poller and (for
//! create/rebuild) the reachability probe before refreshing the resource
//! cache, in that order. Steps within one invocation are strictly
//! sequential; issuing two intents against the same instance concurrently
//! is a caller error.

#[cfg(test)]
mod tests;

use std::future::Future;

use chrono::{DateTime, Duration as ChronoDuration, Local};
use thiserror::Error;
use uuid::Uuid;

use crate::cache::{CacheUpdate, ResourceCache};
use crate::gateway::{ControlPlane, GatewayError};
use crate::model::{
    AutoConnectPolicy, Instance, Permissions, Plan, PlanDraft, PlanSubmission, PowerAction,
    RebuildSubmission,
};
use crate::poller::{PollOutcome, ReadinessPoller};
use crate::probe::{DEFAULT_SHELL_PORT, Handshake, ReachabilityProbe};
use crate::script_log::{BootScript, LogEntry, LogStore, ScriptLog, ScriptOperation};
use crate::ui::{Answer, ConnectLauncher, UserInterface};
use crate::wizard::{ConfigurationWizard, validate_duration};

/// Label of the re-authentication follow-up action.
pub const ACTION_OPEN_SETTINGS: &str = "Open settings";

/// Label of the manual-retry follow-up action.
pub const ACTION_RETRY: &str = "Retry";

/// Upper bound on operator-driven retries of one intent.
const MAX_RETRIES: usize = 3;

/// Warning threshold for the expiration watch.
const EXPIRY_WARNING_MINUTES: i64 = 5;

/// Errors surfaced by lifecycle intents.
///
/// Every variant has already produced its single user-facing notification
/// by the time it is returned; callers map these to exit status, not to
/// further messages.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Credentials are missing or were rejected; the operator was offered
    /// the settings surface.
    #[error("authentication failed")]
    Unauthenticated,
    /// The gateway call failed and the operator declined or exhausted the
    /// retry offer.
    #[error("lifecycle operation failed: {0}")]
    Gateway(#[source] GatewayError),
    /// A precondition failed before any network call was made.
    #[error("{message}")]
    Precondition {
        /// Description of the violated precondition.
        message: String,
    },
}

/// Which resources a refresh touches.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RefreshScope {
    /// Instances, permissions, plans, and SSH keys.
    All,
    /// The instance list only.
    Instances,
}

/// Outcome of a create or rebuild intent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionReport {
    /// Identifier of the affected instance.
    pub instance_id: String,
    /// Hostname reported by the control plane.
    pub hostname: String,
    /// Whether the instance confirmed `running` within the poll budget.
    pub readiness: PollOutcome,
    /// Whether the shell port proved reachable within the probe budget.
    pub reachable: bool,
    /// Whether the auto-connect collaborator was invoked.
    pub connected: bool,
}

/// Sink for script-execution records, kept object safe so intents can take
/// an optional reference without a type parameter.
pub trait ScriptLogSink {
    /// Records a freshly submitted script execution. Storage failures are
    /// the sink's to absorb; a lifecycle intent never fails on them.
    fn record_pending(&self, entry: LogEntry);
}

impl<S: LogStore> ScriptLogSink for ScriptLog<S> {
    fn record_pending(&self, entry: LogEntry) {
        if let Err(err) = self.append(entry) {
            tracing::warn!(error = %err, "failed to record script execution");
        }
    }
}

/// Composes the gateway, poller, probe, cache, and collaborators into one
/// entry point per lifecycle intent.
#[derive(Debug)]
pub struct LifecycleOrchestrator<C, U, L, H> {
    gateway: C,
    cache: ResourceCache,
    ui: U,
    launcher: L,
    probe: ReachabilityProbe<H>,
    poller: ReadinessPoller,
}

impl<C, U, L, H> LifecycleOrchestrator<C, U, L, H>
where
    C: ControlPlane,
    U: UserInterface,
    L: ConnectLauncher,
    H: Handshake,
{
    /// Creates an orchestrator over the given collaborators.
    #[must_use]
    pub const fn new(
        gateway: C,
        cache: ResourceCache,
        ui: U,
        launcher: L,
        probe: ReachabilityProbe<H>,
        poller: ReadinessPoller,
    ) -> Self {
        Self {
            gateway,
            cache,
            ui,
            launcher,
            probe,
            poller,
        }
    }

    /// The cache handle this orchestrator refreshes.
    #[must_use]
    pub const fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    /// Builds a create wizard over the cached catalogue and permissions.
    ///
    /// At most one wizard may run at a time; it owns the interaction
    /// surface.
    #[must_use]
    pub fn create_wizard(&self) -> ConfigurationWizard {
        let snapshot = self.cache.snapshot();
        ConfigurationWizard::new_create(
            snapshot.plans,
            snapshot.ssh_keys,
            snapshot
                .permissions
                .as_ref()
                .map_or(u64::MAX, |permissions| permissions.max_time),
        )
    }

    /// Builds an edit-mode create wizard pre-filled from the default plan.
    #[must_use]
    pub fn edit_wizard(&self, draft: PlanDraft) -> ConfigurationWizard {
        self.create_wizard().with_draft(draft)
    }

    /// Builds a rebuild wizard for the given plan.
    #[must_use]
    pub fn rebuild_wizard(&self, plan_id: &str) -> ConfigurationWizard {
        let snapshot = self.cache.snapshot();
        ConfigurationWizard::new_rebuild(snapshot.plans, snapshot.ssh_keys, plan_id)
    }

    /// Refreshes the cached snapshot from the control plane.
    ///
    /// Instance-list failures are classified and notified (settings prompt
    /// on 401, bounded retry offer otherwise). Failures of the remaining
    /// resources are isolated per resource: one failure never prevents the
    /// others from updating the cache. Without credentials the refresh is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Unauthenticated`] when the control plane
    /// rejects the credentials, or the instance-list failure when retries
    /// are declined or exhausted.
    pub async fn refresh(&self, scope: RefreshScope) -> Result<(), LifecycleError> {
        let credentials = self.cache.credentials();
        if credentials.is_none() {
            tracing::debug!("refresh skipped: no credentials configured");
            return Ok(());
        }

        let mut first_error = None;
        match self
            .submit_with_retry("instance list refresh", || {
                self.gateway.list_instances(credentials.as_ref())
            })
            .await
        {
            Ok(instances) => {
                let normalised: Vec<Instance> =
                    instances.into_iter().map(Instance::normalised).collect();
                self.cache
                    .merge(CacheUpdate::new().instances(normalised));
            }
            Err(LifecycleError::Unauthenticated) => {
                return Err(LifecycleError::Unauthenticated);
            }
            Err(err) => first_error = Some(err),
        }

        if scope == RefreshScope::All {
            match self.gateway.permissions(credentials.as_ref()).await {
                Ok(permissions) => {
                    self.cache.merge(CacheUpdate::new().permissions(permissions));
                }
                Err(err) => tracing::warn!(error = %err, "permissions refresh failed"),
            }

            match self.gateway.list_plans(credentials.as_ref()).await {
                Ok(plans) => {
                    let permissions = self.cache.snapshot().permissions;
                    let filtered = filter_plans(plans, permissions.as_ref());
                    self.cache.merge(CacheUpdate::new().plans(filtered));
                }
                Err(err) => tracing::warn!(error = %err, "plan refresh failed"),
            }

            match self.gateway.list_ssh_keys(credentials.as_ref()).await {
                Ok(keys) => {
                    let normalised = keys
                        .into_iter()
                        .map(|mut key| {
                            key.created_at = key
                                .created_at
                                .map(|stamp| crate::model::normalise_timestamp(&stamp));
                            key
                        })
                        .collect();
                    self.cache.merge(CacheUpdate::new().ssh_keys(normalised));
                }
                Err(err) => tracing::warn!(error = %err, "ssh key refresh failed"),
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Deploys a new instance and waits until it is usable.
    ///
    /// On success the cache is seeded with the returned record, the poller
    /// waits for `running`, the probe checks the shell port, and the
    /// instance snapshot is refreshed. The connect collaborator is invoked
    /// exactly once, and only when both waits confirmed and the
    /// auto-connect policy is enabled. Timeouts downgrade confidence but
    /// never roll back the completed deployment.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the submission fails; the snapshot is
    /// still refreshed before returning.
    pub async fn create(
        &self,
        submission: &PlanSubmission,
        boot_script: Option<&BootScript>,
        script_log: Option<&dyn ScriptLogSink>,
    ) -> Result<ProvisionReport, LifecycleError> {
        let credentials = self.cache.credentials();
        let receipt = match self
            .submit_with_retry("instance creation", || {
                self.gateway.create_instance(
                    credentials.as_ref(),
                    submission,
                    boot_script.map(|script| script.content.as_str()),
                )
            })
            .await
        {
            Ok(receipt) => receipt,
            Err(err) => {
                self.refresh_quietly().await;
                return Err(err);
            }
        };

        let instance = receipt.instance.normalised();
        self.cache
            .merge(CacheUpdate::new().instances(vec![instance.clone()]));
        self.record_script(
            boot_script,
            script_log,
            &instance.id,
            ScriptOperation::Create,
            receipt.command_uid,
        );

        let (readiness, reachable) = self
            .await_usable(
                &instance.id,
                &instance.hostname,
                &format!("Creating instance {}", instance.id),
            )
            .await;
        let _ = self.refresh(RefreshScope::Instances).await;

        Ok(self
            .conclude_provision(
                "instance creation",
                instance.id,
                instance.hostname,
                readiness,
                reachable,
            )
            .await)
    }

    /// Reinstalls an instance's operating system and waits until it is
    /// usable again. Follows the same post-submission sequence as
    /// [`LifecycleOrchestrator::create`].
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the submission fails.
    pub async fn rebuild(
        &self,
        instance_id: &str,
        submission: &RebuildSubmission,
        boot_script: Option<&BootScript>,
        script_log: Option<&dyn ScriptLogSink>,
    ) -> Result<ProvisionReport, LifecycleError> {
        let credentials = self.cache.credentials();
        let receipt = match self
            .submit_with_retry("instance rebuild", || {
                self.gateway.rebuild_instance(
                    credentials.as_ref(),
                    instance_id,
                    &submission.os_id,
                    submission.ssh_key_id.as_deref(),
                    boot_script.map(|script| script.content.as_str()),
                )
            })
            .await
        {
            Ok(receipt) => receipt,
            Err(err) => {
                self.refresh_quietly().await;
                return Err(err);
            }
        };

        self.record_script(
            boot_script,
            script_log,
            instance_id,
            ScriptOperation::Rebuild,
            receipt.command_uid,
        );

        let (readiness, reachable) = self
            .await_usable(
                instance_id,
                &receipt.hostname,
                &format!("Rebuilding instance {instance_id}"),
            )
            .await;
        let _ = self.refresh(RefreshScope::Instances).await;

        Ok(self
            .conclude_provision(
                "instance rebuild",
                instance_id.to_owned(),
                receipt.hostname,
                readiness,
                reachable,
            )
            .await)
    }

    /// Requests a power transition and waits for the action's target state
    /// (`running` after boot/restart, `stopped` after shutdown/poweroff).
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the submission fails.
    pub async fn power(
        &self,
        instance_id: &str,
        action: PowerAction,
    ) -> Result<PollOutcome, LifecycleError> {
        let credentials = self.cache.credentials();
        if let Err(err) = self
            .submit_with_retry("power action", || {
                self.gateway
                    .power_instance(credentials.as_ref(), instance_id, action)
            })
            .await
        {
            self.refresh_quietly().await;
            return Err(err);
        }

        let progress = self.ui.begin_progress(&format!(
            "Applying {} to instance {instance_id}",
            action.as_str()
        ));
        let readiness = self
            .poll_state(instance_id, action.target_state())
            .await;
        progress.finish();

        let _ = self.refresh(RefreshScope::Instances).await;

        if readiness.confirmed() {
            self.ui.show_info(&format!(
                "instance {instance_id} is now {}",
                action.target_state()
            ));
        } else {
            self.ui.show_info(&format!(
                "{} requested; instance {instance_id} has not confirmed {} yet",
                action.as_str(),
                action.target_state()
            ));
        }
        Ok(readiness)
    }

    /// Extends an instance's lifetime by `hours`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Precondition`] when `hours` is zero or
    /// exceeds the permitted maximum, and [`LifecycleError`] when the
    /// submission fails.
    pub async fn renew(&self, instance_id: &str, hours: u64) -> Result<(), LifecycleError> {
        if hours == 0 {
            return self
                .precondition_failed("renewal duration must be at least one hour")
                .await;
        }
        let permitted = self.cache.snapshot().permissions;
        if let Some(permissions) = &permitted
            && hours > permissions.max_time
        {
            return self
                .precondition_failed(&format!(
                    "renewal duration may be at most {} hours",
                    permissions.max_time
                ))
                .await;
        }

        let credentials = self.cache.credentials();
        if let Err(err) = self
            .submit_with_retry("instance renewal", || {
                self.gateway
                    .renew_instance(credentials.as_ref(), instance_id, hours)
            })
            .await
        {
            self.refresh_quietly().await;
            return Err(err);
        }

        let _ = self.refresh(RefreshScope::Instances).await;
        self.ui.show_info(&format!(
            "instance {instance_id} extended by {hours} hours"
        ));
        Ok(())
    }

    /// Destroys an instance. No polling follows; the snapshot refresh is the
    /// confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the submission fails.
    pub async fn delete(&self, instance_id: &str) -> Result<(), LifecycleError> {
        let credentials = self.cache.credentials();
        if let Err(err) = self
            .submit_with_retry("instance deletion", || {
                self.gateway
                    .destroy_instance(credentials.as_ref(), instance_id)
            })
            .await
        {
            self.refresh_quietly().await;
            return Err(err);
        }

        let _ = self.refresh(RefreshScope::Instances).await;
        self.ui
            .show_info(&format!("instance {instance_id} deleted"));
        Ok(())
    }

    /// Checks the cached instance's remaining lifetime against `now`.
    ///
    /// Below the warning threshold the operator is offered a renewal once
    /// per process (the reminder can be disarmed); at or past expiry the
    /// instance list is refreshed and a deletion notice is shown.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when an accepted renewal offer fails.
    pub async fn check_expiration(&self, now: DateTime<Local>) -> Result<(), LifecycleError> {
        let snapshot = self.cache.snapshot();
        let Some(instance) = snapshot.instances.first() else {
            return Ok(());
        };
        let Some(remaining) = instance.time_remaining(now) else {
            return Ok(());
        };

        if remaining <= ChronoDuration::zero() {
            let _ = self.refresh(RefreshScope::Instances).await;
            let _ = self
                .ui
                .show_error(
                    &format!("instance {} has expired and was removed", instance.id),
                    &[],
                )
                .await;
            return Ok(());
        }

        if remaining < ChronoDuration::minutes(EXPIRY_WARNING_MINUTES)
            && snapshot.remind_expiration
        {
            let minutes = remaining.num_minutes().max(0);
            let selection = self
                .ui
                .show_warning(
                    &format!(
                        "instance {} has less than {minutes} minute(s) left; back up your data now",
                        instance.id
                    ),
                    &["Extend", "Do not remind again"],
                )
                .await;
            match selection {
                Some(0) => {
                    let instance_id = instance.id.clone();
                    return self.prompt_renewal(&instance_id).await;
                }
                Some(1) => {
                    self.cache
                        .merge(CacheUpdate::new().remind_expiration(false));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Fetches one telemetry snapshot for the instance and caches it.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Gateway`] when the fetch fails; the failure
    /// is notified once without a follow-up action, matching its
    /// informational role.
    pub async fn refresh_telemetry(
        &self,
        instance_id: &str,
    ) -> Result<crate::model::InstanceTelemetry, LifecycleError> {
        let credentials = self.cache.credentials();
        match self
            .gateway
            .instance_telemetry(credentials.as_ref(), instance_id)
            .await
        {
            Ok(telemetry) => {
                self.cache
                    .merge(CacheUpdate::new().telemetry(telemetry.clone()));
                Ok(telemetry)
            }
            Err(err) => {
                let _ = self
                    .ui
                    .show_error(&format!("failed to fetch instance state: {err}"), &[])
                    .await;
                Err(LifecycleError::Gateway(err))
            }
        }
    }

    /// Asks the operator for a renewal duration and submits it.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the accepted renewal fails.
    pub async fn prompt_renewal(&self, instance_id: &str) -> Result<(), LifecycleError> {
        let max_time = self
            .cache
            .snapshot()
            .permissions
            .map_or(u64::MAX, |permissions| permissions.max_time);
        let validator = move |input: &str| validate_duration(input, max_time).err();
        match self
            .ui
            .input("Hours to extend the instance by", None, &validator)
            .await
        {
            Answer::Value(text) => match validate_duration(&text, max_time) {
                Ok(hours) => self.renew(instance_id, hours).await,
                Err(_) => Ok(()),
            },
            Answer::Back | Answer::Dismissed => Ok(()),
        }
    }

    async fn poll_state(&self, instance_id: &str, target: &str) -> PollOutcome {
        let credentials = self.cache.credentials();
        self.poller
            .wait_for_state(
                || {
                    let credentials = credentials.clone();
                    async move {
                        let telemetry = self
                            .gateway
                            .instance_telemetry(credentials.as_ref(), instance_id)
                            .await?;
                        self.cache
                            .merge(CacheUpdate::new().telemetry(telemetry.clone()));
                        Ok(telemetry)
                    }
                },
                target,
            )
            .await
    }

    async fn await_usable(
        &self,
        instance_id: &str,
        hostname: &str,
        title: &str,
    ) -> (PollOutcome, bool) {
        let progress = self.ui.begin_progress(title);
        progress.set_message("waiting for the instance to report running");
        let readiness = self.poll_state(instance_id, "running").await;

        progress.set_message("checking shell-port reachability");
        let reachable = self
            .probe
            .wait_for_reachable(hostname, DEFAULT_SHELL_PORT)
            .await;
        progress.finish();
        (readiness, reachable)
    }

    async fn conclude_provision(
        &self,
        what: &str,
        instance_id: String,
        hostname: String,
        readiness: PollOutcome,
        reachable: bool,
    ) -> ProvisionReport {
        let snapshot = self.cache.snapshot();
        let mut connected = false;

        if readiness.confirmed() && reachable && snapshot.auto_connect.enabled() {
            if let Some(host) = snapshot.auto_connect_host.as_deref() {
                self.launcher
                    .connect(host, snapshot.auto_connect == AutoConnectPolicy::New);
                connected = true;
            } else {
                let _ = self
                    .ui
                    .show_error(
                        "auto-connect is enabled but no SSH host alias is configured",
                        &[],
                    )
                    .await;
            }
        } else if !readiness.confirmed() {
            self.ui.show_info(&format!(
                "{what} submitted; the instance has not confirmed running yet"
            ));
        } else if reachable {
            self.ui
                .show_info(&format!("{what} succeeded and the instance is reachable"));
        } else {
            self.ui.show_info(&format!(
                "{what} succeeded but the shell port is not reachable yet"
            ));
        }

        ProvisionReport {
            instance_id,
            hostname,
            readiness,
            reachable,
            connected,
        }
    }

    fn record_script(
        &self,
        boot_script: Option<&BootScript>,
        script_log: Option<&dyn ScriptLogSink>,
        instance_id: &str,
        operation: ScriptOperation,
        command_uid: Option<String>,
    ) {
        if let (Some(script), Some(log)) = (boot_script, script_log) {
            let id = command_uid.unwrap_or_else(|| Uuid::new_v4().to_string());
            log.record_pending(LogEntry::pending(
                instance_id,
                operation,
                &script.name,
                id,
            ));
        }
    }

    async fn submit_with_retry<T, F, Fut>(
        &self,
        what: &str,
        mut operation: F,
    ) -> Result<T, LifecycleError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut retries = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(GatewayError::Unauthenticated) => {
                    let selection = self
                        .ui
                        .show_error(
                            "authentication failed: check the configured API credentials",
                            &[ACTION_OPEN_SETTINGS],
                        )
                        .await;
                    if selection == Some(0) {
                        self.ui.open_settings();
                    }
                    return Err(LifecycleError::Unauthenticated);
                }
                Err(err) => {
                    tracing::warn!(what, error = %err, "gateway call failed");
                    let message = format!("{what} failed: {err}");
                    if retries >= MAX_RETRIES {
                        let _ = self.ui.show_error(&message, &[]).await;
                        return Err(LifecycleError::Gateway(err));
                    }
                    let selection = self.ui.show_error(&message, &[ACTION_RETRY]).await;
                    if selection != Some(0) {
                        return Err(LifecycleError::Gateway(err));
                    }
                    retries += 1;
                }
            }
        }
    }

    async fn precondition_failed(&self, message: &str) -> Result<(), LifecycleError> {
        let _ = self.ui.show_error(message, &[]).await;
        Err(LifecycleError::Precondition {
            message: message.to_owned(),
        })
    }

    /// Best-effort snapshot refresh after a failed intent; never notifies,
    /// so one failure produces exactly one message.
    async fn refresh_quietly(&self) {
        let credentials = self.cache.credentials();
        if credentials.is_none() {
            return;
        }
        match self.gateway.list_instances(credentials.as_ref()).await {
            Ok(instances) => {
                let normalised: Vec<Instance> =
                    instances.into_iter().map(Instance::normalised).collect();
                self.cache
                    .merge(CacheUpdate::new().instances(normalised));
            }
            Err(err) => {
                tracing::debug!(error = %err, "post-failure snapshot refresh failed");
            }
        }
    }
}

/// Restricts a plan catalogue to the plans the principal may deploy.
#[must_use]
pub fn filter_plans(plans: Vec<Plan>, permissions: Option<&Permissions>) -> Vec<Plan> {
    match permissions {
        Some(permissions) => plans
            .into_iter()
            .filter(|plan| permissions.permits(&plan.id))
            .collect(),
        None => plans,
    }
}
