//! In-memory snapshot of the principal's remote resources.
//!
//! The cache is the single source of truth read by every collaborator;
//! nothing renders from a fresh gateway call. It is an explicitly owned,
//! dependency-injected handle rather than a hidden singleton: construct it
//! once at process start from configuration and pass clones of the handle to
//! every component that needs it.

use std::sync::{Arc, Mutex, PoisonError};

use crate::model::{
    AutoConnectPolicy, Credentials, Instance, InstanceTelemetry, Permissions, Plan,
    PlanSubmission, SshKey,
};

/// Point-in-time view of every cached resource.
///
/// Reads return an owned clone so callers never hold the cache lock across a
/// suspension point; the instance list can change between a render and the
/// user's selection, so callers must re-validate before acting on a
/// remembered index.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    /// Credentials injected into every gateway call; absence short-circuits
    /// all remote operations.
    pub credentials: Option<Credentials>,
    /// Permitted plans and renewal ceiling, once fetched.
    pub permissions: Option<Permissions>,
    /// Plan catalogue, already filtered by permissions.
    pub plans: Vec<Plan>,
    /// Registered SSH keys.
    pub ssh_keys: Vec<SshKey>,
    /// Instances owned by the principal. The tool is designed around a
    /// single active instance (index 0) but the model does not preclude
    /// more.
    pub instances: Vec<Instance>,
    /// Latest telemetry snapshot; superseded wholesale by each poll.
    pub telemetry: Option<InstanceTelemetry>,
    /// Default deployment configured by the operator.
    pub default_plan: Option<PlanSubmission>,
    /// Auto-connect behaviour after create/rebuild.
    pub auto_connect: AutoConnectPolicy,
    /// SSH host alias handed to the connect collaborator.
    pub auto_connect_host: Option<String>,
    /// Whether the expiration warning is still armed.
    pub remind_expiration: bool,
}

/// Partial update merged into the cache.
///
/// Each populated field replaces the corresponding snapshot field wholesale;
/// there is no merging within a nested value. Unset fields are untouched.
#[derive(Clone, Debug, Default)]
pub struct CacheUpdate {
    credentials: Option<Option<Credentials>>,
    permissions: Option<Permissions>,
    plans: Option<Vec<Plan>>,
    ssh_keys: Option<Vec<SshKey>>,
    instances: Option<Vec<Instance>>,
    telemetry: Option<InstanceTelemetry>,
    default_plan: Option<Option<PlanSubmission>>,
    remind_expiration: Option<bool>,
}

impl CacheUpdate {
    /// Creates an empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the stored credentials (pass `None` to clear them).
    #[must_use]
    pub fn credentials(mut self, value: Option<Credentials>) -> Self {
        self.credentials = Some(value);
        self
    }

    /// Replaces the cached permissions.
    #[must_use]
    pub fn permissions(mut self, value: Permissions) -> Self {
        self.permissions = Some(value);
        self
    }

    /// Replaces the plan catalogue.
    #[must_use]
    pub fn plans(mut self, value: Vec<Plan>) -> Self {
        self.plans = Some(value);
        self
    }

    /// Replaces the SSH key list.
    #[must_use]
    pub fn ssh_keys(mut self, value: Vec<SshKey>) -> Self {
        self.ssh_keys = Some(value);
        self
    }

    /// Replaces the instance list.
    #[must_use]
    pub fn instances(mut self, value: Vec<Instance>) -> Self {
        self.instances = Some(value);
        self
    }

    /// Replaces the telemetry snapshot.
    #[must_use]
    pub fn telemetry(mut self, value: InstanceTelemetry) -> Self {
        self.telemetry = Some(value);
        self
    }

    /// Replaces the default deployment (pass `None` to clear it).
    #[must_use]
    pub fn default_plan(mut self, value: Option<PlanSubmission>) -> Self {
        self.default_plan = Some(value);
        self
    }

    /// Arms or disarms the expiration reminder.
    #[must_use]
    pub fn remind_expiration(mut self, value: bool) -> Self {
        self.remind_expiration = Some(value);
        self
    }
}

/// Cheaply cloneable handle to the shared resource snapshot.
#[derive(Clone, Debug, Default)]
pub struct ResourceCache {
    inner: Arc<Mutex<Snapshot>>,
}

impl ResourceCache {
    /// Creates an empty cache with the expiration reminder armed.
    #[must_use]
    pub fn new() -> Self {
        Self::seeded(Snapshot {
            remind_expiration: true,
            ..Snapshot::default()
        })
    }

    /// Creates a cache pre-populated with a seed snapshot (typically built
    /// from configuration at process start).
    #[must_use]
    pub fn seeded(mut snapshot: Snapshot) -> Self {
        snapshot.remind_expiration = true;
        Self {
            inner: Arc::new(Mutex::new(snapshot)),
        }
    }

    /// Merges a partial update, replacing each named field wholesale.
    ///
    /// The merge is atomic: readers observe either none or all of the
    /// update's fields.
    pub fn merge(&self, update: CacheUpdate) {
        let mut state = self.lock();
        if let Some(credentials) = update.credentials {
            state.credentials = credentials;
        }
        if let Some(permissions) = update.permissions {
            state.permissions = Some(permissions);
        }
        if let Some(plans) = update.plans {
            state.plans = plans;
        }
        if let Some(ssh_keys) = update.ssh_keys {
            state.ssh_keys = ssh_keys;
        }
        if let Some(instances) = update.instances {
            state.instances = instances;
        }
        if let Some(telemetry) = update.telemetry {
            state.telemetry = Some(telemetry);
        }
        if let Some(default_plan) = update.default_plan {
            state.default_plan = default_plan;
        }
        if let Some(remind) = update.remind_expiration {
            state.remind_expiration = remind;
        }
    }

    /// Returns an owned copy of the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.lock().clone()
    }

    /// Returns the current credentials, when configured.
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        self.lock().credentials.clone()
    }

    /// Returns the first cached instance, when one exists.
    #[must_use]
    pub fn first_instance(&self) -> Option<Instance> {
        self.lock().instances.first().cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Snapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
