//! Domain model for the ephemeral-instance control plane.
//!
//! Wire payloads are decoded into these types at the gateway boundary;
//! timestamps and capacity counters are normalised exactly once, at the
//! moment a value enters the resource cache, and never re-normalised on
//! read.

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Timestamp layout used by the control plane and by the local cache.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Offset of the control plane's wall clock from UTC, in seconds.
const CONTROL_PLANE_UTC_OFFSET_SECS: i32 = 3600;

/// Credentials injected into every gateway call.
///
/// Depending on the deployment the control plane accepts either a raw API
/// token or a client identifier plus secret; both render to a single bearer
/// value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Credentials {
    /// Opaque API token used verbatim as the bearer value.
    Token(String),
    /// Client identifier and secret joined as `client_id:secret`.
    KeyPair {
        /// Client identifier assigned by the control plane.
        client_id: String,
        /// Secret paired with the client identifier.
        secret: String,
    },
}

impl Credentials {
    /// Renders the bearer value sent in the `Authorization` header.
    #[must_use]
    pub fn bearer(&self) -> String {
        match self {
            Self::Token(token) => token.clone(),
            Self::KeyPair { client_id, secret } => format!("{client_id}:{secret}"),
        }
    }
}

/// A bootable operating system image offered by a plan.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct OsImage {
    /// Image identifier.
    pub id: String,
    /// Human readable image name.
    pub name: String,
}

/// A purchasable instance specification from the plan catalogue.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Plan {
    /// Plan identifier.
    pub id: String,
    /// Commercial name of the plan.
    pub name: String,
    /// CPU core count, when advertised.
    pub cpu: Option<u32>,
    /// Memory in MiB, when advertised.
    pub memory_mb: Option<u64>,
    /// Disk size in GiB, when advertised.
    pub disk_gb: Option<u64>,
    /// Operating system images deployable on this plan, flattened from the
    /// grouped wire representation.
    pub os: Vec<OsImage>,
}

/// An SSH public key registered with the control plane.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshKey {
    /// Key identifier.
    pub id: String,
    /// Label the key was registered under.
    pub name: String,
    /// Registration timestamp, normalised to local time at ingestion.
    pub created_at: Option<String>,
}

/// Plan identifiers and renewal ceiling granted to the authenticated
/// principal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Permissions {
    /// Plan identifiers the principal may deploy; `None` means the catalogue
    /// is unrestricted.
    pub allow_packages: Option<Vec<String>>,
    /// Maximum duration, in hours, a single deployment or renewal may
    /// request.
    pub max_time: u64,
}

impl Permissions {
    /// Returns whether the principal may deploy the given plan.
    #[must_use]
    pub fn permits(&self, plan_id: &str) -> bool {
        match &self.allow_packages {
            Some(allowed) => allowed.iter().any(|id| id == plan_id),
            None => true,
        }
    }
}

/// A provisioned instance as reported by the control plane.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    /// Instance identifier.
    pub id: String,
    /// Identifier of the plan the instance was deployed from.
    pub plan_id: String,
    /// Commercial name of the plan.
    pub plan: String,
    /// Hostname assigned by the control plane.
    pub hostname: String,
    /// Public IPv4 address.
    pub ipv4: String,
    /// Public IPv6 address, when assigned.
    pub ipv6: Option<String>,
    /// Operating system label, when reported.
    pub os: Option<String>,
    /// CPU core count.
    pub cpu: u32,
    /// Memory in MiB.
    pub memory_mb: u64,
    /// Disk size in GiB.
    pub disk_gb: u64,
    /// Advertised network speed, when reported.
    pub network_speed: Option<String>,
    /// Creation timestamp, normalised to local time at ingestion.
    pub creation_at: String,
    /// Expiration timestamp, normalised to local time at ingestion. This is
    /// the authoritative lifetime; telemetry never overrides it.
    pub expiration_at: String,
    /// Coarse status reported by the listing endpoint, separate from live
    /// telemetry.
    pub status: Option<String>,
}

impl Instance {
    /// Converts the creation and expiration timestamps from the control
    /// plane's wall clock into local time.
    ///
    /// Call exactly once, when the instance enters the cache.
    #[must_use]
    pub fn normalised(mut self) -> Self {
        self.creation_at = normalise_timestamp(&self.creation_at);
        self.expiration_at = normalise_timestamp(&self.expiration_at);
        self
    }

    /// Remaining lifetime relative to `now`, or `None` when the expiration
    /// timestamp cannot be parsed.
    ///
    /// The result is negative once the instance has expired.
    #[must_use]
    pub fn time_remaining(&self, now: DateTime<Local>) -> Option<ChronoDuration> {
        let naive = NaiveDateTime::parse_from_str(self.expiration_at.trim(), TIMESTAMP_FORMAT)
            .ok()?;
        let expiry = naive.and_local_timezone(Local).single()?;
        Some(expiry.signed_duration_since(now))
    }
}

/// Memory counters from live telemetry, in MiB.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MemoryUsage {
    /// Total memory.
    pub total_mib: f64,
    /// Free memory.
    pub free_mib: f64,
    /// Available memory.
    pub available_mib: f64,
}

/// Cumulative network traffic from live telemetry, in GiB.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TrafficTotals {
    /// Inbound traffic.
    pub inbound_gib: f64,
    /// Outbound traffic.
    pub outbound_gib: f64,
    /// Combined traffic.
    pub total_gib: f64,
}

/// Live runtime counters for an instance.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TelemetryState {
    /// Coarse lifecycle state (for example `running`, `stopped`,
    /// `provisioning`).
    pub state: String,
    /// CPU utilisation percentage.
    pub cpu: f64,
    /// Memory counters.
    pub memory: MemoryUsage,
    /// Traffic counters.
    pub traffic: TrafficTotals,
}

/// Ephemeral telemetry snapshot for a running instance.
///
/// Each successful poll replaces the previous snapshot wholesale; snapshots
/// are informational only and never authoritative for billing or expiry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstanceTelemetry {
    /// Collection status reported by the control plane (`complete` when the
    /// state block is populated).
    pub status: String,
    /// Runtime counters, absent while the control plane has nothing to
    /// report.
    pub state: Option<TelemetryState>,
}

impl InstanceTelemetry {
    /// Coarse lifecycle state, when reported.
    #[must_use]
    pub fn coarse_state(&self) -> Option<&str> {
        self.state.as_ref().map(|state| state.state.as_str())
    }

    /// Returns whether the reported lifecycle state equals `target`.
    #[must_use]
    pub fn is_in_state(&self, target: &str) -> bool {
        self.coarse_state() == Some(target)
    }
}

/// Power transition requested for an instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowerAction {
    /// Start a stopped instance.
    Boot,
    /// Gracefully stop a running instance.
    Shutdown,
    /// Restart a running instance.
    Restart,
    /// Cut power without a graceful shutdown.
    Poweroff,
}

impl PowerAction {
    /// Wire name of the action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::Shutdown => "shutdown",
            Self::Restart => "restart",
            Self::Poweroff => "poweroff",
        }
    }

    /// Telemetry state the instance is expected to settle into after the
    /// action completes.
    #[must_use]
    pub const fn target_state(self) -> &'static str {
        match self {
            Self::Boot | Self::Restart => "running",
            Self::Shutdown | Self::Poweroff => "stopped",
        }
    }

    /// Parses a wire or CLI name into an action.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "boot" => Some(Self::Boot),
            "shutdown" => Some(Self::Shutdown),
            "restart" => Some(Self::Restart),
            "poweroff" => Some(Self::Poweroff),
            _ => None,
        }
    }
}

/// Auto-connect behaviour after a successful create or rebuild.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AutoConnectPolicy {
    /// Never connect automatically.
    #[default]
    Off,
    /// Connect in the current window or session.
    Reuse,
    /// Connect in a new window or session.
    New,
}

impl AutoConnectPolicy {
    /// Returns whether auto-connect is enabled at all.
    #[must_use]
    pub const fn enabled(self) -> bool {
        !matches!(self, Self::Off)
    }
}

/// Mutable working copy of a plan being assembled by the configuration
/// wizard.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PlanDraft {
    /// Selected plan identifier.
    pub plan_id: Option<String>,
    /// Selected operating system image identifier.
    pub os_id: Option<String>,
    /// Requested duration in hours.
    pub duration_hours: Option<u64>,
    /// Selected SSH key identifier; `None` means no key.
    pub ssh_key_id: Option<String>,
}

/// A fully collected, validated plan ready for submission.
///
/// Immutable once built; lifecycle operations consume it as-is.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlanSubmission {
    /// Plan identifier.
    pub plan_id: String,
    /// Operating system image identifier.
    pub os_id: String,
    /// Requested duration in hours.
    pub duration_hours: u64,
    /// SSH key identifier, when one was selected.
    pub ssh_key_id: Option<String>,
}

/// Collected parameters for rebuilding an existing instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RebuildSubmission {
    /// Operating system image identifier to reinstall.
    pub os_id: String,
    /// SSH key identifier, when one was selected.
    pub ssh_key_id: Option<String>,
}

/// Payload of a completed configuration flow.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CollectedPlan {
    /// A full deployment collected by the create flow.
    Create(PlanSubmission),
    /// A reinstall collected by the rebuild flow.
    Rebuild(RebuildSubmission),
}

/// Errors raised when a draft cannot be promoted to a submission.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DraftError {
    /// Raised when a required field has not been collected yet.
    #[error("missing field: {0}")]
    Missing(&'static str),
    /// Raised when the requested duration is outside the permitted range.
    #[error("duration must be between 1 and {max} hours")]
    DurationOutOfRange {
        /// Permitted maximum in hours.
        max: u64,
    },
}

impl PlanDraft {
    /// Promotes the draft to an immutable submission.
    ///
    /// # Errors
    ///
    /// Returns [`DraftError::Missing`] when the plan, image, or duration has
    /// not been collected, and [`DraftError::DurationOutOfRange`] when the
    /// duration is zero or exceeds `max_time`.
    pub fn into_submission(self, max_time: u64) -> Result<PlanSubmission, DraftError> {
        let plan_id = self.plan_id.ok_or(DraftError::Missing("plan"))?;
        let os_id = self.os_id.ok_or(DraftError::Missing("os"))?;
        let duration_hours = self.duration_hours.ok_or(DraftError::Missing("duration"))?;
        if duration_hours == 0 || duration_hours > max_time {
            return Err(DraftError::DurationOutOfRange { max: max_time });
        }
        Ok(PlanSubmission {
            plan_id,
            os_id,
            duration_hours,
            ssh_key_id: self.ssh_key_id,
        })
    }
}

/// Converts a control-plane wall-clock timestamp into local time.
///
/// The control plane reports timestamps in UTC+1 without an offset marker.
/// Inputs that do not match [`TIMESTAMP_FORMAT`] are returned unchanged so a
/// malformed record never aborts a refresh.
#[must_use]
pub fn normalise_timestamp(raw: &str) -> String {
    let Ok(naive) = NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT) else {
        return raw.to_owned();
    };
    let Some(offset) = FixedOffset::east_opt(CONTROL_PLANE_UTC_OFFSET_SECS) else {
        return raw.to_owned();
    };
    match naive.and_local_timezone(offset).single() {
        Some(stamped) => stamped
            .with_timezone(&Local)
            .format(TIMESTAMP_FORMAT)
            .to_string(),
        None => raw.to_owned(),
    }
}

/// Converts a KiB counter to MiB, rounded to two decimal places.
#[must_use]
pub fn kib_to_mib(kib: f64) -> f64 {
    round2(kib / 1024.0)
}

/// Converts a byte counter to GiB, rounded to two decimal places.
#[must_use]
#[expect(
    clippy::cast_precision_loss,
    reason = "traffic counters stay far below 2^52 bytes"
)]
pub fn bytes_to_gib(bytes: u64) -> f64 {
    round2(bytes as f64 / (1024.0 * 1024.0 * 1024.0))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1_048_576.0, 1024.0)]
    #[case(0.0, 0.0)]
    #[case(1536.0, 1.5)]
    fn kib_to_mib_rounds_to_two_places(#[case] kib: f64, #[case] expected: f64) {
        assert!((kib_to_mib(kib) - expected).abs() < f64::EPSILON);
    }

    #[rstest]
    #[case(1_073_741_824, 1.0)]
    #[case(0, 0.0)]
    #[case(5_368_709_120, 5.0)]
    fn bytes_to_gib_rounds_to_two_places(#[case] bytes: u64, #[case] expected: f64) {
        assert!((bytes_to_gib(bytes) - expected).abs() < f64::EPSILON);
    }

    #[rstest]
    fn normalise_timestamp_passes_through_unparseable_input() {
        assert_eq!(normalise_timestamp("not a date"), "not a date");
        assert_eq!(normalise_timestamp(""), "");
    }

    #[rstest]
    fn normalise_timestamp_keeps_the_format() {
        let normalised = normalise_timestamp("2026-03-01 12:00:00");
        assert!(
            NaiveDateTime::parse_from_str(&normalised, TIMESTAMP_FORMAT).is_ok(),
            "normalised timestamp should stay parseable: {normalised}"
        );
    }

    #[rstest]
    fn credentials_render_bearer_values() {
        assert_eq!(Credentials::Token(String::from("tok")).bearer(), "tok");
        assert_eq!(
            Credentials::KeyPair {
                client_id: String::from("cid"),
                secret: String::from("sec"),
            }
            .bearer(),
            "cid:sec"
        );
    }

    #[rstest]
    fn permissions_filter_by_allow_list() {
        let restricted = Permissions {
            allow_packages: Some(vec![String::from("1"), String::from("7")]),
            max_time: 72,
        };
        assert!(restricted.permits("1"));
        assert!(!restricted.permits("2"));

        let unrestricted = Permissions {
            allow_packages: None,
            max_time: 72,
        };
        assert!(unrestricted.permits("2"));
    }

    #[rstest]
    #[case(PowerAction::Boot, "running")]
    #[case(PowerAction::Restart, "running")]
    #[case(PowerAction::Shutdown, "stopped")]
    #[case(PowerAction::Poweroff, "stopped")]
    fn power_actions_map_to_target_states(#[case] action: PowerAction, #[case] target: &str) {
        assert_eq!(action.target_state(), target);
    }

    #[rstest]
    fn draft_promotion_validates_duration_bounds() {
        let draft = PlanDraft {
            plan_id: Some(String::from("1")),
            os_id: Some(String::from("10")),
            duration_hours: Some(96),
            ssh_key_id: None,
        };
        assert_eq!(
            draft.clone().into_submission(72),
            Err(DraftError::DurationOutOfRange { max: 72 })
        );

        let submission = draft
            .clone()
            .into_submission(96)
            .expect("96 hours within a 96 hour ceiling");
        assert_eq!(submission.duration_hours, 96);

        let incomplete = PlanDraft::default();
        assert_eq!(
            incomplete.into_submission(72),
            Err(DraftError::Missing("plan"))
        );
    }

    #[rstest]
    fn telemetry_state_queries() {
        let telemetry = InstanceTelemetry {
            status: String::from("complete"),
            state: Some(TelemetryState {
                state: String::from("running"),
                ..TelemetryState::default()
            }),
        };
        assert!(telemetry.is_in_state("running"));
        assert!(!telemetry.is_in_state("stopped"));

        let empty = InstanceTelemetry::default();
        assert_eq!(empty.coarse_state(), None);
        assert!(!empty.is_in_state("running"));
    }

    #[rstest]
    fn instance_time_remaining_is_negative_after_expiry() {
        let now = Local::now();
        let instance = sample_instance(
            &(now - ChronoDuration::minutes(3))
                .format(TIMESTAMP_FORMAT)
                .to_string(),
        );
        let remaining = instance
            .time_remaining(now)
            .expect("well formed timestamp should parse");
        assert!(remaining < ChronoDuration::zero());
    }

    fn sample_instance(expiration_at: &str) -> Instance {
        Instance {
            id: String::from("99"),
            plan_id: String::from("1"),
            plan: String::from("starter"),
            hostname: String::from("h"),
            ipv4: String::from("192.0.2.10"),
            ipv6: None,
            os: None,
            cpu: 1,
            memory_mb: 1024,
            disk_gb: 10,
            network_speed: None,
            creation_at: String::from("2026-01-01 00:00:00"),
            expiration_at: expiration_at.to_owned(),
            status: None,
        }
    }
}
