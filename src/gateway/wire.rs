//! Wire schemas for control-plane responses.
//!
//! Every endpoint has an explicit schema decoded at the gateway boundary;
//! a missing required field fails the decode instead of propagating an
//! absent value into the cache. Identifiers arrive as either JSON numbers
//! or strings depending on the endpoint, so they decode through
//! [`IdString`].

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

use crate::model::{
    bytes_to_gib, kib_to_mib, Instance, InstanceTelemetry, MemoryUsage, OsImage, Permissions,
    Plan, SshKey, TelemetryState, TrafficTotals,
};

/// Response envelope wrapped around every payload.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    /// Application status code; 200 on success.
    pub status: u16,
    /// Endpoint payload.
    pub data: T,
}

/// Envelope for acknowledgement-only endpoints whose `data` is absent or
/// unspecified.
#[derive(Debug, Deserialize)]
pub(crate) struct AckEnvelope {
    /// Application status code; 200 on success.
    pub status: u16,
}

/// Identifier that tolerates both numeric and string wire forms.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct IdString(pub String);

impl<'de> Deserialize<'de> for IdString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct IdVisitor;

        impl Visitor<'_> for IdVisitor {
            type Value = IdString;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a string or integer identifier")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                Ok(IdString(value.to_owned()))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(IdString(value.to_string()))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                Ok(IdString(value.to_string()))
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireInstance {
    pub id: IdString,
    pub plan_id: IdString,
    pub plan: String,
    pub hostname: String,
    pub ipv4: String,
    #[serde(default)]
    pub ipv6: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    pub cpu: u32,
    pub memory: u64,
    pub disk: u64,
    #[serde(default)]
    pub show_speed: Option<String>,
    pub creation_at: String,
    pub expiration_at: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl From<WireInstance> for Instance {
    fn from(wire: WireInstance) -> Self {
        Self {
            id: wire.id.0,
            plan_id: wire.plan_id.0,
            plan: wire.plan,
            hostname: wire.hostname,
            ipv4: wire.ipv4,
            ipv6: wire.ipv6,
            os: wire.os,
            cpu: wire.cpu,
            memory_mb: wire.memory,
            disk_gb: wire.disk,
            network_speed: wire.show_speed,
            creation_at: wire.creation_at,
            expiration_at: wire.expiration_at,
            status: wire.status,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireOsImage {
    pub id: IdString,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireOsGroup {
    pub os: Vec<WireOsImage>,
}

/// Plan catalogue entry with the grouped OS map still intact.
#[derive(Debug, Deserialize)]
pub(crate) struct WirePlan {
    pub id: IdString,
    pub name: String,
    #[serde(default)]
    pub cpu: Option<u32>,
    #[serde(default)]
    pub memory: Option<u64>,
    #[serde(default)]
    pub disk: Option<u64>,
    #[serde(default)]
    pub os: BTreeMap<String, WireOsGroup>,
}

impl From<WirePlan> for Plan {
    /// Flattens the grouped OS map into a single image list, preserving the
    /// group iteration order.
    fn from(wire: WirePlan) -> Self {
        let os = wire
            .os
            .into_values()
            .flat_map(|group| group.os)
            .map(|image| OsImage {
                id: image.id.0,
                name: image.name.unwrap_or_default(),
            })
            .collect();
        Self {
            id: wire.id.0,
            name: wire.name,
            cpu: wire.cpu,
            memory_mb: wire.memory,
            disk_gb: wire.disk,
            os,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireSshKey {
    pub id: IdString,
    pub name: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl From<WireSshKey> for SshKey {
    fn from(wire: WireSshKey) -> Self {
        Self {
            id: wire.id.0,
            name: wire.name,
            created_at: wire.created_at,
        }
    }
}

/// Permission grant with the `|`-separated package list still joined.
#[derive(Debug, Deserialize)]
pub(crate) struct WirePermissions {
    #[serde(default)]
    pub allow_packages: Option<String>,
    pub max_time: u64,
}

impl From<WirePermissions> for Permissions {
    fn from(wire: WirePermissions) -> Self {
        let allow_packages = wire.allow_packages.map(|joined| {
            joined
                .split('|')
                .filter(|part| !part.is_empty())
                .map(str::to_owned)
                .collect()
        });
        Self {
            allow_packages,
            max_time: wire.max_time,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireMemory {
    pub memtotal: String,
    pub memfree: String,
    pub memavailable: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireTraffic {
    #[serde(rename = "in")]
    pub inbound: u64,
    pub out: u64,
    pub total: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireTelemetryState {
    pub state: String,
    pub cpu: f64,
    pub memory: WireMemory,
    pub traffic: WireTraffic,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireTelemetry {
    pub status: String,
    #[serde(default)]
    pub state: Option<WireTelemetryState>,
}

impl From<WireTelemetry> for InstanceTelemetry {
    /// Normalises counters only for completed collections, mirroring the
    /// control plane's contract that partial snapshots carry no usable
    /// counters.
    fn from(wire: WireTelemetry) -> Self {
        let complete = wire.status == "complete";
        let state = wire.state.map(|raw| {
            if complete {
                TelemetryState {
                    state: raw.state,
                    cpu: raw.cpu,
                    memory: MemoryUsage {
                        total_mib: kib_to_mib(parse_counter(&raw.memory.memtotal)),
                        free_mib: kib_to_mib(parse_counter(&raw.memory.memfree)),
                        available_mib: kib_to_mib(parse_counter(&raw.memory.memavailable)),
                    },
                    traffic: TrafficTotals {
                        inbound_gib: bytes_to_gib(raw.traffic.inbound),
                        outbound_gib: bytes_to_gib(raw.traffic.out),
                        total_gib: bytes_to_gib(raw.traffic.total),
                    },
                }
            } else {
                TelemetryState {
                    state: raw.state,
                    cpu: raw.cpu,
                    memory: MemoryUsage::default(),
                    traffic: TrafficTotals::default(),
                }
            }
        });
        Self {
            status: wire.status,
            state,
        }
    }
}

fn parse_counter(raw: &str) -> f64 {
    raw.trim().parse().unwrap_or(0.0)
}

/// Deploy receipt: the full instance record plus an optional correlation id
/// for a submitted boot script.
#[derive(Debug, Deserialize)]
pub(crate) struct WireCreateReceipt {
    #[serde(flatten)]
    pub instance: WireInstance,
    #[serde(default)]
    pub command_uid: Option<String>,
}

/// Rebuild receipt: the control plane reports only the hostname (and, when a
/// boot script was submitted, its correlation id).
#[derive(Debug, Deserialize)]
pub(crate) struct WireRebuildReceipt {
    pub hostname: String,
    #[serde(default)]
    pub command_uid: Option<String>,
}
