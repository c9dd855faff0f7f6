//! Configuration loading via `ortho-config`.

use crate::cache::Snapshot;
use crate::model::{AutoConnectPolicy, Credentials, PlanDraft, PlanSubmission};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Tool configuration derived from environment variables, configuration
/// files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "EPHEMERA")]
pub struct EphemeraConfig {
    /// Base URL of the control-plane API. This value is required.
    pub api_url: String,
    /// Opaque API token. Takes precedence over the client id/secret pair
    /// when both are configured.
    pub api_token: Option<String>,
    /// Client identifier, used together with `secret`.
    pub client_id: Option<String>,
    /// Secret paired with `client_id`.
    pub secret: Option<String>,
    /// Auto-connect behaviour after create/rebuild: `off`, `reuse`, or
    /// `new`. Defaults to `off`.
    #[ortho_config(default = "off".to_owned())]
    pub auto_connect: String,
    /// SSH host alias used by the auto-connect collaborator.
    pub auto_connect_host: Option<String>,
    /// Directory holding boot scripts and the script execution log.
    pub script_dir: Option<String>,
    /// Plan identifier of the default deployment.
    pub default_plan_id: Option<String>,
    /// Operating system image identifier of the default deployment.
    pub default_os_id: Option<String>,
    /// Duration in hours of the default deployment.
    pub default_duration: Option<u64>,
    /// SSH key identifier of the default deployment.
    pub default_ssh_key: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl EphemeraConfig {
    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags
    /// in that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("ephemera")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields. Error messages
    /// include guidance on how to provide missing values via environment
    /// variables or configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.api_url,
            &FieldMetadata {
                description: "control-plane API URL",
                env_var: "EPHEMERA_API_URL",
                toml_key: "api_url",
            },
        )
    }

    /// Credentials assembled from the configured token or key pair, when
    /// either is present.
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        if let Some(token) = non_blank(self.api_token.as_deref()) {
            return Some(Credentials::Token(token));
        }
        match (
            non_blank(self.client_id.as_deref()),
            non_blank(self.secret.as_deref()),
        ) {
            (Some(client_id), Some(secret)) => Some(Credentials::KeyPair { client_id, secret }),
            _ => None,
        }
    }

    /// Parses the configured auto-connect policy.
    ///
    /// Unrecognised values disable auto-connect rather than guessing.
    #[must_use]
    pub fn auto_connect_policy(&self) -> AutoConnectPolicy {
        match self.auto_connect.trim() {
            "reuse" => AutoConnectPolicy::Reuse,
            "new" => AutoConnectPolicy::New,
            _ => AutoConnectPolicy::Off,
        }
    }

    /// The configured default deployment, when every required field is set.
    #[must_use]
    pub fn default_submission(&self) -> Option<PlanSubmission> {
        let draft = PlanDraft {
            plan_id: non_blank(self.default_plan_id.as_deref()),
            os_id: non_blank(self.default_os_id.as_deref()),
            duration_hours: self.default_duration,
            ssh_key_id: non_blank(self.default_ssh_key.as_deref()),
        };
        draft.into_submission(u64::MAX).ok()
    }

    /// Builds the initial cache snapshot seeded from configuration.
    ///
    /// This runs once at process start; the cache is in-memory only and has
    /// no teardown.
    #[must_use]
    pub fn seed_snapshot(&self) -> Snapshot {
        Snapshot {
            credentials: self.credentials(),
            default_plan: self.default_submission(),
            auto_connect: self.auto_connect_policy(),
            auto_connect_host: non_blank(self.auto_connect_host.as_deref()),
            ..Snapshot::default()
        }
    }

    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to ephemera.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|trimmed| !trimmed.is_empty())
        .map(str::to_owned)
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
