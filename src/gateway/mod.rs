//! Typed client for the remote control-plane API.
//!
//! The gateway translates lifecycle intents into authenticated HTTP calls
//! and classifies raw success or failure; retry and polling policy live in
//! the orchestrator. Credentials are injected per call and never stored
//! here.

mod error;
pub(crate) mod wire;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::model::{
    Credentials, Instance, InstanceTelemetry, Permissions, Plan, PlanSubmission, PowerAction,
    SshKey,
};
use wire::{
    AckEnvelope, Envelope, WireCreateReceipt, WireInstance, WirePermissions, WirePlan,
    WireRebuildReceipt, WireSshKey, WireTelemetry,
};

pub use error::GatewayError;

/// Per-request ceiling; the control plane answers well within this.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Future returned by control-plane operations.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, GatewayError>> + Send + 'a>>;

/// Receipt returned by a successful deploy.
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisionReceipt {
    /// The freshly created instance, timestamps still on the control plane's
    /// clock.
    pub instance: Instance,
    /// Correlation id of the submitted boot script, when one was sent.
    pub command_uid: Option<String>,
}

/// Receipt returned by a successful rebuild.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RebuildReceipt {
    /// Hostname of the rebuilt instance.
    pub hostname: String,
    /// Correlation id of the submitted boot script, when one was sent.
    pub command_uid: Option<String>,
}

/// Interface implemented by the control-plane client.
///
/// Every operation takes the caller's credentials; passing `None` fails fast
/// with [`GatewayError::Unauthenticated`] before any network activity.
pub trait ControlPlane {
    /// Lists the instances owned by the authenticated principal.
    fn list_instances<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
    ) -> ApiFuture<'a, Vec<Instance>>;

    /// Lists the plan catalogue with flattened OS image lists.
    fn list_plans<'a>(&'a self, credentials: Option<&'a Credentials>)
    -> ApiFuture<'a, Vec<Plan>>;

    /// Lists the registered SSH keys.
    fn list_ssh_keys<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
    ) -> ApiFuture<'a, Vec<SshKey>>;

    /// Fetches the principal's plan permissions and renewal ceiling.
    fn permissions<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
    ) -> ApiFuture<'a, Permissions>;

    /// Fetches live telemetry for one instance.
    fn instance_telemetry<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
        instance_id: &'a str,
    ) -> ApiFuture<'a, InstanceTelemetry>;

    /// Deploys a new instance from a collected plan, optionally with a boot
    /// script (submitted base64-encoded).
    fn create_instance<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
        submission: &'a PlanSubmission,
        boot_script: Option<&'a str>,
    ) -> ApiFuture<'a, ProvisionReceipt>;

    /// Reinstalls an instance's operating system.
    fn rebuild_instance<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
        instance_id: &'a str,
        os_id: &'a str,
        ssh_key_id: Option<&'a str>,
        boot_script: Option<&'a str>,
    ) -> ApiFuture<'a, RebuildReceipt>;

    /// Destroys an instance.
    fn destroy_instance<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
        instance_id: &'a str,
    ) -> ApiFuture<'a, ()>;

    /// Extends an instance's lifetime by `hours`.
    fn renew_instance<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
        instance_id: &'a str,
        hours: u64,
    ) -> ApiFuture<'a, ()>;

    /// Requests a power transition.
    fn power_instance<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
        instance_id: &'a str,
        action: PowerAction,
    ) -> ApiFuture<'a, ()>;
}

impl<T: ControlPlane + ?Sized> ControlPlane for &T {
    fn list_instances<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
    ) -> ApiFuture<'a, Vec<Instance>> {
        (**self).list_instances(credentials)
    }

    fn list_plans<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
    ) -> ApiFuture<'a, Vec<Plan>> {
        (**self).list_plans(credentials)
    }

    fn list_ssh_keys<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
    ) -> ApiFuture<'a, Vec<SshKey>> {
        (**self).list_ssh_keys(credentials)
    }

    fn permissions<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
    ) -> ApiFuture<'a, Permissions> {
        (**self).permissions(credentials)
    }

    fn instance_telemetry<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
        instance_id: &'a str,
    ) -> ApiFuture<'a, InstanceTelemetry> {
        (**self).instance_telemetry(credentials, instance_id)
    }

    fn create_instance<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
        submission: &'a PlanSubmission,
        boot_script: Option<&'a str>,
    ) -> ApiFuture<'a, ProvisionReceipt> {
        (**self).create_instance(credentials, submission, boot_script)
    }

    fn rebuild_instance<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
        instance_id: &'a str,
        os_id: &'a str,
        ssh_key_id: Option<&'a str>,
        boot_script: Option<&'a str>,
    ) -> ApiFuture<'a, RebuildReceipt> {
        (**self).rebuild_instance(credentials, instance_id, os_id, ssh_key_id, boot_script)
    }

    fn destroy_instance<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
        instance_id: &'a str,
    ) -> ApiFuture<'a, ()> {
        (**self).destroy_instance(credentials, instance_id)
    }

    fn renew_instance<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
        instance_id: &'a str,
        hours: u64,
    ) -> ApiFuture<'a, ()> {
        (**self).renew_instance(credentials, instance_id, hours)
    }

    fn power_instance<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
        instance_id: &'a str,
        action: PowerAction,
    ) -> ApiFuture<'a, ()> {
        (**self).power_instance(credentials, instance_id, action)
    }
}

/// HTTP implementation of [`ControlPlane`].
#[derive(Clone, Debug)]
pub struct Gateway {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct IdBody<'a> {
    id: &'a str,
}

#[derive(Serialize)]
struct DeployBody<'a> {
    product_id: &'a str,
    os_id: &'a str,
    time: String,
    #[serde(rename = "sshKey", skip_serializing_if = "Option::is_none")]
    ssh_key: Option<&'a str>,
    #[serde(rename = "bootScript", skip_serializing_if = "Option::is_none")]
    boot_script: Option<String>,
}

#[derive(Serialize)]
struct RenewBody<'a> {
    id: &'a str,
    time: String,
}

#[derive(Serialize)]
struct PowerBody<'a> {
    id: &'a str,
    action: &'a str,
}

#[derive(Serialize)]
struct RebuildBody<'a> {
    id: &'a str,
    os: &'a str,
    #[serde(rename = "sshKey", skip_serializing_if = "Option::is_none")]
    ssh_key: Option<&'a str>,
    #[serde(rename = "bootScript", skip_serializing_if = "Option::is_none")]
    boot_script: Option<String>,
}

impl Gateway {
    /// Constructs a gateway for the given API base URL.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Network`] when the underlying HTTP client
    /// cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| GatewayError::Network {
                message: err.to_string(),
            })?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn get_payload<T: DeserializeOwned>(
        &self,
        credentials: Option<&Credentials>,
        path: &str,
    ) -> Result<T, GatewayError> {
        let credentials = credentials.ok_or(GatewayError::Unauthenticated)?;
        let response = self
            .http
            .get(self.endpoint(path))
            .bearer_auth(credentials.bearer())
            .send()
            .await
            .map_err(|err| GatewayError::Network {
                message: err.to_string(),
            })?;
        Self::decode_envelope(path, response).await
    }

    async fn post_payload<T: DeserializeOwned, B: Serialize>(
        &self,
        credentials: Option<&Credentials>,
        path: &str,
        body: &B,
    ) -> Result<T, GatewayError> {
        let response = self.post_raw(credentials, path, body).await?;
        Self::decode_envelope(path, response).await
    }

    async fn post_ack<B: Serialize>(
        &self,
        credentials: Option<&Credentials>,
        path: &str,
        body: &B,
    ) -> Result<(), GatewayError> {
        let response = self.post_raw(credentials, path, body).await?;
        Self::classify_status(response.status())?;
        let ack: AckEnvelope =
            response
                .json()
                .await
                .map_err(|err| GatewayError::Decode {
                    endpoint: path.to_owned(),
                    message: err.to_string(),
                })?;
        if ack.status != 200 {
            return Err(GatewayError::Api { status: ack.status });
        }
        Ok(())
    }

    async fn post_raw<B: Serialize>(
        &self,
        credentials: Option<&Credentials>,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, GatewayError> {
        let credentials = credentials.ok_or(GatewayError::Unauthenticated)?;
        self.http
            .post(self.endpoint(path))
            .bearer_auth(credentials.bearer())
            .json(body)
            .send()
            .await
            .map_err(|err| GatewayError::Network {
                message: err.to_string(),
            })
    }

    fn classify_status(status: reqwest::StatusCode) -> Result<(), GatewayError> {
        if status.as_u16() == 401 {
            return Err(GatewayError::Unauthenticated);
        }
        if !status.is_success() {
            return Err(GatewayError::Api {
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    async fn decode_envelope<T: DeserializeOwned>(
        endpoint: &str,
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        Self::classify_status(response.status())?;
        let envelope: Envelope<T> =
            response
                .json()
                .await
                .map_err(|err| GatewayError::Decode {
                    endpoint: endpoint.to_owned(),
                    message: err.to_string(),
                })?;
        if envelope.status != 200 {
            return Err(GatewayError::Api {
                status: envelope.status,
            });
        }
        Ok(envelope.data)
    }
}

impl ControlPlane for Gateway {
    fn list_instances<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
    ) -> ApiFuture<'a, Vec<Instance>> {
        Box::pin(async move {
            let instances: Vec<WireInstance> =
                self.get_payload(credentials, "instance").await?;
            Ok(instances.into_iter().map(Instance::from).collect())
        })
    }

    fn list_plans<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
    ) -> ApiFuture<'a, Vec<Plan>> {
        Box::pin(async move {
            let plans: Vec<WirePlan> = self.get_payload(credentials, "plan").await?;
            Ok(plans.into_iter().map(Plan::from).collect())
        })
    }

    fn list_ssh_keys<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
    ) -> ApiFuture<'a, Vec<SshKey>> {
        Box::pin(async move {
            let keys: Vec<WireSshKey> = self.get_payload(credentials, "user/ssh-key").await?;
            Ok(keys.into_iter().map(SshKey::from).collect())
        })
    }

    fn permissions<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
    ) -> ApiFuture<'a, Permissions> {
        Box::pin(async move {
            let permissions: WirePermissions =
                self.get_payload(credentials, "user/permissions").await?;
            Ok(Permissions::from(permissions))
        })
    }

    fn instance_telemetry<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
        instance_id: &'a str,
    ) -> ApiFuture<'a, InstanceTelemetry> {
        Box::pin(async move {
            let telemetry: WireTelemetry = self
                .post_payload(credentials, "instance/state", &IdBody { id: instance_id })
                .await?;
            Ok(InstanceTelemetry::from(telemetry))
        })
    }

    fn create_instance<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
        submission: &'a PlanSubmission,
        boot_script: Option<&'a str>,
    ) -> ApiFuture<'a, ProvisionReceipt> {
        Box::pin(async move {
            let body = DeployBody {
                product_id: &submission.plan_id,
                os_id: &submission.os_id,
                time: submission.duration_hours.to_string(),
                ssh_key: submission.ssh_key_id.as_deref(),
                boot_script: boot_script.map(|script| BASE64.encode(script)),
            };
            let receipt: WireCreateReceipt = self
                .post_payload(credentials, "instance/deploy", &body)
                .await?;
            Ok(ProvisionReceipt {
                instance: Instance::from(receipt.instance),
                command_uid: receipt.command_uid,
            })
        })
    }

    fn rebuild_instance<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
        instance_id: &'a str,
        os_id: &'a str,
        ssh_key_id: Option<&'a str>,
        boot_script: Option<&'a str>,
    ) -> ApiFuture<'a, RebuildReceipt> {
        Box::pin(async move {
            let body = RebuildBody {
                id: instance_id,
                os: os_id,
                ssh_key: ssh_key_id,
                boot_script: boot_script.map(|script| BASE64.encode(script)),
            };
            let receipt: WireRebuildReceipt = self
                .post_payload(credentials, "instance/rebuild", &body)
                .await?;
            Ok(RebuildReceipt {
                hostname: receipt.hostname,
                command_uid: receipt.command_uid,
            })
        })
    }

    fn destroy_instance<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
        instance_id: &'a str,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.post_ack(credentials, "instance/destroy", &IdBody { id: instance_id })
                .await
        })
    }

    fn renew_instance<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
        instance_id: &'a str,
        hours: u64,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let body = RenewBody {
                id: instance_id,
                time: hours.to_string(),
            };
            self.post_ack(credentials, "instance/renew", &body).await
        })
    }

    fn power_instance<'a>(
        &'a self,
        credentials: Option<&'a Credentials>,
        instance_id: &'a str,
        action: PowerAction,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let body = PowerBody {
                id: instance_id,
                action: action.as_str(),
            };
            self.post_ack(credentials, "instance/power", &body).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn gateway() -> Gateway {
        Gateway::new("https://control.example.test/v1/").expect("client should build")
    }

    #[tokio::test]
    async fn missing_credentials_fail_fast_without_network() {
        let gateway = gateway();
        let result = gateway.list_instances(None).await;
        assert_eq!(result, Err(GatewayError::Unauthenticated));

        let result = gateway
            .power_instance(None, "99", PowerAction::Boot)
            .await;
        assert_eq!(result, Err(GatewayError::Unauthenticated));
    }

    #[rstest]
    fn base_url_is_normalised() {
        let gateway = gateway();
        assert_eq!(
            gateway.endpoint("instance"),
            "https://control.example.test/v1/instance"
        );
    }

    #[rstest]
    fn deploy_body_omits_absent_optionals() {
        let body = DeployBody {
            product_id: "1",
            os_id: "10",
            time: String::from("4"),
            ssh_key: None,
            boot_script: None,
        };
        let rendered = serde_json::to_value(&body).expect("body should serialise");
        assert_eq!(
            rendered,
            serde_json::json!({"product_id": "1", "os_id": "10", "time": "4"})
        );
    }

    #[rstest]
    fn rebuild_body_encodes_boot_script() {
        let body = RebuildBody {
            id: "99",
            os: "10",
            ssh_key: Some("5"),
            boot_script: Some(BASE64.encode("#!/bin/sh\n")),
        };
        let rendered = serde_json::to_value(&body).expect("body should serialise");
        assert_eq!(rendered["bootScript"], "IyEvYmluL3NoCg==");
        assert_eq!(rendered["sshKey"], "5");
    }
}
