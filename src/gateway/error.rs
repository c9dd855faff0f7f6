//! Error classification for control-plane calls.

use thiserror::Error;

/// Classified failure of a gateway operation.
///
/// The classification drives remediation: [`GatewayError::Unauthenticated`]
/// prompts for re-authentication and is never auto-retried, while transport
/// failures are offered a manual retry.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum GatewayError {
    /// No credential is configured, or the control plane rejected the one
    /// presented (HTTP 401).
    #[error("authentication failed: no valid credential for the control plane")]
    Unauthenticated,
    /// The control plane answered with a non-success status other than 401.
    #[error("control plane rejected the request with status {status}")]
    Api {
        /// HTTP or envelope status code.
        status: u16,
    },
    /// The request never produced a usable response (connect, TLS, or
    /// timeout failure).
    #[error("control plane unreachable: {message}")]
    Network {
        /// Transport error description.
        message: String,
    },
    /// The response arrived but did not match the endpoint's schema.
    #[error("failed to decode {endpoint} response: {message}")]
    Decode {
        /// Endpoint whose payload failed to decode.
        endpoint: String,
        /// Decoder error message.
        message: String,
    },
}

impl GatewayError {
    /// Returns whether the failure calls for re-authentication rather than a
    /// retry.
    #[must_use]
    pub const fn is_unauthenticated(&self) -> bool {
        matches!(self, Self::Unauthenticated)
    }
}
