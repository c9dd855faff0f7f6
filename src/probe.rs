//! Shell-port reachability probing for freshly provisioned hosts.
//!
//! After a create or rebuild the control plane may report `running` well
//! before the guest actually accepts connections. The probe repeatedly
//! attempts a protocol handshake against the administrative shell port until
//! the host proves it is alive or the time budget runs out. Reaching the
//! authentication phase counts as proof of life: the probe's credentials are
//! disposable and never expected to succeed.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use uuid::Uuid;

/// Default administrative shell port.
pub const DEFAULT_SHELL_PORT: u16 = 22;

/// Total time budget for one reachability check.
const DEFAULT_TOTAL_BUDGET: Duration = Duration::from_secs(60);

/// Pause between failed attempts.
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Ceiling for a single connect-and-greet attempt.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Future returned by a handshake attempt.
pub type HandshakeFuture<'a> = Pin<Box<dyn Future<Output = HandshakeOutcome> + Send + 'a>>;

/// Result of a single handshake attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HandshakeOutcome {
    /// The handshake completed; the host is up and speaking the protocol.
    Established,
    /// The service rejected the probe's disposable credentials, which still
    /// proves it is listening and speaking the protocol.
    AuthenticationRejected,
    /// The host could not be reached (connection refused, timeout, name
    /// resolution failure, or an unexpected greeting).
    Unreachable {
        /// Short description of what failed.
        reason: String,
    },
}

impl HandshakeOutcome {
    /// Returns whether this outcome proves the host is alive.
    #[must_use]
    pub const fn proves_liveness(&self) -> bool {
        matches!(self, Self::Established | Self::AuthenticationRejected)
    }
}

/// A single connection-and-handshake attempt against `host:port`.
pub trait Handshake {
    /// Performs one attempt. Exactly one attempt is ever in flight at a
    /// time; the probe serialises calls.
    fn attempt<'a>(&'a self, host: &'a str, port: u16) -> HandshakeFuture<'a>;
}

impl<T: Handshake + ?Sized> Handshake for &T {
    fn attempt<'a>(&'a self, host: &'a str, port: u16) -> HandshakeFuture<'a> {
        (**self).attempt(host, port)
    }
}

/// Handshake implementation that connects over TCP and exchanges protocol
/// identification lines.
///
/// Receiving the server's identification banner proves the service is
/// listening and speaking the protocol, which is all the probe needs; no
/// authentication exchange is carried further.
#[derive(Clone, Debug)]
pub struct TcpHandshake {
    attempt_timeout: Duration,
}

impl TcpHandshake {
    /// Creates a handshake with the default per-attempt timeout.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            attempt_timeout: ATTEMPT_TIMEOUT,
        }
    }

    /// Overrides the per-attempt timeout. Primarily used by tests.
    #[must_use]
    pub const fn with_attempt_timeout(mut self, value: Duration) -> Self {
        self.attempt_timeout = value;
        self
    }

    async fn exchange(host: &str, port: u16) -> HandshakeOutcome {
        let mut stream = match TcpStream::connect((host, port)).await {
            Ok(stream) => stream,
            Err(err) => {
                return HandshakeOutcome::Unreachable {
                    reason: err.to_string(),
                };
            }
        };

        // Identify with a disposable client version string; the remote end
        // answers with its own identification line before anything else.
        let ident = format!("SSH-2.0-ephemera_probe_{}\r\n", Uuid::new_v4().simple());
        if let Err(err) = stream.write_all(ident.as_bytes()).await {
            return HandshakeOutcome::Unreachable {
                reason: err.to_string(),
            };
        }

        let mut greeting = [0_u8; 256];
        match stream.read(&mut greeting).await {
            Ok(0) => HandshakeOutcome::Unreachable {
                reason: String::from("connection closed before a greeting"),
            },
            Ok(read) => {
                if greeting[..read].starts_with(b"SSH-") {
                    HandshakeOutcome::Established
                } else {
                    HandshakeOutcome::Unreachable {
                        reason: String::from("unexpected protocol greeting"),
                    }
                }
            }
            Err(err) => HandshakeOutcome::Unreachable {
                reason: err.to_string(),
            },
        }
    }
}

impl Default for TcpHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake for TcpHandshake {
    fn attempt<'a>(&'a self, host: &'a str, port: u16) -> HandshakeFuture<'a> {
        Box::pin(async move {
            match timeout(self.attempt_timeout, Self::exchange(host, port)).await {
                Ok(outcome) => outcome,
                Err(_) => HandshakeOutcome::Unreachable {
                    reason: String::from("attempt timed out"),
                },
            }
        })
    }
}

/// Bounded-budget reachability check.
#[derive(Clone, Debug)]
pub struct ReachabilityProbe<H> {
    handshake: H,
    total_budget: Duration,
    retry_interval: Duration,
}

impl ReachabilityProbe<TcpHandshake> {
    /// Creates a probe using the TCP handshake and default budget.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_handshake(TcpHandshake::new())
    }
}

impl Default for ReachabilityProbe<TcpHandshake> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Handshake> ReachabilityProbe<H> {
    /// Creates a probe over a custom handshake implementation.
    #[must_use]
    pub const fn with_handshake(handshake: H) -> Self {
        Self {
            handshake,
            total_budget: DEFAULT_TOTAL_BUDGET,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Overrides the total time budget. Primarily used by tests.
    #[must_use]
    pub const fn with_total_budget(mut self, value: Duration) -> Self {
        self.total_budget = value;
        self
    }

    /// Overrides the retry interval. Primarily used by tests.
    #[must_use]
    pub const fn with_retry_interval(mut self, value: Duration) -> Self {
        self.retry_interval = value;
        self
    }

    /// Determines whether `host:port` becomes reachable within the budget.
    ///
    /// Attempts run strictly one at a time. A failed attempt is retried
    /// after the fixed interval, but only while the remaining budget still
    /// exceeds one full interval; otherwise the probe resolves `false`.
    pub async fn wait_for_reachable(&self, host: &str, port: u16) -> bool {
        let started = Instant::now();
        loop {
            let outcome = self.handshake.attempt(host, port).await;
            if outcome.proves_liveness() {
                return true;
            }
            if let HandshakeOutcome::Unreachable { reason } = &outcome {
                tracing::debug!(host, port, %reason, "reachability attempt failed");
            }

            let remaining = self.total_budget.saturating_sub(started.elapsed());
            if remaining <= self.retry_interval {
                tracing::debug!(host, port, "reachability budget exhausted");
                return false;
            }
            sleep(self.retry_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Handshake double that replays scripted outcomes, then a fallback.
    struct ScriptedHandshake {
        outcomes: Mutex<VecDeque<HandshakeOutcome>>,
        fallback: HandshakeOutcome,
        attempts: AtomicUsize,
    }

    impl ScriptedHandshake {
        fn new(outcomes: Vec<HandshakeOutcome>, fallback: HandshakeOutcome) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                fallback,
                attempts: AtomicUsize::new(0),
            }
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl Handshake for ScriptedHandshake {
        fn attempt<'a>(&'a self, _host: &'a str, _port: u16) -> HandshakeFuture<'a> {
            Box::pin(async move {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                self.outcomes
                    .lock()
                    .map(|mut queue| queue.pop_front())
                    .unwrap_or(None)
                    .unwrap_or_else(|| self.fallback.clone())
            })
        }
    }

    fn refused() -> HandshakeOutcome {
        HandshakeOutcome::Unreachable {
            reason: String::from("connection refused"),
        }
    }

    fn probe(
        handshake: ScriptedHandshake,
        budget_ms: u64,
        interval_ms: u64,
    ) -> ReachabilityProbe<ScriptedHandshake> {
        ReachabilityProbe::with_handshake(handshake)
            .with_total_budget(Duration::from_millis(budget_ms))
            .with_retry_interval(Duration::from_millis(interval_ms))
    }

    #[tokio::test]
    async fn authentication_rejection_counts_as_reachable() {
        let probe = probe(
            ScriptedHandshake::new(
                vec![HandshakeOutcome::AuthenticationRejected],
                refused(),
            ),
            60,
            2,
        );
        assert!(probe.wait_for_reachable("host", DEFAULT_SHELL_PORT).await);
        assert_eq!(probe.handshake.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_third_attempt_resolves_true() {
        let probe = probe(
            ScriptedHandshake::new(
                vec![refused(), refused(), HandshakeOutcome::Established],
                refused(),
            ),
            600,
            2,
        );
        assert!(probe.wait_for_reachable("host", DEFAULT_SHELL_PORT).await);
        assert_eq!(probe.handshake.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_refusal_exhausts_the_budget() {
        let budget_ms = 100;
        let interval_ms = 10;
        let probe = probe(
            ScriptedHandshake::new(Vec::new(), refused()),
            budget_ms,
            interval_ms,
        );
        assert!(!probe.wait_for_reachable("host", DEFAULT_SHELL_PORT).await);

        // floor(budget / interval) attempts, give or take the final
        // undersized interval.
        let expected = usize::try_from(budget_ms / interval_ms).unwrap_or(usize::MAX);
        let attempts = probe.handshake.attempts();
        assert!(
            attempts >= expected - 1 && attempts <= expected + 1,
            "expected about {expected} attempts, made {attempts}"
        );
    }

    #[tokio::test]
    async fn budget_smaller_than_interval_allows_one_attempt() {
        let probe = probe(ScriptedHandshake::new(Vec::new(), refused()), 1, 10);
        assert!(!probe.wait_for_reachable("host", DEFAULT_SHELL_PORT).await);
        assert_eq!(probe.handshake.attempts(), 1);
    }
}
