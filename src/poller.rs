//! Bounded polling of control-plane telemetry.
//!
//! Generic "wait until remote state satisfies a predicate" loop used after
//! create/rebuild (wait for `running`) and after power operations. Budget
//! exhaustion is not an error: the caller simply must not claim confirmed
//! success.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::gateway::GatewayError;
use crate::model::InstanceTelemetry;

/// Pause between telemetry fetches.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Maximum number of fetches per wait (roughly two minutes at the default
/// interval).
const DEFAULT_MAX_ATTEMPTS: u32 = 60;

/// Fixed wait applied before the first fetch and after the predicate is
/// satisfied, absorbing control-plane propagation lag.
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// How a wait ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PollOutcome {
    /// The predicate held within the attempt budget.
    Satisfied,
    /// The budget ran out. Not a failure, but the target condition was never
    /// confirmed.
    Exhausted,
}

impl PollOutcome {
    /// Returns whether the target condition was confirmed.
    #[must_use]
    pub const fn confirmed(self) -> bool {
        matches!(self, Self::Satisfied)
    }
}

/// Bounded telemetry polling loop.
#[derive(Clone, Debug)]
pub struct ReadinessPoller {
    interval: Duration,
    max_attempts: u32,
    settle_delay: Duration,
}

impl Default for ReadinessPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessPoller {
    /// Creates a poller with the default interval, budget, and settle delay.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    /// Overrides the poll interval. Primarily used by tests.
    #[must_use]
    pub const fn with_interval(mut self, value: Duration) -> Self {
        self.interval = value;
        self
    }

    /// Overrides the attempt budget. Primarily used by tests.
    #[must_use]
    pub const fn with_max_attempts(mut self, value: u32) -> Self {
        self.max_attempts = value;
        self
    }

    /// Overrides the settle delay. Primarily used by tests.
    #[must_use]
    pub const fn with_settle_delay(mut self, value: Duration) -> Self {
        self.settle_delay = value;
        self
    }

    /// Repeatedly fetches telemetry until `predicate` holds or the attempt
    /// budget is exhausted.
    ///
    /// A fetch error counts as an unsatisfied attempt rather than aborting
    /// the wait; transient control-plane hiccups while an instance boots are
    /// expected. The settle delay runs before the first fetch and again
    /// after the predicate is satisfied.
    pub async fn wait_until<F, Fut, P>(&self, mut fetch: F, predicate: P) -> PollOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<InstanceTelemetry, GatewayError>>,
        P: Fn(&InstanceTelemetry) -> bool,
    {
        sleep(self.settle_delay).await;
        for attempt in 1..=self.max_attempts {
            match fetch().await {
                Ok(telemetry) if predicate(&telemetry) => {
                    sleep(self.settle_delay).await;
                    return PollOutcome::Satisfied;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(attempt, error = %err, "telemetry fetch failed");
                }
            }
            if attempt < self.max_attempts {
                sleep(self.interval).await;
            }
        }
        PollOutcome::Exhausted
    }

    /// Waits until the reported lifecycle state equals `target`.
    pub async fn wait_for_state<F, Fut>(&self, fetch: F, target: &str) -> PollOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<InstanceTelemetry, GatewayError>>,
    {
        self.wait_until(fetch, |telemetry| telemetry.is_in_state(target))
            .await
    }
}
