//! Minimum spacing between posted replies.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::Clock;

/// Result of waiting at the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// The gate opened after waiting this long.
    Open(Duration),
    /// Shutdown was requested while waiting.
    Cancelled,
}

/// Blocks until enough time has passed since the last posted reply.
///
/// The minimum delay is a floor: jitter only ever lengthens the wait.
pub struct RateGate {
    min_delay: Duration,
    jitter_secs: f64,
    clock: Arc<dyn Clock>,
}

impl RateGate {
    pub fn new(min_delay: Duration, jitter_secs: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            min_delay,
            jitter_secs,
            clock,
        }
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    /// Time still to wait before the minimum delay is satisfied.
    ///
    /// A `last_reply` in the future (clock stepped back) counts as just now.
    pub fn remaining(&self, last_reply: Option<DateTime<Utc>>) -> Duration {
        let Some(last) = last_reply else {
            return Duration::ZERO;
        };
        let elapsed = (self.clock.now() - last).to_std().unwrap_or(Duration::ZERO);
        self.min_delay.saturating_sub(elapsed)
    }

    fn jitter(&self) -> Duration {
        if self.jitter_secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=self.jitter_secs))
    }

    /// Wait for the gate to open, or for `cancel` to fire. A shutdown that is already
    /// pending closes the gate even when no wait is needed.
    pub async fn wait(
        &self,
        last_reply: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> GateOutcome {
        if cancel.is_cancelled() {
            return GateOutcome::Cancelled;
        }
        if last_reply.is_none() {
            return GateOutcome::Open(Duration::ZERO);
        }

        let mut total = Duration::ZERO;
        let mut extra = self.jitter();
        loop {
            let wait = self.remaining(last_reply) + extra;
            if wait.is_zero() {
                break;
            }
            extra = Duration::ZERO;

            info!(wait_secs = wait.as_secs_f64(), "waiting before next reply");
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("rate gate wait cancelled");
                    return GateOutcome::Cancelled;
                }
                _ = tokio::time::sleep(wait) => {}
            }
            total += wait;
        }
        GateOutcome::Open(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use chrono::TimeZone;

    fn gate(min_secs: u64, jitter: f64) -> (RateGate, Arc<TokioClock>) {
        let clock = Arc::new(TokioClock::new(
            Utc.with_ymd_and_hms(2020, 5, 1, 8, 0, 0).unwrap(),
        ));
        (
            RateGate::new(Duration::from_secs(min_secs), jitter, clock.clone()),
            clock,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_reply_does_not_wait() {
        let (gate, _) = gate(30, 5.0);
        let cancel = CancellationToken::new();
        assert_eq!(gate.wait(None, &cancel).await, GateOutcome::Open(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_out_remaining_delay() {
        let (gate, clock) = gate(30, 0.0);
        let cancel = CancellationToken::new();
        let last = clock.now();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(gate.remaining(Some(last)), Duration::from_secs(20));

        assert_eq!(
            gate.wait(Some(last), &cancel).await,
            GateOutcome::Open(Duration::from_secs(20))
        );
        assert!(clock.now() - last >= chrono::Duration::seconds(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_never_shortens_delay() {
        let (gate, clock) = gate(30, 10.0);
        let cancel = CancellationToken::new();
        let last = clock.now();

        match gate.wait(Some(last), &cancel).await {
            GateOutcome::Open(waited) => {
                assert!(waited >= Duration::from_secs(30));
                assert!(waited <= Duration::from_secs(40));
            }
            GateOutcome::Cancelled => panic!("not cancelled"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_future_timestamp_counts_as_now() {
        let (gate, clock) = gate(30, 0.0);
        let future = clock.now() + chrono::Duration::seconds(300);
        assert_eq!(gate.remaining(Some(future)), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_shutdown_closes_gate_without_delay() {
        let (gate, clock) = gate(30, 0.0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(gate.wait(None, &cancel).await, GateOutcome::Cancelled);
        let long_ago = clock.now() - chrono::Duration::seconds(3600);
        assert_eq!(gate.wait(Some(long_ago), &cancel).await, GateOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let (gate, clock) = gate(600, 0.0);
        let cancel = CancellationToken::new();
        let last = clock.now();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        assert_eq!(gate.wait(Some(last), &cancel).await, GateOutcome::Cancelled);
        assert!(clock.now() - last < chrono::Duration::seconds(600));
    }
}
