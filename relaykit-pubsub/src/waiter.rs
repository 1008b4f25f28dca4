//! Bounded wait over an asynchronous connection attempt
//!
//! `Waiter::pair` hands out two halves joined by two one-shot channels: the
//! outcome channel (attempt -> waiter) and the abort channel (waiter ->
//! attempt). Both halves are consumed by their final operation, so each
//! channel carries at most one value.

use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::debug;

use crate::server::ConnectionState;

/// Handle returned by `PubSubServer::connect`
#[derive(Debug)]
pub struct Waiter {
    outcome: oneshot::Receiver<bool>,
    abort: oneshot::Sender<()>,
}

/// Background half of a connection attempt
#[derive(Debug)]
pub struct ConnectAttempt {
    outcome: oneshot::Sender<bool>,
    abort: oneshot::Receiver<()>,
    waiter_gone: bool,
}

impl Waiter {
    /// Create a waiter and the attempt half it observes
    #[must_use]
    pub fn pair() -> (Self, ConnectAttempt) {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (abort_tx, abort_rx) = oneshot::channel();

        (
            Self {
                outcome: outcome_rx,
                abort: abort_tx,
            },
            ConnectAttempt {
                outcome: outcome_tx,
                abort: abort_rx,
                waiter_gone: false,
            },
        )
    }

    /// A waiter whose outcome is already known
    #[must_use]
    pub fn resolved(outcome: bool) -> Self {
        let (waiter, attempt) = Self::pair();
        attempt.resolve(outcome);
        waiter
    }

    /// Follow an attempt owned by someone else until the state leaves
    /// `Connecting`. Aborting this waiter only stops the observation.
    #[must_use]
    pub fn observe(mut state: watch::Receiver<ConnectionState>) -> Self {
        let (waiter, mut attempt) = Self::pair();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                () = attempt.aborted() => {
                    debug!("Stopped observing in-flight connection attempt");
                    return;
                }
                changed = state.wait_for(|s| *s != ConnectionState::Connecting) => {
                    changed.map(|s| *s == ConnectionState::Connected).unwrap_or(false)
                }
            };
            attempt.resolve(outcome);
        });

        waiter
    }

    /// Wait at most `timeout` for the attempt to resolve.
    ///
    /// Returns the attempt's outcome, or `false` once the timeout elapses, in
    /// which case the attempt is told to abort.
    pub async fn wait(self, timeout: Duration) -> bool {
        let Self { outcome, abort } = self;

        match tokio::time::timeout(timeout, outcome).await {
            Ok(Ok(status)) => status,
            Ok(Err(_)) => {
                debug!("Connection attempt ended without reporting an outcome");
                false
            }
            Err(_) => {
                debug!(timeout_ms = timeout.as_millis(), "Connection wait timed out, aborting attempt");
                let _ = abort.send(());
                false
            }
        }
    }
}

impl ConnectAttempt {
    /// Report the outcome. A waiter that already gave up is ignored.
    pub fn resolve(self, connected: bool) {
        let _ = self.outcome.send(connected);
    }

    /// Completes once the waiter asks for the attempt to stop.
    ///
    /// A dropped waiter is not an abort request: the future then never
    /// completes and only an explicit disconnect stops the attempt.
    pub async fn aborted(&mut self) {
        if !self.waiter_gone {
            if (&mut self.abort).await.is_ok() {
                return;
            }
            self.waiter_gone = true;
        }
        std::future::pending::<()>().await;
    }
}
