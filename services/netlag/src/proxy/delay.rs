//! Reconfigurable, cancellable timed wait.
//!
//! A [`Delay`] injects artificial latency in front of every forwarded chunk.
//! Its timeout can be changed at any time; changing it releases a wait that
//! is currently sleeping instead of letting it run to the old deadline, so
//! network conditions can be reconfigured mid-connection.
//!
//! At most one wait is outstanding per delay. Concurrent callers queue on an
//! internal gate and each sleep for the timeout current when they get in.

use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::trace;

use crate::error::{ProxyError, Result};

/// How a call to [`Delay::wait`] finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayOutcome {
    /// The timeout was zero; nothing was awaited.
    Immediate,
    /// The full timeout elapsed.
    Elapsed,
    /// The timeout was updated while sleeping.
    Preempted,
}

/// Live-updatable latency primitive.
#[derive(Debug)]
pub struct Delay {
    timeout: watch::Sender<Duration>,
    gate: Mutex<()>,
}

impl Delay {
    /// Create a delay with a zero timeout.
    pub fn new() -> Self {
        Self::with_timeout(Duration::ZERO)
    }

    /// Create a delay with the given timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let (timeout, _) = watch::channel(timeout);
        Self {
            timeout,
            gate: Mutex::new(()),
        }
    }

    /// Current timeout.
    pub fn timeout(&self) -> Duration {
        *self.timeout.borrow()
    }

    /// Replace the timeout, releasing any outstanding wait.
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout.send_replace(timeout);
    }

    /// Replace the timeout from a number of seconds.
    ///
    /// Negative, NaN and infinite values are rejected without touching the
    /// current timeout.
    pub fn set_timeout_secs(&self, secs: f64) -> Result<()> {
        self.set_timeout(duration_from_secs(secs)?);
        Ok(())
    }

    /// Whether a wait currently holds the gate.
    pub fn is_waiting(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    /// Sleep for the current timeout, or until the timeout is updated.
    ///
    /// Returns without suspending when the timeout is zero. Dropping the
    /// returned future releases the gate.
    pub async fn wait(&self) -> DelayOutcome {
        if self.timeout().is_zero() {
            return DelayOutcome::Immediate;
        }

        let _gate = self.gate.lock().await;

        let mut updates = self.timeout.subscribe();
        let timeout = *updates.borrow_and_update();
        if timeout.is_zero() {
            return DelayOutcome::Immediate;
        }

        tokio::select! {
            _ = tokio::time::sleep(timeout) => DelayOutcome::Elapsed,
            _ = updates.changed() => {
                trace!(timeout = ?timeout, "Delay preempted by timeout update");
                DelayOutcome::Preempted
            }
        }
    }
}

impl Default for Delay {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a number of seconds into a delay duration.
pub fn duration_from_secs(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|_| ProxyError::InvalidDelay { value: secs })
}
