//! Graceful-shutdown protocol.
//!
//! Subsystems register as [`Participant`]s in startup order. On a
//! termination request the coordinator quiesces everyone (stop taking new
//! work), waits a bounded grace period for in-progress work to reach a
//! checkpoint-safe point, persists everyone, then releases in reverse
//! registration order so dependents let go before their dependencies.
//! Every step is best-effort: one participant failing never blocks the
//! rest, and the protocol never waits past the grace period. Crash
//! recovery reconciles whatever was left in flight on the next start.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

/// A subsystem that takes part in ordered shutdown.
///
/// All three methods are required; extending a service without wiring it
/// into shutdown is a compile error, not a runtime surprise.
pub trait Participant: Send + Sync {
    fn name(&self) -> &str;
    /// Stop accepting new work. In-progress work may finish its current
    /// step.
    fn quiesce(&self) -> Result<()>;
    /// Flush durable state.
    fn persist(&self) -> Result<()>;
    /// Free resources. Called in reverse registration order.
    fn release(&self) -> Result<()>;
}

/// Counts in-progress critical sections and lets shutdown wait for them.
#[derive(Clone, Default)]
pub struct InFlightGauge {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

/// RAII guard for one in-progress unit of work.
pub struct WorkGuard {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl InFlightGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> WorkGuard {
        let (count, _) = &*self.inner;
        *count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        WorkGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn active(&self) -> usize {
        let (count, _) = &*self.inner;
        *count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until no work is in flight or the timeout elapses. Returns
    /// whether quiescence was reached.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let (count, condvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut active = count.lock().unwrap_or_else(PoisonError::into_inner);
        while *active > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, wait) = condvar
                .wait_timeout(active, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            active = guard;
            if wait.timed_out() && *active > 0 {
                return false;
            }
        }
        true
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        let (count, condvar) = &*self.inner;
        let mut active = count.lock().unwrap_or_else(PoisonError::into_inner);
        *active = active.saturating_sub(1);
        condvar.notify_all();
    }
}

/// One participant failure during the drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantFailure {
    pub participant: String,
    pub stage: &'static str,
    pub reason: String,
}

/// What happened during a shutdown drive.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Whether in-progress work reached a checkpoint-safe point within the
    /// grace period.
    pub quiesced_in_grace: bool,
    pub failures: Vec<ParticipantFailure>,
}

/// Drives the ordered stop sequence over registered participants.
pub struct ShutdownCoordinator {
    participants: Vec<Box<dyn Participant>>,
    gauge: InFlightGauge,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(gauge: InFlightGauge, grace: Duration) -> Self {
        Self {
            participants: Vec::new(),
            gauge,
            grace,
        }
    }

    /// Register a participant. Registration order is quiesce/persist
    /// order; release runs in reverse.
    pub fn register(&mut self, participant: Box<dyn Participant>) {
        self.participants.push(participant);
    }

    /// Run the full drain sequence. Never blocks past the grace period.
    #[instrument(skip_all, fields(participants = self.participants.len()))]
    pub fn run(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        for participant in &self.participants {
            if let Err(err) = participant.quiesce() {
                warn!(participant = participant.name(), error = %err, "quiesce failed");
                report.failures.push(ParticipantFailure {
                    participant: participant.name().to_string(),
                    stage: "quiesce",
                    reason: format!("{err:#}"),
                });
            }
        }

        report.quiesced_in_grace = self.gauge.wait_idle(self.grace);
        if !report.quiesced_in_grace {
            warn!(
                grace_secs = self.grace.as_secs(),
                "grace period elapsed with work in flight; persisting anyway"
            );
        }

        for participant in &self.participants {
            if let Err(err) = participant.persist() {
                warn!(participant = participant.name(), error = %err, "persist failed");
                report.failures.push(ParticipantFailure {
                    participant: participant.name().to_string(),
                    stage: "persist",
                    reason: format!("{err:#}"),
                });
            }
        }

        for participant in self.participants.iter().rev() {
            if let Err(err) = participant.release() {
                warn!(participant = participant.name(), error = %err, "release failed");
                report.failures.push(ParticipantFailure {
                    participant: participant.name().to_string(),
                    stage: "release",
                    reason: format!("{err:#}"),
                });
            }
        }

        info!(
            quiesced = report.quiesced_in_grace,
            failures = report.failures.len(),
            "shutdown sequence finished"
        );
        report
    }
}

/// Register SIGTERM/SIGINT handlers that raise a shared flag.
///
/// The flag doubles as the run coordinator's quiesce signal: once set, no
/// new item starts, and the process drains cooperatively.
pub fn install_signal_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .context("register SIGTERM handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&flag))
        .context("register SIGINT handler")?;
    Ok(flag)
}
