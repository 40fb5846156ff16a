//! Per-host health check session.
//!
//! # States
//! ```text
//! Idle ──interval──▶ ProbeSent ──success / failure / timeout──▶ Idle
//!   │                    │
//!   └──────cancel────────┴──▶ Cancelled
//! ```
//!
//! # Transitions
//! ```text
//! Unhealthy → Healthy/Degraded: consecutive successes >= healthy_threshold
//! Healthy/Degraded → Unhealthy: consecutive failures reach unhealthy_threshold
//! Healthy ↔ Degraded: on the first success reporting the other state
//! ```
//!
//! # Design Decisions
//! - One pending probe slot; a completion for any other probe id is ignored
//! - Counters survive a flip; each threshold crossing flips exactly once
//! - The session only records outcomes. Timers and I/O live in `active.rs`

use tracing::{info, warn};

use crate::health::settings::HealthCheckSettings;
use crate::health::transport::ProbeResponse;
use crate::upstream::host::{HealthState, HostRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    ProbeSent { probe_id: u64 },
    Cancelled,
}

/// Result of one probe as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success(ProbeResponse),
    Failure,
    Timeout,
}

/// A check changed its verdict for a host.
#[derive(Debug, Clone)]
pub struct HealthTransition {
    pub host: HostRef,
    pub check: usize,
    pub from: HealthState,
    pub to: HealthState,
    /// The host's aggregate health changed as a result.
    pub aggregate_changed: bool,
}

#[derive(Debug)]
pub struct HealthCheckSession {
    host: HostRef,
    check: usize,
    state: SessionState,
    consecutive_successes: u32,
    consecutive_failures: u32,
    just_flipped: bool,
}

impl HealthCheckSession {
    /// Start checking `host` for check `check`, recording `initial` as the
    /// check's verdict.
    pub fn new(host: HostRef, check: usize, initial: HealthState) -> Self {
        host.set_check_state(check, initial);
        Self {
            host,
            check,
            state: SessionState::Idle,
            consecutive_successes: 0,
            consecutive_failures: 0,
            just_flipped: false,
        }
    }

    /// Initial verdict for a newly added host.
    pub fn initial_state(settings: &HealthCheckSettings) -> HealthState {
        if settings.always_start_healthy {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        }
    }

    pub fn host(&self) -> &HostRef {
        &self.host
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The check's current verdict.
    pub fn health(&self) -> HealthState {
        self.host.check_state(self.check)
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// True until the first interval after a flip has been scheduled.
    pub fn just_flipped(&self) -> bool {
        self.just_flipped
    }

    pub fn clear_flipped(&mut self) {
        self.just_flipped = false;
    }

    /// Mark a probe as in flight. Returns false unless the session is idle.
    pub fn probe_sent(&mut self, probe_id: u64) -> bool {
        if self.state != SessionState::Idle {
            return false;
        }
        self.state = SessionState::ProbeSent { probe_id };
        true
    }

    pub fn is_pending(&self, probe_id: u64) -> bool {
        self.state == SessionState::ProbeSent { probe_id }
    }

    pub fn cancel(&mut self) {
        self.state = SessionState::Cancelled;
    }

    /// Apply the outcome of probe `probe_id`. Stale or cancelled probes are
    /// ignored. Returns the verdict change, if any.
    pub fn complete(
        &mut self,
        probe_id: u64,
        outcome: ProbeOutcome,
        settings: &HealthCheckSettings,
    ) -> Option<HealthTransition> {
        if !self.is_pending(probe_id) {
            return None;
        }
        self.state = SessionState::Idle;

        let current = self.health();
        let next = match outcome {
            ProbeOutcome::Success(response) => {
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                self.consecutive_failures = 0;
                let reported = match response {
                    ProbeResponse::Healthy => HealthState::Healthy,
                    ProbeResponse::Degraded => HealthState::Degraded,
                };
                match current {
                    HealthState::Unhealthy if self.consecutive_successes >= settings.healthy_threshold => {
                        Some(reported)
                    }
                    HealthState::Unhealthy => None,
                    state if state != reported => Some(reported),
                    _ => None,
                }
            }
            ProbeOutcome::Failure | ProbeOutcome::Timeout => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.consecutive_successes = 0;
                if current != HealthState::Unhealthy
                    && self.consecutive_failures >= settings.unhealthy_threshold
                {
                    Some(HealthState::Unhealthy)
                } else {
                    None
                }
            }
        }?;

        let aggregate_changed = self.host.set_check_state(self.check, next);
        self.just_flipped = true;
        match next {
            HealthState::Unhealthy => warn!(
                host = %self.host.address(),
                check = self.check,
                failures = self.consecutive_failures,
                "Host marked unhealthy"
            ),
            _ => info!(
                host = %self.host.address(),
                check = self.check,
                state = %next,
                "Host marked {}", next
            ),
        }

        Some(HealthTransition {
            host: self.host.clone(),
            check: self.check,
            from: current,
            to: next,
            aggregate_changed,
        })
    }
}
