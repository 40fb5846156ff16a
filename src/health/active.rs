//! Active health checking.
//!
//! # Responsibilities
//! - Own one session per (host, check)
//! - Schedule interval and timeout timers on the caller's task
//! - Dispatch probes through the injected transports
//! - Turn probe outcomes into health transitions
//!
//! `HealthChecker` is driven by the cluster control loop: it is not a task of
//! its own. `next_transitions` is cancel-safe so it can sit in a `select!`
//! next to membership and configuration updates.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{self, Instant};
use tracing::{debug, error, trace};

use crate::config::schema::HealthCheckConfig;
use crate::error::ConfigError;
use crate::health::interval::next_interval;
use crate::health::settings::{HealthCheckSettings, ProbePayload};
use crate::health::state::{HealthCheckSession, HealthTransition, ProbeOutcome};
use crate::health::transport::{ProbeError, ProbeResponse, ProbeTransport, ProbeTransportRegistry};
use crate::observability::metrics;
use crate::upstream::host::{HostRef, MAX_HEALTH_CHECKS};

/// Probe counters across every session of one checker.
#[derive(Debug, Default)]
pub struct HealthCheckStats {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    network_failures: AtomicU64,
    timeouts: AtomicU64,
}

impl HealthCheckStats {
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Bad responses plus network failures.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn network_failures(&self) -> u64 {
        self.network_failures.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    fn count(counter: &AtomicU64, outcome: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::record_health_check(outcome);
    }
}

type SessionKey = (String, usize);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum TimerKind {
    /// Send the next probe. Valid only while `epoch` is the session's latest.
    Interval { epoch: u64 },
    /// Give up on probe `probe_id`.
    Timeout { probe_id: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Timer {
    at: Instant,
    key: SessionKey,
    kind: TimerKind,
}

#[derive(Debug)]
struct ProbeCompletion {
    key: SessionKey,
    probe_id: u64,
    result: Result<ProbeResponse, ProbeError>,
}

#[derive(Debug)]
struct Session {
    inner: HealthCheckSession,
    epoch: u64,
    in_flight: Option<AbortHandle>,
}

#[derive(Debug)]
struct Check {
    settings: HealthCheckSettings,
    payload: Arc<ProbePayload>,
    transport: Arc<dyn ProbeTransport>,
}

pub struct HealthChecker {
    checks: Vec<Check>,
    sessions: HashMap<SessionKey, Session>,
    timers: BinaryHeap<Reverse<Timer>>,
    probes: JoinSet<ProbeCompletion>,
    next_id: u64,
    stats: Arc<HealthCheckStats>,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("checks", &self.checks.len())
            .field("sessions", &self.sessions.len())
            .field("in_flight", &self.probes.len())
            .finish()
    }
}

impl HealthChecker {
    /// Build a checker, resolving each check's transport from `registry`.
    pub fn new(checks: Vec<HealthCheckSettings>, registry: &ProbeTransportRegistry) -> Result<Self, ConfigError> {
        // Each check owns one failed and one degraded bit of the host's mask.
        if checks.len() > MAX_HEALTH_CHECKS {
            return Err(ConfigError::HealthCheck {
                index: MAX_HEALTH_CHECKS,
                reason: format!("at most {} health checks are supported", MAX_HEALTH_CHECKS),
            });
        }
        let checks = checks
            .into_iter()
            .map(|settings| {
                let transport = registry
                    .get(settings.kind())
                    .ok_or(ConfigError::MissingTransport(settings.kind()))?;
                Ok(Check {
                    payload: Arc::new(settings.payload.clone()),
                    settings,
                    transport,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self {
            checks,
            sessions: HashMap::new(),
            timers: BinaryHeap::new(),
            probes: JoinSet::new(),
            next_id: 0,
            stats: Arc::new(HealthCheckStats::default()),
        })
    }

    pub fn from_config(configs: &[HealthCheckConfig], registry: &ProbeTransportRegistry) -> Result<Self, ConfigError> {
        let settings = configs
            .iter()
            .enumerate()
            .map(|(i, c)| HealthCheckSettings::from_config(i, c))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(settings, registry)
    }

    pub fn stats(&self) -> &Arc<HealthCheckStats> {
        &self.stats
    }

    pub fn check_count(&self) -> usize {
        self.checks.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Start sessions for newly added hosts. Each host starts with every
    /// check's initial verdict and is probed immediately.
    pub fn add_hosts(&mut self, hosts: &[HostRef]) {
        self.start_sessions(hosts, true);
    }

    /// Start sessions for hosts that already carry verdicts, e.g. after the
    /// checker was rebuilt by a configuration change.
    pub fn adopt_hosts(&mut self, hosts: &[HostRef]) {
        self.start_sessions(hosts, false);
    }

    fn start_sessions(&mut self, hosts: &[HostRef], fresh: bool) {
        let now = Instant::now();
        for host in hosts {
            for (index, check) in self.checks.iter().enumerate() {
                let key = (host.address().to_string(), index);
                if let Some(old) = self.sessions.remove(&key) {
                    cancel(old);
                }
                let initial = if fresh {
                    HealthCheckSession::initial_state(&check.settings)
                } else {
                    host.check_state(index)
                };
                debug!(host = %host.address(), check = index, initial = %initial, "Health check session started");
                self.next_id += 1;
                let epoch = self.next_id;
                self.sessions.insert(
                    key.clone(),
                    Session {
                        inner: HealthCheckSession::new(host.clone(), index, initial),
                        epoch,
                        in_flight: None,
                    },
                );
                self.timers.push(Reverse(Timer {
                    at: now,
                    key,
                    kind: TimerKind::Interval { epoch },
                }));
            }
        }
    }

    /// Stop checking hosts. Outstanding probes are aborted and their
    /// completions, if any, are dropped.
    pub fn remove_hosts(&mut self, hosts: &[HostRef]) {
        for host in hosts {
            for index in 0..self.checks.len() {
                if let Some(session) = self.sessions.remove(&(host.address().to_string(), index)) {
                    debug!(host = %host.address(), check = index, "Health check session cancelled");
                    cancel(session);
                }
            }
        }
    }

    /// Wait for the next batch of health transitions.
    ///
    /// Cancel-safe: outcomes are applied synchronously once a probe
    /// completion or timer has been taken, so dropping this future between
    /// polls loses nothing. Pends forever while there is nothing to check.
    pub async fn next_transitions(&mut self) -> Vec<HealthTransition> {
        loop {
            let deadline = self.timers.peek().map(|Reverse(t)| t.at);
            tokio::select! {
                Some(joined) = self.probes.join_next(), if !self.probes.is_empty() => {
                    let transitions = match joined {
                        Ok(completion) => self.on_completion(completion),
                        Err(e) if e.is_cancelled() => Vec::new(),
                        Err(e) => {
                            error!(error = %e, "Health check probe task failed");
                            Vec::new()
                        }
                    };
                    if !transitions.is_empty() {
                        return transitions;
                    }
                }
                _ = sleep_until(deadline), if deadline.is_some() => {
                    let transitions = self.fire_due_timers();
                    if !transitions.is_empty() {
                        return transitions;
                    }
                }
                else => std::future::pending::<()>().await,
            }
        }
    }

    /// Cancel every session and wait for in-flight probes to wind down.
    pub async fn shutdown(&mut self) {
        for (_, session) in self.sessions.drain() {
            cancel(session);
        }
        self.timers.clear();
        self.probes.abort_all();
        while self.probes.join_next().await.is_some() {}
        debug!("Health checker stopped");
    }

    fn fire_due_timers(&mut self) -> Vec<HealthTransition> {
        let now = Instant::now();
        let mut transitions = Vec::new();
        while let Some(Reverse(timer)) = self.timers.peek() {
            if timer.at > now {
                break;
            }
            let Some(Reverse(timer)) = self.timers.pop() else {
                break;
            };
            match timer.kind {
                TimerKind::Interval { epoch } => self.send_probe(timer.key, epoch, now),
                TimerKind::Timeout { probe_id } => {
                    if let Some(t) = self.on_timeout(timer.key, probe_id, now) {
                        transitions.push(t);
                    }
                }
            }
        }
        transitions
    }

    fn send_probe(&mut self, key: SessionKey, epoch: u64, now: Instant) {
        let Some(session) = self.sessions.get_mut(&key) else {
            return;
        };
        if session.epoch != epoch {
            return;
        }
        let Some(check) = self.checks.get(key.1) else {
            return;
        };
        self.next_id += 1;
        let probe_id = self.next_id;
        if !session.inner.probe_sent(probe_id) {
            return;
        }

        HealthCheckStats::count(&self.stats.attempts, "attempt");
        trace!(host = %key.0, check = key.1, probe_id, "Sending health check probe");

        let transport = check.transport.clone();
        let payload = check.payload.clone();
        let task_key = key.clone();
        session.in_flight = Some(self.probes.spawn(async move {
            let result = transport.probe(&task_key.0, &payload).await;
            ProbeCompletion {
                key: task_key,
                probe_id,
                result,
            }
        }));
        self.timers.push(Reverse(Timer {
            at: now + check.settings.timeout,
            key,
            kind: TimerKind::Timeout { probe_id },
        }));
    }

    fn on_completion(&mut self, completion: ProbeCompletion) -> Vec<HealthTransition> {
        let pending = self
            .sessions
            .get(&completion.key)
            .is_some_and(|session| session.inner.is_pending(completion.probe_id));
        if !pending {
            trace!(host = %completion.key.0, check = completion.key.1, "Dropping stale health check completion");
            return Vec::new();
        }
        let outcome = match &completion.result {
            Ok(response) => {
                HealthCheckStats::count(&self.stats.successes, "success");
                ProbeOutcome::Success(*response)
            }
            Err(e) => {
                debug!(host = %completion.key.0, check = completion.key.1, error = %e, "Health check failed");
                HealthCheckStats::count(&self.stats.failures, "failure");
                if e.is_network() {
                    HealthCheckStats::count(&self.stats.network_failures, "network_failure");
                }
                ProbeOutcome::Failure
            }
        };
        self.finish(completion.key, completion.probe_id, outcome, Instant::now())
            .into_iter()
            .collect()
    }

    fn on_timeout(&mut self, key: SessionKey, probe_id: u64, now: Instant) -> Option<HealthTransition> {
        let session = self.sessions.get_mut(&key)?;
        if !session.inner.is_pending(probe_id) {
            return None;
        }
        if let Some(handle) = session.in_flight.take() {
            handle.abort();
        }
        debug!(host = %key.0, check = key.1, "Health check timed out");
        HealthCheckStats::count(&self.stats.timeouts, "timeout");
        self.finish(key, probe_id, ProbeOutcome::Timeout, now)
    }

    /// Record an outcome and arm the next interval.
    fn finish(&mut self, key: SessionKey, probe_id: u64, outcome: ProbeOutcome, now: Instant) -> Option<HealthTransition> {
        let check = self.checks.get(key.1)?;
        let session = self.sessions.get_mut(&key)?;
        if !session.inner.is_pending(probe_id) {
            return None;
        }
        let transition = session.inner.complete(probe_id, outcome, &check.settings);
        session.in_flight = None;

        let failures = session.inner.consecutive_failures();
        if failures > 0 {
            metrics::record_consecutive_failures(failures);
        }
        if let Some(t) = &transition {
            metrics::record_host_health(t.host.address(), t.host.health());
        }

        let delay = next_interval(
            &check.settings,
            session.inner.health(),
            session.inner.just_flipped(),
            session.inner.host().has_traffic(),
        );
        session.inner.clear_flipped();
        self.next_id += 1;
        session.epoch = self.next_id;
        self.timers.push(Reverse(Timer {
            at: now + delay,
            key,
            kind: TimerKind::Interval { epoch: session.epoch },
        }));
        transition
    }
}

fn cancel(mut session: Session) {
    session.inner.cancel();
    if let Some(handle) = session.in_flight.take() {
        handle.abort();
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
