//! Health check interval with jitter.

use std::time::Duration;

use rand::Rng;

use crate::health::settings::HealthCheckSettings;
use crate::upstream::host::HealthState;

/// Delay before the next probe of a session.
///
/// A host that never served a request uses `no_traffic_interval` when one is
/// set. Otherwise `just_flipped` selects the burst interval, unhealthy hosts
/// use `unhealthy_interval` and everything else the steady interval.
pub fn next_interval(settings: &HealthCheckSettings, state: HealthState, just_flipped: bool, has_traffic: bool) -> Duration {
    if let (false, Some(idle)) = (has_traffic, settings.no_traffic_interval) {
        return idle + jitter(idle, settings);
    }
    let steady = match state {
        HealthState::Unhealthy => settings.unhealthy_interval,
        HealthState::Healthy | HealthState::Degraded => settings.interval,
    };
    let base = if just_flipped {
        settings.burst_interval.unwrap_or(steady)
    } else {
        steady
    };
    base + jitter(base, settings)
}

fn jitter(base: Duration, settings: &HealthCheckSettings) -> Duration {
    let percent_ms = base.as_millis() as u64 * u64::from(settings.interval_jitter_percent) / 100;
    let fixed_ms = settings.interval_jitter.as_millis() as u64;
    let mut rng = rand::thread_rng();
    let mut jitter_ms = 0;
    if percent_ms > 0 {
        jitter_ms += rng.gen_range(0..percent_ms);
    }
    if fixed_ms > 0 {
        jitter_ms += rng.gen_range(0..fixed_ms);
    }
    Duration::from_millis(jitter_ms)
}
