//! Resource limits for spawned servers.
//!
//! Before `mongod` replaces the child image, its soft limits are raised toward
//! the values below. When the kernel refuses a value the largest accepted one
//! is found by bisection between the current soft limit and the target.
//! Limits are never lowered.

use nix::sys::resource::{Resource, getrlimit, setrlimit};
use std::io;
use tracing::{info, warn};

/// A resource limit the server should run with.
#[derive(Debug, Clone, Copy)]
pub struct LimitSpec {
    /// Kernel resource.
    pub resource: Resource,
    /// Operator-facing description.
    pub description: &'static str,
    /// Target soft limit.
    pub desired: u64,
}

/// Limits applied to every spawned server.
pub const PROCESS_LIMITS: [LimitSpec; 2] = [
    LimitSpec {
        resource: Resource::RLIMIT_STACK,
        description: "stack size (in bytes)",
        desired: 1024 * 1024,
    },
    LimitSpec {
        resource: Resource::RLIMIT_NOFILE,
        description: "number of file descriptors",
        desired: 65536,
    },
];

/// Result of raising one limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitOutcome {
    /// Soft limit in effect afterwards.
    pub achieved: u64,
    /// Number of values tried.
    pub attempts: u32,
    /// Whether values were tried but none above the old soft limit was accepted.
    pub gave_up: bool,
}

/// Raises a soft limit as close to `desired` as the kernel allows.
///
/// `try_set` is called with candidate soft limits and returns whether the
/// value was accepted. The target is capped at `hard`. If the capped target
/// does not exceed `soft` nothing is tried. Otherwise the target is tried
/// first, then the search bisects between the largest accepted value and the
/// smallest refused one until they meet, taking at most about
/// `log2(hard - soft) + 1` attempts.
pub fn negotiate_limit<F>(mut try_set: F, desired: u64, soft: u64, hard: u64) -> LimitOutcome
where
    F: FnMut(u64) -> bool,
{
    let mut high = desired.min(hard);
    let mut low = soft;
    let mut outcome = LimitOutcome {
        achieved: soft,
        attempts: 0,
        gave_up: false,
    };

    let mut attempt = high;
    while high > low {
        outcome.attempts += 1;
        if try_set(attempt) {
            low = attempt;
            outcome.achieved = attempt;
        } else {
            high = attempt - 1;
        }
        // upper midpoint, so a gap of one still tries `high`
        attempt = low + (high - low).div_ceil(2);
    }
    outcome.gave_up = outcome.attempts > 0 && outcome.achieved == soft;
    outcome
}

/// Applies [`PROCESS_LIMITS`] to the calling process.
///
/// Runs in the forked child before exec, so it neither allocates nor logs.
/// A limit that cannot be read is left alone; raising limits never fails
/// the spawn.
pub fn apply_process_limits() -> io::Result<()> {
    for spec in &PROCESS_LIMITS {
        if let Ok((soft, hard)) = getrlimit(spec.resource) {
            negotiate_limit(
                |value| setrlimit(spec.resource, value, hard).is_ok(),
                spec.desired,
                soft,
                hard,
            );
        }
    }
    Ok(())
}

/// Logs the limits a spawned server is expected to get.
///
/// The child may raise its soft limits up to the hard ones, so the outcome
/// is predicted from this process's limits and a shortfall is warned about.
pub fn log_process_limits() {
    for spec in &PROCESS_LIMITS {
        let (soft, hard) = match getrlimit(spec.resource) {
            Ok(limits) => limits,
            Err(e) => {
                warn!(limit = spec.description, error = %e, "Unable to read process limit");
                continue;
            }
        };
        let expected = negotiate_limit(|value| value <= hard, spec.desired, soft, hard);
        if expected.achieved < spec.desired {
            warn!(
                limit = spec.description,
                soft,
                hard,
                desired = spec.desired,
                achieved = expected.achieved,
                "Unable to raise server process limit to the desired value"
            );
        } else {
            info!(
                limit = spec.description,
                soft,
                hard,
                desired = spec.desired,
                "Server process limit"
            );
        }
    }
}
