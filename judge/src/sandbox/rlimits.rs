//! Kernel resource limits applied to the child between fork and exec

use nix::sys::resource::{setrlimit, Resource};

use super::ExecutionLimits;

/// Address space granted relative to the memory limit. A refused mapping
/// looks like a crash to the judge, so this must sit well above the point
/// where the RSS watchdog kills.
const ADDRESS_SPACE_FACTOR: u64 = 4;
const ADDRESS_SPACE_SLACK: u64 = 256 * 1024 * 1024;

/// Limits to install in the child. Plain data so it can move into a
/// `pre_exec` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitPlan {
    /// RLIMIT_CPU soft limit in seconds (hard = soft + 1)
    pub cpu_secs: u64,
    /// RLIMIT_AS in bytes
    pub address_space_bytes: Option<u64>,
    /// RLIMIT_FSIZE in bytes
    pub file_size_bytes: u64,
}

impl RlimitPlan {
    pub fn from_limits(limits: &ExecutionLimits) -> Self {
        // Whole seconds, rounded up, plus one so the watchdog normally fires
        // first and SIGXCPU stays a backstop.
        let cpu_secs = u64::from(limits.cpu_time_ms).div_ceil(1000) + 1;
        let address_space_bytes = limits.address_space_limit.then(|| {
            (limits.memory_kb() * 1024)
                .saturating_mul(ADDRESS_SPACE_FACTOR)
                .saturating_add(ADDRESS_SPACE_SLACK)
        });
        Self {
            cpu_secs,
            address_space_bytes,
            file_size_bytes: limits.output_cap_bytes,
        }
    }

    /// Leave RLIMIT_AS unset, for executions whose memory a cgroup enforces
    pub fn without_address_space(self) -> Self {
        Self {
            address_space_bytes: None,
            ..self
        }
    }
}

/// Install the plan in the current process.
///
/// Runs in the forked child before exec: only async-signal-safe calls.
pub fn apply(plan: &RlimitPlan) -> std::io::Result<()> {
    setrlimit(Resource::RLIMIT_CPU, plan.cpu_secs, plan.cpu_secs + 1)?;
    setrlimit(
        Resource::RLIMIT_FSIZE,
        plan.file_size_bytes,
        plan.file_size_bytes,
    )?;
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    if let Some(bytes) = plan.address_space_bytes {
        setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
    }
    Ok(())
}
