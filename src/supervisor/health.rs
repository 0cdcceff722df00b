// =============================================================================
// Engine health — liveness, memory and restart-budget bookkeeping
// =============================================================================

use std::time::Instant;

/// Health classification for one engine child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    /// Alive but degraded (memory pressure, exhausted restart budget).
    Unhealthy,
    /// The task has exited.
    Failed,
}

/// Per-child health metrics maintained by the supervisor.
#[derive(Debug, Clone)]
pub struct EngineHealth {
    pub started_at: Instant,
    pub restart_count: u32,
    pub consecutive_failures: u32,
    pub healthy: bool,
    pub memory_usage_mb: f64,
    pub last_error: Option<String>,
}

impl EngineHealth {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            restart_count: 0,
            consecutive_failures: 0,
            healthy: true,
            memory_usage_mb: 0.0,
            last_error: None,
        }
    }
}

impl Default for EngineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a failed child is still within its restart budget.
pub fn should_restart(health: &EngineHealth, max_restart_attempts: u32) -> bool {
    health.restart_count < max_restart_attempts && health.consecutive_failures <= 5
}

/// Classify one child from observable facts.
pub fn classify(alive: bool, memory_mb: f64, memory_limit_mb: f64, restart_count: u32, max_restarts: u32) -> HealthState {
    if !alive {
        return HealthState::Failed;
    }
    if memory_mb > memory_limit_mb || restart_count >= max_restarts {
        return HealthState::Unhealthy;
    }
    HealthState::Healthy
}

/// Resident memory of this process in megabytes.
///
/// The system handle is cached: constructing one is expensive and the
/// supervisor samples every health tick.
pub fn process_memory_mb() -> f64 {
    use parking_lot::Mutex;
    use std::sync::OnceLock;
    use sysinfo::{Pid, ProcessRefreshKind, System};

    static CACHED_SYSTEM: OnceLock<Mutex<System>> = OnceLock::new();

    let sys_mutex = CACHED_SYSTEM.get_or_init(|| Mutex::new(System::new()));
    let mut sys = sys_mutex.lock();

    let pid = Pid::from_u32(std::process::id());
    sys.refresh_processes_specifics(
        sysinfo::ProcessesToUpdate::Some(&[pid]),
        ProcessRefreshKind::new().with_memory(),
    );

    sys.process(pid)
        .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
        .unwrap_or(0.0)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_budget_enforced() {
        let mut health = EngineHealth::new();
        assert!(should_restart(&health, 3));

        health.restart_count = 3;
        assert!(!should_restart(&health, 3));

        health.restart_count = 1;
        health.consecutive_failures = 6;
        assert!(!should_restart(&health, 3));
    }

    #[test]
    fn classification_ordering() {
        assert_eq!(classify(false, 0.0, 1000.0, 0, 3), HealthState::Failed);
        assert_eq!(classify(true, 2000.0, 1000.0, 0, 3), HealthState::Unhealthy);
        assert_eq!(classify(true, 100.0, 1000.0, 3, 3), HealthState::Unhealthy);
        assert_eq!(classify(true, 100.0, 1000.0, 1, 3), HealthState::Healthy);
    }

    #[test]
    fn memory_probe_returns_something() {
        // The probe must not panic; on supported platforms it reports a
        // positive RSS for the running test binary.
        let mb = process_memory_mb();
        assert!(mb >= 0.0);
    }
}
