use serde::{Deserialize, Serialize};
use std::fmt;

/// Health of a single module as four independent facets.
///
/// Only the combinations exposed through the named constructors are ever
/// produced by the orchestrator. `initializing` is transient: it is only set
/// while a transition runs under the module's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct HealthState {
    pub ready: bool,
    pub initializing: bool,
    pub failed: bool,
    pub running: bool,
}

/// Named view over the documented facet combinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    Stopped,
    Ready,
    Starting,
    Running,
    Stopping,
    Failure,
    BootFailure,
    Warning,
}

impl HealthState {
    const fn facets(ready: bool, initializing: bool, failed: bool, running: bool) -> Self {
        Self { ready, initializing, failed, running }
    }

    pub const STOPPED: Self = Self::facets(false, false, false, false);
    pub const READY: Self = Self::facets(true, false, false, false);
    pub const STARTING: Self = Self::facets(true, true, false, false);
    pub const RUNNING: Self = Self::facets(false, false, false, true);
    pub const STOPPING: Self = Self::facets(false, true, false, true);
    pub const FAILURE: Self = Self::facets(false, false, true, false);
    pub const BOOT_FAILURE: Self = Self::facets(false, true, true, false);
    pub const WARNING: Self = Self::facets(false, false, true, true);

    /// Maps the facets onto a named state, or `None` for a combination
    /// the lifecycle never produces.
    pub fn status(&self) -> Option<HealthStatus> {
        let status = match (self.ready, self.initializing, self.failed, self.running) {
            (false, false, false, false) => HealthStatus::Stopped,
            (true, false, false, false) => HealthStatus::Ready,
            (true, true, false, false) => HealthStatus::Starting,
            (false, false, false, true) => HealthStatus::Running,
            (false, true, false, true) => HealthStatus::Stopping,
            (false, false, true, false) => HealthStatus::Failure,
            (false, true, true, false) => HealthStatus::BootFailure,
            (false, false, true, true) => HealthStatus::Warning,
            _ => return None,
        };
        Some(status)
    }

    pub fn is_stopped(&self) -> bool {
        *self == Self::STOPPED
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Running or Warning. Facades open, and dependents may start, only on this.
    pub fn is_serving(&self) -> bool {
        self.running && !self.initializing
    }

    /// Running, transitioning, or both: the states a stop cascade must visit.
    pub fn is_active(&self) -> bool {
        self.running || self.initializing
    }
}

impl From<HealthStatus> for HealthState {
    fn from(status: HealthStatus) -> Self {
        match status {
            HealthStatus::Stopped => Self::STOPPED,
            HealthStatus::Ready => Self::READY,
            HealthStatus::Starting => Self::STARTING,
            HealthStatus::Running => Self::RUNNING,
            HealthStatus::Stopping => Self::STOPPING,
            HealthStatus::Failure => Self::FAILURE,
            HealthStatus::BootFailure => Self::BOOT_FAILURE,
            HealthStatus::Warning => Self::WARNING,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status() {
            Some(status) => write!(f, "{status}"),
            None => write!(
                f,
                "Unknown(ready={}, initializing={}, failed={}, running={})",
                self.ready, self.initializing, self.failed, self.running
            ),
        }
    }
}
