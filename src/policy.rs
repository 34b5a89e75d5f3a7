//! Failure policy: whether a module that failed fatally is reincarnated.
//!
//! Policies are looked up through [`PolicySource`] on every decision so a
//! live configuration change applies to the very next failure.

use std::time::Duration;

use crate::config::{Config, ModuleSettings, SharedConfig};

/// Reincarnation delay: `first × factor^attempt`, clamped to `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub first: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailurePolicy {
    pub reincarnate: bool,
    /// Consecutive automatic restarts allowed before giving up.
    pub max_reincarnations: u32,
    pub backoff: Backoff,
}

impl FailurePolicy {
    pub const NEVER: Self = Self {
        reincarnate: false,
        max_reincarnations: 0,
        backoff: Backoff { first: Duration::ZERO, factor: 1.0, max: Duration::ZERO },
    };

    /// Whether restart number `attempt` (0-based) is still under the limit.
    pub fn within_limit(&self, attempt: u32) -> bool {
        attempt < self.max_reincarnations
    }
}

impl From<&ModuleSettings> for FailurePolicy {
    fn from(s: &ModuleSettings) -> Self {
        Self {
            reincarnate: s.reincarnate,
            max_reincarnations: s.max_reincarnations,
            backoff: Backoff { first: s.backoff, factor: s.backoff_factor, max: s.backoff_max },
        }
    }
}

/// Source of per-module policy and timing, read on every decision.
pub trait PolicySource: Send + Sync {
    fn settings(&self, module: &str) -> ModuleSettings;

    fn failure_policy(&self, module: &str) -> FailurePolicy {
        FailurePolicy::from(&self.settings(module))
    }

    fn should_reincarnate(&self, module: &str) -> bool {
        self.failure_policy(module).reincarnate
    }
}

impl PolicySource for Config {
    fn settings(&self, module: &str) -> ModuleSettings {
        Config::settings(self, module)
    }
}

impl PolicySource for SharedConfig {
    fn settings(&self, module: &str) -> ModuleSettings {
        SharedConfig::settings(self, module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let b = Backoff { first: Duration::from_millis(100), factor: 2.0, max: Duration::from_secs(1) };
        assert_eq!(b.delay(0), Duration::from_millis(100));
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(10), Duration::from_secs(1));
    }

    #[test]
    fn policy_bounds_attempts() {
        assert!(!FailurePolicy::NEVER.within_limit(0));
        let p = FailurePolicy { reincarnate: true, max_reincarnations: 2, ..FailurePolicy::NEVER };
        assert!(p.within_limit(0));
        assert!(p.within_limit(1));
        assert!(!p.within_limit(2));
    }

    #[test]
    fn should_reincarnate_follows_live_config() {
        let shared = SharedConfig::new(Config::default());
        assert!(!shared.should_reincarnate("db"));

        let mut cfg = Config::default();
        cfg.modules.entry("db".into()).or_default().reincarnate = Some(true);
        shared.replace(cfg);
        assert!(shared.should_reincarnate("db"));
        assert!(!shared.should_reincarnate("api"));
    }
}
