//! Error taxonomy of the lifecycle kernel.
//!
//! Module callbacks return the boxed [`BoxError`]; the orchestrator wraps
//! those into [`KernelError::TransitionFailed`] so callers always receive a
//! typed error naming the module involved.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::health::HealthState;

/// Boxed error used by module callbacks and the ambient plumbing.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, BoxError>;

/// Which callback a failed transition was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initialize,
    Start,
    Stop,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Initialize => "initialize",
            Phase::Start => "start",
            Phase::Stop => "stop",
        })
    }
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("module '{name}' is not registered")]
    UnknownModule { name: String },

    #[error("module '{name}' is already registered")]
    DuplicateModule { name: String },

    /// Mandatory start-blocking dependencies loop back on themselves.
    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// A mandatory dependency never reached `Running`.
    #[error("module '{module}' requires '{dependency}', which is not running")]
    MissingDependency {
        module: String,
        dependency: String,
        #[source]
        source: Option<Box<KernelError>>,
    },

    /// Facade call against a module that is not running.
    #[error("module '{module}' is unavailable (state: {state})")]
    ModuleUnavailable { module: String, state: HealthState },

    #[error("module '{module}' failed during {phase}: {source}")]
    TransitionFailed {
        module: String,
        phase: Phase,
        #[source]
        source: BoxError,
    },

    #[error("module '{name}' must be stopped first (state: {state})")]
    NotStopped { name: String, state: HealthState },
}

impl KernelError {
    pub(crate) fn unknown(name: &str) -> Self {
        KernelError::UnknownModule { name: name.to_string() }
    }

    /// Name of the module the error is about.
    pub fn module(&self) -> Option<&str> {
        match self {
            KernelError::UnknownModule { name }
            | KernelError::DuplicateModule { name }
            | KernelError::NotStopped { name, .. } => Some(name),
            KernelError::MissingDependency { module, .. }
            | KernelError::ModuleUnavailable { module, .. }
            | KernelError::TransitionFailed { module, .. } => Some(module),
            KernelError::CyclicDependency { .. } => None,
        }
    }
}

/// A start or stop callback that did not return in time.
#[derive(Debug, Error)]
#[error("callback did not return within {0:?}")]
pub struct CallbackTimeout(pub Duration);

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn missing_dependency_keeps_cause() {
        let cause = KernelError::TransitionFailed {
            module: "db".into(),
            phase: Phase::Start,
            source: "connection refused".into(),
        };
        let err = KernelError::MissingDependency {
            module: "api".into(),
            dependency: "db".into(),
            source: Some(Box::new(cause)),
        };
        assert_eq!(err.to_string(), "module 'api' requires 'db', which is not running");
        let source = err.source().unwrap();
        assert!(source.to_string().contains("connection refused"));
        assert_eq!(err.module(), Some("api"));
    }

    #[test]
    fn cycle_renders_path() {
        let err = KernelError::CyclicDependency { cycle: vec!["a".into(), "b".into(), "a".into()] };
        assert_eq!(err.to_string(), "cyclic dependency: a -> b -> a");
        assert_eq!(err.module(), None);
    }

    #[test]
    fn unavailable_names_state() {
        let err = KernelError::ModuleUnavailable { module: "mail".into(), state: HealthState::STOPPING };
        assert_eq!(err.to_string(), "module 'mail' is unavailable (state: Stopping)");
    }
}
