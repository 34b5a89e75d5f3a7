//! Supervision kernel for a modular runtime host.
//!
//! Modules register a [`ModuleDescriptor`] with the [`Orchestrator`], which
//! starts them in dependency order, cascades stops over everything that
//! depends on a stopping module, reincarnates fatally failed modules per
//! their [`FailurePolicy`], and gates every [`Facade`] call on live health.

pub mod axiom;
pub mod config;
pub mod error;
pub mod facade;
pub mod graph;
pub mod halodeck;
pub mod health;
pub mod module;
pub mod policy;
pub mod registry;
pub mod telemetry;
pub mod vaultline;
pub mod waiting;

#[cfg(test)]
pub(crate) mod testkit;

pub use axiom::{Orchestrator, OrchestratorBuilder};
pub use config::{load_config, Config, ModuleConfig, ModuleSettings, SharedConfig};
pub use error::{BoxError, CallbackTimeout, KernelError, Phase, Result};
pub use facade::{Facade, HealthProbe};
pub use graph::DependencyGraph;
pub use halodeck::Cli as HaloCli;
pub use health::{HealthState, HealthStatus};
pub use module::{Dependency, HealthReporter, Module, ModuleDescriptor, Report};
pub use policy::{Backoff, FailurePolicy, PolicySource};
pub use registry::Registry;
pub use telemetry::init_telemetry;
pub use vaultline::{TransitionEvent, Vaultline};
pub use waiting::{WaitingEntry, WaitingQueue};
