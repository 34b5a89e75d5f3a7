use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crate::error::Result;

/// Lifecycle every hosted module implements.
///
/// Callbacks take `&self` because the orchestrator and the module's facade
/// share the same instance; implementations keep their own interior state.
pub trait Module: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Prepare for a start. Runs each time the module leaves `Stopped` or
    /// `Failure`; the reporter stays valid for the module's lifetime.
    fn initialize(&self, reporter: HealthReporter) -> Result<()> {
        let _ = reporter;
        Ok(())
    }

    fn start(&self) -> Result<()>;

    /// Tear down. Errors are logged by the orchestrator and never block
    /// the module from reaching `Stopped`.
    fn stop(&self) -> Result<()>;
}

/// Edge from the declaring module to `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub target: String,
    pub mandatory: bool,
    pub start_blocking: bool,
}

impl Dependency {
    pub fn new(target: impl Into<String>, mandatory: bool, start_blocking: bool) -> Self {
        Self { target: target.into(), mandatory, start_blocking }
    }

    /// Mandatory and start-blocking: the target must run before us.
    pub fn required(target: impl Into<String>) -> Self {
        Self::new(target, true, true)
    }

    /// Started first when possible, but its failure does not block us.
    pub fn optional(target: impl Into<String>) -> Self {
        Self::new(target, false, true)
    }

    /// Never gates our start; still cascades a stop onto us.
    pub fn soft(target: impl Into<String>) -> Self {
        Self::new(target, false, false)
    }

    pub fn is_hard(&self) -> bool {
        self.mandatory && self.start_blocking
    }
}

/// Static registration record for a module.
#[derive(Clone)]
pub struct ModuleDescriptor {
    name: String,
    dependencies: Vec<Dependency>,
    module: Arc<dyn Module>,
}

impl ModuleDescriptor {
    pub fn new<M: Module>(module: Arc<M>) -> Self {
        Self {
            name: module.name().to_string(),
            dependencies: Vec::new(),
            module,
        }
    }

    pub fn depends_on(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn requires(self, target: impl Into<String>) -> Self {
        self.depends_on(Dependency::required(target))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub(crate) fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Runtime health event pushed by a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    /// Still serving, but degraded.
    Warning(String),
    /// Degradation cleared.
    Recovered,
    /// Cannot continue; the module is stopped and maybe reincarnated.
    Fatal(String),
}

pub(crate) trait ReportSink: Send + Sync {
    fn deliver(&self, module: &str, report: Report);
}

/// Handle a module uses to push [`Report`]s to its orchestrator.
///
/// Delivery happens on a detached thread, so it is safe to report from
/// inside a start or stop callback.
#[derive(Clone)]
pub struct HealthReporter {
    module: Arc<str>,
    sink: Weak<dyn ReportSink>,
}

impl HealthReporter {
    pub(crate) fn new(module: &str, sink: Weak<dyn ReportSink>) -> Self {
        Self { module: Arc::from(module), sink }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn warning(&self, reason: impl Into<String>) -> JoinHandle<()> {
        self.push(Report::Warning(reason.into()))
    }

    pub fn recovered(&self) -> JoinHandle<()> {
        self.push(Report::Recovered)
    }

    pub fn fatal(&self, reason: impl Into<String>) -> JoinHandle<()> {
        self.push(Report::Fatal(reason.into()))
    }

    fn push(&self, report: Report) -> JoinHandle<()> {
        let module = Arc::clone(&self.module);
        let sink = self.sink.clone();
        thread::spawn(move || match sink.upgrade() {
            Some(sink) => sink.deliver(&module, report),
            None => tracing::debug!(module = %module, "report dropped: orchestrator gone"),
        })
    }
}

impl fmt::Debug for HealthReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthReporter").field("module", &self.module).finish()
    }
}
