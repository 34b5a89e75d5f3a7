//! Lifecycle orchestrator.
//!
//! Drives every module through its health states while keeping the
//! dependency ordering intact: a module never runs while a hard dependency
//! is down, and stopping a module first stops everything that depends on it.
//!
//! Each module has its own transition lock. A cascade takes those locks one
//! module at a time and fully completes each step before the next, so two
//! cascades walking the graph in different orders cannot deadlock. The
//! registry, waiting queue and event locks are only held for short reads or
//! writes and never while waiting on a module.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, Weak};
use std::thread;
use std::time::Duration;

use crate::error::{BoxError, CallbackTimeout, KernelError, Phase, Result};
use crate::facade::{Facade, HealthProbe};
use crate::graph::DependencyGraph;
use crate::health::HealthState;
use crate::module::{Dependency, HealthReporter, Module, ModuleDescriptor, Report, ReportSink};
use crate::policy::PolicySource;
use crate::registry::{ModuleSlot, Registry};
use crate::vaultline::{EventStream, TransitionEvent, Vaultline};
use crate::waiting::{WaitingEntry, WaitingQueue};

/// Owns the registry and executes every start, stop and failure transition.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Kernel>,
}

pub struct OrchestratorBuilder {
    policy: Arc<dyn PolicySource>,
    journal: Option<Vaultline>,
    descriptors: Vec<ModuleDescriptor>,
}

impl OrchestratorBuilder {
    /// Record transitions into `journal` as well as to subscribers.
    pub fn journal(mut self, journal: Vaultline) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn module(mut self, descriptor: ModuleDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Builds the dependency graph once for the whole boot set, then
    /// initializes every module so the set rests in `Ready`.
    pub fn build(self) -> std::result::Result<Orchestrator, KernelError> {
        let registry = Registry::from_descriptors(self.descriptors)?;
        let events = match self.journal {
            Some(journal) => EventStream::with_journal(journal),
            None => EventStream::default(),
        };
        let inner = Arc::new_cyclic(|me: &Weak<Kernel>| Kernel {
            me: me.clone(),
            registry: RwLock::new(registry),
            waiting: Mutex::new(WaitingQueue::new()),
            policy: self.policy,
            events,
        });
        for (name, err) in inner.initialize_all() {
            tracing::error!(module = %name, error = %err, "module failed to initialize");
        }
        tracing::info!(modules = inner.read_registry().len(), "orchestrator ready");
        Ok(Orchestrator { inner })
    }
}

impl Orchestrator {
    pub fn builder(policy: Arc<dyn PolicySource>) -> OrchestratorBuilder {
        OrchestratorBuilder { policy, journal: None, descriptors: Vec::new() }
    }

    /// Adds a module after boot and initializes it. Rejected if it closes a
    /// hard cycle; an initialization failure leaves it registered but `Stopped`.
    pub fn register(&self, descriptor: ModuleDescriptor) -> std::result::Result<(), KernelError> {
        let name = descriptor.name().to_string();
        self.inner.write_registry().register(descriptor)?;
        tracing::info!(module = %name, "module registered");
        if let Err(err) = self.inner.initialize(&name) {
            tracing::error!(module = %name, error = %err, "module failed to initialize");
        }
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> std::result::Result<(), KernelError> {
        self.inner.write_registry().unregister(name)?;
        self.inner.lock_waiting().forget(name);
        tracing::info!(module = %name, "module unregistered");
        Ok(())
    }

    /// Stopped (or Failure) -> Ready without starting. A no-op for modules
    /// that are already initialized or active.
    pub fn initialize(&self, name: &str) -> std::result::Result<(), KernelError> {
        self.inner.initialize(name)
    }

    /// Starts `name` and, first, every start-blocking dependency it declares.
    /// A manual start resets the module's reincarnation count.
    pub fn start(&self, name: &str) -> std::result::Result<(), KernelError> {
        let slot = self.inner.resolve(name)?;
        slot.reincarnations.store(0, Ordering::SeqCst);
        self.inner.start(name)?;
        slot.reincarnations.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Stops `name` after cascading the stop over its dependency branch.
    /// Cancels a reincarnation still pending from a fatal failure.
    pub fn stop(&self, name: &str) -> std::result::Result<(), KernelError> {
        self.inner.resolve(name)?.reincarnation_pending.store(false, Ordering::SeqCst);
        self.inner.stop(name, None)
    }

    /// Stops every module, dependents before dependencies.
    pub fn stop_all(&self) {
        self.inner.stop_all()
    }

    /// Boot start-up of every `autostart` module, by configured
    /// `start_order` then name. Failures are collected, not fatal.
    pub fn start_all(&self) -> Vec<(String, KernelError)> {
        self.inner.start_all()
    }

    pub fn state(&self, name: &str) -> std::result::Result<HealthState, KernelError> {
        Ok(self.inner.resolve(name)?.state())
    }

    pub fn states(&self) -> Vec<(String, HealthState)> {
        self.inner
            .read_registry()
            .slots()
            .map(|s| (s.name().to_string(), s.state()))
            .collect()
    }

    /// Pushes a runtime health report for `name`.
    pub fn report(&self, name: &str, report: Report) -> std::result::Result<(), KernelError> {
        self.inner.report(name, report)
    }

    /// Flags an external fault on a module that is not running.
    pub fn mark_failed(&self, name: &str, reason: &str) -> std::result::Result<(), KernelError> {
        let slot = self.inner.resolve(name)?;
        let _guard = slot.lock();
        let state = slot.state();
        if state.is_active() {
            return Err(KernelError::NotStopped { name: name.to_string(), state });
        }
        self.inner.set_state(&slot, HealthState::FAILURE, Some(reason));
        Ok(())
    }

    pub fn probe(&self, name: &str) -> std::result::Result<HealthProbe, KernelError> {
        let slot = self.inner.resolve(name)?;
        Ok(HealthProbe::new(slot.name(), Arc::clone(&slot.state)))
    }

    /// Wraps `inner` in a facade gated on `name`'s health.
    pub fn facade<T: ?Sized>(&self, name: &str, inner: Arc<T>) -> std::result::Result<Facade<T>, KernelError> {
        Ok(Facade::new(self.probe(name)?, inner))
    }

    pub fn graph(&self) -> Arc<DependencyGraph> {
        self.inner.graph()
    }

    pub fn dependencies(&self, name: &str) -> std::result::Result<Vec<Dependency>, KernelError> {
        self.inner.resolve(name)?;
        Ok(self.graph().dependencies(name).to_vec())
    }

    pub fn dependents(&self, name: &str) -> std::result::Result<Vec<String>, KernelError> {
        self.inner.resolve(name)?;
        Ok(self.graph().dependents(name).into_iter().map(str::to_string).collect())
    }

    pub fn waiting(&self) -> Vec<WaitingEntry> {
        self.inner.lock_waiting().entries().to_vec()
    }

    pub fn subscribe(&self) -> Receiver<TransitionEvent> {
        self.inner.events.subscribe()
    }

    /// Most recent journaled transitions; empty without a journal.
    pub fn journal_tail(&self, n: usize) -> Vec<TransitionEvent> {
        self.inner.events.tail(n)
    }

    /// Boot all modules and block until Ctrl-C, then stop everything.
    /// Returns Ok even if the Ctrl-C handler was already installed elsewhere.
    pub fn run_until_ctrlc(&self) -> Result<()> {
        for (name, err) in self.start_all() {
            tracing::error!(module = %name, error = %err, "boot start failed");
        }
        tracing::info!("runtime: started; press Ctrl-C to stop");

        let shutdown = Arc::new(AtomicBool::new(false));
        {
            let flag = shutdown.clone();
            let _ = ctrlc::set_handler(move || {
                flag.store(true, Ordering::SeqCst);
            });
        }

        while !shutdown.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(50));
        }

        tracing::info!("runtime: shutting down");
        self.stop_all();
        tracing::info!("runtime: stopped");
        Ok(())
    }
}

struct Kernel {
    me: Weak<Kernel>,
    registry: RwLock<Registry>,
    waiting: Mutex<WaitingQueue>,
    policy: Arc<dyn PolicySource>,
    events: EventStream,
}

type KResult<T> = std::result::Result<T, KernelError>;

impl Kernel {
    fn read_registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_waiting(&self) -> MutexGuard<'_, WaitingQueue> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, name: &str) -> KResult<Arc<ModuleSlot>> {
        self.read_registry().resolve(name)
    }

    fn graph(&self) -> Arc<DependencyGraph> {
        self.read_registry().graph()
    }

    fn state_of(&self, name: &str) -> Option<HealthState> {
        self.resolve(name).ok().map(|s| s.state())
    }

    /// Writes the new state and publishes the transition. Caller holds the slot lock.
    fn set_state(&self, slot: &ModuleSlot, to: HealthState, reason: Option<&str>) {
        let from = {
            let mut state = slot.state.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, to)
        };
        if from == to {
            return;
        }
        tracing::debug!(module = %slot.name(), %from, %to, "transition");
        let mut event = TransitionEvent::now(slot.name(), from, to);
        if let Some(reason) = reason {
            event = event.with_reason(reason);
        }
        self.events.publish(event);
    }

    fn reporter(&self, name: &str) -> HealthReporter {
        let sink: Weak<dyn ReportSink> = self.me.clone();
        HealthReporter::new(name, sink)
    }

    fn initialize(&self, name: &str) -> KResult<()> {
        let slot = self.resolve(name)?;
        let _guard = slot.lock();
        let state = slot.state();
        if state.ready || state.is_active() {
            return Ok(());
        }
        self.initialize_locked(&slot)
    }

    fn initialize_all(&self) -> Vec<(String, KernelError)> {
        let names: Vec<String> = self.read_registry().names().map(str::to_string).collect();
        names
            .into_iter()
            .filter_map(|name| self.initialize(&name).err().map(|err| (name, err)))
            .collect()
    }

    /// Runs the initialize callback and enters `Ready`. On failure the module
    /// passes through `BootFailure` back to where it was. Caller holds the slot lock.
    fn initialize_locked(&self, slot: &ModuleSlot) -> KResult<()> {
        let name = slot.name();
        let timeout = self.policy.settings(name).start_timeout;
        let module = Arc::clone(slot.descriptor.module());
        let reporter = self.reporter(name);
        match invoke(name, Phase::Initialize, timeout, &module, move |m| m.initialize(reporter)) {
            Ok(()) => {
                self.set_state(slot, HealthState::READY, None);
                Ok(())
            }
            Err(err) => {
                let before = slot.state();
                tracing::error!(module = %name, error = %err, "initialization failed");
                self.set_state(slot, HealthState::BOOT_FAILURE, Some(&err.to_string()));
                self.set_state(slot, before, None);
                Err(err)
            }
        }
    }

    /// Backoff before automatic restart number `attempt`, or `None` once the
    /// module may not be reincarnated again.
    fn reincarnation_delay(&self, name: &str, attempt: u32) -> Option<Duration> {
        if !self.policy.should_reincarnate(name) {
            return None;
        }
        let policy = self.policy.failure_policy(name);
        policy.within_limit(attempt).then(|| policy.backoff.delay(attempt))
    }

    fn start(&self, name: &str) -> KResult<()> {
        self.start_in(name, &mut Vec::new(), 0)
    }

    /// `path` holds the modules whose start is in progress further up this
    /// recursion; optional edges may loop, so those are never re-entered.
    /// `first_attempt` is the automatic restart number a failed start counts as.
    fn start_in(&self, name: &str, path: &mut Vec<String>, first_attempt: u32) -> KResult<()> {
        let mut attempt = first_attempt;
        loop {
            path.push(name.to_string());
            let outcome = self.start_once(name, path);
            path.pop();
            let err = match outcome {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            let own_failure = matches!(&err, KernelError::TransitionFailed { module, .. } if module == name);
            let Some(delay) = own_failure.then(|| self.reincarnation_delay(name, attempt)).flatten() else {
                return Err(err);
            };
            tracing::warn!(module = %name, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %err, "reincarnating after failed start");
            thread::sleep(delay);
            attempt += 1;
            if let Ok(slot) = self.resolve(name) {
                slot.reincarnations.store(attempt, Ordering::SeqCst);
            }
        }
    }

    fn start_once(&self, name: &str, path: &mut Vec<String>) -> KResult<()> {
        let slot = self.resolve(name)?;
        if slot.state().is_running() {
            return Ok(());
        }

        let graph = self.graph();
        let mut hard = Vec::new();
        for dep in graph.dependencies(name).iter().filter(|d| d.start_blocking) {
            let outcome = match self.resolve(&dep.target) {
                Ok(dep_slot) if path.contains(&dep.target) => Ok(dep_slot),
                Ok(dep_slot) => self.start_in(&dep.target, path, 0).map(|()| dep_slot),
                Err(missing) if dep.mandatory => {
                    self.fail_stopped(&slot, &format!("dependency '{}' is not registered", dep.target));
                    return Err(self.missing(name, &dep.target, Some(missing)));
                }
                Err(missing) => Err(missing),
            };
            match outcome {
                Ok(dep_slot) if dep.mandatory => hard.push(dep_slot),
                Ok(_) => {}
                Err(err) if dep.mandatory => return Err(self.missing(name, &dep.target, Some(err))),
                Err(err) => {
                    tracing::warn!(module = %name, dependency = %dep.target, error = %err, "optional dependency unavailable");
                }
            }
        }

        {
            let _guard = slot.lock();
            let state = slot.state();
            if state.is_running() {
                return Ok(());
            }

            if !state.ready {
                self.initialize_locked(&slot)?;
            }
            let settings = self.policy.settings(name);
            let module = Arc::clone(slot.descriptor.module());
            self.set_state(&slot, HealthState::STARTING, None);

            // Checked after entering Starting so a concurrent stop of a
            // dependency either fails this check or sees us as active.
            if let Some(down) = hard.iter().find(|d| !d.state().is_serving()) {
                let reason = format!("dependency '{}' went down", down.name());
                self.set_state(&slot, HealthState::STOPPED, Some(&reason));
                return Err(self.missing(name, down.name(), None));
            }

            if let Err(err) = invoke(name, Phase::Start, settings.start_timeout, &module, |m| m.start()) {
                tracing::error!(module = %name, error = %err, "start failed; rolling back");
                self.set_state(&slot, HealthState::BOOT_FAILURE, Some(&err.to_string()));
                if let Err(cleanup) = invoke(name, Phase::Stop, settings.stop_timeout, &module, |m| m.stop()) {
                    tracing::warn!(module = %name, error = %cleanup, "cleanup after failed start also failed");
                }
                self.set_state(&slot, HealthState::STOPPED, None);
                return Err(err);
            }
            self.set_state(&slot, HealthState::RUNNING, None);
            tracing::info!(module = %name, "module running");
        }

        let waiting = self.lock_waiting().take_for(name);
        for dependent in waiting {
            tracing::info!(module = %dependent, dependency = %name, "restarting cascaded dependent");
            if let Err(err) = self.start_in(&dependent, path, 0) {
                tracing::warn!(module = %dependent, error = %err, "cascaded dependent failed to restart");
            }
        }
        Ok(())
    }

    fn missing(&self, module: &str, dependency: &str, source: Option<KernelError>) -> KernelError {
        KernelError::MissingDependency {
            module: module.to_string(),
            dependency: dependency.to_string(),
            source: source.map(Box::new),
        }
    }

    /// Stopped or Ready -> Failure for a fault that no start can fix by itself.
    fn fail_stopped(&self, slot: &ModuleSlot, reason: &str) {
        let _guard = slot.lock();
        let state = slot.state();
        if state.is_stopped() || state == HealthState::READY {
            tracing::error!(module = %slot.name(), reason, "module marked failed");
            self.set_state(slot, HealthState::FAILURE, Some(reason));
        }
    }

    fn stop(&self, name: &str, reason: Option<&str>) -> KResult<()> {
        let slot = self.resolve(name)?;
        loop {
            let state = slot.state();
            if state == HealthState::READY {
                // Initialized but never started: no start to undo.
                let _guard = slot.lock();
                if slot.state() == HealthState::READY {
                    self.set_state(&slot, HealthState::STOPPED, reason);
                }
                return Ok(());
            }
            if !state.is_active() {
                return Ok(());
            }
            self.stop_branch(name)?;

            let guard = slot.lock();
            if !slot.state().is_active() {
                return Ok(());
            }
            self.set_state(&slot, HealthState::STOPPING, reason);
            // A dependent that began starting while we cascaded is still
            // active; take it down before our own stop callback runs.
            if !self.active_branch(name).is_empty() {
                drop(guard);
                continue;
            }

            let timeout = self.policy.settings(name).stop_timeout;
            let module = Arc::clone(slot.descriptor.module());
            if let Err(err) = invoke(name, Phase::Stop, timeout, &module, |m| m.stop()) {
                tracing::warn!(module = %name, error = %err, "stop callback failed; treating module as stopped");
            }
            self.set_state(&slot, HealthState::STOPPED, None);
            tracing::info!(module = %name, "module stopped");
            return Ok(());
        }
    }

    /// Members of `name`'s dependency branch that are running or transitioning,
    /// in breadth-first order. Computed from one graph snapshot.
    fn active_branch(&self, name: &str) -> Vec<String> {
        self.graph()
            .dependency_branch(name)
            .into_iter()
            .filter(|m| self.state_of(m).is_some_and(|s| s.is_active()))
            .collect()
    }

    fn stop_branch(&self, name: &str) -> KResult<()> {
        for dependent in self.active_branch(name) {
            if !self.state_of(&dependent).is_some_and(|s| s.is_active()) {
                continue;
            }
            self.lock_waiting().record(name, &dependent);
            tracing::info!(module = %dependent, dependency = %name, "cascading stop");
            match self.stop(&dependent, None) {
                Ok(()) | Err(KernelError::UnknownModule { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn stop_all(&self) {
        for slot in self.read_registry().slots() {
            slot.reincarnation_pending.store(false, Ordering::SeqCst);
        }
        for name in self.graph().shutdown_order() {
            if let Err(err) = self.stop(&name, None) {
                tracing::warn!(module = %name, error = %err, "stop during shutdown failed");
            }
        }
        self.lock_waiting().clear();
    }

    fn start_all(&self) -> Vec<(String, KernelError)> {
        let mut plan: Vec<(i32, String)> = self
            .read_registry()
            .names()
            .filter_map(|name| {
                let settings = self.policy.settings(name);
                settings.autostart.then(|| (settings.start_order, name.to_string()))
            })
            .collect();
        plan.sort();

        let mut failed = Vec::new();
        for (_, name) in plan {
            if let Err(err) = self.start(&name) {
                tracing::error!(module = %name, error = %err, "module failed to start");
                failed.push((name, err));
            }
        }
        failed
    }

    fn report(&self, name: &str, report: Report) -> KResult<()> {
        let slot = self.resolve(name)?;
        match report {
            Report::Warning(reason) => {
                let _guard = slot.lock();
                if slot.state() == HealthState::RUNNING {
                    tracing::warn!(module = %name, reason = %reason, "module degraded");
                    self.set_state(&slot, HealthState::WARNING, Some(&reason));
                }
                Ok(())
            }
            Report::Recovered => {
                let _guard = slot.lock();
                if slot.state() == HealthState::WARNING {
                    slot.reincarnations.store(0, Ordering::SeqCst);
                    tracing::info!(module = %name, "module recovered");
                    self.set_state(&slot, HealthState::RUNNING, None);
                }
                Ok(())
            }
            Report::Fatal(reason) => self.handle_fatal(&slot, &reason),
        }
    }

    /// Funnels a fatal runtime error through the normal stop cascade, then
    /// reincarnates or parks the module in `Failure`.
    fn handle_fatal(&self, slot: &ModuleSlot, reason: &str) -> KResult<()> {
        let name = slot.name();
        if !slot.state().is_running() {
            tracing::debug!(module = %name, "fatal report for a module that is not running; ignored");
            return Ok(());
        }
        tracing::error!(module = %name, reason, "fatal module failure");
        slot.reincarnation_pending.store(true, Ordering::SeqCst);
        self.stop(name, Some(reason))?;

        let attempt = slot.reincarnations.load(Ordering::SeqCst);
        let Some(delay) = self.reincarnation_delay(name, attempt) else {
            slot.reincarnation_pending.store(false, Ordering::SeqCst);
            if attempt > 0 {
                tracing::error!(module = %name, attempts = attempt, "reincarnation limit reached");
            }
            self.fail_stopped(slot, reason);
            return Ok(());
        };
        thread::sleep(delay);
        {
            let _guard = slot.lock();
            let pending = slot.reincarnation_pending.swap(false, Ordering::SeqCst);
            if !pending || !slot.state().is_stopped() {
                tracing::info!(module = %name, "reincarnation cancelled by a later transition");
                return Ok(());
            }
        }
        slot.reincarnations.store(attempt + 1, Ordering::SeqCst);
        tracing::info!(module = %name, attempt = attempt + 1, "reincarnating after fatal failure");
        self.start_in(name, &mut Vec::new(), attempt + 1)
            .inspect_err(|err| self.fail_stopped(slot, &err.to_string()))
    }
}

impl ReportSink for Kernel {
    fn deliver(&self, module: &str, report: Report) {
        if let Err(err) = self.report(module, report) {
            tracing::warn!(module, error = %err, "failed to apply health report");
        }
    }
}

/// Runs one module callback, bounded by `timeout` when given.
///
/// With a timeout the callback runs on its own thread; if it overruns, the
/// thread is abandoned and the call counts as failed. Panics are caught and
/// reported as failures either way.
fn invoke<F>(
    name: &str,
    phase: Phase,
    timeout: Option<Duration>,
    module: &Arc<dyn Module>,
    callback: F,
) -> KResult<()>
where
    F: FnOnce(&dyn Module) -> Result<()> + Send + 'static,
{
    let failed = |source: BoxError| KernelError::TransitionFailed { module: name.to_string(), phase, source };

    let Some(timeout) = timeout else {
        return match panic::catch_unwind(AssertUnwindSafe(|| callback(&**module))) {
            Ok(res) => res.map_err(failed),
            Err(_) => Err(failed(format!("{phase} callback panicked").into())),
        };
    };

    let (tx, rx) = mpsc::channel();
    let module = Arc::clone(module);
    thread::Builder::new()
        .name(format!("{name}-{phase}"))
        .spawn(move || {
            let _ = tx.send(callback(&*module));
        })
        .map_err(|e| failed(e.into()))?;

    match rx.recv_timeout(timeout) {
        Ok(res) => res.map_err(failed),
        Err(RecvTimeoutError::Timeout) => {
            tracing::error!(module = %name, %phase, ?timeout, "callback timed out; abandoning it");
            Err(failed(Box::new(CallbackTimeout(timeout))))
        }
        Err(RecvTimeoutError::Disconnected) => Err(failed(format!("{phase} callback panicked").into())),
    }
}
