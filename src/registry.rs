//! Module registry: descriptors keyed by name plus the current graph snapshot.
//!
//! The orchestrator keeps the registry behind a reader-writer lock. Reads
//! hand out `Arc` clones of slots and of the graph so no registry lock is
//! ever held across a transition.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::error::KernelError;
use crate::graph::DependencyGraph;
use crate::health::HealthState;
use crate::module::ModuleDescriptor;

/// A registered module with its health and transition lock.
pub(crate) struct ModuleSlot {
    pub(crate) descriptor: ModuleDescriptor,
    pub(crate) state: Arc<RwLock<HealthState>>,
    /// Consecutive automatic restarts since the last manual start or recovery.
    pub(crate) reincarnations: AtomicU32,
    /// Set while a fatal failure is being handled; a manual stop clears it
    /// to cancel the pending reincarnation.
    pub(crate) reincarnation_pending: AtomicBool,
    transition: Mutex<()>,
}

impl ModuleSlot {
    fn new(descriptor: ModuleDescriptor) -> Self {
        Self {
            descriptor,
            state: Arc::new(RwLock::new(HealthState::STOPPED)),
            reincarnations: AtomicU32::new(0),
            reincarnation_pending: AtomicBool::new(false),
            transition: Mutex::new(()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub(crate) fn state(&self) -> HealthState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serializes transitions of this module; hold it for the whole transition.
    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.transition.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
pub struct Registry {
    slots: BTreeMap<String, Arc<ModuleSlot>>,
    graph: Arc<DependencyGraph>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a whole boot set at once; nothing is kept on error.
    pub fn from_descriptors(descriptors: Vec<ModuleDescriptor>) -> Result<Self, KernelError> {
        let mut slots = BTreeMap::new();
        for d in descriptors {
            let name = d.name().to_string();
            if slots.contains_key(&name) {
                return Err(KernelError::DuplicateModule { name });
            }
            slots.insert(name, Arc::new(ModuleSlot::new(d)));
        }
        let graph = DependencyGraph::build(slots.values().map(|s| &s.descriptor))?;
        Ok(Self { slots, graph: Arc::new(graph) })
    }

    pub fn register(&mut self, descriptor: ModuleDescriptor) -> Result<(), KernelError> {
        let name = descriptor.name().to_string();
        if self.slots.contains_key(&name) {
            return Err(KernelError::DuplicateModule { name });
        }
        let graph = DependencyGraph::build(
            self.slots.values().map(|s| &s.descriptor).chain(std::iter::once(&descriptor)),
        )?;
        self.slots.insert(name, Arc::new(ModuleSlot::new(descriptor)));
        self.graph = Arc::new(graph);
        Ok(())
    }

    /// Removes a module that is `Stopped` or in `Failure`.
    pub fn unregister(&mut self, name: &str) -> Result<ModuleDescriptor, KernelError> {
        let state = self.resolve(name)?.state();
        if state.is_active() || state.ready {
            return Err(KernelError::NotStopped { name: name.to_string(), state });
        }
        let slot = self.slots.remove(name).ok_or_else(|| KernelError::unknown(name))?;
        let graph = DependencyGraph::build(self.slots.values().map(|s| &s.descriptor))?;
        self.graph = Arc::new(graph);
        Ok(slot.descriptor.clone())
    }

    pub(crate) fn resolve(&self, name: &str) -> Result<Arc<ModuleSlot>, KernelError> {
        self.slots.get(name).cloned().ok_or_else(|| KernelError::unknown(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    pub fn graph(&self) -> Arc<DependencyGraph> {
        Arc::clone(&self.graph)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    pub(crate) fn slots(&self) -> impl Iterator<Item = &Arc<ModuleSlot>> {
        self.slots.values()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::Probe;

    #[test]
    fn duplicate_rejected() {
        let mut reg = Registry::new();
        reg.register(Probe::detached("a").descriptor()).unwrap();
        let err = reg.register(Probe::detached("a").descriptor()).unwrap_err();
        assert!(matches!(err, KernelError::DuplicateModule { ref name } if name == "a"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn cyclic_registration_rolled_back() {
        let mut reg = Registry::new();
        reg.register(Probe::detached("a").descriptor().requires("b")).unwrap();
        let err = reg.register(Probe::detached("b").descriptor().requires("a")).unwrap_err();
        assert!(matches!(err, KernelError::CyclicDependency { .. }));
        assert!(!reg.contains("b"));
        assert!(!reg.graph().contains("b"));
    }

    #[test]
    fn boot_set_with_duplicates_fails() {
        let res = Registry::from_descriptors(vec![
            Probe::detached("a").descriptor(),
            Probe::detached("a").descriptor(),
        ]);
        assert!(matches!(res, Err(KernelError::DuplicateModule { .. })));
    }

    #[test]
    fn unregister_requires_stopped() {
        let mut reg = Registry::new();
        reg.register(Probe::detached("a").descriptor()).unwrap();
        reg.register(Probe::detached("b").descriptor().requires("a")).unwrap();
        *reg.resolve("a").unwrap().state.write().unwrap() = HealthState::RUNNING;
        assert!(matches!(reg.unregister("a"), Err(KernelError::NotStopped { .. })));
        *reg.resolve("a").unwrap().state.write().unwrap() = HealthState::READY;
        assert!(matches!(reg.unregister("a"), Err(KernelError::NotStopped { .. })));

        *reg.resolve("a").unwrap().state.write().unwrap() = HealthState::FAILURE;
        assert_eq!(reg.unregister("a").unwrap().name(), "a");
        assert!(!reg.graph().contains("a"));
        assert!(matches!(reg.unregister("a"), Err(KernelError::UnknownModule { .. })));
    }
}
