//! Health-gated access to a module's capability surface.
//!
//! A [`Facade`] wraps the module's real implementation and checks the
//! module's live health on every call. Callers may hold a facade for as long
//! as they like: once the module leaves `Running`, every new call fails with
//! [`KernelError::ModuleUnavailable`] without touching the implementation.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::KernelError;
use crate::health::HealthState;

/// Read-only view of one module's health.
#[derive(Clone)]
pub struct HealthProbe {
    module: Arc<str>,
    state: Arc<RwLock<HealthState>>,
}

impl HealthProbe {
    pub(crate) fn new(module: &str, state: Arc<RwLock<HealthState>>) -> Self {
        Self { module: Arc::from(module), state }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn state(&self) -> HealthState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails unless the module is serving right now.
    pub fn check(&self) -> Result<(), KernelError> {
        let state = self.state();
        if state.is_serving() {
            Ok(())
        } else {
            Err(KernelError::ModuleUnavailable { module: self.module.to_string(), state })
        }
    }
}

impl fmt::Debug for HealthProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthProbe")
            .field("module", &self.module)
            .field("state", &self.state())
            .finish()
    }
}

/// Guarded handle to a module implementation `T`.
pub struct Facade<T: ?Sized> {
    probe: HealthProbe,
    inner: Arc<T>,
}

impl<T: ?Sized> Clone for Facade<T> {
    fn clone(&self) -> Self {
        Self { probe: self.probe.clone(), inner: Arc::clone(&self.inner) }
    }
}

impl<T: ?Sized> Facade<T> {
    pub fn new(probe: HealthProbe, inner: Arc<T>) -> Self {
        Self { probe, inner }
    }

    pub fn module(&self) -> &str {
        self.probe.module()
    }

    pub fn is_available(&self) -> bool {
        self.probe.check().is_ok()
    }

    /// Runs `op` against the implementation if the module is running.
    pub fn call<R>(&self, op: impl FnOnce(&T) -> R) -> Result<R, KernelError> {
        self.probe.check()?;
        Ok(op(&*self.inner))
    }

    /// Like [`Facade::call`] for operations that fail on their own.
    pub fn try_call<R, E>(&self, op: impl FnOnce(&T) -> Result<R, E>) -> Result<R, E>
    where
        E: From<KernelError>,
    {
        self.probe.check()?;
        op(&*self.inner)
    }
}

impl<T: ?Sized> fmt::Debug for Facade<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Facade").field("probe", &self.probe).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);
    impl Counter {
        fn bump(&self) -> usize { self.0.fetch_add(1, Ordering::SeqCst) + 1 }
    }

    fn gated() -> (Arc<RwLock<HealthState>>, Facade<Counter>, Arc<Counter>) {
        let state = Arc::new(RwLock::new(HealthState::STOPPED));
        let inner = Arc::new(Counter::default());
        let facade = Facade::new(HealthProbe::new("counter", state.clone()), inner.clone());
        (state, facade, inner)
    }

    #[test]
    fn closed_facade_never_reaches_inner() {
        let (_, facade, inner) = gated();
        match facade.call(Counter::bump) {
            Err(KernelError::ModuleUnavailable { module, state }) => {
                assert_eq!(module, "counter");
                assert_eq!(state, HealthState::STOPPED);
            }
            other => panic!("expected unavailable, got {other:?}"),
        }
        assert_eq!(inner.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn guard_reads_state_at_call_time() {
        let (state, facade, _) = gated();
        *state.write().unwrap() = HealthState::RUNNING;
        assert_eq!(facade.call(Counter::bump).unwrap(), 1);
        *state.write().unwrap() = HealthState::WARNING;
        assert_eq!(facade.call(Counter::bump).unwrap(), 2);
        *state.write().unwrap() = HealthState::STOPPING;
        assert!(!facade.is_available());
        assert!(facade.call(Counter::bump).is_err());
    }

    #[test]
    fn try_call_converts_guard_error() {
        #[derive(Debug)]
        enum AppError { Kernel(KernelError) }
        impl From<KernelError> for AppError {
            fn from(e: KernelError) -> Self { AppError::Kernel(e) }
        }
        let (_, facade, _) = gated();
        let res: Result<usize, AppError> = facade.try_call(|c| Ok(c.bump()));
        assert!(matches!(res, Err(AppError::Kernel(KernelError::ModuleUnavailable { .. }))));
    }
}
