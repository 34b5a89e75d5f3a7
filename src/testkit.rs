//! Scripted modules for lifecycle tests.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::error::Result;
use crate::module::{HealthReporter, Module, ModuleDescriptor};

/// Ordered record of callbacks across modules, e.g. `["a:start", "b:start"]`.
#[derive(Clone, Default)]
pub(crate) struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub(crate) fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Entries ending with `:{event}`, reduced to the module name.
    pub(crate) fn of(&self, event: &str) -> Vec<String> {
        let suffix = format!(":{event}");
        self.entries()
            .into_iter()
            .filter_map(|e| e.strip_suffix(&suffix).map(str::to_string))
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

pub(crate) struct Probe {
    name: String,
    log: CallLog,
    failing_starts: AtomicU32,
    failing_stops: AtomicBool,
    start_delay_ms: AtomicU32,
    stop_delay_ms: AtomicU32,
    pub(crate) starts: AtomicUsize,
    pub(crate) stops: AtomicUsize,
    pub(crate) inits: AtomicUsize,
    reporter: Mutex<Option<HealthReporter>>,
}

impl Probe {
    pub(crate) fn new(name: &str, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: log.clone(),
            failing_starts: AtomicU32::new(0),
            failing_stops: AtomicBool::new(false),
            start_delay_ms: AtomicU32::new(0),
            stop_delay_ms: AtomicU32::new(0),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            inits: AtomicUsize::new(0),
            reporter: Mutex::new(None),
        })
    }

    pub(crate) fn detached(name: &str) -> Arc<Self> {
        Self::new(name, &CallLog::default())
    }

    pub(crate) fn descriptor(self: &Arc<Self>) -> ModuleDescriptor {
        ModuleDescriptor::new(Arc::clone(self))
    }

    /// The next `n` start callbacks fail.
    pub(crate) fn fail_starts(&self, n: u32) {
        self.failing_starts.store(n, Ordering::SeqCst);
    }

    pub(crate) fn fail_stops(&self) {
        self.failing_stops.store(true, Ordering::SeqCst);
    }

    pub(crate) fn delay_starts(&self, delay: Duration) {
        self.start_delay_ms.store(delay.as_millis() as u32, Ordering::SeqCst);
    }

    pub(crate) fn delay_stops(&self, delay: Duration) {
        self.stop_delay_ms.store(delay.as_millis() as u32, Ordering::SeqCst);
    }

    pub(crate) fn reporter(&self) -> HealthReporter {
        self.reporter.lock().unwrap().clone().expect("module was never initialized")
    }

    pub(crate) fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl Module for Probe {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self, reporter: HealthReporter) -> Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        *self.reporter.lock().unwrap() = Some(reporter);
        self.log.push(format!("{}:init", self.name));
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let delay = self.start_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay.into()));
        }
        let failing = self
            .failing_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.log.push(format!("{}:start-failed", self.name));
            return Err(format!("{} refused to start", self.name).into());
        }
        self.log.push(format!("{}:start", self.name));
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let delay = self.stop_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay.into()));
        }
        self.log.push(format!("{}:stop", self.name));
        if self.failing_stops.load(Ordering::SeqCst) {
            return Err(format!("{} stop blew up", self.name).into());
        }
        Ok(())
    }
}

/// Config with inline callbacks and no reincarnation.
pub(crate) fn inline_config() -> Config {
    let mut cfg = Config::default();
    cfg.defaults.start_timeout_ms = Some(0);
    cfg.defaults.stop_timeout_ms = Some(0);
    cfg
}
