use crate::error::Result;
use crate::health::HealthState;
use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, OpenOptions};
use std::io::{BufRead, BufReader, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

static TRANSITION_SEQ: AtomicU64 = AtomicU64::new(0);

// One observed health transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    /// Process-wide, monotonically increasing.
    pub seq: u64,
    pub ts_ms: u128,
    pub module: String,
    pub from: HealthState,
    pub to: HealthState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TransitionEvent {
    pub fn now(module: &str, from: HealthState, to: HealthState) -> Self {
        let ts_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self {
            seq: TRANSITION_SEQ.fetch_add(1, Ordering::Relaxed),
            ts_ms,
            module: module.to_string(),
            from,
            to,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

// Append-only transition journal with optional NDJSON file backing.
pub struct Vaultline {
    mem: Vec<TransitionEvent>,
    file: Option<PathBuf>,
}

impl Vaultline {
    // Open or create a journal at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        let _file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { mem: Vec::new(), file: Some(path) })
    }

    pub fn new_in_memory() -> Self {
        Self { mem: Vec::new(), file: None }
    }

    pub fn append(&mut self, event: TransitionEvent) -> Result<()> {
        if let Some(ref path) = self.file {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            let line = serde_json::to_string(&event)?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;

            if std::env::var("HYPERKERNEL_STRICT_DURABILITY").as_deref() == Ok("1") {
                file.sync_all()?;
            }
        }
        self.mem.push(event);
        Ok(())
    }

    // Last n events in memory, oldest first.
    pub fn tail(&self, n: usize) -> &[TransitionEvent] {
        let start = self.mem.len().saturating_sub(n);
        &self.mem[start..]
    }

    // Load events from disk into memory; unparseable lines are skipped.
    pub fn load_from_disk(&mut self) -> Result<usize> {
        let Some(ref path) = self.file else { return Ok(0) };
        if !path.exists() { return Ok(0) }
        let f = OpenOptions::new().read(true).open(path)?;
        let mut added = 0usize;
        for line in BufReader::new(f).lines() {
            let line = line?;
            if line.trim().is_empty() { continue; }
            match serde_json::from_str::<TransitionEvent>(&line) {
                Ok(ev) => {
                    self.mem.push(ev);
                    added += 1;
                }
                Err(e) => tracing::warn!(error = %e, "vaultline: skipping corrupt line"),
            }
        }
        Ok(added)
    }

    pub fn all(&self) -> &[TransitionEvent] {
        &self.mem
    }
}

/// Fans transition events out to subscribers and the optional journal.
#[derive(Default)]
pub(crate) struct EventStream {
    subscribers: Mutex<Vec<Sender<TransitionEvent>>>,
    journal: Option<Mutex<Vaultline>>,
}

impl EventStream {
    pub(crate) fn with_journal(journal: Vaultline) -> Self {
        Self { subscribers: Mutex::default(), journal: Some(Mutex::new(journal)) }
    }

    pub(crate) fn subscribe(&self) -> Receiver<TransitionEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).push(tx);
        rx
    }

    pub(crate) fn publish(&self, event: TransitionEvent) {
        if let Some(journal) = &self.journal {
            let mut journal = journal.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = journal.append(event.clone()) {
                tracing::warn!(error = %e, module = %event.module, "vaultline: append failed");
            }
        }
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn tail(&self, n: usize) -> Vec<TransitionEvent> {
        match &self.journal {
            Some(journal) => journal.lock().unwrap_or_else(PoisonError::into_inner).tail(n).to_vec(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let a = TransitionEvent::now("db", HealthState::READY, HealthState::STARTING);
        let b = TransitionEvent::now("db", HealthState::STARTING, HealthState::RUNNING).with_reason("ok");
        assert_eq!(a.module, "db");
        assert!(a.ts_ms > 0);
        assert!(b.seq > a.seq);
        assert_eq!(b.reason.as_deref(), Some("ok"));
    }

    #[test]
    fn test_vaultline_in_memory() {
        let mut vault = Vaultline::new_in_memory();
        assert!(vault.all().is_empty());

        let ev1 = TransitionEvent::now("a", HealthState::STOPPED, HealthState::READY);
        let ev2 = TransitionEvent::now("a", HealthState::READY, HealthState::STARTING);
        vault.append(ev1.clone()).unwrap();
        vault.append(ev2.clone()).unwrap();
        assert_eq!(vault.all(), &[ev1, ev2.clone()]);
        assert_eq!(vault.tail(1), &[ev2]);
        assert_eq!(vault.tail(5).len(), 2);
    }

    #[test]
    fn test_vaultline_file_backed() {
        let log_path = std::env::temp_dir().join(format!("vaultline_test_{}.log", std::process::id()));
        let _ = std::fs::remove_file(&log_path);

        let mut vault = Vaultline::new(&log_path).unwrap();
        let ev1 = TransitionEvent::now("a", HealthState::RUNNING, HealthState::STOPPING);
        let ev2 = TransitionEvent::now("a", HealthState::STOPPING, HealthState::STOPPED).with_reason("cascade");
        vault.append(ev1.clone()).unwrap();
        vault.append(ev2.clone()).unwrap();

        let mut reload = Vaultline::new(&log_path).unwrap();
        assert_eq!(reload.load_from_disk().unwrap(), 2);
        assert_eq!(reload.all(), &[ev1, ev2]);
        let _ = std::fs::remove_file(&log_path);
    }

    #[test]
    fn stream_drops_closed_subscribers() {
        let stream = EventStream::with_journal(Vaultline::new_in_memory());
        let live = stream.subscribe();
        drop(stream.subscribe());
        stream.publish(TransitionEvent::now("a", HealthState::STOPPED, HealthState::READY));
        assert_eq!(live.try_recv().unwrap().module, "a");
        assert_eq!(stream.subscribers.lock().unwrap().len(), 1);
        assert_eq!(stream.tail(10).len(), 1);
    }
}
