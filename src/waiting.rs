use serde::Serialize;

/// Module stopped only because `dependency` was stopped underneath it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaitingEntry {
    pub dependency: String,
    pub dependent: String,
}

/// Dependents awaiting an automatic restart once their dependency runs again.
///
/// Entries are keyed by dependent: a module knocked down by two cascades is
/// remembered once, under the first dependency that stopped it.
#[derive(Debug, Default)]
pub struct WaitingQueue {
    entries: Vec<WaitingEntry>,
}

impl WaitingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when `dependent` is already waiting.
    pub fn record(&mut self, dependency: &str, dependent: &str) -> bool {
        if self.entries.iter().any(|e| e.dependent == dependent) {
            return false;
        }
        self.entries.push(WaitingEntry {
            dependency: dependency.to_string(),
            dependent: dependent.to_string(),
        });
        true
    }

    /// Removes and returns, in record order, the dependents waiting on `dependency`.
    pub fn take_for(&mut self, dependency: &str) -> Vec<String> {
        let (taken, kept) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.dependency == dependency);
        self.entries = kept;
        taken.into_iter().map(|e: WaitingEntry| e.dependent).collect()
    }

    /// Forgets `module` both as a waiting dependent and as a dependency.
    pub fn forget(&mut self, module: &str) {
        self.entries.retain(|e| e.dependent != module && e.dependency != module);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[WaitingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_dependents_collapse() {
        let mut q = WaitingQueue::new();
        assert!(q.record("db", "api"));
        assert!(!q.record("cache", "api"));
        assert!(q.record("db", "worker"));
        assert_eq!(q.len(), 2);
        assert!(q.take_for("cache").is_empty());
        assert_eq!(q.take_for("db"), vec!["api", "worker"]);
        assert!(q.is_empty());
    }

    #[test]
    fn take_leaves_other_dependencies() {
        let mut q = WaitingQueue::new();
        q.record("db", "api");
        q.record("mail", "notify");
        assert_eq!(q.take_for("db"), vec!["api"]);
        assert_eq!(q.entries(), &[WaitingEntry { dependency: "mail".into(), dependent: "notify".into() }]);
        q.forget("mail");
        assert!(q.is_empty());
    }
}
