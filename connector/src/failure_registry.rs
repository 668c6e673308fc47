use std::collections::VecDeque;
use std::sync::Mutex;

const CAPACITY: usize = 10;

/// A thread-safe ring of the most recent send failures, used by `isAlive` to
/// decide sink health. Oldest entry is evicted once the ring is full.
pub struct FailureRegistry {
    failures: Mutex<VecDeque<String>>,
}

impl FailureRegistry {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(VecDeque::with_capacity(CAPACITY)),
        }
    }

    pub fn report(&self, error: impl std::fmt::Display) {
        let mut guard = self.failures.lock().unwrap();
        if guard.len() == CAPACITY {
            guard.pop_front();
        }
        guard.push_back(error.to_string());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.failures.lock().unwrap().iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.lock().unwrap().is_empty()
    }
}

impl Default for FailureRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_and_snapshots_in_order() {
        let registry = FailureRegistry::new();
        registry.report("a");
        registry.report("b");
        assert_eq!(registry.snapshot(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn evicts_oldest_once_full() {
        let registry = FailureRegistry::new();
        for i in 0..12 {
            registry.report(i);
        }
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), CAPACITY);
        assert_eq!(snapshot.first().unwrap(), "2");
        assert_eq!(snapshot.last().unwrap(), "11");
    }

    #[test]
    fn starts_empty() {
        let registry = FailureRegistry::new();
        assert!(registry.is_empty());
        registry.report("x");
        assert!(!registry.is_empty());
    }
}
