//! Per-type accounting of in-flight workers.
//!
//! The scheduler consults [`Admission::available`] before fetching work and
//! [`Admission::claim`] before spawning; workers call [`Admission::release`]
//! when they finish. Limits are fixed at construction from the configured
//! worker counts.

use std::collections::HashMap;

use parking_lot::Mutex;

pub struct Admission {
    limits: HashMap<String, usize>,
    counts: Mutex<HashMap<String, usize>>,
}

impl Admission {
    pub fn new(limits: HashMap<String, usize>) -> Self {
        let counts = limits.keys().map(|t| (t.clone(), 0)).collect();

        Self {
            limits,
            counts: Mutex::new(counts),
        }
    }

    /// Whether a worker slot is free for `task_type`. Unknown types have no
    /// slots.
    pub fn available(&self, task_type: &str) -> bool {
        let counts = self.counts.lock();
        self.has_capacity(&counts, task_type)
    }

    /// Reserve a worker slot. Re-checks capacity under the lock, closing the
    /// race window between the fetch and the spawn.
    pub fn claim(&self, task_type: &str) -> bool {
        let mut counts = self.counts.lock();
        if !self.has_capacity(&counts, task_type) {
            return false;
        }

        *counts.entry(task_type.to_string()).or_insert(0) += 1;
        true
    }

    /// Return a worker slot after the worker finished.
    pub fn release(&self, task_type: &str) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(task_type) {
            *count = count.saturating_sub(1);
        }
    }

    /// Currently running workers for `task_type`.
    pub fn in_flight(&self, task_type: &str) -> usize {
        let counts = self.counts.lock();
        counts.get(task_type).copied().unwrap_or(0)
    }

    fn has_capacity(&self, counts: &HashMap<String, usize>, task_type: &str) -> bool {
        let limit = self.limits.get(task_type).copied().unwrap_or(0);
        let count = counts.get(task_type).copied().unwrap_or(0);
        count < limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admission(task_type: &str, workers: usize) -> Admission {
        Admission::new(HashMap::from([(task_type.to_string(), workers)]))
    }

    #[test]
    fn claims_up_to_the_limit() {
        let admission = admission("t", 2);

        assert!(admission.available("t"));
        assert!(admission.claim("t"));
        assert!(admission.claim("t"));
        assert!(!admission.available("t"));
        assert!(!admission.claim("t"));
        assert_eq!(admission.in_flight("t"), 2);
    }

    #[test]
    fn release_frees_a_slot() {
        let admission = admission("t", 1);

        assert!(admission.claim("t"));
        assert!(!admission.available("t"));

        admission.release("t");
        assert!(admission.available("t"));
        assert!(admission.claim("t"));
    }

    #[test]
    fn unknown_types_have_no_capacity() {
        let admission = admission("t", 2);

        assert!(!admission.available("other"));
        assert!(!admission.claim("other"));
        assert_eq!(admission.in_flight("other"), 0);
    }

    #[test]
    fn release_never_underflows() {
        let admission = admission("t", 1);
        admission.release("t");
        assert_eq!(admission.in_flight("t"), 0);
        assert!(admission.claim("t"));
    }
}
