//! Per-(instance, method) state shared by the resilience plugins.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Identity of one wrapped call site: instance id plus method (or cache) key.
pub(crate) type PendingKey = (u64, String);

/// Pending-operation state keyed by method identity.
///
/// Entries are created on first use and reclaimed explicitly, either when the
/// operation completes or when the owning instance is destroyed. The lock is
/// only held for the duration of the closure passed to [`PendingTable::with`];
/// closures must not call back into service code.
pub(crate) struct PendingTable<S> {
    entries: Mutex<HashMap<PendingKey, S>>,
}

impl<S: Default> Default for PendingTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Default> PendingTable<S> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `f` on the entry for `key`, creating a default entry if missing.
    pub(crate) fn with<R>(&self, key: &PendingKey, f: impl FnOnce(&mut S) -> R) -> R {
        let mut entries = self.entries.lock();
        let state = entries.entry(key.clone()).or_default();
        f(state)
    }

    /// Runs `f` on the entry for `key` only if it exists.
    pub(crate) fn with_existing<R>(&self, key: &PendingKey, f: impl FnOnce(&mut S) -> R) -> Option<R> {
        self.entries.lock().get_mut(key).map(f)
    }

    pub(crate) fn remove(&self, key: &PendingKey) -> Option<S> {
        self.entries.lock().remove(key)
    }

    /// Removes the entry for `key` if `predicate` holds for it.
    pub(crate) fn remove_if(&self, key: &PendingKey, predicate: impl FnOnce(&S) -> bool) -> Option<S> {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(predicate) {
            entries.remove(key)
        } else {
            None
        }
    }

    /// Removes and returns every entry owned by `instance_id`.
    pub(crate) fn drain_instance(&self, instance_id: u64) -> Vec<S> {
        let mut entries = self.entries.lock();
        let keys: Vec<PendingKey> = entries
            .keys()
            .filter(|(id, _)| *id == instance_id)
            .cloned()
            .collect();
        keys.into_iter().filter_map(|key| entries.remove(&key)).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_only_touches_one_instance() {
        let table = PendingTable::<u32>::new();
        table.with(&(1, "a".into()), |s| *s += 1);
        table.with(&(1, "b".into()), |s| *s += 2);
        table.with(&(2, "a".into()), |s| *s += 3);

        let mut drained = table.drain_instance(1);
        drained.sort();
        assert_eq!(drained, vec![1, 2]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.with_existing(&(2, "a".into()), |s| *s), Some(3));
        assert_eq!(table.with_existing(&(1, "a".into()), |s| *s), None);
    }
}
