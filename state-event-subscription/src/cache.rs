use std::collections::HashMap;

use crate::record::RecordKey;

/// Latest committed state per key, grouped by the partition that owns the key.
///
/// Owned by the subscription worker. A partition is present only once its
/// state has been replayed; revoked partitions are dropped wholesale. Entries
/// change only after the transaction that produced them committed.
#[derive(Debug)]
pub struct MaterializedStateCache<K, S> {
    partitions: HashMap<i32, HashMap<K, S>>,
}

impl<K: RecordKey, S> Default for MaterializedStateCache<K, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: RecordKey, S> MaterializedStateCache<K, S> {
    pub fn new() -> Self {
        Self {
            partitions: HashMap::new(),
        }
    }

    pub fn get(&self, partition: i32, key: &K) -> Option<&S> {
        self.partitions.get(&partition)?.get(key)
    }

    /// Stores the committed state for a key. `None` removes the key.
    pub fn apply(&mut self, partition: i32, key: K, state: Option<S>) {
        let entries = self.partitions.entry(partition).or_default();
        match state {
            Some(state) => {
                entries.insert(key, state);
            }
            None => {
                entries.remove(&key);
            }
        }
    }

    /// Replaces everything known about a partition with a freshly replayed
    /// snapshot.
    pub fn load_partition(&mut self, partition: i32, entries: HashMap<K, S>) {
        self.partitions.insert(partition, entries);
    }

    pub fn drop_partitions(&mut self, partitions: &[i32]) -> usize {
        partitions
            .iter()
            .filter_map(|p| self.partitions.remove(p))
            .map(|entries| entries.len())
            .sum()
    }

    /// Discards every partition, returning how many keys were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.key_count();
        self.partitions.clear();
        dropped
    }

    pub fn contains_partition(&self, partition: i32) -> bool {
        self.partitions.contains_key(&partition)
    }

    pub fn owned_partitions(&self) -> Vec<i32> {
        let mut partitions: Vec<i32> = self.partitions.keys().copied().collect();
        partitions.sort_unstable();
        partitions
    }

    pub fn key_count(&self) -> usize {
        self.partitions.values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_and_clear_keys() {
        let mut cache = MaterializedStateCache::<String, i64>::new();
        cache.apply(0, "acct-1".to_string(), Some(100));
        cache.apply(0, "acct-1".to_string(), Some(70));
        cache.apply(1, "acct-2".to_string(), Some(5));

        assert_eq!(cache.get(0, &"acct-1".to_string()), Some(&70));
        assert_eq!(cache.get(1, &"acct-1".to_string()), None);
        assert_eq!(cache.key_count(), 2);

        cache.apply(0, "acct-1".to_string(), None);
        assert_eq!(cache.get(0, &"acct-1".to_string()), None);
        assert!(cache.contains_partition(0));
        assert_eq!(cache.key_count(), 1);

        assert_eq!(cache.clear(), 1);
        assert!(!cache.contains_partition(1));
    }

    #[test]
    fn load_replaces_and_drop_removes_partitions() {
        let mut cache = MaterializedStateCache::<String, i64>::new();
        cache.apply(3, "stale".to_string(), Some(1));

        cache.load_partition(3, HashMap::from([("fresh".to_string(), 2)]));
        cache.load_partition(4, HashMap::new());
        assert_eq!(cache.get(3, &"stale".to_string()), None);
        assert_eq!(cache.get(3, &"fresh".to_string()), Some(&2));
        assert_eq!(cache.owned_partitions(), vec![3, 4]);

        assert_eq!(cache.drop_partitions(&[3, 9]), 1);
        assert_eq!(cache.owned_partitions(), vec![4]);
        assert!(!cache.contains_partition(3));

        cache.clear();
        assert!(cache.owned_partitions().is_empty());
    }
}
