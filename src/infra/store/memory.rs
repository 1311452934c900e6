//! In-memory collection for development, testing, and single-process labs.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::{Collection, Conditional, StoreKey, StoreRecord};
use crate::core::SchedulerError;

/// Collection backed by a `BTreeMap` behind a `parking_lot::RwLock`.
///
/// Conditional updates take the write lock for the whole check-then-write,
/// which is what makes them atomic.
pub struct InMemoryCollection<K, V> {
    name: String,
    records: RwLock<BTreeMap<K, V>>,
}

impl<K: StoreKey, V: StoreRecord> InMemoryCollection<K, V> {
    /// Create an empty collection.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<K: StoreKey, V: StoreRecord> Collection<K, V> for InMemoryCollection<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn insert(&self, key: K, value: V) -> Result<(), SchedulerError> {
        let mut records = self.records.write();
        if records.contains_key(&key) {
            return Err(SchedulerError::Backend(format!(
                "{}: duplicate key {key:?}",
                self.name
            )));
        }
        records.insert(key, value);
        Ok(())
    }

    fn put(&self, key: K, value: V) -> Result<(), SchedulerError> {
        self.records.write().insert(key, value);
        Ok(())
    }

    fn get(&self, key: &K) -> Result<Option<V>, SchedulerError> {
        Ok(self.records.read().get(key).cloned())
    }

    fn find(&self, filter: &dyn Fn(&V) -> bool) -> Result<Vec<V>, SchedulerError> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|v| filter(v))
            .cloned()
            .collect())
    }

    fn update_if(
        &self,
        key: &K,
        filter: &dyn Fn(&V) -> bool,
        update: &mut dyn FnMut(&mut V),
    ) -> Result<Conditional<V>, SchedulerError> {
        let mut records = self.records.write();
        let Some(current) = records.get_mut(key) else {
            return Ok(Conditional::Missing);
        };
        if !filter(current) {
            return Ok(Conditional::Rejected(current.clone()));
        }
        update(current);
        Ok(Conditional::Applied(current.clone()))
    }

    fn len(&self) -> Result<usize, SchedulerError> {
        Ok(self.records.read().len())
    }
}
