use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, RwLock};

use bistro_events::ProjectionError;

/// Keyed record storage with a lock per record.
///
/// The map itself sits behind an `RwLock`; every record behind its own `Mutex`.
/// Handlers touching different records only share the map's read lock, so
/// they proceed in parallel. Adding or removing a record takes the write lock.
///
/// Lock order is always map before record. Nothing here hands out a record
/// guard or an `Arc` to a caller, so that order cannot be inverted from
/// outside.
///
/// Mutations report poisoned locks as [`ProjectionError::Poisoned`]. Queries
/// treat a poisoned lock as "no data", like any other disposable read model.
#[derive(Debug)]
pub struct RecordMap<K, V> {
    name: &'static str,
    records: RwLock<HashMap<K, Arc<Mutex<V>>>>,
}

impl<K, V> RecordMap<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// `name` identifies the owning projection in errors.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            records: RwLock::new(HashMap::new()),
        }
    }

    fn poisoned(&self) -> ProjectionError {
        ProjectionError::Poisoned(self.name)
    }

    /// Insert or replace the record for `key`.
    pub fn insert(&self, key: K, value: V) -> Result<(), ProjectionError> {
        let mut records = self.records.write().map_err(|_| self.poisoned())?;
        records.insert(key, Arc::new(Mutex::new(value)));
        Ok(())
    }

    /// Remove the record for `key`; returns whether one existed.
    pub fn remove(&self, key: &K) -> Result<bool, ProjectionError> {
        let mut records = self.records.write().map_err(|_| self.poisoned())?;
        Ok(records.remove(key).is_some())
    }

    /// Mutate the record for `key` in place.
    ///
    /// Returns `Ok(None)` when there is no such record. The map stays
    /// read-locked for the duration, so the record cannot be removed
    /// underneath `f`.
    pub fn update<R>(
        &self,
        key: &K,
        f: impl FnOnce(&mut V) -> R,
    ) -> Result<Option<R>, ProjectionError> {
        let records = self.records.read().map_err(|_| self.poisoned())?;
        let Some(record) = records.get(key) else {
            return Ok(None);
        };
        let mut record = record.lock().map_err(|_| self.poisoned())?;
        Ok(Some(f(&mut record)))
    }

    /// Copy of the record for `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        let records = self.records.read().ok()?;
        let record = records.get(key)?.lock().ok()?;
        Some(record.clone())
    }

    /// Visit every record under the map's read lock, collecting what `f`
    /// returns. Records whose lock is poisoned are skipped.
    pub fn scan<R>(&self, mut f: impl FnMut(&K, &V) -> Option<R>) -> Vec<R> {
        let Ok(records) = self.records.read() else {
            return Vec::new();
        };
        records
            .iter()
            .filter_map(|(key, record)| {
                let record = record.lock().ok()?;
                f(key, &record)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
