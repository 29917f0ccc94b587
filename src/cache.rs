use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use crate::error::{ForecastError, Result};

/// Memoizes values for the lifetime of one training run. Every access names
/// the run it belongs to; a different run id drops everything cached so far.
#[derive(Debug)]
pub struct RunCache<K, V> {
    inner: Mutex<RunScoped<K, V>>,
}

#[derive(Debug)]
struct RunScoped<K, V> {
    run_id: Option<String>,
    entries: HashMap<K, V>,
}

impl<K, V> Default for RunCache<K, V> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(RunScoped {
                run_id: None,
                entries: HashMap::new(),
            }),
        }
    }
}

impl<K, V> RunCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached value for `key` under `run_id`, computing it with
    /// `load` on a miss. Failed loads are not cached.
    pub fn get_or_try_insert_with<F>(&self, run_id: &str, key: K, load: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        {
            let mut guard = self.lock()?;
            guard.roll_to(run_id);
            if let Some(value) = guard.entries.get(&key) {
                return Ok(value.clone());
            }
        }
        // Loading happens outside the lock so slow loads do not serialize readers.
        let value = load()?;
        let mut guard = self.lock()?;
        guard.roll_to(run_id);
        Ok(guard.entries.entry(key).or_insert(value).clone())
    }

    pub fn get(&self, run_id: &str, key: &K) -> Result<Option<V>> {
        let guard = self.lock()?;
        if guard.run_id.as_deref() != Some(run_id) {
            return Ok(None);
        }
        Ok(guard.entries.get(key).cloned())
    }

    pub fn invalidate(&self) -> Result<()> {
        let mut guard = self.lock()?;
        guard.run_id = None;
        guard.entries.clear();
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn run_id(&self) -> Result<Option<String>> {
        Ok(self.lock()?.run_id.clone())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, RunScoped<K, V>>> {
        self.inner
            .lock()
            .map_err(|_| ForecastError::Model("run cache lock poisoned".to_string()))
    }
}

impl<K, V> RunScoped<K, V> {
    fn roll_to(&mut self, run_id: &str) {
        if self.run_id.as_deref() != Some(run_id) {
            self.entries.clear();
            self.run_id = Some(run_id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn loads_once_per_run() {
        let cache: RunCache<&str, f64> = RunCache::new();
        let calls = Cell::new(0);
        let load = || {
            calls.set(calls.get() + 1);
            Ok(42.0)
        };
        assert_eq!(cache.get_or_try_insert_with("run-a", "onion", load).unwrap(), 42.0);
        assert_eq!(cache.get_or_try_insert_with("run-a", "onion", load).unwrap(), 42.0);
        assert_eq!(calls.get(), 1);

        assert_eq!(cache.get_or_try_insert_with("run-b", "onion", load).unwrap(), 42.0);
        assert_eq!(calls.get(), 2);
        assert_eq!(cache.run_id().unwrap().as_deref(), Some("run-b"));
    }

    #[test]
    fn new_run_drops_stale_entries() {
        let cache: RunCache<String, u32> = RunCache::new();
        cache
            .get_or_try_insert_with("run-a", "x".to_string(), || Ok(1))
            .unwrap();
        assert_eq!(cache.get("run-a", &"x".to_string()).unwrap(), Some(1));
        assert_eq!(cache.get("run-b", &"x".to_string()).unwrap(), None);
        cache
            .get_or_try_insert_with("run-b", "y".to_string(), || Ok(2))
            .unwrap();
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn failed_load_is_not_cached() {
        let cache: RunCache<u8, u8> = RunCache::new();
        let err = cache.get_or_try_insert_with("r", 1, || Err(ForecastError::Data("boom".into())));
        assert!(err.is_err());
        assert!(cache.is_empty().unwrap());
        assert_eq!(cache.get_or_try_insert_with("r", 1, || Ok(7)).unwrap(), 7);
    }
}
