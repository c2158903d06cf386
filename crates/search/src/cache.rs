//! Memoized evaluation outcomes.

use crate::oracle::{Cost, EvaluationFailure, Evaluator};
use anyhow::Result;
use looptune_ir::Kernel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Outcomes keyed by serialized kernel state, valid for one measurement scope.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CostCache {
    scope: String,
    entries: HashMap<String, Result<Cost, EvaluationFailure>>,
}

impl CostCache {
    pub fn new<S: Into<String>>(scope: S) -> Self {
        Self {
            scope: scope.into(),
            entries: HashMap::new(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, kernel: &Kernel) -> Option<&Result<Cost, EvaluationFailure>> {
        self.entries.get(&state_key(kernel))
    }

    pub fn insert(&mut self, kernel: &Kernel, outcome: Result<Cost, EvaluationFailure>) {
        self.entries.insert(state_key(kernel), outcome);
    }

    /// Load a cache for `scope`; a file written under another scope is ignored.
    pub fn load_from_file(path: &Path, scope: &str) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(scope));
        }
        let data = fs::read(path)?;
        let cache: CostCache = serde_json::from_slice(&data)?;
        if cache.scope != scope {
            warn!(
                path = %path.display(),
                cached = %cache.scope,
                current = %scope,
                "cost cache scope changed, starting fresh"
            );
            return Ok(Self::new(scope));
        }
        Ok(cache)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let blob = serde_json::to_vec_pretty(self)?;
        fs::write(path, blob)?;
        Ok(())
    }
}

fn state_key(kernel: &Kernel) -> String {
    serde_json::to_string(kernel).unwrap_or_else(|_| format!("fingerprint:{}", kernel.fingerprint()))
}

/// Evaluator decorator that consults a [`CostCache`] before measuring.
pub struct CachingEvaluator<E> {
    inner: E,
    cache: Mutex<CostCache>,
}

impl<E: Evaluator> CachingEvaluator<E> {
    pub fn new(inner: E, cache: CostCache) -> Self {
        Self {
            inner,
            cache: Mutex::new(cache),
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn into_cache(self) -> CostCache {
        self.cache
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> CostCache {
        self.lock().clone()
    }

    /// Entries stay consistent across a panicking holder, so a poisoned lock
    /// is recovered rather than skipped.
    fn lock(&self) -> MutexGuard<'_, CostCache> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lookup(&self, kernel: &Kernel) -> Option<Result<Cost, EvaluationFailure>> {
        self.lock().get(kernel).cloned()
    }
}

impl<E: Evaluator> Evaluator for CachingEvaluator<E> {
    fn evaluate(&self, kernel: &Kernel) -> Result<Cost, EvaluationFailure> {
        if let Some(outcome) = self.lookup(kernel) {
            debug!(schedule = %kernel.schedule_summary(), "cost cache hit");
            return outcome;
        }
        let outcome = self.inner.evaluate(kernel);
        self.lock().insert(kernel, outcome.clone());
        outcome
    }

    fn reentrant(&self) -> bool {
        self.inner.reentrant()
    }

    fn scope(&self) -> String {
        self.inner.scope()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use looptune_ir::{apply_edit, matmul, TransformDescriptor};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn caching_evaluator_measures_each_state_once() {
        let calls = AtomicUsize::new(0);
        let evaluator = |kernel: &Kernel| -> Result<Cost, EvaluationFailure> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Cost::from_millis(kernel.nest.len() as f64))
        };
        let caching = CachingEvaluator::new(evaluator, CostCache::new("test"));

        let kernel = matmul("mm", 16, 16, 16);
        let tiled = apply_edit(&kernel, &TransformDescriptor::Tile { loop_index: 0, size: 4 })
            .expect("tile");

        assert_eq!(caching.evaluate(&kernel), Ok(Cost::from_millis(3.0)));
        assert_eq!(caching.evaluate(&kernel), Ok(Cost::from_millis(3.0)));
        assert_eq!(caching.evaluate(&tiled), Ok(Cost::from_millis(4.0)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(caching.snapshot().len(), 2);
    }

    #[test]
    fn failures_are_cached_too() {
        let calls = AtomicUsize::new(0);
        let evaluator = |_: &Kernel| -> Result<Cost, EvaluationFailure> {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(EvaluationFailure::Execution("trap".into()))
        };
        let caching = CachingEvaluator::new(evaluator, CostCache::new("test"));
        let kernel = matmul("mm", 8, 8, 8);
        assert!(caching.evaluate(&kernel).is_err());
        assert!(caching.evaluate(&kernel).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cache_keeps_working_after_a_panicking_holder() {
        let calls = AtomicUsize::new(0);
        let evaluator = |_: &Kernel| -> Result<Cost, EvaluationFailure> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Cost::from_millis(2.0))
        };
        let caching = CachingEvaluator::new(evaluator, CostCache::new("test"));
        let kernel = matmul("mm", 8, 8, 8);
        assert!(caching.evaluate(&kernel).is_ok());

        let poisoned = std::thread::scope(|s| {
            s.spawn(|| {
                let _guard = caching.cache.lock().unwrap();
                panic!("holder died");
            })
            .join()
        });
        assert!(poisoned.is_err());
        assert!(caching.cache.is_poisoned());

        assert_eq!(caching.evaluate(&kernel), Ok(Cost::from_millis(2.0)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let tiled = apply_edit(&kernel, &TransformDescriptor::Tile { loop_index: 0, size: 4 })
            .expect("tile");
        assert!(caching.evaluate(&tiled).is_ok());
        assert_eq!(caching.snapshot().len(), 2);
        assert_eq!(caching.into_cache().len(), 2);
    }

    #[test]
    fn cache_round_trips_through_disk_within_scope() {
        let dir = std::env::temp_dir().join(format!("looptune-cache-{}", std::process::id()));
        let path = dir.join("costs.json");
        let kernel = matmul("mm", 8, 8, 8);

        let mut cache = CostCache::new("cpu:w1:r5");
        cache.insert(&kernel, Ok(Cost::from_millis(1.5)));
        cache.save_to_file(&path).unwrap();

        let same = CostCache::load_from_file(&path, "cpu:w1:r5").unwrap();
        assert_eq!(same.get(&kernel), Some(&Ok(Cost::from_millis(1.5))));

        let other = CostCache::load_from_file(&path, "cpu:w1:r9").unwrap();
        assert!(other.is_empty());

        let _ = fs::remove_dir_all(dir);
    }
}
