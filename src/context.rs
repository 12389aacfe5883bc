//! Per-connection (or per-client) key/value scratch space.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// A value stored in a [`ContextStore`].
pub type ContextValue = Arc<dyn Any + Send + Sync>;

/// Thread-safe string-keyed map of arbitrary values. Last write wins.
#[derive(Default)]
pub struct ContextStore {
    values: RwLock<HashMap<String, ContextValue>>,
}

impl fmt::Debug for ContextStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<&String> = values.keys().collect();
        keys.sort();
        f.debug_struct("ContextStore").field("keys", &keys).finish()
    }
}

impl ContextStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), Arc::new(value));
    }

    /// Fetch a clone of the value under `key` if it exists and is a `T`.
    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.get_raw(key)?.downcast_ref::<T>().cloned()
    }

    /// Fetch the stored value under `key` without assuming its type.
    pub fn get_raw(&self, key: &str) -> Option<ContextValue> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Whether anything is stored under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Remove and return the value under `key`.
    pub fn remove(&self, key: &str) -> Option<ContextValue> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get() {
        let ctx = ContextStore::new();
        ctx.set("k", "v".to_string());
        assert_eq!(ctx.get::<String>("k"), Some("v".to_string()));
    }

    #[test]
    fn test_unset_key_is_absent() {
        let ctx = ContextStore::new();
        assert_eq!(ctx.get::<String>("missing"), None);
        assert!(!ctx.contains("missing"));
        assert!(ctx.get_raw("missing").is_none());
    }

    #[test]
    fn test_last_write_wins() {
        let ctx = ContextStore::new();
        ctx.set("user_id", 41_u64);
        ctx.set("user_id", 42_u64);
        assert_eq!(ctx.get::<u64>("user_id"), Some(42));
    }

    #[test]
    fn test_wrong_type_is_absent_but_raw_is_present() {
        let ctx = ContextStore::new();
        ctx.set("n", 7_i32);
        assert_eq!(ctx.get::<String>("n"), None);
        let raw = ctx.get_raw("n").unwrap();
        assert_eq!(raw.downcast_ref::<i32>(), Some(&7));
    }

    #[test]
    fn test_remove() {
        let ctx = ContextStore::new();
        ctx.set("k", 1_u8);
        assert!(ctx.remove("k").is_some());
        assert!(!ctx.contains("k"));
        assert!(ctx.remove("k").is_none());
    }

    #[test]
    fn test_concurrent_writers() {
        let ctx = Arc::new(ContextStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ctx = Arc::clone(&ctx);
                std::thread::spawn(move || ctx.set(format!("k{i}"), i))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for i in 0..8 {
            assert_eq!(ctx.get::<i32>(&format!("k{i}")), Some(i));
        }
    }
}
