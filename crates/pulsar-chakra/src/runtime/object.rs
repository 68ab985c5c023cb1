//! Property-bearing objects and the inline property cache contract.
//!
//! Every object carries a cache key that changes whenever its shape (the
//! name→index mapping) changes. A lookup site remembers the key and the slot
//! index of its last hit; when the key still matches, the property value is
//! read straight out of the value array without a name lookup.

use super::value::Value;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CACHE_KEY: AtomicU64 = AtomicU64::new(1);

fn fresh_cache_key() -> u64 {
    NEXT_CACHE_KEY.fetch_add(1, Ordering::Relaxed)
}

/// One lookup site's cache: two cells, a key and a slot index.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineCache {
    /// The object cache key observed on the last hit; 0 is never a valid key.
    pub key: u64,
    /// Index into the property value array.
    pub index: u32,
}

#[derive(Debug, Default)]
struct PropertyTable {
    /// Name → index into `values`.
    index: FxHashMap<String, u32>,
    values: Vec<Value>,
    /// Bumped on every shape change.
    cache_key: u64,
}

/// A mutable, shareable property map.
#[derive(Debug)]
pub struct PropertyObject {
    table: RwLock<PropertyTable>,
}

impl PropertyObject {
    /// Creates an empty object.
    pub fn new() -> Self {
        PropertyObject {
            table: RwLock::new(PropertyTable {
                index: FxHashMap::default(),
                values: Vec::new(),
                cache_key: fresh_cache_key(),
            }),
        }
    }

    /// The current shape key.
    pub fn cache_key(&self) -> u64 {
        self.table.read().cache_key
    }

    /// Whether a property with this name exists.
    pub fn has(&self, name: &str) -> bool {
        self.table.read().index.contains_key(name)
    }

    /// Reads a property by name, ignoring the cache.
    pub fn get(&self, name: &str) -> Option<Value> {
        let table = self.table.read();
        table
            .index
            .get(name)
            .map(|&i| table.values[i as usize].clone())
    }

    /// Writes a property, creating it (and changing shape) when absent.
    pub fn set(&self, name: &str, value: Value) {
        let mut table = self.table.write();
        if let Some(&i) = table.index.get(name) {
            table.values[i as usize] = value;
        } else {
            let i = table.values.len() as u32;
            table.values.push(value);
            table.index.insert(name.to_string(), i);
            table.cache_key = fresh_cache_key();
        }
    }

    /// Writes a property only when it already exists; reports success.
    pub fn set_if_exists(&self, name: &str, value: Value) -> bool {
        let mut table = self.table.write();
        if let Some(&i) = table.index.get(name) {
            table.values[i as usize] = value;
            true
        } else {
            false
        }
    }

    /// Removes a property; a removal is a shape change.
    pub fn delete(&self, name: &str) -> bool {
        let mut table = self.table.write();
        if let Some(i) = table.index.remove(name) {
            table.values[i as usize] = Value::Undefined;
            table.cache_key = fresh_cache_key();
            true
        } else {
            false
        }
    }

    /// Cached read: on a key hit the value array is indexed directly; on a
    /// miss the full lookup runs and refreshes both cache cells.
    pub fn get_with_cache(&self, name: &str, cache: &mut InlineCache) -> Option<Value> {
        let table = self.table.read();
        if cache.key == table.cache_key {
            return table.values.get(cache.index as usize).cloned();
        }
        let &i = table.index.get(name)?;
        cache.key = table.cache_key;
        cache.index = i;
        Some(table.values[i as usize].clone())
    }

    /// Cached write to an existing property; reports success and refreshes
    /// the cache cells on the slow path.
    pub fn set_with_cache(&self, name: &str, value: Value, cache: &mut InlineCache) -> bool {
        let mut table = self.table.write();
        if cache.key == table.cache_key {
            let i = cache.index as usize;
            if i < table.values.len() {
                table.values[i] = value;
                return true;
            }
        }
        if let Some(&i) = table.index.get(name) {
            cache.key = table.cache_key;
            cache.index = i;
            table.values[i as usize] = value;
            true
        } else {
            false
        }
    }
}

impl Default for PropertyObject {
    fn default() -> Self {
        PropertyObject::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get() {
        let obj = PropertyObject::new();
        obj.set("x", Value::Number(1.0));
        assert_eq!(obj.get("x"), Some(Value::Number(1.0)));
        assert_eq!(obj.get("y"), None);
    }

    #[test]
    fn test_shape_changes_on_add_not_overwrite() {
        let obj = PropertyObject::new();
        let initial = obj.cache_key();
        obj.set("x", Value::Number(1.0));
        let after_add = obj.cache_key();
        assert_ne!(initial, after_add);
        obj.set("x", Value::Number(2.0));
        assert_eq!(obj.cache_key(), after_add);
    }

    #[test]
    fn test_cache_hit_skips_lookup() {
        let obj = PropertyObject::new();
        obj.set("x", Value::Number(1.0));
        let mut cache = InlineCache::default();
        assert_eq!(
            obj.get_with_cache("x", &mut cache),
            Some(Value::Number(1.0))
        );
        assert_eq!(cache.key, obj.cache_key());
        // Overwrite keeps the shape; the cached index stays valid.
        obj.set("x", Value::Number(5.0));
        assert_eq!(
            obj.get_with_cache("x", &mut cache),
            Some(Value::Number(5.0))
        );
    }

    #[test]
    fn test_cache_invalidated_by_shape_change() {
        let obj = PropertyObject::new();
        obj.set("x", Value::Number(1.0));
        let mut cache = InlineCache::default();
        obj.get_with_cache("x", &mut cache);
        let old_key = cache.key;
        obj.set("y", Value::Number(2.0));
        assert_ne!(obj.cache_key(), old_key);
        // Miss path still answers correctly and refreshes the cells.
        assert_eq!(
            obj.get_with_cache("x", &mut cache),
            Some(Value::Number(1.0))
        );
        assert_eq!(cache.key, obj.cache_key());
    }

    #[test]
    fn test_set_if_exists() {
        let obj = PropertyObject::new();
        assert!(!obj.set_if_exists("x", Value::Number(1.0)));
        obj.set("x", Value::Number(1.0));
        assert!(obj.set_if_exists("x", Value::Number(2.0)));
        assert_eq!(obj.get("x"), Some(Value::Number(2.0)));
    }

    #[test]
    fn test_delete_changes_shape() {
        let obj = PropertyObject::new();
        obj.set("x", Value::Number(1.0));
        let before = obj.cache_key();
        assert!(obj.delete("x"));
        assert_ne!(obj.cache_key(), before);
        assert!(!obj.has("x"));
        assert!(!obj.delete("x"));
    }
}
