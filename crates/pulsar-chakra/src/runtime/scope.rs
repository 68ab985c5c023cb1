//! Runtime scope instances.
//!
//! The compiled code builds a chain of these at routine entry and addresses
//! declarative scopes by slot index. The named accessors (`has_value`,
//! `get_value`, `set_value`) are the helpers the standard library uses when
//! it needs to poke at a scope chain from native code.

use super::object::PropertyObject;
use super::value::Value;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug)]
enum ScopeStorage {
    /// Slot-backed scope for function bodies and catch variables.
    Declarative {
        names: Vec<String>,
        slots: RwLock<Vec<Value>>,
    },
    /// Property-backed scope: `with` bodies and the global scope.
    Object {
        object: Arc<PropertyObject>,
        implicit_receiver: bool,
    },
}

/// One link in a runtime scope chain.
#[derive(Debug)]
pub struct RuntimeScope {
    parent: Option<Arc<RuntimeScope>>,
    storage: ScopeStorage,
}

impl RuntimeScope {
    /// Creates a declarative scope with one undefined slot per name.
    pub fn declarative(parent: Option<Arc<RuntimeScope>>, names: Vec<String>) -> Arc<Self> {
        let slots = vec![Value::Undefined; names.len()];
        Arc::new(RuntimeScope {
            parent,
            storage: ScopeStorage::Declarative {
                names,
                slots: RwLock::new(slots),
            },
        })
    }

    /// Creates an object scope over a backing object.
    pub fn object(
        parent: Option<Arc<RuntimeScope>>,
        object: Arc<PropertyObject>,
        implicit_receiver: bool,
    ) -> Arc<Self> {
        Arc::new(RuntimeScope {
            parent,
            storage: ScopeStorage::Object {
                object,
                implicit_receiver,
            },
        })
    }

    /// Creates the root scope over the process-wide global object.
    pub fn global(global_object: Arc<PropertyObject>) -> Arc<Self> {
        RuntimeScope::object(None, global_object, false)
    }

    /// The enclosing scope, or `None` at the root.
    pub fn parent(&self) -> Option<&Arc<RuntimeScope>> {
        self.parent.as_ref()
    }

    /// Whether this scope supplies the implicit `this` for calls resolved
    /// through it.
    pub fn provides_implicit_receiver(&self) -> bool {
        matches!(
            self.storage,
            ScopeStorage::Object {
                implicit_receiver: true,
                ..
            }
        )
    }

    /// The backing object of an object scope.
    pub fn binding_object(&self) -> Option<&Arc<PropertyObject>> {
        match &self.storage {
            ScopeStorage::Object { object, .. } => Some(object),
            ScopeStorage::Declarative { .. } => None,
        }
    }

    /// Reads a declarative slot.
    pub fn get_slot(&self, index: usize) -> Value {
        match &self.storage {
            ScopeStorage::Declarative { slots, .. } => {
                slots.read().get(index).cloned().unwrap_or_default()
            }
            ScopeStorage::Object { .. } => Value::Undefined,
        }
    }

    /// Writes a declarative slot.
    pub fn set_slot(&self, index: usize, value: Value) {
        if let ScopeStorage::Declarative { slots, .. } = &self.storage {
            let mut slots = slots.write();
            if index < slots.len() {
                slots[index] = value;
            }
        }
    }

    /// Whether this scope (alone, not its parents) binds the name.
    pub fn has_value(&self, name: &str) -> bool {
        match &self.storage {
            ScopeStorage::Declarative { names, .. } => names.iter().any(|n| n == name),
            ScopeStorage::Object { object, .. } => object.has(name),
        }
    }

    /// Resolves a name against this scope chain.
    pub fn get_value(&self, name: &str) -> Option<Value> {
        match &self.storage {
            ScopeStorage::Declarative { names, slots } => {
                if let Some(i) = names.iter().position(|n| n == name) {
                    return Some(slots.read()[i].clone());
                }
            }
            ScopeStorage::Object { object, .. } => {
                if let Some(value) = object.get(name) {
                    return Some(value);
                }
            }
        }
        self.parent.as_ref().and_then(|p| p.get_value(name))
    }

    /// Assigns a name along this scope chain. When no scope binds it, the
    /// value is created on the root's backing object, matching sloppy-mode
    /// assignment to an undeclared name.
    pub fn set_value(&self, name: &str, value: Value) {
        match &self.storage {
            ScopeStorage::Declarative { names, slots } => {
                if let Some(i) = names.iter().position(|n| n == name) {
                    slots.write()[i] = value;
                    return;
                }
            }
            ScopeStorage::Object { object, .. } => {
                if self.parent.is_none() {
                    // Root: create or overwrite unconditionally.
                    object.set(name, value);
                    return;
                }
                if object.set_if_exists(name, value.clone()) {
                    return;
                }
            }
        }
        if let Some(parent) = &self.parent {
            parent.set_value(name, value);
        }
    }
}
