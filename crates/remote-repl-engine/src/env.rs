//! Captured lexical environments.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::value::Value;

/// A mutable binding environment.
///
/// All reads and writes routed through clones of the same [`ContextHandle`]
/// observe one consistent set of bindings, which is what makes a persisted
/// watchpoint a read/write window onto live state.
#[derive(Debug, Default)]
pub struct Environment {
    bindings: Mutex<BTreeMap<String, Value>>,
}

impl Environment {
    fn get(&self, name: &str) -> Option<Value> {
        self.bindings.lock().unwrap().get(name).cloned()
    }

    fn set(&self, name: &str, value: Value) {
        self.bindings.lock().unwrap().insert(name.to_owned(), value);
    }
}

/// Opaque, cloneable reference to a captured [`Environment`].
///
/// Cheap to clone; clones share the underlying bindings.
#[derive(Debug, Clone, Default)]
pub struct ContextHandle(Arc<Environment>);

impl ContextHandle {
    /// Create a fresh, empty top-level context.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Read a binding.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.get(name)
    }

    /// Create or overwrite a binding.
    pub fn set(&self, name: &str, value: Value) {
        self.0.set(name, value);
    }

    /// A serializable copy of the current bindings, keyed in name order.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.0.bindings.lock().unwrap().clone()
    }

    /// Whether two handles reference the same environment.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
