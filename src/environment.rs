// File: src/environment.rs
//
// Hierarchical name->value scopes for the Panda VM.
// Every closure carries a reference to the environment in force when it was
// created; module bodies and named embedding scopes are children of the root.

use crate::value::Value;
use ahash::AHashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// Read-only external binding source consulted between the local map and the
/// parent scope. Lets a host expose values without copying them in.
pub trait EnvProvider {
    fn get(&self, name: &str) -> Option<Value>;
}

/// A single scope: local bindings, an optional provider, and an optional
/// parent. Lookup order is local map, then provider, then parent.
pub struct Environment {
    values: AHashMap<String, Value>,
    provider: Option<Rc<dyn EnvProvider>>,
    parent: Option<Rc<RefCell<Environment>>>,
}

impl Environment {
    pub fn new() -> Self {
        Self {
            values: AHashMap::new(),
            provider: None,
            parent: None,
        }
    }

    pub fn with_parent(parent: Rc<RefCell<Environment>>) -> Self {
        Self {
            values: AHashMap::new(),
            provider: None,
            parent: Some(parent),
        }
    }

    pub fn set_provider(&mut self, provider: Rc<dyn EnvProvider>) {
        self.provider = Some(provider);
    }

    /// Look a name up through local bindings, the provider, then the parent
    /// chain.
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.values.get(name) {
            return Some(value.clone());
        }
        if let Some(provider) = &self.provider {
            if let Some(value) = provider.get(name) {
                return Some(value);
            }
        }
        if let Some(parent) = &self.parent {
            return parent.borrow().get(name);
        }
        None
    }

    /// Update an existing binding, searching up the parent chain; if the name
    /// is bound nowhere, define it in this scope. Providers are read-only and
    /// never updated.
    pub fn set(&mut self, name: &str, value: Value) {
        if self.values.contains_key(name) {
            self.values.insert(name.to_string(), value);
            return;
        }
        if let Some(parent) = &self.parent {
            if parent.borrow().has_binding(name) {
                parent.borrow_mut().set(name, value);
                return;
            }
        }
        self.values.insert(name.to_string(), value);
    }

    /// Always bind in this scope, shadowing any parent binding.
    pub fn define(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Drop every local binding; the provider and parent are untouched.
    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn has_binding(&self, name: &str) -> bool {
        if self.values.contains_key(name) {
            return true;
        }
        self.parent
            .as_ref()
            .is_some_and(|p| p.borrow().has_binding(name))
    }

    /// Names bound locally in this scope (not the provider or parents).
    pub fn local_names(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProvider;

    impl EnvProvider for FixedProvider {
        fn get(&self, name: &str) -> Option<Value> {
            (name == "answer").then(|| Value::Number(42.0))
        }
    }

    #[test]
    fn get_walks_local_then_provider_then_parent() {
        let root = Rc::new(RefCell::new(Environment::new()));
        root.borrow_mut().define("x", Value::Number(1.0));

        let mut child = Environment::with_parent(root.clone());
        child.set_provider(Rc::new(FixedProvider));

        assert_eq!(child.get("x").unwrap().as_number(), Some(1.0));
        assert_eq!(child.get("answer").unwrap().as_number(), Some(42.0));
        assert!(child.get("missing").is_none());

        child.define("x", Value::Number(2.0));
        assert_eq!(child.get("x").unwrap().as_number(), Some(2.0));
    }

    #[test]
    fn set_updates_existing_binding_up_the_chain() {
        let root = Rc::new(RefCell::new(Environment::new()));
        root.borrow_mut().define("counter", Value::Number(0.0));

        let child = Rc::new(RefCell::new(Environment::with_parent(root.clone())));
        child.borrow_mut().set("counter", Value::Number(5.0));

        assert_eq!(root.borrow().get("counter").unwrap().as_number(), Some(5.0));
        assert!(!child.borrow().values.contains_key("counter"));
    }

    #[test]
    fn set_defines_locally_when_unbound() {
        let root = Rc::new(RefCell::new(Environment::new()));
        let child = Rc::new(RefCell::new(Environment::with_parent(root.clone())));
        child.borrow_mut().set("fresh", Value::Bool(true));

        assert!(root.borrow().get("fresh").is_none());
        assert!(child.borrow().get("fresh").is_some());
    }

    #[test]
    fn clear_resets_only_local_bindings() {
        let root = Rc::new(RefCell::new(Environment::new()));
        root.borrow_mut().define("kept", Value::Number(1.0));
        let mut child = Environment::with_parent(root);
        child.define("dropped", Value::Number(2.0));

        child.clear();
        assert!(child.get("dropped").is_none());
        assert!(child.get("kept").is_some());
    }
}
