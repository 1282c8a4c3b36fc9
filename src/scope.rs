//! Lexically nested symbol tables (spec §3 `Scope`, §4.3).
//!
//! Spec §9 replaces the original's manual linked list of `(name, Value)`
//! nodes with "a stack of hash maps", and replaces the direct-`self`-
//! reference trick with an explicit binding enum — both done here:
//! [`Binding::SelfRef`] holds the bound `Object` without deep-copying it,
//! so mutation through `self` inside a method is visible to the caller,
//! without needing a scope-teardown special case (dropping the `Rc` is
//! enough; there is no manual refcount to avoid touching).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::value::{Object, Value};

enum Binding {
  Owned(Value),
  SelfRef(Rc<Object>),
}

impl Binding {
  fn to_value(&self) -> Value {
    match self {
      Binding::Owned(v) => v.clone(),
      Binding::SelfRef(o) => Value::Object(o.clone()),
    }
  }
}

struct Frame {
  symbols: HashMap<String, Binding>,
  outer: Option<Scope>,
}

/// A scope is a cheap `Rc` handle to a frame; cloning a `Scope` aliases the
/// same frame (needed so a `Coroutine`'s stashed `execution_scope` and the
/// interpreter's "current scope" pointer can refer to the same bindings).
#[derive(Clone)]
pub struct Scope(Rc<RefCell<Frame>>);

impl Scope {
  pub fn root() -> Scope {
    Scope(Rc::new(RefCell::new(Frame {
      symbols: HashMap::new(),
      outer: None,
    })))
  }

  /// Push a new, empty frame chained to `self`.
  pub fn enter(&self) -> Scope {
    Scope(Rc::new(RefCell::new(Frame {
      symbols: HashMap::new(),
      outer: Some(self.clone()),
    })))
  }

  /// The enclosing scope, if any (spec's `exit` — dropping this handle's
  /// last `Rc` reference frees the frame; there is nothing else to do).
  pub fn exit(&self) -> Option<Scope> {
    self.0.borrow().outer.clone()
  }

  /// Unconditional insert into the innermost frame (spec §4.3 `define`).
  /// Stores `value` as-is: a container's `Rc` clone *is* the shared handle
  /// spec §8 property 3 requires (`let: b = a:` then mutating through `b`
  /// must be visible through `a`); only a primitive's own `Copy`/`Clone`
  /// impl governs what "storing" it means.
  pub fn define(&self, name: &str, value: Value) {
    self.0.borrow_mut().symbols.insert(name.to_string(), Binding::Owned(value));
  }

  /// Binds `self` as a direct (non-deep-copied) reference to `obj`, per
  /// spec §4.3's special case for method invocation.
  pub fn define_self(&self, obj: Rc<Object>) {
    self.0.borrow_mut().symbols.insert("self".to_string(), Binding::SelfRef(obj));
  }

  /// Search outward, updating the binding where it is defined, or
  /// creating it in the innermost frame if nowhere in the chain (spec
  /// §4.3 `set`).
  pub fn set(&self, name: &str, value: Value) {
    let mut scope = self.clone();
    loop {
      let found = scope.0.borrow().symbols.contains_key(name);
      if found {
        scope.0.borrow_mut().symbols.insert(name.to_string(), Binding::Owned(value));
        return;
      }
      let outer = scope.0.borrow().outer.clone();
      match outer {
        Some(next) => scope = next,
        None => break,
      }
    }
    self.define(name, value);
  }

  /// Search outward for `name` (spec §4.3 `get`).
  pub fn get(&self, name: &str) -> Option<Value> {
    let mut scope = self.clone();
    loop {
      if let Some(binding) = scope.0.borrow().symbols.get(name) {
        return Some(binding.to_value());
      }
      let outer = scope.0.borrow().outer.clone();
      match outer {
        Some(next) => scope = next,
        None => return None,
      }
    }
  }

  /// Look up `name` in this frame only, without traversing outward.
  pub fn get_local(&self, name: &str) -> Option<Value> {
    self.0.borrow().symbols.get(name).map(Binding::to_value)
  }

  /// All bindings defined directly in this frame, not inherited from an
  /// outer one. Used to collect a loaded module's top-level names into its
  /// export dict.
  pub fn local_bindings(&self) -> Vec<(String, Value)> {
    self.0.borrow().symbols.iter().map(|(k, v)| (k.clone(), v.to_value())).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn lookup_finds_innermost_binding() {
    let outer = Scope::root();
    outer.define("x", Value::Int(1));
    let inner = outer.enter();
    inner.define("x", Value::Int(2));
    assert_eq!(inner.get("x").unwrap().as_int().unwrap(), 2);
    assert_eq!(outer.get("x").unwrap().as_int().unwrap(), 1);
  }

  #[test]
  fn set_updates_outer_binding_in_place() {
    let outer = Scope::root();
    outer.define("x", Value::Int(1));
    let inner = outer.enter();
    inner.set("x", Value::Int(5));
    assert_eq!(outer.get("x").unwrap().as_int().unwrap(), 5);
  }

  #[test]
  fn missing_name_returns_none() {
    let scope = Scope::root();
    assert!(scope.get("missing").is_none());
  }

  /// spec §8 property 3: `let: b = a:` aliases the same array, so mutating
  /// through `b` is visible through `a`.
  #[test]
  fn binding_a_container_to_a_new_name_aliases_it() {
    let scope = Scope::root();
    let array = Rc::new(RefCell::new(vec![Value::Int(1), Value::Int(2), Value::Int(3)]));
    scope.define("a", Value::Array(array));
    let a = scope.get("a").unwrap();
    scope.define("b", a);
    if let Some(Value::Array(b)) = scope.get("b") {
      b.borrow_mut()[0] = Value::Int(9);
    } else {
      panic!("expected an array");
    }
    let Value::Array(a) = scope.get("a").unwrap() else {
      panic!("expected an array");
    };
    assert_eq!(a.borrow()[0].as_int().unwrap(), 9);
  }
}
