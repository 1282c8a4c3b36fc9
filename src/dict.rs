//! `Dict`: a hashed key→value map with bucket-order iteration (spec §2
//! "Dictionary", §4.5 `for in` over dicts iterating "keys in bucket
//! order"). Backed by `indexmap::IndexMap` rather than a hand-rolled
//! chaining table with manual resize — `IndexMap` already preserves
//! insertion order and exposes the try-get variants spec §2 calls for.

use std::fmt;
use std::hash::{Hash, Hasher};

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::value::Value;

/// A hashable projection of a [`Value`]. Only the variants spec §4.2 treats
/// as comparable-by-value are legal dict keys; containers/objects are
/// rejected at insertion time with a runtime error, mirroring the
/// `try_get_value_ptr`-style errors raised elsewhere for unsupported key
/// types.
#[derive(Clone)]
pub enum Key {
  Int(i64),
  Float(u64),
  Bool(bool),
  Null,
  Str(std::rc::Rc<str>),
}

impl Key {
  fn from_value(v: &Value) -> Result<Key> {
    match v {
      Value::Int(n) => Ok(Key::Int(*n)),
      Value::Float(n) => Ok(Key::Float(n.to_bits())),
      Value::Bool(b) => Ok(Key::Bool(*b)),
      Value::Null => Ok(Key::Null),
      Value::Str(s) => Ok(Key::Str(s.clone())),
      other => Err(Error::runtime(format!(
        "unhashable type used as dict key: {}",
        other.type_name()
      ))),
    }
  }

  fn to_value(&self) -> Value {
    match self {
      Key::Int(n) => Value::Int(*n),
      Key::Float(bits) => Value::Float(f64::from_bits(*bits)),
      Key::Bool(b) => Value::Bool(*b),
      Key::Null => Value::Null,
      Key::Str(s) => Value::Str(s.clone()),
    }
  }
}

impl PartialEq for Key {
  fn eq(&self, other: &Self) -> bool {
    use Key::*;
    match (self, other) {
      (Int(a), Int(b)) => a == b,
      (Float(a), Float(b)) => a == b,
      // spec's `==` coerces Int/Float; dict keys honor the same coercion
      // so that `d[1]` and `d[1.0]` address the same slot.
      (Int(a), Float(b)) | (Float(b), Int(a)) => (*a as f64).to_bits() == *b,
      (Bool(a), Bool(b)) => a == b,
      (Null, Null) => true,
      (Str(a), Str(b)) => a == b,
      _ => false,
    }
  }
}

impl Eq for Key {}

impl Hash for Key {
  fn hash<H: Hasher>(&self, state: &mut H) {
    match self {
      Key::Int(n) => (*n as f64).to_bits().hash(state),
      Key::Float(bits) => bits.hash(state),
      Key::Bool(b) => b.hash(state),
      Key::Null => 0u8.hash(state),
      Key::Str(s) => s.hash(state),
    }
  }
}

#[derive(Clone, Default)]
pub struct Dict {
  entries: IndexMap<Key, Value>,
}

impl Dict {
  pub fn new() -> Dict {
    Dict::default()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn insert(&mut self, key: &Value, value: Value) -> Result<()> {
    self.entries.insert(Key::from_value(key)?, value);
    Ok(())
  }

  pub fn get(&self, key: &Value) -> Result<Option<&Value>> {
    Ok(self.entries.get(&Key::from_value(key)?))
  }

  pub fn try_get(&self, key: &Value) -> Result<Value> {
    self
      .get(key)?
      .cloned()
      .ok_or_else(|| Error::runtime(format!("key not found: {key}")))
  }

  pub fn remove(&mut self, key: &Value) -> Result<Option<Value>> {
    Ok(self.entries.shift_remove(&Key::from_value(key)?))
  }

  pub fn contains_key(&self, key: &Value) -> Result<bool> {
    Ok(self.entries.contains_key(&Key::from_value(key)?))
  }

  /// Keys in bucket (insertion) order, per spec §4.5's `for in` contract.
  pub fn keys(&self) -> impl Iterator<Item = Value> + '_ {
    self.entries.keys().map(Key::to_value)
  }

  pub fn iter(&self) -> impl Iterator<Item = (Value, &Value)> + '_ {
    self.entries.iter().map(|(k, v)| (k.to_value(), v))
  }

  pub fn deep_copy(&self) -> Dict {
    Dict {
      entries: self
        .entries
        .iter()
        .map(|(k, v)| (k.clone(), v.deep_copy()))
        .collect(),
    }
  }

  pub fn eq_value(&self, other: &Dict) -> bool {
    if self.entries.len() != other.entries.len() {
      return false;
    }
    self.entries.iter().all(|(k, v)| match other.entries.get(k) {
      Some(ov) => v.eq_value(ov),
      None => false,
    })
  }
}

impl fmt::Display for Dict {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{{")?;
    for (i, (k, v)) in self.entries.iter().enumerate() {
      if i > 0 {
        write!(f, ", ")?;
      }
      write!(f, "{}: {v}", k.to_value())?;
    }
    write!(f, "}}")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn int_and_float_keys_address_the_same_slot() {
    let mut d = Dict::new();
    d.insert(&Value::Int(1), Value::str("a")).unwrap();
    assert_eq!(d.get(&Value::Float(1.0)).unwrap().unwrap().as_str().unwrap().as_ref(), "a");
  }

  #[test]
  fn iteration_preserves_insertion_order() {
    let mut d = Dict::new();
    d.insert(&Value::str("z"), Value::Int(1)).unwrap();
    d.insert(&Value::str("a"), Value::Int(2)).unwrap();
    let keys: Vec<Value> = d.keys().collect();
    assert_eq!(keys[0].as_str().unwrap().as_ref(), "z");
    assert_eq!(keys[1].as_str().unwrap().as_ref(), "a");
  }

  #[test]
  fn object_keys_are_rejected() {
    let mut d = Dict::new();
    let err = d.insert(&Value::Array(std::rc::Rc::new(std::cell::RefCell::new(vec![]))), Value::Null);
    assert!(err.is_err());
  }

  #[test]
  fn remove_shifts_remaining_entries_left() {
    let mut d = Dict::new();
    d.insert(&Value::Int(1), Value::str("a")).unwrap();
    d.insert(&Value::Int(2), Value::str("b")).unwrap();
    d.remove(&Value::Int(1)).unwrap();
    assert_eq!(d.len(), 1);
    assert_eq!(d.keys().next().unwrap().as_int().unwrap(), 2);
  }
}
