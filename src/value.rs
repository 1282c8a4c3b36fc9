//! The tagged value union (spec §3, §4.2).
//!
//! Primitives are `Copy`/by-value; containers (`Array`, `Dict`, `Tuple`,
//! `Function`, `Blueprint`) are shared via `Rc<RefCell<_>>`, giving callers
//! the aliasing spec §4.2 requires without a hand-rolled refcount field;
//! `Object`/`BoundMethod`/`Coroutine`/`GatherTask` are likewise `Rc`-based —
//! `Rc::clone`/drop *is* the refcount increment/decrement spec §9 asks a
//! rewrite to replace manual bookkeeping with.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::ast::FuncDecl;
use crate::dict::Dict;
use crate::error::{Error, Result};
use crate::scope::Scope;

pub type ArrayRef = Rc<RefCell<Vec<Value>>>;
pub type DictRef = Rc<RefCell<Dict>>;
pub type TupleRef = Rc<Vec<Value>>;

/// `decl` borrows from the module's source text, which is leaked to
/// `'static` once at load time ([`crate::interp`]) rather than cloned per
/// function — the whole parsed tree outlives the process, so a plain
/// reference needs no refcount of its own.
#[derive(Clone)]
pub struct Function {
  pub name: Rc<str>,
  pub decl: &'static FuncDecl<'static>,
  pub definition_scope: Scope,
  pub is_async: bool,
}

#[derive(Clone)]
pub struct Blueprint {
  pub name: Rc<str>,
  pub parent: Option<Rc<Blueprint>>,
  pub class_attrs: Rc<RefCell<Dict>>,
  pub methods: Rc<RefCell<std::collections::HashMap<String, Rc<Function>>>>,
}

impl Blueprint {
  /// Walks the parent chain looking for a method, the way attribute
  /// resolution on an `Object` does (spec §4.4 attribute access).
  pub fn find_method(&self, name: &str) -> Option<Rc<Function>> {
    if let Some(m) = self.methods.borrow().get(name) {
      return Some(m.clone());
    }
    self.parent.as_ref().and_then(|p| p.find_method(name))
  }

  pub fn is_subclass_of(&self, other: &Blueprint) -> bool {
    if Rc::ptr_eq(&self.methods, &other.methods) {
      return true;
    }
    self.parent.as_ref().map_or(false, |p| p.is_subclass_of(other))
  }
}

pub struct Object {
  pub blueprint: Rc<Blueprint>,
  pub attrs: RefCell<Dict>,
}

pub struct BoundMethod {
  pub receiver: Value,
  pub method: Rc<Function>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoroutineState {
  New,
  Runnable,
  SuspendedAwait,
  SuspendedTimer,
  GatherWait,
  Resuming,
  Done,
}

pub type CoroutineBody = futures::future::LocalBoxFuture<'static, Result<Value, Value>>;

/// A suspendable unit of execution (spec §3 `Coroutine`, §4.6). Its body is
/// a boxed native `async fn` future rather than a saved lexer-rewind
/// state/replay flag — spec §9 calls this "the single largest
/// simplification available to a rewrite", and the Rust compiler's own
/// per-`await` state machine is exactly the "explicit continuation record
/// per suspend point" it asks for. The executor in [`crate::runtime`]
/// gives each coroutine its own `Waker` (backed by `waiters` below); waking
/// one re-enqueues its owner, matching spec §4.6's wording without a
/// generic reactor.
pub struct Coroutine {
  pub name: Rc<str>,
  pub state: RefCell<CoroutineState>,
  pub result: RefCell<Option<Result<Value, Value>>>,
  /// Futures parked on `AwaitFuture::poll` against this coroutine. Waking
  /// one re-schedules its owner onto the runtime's ready queue — see
  /// [`crate::runtime`]'s custom `Waker`.
  pub waiters: RefCell<Vec<std::task::Waker>>,
  /// What this coroutine is currently awaiting, if anything. Strong: spec
  /// says "the `awaiting_on` field does hold a refcount on the target".
  pub awaiting_on: RefCell<Option<Rc<Coroutine>>>,
  pub parent_gather: RefCell<Option<std::rc::Weak<Coroutine>>>,
  pub gather_index: std::cell::Cell<Option<usize>>,
  pub is_cancelled: std::cell::Cell<bool>,
  pub in_ready_queue: std::cell::Cell<bool>,
  /// Wakeup deadline on the runtime's virtual clock; only meaningful for
  /// `Timer`.
  pub wakeup_time: std::cell::Cell<Option<f64>>,
  pub kind: RefCell<CoroutineKind>,
}

pub enum CoroutineKind {
  /// Produced by calling an `async funct`; `None` once it has run to
  /// completion (the future is consumed by its final `poll`).
  Task(Option<CoroutineBody>),
  /// `weaver.rest(ms)` — never runs a body, just sleeps.
  Timer,
  /// `weaver.gather([...])`.
  Gather(GatherState),
}

pub struct GatherState {
  pub children: Vec<Rc<Coroutine>>,
  pub results: Vec<Option<Result<Value, Value>>>,
  pub pending: usize,
  pub first_exception_idx: Option<usize>,
  pub return_exceptions: bool,
}

impl fmt::Debug for Coroutine {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "<coroutine {} state={:?}>", self.name, self.state.borrow())
  }
}

/// A built-in implemented in Rust (spec §4.7's standard-library surface).
/// `Copy`, not `Rc`-wrapped: there is exactly one instance of each, and
/// dispatch on it is a plain `match` in [`crate::builtins`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Native {
  Show,
  TypeOf,
  Len,
  Str,
  Int,
  Float,
  Bool,
  ArrayCtor,
  DictCtor,
  WeaverWeave,
  WeaverSpawnTask,
  WeaverRest,
  WeaverGather,
  WeaverCancel,
  WeaverYieldNow,
}

impl Native {
  pub fn name(self) -> &'static str {
    match self {
      Native::Show => "show",
      Native::TypeOf => "type_of",
      Native::Len => "len",
      Native::Str => "str",
      Native::Int => "int",
      Native::Float => "float",
      Native::Bool => "bool",
      Native::ArrayCtor => "Array",
      Native::DictCtor => "Dict",
      Native::WeaverWeave => "weaver.weave",
      Native::WeaverSpawnTask => "weaver.spawn_task",
      Native::WeaverRest => "weaver.rest",
      Native::WeaverGather => "weaver.gather",
      Native::WeaverCancel => "weaver.cancel",
      Native::WeaverYieldNow => "weaver.yield_now",
    }
  }
}

#[derive(Clone)]
pub enum Value {
  Int(i64),
  Float(f64),
  Bool(bool),
  Null,
  Str(Rc<str>),
  Array(ArrayRef),
  Dict(DictRef),
  Tuple(TupleRef),
  Function(Rc<Function>),
  Blueprint(Rc<Blueprint>),
  Object(Rc<Object>),
  BoundMethod(Rc<BoundMethod>),
  Coroutine(Rc<Coroutine>),
  GatherTask(Rc<Coroutine>),
  SuperProxy(Rc<Object>),
  Native(Native),
}

impl Value {
  pub fn str(s: impl Into<Rc<str>>) -> Value {
    Value::Str(s.into())
  }

  pub fn type_name(&self) -> &'static str {
    match self {
      Value::Int(_) => "int",
      Value::Float(_) => "float",
      Value::Bool(_) => "bool",
      Value::Null => "null",
      Value::Str(_) => "str",
      Value::Array(_) => "array",
      Value::Dict(_) => "dict",
      Value::Tuple(_) => "tuple",
      Value::Function(_) => "function",
      Value::Blueprint(_) => "blueprint",
      Value::Object(_) => "object",
      Value::BoundMethod(_) => "bound_method",
      Value::Coroutine(_) => "coroutine",
      Value::GatherTask(_) => "gather_task",
      Value::SuperProxy(_) => "super",
      Value::Native(_) => "function",
    }
  }

  /// Truthiness (spec §4.2): `Null` → false, `Bool` as-is, zero/empty → false.
  pub fn is_truthy(&self) -> bool {
    match self {
      Value::Null => false,
      Value::Bool(b) => *b,
      Value::Int(n) => *n != 0,
      Value::Float(n) => *n != 0.0,
      Value::Str(s) => !s.is_empty(),
      Value::Array(a) => !a.borrow().is_empty(),
      Value::Dict(d) => !d.borrow().is_empty(),
      Value::Tuple(t) => !t.is_empty(),
      _ => true,
    }
  }

  /// Recursive structural copy (spec §4.2 `deep_copy`): primitives are
  /// returned by value (`Clone` already does this); `Array`/`Dict`/`Tuple`
  /// allocate a fresh container and deep-copy their elements; `Function` is
  /// logically immutable and is shared; `Blueprint`/`Object`/`BoundMethod`/
  /// `Coroutine`/`GatherTask` are `Rc`-shared, so cloning the handle *is*
  /// the refcount increment spec §4.2 describes.
  pub fn deep_copy(&self) -> Value {
    match self {
      Value::Array(a) => {
        let copied: Vec<Value> = a.borrow().iter().map(Value::deep_copy).collect();
        Value::Array(Rc::new(RefCell::new(copied)))
      }
      Value::Dict(d) => Value::Dict(Rc::new(RefCell::new(d.borrow().deep_copy()))),
      Value::Tuple(t) => {
        let copied: Vec<Value> = t.iter().map(Value::deep_copy).collect();
        Value::Tuple(Rc::new(copied))
      }
      other => other.clone(),
    }
  }

  /// Structural equality with `Int`/`Float` coercion (spec §4.2); pointer
  /// identity for `Function`/`Blueprint`/`Object`/`Coroutine`.
  pub fn eq_value(&self, other: &Value) -> bool {
    use Value::*;
    match (self, other) {
      (Int(a), Int(b)) => a == b,
      (Float(a), Float(b)) => a == b,
      (Int(a), Float(b)) | (Float(b), Int(a)) => (*a as f64) == *b,
      (Bool(a), Bool(b)) => a == b,
      (Null, Null) => true,
      (Str(a), Str(b)) => a == b,
      (Array(a), Array(b)) => {
        let a = a.borrow();
        let b = b.borrow();
        a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.eq_value(y))
      }
      (Tuple(a), Tuple(b)) => a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.eq_value(y)),
      (Dict(a), Dict(b)) => a.borrow().eq_value(&b.borrow()),
      (Function(a), Function(b)) => Rc::ptr_eq(a, b),
      (Blueprint(a), Blueprint(b)) => Rc::ptr_eq(a, b),
      (Object(a), Object(b)) => Rc::ptr_eq(a, b),
      (Coroutine(a), Coroutine(b)) => Rc::ptr_eq(a, b),
      (GatherTask(a), GatherTask(b)) => Rc::ptr_eq(a, b),
      (Native(a), Native(b)) => a == b,
      _ => false,
    }
  }

  /// `is` — identity comparison for every type (spec §4.2). Implies
  /// `eq_value` for comparable types but not conversely (spec §8 property 5).
  pub fn is_value(&self, other: &Value) -> bool {
    use Value::*;
    match (self, other) {
      (Array(a), Array(b)) => Rc::ptr_eq(a, b),
      (Dict(a), Dict(b)) => Rc::ptr_eq(a, b),
      (Tuple(a), Tuple(b)) => Rc::ptr_eq(a, b),
      (Function(a), Function(b)) => Rc::ptr_eq(a, b),
      (Blueprint(a), Blueprint(b)) => Rc::ptr_eq(a, b),
      (Object(a), Object(b)) => Rc::ptr_eq(a, b),
      (BoundMethod(a), BoundMethod(b)) => Rc::ptr_eq(a, b),
      (Coroutine(a), Coroutine(b)) => Rc::ptr_eq(a, b),
      (GatherTask(a), GatherTask(b)) => Rc::ptr_eq(a, b),
      (Str(a), Str(b)) => Rc::ptr_eq(a, b) || a == b,
      _ => self.eq_value(other),
    }
  }

  pub fn as_str(&self) -> Result<&Rc<str>> {
    match self {
      Value::Str(s) => Ok(s),
      other => Err(Error::runtime(format!("expected a string, found {}", other.type_name()))),
    }
  }

  pub fn as_int(&self) -> Result<i64> {
    match self {
      Value::Int(n) => Ok(*n),
      other => Err(Error::runtime(format!("expected an int, found {}", other.type_name()))),
    }
  }

  pub fn as_coroutine(&self) -> Result<&Rc<Coroutine>> {
    match self {
      Value::Coroutine(c) | Value::GatherTask(c) => Ok(c),
      other => Err(Error::runtime(format!("expected a coroutine, found {}", other.type_name()))),
    }
  }

  pub fn as_number(&self) -> Option<f64> {
    match self {
      Value::Int(n) => Some(*n as f64),
      Value::Float(n) => Some(*n),
      _ => None,
    }
  }
}

impl fmt::Display for Value {
  /// User-visible representation used by `show(...)` (spec §6) when the
  /// value is not an `Object` with an `op_str` override — that override is
  /// resolved by the evaluator, which calls `op_str` before falling back to
  /// this formatter.
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Value::Int(n) => write!(f, "{n}"),
      Value::Float(n) => write!(f, "{n}"),
      Value::Bool(b) => write!(f, "{b}"),
      Value::Null => write!(f, "null"),
      Value::Str(s) => write!(f, "{s}"),
      Value::Array(a) => {
        write!(f, "[")?;
        for (i, v) in a.borrow().iter().enumerate() {
          if i > 0 {
            write!(f, ", ")?;
          }
          write!(f, "{v}")?;
        }
        write!(f, "]")
      }
      Value::Tuple(t) => {
        write!(f, "(")?;
        for (i, v) in t.iter().enumerate() {
          if i > 0 {
            write!(f, ", ")?;
          }
          write!(f, "{v}")?;
        }
        if t.len() == 1 {
          write!(f, ",")?;
        }
        write!(f, ")")
      }
      Value::Dict(d) => write!(f, "{}", d.borrow()),
      Value::Function(fun) => write!(f, "<function {}>", fun.name),
      Value::Blueprint(b) => write!(f, "<blueprint {}>", b.name),
      Value::Object(o) => write!(f, "<{} object>", o.blueprint.name),
      Value::BoundMethod(m) => write!(f, "<bound method {}>", m.method.name),
      Value::Coroutine(c) => write!(f, "<coroutine {}>", c.name),
      Value::GatherTask(_) => write!(f, "<gather_task>"),
      Value::SuperProxy(_) => write!(f, "<super>"),
      Value::Native(n) => write!(f, "<built-in function {}>", n.name()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn truthiness_matches_spec() {
    assert!(!Value::Null.is_truthy());
    assert!(!Value::Int(0).is_truthy());
    assert!(!Value::str("").is_truthy());
    assert!(Value::str("x").is_truthy());
    assert!(!Value::Array(Rc::new(RefCell::new(vec![]))).is_truthy());
  }

  #[test]
  fn int_float_equality_coerces() {
    assert!(Value::Int(2).eq_value(&Value::Float(2.0)));
  }

  #[test]
  fn container_aliasing_via_rc() {
    let a = Value::Array(Rc::new(RefCell::new(vec![Value::Int(1)])));
    let b = a.clone();
    if let Value::Array(arr) = &b {
      arr.borrow_mut()[0] = Value::Int(9);
    }
    if let Value::Array(arr) = &a {
      assert_eq!(arr.borrow()[0].as_int().unwrap(), 9);
    }
  }

  #[test]
  fn deep_copy_breaks_aliasing() {
    let a = Value::Array(Rc::new(RefCell::new(vec![Value::Int(1)])));
    let b = a.deep_copy();
    if let Value::Array(arr) = &b {
      arr.borrow_mut()[0] = Value::Int(9);
    }
    if let Value::Array(arr) = &a {
      assert_eq!(arr.borrow()[0].as_int().unwrap(), 1);
    }
  }
}
