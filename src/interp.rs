//! The tree-walking evaluator (spec §4.4/§4.5) and its driver ([`Interp`]).
//!
//! `eval_expr`/`exec_stmt` are the two functions spec §9 calls out as
//! replacing the original's lexer-rewind resume protocol: each is written
//! as a plain `fn` returning a boxed, type-erased future
//! (`LocalBoxFuture`) rather than an `async fn`, which is what lets them
//! recurse into each other indirectly (Rust cannot otherwise name a type
//! that recurses through its own `impl Future`). Every other helper below
//! is an ordinary `async fn` — the recursion cycle is broken as soon as it
//! passes back through one of these two anchors, so nothing else needs
//! boxing. Suspension itself is never simulated: a coroutine's body really
//! is this future, and its one genuine suspend point is `.await` on
//! [`crate::runtime::AwaitFuture`] inside the `Await` expression handler.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::task::Context;

use futures::future::LocalBoxFuture;

use crate::ast::*;
use crate::builtins;
use crate::coroutine;
use crate::dict::Dict;
use crate::error::{Control, Error, EvalResult, Outcome};
use crate::module::{self, Config, ModuleCache};
use crate::runtime::{AwaitFuture, Runtime};
use crate::scope::Scope;
use crate::value::{
  BoundMethod, Blueprint, Coroutine, CoroutineBody, CoroutineKind, CoroutineState, Function, Native, Object, Value,
};

fn raise(msg: impl Into<String>) -> Outcome {
  Outcome::raise(Value::str(msg.into()))
}

/// Anything `show` can write to — an injectable sink so embedders (and
/// tests) can capture output instead of inheriting the process's real
/// stdout. Grounded on the teacher's own `isolate::Stdout`: any
/// `io::Write` qualifies, blanket-implemented rather than requiring a
/// bespoke wrapper type per sink.
pub trait Stdout: std::io::Write {}
impl<T: std::io::Write> Stdout for T {}

/// Per-process interpreter state: the coroutine runtime, the module
/// cache, the `load:` search configuration, and the `show` output sink
/// (spec §4.5, §5 "shared resources... single-owner, never accessed
/// concurrently").
pub struct Interp {
  pub runtime: Rc<Runtime>,
  modules: RefCell<ModuleCache>,
  config: Config,
  pub stdout: RefCell<Box<dyn Stdout>>,
  /// Set when `weaver.weave` drives a root coroutine to completion with an
  /// uncaught exception (spec §6: such a run still exits 1, even though
  /// `weave` itself returns `Null` to its EchoC caller rather than
  /// propagating the exception as a Rust `Err`).
  pub unhandled_async_error: RefCell<Option<String>>,
}

const GLOBAL_NATIVES: &[(&str, Native)] = &[
  ("show", Native::Show),
  ("type_of", Native::TypeOf),
  ("len", Native::Len),
  ("str", Native::Str),
  ("int", Native::Int),
  ("float", Native::Float),
  ("bool", Native::Bool),
  ("Array", Native::ArrayCtor),
  ("Dict", Native::DictCtor),
];

fn weaver_key() -> String {
  format!("{}weaver", module::BUILTIN_PREFIX)
}

fn weaver_exports() -> Dict {
  let mut dict = Dict::new();
  let pairs: &[(&str, Native)] = &[
    ("weave", Native::WeaverWeave),
    ("spawn_task", Native::WeaverSpawnTask),
    ("rest", Native::WeaverRest),
    ("gather", Native::WeaverGather),
    ("cancel", Native::WeaverCancel),
    ("yield_now", Native::WeaverYieldNow),
  ];
  for (name, native) in pairs {
    let _ = dict.insert(&Value::str(*name), Value::Native(*native));
  }
  dict
}

impl Interp {
  /// `weaver` is registered in the builtin-module cache up front so an
  /// explicit `load: weaver:` inside a loaded file observes the same
  /// cached `Dict` as the one bound directly into the root script's
  /// scope below.
  pub fn new(config: Config) -> Rc<Interp> {
    Interp::with_stdout(config, Box::new(std::io::stdout()))
  }

  pub fn with_stdout(config: Config, stdout: Box<dyn Stdout>) -> Rc<Interp> {
    let interp = Rc::new(Interp {
      runtime: Runtime::new(),
      modules: RefCell::new(ModuleCache::new()),
      config,
      stdout: RefCell::new(stdout),
      unhandled_async_error: RefCell::new(None),
    });
    let key = weaver_key();
    interp.modules.borrow_mut().begin_loading(key.clone());
    interp.modules.borrow_mut().finish_loading(key, weaver_exports());
    interp
  }

  fn bind_globals(self: &Rc<Self>, scope: &Scope) {
    for (name, native) in GLOBAL_NATIVES {
      scope.define(name, Value::Native(*native));
    }
    // `weaver` is usable without its own `load:` (spec leaves this to the
    // implementer: the end-to-end scenarios in spec §8 call
    // `weaver.weave(...)` with no preceding `load:` statement).
    if let Some(dict) = self.modules.borrow().get(&weaver_key()) {
      scope.define("weaver", Value::Dict(dict));
    }
  }

  /// Parse and run `src` (already leaked to `'static` by the caller, per
  /// the interpreter's source-text-outlives-everything strategy) as the
  /// top-level script. `dir` is the script's own directory, used to
  /// resolve relative `load:` paths.
  pub fn run(self: &Rc<Self>, src: &'static str, dir: Option<PathBuf>) -> Result<(), Error> {
    let module = crate::parser::parse(src).map_err(|mut errs| {
      errs
        .pop()
        .unwrap_or_else(|| Error::internal("the parser reported failure without an error"))
    })?;
    let module: &'static Module<'static> = Box::leak(Box::new(module));

    let global = Scope::root();
    self.bind_globals(&global);
    let env = Env {
      interp: self.clone(),
      scope: global,
      dir: dir.map(Rc::new),
      in_async: false,
      current_coroutine: None,
      call_depth: 0,
    };

    let result = match drive_synchronously(exec_block(env, &module.body)) {
      Ok(()) => Ok(()),
      Err(Outcome::Exception(v)) => Err(Error::runtime(v.to_string())),
      Err(Outcome::Control(_)) => Err(Error::internal("`break`/`continue`/`return` used at the top level")),
    };
    match (result, self.unhandled_async_error.borrow_mut().take()) {
      (Ok(()), Some(msg)) => Err(Error::runtime(msg)),
      (result, _) => result,
    }
  }
}

/// Drives a future that is known, by construction, not to suspend (the
/// top-level script runs outside any coroutine, so `await` is rejected
/// before it would ever register a waker) to completion with a no-op
/// waker.
fn drive_synchronously(mut fut: LocalBoxFuture<'static, EvalResult<()>>) -> EvalResult<()> {
  let waker = futures::task::noop_waker();
  let mut cx = Context::from_waker(&waker);
  match fut.as_mut().poll(&mut cx) {
    std::task::Poll::Ready(v) => v,
    std::task::Poll::Pending => Err(raise("internal: top-level script execution suspended unexpectedly")),
  }
}

/// Evaluation context threaded through every recursive call: cheap to
/// clone (two `Rc` bumps, a `Scope` handle, and an `Option`), so each
/// nested call gets its own copy rather than borrowing one mutably.
#[derive(Clone)]
pub struct Env {
  pub interp: Rc<Interp>,
  pub scope: Scope,
  /// Directory of the file currently executing, for relative `load:`
  /// resolution (spec §4.5). `None` at the root script if the script was
  /// supplied without a path (e.g. tests driving a source string).
  pub dir: Option<Rc<PathBuf>>,
  /// Whether the immediately enclosing `funct`/`async funct` is async —
  /// `await` outside one is a Runtime error (spec §7).
  pub in_async: bool,
  /// The coroutine this body is running as, when `in_async` — needed so
  /// `Await` can register itself as a waiter and reject self-awaits.
  pub current_coroutine: Option<Rc<Coroutine>>,
  /// Nesting depth of `funct` calls still on the way down, checked against
  /// [`MAX_CALL_DEPTH`] by [`call_function`] when `check-recursion-limit`
  /// is enabled (the default) — deep non-tail EchoC recursion would
  /// otherwise overflow the host stack rather than raise a catchable
  /// exception, since each nested call's `.await` chain drives its
  /// callee's future synchronously until the next real suspension point.
  pub call_depth: usize,
}

#[cfg(feature = "check-recursion-limit")]
const MAX_CALL_DEPTH: usize = 512;

impl Env {
  fn with_scope(&self, scope: Scope) -> Env {
    Env { scope, ..self.clone() }
  }

  fn with_async(&self, in_async: bool) -> Env {
    Env { in_async, ..self.clone() }
  }

  fn child(&self) -> Env {
    self.with_scope(self.scope.enter())
  }
}

enum LoopSignal {
  Break,
  Continue,
}

/// Evaluate `expr` to a [`Value`]. The one function, along with
/// [`exec_stmt`], that every recursive call in this module ultimately
/// passes back through.
pub fn eval_expr(env: Env, expr: &'static Expr<'static>) -> LocalBoxFuture<'static, EvalResult<Value>> {
  Box::pin(async move {
    match &**expr {
      ExprKind::Int(n) => Ok(Value::Int(*n)),
      ExprKind::Float(n) => Ok(Value::Float(*n)),
      ExprKind::Bool(b) => Ok(Value::Bool(*b)),
      ExprKind::Null => Ok(Value::Null),
      ExprKind::Str(parts) => eval_str(env, parts).await,
      ExprKind::Array(items) => {
        let mut values = Vec::with_capacity(items.len());
        for item in items {
          values.push(eval_expr(env.clone(), item).await?);
        }
        Ok(Value::Array(Rc::new(RefCell::new(values))))
      }
      ExprKind::Tuple(items) => {
        let mut values = Vec::with_capacity(items.len());
        for item in items {
          values.push(eval_expr(env.clone(), item).await?);
        }
        Ok(Value::Tuple(Rc::new(values)))
      }
      ExprKind::Dict(entries) => {
        let mut dict = Dict::new();
        for (key_expr, value_expr) in entries {
          let key = eval_expr(env.clone(), key_expr).await?;
          let value = eval_expr(env.clone(), value_expr).await?;
          dict.insert(&key, value).map_err(Outcome::from)?;
        }
        Ok(Value::Dict(Rc::new(RefCell::new(dict))))
      }
      ExprKind::Ident(name) => match env.scope.get(name) {
        Some(v) => Ok(v),
        None => Err(raise(format!("name not found: `{}`", name.as_ref()))),
      },
      ExprKind::SelfExpr => match env.scope.get("self") {
        Some(v) => Ok(v),
        None => Err(raise("`self` used outside of a method")),
      },
      ExprKind::SuperExpr => match env.scope.get("self") {
        Some(Value::Object(o)) => Ok(Value::SuperProxy(o)),
        _ => Err(raise("`super` used outside of a method")),
      },
      ExprKind::Paren(inner) => eval_expr(env, inner).await,
      ExprKind::Cond(then_expr, cond_expr, else_expr) => {
        let cond = eval_expr(env.clone(), cond_expr).await?;
        if cond.is_truthy() {
          eval_expr(env, then_expr).await
        } else {
          eval_expr(env, else_expr).await
        }
      }
      ExprKind::Await(inner) => eval_await(env, inner).await,
      ExprKind::Logical(op, lhs, rhs) => {
        let left = eval_expr(env.clone(), lhs).await?;
        match (op, left.is_truthy()) {
          (LogicalOp::And, false) | (LogicalOp::Or, true) => Ok(left),
          _ => eval_expr(env, rhs).await,
        }
      }
      ExprKind::Binary(op, lhs, rhs) => eval_binary(env, *op, lhs, rhs).await,
      ExprKind::Unary(op, operand) => eval_unary(env, *op, operand).await,
      ExprKind::Call(callee, args) => eval_call(env, callee, args).await,
      ExprKind::Index(base, index, optional) => {
        let base = eval_expr(env.clone(), base).await?;
        if *optional && matches!(base, Value::Null) {
          return Ok(Value::Null);
        }
        let index = eval_expr(env, index).await?;
        eval_index_get(base, index)
      }
      ExprKind::Attr(base, name, optional) => {
        let base = eval_expr(env, base).await?;
        if *optional && matches!(base, Value::Null) {
          return Ok(Value::Null);
        }
        eval_attr_get(base, name.as_ref())
      }
    }
  })
}

async fn eval_str(env: Env, parts: &'static [StrPart<'static>]) -> EvalResult<Value> {
  let mut out = String::new();
  for part in parts {
    match part {
      StrPart::Literal(text) => out.push_str(text),
      StrPart::Interp(expr) => {
        let value = eval_expr(env.clone(), expr).await?;
        let value = resolve_display_value(env.clone(), value).await?;
        out.push_str(&value.to_string());
      }
    }
  }
  Ok(Value::str(out))
}

/// Resolves an `Object` through its `op_str` method, if it has one,
/// before the caller falls back to [`Value`]'s own `Display` (spec §6:
/// "objects delegate to their `op_str` method if defined"). Used by both
/// `show(...)` and string interpolation.
async fn resolve_display_value(env: Env, value: Value) -> EvalResult<Value> {
  let Value::Object(o) = &value else {
    return Ok(value);
  };
  let Some(method) = o.blueprint.find_method("op_str") else {
    return Ok(value);
  };
  if method.is_async {
    return Err(raise("`op_str` must not be an async method"));
  }
  match call_function(env, method, Some(value), vec![], vec![]).await? {
    result @ Value::Str(_) => Ok(result),
    other => Err(raise(format!("`op_str` must return a String, found {}", other.type_name()))),
  }
}

async fn eval_await(env: Env, inner: &'static Expr<'static>) -> EvalResult<Value> {
  if !env.in_async {
    return Err(raise("`await` used outside of an `async funct`"));
  }
  let target_value = eval_expr(env.clone(), inner).await?;
  let target = match &target_value {
    Value::Coroutine(c) | Value::GatherTask(c) => c.clone(),
    other => return Err(raise(format!("cannot `await` a {}", other.type_name()))),
  };
  let awaiter = match &env.current_coroutine {
    Some(c) => c.clone(),
    None => return Err(raise("internal: `await` evaluated without an enclosing coroutine")),
  };
  if Rc::ptr_eq(&target, &awaiter) {
    return Err(raise("a coroutine cannot `await` itself"));
  }
  if let Some(result) = target.result.borrow().clone() {
    return result.map_err(Outcome::raise);
  }
  if matches!(*target.state.borrow(), CoroutineState::New) {
    env.interp.runtime.schedule(target.clone());
  }
  AwaitFuture::new(target, awaiter).await.map_err(Outcome::raise)
}

async fn eval_binary(env: Env, op: BinaryOp, lhs_expr: &'static Expr<'static>, rhs_expr: &'static Expr<'static>) -> EvalResult<Value> {
  let lhs = eval_expr(env.clone(), lhs_expr).await?;
  let rhs = eval_expr(env.clone(), rhs_expr).await?;
  match op {
    BinaryOp::Add => eval_add(env, lhs, rhs).await,
    BinaryOp::Sub => eval_numeric(lhs, rhs, "-", |a, b| a - b, |a, b| a - b),
    BinaryOp::Mul => eval_mul(lhs, rhs),
    BinaryOp::Div => eval_div(lhs, rhs),
    BinaryOp::Rem => eval_rem(lhs, rhs),
    BinaryOp::Pow => eval_pow(lhs, rhs),
    BinaryOp::Eq => Ok(Value::Bool(lhs.eq_value(&rhs))),
    BinaryOp::Ne => Ok(Value::Bool(!lhs.eq_value(&rhs))),
    BinaryOp::Is => Ok(Value::Bool(lhs.is_value(&rhs))),
    BinaryOp::IsNot => Ok(Value::Bool(!lhs.is_value(&rhs))),
    BinaryOp::Lt => eval_cmp(lhs, rhs).map(|o| Value::Bool(o.is_lt())),
    BinaryOp::Le => eval_cmp(lhs, rhs).map(|o| Value::Bool(o.is_le())),
    BinaryOp::Gt => eval_cmp(lhs, rhs).map(|o| Value::Bool(o.is_gt())),
    BinaryOp::Ge => eval_cmp(lhs, rhs).map(|o| Value::Bool(o.is_ge())),
  }
}

/// `+` (spec §4.4): numeric promotion, string concatenation when either
/// side is a string (both sides are stringified), or a call to an
/// `op_add` method — rejected at call time if that method is async
/// (spec §9 open question: "reject at call time rather than producing an
/// unawaitable coroutine from an arithmetic operator").
async fn eval_add(env: Env, lhs: Value, rhs: Value) -> EvalResult<Value> {
  if let (Value::Int(a), Value::Int(b)) = (&lhs, &rhs) {
    return Ok(Value::Int(a + b));
  }
  if let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) {
    return Ok(Value::Float(a + b));
  }
  if matches!(lhs, Value::Str(_)) || matches!(rhs, Value::Str(_)) {
    return Ok(Value::str(format!("{lhs}{rhs}")));
  }
  if let Value::Object(o) = &lhs {
    if let Some(method) = o.blueprint.find_method("op_add") {
      if method.is_async {
        return Err(raise("`op_add` must not be an async method"));
      }
      return call_function(env, method, Some(lhs.clone()), vec![rhs], vec![]).await;
    }
  }
  Err(raise(format!("unsupported operand types for +: {} and {}", lhs.type_name(), rhs.type_name())))
}

fn eval_numeric(lhs: Value, rhs: Value, op_name: &str, ints: impl Fn(i64, i64) -> i64, floats: impl Fn(f64, f64) -> f64) -> EvalResult<Value> {
  if let (Value::Int(a), Value::Int(b)) = (&lhs, &rhs) {
    return Ok(Value::Int(ints(*a, *b)));
  }
  match (lhs.as_number(), rhs.as_number()) {
    (Some(a), Some(b)) => Ok(Value::Float(floats(a, b))),
    _ => Err(raise(format!(
      "unsupported operand types for {op_name}: {} and {}",
      lhs.type_name(),
      rhs.type_name()
    ))),
  }
}

/// `*` (spec §4.4): numeric, or `(String, Int)`/`(Int, String)` repeat —
/// a negative count is a runtime error.
fn eval_mul(lhs: Value, rhs: Value) -> EvalResult<Value> {
  match (&lhs, &rhs) {
    (Value::Str(s), Value::Int(n)) | (Value::Int(n), Value::Str(s)) => {
      if *n < 0 {
        return Err(raise("string repeat count must not be negative"));
      }
      Ok(Value::str(s.repeat(*n as usize)))
    }
    _ => eval_numeric(lhs, rhs, "*", |a, b| a * b, |a, b| a * b),
  }
}

fn eval_div(lhs: Value, rhs: Value) -> EvalResult<Value> {
  if let (Value::Int(a), Value::Int(b)) = (&lhs, &rhs) {
    if *b == 0 {
      return Err(raise("division by zero"));
    }
    return Ok(Value::Int(a / b));
  }
  match (lhs.as_number(), rhs.as_number()) {
    (Some(_), Some(b)) if b == 0.0 => Err(raise("division by zero")),
    (Some(a), Some(b)) => Ok(Value::Float(a / b)),
    _ => Err(raise(format!("unsupported operand types for /: {} and {}", lhs.type_name(), rhs.type_name()))),
  }
}

/// `%` (spec §4.4): "requires two integers".
fn eval_rem(lhs: Value, rhs: Value) -> EvalResult<Value> {
  match (&lhs, &rhs) {
    (Value::Int(a), Value::Int(b)) => {
      if *b == 0 {
        Err(raise("division by zero"))
      } else {
        Ok(Value::Int(a % b))
      }
    }
    _ => Err(raise("`%` requires two integers")),
  }
}

/// `^` (spec §4.4): "always yields Float".
fn eval_pow(lhs: Value, rhs: Value) -> EvalResult<Value> {
  match (lhs.as_number(), rhs.as_number()) {
    (Some(a), Some(b)) => Ok(Value::Float(a.powf(b))),
    _ => Err(raise(format!("unsupported operand types for ^: {} and {}", lhs.type_name(), rhs.type_name()))),
  }
}

fn eval_cmp(lhs: Value, rhs: Value) -> EvalResult<std::cmp::Ordering> {
  if let (Value::Str(a), Value::Str(b)) = (&lhs, &rhs) {
    return Ok(a.as_ref().cmp(b.as_ref()));
  }
  match (lhs.as_number(), rhs.as_number()) {
    (Some(a), Some(b)) => Ok(a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)),
    _ => Err(raise(format!("unsupported operand types for comparison: {} and {}", lhs.type_name(), rhs.type_name()))),
  }
}

async fn eval_unary(env: Env, op: UnaryOp, operand_expr: &'static Expr<'static>) -> EvalResult<Value> {
  let value = eval_expr(env, operand_expr).await?;
  match op {
    UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
    UnaryOp::Neg => match value {
      Value::Int(n) => Ok(Value::Int(-n)),
      Value::Float(n) => Ok(Value::Float(-n)),
      other => Err(raise(format!("unary `-` requires a number, found {}", other.type_name()))),
    },
  }
}

fn eval_index_get(base: Value, index: Value) -> EvalResult<Value> {
  match base {
    Value::Array(a) => {
      let i = index.as_int().map_err(Outcome::from)?;
      let a = a.borrow();
      if i < 0 || i as usize >= a.len() {
        return Err(raise(format!("array index out of bounds: {i}")));
      }
      Ok(a[i as usize].clone())
    }
    Value::Tuple(t) => {
      let i = index.as_int().map_err(Outcome::from)?;
      if i < 0 || i as usize >= t.len() {
        return Err(raise(format!("tuple index out of bounds: {i}")));
      }
      Ok(t[i as usize].clone())
    }
    Value::Dict(d) => d.borrow().try_get(&index).map_err(Outcome::from),
    Value::Str(s) => {
      let i = index.as_int().map_err(Outcome::from)?;
      if i < 0 {
        return Err(raise(format!("string index out of bounds: {i}")));
      }
      match s.chars().nth(i as usize) {
        Some(c) => Ok(Value::str(c.to_string())),
        None => Err(raise(format!("string index out of bounds: {i}"))),
      }
    }
    other => Err(raise(format!("cannot index a {}", other.type_name()))),
  }
}

/// Attribute access (spec §4.4): instance attribute, then blueprint
/// method chain (wrapped as `BoundMethod`) for `Object`; class attribute
/// then method chain for `Blueprint`; key lookup for `Dict`; the virtual
/// `len` for `Array` (`append` is handled at the call site, see
/// [`eval_call`]); parent-method resolution for `super`.
fn eval_attr_get(base: Value, name: &str) -> EvalResult<Value> {
  match base {
    Value::Object(o) => {
      if let Ok(Some(v)) = o.attrs.borrow().get(&Value::str(name.to_string())) {
        return Ok(v.clone());
      }
      if let Some(f) = o.blueprint.find_method(name) {
        return Ok(Value::BoundMethod(Rc::new(BoundMethod {
          receiver: Value::Object(o.clone()),
          method: f,
        })));
      }
      Err(raise(format!("no attribute `{name}` on a `{}` object", o.blueprint.name)))
    }
    Value::Blueprint(bp) => {
      if let Ok(Some(v)) = bp.class_attrs.borrow().get(&Value::str(name.to_string())) {
        return Ok(v.clone());
      }
      if let Some(f) = bp.find_method(name) {
        return Ok(Value::Function(f));
      }
      Err(raise(format!("no attribute `{name}` on blueprint `{}`", bp.name)))
    }
    Value::Dict(d) => d.borrow().try_get(&Value::str(name.to_string())).map_err(Outcome::from),
    Value::Array(a) => {
      if name == "len" {
        Ok(Value::Int(a.borrow().len() as i64))
      } else {
        Err(raise(format!("arrays have no attribute `{name}`")))
      }
    }
    Value::SuperProxy(o) => {
      let parent = o
        .blueprint
        .parent
        .clone()
        .ok_or_else(|| raise("`super` used without a parent blueprint"))?;
      match parent.find_method(name) {
        Some(f) => Ok(Value::BoundMethod(Rc::new(BoundMethod {
          receiver: Value::Object(o.clone()),
          method: f,
        }))),
        None => Err(raise(format!("no attribute `{name}` on parent blueprint `{}`", parent.name))),
      }
    }
    other => Err(raise(format!("cannot access attribute `{name}` on a {}", other.type_name()))),
  }
}

async fn eval_call(env: Env, callee_expr: &'static Expr<'static>, args: &'static Args<'static>) -> EvalResult<Value> {
  // `<array>.append(x)` is a virtual method (spec §4.4), handled directly
  // rather than materializing a bound callable for it. The base is
  // evaluated exactly once regardless of which branch below ends up
  // handling the call, so a non-array base's side effects never repeat.
  if let ExprKind::Attr(base_expr, name, optional) = &**callee_expr {
    if name.as_ref() == "append" {
      let base = eval_expr(env.clone(), base_expr).await?;
      if *optional && matches!(base, Value::Null) {
        return Ok(Value::Null);
      }
      if let Value::Array(a) = &base {
        if !args.named.is_empty() {
          return Err(raise("`append` takes no named arguments"));
        }
        if args.positional.len() != 1 {
          return Err(raise(format!("`append` takes 1 argument, got {}", args.positional.len())));
        }
        let value = eval_expr(env.clone(), &args.positional[0]).await?;
        a.borrow_mut().push(value);
        return Ok(Value::Null);
      }
      let callee = eval_attr_get(base, name.as_ref())?;
      let (positional, named) = eval_args(env.clone(), args).await?;
      return eval_call_value(env, callee, positional, named).await;
    }
  }

  let callee = eval_expr(env.clone(), callee_expr).await?;
  let (positional, named) = eval_args(env.clone(), args).await?;
  eval_call_value(env, callee, positional, named).await
}

async fn eval_args(env: Env, args: &'static Args<'static>) -> EvalResult<(Vec<Value>, Vec<(String, Value)>)> {
  let mut positional = Vec::with_capacity(args.positional.len());
  for expr in &args.positional {
    positional.push(eval_expr(env.clone(), expr).await?);
  }
  let mut named: Vec<(String, Value)> = Vec::with_capacity(args.named.len());
  for (name, expr) in &args.named {
    if named.iter().any(|(n, _)| n == name.as_ref()) {
      return Err(raise(format!("duplicate named argument `{}`", name.as_ref())));
    }
    let value = eval_expr(env.clone(), expr).await?;
    named.push((name.as_ref().to_string(), value));
  }
  Ok((positional, named))
}

async fn eval_call_value(env: Env, callee: Value, positional: Vec<Value>, named: Vec<(String, Value)>) -> EvalResult<Value> {
  match callee {
    Value::Function(f) => call_function(env, f, None, positional, named).await,
    Value::BoundMethod(bm) => call_function(env, bm.method.clone(), Some(bm.receiver.clone()), positional, named).await,
    Value::Blueprint(bp) => instantiate(env, bp, positional, named).await,
    Value::Native(Native::Show) => {
      if !named.is_empty() {
        return Err(raise("`show` takes no named arguments"));
      }
      let mut resolved = Vec::with_capacity(positional.len());
      for v in positional {
        resolved.push(resolve_display_value(env.clone(), v).await?);
      }
      builtins::call(&env.interp, Native::Show, resolved, vec![])
    }
    Value::Native(Native::Str) if named.is_empty() && positional.len() == 1 => {
      let mut positional = positional;
      let v = positional.remove(0);
      let resolved = resolve_display_value(env.clone(), v).await?;
      builtins::call(&env.interp, Native::Str, vec![resolved], vec![])
    }
    Value::Native(n) => builtins::call(&env.interp, n, positional, named),
    other => Err(raise(format!("{} is not callable", other.type_name()))),
  }
}

async fn instantiate(env: Env, bp: Rc<Blueprint>, positional: Vec<Value>, named: Vec<(String, Value)>) -> EvalResult<Value> {
  let object = Rc::new(Object {
    blueprint: bp.clone(),
    attrs: RefCell::new(Dict::new()),
  });
  match bp.find_method("init") {
    Some(init) => {
      if init.is_async {
        return Err(raise("`init` may not be async"));
      }
      call_function(env, init, Some(Value::Object(object.clone())), positional, named).await?;
    }
    None => {
      if !positional.is_empty() || !named.is_empty() {
        return Err(raise(format!("`{}` has no `init` and takes no arguments", bp.name)));
      }
    }
  }
  Ok(Value::Object(object))
}

/// Binds `positional` then `named` args to `params` (spec §4.4), then
/// remaining defaults in declaration order — defaults are evaluated in
/// the callee's own new scope, so a later default may reference an
/// earlier parameter.
async fn bind_params(body_env: &Env, scope: &Scope, params: &'static Params<'static>, positional: Vec<Value>, mut named: Vec<(String, Value)>) -> EvalResult<()> {
  if positional.len() > params.params.len() {
    return Err(raise(format!(
      "too many positional arguments: expected at most {}, got {}",
      params.params.len(),
      positional.len()
    )));
  }
  for (i, param) in params.params.iter().enumerate() {
    let value = if i < positional.len() {
      positional[i].clone()
    } else if let Some(pos) = named.iter().position(|(n, _)| n == param.name.as_ref()) {
      named.remove(pos).1
    } else if let Some(default_expr) = &param.default {
      eval_expr(body_env.clone(), default_expr).await?
    } else {
      return Err(raise(format!("missing required argument `{}`", param.name.as_ref())));
    };
    scope.define(&param.name, value);
  }
  if let Some((bad_name, _)) = named.first() {
    return Err(raise(format!("unknown argument `{bad_name}`")));
  }
  Ok(())
}

/// Calls a user `Function`. A non-async function runs its body
/// synchronously here; an async function instead builds an unscheduled
/// `Task` coroutine (spec's "New" state — it starts running only once
/// passed to `weaver.weave`/`spawn_task`/`gather`, or directly
/// `await`ed) and returns it as the call's result.
async fn call_function(env: Env, f: Rc<Function>, receiver: Option<Value>, positional: Vec<Value>, named: Vec<(String, Value)>) -> EvalResult<Value> {
  #[cfg(feature = "check-recursion-limit")]
  if env.call_depth >= MAX_CALL_DEPTH {
    return Err(raise("maximum recursion depth exceeded"));
  }

  let call_scope = f.definition_scope.enter();
  if let Some(Value::Object(o)) = &receiver {
    call_scope.define_self(o.clone());
  }
  let mut body_env = env.with_scope(call_scope.clone()).with_async(f.is_async);
  body_env.call_depth = env.call_depth + 1;
  bind_params(&body_env, &call_scope, &f.decl.params, positional, named).await?;

  if f.is_async {
    // The body future needs to capture its own coroutine (to register as
    // an awaiter), which doesn't exist until the coroutine is built — so
    // build the coroutine with a throwaway placeholder body first, then
    // swap in the real one once `body_env` knows its own `Rc<Coroutine>`.
    let placeholder: CoroutineBody = Box::pin(async { Ok(Value::Null) });
    let coro = coroutine::new_task(f.name.clone(), placeholder);
    let body_env = body_env.with_scope(call_scope);
    let mut body_env = body_env;
    body_env.current_coroutine = Some(coro.clone());
    let real_body = run_function_body(body_env, &f.decl.body);
    *coro.kind.borrow_mut() = CoroutineKind::Task(Some(real_body));
    Ok(Value::Coroutine(coro))
  } else {
    let result = exec_block(body_env, &f.decl.body).await;
    function_result(result)
  }
}

/// Converts a completed block execution into a function's return value:
/// falling off the end returns `Null`; `return:` supplies the value;
/// anything else propagates (a stray `break`/`continue` becomes an
/// exception rather than escaping the function entirely).
fn function_result(result: Result<(), Outcome>) -> EvalResult<Value> {
  match result {
    Ok(()) => Ok(Value::Null),
    Err(Outcome::Control(Control::Return(v))) => Ok(v),
    Err(Outcome::Control(Control::Break)) | Err(Outcome::Control(Control::Continue)) => Err(raise("`break`/`continue` used outside of a loop")),
    Err(other) => Err(other),
  }
}

fn run_function_body(env: Env, body: &'static [Stmt<'static>]) -> CoroutineBody {
  Box::pin(async move {
    match function_result(exec_block(env, body).await) {
      Ok(v) => Ok(v),
      Err(Outcome::Exception(v)) => Err(v),
      Err(Outcome::Control(_)) => Err(Value::str("`break`/`continue` used outside of a loop")),
    }
  })
}

/// Executes a statement, returning `Ok(())` on normal fall-through or
/// `Err` carrying either a control-flow transfer or an exception (spec
/// §9's result/sum type, replacing the original's global flags). The
/// other anchor function every recursive call passes back through.
pub fn exec_stmt(env: Env, stmt: &'static Stmt<'static>) -> LocalBoxFuture<'static, EvalResult<()>> {
  Box::pin(async move {
    match &**stmt {
      StmtKind::Let(let_) => exec_let(env, let_).await,
      StmtKind::If(if_) => exec_if(env, if_).await,
      StmtKind::Loop(loop_) => exec_loop(env, loop_).await,
      StmtKind::Break => Err(Outcome::Control(Control::Break)),
      StmtKind::Continue => Err(Outcome::Control(Control::Continue)),
      StmtKind::Skip => Ok(()),
      StmtKind::Raise(expr) => {
        let value = eval_expr(env, expr).await?;
        match value {
          Value::Str(_) => Err(Outcome::raise(value)),
          other => Err(raise(format!("`raise:` requires a String value, found {}", other.type_name()))),
        }
      }
      StmtKind::Return(values) => {
        let value = match values.len() {
          0 => Value::Null,
          1 => eval_expr(env, &values[0]).await?,
          _ => {
            let mut items = Vec::with_capacity(values.len());
            for v in values {
              items.push(eval_expr(env.clone(), v).await?);
            }
            Value::Tuple(Rc::new(items))
          }
        };
        Err(Outcome::Control(Control::Return(value)))
      }
      StmtKind::Try(try_) => exec_try(env, try_).await,
      StmtKind::Func(decl) => {
        exec_func_decl(&env, decl);
        Ok(())
      }
      StmtKind::Blueprint(decl) => exec_blueprint_decl(env, decl).await,
      StmtKind::Load(load) => exec_load(env, load).await,
      StmtKind::Expr(expr) => {
        eval_expr(env, expr).await?;
        Ok(())
      }
    }
  })
}

fn exec_block(env: Env, stmts: &'static [Stmt<'static>]) -> LocalBoxFuture<'static, EvalResult<()>> {
  Box::pin(async move {
    for stmt in stmts {
      exec_stmt(env.clone(), stmt).await?;
    }
    Ok(())
  })
}

async fn exec_let(env: Env, let_: &'static Let<'static>) -> EvalResult<()> {
  let value = eval_expr(env.clone(), &let_.value).await?;
  match &let_.target {
    // `let:` always (re)defines in the innermost scope (spec §4.3
    // `define`) — EchoC has no bare reassignment operator, only `let:`.
    Target::Ident(name) => {
      env.scope.define(name, value);
      Ok(())
    }
    Target::Attr(base_expr, name) => {
      let base = eval_expr(env.clone(), base_expr).await?;
      match base {
        Value::Object(o) => o
          .attrs
          .borrow_mut()
          .insert(&Value::str(name.as_ref().to_string()), value)
          .map_err(Outcome::from),
        other => Err(raise(format!("cannot assign an attribute on a {}", other.type_name()))),
      }
    }
    Target::Index(base_expr, indices) => exec_index_assign(env, base_expr, indices, value).await,
  }
}

async fn exec_index_assign(env: Env, base_expr: &'static Expr<'static>, indices: &'static [Expr<'static>], value: Value) -> EvalResult<()> {
  let mut container = eval_expr(env.clone(), base_expr).await?;
  for idx_expr in &indices[..indices.len() - 1] {
    let idx = eval_expr(env.clone(), idx_expr).await?;
    container = eval_index_get(container, idx)?;
  }
  let idx = eval_expr(env.clone(), &indices[indices.len() - 1]).await?;
  match container {
    Value::Array(a) => {
      let i = idx.as_int().map_err(Outcome::from)?;
      let mut a = a.borrow_mut();
      if i < 0 || i as usize >= a.len() {
        return Err(raise(format!("array index out of bounds: {i}")));
      }
      a[i as usize] = value;
      Ok(())
    }
    Value::Dict(d) => d.borrow_mut().insert(&idx, value).map_err(Outcome::from),
    Value::Tuple(_) => Err(raise("tuples are immutable")),
    other => Err(raise(format!("cannot index-assign into a {}", other.type_name()))),
  }
}

async fn exec_if(env: Env, if_: &'static If<'static>) -> EvalResult<()> {
  let cond = eval_expr(env.clone(), &if_.cond).await?;
  if cond.is_truthy() {
    return exec_block(env.child(), &if_.then).await;
  }
  for (elif_cond, elif_body) in &if_.elifs {
    let value = eval_expr(env.clone(), elif_cond).await?;
    if value.is_truthy() {
      return exec_block(env.child(), elif_body).await;
    }
  }
  if let Some(else_body) = &if_.else_ {
    return exec_block(env.child(), else_body).await;
  }
  Ok(())
}

async fn exec_loop(env: Env, loop_: &'static LoopStmt<'static>) -> EvalResult<()> {
  match loop_ {
    LoopStmt::While(w) => exec_while(env, w).await,
    LoopStmt::ForRange(r) => exec_for_range(env, r).await,
    LoopStmt::ForIn(i) => exec_for_in(env, i).await,
  }
}

async fn run_loop_body(env: Env, body: &'static [Stmt<'static>]) -> EvalResult<LoopSignal> {
  match exec_block(env, body).await {
    Ok(()) => Ok(LoopSignal::Continue),
    Err(Outcome::Control(Control::Break)) => Ok(LoopSignal::Break),
    Err(Outcome::Control(Control::Continue)) => Ok(LoopSignal::Continue),
    Err(other) => Err(other),
  }
}

async fn exec_while(env: Env, w: &'static WhileLoop<'static>) -> EvalResult<()> {
  loop {
    let cond = eval_expr(env.clone(), &w.cond).await?;
    if !cond.is_truthy() {
      return Ok(());
    }
    if let LoopSignal::Break = run_loop_body(env.child(), &w.body).await? {
      return Ok(());
    }
  }
}

fn add_numbers(a: &Value, b: &Value) -> Value {
  if let (Value::Int(x), Value::Int(y)) = (a, b) {
    return Value::Int(x + y);
  }
  Value::Float(a.as_number().unwrap_or(0.0) + b.as_number().unwrap_or(0.0))
}

async fn exec_for_range(env: Env, r: &'static ForRangeLoop<'static>) -> EvalResult<()> {
  let start = eval_expr(env.clone(), &r.start).await?;
  let end = eval_expr(env.clone(), &r.end).await?;
  let step = match &r.step {
    Some(expr) => eval_expr(env.clone(), expr).await?,
    None => Value::Int(1),
  };
  let step_n = step.as_number().ok_or_else(|| raise("loop step must be a number"))?;
  if step_n == 0.0 {
    return Err(raise("loop step must not be zero"));
  }

  let loop_scope = env.scope.enter();
  let mut cur = start;
  loop_scope.define(&r.var, cur.clone());
  loop {
    let end_n = end.as_number().ok_or_else(|| raise("loop bound must be a number"))?;
    let cur_n = cur.as_number().ok_or_else(|| raise("loop variable must be a number"))?;
    let done = if step_n > 0.0 { cur_n >= end_n } else { cur_n <= end_n };
    if done {
      return Ok(());
    }
    let body_env = env.with_scope(loop_scope.enter());
    if let LoopSignal::Break = run_loop_body(body_env, &r.body).await? {
      return Ok(());
    }
    cur = add_numbers(&cur, &step);
    loop_scope.define(&r.var, cur.clone());
  }
}

async fn exec_for_in(env: Env, f: &'static ForInLoop<'static>) -> EvalResult<()> {
  let iterable = eval_expr(env.clone(), &f.iter).await?;
  let items: Vec<Value> = match &iterable {
    Value::Array(a) => a.borrow().clone(),
    Value::Tuple(t) => t.as_ref().clone(),
    Value::Str(s) => s.chars().map(|c| Value::str(c.to_string())).collect(),
    Value::Dict(d) => d.borrow().keys().collect(),
    other => return Err(raise(format!("cannot iterate over a {}", other.type_name()))),
  };

  let loop_scope = env.scope.enter();
  for item in items {
    loop_scope.define(&f.var, item);
    let body_env = env.with_scope(loop_scope.enter());
    if let LoopSignal::Break = run_loop_body(body_env, &f.body).await? {
      return Ok(());
    }
  }
  Ok(())
}

/// try/catch/finally (spec §4.5): `finally` always runs; if it raises or
/// transfers control itself, that supersedes whatever the try/catch
/// produced, otherwise the try/catch outcome is restored. Writing this
/// as plain Rust control flow replaces the original's stash-pending-
/// state-then-restore dance across a set of interpreter-global flags.
async fn exec_try(env: Env, try_: &'static Try<'static>) -> EvalResult<()> {
  let body_result = exec_block(env.child(), &try_.body).await;

  let after_catch = match body_result {
    Err(Outcome::Exception(exc)) => match &try_.catch {
      Some(catch) => {
        let catch_env = env.child();
        if let Some(name) = &catch.name {
          catch_env.scope.define(name, exc);
        }
        exec_block(catch_env, &catch.body).await
      }
      None => Err(Outcome::Exception(exc)),
    },
    other => other,
  };

  match &try_.finally {
    Some(finally_body) => match exec_block(env.child(), finally_body).await {
      Ok(()) => after_catch,
      Err(superseding) => Err(superseding),
    },
    None => after_catch,
  }
}

fn exec_func_decl(env: &Env, decl: &'static FuncDecl<'static>) {
  let f = Rc::new(Function {
    name: Rc::from(decl.name.as_ref()),
    decl,
    definition_scope: env.scope.clone(),
    is_async: decl.is_async,
  });
  env.scope.define(decl.name.as_ref(), Value::Function(f));
}

async fn exec_blueprint_decl(env: Env, decl: &'static BlueprintDecl<'static>) -> EvalResult<()> {
  let parent = match &decl.parent {
    Some(name) => match env.scope.get(name) {
      Some(Value::Blueprint(p)) => Some(p),
      Some(other) => {
        return Err(raise(format!(
          "`inherits {}` does not name a blueprint (found {})",
          name.as_ref(),
          other.type_name()
        )))
      }
      None => return Err(raise(format!("name not found: `{}`", name.as_ref()))),
    },
    None => None,
  };

  let class_attrs = Rc::new(RefCell::new(Dict::new()));
  let methods: Rc<RefCell<HashMap<String, Rc<Function>>>> = Rc::new(RefCell::new(HashMap::new()));
  let blueprint = Rc::new(Blueprint {
    name: Rc::from(decl.name.as_ref()),
    parent,
    class_attrs: class_attrs.clone(),
    methods: methods.clone(),
  });

  for attr in &decl.attrs {
    let value = eval_expr(env.clone(), &attr.value).await?;
    let name = match &attr.target {
      Target::Ident(name) => name.as_ref(),
      _ => return Err(raise("a blueprint's class attributes must be simple names")),
    };
    class_attrs.borrow_mut().insert(&Value::str(name.to_string()), value).map_err(Outcome::from)?;
  }

  for method in &decl.methods {
    if method.is_async && method.name.as_ref() == "init" {
      return Err(raise("`init` may not be async"));
    }
    let f = Rc::new(Function {
      name: Rc::from(method.name.as_ref()),
      decl: method,
      definition_scope: env.scope.clone(),
      is_async: method.is_async,
    });
    methods.borrow_mut().insert(method.name.as_ref().to_string(), f);
  }

  env.scope.define(decl.name.as_ref(), Value::Blueprint(blueprint));
  Ok(())
}

async fn exec_load(env: Env, load: &'static Load<'static>) -> EvalResult<()> {
  match load {
    Load::Module { path, alias } => {
      let name = path.as_ref();
      let value = load_module_value(&env, name).await?;
      let bind = alias.as_ref().map(|a| a.as_ref()).unwrap_or(name);
      env.scope.define(bind, value);
      Ok(())
    }
    Load::Names { names, path } => {
      let value = load_module_value(&env, path.as_ref()).await?;
      for (name, alias) in names {
        let looked_up = match &value {
          Value::Dict(d) => d.borrow().try_get(&Value::str(name.as_ref().to_string())).map_err(Outcome::from)?,
          // circular import: a still-loading module is observed as Null
          // for every name requested from it (spec §8 property 10).
          Value::Null => Value::Null,
          other => return Err(raise(format!("cannot import names from a {}", other.type_name()))),
        };
        let bind = alias.as_ref().map(|a| a.as_ref()).unwrap_or(name.as_ref());
        env.scope.define(bind, looked_up);
      }
      Ok(())
    }
  }
}

/// Resolves and (if necessary) executes `name`, returning its module
/// value — `Null` if it is still loading (spec's circular-import
/// placeholder, redesigned per spec §9 as a `Loading | Loaded(Dict)`
/// cache entry rather than a literal stored `Null`).
async fn load_module_value(env: &Env, name: &str) -> EvalResult<Value> {
  if module::is_builtin_name(name) {
    let key = format!("{}{}", module::BUILTIN_PREFIX, name);
    if let Some(d) = env.interp.modules.borrow().get(&key) {
      return Ok(Value::Dict(d));
    }
    if env.interp.modules.borrow().is_loading(&key) {
      return Ok(Value::Null);
    }
    env.interp.modules.borrow_mut().begin_loading(key.clone());
    let dict = env.interp.modules.borrow_mut().finish_loading(key, weaver_exports());
    return Ok(Value::Dict(dict));
  }

  let path = module::resolve(name, env.dir.as_ref().map(|p| p.as_path()), &env.interp.config).map_err(Outcome::from)?;
  let key = path.to_string_lossy().into_owned();
  if let Some(d) = env.interp.modules.borrow().get(&key) {
    return Ok(Value::Dict(d));
  }
  if env.interp.modules.borrow().is_loading(&key) {
    return Ok(Value::Null);
  }
  env.interp.modules.borrow_mut().begin_loading(key.clone());
  let exports = execute_module_file(env, &path).await?;
  let dict = env.interp.modules.borrow_mut().finish_loading(key, exports);
  Ok(Value::Dict(dict))
}

/// Runs a loaded file's top-level statements in a brand-new scope (spec
/// §4.5: "a module runs in a fresh top-level scope, no inherited
/// globals") and collects every binding whose name does not start with
/// `_` into its export `Dict`.
async fn execute_module_file(env: &Env, path: &Path) -> EvalResult<Dict> {
  let src = std::fs::read_to_string(path).map_err(|e| raise(format!("failed to read module `{}`: {e}", path.display())))?;
  let src: &'static str = Box::leak(src.into_boxed_str());
  let parsed = crate::parser::parse(src).map_err(|errs| {
    let messages: Vec<String> = errs.into_iter().map(|e| e.message).collect();
    raise(format!("failed to parse module `{}`: {}", path.display(), messages.join("; ")))
  })?;
  let parsed: &'static Module<'static> = Box::leak(Box::new(parsed));

  let module_scope = Scope::root();
  let module_env = Env {
    interp: env.interp.clone(),
    scope: module_scope.clone(),
    dir: path.parent().map(|d| Rc::new(d.to_path_buf())),
    in_async: false,
    current_coroutine: None,
    call_depth: 0,
  };
  exec_block(module_env, &parsed.body).await.map_err(|o| match o {
    Outcome::Exception(v) => Outcome::Exception(v),
    Outcome::Control(_) => raise("`break`/`continue`/`return` used at module top level"),
  })?;

  let mut exports = Dict::new();
  for (name, value) in module_scope.local_bindings() {
    if !name.starts_with('_') {
      let _ = exports.insert(&Value::str(name), value);
    }
  }
  Ok(exports)
}
