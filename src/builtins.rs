//! The built-in globals and the `weaver` module surface (spec §4.7, §6).
//!
//! Grounded in the teacher's `NativeFunction`/`builtins.rs` pattern: a
//! native is a plain enum tag ([`crate::value::Native`]) rather than a
//! boxed closure, dispatched by a single `match` here. None of these need
//! to themselves `.await` — `weave` drives the event loop to completion
//! synchronously before returning, and `rest`/`gather`/`spawn_task`
//! construct coroutines without awaiting them (the EchoC `await`
//! expression is what later awaits the coroutine they hand back).

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use crate::coroutine;
use crate::dict::Dict;
use crate::error::{EvalResult, Outcome};
use crate::interp::Interp;
use crate::value::{Coroutine, Native, Value};

fn arity_error(native: Native, want: &str, got: usize) -> Outcome {
  Outcome::Exception(Value::str(format!(
    "{} takes {want}, got {got}",
    native.name()
  )))
}

fn type_error(native: Native, message: impl std::fmt::Display) -> Outcome {
  Outcome::Exception(Value::str(format!("{}: {message}", native.name())))
}

/// Dispatch a call to a [`Native`]. `named` currently only matters to
/// `weaver.gather`'s `return_exceptions` (spec §4.4: "For C-implemented
/// builtins, named args are rejected except where explicitly
/// whitelisted").
pub fn call(interp: &Interp, native: Native, positional: Vec<Value>, named: Vec<(String, Value)>) -> EvalResult<Value> {
  let runtime = &interp.runtime;
  match native {
    Native::Show => {
      let mut out = interp.stdout.borrow_mut();
      for v in &positional {
        let _ = write!(out, "{v}");
      }
      let _ = writeln!(out);
      Ok(Value::Null)
    }
    Native::TypeOf => {
      let [v] = one(native, positional)?;
      Ok(Value::str(type_of_name(&v)))
    }
    Native::Len => {
      let [v] = one(native, positional)?;
      Ok(Value::Int(len_of(native, &v)?))
    }
    Native::Str => {
      let [v] = one(native, positional)?;
      Ok(Value::str(v.to_string()))
    }
    Native::Int => {
      let [v] = one(native, positional)?;
      Ok(Value::Int(to_int(native, &v)?))
    }
    Native::Float => {
      let [v] = one(native, positional)?;
      Ok(Value::Float(to_float(native, &v)?))
    }
    Native::Bool => {
      let [v] = one(native, positional)?;
      Ok(Value::Bool(v.is_truthy()))
    }
    Native::ArrayCtor => {
      if !positional.is_empty() {
        return Err(arity_error(native, "0 arguments", positional.len()));
      }
      Ok(Value::Array(Rc::new(RefCell::new(Vec::new()))))
    }
    Native::DictCtor => {
      if !positional.is_empty() {
        return Err(arity_error(native, "0 arguments", positional.len()));
      }
      Ok(Value::Dict(Rc::new(RefCell::new(Dict::new()))))
    }
    Native::WeaverWeave => {
      let [v] = one(native, positional)?;
      let coro = as_coroutine(native, &v)?;
      match runtime.run_to_completion(coro) {
        Ok(value) => Ok(value),
        Err(exc) => {
          eprintln!("uncaught exception from weaver.weave: {exc}");
          *interp.unhandled_async_error.borrow_mut() = Some(exc.to_string());
          Ok(Value::Null)
        }
      }
    }
    Native::WeaverSpawnTask => {
      let [v] = one(native, positional)?;
      let coro = as_coroutine(native, &v)?;
      runtime.schedule(coro.clone());
      Ok(Value::GatherTask(coro))
    }
    Native::WeaverRest => {
      let [v] = one(native, positional)?;
      let ms = match &v {
        Value::Int(n) => *n as f64,
        Value::Float(n) => *n,
        other => return Err(type_error(native, format!("expected a number of milliseconds, found {}", other.type_name()))),
      };
      Ok(Value::Coroutine(coroutine::spawn_timer(runtime, ms / 1000.0)))
    }
    Native::WeaverGather => {
      let [v] = one(native, positional)?;
      let items = match &v {
        Value::Array(a) => a.borrow().clone(),
        other => return Err(type_error(native, format!("expected an array of coroutines, found {}", other.type_name()))),
      };
      let mut children = Vec::with_capacity(items.len());
      for item in items {
        children.push(as_coroutine(native, &item)?);
      }
      let return_exceptions = named_bool(native, &named, "return_exceptions")?;
      let gather = coroutine::spawn_gather(runtime, children, return_exceptions).map_err(Outcome::from)?;
      Ok(Value::GatherTask(gather))
    }
    Native::WeaverCancel => {
      let [v] = one(native, positional)?;
      let coro = as_coroutine(native, &v)?;
      runtime.cancel(&coro);
      Ok(Value::Null)
    }
    Native::WeaverYieldNow => {
      if !positional.is_empty() {
        return Err(arity_error(native, "0 arguments", positional.len()));
      }
      Ok(Value::Coroutine(coroutine::spawn_timer(runtime, 0.0)))
    }
  }
}

fn one(native: Native, mut positional: Vec<Value>) -> EvalResult<[Value; 1]> {
  if positional.len() != 1 {
    return Err(arity_error(native, "1 argument", positional.len()));
  }
  Ok([positional.remove(0)])
}

fn named_bool(native: Native, named: &[(String, Value)], key: &str) -> EvalResult<bool> {
  let mut result = false;
  for (name, value) in named {
    if name != key {
      return Err(Outcome::Exception(Value::str(format!(
        "{} does not accept a named argument `{name}`",
        native.name()
      ))));
    }
    result = value.is_truthy();
  }
  Ok(result)
}

fn as_coroutine(native: Native, v: &Value) -> EvalResult<Rc<Coroutine>> {
  match v {
    Value::Coroutine(c) | Value::GatherTask(c) => Ok(c.clone()),
    other => Err(type_error(native, format!("expected a coroutine, found {}", other.type_name()))),
  }
}

fn type_of_name(v: &Value) -> &'static str {
  match v {
    Value::Int(_) => "Int",
    Value::Float(_) => "Float",
    Value::Bool(_) => "Bool",
    Value::Null => "Null",
    Value::Str(_) => "String",
    Value::Array(_) => "Array",
    Value::Dict(_) => "Dict",
    Value::Tuple(_) => "Tuple",
    Value::Function(_) => "Function",
    Value::Blueprint(_) => "Blueprint",
    Value::Object(_) => "Object",
    Value::BoundMethod(_) => "Function",
    Value::Coroutine(_) => "Coroutine",
    Value::GatherTask(_) => "GatherTask",
    Value::SuperProxy(_) => "Super",
    Value::Native(_) => "Function",
  }
}

fn len_of(native: Native, v: &Value) -> EvalResult<i64> {
  match v {
    Value::Str(s) => Ok(s.chars().count() as i64),
    Value::Array(a) => Ok(a.borrow().len() as i64),
    Value::Dict(d) => Ok(d.borrow().len() as i64),
    Value::Tuple(t) => Ok(t.len() as i64),
    other => Err(type_error(native, format!("{} has no length", other.type_name()))),
  }
}

fn to_int(native: Native, v: &Value) -> EvalResult<i64> {
  match v {
    Value::Int(n) => Ok(*n),
    Value::Float(n) => Ok(*n as i64),
    Value::Bool(b) => Ok(*b as i64),
    Value::Str(s) => s.trim().parse().map_err(|_| type_error(native, format!("cannot parse `{s}` as an int"))),
    other => Err(type_error(native, format!("cannot convert {} to int", other.type_name()))),
  }
}

fn to_float(native: Native, v: &Value) -> EvalResult<f64> {
  match v {
    Value::Int(n) => Ok(*n as f64),
    Value::Float(n) => Ok(*n),
    Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
    Value::Str(s) => s.trim().parse().map_err(|_| type_error(native, format!("cannot parse `{s}` as a float"))),
    other => Err(type_error(native, format!("cannot convert {} to float", other.type_name()))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn len_counts_chars_not_bytes() {
    assert_eq!(len_of(Native::Len, &Value::str("héllo")).unwrap(), 5);
  }

  #[test]
  fn weave_returns_the_root_coroutines_result() {
    let interp = Interp::new(crate::module::Config {
      echoc_home: None,
      echoc_path: vec![],
    });
    let body: crate::value::CoroutineBody = Box::pin(async { Ok(Value::Int(42)) });
    let coro = coroutine::spawn_task(&interp.runtime, "f", body);
    let result = call(&interp, Native::WeaverWeave, vec![Value::Coroutine(coro)], vec![]).unwrap();
    assert_eq!(result.as_int().unwrap(), 42);
  }
}
