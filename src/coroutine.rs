//! Constructors for the three `Coroutine` flavors (spec §4.6): a task
//! produced by calling an `async funct`, a timer produced by
//! `weaver.rest`, and a gather produced by `weaver.gather`. The state
//! machine itself — ready queue, sleep list, waiter wakeups — lives in
//! [`crate::runtime`]; this module only knows how to build the three
//! shapes and hand them to a [`Runtime`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::value::{Coroutine, CoroutineBody, CoroutineKind, CoroutineState, GatherState, Value};

fn blank(name: impl Into<Rc<str>>, kind: CoroutineKind) -> Rc<Coroutine> {
  Rc::new(Coroutine {
    name: name.into(),
    state: RefCell::new(CoroutineState::New),
    result: RefCell::new(None),
    waiters: RefCell::new(vec![]),
    awaiting_on: RefCell::new(None),
    parent_gather: RefCell::new(None),
    gather_index: Cell::new(None),
    is_cancelled: Cell::new(false),
    in_ready_queue: Cell::new(false),
    wakeup_time: Cell::new(None),
    kind: RefCell::new(kind),
  })
}

/// Construct a `Task` coroutine for `body` without scheduling it (spec's
/// "New" state — calling an `async funct` merely produces a coroutine
/// value; it starts running only once passed to `weaver.weave`,
/// `weaver.spawn_task`, `weaver.gather`, or `await`ed directly).
pub fn new_task(name: impl Into<Rc<str>>, body: CoroutineBody) -> Rc<Coroutine> {
  blank(name, CoroutineKind::Task(Some(body)))
}

/// Construct a `Task` coroutine and schedule its first tick immediately
/// (used where the caller already holds a fresh, never-exposed body, such
/// as the top-level script's own entry coroutine).
pub fn spawn_task(runtime: &Rc<Runtime>, name: impl Into<Rc<str>>, body: CoroutineBody) -> Rc<Coroutine> {
  let coro = new_task(name, body);
  runtime.schedule(coro.clone());
  coro
}

/// Spawn a `Timer` coroutine that settles `seconds` from now (spec's
/// `weaver.rest(ms)`, `ms` already converted to seconds by the caller).
pub fn spawn_timer(runtime: &Rc<Runtime>, seconds: f64) -> Rc<Coroutine> {
  let coro = blank("<timer>", CoroutineKind::Timer);
  runtime.sleep(coro.clone(), seconds);
  coro
}

/// Spawn a `Gather` coroutine over `children` (spec's `weaver.gather`).
/// Settles immediately if `children` is empty or every child has already
/// finished.
pub fn spawn_gather(runtime: &Rc<Runtime>, children: Vec<Rc<Coroutine>>, return_exceptions: bool) -> Result<Rc<Coroutine>> {
  for child in &children {
    if child.parent_gather.borrow().is_some() {
      return Err(Error::runtime("a coroutine may only be gathered once"));
    }
  }

  let pending = children.len();
  let gather = blank(
    "<gather>",
    CoroutineKind::Gather(GatherState {
      results: vec![None; children.len()],
      pending,
      first_exception_idx: None,
      return_exceptions,
      children: children.clone(),
    }),
  );
  *gather.state.borrow_mut() = CoroutineState::GatherWait;

  if children.is_empty() {
    runtime.handle_completion(&gather, Ok(Value::Array(Rc::new(RefCell::new(vec![])))));
    return Ok(gather);
  }

  for (idx, child) in children.iter().enumerate() {
    child.gather_index.set(Some(idx));
    *child.parent_gather.borrow_mut() = Some(Rc::downgrade(&gather));
    if let Some(result) = child.result.borrow().clone() {
      runtime.notify_gather_child(&gather, child, result);
      continue;
    }
    // timers are already on the sleep queue and nested gathers already
    // drive their own children; only a freshly-called async function's
    // `Task` coroutine still needs its first tick scheduled.
    if matches!(&*child.kind.borrow(), CoroutineKind::Task(_)) {
      runtime.schedule(child.clone());
    }
  }

  Ok(gather)
}
