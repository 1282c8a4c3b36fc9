//! The cooperative single-threaded executor (spec §4.6 event loop).
//!
//! Spec §9 replaces the original's lexer-rewind resume protocol with native
//! `async`/`await`: each coroutine's body is a boxed Rust future
//! ([`crate::value::CoroutineBody`]) and its resume point is the compiler's
//! own per-`await` state machine rather than a re-parsed statement. This
//! module is what actually *drives* those futures — a ready queue, a sleep
//! list for `weaver.rest`, and `handle_completion` for waking waiters and
//! settling `gather`, all mirroring spec §4.6's own vocabulary rather than
//! reaching for a generic reactor (`tokio`, `async-std`) this interpreter
//! has no other use for.
//!
//! Time is a virtual monotonic clock advanced explicitly by the loop, not
//! the wall clock — `weaver.rest` never blocks the host process, and a
//! script's timers fire in a fixed number of loop iterations regardless of
//! how fast the machine runs.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::value::{Coroutine, CoroutineKind, CoroutineState, Value};

struct SleepEntry {
  wake_at: f64,
  coro: Rc<Coroutine>,
}

pub struct Runtime {
  ready: RefCell<VecDeque<Rc<Coroutine>>>,
  sleeping: RefCell<Vec<SleepEntry>>,
  clock: RefCell<f64>,
}

impl Runtime {
  pub fn new() -> Rc<Runtime> {
    Rc::new(Runtime {
      ready: RefCell::new(VecDeque::new()),
      sleeping: RefCell::new(Vec::new()),
      clock: RefCell::new(0.0),
    })
  }

  pub fn now(&self) -> f64 {
    *self.clock.borrow()
  }

  /// Enqueue `coro` for its next tick, unless it's already queued (a
  /// coroutine can accumulate more than one wake while pending).
  pub fn schedule(self: &Rc<Self>, coro: Rc<Coroutine>) {
    if matches!(*coro.state.borrow(), CoroutineState::Done) {
      return;
    }
    if coro.in_ready_queue.replace(true) {
      return;
    }
    self.ready.borrow_mut().push_back(coro);
  }

  /// Park `coro` on the sleep list to wake at `self.now() + seconds`,
  /// without ever putting it on the ready queue (spec's `SuspendedTimer`
  /// coroutines run no body).
  pub fn sleep(&self, coro: Rc<Coroutine>, seconds: f64) {
    let wake_at = self.now() + seconds;
    coro.wakeup_time.set(Some(wake_at));
    *coro.state.borrow_mut() = CoroutineState::SuspendedTimer;
    self.sleeping.borrow_mut().push(SleepEntry { wake_at, coro });
  }

  /// Removes `coro` from the sleep list, if it's on it (spec's
  /// `weaver.cancel` acting on a still-sleeping timer).
  pub fn cancel_sleep(&self, coro: &Rc<Coroutine>) {
    self.sleeping.borrow_mut().retain(|e| !Rc::ptr_eq(&e.coro, coro));
  }

  pub fn waker_for(self: &Rc<Self>, coro: Rc<Coroutine>) -> Waker {
    let data = Rc::new(WakeData { runtime: self.clone(), coro });
    unsafe { Waker::from_raw(raw_waker(data)) }
  }

  /// One tick of a `Task` coroutine: poll its body future once. `Timer`
  /// and `Gather` coroutines never reach the ready queue (their
  /// completion is driven by `poll_sleepers`/`notify_gather_child`), so
  /// ticking one of those is a no-op.
  fn tick(self: &Rc<Self>, coro: Rc<Coroutine>) {
    coro.in_ready_queue.set(false);
    tracing::trace!(coroutine = %coro.name, "tick");
    if matches!(*coro.state.borrow(), CoroutineState::Done) {
      return;
    }
    if coro.is_cancelled.get() {
      self.handle_completion(&coro, Err(Value::str("CancelledError")));
      return;
    }

    let body = match &mut *coro.kind.borrow_mut() {
      CoroutineKind::Task(slot) => slot.take(),
      _ => None,
    };
    let Some(mut fut) = body else { return };

    *coro.state.borrow_mut() = CoroutineState::Runnable;
    let waker = self.waker_for(coro.clone());
    let mut cx = Context::from_waker(&waker);
    match fut.as_mut().poll(&mut cx) {
      Poll::Ready(result) => self.handle_completion(&coro, result),
      Poll::Pending => {
        if let CoroutineKind::Task(slot) = &mut *coro.kind.borrow_mut() {
          *slot = Some(fut);
        }
      }
    }
  }

  /// Settle `coro`, wake everything parked on [`Coroutine::waiters`], and
  /// notify an enclosing `gather`, if any (spec §4.6 `handle_completion`).
  pub(crate) fn handle_completion(self: &Rc<Self>, coro: &Rc<Coroutine>, result: Result<Value, Value>) {
    if matches!(*coro.state.borrow(), CoroutineState::Done) {
      return;
    }
    *coro.state.borrow_mut() = CoroutineState::Done;
    *coro.result.borrow_mut() = Some(result.clone());
    coro.awaiting_on.borrow_mut().take();
    for waker in coro.waiters.borrow_mut().drain(..) {
      waker.wake();
    }
    let parent = coro.parent_gather.borrow().as_ref().and_then(|w| w.upgrade());
    if let Some(parent) = parent {
      self.notify_gather_child(&parent, coro, result);
    }
  }

  /// Records one gathered child's settlement and, once the gather's
  /// completion condition is met, finishes the gather coroutine itself
  /// (spec's `gather`/`return_exceptions` semantics).
  pub(crate) fn notify_gather_child(self: &Rc<Self>, parent: &Rc<Coroutine>, child: &Rc<Coroutine>, result: Result<Value, Value>) {
    let finished = {
      let mut kind = parent.kind.borrow_mut();
      let CoroutineKind::Gather(g) = &mut *kind else {
        return;
      };
      let idx = child
        .gather_index
        .get()
        .expect("a coroutine notifying a gather parent must have a gather_index");
      if result.is_err() && g.first_exception_idx.is_none() {
        g.first_exception_idx = Some(idx);
      }
      g.results[idx] = Some(result);
      g.pending -= 1;
      g.pending == 0 || (!g.return_exceptions && g.first_exception_idx.is_some())
    };
    if finished {
      self.finish_gather(parent);
    }
  }

  fn finish_gather(self: &Rc<Self>, gather: &Rc<Coroutine>) {
    let outcome = {
      let kind = gather.kind.borrow();
      let CoroutineKind::Gather(g) = &*kind else {
        return;
      };
      if !g.return_exceptions {
        if let Some(idx) = g.first_exception_idx {
          g.results[idx].clone().expect("first_exception_idx must name a settled child")
        } else {
          let values = g.results.iter().map(|r| r.clone().unwrap().unwrap()).collect();
          Ok(Value::Array(Rc::new(RefCell::new(values))))
        }
      } else {
        // each settlement (value or exception) becomes one array element
        let values = g
          .results
          .iter()
          .map(|r| match r.clone().unwrap() {
            Ok(v) => v,
            Err(e) => e,
          })
          .collect();
        Ok(Value::Array(Rc::new(RefCell::new(values))))
      }
    };
    self.handle_completion(gather, outcome);
  }

  /// Pop every sleeper whose deadline has passed and settle it.
  fn poll_sleepers(self: &Rc<Self>) {
    let now = self.now();
    loop {
      let due = self
        .sleeping
        .borrow()
        .iter()
        .position(|e| e.wake_at <= now);
      let Some(idx) = due else { break };
      let entry = self.sleeping.borrow_mut().remove(idx);
      self.handle_completion(&entry.coro, Ok(Value::Null));
    }
  }

  fn earliest_sleep(&self) -> Option<f64> {
    self.sleeping.borrow().iter().map(|e| e.wake_at).fold(None, |acc, t| {
      Some(acc.map_or(t, |m: f64| m.min(t)))
    })
  }

  /// Drive the loop until `root` settles, returning its outcome.
  pub fn run_to_completion(self: &Rc<Self>, root: Rc<Coroutine>) -> Result<Value, Value> {
    self.schedule(root.clone());
    loop {
      self.poll_sleepers();
      if matches!(*root.state.borrow(), CoroutineState::Done) {
        break;
      }
      let next = self.ready.borrow_mut().pop_front();
      match next {
        Some(coro) => self.tick(coro),
        None => match self.earliest_sleep() {
          Some(t) => {
            tracing::debug!(from = *self.clock.borrow(), to = t, "advancing virtual clock");
            *self.clock.borrow_mut() = t;
          }
          None => break,
        },
      }
    }
    root
      .result
      .borrow()
      .clone()
      .unwrap_or_else(|| Err(Value::str("the root script produced no result")))
  }

  /// Mark `coro` cancelled (spec's `weaver.cancel`): a sleeping timer
  /// settles immediately as `CancelledError`; anything else is settled
  /// the same way the next time it is ticked.
  pub fn cancel(self: &Rc<Self>, coro: &Rc<Coroutine>) {
    if matches!(*coro.state.borrow(), CoroutineState::Done) {
      return;
    }
    coro.is_cancelled.set(true);
    if matches!(*coro.state.borrow(), CoroutineState::SuspendedTimer) {
      self.cancel_sleep(coro);
      self.handle_completion(coro, Err(Value::str("CancelledError")));
      return;
    }
    // cancelling a gather cancels every child that hasn't settled yet
    if let CoroutineKind::Gather(g) = &*coro.kind.borrow() {
      for child in &g.children {
        self.cancel(child);
      }
    }
  }
}

struct WakeData {
  runtime: Rc<Runtime>,
  coro: Rc<Coroutine>,
}

fn raw_waker(data: Rc<WakeData>) -> RawWaker {
  RawWaker::new(Rc::into_raw(data) as *const (), &VTABLE)
}

// SAFETY: each vtable function receives exactly the `*const ()` produced by
// `Rc::into_raw` on a `Rc<WakeData>` (via `raw_waker`), and never outlives
// the `Rc` it reconstructs — `clone`/`wake_by_ref` immediately re-forget
// the reconstructed `Rc` so the caller's refcount is left untouched, and
// `wake`/`drop` let the reconstructed `Rc` fall, consuming exactly the one
// reference the caller handed over.
unsafe fn waker_clone(ptr: *const ()) -> RawWaker {
  let data = unsafe { Rc::from_raw(ptr as *const WakeData) };
  let cloned = Rc::clone(&data);
  std::mem::forget(data);
  raw_waker(cloned)
}

unsafe fn waker_wake(ptr: *const ()) {
  let data = unsafe { Rc::from_raw(ptr as *const WakeData) };
  data.runtime.schedule(data.coro.clone());
}

unsafe fn waker_wake_by_ref(ptr: *const ()) {
  let data = unsafe { Rc::from_raw(ptr as *const WakeData) };
  data.runtime.schedule(data.coro.clone());
  std::mem::forget(data);
}

unsafe fn waker_drop(ptr: *const ()) {
  drop(unsafe { Rc::from_raw(ptr as *const WakeData) });
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(waker_clone, waker_wake, waker_wake_by_ref, waker_drop);

/// A future that suspends until `target` settles, registering the
/// polling task as a waker on `target` rather than busy-polling — the
/// mechanism behind EchoC's `await` expression (spec §4.4/§4.6).
pub struct AwaitFuture {
  target: Rc<Coroutine>,
  awaiter: Rc<Coroutine>,
}

impl AwaitFuture {
  pub fn new(target: Rc<Coroutine>, awaiter: Rc<Coroutine>) -> Self {
    AwaitFuture { target, awaiter }
  }
}

impl Future for AwaitFuture {
  type Output = Result<Value, Value>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    if let Some(result) = self.target.result.borrow().clone() {
      *self.awaiter.awaiting_on.borrow_mut() = None;
      return Poll::Ready(result);
    }
    *self.awaiter.state.borrow_mut() = CoroutineState::SuspendedAwait;
    *self.awaiter.awaiting_on.borrow_mut() = Some(self.target.clone());
    self.target.waiters.borrow_mut().push(cx.waker().clone());
    Poll::Pending
  }
}

#[cfg(test)]
mod tests {
  use std::cell::RefCell;

  use super::*;
  use crate::value::GatherState;

  fn new_coroutine(name: &str) -> Rc<Coroutine> {
    Rc::new(Coroutine {
      name: Rc::from(name),
      state: RefCell::new(CoroutineState::New),
      result: RefCell::new(None),
      waiters: RefCell::new(vec![]),
      awaiting_on: RefCell::new(None),
      parent_gather: RefCell::new(None),
      gather_index: std::cell::Cell::new(None),
      is_cancelled: std::cell::Cell::new(false),
      in_ready_queue: std::cell::Cell::new(false),
      wakeup_time: std::cell::Cell::new(None),
      kind: RefCell::new(CoroutineKind::Task(Some(Box::pin(async { Ok(Value::Int(1)) })))),
    })
  }

  #[test]
  fn run_to_completion_drives_a_single_task() {
    let rt = Runtime::new();
    let coro = new_coroutine("main");
    let result = rt.run_to_completion(coro);
    assert_eq!(result.unwrap().as_int().unwrap(), 1);
  }

  #[test]
  fn timer_fires_without_blocking() {
    let rt = Runtime::new();
    let timer = new_coroutine("timer");
    *timer.kind.borrow_mut() = CoroutineKind::Timer;
    rt.sleep(timer.clone(), 5.0);
    assert!(matches!(*timer.state.borrow(), CoroutineState::SuspendedTimer));

    let main = new_coroutine("main");
    *main.kind.borrow_mut() = CoroutineKind::Task(Some(Box::pin({
      let timer = timer.clone();
      let main_handle = main.clone();
      async move { AwaitFuture::new(timer, main_handle).await }
    })));
    let result = rt.run_to_completion(main);
    assert!(result.is_ok());
    assert_eq!(rt.now(), 5.0);
    let _ = timer;
  }

  #[test]
  fn empty_gather_resolves_to_empty_array() {
    let rt = Runtime::new();
    let gather = Rc::new(Coroutine {
      name: Rc::from("<gather>"),
      state: RefCell::new(CoroutineState::GatherWait),
      result: RefCell::new(None),
      waiters: RefCell::new(vec![]),
      awaiting_on: RefCell::new(None),
      parent_gather: RefCell::new(None),
      gather_index: std::cell::Cell::new(None),
      is_cancelled: std::cell::Cell::new(false),
      in_ready_queue: std::cell::Cell::new(false),
      wakeup_time: std::cell::Cell::new(None),
      kind: RefCell::new(CoroutineKind::Gather(GatherState {
        children: vec![],
        results: vec![],
        pending: 0,
        first_exception_idx: None,
        return_exceptions: false,
      })),
    });
    rt.finish_gather(&gather);
    match &*gather.result.borrow() {
      Some(Ok(Value::Array(a))) => assert!(a.borrow().is_empty()),
      other => panic!("unexpected gather result: {:?}", other.is_some()),
    }
  }
}
