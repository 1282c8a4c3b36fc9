//! End-to-end fixtures mirroring the six concrete scenarios and several of
//! the testable properties: source text in, captured `show` output (or an
//! error) out, driven entirely through the public [`echoc::Interpreter`]
//! facade rather than any internal module.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use echoc::{Config, Interpreter};

/// A `Write` sink the test keeps a handle to after handing the other half
/// to the interpreter — `Stdout`'s blanket impl over `io::Write` means no
/// bespoke trait impl is needed on the interpreter side.
#[derive(Clone, Default)]
struct Captured(Rc<RefCell<Vec<u8>>>);

impl io::Write for Captured {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.0.borrow_mut().write(buf)
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

impl Captured {
  fn text(&self) -> String {
    String::from_utf8(self.0.borrow().clone()).unwrap()
  }
}

fn run(src: &str) -> (echoc::Result<()>, String) {
  let out = Captured::default();
  let interp = Interpreter::with_stdout(
    Config {
      echoc_home: None,
      echoc_path: vec![],
    },
    out.clone(),
  );
  let result = interp.run_str(src, None);
  (result, out.text())
}

fn run_ok(src: &str) -> String {
  let (result, out) = run(src);
  result.unwrap_or_else(|e| panic!("script failed: {}", e.render(src)));
  out
}

#[test]
fn arithmetic_precedence() {
  let out = run_ok(indoc::indoc! {r#"
    show(1 + 2 * 3):
  "#});
  assert_eq!(out, "7\n");
}

#[test]
fn array_append() {
  let out = run_ok(indoc::indoc! {r#"
    let: a = []:
    a.append(1):
    a.append(2):
    show(a):
  "#});
  assert_eq!(out, "[1, 2]\n");
}

#[test]
fn async_function_weave() {
  let out = run_ok(indoc::indoc! {r#"
    async funct: f():
        return: 42:
    funct: main():
        return: weaver.weave(f()):
    show(main()):
  "#});
  assert_eq!(out, "42\n");
}

#[test]
fn gather_preserves_order() {
  let out = run_ok(indoc::indoc! {r#"
    async funct: s(n):
        await weaver.rest(n):
        return: n:
    show(weaver.weave(weaver.gather([s(10), s(5), s(7)]))):
  "#});
  assert_eq!(out, "[10, 5, 7]\n");
}

#[test]
fn blueprint_op_str_override() {
  let out = run_ok(indoc::indoc! {r#"
    blueprint: P:
        funct: init(self, x):
            let: self.x = x:
        funct: op_str(self):
            return: "P(%{self.x})":
    let: p = P(3):
    show(p):
  "#});
  assert_eq!(out, "P(3)\n");
}

#[test]
fn try_catch_finally_runs_both() {
  let out = run_ok(indoc::indoc! {r#"
    try:
        raise: "boom":
    catch as e:
        show(e):
    finally:
        show("f"):
  "#});
  assert_eq!(out, "boom\nf\n");
}

#[test]
fn string_interpolation() {
  let out = run_ok(indoc::indoc! {r#"
    let: x = 2:
    show("%{x+1}"):
    show("%{'q'}"):
  "#});
  assert_eq!(out, "3\nq\n");
}

#[test]
fn self_identity_inside_method() {
  let out = run_ok(indoc::indoc! {r#"
    blueprint: P:
        funct: check(self):
            return: self is self:
    let: p = P():
    show(p.check()):
  "#});
  assert_eq!(out, "true\n");
}

#[test]
fn uncaught_exception_is_a_runtime_error() {
  let (result, _) = run(indoc::indoc! {r#"
    raise: "boom":
  "#});
  let err = result.unwrap_err();
  assert!(err.message.contains("boom"), "unexpected message: {}", err.message);
}

#[test]
fn division_by_zero_raises_a_catchable_exception() {
  let out = run_ok(indoc::indoc! {r#"
    try:
        show(1 / 0):
    catch as e:
        show("caught"):
  "#});
  assert_eq!(out, "caught\n");
}

#[test]
fn rebinding_a_name_to_an_array_aliases_it() {
  let out = run_ok(indoc::indoc! {r#"
    let: a = [1, 2, 3]:
    let: b = a:
    let: b[0] = 9:
    show(a[0]):
  "#});
  assert_eq!(out, "9\n");
}

#[test]
fn a_container_nested_inside_another_is_still_aliased() {
  let out = run_ok(indoc::indoc! {r#"
    let: inner = [1]:
    let: a = []:
    a.append(inner):
    let: inner[0] = 9:
    show(a):
  "#});
  assert_eq!(out, "[[9]]\n");
}

#[test]
fn uncaught_exception_from_weaver_weave_still_fails_the_run() {
  let (result, _) = run(indoc::indoc! {r#"
    async funct: f():
        raise: "boom":
    weaver.weave(f()):
  "#});
  let err = result.unwrap_err();
  assert!(err.message.contains("boom"), "unexpected message: {}", err.message);
}

#[test]
fn dotted_append_call_evaluates_receiver_exactly_once() {
  // `make()` is called as the receiver of a `.append(...)` call whose
  // target turns out not to be an array (a `Counter` object, which has
  // its own `append` method) — regression test for a bug where the
  // receiver expression was evaluated a second time once the special
  // array-append path determined it didn't apply.
  let out = run_ok(indoc::indoc! {r#"
    let: calls = []:
    blueprint: Counter:
        funct: init(self):
            let: self.n = 0:
        funct: append(self, x):
            let: self.n = self.n + x:
    funct: make():
        calls.append(1):
        return: Counter():
    make().append(9):
    show(calls):
  "#});
  assert_eq!(out, "[1]\n");
}
