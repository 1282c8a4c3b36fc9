//! The single error type threaded through lexing, parsing, and evaluation.
//!
//! Mirrors spec §7: every failure is tagged with a [`Kind`] and (where
//! known) a source [`Span`], and renders to the exact
//! `[EchoC <Kind> Error] at line L, col C: <message>` form required on
//! stderr.

use std::fmt;

use span::Span;
use thiserror::Error;

use crate::value::Value;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Non-exceptional control transfer out of a statement (spec §4.5:
/// `break_flag`/`continue_flag`/`return_flag`).
#[derive(Debug)]
pub enum Control {
  Break,
  Continue,
  Return(Value),
}

/// What propagates out of an expression/statement evaluation when it
/// doesn't simply produce a value (spec §7: "a result/sum type returned
/// from every expression/statement" replacing global interpreter flags).
/// `Exception` unifies user `raise:` payloads and host-detected `Runtime`
/// faults into the single catchable channel spec §7 describes — a
/// `Runtime`-kind [`Error`] converts into an `Exception` carrying its
/// message as a string the moment it's detected; only genuinely
/// unrecoverable `System`/`Internal` errors are meant to ever reach a
/// caller as a bare `Error` instead (the top-level driver, not EchoC
/// `catch:`, is what's equipped to handle those).
#[derive(Debug)]
pub enum Outcome {
  Control(Control),
  Exception(Value),
}

pub type EvalResult<T> = std::result::Result<T, Outcome>;

impl From<Error> for Outcome {
  fn from(e: Error) -> Outcome {
    Outcome::Exception(Value::str(e.message))
  }
}

impl Outcome {
  pub fn raise(value: Value) -> Outcome {
    Outcome::Exception(value)
  }
}

/// The five error kinds named in spec §7. `Cancellation` is not a distinct
/// `Kind` — it is a plain `Runtime` error whose message is the literal
/// string `"CancelledError"`, per spec §4.6/§7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
  Lexical,
  Syntax,
  Runtime,
  System,
  Internal,
}

impl fmt::Display for Kind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Kind::Lexical => "Lexical",
      Kind::Syntax => "Syntax",
      Kind::Runtime => "Runtime",
      Kind::System => "System",
      Kind::Internal => "Internal",
    };
    write!(f, "{s}")
  }
}

#[derive(Error, Debug, Clone)]
#[error("[EchoC {kind} Error]: {message}")]
pub struct Error {
  pub kind: Kind,
  pub message: String,
  pub span: Option<Span>,
}

impl Error {
  pub fn new(kind: Kind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
      span: None,
    }
  }

  pub fn with_span(mut self, span: impl Into<Span>) -> Self {
    self.span = Some(span.into());
    self
  }

  pub fn lexical(message: impl Into<String>, span: impl Into<Span>) -> Self {
    Self::new(Kind::Lexical, message).with_span(span)
  }

  pub fn syntax(message: impl Into<String>, span: impl Into<Span>) -> Self {
    Self::new(Kind::Syntax, message).with_span(span)
  }

  pub fn runtime(message: impl Into<String>) -> Self {
    Self::new(Kind::Runtime, message)
  }

  pub fn runtime_at(message: impl Into<String>, span: impl Into<Span>) -> Self {
    Self::new(Kind::Runtime, message).with_span(span)
  }

  pub fn internal(message: impl Into<String>) -> Self {
    Self::new(Kind::Internal, message)
  }

  pub fn cancelled() -> Self {
    Self::runtime("CancelledError")
  }

  pub fn is_cancelled(&self) -> bool {
    self.kind == Kind::Runtime && self.message == "CancelledError"
  }

  /// Render the exact stderr line mandated by spec §6:
  /// `[EchoC <Kind> Error] at line L, col C: <message>`.
  ///
  /// `src` is the original source text, used to translate the stored byte
  /// span back into a 1-indexed line/col pair. When no span is available
  /// (e.g. an error synthesized far from any token, such as a cancelled
  /// timer) line 0, col 0 is reported.
  pub fn render(&self, src: &str) -> String {
    let (line, col) = match self.span {
      Some(span) => {
        let lc = span::line_col(src, span.start);
        (lc.line, lc.col)
      }
      None => (0, 0),
    };
    format!(
      "[EchoC {} Error] at line {}, col {}: {}",
      self.kind, line, col, self.message
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn renders_spec_format() {
    let src = "let: x = 1:\nlet: y = 2:\n";
    let err = Error::runtime_at("name not found: `z`", Span { start: 12, end: 13 });
    assert_eq!(
      err.render(src),
      "[EchoC Runtime Error] at line 2, col 1: name not found: `z`"
    );
  }

  #[test]
  fn cancelled_error_is_runtime_kind() {
    let err = Error::cancelled();
    assert!(err.is_cancelled());
    assert_eq!(err.kind, Kind::Runtime);
  }
}
