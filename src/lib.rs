//! EchoC: a tree-walking interpreter for a small dynamically-typed
//! scripting language with single-threaded cooperative coroutines.
//!
//! The public surface is [`Interpreter`]; everything else is exposed for
//! embedding and for the binary's own use, the way the teacher's `hebi`
//! crate exposes its own `isolate`/`value` internals alongside the small
//! `Hebi` facade.

mod ast;
mod builtins;
mod coroutine;
mod dict;
mod error;
mod interp;
mod lexer;
mod module;
mod parser;
mod runtime;
mod scope;
mod value;

use std::path::{Path, PathBuf};

pub use error::{Error, Kind as ErrorKind, Result};
pub use interp::Stdout;
pub use module::Config;
pub use value::Value;

/// An EchoC interpreter instance: one coroutine [`crate::runtime::Runtime`],
/// one module cache, one `load:` search configuration. Mirrors the
/// teacher's `Hebi` facade, minus the embedder-oriented native-function
/// registration API the spec doesn't call for.
pub struct Interpreter {
  interp: std::rc::Rc<interp::Interp>,
}

impl Interpreter {
  pub fn new(config: Config) -> Interpreter {
    Interpreter {
      interp: interp::Interp::new(config),
    }
  }

  /// Redirect `show`'s output to `stdout` instead of the process's real
  /// stdout — mirrors the teacher's `HebiBuilder::with_io`, and is what
  /// lets `tests/` fixtures assert on a script's printed output.
  pub fn with_stdout(config: Config, stdout: impl Stdout + 'static) -> Interpreter {
    Interpreter {
      interp: interp::Interp::with_stdout(config, Box::new(stdout)),
    }
  }

  /// Run the script at `path`. Leaks the read source to `'static`, per the
  /// interpreter's outlives-everything arena strategy (spec §9: the whole
  /// parsed tree outlives the process run).
  pub fn run_file(&self, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let src = std::fs::read_to_string(path).map_err(|e| Error::runtime(format!("failed to read `{}`: {e}", path.display())))?;
    self.run_str(src, path.parent().map(Path::to_path_buf))
  }

  /// Run `src` directly — the entry point used by `tests/` fixtures, which
  /// have no file on disk of their own.
  pub fn run_str(&self, src: impl Into<String>, dir: Option<PathBuf>) -> Result<()> {
    let src: &'static str = Box::leak(src.into().into_boxed_str());
    self.interp.run(src, dir)
  }
}

impl Default for Interpreter {
  fn default() -> Interpreter {
    Interpreter::new(Config::from_env())
  }
}
