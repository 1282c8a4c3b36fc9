//! Module cache and path resolution (spec §4.5 "Module loader").
//!
//! Spec §9 replaces the original's `Null`-placeholder trick for circular
//! imports with a `Loading | Loaded(Dict)` sum — [`Entry`] below is exactly
//! that sum, so a module that `load:`s itself (directly or through a
//! cycle) observes `is_loading` instead of racing a sentinel value.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::dict::Dict;
use crate::error::{Error, Result};

/// Read once at startup (spec §2.1's `[EXPANSION]`: not re-read per
/// `load:`, mirroring the teacher's `HebiBuilder` centralizing
/// construction-time options).
pub struct Config {
  pub echoc_home: Option<PathBuf>,
  pub echoc_path: Vec<PathBuf>,
}

impl Config {
  pub fn from_env() -> Config {
    Config {
      echoc_home: std::env::var_os("ECHOC_HOME").map(PathBuf::from),
      echoc_path: std::env::var("ECHOC_PATH")
        .ok()
        .map(|s| split_search_path(&s))
        .unwrap_or_default(),
    }
  }
}

fn split_search_path(s: &str) -> Vec<PathBuf> {
  s.split([':', ';']).filter(|p| !p.is_empty()).map(PathBuf::from).collect()
}

enum Entry {
  Loading,
  Loaded(Rc<RefCell<Dict>>),
}

/// Process-wide `path → Dict` cache (one per [`crate::Interp`], not
/// actually global — there is one interpreter per process run). Built-in
/// modules (`weaver`) share the same map under a `__builtin__:`-prefixed
/// key, per spec.
#[derive(Default)]
pub struct ModuleCache {
  entries: HashMap<String, Entry>,
}

impl ModuleCache {
  pub fn new() -> ModuleCache {
    ModuleCache::default()
  }

  pub fn is_loading(&self, key: &str) -> bool {
    matches!(self.entries.get(key), Some(Entry::Loading))
  }

  pub fn get(&self, key: &str) -> Option<Rc<RefCell<Dict>>> {
    match self.entries.get(key) {
      Some(Entry::Loaded(d)) => {
        tracing::trace!(module = key, "module cache hit");
        Some(d.clone())
      }
      _ => None,
    }
  }

  /// Insert the `Loading` placeholder before executing the module body,
  /// so a cycle observes it rather than recursing.
  pub fn begin_loading(&mut self, key: impl Into<String>) {
    let key = key.into();
    tracing::debug!(module = %key, "loading module");
    self.entries.insert(key, Entry::Loading);
  }

  pub fn finish_loading(&mut self, key: impl Into<String>, exports: Dict) -> Rc<RefCell<Dict>> {
    let key = key.into();
    tracing::debug!(module = %key, "module loaded");
    let dict = Rc::new(RefCell::new(exports));
    self.entries.insert(key, Entry::Loaded(dict.clone()));
    dict
  }
}

pub const BUILTIN_PREFIX: &str = "__builtin__:";

pub fn is_builtin_name(name: &str) -> bool {
  name == "weaver"
}

/// Resolve `name` to a source file by searching the loading file's own
/// directory, then `ECHOC_HOME`, then each `ECHOC_PATH` entry in order
/// (spec §4.5).
pub fn resolve(name: &str, from_dir: Option<&Path>, config: &Config) -> Result<PathBuf> {
  let filename = format!("{name}.ec");
  let mut candidates = Vec::new();
  if let Some(dir) = from_dir {
    candidates.push(dir.join(&filename));
  }
  if let Some(home) = &config.echoc_home {
    candidates.push(home.join(&filename));
  }
  for dir in &config.echoc_path {
    candidates.push(dir.join(&filename));
  }
  candidates
    .into_iter()
    .find(|p| p.is_file())
    .ok_or_else(|| Error::runtime(format!("module not found: `{name}`")))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn loading_then_loaded_transition() {
    let mut cache = ModuleCache::new();
    assert!(cache.get("m").is_none());
    cache.begin_loading("m");
    assert!(cache.is_loading("m"));
    cache.finish_loading("m", Dict::new());
    assert!(!cache.is_loading("m"));
    assert!(cache.get("m").is_some());
  }

  #[test]
  fn search_path_splits_on_colon_and_semicolon() {
    assert_eq!(split_search_path("a:b;c"), vec![PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("c")]);
  }
}
