//! Sizing and behaviour knobs, read once per process.
//!
//! | variable                   | default                          |
//! |----------------------------|----------------------------------|
//! | `NATIVE_STACK_SIZE`        | `1048576` (1 MiB)                |
//! | `NATIVE_STACK_CACHE_LIMIT` | `max(available_parallelism, 8)`  |
//! | `NATIVE_STACK_CLEAR`       | `retain` (or `zero`)             |
//! | `NATIVE_STACK_BACKING`     | `os` on unix (or `allocator`)    |
use std::sync::OnceLock;
use std::thread;

use crate::error::{Error, Result};

pub const STACK_SIZE_VAR: &str = "NATIVE_STACK_SIZE";
pub const CACHE_LIMIT_VAR: &str = "NATIVE_STACK_CACHE_LIMIT";
pub const CLEAR_VAR: &str = "NATIVE_STACK_CLEAR";
pub const BACKING_VAR: &str = "NATIVE_STACK_BACKING";

pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

static GLOBAL: OnceLock<Config> = OnceLock::new();

/// What happens to the bytes a frame releases when it closes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClearPolicy {
  /// Leave released bytes as they are. The next frame sees stale data.
  #[default]
  Retain,
  /// Zero the released range before rewinding.
  Zero,
}

/// Where a stack's backing region comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackingKind {
  /// An anonymous `mmap`; the global allocator on targets without one.
  Os,
  /// The global allocator.
  Allocator,
}

impl Default for BackingKind {
  fn default() -> Self {
    if cfg!(unix) { BackingKind::Os } else { BackingKind::Allocator }
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
  /// Bytes of backing per stack instance. Fixed for the instance's life.
  pub stack_size: usize,
  /// Most idle sharable stacks a pool keeps.
  pub cache_limit: usize,
  pub clear: ClearPolicy,
  pub backing: BackingKind,
}

impl Default for Config {
  fn default() -> Self {
    Config {
      stack_size: DEFAULT_STACK_SIZE,
      cache_limit: default_cache_limit(),
      clear: ClearPolicy::default(),
      backing: BackingKind::default(),
    }
  }
}

fn default_cache_limit() -> usize {
  let cpus = thread::available_parallelism().map_or(1, |n| n.get());
  cpus.max(8)
}

impl Config {
  /// Defaults overridden by whichever `NATIVE_STACK_*` variables are set.
  pub fn from_env() -> Result<Config> {
    Config::from_lookup(|key| std::env::var(key).ok())
  }

  pub(crate) fn from_lookup<F>(lookup: F) -> Result<Config>
  where F: Fn(&'static str) -> Option<String> {
    let mut config = Config::default();
    if let Some(v) = lookup(STACK_SIZE_VAR) {
      config.stack_size = parse_count(STACK_SIZE_VAR, &v)?;
    }
    if let Some(v) = lookup(CACHE_LIMIT_VAR) {
      config.cache_limit = parse_count(CACHE_LIMIT_VAR, &v)?;
    }
    if let Some(v) = lookup(CLEAR_VAR) {
      config.clear = match v.trim().to_ascii_lowercase().as_str() {
        "retain" => ClearPolicy::Retain,
        "zero" => ClearPolicy::Zero,
        _ => return Err(Error::Config { key: CLEAR_VAR, value: v }),
      };
    }
    if let Some(v) = lookup(BACKING_VAR) {
      config.backing = match v.trim().to_ascii_lowercase().as_str() {
        "os" => BackingKind::Os,
        "allocator" => BackingKind::Allocator,
        _ => return Err(Error::Config { key: BACKING_VAR, value: v }),
      };
    }
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    if self.stack_size == 0 || self.stack_size > isize::MAX as usize {
      return Err(Error::Config { key: STACK_SIZE_VAR, value: self.stack_size.to_string() });
    }
    if self.cache_limit == 0 {
      return Err(Error::Config { key: CACHE_LIMIT_VAR, value: self.cache_limit.to_string() });
    }
    Ok(())
  }

  /// The process-wide configuration, loaded from the environment on first use.
  ///
  /// Malformed variables are logged and replaced by the defaults.
  pub fn global() -> &'static Config {
    GLOBAL.get_or_init(|| match Config::from_env().and_then(|c| c.validate().map(|()| c)) {
      Ok(config) => config,
      Err(err) => {
        tracing::warn!(error = %err, "ignoring native stack environment configuration");
        Config::default()
      }
    })
  }

  /// Installs `self` as the process-wide configuration.
  ///
  /// Fails, handing the config back, once the global config has been read or installed.
  pub fn install(self) -> std::result::Result<(), Config> {
    if self.validate().is_err() {
      return Err(self);
    }
    GLOBAL.set(self)
  }
}

fn parse_count(key: &'static str, value: &str) -> Result<usize> {
  match value.trim().parse::<usize>() {
    Ok(n) if n > 0 => Ok(n),
    _ => Err(Error::Config { key, value: value.to_owned() }),
  }
}
