//! A bounded cache of idle sharable stacks.
//!
//! Lightweight contexts are too short-lived to each deserve a dedicated
//! backing region, so they borrow a warm stack here and hand it back when
//! their outermost frame closes. The lock is held only while a stack moves in
//! or out; allocation and frame push/close never touch it.
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::config::Config;
use crate::context::{self, ContextId};
use crate::error::{Error, Result};
use crate::stack::NativeStack;

static GLOBAL: OnceLock<Arc<StackPool>> = OnceLock::new();

pub struct StackPool {
  config: Config,
  idle:   Mutex<Vec<Arc<NativeStack>>>,
  this:   Weak<StackPool>,
}

impl fmt::Debug for StackPool {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("StackPool")
      .field("limit", &self.config.cache_limit)
      .field("idle", &self.idle())
      .finish()
  }
}

impl StackPool {
  /// Creates an empty pool. Stacks are created on demand with `config`.
  pub fn new(config: Config) -> Result<Arc<StackPool>> {
    config.validate()?;
    Ok(StackPool::build(config))
  }

  fn build(config: Config) -> Arc<StackPool> {
    Arc::new_cyclic(|this| StackPool {
      idle: Mutex::new(Vec::with_capacity(config.cache_limit)),
      config,
      this: this.clone(),
    })
  }

  /// The pool [`run_lightweight`](crate::run_lightweight) borrows from,
  /// configured by [`Config::global`].
  pub fn global() -> &'static Arc<StackPool> {
    GLOBAL.get_or_init(|| StackPool::build(Config::global().clone()))
  }

  /// Borrows a stack for the calling context.
  ///
  /// The stack comes back to this pool by itself once its outermost frame
  /// closes; it is not bound to the context, so [`get_stack`](crate::get_stack)
  /// will not return it.
  pub fn acquire(&self) -> Result<Arc<NativeStack>> {
    let owner = context::current().ok_or(Error::WrongThread)?;
    self.acquire_for(owner)
  }

  pub(crate) fn acquire_for(&self, owner: ContextId) -> Result<Arc<NativeStack>> {
    {
      let mut idle = self.idle.lock();
      if let Some(stack) = idle.pop() {
        stack.change_owner(owner);
        tracing::debug!(owner = owner.get(), idle = idle.len(), "borrowed pooled native stack");
        return Ok(stack);
      }
    }
    NativeStack::create(&self.config, Some(owner), Some(self.this.clone()))
  }

  /// Takes back a fully unwound, unowned stack. Returns whether it was kept.
  pub(crate) fn give_back(&self, stack: Arc<NativeStack>) -> bool {
    debug_assert!(!stack.is_owned());
    let mut idle = self.idle.lock();
    if idle.len() < self.config.cache_limit {
      idle.push(stack);
      tracing::debug!(idle = idle.len(), "returned native stack to pool");
      true
    } else {
      drop(idle);
      tracing::debug!(limit = self.config.cache_limit, "pool full, discarding native stack");
      false
    }
  }

  /// Stacks currently waiting for a borrower.
  pub fn idle(&self) -> usize { self.idle.lock().len() }

  pub fn limit(&self) -> usize { self.config.cache_limit }

  pub fn config(&self) -> &Config { &self.config }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::context::{get_stack, run_lightweight_in};

  fn pool(limit: usize) -> Arc<StackPool> {
    StackPool::new(Config { stack_size: 8192, cache_limit: limit, ..Config::default() }).unwrap()
  }

  #[test]
  fn rejects_invalid_config() {
    assert!(StackPool::new(Config { cache_limit: 0, ..Config::default() }).is_err());
  }

  #[test]
  fn closed_stack_is_reused_by_the_next_context() {
    let pool = pool(2);
    let first = run_lightweight_in(&pool, || {
      let frame = get_stack().unwrap().frame().unwrap();
      frame.allocate(16, 8).unwrap();
      Arc::clone(frame.stack())
    });
    assert_eq!(pool.idle(), 1);
    assert!(!first.is_owned());
    run_lightweight_in(&pool, || {
      let stack = get_stack().unwrap();
      assert!(Arc::ptr_eq(&stack, &first));
      assert!(stack.is_current());
      assert_eq!(pool.idle(), 0);
    });
  }

  #[test]
  fn released_stack_rejects_its_previous_owner() {
    let pool = pool(1);
    run_lightweight_in(&pool, || {
      let stack = get_stack().unwrap();
      stack.push().unwrap();
      stack.close().unwrap();
      assert!(!stack.is_owned());
      assert!(matches!(stack.push(), Err(Error::WrongThread)));
      // the context gets a fresh binding, here the same pooled stack
      let again = get_stack().unwrap();
      assert!(Arc::ptr_eq(&stack, &again));
      assert!(again.is_current());
    });
  }

  #[test]
  fn full_pool_discards_extra_stacks() {
    let pool = pool(1);
    run_lightweight_in(&pool, || {
      let a = pool.acquire().unwrap();
      let b = pool.acquire().unwrap();
      assert!(!Arc::ptr_eq(&a, &b));
      a.push().unwrap();
      b.push().unwrap();
      a.close().unwrap();
      b.close().unwrap();
    });
    assert_eq!(pool.idle(), 1);
  }
}
