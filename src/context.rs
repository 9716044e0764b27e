//! Execution contexts and the stacks bound to them.
//!
//! Every thread has an implicit *platform* context that owns a dedicated stack
//! for the thread's whole life. [`run_lightweight`] enters a short-lived
//! *lightweight* context on the current thread; its stack is borrowed from a
//! [`StackPool`] and goes back as soon as its outermost frame closes, or when
//! the context ends with no frame open.
//!
//! The binding is a per-thread table of context slots, innermost last.
use std::cell::RefCell;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::pool::StackPool;
use crate::stack::{Frame, NativeStack};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an execution context. Never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(NonZeroU64);

impl ContextId {
  fn fresh() -> ContextId {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    ContextId(NonZeroU64::new(id).expect("context id counter wrapped"))
  }

  pub fn get(self) -> u64 { self.0.get() }
}

enum Kind {
  Platform,
  Lightweight(Arc<StackPool>),
}

struct Slot {
  id:    ContextId,
  kind:  Kind,
  stack: Option<Arc<NativeStack>>,
}

thread_local! {
  static CONTEXTS: RefCell<Vec<Slot>> = const { RefCell::new(Vec::new()) };
}

fn innermost(slots: &mut Vec<Slot>) -> &mut Slot {
  if slots.is_empty() {
    slots.push(Slot { id: ContextId::fresh(), kind: Kind::Platform, stack: None });
  }
  let last = slots.len() - 1;
  &mut slots[last]
}

/// The context the calling code runs in.
///
/// `None` only while the thread's locals are being torn down.
pub fn current() -> Option<ContextId> {
  CONTEXTS.try_with(|slots| innermost(&mut slots.borrow_mut()).id).ok()
}

/// Whether the calling code runs in a lightweight context.
pub fn is_lightweight() -> bool {
  CONTEXTS
    .try_with(|slots| matches!(innermost(&mut slots.borrow_mut()).kind, Kind::Lightweight(_)))
    .unwrap_or(false)
}

/// Returns the stack bound to the calling context, creating or borrowing one first.
pub fn get_stack() -> Result<Arc<NativeStack>> {
  CONTEXTS
    .try_with(|slots| {
      let mut slots = slots.borrow_mut();
      let slot = innermost(&mut slots);
      if let Some(stack) = &slot.stack {
        return Ok(Arc::clone(stack));
      }
      let stack = match &slot.kind {
        Kind::Platform => NativeStack::create(Config::global(), Some(slot.id), None)?,
        Kind::Lightweight(pool) => pool.acquire_for(slot.id)?,
      };
      slot.stack = Some(Arc::clone(&stack));
      Ok(stack)
    })
    .map_err(|_| Error::WrongThread)?
}

/// `get_stack()?.frame()`.
pub fn push_stack() -> Result<Frame> {
  get_stack()?.frame()
}

/// Unbinds `stack` from the context `owner` if that context lives on this thread.
pub(crate) fn detach(owner: u64, stack: &NativeStack) {
  let taken = CONTEXTS.try_with(|slots| {
    let mut slots = slots.borrow_mut();
    slots
      .iter_mut()
      .rev()
      .find(|slot| slot.id.get() == owner)
      .and_then(|slot| {
        let bound = slot.stack.as_ref().is_some_and(|bound| ptr_eq(bound, stack));
        if bound { slot.stack.take() } else { None }
      })
  });
  // dropped outside the borrow
  drop(taken);
}

fn ptr_eq(a: &Arc<NativeStack>, b: &NativeStack) -> bool {
  std::ptr::eq(Arc::as_ptr(a), b)
}

/// Runs `f` in a fresh lightweight context drawing its stack from the global pool.
pub fn run_lightweight<R, F>(f: F) -> R
where F: FnOnce() -> R {
  run_lightweight_in(StackPool::global(), f)
}

/// Runs `f` in a fresh lightweight context drawing its stack from `pool`.
///
/// Contexts nest. A stack bound but idle when `f` returns goes back to the
/// pool. One with frames still open is not pooled and is released once its
/// last handle drops.
pub fn run_lightweight_in<R, F>(pool: &Arc<StackPool>, f: F) -> R
where F: FnOnce() -> R {
  let id = ContextId::fresh();
  CONTEXTS.with(|slots| {
    let mut slots = slots.borrow_mut();
    innermost(&mut slots);
    slots.push(Slot { id, kind: Kind::Lightweight(Arc::clone(pool)), stack: None });
  });
  let _exit = ExitGuard(id);
  f()
}

struct ExitGuard(ContextId);

impl Drop for ExitGuard {
  fn drop(&mut self) {
    let slot = CONTEXTS.try_with(|slots| {
      let mut slots = slots.borrow_mut();
      if slots.last().is_some_and(|slot| slot.id == self.0) { slots.pop() } else { None }
    });
    if let Ok(Some(Slot { stack: Some(stack), .. })) = slot {
      if !stack.end_of_context(self.0) {
        tracing::debug!(context = self.0.get(), "lightweight context ended with open frames");
      }
    }
  }
}

/// Drops this thread's dedicated stack now rather than at thread exit.
///
/// Idempotent; returns whether a stack was unbound. Outstanding handles keep
/// the backing alive until they drop. The next [`get_stack`] on this thread
/// creates a new one.
pub fn teardown() -> bool {
  let taken = CONTEXTS
    .try_with(|slots| slots.borrow_mut().first_mut().and_then(|slot| slot.stack.take()))
    .ok()
    .flatten();
  match taken {
    Some(stack) => {
      tracing::debug!(capacity = stack.capacity(), "tore down dedicated native stack");
      true
    }
    None => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;

  #[test]
  fn platform_context_is_stable_per_thread() {
    let a = current().unwrap();
    assert_eq!(current().unwrap(), a);
    let b = thread::spawn(|| current().unwrap()).join().unwrap();
    assert_ne!(a, b);
    assert!(!is_lightweight());
  }

  #[test]
  fn lightweight_contexts_nest() {
    let outer = current().unwrap();
    let pool = StackPool::new(Config { stack_size: 4096, cache_limit: 1, ..Config::default() }).unwrap();
    run_lightweight_in(&pool, || {
      let first = current().unwrap();
      assert_ne!(first, outer);
      assert!(is_lightweight());
      run_lightweight_in(&pool, || assert_ne!(current().unwrap(), first));
      assert_eq!(current().unwrap(), first);
    });
    assert_eq!(current().unwrap(), outer);
  }

  #[test]
  fn get_stack_is_cached_and_teardown_is_idempotent() {
    thread::spawn(|| {
      let a = get_stack().unwrap();
      let b = get_stack().unwrap();
      assert!(Arc::ptr_eq(&a, &b));
      assert!(!a.is_sharable());
      assert!(teardown());
      assert!(!teardown());
      let c = get_stack().unwrap();
      assert!(!Arc::ptr_eq(&a, &c));
    }).join().unwrap();
  }

  #[test]
  fn platform_stack_is_foreign_to_a_lightweight_context() {
    let platform = get_stack().unwrap();
    let pool = StackPool::new(Config { stack_size: 4096, cache_limit: 1, ..Config::default() }).unwrap();
    run_lightweight_in(&pool, || {
      assert!(matches!(platform.push(), Err(Error::WrongThread)));
    });
  }

  #[test]
  fn unclosed_lightweight_stack_is_not_pooled() {
    let pool = StackPool::new(Config { stack_size: 4096, cache_limit: 2, ..Config::default() }).unwrap();
    run_lightweight_in(&pool, || {
      get_stack().unwrap().push().unwrap();
    });
    assert_eq!(pool.idle(), 0);
  }

  #[test]
  fn idle_lightweight_stack_goes_back_to_the_pool() {
    let pool = StackPool::new(Config { stack_size: 4096, cache_limit: 2, ..Config::default() }).unwrap();
    // a context that never pushes a frame still returns its stack
    let first = run_lightweight_in(&pool, || get_stack().unwrap());
    assert_eq!(pool.idle(), 1);
    run_lightweight_in(&pool, || {
      let stack = get_stack().unwrap();
      assert!(Arc::ptr_eq(&stack, &first));
      assert_eq!(pool.idle(), 0);
    });
    assert_eq!(pool.idle(), 1);
    assert!(!first.is_owned());
  }
}
