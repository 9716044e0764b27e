//! The stack itself: a fixed region, a bump offset and a record of saved offsets.
//!
//! A [`NativeStack`] is confined to one execution context at a time. Every
//! operation compares the caller's [`ContextId`] with the recorded owner and
//! fails with [`Error::WrongThread`] on a mismatch, so the hot path never
//! takes a lock. Frames are closed strictly LIFO; closing one rewinds the bump
//! offset to where it was when the frame was pushed.
//!
//! # Examples
//!
//! ```
//! let frame = native_stack::push_stack().unwrap();
//! let region = frame.allocate(32, 8).unwrap();
//! assert_eq!(region.addr() % 8, 0);
//! drop(frame); // rewinds
//! ```
use std::alloc::Layout;
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::backing::{self, BoxedBacking};
use crate::config::{ClearPolicy, Config};
use crate::context::{self, ContextId};
use crate::error::{Error, Result};
use crate::pool::StackPool;

const UNOWNED: u64 = 0;
const INITIAL_FRAMES: usize = 8;

struct State {
  offset: usize,
  frames: Vec<usize>,
}

pub struct NativeStack {
  backing:  BoxedBacking,
  base:     NonNull<u8>,
  capacity: usize,
  clear:    ClearPolicy,
  owner:    AtomicU64,
  /// The pool a sharable stack returns to. `None` for dedicated stacks.
  home:     Option<Weak<StackPool>>,
  this:     Weak<NativeStack>,
  state:    UnsafeCell<State>,
}

// Safety: `state` and the backing bytes are only touched after `check_thread`
// has confirmed the caller is the single owning context. Ownership moves
// between threads only through the pool lock.
unsafe impl Send for NativeStack {}
unsafe impl Sync for NativeStack {}

impl fmt::Debug for NativeStack {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("NativeStack")
      .field("base", &self.base)
      .field("capacity", &self.capacity)
      .field("owner", &self.owner.load(Ordering::Relaxed))
      .field("sharable", &self.is_sharable())
      .finish_non_exhaustive()
  }
}

impl NativeStack {
  /// Creates a dedicated stack owned by the calling context.
  ///
  /// The stack is not registered with the context; most callers want
  /// [`get_stack`](crate::get_stack) instead.
  pub fn with_config(config: &Config) -> Result<Arc<NativeStack>> {
    let owner = context::current().ok_or(Error::WrongThread)?;
    NativeStack::create(config, Some(owner), None)
  }

  pub(crate) fn create(
    config: &Config,
    owner: Option<ContextId>,
    home: Option<Weak<StackPool>>,
  ) -> Result<Arc<NativeStack>> {
    config.validate()?;
    let backing = backing::create(config.backing, config.stack_size)?;
    let base = backing.base();
    tracing::debug!(
      size = config.stack_size,
      sharable = home.is_some(),
      backing = ?config.backing,
      "created native stack"
    );
    Ok(Arc::new_cyclic(|this| NativeStack {
      base,
      capacity: config.stack_size.min(backing.size()),
      backing,
      clear: config.clear,
      owner: AtomicU64::new(owner.map_or(UNOWNED, ContextId::get)),
      home,
      this: this.clone(),
      state: UnsafeCell::new(State { offset: 0, frames: Vec::with_capacity(INITIAL_FRAMES) }),
    }))
  }

  fn check_thread(&self) -> Result<()> {
    match context::current() {
      Some(id) if id.get() == self.owner.load(Ordering::Acquire) => Ok(()),
      _ => Err(Error::WrongThread),
    }
  }

  /// # Safety
  ///
  /// Only call after `check_thread` succeeded, and do not hold two results at once.
  #[allow(clippy::mut_from_ref)]
  unsafe fn state(&self) -> &mut State {
    &mut *self.state.get()
  }

  pub(crate) fn change_owner(&self, owner: ContextId) {
    debug_assert!(self.is_sharable());
    tracing::trace!(owner = owner.get(), "native stack changed owner");
    self.owner.store(owner.get(), Ordering::Release);
  }

  /// Opens a new frame. Nothing is allocated until [`allocate`](Self::allocate).
  pub fn push(&self) -> Result<&Self> {
    self.check_thread()?;
    // Safety: owner checked.
    let state = unsafe { self.state() };
    state.frames.push(state.offset);
    Ok(self)
  }

  /// Opens a new frame that closes itself when the returned guard drops.
  pub fn frame(self: &Arc<Self>) -> Result<Frame> {
    self.push()?;
    Ok(Frame { stack: Arc::clone(self), _confined: PhantomData })
  }

  /// Runs `f` inside a fresh frame. The frame closes even if `f` panics.
  pub fn scope<R, F>(self: &Arc<Self>, f: F) -> Result<R>
  where F: FnOnce(&NativeStack) -> R {
    let frame = self.frame()?;
    Ok(f(&frame))
  }

  /// Closes the innermost frame, releasing everything allocated since its `push`.
  ///
  /// A sharable stack whose last frame closes gives up its owner and goes back
  /// to its pool.
  pub fn close(&self) -> Result<()> {
    self.check_thread()?;
    // Safety: owner checked.
    let state = unsafe { self.state() };
    let prev = state.frames.pop().ok_or(Error::EmptyStack)?;
    if self.clear == ClearPolicy::Zero && state.offset > prev {
      // Safety: [prev, offset) lies inside the backing and belongs to the closed frame.
      unsafe { self.base.as_ptr().add(prev).write_bytes(0, state.offset - prev) };
    }
    state.offset = prev;

    if state.frames.is_empty() {
      if let Some(home) = &self.home {
        self.release(home);
      }
    }
    Ok(())
  }

  fn release(&self, home: &Weak<StackPool>) {
    let this = self.this.upgrade();
    let owner = self.owner.swap(UNOWNED, Ordering::AcqRel);
    tracing::trace!(owner, "native stack released its owner");
    context::detach(owner, self);
    if let (Some(pool), Some(this)) = (home.upgrade(), this) {
      pool.give_back(this);
    }
  }

  /// Gives an idle sharable stack back to its pool when `owner` ends.
  ///
  /// Returns false, leaving the stack alone, if `owner` does not hold it or
  /// frames are still open.
  pub(crate) fn end_of_context(&self, owner: ContextId) -> bool {
    if self.owner.load(Ordering::Acquire) != owner.get() {
      return false;
    }
    // Safety: `owner` is ending on this thread and still holds the stack.
    let idle = unsafe { self.state() }.frames.is_empty();
    match &self.home {
      Some(home) if idle => {
        self.release(home);
        true
      }
      _ => false,
    }
  }

  /// Reserves `byte_size` bytes aligned to `byte_alignment` in the innermost frame.
  ///
  /// Any padding needed for the alignment is consumed but not part of the region.
  pub fn allocate(&self, byte_size: usize, byte_alignment: usize) -> Result<Region> {
    self.check_thread()?;
    check_size_and_align(byte_size, byte_alignment)?;
    // Safety: owner checked.
    let state = unsafe { self.state() };

    let base = self.base.as_ptr() as usize;
    let available = self.capacity - state.offset;
    let start = align_up(base + state.offset, byte_alignment).map(|addr| addr - base);
    let end = start.and_then(|start| start.checked_add(byte_size));
    let (start, end) = match (start, end) {
      (Some(start), Some(end)) if end <= self.capacity => (start, end),
      _ => {
        let padding = start.map_or(byte_alignment - 1, |s| s.saturating_sub(state.offset));
        return Err(Error::Overflow { requested: padding.saturating_add(byte_size), available });
      }
    };

    state.offset = end;
    // Safety: start <= capacity, inside the backing.
    let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(start)) };
    Ok(Region { ptr, len: byte_size, offset: start })
  }

  /// `allocate(byte_size, 1)`.
  pub fn allocate_bytes(&self, byte_size: usize) -> Result<Region> {
    self.allocate(byte_size, 1)
  }

  pub fn allocate_layout(&self, layout: Layout) -> Result<Region> {
    self.allocate(layout.size(), layout.align())
  }

  /// Moves `value` onto the stack.
  ///
  /// `T` must be `Copy`: closing a frame never runs destructors.
  pub fn allocate_value<T: Copy>(&self, value: T) -> Result<NonNull<T>> {
    let ptr = self.allocate_layout(Layout::new::<T>())?.ptr.cast::<T>();
    // Safety: freshly reserved, aligned for T.
    unsafe { ptr.as_ptr().write(value) };
    Ok(ptr)
  }

  /// Copies `values` onto the stack.
  pub fn allocate_slice<T: Copy>(&self, values: &[T]) -> Result<NonNull<[T]>> {
    let layout = Layout::for_value(values);
    let ptr = self.allocate_layout(layout)?.ptr.cast::<T>();
    // Safety: freshly reserved, aligned and sized for `values`; cannot overlap it.
    unsafe { ptr::copy_nonoverlapping(values.as_ptr(), ptr.as_ptr(), values.len()) };
    Ok(NonNull::slice_from_raw_parts(ptr, values.len()))
  }

  /// Copies `s` onto the stack as a NUL-terminated C string.
  ///
  /// The region covers the terminator.
  pub fn allocate_utf8(&self, s: &str) -> Result<Region> {
    let region = self.allocate_bytes(s.len() + 1)?;
    // Safety: the region is s.len() + 1 fresh bytes.
    unsafe {
      ptr::copy_nonoverlapping(s.as_ptr(), region.as_ptr(), s.len());
      region.as_ptr().add(s.len()).write(0);
    }
    Ok(region)
  }

  /// Bump offset relative to the start of the backing.
  pub fn offset(&self) -> Result<usize> {
    self.check_thread()?;
    // Safety: owner checked.
    Ok(unsafe { self.state() }.offset)
  }

  /// Number of open frames.
  pub fn depth(&self) -> Result<usize> {
    self.check_thread()?;
    // Safety: owner checked.
    Ok(unsafe { self.state() }.frames.len())
  }

  pub fn remaining(&self) -> Result<usize> {
    Ok(self.capacity - self.offset()?)
  }

  pub fn capacity(&self) -> usize { self.capacity }

  pub fn is_sharable(&self) -> bool { self.home.is_some() }

  pub fn is_owned(&self) -> bool { self.owner.load(Ordering::Acquire) != UNOWNED }

  /// Whether the calling context owns this stack.
  pub fn is_current(&self) -> bool { self.check_thread().is_ok() }
}

impl Drop for NativeStack {
  fn drop(&mut self) {
    tracing::debug!(
      size = self.backing.size(),
      sharable = self.is_sharable(),
      "released native stack"
    );
  }
}

fn check_size_and_align(byte_size: usize, byte_alignment: usize) -> Result<()> {
  // a size that would be negative as an isize
  if byte_size > isize::MAX as usize {
    return Err(Error::InvalidSize(byte_size));
  }
  if !byte_alignment.is_power_of_two() {
    return Err(Error::InvalidAlignment(byte_alignment));
  }
  Ok(())
}

/// `None` on overflow. `alignment` must be a power of two.
fn align_up(n: usize, alignment: usize) -> Option<usize> {
  let mask = alignment - 1;
  n.checked_add(mask).map(|n| n & !mask)
}

/// A reserved byte range of a [`NativeStack`].
///
/// Valid until the frame it was allocated in closes; nothing enforces that.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
  ptr:    NonNull<u8>,
  len:    usize,
  offset: usize,
}

impl Region {
  pub fn as_ptr(&self) -> *mut u8 { self.ptr.as_ptr() }
  pub fn addr(&self) -> usize { self.ptr.as_ptr() as usize }
  pub fn len(&self) -> usize { self.len }
  pub fn is_empty(&self) -> bool { self.len == 0 }
  /// Start of the region relative to the start of the stack.
  pub fn offset(&self) -> usize { self.offset }
  /// One past the end, relative to the start of the stack.
  pub fn end(&self) -> usize { self.offset + self.len }

  pub fn overlaps(&self, other: &Region) -> bool {
    self.offset < other.end() && other.offset < self.end()
  }

  /// # Safety
  ///
  /// * The frame the region was allocated in must still be open for `'a`.
  /// * The caller must be the stack's owner.
  pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
    std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
  }

  /// # Safety
  ///
  /// As [`as_slice`](Self::as_slice), and no other reference into the region may be live.
  pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
    std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
  }
}

/// An open frame of a [`NativeStack`], closed on drop.
///
/// Dereferences to the stack so allocations can be made directly against it.
/// Not `Send`: a frame must close on the context that opened it.
pub struct Frame {
  stack: Arc<NativeStack>,
  _confined: PhantomData<*const ()>,
}

impl Frame {
  pub fn stack(&self) -> &Arc<NativeStack> { &self.stack }
}

impl Deref for Frame {
  type Target = NativeStack;
  fn deref(&self) -> &NativeStack { &self.stack }
}

impl fmt::Debug for Frame {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_tuple("Frame").field(&self.stack).finish()
  }
}

impl Drop for Frame {
  fn drop(&mut self) {
    if let Err(err) = self.stack.close() {
      tracing::error!(error = %err, "failed to close native stack frame");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ErrorKind;
  use std::thread;

  fn small() -> Config {
    Config { stack_size: 4096, ..Config::default() }
  }

  #[test]
  fn align_up_rounds_to_power_of_two() {
    assert_eq!(align_up(0, 8), Some(0));
    assert_eq!(align_up(1, 8), Some(8));
    assert_eq!(align_up(8, 8), Some(8));
    assert_eq!(align_up(17, 1), Some(17));
    assert_eq!(align_up(usize::MAX, 2), None);
  }

  #[test]
  fn argument_checks() {
    assert_eq!(check_size_and_align(usize::MAX, 8).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert!(matches!(check_size_and_align(8, 3), Err(Error::InvalidAlignment(3))));
    assert!(matches!(check_size_and_align(8, 0), Err(Error::InvalidAlignment(0))));
    check_size_and_align(0, 1).unwrap();
  }

  #[test]
  fn push_allocate_close_rewinds() {
    let stack = NativeStack::with_config(&small()).unwrap();
    stack.push().unwrap();
    let a = stack.allocate(3, 1).unwrap();
    let b = stack.allocate(8, 8).unwrap();
    assert_eq!(a.offset(), 0);
    assert_eq!(b.offset(), 8);
    assert!(!a.overlaps(&b));
    assert_eq!(stack.offset().unwrap(), 16);
    stack.close().unwrap();
    assert_eq!(stack.offset().unwrap(), 0);
    assert_eq!(stack.depth().unwrap(), 0);
  }

  #[test]
  fn overflow_is_a_hard_failure() {
    let stack = NativeStack::with_config(&small()).unwrap();
    let _frame = stack.frame().unwrap();
    stack.allocate(4000, 1).unwrap();
    let err = stack.allocate(200, 1).unwrap_err();
    assert!(matches!(err, Error::Overflow { requested: 200, available: 96 }));
    assert_eq!(stack.offset().unwrap(), 4000);
    // exactly filling the rest is fine
    stack.allocate(96, 1).unwrap();
    assert_eq!(stack.remaining().unwrap(), 0);
    stack.allocate(0, 1).unwrap();
  }

  #[test]
  fn frames_grow_past_initial_capacity() {
    let stack = NativeStack::with_config(&small()).unwrap();
    for _ in 0..INITIAL_FRAMES * 4 {
      stack.push().unwrap();
      stack.allocate(1, 1).unwrap();
    }
    assert_eq!(stack.depth().unwrap(), INITIAL_FRAMES * 4);
    for _ in 0..INITIAL_FRAMES * 4 {
      stack.close().unwrap();
    }
    assert_eq!(stack.offset().unwrap(), 0);
  }

  #[test]
  fn zero_policy_clears_released_bytes() {
    let config = Config { clear: ClearPolicy::Zero, ..small() };
    let stack = NativeStack::with_config(&config).unwrap();
    let region = stack.scope(|stack| {
      let region = stack.allocate(64, 1).unwrap();
      unsafe { region.as_mut_slice() }.fill(0xEE);
      region
    }).unwrap();
    assert!(unsafe { region.as_slice() }.iter().all(|&b| b == 0));
  }

  #[test]
  fn retain_policy_keeps_released_bytes() {
    let stack = NativeStack::with_config(&small()).unwrap();
    let region = stack.scope(|stack| {
      let region = stack.allocate(16, 1).unwrap();
      unsafe { region.as_mut_slice() }.fill(0x5A);
      region
    }).unwrap();
    assert!(unsafe { region.as_slice() }.iter().all(|&b| b == 0x5A));
  }

  #[test]
  fn typed_helpers() {
    let stack = NativeStack::with_config(&small()).unwrap();
    let _frame = stack.frame().unwrap();
    stack.allocate_bytes(1).unwrap();
    let v = stack.allocate_value(0x1122_3344_5566_7788u64).unwrap();
    assert_eq!(v.as_ptr() as usize % 8, 0);
    assert_eq!(unsafe { *v.as_ptr() }, 0x1122_3344_5566_7788);
    let s = stack.allocate_slice(&[1u32, 2, 3]).unwrap();
    assert_eq!(unsafe { s.as_ref() }, &[1, 2, 3]);
    let c = stack.allocate_utf8("hello").unwrap();
    assert_eq!(unsafe { c.as_slice() }, b"hello\0");
  }

  #[test]
  fn frame_closes_during_unwind() {
    let stack = NativeStack::with_config(&small()).unwrap();
    let inner = Arc::clone(&stack);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
      let frame = inner.frame().unwrap();
      frame.allocate(128, 16).unwrap();
      panic!("boom");
    }));
    assert!(result.is_err());
    assert_eq!(stack.depth().unwrap(), 0);
    assert_eq!(stack.offset().unwrap(), 0);
  }

  #[test]
  fn foreign_thread_is_rejected_without_side_effects() {
    let stack = NativeStack::with_config(&small()).unwrap();
    stack.push().unwrap();
    stack.allocate(24, 8).unwrap();

    let remote = Arc::clone(&stack);
    thread::spawn(move || {
      assert!(matches!(remote.push(), Err(Error::WrongThread)));
      assert!(matches!(remote.allocate(8, 8), Err(Error::WrongThread)));
      assert!(matches!(remote.close(), Err(Error::WrongThread)));
      assert!(matches!(remote.offset(), Err(Error::WrongThread)));
      assert!(!remote.is_current());
    }).join().unwrap();

    assert_eq!(stack.offset().unwrap(), 24);
    assert_eq!(stack.depth().unwrap(), 1);
  }
}
