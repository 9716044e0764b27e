//! A scoped, thread-confined bump allocator for off-heap memory.
//!
//! Each execution context gets a [`NativeStack`]: one fixed-size region, a
//! bump offset and a record of saved offsets. Push a frame, allocate from it,
//! close it and everything allocated since the push is released at once.
//!
//! ```
//! use native_stack::push_stack;
//!
//! let outer = push_stack().unwrap();
//! let a = outer.allocate(32, 8).unwrap();
//! {
//!   let inner = push_stack().unwrap();
//!   let b = inner.allocate(16, 4).unwrap();
//!   assert!(!a.overlaps(&b));
//! }
//! let c = outer.allocate(8, 1).unwrap();
//! assert!(!a.overlaps(&c));
//! ```
use std::ptr::NonNull;

pub mod backing;
pub mod config;
pub mod context;
pub mod error;
pub mod pool;
pub mod stack;

pub use config::{BackingKind, ClearPolicy, Config};
pub use context::{get_stack, push_stack, run_lightweight, run_lightweight_in, teardown, ContextId};
pub use error::{Error, ErrorKind, Result};
pub use pool::StackPool;
pub use stack::{Frame, NativeStack, Region};

/// A contiguous region a [`NativeStack`] allocates from.
///
/// # Safety
///
/// * `base()` must point to `size()` bytes that stay readable and writable,
///   at a fixed address, for as long as the value lives.
pub unsafe trait Backing {
  /// Returns a pointer to the start of the region.
  fn base(&self) -> NonNull<u8>;
  /// Returns the usable length of the region in bytes.
  fn size(&self) -> usize;
}
