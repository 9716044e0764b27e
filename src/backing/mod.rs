//! Backing regions a [`NativeStack`](crate::NativeStack) bump-allocates from.

mod allocator;
pub use allocator::*;

#[cfg(unix)]
mod os_unix;
#[cfg(unix)]
pub use os_unix::*;

use crate::config::BackingKind;
use crate::Backing;

/// A type-erased backing, owned by exactly one stack.
pub type BoxedBacking = Box<dyn Backing + Send + Sync>;

/// Obtains a fresh region of at least `size` bytes.
///
/// `BackingKind::Os` falls back to the global allocator where there is no `mmap`.
pub fn create(kind: BackingKind, size: usize) -> std::io::Result<BoxedBacking> {
  match kind {
    #[cfg(unix)]
    BackingKind::Os => Ok(Box::new(OsBacking::new(size, PageSize::get()?)?)),
    #[cfg(not(unix))]
    BackingKind::Os => Ok(Box::new(AllocatorBacking::new(size)?)),
    BackingKind::Allocator => Ok(Box::new(AllocatorBacking::new(size)?)),
  }
}
