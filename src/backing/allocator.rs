use std::alloc::{alloc, dealloc, Layout};
use std::io;
use std::ptr::NonNull;

use crate::Backing;

/// A fixed-size GlobalAlloc-allocated backing region
pub struct AllocatorBacking {
  start: NonNull<u8>,
  size:  usize,
}

// Enough for any scalar the platform ABIs define; callers ask for more via `allocate`.
const ALIGN: usize = 16;

// Safety: the region is owned and never handed out except through `NativeStack`,
// whose owner check confines access to one context at a time.
unsafe impl Send for AllocatorBacking {}
unsafe impl Sync for AllocatorBacking {}

impl AllocatorBacking {
  /// Allocates a new region on the heap with the given size.
  pub fn new(size: usize) -> io::Result<AllocatorBacking> {
    if size == 0 {
      return Err(io::Error::new(io::ErrorKind::InvalidInput, "backing size must be non-zero"));
    }
    let layout = Layout::from_size_align(size, ALIGN)
      .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // Safety: layout has a non-zero size.
    let start = unsafe { alloc(layout) };
    match NonNull::new(start) {
      Some(start) => Ok(AllocatorBacking { start, size }),
      None => Err(io::Error::from(io::ErrorKind::OutOfMemory)),
    }
  }
}

impl Drop for AllocatorBacking {
  fn drop(&mut self) {
    // Safety: same layout `new` validated and allocated with.
    unsafe { dealloc(self.start.as_ptr(), Layout::from_size_align_unchecked(self.size, ALIGN)) }
  }
}

unsafe impl Backing for AllocatorBacking {
  fn base(&self) -> NonNull<u8> { self.start }
  fn size(&self) -> usize { self.size }
}
