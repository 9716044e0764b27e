use std::fmt;
use std::io::{self, Error};
use std::ptr::{null_mut, NonNull};

use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};

use crate::Backing;

const PROT: i32 = PROT_READ | PROT_WRITE;
const FLAGS: i32 = MAP_ANONYMOUS | MAP_PRIVATE;

const MMAP_RETURNED_NULL: &str =
  "Mmap returned null, which violates POSIX and certainly isn't sporting.";

/// An anonymous private mapping, rounded up to whole pages.
///
/// Pages are only committed when first touched, so a mostly idle 1 MiB stack
/// costs a page or two of resident memory.
pub struct OsBacking {
  start: NonNull<u8>,
  size:  usize,
}

// Safety: see AllocatorBacking; the mapping is owned and access is confined by NativeStack.
unsafe impl Send for OsBacking {}
unsafe impl Sync for OsBacking {}

impl fmt::Debug for OsBacking {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let start = self.start.as_ptr() as usize;
    write!(f, "OsBacking<{:x}-{:x}>", start, start + self.size)
  }
}

impl OsBacking {
  /// `mmap()`s a new `OsBacking`, rounding the size up to the page size for the platform.
  pub fn new(size: usize, page_size: PageSize) -> Result<OsBacking, Error> {
    if size == 0 {
      return Err(Error::new(io::ErrorKind::InvalidInput, "backing size must be non-zero"));
    }
    let size = page_size.round(size);
    let ptr = unsafe { libc::mmap(null_mut(), size, PROT, FLAGS, -1, 0) };
    if ptr == MAP_FAILED {
      return Err(Error::last_os_error());
    }
    match NonNull::new(ptr.cast::<u8>()) {
      Some(start) => Ok(OsBacking { start, size }),
      None => panic!("{}", MMAP_RETURNED_NULL),
    }
  }
}

impl Drop for OsBacking {
  fn drop(&mut self) {
    unsafe { libc::munmap(self.start.as_ptr().cast(), self.size) };
  }
}

unsafe impl Backing for OsBacking {
  fn base(&self) -> NonNull<u8> { self.start }
  fn size(&self) -> usize { self.size }
}

#[repr(transparent)]
#[derive(Clone, Copy, Debug)]
/// A value holding the operating system's standard pagesize (probably 4k).
pub struct PageSize(usize);

impl PageSize {
  pub fn get() -> Result<PageSize, Error> {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
      -1 => Err(Error::last_os_error()),
      size => Ok(PageSize(size as usize)),
    }
  }
  pub fn size(self) -> usize { self.0 }
  /// Round up to the nearest multiple of the page size.
  pub fn round(self, size: usize) -> usize {
    let mask = self.0 - 1; // page sizes are powers of two
    size.saturating_add(mask) & !mask
  }
}
