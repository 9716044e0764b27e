//! Error types for native stack operations
use std::io;
use thiserror::Error;

/// Result type for native stack operations
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while using a native stack.
///
/// Every failing operation leaves the stack exactly as it found it.
#[derive(Error, Debug)]
pub enum Error {
  /// The requested size does not fit in an `isize`.
  #[error("Invalid allocation size : {0}")]
  InvalidSize(usize),

  /// The requested alignment is zero or not a power of two.
  #[error("Invalid alignment constraint : {0}")]
  InvalidAlignment(usize),

  /// The calling context is not the current owner of the stack.
  #[error("Not on the thread of the native stack")]
  WrongThread,

  /// `close` was called without a matching `push`.
  #[error("Stack is empty")]
  EmptyStack,

  /// The allocation would run past the end of the backing region.
  #[error("Native stack overflow: requested {requested} bytes, {available} available")]
  Overflow {
    /// Bytes the allocation needed, alignment padding included
    requested: usize,
    /// Bytes left between the bump pointer and the end of the region
    available: usize,
  },

  /// The operating system or the global allocator refused a backing region.
  #[error("Could not obtain a backing region: {0}")]
  Backing(#[from] io::Error),

  /// A configuration value could not be parsed or is out of range.
  #[error("Invalid configuration value for {key}: {value:?}")]
  Config {
    /// The configuration key (environment variable name)
    key: &'static str,
    /// The offending value
    value: String,
  },
}

/// Coarse classification of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  InvalidArgument,
  WrongThread,
  EmptyStack,
  Overflow,
  Backing,
  Config,
}

impl Error {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Error::InvalidSize(_) | Error::InvalidAlignment(_) => ErrorKind::InvalidArgument,
      Error::WrongThread => ErrorKind::WrongThread,
      Error::EmptyStack => ErrorKind::EmptyStack,
      Error::Overflow { .. } => ErrorKind::Overflow,
      Error::Backing(_) => ErrorKind::Backing,
      Error::Config { .. } => ErrorKind::Config,
    }
  }
}
