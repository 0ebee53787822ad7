//! ## Flat wire format
//!
//! Everything that crosses a process boundary in flatwire is a "flat"
//! structure: a fixed block of scalars addressed by byte offset into a
//! [`FlatBuffer`], with variable-length fields stored as a relative
//! `{offset, count}` pair measured from the field's own location. Relative
//! offsets make a finished buffer position independent, so the same bytes
//! can be parsed in place whether they arrived over a socket or sit inside
//! a shared-memory ring.
//!
//! All integers are little-endian on the wire.

pub mod buffer;
pub mod endpoint;
pub mod flat;
pub mod header;
pub mod oid;

pub use self::buffer::FlatBuffer;

use std::{array::TryFromSliceError, str::Utf8Error};

/// Hard ceiling for a single message, and for buffer growth. Frames whose
/// header claims more than this are rejected before any allocation.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug)]
pub enum Error {
    /// A buffer would have to grow past its limit, or a view-mode prepare
    /// ran past the end of the foreign region.
    LengthLimit,
    /// An offset access fell outside the readable window.
    OutOfBounds,
    /// A frame is truncated or its size fields do not add up.
    BadFrame,
    UnknownEnumValue,
    Utf8Error(Utf8Error),
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}
