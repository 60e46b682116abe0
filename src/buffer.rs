use std::fmt;
use std::ops::Range;
use std::rc::Rc;

use crate::error::Error;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        /// Writers may extend the buffer into its unused capacity.
        const APPENDABLE = 0x0001;
        /// Allocate exactly the requested capacity instead of rounding it
        /// up to a power of two.
        const EXACT = 0x0002;
    }
}

/// A contiguous byte region shared by reference count.
///
/// Buffers are handed around as `Rc<Buffer>`: every [`Part`] of a
/// [`ByteString`] holds one reference, as does a decoder that was given the
/// buffer as input.  Mutation (appending into unused capacity) is only
/// possible while exactly one reference exists, which `Rc::get_mut`
/// enforces; that is the appendability gate the byte-string layer relies
/// on.
///
/// [`Part`]: crate::bstr::Part
/// [`ByteString`]: crate::bstr::ByteString
pub struct Buffer {
    data: Vec<u8>,
    flags: BufferFlags,
}

impl Buffer {
    /// Allocate an empty buffer with at least `capacity` bytes of storage.
    /// The capacity is rounded up to a power of two unless
    /// [`BufferFlags::EXACT`] is given.
    #[must_use]
    pub fn with_capacity(capacity: usize, flags: BufferFlags) -> Rc<Buffer> {
        Rc::new(Self::raw_with_capacity(capacity, flags))
    }

    /// As [`Buffer::with_capacity`] but not yet shared, so the caller may
    /// fill it before wrapping it in an `Rc`.
    #[must_use]
    pub(crate) fn raw_with_capacity(capacity: usize, flags: BufferFlags) -> Buffer {
        let capacity = if flags.contains(BufferFlags::EXACT) {
            capacity
        } else {
            capacity.next_power_of_two()
        };
        Buffer {
            data: Vec::with_capacity(capacity),
            flags,
        }
    }

    /// Wrap caller-provided bytes without copying.
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Rc<Buffer> {
        Rc::new(Buffer {
            data,
            flags: BufferFlags::empty(),
        })
    }

    /// Copy the given bytes into a new buffer sized exactly to fit.
    #[must_use]
    pub fn copy_of(bytes: &[u8]) -> Rc<Buffer> {
        Rc::new(Buffer {
            data: bytes.to_vec(),
            flags: BufferFlags::empty(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    #[must_use]
    pub fn is_appendable(&self) -> bool {
        self.flags.contains(BufferFlags::APPENDABLE)
    }

    /// Bytes of unused capacity past the current length.
    #[must_use]
    pub fn spare(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    /// Verify that `range` addresses bytes currently in this buffer.
    pub fn check_range(&self, range: &Range<usize>) -> Result<(), Error> {
        if range.start > range.end || range.end > self.data.len() {
            return Err(Error::BufPointer);
        }
        Ok(())
    }

    /// Append bytes.  The caller limits the count to [`Buffer::spare`]; the
    /// byte-string layer uses this to extend a tail part in place.
    pub(crate) fn push_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Append `n` zero bytes, returning the range they occupy.
    pub(crate) fn push_zeroed(&mut self, n: usize) -> Range<usize> {
        let start = self.data.len();
        self.data.resize(start + n, 0);
        start..self.data.len()
    }

    /// Mutable view of a range appended earlier in the same call chain.
    pub(crate) fn bytes_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        &mut self.data[range]
    }
}

impl fmt::Debug for Buffer {
    /// Debug-print sizes and flags rather than the buffer content.
    #[cold]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.data.len())
            .field("capacity", &self.data.capacity())
            .field("flags", &self.flags)
            .finish()
    }
}

#[test]
fn capacity_rounding() {
    let buf = Buffer::with_capacity(33, BufferFlags::APPENDABLE);
    assert!(buf.capacity() >= 64);
    let exact = Buffer::with_capacity(33, BufferFlags::EXACT);
    assert!(exact.capacity() >= 33);
    assert!(buf.is_appendable());
    assert!(!exact.is_appendable());
}

#[test]
fn range_check() {
    let buf = Buffer::copy_of(b"abcdef");
    assert!(buf.check_range(&(0..6)).is_ok());
    assert!(buf.check_range(&(2..4)).is_ok());
    assert_eq!(buf.check_range(&(2..7)), Err(Error::BufPointer));
    #[allow(clippy::reversed_empty_ranges)]
    let backwards = 4..2;
    assert_eq!(buf.check_range(&backwards), Err(Error::BufPointer));
}
