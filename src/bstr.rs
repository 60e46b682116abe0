use std::ops::Range;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::buffer::{Buffer, BufferFlags};
use crate::error::Error;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AppendFlags: u32 {
        /// The entire appended span must land in a single part.
        const CONTIGUOUS = 0x0001;
    }
}

/// One window into a reference-counted [`Buffer`].
///
/// `ofs` is the logical offset of this window from the start of the string
/// it belongs to; parts chain contiguously in logical space even though
/// their bytes may live in unrelated buffers.
#[derive(Debug, Clone)]
pub struct Part {
    buf: Rc<Buffer>,
    range: Range<usize>,
    ofs: usize,
}

impl Part {
    /// Make a window over `range` of `buf`.  Fails with
    /// [`Error::BufPointer`] when the range lies outside the buffer.
    pub fn new(buf: Rc<Buffer>, range: Range<usize>) -> Result<Part, Error> {
        buf.check_range(&range)?;
        Ok(Part { buf, range, ofs: 0 })
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buf.bytes()[self.range.clone()]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.range.end - self.range.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Logical offset of this part from the start of its string.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.ofs
    }

    #[must_use]
    pub fn buffer(&self) -> &Rc<Buffer> {
        &self.buf
    }

    #[must_use]
    pub(crate) fn buf_range(&self) -> Range<usize> {
        self.range.clone()
    }
}

/// An ordered sequence of [`Part`] windows forming one logical byte string.
///
/// Byte strings are the unit of input for the decoder and the unit of
/// storage for symbol-name data: logically contiguous, physically scattered
/// over any number of shared buffers.  Appending prefers extending the tail
/// buffer in place when it is appendable, uniquely referenced, and has
/// spare capacity; otherwise a new buffer is allocated, growing
/// geometrically.
#[derive(Debug, Clone, Default)]
pub struct ByteString {
    parts: SmallVec<[Part; 4]>,
}

impl ByteString {
    #[must_use]
    pub fn new() -> ByteString {
        ByteString {
            parts: SmallVec::new(),
        }
    }

    /// Total logical length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parts.last().map_or(0, |p| p.ofs + p.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    #[must_use]
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Grow the part vector to hold at least `n_parts`, rounded to a
    /// multiple of 16 with at least 8 slots of headroom.  Shrinking only
    /// happens on [`ByteString::release`].
    pub fn reserve_parts(&mut self, n_parts: usize) {
        let rounded = (n_parts + 8 + 15) & !15usize;
        if rounded > self.parts.capacity() {
            self.parts.reserve(rounded - self.parts.len());
        }
    }

    /// Drop every part (and with each, its buffer reference) and free the
    /// part vector.
    pub fn release(&mut self) {
        self.parts = SmallVec::new();
    }

    /// Drop parts from the tail until `n` remain.  Transactional callers
    /// use this to roll back to a recorded part count.
    pub(crate) fn truncate_parts(&mut self, n: usize) {
        self.parts.truncate(n);
    }

    /// Append a window as a new part, rebasing its logical offset onto the
    /// end of this string.
    pub fn push_part(&mut self, mut part: Part) {
        part.ofs = self.len();
        self.parts.push(part);
    }

    /// Append a window over `range` of `buf`.
    pub fn push_buffer(&mut self, buf: Rc<Buffer>, range: Range<usize>) -> Result<(), Error> {
        self.push_part(Part::new(buf, range)?);
        Ok(())
    }

    /// Copy part records from another string, taking a buffer reference for
    /// each.
    pub fn append_parts(&mut self, parts: &[Part]) {
        self.reserve_parts(self.parts.len() + parts.len());
        for part in parts {
            self.push_part(part.clone());
        }
    }

    /// Append a copy of `bytes`.  With [`AppendFlags::CONTIGUOUS`] the span
    /// is guaranteed to land in a single part.
    pub fn append_bytes(&mut self, bytes: &[u8], flags: AppendFlags) -> Result<(), Error> {
        let mut rest = bytes;
        if let Some(part) = self.parts.last_mut() {
            if part.range.end == part.buf.len() && part.buf.is_appendable() {
                if let Some(buf) = Rc::get_mut(&mut part.buf) {
                    let avail = buf.spare();
                    if avail > 0 && (avail >= rest.len() || !flags.contains(AppendFlags::CONTIGUOUS))
                    {
                        let n = avail.min(rest.len());
                        buf.push_bytes(&rest[..n]);
                        part.range.end += n;
                        rest = &rest[n..];
                    }
                }
            }
        }
        if !rest.is_empty() {
            let mut buf = self.new_tail_buffer(rest.len());
            buf.push_bytes(rest);
            let range = 0..rest.len();
            self.push_part(Part {
                buf: Rc::new(buf),
                range,
                ofs: 0,
            });
        }
        Ok(())
    }

    /// Reserve `len` writable bytes in a single part and return them
    /// (zero-filled).
    pub fn append_reserve(&mut self, len: usize) -> Result<&mut [u8], Error> {
        let tail_fits = self.parts.last().is_some_and(|p| {
            p.range.end == p.buf.len()
                && p.buf.is_appendable()
                && Rc::strong_count(&p.buf) == 1
                && p.buf.spare() >= len
        });
        if tail_fits {
            let part = self
                .parts
                .last_mut()
                .ok_or(Error::BadState("tail part vanished"))?;
            let buf = Rc::get_mut(&mut part.buf).ok_or(Error::BadState("tail buffer shared"))?;
            let range = buf.push_zeroed(len);
            part.range.end = range.end;
            Ok(buf.bytes_mut(range))
        } else {
            let mut buf = self.new_tail_buffer(len);
            let range = buf.push_zeroed(len);
            self.push_part(Part {
                buf: Rc::new(buf),
                range: range.clone(),
                ofs: 0,
            });
            let part = self
                .parts
                .last_mut()
                .ok_or(Error::BadState("tail part vanished"))?;
            let buf = Rc::get_mut(&mut part.buf).ok_or(Error::BadState("fresh buffer shared"))?;
            Ok(buf.bytes_mut(range))
        }
    }

    /// Contiguous append that also reports where the bytes landed, for
    /// callers that keep long-lived references to the copied span.
    pub(crate) fn append_contiguous(
        &mut self,
        bytes: &[u8],
    ) -> Result<(Rc<Buffer>, Range<usize>), Error> {
        self.append_bytes(bytes, AppendFlags::CONTIGUOUS)?;
        let part = self
            .parts
            .last()
            .ok_or(Error::BadState("append left no tail part"))?;
        let end = part.range.end;
        Ok((Rc::clone(&part.buf), end - bytes.len()..end))
    }

    /// Zero-copy sub-range: a new string whose parts window the same
    /// buffers.  `None` when the range is out of bounds.
    #[must_use]
    pub fn substr(&self, range: Range<usize>) -> Option<ByteString> {
        if range.start > range.end || range.end > self.len() {
            return None;
        }
        let mut out = ByteString::new();
        for part in &self.parts {
            let pstart = part.ofs;
            let pend = part.ofs + part.len();
            let s = range.start.max(pstart);
            let e = range.end.min(pend);
            if s >= e {
                continue;
            }
            out.parts.push(Part {
                buf: Rc::clone(&part.buf),
                range: part.range.start + (s - pstart)..part.range.start + (e - pstart),
                ofs: s - range.start,
            });
        }
        Some(out)
    }

    /// Copy the whole logical content out as one vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for part in &self.parts {
            out.extend_from_slice(part.bytes());
        }
        out
    }

    /// New appendable buffer at least 1.5x the size of the previous tail
    /// buffer (power-of-two rounding makes it 2x in practice).
    fn new_tail_buffer(&self, len: usize) -> Buffer {
        let prev_cap = self.parts.last().map_or(0, |p| p.buf.capacity());
        let capacity = len.max(prev_cap + 1);
        Buffer::raw_with_capacity(capacity, BufferFlags::APPENDABLE)
    }
}

#[test]
fn append_and_tail_extension() {
    let mut s = ByteString::new();
    s.append_bytes(b"abc", AppendFlags::empty()).unwrap();
    assert_eq!(s.part_count(), 1);
    // the 4-byte buffer has spare room to extend into
    s.append_bytes(b"d", AppendFlags::empty()).unwrap();
    assert_eq!(s.part_count(), 1);
    assert_eq!(s.to_vec(), b"abcd");
    // overflowing the tail rolls into a new, larger buffer
    s.append_bytes(b"efghijklmnop", AppendFlags::empty()).unwrap();
    assert_eq!(s.to_vec(), b"abcdefghijklmnop");
    assert!(s.parts().last().unwrap().buffer().capacity() > 4);
}

#[test]
fn shared_tail_forces_new_part() {
    let mut s = ByteString::new();
    s.append_bytes(b"abc", AppendFlags::empty()).unwrap();
    let held = Rc::clone(s.parts()[0].buffer());
    s.append_bytes(b"def", AppendFlags::empty()).unwrap();
    assert_eq!(s.part_count(), 2);
    assert_eq!(s.to_vec(), b"abcdef");
    assert_eq!(held.bytes(), b"abc");
}

#[test]
fn contiguous_span_is_single_part() {
    let mut s = ByteString::new();
    // tiny exact buffer so the span cannot extend it
    let buf = Buffer::copy_of(b"xy");
    s.push_buffer(buf, 0..2).unwrap();
    s.append_bytes(b"0123456789", AppendFlags::CONTIGUOUS).unwrap();
    assert_eq!(s.part_count(), 2);
    assert_eq!(s.parts()[1].len(), 10);
    let (buf, range) = {
        let mut t = ByteString::new();
        t.append_contiguous(b"name\0").unwrap()
    };
    assert_eq!(&buf.bytes()[range], b"name\0");
}

#[test]
fn substr_windows() {
    let mut s = ByteString::new();
    s.push_buffer(Buffer::copy_of(b"abcd"), 0..4).unwrap();
    s.push_buffer(Buffer::copy_of(b"efgh"), 0..4).unwrap();
    let w = s.substr(2..6).unwrap();
    assert_eq!(w.to_vec(), b"cdef");
    assert_eq!(w.part_count(), 2);
    assert_eq!(w.parts()[0].offset(), 0);
    assert_eq!(w.parts()[1].offset(), 2);
    assert_eq!(w.len(), 4);
    assert!(s.substr(3..9).is_none());
    assert!(s.substr(8..8).unwrap().is_empty());
}
