//! Variable-length integer codecs.
//!
//! All forms are byte-aligned at the start and little-endian.  The first
//! byte is a selector: the number of trailing 1 bits picks the frame.
//!
//! ```text
//! .......0                    7-bit value in the selector's high bits
//! ......01  + 1 byte          14-bit value (u16 >> 2)
//! .....011  + 3 bytes         29-bit value (u32 >> 3)
//! ....0111  + 4 bytes         32-bit value in the following bytes
//! ...01111  + 8 bytes         64-bit value in the following bytes
//! SLL11111                    bigint: S = sign, LL = inline limb count
//! ```
//!
//! A bigint's inline limb count of zero is followed by a 16-bit count; zero
//! again by a 32-bit count, then a 64-bit count.  Limbs are 8 bytes each and
//! are exposed zero-copy as a window onto the source string.

use crate::bits::Cursor;
use crate::bstr::ByteString;
use crate::error::Error;

/// An unsigned variable-length integer: either a value that fits in 64
/// bits, or a reference to the bigint bytes still sitting in the stream.
#[derive(Debug, Clone)]
pub enum VInt {
    Small(u64),
    Big(BigInt),
}

/// A signed variable-length integer.
#[derive(Debug, Clone)]
pub enum SignedVInt {
    Small(i64),
    Big(BigInt),
}

/// Zero-copy view of a bigint's magnitude.
#[derive(Debug, Clone)]
pub struct BigInt {
    pub negative: bool,
    /// Number of 8-byte limbs.
    pub limbs: usize,
    /// Little-endian magnitude, `limbs * 8` bytes, windowed onto the
    /// source buffers.
    pub data: ByteString,
}

/// Read `n` (1..=8) whole bytes as a little-endian quantity.
fn read_le(cur: &mut Cursor, s: &ByteString, n: u32) -> Result<u64, Error> {
    let mut val = 0u64;
    for i in 0..n {
        val |= (cur.read_byte(s)? as u64) << (8 * i);
    }
    Ok(val)
}

fn read_vint_inner(cur: &mut Cursor, s: &ByteString) -> Result<VInt, Error> {
    let sel = cur.read_byte(s)?;
    if sel & 0x01 == 0 {
        return Ok(VInt::Small((sel >> 1) as u64));
    }
    if sel & 0x02 == 0 {
        let rest = cur.read_byte(s)? as u64;
        return Ok(VInt::Small((sel as u64 | (rest << 8)) >> 2));
    }
    if sel & 0x04 == 0 {
        let rest = read_le(cur, s, 3)?;
        return Ok(VInt::Small((sel as u64 | (rest << 8)) >> 3));
    }
    if sel & 0x08 == 0 {
        return Ok(VInt::Small(read_le(cur, s, 4)?));
    }
    if sel & 0x10 == 0 {
        return Ok(VInt::Small(read_le(cur, s, 8)?));
    }
    // bigint
    let negative = sel & 0x80 != 0;
    let mut limbs = ((sel >> 5) & 3) as u64;
    if limbs == 0 {
        limbs = read_le(cur, s, 2)?;
    }
    if limbs == 0 {
        limbs = read_le(cur, s, 4)?;
    }
    if limbs == 0 {
        limbs = read_le(cur, s, 8)?;
    }
    if limbs == 0 {
        return Err(Error::Protocol("bigint with zero limb count"));
    }
    let limbs = usize::try_from(limbs).map_err(|_| Error::Overflow)?;
    if limbs > usize::MAX / 8 {
        return Err(Error::Overflow);
    }
    let start = cur.byte_pos(s);
    cur.skip_bytes(s, limbs * 8)?;
    let data = s
        .substr(start..start + limbs * 8)
        .ok_or(Error::BadState("bigint window out of range"))?;
    Ok(VInt::Big(BigInt {
        negative,
        limbs,
        data,
    }))
}

/// Decode an unsigned variable-length integer.  A bigint with its sign bit
/// set is a protocol error here.  On failure the cursor is unchanged.
pub fn read_vint(cur: &mut Cursor, s: &ByteString) -> Result<VInt, Error> {
    let snap = *cur;
    let result = read_vint_inner(cur, s).and_then(|v| match v {
        VInt::Big(ref b) if b.negative => Err(Error::Protocol("sign bit set on unsigned varint")),
        other => Ok(other),
    });
    if result.is_err() {
        *cur = snap;
    }
    result
}

/// Decode a signed variable-length integer.  Non-bigint frames carry the
/// sign in the low bit of the decoded quantity.
pub fn read_vint_signed(cur: &mut Cursor, s: &ByteString) -> Result<SignedVInt, Error> {
    let snap = *cur;
    let result = read_vint_inner(cur, s).map(|v| match v {
        VInt::Small(raw) => SignedVInt::Small(if raw & 1 != 0 {
            -((raw >> 1) as i64)
        } else {
            (raw >> 1) as i64
        }),
        VInt::Big(b) => SignedVInt::Big(b),
    });
    if result.is_err() {
        *cur = snap;
    }
    result
}

/// Decode an unsigned variable-length integer that must fit a `usize`.
/// The 1- and 2-byte frames are decoded straight out of the current part
/// when at least two whole bytes remain there.
pub fn read_vsize(cur: &mut Cursor, s: &ByteString) -> Result<usize, Error> {
    let avail = cur.current_slice(s);
    if avail.len() >= 2 {
        let sel = avail[0];
        if sel & 0x01 == 0 {
            cur.skip_bytes(s, 1)?;
            return Ok((sel >> 1) as usize);
        }
        if sel & 0x02 == 0 {
            let val = u16::from_le_bytes([avail[0], avail[1]]) >> 2;
            cur.skip_bytes(s, 2)?;
            return Ok(val as usize);
        }
    }
    let snap = *cur;
    let result = read_vint_inner(cur, s).and_then(|v| match v {
        VInt::Small(v) => usize::try_from(v).map_err(|_| Error::Overflow),
        VInt::Big(_) => Err(Error::Overflow),
    });
    if result.is_err() {
        *cur = snap;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;

    fn bstr_split(bytes: &[u8], split: usize) -> ByteString {
        let mut s = ByteString::new();
        if split == 0 || split >= bytes.len() {
            s.push_buffer(Buffer::copy_of(bytes), 0..bytes.len()).unwrap();
        } else {
            s.push_buffer(Buffer::copy_of(&bytes[..split]), 0..split).unwrap();
            s.push_buffer(Buffer::copy_of(&bytes[split..]), 0..bytes.len() - split)
                .unwrap();
        }
        s
    }

    const VECTORS: &[(&[u8], u64)] = &[
        (b"\x00", 0x00000000),
        (b"\x02", 0x00000001),
        (b"\xFE", 0x0000007F),
        (b"\x01\x02", 0x00000080),
        (b"\xFD\x03", 0x000000FF),
        (b"\x01\x04", 0x00000100),
        (b"\xFD\xFF", 0x00003FFF),
        (b"\x03\x00\x02\x00", 0x00004000),
        (b"\xFB\xFF\xFF\xFF", 0x1FFFFFFF),
        (b"\x07\x00\x00\x00\x20", 0x20000000),
        (b"\x07\xFF\xFF\xFF\xFF", 0xFFFFFFFF),
        (b"\x0F\xFF\xFF\xFF\xFF\x01\x00\x00\x00", 0x1_FFFF_FFFF),
        (b"\x0F\xFF\xFF\xFF\xFF\xFF\xFF\xFF\xFF", u64::MAX),
    ];

    #[test]
    fn unsigned_vectors() {
        for (bytes, expect) in VECTORS {
            // also with the input split into two parts at every boundary
            for split in 0..bytes.len() {
                let s = bstr_split(bytes, split);
                let mut cur = Cursor::new(&s);
                match read_vint(&mut cur, &s).unwrap() {
                    VInt::Small(v) => assert_eq!(v, *expect, "bytes={bytes:02X?} split={split}"),
                    VInt::Big(_) => panic!("unexpected bigint for {bytes:02X?}"),
                }
                assert_eq!(cur.byte_pos(&s), bytes.len(), "cursor advance for {bytes:02X?}");
            }
        }
    }

    #[test]
    fn vsize_vectors() {
        for (bytes, expect) in VECTORS {
            for split in 0..bytes.len() {
                let s = bstr_split(bytes, split);
                let mut cur = Cursor::new(&s);
                assert_eq!(read_vsize(&mut cur, &s).unwrap(), *expect as usize);
                assert_eq!(cur.byte_pos(&s), bytes.len());
            }
        }
    }

    #[test]
    fn signed_small() {
        let cases: &[(&[u8], i64)] = &[
            (b"\x00", 0),
            (b"\x04", 1),
            (b"\x06", -1),
            (b"\xFC", 63),
            (b"\xFE", -63),
        ];
        for (bytes, expect) in cases {
            let s = bstr_split(bytes, 0);
            let mut cur = Cursor::new(&s);
            match read_vint_signed(&mut cur, &s).unwrap() {
                SignedVInt::Small(v) => assert_eq!(v, *expect, "bytes={bytes:02X?}"),
                SignedVInt::Big(_) => panic!("unexpected bigint"),
            }
        }
        // two-byte frame: raw = u16 >> 2 = 0x0205 >> 2 = 0x81 -> -(0x40)
        let s = bstr_split(b"\x05\x02", 0);
        let mut cur = Cursor::new(&s);
        match read_vint_signed(&mut cur, &s).unwrap() {
            SignedVInt::Small(v) => assert_eq!(v, -0x40),
            SignedVInt::Big(_) => panic!("unexpected bigint"),
        }
    }

    #[test]
    fn bigint_inline_count() {
        // one inline limb, positive
        let mut bytes = vec![0x3Fu8];
        bytes.extend_from_slice(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        let s = bstr_split(&bytes, 0);
        let mut cur = Cursor::new(&s);
        match read_vint(&mut cur, &s).unwrap() {
            VInt::Big(b) => {
                assert!(!b.negative);
                assert_eq!(b.limbs, 1);
                assert_eq!(b.data.to_vec(), &bytes[1..]);
            }
            VInt::Small(v) => panic!("expected bigint, got {v}"),
        }
        assert_eq!(cur.byte_pos(&s), 9);

        // negative bigint rejected by the unsigned reader but fine signed
        bytes[0] = 0xBF;
        let s = bstr_split(&bytes, 0);
        let mut cur = Cursor::new(&s);
        let before = cur;
        assert!(read_vint(&mut cur, &s).is_err());
        assert_eq!(cur, before, "failed read must not move the cursor");
        match read_vint_signed(&mut cur, &s).unwrap() {
            SignedVInt::Big(b) => assert!(b.negative),
            SignedVInt::Small(v) => panic!("expected bigint, got {v}"),
        }
    }

    #[test]
    fn bigint_extended_count() {
        // inline count 0 -> 16-bit count of 2 limbs
        let mut bytes = vec![0x1F, 0x02, 0x00];
        bytes.extend_from_slice(&[0xAA; 16]);
        let s = bstr_split(&bytes, 0);
        let mut cur = Cursor::new(&s);
        match read_vint(&mut cur, &s).unwrap() {
            VInt::Big(b) => {
                assert_eq!(b.limbs, 2);
                assert_eq!(b.data.len(), 16);
            }
            VInt::Small(v) => panic!("expected bigint, got {v}"),
        }
    }

    #[test]
    fn bigint_limb_overflow() {
        // 16-bit and 32-bit counts zero, 64-bit count enormous
        let mut bytes = vec![0x1F, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        bytes.extend_from_slice(&(1u64 << 62).to_le_bytes());
        let s = bstr_split(&bytes, 0);
        let mut cur = Cursor::new(&s);
        assert_eq!(read_vint(&mut cur, &s).unwrap_err(), Error::Overflow);
    }

    #[test]
    fn truncated_input() {
        for bytes in [&b"\x01"[..], b"\x03\x00", b"\x07\x00\x00", b"\x3F\x01\x02"] {
            let s = bstr_split(bytes, 0);
            let mut cur = Cursor::new(&s);
            let before = cur;
            assert_eq!(
                read_vint(&mut cur, &s).unwrap_err(),
                Error::Overrun,
                "bytes={bytes:02X?}"
            );
            assert_eq!(cur, before);
        }
    }

    #[test]
    fn vsize_rejects_oversize() {
        let bytes = b"\x0F\xFF\xFF\xFF\xFF\xFF\xFF\xFF\xFF";
        if usize::BITS >= 64 {
            let s = bstr_split(bytes, 0);
            let mut cur = Cursor::new(&s);
            assert_eq!(read_vsize(&mut cur, &s).unwrap(), usize::MAX);
        }
        // a bigint never fits a usize
        let mut big = vec![0x3F];
        big.extend_from_slice(&[0u8; 8]);
        let s = bstr_split(&big, 0);
        let mut cur = Cursor::new(&s);
        assert_eq!(read_vsize(&mut cur, &s).unwrap_err(), Error::Overflow);
    }
}
