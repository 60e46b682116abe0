//! Byte-exact variable-length integer vectors, decoded through the public
//! cursor API, with every input re-run split into two parts at each byte
//! boundary.

use userp::vint::{self, SignedVInt, VInt};
use userp::{Buffer, ByteString, Cursor};

fn bstr(chunks: &[&[u8]]) -> ByteString {
    let mut s = ByteString::new();
    for c in chunks {
        s.push_buffer(Buffer::copy_of(c), 0..c.len()).unwrap();
    }
    s
}

#[test]
fn vsize_zero() {
    let s = bstr(&[b"\x00"]);
    let mut cur = Cursor::new(&s);
    assert_eq!(vint::read_vsize(&mut cur, &s).unwrap(), 0);
    assert_eq!(cur.byte_pos(&s), 1);
}

#[test]
fn vsize_127() {
    let s = bstr(&[b"\xFE"]);
    let mut cur = Cursor::new(&s);
    assert_eq!(vint::read_vsize(&mut cur, &s).unwrap(), 0x7F);
    assert_eq!(cur.byte_pos(&s), 1);
}

#[test]
fn vsize_128() {
    let s = bstr(&[b"\x01\x02"]);
    let mut cur = Cursor::new(&s);
    assert_eq!(vint::read_vsize(&mut cur, &s).unwrap(), 0x80);
    assert_eq!(cur.byte_pos(&s), 2);
}

#[test]
fn vint_8_5_gigs_split_anywhere() {
    let bytes = b"\x0F\xFF\xFF\xFF\xFF\x01\x00\x00\x00";
    for split in 0..=bytes.len() {
        let s = if split == 0 || split == bytes.len() {
            bstr(&[bytes])
        } else {
            bstr(&[&bytes[..split], &bytes[split..]])
        };
        let mut cur = Cursor::new(&s);
        match vint::read_vint(&mut cur, &s).unwrap() {
            VInt::Small(v) => assert_eq!(v, 0x1_FFFF_FFFF, "split={split}"),
            VInt::Big(_) => panic!("unexpected bigint"),
        }
        assert_eq!(cur.byte_pos(&s), 9);
    }
}

#[test]
fn full_vector_table() {
    let cases: &[(&[u8], u64)] = &[
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
    for (bytes, expect) in cases {
        for split in 0..bytes.len() {
            let s = if split == 0 {
                bstr(&[bytes])
            } else {
                bstr(&[&bytes[..split], &bytes[split..]])
            };
            let mut cur = Cursor::new(&s);
            match vint::read_vint(&mut cur, &s).unwrap() {
                VInt::Small(v) => assert_eq!(v, *expect, "bytes={bytes:02X?} split={split}"),
                VInt::Big(_) => panic!("unexpected bigint for {bytes:02X?}"),
            }
            assert_eq!(cur.byte_pos(&s), bytes.len());
        }
    }
}

#[test]
fn signed_round_trip_through_writer() {
    use userp::enc::Writer;
    let values = [
        0i64,
        1,
        -1,
        63,
        -63,
        64,
        -64,
        0x1FFF,
        -0x2000,
        0xFFFF_FFFF,
        -0xFFFF_FFFF,
        i64::MAX,
        i64::MIN + 1,
    ];
    let mut w = Writer::new();
    for v in values {
        w.write_vint_signed(v).unwrap();
    }
    let s = w.into_bstr();
    let mut cur = Cursor::new(&s);
    for v in values {
        match vint::read_vint_signed(&mut cur, &s).unwrap() {
            SignedVInt::Small(got) => assert_eq!(got, v),
            SignedVInt::Big(_) => panic!("unexpected bigint for {v}"),
        }
    }
    assert!(cur.at_end(&s));
}

#[test]
fn bigint_window_is_zero_copy() {
    use userp::enc::Writer;
    let mut w = Writer::new();
    w.write_bigint(false, &[0xDEAD_BEEF_0BAD_F00D, 0x0123_4567_89AB_CDEF])
        .unwrap();
    let s = w.into_bstr();
    let mut cur = Cursor::new(&s);
    match vint::read_vint(&mut cur, &s).unwrap() {
        VInt::Big(b) => {
            assert!(!b.negative);
            assert_eq!(b.limbs, 2);
            assert_eq!(b.data.len(), 16);
            // windows share the source buffer rather than copying
            assert_eq!(b.data.part_count(), 1);
            assert!(std::rc::Rc::ptr_eq(
                b.data.parts()[0].buffer(),
                s.parts()[0].buffer()
            ));
            let bytes = b.data.to_vec();
            assert_eq!(&bytes[..8], &0xDEAD_BEEF_0BAD_F00Du64.to_le_bytes());
        }
        VInt::Small(v) => panic!("expected bigint, got {v}"),
    }
}
