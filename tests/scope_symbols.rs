//! Symbol-block parsing and scope-stack reference scenarios.

use std::rc::Rc;

use userp::{Buffer, Env, Error, Part, Scope};

fn part(bytes: &[u8]) -> Part {
    Part::new(Buffer::copy_of(bytes), 0..bytes.len()).unwrap()
}

#[test]
fn parse_five_symbols() {
    let env = Env::new();
    let mut scope = Scope::new(&env, None).unwrap();
    scope
        .parse_symbols(&[part(b"ace\0bat\0car\0dog\0egg\0")], 5)
        .unwrap();
    assert_eq!(scope.symbol_count(), 5);
    scope.finalize().unwrap();
    let car = scope.get_symbol("car").unwrap();
    assert_eq!(car.get(), 3);
    assert_eq!(scope.symbol_name(car), Some("car"));
    assert_eq!(scope.get_symbol("ace").unwrap().get(), 1);
    assert_eq!(scope.get_symbol("egg").unwrap().get(), 5);
    assert_eq!(scope.get_symbol("eel"), None);
}

#[test]
fn symbol_split_across_parts() {
    let env = Env::new();
    let mut scope = Scope::new(&env, None).unwrap();
    // 19 bytes, no trailing NUL: "fragment2" continues into the next part
    scope
        .parse_symbols(
            &[part(b"fragment1\0fragment2"), part(b"fun\0get\0has\0imp\0jam\0")],
            6,
        )
        .unwrap();
    assert_eq!(scope.symbol_count(), 6);
    scope.finalize().unwrap();
    assert_eq!(scope.get_symbol("fragment1").unwrap().get(), 1);
    // the joined name spans the boundary, materialized contiguously
    assert_eq!(scope.get_symbol("fragment2fun").unwrap().get(), 2);
    assert_eq!(scope.get_symbol("get").unwrap().get(), 3);
    assert_eq!(scope.get_symbol("jam").unwrap().get(), 6);
}

#[test]
fn short_symbol_block_is_transactional() {
    let env = Env::new();
    let mut scope = Scope::new(&env, None).unwrap();
    scope.add_symbol("existing").unwrap();
    let err = scope
        .parse_symbols(&[part(b"one\0two\0three")], 5)
        .unwrap_err();
    assert_eq!(err, Error::Overrun);
    assert_eq!(scope.symbol_count(), 1);
    assert!(scope.get_symbol("one").is_none());
}

#[test]
fn bad_utf8_rejected_with_rollback() {
    let env = Env::new();
    let mut scope = Scope::new(&env, None).unwrap();
    // over-long encoding of '/': C0 AF
    let err = scope
        .parse_symbols(&[part(b"good\0\xC0\xAF\0")], 2)
        .unwrap_err();
    assert!(matches!(err, Error::Symbol { .. }), "got {err:?}");
    assert_eq!(scope.symbol_count(), 0);
}

#[test]
fn relative_symref_in_deep_stack() {
    let env = Env::new();
    let mut top: Option<Rc<Scope>> = None;
    for level in 0..4 {
        let mut s = Scope::new(&env, top.as_ref()).unwrap();
        s.add_symbol(&format!("lvl{level}_a")).unwrap();
        s.add_symbol(&format!("lvl{level}_b")).unwrap();
        s.finalize().unwrap();
        top = Some(Rc::new(s));
    }
    let top = top.unwrap();
    assert_eq!(top.symbol_count(), 8);

    // 0b0000000001: depth 1, offset 0 -> first symbol of the top table
    let sym = top.resolve_relative_symref(0b01).unwrap();
    assert_eq!(top.symbol_name(sym), Some("lvl3_a"));

    // depth 2 selects the second table from the bottom
    let sym = top.resolve_relative_symref(0b011).unwrap();
    assert_eq!(top.symbol_name(sym), Some("lvl1_a"));

    // depth 3 selects the second table from the top
    let sym = top.resolve_relative_symref(0b0111).unwrap();
    assert_eq!(top.symbol_name(sym), Some("lvl2_a"));

    // absolute references use even values
    let sym = top.resolve_relative_symref(5 << 1).unwrap();
    assert_eq!(top.symbol_name(sym), Some("lvl2_a"));

    // out of range resolves to None rather than an error
    assert!(top.resolve_relative_symref(9 << 1).is_none());
    assert!(top.resolve_relative_symref(0b1001).is_none());
}

#[test]
fn symbols_inherit_across_levels() {
    let env = Env::new();
    let mut root = Scope::new(&env, None).unwrap();
    let ace = root.add_symbol("ace").unwrap();
    let root = root.into_shared().unwrap();
    let mut child = Scope::new(&env, Some(&root)).unwrap();
    // same name resolves to the inherited id, not a new one
    assert_eq!(child.add_symbol("ace").unwrap(), ace);
    assert_eq!(child.symbol_count(), 1);
    let new = child.add_symbol("deuce").unwrap();
    assert_eq!(new.get(), 2);
    assert_eq!(child.symbol_name(ace), Some("ace"));
}

#[test]
fn large_symbol_block_round_trip() {
    // a block big enough to push the index through a reshape
    let mut blob = Vec::new();
    let count = 3000;
    for i in 0..count {
        blob.extend_from_slice(format!("name_{i:05}\0").as_bytes());
    }
    let env = Env::new();
    let mut scope = Scope::new(&env, None).unwrap();
    scope.parse_symbols(&[part(&blob)], count).unwrap();
    scope.finalize().unwrap();
    for i in (0..count).step_by(131) {
        let name = format!("name_{i:05}");
        let sym = scope.get_symbol(&name).unwrap();
        assert_eq!(sym.get() as usize, i + 1);
        assert_eq!(scope.symbol_name(sym), Some(name.as_str()));
    }
}
