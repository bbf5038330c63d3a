//! Dump/undump round-trip laws: binary chunks reload into structurally
//! identical prototypes, strings deduplicate on the wire, and stripped
//! chunks drop exactly the debug payload.

use std::rc::Rc;

use tokudae::bytecode::Proto;
use tokudae::{Mode, State};

// ─── Helpers ──────────────────────────────────────────────────────────────────

const SAMPLE: &str = r#"
local version = 1.5
final limit = 1000

fn clamp(x) {
    if (x > limit) { return limit }
    elif (x < 0 - limit) { return 0 - limit }
    return x
}

class Counter {
    init(start) { self.n = clamp(start) }
    bump() { self.n = self.n + 1 return self.n }
    __tostring() { return "counter" }
}

fn run(items) {
    local total = 0
    for i = 1, 10 {
        total = total + i
    }
    for k, v in items {
        total = total + clamp(v)
    }
    switch (total) {
        case 0: return nil
        default: return total
    }
}
"#;

fn compile(src: &str) -> (State, Rc<Proto>) {
    let mut st = State::new();
    let p = st.load_str(src, "@sample.toku").expect("compile").p;
    (st, p)
}

/// Structural equality of everything the compiler guarantees to
/// round-trip.
fn assert_proto_eq(a: &Proto, b: &Proto, stripped: bool) {
    assert_eq!(a.code, b.code);
    assert_eq!(a.k.len(), b.k.len());
    for (ka, kb) in a.k.iter().zip(b.k.iter()) {
        assert!(ka.raw_eq(kb), "constant mismatch: {:?} vs {:?}", ka, kb);
    }
    assert_eq!(a.arity, b.arity);
    assert_eq!(a.is_vararg, b.is_vararg);
    assert_eq!(a.maxstack, b.maxstack);
    assert_eq!(a.defline, b.defline);
    assert_eq!(a.deflastline, b.deflastline);
    assert_eq!(a.upvals.len(), b.upvals.len());
    for (ua, ub) in a.upvals.iter().zip(b.upvals.iter()) {
        assert_eq!(ua.idx, ub.idx);
        assert_eq!(ua.in_stack, ub.in_stack);
        assert_eq!(ua.kind, ub.kind);
        if stripped {
            assert!(ub.name.is_none());
        } else {
            assert_eq!(ua.name.as_deref(), ub.name.as_deref());
        }
    }
    if stripped {
        assert!(b.source.is_none());
        assert!(b.lineinfo.is_empty());
        assert!(b.abslineinfo.is_empty());
        assert!(b.opcodepc.is_empty());
        assert!(b.locals.is_empty());
    } else {
        assert_eq!(a.source.as_deref(), b.source.as_deref());
        assert_eq!(a.lineinfo, b.lineinfo);
        assert_eq!(a.abslineinfo, b.abslineinfo);
        assert_eq!(a.opcodepc, b.opcodepc);
        assert_eq!(a.locals.len(), b.locals.len());
        for (la, lb) in a.locals.iter().zip(b.locals.iter()) {
            assert_eq!(la.name, lb.name);
            assert_eq!(la.start_pc, lb.start_pc);
            assert_eq!(la.end_pc, lb.end_pc);
        }
    }
    assert_eq!(a.p.len(), b.p.len());
    for (pa, pb) in a.p.iter().zip(b.p.iter()) {
        assert_proto_eq(pa, pb, stripped);
    }
}

// ─── Round-trip laws ─────────────────────────────────────────────────────────

#[test]
fn undump_reconstructs_the_proto_tree() {
    let (mut st, p) = compile(SAMPLE);
    let bytes = st.dump(&p, false);
    let loaded = st.load(&bytes, "@sample.toku", Mode::BINARY).unwrap().p;
    assert_proto_eq(&p, &loaded, false);
}

#[test]
fn dump_is_a_fixed_point() {
    let (mut st, p) = compile(SAMPLE);
    let bytes = st.dump(&p, false);
    let loaded = st.load(&bytes, "x", Mode::ALL).unwrap().p;
    assert_eq!(bytes, st.dump(&loaded, false));
}

#[test]
fn stripped_chunks_keep_semantics_only() {
    let (mut st, p) = compile(SAMPLE);
    let bytes = st.dump(&p, true);
    assert!(bytes.len() < st.dump(&p, false).len());
    let loaded = st.load(&bytes, "x", Mode::ALL).unwrap().p;
    assert_proto_eq(&p, &loaded, true);
    // Stripping is idempotent on the wire.
    assert_eq!(bytes, st.dump(&loaded, true));
}

#[test]
fn strings_deduplicate_on_the_wire() {
    let src = r#"
        fn a() { return "foo" }
        fn b() { return "foo" }
        fn c() { return "foo" }
    "#;
    let (mut st, p) = compile(src);
    let bytes = st.dump(&p, true); // strip so local names don't interfere
    // One fresh entry: size = len + 2, payload, NUL.
    let fresh: &[u8] = &[5, b'f', b'o', b'o', 0];
    let occurrences = bytes
        .windows(fresh.len())
        .filter(|w| *w == fresh)
        .count();
    assert_eq!(occurrences, 1, "\"foo\" must be written exactly once");
    // Reloading shares one interned string across all three protos.
    let loaded = st.load(&bytes, "x", Mode::ALL).unwrap().p;
    let strs: Vec<Rc<str>> = loaded
        .p
        .iter()
        .map(|f| match &f.k[0] {
            tokudae::Value::ShortStr(s) => s.0.clone(),
            other => panic!("expected string constant, got {:?}", other),
        })
        .collect();
    assert_eq!(strs.len(), 3);
    assert!(Rc::ptr_eq(&strs[0], &strs[1]));
    assert!(Rc::ptr_eq(&strs[0], &strs[2]));
}

#[test]
fn truncation_always_errors() {
    let (mut st, p) = compile("local x = 1 + 2.5");
    let bytes = st.dump(&p, false);
    for cut in [1, 8, 9, 16, bytes.len() / 2, bytes.len() - 1] {
        let err = st
            .load(&bytes[..cut], "t", Mode::ALL)
            .expect_err("truncated chunk must fail");
        assert!(err.to_string().contains("bad binary format"), "{}", err);
    }
}

#[test]
fn corrupted_constant_tag_errors() {
    let (mut st, p) = compile("local s = \"payload-string\"");
    let mut bytes = st.dump(&p, false);
    // Find the constant's tag byte right before the string payload and
    // clobber it.
    let needle = b"payload-string";
    let at = bytes
        .windows(needle.len())
        .position(|w| w == needle)
        .unwrap();
    bytes[at - 2] = 0x7e; // tag precedes the size byte
    let err = st.load(&bytes, "t", Mode::ALL).unwrap_err();
    assert!(err.to_string().contains("invalid constant"));
}

#[test]
fn reentrant_states_share_nothing() {
    // Two independent states may compile concurrently-equal sources
    // and produce identical bytes.
    let (mut st1, p1) = compile(SAMPLE);
    let (mut st2, p2) = compile(SAMPLE);
    assert_eq!(st1.dump(&p1, false), st2.dump(&p2, false));
    // Cross-state loading works: the chunk carries everything.
    let bytes = st1.dump(&p1, false);
    let loaded = st2.load(&bytes, "x", Mode::ALL).unwrap().p;
    assert_proto_eq(&p1, &loaded, false);
}
