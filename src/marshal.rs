//! Dump and undump of precompiled chunks in binary format.
//!
//! The layout is deterministic: a fixed header with conversion canaries,
//! then the prototype tree with varint-coded sizes, deduplicated
//! strings, and alignment padding before the absolute line-info block.
//! Undumping never trusts the input: every size, tag and check value is
//! validated and any mismatch surfaces as a `SyntaxError` through the
//! normal error channel.

use std::collections::HashMap;
use std::rc::Rc;

use crate::bytecode::{AbsLineInfo, LocalInfo, Proto, UpvalInfo, VarKind};
use crate::errors::SyntaxError;
use crate::limits::{MAX_SHORT_LEN, VERSION_MAJOR, VERSION_MINOR};
use crate::state::State;
use crate::value::{TStr, Value};

/// Binary chunks start with ESC so no text chunk can collide.
pub const SIGNATURE: &[u8; 8] = b"\x1bTokudae";

/// Major/minor version packed one nibble each.
const VERSION_BYTE: u8 = (VERSION_MAJOR << 4) | VERSION_MINOR;
const FORMAT_BYTE: u8 = 0;

/// Endianness/newline-translation canary.
const CHECK_DATA: &[u8; 6] = b"\x19\x93\r\n\x1a\n";
const CHECK_I32: i32 = -69;
const CHECK_INT: i64 = -69;
const CHECK_OPCODE: u8 = 0xf1;
const CHECK_NUM: f64 = -69.5;

// Wire tags for constants: low nibble is the base type, high nibble
// the variant.
const TAG_NIL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x11;
const TAG_INT: u8 = 0x02;
const TAG_FLT: u8 = 0x12;
const TAG_SHRSTR: u8 = 0x04;
const TAG_LNGSTR: u8 = 0x14;

type Res<T> = Result<T, SyntaxError>;

// ---------------------------------------------------------------------------
// Dump
// ---------------------------------------------------------------------------

struct Dumper {
    out: Vec<u8>,
    strip: bool,
    /// Already-emitted strings and their ordinals, for reuse.
    saved: HashMap<Rc<str>, u64>,
    nstr: u64,
}

/// Serialize `f` and its transitive prototypes. With `strip`, all debug
/// information is written as empty.
pub fn dump(f: &Proto, strip: bool) -> Vec<u8> {
    let mut d = Dumper { out: Vec::new(), strip, saved: HashMap::new(), nstr: 0 };
    d.header();
    d.int(f.upvals.len());
    d.function(f);
    d.out
}

impl Dumper {
    fn byte(&mut self, b: u8) {
        self.out.push(b);
    }

    fn block(&mut self, b: &[u8]) {
        self.out.extend_from_slice(b);
    }

    /// MSB-continuation varint: 7 payload bits per byte, most
    /// significant group first, high bit set on all but the last byte.
    /// The buffer is filled from the right and its occupied suffix
    /// emitted.
    fn varint(&mut self, mut x: u64) {
        const N: usize = (u64::BITS as usize + 6) / 7;
        let mut buf = [0u8; N];
        let mut n = 1;
        buf[N - 1] = (x & 0x7f) as u8;
        x >>= 7;
        while x != 0 {
            n += 1;
            buf[N - n] = ((x & 0x7f) | 0x80) as u8;
            x >>= 7;
        }
        let start = N - n;
        let suffix = buf[start..].to_vec();
        self.block(&suffix);
    }

    fn int(&mut self, x: usize) {
        self.varint(x as u64);
    }

    /// Signed integers are zig-zag coded to keep small values small:
    /// 0 => 0, -1 => 1, 1 => 2, -2 => 3, 2 => 4, ...
    fn integer(&mut self, x: i64) {
        let cx = if x >= 0 {
            (x as u64) << 1
        } else {
            (!(x as u64) << 1) | 1
        };
        self.varint(cx);
    }

    fn number(&mut self, x: f64) {
        self.block(&x.to_le_bytes());
    }

    /// Pad with zero bytes up to `align`; the padding content is
    /// unspecified on load.
    fn align(&mut self, align: usize) {
        let rem = self.out.len() % align;
        if rem != 0 {
            for _ in rem..align {
                self.byte(0);
            }
        }
        debug_assert_eq!(self.out.len() % align, 0);
    }

    fn string(&mut self, s: Option<&Rc<str>>) {
        let s = match s {
            None => {
                self.varint(0);
                return;
            }
            Some(s) => s,
        };
        if let Some(&ordinal) = self.saved.get(&**s) {
            self.varint(1); // reuse a saved string
            self.varint(ordinal);
        } else {
            // +2 keeps sizes 0 and 1 free for the cases above.
            self.varint(s.len() as u64 + 2);
            self.block(s.as_bytes());
            self.byte(0);
            self.saved.insert(s.clone(), self.nstr);
            self.nstr += 1;
        }
    }

    fn header(&mut self) {
        self.block(SIGNATURE);
        self.byte(VERSION_BYTE);
        self.byte(FORMAT_BYTE);
        self.block(CHECK_DATA);
        self.byte(4);
        self.block(&CHECK_I32.to_le_bytes());
        self.byte(1);
        self.byte(CHECK_OPCODE);
        self.byte(8);
        self.block(&CHECK_INT.to_le_bytes());
        self.byte(8);
        self.block(&CHECK_NUM.to_le_bytes());
    }

    fn code(&mut self, f: &Proto) {
        self.int(f.code.len());
        self.align(std::mem::size_of::<u8>()); // opcode-size boundary
        self.block(&f.code);
    }

    fn constants(&mut self, f: &Proto) {
        self.int(f.k.len());
        for k in &f.k {
            match k {
                Value::Nil => self.byte(TAG_NIL),
                Value::Bool(false) => self.byte(TAG_FALSE),
                Value::Bool(true) => self.byte(TAG_TRUE),
                Value::Int(i) => {
                    self.byte(TAG_INT);
                    self.integer(*i);
                }
                Value::Float(x) => {
                    self.byte(TAG_FLT);
                    self.number(*x);
                }
                Value::ShortStr(s) => {
                    self.byte(TAG_SHRSTR);
                    self.string(Some(&s.0));
                }
                Value::LongStr(s) => {
                    self.byte(TAG_LNGSTR);
                    self.string(Some(s));
                }
                other => unreachable!("non-literal constant {:?}", other),
            }
        }
    }

    fn upvalues(&mut self, f: &Proto) {
        self.int(f.upvals.len());
        for uv in &f.upvals {
            self.int(uv.idx as usize);
            self.byte(uv.in_stack as u8);
            self.byte(uv.kind as u8);
        }
    }

    fn debug(&mut self, f: &Proto) {
        self.string(if self.strip { None } else { f.source.as_ref() });
        let n = if self.strip { 0 } else { f.lineinfo.len() };
        self.int(n);
        if n > 0 {
            let bytes: Vec<u8> = f.lineinfo.iter().map(|&d| d as u8).collect();
            self.block(&bytes);
        }
        let n = if self.strip { 0 } else { f.abslineinfo.len() };
        self.int(n);
        if n > 0 {
            self.align(std::mem::size_of::<u32>());
            for a in &f.abslineinfo {
                self.block(&a.pc.to_le_bytes());
                self.block(&a.line.to_le_bytes());
            }
        }
        let n = if self.strip { 0 } else { f.opcodepc.len() };
        self.int(n);
        for &pc in f.opcodepc.iter().take(n) {
            self.block(&pc.to_le_bytes());
        }
        let n = if self.strip { 0 } else { f.locals.len() };
        self.int(n);
        for l in f.locals.iter().take(n) {
            self.string(Some(&l.name));
            self.int(l.start_pc as usize);
            self.int(l.end_pc as usize);
        }
        let n = if self.strip { 0 } else { f.upvals.len() };
        self.int(n);
        for uv in f.upvals.iter().take(n) {
            self.string(uv.name.as_ref());
        }
    }

    fn function(&mut self, f: &Proto) {
        self.byte(f.is_vararg as u8);
        self.int(f.defline as usize);
        self.int(f.deflastline as usize);
        self.int(f.arity as usize);
        self.int(f.maxstack as usize);
        self.code(f);
        self.constants(f);
        self.upvalues(f);
        self.int(f.p.len());
        for sub in &f.p {
            self.function(sub);
        }
        self.debug(f);
    }
}

// ---------------------------------------------------------------------------
// Undump
// ---------------------------------------------------------------------------

struct Undumper<'b, 's> {
    buf: &'b [u8],
    pos: usize,
    chunk: String,
    /// Ordinal-indexed table of already-loaded strings.
    saved: Vec<Rc<str>>,
    st: &'s mut State,
}

/// Reconstruct a prototype tree from `bytes` (which must start with the
/// signature). `name` is used for error messages only.
pub fn undump(st: &mut State, bytes: &[u8], name: &str) -> Res<Rc<Proto>> {
    let chunk = if let Some(stripped) = name.strip_prefix(&['@', '='][..]) {
        stripped.to_string()
    } else if name.as_bytes().first() == Some(&SIGNATURE[0]) {
        "binary string".to_string()
    } else {
        name.to_string()
    };
    let mut u = Undumper { buf: bytes, pos: 0, chunk, saved: Vec::new(), st };
    u.check_header()?;
    let nupvals = u.int()?;
    let mut f = Proto::default();
    u.function(&mut f)?;
    if nupvals != f.upvals.len() {
        return Err(u.error("corrupted chunk"));
    }
    Ok(Rc::new(f))
}

impl<'b, 's> Undumper<'b, 's> {
    fn error(&self, why: impl std::fmt::Display) -> SyntaxError {
        SyntaxError {
            chunk: self.chunk.clone(),
            line: 0,
            span: None,
            msg: format!("bad binary format ({})", why),
        }
    }

    fn byte(&mut self) -> Res<u8> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| self.error("truncated chunk"))?;
        self.pos += 1;
        Ok(b)
    }

    fn block(&mut self, n: usize) -> Res<&'b [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or_else(|| self.error("truncated chunk"))?;
        let b = &self.buf[self.pos..end];
        self.pos = end;
        Ok(b)
    }

    fn align(&mut self, align: usize) -> Res<()> {
        let rem = self.pos % align;
        if rem != 0 {
            self.block(align - rem)?; // padding bytes, content undefined
        }
        Ok(())
    }

    fn varint(&mut self, limit: u64) -> Res<u64> {
        let mut x: u64 = 0;
        let limit = limit >> 7;
        loop {
            let b = self.byte()?;
            if x > limit {
                return Err(self.error("integer overflow"));
            }
            x = (x << 7) | (b & 0x7f) as u64;
            if b & 0x80 == 0 {
                return Ok(x);
            }
        }
    }

    fn int(&mut self) -> Res<usize> {
        Ok(self.varint(i32::MAX as u64)? as usize)
    }

    fn integer(&mut self) -> Res<i64> {
        let cx = self.varint(u64::MAX)?;
        if cx & 1 != 0 {
            Ok(!(cx >> 1) as i64)
        } else {
            Ok((cx >> 1) as i64)
        }
    }

    fn number(&mut self) -> Res<f64> {
        let b = self.block(8)?;
        Ok(f64::from_le_bytes(b.try_into().unwrap()))
    }

    fn string(&mut self) -> Res<Option<Rc<str>>> {
        let size = self.varint(u64::MAX)? as usize;
        match size {
            0 => Ok(None),
            1 => {
                let idx = self.varint(u64::MAX)? as usize;
                let s = self
                    .saved
                    .get(idx)
                    .ok_or_else(|| self.error("invalid string index"))?;
                Ok(Some(s.clone()))
            }
            _ => {
                let size = size - 2;
                let bytes = self.block(size + 1)?; // includes the NUL
                let text = std::str::from_utf8(&bytes[..size])
                    .map_err(|_| self.error("corrupted chunk"))?;
                let rc: Rc<str> = if text.len() <= MAX_SHORT_LEN {
                    self.st.strings.intern(text).0
                } else {
                    Rc::from(text)
                };
                self.saved.push(rc.clone());
                Ok(Some(rc))
            }
        }
    }

    fn check_literal(&mut self, expect: &[u8], msg: &str) -> Res<()> {
        let got = self.block(expect.len())?;
        if got != expect {
            return Err(self.error(msg));
        }
        Ok(())
    }

    fn check_num<const N: usize>(&mut self, expect: [u8; N], what: &str) -> Res<()> {
        if self.byte()? as usize != N {
            return Err(self.error(format!("{} size mismatch", what)));
        }
        if self.block(N)? != expect {
            return Err(self.error(format!("{} format mismatch", what)));
        }
        Ok(())
    }

    fn check_header(&mut self) -> Res<()> {
        self.check_literal(SIGNATURE, "not a binary chunk")?;
        if self.byte()? != VERSION_BYTE {
            return Err(self.error("version mismatch"));
        }
        if self.byte()? != FORMAT_BYTE {
            return Err(self.error("format mismatch"));
        }
        self.check_literal(CHECK_DATA, "corrupted chunk")?;
        self.check_num(CHECK_I32.to_le_bytes(), "int")?;
        self.check_num([CHECK_OPCODE], "opcode")?;
        self.check_num(CHECK_INT.to_le_bytes(), "integer")?;
        self.check_num(CHECK_NUM.to_le_bytes(), "number")?;
        Ok(())
    }

    fn code(&mut self, f: &mut Proto) -> Res<()> {
        let n = self.int()?;
        self.align(std::mem::size_of::<u8>())?;
        f.code = self.block(n)?.to_vec();
        Ok(())
    }

    fn constants(&mut self, f: &mut Proto) -> Res<()> {
        let n = self.int()?;
        f.k.reserve(n);
        for _ in 0..n {
            let v = match self.byte()? {
                TAG_NIL => Value::Nil,
                TAG_FALSE => Value::Bool(false),
                TAG_TRUE => Value::Bool(true),
                TAG_INT => Value::Int(self.integer()?),
                TAG_FLT => Value::Float(self.number()?),
                TAG_SHRSTR | TAG_LNGSTR => {
                    let s = self
                        .string()?
                        .ok_or_else(|| self.error("bad format for constant string"))?;
                    Value::from_tstr(TStr(s))
                }
                _ => return Err(self.error("invalid constant")),
            };
            f.k.push(v);
        }
        Ok(())
    }

    fn upvalues(&mut self, f: &mut Proto) -> Res<()> {
        let n = self.int()?;
        f.upvals.reserve(n);
        for _ in 0..n {
            let idx = self.int()? as u32;
            let in_stack = self.byte()? != 0;
            let kind = VarKind::from_byte(self.byte()?)
                .ok_or_else(|| self.error("corrupted chunk"))?;
            f.upvals.push(UpvalInfo { idx, in_stack, kind, name: None });
        }
        Ok(())
    }

    fn debug(&mut self, f: &mut Proto) -> Res<()> {
        f.source = self.string()?;
        let n = self.int()?;
        if n > 0 {
            f.lineinfo = self.block(n)?.iter().map(|&b| b as i8).collect();
        }
        let n = self.int()?;
        if n > 0 {
            self.align(std::mem::size_of::<u32>())?;
            f.abslineinfo.reserve(n);
            for _ in 0..n {
                let pc = u32::from_le_bytes(self.block(4)?.try_into().unwrap());
                let line = u32::from_le_bytes(self.block(4)?.try_into().unwrap());
                f.abslineinfo.push(AbsLineInfo { pc, line });
            }
        }
        let n = self.int()?;
        f.opcodepc.reserve(n);
        for _ in 0..n {
            let pc = u32::from_le_bytes(self.block(4)?.try_into().unwrap());
            f.opcodepc.push(pc);
        }
        let n = self.int()?;
        f.locals.reserve(n);
        for _ in 0..n {
            let name = self
                .string()?
                .ok_or_else(|| self.error("corrupted chunk"))?;
            let start_pc = self.int()? as u32;
            let end_pc = self.int()? as u32;
            f.locals.push(LocalInfo { name, start_pc, end_pc });
        }
        let n = self.int()?;
        if n != 0 {
            if n != f.upvals.len() {
                return Err(self.error("corrupted chunk"));
            }
            for i in 0..n {
                f.upvals[i].name = self.string()?;
            }
        }
        Ok(())
    }

    fn function(&mut self, f: &mut Proto) -> Res<()> {
        f.is_vararg = self.byte()? != 0;
        f.defline = self.int()? as u32;
        f.deflastline = self.int()? as u32;
        f.arity = self.int()? as u32;
        f.maxstack = self.int()? as u32;
        self.code(f)?;
        self.constants(f)?;
        self.upvalues(f)?;
        let n = self.int()?;
        f.p.reserve(n);
        for _ in 0..n {
            let mut sub = Proto::default();
            self.function(&mut sub)?;
            f.p.push(Rc::new(sub));
        }
        self.debug(f)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint_bytes(x: u64) -> Vec<u8> {
        let mut d = Dumper {
            out: Vec::new(),
            strip: false,
            saved: HashMap::new(),
            nstr: 0,
        };
        d.varint(x);
        d.out
    }

    fn undump_varint(bytes: &[u8]) -> u64 {
        let mut st = State::new();
        let mut u = Undumper {
            buf: bytes,
            pos: 0,
            chunk: "t".into(),
            saved: Vec::new(),
            st: &mut st,
        };
        u.varint(u64::MAX).unwrap()
    }

    #[test]
    fn varint_encoding() {
        assert_eq!(varint_bytes(0), vec![0]);
        assert_eq!(varint_bytes(0x7f), vec![0x7f]);
        // Most significant group first, continuation bit on all but
        // the last byte.
        assert_eq!(varint_bytes(0x80), vec![0x81, 0x00]);
        assert_eq!(varint_bytes(0x3fff), vec![0xff, 0x7f]);
        for x in [0u64, 1, 127, 128, 300, 1 << 20, u64::MAX] {
            assert_eq!(undump_varint(&varint_bytes(x)), x);
        }
    }

    #[test]
    fn zigzag_integers() {
        let mut st = State::new();
        for x in [0i64, -1, 1, -2, 2, 1234, -1234, i64::MAX, i64::MIN] {
            let mut d = Dumper {
                out: Vec::new(),
                strip: false,
                saved: HashMap::new(),
                nstr: 0,
            };
            d.integer(x);
            let mut u = Undumper {
                buf: &d.out,
                pos: 0,
                chunk: "t".into(),
                saved: Vec::new(),
                st: &mut st,
            };
            assert_eq!(u.integer().unwrap(), x);
        }
        // Small negatives stay small.
        let mut d = Dumper {
            out: Vec::new(),
            strip: false,
            saved: HashMap::new(),
            nstr: 0,
        };
        d.integer(-1);
        assert_eq!(d.out, vec![1]);
    }

    #[test]
    fn string_reuse_emits_backreference() {
        let foo: Rc<str> = Rc::from("foo");
        let mut d = Dumper {
            out: Vec::new(),
            strip: false,
            saved: HashMap::new(),
            nstr: 0,
        };
        d.string(Some(&foo));
        let first = d.out.len();
        // size = 3 + 2, bytes, NUL
        assert_eq!(d.out, vec![5, b'f', b'o', b'o', 0]);
        d.string(Some(&foo));
        assert_eq!(&d.out[first..], &[1, 0]); // reuse ordinal 0
        d.string(None);
        assert_eq!(*d.out.last().unwrap(), 0);
    }

    #[test]
    fn truncated_chunk_errors() {
        let mut st = State::new();
        let err = undump(&mut st, &SIGNATURE[..4], "t").unwrap_err();
        assert!(err.msg.contains("truncated chunk"));
        let err = undump(&mut st, b"\x1bNotTokud", "t").unwrap_err();
        assert!(err.msg.contains("not a binary chunk"));
    }

    #[test]
    fn version_mismatch_errors() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(SIGNATURE);
        bytes.push(0xff);
        let mut st = State::new();
        let err = undump(&mut st, &bytes, "t").unwrap_err();
        assert!(err.msg.contains("version mismatch"));
        assert!(err.to_string().starts_with("t: bad binary format"));
    }
}
