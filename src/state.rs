//! Compile-session state and the host embedding surface.
//!
//! A `State` owns what the compiler shares with its runtime
//! collaborators: the string-interning pool and the garbage collector's
//! write-barrier hook. Sessions share nothing mutable with each other,
//! so independent states may compile in parallel. Execution, coroutines
//! and protected calls belong to the VM; this crate stops at compiled
//! `Proto` trees and their binary form.

use std::rc::Rc;

use crate::bytecode::{OpCode, Proto, UpvalInfo, VarKind};
use crate::errors::{Error, SyntaxError};
use crate::intern::Interner;
use crate::limits::ABS_LINEINFO;
use crate::marshal;
use crate::value::Value;

/// Hooks the garbage collector supplies to the compiler. The compiler
/// calls `barrier` whenever a proto gains a reference to a fresh child
/// object (constants, nested protos, debug names).
pub trait GcHooks {
    fn barrier(&mut self, parent: &Proto, child: &Value);
}

/// Default hooks for hosts without an incremental collector.
pub struct NullGc;

impl GcHooks for NullGc {
    fn barrier(&mut self, _parent: &Proto, _child: &Value) {}
}

/// Which chunk representations `load` accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    pub binary: bool,
    pub text: bool,
}

impl Mode {
    pub const ALL: Mode = Mode { binary: true, text: true };
    pub const BINARY: Mode = Mode { binary: true, text: false };
    pub const TEXT: Mode = Mode { binary: false, text: true };
}

/// A loaded chunk: a prototype ready for the VM to close over.
#[derive(Debug, Clone)]
pub struct Closure {
    pub p: Rc<Proto>,
}

pub struct State {
    pub(crate) strings: Interner,
    gc: Box<dyn GcHooks>,
}

impl Default for State {
    fn default() -> Self {
        State::new()
    }
}

impl State {
    pub fn new() -> State {
        State::with_gc(Box::new(NullGc))
    }

    pub fn with_gc(gc: Box<dyn GcHooks>) -> State {
        State { strings: Interner::new(), gc }
    }

    pub(crate) fn gc_barrier(&mut self, parent: &Proto, child: &Value) {
        self.gc.barrier(parent, child);
    }

    /// Load a chunk, dispatching on the signature byte between binary
    /// and text form. `mode` restricts which forms are allowed.
    pub fn load(&mut self, chunk: &[u8], name: &str, mode: Mode) -> Result<Closure, Error> {
        if chunk.first() == Some(&marshal::SIGNATURE[0]) {
            if !mode.binary {
                return Err(self.mode_error(name, "binary"));
            }
            let p = marshal::undump(self, chunk, name)?;
            Ok(Closure { p })
        } else {
            if !mode.text {
                return Err(self.mode_error(name, "text"));
            }
            let p = crate::parser::parse(self, chunk, name)?;
            Ok(Closure { p })
        }
    }

    pub fn load_str(&mut self, src: &str, name: &str) -> Result<Closure, Error> {
        self.load(src.as_bytes(), name, Mode::ALL)
    }

    fn mode_error(&self, name: &str, what: &str) -> Error {
        SyntaxError {
            chunk: name.to_string(),
            line: 0,
            span: None,
            msg: format!("attempt to load a {} chunk", what),
        }
        .into()
    }

    /// Serialize a compiled chunk; `strip` drops the debug info.
    pub fn dump(&self, f: &Proto, strip: bool) -> Vec<u8> {
        marshal::dump(f, strip)
    }

    /// Combine previously loaded chunks into one top-level function
    /// whose body runs each chunk in order.
    pub fn combine(&mut self, chunks: &[Closure], name: &str) -> Result<Closure, Error> {
        let mut p = Proto::new(Some(Rc::from(name)));
        p.upvals.push(UpvalInfo {
            idx: 0,
            in_stack: false,
            kind: VarKind::Regular,
            name: Some(Rc::from(crate::parser::ENV_NAME)),
        });
        p.maxstack = 1;
        let mut w = CodeWriter::default();
        for (i, chunk) in chunks.iter().enumerate() {
            p.p.push(chunk.p.clone());
            w.emit(OpCode::Closure, &[Arg::L(i as u32)]);
            w.emit(OpCode::Call, &[Arg::L(0), Arg::L(1)]); // no results
        }
        w.emit(OpCode::Return, &[Arg::L(0), Arg::L(1), Arg::S(0)]);
        p.code = w.code;
        p.lineinfo = w.lineinfo;
        p.opcodepc = w.opcodepc;
        Ok(Closure { p: Rc::new(p) })
    }
}

enum Arg {
    S(u8),
    L(u32),
}

/// Minimal straight-line code builder for synthesized functions.
#[derive(Default)]
struct CodeWriter {
    code: Vec<u8>,
    lineinfo: Vec<i8>,
    opcodepc: Vec<u32>,
}

impl CodeWriter {
    fn emit(&mut self, op: OpCode, args: &[Arg]) {
        let pc = self.code.len();
        self.opcodepc.push(pc as u32);
        self.code.push(op as u8);
        self.lineinfo.push(0);
        for a in args {
            match a {
                Arg::S(v) => {
                    self.code.push(*v);
                    self.lineinfo.push(ABS_LINEINFO);
                }
                Arg::L(v) => {
                    self.code.push(*v as u8);
                    self.code.push((v >> 8) as u8);
                    self.code.push((v >> 16) as u8);
                    for _ in 0..3 {
                        self.lineinfo.push(ABS_LINEINFO);
                    }
                }
            }
        }
        debug_assert_eq!(self.code.len() - pc, op.size());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_mode_rejects_binary() {
        let mut st = State::new();
        let c = st.load_str("return 1", "chunk").unwrap();
        let bytes = st.dump(&c.p, false);
        let err = st.load(&bytes, "chunk", Mode::TEXT).unwrap_err();
        assert!(err.to_string().contains("attempt to load a binary chunk"));
        let err = st.load(b"return 1", "chunk", Mode::BINARY).unwrap_err();
        assert!(err.to_string().contains("attempt to load a text chunk"));
    }

    #[test]
    fn combine_builds_a_runner() {
        let mut st = State::new();
        let a = st.load_str("local x = 1", "a").unwrap();
        let b = st.load_str("local y = 2", "b").unwrap();
        let all = st.combine(&[a, b], "combined").unwrap();
        assert_eq!(all.p.p.len(), 2);
        let ops: Vec<OpCode> = crate::bytecode::iter_code(&all.p.code)
            .map(|(_, op)| op)
            .collect();
        assert_eq!(
            ops,
            vec![
                OpCode::Closure,
                OpCode::Call,
                OpCode::Closure,
                OpCode::Call,
                OpCode::Return
            ]
        );
    }
}
