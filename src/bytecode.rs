//! Bytecode instruction set — stack-based, variable-width.
//!
//! INSTRUCTION FORMATS:
//!
//!   I     | OP: 8 |                          — no operands
//!   IS    | OP: 8 | S: 8 |                   — one short operand
//!   ISS   | OP: 8 | S: 8 | S: 8 |
//!   IL    | OP: 8 |    L: 24    |            — one long operand (LE)
//!   ILS   | OP: 8 |    L: 24    | S: 8 |
//!   ILL   | OP: 8 |    L: 24    |    L: 24   |
//!   ILLS  | OP: 8 |    L: 24    |    L: 24   | S: 8 |
//!   ILLL  | OP: 8 |    L: 24    |    L: 24   |    L: 24 |
//!
//! Instruction size is determined entirely by the opcode. Immediate
//! operands are signed-magnitude: bit 7 (short) or bit 23 (long) holds
//! the sign, the remaining bits the magnitude.

use std::rc::Rc;

use crate::limits::*;
use crate::value::Value;

/// Operand legend for the doc comments below:
/// `V` stack value, `V{x}` stack slot, `K{x}` constant, `I(x)` immediate,
/// `U{x}` upvalue, `L{x}` local slot. Negative slots are relative to the
/// stack top.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    True = 0,    //              load true
    False,       //              load false
    Super,       // V            load V.class.superclass
    Nil,         // L            load L nils
    Pop,         // L            pop L values
    Load,        // L            push copy of V{L}
    Const,       // S            load K{S}
    ConstL,      // L            load K{L}
    ConstI,      // S            load integer I(S)
    ConstIL,     // L            load integer I(L)
    ConstF,      // S            load float constant K{S}
    ConstFL,     // L            load float constant K{L}
    VarargPrep,  // L            adjust varargs (L is function arity)
    Vararg,      // L            load L-1 varargs
    Closure,     // L            load closure over proto p[L]
    NewList,     // S            new list, size hint 1<<(S-1)
    NewClass,    // S            new class, size hint (S&0x7f), 0x80 = metatable
    NewTable,    // S            new table, size hint 1<<(S-1)
    Method,      // L V1 V2      define method V2 for class V1 under K{L}
    SetTm,       // S V1 V2      V1.metatable[tm S] = V2
    SetMt,       // L V1 V2      V1.metatable[K{L}] = V2
    MBin,        // V1 V2 S      metamethod fallback for binop event S
    AddK,        // V L          V + K{L}:number
    SubK,        // V L
    MulK,        // V L
    DivK,        // V L
    IDivK,       // V L
    ModK,        // V L
    PowK,        // V L
    BShlK,       // V L
    BShrK,       // V L
    BAndK,       // V L
    BOrK,        // V L
    BXorK,       // V L
    AddI,        // V L          V + I(L)
    SubI,        // V L
    MulI,        // V L
    DivI,        // V L
    IDivI,       // V L
    ModI,        // V L
    PowI,        // V L
    BShlI,       // V L
    BShrI,       // V L
    BAndI,       // V L
    BOrI,        // V L
    BXorI,       // V L
    Add,         // V1 V2 S      V1 + V2 (S: swap operands)
    Sub,         // V1 V2 S
    Mul,         // V1 V2 S
    Div,         // V1 V2 S
    IDiv,        // V1 V2 S
    Mod,         // V1 V2 S
    Pow,         // V1 V2 S
    BShl,        // V1 V2 S
    BShr,        // V1 V2 S
    BAnd,        // V1 V2 S
    BOr,         // V1 V2 S
    BXor,        // V1 V2 S
    Concat,      // L            concatenate top L values
    EqK,         // V L S        (V == K{L}) == S
    EqI,         // V L S        (V == I(L)) == S
    LtI,         // V L          V < I(L)
    LeI,         // V L
    GtI,         // V L
    GeI,         // V L
    Eq,          // V1 V2 S      (V1 == V2) == S
    Lt,          // V1 V2 S      V1 < V2 (S: swap operands)
    Le,          // V1 V2 S
    EqPreserve,  // V1 V2        V1 == V2, preserving V1
    Unm,         // V            -V
    BNot,        // V            ~V
    Not,         // V            !V
    Jmp,         // L            pc += L
    JmpS,        // L            pc -= L
    Test,        // V S          if truthy(V) == S: take following jump
    TestPop,     // V S          idem, popping V
    Call,        // L1 L2 S      call V{L1}, L2-1 results (0 = all)
    Close,       // L            close upvalues >= V{L}
    Tbc,         // L            mark L{L} as to-be-closed
    CheckAdj,    // L1 L2        adjust call-check results to L2-1
    GetLocal,    // L            push L{L}
    SetLocal,    // V L          L{L} = V
    GetUval,     // L            push U{L}
    SetUval,     // V L          U{L} = V
    SetList,     // L1 L2 S      V{L1}[L2+i] = V{-S+i} for 0 <= i < S
    SetProperty, // V L1 L2      V{-L1}.K{L2}:string = V
    GetProperty, // V L          V.K{L}
    GetIndex,    // V1 V2        V1[V2]
    SetIndex,    // V L          V{-L}[V{-L+1}] = V
    GetIndexStr, // V L          V[K{L}:string]
    SetIndexStr, // V L1 L2      V{-L1}[K{L2}:string] = V
    GetIndexInt, // V S          V[I(S)]
    GetIndexIntL, // V L         V[I(L)]
    SetIndexInt, // V L S        V{-L}[I(S)] = V
    SetIndexIntL, // V L1 L2     V{-L1}[I(L2)] = V
    GetSup,      // V L          V.class.superclass.methods[K{L}]
    GetSupIdx,   // V1 V2        V1.class.superclass.methods[V2]
    Inherit,     // V1 V2        class V1 inherits V2, popping V2
    ForPrep,     // L1 L2        prep numeric loop at V{L1}, empty -> pc += L2
    ForCall,     // L1 L2        push L2 iterator results at V{L1+4}
    ForLoop,     // L1 L2 L3     continue -> pc -= L2, else pop L3
    Return,      // L1 L2 S      return V{L1}..V{L1+L2-2} (S: close flag)
}

pub const NUM_OPCODES: usize = OpCode::Return as usize + 1;

impl OpCode {
    /// Decode an opcode byte. Discriminants are dense from 0, so a
    /// bounds check makes the transmute safe.
    #[inline]
    pub fn from_byte(b: u8) -> Option<OpCode> {
        if (b as usize) < NUM_OPCODES {
            Some(unsafe { std::mem::transmute::<u8, OpCode>(b) })
        } else {
            None
        }
    }

    pub fn name(self) -> &'static str {
        OP_NAMES[self as usize]
    }

    #[inline]
    pub fn props(self) -> &'static OpProps {
        &OP_PROPS[self as usize]
    }

    #[inline]
    pub fn format(self) -> OpFormat {
        self.props().format
    }

    /// Total instruction size in bytes, opcode included.
    #[inline]
    pub fn size(self) -> usize {
        FORMAT_SIZE[self.format() as usize]
    }
}

/// Operand layout of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpFormat {
    I = 0,
    IS,
    ISS,
    IL,
    ILS,
    ILL,
    ILLS,
    ILLL,
}

pub const NUM_FORMATS: usize = OpFormat::ILLL as usize + 1;

/// Instruction sizes per format, in bytes.
pub const FORMAT_SIZE: [usize; NUM_FORMATS] = [
    SIZE_INSTR,
    SIZE_INSTR + SIZE_ARG_S,
    SIZE_INSTR + SIZE_ARG_S * 2,
    SIZE_INSTR + SIZE_ARG_L,
    SIZE_INSTR + SIZE_ARG_L + SIZE_ARG_S,
    SIZE_INSTR + SIZE_ARG_L * 2,
    SIZE_INSTR + SIZE_ARG_L * 2 + SIZE_ARG_S,
    SIZE_INSTR + SIZE_ARG_L * 3,
];

/// Flag for a stack delta that depends on an operand.
pub const VAR_DELTA: i32 = i32::MAX;

/// Static properties of one opcode: its operand format, how many stack
/// values it pushes and pops, and whether it overwrites the value at
/// the resulting top of stack in place.
pub struct OpProps {
    pub format: OpFormat,
    pub push: i32,
    pub pop: i32,
    pub chgsp: bool,
}

const fn p(format: OpFormat, push: i32, pop: i32, chgsp: bool) -> OpProps {
    OpProps { format, push, pop, chgsp }
}

use OpFormat::*;

pub static OP_PROPS: [OpProps; NUM_OPCODES] = [
    p(I, 1, 0, false),          // True
    p(I, 1, 0, false),          // False
    p(I, 0, 0, true),           // Super
    p(IL, VAR_DELTA, 0, false), // Nil
    p(IL, VAR_DELTA, 0, false), // Pop
    p(IL, 1, 0, false),         // Load
    p(IS, 1, 0, false),         // Const
    p(IL, 1, 0, false),         // ConstL
    p(IS, 1, 0, false),         // ConstI
    p(IL, 1, 0, false),         // ConstIL
    p(IS, 1, 0, false),         // ConstF
    p(IL, 1, 0, false),         // ConstFL
    p(IL, VAR_DELTA, 0, false), // VarargPrep
    p(IL, VAR_DELTA, 0, false), // Vararg
    p(IL, 1, 0, false),         // Closure
    p(IS, 1, 0, false),         // NewList
    p(IS, 1, 0, false),         // NewClass
    p(IS, 1, 0, false),         // NewTable
    p(IL, 0, 2, false),         // Method
    p(IS, 0, 2, false),         // SetTm
    p(IL, 0, 2, false),         // SetMt
    p(IS, 0, 0, false),         // MBin
    p(IL, 0, 0, true),          // AddK
    p(IL, 0, 0, true),          // SubK
    p(IL, 0, 0, true),          // MulK
    p(IL, 0, 0, true),          // DivK
    p(IL, 0, 0, true),          // IDivK
    p(IL, 0, 0, true),          // ModK
    p(IL, 0, 0, true),          // PowK
    p(IL, 0, 0, true),          // BShlK
    p(IL, 0, 0, true),          // BShrK
    p(IL, 0, 0, true),          // BAndK
    p(IL, 0, 0, true),          // BOrK
    p(IL, 0, 0, true),          // BXorK
    p(IL, 0, 0, true),          // AddI
    p(IL, 0, 0, true),          // SubI
    p(IL, 0, 0, true),          // MulI
    p(IL, 0, 0, true),          // DivI
    p(IL, 0, 0, true),          // IDivI
    p(IL, 0, 0, true),          // ModI
    p(IL, 0, 0, true),          // PowI
    p(IL, 0, 0, true),          // BShlI
    p(IL, 0, 0, true),          // BShrI
    p(IL, 0, 0, true),          // BAndI
    p(IL, 0, 0, true),          // BOrI
    p(IL, 0, 0, true),          // BXorI
    p(IS, 0, 1, true),          // Add
    p(IS, 0, 1, true),          // Sub
    p(IS, 0, 1, true),          // Mul
    p(IS, 0, 1, true),          // Div
    p(IS, 0, 1, true),          // IDiv
    p(IS, 0, 1, true),          // Mod
    p(IS, 0, 1, true),          // Pow
    p(IS, 0, 1, true),          // BShl
    p(IS, 0, 1, true),          // BShr
    p(IS, 0, 1, true),          // BAnd
    p(IS, 0, 1, true),          // BOr
    p(IS, 0, 1, true),          // BXor
    p(IL, VAR_DELTA, 0, true),  // Concat
    p(ILS, 0, 0, true),         // EqK
    p(ILS, 0, 0, true),         // EqI
    p(IL, 0, 0, true),          // LtI
    p(IL, 0, 0, true),          // LeI
    p(IL, 0, 0, true),          // GtI
    p(IL, 0, 0, true),          // GeI
    p(IS, 0, 1, true),          // Eq
    p(IS, 0, 1, true),          // Lt
    p(IS, 0, 1, true),          // Le
    p(I, 0, 0, true),           // EqPreserve
    p(I, 0, 0, true),           // Unm
    p(I, 0, 0, true),           // BNot
    p(I, 0, 0, true),           // Not
    p(IL, 0, 0, false),         // Jmp
    p(IL, 0, 0, false),         // JmpS
    p(IS, 0, 0, false),         // Test
    p(IS, 0, 1, false),         // TestPop
    p(ILL, VAR_DELTA, 0, true), // Call
    p(IL, 0, 0, false),         // Close
    p(IL, 0, 0, false),         // Tbc
    p(ILL, VAR_DELTA, 0, false), // CheckAdj
    p(IL, 1, 0, false),         // GetLocal
    p(IL, 0, 1, false),         // SetLocal
    p(IL, 1, 0, false),         // GetUval
    p(IL, 0, 1, false),         // SetUval
    p(ILLS, VAR_DELTA, 0, false), // SetList
    p(ILL, 0, 1, false),        // SetProperty
    p(IL, 0, 0, true),          // GetProperty
    p(I, 0, 1, true),           // GetIndex
    p(IL, 0, 1, false),         // SetIndex
    p(IL, 0, 0, true),          // GetIndexStr
    p(ILL, 0, 1, false),        // SetIndexStr
    p(IS, 0, 0, true),          // GetIndexInt
    p(IL, 0, 0, true),          // GetIndexIntL
    p(ILS, 0, 1, false),        // SetIndexInt
    p(ILL, 0, 1, false),        // SetIndexIntL
    p(IL, 0, 0, true),          // GetSup
    p(I, 0, 1, true),           // GetSupIdx
    p(I, 0, 1, false),          // Inherit
    p(ILL, VAR_DELTA, 0, false), // ForPrep
    p(ILL, VAR_DELTA, 0, false), // ForCall
    p(ILLL, VAR_DELTA, 0, false), // ForLoop
    p(ILLS, 0, 0, false),       // Return
];

static OP_NAMES: [&str; NUM_OPCODES] = [
    "TRUE", "FALSE", "SUPER", "NIL", "POP", "LOAD", "CONST", "CONSTL",
    "CONSTI", "CONSTIL", "CONSTF", "CONSTFL", "VARARGPREP", "VARARG",
    "CLOSURE", "NEWLIST", "NEWCLASS", "NEWTABLE", "METHOD", "SETTM", "SETMT",
    "MBIN", "ADDK", "SUBK", "MULK", "DIVK", "IDIVK", "MODK", "POWK", "BSHLK",
    "BSHRK", "BANDK", "BORK", "BXORK", "ADDI", "SUBI", "MULI", "DIVI",
    "IDIVI", "MODI", "POWI", "BSHLI", "BSHRI", "BANDI", "BORI", "BXORI",
    "ADD", "SUB", "MUL", "DIV", "IDIV", "MOD", "POW", "BSHL", "BSHR", "BAND",
    "BOR", "BXOR", "CONCAT", "EQK", "EQI", "LTI", "LEI", "GTI", "GEI", "EQ",
    "LT", "LE", "EQPRESERVE", "UNM", "BNOT", "NOT", "JMP", "JMPS", "TEST",
    "TESTPOP", "CALL", "CLOSE", "TBC", "CHECKADJ", "GETLOCAL", "SETLOCAL",
    "GETUVAL", "SETUVAL", "SETLIST", "SETPROPERTY", "GETPROPERTY", "GETINDEX",
    "SETINDEX", "GETINDEXSTR", "SETINDEXSTR", "GETINDEXINT", "GETINDEXINTL",
    "SETINDEXINT", "SETINDEXINTL", "GETSUP", "GETSUPIDX", "INHERIT",
    "FORPREP", "FORCALL", "FORLOOP", "RETURN",
];

// ---------------------------------------------------------------------------
// Operand access
// ---------------------------------------------------------------------------

/// Read the short operand `byte_off` bytes past the opcode at `pc`.
#[inline]
pub fn get_arg_s(code: &[u8], pc: usize, byte_off: usize) -> u8 {
    code[pc + SIZE_INSTR + byte_off]
}

#[inline]
pub fn set_arg_s(code: &mut [u8], pc: usize, byte_off: usize, v: u8) {
    code[pc + SIZE_INSTR + byte_off] = v;
}

/// Read the `o`-th long operand (3 bytes, little-endian) at `pc`.
#[inline]
pub fn get_arg_l(code: &[u8], pc: usize, o: usize) -> u32 {
    let at = pc + SIZE_INSTR + o * SIZE_ARG_L;
    code[at] as u32 | (code[at + 1] as u32) << 8 | (code[at + 2] as u32) << 16
}

#[inline]
pub fn set_arg_l(code: &mut [u8], pc: usize, o: usize, v: u32) {
    debug_assert!(v <= MAX_ARG_L);
    let at = pc + SIZE_INSTR + o * SIZE_ARG_L;
    code[at] = v as u8;
    code[at + 1] = (v >> 8) as u8;
    code[at + 2] = (v >> 16) as u8;
}

/// Decode a short immediate operand: bit 7 is the sign, bits 0..6 the
/// magnitude.
#[inline]
pub fn decode_imm_s(operand: u8) -> i64 {
    if operand & 0x80 != 0 {
        -((operand & 0x7f) as i64)
    } else {
        operand as i64
    }
}

/// Decode a long immediate operand: bit 23 is the sign.
#[inline]
pub fn decode_imm_l(operand: u32) -> i64 {
    if operand & 0x80_0000 != 0 {
        -((operand & 0x7f_ffff) as i64)
    } else {
        operand as i64
    }
}

/// Iterate `(pc, opcode)` over an instruction stream.
pub fn iter_code(code: &[u8]) -> CodeIter<'_> {
    CodeIter { code, pc: 0 }
}

pub struct CodeIter<'a> {
    code: &'a [u8],
    pc: usize,
}

impl Iterator for CodeIter<'_> {
    type Item = (usize, OpCode);

    fn next(&mut self) -> Option<(usize, OpCode)> {
        if self.pc >= self.code.len() {
            return None;
        }
        let op = OpCode::from_byte(self.code[self.pc])?;
        let at = self.pc;
        self.pc += op.size();
        Some((at, op))
    }
}

/// Compute the stack pointer after executing the instruction at `pc`,
/// given the stack pointer before it. Resolves `VAR_DELTA` opcodes from
/// their operands; for the loop opcodes the fall-through path is used,
/// and `ForPrep` accounts for the control variable it materializes.
pub fn next_sp(code: &[u8], pc: usize, sp: i32) -> i32 {
    let op = OpCode::from_byte(code[pc]).expect("valid opcode");
    let props = op.props();
    if props.push != VAR_DELTA {
        return sp + props.push - props.pop;
    }
    match op {
        OpCode::Nil => sp + get_arg_l(code, pc, 0) as i32,
        OpCode::Pop => sp - get_arg_l(code, pc, 0) as i32,
        OpCode::VarargPrep => sp,
        OpCode::Vararg => {
            let n = get_arg_l(code, pc, 0) as i32;
            if n == 0 { sp } else { sp + n - 1 }
        }
        OpCode::Call => {
            let base = get_arg_l(code, pc, 0) as i32;
            let n = get_arg_l(code, pc, 1) as i32;
            if n == 0 { base } else { base + n - 1 }
        }
        OpCode::CheckAdj => {
            let base = get_arg_l(code, pc, 0) as i32;
            let n = get_arg_l(code, pc, 1) as i32;
            if n == 0 { sp } else { base + n - 1 }
        }
        OpCode::Concat => sp - get_arg_l(code, pc, 0) as i32 + 1,
        OpCode::SetList => get_arg_l(code, pc, 0) as i32 + 1,
        OpCode::ForPrep => sp + 1,
        OpCode::ForCall => sp + get_arg_l(code, pc, 1) as i32,
        OpCode::ForLoop => sp - get_arg_l(code, pc, 2) as i32,
        _ => unreachable!("opcode without variable delta"),
    }
}

// ---------------------------------------------------------------------------
// Function prototype
// ---------------------------------------------------------------------------

/// Kind of a local variable or captured upvalue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VarKind {
    Regular = 0,
    /// Immutable after its declaration.
    Final = 1,
    /// Close-handler fires on scope exit.
    Tbc = 2,
}

impl VarKind {
    pub fn from_byte(b: u8) -> Option<VarKind> {
        match b {
            0 => Some(VarKind::Regular),
            1 => Some(VarKind::Final),
            2 => Some(VarKind::Tbc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpvalInfo {
    /// Slot in the enclosing function's stack, or index of the
    /// enclosing function's upvalue.
    pub idx: u32,
    pub in_stack: bool,
    pub kind: VarKind,
    /// Debug only; absent in stripped chunks.
    pub name: Option<Rc<str>>,
}

/// Debug description of one local variable's live range.
#[derive(Debug, Clone)]
pub struct LocalInfo {
    pub name: Rc<str>,
    pub start_pc: u32,
    pub end_pc: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbsLineInfo {
    pub pc: u32,
    pub line: u32,
}

/// The static description of one compiled function: its instruction
/// stream, constants, nested prototypes and debug info. Immutable once
/// parsing completes (except for stripping).
#[derive(Debug, Clone, Default)]
pub struct Proto {
    pub code: Vec<u8>,
    pub k: Vec<Value>,
    pub p: Vec<Rc<Proto>>,
    pub upvals: Vec<UpvalInfo>,
    /// Debug only.
    pub locals: Vec<LocalInfo>,
    /// Per-byte signed line delta; `ABS_LINEINFO` marks entries carried
    /// by `abslineinfo` and operand filler bytes.
    pub lineinfo: Vec<i8>,
    /// Absolute entries, strictly sorted by pc.
    pub abslineinfo: Vec<AbsLineInfo>,
    /// pc of the first byte of every emitted instruction.
    pub opcodepc: Vec<u32>,
    pub source: Option<Rc<str>>,
    pub defline: u32,
    pub deflastline: u32,
    pub arity: u32,
    pub is_vararg: bool,
    pub maxstack: u32,
}

impl Proto {
    pub fn new(source: Option<Rc<str>>) -> Proto {
        Proto { source, ..Proto::default() }
    }

    /// Source line of the instruction starting at `pc`.
    pub fn line_at(&self, pc: usize) -> u32 {
        // Latest absolute entry at or before pc anchors the walk.
        let (mut base_pc, mut line) =
            match self.abslineinfo.binary_search_by(|e| (e.pc as usize).cmp(&pc)) {
                Ok(i) => return self.abslineinfo[i].line,
                Err(0) => (None, self.defline),
                Err(i) => {
                    let e = &self.abslineinfo[i - 1];
                    (Some(e.pc as usize), e.line)
                }
            };
        for &start in &self.opcodepc {
            let start = start as usize;
            if start > pc {
                break;
            }
            if let Some(bp) = base_pc {
                if start <= bp {
                    continue;
                }
            }
            let d = self.lineinfo[start];
            debug_assert!(d != ABS_LINEINFO);
            line = (line as i64 + d as i64) as u32;
            base_pc = Some(start);
        }
        line
    }

    /// Remove the debug information, as `dump(strip = true)` would.
    pub fn strip(&mut self) {
        self.source = None;
        self.lineinfo.clear();
        self.abslineinfo.clear();
        self.opcodepc.clear();
        self.locals.clear();
        for uv in &mut self.upvals {
            uv.name = None;
        }
    }

    /// Pretty-print a disassembly to stdout.
    pub fn disassemble(&self, name: &str) {
        println!(
            "=== {} ({} params{}, {} slots, {} constants) ===",
            name,
            self.arity,
            if self.is_vararg { "+" } else { "" },
            self.maxstack,
            self.k.len()
        );
        for (pc, op) in iter_code(&self.code) {
            let mut line = format!("  {:5}  [{:4}]  {:<13}", pc, self.line_at(pc), op.name());
            match op.format() {
                OpFormat::I => {}
                OpFormat::IS => {
                    line.push_str(&format!(" {}", get_arg_s(&self.code, pc, 0)));
                }
                OpFormat::ISS => {
                    line.push_str(&format!(
                        " {} {}",
                        get_arg_s(&self.code, pc, 0),
                        get_arg_s(&self.code, pc, 1)
                    ));
                }
                OpFormat::IL => {
                    line.push_str(&format!(" {}", get_arg_l(&self.code, pc, 0)));
                }
                OpFormat::ILS => {
                    line.push_str(&format!(
                        " {} {}",
                        get_arg_l(&self.code, pc, 0),
                        get_arg_s(&self.code, pc, SIZE_ARG_L)
                    ));
                }
                OpFormat::ILL => {
                    line.push_str(&format!(
                        " {} {}",
                        get_arg_l(&self.code, pc, 0),
                        get_arg_l(&self.code, pc, 1)
                    ));
                }
                OpFormat::ILLS => {
                    line.push_str(&format!(
                        " {} {} {}",
                        get_arg_l(&self.code, pc, 0),
                        get_arg_l(&self.code, pc, 1),
                        get_arg_s(&self.code, pc, 2 * SIZE_ARG_L)
                    ));
                }
                OpFormat::ILLL => {
                    line.push_str(&format!(
                        " {} {} {}",
                        get_arg_l(&self.code, pc, 0),
                        get_arg_l(&self.code, pc, 1),
                        get_arg_l(&self.code, pc, 2)
                    ));
                }
            }
            println!("{}", line);
        }
        for (i, sub) in self.p.iter().enumerate() {
            sub.disassemble(&format!("{}.p[{}]", name, i));
        }
    }
}
