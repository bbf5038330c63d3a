//! Expression descriptors and the bytecode emitter.
//!
//! The parser never builds a tree: every sub-expression lives in an
//! `ExpInfo` while its code is emitted on the fly. The emitter owns
//! constant-pool deduplication, operand-width selection (immediate /
//! short / long / constant), short-circuit jump lists with
//! back-patching, NIL/POP peephole merging, and line-info bookkeeping.

use std::collections::HashMap;
use std::rc::Rc;

use once_cell::sync::Lazy;

use crate::bytecode::*;
use crate::errors::SyntaxError;
use crate::lexer::Lexer;
use crate::limits::*;
use crate::value::{
    arith_raw, n2i, ArithOp, N2IMode, TStr, Value,
};

pub(crate) type Res<T> = Result<T, SyntaxError>;

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

/// Binary operators, ordered so that the arithmetic/bitwise prefix maps
/// one-to-one onto the `ADD..BXOR` opcode groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[repr(u8)]
pub(crate) enum BinOp {
    Add = 0,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Shl,
    Shr,
    BAnd,
    BOr,
    BXor,
    Concat,
    Ne,
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    /// Arithmetic and bitwise operators fold at compile time.
    pub fn foldable(self) -> bool {
        self <= BinOp::BXor
    }

    pub fn arith(self) -> ArithOp {
        debug_assert!(self.foldable());
        // Same order by construction.
        unsafe { std::mem::transmute::<u8, ArithOp>(self as u8) }
    }

    /// Map onto an opcode group anchored at `from` (e.g. `OP_ADDK`).
    fn opcode(self, base: BinOp, from: OpCode) -> OpCode {
        OpCode::from_byte(from as u8 + (self as u8 - base as u8)).unwrap()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnOp {
    Unm,
    BNot,
    Not,
}

/// Tag-method slots addressable by `SETTM`. The arithmetic prefix is
/// aligned with the `ADD..BXOR` opcode group so the `MBIN` event byte
/// is a plain offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tm {
    Add = 0,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Shl,
    Shr,
    BAnd,
    BOr,
    BXor,
    Concat,
    Unm,
    BNot,
    Eq,
    Lt,
    Le,
    Index,
    NewIndex,
    Call,
    Close,
    Tostring,
    Name,
    Init,
    Gc,
}

pub const TM_COUNT: usize = Tm::Gc as usize + 1;

static TM_NAMES: Lazy<HashMap<&'static str, Tm>> = Lazy::new(|| {
    HashMap::from([
        ("__add", Tm::Add),
        ("__sub", Tm::Sub),
        ("__mul", Tm::Mul),
        ("__div", Tm::Div),
        ("__idiv", Tm::IDiv),
        ("__mod", Tm::Mod),
        ("__pow", Tm::Pow),
        ("__shl", Tm::Shl),
        ("__shr", Tm::Shr),
        ("__band", Tm::BAnd),
        ("__bor", Tm::BOr),
        ("__bxor", Tm::BXor),
        ("__concat", Tm::Concat),
        ("__unm", Tm::Unm),
        ("__bnot", Tm::BNot),
        ("__eq", Tm::Eq),
        ("__lt", Tm::Lt),
        ("__le", Tm::Le),
        ("__index", Tm::Index),
        ("__newindex", Tm::NewIndex),
        ("__call", Tm::Call),
        ("__close", Tm::Close),
        ("__tostring", Tm::Tostring),
        ("__name", Tm::Name),
        ("__init", Tm::Init),
        ("__gc", Tm::Gc),
    ])
});

impl Tm {
    pub fn from_name(name: &str) -> Option<Tm> {
        TM_NAMES.get(name).copied()
    }
}

fn binop_event(op: OpCode) -> u32 {
    (op as u8 - OpCode::Add as u8) as u32 + Tm::Add as u32
}

// ---------------------------------------------------------------------------
// Expression descriptor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) enum ExpKind {
    /// No expression yet.
    Void,
    Nil,
    False,
    True,
    /// Unresolved literals.
    Str(TStr),
    Int(i64),
    Flt(f64),
    /// Resolved constant; payload indexes the pool.
    K(u32),
    /// Not-yet-emitted variable reads.
    Upval(u32),
    Local { vidx: u32, sidx: u32 },
    /// `super` with `self` already on the stack.
    Super,
    /// Pending `a[b]` with both operands on the stack.
    Indexed,
    /// Pending `a[k]` with a string-constant key.
    IndexStr(u32),
    /// Pending `a[i]` with an integer key that fits an immediate.
    IndexInt(i64),
    IndexSuper,
    IndexSuperStr(u32),
    /// Pending `a.k`.
    Dot(u32),
    DotSuper(u32),
    /// Open multi-return expressions; payload is the instruction pc.
    Call(usize),
    Vararg(usize),
    /// Materialized on the stack; payload is the producing pc.
    Fin(usize),
}

#[derive(Debug, Clone)]
pub(crate) struct ExpInfo {
    pub kind: ExpKind,
    /// Jump chain taken when the expression is true.
    pub t: Option<usize>,
    /// Jump chain taken when the expression is false.
    pub f: Option<usize>,
}

impl ExpInfo {
    pub fn new(kind: ExpKind) -> ExpInfo {
        ExpInfo { kind, t: None, f: None }
    }

    pub fn void() -> ExpInfo {
        ExpInfo::new(ExpKind::Void)
    }

    pub fn has_jumps(&self) -> bool {
        self.t != self.f
    }

    pub fn on_stack(&self) -> bool {
        matches!(self.kind, ExpKind::Fin(_))
    }

    pub fn is_multret(&self) -> bool {
        matches!(self.kind, ExpKind::Call(_) | ExpKind::Vararg(_))
    }

    /// Constants that are never falsy.
    pub fn is_always_true(&self) -> bool {
        matches!(
            self.kind,
            ExpKind::True | ExpKind::Str(_) | ExpKind::Int(_) | ExpKind::Flt(_) | ExpKind::K(_)
        )
    }

    fn as_numeral(&self) -> Option<Value> {
        match self.kind {
            ExpKind::Int(i) => Some(Value::Int(i)),
            ExpKind::Flt(n) => Some(Value::Float(n)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-function compile state
// ---------------------------------------------------------------------------

/// Key under which a constant is cached for reuse. Floats use a
/// perturbed key so integral-valued floats cannot collide with actual
/// integers; zero gets a reserved key of its own (the cache is
/// per-function, so it cannot collide with anything).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ConstKey {
    Nil,
    True,
    False,
    Int(i64),
    Str(Rc<str>),
    FloatBits(u64),
    Zero,
}

/// One lexical scope.
pub(crate) struct Scope {
    pub nactlocals: u32,
    /// True when a local of this scope is captured as an upvalue or is
    /// to-be-closed; exiting the scope must then emit CLOSE.
    pub has_close: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockKind {
    Loop,
    Switch,
}

/// Innermost-last chain of enclosing loops and switches; `break` and
/// `continue` resolve against it. The jump chains collect the pending
/// exits, patched when the construct ends.
pub(crate) struct BlockCtx {
    pub kind: BlockKind,
    /// Stack height a `break` jump lands with.
    pub sp: u32,
    /// Stack height a `continue` jump lands with (the loop tail may
    /// expect live iteration state above `sp`).
    pub cont_sp: u32,
    pub break_jl: Option<usize>,
    pub cont_jl: Option<usize>,
}

#[derive(Clone)]
pub(crate) struct ClassCtx {
    pub has_super: bool,
}

/// Active local variable.
#[derive(Debug)]
pub(crate) struct ActiveLocal {
    pub name: TStr,
    pub kind: VarKind,
    pub sidx: u32,
    /// Index of this variable in `proto.locals`.
    pub pidx: usize,
    pub captured: bool,
}

/// State of the function prototype currently being compiled.
pub(crate) struct FnState {
    pub p: Proto,
    pub kcache: HashMap<ConstKey, u32>,
    /// pc of the last emitted instruction.
    pub prevpc: usize,
    pub prevline: u32,
    /// First free compile-time stack slot.
    pub sp: u32,
    pub nactlocals: u32,
    /// Base of this function's window in `Compiler::actlocals`.
    pub firstlocal: usize,
    /// Latest pc that is a jump target; no merge may cross it.
    pub lasttarget: usize,
    /// Instructions issued since the last absolute line entry.
    pub iwthabs: u8,
    pub needclose: bool,
    pub nonilmerge: bool,
    /// Set while a `?` call-check awaits its result-count fixup.
    pub callcheck: bool,
    pub ismethod: bool,
    /// True when the last statement of the current block ended control
    /// flow (return); suppresses dead stack cleanup.
    pub last_was_return: bool,
    pub scopes: Vec<Scope>,
    pub blocks: Vec<BlockCtx>,
    pub classes: Vec<ClassCtx>,
}

impl FnState {
    pub fn new(source: Option<Rc<str>>, defline: u32, firstlocal: usize) -> FnState {
        let mut p = Proto::new(source);
        p.defline = defline;
        FnState {
            p,
            kcache: HashMap::new(),
            prevpc: 0,
            prevline: defline,
            sp: 0,
            nactlocals: 0,
            firstlocal,
            lasttarget: 0,
            iwthabs: 0,
            needclose: false,
            nonilmerge: false,
            callcheck: false,
            ismethod: false,
            last_was_return: false,
            scopes: Vec::new(),
            blocks: Vec::new(),
            classes: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

/// The compile session: lexer plus the stack of function states (one
/// per nested function, innermost last). Emitter methods live here;
/// the grammar is in `parser.rs`.
pub(crate) struct Compiler<'s> {
    pub lx: Lexer<'s>,
    pub fns: Vec<FnState>,
    /// All active locals of the session; each `FnState` owns the
    /// window starting at its `firstlocal`.
    pub actlocals: Vec<ActiveLocal>,
}

impl<'s> Compiler<'s> {
    pub fn new(lx: Lexer<'s>) -> Compiler<'s> {
        Compiler { lx, fns: Vec::new(), actlocals: Vec::new() }
    }

    #[inline]
    pub fn fs(&self) -> &FnState {
        self.fns.last().unwrap()
    }

    #[inline]
    pub fn fs_mut(&mut self) -> &mut FnState {
        self.fns.last_mut().unwrap()
    }

    /// Current pc (one past the last emitted byte).
    #[inline]
    pub fn pc(&self) -> usize {
        self.fs().p.code.len()
    }

    pub fn error(&self, msg: impl Into<String>) -> SyntaxError {
        self.lx.error_at(self.lx.t.line, msg)
    }

    pub fn check_limit(&self, n: usize, limit: usize, what: &str) -> Res<()> {
        if n > limit {
            Err(self.error(format!("too many {} (limit is {})", what, limit)))
        } else {
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Line info
    // -----------------------------------------------------------------------

    fn save_lineinfo(&mut self, line: u32) {
        let fs = self.fns.last_mut().unwrap();
        let pc = fs.prevpc;
        let op = OpCode::from_byte(fs.p.code[pc]).unwrap();
        let opsize = op.size();
        let linedif = line as i64 - fs.prevline as i64;
        let mut absolute = linedif.abs() >= LIM_LINE_DIFF as i64;
        if !absolute {
            // Post-increment compare: the entry that *reaches* the
            // limit is still relative, the next one goes absolute.
            absolute = fs.iwthabs >= MAX_IWTHABS;
            fs.iwthabs = fs.iwthabs.wrapping_add(1);
        }
        let entry = if absolute {
            fs.p.abslineinfo.push(AbsLineInfo { pc: pc as u32, line });
            fs.iwthabs = 1;
            ABS_LINEINFO
        } else {
            linedif as i8
        };
        if fs.p.lineinfo.len() < pc + opsize {
            fs.p.lineinfo.resize(pc + opsize, ABS_LINEINFO);
        }
        fs.p.lineinfo[pc] = entry;
        // Operand filler bytes carry the sentinel.
        for i in pc + 1..pc + opsize {
            fs.p.lineinfo[i] = ABS_LINEINFO;
        }
        fs.prevline = line;
    }

    /// Undo the line info of the last instruction. If it was absolute,
    /// force the replacing instruction to be absolute as well.
    fn remove_last_lineinfo(&mut self) {
        let fs = self.fns.last_mut().unwrap();
        let pc = fs.prevpc;
        let entry = fs.p.lineinfo[pc];
        if entry != ABS_LINEINFO {
            fs.prevline = (fs.prevline as i64 - entry as i64) as u32;
            fs.iwthabs -= 1;
        } else {
            debug_assert!(fs.p.abslineinfo.last().is_some_and(|a| a.pc as usize == pc));
            fs.p.abslineinfo.pop();
            fs.iwthabs = MAX_IWTHABS + 1;
        }
    }

    fn remove_inst_pc(&mut self) {
        let fs = self.fns.last_mut().unwrap();
        let pc = fs.p.opcodepc.pop().expect("instruction to remove") as usize;
        fs.p.code.truncate(pc);
        fs.p.lineinfo.truncate(pc);
        fs.prevpc = fs.p.opcodepc.last().map(|&x| x as usize).unwrap_or(pc);
    }

    fn remove_last_instruction(&mut self) {
        self.remove_last_lineinfo();
        self.remove_inst_pc();
    }

    pub fn remove_last_jump(&mut self) {
        debug_assert!(matches!(
            self.prev_op(),
            Some(OpCode::Jmp) | Some(OpCode::JmpS)
        ));
        self.remove_last_instruction();
    }

    /// Re-attribute the last instruction to `line`.
    pub fn fix_line(&mut self, line: u32) {
        self.remove_last_lineinfo();
        self.save_lineinfo(line);
    }

    // -----------------------------------------------------------------------
    // Raw emission
    // -----------------------------------------------------------------------

    pub fn prev_op(&self) -> Option<OpCode> {
        let fs = self.fs();
        if fs.p.code.is_empty() {
            None
        } else {
            OpCode::from_byte(fs.p.code[fs.prevpc])
        }
    }

    fn emit_s_arg(&mut self, arg: u32) {
        debug_assert!(arg <= MAX_ARG_S);
        self.fs_mut().p.code.push(arg as u8);
    }

    fn emit_l_arg(&mut self, arg: u32) {
        debug_assert!(arg <= MAX_ARG_L);
        let code = &mut self.fs_mut().p.code;
        code.push(arg as u8);
        code.push((arg >> 8) as u8);
        code.push((arg >> 16) as u8);
    }

    /// Emit an opcode, returning its pc.
    pub fn emit_i(&mut self, op: OpCode) -> Res<usize> {
        let pc = self.pc();
        if pc + op.size() > MAX_CODE {
            return Err(self.error("function or expression too complex"));
        }
        let line = self.lx.lastline;
        let fs = self.fns.last_mut().unwrap();
        debug_assert!(fs.prevpc <= pc);
        fs.p.opcodepc.push(pc as u32);
        fs.prevpc = pc;
        fs.p.code.push(op as u8);
        self.save_lineinfo(line);
        Ok(pc)
    }

    pub fn emit_is(&mut self, op: OpCode, a: u32) -> Res<usize> {
        let pc = self.emit_i(op)?;
        self.emit_s_arg(a);
        Ok(pc)
    }

    pub fn emit_il(&mut self, op: OpCode, a: u32) -> Res<usize> {
        let pc = self.emit_i(op)?;
        self.emit_l_arg(a);
        Ok(pc)
    }

    pub fn emit_ils(&mut self, op: OpCode, a: u32, b: u32) -> Res<usize> {
        let pc = self.emit_il(op, a)?;
        self.emit_s_arg(b);
        Ok(pc)
    }

    pub fn emit_ill(&mut self, op: OpCode, a: u32, b: u32) -> Res<usize> {
        let pc = self.emit_i(op)?;
        self.emit_l_arg(a);
        self.emit_l_arg(b);
        Ok(pc)
    }

    pub fn emit_ills(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> Res<usize> {
        let pc = self.emit_ill(op, a, b)?;
        self.emit_s_arg(c);
        Ok(pc)
    }

    pub fn emit_illl(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> Res<usize> {
        let pc = self.emit_i(op)?;
        self.emit_l_arg(a);
        self.emit_l_arg(b);
        self.emit_l_arg(c);
        Ok(pc)
    }

    // -----------------------------------------------------------------------
    // Compile-time stack
    // -----------------------------------------------------------------------

    pub fn free_slots(&mut self, n: u32) {
        let fs = self.fns.last_mut().unwrap();
        debug_assert!(fs.sp >= n);
        fs.sp -= n;
    }

    /// Raise `maxstack` so `n` more slots fit.
    pub fn check_stack(&mut self, n: u32) -> Res<()> {
        let fs = self.fs();
        let new = fs.sp + n;
        if fs.p.maxstack < new {
            if new as usize > MAX_CODE {
                return Err(self.error("function or expression too complex"));
            }
            self.fs_mut().p.maxstack = new;
        }
        Ok(())
    }

    pub fn reserve_slots(&mut self, n: u32) -> Res<()> {
        self.check_stack(n)?;
        self.fs_mut().sp += n;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Constant pool
    // -----------------------------------------------------------------------

    fn add_k(&mut self, v: Value) -> Res<u32> {
        if self.fs().p.k.len() >= MAX_ARG_L as usize {
            return Err(self.error("too many constants"));
        }
        let fs = self.fns.last_mut().unwrap();
        self.lx.st.gc_barrier(&fs.p, &v);
        fs.p.k.push(v);
        Ok((fs.p.k.len() - 1) as u32)
    }

    /// Look the key up in the cache, adding a fresh constant on a miss.
    /// Collisions are possible only for (perturbed) float keys; callers
    /// that use them must verify the returned slot.
    fn k2proto(&mut self, key: ConstKey, v: Value) -> Res<u32> {
        if let Some(&idx) = self.fs().kcache.get(&key) {
            return Ok(idx);
        }
        let idx = self.add_k(v)?;
        self.fs_mut().kcache.insert(key, idx);
        Ok(idx)
    }

    pub fn k_nil(&mut self) -> Res<u32> {
        // nil cannot be its own key; a reserved key stands in for it.
        self.k2proto(ConstKey::Nil, Value::Nil)
    }

    pub fn k_true(&mut self) -> Res<u32> {
        self.k2proto(ConstKey::True, Value::Bool(true))
    }

    pub fn k_false(&mut self) -> Res<u32> {
        self.k2proto(ConstKey::False, Value::Bool(false))
    }

    pub fn k_str(&mut self, s: &TStr) -> Res<u32> {
        self.k2proto(ConstKey::Str(s.0.clone()), Value::from_tstr(s.clone()))
    }

    pub fn k_int(&mut self, i: i64) -> Res<u32> {
        self.k2proto(ConstKey::Int(i), Value::Int(i))
    }

    /// Floats with integral values need a different key, to avoid
    /// collision with actual integers: the number is perturbed by its
    /// smallest still-significant power-of-two fraction (2^-52 for
    /// doubles). Not bulletproof — the perturbed key may itself be
    /// integral or collide — so the cached slot is verified and a
    /// duplicate entry appended on mismatch. A duplicate wastes a slot
    /// but is never semantically wrong.
    pub fn k_flt(&mut self, x: f64) -> Res<u32> {
        let v = Value::Float(x);
        if x == 0.0 {
            // Reserved key; cannot collide within this function.
            return self.k2proto(ConstKey::Zero, v);
        }
        let perturbed = x * (1.0 + f64::EPSILON);
        if n2i(x, N2IMode::Eq).is_none() {
            let idx = self.k2proto(ConstKey::FloatBits(perturbed.to_bits()), v.clone())?;
            if self.fs().p.k[idx as usize].raw_eq(&v) {
                return Ok(idx);
            }
        }
        // Key was integral after all, or it collided: append a
        // duplicate entry rather than reuse a wrong one.
        self.add_k(v)
    }

    // -----------------------------------------------------------------------
    // Immediates
    // -----------------------------------------------------------------------

    pub fn fits_imm(i: i64) -> bool {
        (MIN_IMM..=MAX_IMM).contains(&i)
    }

    pub fn fits_imm_l(i: i64) -> bool {
        (MIN_IMML..=MAX_IMML).contains(&i)
    }

    /// Signed-magnitude encode into a short operand.
    fn imm_s(i: i64) -> u32 {
        debug_assert!(Self::fits_imm(i));
        if i < 0 {
            i.unsigned_abs() as u32 | 0x80
        } else {
            i as u32
        }
    }

    /// Signed-magnitude encode into a long operand.
    fn imm_l(i: i64) -> u32 {
        debug_assert!(Self::fits_imm_l(i));
        if i < 0 {
            i.unsigned_abs() as u32 | 0x80_0000
        } else {
            i as u32
        }
    }

    fn encode_imm(i: i64) -> u32 {
        if i < 0 {
            if i >= MIN_IMM {
                Self::imm_s(i)
            } else {
                Self::imm_l(i)
            }
        } else {
            i as u32
        }
    }

    /// A numeral constant without jumps that fits a long immediate,
    /// already encoded.
    fn as_imm_operand(e: &ExpInfo) -> Option<u32> {
        let i = match e.kind {
            ExpKind::Int(i) => i,
            ExpKind::Flt(x) => n2i(x, N2IMode::Eq)?,
            _ => return None,
        };
        if !e.has_jumps() && Self::fits_imm_l(i) {
            Some(Self::imm_l(i))
        } else {
            None
        }
    }

    fn is_int_imm_l(e: &ExpInfo) -> Option<i64> {
        match e.kind {
            ExpKind::Int(i) if !e.has_jumps() && Self::fits_imm_l(i) => Some(i),
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Loads
    // -----------------------------------------------------------------------

    /// Load constant `idx`, picking the narrowest operand.
    fn code_k(&mut self, idx: u32) -> Res<usize> {
        if idx <= MAX_ARG_S {
            self.emit_is(OpCode::Const, idx)
        } else {
            self.emit_il(OpCode::ConstL, idx)
        }
    }

    /// Load an integer as immediate when it fits, as a constant
    /// otherwise.
    fn code_int(&mut self, i: i64) -> Res<usize> {
        if Self::fits_imm(i) {
            self.emit_is(OpCode::ConstI, Self::encode_imm(i))
        } else if Self::fits_imm_l(i) {
            self.emit_il(OpCode::ConstIL, Self::encode_imm(i))
        } else {
            let k = self.k_int(i)?;
            self.code_k(k)
        }
    }

    /// Load a float from the pool through the typed CONSTF variants,
    /// picking the narrowest index encoding.
    fn code_flt(&mut self, x: f64) -> Res<usize> {
        let k = self.k_flt(x)?;
        if k <= MAX_ARG_S {
            self.emit_is(OpCode::ConstF, k)
        } else {
            self.emit_il(OpCode::ConstFL, k)
        }
    }

    // -----------------------------------------------------------------------
    // NIL / POP merging
    // -----------------------------------------------------------------------

    fn can_merge(&self, op: OpCode) -> bool {
        let fs = self.fs();
        if fs.p.code.is_empty() || self.prev_op() != Some(op) || fs.lasttarget == self.pc() {
            return false;
        }
        op == OpCode::Pop || (op == OpCode::Nil && !fs.nonilmerge)
    }

    /// Merge consecutive NIL/POP instructions by summing their counts.
    fn adjust_stack_op(&mut self, op: OpCode, n: u32) -> Res<usize> {
        if self.can_merge(op) {
            let fs = self.fns.last_mut().unwrap();
            let prev = fs.prevpc;
            let new_n = get_arg_l(&fs.p.code, prev, 0) + n;
            set_arg_l(&mut fs.p.code, prev, 0, new_n);
            Ok(prev)
        } else {
            self.emit_il(op, n)
        }
    }

    fn code_nil(&mut self, n: u32) -> Res<usize> {
        self.adjust_stack_op(OpCode::Nil, n)
    }

    /// Push `n` nils.
    pub fn nil(&mut self, n: u32) -> Res<usize> {
        debug_assert!(n > 0);
        self.reserve_slots(n)?;
        self.code_nil(n)
    }

    /// Pop `n` values without touching the compile-time stack: used
    /// when the slots stay live on another control-flow path.
    pub fn remove_values(&mut self, n: u32) -> Res<()> {
        if n > 0 {
            self.adjust_stack_op(OpCode::Pop, n)?;
        }
        Ok(())
    }

    /// Pop `n` values and free their compile-time slots.
    pub fn pop(&mut self, n: u32) -> Res<()> {
        self.free_slots(n);
        self.remove_values(n)
    }

    /// Settle `extra` leftover slots: positive pops, negative fills
    /// with nils.
    pub fn adjust_stack(&mut self, extra: i32) -> Res<()> {
        if extra > 0 {
            self.pop(extra as u32)
        } else if extra < 0 {
            self.nil((-extra) as u32)?;
            Ok(())
        } else {
            Ok(())
        }
    }

    /// Push a copy of stack slot `slot`.
    pub fn load(&mut self, slot: u32) -> Res<()> {
        self.emit_il(OpCode::Load, slot)?;
        self.reserve_slots(1)
    }

    // -----------------------------------------------------------------------
    // Calls, varargs, returns
    // -----------------------------------------------------------------------

    /// Emit CALL; consumes the function and arguments above `base`.
    pub fn code_call(&mut self, base: u32, nreturns: i32) -> Res<usize> {
        debug_assert!(nreturns >= MULTRET);
        let above = self.fs().sp - base;
        self.free_slots(above);
        self.emit_ill(OpCode::Call, base, (nreturns + 1) as u32)
    }

    pub fn code_vararg(&mut self, nreturns: i32) -> Res<usize> {
        debug_assert!(nreturns >= MULTRET);
        self.emit_il(OpCode::Vararg, (nreturns + 1) as u32)
    }

    pub fn code_return(&mut self, first: u32, nreturns: i32) -> Res<usize> {
        let pc = self.emit_ill(OpCode::Return, first, (nreturns + 1) as u32)?;
        self.emit_s_arg(0); // close flag, set by the finish pass
        Ok(pc)
    }

    /// Finalize an open call/vararg so it produces `nreturns` values.
    fn set_returns_raw(&mut self, e: &mut ExpInfo, nreturns: i32) -> Res<()> {
        debug_assert!(nreturns >= MULTRET);
        let wire = (nreturns + 1) as u32;
        match e.kind {
            ExpKind::Call(pc) => {
                if self.fs().callcheck {
                    // The CHECKADJ trailing the call-check either
                    // learns the fixed count or disappears.
                    debug_assert_eq!(self.prev_op(), Some(OpCode::CheckAdj));
                    if wire != 0 {
                        let fs = self.fns.last_mut().unwrap();
                        let prev = fs.prevpc;
                        set_arg_l(&mut fs.p.code, prev, 1, wire);
                    } else {
                        self.remove_last_instruction();
                    }
                    self.fs_mut().callcheck = false;
                } else {
                    let fs = self.fns.last_mut().unwrap();
                    set_arg_l(&mut fs.p.code, pc, 1, wire);
                }
            }
            ExpKind::Vararg(pc) => {
                let fs = self.fns.last_mut().unwrap();
                set_arg_l(&mut fs.p.code, pc, 0, wire);
            }
            _ => unreachable!("expression is not an open call or vararg"),
        }
        debug_assert!(!self.fs().callcheck);
        e.kind = ExpKind::Fin(self.fs().prevpc);
        Ok(())
    }

    pub fn set_returns(&mut self, e: &mut ExpInfo, nreturns: u32) -> Res<()> {
        self.set_returns_raw(e, nreturns as i32)?;
        self.reserve_slots(nreturns)
    }

    pub fn set_multret(&mut self, e: &mut ExpInfo) -> Res<()> {
        self.set_returns_raw(e, MULTRET)
    }

    /// Compile the `?` call-check: if the call's first result is falsy,
    /// return all results out of the enclosing function; otherwise
    /// continue with the results adjusted by the trailing CHECKADJ.
    pub fn call_check(&mut self, base: u32, line: u32) -> Res<()> {
        self.fs_mut().callcheck = true;
        self.load(base)?;
        let jump = self.test(OpCode::TestPop, 1, line)?;
        self.code_return(base, MULTRET)?;
        self.emit_i(OpCode::True)?; // adjustment for symbolic execution
        self.patch_to_here(Some(jump))?;
        self.emit_ill(OpCode::CheckAdj, base, (MULTRET + 1) as u32)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Classes, lists, tables
    // -----------------------------------------------------------------------

    /// Define a method on the class copy below the closure on the
    /// stack.
    pub fn method_set(&mut self, name: &TStr) -> Res<()> {
        let k = self.k_str(name)?;
        self.emit_il(OpCode::Method, k)?;
        self.free_slots(2);
        Ok(())
    }

    /// Store a typed metamethod slot.
    pub fn tm_set(&mut self, tm: Tm, line: u32) -> Res<()> {
        debug_assert!((tm as usize) < TM_COUNT);
        self.emit_is(OpCode::SetTm, tm as u32)?;
        self.fix_line(line);
        self.free_slots(2);
        Ok(())
    }

    /// Store a string-keyed metatable field.
    pub fn mt_set(&mut self, field: &TStr, line: u32) -> Res<()> {
        let k = self.k_str(field)?;
        self.emit_il(OpCode::SetMt, k)?;
        self.fix_line(line);
        self.free_slots(2);
        Ok(())
    }

    /// Back-patch the NEWCLASS sizing hint once the body is known.
    pub fn class_adjust(&mut self, pc: usize, nmethods: u32, have_mt: bool) -> Res<()> {
        let fs = self.fns.last_mut().unwrap();
        if nmethods > 0 {
            // Avoid the edge case of 1 mapping to 0 bits.
            let mut nb = crate::value::ceil_log2(nmethods + (nmethods == 1) as u32) + 1;
            nb |= (have_mt as u32) * 0x80;
            set_arg_s(&mut fs.p.code, pc, 0, nb as u8);
        } else if have_mt {
            set_arg_s(&mut fs.p.code, pc, 0, 0x80);
        }
        Ok(())
    }

    /// Flush accumulated list items. `tostore == MULTRET` stores up to
    /// the stack top.
    pub fn set_list(&mut self, base: u32, nelems: u32, tostore: i32) -> Res<()> {
        debug_assert!(tostore != 0 && tostore <= LIST_FIELDS_PER_FLUSH as i32);
        let stored = if tostore == MULTRET { 0 } else { tostore as u32 };
        self.emit_ills(OpCode::SetList, base, nelems, stored)?;
        self.fs_mut().sp = base + 1;
        Ok(())
    }

    pub fn set_list_size(&mut self, pc: usize, total: u32) -> Res<()> {
        let hint = if total != 0 { crate::value::ceil_log2(total) + 1 } else { 0 };
        debug_assert!(hint <= MAX_ARG_S);
        let fs = self.fns.last_mut().unwrap();
        set_arg_s(&mut fs.p.code, pc, 0, hint as u8);
        Ok(())
    }

    pub fn set_table_size(&mut self, pc: usize, total: u32) -> Res<()> {
        self.set_list_size(pc, total)
    }

    // -----------------------------------------------------------------------
    // Variable access
    // -----------------------------------------------------------------------

    fn get_index_int(&mut self, i: i64) -> Res<usize> {
        if Self::fits_imm(i) {
            self.emit_is(OpCode::GetIndexInt, Self::encode_imm(i))
        } else {
            self.emit_il(OpCode::GetIndexIntL, Self::encode_imm(i))
        }
    }

    fn set_index_int(&mut self, i: i64, left: u32) -> Res<usize> {
        if Self::fits_imm(i) {
            self.emit_ils(OpCode::SetIndexInt, left, Self::encode_imm(i))
        } else {
            self.emit_ill(OpCode::SetIndexIntL, left, Self::encode_imm(i))
        }
    }

    /// Emit the store for an assignment target. `left` counts leftover
    /// stack slots between this target's auxiliary values and the value
    /// being stored. Returns how many auxiliary slots the target leaves
    /// behind for the caller to pop.
    pub fn store_var(&mut self, var: &mut ExpInfo, left: u32) -> Res<u32> {
        let extra;
        match var.kind.clone() {
            ExpKind::Upval(idx) => {
                self.emit_il(OpCode::SetUval, idx)?;
                extra = 0;
            }
            ExpKind::Local { sidx, .. } => {
                self.emit_il(OpCode::SetLocal, sidx)?;
                extra = 0;
            }
            ExpKind::Indexed => {
                self.emit_il(OpCode::SetIndex, left + 2)?;
                extra = 2;
            }
            ExpKind::IndexStr(k) => {
                self.emit_ill(OpCode::SetIndexStr, left + 1, k)?;
                extra = 1;
            }
            ExpKind::IndexInt(i) => {
                self.set_index_int(i, left + 1)?;
                extra = 1;
            }
            ExpKind::Dot(k) => {
                self.emit_ill(OpCode::SetProperty, left + 1, k)?;
                extra = 1;
            }
            ExpKind::Super
            | ExpKind::IndexSuper
            | ExpKind::IndexSuperStr(_)
            | ExpKind::DotSuper(_) => {
                return Err(self.error("cannot assign to 'super' or its property"));
            }
            _ => unreachable!("invalid store target"),
        }
        var.kind = ExpKind::Fin(self.fs().prevpc);
        self.free_slots(1); // the stored value
        Ok(extra)
    }

    /// Turn any variable variant into a stack value; constants are left
    /// alone. Returns true when the expression was handled.
    pub fn discharge_vars(&mut self, e: &mut ExpInfo) -> Res<bool> {
        let pc = match e.kind.clone() {
            ExpKind::Upval(idx) => self.emit_il(OpCode::GetUval, idx)?,
            ExpKind::Local { sidx, .. } => self.emit_il(OpCode::GetLocal, sidx)?,
            ExpKind::Indexed => {
                self.free_slots(2);
                self.emit_i(OpCode::GetIndex)?
            }
            ExpKind::IndexStr(k) => {
                self.free_slots(1);
                self.emit_il(OpCode::GetIndexStr, k)?
            }
            ExpKind::IndexInt(i) => {
                self.free_slots(1);
                self.get_index_int(i)?
            }
            ExpKind::IndexSuper => {
                self.free_slots(2);
                self.emit_i(OpCode::GetSupIdx)?
            }
            ExpKind::DotSuper(k) | ExpKind::IndexSuperStr(k) => {
                self.free_slots(1);
                self.emit_il(OpCode::GetSup, k)?
            }
            ExpKind::Dot(k) => {
                self.free_slots(1);
                self.emit_il(OpCode::GetProperty, k)?
            }
            ExpKind::Call(_) | ExpKind::Vararg(_) => {
                // One value by default.
                self.set_returns(e, 1)?;
                debug_assert!(e.on_stack());
                return Ok(true);
            }
            ExpKind::Super => {
                e.kind = ExpKind::Fin(self.fs().prevpc);
                return Ok(true);
            }
            _ => return Ok(false),
        };
        self.reserve_slots(1)?;
        e.kind = ExpKind::Fin(pc);
        Ok(true)
    }

    /// Put the expression's value on the stack top, ignoring any jump
    /// lists it still carries.
    fn discharge_to_stack(&mut self, e: &mut ExpInfo) -> Res<()> {
        if self.discharge_vars(e)? {
            return Ok(());
        }
        let pc = match e.kind.clone() {
            ExpKind::Nil => self.code_nil(1)?,
            ExpKind::False => self.emit_i(OpCode::False)?,
            ExpKind::True => self.emit_i(OpCode::True)?,
            ExpKind::Int(i) => self.code_int(i)?,
            ExpKind::Flt(x) => self.code_flt(x)?,
            ExpKind::Str(s) => {
                let k = self.k_str(&s)?;
                self.code_k(k)?
            }
            ExpKind::K(idx) => self.code_k(idx)?,
            _ => return Ok(()), // already finalized
        };
        self.reserve_slots(1)?;
        e.kind = ExpKind::Fin(pc);
        Ok(())
    }

    /// Make `e` reside on the stack top as a finalized expression. Any
    /// pending jump lists are patched to the final position.
    pub fn exp2stack(&mut self, e: &mut ExpInfo) -> Res<()> {
        self.discharge_to_stack(e)?;
        debug_assert!(!self.fs().callcheck);
        if e.has_jumps() {
            let here = self.pc();
            self.patch_jump_list(&mut e.f.take(), here)?;
            self.patch_jump_list(&mut e.t.take(), here)?;
            e.t = None;
            e.f = None;
        }
        debug_assert!(e.t.is_none() && e.f.is_none());
        debug_assert!(e.on_stack());
        Ok(())
    }

    /// Force either a stack value or a resolved state; never leaves the
    /// expression as a variable.
    pub fn exp2val(&mut self, e: &mut ExpInfo) -> Res<()> {
        if e.has_jumps() {
            self.exp2stack(e)
        } else {
            self.discharge_vars(e)?;
            Ok(())
        }
    }

    /// Move a constant expression into the pool, yielding `K(idx)`.
    fn exp2k(&mut self, e: &mut ExpInfo) -> Res<bool> {
        if e.has_jumps() {
            return Ok(false);
        }
        let idx = match e.kind.clone() {
            ExpKind::Nil => self.k_nil()?,
            ExpKind::False => self.k_false()?,
            ExpKind::True => self.k_true()?,
            ExpKind::Str(s) => self.k_str(&s)?,
            ExpKind::Int(i) => self.k_int(i)?,
            ExpKind::Flt(x) => self.k_flt(x)?,
            ExpKind::K(idx) => idx,
            _ => return Ok(false),
        };
        e.kind = ExpKind::K(idx);
        Ok(true)
    }

    /// Initialize a `.` access on a value already on the stack.
    pub fn get_dotted(&mut self, v: &mut ExpInfo, key: &TStr, is_super: bool) -> Res<()> {
        debug_assert!(v.on_stack());
        let k = self.k_str(key)?;
        v.kind = if is_super { ExpKind::DotSuper(k) } else { ExpKind::Dot(k) };
        Ok(())
    }

    /// Initialize a `[]` access on a value already on the stack,
    /// specializing string and small-integer keys.
    pub fn indexed(&mut self, var: &mut ExpInfo, key: &mut ExpInfo, is_super: bool) -> Res<()> {
        debug_assert!(var.on_stack() || matches!(var.kind, ExpKind::Super));
        self.exp2val(key)?;
        let str_k = if let ExpKind::Str(s) = key.kind.clone() {
            let k = self.k_str(&s)?;
            key.kind = ExpKind::K(k);
            Some(k)
        } else {
            None
        };
        if is_super {
            if let Some(k) = str_k {
                var.kind = ExpKind::IndexSuperStr(k);
            } else {
                self.exp2stack(key)?;
                var.kind = ExpKind::IndexSuper;
            }
        } else if let Some(i) = Self::is_int_imm_l(key) {
            var.kind = ExpKind::IndexInt(i);
        } else if let Some(k) = str_k {
            var.kind = ExpKind::IndexStr(k);
        } else {
            self.exp2stack(key)?;
            var.kind = ExpKind::Indexed;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Constant folding
    // -----------------------------------------------------------------------

    /// Folding must not raise: division by zero and bitwise operations
    /// on non-integral operands stay for the runtime to complain about.
    fn valid_fold_op(v1: &Value, v2: &Value, op: ArithOp) -> bool {
        match op {
            ArithOp::Shl | ArithOp::Shr | ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor
            | ArithOp::BNot => {
                crate::value::to_integer(v1).is_some() && crate::value::to_integer(v2).is_some()
            }
            ArithOp::Div | ArithOp::IDiv | ArithOp::Mod => match v2 {
                Value::Int(i) => *i != 0,
                Value::Float(n) => *n != 0.0,
                _ => false,
            },
            _ => true,
        }
    }

    /// Try to fold; on success `e1` holds the result. NaN and 0.0
    /// results are not folded, to sidestep -0.0 trouble.
    fn const_fold(&mut self, e1: &mut ExpInfo, e2: &ExpInfo, op: ArithOp) -> bool {
        let (v1, v2) = match (e1.as_numeral(), e2.as_numeral()) {
            (Some(v1), Some(v2)) => (v1, v2),
            _ => return false,
        };
        if !Self::valid_fold_op(&v1, &v2, op) {
            return false;
        }
        match arith_raw(&v1, &v2, op) {
            Some(Value::Int(i)) => {
                e1.kind = ExpKind::Int(i);
                true
            }
            Some(Value::Float(n)) => {
                if n == 0.0 || n.is_nan() {
                    return false;
                }
                e1.kind = ExpKind::Flt(n);
                true
            }
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Unary operators
    // -----------------------------------------------------------------------

    fn code_unary_op(&mut self, e: &mut ExpInfo, op: OpCode, line: u32) -> Res<()> {
        self.exp2stack(e)?;
        let pc = self.emit_i(op)?;
        e.kind = ExpKind::Fin(pc);
        self.fix_line(line);
        Ok(())
    }

    /// `!e`, folding constants and swapping the jump lists.
    fn code_not(&mut self, e: &mut ExpInfo) -> Res<()> {
        match e.kind {
            ExpKind::Nil | ExpKind::False => e.kind = ExpKind::True,
            ExpKind::True | ExpKind::Int(_) | ExpKind::Flt(_) | ExpKind::Str(_)
            | ExpKind::K(_) => e.kind = ExpKind::False,
            ExpKind::Fin(_) => {
                self.exp2stack(e)?;
                let pc = self.emit_i(OpCode::Not)?;
                e.kind = ExpKind::Fin(pc);
            }
            _ => unreachable!("variables are discharged before 'not'"),
        }
        std::mem::swap(&mut e.t, &mut e.f);
        Ok(())
    }

    pub fn unary(&mut self, e: &mut ExpInfo, op: UnOp, line: u32) -> Res<()> {
        self.discharge_vars(e)?;
        let zero = ExpInfo::new(ExpKind::Int(0));
        match op {
            UnOp::Unm => {
                if !self.const_fold(e, &zero, ArithOp::Unm) {
                    self.code_unary_op(e, OpCode::Unm, line)?;
                }
            }
            UnOp::BNot => {
                if !self.const_fold(e, &zero, ArithOp::BNot) {
                    self.code_unary_op(e, OpCode::BNot, line)?;
                }
            }
            UnOp::Not => self.code_not(e)?,
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Jumps
    // -----------------------------------------------------------------------

    fn jump_offset(code: &[u8], pc: usize) -> i64 {
        let op = OpCode::from_byte(code[pc]).unwrap();
        debug_assert!(matches!(op, OpCode::Jmp | OpCode::JmpS));
        let offset = get_arg_l(code, pc, 0) as i64;
        if op == OpCode::Jmp {
            offset
        } else {
            -offset
        }
    }

    fn destination_pc(code: &[u8], pc: usize) -> usize {
        let op = OpCode::from_byte(code[pc]).unwrap();
        (pc as i64 + op.size() as i64 + Self::jump_offset(code, pc)) as usize
    }

    /// Next entry of a jump list, threaded through the offset field.
    fn get_jump(&self, pc: usize) -> Option<usize> {
        let code = &self.fs().p.code;
        if get_arg_l(code, pc, 0) == 0 {
            None // zero offset ends the list
        } else {
            Some(Self::destination_pc(code, pc))
        }
    }

    /// Point the jump at `pc` to `target`.
    fn fix_jump(&mut self, pc: usize, target: usize) -> Res<()> {
        let fs = self.fns.last_mut().unwrap();
        let op = OpCode::from_byte(fs.p.code[pc]).unwrap();
        debug_assert!(matches!(op, OpCode::Jmp | OpCode::JmpS));
        let offset = (target as i64 - (pc + op.size()) as i64).unsigned_abs();
        if offset > MAX_JMP as u64 {
            return Err(self.error("control structure too long"));
        }
        let fs = self.fns.last_mut().unwrap();
        set_arg_l(&mut fs.p.code, pc, 0, offset as u32);
        if fs.lasttarget < target {
            fs.lasttarget = target;
        }
        Ok(())
    }

    /// Emit a zero-offset jump placeholder; its pc doubles as a jump
    /// list of one.
    pub fn jmp(&mut self, op: OpCode) -> Res<usize> {
        debug_assert!(matches!(op, OpCode::Jmp | OpCode::JmpS));
        self.emit_il(op, 0)
    }

    /// Emit a backward jump straight to `target`.
    pub fn jmp_back(&mut self, target: usize) -> Res<usize> {
        let pc = self.jmp(OpCode::JmpS)?;
        self.fix_jump(pc, target)?;
        Ok(pc)
    }

    /// Emit a test followed by its jump; returns the jump's pc. The
    /// jump is taken when the tested value's truthiness equals `cond`.
    pub fn test(&mut self, op: OpCode, cond: u32, line: u32) -> Res<usize> {
        debug_assert!(matches!(op, OpCode::Test | OpCode::TestPop));
        if op == OpCode::TestPop {
            self.free_slots(1);
        }
        self.emit_is(op, cond)?;
        self.fix_line(line);
        let jump = self.jmp(OpCode::Jmp)?;
        self.fix_line(line);
        Ok(jump)
    }

    /// Concatenate jump list `l2` onto `l1`.
    pub fn concat_jl(&mut self, l1: &mut Option<usize>, l2: Option<usize>) -> Res<()> {
        let l2 = match l2 {
            None => return Ok(()),
            Some(pc) => pc,
        };
        match *l1 {
            None => *l1 = Some(l2),
            Some(mut list) => {
                while let Some(next) = self.get_jump(list) {
                    list = next;
                }
                self.fix_jump(list, l2)?;
            }
        }
        Ok(())
    }

    /// Back-patch every jump in the chain starting at `pc` to `target`.
    pub fn patch(&mut self, pc: Option<usize>, target: usize) -> Res<()> {
        let mut cur = pc;
        while let Some(pc) = cur {
            cur = self.get_jump(pc);
            self.fix_jump(pc, target)?;
        }
        Ok(())
    }

    pub fn patch_to_here(&mut self, pc: Option<usize>) -> Res<()> {
        let here = self.pc();
        self.patch(pc, here)
    }

    fn patch_jump_list(&mut self, list: &mut Option<usize>, target: usize) -> Res<()> {
        if let Some(pc) = list.take() {
            if self.fs().lasttarget < target {
                self.fs_mut().lasttarget = target;
            }
            self.patch(Some(pc), target)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Short-circuit and / or
    // -----------------------------------------------------------------------

    /// Discharge the first operand and test it; on the fall-through
    /// path the operand is popped before the second operand runs.
    fn code_and_or(&mut self, e: &mut ExpInfo, cond: u32, line: u32) -> Res<usize> {
        self.discharge_to_stack(e)?;
        let test = self.test(OpCode::Test, cond, line)?;
        self.pop(1)?;
        Ok(test)
    }

    /// `e and ...`: jump out when `e` is false.
    fn code_and(&mut self, e: &mut ExpInfo, line: u32) -> Res<()> {
        let (pc, target) = if e.is_always_true() {
            (None, self.pc())
        } else {
            let test = self.code_and_or(e, 0, line)?;
            debug_assert_eq!(self.prev_op(), Some(OpCode::Pop));
            (Some(test), self.fs().prevpc)
        };
        let mut f = e.f.take();
        self.concat_jl(&mut f, pc)?;
        e.f = f;
        let mut t = e.t.take();
        self.patch_jump_list(&mut t, target)?;
        e.t = None;
        Ok(())
    }

    /// `e or ...`: jump out when `e` is true.
    fn code_or(&mut self, e: &mut ExpInfo, line: u32) -> Res<()> {
        let (pc, target) = if matches!(e.kind, ExpKind::Nil | ExpKind::False) {
            (None, self.pc())
        } else {
            let test = self.code_and_or(e, 1, line)?;
            debug_assert_eq!(self.prev_op(), Some(OpCode::Pop));
            (Some(test), self.fs().prevpc)
        };
        let mut t = e.t.take();
        self.concat_jl(&mut t, pc)?;
        e.t = t;
        let mut f = e.f.take();
        self.patch_jump_list(&mut f, target)?;
        e.f = None;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Binary operators
    // -----------------------------------------------------------------------

    /// Per-operator pre-pass, run after the first operand is parsed but
    /// before the second one is.
    pub fn prebinary(&mut self, e: &mut ExpInfo, op: BinOp, line: u32) -> Res<()> {
        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::IDiv | BinOp::Mod
            | BinOp::Pow | BinOp::Shl | BinOp::Shr | BinOp::BAnd | BinOp::BOr | BinOp::BXor
            | BinOp::Ne | BinOp::Eq => {
                // A numeral stays put: it may fold, become an immediate
                // operand, or select a constant-variant opcode.
                if e.as_numeral().is_none() {
                    self.exp2stack(e)?;
                }
            }
            BinOp::Gt | BinOp::Ge | BinOp::Lt | BinOp::Le => {
                if Self::as_imm_operand(e).is_none() {
                    self.exp2stack(e)?;
                }
            }
            BinOp::Concat => self.exp2stack(e)?,
            BinOp::And => self.code_and(e, line)?,
            BinOp::Or => self.code_or(e, line)?,
        }
        Ok(())
    }

    /// Generic stack-stack binary op, with the MBIN metamethod fallback
    /// trailing it.
    fn code_bin(
        &mut self,
        e1: &mut ExpInfo,
        e2: &mut ExpInfo,
        op: BinOp,
        commutative: bool,
        line: u32,
    ) -> Res<()> {
        let opcode = op.opcode(BinOp::Add, OpCode::Add);
        let swap = !commutative && !e1.on_stack() && e2.on_stack();
        self.exp2stack(e1)?;
        self.exp2stack(e2)?;
        self.free_slots(1); // e2
        let pc = self.emit_is(opcode, swap as u32)?;
        e1.kind = ExpKind::Fin(pc);
        self.fix_line(line);
        self.emit_is(OpCode::MBin, binop_event(opcode))?;
        self.fix_line(line);
        Ok(())
    }

    /// Variant with the second operand in the constant pool.
    fn code_bin_k(&mut self, e1: &mut ExpInfo, e2: &ExpInfo, op: BinOp, line: u32) -> Res<()> {
        let opcode = op.opcode(BinOp::Add, OpCode::AddK);
        let ik = match e2.kind {
            ExpKind::K(idx) => idx,
            _ => unreachable!("operand must be a pool constant"),
        };
        self.exp2stack(e1)?;
        let pc = self.emit_il(opcode, ik)?;
        e1.kind = ExpKind::Fin(pc);
        self.fix_line(line);
        Ok(())
    }

    /// Variant with the second operand as an in-range immediate.
    fn code_bin_i(&mut self, e1: &mut ExpInfo, e2: &ExpInfo, op: BinOp, line: u32) -> Res<()> {
        let imm = match e2.kind {
            ExpKind::Int(i) => i,
            _ => unreachable!("immediate operand must be an integer"),
        };
        let opcode = op.opcode(BinOp::Add, OpCode::AddI);
        self.exp2stack(e1)?;
        let pc = self.emit_il(opcode, Self::encode_imm(imm))?;
        e1.kind = ExpKind::Fin(pc);
        self.fix_line(line);
        Ok(())
    }

    fn code_bin_arith(
        &mut self,
        e1: &mut ExpInfo,
        e2: &mut ExpInfo,
        op: BinOp,
        flip: bool,
        commutative: bool,
        line: u32,
    ) -> Res<()> {
        if e2.as_numeral().is_some() && self.exp2k(e2)? {
            self.code_bin_k(e1, e2, op, line)
        } else {
            if flip {
                std::mem::swap(e1, e2);
            }
            self.code_bin(e1, e2, op, commutative, line)
        }
    }

    /// Try immediate, then constant, then the stack variant.
    fn code_bin_ik(
        &mut self,
        e1: &mut ExpInfo,
        e2: &mut ExpInfo,
        op: BinOp,
        flip: bool,
        commutative: bool,
        line: u32,
    ) -> Res<()> {
        if Self::is_int_imm_l(e2).is_some() {
            self.code_bin_i(e1, e2, op, line)
        } else {
            self.code_bin_arith(e1, e2, op, flip, commutative, line)
        }
    }

    fn code_commutative(
        &mut self,
        e1: &mut ExpInfo,
        e2: &mut ExpInfo,
        op: BinOp,
        line: u32,
    ) -> Res<()> {
        let mut flip = false;
        if e1.as_numeral().is_some() {
            std::mem::swap(e1, e2);
            flip = true;
        }
        self.code_bin_ik(e1, e2, op, flip, true, line)
    }

    /// Equality selects EQ / EQK / EQI, with a trailing byte holding
    /// the sense (`==` vs `!=`).
    fn code_eq(&mut self, e1: &mut ExpInfo, e2: &mut ExpInfo, op: BinOp) -> Res<()> {
        debug_assert!(matches!(op, BinOp::Eq | BinOp::Ne));
        let iseq = (op == BinOp::Eq) as u32;
        if !e1.on_stack() {
            debug_assert!(matches!(
                e1.kind,
                ExpKind::K(_) | ExpKind::Int(_) | ExpKind::Flt(_)
            ));
            std::mem::swap(e1, e2);
        }
        self.exp2stack(e1)?;
        let pc = if let Some(imm) = Self::as_imm_operand(e2) {
            self.emit_ils(OpCode::EqI, imm, iseq)?
        } else if self.exp2k(e2)? {
            let k = match e2.kind {
                ExpKind::K(idx) => idx,
                _ => unreachable!(),
            };
            self.emit_ils(OpCode::EqK, k, iseq)?
        } else {
            self.exp2stack(e2)?;
            let pc = self.emit_is(OpCode::Eq, iseq)?;
            self.free_slots(1); // e2
            pc
        };
        e1.kind = ExpKind::Fin(pc);
        Ok(())
    }

    /// Order comparisons; `>`/`>=` arrive already transformed into
    /// `<`/`<=` with `swapped` set.
    fn code_order(
        &mut self,
        e1: &mut ExpInfo,
        e2: &mut ExpInfo,
        op: BinOp,
        swapped: bool,
    ) -> Res<()> {
        debug_assert!(matches!(op, BinOp::Lt | BinOp::Le));
        let pc;
        if let Some(imm) = Self::as_imm_operand(e2) {
            self.exp2stack(e1)?;
            let opcode = op.opcode(BinOp::Lt, OpCode::LtI);
            pc = self.emit_il(opcode, imm)?;
        } else if let Some(imm) = Self::as_imm_operand(e1) {
            // (A < B) becomes (B > A), (A <= B) becomes (B >= A).
            self.exp2stack(e2)?;
            let opcode = op.opcode(BinOp::Lt, OpCode::GtI);
            pc = self.emit_il(opcode, imm)?;
        } else {
            let swap = if !swapped {
                !e1.on_stack() && e2.on_stack()
            } else if e2.on_stack() {
                true
            } else {
                false
            };
            self.exp2stack(e1)?;
            self.exp2stack(e2)?;
            let opcode = op.opcode(BinOp::Lt, OpCode::Lt);
            pc = self.emit_is(opcode, swap as u32)?;
            self.free_slots(1);
        }
        e1.kind = ExpKind::Fin(pc);
        Ok(())
    }

    /// A concat whose left neighbour is already a concat fuses into it
    /// by bumping its arity.
    fn code_concat(&mut self, e1: &mut ExpInfo, line: u32) -> Res<()> {
        if self.prev_op() == Some(OpCode::Concat) {
            let fs = self.fns.last_mut().unwrap();
            let prev = fs.prevpc;
            let n = get_arg_l(&fs.p.code, prev, 0);
            set_arg_l(&mut fs.p.code, prev, 0, n + 1);
        } else {
            let pc = self.emit_il(OpCode::Concat, 2)?;
            e1.kind = ExpKind::Fin(pc);
            self.fix_line(line);
        }
        self.free_slots(1);
        Ok(())
    }

    /// `a - I` codes as `a + (-I)` when the negation still fits.
    fn code_add_neg_imm(&mut self, e1: &mut ExpInfo, e2: &mut ExpInfo, line: u32) -> Res<bool> {
        match Self::is_int_imm_l(e2) {
            Some(i) if Self::fits_imm_l(-i) => {
                e2.kind = ExpKind::Int(-i);
                self.code_bin_i(e1, e2, BinOp::Add, line)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Finalize a binary operation after both operands are parsed.
    pub fn binary(
        &mut self,
        e1: &mut ExpInfo,
        e2: &mut ExpInfo,
        op: BinOp,
        line: u32,
    ) -> Res<()> {
        if op.foldable() && self.const_fold(e1, e2, op.arith()) {
            return Ok(()); // folded
        }
        match op {
            BinOp::Add | BinOp::Mul | BinOp::BAnd | BinOp::BOr | BinOp::BXor => {
                self.code_commutative(e1, e2, op, line)?;
            }
            BinOp::Sub => {
                if self.code_add_neg_imm(e1, e2, line)? {
                    return Ok(());
                }
                self.discharge_vars(e2)?;
                self.code_bin_ik(e1, e2, op, false, false, line)?;
            }
            BinOp::Shl | BinOp::Shr | BinOp::IDiv | BinOp::Div | BinOp::Mod | BinOp::Pow => {
                self.discharge_vars(e2)?;
                self.code_bin_ik(e1, e2, op, false, false, line)?;
            }
            BinOp::Concat => {
                self.exp2stack(e2)?;
                self.code_concat(e1, line)?;
            }
            BinOp::Ne | BinOp::Eq => self.code_eq(e1, e2, op)?,
            BinOp::Gt | BinOp::Ge => {
                self.discharge_vars(e1)?;
                self.discharge_vars(e2)?;
                std::mem::swap(e1, e2);
                let op = if op == BinOp::Gt { BinOp::Lt } else { BinOp::Le };
                self.code_order(e1, e2, op, true)?;
            }
            BinOp::Lt | BinOp::Le => self.code_order(e1, e2, op, false)?,
            BinOp::And => {
                debug_assert!(e1.t.is_none()); // closed by prebinary
                self.discharge_vars(e2)?;
                let mut f = e2.f.take();
                self.concat_jl(&mut f, e1.f.take())?;
                e2.f = f;
                *e1 = e2.clone();
            }
            BinOp::Or => {
                debug_assert!(e1.f.is_none()); // closed by prebinary
                self.discharge_vars(e2)?;
                let mut t = e2.t.take();
                self.concat_jl(&mut t, e1.t.take())?;
                e2.t = t;
                *e1 = e2.clone();
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Finalization pass
    // -----------------------------------------------------------------------

    /// Final target of a jump, following jump-to-jump chains with a
    /// bounded hop count.
    fn final_target(code: &[u8], mut pc: usize) -> usize {
        for _ in 0..100 {
            match OpCode::from_byte(code[pc]) {
                Some(OpCode::Jmp) | Some(OpCode::JmpS) => {
                    pc = Self::destination_pc(code, pc);
                }
                _ => break,
            }
        }
        pc
    }

    /// Final pass over the function: set RETURN close flags and rewrite
    /// jump chains to their ultimate target, flipping the direction
    /// opcode when the chain ends up behind the jump.
    pub fn finish(&mut self) -> Res<()> {
        let needclose = self.fs().needclose;
        let mut pc = 0;
        while pc < self.pc() {
            let op = OpCode::from_byte(self.fs().p.code[pc]).unwrap();
            match op {
                OpCode::Return => {
                    if needclose {
                        let fs = self.fns.last_mut().unwrap();
                        set_arg_s(&mut fs.p.code, pc, 2 * SIZE_ARG_L, 1);
                    }
                }
                OpCode::Jmp | OpCode::JmpS => {
                    let target = Self::final_target(&self.fs().p.code, pc);
                    let fs = self.fns.last_mut().unwrap();
                    if op == OpCode::Jmp && target < pc {
                        fs.p.code[pc] = OpCode::JmpS as u8;
                    } else if op == OpCode::JmpS && pc < target {
                        fs.p.code[pc] = OpCode::Jmp as u8;
                    }
                    self.fix_jump(pc, target)?;
                }
                _ => {}
            }
            pc += op.size();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;

    fn with_compiler<R>(f: impl FnOnce(&mut Compiler<'_>) -> R) -> R {
        let mut st = State::new();
        let lx = Lexer::new(&mut st, b"", "test");
        let mut c = Compiler::new(lx);
        c.fns.push(FnState::new(None, 0, 0));
        f(&mut c)
    }

    #[test]
    fn constants_deduplicate() {
        with_compiler(|c| {
            let s = c.lx.st.strings.intern("foo");
            let a = c.k_str(&s).unwrap();
            let b = c.k_str(&s).unwrap();
            assert_eq!(a, b);
            let i1 = c.k_int(10).unwrap();
            let i2 = c.k_int(10).unwrap();
            assert_eq!(i1, i2);
            assert_eq!(c.fs().p.k.len(), 2);
        });
    }

    #[test]
    fn integer_valued_float_never_reuses_integer_slot() {
        with_compiler(|c| {
            let ik = c.k_int(2).unwrap();
            let fk = c.k_flt(2.0).unwrap();
            assert_ne!(ik, fk);
            assert!(matches!(c.fs().p.k[ik as usize], Value::Int(2)));
            assert!(matches!(c.fs().p.k[fk as usize], Value::Float(n) if n == 2.0));
        });
    }

    #[test]
    fn non_integral_floats_reuse() {
        with_compiler(|c| {
            let a = c.k_flt(2.5).unwrap();
            let b = c.k_flt(2.5).unwrap();
            assert_eq!(a, b);
            // Zero gets its reserved key and still deduplicates.
            let z1 = c.k_flt(0.0).unwrap();
            let z2 = c.k_flt(0.0).unwrap();
            assert_eq!(z1, z2);
        });
    }

    #[test]
    fn nil_uses_reserved_key() {
        with_compiler(|c| {
            let a = c.k_nil().unwrap();
            let b = c.k_nil().unwrap();
            assert_eq!(a, b);
            assert!(matches!(c.fs().p.k[a as usize], Value::Nil));
        });
    }

    #[test]
    fn nil_merge_sums_counts() {
        with_compiler(|c| {
            c.nil(2).unwrap();
            c.nil(3).unwrap();
            let code = &c.fs().p.code;
            assert_eq!(code[0], OpCode::Nil as u8);
            assert_eq!(get_arg_l(code, 0, 0), 5);
            assert_eq!(code.len(), OpCode::Nil.size());
        });
    }

    #[test]
    fn nil_merge_respects_guard_flag() {
        with_compiler(|c| {
            c.nil(1).unwrap();
            c.fs_mut().nonilmerge = true;
            c.nil(1).unwrap();
            assert_eq!(
                crate::bytecode::iter_code(&c.fs().p.code).count(),
                2,
                "guarded NILs must stay separate"
            );
            // POP merging is unaffected by the guard.
            c.reserve_slots(2).unwrap();
            c.pop(1).unwrap();
            c.pop(1).unwrap();
            let pops: Vec<_> = crate::bytecode::iter_code(&c.fs().p.code)
                .filter(|(_, op)| *op == OpCode::Pop)
                .collect();
            assert_eq!(pops.len(), 1);
        });
    }

    #[test]
    fn nil_merge_stops_at_jump_target() {
        with_compiler(|c| {
            c.nil(1).unwrap();
            let j = c.jmp(OpCode::Jmp).unwrap();
            c.patch_to_here(Some(j)).unwrap();
            c.nil(1).unwrap();
            let nils: Vec<_> = crate::bytecode::iter_code(&c.fs().p.code)
                .filter(|(_, op)| *op == OpCode::Nil)
                .collect();
            assert_eq!(nils.len(), 2);
        });
    }

    #[test]
    fn immediate_boundaries() {
        with_compiler(|c| {
            // MAX_IMM fits the 8-bit form; one past it promotes.
            c.code_int(MAX_IMM).unwrap();
            assert_eq!(c.prev_op(), Some(OpCode::ConstI));
            c.code_int(MAX_IMM + 1).unwrap();
            assert_eq!(c.prev_op(), Some(OpCode::ConstIL));
            c.code_int(MIN_IMM).unwrap();
            assert_eq!(c.prev_op(), Some(OpCode::ConstI));
            c.code_int(MIN_IMM - 1).unwrap();
            assert_eq!(c.prev_op(), Some(OpCode::ConstIL));
            c.code_int(MAX_IMML + 1).unwrap();
            assert_eq!(c.prev_op(), Some(OpCode::Const));
        });
    }

    #[test]
    fn line_delta_promotion() {
        with_compiler(|c| {
            c.lx.lastline = 1;
            c.emit_i(OpCode::True).unwrap();
            // +127 stays relative.
            c.lx.lastline = 128;
            c.emit_i(OpCode::True).unwrap();
            assert_eq!(c.fs().p.abslineinfo.len(), 0);
            assert_eq!(c.fs().p.lineinfo[1], 127);
            // +128 promotes to absolute.
            c.lx.lastline = 256;
            c.emit_i(OpCode::True).unwrap();
            assert_eq!(c.fs().p.abslineinfo.len(), 1);
            assert_eq!(c.fs().p.lineinfo[2], crate::limits::ABS_LINEINFO);
            assert_eq!(c.fs().p.abslineinfo[0].line, 256);
        });
    }

    #[test]
    fn iwthabs_forces_absolute_entry() {
        with_compiler(|c| {
            c.lx.lastline = 1;
            for _ in 0..MAX_IWTHABS as usize {
                c.emit_i(OpCode::True).unwrap();
            }
            assert_eq!(c.fs().p.abslineinfo.len(), 0);
            c.emit_i(OpCode::True).unwrap();
            assert_eq!(c.fs().p.abslineinfo.len(), 1);
        });
    }

    #[test]
    fn folding_is_safe() {
        with_compiler(|c| {
            // 1 + 2.5 folds to a float.
            let mut e1 = ExpInfo::new(ExpKind::Int(1));
            let e2 = ExpInfo::new(ExpKind::Flt(2.5));
            assert!(c.const_fold(&mut e1, &e2, ArithOp::Add));
            assert!(matches!(e1.kind, ExpKind::Flt(n) if n == 3.5));
            // 1 // 0 must not fold.
            let mut e1 = ExpInfo::new(ExpKind::Int(1));
            let e2 = ExpInfo::new(ExpKind::Int(0));
            assert!(!c.const_fold(&mut e1, &e2, ArithOp::IDiv));
            // 0.0 results must not fold (-0.0 hazard).
            let mut e1 = ExpInfo::new(ExpKind::Flt(1.5));
            let e2 = ExpInfo::new(ExpKind::Flt(1.5));
            assert!(!c.const_fold(&mut e1, &e2, ArithOp::Sub));
        });
    }

    #[test]
    fn jump_chains_patch() {
        with_compiler(|c| {
            let j1 = c.jmp(OpCode::Jmp).unwrap();
            c.emit_i(OpCode::True).unwrap();
            let j2 = c.jmp(OpCode::Jmp).unwrap();
            let mut list = Some(j1);
            c.concat_jl(&mut list, Some(j2)).unwrap();
            c.emit_i(OpCode::False).unwrap();
            let target = c.pc();
            c.patch(list, target).unwrap();
            let code = &c.fs().p.code;
            assert_eq!(Compiler::destination_pc(code, j1), target);
            assert_eq!(Compiler::destination_pc(code, j2), target);
        });
    }
}
