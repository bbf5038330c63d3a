//! Single-pass recursive-descent parser.
//!
//! There is no AST: statements and expressions are compiled as they are
//! read, through the emitter in `compiler.rs`. The parser maintains the
//! function-state stack, lexical scopes, active locals, upvalue capture
//! chains, loop/switch contexts for break/continue, and class contexts
//! for `self`/`super`.

use std::rc::Rc;

use crate::bytecode::{
    get_arg_l, set_arg_l, OpCode, Proto, UpvalInfo, VarKind,
};
use crate::compiler::{
    BinOp, BlockCtx, BlockKind, ClassCtx, Compiler, ExpInfo, ExpKind, FnState, Res, Scope, Tm,
    UnOp, ActiveLocal,
};
use crate::errors::SyntaxError;
use crate::lexer::{Lexer, Tok};
use crate::limits::*;
use crate::state::State;
use crate::value::{TStr, Value};

/// Name under which the environment upvalue is visible to the resolver.
pub const ENV_NAME: &str = "__ENV";

const HIDDEN_LOCAL: &str = "(for state)";

/// Unary operators bind tighter than any binary operator except `**`.
const UNARY_PRIORITY: u8 = 12;

pub(crate) fn parse(st: &mut State, src: &[u8], chunkname: &str) -> Result<Rc<Proto>, SyntaxError> {
    let lx = Lexer::new(st, src, chunkname);
    let mut c = Compiler::new(lx);
    c.main_chunk()
}

fn get_binop(tok: &Tok) -> Option<BinOp> {
    Some(match tok {
        Tok::Plus => BinOp::Add,
        Tok::Minus => BinOp::Sub,
        Tok::Star => BinOp::Mul,
        Tok::Slash => BinOp::Div,
        Tok::DblSlash => BinOp::IDiv,
        Tok::Percent => BinOp::Mod,
        Tok::DblStar => BinOp::Pow,
        Tok::Shl => BinOp::Shl,
        Tok::Shr => BinOp::Shr,
        Tok::Amp => BinOp::BAnd,
        Tok::Pipe => BinOp::BOr,
        Tok::Caret => BinOp::BXor,
        Tok::Concat => BinOp::Concat,
        Tok::EqEq => BinOp::Eq,
        Tok::NotEq => BinOp::Ne,
        Tok::Lt => BinOp::Lt,
        Tok::Le => BinOp::Le,
        Tok::Gt => BinOp::Gt,
        Tok::Ge => BinOp::Ge,
        Tok::And => BinOp::And,
        Tok::Or => BinOp::Or,
        _ => return None,
    })
}

fn get_unop(tok: &Tok) -> Option<UnOp> {
    match tok {
        Tok::Minus => Some(UnOp::Unm),
        Tok::Tilde => Some(UnOp::BNot),
        Tok::Bang | Tok::Not => Some(UnOp::Not),
        _ => None,
    }
}

impl<'s> Compiler<'s> {
    // -----------------------------------------------------------------------
    // Token plumbing
    // -----------------------------------------------------------------------

    fn check(&self, tok: &Tok) -> bool {
        self.lx.t.tok == *tok
    }

    fn accept(&mut self, tok: &Tok) -> Res<bool> {
        if self.check(tok) {
            self.lx.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, tok: Tok) -> Res<()> {
        if !self.accept(&tok)? {
            return Err(self.error(format!(
                "{} expected near {}",
                tok.describe(),
                self.lx.t.tok.describe()
            )));
        }
        Ok(())
    }

    /// Expect a closing token, reporting the opener's line when they
    /// are far apart.
    fn expect_close(&mut self, tok: Tok, open: Tok, open_line: u32) -> Res<()> {
        if self.accept(&tok)? {
            return Ok(());
        }
        if open_line == self.lx.t.line {
            self.expect(tok)
        } else {
            Err(self.error(format!(
                "{} expected (to close {} at line {}) near {}",
                tok.describe(),
                open.describe(),
                open_line,
                self.lx.t.tok.describe()
            )))
        }
    }

    fn check_name(&mut self) -> Res<TStr> {
        match self.lx.t.tok.clone() {
            Tok::Name(n) => {
                self.lx.next()?;
                Ok(n)
            }
            other => Err(self.error(format!("<name> expected near {}", other.describe()))),
        }
    }

    fn block_follows(&self) -> bool {
        matches!(
            self.lx.t.tok,
            Tok::Eof | Tok::RBrace | Tok::Case | Tok::Default
        )
    }

    // -----------------------------------------------------------------------
    // Chunks and functions
    // -----------------------------------------------------------------------

    pub fn main_chunk(&mut self) -> Res<Rc<Proto>> {
        let source: Rc<str> = self.lx.chunk.clone();
        let mut fs = FnState::new(Some(source), 0, self.actlocals.len());
        fs.p.is_vararg = true;
        let env: Rc<str> = Rc::from(ENV_NAME);
        fs.p.upvals.push(UpvalInfo {
            idx: 0,
            in_stack: false,
            kind: VarKind::Regular,
            name: Some(env),
        });
        self.fns.push(fs);
        self.enter_scope();
        self.lx.next()?; // prime the first token
        self.emit_il(OpCode::VarargPrep, 0)?;
        self.stmt_list()?;
        if !self.check(&Tok::Eof) {
            return Err(self.error(format!(
                "<eof> expected near {}",
                self.lx.t.tok.describe()
            )));
        }
        self.fs_mut().p.deflastline = self.lx.line;
        self.close_func()
    }

    /// Compile a function body starting at `(`. Leaves the resulting
    /// closure on the stack of the enclosing function.
    fn function_body(&mut self, is_method: bool, line: u32) -> Res<ExpInfo> {
        let source = self.fs().p.source.clone();
        // Methods inherit the class context so `super` keeps meaning.
        let class_ctx = if is_method {
            self.fs().classes.last().cloned()
        } else {
            None
        };
        let mut fs = FnState::new(source, line, self.actlocals.len());
        fs.ismethod = is_method;
        if let Some(ctx) = class_ctx {
            fs.classes.push(ctx);
        }
        self.fns.push(fs);
        self.enter_scope();
        if is_method {
            let name = self.lx.st.strings.intern("self");
            self.new_local(name, VarKind::Regular)?;
        }
        self.expect(Tok::LParen)?;
        let mut nparams: u32 = is_method as u32;
        let mut is_vararg = false;
        if !self.check(&Tok::RParen) {
            loop {
                if self.check(&Tok::Dots) {
                    self.lx.next()?;
                    is_vararg = true;
                    break;
                }
                let name = self.check_name()?;
                self.new_local(name, VarKind::Regular)?;
                nparams += 1;
                self.check_limit(nparams as usize, MAX_ARG_L as usize, "parameters")?;
                if !self.accept(&Tok::Comma)? {
                    break;
                }
            }
        }
        self.expect(Tok::RParen)?;
        self.fs_mut().p.arity = nparams;
        self.fs_mut().p.is_vararg = is_vararg;
        if is_vararg {
            self.emit_il(OpCode::VarargPrep, nparams)?;
        }
        self.reserve_slots(nparams)?;
        self.adjust_locals(nparams);
        self.block()?;
        self.fs_mut().p.deflastline = self.lx.lastline;
        let proto = self.close_func()?;
        let np = self.fs().p.p.len();
        self.check_limit(np + 1, MAX_ARG_L as usize, "nested functions")?;
        self.fs_mut().p.p.push(proto);
        let pc = self.emit_il(OpCode::Closure, np as u32)?;
        self.reserve_slots(1)?;
        Ok(ExpInfo::new(ExpKind::Fin(pc)))
    }

    fn close_func(&mut self) -> Res<Rc<Proto>> {
        let first = self.fs().sp;
        self.code_return(first, 0)?;
        self.fs_mut().last_was_return = true; // the cleanup below is dead code
        self.leave_scope()?;
        self.finish()?;
        let mut fs = self.fns.pop().unwrap();
        // Even a function that touches nothing gets one working slot.
        fs.p.maxstack = fs.p.maxstack.max(1);
        debug_assert_eq!(self.actlocals.len(), fs.firstlocal);
        Ok(Rc::new(fs.p))
    }

    // -----------------------------------------------------------------------
    // Scopes and locals
    // -----------------------------------------------------------------------

    fn enter_scope(&mut self) {
        let fs = self.fs_mut();
        let nactlocals = fs.nactlocals;
        fs.scopes.push(Scope { nactlocals, has_close: false });
    }

    fn leave_scope(&mut self) -> Res<()> {
        let scope = self.fs_mut().scopes.pop().unwrap();
        let n = self.fs().nactlocals - scope.nactlocals;
        let dead = self.fs().last_was_return;
        if scope.has_close && !dead {
            self.emit_il(OpCode::Close, scope.nactlocals)?;
        }
        self.remove_locals(n);
        if n > 0 {
            if dead {
                self.free_slots(n);
            } else {
                self.pop(n)?;
            }
        }
        Ok(())
    }

    /// Register a local; it stays invisible until `adjust_locals`.
    fn new_local(&mut self, name: TStr, kind: VarKind) -> Res<()> {
        let fs = self.fs();
        let in_fn = self.actlocals.len() - fs.firstlocal;
        self.check_limit(in_fn + 1, MAX_VARS, "local variables")?;
        let fs = self.fns.last_mut().unwrap();
        let pidx = fs.p.locals.len();
        let rc = name.0.clone();
        self.lx.st.gc_barrier(&fs.p, &Value::from_tstr(name.clone()));
        fs.p.locals.push(crate::bytecode::LocalInfo {
            name: rc,
            start_pc: 0,
            end_pc: 0,
        });
        self.actlocals.push(ActiveLocal { name, kind, sidx: 0, pidx, captured: false });
        Ok(())
    }

    /// Activate the last `n` registered locals; their values are
    /// already on the stack.
    fn adjust_locals(&mut self, n: u32) {
        if n == 0 {
            return;
        }
        let pc = self.pc() as u32;
        let fs = self.fns.last_mut().unwrap();
        let first_sidx = fs.sp - n;
        let base = self.actlocals.len() - n as usize;
        for i in 0..n as usize {
            let al = &mut self.actlocals[base + i];
            al.sidx = first_sidx + i as u32;
            fs.p.locals[al.pidx].start_pc = pc;
        }
        fs.nactlocals += n;
    }

    /// Deactivate the top `n` locals, closing their debug ranges.
    fn remove_locals(&mut self, n: u32) {
        let pc = self.pc() as u32;
        let fs = self.fns.last_mut().unwrap();
        fs.nactlocals -= n;
        for _ in 0..n {
            let al = self.actlocals.pop().unwrap();
            fs.p.locals[al.pidx].end_pc = pc;
        }
    }

    fn local_at(&self, fsi: usize, vidx: u32) -> &ActiveLocal {
        &self.actlocals[self.fns[fsi].firstlocal + vidx as usize]
    }

    // -----------------------------------------------------------------------
    // Variable resolution
    // -----------------------------------------------------------------------

    fn search_local(&self, fsi: usize, name: &TStr) -> Option<u32> {
        let fs = &self.fns[fsi];
        (0..fs.nactlocals)
            .rev()
            .find(|&v| self.local_at(fsi, v).name == *name)
    }

    fn search_upvalue(&self, fsi: usize, name: &str) -> Option<u32> {
        self.fns[fsi]
            .p
            .upvals
            .iter()
            .position(|uv| uv.name.as_deref() == Some(name))
            .map(|i| i as u32)
    }

    fn add_upvalue(
        &mut self,
        fsi: usize,
        name: &TStr,
        idx: u32,
        in_stack: bool,
        kind: VarKind,
    ) -> Res<u32> {
        let n = self.fns[fsi].p.upvals.len();
        self.check_limit(n + 1, MAX_ARG_L as usize, "upvalues")?;
        let fs = &mut self.fns[fsi];
        self.lx.st.gc_barrier(&fs.p, &Value::from_tstr(name.clone()));
        fs.p.upvals.push(UpvalInfo {
            idx,
            in_stack,
            kind,
            name: Some(name.0.clone()),
        });
        Ok(n as u32)
    }

    /// Resolve `name` at function level `fsi`, creating upvalue chains
    /// through enclosing functions as needed.
    fn resolve_var(&mut self, fsi: usize, name: &TStr) -> Res<Option<ExpKind>> {
        if let Some(vidx) = self.search_local(fsi, name) {
            let sidx = self.local_at(fsi, vidx).sidx;
            return Ok(Some(ExpKind::Local { vidx, sidx }));
        }
        if let Some(idx) = self.search_upvalue(fsi, name) {
            return Ok(Some(ExpKind::Upval(idx)));
        }
        if fsi == 0 {
            return Ok(None);
        }
        match self.resolve_var(fsi - 1, name)? {
            None => Ok(None),
            Some(ExpKind::Local { vidx, sidx }) => {
                // Capture: the enclosing scope must close the slot.
                let kind = {
                    let al = &mut self.actlocals[self.fns[fsi - 1].firstlocal + vidx as usize];
                    al.captured = true;
                    al.kind
                };
                self.mark_scope_close(fsi - 1, vidx);
                self.fns[fsi - 1].needclose = true;
                let uidx = self.add_upvalue(fsi, name, sidx, true, kind)?;
                Ok(Some(ExpKind::Upval(uidx)))
            }
            Some(ExpKind::Upval(pidx)) => {
                let kind = self.fns[fsi - 1].p.upvals[pidx as usize].kind;
                let uidx = self.add_upvalue(fsi, name, pidx, false, kind)?;
                Ok(Some(ExpKind::Upval(uidx)))
            }
            _ => unreachable!(),
        }
    }

    /// Flag the scope containing active local `vidx` of `fns[fsi]` so
    /// it emits CLOSE on exit.
    fn mark_scope_close(&mut self, fsi: usize, vidx: u32) {
        let fs = &mut self.fns[fsi];
        for scope in fs.scopes.iter_mut().rev() {
            if scope.nactlocals <= vidx {
                scope.has_close = true;
                return;
            }
        }
    }

    fn single_var(&mut self, name: TStr) -> Res<ExpInfo> {
        let top = self.fns.len() - 1;
        match self.resolve_var(top, &name)? {
            Some(kind) => Ok(ExpInfo::new(kind)),
            None => {
                // Free name: index the environment upvalue.
                let env = self.lx.st.strings.intern(ENV_NAME);
                let kind = self
                    .resolve_var(top, &env)?
                    .expect("environment upvalue always resolves");
                let mut e = ExpInfo::new(kind);
                self.exp2stack(&mut e)?;
                let k = self.k_str(&name)?;
                e.kind = ExpKind::IndexStr(k);
                Ok(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn expr(&mut self) -> Res<ExpInfo> {
        self.sub_expr(0)
    }

    fn sub_expr(&mut self, limit: u8) -> Res<ExpInfo> {
        let mut e;
        if let Some(uop) = get_unop(&self.lx.t.tok) {
            let line = self.lx.t.line;
            self.lx.next()?;
            e = self.sub_expr(UNARY_PRIORITY)?;
            self.unary(&mut e, uop, line)?;
        } else {
            e = self.simple_expr()?;
        }
        while let Some(op) = get_binop(&self.lx.t.tok) {
            let (left, right) = priority(op);
            if left <= limit {
                break;
            }
            let line = self.lx.t.line;
            self.lx.next()?;
            self.prebinary(&mut e, op, line)?;
            let mut e2 = self.sub_expr(right)?;
            self.binary(&mut e, &mut e2, op, line)?;
        }
        Ok(e)
    }

    fn simple_expr(&mut self) -> Res<ExpInfo> {
        let e = match self.lx.t.tok.clone() {
            Tok::Int(i) => {
                self.lx.next()?;
                ExpInfo::new(ExpKind::Int(i))
            }
            Tok::Flt(x) => {
                self.lx.next()?;
                ExpInfo::new(ExpKind::Flt(x))
            }
            Tok::Str(s) => {
                self.lx.next()?;
                ExpInfo::new(ExpKind::Str(s))
            }
            Tok::Nil => {
                self.lx.next()?;
                ExpInfo::new(ExpKind::Nil)
            }
            Tok::True => {
                self.lx.next()?;
                ExpInfo::new(ExpKind::True)
            }
            Tok::False => {
                self.lx.next()?;
                ExpInfo::new(ExpKind::False)
            }
            Tok::Dots => {
                if !self.fs().p.is_vararg {
                    return Err(
                        self.error("cannot use '...' outside a vararg function")
                    );
                }
                self.lx.next()?;
                let pc = self.code_vararg(MULTRET)?;
                ExpInfo::new(ExpKind::Vararg(pc))
            }
            Tok::LBrace => return self.table_cons(),
            Tok::LBracket => return self.list_cons(),
            Tok::Fn => {
                let line = self.lx.t.line;
                self.lx.next()?;
                return self.function_body(false, line);
            }
            Tok::Class => {
                self.lx.next()?;
                return self.class_body();
            }
            Tok::Import => return self.import_expr(),
            _ => return self.suffixed_expr(),
        };
        Ok(e)
    }

    fn primary_expr(&mut self) -> Res<ExpInfo> {
        match self.lx.t.tok.clone() {
            Tok::LParen => {
                let line = self.lx.t.line;
                self.lx.next()?;
                let mut e = self.expr()?;
                self.expect_close(Tok::RParen, Tok::LParen, line)?;
                // Parentheses truncate multiple returns to one value.
                self.discharge_vars(&mut e)?;
                Ok(e)
            }
            Tok::Name(n) => {
                self.lx.next()?;
                self.single_var(n)
            }
            Tok::SelfKw => {
                if !self.fs().ismethod {
                    return Err(self.error("cannot use 'self' outside a method"));
                }
                self.lx.next()?;
                let name = self.lx.st.strings.intern("self");
                self.single_var(name)
            }
            Tok::Super => self.super_expr(),
            other => Err(self.error(format!("unexpected symbol near {}", other.describe()))),
        }
    }

    fn super_expr(&mut self) -> Res<ExpInfo> {
        let fs = self.fs();
        if !fs.ismethod || fs.classes.is_empty() {
            return Err(self.error("cannot use 'super' outside a method"));
        }
        if !fs.classes.last().unwrap().has_super {
            return Err(self.error("cannot use 'super' in a class with no superclass"));
        }
        self.lx.next()?;
        let name = self.lx.st.strings.intern("self");
        let mut e = self.single_var(name)?;
        self.exp2stack(&mut e)?;
        e.kind = ExpKind::Super;
        match self.lx.t.tok.clone() {
            Tok::Dot | Tok::Colon => {
                self.lx.next()?;
                let key = self.check_name()?;
                let k = self.k_str(&key)?;
                e.kind = ExpKind::DotSuper(k);
            }
            Tok::LBracket => {
                self.lx.next()?;
                let mut key = self.expr()?;
                self.expect(Tok::RBracket)?;
                self.indexed(&mut e, &mut key, true)?;
            }
            _ => {
                // Bare `super` evaluates to the superclass itself.
                let pc = self.emit_i(OpCode::Super)?;
                e.kind = ExpKind::Fin(pc);
            }
        }
        Ok(e)
    }

    fn suffixed_expr(&mut self) -> Res<ExpInfo> {
        let mut e = self.primary_expr()?;
        loop {
            match self.lx.t.tok.clone() {
                Tok::Dot => {
                    self.lx.next()?;
                    let name = self.check_name()?;
                    self.exp2stack(&mut e)?;
                    self.get_dotted(&mut e, &name, false)?;
                }
                Tok::Colon => {
                    // `a:m(...)` resolves the bound method and calls it.
                    self.lx.next()?;
                    let name = self.check_name()?;
                    self.exp2stack(&mut e)?;
                    self.get_dotted(&mut e, &name, false)?;
                    if !self.check(&Tok::LParen) {
                        return Err(self.error("function arguments expected"));
                    }
                    self.call_expr(&mut e)?;
                }
                Tok::LBracket => {
                    self.exp2stack(&mut e)?;
                    self.lx.next()?;
                    let mut key = self.expr()?;
                    self.expect(Tok::RBracket)?;
                    self.indexed(&mut e, &mut key, false)?;
                }
                Tok::LParen => {
                    self.call_expr(&mut e)?;
                }
                Tok::Question => {
                    let line = self.lx.t.line;
                    match e.kind {
                        ExpKind::Call(pc) => {
                            self.lx.next()?;
                            let base = get_arg_l(&self.fs().p.code, pc, 0);
                            self.call_check(base, line)?;
                        }
                        _ => {
                            return Err(
                                self.error("'?' is only valid after a function call")
                            )
                        }
                    }
                }
                _ => break,
            }
        }
        Ok(e)
    }

    fn call_expr(&mut self, e: &mut ExpInfo) -> Res<()> {
        let line = self.lx.t.line;
        self.exp2stack(e)?;
        let base = self.fs().sp - 1;
        self.lx.next()?; // skip '('
        if !self.check(&Tok::RParen) {
            let (_, mut last) = self.explist()?;
            if last.is_multret() {
                self.set_multret(&mut last)?;
            } else {
                self.exp2stack(&mut last)?;
            }
        }
        self.expect_close(Tok::RParen, Tok::LParen, line)?;
        let pc = self.code_call(base, MULTRET)?;
        self.fix_line(line);
        *e = ExpInfo::new(ExpKind::Call(pc));
        Ok(())
    }

    /// `import "name"` calls the environment's import binding; the
    /// module may return multiple values.
    fn import_expr(&mut self) -> Res<ExpInfo> {
        let line = self.lx.t.line;
        self.lx.next()?;
        let name = self.lx.st.strings.intern("import");
        let mut f = self.single_var(name)?;
        self.exp2stack(&mut f)?;
        let base = self.fs().sp - 1;
        match self.lx.t.tok.clone() {
            Tok::Str(s) => {
                self.lx.next()?;
                let mut arg = ExpInfo::new(ExpKind::Str(s));
                self.exp2stack(&mut arg)?;
            }
            other => {
                return Err(self.error(format!(
                    "module name (string) expected near {}",
                    other.describe()
                )))
            }
        }
        let pc = self.code_call(base, MULTRET)?;
        self.fix_line(line);
        Ok(ExpInfo::new(ExpKind::Call(pc)))
    }

    fn explist(&mut self) -> Res<(u32, ExpInfo)> {
        let mut n = 1u32;
        let mut e = self.expr()?;
        while self.check(&Tok::Comma) {
            self.lx.next()?;
            self.exp2stack(&mut e)?;
            e = self.expr()?;
            n += 1;
        }
        Ok((n, e))
    }

    // -----------------------------------------------------------------------
    // Constructors
    // -----------------------------------------------------------------------

    fn list_cons(&mut self) -> Res<ExpInfo> {
        let line = self.lx.t.line;
        self.lx.next()?; // skip '['
        let pc = self.emit_is(OpCode::NewList, 0)?;
        self.reserve_slots(1)?;
        let base = self.fs().sp - 1;
        let mut stored = 0u32;
        let mut pending = 0u32;
        let mut total = 0u32;
        while !self.check(&Tok::RBracket) {
            let mut e = self.expr()?;
            total += 1;
            if self.accept(&Tok::Comma)? {
                self.exp2stack(&mut e)?;
                pending += 1;
                if pending as usize >= LIST_FIELDS_PER_FLUSH {
                    self.set_list(base, stored, pending as i32)?;
                    stored += pending;
                    pending = 0;
                }
            } else {
                // Last element: a call/vararg spreads all its values.
                if e.is_multret() {
                    self.set_multret(&mut e)?;
                    self.set_list(base, stored, MULTRET)?;
                    pending = 0;
                } else {
                    self.exp2stack(&mut e)?;
                    pending += 1;
                }
                break;
            }
        }
        if pending > 0 {
            self.set_list(base, stored, pending as i32)?;
        }
        self.expect_close(Tok::RBracket, Tok::LBracket, line)?;
        self.set_list_size(pc, total)?;
        Ok(ExpInfo::new(ExpKind::Fin(pc)))
    }

    fn table_cons(&mut self) -> Res<ExpInfo> {
        let line = self.lx.t.line;
        self.lx.next()?; // skip '{'
        let pc = self.emit_is(OpCode::NewTable, 0)?;
        self.reserve_slots(1)?;
        let mut n = 0u32;
        while !self.check(&Tok::RBrace) {
            match self.lx.t.tok.clone() {
                Tok::Name(key) => {
                    self.lx.next()?;
                    self.expect(Tok::Assign)?;
                    let k = self.k_str(&key)?;
                    let mut v = self.expr()?;
                    self.exp2stack(&mut v)?;
                    self.emit_ill(OpCode::SetIndexStr, 1, k)?;
                    self.free_slots(1);
                }
                Tok::LBracket => {
                    self.lx.next()?;
                    let mut key = self.expr()?;
                    self.expect(Tok::RBracket)?;
                    self.expect(Tok::Assign)?;
                    let mut var = ExpInfo::new(ExpKind::Fin(pc));
                    self.indexed(&mut var, &mut key, false)?;
                    let mut v = self.expr()?;
                    self.exp2stack(&mut v)?;
                    let extra = self.store_var(&mut var, 0)?;
                    if extra > 1 {
                        // The table stays; only the key is leftover.
                        self.pop(extra - 1)?;
                    }
                }
                other => {
                    return Err(self.error(format!(
                        "table key expected near {}",
                        other.describe()
                    )))
                }
            }
            n += 1;
            if !self.accept(&Tok::Comma)? && !self.accept(&Tok::Semi)? {
                break;
            }
        }
        self.expect_close(Tok::RBrace, Tok::LBrace, line)?;
        self.set_table_size(pc, n)?;
        Ok(ExpInfo::new(ExpKind::Fin(pc)))
    }

    /// Class body, entered right after the `class` keyword (and name,
    /// for declarations): `[inherits expr] { members }`.
    fn class_body(&mut self) -> Res<ExpInfo> {
        let pc_class = self.emit_is(OpCode::NewClass, 0)?;
        self.reserve_slots(1)?;
        let mut has_super = false;
        if self.accept(&Tok::Inherits)? {
            let mut sup = self.expr()?;
            self.exp2stack(&mut sup)?;
            self.emit_i(OpCode::Inherit)?;
            self.free_slots(1);
            has_super = true;
        }
        self.fs_mut().classes.push(ClassCtx { has_super });
        let line = self.lx.t.line;
        self.expect(Tok::LBrace)?;
        let mut nmethods = 0u32;
        let mut have_mt = false;
        while !self.check(&Tok::RBrace) && !self.check(&Tok::Eof) {
            if self.accept(&Tok::Semi)? {
                continue;
            }
            let mline = self.lx.t.line;
            let name = self.check_name()?;
            let class_slot = self.fs().sp - 1;
            self.load(class_slot)?;
            // The parent class context rides along into the method.
            let _body = self.function_body(true, mline)?;
            if let Some(tm) = Tm::from_name(&name) {
                self.tm_set(tm, mline)?;
                have_mt = true;
            } else if name.starts_with("__") {
                self.mt_set(&name, mline)?;
                have_mt = true;
            } else {
                self.method_set(&name)?;
                nmethods += 1;
            }
        }
        self.expect_close(Tok::RBrace, Tok::LBrace, line)?;
        self.fs_mut().classes.pop();
        self.class_adjust(pc_class, nmethods, have_mt)?;
        Ok(ExpInfo::new(ExpKind::Fin(pc_class)))
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn stmt_list(&mut self) -> Res<()> {
        while !self.block_follows() {
            if self.check(&Tok::Return) {
                // `return` ends the block.
                self.return_stmt()?;
                break;
            }
            self.statement()?;
        }
        Ok(())
    }

    fn statement(&mut self) -> Res<()> {
        self.fs_mut().last_was_return = false;
        match self.lx.t.tok.clone() {
            Tok::Semi => self.lx.next(),
            Tok::If => self.if_stmt(),
            Tok::While => self.while_stmt(),
            Tok::Do => self.do_while_stmt(),
            Tok::Loop => self.loop_stmt(),
            Tok::For => self.for_stmt(),
            Tok::Switch => self.switch_stmt(),
            Tok::Break => self.break_stmt(),
            Tok::Continue => self.continue_stmt(),
            Tok::Local => self.local_stmt(),
            Tok::Final => self.final_stmt(),
            Tok::Fn => {
                if matches!(self.lx.peek()?, Tok::Name(_)) {
                    self.fn_stmt()
                } else {
                    self.expr_stmt()
                }
            }
            Tok::Class => {
                if matches!(self.lx.peek()?, Tok::Name(_)) {
                    self.class_stmt()
                } else {
                    self.expr_stmt()
                }
            }
            Tok::LBrace => {
                self.enter_scope();
                self.block()?;
                self.leave_scope()?;
                self.fs_mut().last_was_return = false;
                Ok(())
            }
            _ => self.expr_stmt(),
        }
    }

    fn block(&mut self) -> Res<()> {
        let line = self.lx.t.line;
        self.expect(Tok::LBrace)?;
        self.stmt_list()?;
        self.expect_close(Tok::RBrace, Tok::LBrace, line)
    }

    fn scoped_block(&mut self) -> Res<()> {
        self.enter_scope();
        self.block()?;
        self.leave_scope()
    }

    // -----------------------------------------------------------------------
    // Declarations
    // -----------------------------------------------------------------------

    fn local_stmt(&mut self) -> Res<()> {
        self.lx.next()?;
        let mut nvars = 0u32;
        let mut tbc = false;
        loop {
            let name = self.check_name()?;
            let mut kind = VarKind::Regular;
            if self.accept(&Tok::Lt)? {
                let attr = self.check_name()?;
                kind = match attr.as_str() {
                    "tbc" => VarKind::Tbc,
                    "final" => VarKind::Final,
                    other => {
                        return Err(self.error(format!("unknown attribute '{}'", other)))
                    }
                };
                self.expect(Tok::Gt)?;
            }
            if kind == VarKind::Tbc {
                if tbc {
                    return Err(self.error(
                        "multiple to-be-closed variables in a local declaration",
                    ));
                }
                tbc = true;
            }
            self.new_local(name, kind)?;
            nvars += 1;
            if !self.accept(&Tok::Comma)? {
                break;
            }
        }
        let (nexps, mut last) = if self.accept(&Tok::Assign)? {
            self.explist()?
        } else {
            (0, ExpInfo::void())
        };
        if tbc && (nvars != 1 || nexps != 1) {
            return Err(self.error(
                "a to-be-closed variable must be declared alone, with one value",
            ));
        }
        self.adjust_assign(nvars, nexps, &mut last)?;
        self.adjust_locals(nvars);
        if tbc {
            let sidx = self.fs().sp - 1;
            self.emit_il(OpCode::Tbc, sidx)?;
            let depth = self.fs().scopes.len() - 1;
            self.fs_mut().scopes[depth].has_close = true;
            self.fs_mut().needclose = true;
        }
        Ok(())
    }

    fn final_stmt(&mut self) -> Res<()> {
        self.lx.next()?;
        let mut nvars = 0u32;
        loop {
            let name = self.check_name()?;
            self.new_local(name, VarKind::Final)?;
            nvars += 1;
            if !self.accept(&Tok::Comma)? {
                break;
            }
        }
        self.expect(Tok::Assign)?;
        let (nexps, mut last) = self.explist()?;
        self.adjust_assign(nvars, nexps, &mut last)?;
        self.adjust_locals(nvars);
        Ok(())
    }

    /// `fn name(...) {...}` declares a local holding the closure, so
    /// the body can call itself recursively.
    fn fn_stmt(&mut self) -> Res<()> {
        let line = self.lx.t.line;
        self.lx.next()?;
        let name = self.check_name()?;
        self.new_local(name, VarKind::Regular)?;
        self.nil(1)?;
        self.adjust_locals(1);
        let vidx = self.fs().nactlocals - 1;
        let sidx = self.local_at(self.fns.len() - 1, vidx).sidx;
        self.function_body(false, line)?;
        let mut var = ExpInfo::new(ExpKind::Local { vidx, sidx });
        self.store_var(&mut var, 0)?;
        self.fix_line(line);
        Ok(())
    }

    fn class_stmt(&mut self) -> Res<()> {
        let line = self.lx.t.line;
        self.lx.next()?;
        let name = self.check_name()?;
        self.new_local(name, VarKind::Regular)?;
        self.nil(1)?;
        self.adjust_locals(1);
        let vidx = self.fs().nactlocals - 1;
        let sidx = self.local_at(self.fns.len() - 1, vidx).sidx;
        self.class_body()?;
        let mut var = ExpInfo::new(ExpKind::Local { vidx, sidx });
        self.store_var(&mut var, 0)?;
        self.fix_line(line);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Assignment and call statements
    // -----------------------------------------------------------------------

    fn check_assignable(&self, e: &ExpInfo) -> Res<()> {
        match e.kind {
            ExpKind::Local { vidx, .. } => {
                let al = self.local_at(self.fns.len() - 1, vidx);
                match al.kind {
                    VarKind::Regular => Ok(()),
                    VarKind::Final => Err(self.error(format!(
                        "cannot assign to final variable '{}'",
                        al.name
                    ))),
                    VarKind::Tbc => Err(self.error(format!(
                        "cannot assign to to-be-closed variable '{}'",
                        al.name
                    ))),
                }
            }
            ExpKind::Upval(idx) => {
                let uv = &self.fs().p.upvals[idx as usize];
                if uv.kind == VarKind::Regular {
                    Ok(())
                } else {
                    Err(self.error(format!(
                        "cannot assign to final variable '{}'",
                        uv.name.as_deref().unwrap_or("?")
                    )))
                }
            }
            ExpKind::Indexed
            | ExpKind::IndexStr(_)
            | ExpKind::IndexInt(_)
            | ExpKind::Dot(_) => Ok(()),
            ExpKind::Super
            | ExpKind::IndexSuper
            | ExpKind::IndexSuperStr(_)
            | ExpKind::DotSuper(_) => {
                Err(self.error("cannot assign to 'super' or its property"))
            }
            _ => Err(self.error("cannot assign to this expression")),
        }
    }

    fn expr_stmt(&mut self) -> Res<()> {
        let line = self.lx.t.line;
        let e = self.suffixed_expr()?;
        if self.check(&Tok::Assign) || self.check(&Tok::Comma) {
            let mut targets = vec![e];
            while self.accept(&Tok::Comma)? {
                targets.push(self.suffixed_expr()?);
            }
            for t in &targets {
                self.check_assignable(t)?;
            }
            self.expect(Tok::Assign)?;
            let (nexps, mut last) = self.explist()?;
            self.adjust_assign(targets.len() as u32, nexps, &mut last)?;
            let mut extras = 0u32;
            for (idx, t) in targets.iter_mut().enumerate().rev() {
                let left = idx as u32 + extras;
                extras += self.store_var(t, left)?;
            }
            if extras > 0 {
                self.pop(extras)?;
                self.fix_line(line);
            }
            Ok(())
        } else if matches!(e.kind, ExpKind::Call(_)) {
            let mut e = e;
            self.set_returns(&mut e, 0)
        } else {
            Err(self.error("syntax error: expression is not a statement"))
        }
    }

    fn adjust_assign(&mut self, nvars: u32, nexps: u32, e: &mut ExpInfo) -> Res<()> {
        let needed = nvars as i32 - nexps as i32;
        if e.is_multret() {
            let extra = (needed + 1).max(0);
            self.set_returns(e, extra as u32)?;
            let excess = (nexps as i32 - 1) + extra - nvars as i32;
            self.adjust_stack(excess)?;
        } else {
            if !matches!(e.kind, ExpKind::Void) {
                self.exp2stack(e)?;
            }
            self.adjust_stack(-needed)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Control flow
    // -----------------------------------------------------------------------

    fn condition(&mut self) -> Res<usize> {
        let line = self.lx.t.line;
        self.expect(Tok::LParen)?;
        let mut cond = self.expr()?;
        self.expect(Tok::RParen)?;
        // Pending short-circuit lists resolve to the test position.
        self.exp2stack(&mut cond)?;
        self.test(OpCode::TestPop, 0, line)
    }

    fn if_stmt(&mut self) -> Res<()> {
        self.lx.next()?; // skip 'if' / 'elif'
        let jf = self.condition()?;
        self.enter_scope();
        self.block()?;
        self.leave_scope()?;
        if self.check(&Tok::Elif) || self.check(&Tok::Else) {
            let jend = self.jmp(OpCode::Jmp)?;
            self.patch_to_here(Some(jf))?;
            if self.check(&Tok::Elif) {
                self.if_stmt()?;
            } else {
                self.lx.next()?; // skip 'else'
                self.scoped_block()?;
            }
            self.patch_to_here(Some(jend))?;
        } else {
            self.patch_to_here(Some(jf))?;
        }
        self.fs_mut().last_was_return = false;
        Ok(())
    }

    fn enter_block(&mut self, kind: BlockKind, sp: u32, cont_sp: u32) {
        let fs = self.fs_mut();
        fs.blocks.push(BlockCtx {
            kind,
            sp,
            cont_sp,
            break_jl: None,
            cont_jl: None,
        });
    }

    fn while_stmt(&mut self) -> Res<()> {
        self.lx.next()?;
        let start = self.pc();
        self.fs_mut().lasttarget = start;
        let jexit = self.condition()?;
        let sp = self.fs().sp;
        self.enter_block(BlockKind::Loop, sp, sp);
        self.scoped_block()?;
        let ctx = self.fs_mut().blocks.pop().unwrap();
        // `continue` funnels forward into the back edge.
        let back = self.jmp_back(start)?;
        self.patch(ctx.cont_jl, back)?;
        self.patch_to_here(Some(jexit))?;
        self.patch_to_here(ctx.break_jl)?;
        self.fs_mut().last_was_return = false;
        Ok(())
    }

    fn do_while_stmt(&mut self) -> Res<()> {
        self.lx.next()?;
        let start = self.pc();
        self.fs_mut().lasttarget = start;
        let sp = self.fs().sp;
        self.enter_block(BlockKind::Loop, sp, sp);
        self.scoped_block()?;
        let ctx = self.fs_mut().blocks.pop().unwrap();
        let cond_start = self.pc();
        self.patch(ctx.cont_jl, cond_start)?;
        self.expect(Tok::While)?;
        let line = self.lx.t.line;
        self.expect(Tok::LParen)?;
        let mut cond = self.expr()?;
        self.expect(Tok::RParen)?;
        self.exp2stack(&mut cond)?;
        // Loop back while the condition holds: the test pair's forward
        // jump is replaced with the back edge.
        let t = self.test(OpCode::TestPop, 1, line)?;
        debug_assert_eq!(t, self.fs().prevpc);
        self.remove_last_jump();
        self.jmp_back(start)?;
        self.patch_to_here(ctx.break_jl)?;
        self.accept(&Tok::Semi)?;
        self.fs_mut().last_was_return = false;
        Ok(())
    }

    fn loop_stmt(&mut self) -> Res<()> {
        self.lx.next()?;
        let start = self.pc();
        self.fs_mut().lasttarget = start;
        let sp = self.fs().sp;
        self.enter_block(BlockKind::Loop, sp, sp);
        self.scoped_block()?;
        let ctx = self.fs_mut().blocks.pop().unwrap();
        let back = self.jmp_back(start)?;
        self.patch(ctx.cont_jl, back)?;
        self.patch_to_here(ctx.break_jl)?;
        self.fs_mut().last_was_return = false;
        Ok(())
    }

    fn for_stmt(&mut self) -> Res<()> {
        self.lx.next()?;
        self.enter_scope(); // covers the hidden loop state
        let name1 = self.check_name()?;
        if self.check(&Tok::Assign) {
            self.numeric_for(name1)
        } else {
            self.generic_for(name1)
        }
    }

    /// `for i = start, limit[, step] { ... }`
    ///
    /// Layout: start/limit/step occupy three hidden slots; FORPREP
    /// materializes the control variable above them (in a fresh cell,
    /// so escaping closures capture the current iteration) or skips an
    /// empty loop; FORLOOP advances and jumps back, popping the state
    /// on exit.
    fn numeric_for(&mut self, name: TStr) -> Res<()> {
        self.lx.next()?; // skip '='
        let base = self.fs().sp;
        let hidden = self.lx.st.strings.intern(HIDDEN_LOCAL);
        let mut e = self.expr()?;
        self.exp2stack(&mut e)?;
        self.expect(Tok::Comma)?;
        let mut e = self.expr()?;
        self.exp2stack(&mut e)?;
        if self.accept(&Tok::Comma)? {
            let mut step = self.expr()?;
            if matches!(step.kind, ExpKind::Int(0))
                || matches!(step.kind, ExpKind::Flt(x) if x == 0.0)
            {
                return Err(self.error("'for' step is zero"));
            }
            self.exp2stack(&mut step)?;
        } else {
            let mut one = ExpInfo::new(ExpKind::Int(1));
            self.exp2stack(&mut one)?;
        }
        for _ in 0..3 {
            self.new_local(hidden.clone(), VarKind::Regular)?;
        }
        self.adjust_locals(3);
        let prep = self.emit_ill(OpCode::ForPrep, base, 0)?;
        self.reserve_slots(1)?; // control variable
        self.new_local(name, VarKind::Regular)?;
        self.adjust_locals(1);
        let body_start = self.pc();
        self.fs_mut().lasttarget = body_start;
        self.enter_block(BlockKind::Loop, base, base + 4);
        self.scoped_block()?;
        let ctx = self.fs_mut().blocks.pop().unwrap();
        self.patch(ctx.cont_jl, self.pc())?;
        let floop = self.emit_illl(OpCode::ForLoop, base, 0, 4)?;
        self.fix_loop_offset(floop, 1, body_start)?;
        let exit = self.pc();
        self.fix_loop_offset(prep, 1, exit)?;
        self.patch_to_here(ctx.break_jl)?;
        self.end_loop_scope(base, 4)?;
        self.fs_mut().last_was_return = false;
        Ok(())
    }

    /// `for v1[, v2...] in explist { ... }`
    ///
    /// The expression list is adjusted to the iterator quadruple
    /// (function, state, control, closing); FORCALL produces the loop
    /// variables each round and FORLOOP decides between jumping back
    /// and popping the whole state.
    fn generic_for(&mut self, name1: TStr) -> Res<()> {
        let base = self.fs().sp;
        let hidden = self.lx.st.strings.intern(HIDDEN_LOCAL);
        let mut names = vec![name1];
        while self.accept(&Tok::Comma)? {
            names.push(self.check_name()?);
        }
        let nvars = names.len() as u32;
        self.expect(Tok::In)?;
        let (nexps, mut last) = self.explist()?;
        self.adjust_assign(4, nexps, &mut last)?;
        for _ in 0..4 {
            self.new_local(hidden.clone(), VarKind::Regular)?;
        }
        self.adjust_locals(4);
        let entry = self.jmp(OpCode::Jmp)?; // first check
        let body_start = self.pc();
        self.fs_mut().lasttarget = body_start;
        self.enter_block(BlockKind::Loop, base, base + 4);
        self.enter_scope();
        self.reserve_slots(nvars)?;
        for name in names {
            self.new_local(name, VarKind::Regular)?;
        }
        self.adjust_locals(nvars);
        self.block()?;
        self.leave_scope()?;
        let ctx = self.fs_mut().blocks.pop().unwrap();
        let check = self.pc();
        self.patch(Some(entry), check)?;
        self.patch(ctx.cont_jl, check)?;
        self.emit_ill(OpCode::ForCall, base, nvars)?;
        let floop = self.emit_illl(OpCode::ForLoop, base, 0, 4 + nvars)?;
        self.fix_loop_offset(floop, 1, body_start)?;
        self.patch_to_here(ctx.break_jl)?;
        self.end_loop_scope(base, 4)?;
        self.fs_mut().last_was_return = false;
        Ok(())
    }

    /// Write the backward/forward distance of a loop opcode's operand.
    fn fix_loop_offset(&mut self, pc: usize, operand: usize, target: usize) -> Res<()> {
        let op = OpCode::from_byte(self.fs().p.code[pc]).unwrap();
        let from = pc + op.size();
        let dist = (target as i64 - from as i64).unsigned_abs();
        if dist > MAX_JMP as u64 {
            return Err(self.error("control structure too long"));
        }
        let fs = self.fns.last_mut().unwrap();
        set_arg_l(&mut fs.p.code, pc, operand, dist as u32);
        Ok(())
    }

    /// Drop a loop's hidden state: the loop opcodes already popped the
    /// runtime slots, so only the bookkeeping is unwound.
    fn end_loop_scope(&mut self, base: u32, nslots: u32) -> Res<()> {
        self.remove_locals(nslots);
        self.fs_mut().scopes.pop();
        self.fs_mut().sp = base;
        Ok(())
    }

    fn switch_stmt(&mut self) -> Res<()> {
        self.lx.next()?;
        self.expect(Tok::LParen)?;
        let mut subject = self.expr()?;
        self.expect(Tok::RParen)?;
        self.exp2stack(&mut subject)?;
        let sp = self.fs().sp;
        self.enter_block(BlockKind::Switch, sp, sp);
        let brace_line = self.lx.t.line;
        self.expect(Tok::LBrace)?;
        let mut seen: Vec<Value> = Vec::new();
        let mut fail: Option<usize> = None; // previous case's failing jump
        let mut done: Option<usize> = None; // jumps to the end
        let mut had_default = false;
        while self.check(&Tok::Case) || self.check(&Tok::Default) {
            if let Some(j) = fail.take() {
                self.patch_to_here(Some(j))?;
            }
            let line = self.lx.t.line;
            if self.accept(&Tok::Case)? {
                if had_default {
                    return Err(self.error("'case' after 'default'"));
                }
                let lit = self.case_literal()?;
                if seen.iter().any(|v| v.raw_eq(&lit)) {
                    return Err(self.error("duplicate 'case' label"));
                }
                seen.push(lit.clone());
                self.expect(Tok::Colon)?;
                let mut le = ExpInfo::new(match lit {
                    Value::Nil => ExpKind::Nil,
                    Value::Bool(true) => ExpKind::True,
                    Value::Bool(false) => ExpKind::False,
                    Value::Int(i) => ExpKind::Int(i),
                    Value::Float(x) => ExpKind::Flt(x),
                    Value::ShortStr(s) => ExpKind::Str(s),
                    Value::LongStr(rc) => ExpKind::Str(TStr(rc)),
                    _ => unreachable!(),
                });
                self.exp2stack(&mut le)?;
                self.emit_i(OpCode::EqPreserve)?;
                fail = Some(self.test(OpCode::TestPop, 0, line)?);
            } else {
                self.lx.next()?; // skip 'default'
                if had_default {
                    return Err(self.error("multiple 'default' cases"));
                }
                had_default = true;
                self.expect(Tok::Colon)?;
            }
            self.enter_scope();
            self.stmt_list()?;
            self.leave_scope()?;
            let j = self.jmp(OpCode::Jmp)?;
            let mut list = done.take();
            self.concat_jl(&mut list, Some(j))?;
            done = list;
        }
        self.expect_close(Tok::RBrace, Tok::LBrace, brace_line)?;
        if let Some(j) = fail {
            self.patch_to_here(Some(j))?;
        }
        self.patch_to_here(done)?;
        let ctx = self.fs_mut().blocks.pop().unwrap();
        self.patch_to_here(ctx.break_jl)?;
        self.pop(1)?; // the subject
        self.fs_mut().last_was_return = false;
        Ok(())
    }

    /// Switch labels are literal constants only.
    fn case_literal(&mut self) -> Res<Value> {
        let neg = self.accept(&Tok::Minus)?;
        let v = match self.lx.t.tok.clone() {
            Tok::Int(i) => Value::Int(if neg { i.wrapping_neg() } else { i }),
            Tok::Flt(x) => Value::Float(if neg { -x } else { x }),
            Tok::Str(s) if !neg => Value::from_tstr(s),
            Tok::True if !neg => Value::Bool(true),
            Tok::False if !neg => Value::Bool(false),
            Tok::Nil if !neg => Value::Nil,
            other => {
                return Err(self.error(format!(
                    "literal constant expected near {}",
                    other.describe()
                )))
            }
        };
        self.lx.next()?;
        Ok(v)
    }

    fn innermost_block(&self, kind: Option<BlockKind>) -> Option<usize> {
        let blocks = &self.fs().blocks;
        match kind {
            None => blocks.len().checked_sub(1),
            Some(k) => blocks.iter().rposition(|b| b.kind == k),
        }
    }

    /// Emit the CLOSE/POP prologue of a pending break/continue jump and
    /// queue the jump itself on the context's chain.
    fn goto_block(&mut self, idx: usize, is_break: bool) -> Res<()> {
        let b = &self.fs().blocks[idx];
        let target_sp = if is_break { b.sp } else { b.cont_sp };
        // The jump escapes every scope whose locals sit at or above the
        // target; captured or to-be-closed slots there must be closed.
        let needs_close = self
            .fs()
            .scopes
            .iter()
            .any(|s| s.nactlocals >= target_sp && s.has_close);
        if needs_close {
            self.emit_il(OpCode::Close, target_sp)?;
        }
        let n = self.fs().sp - target_sp;
        if n > 0 {
            // Discard only at runtime; the slots stay live for the
            // rest of the block's compilation.
            self.remove_values(n)?;
        }
        let j = self.jmp(OpCode::Jmp)?;
        let mut list = if is_break {
            self.fs_mut().blocks[idx].break_jl.take()
        } else {
            self.fs_mut().blocks[idx].cont_jl.take()
        };
        self.concat_jl(&mut list, Some(j))?;
        if is_break {
            self.fs_mut().blocks[idx].break_jl = list;
        } else {
            self.fs_mut().blocks[idx].cont_jl = list;
        }
        Ok(())
    }

    fn break_stmt(&mut self) -> Res<()> {
        self.lx.next()?;
        match self.innermost_block(None) {
            Some(idx) => self.goto_block(idx, true),
            None => Err(self.error("'break' outside a loop or switch")),
        }
    }

    fn continue_stmt(&mut self) -> Res<()> {
        self.lx.next()?;
        match self.innermost_block(Some(BlockKind::Loop)) {
            Some(idx) => self.goto_block(idx, false),
            None => Err(self.error("'continue' outside a loop")),
        }
    }

    fn return_stmt(&mut self) -> Res<()> {
        let line = self.lx.t.line;
        self.lx.next()?;
        let first = self.fs().sp;
        let mut nret: i32 = 0;
        if !self.block_follows() && !self.check(&Tok::Semi) {
            let (n, mut last) = self.explist()?;
            if last.is_multret() {
                self.set_multret(&mut last)?;
                nret = MULTRET;
            } else {
                self.exp2stack(&mut last)?;
                nret = n as i32;
            }
        }
        self.code_return(first, nret)?;
        self.fix_line(line);
        if nret > 0 {
            self.free_slots(nret as u32);
        } else if nret == MULTRET {
            self.fs_mut().sp = first;
        }
        self.accept(&Tok::Semi)?;
        self.fs_mut().last_was_return = true;
        Ok(())
    }
}

fn priority(op: BinOp) -> (u8, u8) {
    match op {
        BinOp::Or => (1, 1),
        BinOp::And => (2, 2),
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => (3, 3),
        BinOp::BOr => (4, 4),
        BinOp::BXor => (5, 5),
        BinOp::BAnd => (6, 6),
        BinOp::Shl | BinOp::Shr => (7, 7),
        BinOp::Concat => (9, 8), // right-associative
        BinOp::Add | BinOp::Sub => (10, 10),
        BinOp::Mul | BinOp::Div | BinOp::IDiv | BinOp::Mod => (11, 11),
        BinOp::Pow => (14, 13), // right-associative
    }
}
