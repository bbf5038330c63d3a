//! Integration tests for the compiler pipeline: bytecode shapes,
//! constant-pool behaviour, jump patching, and the compile-time stack
//! contract.

use std::rc::Rc;

use tokudae::bytecode::{
    get_arg_l, get_arg_s, iter_code, next_sp, OpCode, Proto,
};
use tokudae::limits::{ABS_LINEINFO, MAX_JMP, SIZE_ARG_L};
use tokudae::{State, Value};

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn compile(src: &str) -> Rc<Proto> {
    let mut st = State::new();
    st.load_str(src, "test").expect("compile should succeed").p
}

fn compile_err(src: &str) -> String {
    let mut st = State::new();
    match st.load_str(src, "test") {
        Ok(_) => panic!("expected a syntax error"),
        Err(e) => e.to_string(),
    }
}

fn ops(p: &Proto) -> Vec<OpCode> {
    iter_code(&p.code).map(|(_, op)| op).collect()
}

fn count(p: &Proto, op: OpCode) -> usize {
    ops(p).iter().filter(|&&o| o == op).count()
}

fn find(p: &Proto, op: OpCode) -> Option<usize> {
    iter_code(&p.code).find(|&(_, o)| o == op).map(|(pc, _)| pc)
}

/// Check every jump in a proto tree: JMP strictly forward, JMPS
/// strictly backward (zero offsets allowed as degenerate fall-through),
/// and all targets inside the function.
fn check_jumps(p: &Proto) {
    for (pc, op) in iter_code(&p.code) {
        match op {
            OpCode::Jmp | OpCode::JmpS => {
                let offset = get_arg_l(&p.code, pc, 0) as usize;
                assert!(offset <= MAX_JMP);
                let from = pc + op.size();
                let target = if op == OpCode::Jmp {
                    from + offset
                } else {
                    from.checked_sub(offset).expect("backward jump underflow")
                };
                assert!(target <= p.code.len(), "jump escapes the function");
            }
            _ => {}
        }
    }
    for sub in &p.p {
        check_jumps(sub);
    }
}

// ─── Seed scenarios ───────────────────────────────────────────────────────────

#[test]
fn empty_function_shape() {
    let main = compile("fn f() {}");
    let f = &main.p[0];
    assert_eq!(f.arity, 0);
    assert!(!f.is_vararg);
    assert!(f.maxstack >= 1);
    let body = ops(f);
    assert_eq!(body, vec![OpCode::Return]);
    let ret = find(f, OpCode::Return).unwrap();
    assert_eq!(get_arg_l(&f.code, ret, 0), 0); // first
    assert_eq!(get_arg_l(&f.code, ret, 1), 1); // nresults (0 + bias)
    assert_eq!(get_arg_s(&f.code, ret, 2 * SIZE_ARG_L), 0); // close flag
}

#[test]
fn mixed_constant_folding() {
    let p = compile("local x = 1 + 2.5");
    assert_eq!(p.k.len(), 1);
    assert!(p.k[0].raw_eq(&Value::Float(3.5)));
    assert_eq!(
        ops(&p),
        vec![OpCode::VarargPrep, OpCode::ConstF, OpCode::Return]
    );
    let cf = find(&p, OpCode::ConstF).unwrap();
    assert_eq!(get_arg_s(&p.code, cf, 0), 0); // pool index of 3.5
}

#[test]
fn short_circuit_shape() {
    let p = compile("if (a or b()) { c() }");
    // One TEST for the `or`, one TESTPOP for the `if`, each paired with
    // its jump; the fall-through of the test pops the first operand.
    assert_eq!(count(&p, OpCode::Test), 1);
    assert_eq!(count(&p, OpCode::TestPop), 1);
    assert_eq!(count(&p, OpCode::Jmp), 2);
    assert_eq!(count(&p, OpCode::Pop), 1);
    // The short-circuit jump lands exactly on the if's test, so a
    // truthy `a` still gets consumed.
    let or_jmp = iter_code(&p.code)
        .find(|&(_, op)| op == OpCode::Jmp)
        .map(|(pc, _)| pc)
        .unwrap();
    let offset = get_arg_l(&p.code, or_jmp, 0) as usize;
    let target = or_jmp + OpCode::Jmp.size() + offset;
    assert_eq!(target, find(&p, OpCode::TestPop).unwrap());
    check_jumps(&p);
}

#[test]
fn comparison_uses_immediate_operand() {
    let p = compile("local i = 0 while (i < 1000) { i = i + 1 }");
    let lti = find(&p, OpCode::LtI).expect("LTI expected for small literal");
    assert_eq!(get_arg_l(&p.code, lti, 0), 1000);
    // No generic comparison and no constant load for 1000.
    assert_eq!(count(&p, OpCode::Lt), 0);
    assert!(p.k.is_empty());
    // `i + 1` picks the immediate add.
    assert!(find(&p, OpCode::AddI).is_some());
    check_jumps(&p);
}

#[test]
fn numeric_for_shape() {
    let p = compile("for i = 1, 9223372036854775807 { }");
    assert_eq!(
        ops(&p),
        vec![
            OpCode::VarargPrep,
            OpCode::ConstI, // start
            OpCode::Const,  // limit, too large for an immediate
            OpCode::ConstI, // default step
            OpCode::ForPrep,
            OpCode::ForLoop,
            OpCode::Return,
        ]
    );
    assert!(p.k[0].raw_eq(&Value::Int(i64::MAX)));
    let floop = find(&p, OpCode::ForLoop).unwrap();
    assert_eq!(get_arg_l(&p.code, floop, 2), 4); // pops its loop state
    // FORPREP skips an empty loop past FORLOOP.
    let prep = find(&p, OpCode::ForPrep).unwrap();
    let off = get_arg_l(&p.code, prep, 1) as usize;
    assert_eq!(prep + OpCode::ForPrep.size() + off, floop + OpCode::ForLoop.size());
}

#[test]
fn generic_for_shape() {
    let p = compile("for k, v in pairs { k = k }");
    let fcall = find(&p, OpCode::ForCall).expect("FORCALL");
    assert_eq!(get_arg_l(&p.code, fcall, 1), 2); // two loop variables
    let floop = find(&p, OpCode::ForLoop).unwrap();
    assert_eq!(get_arg_l(&p.code, floop, 2), 4 + 2);
    check_jumps(&p);
}

// ─── Compile-time stack contract ─────────────────────────────────────────────

#[test]
fn sp_reconstructs_from_metadata() {
    let p = compile(
        r#"
        {
            local a = 1
            local b = 2
            a = a + b
        }
        "#,
    );
    let expected = [
        (OpCode::VarargPrep, 0),
        (OpCode::ConstI, 1),
        (OpCode::ConstI, 2),
        (OpCode::GetLocal, 3),
        (OpCode::GetLocal, 4),
        (OpCode::Add, 3),
        (OpCode::MBin, 3),
        (OpCode::SetLocal, 2),
        (OpCode::Pop, 0),
        (OpCode::Return, 0),
    ];
    let mut sp = 0i32;
    let walked: Vec<(OpCode, i32)> = iter_code(&p.code)
        .map(|(pc, op)| {
            sp = next_sp(&p.code, pc, sp);
            (op, sp)
        })
        .collect();
    assert_eq!(walked.len(), expected.len());
    for ((op, sp), (want_op, want_sp)) in walked.iter().zip(expected.iter()) {
        assert_eq!(op, want_op);
        assert_eq!(sp, want_sp, "stack mismatch after {:?}", op);
    }
    // Zero right before the function returns.
    assert_eq!(walked[walked.len() - 2].1, 0);
}

#[test]
fn maxstack_covers_walked_sp() {
    let p = compile(
        r#"
        local a = 1
        local b = a + 2 * a - 1
        local c = [a, b, 3]
        c[0] = a
        "#,
    );
    let mut sp = 0i32;
    let mut peak = 0i32;
    for (pc, _) in iter_code(&p.code) {
        sp = next_sp(&p.code, pc, sp);
        peak = peak.max(sp);
    }
    assert!(sp >= 0);
    assert!(p.maxstack as i32 >= peak);
}

// ─── Line information ────────────────────────────────────────────────────────

#[test]
fn lineinfo_invariants_hold() {
    let mut src = String::new();
    for i in 1..=300 {
        src.push_str(&format!("local a{} = {}\n", i, i));
    }
    let p = compile(&src);
    assert_eq!(p.lineinfo.len(), p.code.len());
    // Forced absolute entries every MAX_IWTHABS instructions.
    assert!(!p.abslineinfo.is_empty());
    let mut prev = None;
    for a in &p.abslineinfo {
        assert_eq!(p.lineinfo[a.pc as usize], ABS_LINEINFO);
        if let Some(prev) = prev {
            assert!(a.pc > prev, "abslineinfo must be strictly sorted");
        }
        prev = Some(a.pc);
    }
    // opcodepc is strictly increasing and lists exactly the starts.
    let starts: Vec<u32> = iter_code(&p.code).map(|(pc, _)| pc as u32).collect();
    assert_eq!(p.opcodepc, starts);
    // Filler bytes carry the sentinel.
    for (pc, op) in iter_code(&p.code) {
        for i in pc + 1..pc + op.size() {
            assert_eq!(p.lineinfo[i], ABS_LINEINFO);
        }
    }
    // Spot-check reconstructed lines: statement N sits on line N.
    let const_pcs: Vec<usize> = iter_code(&p.code)
        .filter(|&(_, op)| op == OpCode::ConstI || op == OpCode::ConstIL)
        .map(|(pc, _)| pc)
        .collect();
    assert_eq!(p.line_at(const_pcs[0]), 1);
    assert_eq!(p.line_at(const_pcs[41]), 42);
    assert_eq!(p.line_at(const_pcs[255]), 256);
}

#[test]
fn line_delta_boundaries() {
    // A jump of +127 lines stays relative; +128 goes absolute.
    let relative = format!("local a = 1{}local b = 2", "\n".repeat(127));
    let p = compile(&relative);
    assert!(p.abslineinfo.is_empty());
    let absolute = format!("local a = 1{}local b = 2", "\n".repeat(128));
    let p = compile(&absolute);
    assert_eq!(p.abslineinfo.len(), 1);
    assert_eq!(p.abslineinfo[0].line, 129);
}

// ─── Peephole behaviour ──────────────────────────────────────────────────────

#[test]
fn adjacent_nils_merge() {
    let p = compile("local a local b local c, d");
    // All declaration padding funnels into NIL instructions with
    // summed counts; counting total slots is what matters.
    let total: u32 = iter_code(&p.code)
        .filter(|&(_, op)| op == OpCode::Nil)
        .map(|(pc, _)| get_arg_l(&p.code, pc, 0))
        .sum();
    assert_eq!(total, 4);
    // And no two adjacent NILs remain without a jump target between.
    let mut prev_nil_end = None;
    for (pc, op) in iter_code(&p.code) {
        if op == OpCode::Nil {
            if let Some(end) = prev_nil_end {
                assert_ne!(pc, end, "mergeable NILs left unmerged");
            }
            prev_nil_end = Some(pc + op.size());
        } else {
            prev_nil_end = None;
        }
    }
}

#[test]
fn nil_merge_does_not_cross_other_instructions() {
    // The store between the two nil sources keeps them separate.
    let p = compile("x = nil local a");
    assert_eq!(count(&p, OpCode::Nil), 2);
}

// ─── Call check (`?`) ────────────────────────────────────────────────────────

#[test]
fn call_check_fixed_arity() {
    let main = compile("fn g(f) { local a = f()? }");
    let g = &main.p[0];
    let shape = ops(g);
    let expect = [
        OpCode::GetLocal,
        OpCode::Call,
        OpCode::Load,
        OpCode::TestPop,
        OpCode::Jmp,
        OpCode::Return,
        OpCode::True,
        OpCode::CheckAdj,
        OpCode::Return,
    ];
    assert_eq!(shape, expect);
    let adj = find(g, OpCode::CheckAdj).unwrap();
    assert_eq!(get_arg_l(&g.code, adj, 1), 2); // fixed to one result
    // The guarded return spills everything the call produced.
    let ret = find(g, OpCode::Return).unwrap();
    assert_eq!(get_arg_l(&g.code, ret, 1), 0); // MULTRET on the wire
}

#[test]
fn call_check_statement_drops_results() {
    let main = compile("fn g(f) { f()? }");
    let g = &main.p[0];
    let adj = find(g, OpCode::CheckAdj).unwrap();
    assert_eq!(get_arg_l(&g.code, adj, 1), 1); // zero results
}

#[test]
fn call_check_multret_removes_checkadj() {
    let main = compile("fn g(f) { return f()? }");
    let g = &main.p[0];
    assert_eq!(count(g, OpCode::CheckAdj), 0);
    assert_eq!(count(g, OpCode::True), 1);
    assert_eq!(count(g, OpCode::Return), 3);
}

// ─── To-be-closed and upvalues ───────────────────────────────────────────────

#[test]
fn tbc_emits_mark_and_close_flag() {
    let p = compile("local res <tbc> = acquire()");
    let tbc = find(&p, OpCode::Tbc).expect("TBC mark");
    assert_eq!(get_arg_l(&p.code, tbc, 0), 0); // slot of `res`
    for (pc, op) in iter_code(&p.code) {
        if op == OpCode::Return {
            assert_eq!(get_arg_s(&p.code, pc, 2 * SIZE_ARG_L), 1, "close flag");
        }
    }
}

#[test]
fn tbc_must_be_single_and_initialized() {
    assert!(compile_err("local a <tbc>, b = 1, 2").contains("to-be-closed"));
    assert!(compile_err("local a <tbc>").contains("to-be-closed"));
}

#[test]
fn captured_local_records_upvalue() {
    let main = compile(
        r#"
        fn outer() {
            local x = 1
            fn inner() { return x }
            return inner
        }
        "#,
    );
    let outer = &main.p[0];
    let inner = &outer.p[0];
    assert_eq!(inner.upvals.len(), 1);
    let uv = &inner.upvals[0];
    assert!(uv.in_stack);
    assert_eq!(uv.idx, 0);
    assert_eq!(uv.name.as_deref(), Some("x"));
    // The capturing function closes its frame on return.
    for (pc, op) in iter_code(&outer.code) {
        if op == OpCode::Return {
            assert_eq!(get_arg_s(&outer.code, pc, 2 * SIZE_ARG_L), 1);
        }
    }
}

#[test]
fn scope_exit_closes_captured_slots() {
    let main = compile(
        r#"
        fn outer() {
            local keep = 0
            {
                local x = 1
                fn inner() { return x }
                keep = inner
            }
            return keep
        }
        "#,
    );
    let outer = &main.p[0];
    let close = find(outer, OpCode::Close).expect("CLOSE on scope exit");
    assert_eq!(get_arg_l(&outer.code, close, 0), 1); // first slot of the scope
}

#[test]
fn env_access_chains_through_upvalues() {
    let main = compile("fn f() { return g() }");
    let f = &main.p[0];
    assert_eq!(f.upvals.len(), 1);
    assert!(!f.upvals[0].in_stack);
    assert_eq!(f.upvals[0].name.as_deref(), Some("__ENV"));
    assert_eq!(ops(f)[0], OpCode::GetUval);
}

// ─── Classes ─────────────────────────────────────────────────────────────────

#[test]
fn class_shape_and_sizing_hint() {
    let p = compile(
        r#"
        class Point {
            init(x) { self.x = x }
            norm() { return self.x * self.x }
            __add(other) { return other }
        }
        "#,
    );
    assert_eq!(count(&p, OpCode::Method), 2);
    assert_eq!(count(&p, OpCode::SetTm), 1);
    let settm = find(&p, OpCode::SetTm).unwrap();
    assert_eq!(get_arg_s(&p.code, settm, 0), 0); // Tm::Add slot
    let nc = find(&p, OpCode::NewClass).unwrap();
    // ceil_log2(2) + 1, with the metatable flag.
    assert_eq!(get_arg_s(&p.code, nc, 0), 0x82);
    // Each member definition works on a copy of the class.
    assert_eq!(count(&p, OpCode::Load), 3);
}

#[test]
fn inheritance_and_super() {
    let main = compile(
        r#"
        class A { m() { return 1 } }
        class B inherits A {
            m() { return super.m() }
        }
        "#,
    );
    assert_eq!(count(&main, OpCode::Inherit), 1);
    let bm = &main.p[1];
    assert!(find(bm, OpCode::GetSup).is_some());
}

#[test]
fn super_is_not_assignable() {
    let err = compile_err(
        "class A { m() { return 0 } } class B inherits A { m() { super.m = 1 } }",
    );
    assert!(err.contains("super"));
}

#[test]
fn super_requires_a_superclass() {
    let err = compile_err("class A { m() { return super.m() } }");
    assert!(err.contains("superclass"));
}

// ─── Switch ──────────────────────────────────────────────────────────────────

#[test]
fn switch_compiles_equality_ladder() {
    let p = compile(
        r#"
        switch (x) {
            case 1: y = 1
            case "two": y = 2
            case nil: y = 3
            default: y = 4
        }
        "#,
    );
    assert_eq!(count(&p, OpCode::EqPreserve), 3);
    // The subject is popped exactly once at the end.
    check_jumps(&p);
}

#[test]
fn switch_rejects_duplicate_labels() {
    let err = compile_err("switch (x) { case 1: y = 1 case 1: y = 2 }");
    assert!(err.contains("duplicate 'case'"));
    // An integer-valued float duplicates an integer label.
    let err = compile_err("switch (x) { case 1: y = 1 case 1.0: y = 2 }");
    assert!(err.contains("duplicate 'case'"));
}

// ─── Declarations and assignment ─────────────────────────────────────────────

#[test]
fn final_variables_reject_assignment() {
    assert!(compile_err("final k = 1 k = 2").contains("final variable 'k'"));
    // Capture keeps the kind: assigning through an upvalue also fails.
    let err = compile_err("final k = 1 fn f() { k = 2 }");
    assert!(err.contains("final variable 'k'"));
}

#[test]
fn multi_assignment_stores_in_reverse() {
    let p = compile("local t = {} local i = 0 t[i], i = 1, 2");
    // SETINDEX leaves its object/key pair for a trailing POP.
    assert!(find(&p, OpCode::SetIndex).is_some());
    assert!(find(&p, OpCode::SetLocal).is_some());
    check_jumps(&p);
}

#[test]
fn adjustment_pads_and_drops() {
    let p = compile("local a, b, c = 1");
    let nil = find(&p, OpCode::Nil).expect("padding nils");
    assert_eq!(get_arg_l(&p.code, nil, 0), 2);
    let p = compile("local a = 1, 2");
    assert_eq!(count(&p, OpCode::Pop), 1);
}

#[test]
fn multret_spreads_into_locals() {
    let p = compile("local a, b, c = f()");
    let call = find(&p, OpCode::Call).unwrap();
    assert_eq!(get_arg_l(&p.code, call, 1), 4); // three results + bias
}

// ─── Loops and jumps ─────────────────────────────────────────────────────────

#[test]
fn loops_emit_backward_edges() {
    for src in [
        "while (cond()) { work() }",
        "do { work() } while (cond())",
        "loop { if (done()) { break } }",
        "local i = 0 while (i < 3) { i = i + 1 continue }",
    ] {
        let p = compile(src);
        assert!(count(&p, OpCode::JmpS) >= 1, "no back edge in {:?}", src);
        check_jumps(&p);
    }
}

#[test]
fn break_and_continue_need_a_loop() {
    assert!(compile_err("break").contains("'break' outside"));
    assert!(compile_err("continue").contains("'continue' outside"));
    // break works in a switch, continue does not.
    assert!(compile_err("switch (x) { case 1: continue }").contains("'continue' outside"));
}

#[test]
fn zero_step_is_rejected() {
    assert!(compile_err("for i = 1, 10, 0 { }").contains("step is zero"));
}

// ─── Lists and tables ────────────────────────────────────────────────────────

#[test]
fn list_constructor_flushes_in_batches() {
    let items: Vec<String> = (0..120).map(|i| i.to_string()).collect();
    let src = format!("local l = [{}]", items.join(", "));
    let p = compile(&src);
    // 120 items flush as 50 + 50 + 20.
    let stores: Vec<u32> = iter_code(&p.code)
        .filter(|&(_, op)| op == OpCode::SetList)
        .map(|(pc, _)| get_arg_s(&p.code, pc, 2 * SIZE_ARG_L) as u32)
        .collect();
    assert_eq!(stores, vec![50, 50, 20]);
}

#[test]
fn list_spreads_trailing_call() {
    let p = compile("local l = [1, f()]");
    let sl = find(&p, OpCode::SetList).unwrap();
    assert_eq!(get_arg_s(&p.code, sl, 2 * SIZE_ARG_L), 0); // up to the top
    let call = find(&p, OpCode::Call).unwrap();
    assert_eq!(get_arg_l(&p.code, call, 1), 0); // all results
}

#[test]
fn table_constructor_specializes_keys() {
    let p = compile(r#"local t = { a = 1, [2] = 2, [k()] = 3 }"#);
    assert!(find(&p, OpCode::NewTable).is_some());
    assert_eq!(count(&p, OpCode::SetIndexStr), 1);
    assert_eq!(count(&p, OpCode::SetIndexInt), 1);
    assert_eq!(count(&p, OpCode::SetIndex), 1);
}

// ─── Misc ────────────────────────────────────────────────────────────────────

#[test]
fn vararg_needs_vararg_function() {
    // The main chunk is vararg; an inner fixed function is not.
    compile("local a = ...");
    let err = compile_err("fn f() { local a = ... }");
    assert!(err.contains("outside a vararg function"));
}

#[test]
fn parenthesized_call_truncates_results() {
    let p = compile("local a, b = (f())");
    let call = find(&p, OpCode::Call).unwrap();
    assert_eq!(get_arg_l(&p.code, call, 1), 2); // exactly one result
    assert_eq!(count(&p, OpCode::Nil), 1); // b padded with nil
}

#[test]
fn compilation_is_deterministic() {
    let src = r#"
        local x = 1.5 + 2
        fn f(a, b) { return a * b + x }
        local l = [1, 2.0, "three", f]
        switch (x) { case 1: f(1, 2) default: f(2, 3) }
    "#;
    let a = compile(src);
    let b = compile(src);
    assert_eq!(a.code, b.code);
    assert_eq!(a.lineinfo, b.lineinfo);
    assert_eq!(a.k.len(), b.k.len());
    for (ka, kb) in a.k.iter().zip(b.k.iter()) {
        assert!(ka.raw_eq(kb));
    }
}

#[test]
fn deep_jump_chains_resolve() {
    // Nested ifs produce jump-to-jump chains that the finish pass
    // rewrites to final targets.
    let mut src = String::from("local x = 0\n");
    for _ in 0..20 {
        src.push_str("if (x) { ");
    }
    src.push_str("x = 1");
    for _ in 0..20 {
        src.push_str(" }");
    }
    let p = compile(&src);
    check_jumps(&p);
}
