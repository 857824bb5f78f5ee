//! The bytecode dispatch loop (SPEC_FULL.md §4.3 "Bytecode interpreter").
//!
//! Grounded on the teacher's `vm/interpreter/mod.rs` fetch-decode-dispatch
//! shape and its `vm/interpreter/opcodes/exceptions.rs` handler-stack idiom
//! for `TryOperation`/`EndTry`/`Throw` — generalized here from the teacher's
//! raw handler-stack-of-pointers into the `HandlerFrame` stack below, since
//! this crate's exception model additionally has to thread `finally` re-entry
//! for `break`/`continue`/`return` (not just `throw`) through the same
//! `JumpComplexCase` opcode (see DESIGN.md, "Completion model").

use std::cell::RefCell;

use log::trace;

use crate::atomic_string::AtomicString;
use crate::bytecode::{ByteCodeBlock, ControlFlowRecord, Instr, OtherLiteral};
use crate::codeblock::CodeBlockId;
use crate::vm::environment::{resolve_by_name, EnvRef, EnvironmentKind, EnvironmentRecord, ResolvedName};
use crate::vm::value::{
    FunctionObject, GeneratorState, Heap, HeapId, HeapObject, NativeIntrinsic, Value,
};
use crate::vm::{Context, Program, VmError, VmResult};

/// What a range of bytecode completed with (SPEC_FULL.md §9, "Completion").
/// Distinct from [`ControlFlowRecord`]: a `ControlFlowRecord` is the
/// *encoded* (compile-time) description of a non-local jump; `Completion`
/// is what actually happened when the interpreter ran to the end of a
/// bounded range, and is what drives `finally` re-entry and handler lookup.
enum Completion {
    /// Ran off the end of the requested `[pc_start, pc_end)` range normally.
    FellOff,
    /// `Return` executed; carries the returned value.
    Return(Value),
    /// `Throw` executed (or an inner completion rethrew); carries the
    /// thrown value.
    Throw(Value),
    /// `Yield` executed; carries the yielded value and the PC execution
    /// should resume at on the next `.next()` call (the `ExecutionResume`
    /// marker immediately following the `Yield`). Only ever produced while
    /// running a generator body — an ordinary call's `exec_range` can never
    /// observe this (`Yield` only compiles inside a generator).
    Suspend(Value, u32),
}

/// One `TryOperation`'s handler bookkeeping, pushed when execution enters
/// its try body and popped once its `finally` (if any) has run to
/// completion. Mirrors the teacher's exception handler stack, widened to
/// also carry `finally`/`end` so `do_throw` and the `JumpComplexCase`
/// unwind loop can find the next relevant frame without re-decoding the
/// `TryOperation` instruction.
#[derive(Clone, Copy)]
struct HandlerFrame {
    catch: u32,
    catch_reg: u16,
    finally: u32,
    end: u32,
    /// Set once this frame's catch body is what is currently executing, so
    /// a throw/break/continue/return *inside* the catch body still runs
    /// this same try's `finally` exactly once, instead of a second handler
    /// lookup mistaking the catch body for being still inside the try body.
    in_catch: bool,
}

/// One call's interpretation state: everything `exec_range` needs that is
/// constant for the lifetime of one `call_code_block` invocation.
struct Frame<'a> {
    program: &'a Program,
    block: &'a ByteCodeBlock,
    code_block_id: CodeBlockId,
    reg_base: usize,
    env: EnvRef,
    handlers: Vec<HandlerFrame>,
    with_depth: u32,
}

/// Run `code_block`'s body to completion as an ordinary (non-generator)
/// call, or instantiate a generator object if the code block is one
/// (SPEC_FULL.md §4.3 "Call", "Generators").
///
/// `closure` is the environment the function closed over (`None` for the
/// program entry point). Returns the script/function's completion value on
/// `Ok`, or the uncaught thrown [`Value`] on `Err`.
pub fn call_code_block(
    ctx: &mut Context,
    program: &Program,
    code_block_id: CodeBlockId,
    this: Value,
    args: &[Value],
    closure: Option<EnvRef>,
) -> VmResult<Result<Value, Value>> {
    ctx.check_interrupt()?;
    let code_block = program.code_blocks.get(code_block_id);
    if code_block.flags.is_generator {
        let obj = instantiate_generator(ctx, code_block_id, closure, args, this);
        return Ok(Ok(obj));
    }
    invoke(ctx, program, code_block_id, this, args, closure)
}

/// A fresh, non-generator call: allocate a register frame, bind
/// parameters, run the whole instruction stream, and translate the
/// resulting [`Completion`] into a `Result<Value, Value>`.
///
/// Never called with a generator's CodeBlock — those only ever run
/// through [`instantiate_generator`]/[`resume_generator`], so a `Suspend`
/// completion here is an invariant violation rather than something to
/// translate.
fn invoke(
    ctx: &mut Context,
    program: &Program,
    code_block_id: CodeBlockId,
    this: Value,
    args: &[Value],
    closure: Option<EnvRef>,
) -> VmResult<Result<Value, Value>> {
    let block = program.bytecode_for(code_block_id)?;
    let reg_base = ctx.regs.alloc_frame(block.required_register_file_size as usize)?;
    bind_parameters(ctx, program, code_block_id, reg_base, args)?;
    let env = make_call_environment(ctx, program, code_block_id, closure, args);
    let _ = this; // `this` binding is out of scope for this core (SPEC_FULL.md §1 Non-goals).

    let mut frame =
        Frame { program, block, code_block_id, reg_base, env, handlers: Vec::new(), with_depth: 0 };
    let completion = exec_range(ctx, &mut frame, 0, block.code.len() as u32)?;
    ctx.regs.free_frame(reg_base);

    match completion {
        Completion::Return(v) => Ok(Ok(v)),
        Completion::Throw(v) => Ok(Err(v)),
        Completion::FellOff => Ok(Ok(Value::undefined())),
        Completion::Suspend(..) => {
            Err(VmError::InvalidInvariant("Yield executed outside a generator body".to_string()))
        }
    }
}

/// Bind `this`/`arguments` are out of scope for this core (SPEC_FULL.md
/// §1 Non-goals); parameters are the only entry-time binding. Copy each
/// argument into its parameter's on-stack register slot, or drop it if the
/// parameter was captured into the heap (closure capture still needs its
/// *initial* value to reach the `Declarative` environment, which
/// `make_call_environment` seeds separately).
fn bind_parameters(
    ctx: &mut Context,
    program: &Program,
    code_block_id: CodeBlockId,
    reg_base: usize,
    args: &[Value],
) -> VmResult<()> {
    let cb = program.code_blocks.get(code_block_id);
    for (i, ident) in cb.identifiers.iter().filter(|i| i.is_parameter).enumerate() {
        let value = args.get(i).copied().unwrap_or(Value::undefined());
        if ident.on_stack {
            ctx.regs.set_reg(reg_base, ident.slot as u16, value)?;
        }
    }
    Ok(())
}

/// Build the single flat `Declarative` environment for a fresh call
/// activation (SPEC_FULL.md §4.3, "Environments"; simplification recorded
/// in `vm/environment.rs`), seeding captured parameters' initial values
/// since those never live in a register the heap-slot code can read back —
/// [`bind_parameters`] only reaches the `on_stack` half of the parameter
/// list.
fn make_call_environment(
    ctx: &mut Context,
    program: &Program,
    code_block_id: CodeBlockId,
    closure: Option<EnvRef>,
    args: &[Value],
) -> EnvRef {
    let cb = program.code_blocks.get(code_block_id);
    let outer = closure.or_else(|| Some(ctx.global_env.clone()));
    let env = EnvironmentRecord::declarative(code_block_id, cb.counts.identifier_on_heap_count as usize, outer);
    for (i, ident) in cb.identifiers.iter().filter(|i| i.is_parameter).enumerate() {
        if !ident.on_stack {
            let value = args.get(i).copied().unwrap_or(Value::undefined());
            env.borrow_mut().set_heap_slot(ident.slot as usize, value);
        }
    }
    env
}

/// Execute instructions from `pc_start` until either the stream reaches
/// `pc_end`, or a `Return`/`Throw`/unresolved `JumpComplexCase` produces a
/// [`Completion`] other than falling off the end.
///
/// Plain `Jump`/`JumpIfTrue`/`JumpIfFalse` targets are allowed to land
/// anywhere in the whole instruction stream, not just inside
/// `[pc_start, pc_end)` — the bound only governs when this call returns to
/// its caller, never what a jump target is allowed to be (see DESIGN.md,
/// "try/catch body execution is flat, not recursive"). A jump that actually
/// lands outside the range (a `break`/`continue` inside a `finally` body
/// whose target is the enclosing loop, not anything in the `finally` itself)
/// hands off to [`run_unbounded`] rather than being mistaken for falling off
/// the end of the range normally.
fn exec_range(ctx: &mut Context, frame: &mut Frame, pc_start: u32, pc_end: u32) -> VmResult<Completion> {
    let mut pc = pc_start;
    loop {
        if pc >= pc_end {
            return Ok(Completion::FellOff);
        }
        let (instr, len) = crate::bytecode::decode_instr(&frame.block.code, pc as usize)
            .ok_or_else(|| VmError::InvalidInvariant(format!("bad instruction at pc {pc}")))?;
        let next_pc = pc + len as u32;

        match step(ctx, frame, pc, next_pc, &instr)? {
            Step::Continue(new_pc) if new_pc < pc_start || new_pc >= pc_end => {
                return run_unbounded(ctx, frame, new_pc);
            }
            Step::Continue(new_pc) => pc = new_pc,
            Step::Done(completion) => return Ok(completion),
        }
    }
}

enum Step {
    Continue(u32),
    Done(Completion),
}

/// A jump whose target is at or before the instruction that issued it is a
/// loop back-edge; check the embedder's interrupt flag there (SPEC_FULL.md
/// §4.3 "Safe points (ambient)"), since a loop that never calls anything
/// would otherwise never hit a safe point at all.
#[inline]
fn check_backedge(ctx: &Context, pc: u32, target: u32) -> VmResult<()> {
    if target <= pc {
        ctx.check_interrupt()
    } else {
        Ok(())
    }
}

/// Execute one instruction. Returns the next `pc` to resume at, or a
/// terminal [`Completion`] if this instruction ends the current
/// `exec_range` call (a `Return`, an uncaught-here `Throw`, or a
/// `JumpComplexCase` that this range cannot itself resolve).
fn step(ctx: &mut Context, frame: &mut Frame, pc: u32, next_pc: u32, instr: &Instr) -> VmResult<Step> {
    let base = frame.reg_base;
    macro_rules! get {
        ($r:expr) => {
            ctx.regs.get_reg(base, $r)?
        };
    }
    macro_rules! set {
        ($r:expr, $v:expr) => {
            ctx.regs.set_reg(base, $r, $v)?
        };
    }

    match *instr {
        Instr::LoadUndefined { dst } => set!(dst, Value::undefined()),
        Instr::LoadNull { dst } => set!(dst, Value::null()),
        Instr::LoadTrue { dst } => set!(dst, Value::bool(true)),
        Instr::LoadFalse { dst } => set!(dst, Value::bool(false)),
        Instr::LoadSmallInt { dst, imm } => set!(dst, Value::i32(imm)),
        Instr::LoadNumber { dst, pool } => {
            let n = frame.block.numeral_literals[pool as usize];
            set!(dst, Value::number(n));
        }
        Instr::LoadString { dst, pool } => {
            let sym = frame.block.string_literals[pool as usize];
            let s = ctx.atoms_or_program_str(frame.program, sym);
            set!(dst, ctx.heap.new_string(s));
        }
        Instr::Move { dst, src } => set!(dst, get!(src)),
        Instr::NewObject { dst } => set!(dst, ctx.heap.new_object()),
        Instr::NewArray { dst, first, count } => {
            let items = ctx.regs.get_slice(base, first, count as usize)?.to_vec();
            set!(dst, ctx.heap.new_array(items));
        }
        Instr::GetObjectPreComputedCase { dst, obj, name, cache } => {
            let name_sym = frame.block.string_literals[name as usize];
            let obj_val = get!(obj);
            let result = get_property_cached(ctx, frame, obj_val, name_sym, cache)?;
            set!(dst, result);
        }
        Instr::SetObjectPreComputedCase { obj, name, src, cache } => {
            let name_sym = frame.block.string_literals[name as usize];
            let obj_val = get!(obj);
            let value = get!(src);
            set_property_cached(ctx, frame, obj_val, name_sym, value, cache)?;
        }
        Instr::GetObjectComputed { dst, obj, key } => {
            let obj_val = get!(obj);
            let key_val = get!(key);
            let name_sym = to_property_key(ctx, frame.program, key_val);
            let result = get_property_dynamic(ctx, frame, obj_val, name_sym);
            set!(dst, result);
        }
        Instr::SetObjectComputed { obj, key, src } => {
            let obj_val = get!(obj);
            let key_val = get!(key);
            let name_sym = to_property_key(ctx, frame.program, key_val);
            let value = get!(src);
            if let Some(id) = obj_val.as_ptr() {
                ctx.heap.set_property(id, name_sym, value);
            }
        }
        Instr::GetGlobalVariable { dst, name, cache } => {
            let name_sym = frame.block.string_literals[name as usize];
            let obj_val = Value::ptr(ctx.global_object);
            let result = get_property_cached(ctx, frame, obj_val, name_sym, cache)?;
            set!(dst, result);
        }
        Instr::SetGlobalVariable { name, src, cache } => {
            let name_sym = frame.block.string_literals[name as usize];
            let value = get!(src);
            set_property_cached(ctx, frame, Value::ptr(ctx.global_object), name_sym, value, cache)?;
        }
        Instr::LoadLocalStack { dst, slot } => set!(dst, get!(slot)),
        Instr::StoreLocalStack { slot, src } => set!(slot, get!(src)),
        Instr::LoadLocalHeap { dst, slot } => {
            let v = frame.env.borrow().get_heap_slot(slot as usize);
            set!(dst, v);
        }
        Instr::StoreLocalHeap { slot, src } => {
            let v = get!(src);
            frame.env.borrow_mut().set_heap_slot(slot as usize, v);
        }
        Instr::LoadByName { dst, name } => {
            let name_sym = frame.block.string_literals[name as usize];
            let v = load_by_name(ctx, frame, name_sym)?;
            set!(dst, v);
        }
        Instr::StoreByName { name, src } => {
            let name_sym = frame.block.string_literals[name as usize];
            let v = get!(src);
            store_by_name(ctx, frame, name_sym, v)?;
        }
        Instr::Add { dst, a, b } => {
            let (av, bv) = (get!(a), get!(b));
            set!(dst, add_values(&mut ctx.heap, av, bv));
        }
        Instr::Sub { dst, a, b } => set!(dst, Value::number(get!(a).to_number() - get!(b).to_number())),
        Instr::Mul { dst, a, b } => set!(dst, Value::number(get!(a).to_number() * get!(b).to_number())),
        Instr::Div { dst, a, b } => set!(dst, Value::number(get!(a).to_number() / get!(b).to_number())),
        Instr::Mod { dst, a, b } => set!(dst, Value::number(get!(a).to_number() % get!(b).to_number())),
        Instr::Eq { dst, a, b } => {
            let r = ctx.heap.values_loose_eq(get!(a), get!(b));
            set!(dst, Value::bool(r));
        }
        Instr::NotEq { dst, a, b } => {
            let r = !ctx.heap.values_loose_eq(get!(a), get!(b));
            set!(dst, Value::bool(r));
        }
        Instr::StrictEq { dst, a, b } => {
            let r = ctx.heap.values_strict_eq(get!(a), get!(b));
            set!(dst, Value::bool(r));
        }
        Instr::StrictNotEq { dst, a, b } => {
            let r = !ctx.heap.values_strict_eq(get!(a), get!(b));
            set!(dst, Value::bool(r));
        }
        Instr::Lt { dst, a, b } => set!(dst, Value::bool(get!(a).to_number() < get!(b).to_number())),
        Instr::Gt { dst, a, b } => set!(dst, Value::bool(get!(a).to_number() > get!(b).to_number())),
        Instr::LtEq { dst, a, b } => set!(dst, Value::bool(get!(a).to_number() <= get!(b).to_number())),
        Instr::GtEq { dst, a, b } => set!(dst, Value::bool(get!(a).to_number() >= get!(b).to_number())),
        Instr::Neg { dst, a } => set!(dst, Value::number(-get!(a).to_number())),
        Instr::Not { dst, a } => {
            let v = get!(a).truthy(&ctx.heap);
            set!(dst, Value::bool(!v));
        }
        Instr::Typeof { dst, a } => {
            let v = get!(a);
            set!(dst, ctx.heap.new_string(type_of(&ctx.heap, v)));
        }
        Instr::Jump { target } => {
            check_backedge(ctx, pc, target)?;
            return Ok(Step::Continue(target));
        }
        Instr::JumpIfTrue { cond, target } => {
            if get!(cond).truthy(&ctx.heap) {
                check_backedge(ctx, pc, target)?;
                return Ok(Step::Continue(target));
            }
        }
        Instr::JumpIfFalse { cond, target } => {
            if !get!(cond).truthy(&ctx.heap) {
                check_backedge(ctx, pc, target)?;
                return Ok(Step::Continue(target));
            }
        }
        Instr::Call { dst, callee, first_arg, argc } => {
            let callee_val = get!(callee);
            let args = ctx.regs.get_slice(base, first_arg, argc as usize)?.to_vec();
            let result = call_value(ctx, frame.program, callee_val, Value::undefined(), &args)?;
            match result {
                Ok(v) => set!(dst, v),
                Err(thrown) => return do_throw(ctx, frame, thrown).map(Step::Done),
            }
        }
        Instr::CreateFunction { dst, child } => {
            let child_id = frame.program.code_blocks.get(frame.code_block_id).children[child as usize];
            let v = make_function_value(ctx, child_id, frame.env.clone());
            set!(dst, v);
        }
        Instr::CreateGenerator { dst, child } => {
            let child_id = frame.program.code_blocks.get(frame.code_block_id).children[child as usize];
            let v = make_function_value(ctx, child_id, frame.env.clone());
            set!(dst, v);
        }
        Instr::Return { src } => return Ok(Step::Done(Completion::Return(get!(src)))),
        Instr::TryOperation { catch, finally, end, catch_reg } => {
            ctx.check_interrupt()?;
            frame.handlers.push(HandlerFrame { catch, catch_reg, finally, end, in_catch: false });
            return run_try_body(ctx, frame, next_pc);
        }
        Instr::EndTry => {
            return run_end_try(ctx, frame);
        }
        Instr::Throw { src } => {
            let v = get!(src);
            return do_throw(ctx, frame, v).map(Step::Done);
        }
        Instr::JumpComplexCase { record } => {
            let record = match &frame.block.other_literals[record as usize] {
                OtherLiteral::ControlFlowRecord(r) => *r,
            };
            return resolve_unwind(ctx, frame, record).map(Step::Done);
        }
        Instr::ThrowStaticErrorOperation { message } => {
            let sym = frame.block.string_literals[message as usize];
            let s = ctx.atoms_or_program_str(frame.program, sym);
            let v = ctx.heap.new_string(s);
            return do_throw(ctx, frame, v).map(Step::Done);
        }
        Instr::CreateEnumerateObject { dst, obj } => {
            let obj_val = get!(obj);
            let v = ctx.heap.new_enumerator(obj_val.as_ptr());
            set!(dst, v);
        }
        Instr::CheckLastEnumerateKey { iter, target } => {
            let iter_val = get!(iter);
            let exhausted = match iter_val.as_ptr().map(|id| ctx.heap.get(id)) {
                Some(HeapObject::Enumerator(e)) => e.index >= e.keys.len(),
                _ => true,
            };
            if exhausted {
                return Ok(Step::Continue(target));
            }
        }
        Instr::GetEnumerateKey { dst, iter } => {
            let iter_val = get!(iter);
            let key = if let Some(id) = iter_val.as_ptr() {
                let next = match ctx.heap.get_mut(id) {
                    HeapObject::Enumerator(e) => {
                        let k = e.keys.get(e.index).copied();
                        e.index += 1;
                        k
                    }
                    _ => None,
                };
                match next {
                    Some(sym) => {
                        let s = ctx.atoms_or_program_str(frame.program, sym);
                        ctx.heap.new_string(s)
                    }
                    None => Value::undefined(),
                }
            } else {
                Value::undefined()
            };
            set!(dst, key);
        }
        Instr::GetIterator { dst, src } => {
            let src_val = get!(src);
            let v = ctx.heap.new_iterator(src_val.as_ptr());
            set!(dst, v);
        }
        Instr::IteratorStep { value_dst, done_dst, iter } => {
            let iter_val = get!(iter);
            let (value, done) = iterator_step(ctx, iter_val);
            set!(value_dst, value);
            set!(done_dst, Value::bool(done));
        }
        Instr::IteratorClose { iter } => {
            let iter_val = get!(iter);
            if let Some(id) = iter_val.as_ptr() {
                if let HeapObject::Iterator(state) = ctx.heap.get_mut(id) {
                    state.closed = true;
                }
            }
        }
        Instr::PushBlockEnv { .. } | Instr::PopBlockEnv => {
            // No-op: this crate's single flattened per-function Declarative
            // environment already gives every block's identifiers a unique
            // slot (see `vm/environment.rs`), so entering/leaving a lexical
            // block never needs to swap environment records.
        }
        Instr::PushWithEnv { target } => {
            let target_val = get!(target);
            if let Some(id) = target_val.as_ptr() {
                let new_env = EnvironmentRecord::object_env(id, Some(frame.env.clone()));
                frame.env = new_env;
                frame.with_depth += 1;
            }
        }
        Instr::PopWithEnv => {
            if frame.with_depth > 0 {
                let outer = frame.env.borrow().outer.clone();
                if let Some(outer) = outer {
                    frame.env = outer;
                }
                frame.with_depth -= 1;
            }
        }
        Instr::Yield { dst, value } => {
            let _ = dst;
            let v = get!(value);
            return Ok(Step::Done(Completion::Suspend(v, next_pc)));
        }
        Instr::ExecutionResume { dst } => {
            // The landing pad a suspended generator resumes at. A value
            // passed to `.next(v)` is not threaded back into the suspended
            // `yield` expression here (DESIGN.md's generator simplification
            // covers only the `.next()`-with-no-argument scenarios this
            // core's `.next()` intrinsic is built for), so `dst` reads as
            // `undefined` rather than from any sent argument.
            set!(dst, Value::undefined());
        }
    }
    Ok(Step::Continue(next_pc))
}

/// Execute a try body flat (no recursive `exec_range` bound — see
/// `exec_range`'s doc comment for why), stopping either at its own `EndTry`
/// (handled by [`run_end_try`]) or, if the body itself throws/returns/
/// breaks/continues, resolving via [`do_throw`]/[`resolve_unwind`] exactly
/// as if those had occurred directly in the enclosing range.
fn run_try_body(ctx: &mut Context, frame: &mut Frame, from: u32) -> VmResult<Step> {
    run_unbounded(ctx, frame, from).map(Step::Done)
}

/// Keep calling `step` (not through `exec_range`, which would impose an end
/// bound this range doesn't have) until a terminal completion occurs. Used
/// for try/catch bodies, which are entered via fallthrough or an explicit
/// jump and have no natural upper bound of their own, and as the landing
/// pad a bounded [`exec_range`] hands off to once a jump/resolved unwind
/// carries execution outside the range it was asked to stay within.
fn run_unbounded(ctx: &mut Context, frame: &mut Frame, from: u32) -> VmResult<Completion> {
    let mut pc = from;
    loop {
        let (instr, len) = crate::bytecode::decode_instr(&frame.block.code, pc as usize)
            .ok_or_else(|| VmError::InvalidInvariant(format!("bad instruction at pc {pc}")))?;
        let next_pc = pc + len as u32;
        match step(ctx, frame, pc, next_pc, &instr)? {
            Step::Continue(new_pc) => pc = new_pc,
            Step::Done(completion) => return Ok(completion),
        }
    }
}

/// `EndTry`: normal completion of a try body or a catch body. Runs this
/// handler's `finally` (if any) inline, pops the handler frame, then
/// resumes execution right after the whole `TryOperation`'s `end`.
fn run_end_try(ctx: &mut Context, frame: &mut Frame) -> VmResult<Step> {
    let handler = frame.handlers.pop().ok_or_else(|| {
        VmError::InvalidInvariant("EndTry with no matching TryOperation handler".to_string())
    })?;
    if handler.finally != handler.end {
        match run_finally(ctx, frame, handler.finally, handler.end)? {
            Completion::FellOff => {}
            other => return Ok(Step::Done(other)),
        }
    }
    Ok(Step::Continue(handler.end))
}

/// Run a `finally` block to completion, bounded by `end` (the position
/// right after the finally body) so that falling off normally can be told
/// apart from the finally itself throwing/returning/breaking/continuing —
/// see DESIGN.md, "Completion model". A jump that carries execution outside
/// `[finally_pc, end)` (the finally's own break/continue/return) is not
/// mistaken for falling off, since `exec_range` hands that case to
/// [`run_unbounded`] instead.
fn run_finally(ctx: &mut Context, frame: &mut Frame, finally_pc: u32, end: u32) -> VmResult<Completion> {
    exec_range(ctx, frame, finally_pc, end)
}

/// A value was thrown (directly, or bubbled up from a callee). Find the
/// innermost handler able to catch it: prefer its `catch` clause if this
/// handler isn't already running one, else run straight to its `finally`.
/// If no handler remains, the throw escapes this call entirely.
fn do_throw(ctx: &mut Context, frame: &mut Frame, value: Value) -> VmResult<Completion> {
    loop {
        let Some(mut handler) = frame.handlers.pop() else {
            return Ok(Completion::Throw(value));
        };
        if !handler.in_catch && handler.catch_reg != crate::bytecode::NO_CATCH_REG {
            ctx.regs.set_reg(frame.reg_base, handler.catch_reg, value)?;
            handler.in_catch = true;
            frame.handlers.push(handler);
            return run_unbounded(ctx, frame, handler.catch);
        }
        if handler.finally != handler.end {
            match run_finally(ctx, frame, handler.finally, handler.end)? {
                Completion::FellOff => continue,
                other => return Ok(other),
            }
        }
    }
}

/// Resolve a `break`/`continue`/`return` that the compiler determined
/// crosses exactly `record.unwind_envs` enclosing try handlers (SPEC_FULL.md
/// §9). Pops precisely that many handler frames — not the whole handler
/// stack, which may still have handlers further out that this particular
/// jump never reaches — running each popped handler's `finally` in turn. A
/// `finally` that itself completes abruptly (its own throw, or a further
/// break/continue/return) takes over and the original record is discarded,
/// matching normal completion-override semantics. Once every crossed
/// handler's `finally` has fallen off normally, resumes at `record.target`,
/// which may lie anywhere in the function (a loop exit, a `continue` point,
/// or this function's shared return epilogue).
fn resolve_unwind(ctx: &mut Context, frame: &mut Frame, record: ControlFlowRecord) -> VmResult<Completion> {
    let mut remaining = record.unwind_envs;
    while remaining > 0 {
        let handler = frame.handlers.pop().ok_or_else(|| {
            VmError::InvalidInvariant("control-flow record unwinds past the call's outermost handler".to_string())
        })?;
        remaining -= 1;
        if handler.finally != handler.end {
            match run_finally(ctx, frame, handler.finally, handler.end)? {
                Completion::FellOff => {}
                other => return Ok(other),
            }
        }
    }
    run_unbounded(ctx, frame, record.target)
}

impl Context {
    /// Resolve a compile-time string literal through `program`'s shared
    /// interning table (see `Program::strings`'s doc comment).
    fn atoms_or_program_str(&self, program: &Program, sym: AtomicString) -> String {
        program.strings.borrow().resolve(sym).to_string()
    }
}

/// Coerce a computed member key to a property name, interning it into
/// `program.strings` rather than `ctx.atoms` — property names set from a
/// literal (`GetObjectPreComputedCase`) are always interned there, so a
/// computed access has to land in the same table to ever compare equal
/// (see `Program::strings`'s doc comment).
fn to_property_key(ctx: &Context, program: &Program, key: Value) -> AtomicString {
    let s = ctx.heap.to_display_string(key);
    program.strings.borrow_mut().intern(&s)
}

/// Synthesize a generator's bound `.next` method, the one property every
/// `Generator` heap object answers without any backing `ObjectData`
/// (SPEC_FULL.md §4.3, "Generators").
fn generator_next_method(ctx: &mut Context, program: &Program, id: HeapId, name: AtomicString) -> Option<Value> {
    if program.strings.borrow().resolve(name) != "next" {
        return None;
    }
    let fo = FunctionObject {
        code_block: None,
        closure: None,
        name: None,
        native: Some(NativeIntrinsic::GeneratorNext(id)),
    };
    Some(Value::ptr(ctx.heap.allocate(HeapObject::Function(fo))))
}

/// `GetObjectComputed`'s property read: no inline cache (the key is only
/// known at run time), otherwise identical semantics to
/// [`get_property_cached`].
fn get_property_dynamic(ctx: &mut Context, frame: &Frame, obj: Value, name: AtomicString) -> Value {
    let Some(id) = obj.as_ptr() else {
        return Value::undefined();
    };
    if matches!(ctx.heap.get(id), HeapObject::Generator(_)) {
        return generator_next_method(ctx, frame.program, id, name).unwrap_or(Value::undefined());
    }
    ctx.heap.get_property(id, name).unwrap_or(Value::undefined())
}

/// Property read, with inline-cache bookkeeping (SPEC_FULL.md §4.3,
/// "Inline caches"). A `Generator` object's `.next` is synthesized here
/// (not stored as an ordinary property) since it needs a fresh
/// `FunctionObject` heap allocation bound to this specific generator.
fn get_property_cached(
    ctx: &mut Context,
    frame: &Frame,
    obj: Value,
    name: AtomicString,
    cache: u32,
) -> VmResult<Value> {
    let Some(id) = obj.as_ptr() else {
        return Ok(Value::undefined());
    };
    if matches!(ctx.heap.get(id), HeapObject::Generator(_)) {
        return Ok(generator_next_method(ctx, frame.program, id, name).unwrap_or(Value::undefined()));
    }

    let structure = ctx.heap.structure_id(id);
    if let Some(structure) = structure {
        let max_poly = ctx.options.ic_polymorphism_degree as usize;
        let mut caches = frame.block.property_caches.borrow_mut();
        let state = caches.entry(cache).or_default();
        use crate::bytecode::InlineCacheState;
        match state {
            InlineCacheState::Monomorphic { structure: s, .. } if *s == structure => {
                trace!(target: "ember_core::ic", "property cache {cache} hit (structure {structure})");
            }
            InlineCacheState::Empty => {
                trace!(target: "ember_core::ic", "property cache {cache} warming to structure {structure}");
                *state = InlineCacheState::Monomorphic { structure, slot: 0 };
            }
            InlineCacheState::Monomorphic { structure: s, .. } => {
                trace!(
                    target: "ember_core::ic",
                    "property cache {cache} transitioning to polymorphic: structure {s} -> {structure}"
                );
                *state = InlineCacheState::Polymorphic { entries: vec![(*s, 0), (structure, 0)] };
            }
            InlineCacheState::Polymorphic { entries } if entries.iter().any(|(s, _)| *s == structure) => {
                trace!(target: "ember_core::ic", "property cache {cache} polymorphic hit (structure {structure})");
            }
            InlineCacheState::Polymorphic { entries } if entries.len() < max_poly => {
                trace!(target: "ember_core::ic", "property cache {cache} polymorphic miss, adding structure {structure}");
                entries.push((structure, 0));
            }
            InlineCacheState::Polymorphic { .. } => {
                trace!(target: "ember_core::ic", "property cache {cache} megamorphic: structure {structure}");
                *state = InlineCacheState::Megamorphic;
            }
            InlineCacheState::Megamorphic => {}
        }
    }
    Ok(ctx.heap.get_property(id, name).unwrap_or(Value::undefined()))
}

/// Property write, with inline-cache bookkeeping. Uses the same
/// `property_caches` map and mono→poly→mega state machine as
/// [`get_property_cached`] — a `SetObjectPreComputedCase` site is a property
/// cache, not a global-variable one, so it must not share `global_caches`
/// (that map is keyed by global-variable name and would collide with an
/// unrelated `SetGlobalVariable` site reusing the same `cache` index).
fn set_property_cached(
    ctx: &mut Context,
    frame: &Frame,
    obj: Value,
    name: AtomicString,
    value: Value,
    cache: u32,
) -> VmResult<()> {
    let Some(id) = obj.as_ptr() else {
        return Ok(());
    };
    ctx.heap.set_property(id, name, value);
    if let Some(structure) = ctx.heap.structure_id(id) {
        let max_poly = ctx.options.ic_polymorphism_degree as usize;
        let mut caches = frame.block.property_caches.borrow_mut();
        let state = caches.entry(cache).or_default();
        use crate::bytecode::InlineCacheState;
        match state {
            InlineCacheState::Monomorphic { structure: s, .. } if *s == structure => {
                trace!(target: "ember_core::ic", "property cache {cache} hit (structure {structure})");
            }
            InlineCacheState::Empty => {
                trace!(target: "ember_core::ic", "property cache {cache} warming to structure {structure}");
                *state = InlineCacheState::Monomorphic { structure, slot: 0 };
            }
            InlineCacheState::Monomorphic { structure: s, .. } => {
                trace!(
                    target: "ember_core::ic",
                    "property cache {cache} transitioning to polymorphic: structure {s} -> {structure}"
                );
                *state = InlineCacheState::Polymorphic { entries: vec![(*s, 0), (structure, 0)] };
            }
            InlineCacheState::Polymorphic { entries } if entries.iter().any(|(s, _)| *s == structure) => {
                trace!(target: "ember_core::ic", "property cache {cache} polymorphic hit (structure {structure})");
            }
            InlineCacheState::Polymorphic { entries } if entries.len() < max_poly => {
                trace!(target: "ember_core::ic", "property cache {cache} polymorphic miss, adding structure {structure}");
                entries.push((structure, 0));
            }
            InlineCacheState::Polymorphic { .. } => {
                trace!(target: "ember_core::ic", "property cache {cache} megamorphic: structure {structure}");
                *state = InlineCacheState::Megamorphic;
            }
            InlineCacheState::Megamorphic => {}
        }
    }
    Ok(())
}

/// `LoadByName`'s slow path: walk the environment chain (SPEC_FULL.md
/// §4.3 "With / eval"). Reached whenever the owning CodeBlock couldn't
/// prove indexed storage was safe (`has_eval`/`has_with`, or a `with`
/// is active at this point even if the CodeBlock itself doesn't have
/// `has_with` set, e.g. a nested arrow referencing an outer `with`).
fn load_by_name(ctx: &mut Context, frame: &Frame, name: AtomicString) -> VmResult<Value> {
    match resolve_by_name(&frame.env, &ctx.heap, &frame.program.code_blocks, name) {
        Some(ResolvedName::Declarative(env, slot)) => Ok(env.borrow().get_heap_slot(slot)),
        Some(ResolvedName::Object(id)) => Ok(ctx.heap.get_property(id, name).unwrap_or(Value::undefined())),
        Some(ResolvedName::EvalVar(env)) => {
            let rec = env.borrow();
            match &rec.kind {
                EnvironmentKind::EvalVarScope { names } => Ok(names.get(&name).copied().unwrap_or(Value::undefined())),
                _ => Ok(Value::undefined()),
            }
        }
        None => Ok(Value::undefined()),
    }
}

fn store_by_name(ctx: &mut Context, frame: &Frame, name: AtomicString, value: Value) -> VmResult<()> {
    match resolve_by_name(&frame.env, &ctx.heap, &frame.program.code_blocks, name) {
        Some(ResolvedName::Declarative(env, slot)) => {
            env.borrow_mut().set_heap_slot(slot, value);
        }
        Some(ResolvedName::Object(id)) => ctx.heap.set_property(id, name, value),
        Some(ResolvedName::EvalVar(env)) => {
            if let EnvironmentKind::EvalVarScope { names } = &mut env.borrow_mut().kind {
                names.insert(name, value);
            }
        }
        None => ctx.heap.set_property(ctx.global_object, name, value),
    }
    Ok(())
}

fn add_values(heap: &mut Heap, a: Value, b: Value) -> Value {
    let a_is_str = matches!(a, Value::Ptr(id) if matches!(heap.get(id), HeapObject::Str(_)));
    let b_is_str = matches!(b, Value::Ptr(id) if matches!(heap.get(id), HeapObject::Str(_)));
    if a_is_str || b_is_str {
        let s = format!("{}{}", heap.to_display_string(a), heap.to_display_string(b));
        heap.new_string(s)
    } else {
        Value::number(a.to_number() + b.to_number())
    }
}

fn type_of(heap: &Heap, v: Value) -> &'static str {
    match v {
        Value::Undefined => "undefined",
        Value::Null => "object",
        Value::Bool(_) => "boolean",
        Value::Int(_) | Value::Number(_) => "number",
        Value::Ptr(id) => match heap.get(id) {
            HeapObject::Str(_) => "string",
            HeapObject::Function(_) => "function",
            _ => "object",
        },
    }
}

fn iterator_step(ctx: &mut Context, iter: Value) -> (Value, bool) {
    let Some(id) = iter.as_ptr() else { return (Value::undefined(), true) };
    let (source, index, closed) = match ctx.heap.get(id) {
        HeapObject::Iterator(state) => (state.source, state.index, state.closed),
        _ => return (Value::undefined(), true),
    };
    if closed {
        return (Value::undefined(), true);
    }
    let item = match source.map(|id| ctx.heap.get(id)) {
        Some(HeapObject::Array(items)) => items.get(index).copied(),
        _ => None,
    };
    match item {
        Some(v) => {
            if let HeapObject::Iterator(state) = ctx.heap.get_mut(id) {
                state.index += 1;
            }
            (v, false)
        }
        None => {
            if let HeapObject::Iterator(state) = ctx.heap.get_mut(id) {
                state.closed = true;
            }
            (Value::undefined(), true)
        }
    }
}

/// `CreateFunction`/`CreateGenerator`: allocate a heap `Function` object
/// bound to `child_id`'s CodeBlock and the defining call's environment
/// (SPEC_FULL.md §4.3, "Closures").
fn make_function_value(ctx: &mut Context, child_id: CodeBlockId, closure: EnvRef) -> Value {
    let fo = FunctionObject { code_block: Some(child_id), closure: Some(closure), name: None, native: None };
    Value::ptr(ctx.heap.allocate(HeapObject::Function(fo)))
}

/// Allocate (but do not start) a generator object (SPEC_FULL.md §4.3,
/// "Generators"). The generator body's own environment and register
/// window are created lazily on first `.next()`, matching
/// `GeneratorState::resume_pc == 0` meaning "never started".
fn instantiate_generator(
    ctx: &mut Context,
    code_block_id: CodeBlockId,
    closure: Option<EnvRef>,
    args: &[Value],
    this: Value,
) -> Value {
    let state = GeneratorState {
        code_block: code_block_id,
        closure,
        env: None,
        args: args.to_vec(),
        saved_registers: Vec::new(),
        resume_pc: 0,
        done: false,
        this_value: this,
    };
    Value::ptr(ctx.heap.allocate(HeapObject::Generator(RefCell::new(state))))
}

/// Resume a suspended generator one step (SPEC_FULL.md §4.3, "Generators").
/// On first call, creates the generator's environment and starts at PC 0
/// with fresh parameter bindings; on later calls, restores the saved
/// register window and resumes right after the `Yield` that suspended it
/// (the `ExecutionResume` marker instruction immediately following it).
/// Returns the standard `{ value, done }` iterator-result object on `Ok`;
/// an uncaught throw from inside the generator body propagates as `Err`,
/// matching an ordinary call.
fn resume_generator(ctx: &mut Context, program: &Program, generator: HeapId) -> VmResult<Result<Value, Value>> {
    ctx.check_interrupt()?;
    let HeapObject::Generator(cell) = ctx.heap.get(generator) else {
        return Err(VmError::InvalidInvariant("GeneratorNext target is not a generator".to_string()));
    };
    let (code_block_id, closure, args, this, resume_pc, saved_registers, env, already_done) = {
        let state = cell.borrow();
        (
            state.code_block,
            state.closure.clone(),
            state.args.clone(),
            state.this_value,
            state.resume_pc,
            state.saved_registers.clone(),
            state.env.clone(),
            state.done,
        )
    };
    if already_done {
        return Ok(Ok(iterator_result(ctx, program, Value::undefined(), true)));
    }

    let block = program.bytecode_for(code_block_id)?;
    let reg_base = ctx.regs.alloc_frame(block.required_register_file_size as usize)?;

    let env = match env {
        Some(env) => {
            for (i, v) in saved_registers.iter().enumerate() {
                ctx.regs.set_reg(reg_base, i as u16, *v)?;
            }
            env
        }
        None => {
            bind_parameters(ctx, program, code_block_id, reg_base, &args)?;
            let env = make_call_environment(ctx, program, code_block_id, closure, &args);
            let _ = this; // `this` binding is out of scope for this core (SPEC_FULL.md §1 Non-goals).
            if let HeapObject::Generator(cell) = ctx.heap.get(generator) {
                cell.borrow_mut().env = Some(env.clone());
            }
            env
        }
    };

    let mut frame =
        Frame { program, block, code_block_id, reg_base, env, handlers: Vec::new(), with_depth: 0 };
    let completion = exec_range(ctx, &mut frame, resume_pc, block.code.len() as u32)?;

    // The register window has to be snapshotted before `free_frame` moves
    // `top` back — past that point these slots are fair game for the next
    // call's frame.
    let snapshot = if matches!(completion, Completion::Suspend(..)) {
        Some(ctx.regs.get_slice(reg_base, 0, block.required_register_file_size as usize)?.to_vec())
    } else {
        None
    };
    ctx.regs.free_frame(reg_base);

    match completion {
        Completion::Suspend(value, next_pc) => {
            if let HeapObject::Generator(cell) = ctx.heap.get(generator) {
                let mut state = cell.borrow_mut();
                state.saved_registers = snapshot.expect("snapshot taken above for Suspend");
                state.resume_pc = next_pc;
            }
            Ok(Ok(iterator_result(ctx, program, value, false)))
        }
        Completion::Return(v) => {
            mark_generator_done(ctx, generator);
            Ok(Ok(iterator_result(ctx, program, v, true)))
        }
        Completion::FellOff => {
            mark_generator_done(ctx, generator);
            Ok(Ok(iterator_result(ctx, program, Value::undefined(), true)))
        }
        Completion::Throw(v) => {
            mark_generator_done(ctx, generator);
            Ok(Err(v))
        }
    }
}

fn mark_generator_done(ctx: &mut Context, generator: HeapId) {
    if let HeapObject::Generator(cell) = ctx.heap.get(generator) {
        cell.borrow_mut().done = true;
    }
}

/// Build a `{ value, done }` iterator-result object (generators' `.next`,
/// SPEC_FULL.md §4.3 "Generators"). `value`/`done` are interned into
/// `program.strings`, not `ctx.atoms`: a script's `.value`/`.done` property
/// reads compile to `GetObjectPreComputedCase` with a name symbol from
/// `program.strings`, and an `AtomicString` only compares equal to symbols
/// from the same table it was interned in (see `Program::strings`'s doc
/// comment) — interning here into `ctx.atoms` instead would make every such
/// read miss the cache and the property lookup both.
fn iterator_result(ctx: &mut Context, program: &Program, value: Value, done: bool) -> Value {
    let obj = ctx.heap.new_object();
    if let Some(id) = obj.as_ptr() {
        let (value_name, done_name) = {
            let mut strings = program.strings.borrow_mut();
            (strings.intern("value"), strings.intern("done"))
        };
        ctx.heap.set_property(id, value_name, value);
        ctx.heap.set_property(id, done_name, Value::bool(done));
    }
    obj
}

/// `Call`'s callee resolution: dispatch a user CodeBlock, a native
/// intrinsic (a generator's bound `.next`), or reject non-callables
/// (SPEC_FULL.md §4.3 "Call").
fn call_value(
    ctx: &mut Context,
    program: &Program,
    callee: Value,
    this: Value,
    args: &[Value],
) -> VmResult<Result<Value, Value>> {
    let Some(id) = callee.as_ptr() else {
        return Err(VmError::NotCallable);
    };
    let fo = match ctx.heap.get(id) {
        HeapObject::Function(fo) => fo.clone(),
        _ => return Err(VmError::NotCallable),
    };
    if let Some(NativeIntrinsic::GeneratorNext(gen_id)) = fo.native {
        return resume_generator(ctx, program, gen_id);
    }
    let code_block_id = fo.code_block.ok_or_else(|| {
        VmError::InvalidInvariant("function object has neither code_block nor native".to_string())
    })?;
    call_code_block(ctx, program, code_block_id, this, args, fo.closure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic_string::AtomicStringTable;
    use crate::bytecode::encode_instr;
    use crate::codeblock::{AccessRule, BlockInfo, BlockKind, CodeBlock, CodeBlockArena, Counts};
    use std::cell::RefCell as StdRefCell;

    fn single_block_program(instrs: &[Instr], reg_count: u32) -> Program {
        let mut arena = CodeBlockArena::default();
        let mut code = Vec::new();
        for i in instrs {
            encode_instr(i, &mut code);
        }
        let id = CodeBlockId(0);
        let cb = CodeBlock {
            id,
            source_start: 0,
            source_end: 0,
            parent: None,
            children: Vec::new(),
            function_name: None,
            parameter_names: Vec::new(),
            identifiers: Vec::new(),
            blocks: vec![BlockInfo {
                parent_block_index: crate::codeblock::NO_PARENT_BLOCK,
                kind: BlockKind::FunctionBody,
                identifiers: Vec::new(),
                env_required: false,
            }],
            counts: Counts::default(),
            flags: Default::default(),
            access: AccessRule::default(),
            byte_code_block: None,
            body: Vec::new(),
        };
        arena.push(cb);
        let mut block = ByteCodeBlock::new(id);
        block.code = code;
        block.required_register_file_size = reg_count;
        Program {
            code_blocks: arena,
            bytecode: vec![block],
            entry: id,
            strings: StdRefCell::new(AtomicStringTable::new()),
        }
    }

    #[test]
    fn runs_a_trivial_return() {
        let program = single_block_program(
            &[Instr::LoadSmallInt { dst: 0, imm: 41 }, Instr::Return { src: 0 }],
            1,
        );
        let mut ctx = Context::new();
        let result = call_code_block(&mut ctx, &program, program.entry, Value::undefined(), &[], None).unwrap();
        assert_eq!(result.unwrap().as_i32(), Some(41));
    }

    #[test]
    fn arithmetic_and_jump_work() {
        let program = single_block_program(
            &[
                Instr::LoadSmallInt { dst: 0, imm: 2 },
                Instr::LoadSmallInt { dst: 1, imm: 3 },
                Instr::Add { dst: 2, a: 0, b: 1 },
                Instr::Return { src: 2 },
            ],
            3,
        );
        let mut ctx = Context::new();
        let result = call_code_block(&mut ctx, &program, program.entry, Value::undefined(), &[], None).unwrap();
        assert_eq!(result.unwrap().to_number(), 5.0);
    }

    #[test]
    fn a_back_edge_observes_the_embedder_interrupt_flag() {
        use crate::vm::{ContextOptions, VmError};
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        // A single `Jump { target: 0 }` at pc 0 is its own back-edge. Calling
        // `step` directly (rather than `call_code_block`) isolates the
        // back-edge check from the function-entry check both guard against.
        let program = single_block_program(&[Instr::Jump { target: 0 }], 0);
        let block = program.bytecode_for(program.entry).unwrap();
        let env = environment::EnvironmentRecord::declarative(program.entry, 0, None);
        let mut frame =
            Frame { program: &program, block, code_block_id: program.entry, reg_base: 0, env, handlers: Vec::new(), with_depth: 0 };

        let flag = Arc::new(AtomicBool::new(false));
        let mut ctx = Context::with_options(ContextOptions { interrupt: Some(flag.clone()), ..Default::default() });

        let instr = Instr::Jump { target: 0 };
        assert!(matches!(step(&mut ctx, &mut frame, 0, 3, &instr), Ok(Step::Continue(0))));

        flag.store(true, Ordering::Relaxed);
        let result = step(&mut ctx, &mut frame, 0, 3, &instr);
        assert!(matches!(result, Err(VmError::Interrupted)));
    }
}
