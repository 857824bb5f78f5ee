//! Standalone bytecode verifier, run over a freshly compiled or just
//! deserialized [`super::ByteCodeBlock`] before the interpreter is allowed
//! to execute it (SPEC_FULL.md §4.2 "Verification", §8 "verifier rejects
//! malformed bytecode").
//!
//! Grounded in the teacher's `vm/interpreter/opcodes/exceptions.rs` style
//! of treating a malformed instruction stream as a recoverable error
//! rather than a panic — here hoisted into its own pre-execution pass so
//! the interpreter's dispatch loop never has to re-check these invariants.

use thiserror::Error;

use super::{decode_instr, Instr, Opcode};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("invalid opcode byte {0:#x} at offset {1}")]
    InvalidOpcode(u16, usize),
    #[error("instruction at offset {0} truncated (declared length exceeds code size)")]
    TruncatedInstruction(usize),
    #[error("jump at offset {0} targets {1}, which is not an instruction boundary")]
    InvalidJumpTarget(usize, u32),
    #[error("instruction at offset {0} references register {1}, outside the declared frame size {2}")]
    RegisterOutOfRange(usize, u32, u32),
    #[error("instruction at offset {0} references literal pool index {1}, outside pool size {2}")]
    InvalidConstantRef(usize, u32, u32),
    #[error("control falls off the end of the instruction stream")]
    FallOffEnd,
}

/// Verify every instruction in `block.code`:
/// - every opcode byte decodes to a known [`Opcode`] and is not truncated,
/// - every jump target lands exactly on an instruction boundary,
/// - every register operand is within `required_register_file_size`,
/// - every literal-pool index is within its pool's bounds,
/// - the stream does not fall off the end without a terminating
///   `Return`/`Throw`/unconditional `Jump`.
pub fn verify(block: &super::ByteCodeBlock) -> Result<(), VerifyError> {
    let code = &block.code;
    let reg_count = block.required_register_file_size;
    let numeral_count = block.numeral_literals.len() as u32;
    let string_count = block.string_literals.len() as u32;
    let other_count = block.other_literals.len() as u32;

    // First pass: collect every valid instruction boundary offset.
    let mut boundaries = Vec::new();
    let mut pc = 0usize;
    while pc < code.len() {
        let raw = if pc + 2 <= code.len() {
            u16::from_le_bytes([code[pc], code[pc + 1]])
        } else {
            return Err(VerifyError::TruncatedInstruction(pc));
        };
        let op = Opcode::from_u16(raw).ok_or(VerifyError::InvalidOpcode(raw, pc))?;
        let len = super::length_of(op) as usize;
        if pc + len > code.len() {
            return Err(VerifyError::TruncatedInstruction(pc));
        }
        boundaries.push(pc);
        pc += len;
    }
    if code.is_empty() {
        return Err(VerifyError::FallOffEnd);
    }

    let mut last_is_terminator = false;
    for &at in &boundaries {
        let (instr, _) = decode_instr(code, at).ok_or(VerifyError::TruncatedInstruction(at))?;
        last_is_terminator = matches!(instr, Instr::Return { .. } | Instr::Throw { .. } | Instr::Jump { .. });

        check_registers(&instr, at, reg_count)?;
        check_literals(&instr, at, numeral_count, string_count, other_count)?;
        check_jumps(&instr, at, &boundaries, code.len() as u32)?;
    }
    if !last_is_terminator {
        return Err(VerifyError::FallOffEnd);
    }
    Ok(())
}

fn boundary_ok(boundaries: &[usize], end: u32, target: u32) -> bool {
    target == end || boundaries.binary_search(&(target as usize)).is_ok()
}

fn check_jumps(instr: &Instr, at: usize, boundaries: &[usize], end: u32) -> Result<(), VerifyError> {
    let mut check = |target: u32| -> Result<(), VerifyError> {
        if boundary_ok(boundaries, end, target) {
            Ok(())
        } else {
            Err(VerifyError::InvalidJumpTarget(at, target))
        }
    };
    match *instr {
        Instr::Jump { target } | Instr::JumpIfTrue { target, .. } | Instr::JumpIfFalse { target, .. } => {
            check(target)
        }
        Instr::TryOperation { catch, finally, end: try_end, .. } => {
            check(catch)?;
            check(finally)?;
            check(try_end)
        }
        Instr::CheckLastEnumerateKey { target, .. } => check(target),
        _ => Ok(()),
    }
}

fn check_registers(instr: &Instr, at: usize, reg_count: u32) -> Result<(), VerifyError> {
    let mut check = |r: u16| -> Result<(), VerifyError> {
        if (r as u32) < reg_count {
            Ok(())
        } else {
            Err(VerifyError::RegisterOutOfRange(at, r as u32, reg_count))
        }
    };
    use Instr::*;
    match *instr {
        LoadUndefined { dst } | LoadNull { dst } | LoadTrue { dst } | LoadFalse { dst } => check(dst),
        LoadSmallInt { dst, .. } | LoadNumber { dst, .. } | LoadString { dst, .. } => check(dst),
        Move { dst, src } => {
            check(dst)?;
            check(src)
        }
        NewObject { dst } => check(dst),
        NewArray { dst, first, count } => {
            check(dst)?;
            if count > 0 {
                check(first)?;
                check(first + count - 1)?;
            }
            Ok(())
        }
        GetObjectPreComputedCase { dst, obj, .. } => {
            check(dst)?;
            check(obj)
        }
        SetObjectPreComputedCase { obj, src, .. } => {
            check(obj)?;
            check(src)
        }
        GetObjectComputed { dst, obj, key } => {
            check(dst)?;
            check(obj)?;
            check(key)
        }
        SetObjectComputed { obj, key, src } => {
            check(obj)?;
            check(key)?;
            check(src)
        }
        GetGlobalVariable { dst, .. } => check(dst),
        SetGlobalVariable { src, .. } => check(src),
        LoadLocalStack { dst, .. } | LoadLocalHeap { dst, .. } => check(dst),
        StoreLocalStack { src, .. } | StoreLocalHeap { src, .. } => check(src),
        LoadByName { dst, .. } => check(dst),
        StoreByName { src, .. } => check(src),
        Add { dst, a, b }
        | Sub { dst, a, b }
        | Mul { dst, a, b }
        | Div { dst, a, b }
        | Mod { dst, a, b }
        | Eq { dst, a, b }
        | NotEq { dst, a, b }
        | StrictEq { dst, a, b }
        | StrictNotEq { dst, a, b }
        | Lt { dst, a, b }
        | Gt { dst, a, b }
        | LtEq { dst, a, b }
        | GtEq { dst, a, b } => {
            check(dst)?;
            check(a)?;
            check(b)
        }
        Neg { dst, a } | Not { dst, a } | Typeof { dst, a } => {
            check(dst)?;
            check(a)
        }
        Jump { .. } => Ok(()),
        JumpIfTrue { cond, .. } | JumpIfFalse { cond, .. } => check(cond),
        Call { dst, callee, first_arg, argc } => {
            check(dst)?;
            check(callee)?;
            if argc > 0 {
                check(first_arg)?;
                check(first_arg + argc - 1)?;
            }
            Ok(())
        }
        CreateFunction { dst, .. } | CreateGenerator { dst, .. } => check(dst),
        Return { src } | Throw { src } => check(src),
        TryOperation { catch_reg, .. } => {
            if catch_reg == crate::bytecode::NO_CATCH_REG {
                Ok(())
            } else {
                check(catch_reg)
            }
        }
        EndTry => Ok(()),
        JumpComplexCase { .. } | ThrowStaticErrorOperation { .. } => Ok(()),
        CreateEnumerateObject { dst, obj } => {
            check(dst)?;
            check(obj)
        }
        CheckLastEnumerateKey { iter, .. } => check(iter),
        GetEnumerateKey { dst, iter } => {
            check(dst)?;
            check(iter)
        }
        GetIterator { dst, src } => {
            check(dst)?;
            check(src)
        }
        IteratorStep { value_dst, done_dst, iter } => {
            check(value_dst)?;
            check(done_dst)?;
            check(iter)
        }
        IteratorClose { iter } => check(iter),
        PushBlockEnv { .. } | PopBlockEnv => Ok(()),
        PushWithEnv { target } => check(target),
        PopWithEnv => Ok(()),
        Yield { dst, value } => {
            check(dst)?;
            check(value)
        }
        ExecutionResume { dst } => check(dst),
    }
}

fn check_literals(
    instr: &Instr,
    at: usize,
    numeral_count: u32,
    string_count: u32,
    other_count: u32,
) -> Result<(), VerifyError> {
    let check_num = |idx: u32| -> Result<(), VerifyError> {
        if idx < numeral_count {
            Ok(())
        } else {
            Err(VerifyError::InvalidConstantRef(at, idx, numeral_count))
        }
    };
    let check_str = |idx: u32| -> Result<(), VerifyError> {
        if idx < string_count {
            Ok(())
        } else {
            Err(VerifyError::InvalidConstantRef(at, idx, string_count))
        }
    };
    let check_other = |idx: u32| -> Result<(), VerifyError> {
        if idx < other_count {
            Ok(())
        } else {
            Err(VerifyError::InvalidConstantRef(at, idx, other_count))
        }
    };
    match *instr {
        Instr::LoadNumber { pool, .. } => check_num(pool),
        Instr::LoadString { pool, .. } => check_str(pool),
        Instr::GetObjectPreComputedCase { name, .. } | Instr::SetObjectPreComputedCase { name, .. } => {
            check_str(name)
        }
        Instr::GetGlobalVariable { name, .. } | Instr::SetGlobalVariable { name, .. } => check_str(name),
        Instr::LoadByName { name, .. } | Instr::StoreByName { name, .. } => check_str(name),
        Instr::JumpComplexCase { record } => check_other(record),
        Instr::ThrowStaticErrorOperation { message } => check_str(message),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{encode_instr, ByteCodeBlock};
    use crate::codeblock::CodeBlockId;

    fn block_from(instrs: &[Instr], reg_count: u32) -> ByteCodeBlock {
        let mut b = ByteCodeBlock::new(CodeBlockId(0));
        for i in instrs {
            encode_instr(i, &mut b.code);
        }
        b.required_register_file_size = reg_count;
        b
    }

    #[test]
    fn accepts_a_trivial_return() {
        let b = block_from(&[Instr::LoadUndefined { dst: 0 }, Instr::Return { src: 0 }], 1);
        assert!(verify(&b).is_ok());
    }

    #[test]
    fn rejects_corrupted_opcode() {
        let mut b = block_from(&[Instr::Return { src: 0 }], 1);
        b.code[0] = 0xff;
        b.code[1] = 0xff;
        assert!(matches!(verify(&b), Err(VerifyError::InvalidOpcode(_, 0))));
    }

    #[test]
    fn rejects_jump_into_instruction_middle() {
        let b = block_from(&[Instr::Jump { target: 1 }], 0);
        assert!(matches!(verify(&b), Err(VerifyError::InvalidJumpTarget(_, 1))));
    }

    #[test]
    fn rejects_out_of_range_register() {
        let b = block_from(&[Instr::Return { src: 5 }], 1);
        assert!(matches!(verify(&b), Err(VerifyError::RegisterOutOfRange(_, 5, 1))));
    }

    #[test]
    fn rejects_fall_off_end() {
        let b = block_from(&[Instr::LoadUndefined { dst: 0 }], 1);
        assert!(matches!(verify(&b), Err(VerifyError::FallOffEnd)));
    }
}
