//! Bytecode disassembler (SPEC_FULL.md's ambient-stack addition: the
//! teacher's `lib.rs` re-exports a `disassemble_function` the retrieval
//! pack didn't include the source of; this module gives it a body,
//! grounded on [`crate::bytecode::decode_instr`]/[`Instr`]'s `Debug` shape
//! rather than reimplementing per-opcode formatting by hand).

use serde::Serialize;

use crate::atomic_string::AtomicStringTable;
use crate::bytecode::ByteCodeBlock;

/// One decoded line of a disassembly: the byte offset an instruction
/// starts at and its rendered form.
#[derive(Debug, Clone, Serialize)]
pub struct DisasmLine {
    pub pc: u32,
    pub text: String,
}

/// One line per instruction in `block.code`, in the same order
/// [`ByteCodeBlock::iter_instrs`] (and thus the interpreter) walks it.
pub fn disassemble(block: &ByteCodeBlock) -> Vec<DisasmLine> {
    block
        .iter_instrs()
        .map(|(pc, instr)| DisasmLine { pc: pc as u32, text: format!("{instr:?}") })
        .collect()
}

/// Human-readable dump of one [`ByteCodeBlock`]: one `pc: Instr` line per
/// instruction, plus the register file size and literal pool sizes.
///
/// `disassemble_function` is the name the spec's `lib.rs` re-exports this
/// under (SPEC_FULL.md §9, "Front-end minimality" / DESIGN.md).
pub fn disassemble_function(block: &ByteCodeBlock, strings: &AtomicStringTable) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "; registers={} numerals={} strings={} others={}\n",
        block.required_register_file_size,
        block.numeral_literals.len(),
        block.string_literals.len(),
        block.other_literals.len(),
    ));
    for (i, atom) in block.string_literals.iter().enumerate() {
        out.push_str(&format!("; string[{i}] = {:?}\n", strings.resolve(*atom)));
    }
    for line in disassemble(block) {
        out.push_str(&format!("{:>6}: {}\n", line.pc, line.text));
    }
    out
}

/// Structured (JSON-serializable) form of a disassembly, for tooling that
/// wants to consume it rather than print it (mirrors the teacher's
/// `Diagnostic::to_json` side channel — see [`crate::diagnostics`]).
#[derive(Debug, Serialize)]
pub struct DisasmDump {
    pub required_register_file_size: u32,
    pub lines: Vec<DisasmLine>,
}

pub fn disassemble_json(block: &ByteCodeBlock) -> serde_json::Result<String> {
    let dump = DisasmDump {
        required_register_file_size: block.required_register_file_size,
        lines: disassemble(block),
    };
    serde_json::to_string_pretty(&dump)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::parser::Parser;

    fn compile_src(src: &str) -> crate::vm::Program {
        let module = Parser::new(src).unwrap().parse_module().unwrap();
        compile(&module).unwrap()
    }

    #[test]
    fn disassembles_a_simple_function_without_panicking() {
        let program = compile_src("function f(x){return x+1} f(41)");
        for block in &program.bytecode {
            let text = disassemble_function(block, &program.strings.borrow());
            assert!(text.contains("registers="));
        }
    }

    #[test]
    fn json_dump_is_valid_json() {
        let program = compile_src("var a = 1; var b = 2; a + b;");
        let block = &program.bytecode[program.entry.0 as usize];
        let json = disassemble_json(block).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["lines"].is_array());
    }
}
