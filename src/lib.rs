//! Ember core: the bytecode engine at the heart of a lightweight JavaScript
//! implementation (SPEC_FULL.md §1 "Purpose & scope").
//!
//! This crate covers the three subsystems that are tightly coupled through
//! a shared data model (`CodeBlock` + `ByteCodeBlock` + inline caches +
//! string table) and together constitute the hardest engineering in the
//! engine:
//!
//! - **Scope analysis & the `CodeBlock` tree** ([`codeblock`]): decides,
//!   for every function/block, where each identifier lives.
//! - **Bytecode compiler** ([`compiler`], [`bytecode`]): a register-
//!   allocating compiler from the AST to a linear bytecode stream.
//! - **Interpreter** ([`vm`]): the dispatch loop, inline caches, and
//!   control-flow/exception machinery.
//! - **Code cache** ([`cache`]): deterministic binary serialization of a
//!   compiled `Program`.
//!
//! A minimal front end ([`lexer`], [`parser`], [`ast`]) is included so the
//! core has something to consume end to end; the spec treats the real
//! lexer/parser as an external collaborator (SPEC_FULL.md §1), so this
//! front end only supports the subset of syntax the core's scenarios (and
//! tests) exercise.
//!
//! # Example
//!
//! ```rust
//! use ember_core::{parser::Parser, compiler, vm};
//!
//! let parser = Parser::new("function f(x) { return x + 1; } f(41)").unwrap();
//! let module = parser.parse_module().unwrap();
//! let program = compiler::compile(&module).unwrap();
//!
//! let mut ctx = vm::Context::new();
//! let result = vm::execute(&mut ctx, &program, vm::value::Value::undefined(), &[]).unwrap();
//! assert_eq!(result.unwrap().to_number(), 42.0);
//! ```

#![warn(rust_2018_idioms)]

/// Source spans shared by the lexer, parser, and diagnostics.
pub mod span;

/// The AST this crate's front end produces and its core subsystems consume.
pub mod ast;

/// Hand-written lexer for the front end's supported syntax subset.
pub mod lexer;

/// Recursive-descent parser producing [`ast::Module`].
pub mod parser;

/// Interned strings shared by scope analysis, the compiler, and the cache.
pub mod atomic_string;

/// Per-function/script/eval scope descriptor and the scope-analysis passes
/// that build it (SPEC_FULL.md §4.1).
pub mod codeblock;

/// The bytecode instruction format, opcode table, and verifier
/// (SPEC_FULL.md §2 components 3 and the bytecode verifier).
pub mod bytecode;

/// AST-to-bytecode compiler: register allocation, literal pools, inline-
/// cache site reservation, control-flow lowering (SPEC_FULL.md §4.2).
pub mod compiler;

/// The bytecode interpreter: dispatch loop, inline caches, exception/
/// finally unwinding, generators, with/eval (SPEC_FULL.md §4.3).
pub mod vm;

/// Deterministic binary code cache writer/reader (SPEC_FULL.md §4.4).
pub mod cache;

/// Crate-level error aggregate spanning every subsystem.
pub mod error;

/// Rendering compile-time errors with source context (SPEC_FULL.md's
/// ambient diagnostics requirement).
pub mod diagnostics;

/// Bytecode disassembler: human-readable and structured (JSON) dumps of a
/// compiled [`bytecode::ByteCodeBlock`].
pub mod disasm;

pub use ast::Module;
pub use atomic_string::{AtomicString, AtomicStringTable};
pub use bytecode::{ByteCodeBlock, Instr, Opcode};
pub use cache::{deserialize, deserialize_with_options, serialize, CacheError};
pub use codeblock::{CodeBlock, CodeBlockArena, CodeBlockId, ScopeError};
pub use compiler::{compile, CompileError};
pub use error::EngineError;
pub use lexer::{LexError, Lexer, Token};
pub use parser::{ParseError, Parser};
pub use span::Span;
pub use vm::{execute, Context, ContextOptions, Program, VmError, VmResult};
