//! Crate-level error aggregate.
//!
//! Each subsystem defines its own error enum (`ParseError`, `ScopeError`,
//! `CompileError`, `VerifyError`, `VmError`, `CacheError`); [`EngineError`]
//! is a convenience aggregate for callers that don't need to distinguish
//! which subsystem failed.

use thiserror::Error;

use crate::bytecode::verify::VerifyError;
use crate::cache::CacheError;
use crate::codeblock::ScopeError;
use crate::compiler::CompileError;
use crate::lexer::LexError;
use crate::parser::ParseError;
use crate::vm::VmError;

/// Aggregate error type spanning every subsystem.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Scope(#[from] ScopeError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}
