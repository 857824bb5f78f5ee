//! The bytecode interpreter (SPEC_FULL.md §4.3 "Bytecode interpreter").
//!
//! Grounded on the teacher's `vm/register_file.rs` (ported close to
//! verbatim as [`register_file::RegisterFile`]) and
//! `vm/interpreter/opcodes/exceptions.rs` (the push/pop exception-handler
//! stack idiom, generalized away from its raw-pointer GC-lock machinery).
//! Cache-hit/miss and inline-cache transitions are traced with `log`,
//! grounded on the ambient-stack addition recorded in DESIGN.md.

pub mod environment;
pub mod interpreter;
pub mod register_file;
pub mod value;

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::atomic_string::AtomicStringTable;
use crate::bytecode::ByteCodeBlock;
use crate::codeblock::{CodeBlockArena, CodeBlockId};
use environment::EnvRef;
use register_file::RegisterFile;
use value::{Heap, Value};

/// Runtime (non-recoverable, non-thrown) failures of the interpreter
/// (SPEC_FULL.md §7 "Error handling").
#[derive(Debug, Error)]
pub enum VmError {
    #[error("register file overflow: call stack too deep")]
    StackOverflow,
    #[error("internal invariant violated: {0}")]
    InvalidInvariant(String),
    #[error("bytecode for code block {0:?} is missing from the program")]
    MissingByteCode(CodeBlockId),
    #[error("value is not callable")]
    NotCallable,
    #[error("bytecode verification failed: {0}")]
    Verify(#[from] crate::bytecode::verify::VerifyError),
    /// A host-initiated abort raised at a safe point (function entry, loop
    /// back-edge, try-entry) because the embedder set
    /// [`ContextOptions::interrupt`] (SPEC_FULL.md §4.3 "Safe points
    /// (ambient)"). Not part of the user-level exception protocol — this
    /// never reaches a script's own `catch`, the same way the teacher's
    /// `VmError::TaskPreempted`/`Suspended` signaling kinds are
    /// interpreter-internal rather than user-observable throws.
    #[error("execution interrupted by the embedder")]
    Interrupted,
}

pub type VmResult<T> = Result<T, VmError>;

/// The compiled, immutable artifact the compiler produces and the
/// interpreter executes (SPEC_FULL.md §3 "Program"). Distinct from
/// [`Context`]'s mutable runtime state so the same compiled program can be
/// re-executed, or written to / read from the code cache, independently of
/// any one run's heap.
#[derive(Debug)]
pub struct Program {
    pub code_blocks: CodeBlockArena,
    pub bytecode: Vec<ByteCodeBlock>,
    pub entry: CodeBlockId,
    /// The interning table every `AtomicString` in `code_blocks` and
    /// `bytecode` (identifier names, string literals, property names) was
    /// produced from. Kept with the program rather than the per-execution
    /// [`Context`] so two unrelated runs of the same compiled program never
    /// need to agree on interning order (SPEC_FULL.md §5, "context-scoped
    /// string table" — read here as "scoped to the compilation that
    /// produced these atoms", since [`Context::atoms`] is for strings a
    /// running program interns dynamically, not for resolving its own
    /// literal pool).
    ///
    /// Wrapped for interior mutability: computed member access
    /// (`obj[expr]`) and natively synthesized property names (an
    /// iterator-result object's `value`/`done`) intern into this same
    /// table so their `AtomicString` keys compare equal to ones produced
    /// at compile time, but the interpreter only ever holds a shared
    /// `&Program` (the same tension `ByteCodeBlock::property_caches`
    /// resolves with `RefCell`).
    pub strings: RefCell<AtomicStringTable>,
}

impl Program {
    pub fn bytecode_for(&self, id: CodeBlockId) -> VmResult<&ByteCodeBlock> {
        self.bytecode.get(id.0 as usize).ok_or(VmError::MissingByteCode(id))
    }
}

/// Embedder-facing tuning knobs a [`Context`] is constructed with
/// (SPEC_FULL.md §6 "Embedder-facing configuration (ambient)"), grounded on
/// the teacher's `VmOptions`/`VmContext::with_options` split
/// (`raya-core::vm::context`): a `Context` built with [`Context::new`] gets
/// the defaults below, while an embedder that cares about register-file
/// sizing, inline-cache behavior, or cooperative cancellation builds one
/// with [`Context::with_options`] instead.
pub struct ContextOptions {
    /// Upper bound on the shared register file, in `Value` slots
    /// (SPEC_FULL.md §3 "Register file"). Exceeding it surfaces as
    /// [`VmError::StackOverflow`] rather than an unbounded native stack.
    pub register_file_max_size: usize,
    /// How many distinct structures a property/global inline cache may
    /// track before degrading to [`crate::bytecode::InlineCacheState::Megamorphic`]
    /// (SPEC_FULL.md §4.3 "Inline caches"). Clamped to `1..=4`: the cache
    /// encoding only ever stores up to 4 polymorphic entries.
    pub ic_polymorphism_degree: u8,
    /// Whether [`crate::cache::deserialize`] runs
    /// [`crate::bytecode::verify::verify`] on every code block it loads.
    /// Disabling this is only safe for cache bytes the embedder already
    /// trusts (e.g. ones it wrote itself in the same process).
    pub verify_on_cache_load: bool,
    /// A flag the embedder can set from another thread to abort execution
    /// at the next safe point (SPEC_FULL.md §4.3 "Safe points (ambient)",
    /// §5 "Cancellation & timeouts"). `None` means interruption is
    /// unsupported for this context — safe points become no-ops.
    pub interrupt: Option<Arc<AtomicBool>>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        ContextOptions {
            register_file_max_size: register_file::DEFAULT_MAX_SIZE,
            ic_polymorphism_degree: 4,
            verify_on_cache_load: true,
            interrupt: None,
        }
    }
}

/// All mutable per-execution state: interned strings, the tracked heap, the
/// register file shared across nested calls, and the global environment.
/// Grounded on the teacher's per-`Task` execution context
/// (`vm/interpreter/reg_execution.rs`), simplified to this crate's
/// single-threaded cooperative model (SPEC_FULL.md §5).
pub struct Context {
    pub atoms: AtomicStringTable,
    pub heap: Heap,
    pub global_env: EnvRef,
    pub global_object: value::HeapId,
    pub regs: RegisterFile,
    pub options: ContextOptions,
}

impl Context {
    pub fn new() -> Self {
        Self::with_options(ContextOptions::default())
    }

    /// Build a `Context` with embedder-chosen tuning
    /// ([`ContextOptions`]), grounded on the teacher's
    /// `VmContext::with_options` (`raya-core::vm::context`).
    pub fn with_options(mut options: ContextOptions) -> Self {
        options.ic_polymorphism_degree = options.ic_polymorphism_degree.clamp(1, 4);
        let mut heap = Heap::new();
        let global_object = heap.new_object().as_ptr().expect("new_object always returns a Ptr");
        let global_env = environment::EnvironmentRecord::global(global_object);
        let regs = RegisterFile::with_max_size(options.register_file_max_size);
        Context { atoms: AtomicStringTable::new(), heap, global_env, global_object, regs, options }
    }

    /// `true` once the embedder has requested an interrupt via
    /// [`ContextOptions::interrupt`]; checked at safe points (function
    /// entry, loop back-edge, try-entry) by `vm::interpreter`.
    #[inline]
    pub fn is_interrupted(&self) -> bool {
        self.options.interrupt.as_ref().is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Return [`VmError::Interrupted`] if the embedder has requested an
    /// interrupt, otherwise `Ok(())`. Called at every safe point.
    #[inline]
    pub fn check_interrupt(&self) -> VmResult<()> {
        if self.is_interrupted() {
            Err(VmError::Interrupted)
        } else {
            Ok(())
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `program`'s entry code block to completion (SPEC_FULL.md §6,
/// "execute"). `Ok` carries the script's completion value; `Err` carries an
/// uncaught thrown [`Value`] (a user-level exception, not a [`VmError`]).
///
/// Fatal interpreter failures ([`VmError`]) are distinguished from thrown
/// values by the outer `Result` layer the caller composes with
/// [`crate::error::EngineError`]; this function itself can only fail with a
/// thrown `Value` once bytecode has passed [`crate::bytecode::verify::verify`].
pub fn execute(ctx: &mut Context, program: &Program, this: Value, args: &[Value]) -> VmResult<Result<Value, Value>> {
    interpreter::call_code_block(ctx, program, program.entry, this, args, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_starts_with_an_empty_global_object() {
        let ctx = Context::new();
        assert_eq!(ctx.heap.structure_id(ctx.global_object), Some(value::EMPTY_STRUCTURE_ID));
    }

    #[test]
    fn with_options_clamps_ic_polymorphism_degree_to_four() {
        let ctx = Context::with_options(ContextOptions { ic_polymorphism_degree: 200, ..Default::default() });
        assert_eq!(ctx.options.ic_polymorphism_degree, 4);
    }

    #[test]
    fn interrupt_flag_is_observed_through_check_interrupt() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;

        let flag = Arc::new(AtomicBool::new(false));
        let ctx = Context::with_options(ContextOptions { interrupt: Some(flag.clone()), ..Default::default() });
        assert!(ctx.check_interrupt().is_ok());
        flag.store(true, Ordering::Relaxed);
        assert!(matches!(ctx.check_interrupt(), Err(VmError::Interrupted)));
    }
}
