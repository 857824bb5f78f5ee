//! Lexical-environment record chain (SPEC_FULL.md §3 "LexicalEnvironment").
//!
//! Grounded on the parent-owns-child / child-holds-back-reference ownership
//! shape design note §9 applies equally here: each environment record owns
//! its outer link via `Rc`, mirroring how the teacher's `vm/object.rs`
//! `Class`/`VTable` chain walks a prototype parent without an owning cycle.

use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;

use crate::atomic_string::AtomicString;
use crate::codeblock::CodeBlockId;
use crate::vm::value::{HeapId, Value};

pub type EnvRef = Rc<RefCell<EnvironmentRecord>>;

/// The environment-record variants SPEC_FULL.md §3 names.
///
/// A simplification from the spec's nested block-environment model: since
/// [`crate::codeblock`]'s `finalize_counts` already flattens every heap
/// slot of a function (its own and every descendant block's `let`/`const`)
/// into ONE flat per-function counter, this crate keeps exactly one
/// `Declarative` environment per function activation rather than pushing a
/// fresh environment per lexical block. `PushBlockEnv`/`PopBlockEnv` still
/// exist in the instruction set (SPEC_FULL.md §4.2) but only reset the
/// affected stack slots, not swap environment records (see DESIGN.md).
#[derive(Debug)]
pub enum EnvironmentKind {
    /// A function frame's heap-allocated locals, indexed by the owning
    /// CodeBlock's heap slot numbers. `code_block` lets name-based lookup
    /// (`LoadByName`/`StoreByName`, used for closure captures crossing a
    /// function boundary) find the right slot without a second opcode.
    Declarative { code_block: CodeBlockId, slots: Vec<Value> },
    /// A `with` target: property lookups first query `target`, falling
    /// through to the outer environment on miss (SPEC_FULL.md §4.3
    /// "With / eval").
    Object { target: HeapId },
    /// The single per-context global object/environment.
    Global { object: HeapId },
    /// A synthesized slice of newly declared `var` names introduced by a
    /// non-strict direct `eval` (SPEC_FULL.md §4.3, "With / eval").
    EvalVarScope { names: FxHashMap<AtomicString, Value> },
}

#[derive(Debug)]
pub struct EnvironmentRecord {
    pub kind: EnvironmentKind,
    pub outer: Option<EnvRef>,
}

impl EnvironmentRecord {
    pub fn declarative(code_block: CodeBlockId, slot_count: usize, outer: Option<EnvRef>) -> EnvRef {
        Rc::new(RefCell::new(EnvironmentRecord {
            kind: EnvironmentKind::Declarative { code_block, slots: vec![Value::undefined(); slot_count] },
            outer,
        }))
    }

    pub fn object_env(target: HeapId, outer: Option<EnvRef>) -> EnvRef {
        Rc::new(RefCell::new(EnvironmentRecord { kind: EnvironmentKind::Object { target }, outer }))
    }

    pub fn global(object: HeapId) -> EnvRef {
        Rc::new(RefCell::new(EnvironmentRecord { kind: EnvironmentKind::Global { object }, outer: None }))
    }

    pub fn eval_var_scope(outer: Option<EnvRef>) -> EnvRef {
        Rc::new(RefCell::new(EnvironmentRecord {
            kind: EnvironmentKind::EvalVarScope { names: FxHashMap::default() },
            outer,
        }))
    }

    pub fn get_heap_slot(&self, slot: usize) -> Value {
        match &self.kind {
            EnvironmentKind::Declarative { slots, .. } => slots.get(slot).copied().unwrap_or(Value::undefined()),
            _ => Value::undefined(),
        }
    }

    pub fn set_heap_slot(&mut self, slot: usize, value: Value) {
        match &mut self.kind {
            EnvironmentKind::Declarative { slots, .. } => {
                if slot < slots.len() {
                    slots[slot] = value;
                }
            }
            _ => {}
        }
    }
}

/// Where a dynamically-resolved name (`LoadByName`/`StoreByName`) actually
/// lives, once [`resolve_by_name`] has walked the environment chain.
#[derive(Debug, Clone)]
pub enum ResolvedName {
    /// A `Declarative` frame's own heap slot (function-own var, or a
    /// captured variable from an enclosing function — this crate resolves
    /// both through the name-based slow path, see DESIGN.md).
    Declarative(EnvRef, usize),
    /// A `with` target object, or the global object.
    Object(HeapId),
    EvalVar(EnvRef),
}

/// Walk `env`'s chain outward: a `with` target or the global object first
/// if `name` is an own property there, then a `Declarative` frame's own
/// identifiers (function-level and flattened block-level, per
/// [`crate::codeblock`]'s single-environment-per-function model), then the
/// next outer environment. This is the "slow path" `LoadByName`/
/// `StoreByName` dispatch to whenever the owning CodeBlock has
/// `hasEval`/`hasWith`, or whenever an identifier is not local to the
/// current function (SPEC_FULL.md §4.3).
pub fn resolve_by_name(
    env: &EnvRef,
    heap: &crate::vm::value::Heap,
    arena: &crate::codeblock::CodeBlockArena,
    name: AtomicString,
) -> Option<ResolvedName> {
    let mut cur = env.clone();
    loop {
        let found = {
            let rec = cur.borrow();
            match &rec.kind {
                EnvironmentKind::Object { target } => {
                    heap.get_property(*target, name).map(|_| ResolvedName::Object(*target))
                }
                EnvironmentKind::Global { object } => {
                    heap.get_property(*object, name).map(|_| ResolvedName::Object(*object))
                }
                EnvironmentKind::EvalVarScope { names } => {
                    names.contains_key(&name).then(|| ResolvedName::EvalVar(cur.clone()))
                }
                EnvironmentKind::Declarative { code_block, .. } => {
                    let block = arena.get(*code_block);
                    block.find_identifier_anywhere(name).and_then(|(on_stack, slot)| {
                        if on_stack {
                            None
                        } else {
                            Some(ResolvedName::Declarative(cur.clone(), slot as usize))
                        }
                    })
                }
            }
        };
        if let Some(loc) = found {
            return Some(loc);
        }
        let outer = cur.borrow().outer.clone();
        match outer {
            Some(next) => cur = next,
            None => return None,
        }
    }
}
