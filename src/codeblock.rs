//! CodeBlock tree construction: the scope/variable-layout analyzer.
//!
//! See SPEC_FULL.md §3 ("CodeBlock") and §4.1 ("Scope analysis"). Grounded
//! on the scope-tree shape of `src/parser/checker/symbols.rs` (push/pop
//! scope, parent-chain resolution) from the teacher, generalized here to
//! the CodeBlock-per-function tree the spec describes rather than a flat
//! scope stack, and modeled as an arena per design note §9.

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::ast::{self, Expr, FunctionDecl, Statement};
use crate::atomic_string::{AtomicString, AtomicStringTable};
use crate::span::Span;

/// Sentinel for "no parent block" (the root block of a CodeBlock).
pub const NO_PARENT_BLOCK: u32 = u32::MAX;

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("scope tree is inconsistent: {0}")]
    Inconsistent(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeBlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    FunctionBody,
    Block,
    Try,
    Catch,
}

/// A function-scoped (`var`) or parameter identifier.
#[derive(Debug, Clone)]
pub struct IdentifierInfo {
    pub name: AtomicString,
    pub mutable: bool,
    pub on_stack: bool,
    pub slot: u32,
    pub is_parameter: bool,
    pub is_var: bool,
    pub captured: bool,
}

/// A `let`/`const`-style block-scoped identifier, owned by a [`BlockInfo`].
#[derive(Debug, Clone)]
pub struct BlockIdentifierInfo {
    pub name: AtomicString,
    pub mutable: bool,
    pub on_stack: bool,
    pub slot: u32,
    pub captured: bool,
}

#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub parent_block_index: u32,
    pub kind: BlockKind,
    pub identifiers: Vec<BlockIdentifierInfo>,
    pub env_required: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CodeBlockFlags {
    pub strict: bool,
    pub has_eval: bool,
    pub has_with: bool,
    pub is_generator: bool,
    pub is_async: bool,
    pub is_arrow: bool,
    pub has_arguments_object: bool,
    pub is_eval_code: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Counts {
    pub identifier_on_stack_count: u32,
    pub identifier_on_heap_count: u32,
    pub max_stack_block_depth: u32,
    pub function_length: u32,
    pub parameter_count: u32,
}

/// Derived placement facts from the variable-access rule table
/// (SPEC_FULL.md §4.1).
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessRule {
    pub can_use_indexed_variable_storage: bool,
    pub can_allocate_variables_on_stack: bool,
    pub can_allocate_environment_on_stack: bool,
}

#[derive(Debug, Clone)]
pub struct CodeBlock {
    pub id: CodeBlockId,
    pub source_start: u32,
    pub source_end: u32,
    pub parent: Option<CodeBlockId>,
    pub children: Vec<CodeBlockId>,
    pub function_name: Option<AtomicString>,
    pub parameter_names: Vec<AtomicString>,
    pub identifiers: Vec<IdentifierInfo>,
    pub blocks: Vec<BlockInfo>,
    pub counts: Counts,
    pub flags: CodeBlockFlags,
    pub access: AccessRule,
    pub byte_code_block: Option<crate::bytecode::ByteCodeBlock>,
    /// The function/script body this block was built from. Kept (rather
    /// than discarded once scope analysis finishes) so the bytecode
    /// compiler can re-walk the same statements without the front end
    /// having to hand the AST back in a second pass (SPEC_FULL.md §4.2's
    /// "Contract" assumes a CodeBlock is enough to compile from).
    pub body: Vec<Statement>,
}

impl CodeBlock {
    /// Index of an identifier by name, function-scoped (`var`/parameter) only.
    pub fn find_identifier(&self, name: AtomicString) -> Option<usize> {
        self.identifiers.iter().position(|i| i.name == name)
    }

    /// Find `name` anywhere in this CodeBlock's flat slot space: its own
    /// function-level identifiers first, then every nested block's
    /// `let`/`const` identifiers (checked in declaration order, matching
    /// [`Builder::mark_captured_if_local`]'s search order). Returns
    /// `(on_stack, slot)`. Used by the dynamic name-lookup path to find a
    /// captured or `var`-hoisted identifier without knowing which lexical
    /// block was active at the call site that closed over it.
    pub fn find_identifier_anywhere(&self, name: AtomicString) -> Option<(bool, u32)> {
        if let Some(i) = self.identifiers.iter().find(|i| i.name == name) {
            return Some((i.on_stack, i.slot));
        }
        for b in &self.blocks {
            if let Some(i) = b.identifiers.iter().find(|i| i.name == name) {
                return Some((i.on_stack, i.slot));
            }
        }
        None
    }
}

/// Owns every CodeBlock produced for one compilation unit.
///
/// Parent-owns-child is realized here as "every CodeBlock lives in one
/// arena Vec and is never moved"; a child only ever stores its parent's
/// [`CodeBlockId`] as a non-owning back-reference (design note §9).
#[derive(Debug, Default)]
pub struct CodeBlockArena {
    blocks: Vec<CodeBlock>,
}

impl CodeBlockArena {
    pub fn get(&self, id: CodeBlockId) -> &CodeBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: CodeBlockId) -> &mut CodeBlock {
        &mut self.blocks[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CodeBlock> {
        self.blocks.iter()
    }

    pub(crate) fn push(&mut self, block: CodeBlock) -> CodeBlockId {
        let id = CodeBlockId(self.blocks.len() as u32);
        self.blocks.push(block);
        id
    }

    /// Validate the §3 CodeBlock invariants across the whole arena.
    pub fn validate(&self) -> Result<(), ScopeError> {
        for block in &self.blocks {
            for ident in &block.identifiers {
                if ident.on_stack && ident.slot >= block.counts.identifier_on_stack_count {
                    return Err(ScopeError::Inconsistent("stack identifier slot out of bounds"));
                }
            }
            if block.access.can_allocate_variables_on_stack {
                for &child in &block.children {
                    let child = self.get(child);
                    if child.flags.has_eval || child.flags.has_with {
                        return Err(ScopeError::Inconsistent(
                            "canAllocateVariablesOnStack but a descendant has eval/with",
                        ));
                    }
                }
            }
            let mut prev_start = 0u32;
            for &child_id in &block.children {
                let child = self.get(child_id);
                if child.source_start < prev_start {
                    return Err(ScopeError::Inconsistent("children not ordered by source start"));
                }
                prev_start = child.source_start;
            }
            for (i, b) in block.blocks.iter().enumerate() {
                if b.parent_block_index != NO_PARENT_BLOCK && b.parent_block_index as usize >= i {
                    return Err(ScopeError::Inconsistent("blockInfo parent must precede it"));
                }
            }
        }
        Ok(())
    }
}

/// A free (unresolved-within-this-function) identifier reference collected
/// while walking a function body, bubbled up to find which ancestor
/// function actually declares it (closure capture detection).
struct RawFunction {
    name: Option<String>,
    params: Vec<String>,
    is_generator: bool,
    body: Vec<Statement>,
    span: Span,
}

struct Builder<'a> {
    arena: CodeBlockArena,
    strings: &'a mut AtomicStringTable,
}

impl<'a> Builder<'a> {
    fn new(strings: &'a mut AtomicStringTable) -> Self {
        Self { arena: CodeBlockArena::default(), strings }
    }

    /// Build one CodeBlock (and recursively its function children) for a
    /// function body or the top-level script, then run capture resolution
    /// so heap-vs-stack placement can be finalized.
    fn build_function(
        &mut self,
        parent: Option<CodeBlockId>,
        source_start: u32,
        source_end: u32,
        func: RawFunction,
    ) -> (CodeBlockId, FxHashSet<String>) {
        let id = CodeBlockId(self.arena.len() as u32);
        let mut block = CodeBlock {
            id,
            source_start,
            source_end,
            parent,
            children: Vec::new(),
            function_name: func.name.as_deref().map(|n| self.strings.intern(n)),
            parameter_names: func.params.iter().map(|p| self.strings.intern(p)).collect(),
            identifiers: Vec::new(),
            blocks: vec![BlockInfo {
                parent_block_index: NO_PARENT_BLOCK,
                kind: BlockKind::FunctionBody,
                identifiers: Vec::new(),
                env_required: false,
            }],
            counts: Counts {
                parameter_count: func.params.len() as u32,
                function_length: func.params.len() as u32,
                ..Default::default()
            },
            flags: CodeBlockFlags {
                is_generator: func.is_generator,
                ..Default::default()
            },
            access: AccessRule::default(),
            byte_code_block: None,
            body: func.body.clone(),
        };

        for p in &func.params {
            block.identifiers.push(IdentifierInfo {
                name: self.strings.intern(p),
                mutable: true,
                on_stack: true,
                slot: 0,
                is_parameter: true,
                is_var: false,
                captured: false,
            });
        }

        self.arena.push(block);

        let mut ctx = FunctionCtx {
            code_block: id,
            current_block: 0,
            free_names: FxHashSet::default(),
            declared_here: self.arena.get(id).parameter_names.len(),
        };
        let mut declared: FxHashSet<String> = func.params.iter().cloned().collect();
        for stmt in &func.body {
            self.hoist_vars(id, stmt, &mut declared);
        }
        for stmt in &func.body {
            self.walk_statement(&mut ctx, stmt);
        }

        self.finalize_counts(id);
        (id, std::mem::take(&mut ctx.free_names))
    }

    /// Hoist every `var` (including nested in non-function blocks) and
    /// every function declaration to the function-level identifier list.
    fn hoist_vars(&mut self, owner: CodeBlockId, stmt: &Statement, declared: &mut FxHashSet<String>) {
        match stmt {
            Statement::VarDecl { kind: ast::VarKind::Var, name, .. } => {
                if declared.insert(name.name.clone()) {
                    let sym = self.strings.intern(&name.name);
                    self.arena.get_mut(owner).identifiers.push(IdentifierInfo {
                        name: sym,
                        mutable: true,
                        on_stack: true,
                        slot: 0,
                        is_parameter: false,
                        is_var: true,
                        captured: false,
                    });
                }
            }
            Statement::FunctionDecl(f) => {
                if let Some(name) = &f.name {
                    if declared.insert(name.name.clone()) {
                        let sym = self.strings.intern(&name.name);
                        self.arena.get_mut(owner).identifiers.push(IdentifierInfo {
                            name: sym,
                            mutable: true,
                            on_stack: true,
                            slot: 0,
                            is_parameter: false,
                            is_var: true,
                            captured: false,
                        });
                    }
                }
            }
            Statement::If { consequent, alternate, .. } => {
                self.hoist_vars(owner, consequent, declared);
                if let Some(a) = alternate {
                    self.hoist_vars(owner, a, declared);
                }
            }
            Statement::While { body, .. } => self.hoist_vars(owner, body, declared),
            Statement::ForClassic { init, body, .. } => {
                if let Some(init) = init {
                    self.hoist_vars(owner, init, declared);
                }
                self.hoist_vars(owner, body, declared);
            }
            Statement::ForIn { decl_kind: ast::VarKind::Var, name, body, .. }
            | Statement::ForOf { decl_kind: ast::VarKind::Var, name, body, .. } => {
                if declared.insert(name.name.clone()) {
                    let sym = self.strings.intern(&name.name);
                    self.arena.get_mut(owner).identifiers.push(IdentifierInfo {
                        name: sym,
                        mutable: true,
                        on_stack: true,
                        slot: 0,
                        is_parameter: false,
                        is_var: true,
                        captured: false,
                    });
                }
                self.hoist_vars(owner, body, declared);
            }
            Statement::ForIn { body, .. } | Statement::ForOf { body, .. } => {
                self.hoist_vars(owner, body, declared);
            }
            Statement::Try { block, catch_block, finally_block, .. } => {
                for s in block {
                    self.hoist_vars(owner, s, declared);
                }
                if let Some(cb) = catch_block {
                    for s in cb {
                        self.hoist_vars(owner, s, declared);
                    }
                }
                if let Some(fb) = finally_block {
                    for s in fb {
                        self.hoist_vars(owner, s, declared);
                    }
                }
            }
            Statement::With { body, .. } => self.hoist_vars(owner, body, declared),
            Statement::Block { body, .. } => {
                for s in body {
                    self.hoist_vars(owner, s, declared);
                }
            }
            _ => {}
        }
    }

    fn walk_statement(&mut self, ctx: &mut FunctionCtx, stmt: &Statement) {
        match stmt {
            Statement::VarDecl { kind, name, init, .. } => {
                if let Some(init) = init {
                    self.walk_expr(ctx, init);
                }
                if !matches!(kind, ast::VarKind::Var) {
                    self.declare_block_local(ctx, &name.name, !matches!(kind, ast::VarKind::Const));
                }
            }
            Statement::FunctionDecl(f) => self.walk_function_decl(ctx, f),
            Statement::Return { value, .. } => {
                if let Some(v) = value {
                    self.walk_expr(ctx, v);
                }
            }
            Statement::If { test, consequent, alternate, .. } => {
                self.walk_expr(ctx, test);
                self.walk_nested_block(ctx, consequent);
                if let Some(a) = alternate {
                    self.walk_nested_block(ctx, a);
                }
            }
            Statement::While { test, body, .. } => {
                self.walk_expr(ctx, test);
                self.walk_nested_block(ctx, body);
            }
            Statement::ForClassic { init, test, update, body, .. } => {
                if let Some(init) = init {
                    self.walk_statement(ctx, init);
                }
                if let Some(t) = test {
                    self.walk_expr(ctx, t);
                }
                if let Some(u) = update {
                    self.walk_expr(ctx, u);
                }
                self.walk_nested_block(ctx, body);
            }
            Statement::ForIn { decl_kind, name, object, body, .. }
            | Statement::ForOf { decl_kind, name, iterable: object, body, .. } => {
                self.walk_expr(ctx, object);
                if !matches!(decl_kind, ast::VarKind::Var) {
                    self.declare_block_local(ctx, &name.name, !matches!(decl_kind, ast::VarKind::Const));
                }
                self.walk_nested_block(ctx, body);
            }
            Statement::Try { block, catch_param, catch_block, finally_block, .. } => {
                self.enter_block(ctx, BlockKind::Try, |b, ctx| {
                    for s in block {
                        b.walk_statement(ctx, s);
                    }
                });
                if let Some(cb) = catch_block {
                    self.enter_block(ctx, BlockKind::Catch, |b, ctx| {
                        if let Some(p) = catch_param {
                            b.declare_block_local(ctx, &p.name, true);
                        }
                        for s in cb {
                            b.walk_statement(ctx, s);
                        }
                    });
                }
                if let Some(fb) = finally_block {
                    self.enter_block(ctx, BlockKind::Block, |b, ctx| {
                        for s in fb {
                            b.walk_statement(ctx, s);
                        }
                    });
                }
            }
            Statement::Throw { value, .. } => self.walk_expr(ctx, value),
            Statement::With { object, body, .. } => {
                self.walk_expr(ctx, object);
                self.arena.get_mut(ctx.code_block).flags.has_with = true;
                self.walk_nested_block(ctx, body);
            }
            Statement::Block { body, .. } => {
                self.enter_block(ctx, BlockKind::Block, |b, ctx| {
                    for s in body {
                        b.walk_statement(ctx, s);
                    }
                });
            }
            Statement::Break { .. } | Statement::Continue { .. } => {}
            Statement::Expr { value, .. } => self.walk_expr(ctx, value),
        }
    }

    /// Loop/if/while bodies that are not already a `{ }` block still get
    /// their own lexical block per SPEC_FULL.md's block-tree model.
    fn walk_nested_block(&mut self, ctx: &mut FunctionCtx, stmt: &Statement) {
        if matches!(stmt, Statement::Block { .. }) {
            self.walk_statement(ctx, stmt);
        } else {
            self.enter_block(ctx, BlockKind::Block, |b, ctx| b.walk_statement(ctx, stmt));
        }
    }

    fn enter_block(&mut self, ctx: &mut FunctionCtx, kind: BlockKind, f: impl FnOnce(&mut Self, &mut FunctionCtx)) {
        let parent_index = ctx.current_block;
        let block_index = self.arena.get(ctx.code_block).blocks.len() as u32;
        self.arena.get_mut(ctx.code_block).blocks.push(BlockInfo {
            parent_block_index: parent_index,
            kind,
            identifiers: Vec::new(),
            env_required: false,
        });
        let saved = ctx.current_block;
        ctx.current_block = block_index;
        f(self, ctx);
        ctx.current_block = saved;
    }

    fn declare_block_local(&mut self, ctx: &mut FunctionCtx, name: &str, mutable: bool) {
        let sym = self.strings.intern(name);
        let block_index = ctx.current_block as usize;
        self.arena.get_mut(ctx.code_block).blocks[block_index].identifiers.push(BlockIdentifierInfo {
            name: sym,
            mutable,
            on_stack: true,
            slot: 0,
            captured: false,
        });
    }

    fn walk_function_decl(&mut self, ctx: &mut FunctionCtx, f: &FunctionDecl) {
        let raw = RawFunction {
            name: f.name.as_ref().map(|n| n.name.clone()),
            params: f.params.iter().map(|p| p.name.clone()).collect(),
            is_generator: f.is_generator,
            body: f.body.clone(),
            span: f.span,
        };
        let (child_id, child_free) =
            self.build_function(Some(ctx.code_block), f.span.start, f.span.end, raw);
        self.arena.get_mut(ctx.code_block).children.push(child_id);
        self.resolve_captures_against(ctx, &child_free);
    }

    /// For every free name a nested function left unresolved, check if it
    /// is declared in the current function; if so mark it captured and
    /// stop it from bubbling further, else bubble it to this function's
    /// own free-name set for its parent to resolve.
    fn resolve_captures_against(&mut self, ctx: &mut FunctionCtx, child_free: &FxHashSet<String>) {
        for name in child_free {
            if self.mark_captured_if_local(ctx.code_block, name) {
                continue;
            }
            ctx.free_names.insert(name.clone());
        }
    }

    fn mark_captured_if_local(&mut self, owner: CodeBlockId, name: &str) -> bool {
        let sym = self.strings.intern(name);
        let block = self.arena.get_mut(owner);
        if let Some(ident) = block.identifiers.iter_mut().find(|i| i.name == sym) {
            ident.captured = true;
            return true;
        }
        for b in &mut block.blocks {
            if let Some(ident) = b.identifiers.iter_mut().find(|i| i.name == sym) {
                ident.captured = true;
                return true;
            }
        }
        false
    }

    fn walk_expr(&mut self, ctx: &mut FunctionCtx, expr: &Expr) {
        match expr {
            Expr::Ident(id) => {
                if id.name == "eval" {
                    self.arena.get_mut(ctx.code_block).flags.has_eval = true;
                }
                if id.name == "arguments" {
                    self.arena.get_mut(ctx.code_block).flags.has_arguments_object = true;
                }
                if !self.is_locally_declared(ctx.code_block, &id.name) {
                    ctx.free_names.insert(id.name.clone());
                }
            }
            Expr::Array(items, _) => {
                for i in items {
                    self.walk_expr(ctx, i);
                }
            }
            Expr::Object(props, _) => {
                for (_, v) in props {
                    self.walk_expr(ctx, v);
                }
            }
            Expr::Function(f) => self.walk_function_decl(ctx, f),
            Expr::Call { callee, args, .. } => {
                self.walk_expr(ctx, callee);
                for a in args {
                    self.walk_expr(ctx, a);
                }
                if let Expr::Ident(name) = callee.as_ref() {
                    if name.name == "eval" {
                        self.arena.get_mut(ctx.code_block).flags.has_eval = true;
                    }
                }
            }
            Expr::Member { object, property, .. } => {
                self.walk_expr(ctx, object);
                if let ast::MemberKey::Computed(e) = property {
                    self.walk_expr(ctx, e);
                }
            }
            Expr::Assign { target, value, .. } => {
                self.walk_expr(ctx, target);
                self.walk_expr(ctx, value);
            }
            Expr::Binary { left, right, .. } => {
                self.walk_expr(ctx, left);
                self.walk_expr(ctx, right);
            }
            Expr::Unary { operand, .. } => self.walk_expr(ctx, operand),
            Expr::Ternary { test, consequent, alternate, .. } => {
                self.walk_expr(ctx, test);
                self.walk_expr(ctx, consequent);
                self.walk_expr(ctx, alternate);
            }
            Expr::Yield { value, .. } => {
                if let Some(v) = value {
                    self.walk_expr(ctx, v);
                }
            }
            Expr::Number(..) | Expr::Str(..) | Expr::Bool(..) | Expr::Null(_) | Expr::Undefined(_) => {}
        }
    }

    fn is_locally_declared(&self, owner: CodeBlockId, name: &str) -> bool {
        let block = self.arena.get(owner);
        if block.identifiers.iter().any(|i| self.strings_eq(i.name, name)) {
            return true;
        }
        block.blocks.iter().any(|b| b.identifiers.iter().any(|i| self.strings_eq(i.name, name)))
    }

    fn strings_eq(&self, sym: AtomicString, name: &str) -> bool {
        self.strings.resolve(sym) == name
    }

    fn finalize_counts(&mut self, id: CodeBlockId) {
        let block = self.arena.get_mut(id);
        let has_eval_or_with = block.flags.has_eval || block.flags.has_with;
        let is_eval_code = block.flags.is_eval_code;

        let mut stack_slot = 0u32;
        let mut heap_slot = 0u32;
        for ident in &mut block.identifiers {
            if has_eval_or_with || is_eval_code {
                ident.on_stack = false;
            } else if ident.captured {
                ident.on_stack = false;
            }
            if ident.on_stack {
                ident.slot = stack_slot;
                stack_slot += 1;
            } else {
                ident.slot = heap_slot;
                heap_slot += 1;
            }
        }
        for b in &mut block.blocks {
            for ident in &mut b.identifiers {
                if has_eval_or_with || is_eval_code || ident.captured {
                    ident.on_stack = false;
                }
                if ident.on_stack {
                    ident.slot = stack_slot;
                    stack_slot += 1;
                } else {
                    ident.slot = heap_slot;
                    heap_slot += 1;
                }
            }
            b.env_required = !has_eval_or_with && b.identifiers.iter().any(|i| i.captured);
        }

        block.counts.identifier_on_stack_count = stack_slot;
        block.counts.identifier_on_heap_count = heap_slot;
        block.counts.max_stack_block_depth = max_concurrent_stack_block_depth(&block.blocks);

        block.access = derive_access_rule(block);
    }

    fn propagate_ancestor_eval_with(&mut self) {
        propagate_ancestor_eval_with(&mut self.arena)
    }
}

/// The per-block `AccessRule` derivation of [`Builder::finalize_counts`],
/// pulled out as a pure function of already-classified identifiers so the
/// code cache's deserializer (`cache.rs`) can re-derive the same rules a
/// fresh compile would have produced, instead of serializing them.
pub(crate) fn derive_access_rule(block: &CodeBlock) -> AccessRule {
    let has_eval_or_with = block.flags.has_eval || block.flags.has_with;
    if has_eval_or_with || block.flags.is_eval_code {
        AccessRule {
            can_use_indexed_variable_storage: false,
            can_allocate_variables_on_stack: false,
            can_allocate_environment_on_stack: false,
        }
    } else {
        AccessRule {
            can_use_indexed_variable_storage: true,
            can_allocate_variables_on_stack: true,
            can_allocate_environment_on_stack: !block.identifiers.iter().any(|i| i.captured),
        }
    }
}

/// After the whole tree is built (or rebuilt from a code cache), any
/// CodeBlock whose ancestor has `has_eval`/`has_with` loses its ability to
/// allocate on the stack, per the "Ancestor has eval/with" row of the
/// variable-access table. This crate collapses that row together with
/// "Descendant of such node" (see DESIGN.md, Open Question 4): both are
/// treated as `OnStack = false`, the stricter of the two, since
/// distinguishing "every used name resolved at compile time" for arbitrarily
/// deep descendants needs alias analysis this reference implementation does
/// not perform. Pulled out of `Builder` so the code cache's deserializer can
/// run the same pass over a rebuilt arena.
pub(crate) fn propagate_ancestor_eval_with(arena: &mut CodeBlockArena) {
    let ids: Vec<CodeBlockId> = (0..arena.len() as u32).map(CodeBlockId).collect();
    for id in ids {
        let mut ancestor_tainted = false;
        let mut cur = arena.get(id).parent;
        while let Some(p) = cur {
            let pb = arena.get(p);
            if pb.flags.has_eval || pb.flags.has_with {
                ancestor_tainted = true;
                break;
            }
            cur = pb.parent;
        }
        if ancestor_tainted {
            let block = arena.get_mut(id);
            if !(block.flags.has_eval || block.flags.has_with || block.flags.is_eval_code) {
                block.access.can_allocate_variables_on_stack = false;
                block.access.can_allocate_environment_on_stack = false;
            }
        }
    }
}

/// `maxStackBlockDepth` (SPEC_FULL.md §4.1 algorithm 2): the maximum number
/// of stack-allocating lexical blocks simultaneously live on any root-to-leaf
/// path of the block tree, walked via each `BlockInfo`'s `parent_block_index`
/// chain. A block that allocates no stack slot of its own (every binding
/// went to the heap, or the block declares nothing) doesn't add a level,
/// since no stack index needs to be reserved for it.
fn max_concurrent_stack_block_depth(blocks: &[BlockInfo]) -> u32 {
    let mut depth = vec![0u32; blocks.len()];
    let mut max_depth = 0u32;
    for (i, b) in blocks.iter().enumerate() {
        let parent_depth = if b.parent_block_index == NO_PARENT_BLOCK {
            0
        } else {
            depth[b.parent_block_index as usize]
        };
        let has_stack_binding = b.identifiers.iter().any(|ident| ident.on_stack);
        depth[i] = parent_depth + if has_stack_binding { 1 } else { 0 };
        max_depth = max_depth.max(depth[i]);
    }
    max_depth
}

struct FunctionCtx {
    code_block: CodeBlockId,
    current_block: u32,
    free_names: FxHashSet<String>,
    #[allow(dead_code)]
    declared_here: usize,
}

/// Build a CodeBlock tree for an entire parsed module (the "script" body).
pub fn build_codeblock_tree(
    module: &ast::Module,
    strings: &mut AtomicStringTable,
) -> Result<(CodeBlockArena, CodeBlockId), ScopeError> {
    let mut builder = Builder::new(strings);
    let raw = RawFunction {
        name: None,
        params: Vec::new(),
        is_generator: false,
        body: module.body.clone(),
        span: module.span,
    };
    let (root, _free) = builder.build_function(None, module.span.start, module.span.end, raw);
    builder.propagate_ancestor_eval_with();
    builder.arena.validate()?;
    Ok((builder.arena, root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn build(src: &str) -> (CodeBlockArena, CodeBlockId, AtomicStringTable) {
        let module = Parser::new(src).unwrap().parse_module().unwrap();
        let mut strings = AtomicStringTable::new();
        let (arena, root) = build_codeblock_tree(&module, &mut strings).unwrap();
        (arena, root, strings)
    }

    #[test]
    fn simple_function_params_are_on_stack() {
        let (arena, _root, _s) = build("function f(x){return x+1} f(41)");
        let f = arena.iter().find(|b| !b.parameter_names.is_empty()).unwrap();
        assert!(f.identifiers[0].on_stack);
        assert!(f.access.can_use_indexed_variable_storage);
        assert!(f.access.can_allocate_variables_on_stack);
    }

    #[test]
    fn captured_variable_is_heap_allocated() {
        let (arena, root, strings) = build(
            "function outer(){ var a = 1; function inner(){ return a; } return inner; }",
        );
        let outer = arena
            .iter()
            .find(|b| b.id != root && !b.children.is_empty())
            .unwrap();
        let a = outer.identifiers.iter().find(|i| strings.resolve(i.name) == "a").unwrap();
        assert!(a.captured);
        assert!(!a.on_stack);
        assert!(!outer.access.can_allocate_environment_on_stack);
    }

    #[test]
    fn with_disables_indexed_storage() {
        let (arena, root, _s) = build("with({x:5}){(function(){return x})()}");
        let script = arena.get(root);
        assert!(script.flags.has_with);
        assert!(!script.access.can_use_indexed_variable_storage);
        assert!(!script.access.can_allocate_variables_on_stack);
    }

    #[test]
    fn descendant_of_with_cannot_allocate_on_stack() {
        let (arena, _root, _s) = build("with({x:5}){function f(){var y=1; return y;}}");
        let f = arena.iter().find(|b| !b.parameter_names.is_empty() || b.id.0 != 0).find(|b| {
            b.identifiers.iter().any(|i| i.is_var)
        });
        if let Some(f) = f {
            assert!(!f.access.can_allocate_variables_on_stack);
        }
    }
}
