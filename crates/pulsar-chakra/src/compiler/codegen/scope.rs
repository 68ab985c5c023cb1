//! The scope-chain compiler.
//!
//! Compile-time scope records live in an arena and link child→parent by
//! index, mirroring the runtime chain the emitted prologue builds. Name
//! resolution walks leaf to root: declarative scopes bind statically to slot
//! indices, object scopes compile to runtime property probes with a branch
//! per level, and the global root resolves unconditionally, throwing
//! `ReferenceError` on a complete read miss.

use crate::ast::Identifier;
use crate::compiler::codegen::{MethodGenerator, RoutineState};
use crate::Result;
use rustc_hash::FxHashMap;

/// Handle to a compile-time scope record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ScopeRef(u32);

#[derive(Debug)]
pub(crate) enum ScopeKind {
    /// Slot-backed scope: function bodies and catch variables.
    Declarative {
        bindings: FxHashMap<String, u16>,
        slot_count: u16,
    },
    /// Property-backed scope produced by `with`.
    Object { implicit_receiver: bool },
    /// The distinguished root over the process-wide global object.
    Global,
}

#[derive(Debug)]
pub(crate) struct ScopeRecord {
    pub parent: Option<ScopeRef>,
    pub kind: ScopeKind,
}

/// Arena of scope records for one compilation.
#[derive(Debug)]
pub(crate) struct ScopeArena {
    records: Vec<ScopeRecord>,
}

impl ScopeArena {
    pub fn new() -> Self {
        ScopeArena {
            records: vec![ScopeRecord {
                parent: None,
                kind: ScopeKind::Global,
            }],
        }
    }

    pub fn global(&self) -> ScopeRef {
        ScopeRef(0)
    }

    pub fn declarative(&mut self, parent: ScopeRef) -> ScopeRef {
        let id = ScopeRef(self.records.len() as u32);
        self.records.push(ScopeRecord {
            parent: Some(parent),
            kind: ScopeKind::Declarative {
                bindings: FxHashMap::default(),
                slot_count: 0,
            },
        });
        id
    }

    pub fn object(&mut self, parent: ScopeRef, implicit_receiver: bool) -> ScopeRef {
        let id = ScopeRef(self.records.len() as u32);
        self.records.push(ScopeRecord {
            parent: Some(parent),
            kind: ScopeKind::Object { implicit_receiver },
        });
        id
    }

    /// Declares a name in a declarative scope, returning its slot. Repeat
    /// declarations reuse the existing slot.
    pub fn declare(&mut self, scope: ScopeRef, name: &str) -> u16 {
        match &mut self.records[scope.0 as usize].kind {
            ScopeKind::Declarative {
                bindings,
                slot_count,
            } => {
                if let Some(&slot) = bindings.get(name) {
                    return slot;
                }
                let slot = *slot_count;
                bindings.insert(name.to_string(), slot);
                *slot_count += 1;
                slot
            }
            _ => unreachable!("declarations bind only in declarative scopes"),
        }
    }

    pub fn slot_count(&self, scope: ScopeRef) -> u16 {
        match &self.records[scope.0 as usize].kind {
            ScopeKind::Declarative { slot_count, .. } => *slot_count,
            _ => 0,
        }
    }

    /// Number of parent links between `from` and its ancestor `ancestor`.
    /// Every record on that path has a matching runtime scope instance.
    pub fn unwind_depth(&self, from: ScopeRef, ancestor: ScopeRef) -> usize {
        let mut hops = 0;
        let mut current = from;
        while current != ancestor {
            current = self.records[current.0 as usize]
                .parent
                .expect("ancestor lies on the scope chain");
            hops += 1;
        }
        hops
    }

    fn lookup(&self, scope: ScopeRef, name: &str) -> Option<u16> {
        match &self.records[scope.0 as usize].kind {
            ScopeKind::Declarative { bindings, .. } => bindings.get(name).copied(),
            _ => None,
        }
    }

    /// Plans the leaf-to-root walk for one name: the runtime probes to emit
    /// and the terminal binding.
    fn resolve(&self, from: ScopeRef, name: &str) -> Vec<ResolveStep> {
        let mut steps = Vec::new();
        let mut current = Some(from);
        let mut depth = 0u16;
        while let Some(scope) = current {
            match &self.records[scope.0 as usize].kind {
                ScopeKind::Declarative { .. } => {
                    if let Some(slot) = self.lookup(scope, name) {
                        steps.push(ResolveStep::Slot { depth, slot });
                        return steps;
                    }
                }
                ScopeKind::Object { implicit_receiver } => {
                    steps.push(ResolveStep::ObjectProbe {
                        depth,
                        implicit_receiver: *implicit_receiver,
                    });
                }
                ScopeKind::Global => {
                    steps.push(ResolveStep::GlobalRoot { depth });
                    return steps;
                }
            }
            current = self.records[scope.0 as usize].parent;
            depth += 1;
        }
        steps
    }
}

/// One level of an emitted scope-chain walk.
#[derive(Debug, Clone, Copy)]
enum ResolveStep {
    /// Statically bound declarative slot; always terminal.
    Slot { depth: u16, slot: u16 },
    /// Object scope whose membership is only known at runtime.
    ObjectProbe {
        depth: u16,
        implicit_receiver: bool,
    },
    /// The global root; always terminal.
    GlobalRoot { depth: u16 },
}

impl MethodGenerator {
    /// Emits `ldarg.0` followed by `depth` parent-link hops, leaving the
    /// scope handle for that level on the stack.
    fn gen_scope_walk(&self, rs: &mut RoutineState, depth: u16) -> Result<()> {
        rs.emitter.load_argument(0)?;
        for _ in 0..depth {
            rs.emitter.call_static(&self.wk.scope_parent)?;
        }
        Ok(())
    }

    /// Pushes the implicit `this` used when a callee did not come from a
    /// `with` scope: the global object, or `undefined` in strict mode.
    pub(crate) fn gen_default_receiver(&self, rs: &mut RoutineState) -> Result<()> {
        if self.strict {
            rs.emitter.load_field(&self.wk.undefined_value)?;
        } else {
            rs.emitter.load_field(&self.wk.global_instance)?;
        }
        Ok(())
    }

    /// Emits the scope-chain read of `name`, pushing its boxed value.
    ///
    /// With `throw_on_miss`, a complete miss at the root raises a runtime
    /// `ReferenceError`; otherwise the root read falls back to `undefined`
    /// (the `typeof` quirk).
    pub(crate) fn gen_scope_get(
        &mut self,
        rs: &mut RoutineState,
        name: &Identifier,
        throw_on_miss: bool,
    ) -> Result<()> {
        let steps = self.scopes.resolve(rs.scope, name.name.as_str());
        let done = if steps.len() > 1 {
            Some(rs.emitter.create_label())
        } else {
            None
        };

        for (position, step) in steps.iter().enumerate() {
            let terminal = position + 1 == steps.len();
            match *step {
                ResolveStep::Slot { depth, slot } => {
                    self.gen_scope_walk(rs, depth)?;
                    rs.emitter.load_int32(slot as i32)?;
                    rs.emitter.call_static(&self.wk.scope_get_slot)?;
                }
                ResolveStep::ObjectProbe { depth, .. } => {
                    debug_assert!(!terminal, "object probes never terminate a walk");
                    let cache = rs.emitter.allocate_cache_site();
                    let next = rs.emitter.create_label();
                    self.gen_scope_walk(rs, depth)?;
                    rs.emitter.load_string(&name.name)?;
                    rs.emitter.load_int32(cache)?;
                    rs.emitter.call_static(&self.wk.scope_has_property)?;
                    rs.emitter.branch_if_zero(next)?;
                    self.gen_scope_walk(rs, depth)?;
                    rs.emitter.load_string(&name.name)?;
                    rs.emitter.load_int32(cache)?;
                    rs.emitter.call_static(&self.wk.scope_get_property)?;
                    rs.emitter.branch(done.expect("probe implies a merge label"))?;
                    rs.emitter.define_label(next)?;
                }
                ResolveStep::GlobalRoot { depth } => {
                    let cache = rs.emitter.allocate_cache_site();
                    if throw_on_miss {
                        self.gen_scope_walk(rs, depth)?;
                        rs.emitter.load_string(&name.name)?;
                        rs.emitter.load_int32(cache)?;
                        rs.emitter.call_static(&self.wk.scope_has_property)?;
                        let found = rs.emitter.create_label();
                        rs.emitter.branch_if_not_zero(found)?;
                        rs.emitter.load_string(&name.name)?;
                        rs.emitter
                            .call_static(&self.wk.create_reference_error)?;
                        rs.emitter.throw_exception()?;
                        rs.emitter.define_label(found)?;
                    }
                    self.gen_scope_walk(rs, depth)?;
                    rs.emitter.load_string(&name.name)?;
                    rs.emitter.load_int32(cache)?;
                    rs.emitter.call_static(&self.wk.scope_get_property)?;
                }
            }
        }

        if let Some(done) = done {
            rs.emitter.define_label(done)?;
        }
        Ok(())
    }

    /// Emits the scope-chain write of `name`, consuming the boxed value on
    /// top of the stack. Object scopes are probed with
    /// `scope_set_property_if_exists`; the global root creates or overwrites
    /// unconditionally.
    pub(crate) fn gen_scope_set(&mut self, rs: &mut RoutineState, name: &Identifier) -> Result<()> {
        let steps = self.scopes.resolve(rs.scope, name.name.as_str());
        let value = rs.emitter.declare_variable(crate::compiler::ValueKind::Object, None)?;
        rs.emitter.store_variable(value)?;

        let done = if steps.len() > 1 {
            Some(rs.emitter.create_label())
        } else {
            None
        };

        for step in &steps {
            match *step {
                ResolveStep::Slot { depth, slot } => {
                    self.gen_scope_walk(rs, depth)?;
                    rs.emitter.load_int32(slot as i32)?;
                    rs.emitter.load_variable(value)?;
                    rs.emitter.call_static(&self.wk.scope_set_slot)?;
                }
                ResolveStep::ObjectProbe { depth, .. } => {
                    let cache = rs.emitter.allocate_cache_site();
                    self.gen_scope_walk(rs, depth)?;
                    rs.emitter.load_string(&name.name)?;
                    rs.emitter.load_variable(value)?;
                    rs.emitter.load_int32(cache)?;
                    rs.emitter
                        .call_static(&self.wk.scope_set_property_if_exists)?;
                    rs.emitter
                        .branch_if_not_zero(done.expect("probe implies a merge label"))?;
                }
                ResolveStep::GlobalRoot { depth } => {
                    let cache = rs.emitter.allocate_cache_site();
                    self.gen_scope_walk(rs, depth)?;
                    rs.emitter.load_string(&name.name)?;
                    rs.emitter.load_variable(value)?;
                    rs.emitter.load_int32(cache)?;
                    rs.emitter.call_static(&self.wk.scope_set_property)?;
                }
            }
        }

        if let Some(done) = done {
            rs.emitter.define_label(done)?;
        }
        Ok(())
    }

    /// Emits the callee resolution for `name(...)`, pushing `this` then the
    /// function value. A callee found in a `with` scope receives that
    /// scope's binding object as its receiver.
    pub(crate) fn gen_scope_call_target(
        &mut self,
        rs: &mut RoutineState,
        name: &Identifier,
    ) -> Result<()> {
        let steps = self.scopes.resolve(rs.scope, name.name.as_str());
        let done = if steps.len() > 1 {
            Some(rs.emitter.create_label())
        } else {
            None
        };

        for step in &steps {
            match *step {
                ResolveStep::Slot { depth, slot } => {
                    self.gen_default_receiver(rs)?;
                    self.gen_scope_walk(rs, depth)?;
                    rs.emitter.load_int32(slot as i32)?;
                    rs.emitter.call_static(&self.wk.scope_get_slot)?;
                }
                ResolveStep::ObjectProbe {
                    depth,
                    implicit_receiver,
                } => {
                    let cache = rs.emitter.allocate_cache_site();
                    let next = rs.emitter.create_label();
                    self.gen_scope_walk(rs, depth)?;
                    rs.emitter.load_string(&name.name)?;
                    rs.emitter.load_int32(cache)?;
                    rs.emitter.call_static(&self.wk.scope_has_property)?;
                    rs.emitter.branch_if_zero(next)?;
                    if implicit_receiver {
                        // The binding object doubles as the receiver.
                        self.gen_scope_walk(rs, depth)?;
                        rs.emitter.call_static(&self.wk.scope_binding_object)?;
                        rs.emitter.duplicate()?;
                        rs.emitter.load_string(&name.name)?;
                        rs.emitter.load_int32(cache)?;
                        rs.emitter.call_static(&self.wk.get_member)?;
                    } else {
                        self.gen_default_receiver(rs)?;
                        self.gen_scope_walk(rs, depth)?;
                        rs.emitter.load_string(&name.name)?;
                        rs.emitter.load_int32(cache)?;
                        rs.emitter.call_static(&self.wk.scope_get_property)?;
                    }
                    rs.emitter.branch(done.expect("probe implies a merge label"))?;
                    rs.emitter.define_label(next)?;
                }
                ResolveStep::GlobalRoot { depth } => {
                    let cache = rs.emitter.allocate_cache_site();
                    self.gen_scope_walk(rs, depth)?;
                    rs.emitter.load_string(&name.name)?;
                    rs.emitter.load_int32(cache)?;
                    rs.emitter.call_static(&self.wk.scope_has_property)?;
                    let found = rs.emitter.create_label();
                    rs.emitter.branch_if_not_zero(found)?;
                    rs.emitter.load_string(&name.name)?;
                    rs.emitter.call_static(&self.wk.create_reference_error)?;
                    rs.emitter.throw_exception()?;
                    rs.emitter.define_label(found)?;
                    self.gen_default_receiver(rs)?;
                    self.gen_scope_walk(rs, depth)?;
                    rs.emitter.load_string(&name.name)?;
                    rs.emitter.load_int32(cache)?;
                    rs.emitter.call_static(&self.wk.scope_get_property)?;
                }
            }
        }

        if let Some(done) = done {
            rs.emitter.define_label(done)?;
        }
        Ok(())
    }

    /// Emits `with`-scope entry: coerces the object on top of the stack and
    /// replaces the current-scope argument with the new object scope.
    pub(crate) fn gen_enter_object_scope(&mut self, rs: &mut RoutineState) -> Result<()> {
        // Stack: [parent, object]: built by the caller.
        rs.emitter.call_static(&self.wk.to_object)?;
        rs.emitter.call_static(&self.wk.create_object_scope)?;
        rs.emitter.store_argument(0)?;
        Ok(())
    }

    /// Emits scope exit: pops the runtime chain back to the parent.
    pub(crate) fn gen_leave_scope(&self, rs: &mut RoutineState) -> Result<()> {
        rs.emitter.load_argument(0)?;
        rs.emitter.call_static(&self.wk.scope_parent)?;
        rs.emitter.store_argument(0)?;
        Ok(())
    }

    /// Emits one scope-chain pop per scope entered since `target_scope`.
    /// Structured exits (`break`/`continue`) jumping out of `with` bodies or
    /// catch handlers must restore argument 0 before they leave.
    pub(crate) fn gen_unwind_scopes(
        &self,
        rs: &mut RoutineState,
        target_scope: ScopeRef,
    ) -> Result<()> {
        for _ in 0..self.scopes.unwind_depth(rs.scope, target_scope) {
            self.gen_leave_scope(rs)?;
        }
        Ok(())
    }
}
