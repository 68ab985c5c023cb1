//! Code generation from AST to the stack-machine byte stream.
//!
//! The [`MethodGenerator`] drives one compilation: it seeds an emitter per
//! routine, walks the statement tree, consults the scope-chain compiler for
//! every name access, and finalizes each byte stream into a loadable
//! [`Routine`]. Nested function expressions recurse into fresh emitters
//! while sharing the scope arena and module.

mod expressions;
mod scope;
mod statements;


pub(crate) use scope::{ScopeArena, ScopeRef};

use crate::ast::{Function, Program, Statement};
use crate::compiler::emitter::Emitter;
use crate::compiler::labels::Label;
use crate::compiler::locals::LocalVar;
use crate::compiler::ValueKind;
use crate::loader::{Module, Routine, WellKnown};
use crate::Result;
use std::sync::Arc;
use tracing::debug;

/// Per-compilation options handed to the generator alongside the AST.
#[derive(Debug, Clone, Default)]
pub struct OptimizationInfo {
    /// Compile in strict mode regardless of the program's directive.
    pub strict_mode: bool,
    /// Source document name for diagnostics.
    pub debug_document: Option<String>,
}

/// AST-level optimization pass. Intentionally a no-op: the tree is compiled
/// exactly as parsed.
pub fn optimize(_program: &mut Program) {}

/// Compiles a program into the global routine, registering it (and every
/// nested function routine) in the module.
pub fn compile_program(
    module: &Arc<Module>,
    program: &Program,
    info: OptimizationInfo,
) -> Result<Arc<Routine>> {
    let mut generator = MethodGenerator::new(Arc::clone(module), &info, program.strict);
    generator.generate_program(program)
}

/// Per-routine emission state.
pub(crate) struct RoutineState {
    pub emitter: Emitter,
    /// The innermost compile-time scope.
    pub scope: ScopeRef,
    /// Enclosing breakable/continuable constructs, innermost last.
    pub loops: Vec<LoopContext>,
    /// Shared return path, materialized by the first `return` inside an
    /// exception region.
    pub return_site: Option<ReturnSite>,
}

/// One enclosing loop or switch.
pub(crate) struct LoopContext {
    /// Branch target of `break`; created lazily so loops without breaks
    /// carry no extra label.
    pub break_target: Option<Label>,
    /// Branch target of `continue`; `None` for switches.
    pub continue_target: Option<Label>,
    /// The scope in effect at the loop itself. `break`/`continue` emitted
    /// deeper (inside `with` bodies or catch handlers) must pop the runtime
    /// chain back to this scope before leaving.
    pub scope: ScopeRef,
}

/// The shared epilogue used by returns that must unwind protected regions.
pub(crate) struct ReturnSite {
    pub label: Label,
    pub slot: LocalVar,
}

/// Generates routines for one program.
pub(crate) struct MethodGenerator {
    pub(crate) module: Arc<Module>,
    pub(crate) scopes: ScopeArena,
    pub(crate) wk: WellKnown,
    pub(crate) strict: bool,
    document: Option<String>,
}

impl MethodGenerator {
    fn new(module: Arc<Module>, info: &OptimizationInfo, program_strict: bool) -> Self {
        let wk = module.well_known().clone();
        MethodGenerator {
            module,
            scopes: ScopeArena::new(),
            wk,
            strict: info.strict_mode || program_strict,
            document: info.debug_document.clone(),
        }
    }

    fn generate_program(&mut self, program: &Program) -> Result<Arc<Routine>> {
        debug!(
            statements = program.body.len(),
            strict = self.strict,
            document = self.document.as_deref().unwrap_or("<eval>"),
            "generating program routine"
        );
        let global = self.scopes.global();
        let mut rs = RoutineState {
            emitter: Emitter::for_routine(Arc::clone(&self.module), 0),
            scope: global,
            loops: Vec::new(),
            return_site: None,
        };

        // Hoisting: global vars become global properties, created as
        // undefined only when absent; function declarations bind eagerly.
        for name in collect_var_names(&program.body) {
            let cache = rs.emitter.allocate_cache_site();
            let skip = rs.emitter.create_label();
            rs.emitter.load_argument(0)?;
            rs.emitter.load_string(&name)?;
            rs.emitter.load_int32(cache)?;
            rs.emitter.call_static(&self.wk.scope_has_property)?;
            rs.emitter.branch_if_not_zero(skip)?;
            rs.emitter.load_argument(0)?;
            rs.emitter.load_string(&name)?;
            rs.emitter.load_field(&self.wk.undefined_value)?;
            rs.emitter.load_int32(cache)?;
            rs.emitter.call_static(&self.wk.scope_set_property)?;
            rs.emitter.define_label(skip)?;
        }
        for function in collect_function_declarations(&program.body) {
            let name = function
                .id
                .as_ref()
                .expect("function declarations are named")
                .name
                .clone();
            let routine = self.generate_function(function, global)?;
            let cache = rs.emitter.allocate_cache_site();
            rs.emitter.load_argument(0)?;
            rs.emitter.load_string(&name)?;
            rs.emitter.load_argument(0)?;
            rs.emitter.load_int32(routine.token.as_u32() as i32)?;
            rs.emitter.call_static(&self.wk.create_closure)?;
            rs.emitter.load_int32(cache)?;
            rs.emitter.call_static(&self.wk.scope_set_property)?;
        }

        for statement in &program.body {
            self.gen_statement(&mut rs, statement)?;
        }
        self.finish_routine(rs, "<global>", 0)
    }

    /// Generates the routine for one function and registers it.
    pub(crate) fn generate_function(
        &mut self,
        function: &Function,
        enclosing: ScopeRef,
    ) -> Result<Arc<Routine>> {
        let scope = self.scopes.declarative(enclosing);
        for param in &function.params {
            self.scopes.declare(scope, &param.name);
        }
        for name in collect_var_names(&function.body) {
            self.scopes.declare(scope, &name);
        }
        let declarations = collect_function_declarations(&function.body);
        for nested in &declarations {
            let name = &nested.id.as_ref().expect("declarations are named").name;
            self.scopes.declare(scope, name);
        }

        let mut rs = RoutineState {
            emitter: Emitter::for_routine(Arc::clone(&self.module), function.params.len() as u16),
            scope,
            loops: Vec::new(),
            return_site: None,
        };

        // Prologue: wrap the captured chain in this routine's own scope and
        // spill the arguments into its slots.
        let slot_count = self.scopes.slot_count(scope);
        rs.emitter.load_argument(0)?;
        rs.emitter.load_int32(slot_count as i32)?;
        rs.emitter.call_static(&self.wk.create_declarative_scope)?;
        rs.emitter.store_argument(0)?;
        for (position, param) in function.params.iter().enumerate() {
            let slot = self.scopes.declare(scope, &param.name);
            rs.emitter.load_argument(0)?;
            rs.emitter.load_int32(slot as i32)?;
            rs.emitter.load_argument(2 + position as u16)?;
            rs.emitter.call_static(&self.wk.scope_set_slot)?;
        }
        for nested in &declarations {
            let name = &nested.id.as_ref().expect("declarations are named").name;
            let slot = self.scopes.declare(scope, name);
            let routine = self.generate_function(nested, scope)?;
            rs.emitter.load_argument(0)?;
            rs.emitter.load_int32(slot as i32)?;
            rs.emitter.load_argument(0)?;
            rs.emitter.load_int32(routine.token.as_u32() as i32)?;
            rs.emitter.call_static(&self.wk.create_closure)?;
            rs.emitter.call_static(&self.wk.scope_set_slot)?;
        }

        for statement in &function.body {
            self.gen_statement(&mut rs, statement)?;
        }

        let name = function
            .id
            .as_ref()
            .map(|id| id.name.clone())
            .unwrap_or_else(|| "<anonymous>".to_string());
        self.finish_routine(rs, &name, function.params.len() as u16)
    }

    fn finish_routine(
        &mut self,
        mut rs: RoutineState,
        name: &str,
        param_count: u16,
    ) -> Result<Arc<Routine>> {
        // Falling off the end returns undefined.
        if !rs.emitter.is_indeterminate() {
            rs.emitter.load_field(&self.wk.undefined_value)?;
            rs.emitter.ret()?;
        }
        if let Some(site) = rs.return_site.take() {
            rs.emitter.define_label(site.label)?;
            rs.emitter.load_variable(site.slot)?;
            rs.emitter.ret()?;
        }
        let completed = rs.emitter.complete()?;
        Ok(self.module.define_routine(name, param_count, completed))
    }

    /// Re-establishes an empty stack when the previous statement ended with
    /// an unconditional terminator, so dead code still verifies.
    pub(crate) fn ensure_reachable(&self, rs: &mut RoutineState) -> Result<()> {
        if rs.emitter.is_indeterminate() {
            let resume = rs.emitter.create_label();
            rs.emitter.define_label(resume)?;
        }
        Ok(())
    }

    /// The return epilogue, created on first use.
    pub(crate) fn return_site(&self, rs: &mut RoutineState) -> Result<ReturnSite> {
        if rs.return_site.is_none() {
            let label = rs.emitter.create_label();
            let slot = rs
                .emitter
                .declare_variable(ValueKind::Object, Some("return value"))?;
            rs.return_site = Some(ReturnSite { label, slot });
        }
        let site = rs.return_site.as_ref().expect("just created");
        Ok(ReturnSite {
            label: site.label,
            slot: site.slot,
        })
    }
}

/// Collects `var` names hoisted to function (or program) scope, in source
/// order, without duplicates.
fn collect_var_names(body: &[Statement]) -> Vec<String> {
    let mut names = Vec::new();
    for statement in body {
        collect_var_names_from(statement, &mut names);
    }
    names
}

fn push_unique(names: &mut Vec<String>, name: &str) {
    if !names.iter().any(|n| n == name) {
        names.push(name.to_string());
    }
}

fn collect_var_names_from(statement: &Statement, names: &mut Vec<String>) {
    match statement {
        Statement::VariableDeclaration(declaration) => {
            for declarator in &declaration.declarations {
                push_unique(names, &declarator.id.name);
            }
        }
        Statement::Block(body) => {
            for inner in body {
                collect_var_names_from(inner, names);
            }
        }
        Statement::If(if_statement) => {
            collect_var_names_from(&if_statement.consequent, names);
            if let Some(alternate) = &if_statement.alternate {
                collect_var_names_from(alternate, names);
            }
        }
        Statement::While(while_statement) => {
            collect_var_names_from(&while_statement.body, names)
        }
        Statement::DoWhile(do_while) => collect_var_names_from(&do_while.body, names),
        Statement::For(for_statement) => {
            if let Some(crate::ast::ForInit::Declaration(declaration)) = &for_statement.init {
                for declarator in &declaration.declarations {
                    push_unique(names, &declarator.id.name);
                }
            }
            collect_var_names_from(&for_statement.body, names);
        }
        Statement::Switch(switch_statement) => {
            for case in &switch_statement.cases {
                for inner in &case.body {
                    collect_var_names_from(inner, names);
                }
            }
        }
        Statement::Try(try_statement) => {
            for inner in &try_statement.block {
                collect_var_names_from(inner, names);
            }
            if let Some(handler) = &try_statement.handler {
                for inner in &handler.body {
                    collect_var_names_from(inner, names);
                }
            }
            if let Some(finalizer) = &try_statement.finalizer {
                for inner in finalizer {
                    collect_var_names_from(inner, names);
                }
            }
        }
        Statement::With(with_statement) => {
            collect_var_names_from(&with_statement.body, names)
        }
        _ => {}
    }
}

/// Function declarations bind at the top level of a body.
fn collect_function_declarations(body: &[Statement]) -> Vec<&Function> {
    body.iter()
        .filter_map(|statement| match statement {
            Statement::FunctionDeclaration(function) => Some(function),
            _ => None,
        })
        .collect()
}
