//! Statement code generation.
//!
//! Every statement leaves the evaluation stack empty. Structured exits
//! (`break`, `continue`, `return` inside a protected region) compile to
//! `leave`, which empties the stack on the way out; plain control flow uses
//! ordinary branches with the loop condition tested at the bottom.

use crate::ast::{
    DoWhileStatement, Expression, ForInit, ForStatement, IfStatement, Statement, SwitchStatement,
    TryStatement, VariableDeclaration, WhileStatement, WithStatement,
};
use crate::compiler::codegen::{LoopContext, MethodGenerator, RoutineState};
use crate::compiler::ValueKind;
use crate::Error;
use crate::Result;

impl MethodGenerator {
    pub(crate) fn gen_statement(&mut self, rs: &mut RoutineState, statement: &Statement) -> Result<()> {
        self.ensure_reachable(rs)?;
        match statement {
            Statement::Expression(expression) => {
                self.gen_expression(rs, expression)?;
                rs.emitter.pop()?;
            }
            Statement::VariableDeclaration(declaration) => {
                self.gen_variable_declaration(rs, declaration)?;
            }
            Statement::FunctionDeclaration(_) => {
                // Bound during hoisting; nothing to emit in place.
            }
            Statement::Block(body) => {
                for inner in body {
                    self.gen_statement(rs, inner)?;
                }
            }
            Statement::If(if_statement) => self.gen_if(rs, if_statement)?,
            Statement::While(while_statement) => self.gen_while(rs, while_statement)?,
            Statement::DoWhile(do_while) => self.gen_do_while(rs, do_while)?,
            Statement::For(for_statement) => self.gen_for(rs, for_statement)?,
            Statement::Switch(switch_statement) => self.gen_switch(rs, switch_statement)?,
            Statement::Return(argument) => self.gen_return(rs, argument.as_ref())?,
            Statement::Break => self.gen_break(rs)?,
            Statement::Continue => self.gen_continue(rs)?,
            Statement::Throw(argument) => {
                self.gen_boxed(rs, argument)?;
                rs.emitter.throw_exception()?;
            }
            Statement::Try(try_statement) => self.gen_try(rs, try_statement)?,
            Statement::With(with_statement) => self.gen_with(rs, with_statement)?,
            Statement::Empty => {}
        }
        Ok(())
    }

    fn gen_variable_declaration(
        &mut self,
        rs: &mut RoutineState,
        declaration: &VariableDeclaration,
    ) -> Result<()> {
        // Slots were hoisted; only initializers produce code.
        for declarator in &declaration.declarations {
            if let Some(init) = &declarator.init {
                self.gen_boxed(rs, init)?;
                self.gen_scope_set(rs, &declarator.id)?;
            }
        }
        Ok(())
    }

    fn gen_if(&mut self, rs: &mut RoutineState, if_statement: &IfStatement) -> Result<()> {
        match &if_statement.alternate {
            None => {
                let end = rs.emitter.create_label();
                self.gen_branch_if(rs, &if_statement.test, end, false)?;
                self.gen_statement(rs, &if_statement.consequent)?;
                rs.emitter.define_label(end)?;
            }
            Some(alternate) => {
                let else_target = rs.emitter.create_label();
                let end = rs.emitter.create_label();
                self.gen_branch_if(rs, &if_statement.test, else_target, false)?;
                self.gen_statement(rs, &if_statement.consequent)?;
                if !rs.emitter.is_indeterminate() {
                    rs.emitter.branch(end)?;
                }
                rs.emitter.define_label(else_target)?;
                self.gen_statement(rs, alternate)?;
                rs.emitter.define_label(end)?;
            }
        }
        Ok(())
    }

    fn gen_while(&mut self, rs: &mut RoutineState, while_statement: &WhileStatement) -> Result<()> {
        let test = rs.emitter.create_label();
        let body = rs.emitter.create_label();
        rs.loops.push(LoopContext {
            break_target: None,
            continue_target: Some(test),
            scope: rs.scope,
        });

        // Condition at the bottom: one unconditional branch per iteration
        // is saved and the back-edge carries the comparison.
        rs.emitter.branch(test)?;
        rs.emitter.define_label(body)?;
        self.gen_statement(rs, &while_statement.body)?;
        rs.emitter.define_label(test)?;
        self.gen_branch_if(rs, &while_statement.test, body, true)?;

        self.close_loop(rs)?;
        Ok(())
    }

    fn gen_do_while(&mut self, rs: &mut RoutineState, do_while: &DoWhileStatement) -> Result<()> {
        let body = rs.emitter.create_label();
        let test = rs.emitter.create_label();
        rs.loops.push(LoopContext {
            break_target: None,
            continue_target: Some(test),
            scope: rs.scope,
        });

        rs.emitter.define_label(body)?;
        self.gen_statement(rs, &do_while.body)?;
        rs.emitter.define_label(test)?;
        self.gen_branch_if(rs, &do_while.test, body, true)?;

        self.close_loop(rs)?;
        Ok(())
    }

    fn gen_for(&mut self, rs: &mut RoutineState, for_statement: &ForStatement) -> Result<()> {
        match &for_statement.init {
            Some(ForInit::Declaration(declaration)) => {
                self.gen_variable_declaration(rs, declaration)?;
            }
            Some(ForInit::Expression(expression)) => {
                self.gen_expression(rs, expression)?;
                rs.emitter.pop()?;
            }
            None => {}
        }

        let body = rs.emitter.create_label();
        let update = rs.emitter.create_label();
        let test = rs.emitter.create_label();
        rs.loops.push(LoopContext {
            break_target: None,
            continue_target: Some(update),
            scope: rs.scope,
        });

        if for_statement.test.is_some() {
            rs.emitter.branch(test)?;
        }
        rs.emitter.define_label(body)?;
        self.gen_statement(rs, &for_statement.body)?;
        rs.emitter.define_label(update)?;
        if let Some(update_expression) = &for_statement.update {
            self.gen_expression(rs, update_expression)?;
            rs.emitter.pop()?;
        }
        rs.emitter.define_label(test)?;
        match &for_statement.test {
            Some(condition) => self.gen_branch_if(rs, condition, body, true)?,
            None => rs.emitter.branch(body)?,
        }

        self.close_loop(rs)?;
        Ok(())
    }

    fn gen_switch(&mut self, rs: &mut RoutineState, switch_statement: &SwitchStatement) -> Result<()> {
        let end = rs.emitter.create_label();
        rs.loops.push(LoopContext {
            break_target: Some(end),
            continue_target: None,
            scope: rs.scope,
        });

        let case_labels: Vec<_> = switch_statement
            .cases
            .iter()
            .map(|_| rs.emitter.create_label())
            .collect();
        let default_target = switch_statement
            .cases
            .iter()
            .position(|case| case.test.is_none())
            .map(|index| case_labels[index])
            .unwrap_or(end);

        if let Some((low, high)) = dense_int_cases(switch_statement) {
            // Jump table: the helper maps the discriminant to an index in
            // [0, high-low] or to high-low+1 when it is not an integer in
            // range; out-of-range indices fall through to the default.
            self.gen_boxed(rs, &switch_statement.discriminant)?;
            rs.emitter.load_int32(low)?;
            rs.emitter.load_int32(high)?;
            rs.emitter.call_static(&self.wk.make_switch_index)?;

            let mut table = vec![default_target; (high - low + 1) as usize];
            for (index, case) in switch_statement.cases.iter().enumerate() {
                if let Some(Expression::Number(n)) = &case.test {
                    table[(*n as i32 - low) as usize] = case_labels[index];
                }
            }
            rs.emitter.switch(&table)?;
            rs.emitter.branch(default_target)?;
        } else {
            // Strict-equality comparison chain over a saved discriminant.
            let discriminant = rs
                .emitter
                .declare_variable(ValueKind::Object, Some("switch value"))?;
            self.gen_boxed(rs, &switch_statement.discriminant)?;
            rs.emitter.store_variable(discriminant)?;
            for (index, case) in switch_statement.cases.iter().enumerate() {
                if let Some(test) = &case.test {
                    rs.emitter.load_variable(discriminant)?;
                    self.gen_boxed(rs, test)?;
                    rs.emitter.call_static(&self.wk.strict_equals)?;
                    rs.emitter.branch_if_not_zero(case_labels[index])?;
                }
            }
            rs.emitter.branch(default_target)?;
        }

        // Bodies in source order; fall-through between cases is implicit.
        for (index, case) in switch_statement.cases.iter().enumerate() {
            rs.emitter.define_label(case_labels[index])?;
            for inner in &case.body {
                self.gen_statement(rs, inner)?;
            }
        }

        rs.loops.pop();
        rs.emitter.define_label(end)?;
        Ok(())
    }

    fn gen_return(&mut self, rs: &mut RoutineState, argument: Option<&Expression>) -> Result<()> {
        let in_protected_region = !rs.emitter.active_regions.is_empty();
        if in_protected_region {
            // Unwind through the region: store the value and leave to the
            // shared epilogue.
            let site = self.return_site(rs)?;
            match argument {
                Some(expression) => self.gen_boxed(rs, expression)?,
                None => rs.emitter.load_field(&self.wk.undefined_value)?,
            }
            rs.emitter.store_variable(site.slot)?;
            rs.emitter.leave(site.label)?;
        } else {
            match argument {
                Some(expression) => self.gen_boxed(rs, expression)?,
                None => rs.emitter.load_field(&self.wk.undefined_value)?,
            }
            rs.emitter.ret()?;
        }
        Ok(())
    }

    fn gen_break(&mut self, rs: &mut RoutineState) -> Result<()> {
        let (target, loop_scope) = {
            let context = rs
                .loops
                .last_mut()
                .ok_or_else(|| Error::SyntaxError("break outside of a loop or switch".into()))?;
            let target = match context.break_target {
                Some(label) => label,
                None => {
                    let label = rs.emitter.create_label();
                    context.break_target = Some(label);
                    label
                }
            };
            (target, context.scope)
        };
        // Pop any with/catch scopes entered since the loop before leaving.
        self.gen_unwind_scopes(rs, loop_scope)?;
        rs.emitter.leave(target)?;
        Ok(())
    }

    fn gen_continue(&mut self, rs: &mut RoutineState) -> Result<()> {
        let (target, loop_scope) = rs
            .loops
            .iter()
            .rev()
            .find_map(|context| context.continue_target.map(|target| (target, context.scope)))
            .ok_or_else(|| Error::SyntaxError("continue outside of a loop".into()))?;
        self.gen_unwind_scopes(rs, loop_scope)?;
        rs.emitter.leave(target)?;
        Ok(())
    }

    /// Pops the innermost loop context and defines its break target when
    /// some `break` materialized one.
    fn close_loop(&mut self, rs: &mut RoutineState) -> Result<()> {
        let context = rs.loops.pop().expect("loop context pushed by caller");
        if let Some(break_target) = context.break_target {
            rs.emitter.define_label(break_target)?;
        }
        Ok(())
    }

    fn gen_try(&mut self, rs: &mut RoutineState, try_statement: &TryStatement) -> Result<()> {
        if try_statement.handler.is_none() && try_statement.finalizer.is_none() {
            for inner in &try_statement.block {
                self.gen_statement(rs, inner)?;
            }
            return Ok(());
        }

        rs.emitter.begin_exception_block();
        for inner in &try_statement.block {
            self.gen_statement(rs, inner)?;
        }

        if let Some(handler) = &try_statement.handler {
            let catch_type = self.wk.type_error.clone();
            rs.emitter.begin_catch_block(&catch_type)?;

            // Bind the exception in a one-slot scope of its own.
            let caught = rs
                .emitter
                .declare_variable(ValueKind::Object, Some("caught exception"))?;
            rs.emitter.store_variable(caught)?;
            rs.emitter.load_argument(0)?;
            rs.emitter.load_int32(1)?;
            rs.emitter.call_static(&self.wk.create_declarative_scope)?;
            rs.emitter.store_argument(0)?;
            rs.emitter.load_argument(0)?;
            rs.emitter.load_int32(0)?;
            rs.emitter.load_variable(caught)?;
            rs.emitter.call_static(&self.wk.scope_set_slot)?;

            let enclosing = rs.scope;
            let catch_scope = self.scopes.declarative(enclosing);
            self.scopes.declare(catch_scope, &handler.param.name);
            rs.scope = catch_scope;
            for inner in &handler.body {
                self.gen_statement(rs, inner)?;
            }
            rs.scope = enclosing;
            if !rs.emitter.is_indeterminate() {
                self.gen_leave_scope(rs)?;
            }
        }

        if let Some(finalizer) = &try_statement.finalizer {
            rs.emitter.begin_finally_block()?;
            for inner in finalizer {
                self.gen_statement(rs, inner)?;
            }
        }

        rs.emitter.end_exception_block()?;
        Ok(())
    }

    fn gen_with(&mut self, rs: &mut RoutineState, with_statement: &WithStatement) -> Result<()> {
        rs.emitter.load_argument(0)?;
        self.gen_boxed(rs, &with_statement.object)?;
        self.gen_enter_object_scope(rs)?;

        let enclosing = rs.scope;
        rs.scope = self.scopes.object(enclosing, true);
        self.gen_statement(rs, &with_statement.body)?;
        rs.scope = enclosing;

        if !rs.emitter.is_indeterminate() {
            self.gen_leave_scope(rs)?;
        }
        Ok(())
    }
}

/// Recognizes a small, dense, all-integer case set worth a jump table.
fn dense_int_cases(switch_statement: &SwitchStatement) -> Option<(i32, i32)> {
    let mut low = i32::MAX;
    let mut high = i32::MIN;
    let mut tested = 0usize;
    for case in &switch_statement.cases {
        match &case.test {
            None => {}
            Some(Expression::Number(n)) => {
                if n.fract() != 0.0 || *n < i32::MIN as f64 || *n > i32::MAX as f64 {
                    return None;
                }
                let value = *n as i32;
                low = low.min(value);
                high = high.max(value);
                tested += 1;
            }
            Some(_) => return None,
        }
    }
    if tested < 2 {
        return None;
    }
    let span = (high as i64 - low as i64) + 1;
    if span > 64 || span > 2 * tested as i64 {
        return None;
    }
    Some((low, high))
}
