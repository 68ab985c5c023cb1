//! Expression code generation.
//!
//! Expressions compile against their static type: provably-integer and
//! provably-double subtrees stay on the unboxed instruction set, everything
//! else round-trips through boxed values and the runtime helpers. The value
//! an expression pushes always matches `Expression::static_type`.

use crate::ast::{
    AssignmentExpression, BinaryExpression, BinaryOp, CallExpression, ConditionalExpression,
    Expression, MemberExpression, MemberKey, NewExpression, PropertyKey, StaticType, UnaryOp,
    UnaryExpression, UpdateExpression,
};
use crate::compiler::codegen::{MethodGenerator, RoutineState};
use crate::compiler::emitter::ElementKind;
use crate::compiler::labels::Label;
use crate::compiler::ValueKind;
use crate::Error;
use crate::Result;

impl MethodGenerator {
    /// Emits an expression, pushing one value of its static type.
    pub(crate) fn gen_expression(
        &mut self,
        rs: &mut RoutineState,
        expression: &Expression,
    ) -> Result<StaticType> {
        match expression {
            Expression::Number(n) => {
                if expression.static_type() == StaticType::Int32 {
                    rs.emitter.load_int32(*n as i32)?;
                    Ok(StaticType::Int32)
                } else {
                    rs.emitter.load_double(*n)?;
                    Ok(StaticType::Double)
                }
            }
            Expression::String(s) => {
                rs.emitter.load_string(s)?;
                Ok(StaticType::Value)
            }
            Expression::Boolean(b) => {
                rs.emitter.load_int32(*b as i32)?;
                Ok(StaticType::Boolean)
            }
            Expression::Null => {
                rs.emitter.load_null()?;
                Ok(StaticType::Value)
            }
            Expression::This => {
                rs.emitter.load_argument(1)?;
                Ok(StaticType::Value)
            }
            Expression::Identifier(id) => {
                self.gen_scope_get(rs, id, true)?;
                Ok(StaticType::Value)
            }
            Expression::Binary(binary) => self.gen_binary(rs, binary),
            Expression::Unary(unary) => self.gen_unary(rs, unary),
            Expression::Update(update) => self.gen_update(rs, update),
            Expression::Assignment(assignment) => self.gen_assignment(rs, assignment),
            Expression::Conditional(conditional) => self.gen_conditional(rs, conditional),
            Expression::Sequence(expressions) => self.gen_sequence(rs, expressions),
            Expression::Call(call) => self.gen_call(rs, call),
            Expression::New(new_expression) => self.gen_new(rs, new_expression),
            Expression::Member(member) => self.gen_member_get(rs, member),
            Expression::Array(elements) => self.gen_array(rs, elements),
            Expression::Object(properties) => self.gen_object(rs, properties),
            Expression::Function(function) => {
                let routine = self.generate_function(function, rs.scope)?;
                rs.emitter.load_argument(0)?;
                rs.emitter.load_int32(routine.token.as_u32() as i32)?;
                rs.emitter.call_static(&self.wk.create_closure)?;
                Ok(StaticType::Value)
            }
        }
    }

    /// Emits an expression and boxes the result when it is unboxed.
    pub(crate) fn gen_boxed(&mut self, rs: &mut RoutineState, expression: &Expression) -> Result<()> {
        let static_type = self.gen_expression(rs, expression)?;
        self.box_static(rs, static_type)
    }

    fn box_static(&mut self, rs: &mut RoutineState, static_type: StaticType) -> Result<()> {
        match static_type {
            StaticType::Int32 | StaticType::Double => {
                rs.emitter.box_value(&self.wk.type_number)?;
            }
            StaticType::Boolean => {
                rs.emitter.box_value(&self.wk.type_boolean)?;
            }
            StaticType::Value => {}
        }
        Ok(())
    }

    /// Emits an expression as an unboxed number: `Int32` stays an integer,
    /// everything else lands as a double.
    fn gen_numeric(&mut self, rs: &mut RoutineState, expression: &Expression) -> Result<StaticType> {
        match self.gen_expression(rs, expression)? {
            StaticType::Int32 | StaticType::Boolean => Ok(StaticType::Int32),
            StaticType::Double => Ok(StaticType::Double),
            StaticType::Value => {
                rs.emitter.call_static(&self.wk.to_number)?;
                Ok(StaticType::Double)
            }
        }
    }

    /// Emits an expression as an unboxed double.
    fn gen_double(&mut self, rs: &mut RoutineState, expression: &Expression) -> Result<()> {
        if self.gen_numeric(rs, expression)? == StaticType::Int32 {
            rs.emitter.convert_to_double()?;
        }
        Ok(())
    }

    /// Emits an expression as a 32-bit integer with ToInt32 semantics.
    fn gen_int32(&mut self, rs: &mut RoutineState, expression: &Expression) -> Result<()> {
        match self.gen_expression(rs, expression)? {
            StaticType::Int32 | StaticType::Boolean => {}
            StaticType::Double => {
                // Modular ToInt32 is the runtime's job.
                rs.emitter.box_value(&self.wk.type_number)?;
                rs.emitter.call_static(&self.wk.to_int32)?;
            }
            StaticType::Value => {
                rs.emitter.call_static(&self.wk.to_int32)?;
            }
        }
        Ok(())
    }

    /// Emits an expression as an `Int32` truthiness flag.
    fn gen_condition_int(&mut self, rs: &mut RoutineState, expression: &Expression) -> Result<()> {
        match self.gen_expression(rs, expression)? {
            StaticType::Int32 | StaticType::Boolean => {}
            StaticType::Double => {
                // 0 and NaN are falsy; let the runtime decide.
                rs.emitter.box_value(&self.wk.type_number)?;
                rs.emitter.call_static(&self.wk.to_boolean)?;
            }
            StaticType::Value => {
                rs.emitter.call_static(&self.wk.to_boolean)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Branching on conditions
    // ========================================================================

    /// Emits a conditional branch on a test expression, fusing comparison
    /// operators into the branch instruction where operand types allow.
    pub(crate) fn gen_branch_if(
        &mut self,
        rs: &mut RoutineState,
        test: &Expression,
        target: Label,
        when_true: bool,
    ) -> Result<()> {
        match test {
            Expression::Unary(unary) if unary.op == UnaryOp::LogicalNot => {
                self.gen_branch_if(rs, &unary.operand, target, !when_true)
            }
            Expression::Binary(binary) if binary.op == BinaryOp::LogicalAnd => {
                if when_true {
                    let fall_through = rs.emitter.create_label();
                    self.gen_branch_if(rs, &binary.left, fall_through, false)?;
                    self.gen_branch_if(rs, &binary.right, target, true)?;
                    rs.emitter.define_label(fall_through)?;
                } else {
                    self.gen_branch_if(rs, &binary.left, target, false)?;
                    self.gen_branch_if(rs, &binary.right, target, false)?;
                }
                Ok(())
            }
            Expression::Binary(binary) if binary.op == BinaryOp::LogicalOr => {
                if when_true {
                    self.gen_branch_if(rs, &binary.left, target, true)?;
                    self.gen_branch_if(rs, &binary.right, target, true)?;
                } else {
                    let fall_through = rs.emitter.create_label();
                    self.gen_branch_if(rs, &binary.left, fall_through, true)?;
                    self.gen_branch_if(rs, &binary.right, target, false)?;
                    rs.emitter.define_label(fall_through)?;
                }
                Ok(())
            }
            Expression::Binary(binary)
                if binary.op.is_comparison() && comparable_unboxed(binary) =>
            {
                self.gen_fused_comparison_branch(rs, binary, target, when_true)
            }
            _ => {
                self.gen_condition_int(rs, test)?;
                if when_true {
                    rs.emitter.branch_if_not_zero(target)?;
                } else {
                    rs.emitter.branch_if_zero(target)?;
                }
                Ok(())
            }
        }
    }

    fn gen_fused_comparison_branch(
        &mut self,
        rs: &mut RoutineState,
        binary: &BinaryExpression,
        target: Label,
        when_true: bool,
    ) -> Result<()> {
        let int_mode = int_comparable(binary);
        if int_mode {
            self.gen_numeric(rs, &binary.left)?;
            self.gen_numeric(rs, &binary.right)?;
        } else {
            self.gen_double(rs, &binary.left)?;
            self.gen_double(rs, &binary.right)?;
        }
        use BinaryOp::*;
        match (binary.op, when_true, int_mode) {
            (Equal | StrictEqual, true, _) => rs.emitter.branch_if_equal(target),
            (Equal | StrictEqual, false, _) => rs.emitter.branch_if_not_equal(target),
            (NotEqual | StrictNotEqual, true, _) => rs.emitter.branch_if_not_equal(target),
            (NotEqual | StrictNotEqual, false, _) => rs.emitter.branch_if_equal(target),
            (LessThan, true, _) => rs.emitter.branch_if_less(target),
            (LessThan, false, true) => rs.emitter.branch_if_greater_or_equal(target),
            // The negated float forms branch on unordered, so NaN exits.
            (LessThan, false, false) => rs.emitter.branch_if_greater_or_equal_unsigned(target),
            (LessThanOrEqual, true, _) => rs.emitter.branch_if_less_or_equal(target),
            (LessThanOrEqual, false, true) => rs.emitter.branch_if_greater(target),
            (LessThanOrEqual, false, false) => rs.emitter.branch_if_greater_unsigned(target),
            (GreaterThan, true, _) => rs.emitter.branch_if_greater(target),
            (GreaterThan, false, true) => rs.emitter.branch_if_less_or_equal(target),
            (GreaterThan, false, false) => rs.emitter.branch_if_less_or_equal_unsigned(target),
            (GreaterThanOrEqual, true, _) => rs.emitter.branch_if_greater_or_equal(target),
            (GreaterThanOrEqual, false, true) => rs.emitter.branch_if_less(target),
            (GreaterThanOrEqual, false, false) => rs.emitter.branch_if_less_unsigned(target),
            _ => unreachable!("caller filtered to comparisons"),
        }?;
        Ok(())
    }

    // ========================================================================
    // Operators
    // ========================================================================

    fn gen_binary(&mut self, rs: &mut RoutineState, binary: &BinaryExpression) -> Result<StaticType> {
        use BinaryOp::*;
        match binary.op {
            LogicalAnd | LogicalOr => self.gen_logical(rs, binary),
            Add => {
                let left = binary.left.static_type();
                let right = binary.right.static_type();
                if left == StaticType::Int32 && right == StaticType::Int32 {
                    self.gen_expression(rs, &binary.left)?;
                    self.gen_expression(rs, &binary.right)?;
                    rs.emitter.add()?;
                    Ok(StaticType::Int32)
                } else if left.is_numeric() && right.is_numeric() {
                    self.gen_double(rs, &binary.left)?;
                    self.gen_double(rs, &binary.right)?;
                    rs.emitter.add()?;
                    Ok(StaticType::Double)
                } else {
                    // May concatenate; defer to the runtime.
                    self.gen_boxed(rs, &binary.left)?;
                    self.gen_boxed(rs, &binary.right)?;
                    rs.emitter.call_static(&self.wk.add_values)?;
                    Ok(StaticType::Value)
                }
            }
            Subtract | Multiply | Remainder => {
                let int_mode = binary.left.static_type() == StaticType::Int32
                    && binary.right.static_type() == StaticType::Int32;
                if int_mode {
                    self.gen_expression(rs, &binary.left)?;
                    self.gen_expression(rs, &binary.right)?;
                } else {
                    self.gen_double(rs, &binary.left)?;
                    self.gen_double(rs, &binary.right)?;
                }
                match binary.op {
                    Subtract => rs.emitter.subtract()?,
                    Multiply => rs.emitter.multiply()?,
                    _ => rs.emitter.remainder()?,
                }
                Ok(if int_mode {
                    StaticType::Int32
                } else {
                    StaticType::Double
                })
            }
            Divide => {
                // Division always happens in doubles.
                self.gen_double(rs, &binary.left)?;
                self.gen_double(rs, &binary.right)?;
                rs.emitter.divide()?;
                Ok(StaticType::Double)
            }
            BitwiseAnd | BitwiseOr | BitwiseXor => {
                self.gen_int32(rs, &binary.left)?;
                self.gen_int32(rs, &binary.right)?;
                match binary.op {
                    BitwiseAnd => rs.emitter.bitwise_and()?,
                    BitwiseOr => rs.emitter.bitwise_or()?,
                    _ => rs.emitter.bitwise_xor()?,
                }
                Ok(StaticType::Int32)
            }
            ShiftLeft | ShiftRight => {
                self.gen_int32(rs, &binary.left)?;
                self.gen_int32(rs, &binary.right)?;
                rs.emitter.load_int32(31)?;
                rs.emitter.bitwise_and()?;
                if binary.op == ShiftLeft {
                    rs.emitter.shift_left()?;
                } else {
                    rs.emitter.shift_right()?;
                }
                Ok(StaticType::Int32)
            }
            ShiftRightUnsigned => {
                self.gen_int32(rs, &binary.left)?;
                self.gen_int32(rs, &binary.right)?;
                rs.emitter.load_int32(31)?;
                rs.emitter.bitwise_and()?;
                rs.emitter.shift_right_unsigned()?;
                // The result is an unsigned 32-bit quantity.
                rs.emitter.convert_unsigned_to_double()?;
                Ok(StaticType::Double)
            }
            _ => self.gen_comparison_value(rs, binary),
        }
    }

    fn gen_comparison_value(
        &mut self,
        rs: &mut RoutineState,
        binary: &BinaryExpression,
    ) -> Result<StaticType> {
        use BinaryOp::*;
        if comparable_unboxed(binary) {
            let int_mode = int_comparable(binary);
            if int_mode {
                self.gen_numeric(rs, &binary.left)?;
                self.gen_numeric(rs, &binary.right)?;
            } else {
                self.gen_double(rs, &binary.left)?;
                self.gen_double(rs, &binary.right)?;
            }
            match binary.op {
                Equal | StrictEqual => rs.emitter.compare_equal()?,
                NotEqual | StrictNotEqual => {
                    rs.emitter.compare_equal()?;
                    rs.emitter.load_int32(0)?;
                    rs.emitter.compare_equal()?;
                }
                LessThan => rs.emitter.compare_less_than()?,
                GreaterThan => rs.emitter.compare_greater_than()?,
                LessThanOrEqual => {
                    // !(a > b), with unordered folding to false.
                    if int_mode {
                        rs.emitter.compare_greater_than()?;
                    } else {
                        rs.emitter.compare_greater_than_unsigned()?;
                    }
                    rs.emitter.load_int32(0)?;
                    rs.emitter.compare_equal()?;
                }
                GreaterThanOrEqual => {
                    if int_mode {
                        rs.emitter.compare_less_than()?;
                    } else {
                        rs.emitter.compare_less_than_unsigned()?;
                    }
                    rs.emitter.load_int32(0)?;
                    rs.emitter.compare_equal()?;
                }
                _ => unreachable!("caller filtered to comparisons"),
            }
        } else {
            self.gen_boxed(rs, &binary.left)?;
            self.gen_boxed(rs, &binary.right)?;
            let (helper, negate) = match binary.op {
                Equal => (&self.wk.loose_equals, false),
                NotEqual => (&self.wk.loose_equals, true),
                StrictEqual => (&self.wk.strict_equals, false),
                StrictNotEqual => (&self.wk.strict_equals, true),
                LessThan => (&self.wk.compare_less, false),
                LessThanOrEqual => (&self.wk.compare_less_equal, false),
                GreaterThan => (&self.wk.compare_greater, false),
                GreaterThanOrEqual => (&self.wk.compare_greater_equal, false),
                _ => unreachable!("caller filtered to comparisons"),
            };
            let helper = helper.clone();
            rs.emitter.call_static(&helper)?;
            if negate {
                rs.emitter.load_int32(0)?;
                rs.emitter.compare_equal()?;
            }
        }
        Ok(StaticType::Boolean)
    }

    fn gen_logical(&mut self, rs: &mut RoutineState, binary: &BinaryExpression) -> Result<StaticType> {
        // Short-circuit on the boxed left value so the result is the
        // operand itself, not its truthiness.
        let end = rs.emitter.create_label();
        self.gen_boxed(rs, &binary.left)?;
        rs.emitter.duplicate()?;
        rs.emitter.call_static(&self.wk.to_boolean)?;
        if binary.op == BinaryOp::LogicalAnd {
            rs.emitter.branch_if_zero(end)?;
        } else {
            rs.emitter.branch_if_not_zero(end)?;
        }
        rs.emitter.pop()?;
        self.gen_boxed(rs, &binary.right)?;
        rs.emitter.define_label(end)?;
        Ok(StaticType::Value)
    }

    fn gen_unary(&mut self, rs: &mut RoutineState, unary: &UnaryExpression) -> Result<StaticType> {
        match unary.op {
            UnaryOp::Minus => {
                self.gen_double(rs, &unary.operand)?;
                rs.emitter.negate()?;
                Ok(StaticType::Double)
            }
            UnaryOp::Plus => {
                self.gen_double(rs, &unary.operand)?;
                Ok(StaticType::Double)
            }
            UnaryOp::LogicalNot => {
                self.gen_condition_int(rs, &unary.operand)?;
                rs.emitter.load_int32(0)?;
                rs.emitter.compare_equal()?;
                Ok(StaticType::Boolean)
            }
            UnaryOp::BitwiseNot => {
                self.gen_int32(rs, &unary.operand)?;
                rs.emitter.bitwise_not()?;
                Ok(StaticType::Int32)
            }
            UnaryOp::TypeOf => {
                // typeof never throws on an unresolvable name.
                if let Expression::Identifier(id) = unary.operand.as_ref() {
                    self.gen_scope_get(rs, id, false)?;
                } else {
                    self.gen_boxed(rs, &unary.operand)?;
                }
                rs.emitter.call_static(&self.wk.typeof_value)?;
                Ok(StaticType::Value)
            }
            UnaryOp::Void => {
                self.gen_expression(rs, &unary.operand)?;
                rs.emitter.pop()?;
                rs.emitter.load_field(&self.wk.undefined_value)?;
                Ok(StaticType::Value)
            }
            UnaryOp::Delete => match unary.operand.as_ref() {
                Expression::Member(member) => {
                    self.gen_boxed(rs, &member.object)?;
                    match &member.property {
                        MemberKey::Name(name) => rs.emitter.load_string(name)?,
                        MemberKey::Computed(key) => self.gen_boxed(rs, key)?,
                    }
                    rs.emitter.call_static(&self.wk.delete_member)?;
                    Ok(StaticType::Boolean)
                }
                Expression::Identifier(id) => {
                    // Bindings live on the global object if anywhere.
                    rs.emitter.load_field(&self.wk.global_instance)?;
                    rs.emitter.load_string(&id.name)?;
                    rs.emitter.call_static(&self.wk.delete_member)?;
                    Ok(StaticType::Boolean)
                }
                other => {
                    self.gen_expression(rs, other)?;
                    rs.emitter.pop()?;
                    rs.emitter.load_int32(1)?;
                    Ok(StaticType::Boolean)
                }
            },
        }
    }

    fn gen_update(&mut self, rs: &mut RoutineState, update: &UpdateExpression) -> Result<StaticType> {
        match update.target.as_ref() {
            Expression::Identifier(id) => {
                self.gen_scope_get(rs, id, true)?;
                rs.emitter.call_static(&self.wk.to_number)?;
                if update.prefix {
                    rs.emitter.load_double(1.0)?;
                    if update.increment {
                        rs.emitter.add()?;
                    } else {
                        rs.emitter.subtract()?;
                    }
                    rs.emitter.duplicate()?;
                } else {
                    rs.emitter.duplicate()?;
                    rs.emitter.load_double(1.0)?;
                    if update.increment {
                        rs.emitter.add()?;
                    } else {
                        rs.emitter.subtract()?;
                    }
                }
                rs.emitter.box_value(&self.wk.type_number)?;
                self.gen_scope_set(rs, id)?;
                Ok(StaticType::Double)
            }
            Expression::Member(member) => self.gen_member_update(rs, update, member),
            _ => Err(Error::SyntaxError(
                "invalid increment/decrement target".into(),
            )),
        }
    }

    fn gen_member_update(
        &mut self,
        rs: &mut RoutineState,
        update: &UpdateExpression,
        member: &MemberExpression,
    ) -> Result<StaticType> {
        // The receiver (and computed key) stay in dedicated slots across
        // the read-modify-write.
        let object_slot = rs.emitter.declare_variable(ValueKind::Object, None)?;
        self.gen_boxed(rs, &member.object)?;
        rs.emitter.store_variable(object_slot)?;

        let key_slot = match &member.property {
            MemberKey::Name(_) => None,
            MemberKey::Computed(key) => {
                let slot = rs.emitter.declare_variable(ValueKind::Object, None)?;
                self.gen_boxed(rs, key)?;
                rs.emitter.store_variable(slot)?;
                Some(slot)
            }
        };

        let cache = rs.emitter.allocate_cache_site();
        rs.emitter.load_variable(object_slot)?;
        match (&member.property, key_slot) {
            (MemberKey::Name(name), _) => {
                rs.emitter.load_string(name)?;
                rs.emitter.load_int32(cache)?;
                rs.emitter.call_static(&self.wk.get_member)?;
            }
            (MemberKey::Computed(_), Some(slot)) => {
                rs.emitter.load_variable(slot)?;
                rs.emitter.call_static(&self.wk.get_index)?;
            }
            _ => unreachable!("computed keys always spill"),
        }
        rs.emitter.call_static(&self.wk.to_number)?;

        if update.prefix {
            rs.emitter.load_double(1.0)?;
            if update.increment {
                rs.emitter.add()?;
            } else {
                rs.emitter.subtract()?;
            }
            rs.emitter.duplicate()?;
        } else {
            rs.emitter.duplicate()?;
            rs.emitter.load_double(1.0)?;
            if update.increment {
                rs.emitter.add()?;
            } else {
                rs.emitter.subtract()?;
            }
        }

        let value_slot = rs.emitter.declare_variable(ValueKind::Object, None)?;
        rs.emitter.box_value(&self.wk.type_number)?;
        rs.emitter.store_variable(value_slot)?;

        rs.emitter.load_variable(object_slot)?;
        match (&member.property, key_slot) {
            (MemberKey::Name(name), _) => {
                rs.emitter.load_string(name)?;
                rs.emitter.load_variable(value_slot)?;
                rs.emitter.load_int32(cache)?;
                rs.emitter.call_static(&self.wk.set_member)?;
            }
            (MemberKey::Computed(_), Some(slot)) => {
                rs.emitter.load_variable(slot)?;
                rs.emitter.load_variable(value_slot)?;
                rs.emitter.call_static(&self.wk.set_index)?;
            }
            _ => unreachable!("computed keys always spill"),
        }
        Ok(StaticType::Double)
    }

    fn gen_assignment(
        &mut self,
        rs: &mut RoutineState,
        assignment: &AssignmentExpression,
    ) -> Result<StaticType> {
        // Compound assignment folds into the equivalent binary expression.
        let value: Expression = match assignment.op {
            None => assignment.value.as_ref().clone(),
            Some(op) => Expression::Binary(BinaryExpression {
                op,
                left: assignment.target.clone(),
                right: assignment.value.clone(),
            }),
        };

        match assignment.target.as_ref() {
            Expression::Identifier(id) => {
                self.gen_boxed(rs, &value)?;
                rs.emitter.duplicate()?;
                self.gen_scope_set(rs, id)?;
            }
            Expression::Member(member) => {
                self.gen_boxed(rs, &member.object)?;
                match &member.property {
                    MemberKey::Name(name) => {
                        self.gen_boxed(rs, &value)?;
                        let value_slot = rs.emitter.declare_variable(ValueKind::Object, None)?;
                        rs.emitter.store_variable(value_slot)?;
                        let cache = rs.emitter.allocate_cache_site();
                        rs.emitter.load_string(name)?;
                        rs.emitter.load_variable(value_slot)?;
                        rs.emitter.load_int32(cache)?;
                        rs.emitter.call_static(&self.wk.set_member)?;
                        rs.emitter.load_variable(value_slot)?;
                    }
                    MemberKey::Computed(key) => {
                        self.gen_boxed(rs, key)?;
                        self.gen_boxed(rs, &value)?;
                        let value_slot = rs.emitter.declare_variable(ValueKind::Object, None)?;
                        rs.emitter.store_variable(value_slot)?;
                        rs.emitter.load_variable(value_slot)?;
                        rs.emitter.call_static(&self.wk.set_index)?;
                        rs.emitter.load_variable(value_slot)?;
                    }
                }
            }
            _ => {
                return Err(Error::SyntaxError("invalid assignment target".into()));
            }
        }
        Ok(StaticType::Value)
    }

    fn gen_conditional(
        &mut self,
        rs: &mut RoutineState,
        conditional: &ConditionalExpression,
    ) -> Result<StaticType> {
        let consequent_type = conditional.consequent.static_type();
        let alternate_type = conditional.alternate.static_type();
        let unified = if consequent_type == alternate_type {
            consequent_type
        } else {
            StaticType::Value
        };

        let alternate_target = rs.emitter.create_label();
        let end = rs.emitter.create_label();
        self.gen_branch_if(rs, &conditional.test, alternate_target, false)?;
        if unified == StaticType::Value {
            self.gen_boxed(rs, &conditional.consequent)?;
        } else {
            self.gen_expression(rs, &conditional.consequent)?;
        }
        rs.emitter.branch(end)?;
        rs.emitter.define_label(alternate_target)?;
        if unified == StaticType::Value {
            self.gen_boxed(rs, &conditional.alternate)?;
        } else {
            self.gen_expression(rs, &conditional.alternate)?;
        }
        rs.emitter.define_label(end)?;
        Ok(unified)
    }

    fn gen_sequence(
        &mut self,
        rs: &mut RoutineState,
        expressions: &[Expression],
    ) -> Result<StaticType> {
        let (last, rest) = expressions
            .split_last()
            .ok_or_else(|| Error::SyntaxError("empty sequence expression".into()))?;
        for expression in rest {
            self.gen_expression(rs, expression)?;
            rs.emitter.pop()?;
        }
        self.gen_expression(rs, last)
    }

    // ========================================================================
    // Calls, members, literals
    // ========================================================================

    fn gen_call(&mut self, rs: &mut RoutineState, call: &CallExpression) -> Result<StaticType> {
        // The helper takes (this, function, arguments).
        match call.callee.as_ref() {
            Expression::Identifier(id) => {
                self.gen_scope_call_target(rs, id)?;
            }
            Expression::Member(member) => {
                // The receiver is the object the member was read from.
                self.gen_boxed(rs, &member.object)?;
                rs.emitter.duplicate()?;
                match &member.property {
                    MemberKey::Name(name) => {
                        let cache = rs.emitter.allocate_cache_site();
                        rs.emitter.load_string(name)?;
                        rs.emitter.load_int32(cache)?;
                        rs.emitter.call_static(&self.wk.get_member)?;
                    }
                    MemberKey::Computed(key) => {
                        self.gen_boxed(rs, key)?;
                        rs.emitter.call_static(&self.wk.get_index)?;
                    }
                }
            }
            other => {
                self.gen_default_receiver(rs)?;
                self.gen_boxed(rs, other)?;
            }
        }
        self.gen_arguments_array(rs, &call.arguments)?;
        rs.emitter.call_static(&self.wk.call_value)?;
        Ok(StaticType::Value)
    }

    fn gen_new(&mut self, rs: &mut RoutineState, new_expression: &NewExpression) -> Result<StaticType> {
        self.gen_boxed(rs, &new_expression.callee)?;
        self.gen_arguments_array(rs, &new_expression.arguments)?;
        rs.emitter.call_static(&self.wk.construct)?;
        Ok(StaticType::Value)
    }

    /// Builds the boxed arguments array for a call.
    fn gen_arguments_array(&mut self, rs: &mut RoutineState, arguments: &[Expression]) -> Result<()> {
        rs.emitter.load_int32(arguments.len() as i32)?;
        rs.emitter.new_array(&self.wk.type_value)?;
        for (position, argument) in arguments.iter().enumerate() {
            rs.emitter.duplicate()?;
            rs.emitter.load_int32(position as i32)?;
            self.gen_boxed(rs, argument)?;
            rs.emitter.store_array_element(ElementKind::Ref)?;
        }
        Ok(())
    }

    fn gen_member_get(&mut self, rs: &mut RoutineState, member: &MemberExpression) -> Result<StaticType> {
        self.gen_boxed(rs, &member.object)?;
        match &member.property {
            MemberKey::Name(name) => {
                let cache = rs.emitter.allocate_cache_site();
                rs.emitter.load_string(name)?;
                rs.emitter.load_int32(cache)?;
                rs.emitter.call_static(&self.wk.get_member)?;
            }
            MemberKey::Computed(key) => {
                self.gen_boxed(rs, key)?;
                rs.emitter.call_static(&self.wk.get_index)?;
            }
        }
        Ok(StaticType::Value)
    }

    fn gen_array(
        &mut self,
        rs: &mut RoutineState,
        elements: &[Option<Expression>],
    ) -> Result<StaticType> {
        rs.emitter.load_int32(elements.len() as i32)?;
        rs.emitter.new_array(&self.wk.type_value)?;
        for (position, element) in elements.iter().enumerate() {
            rs.emitter.duplicate()?;
            rs.emitter.load_int32(position as i32)?;
            match element {
                Some(expression) => self.gen_boxed(rs, expression)?,
                None => rs.emitter.load_field(&self.wk.undefined_value)?,
            }
            rs.emitter.store_array_element(ElementKind::Ref)?;
        }
        rs.emitter.call_static(&self.wk.make_array)?;
        Ok(StaticType::Value)
    }

    fn gen_object(
        &mut self,
        rs: &mut RoutineState,
        properties: &[(PropertyKey, Expression)],
    ) -> Result<StaticType> {
        rs.emitter.call_static(&self.wk.new_plain_object)?;
        for (key, value) in properties {
            let name = match key {
                PropertyKey::Name(name) => name.clone(),
                PropertyKey::Number(n) => format!("{}", n),
            };
            let cache = rs.emitter.allocate_cache_site();
            rs.emitter.duplicate()?;
            rs.emitter.load_string(&name)?;
            self.gen_boxed(rs, value)?;
            rs.emitter.load_int32(cache)?;
            rs.emitter.call_static(&self.wk.set_member)?;
        }
        Ok(StaticType::Value)
    }
}

/// The comparison can run on unboxed numbers.
///
/// Relational operators coerce through ToNumber whenever either side is
/// already numeric (two strings compare as strings, but one known number
/// forces the numeric path). Equality only drops to numbers when both sides
/// are numeric: `null == 0` must stay false, so an unknown operand keeps the
/// boxed helper.
fn comparable_unboxed(binary: &BinaryExpression) -> bool {
    let numericish = |t: StaticType| t.is_numeric() || t == StaticType::Boolean;
    let left = binary.left.static_type();
    let right = binary.right.static_type();
    match binary.op {
        BinaryOp::LessThan
        | BinaryOp::LessThanOrEqual
        | BinaryOp::GreaterThan
        | BinaryOp::GreaterThanOrEqual => numericish(left) || numericish(right),
        _ => numericish(left) && numericish(right),
    }
}

/// Both operands are integers, so the integer comparison forms apply.
fn int_comparable(binary: &BinaryExpression) -> bool {
    let int_like = |t: StaticType| matches!(t, StaticType::Int32 | StaticType::Boolean);
    int_like(binary.left.static_type()) && int_like(binary.right.static_type())
}
