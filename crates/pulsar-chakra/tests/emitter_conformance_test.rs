//! Conformance tests over the public compilation surface.
//!
//! These drive the crate the way an embedding host would: build an AST,
//! compile it against a module, and inspect the loader payload.

use pulsar_chakra::ast::*;
use pulsar_chakra::compiler::disasm::{self, DecodedOperand};
use pulsar_chakra::compiler::emitter::Emitter;
use pulsar_chakra::compiler::ValueKind;
use pulsar_chakra::{compile_program, EmitError, Error, Module, OptimizationInfo};

fn ident(name: &str) -> Expression {
    Expression::Identifier(Identifier::new(name))
}

fn binary(op: BinaryOp, left: Expression, right: Expression) -> Expression {
    Expression::Binary(BinaryExpression {
        op,
        left: Box::new(left),
        right: Box::new(right),
    })
}

#[test]
fn test_compile_addition_program() {
    let module = Module::new();
    let program = Program::new(vec![Statement::Return(Some(binary(
        BinaryOp::Add,
        Expression::Number(1.0),
        Expression::Number(2.0),
    )))]);
    let routine = compile_program(&module, &program, OptimizationInfo::default()).unwrap();

    let mnemonics = disasm::mnemonics(&routine.code).unwrap();
    assert_eq!(
        mnemonics,
        vec!["ldc.i4.1", "ldc.i4.2", "add", "box", "ret"]
    );
    assert_eq!(routine.max_stack, 2);
    assert_eq!(routine.param_count, 0);
}

#[test]
fn test_display_lists_disassembly() {
    let module = Module::new();
    let program = Program::new(vec![Statement::Return(Some(Expression::Number(1.5)))]);
    let routine = compile_program(&module, &program, OptimizationInfo::default()).unwrap();

    let text = routine.to_string();
    assert!(text.contains(".routine <global>"));
    assert!(text.contains("ldc.r8 1.5"));
    assert!(text.contains("ret"));
}

#[test]
fn test_strict_mode_uses_undefined_receiver() {
    let build = || {
        Program::new(vec![Statement::Expression(Expression::Call(
            CallExpression {
                callee: Box::new(ident("f")),
                arguments: vec![],
            },
        ))])
    };

    let sloppy_module = Module::new();
    let sloppy = compile_program(&sloppy_module, &build(), OptimizationInfo::default()).unwrap();
    let strict_module = Module::new();
    let strict = compile_program(
        &strict_module,
        &build(),
        OptimizationInfo {
            strict_mode: true,
            debug_document: None,
        },
    )
    .unwrap();

    let global_field = sloppy_module.well_known().global_instance.token.as_u32();
    let undefined_field = strict_module.well_known().undefined_value.token.as_u32();

    let loads = |code: &[u8], token: u32| {
        disasm::disassemble(code)
            .unwrap()
            .into_iter()
            .filter(|inst| {
                inst.mnemonic == "ldsfld" && inst.operand == DecodedOperand::Token(token)
            })
            .count()
    };
    // Sloppy mode passes the global object as the receiver; strict mode
    // never touches it. (Both load `undefined` once for the epilogue.)
    assert_eq!(loads(&sloppy.code, global_field), 1);
    assert_eq!(loads(&strict.code, global_field), 0);
    assert_eq!(loads(&sloppy.code, undefined_field), 1);
    assert_eq!(loads(&strict.code, undefined_field), 2);
}

#[test]
fn test_exception_table_published_to_loader() {
    let module = Module::new();
    let program = Program::new(vec![Statement::Try(TryStatement {
        block: vec![Statement::Expression(Expression::Call(CallExpression {
            callee: Box::new(ident("f")),
            arguments: vec![],
        }))],
        handler: Some(CatchClause {
            param: Identifier::new("e"),
            body: vec![],
        }),
        finalizer: None,
    })]);
    let routine = compile_program(&module, &program, OptimizationInfo::default()).unwrap();

    let table = &routine.exception_table;
    assert_eq!(table[0], 0x41);
    assert_eq!(table.len(), 4 + 24);
    let try_start = u32::from_le_bytes(table[8..12].try_into().unwrap());
    let try_length = u32::from_le_bytes(table[12..16].try_into().unwrap());
    let handler_start = u32::from_le_bytes(table[16..20].try_into().unwrap());
    assert_eq!(try_start + try_length, handler_start);
    assert!((handler_start as usize) < routine.code.len());
}

#[test]
fn test_stack_underflow_is_invalid_emission() {
    let module = Module::new();
    let mut emitter = Emitter::new(module).with_kind_checking(true);
    emitter.load_int32(1).unwrap();
    let err: Error = emitter.add().unwrap_err().into();
    assert!(matches!(
        err,
        Error::InvalidEmission(EmitError::StackUnderflow)
    ));
}

#[test]
fn test_branch_to_undefined_label_fails_at_complete() {
    let module = Module::new();
    let mut emitter = Emitter::new(module).with_kind_checking(true);
    let label = emitter.create_label();
    emitter.branch(label).unwrap();
    assert_eq!(emitter.complete().unwrap_err(), EmitError::UndefinedLabel);
}

#[test]
fn test_duplicate_catch_detected() {
    let module = Module::new();
    let error_type = module.well_known().type_error.clone();
    let mut emitter = Emitter::new(module).with_kind_checking(true);
    emitter.begin_exception_block();
    emitter.no_operation().unwrap();
    emitter.begin_catch_block(&error_type).unwrap();
    emitter.pop().unwrap();
    assert_eq!(
        emitter.begin_catch_block(&error_type).unwrap_err(),
        EmitError::DuplicateCatch
    );
}

#[test]
fn test_round_trip_modulo_encoding_forms() {
    // Emit one value per encoding class and confirm the decoder replays the
    // call sequence with the short forms spelled out.
    let module = Module::new();
    let mut emitter = Emitter::new(module).with_kind_checking(true);
    emitter.load_int32(0).unwrap();
    emitter.load_int32(-1).unwrap();
    emitter.load_int32(100).unwrap();
    emitter.load_int32(70000).unwrap();
    emitter.load_double(2.5).unwrap();
    let slot = emitter.declare_variable(ValueKind::Float, None).unwrap();
    emitter.store_variable(slot).unwrap();
    for _ in 0..4 {
        emitter.pop().unwrap();
    }
    let completed = emitter.complete().unwrap();

    let listing = disasm::disassemble(&completed.code).unwrap();
    let replay: Vec<(&str, DecodedOperand)> = listing
        .into_iter()
        .map(|inst| (inst.mnemonic, inst.operand))
        .collect();
    assert_eq!(
        replay,
        vec![
            ("ldc.i4.0", DecodedOperand::None),
            ("ldc.i4.m1", DecodedOperand::None),
            ("ldc.i4.s", DecodedOperand::Int8(100)),
            ("ldc.i4", DecodedOperand::Int32(70000)),
            ("ldc.r8", DecodedOperand::Float64(2.5)),
            ("stloc.0", DecodedOperand::None),
            ("pop", DecodedOperand::None),
            ("pop", DecodedOperand::None),
            ("pop", DecodedOperand::None),
            ("pop", DecodedOperand::None),
        ]
    );
}

#[test]
fn test_max_stack_covers_every_prefix() {
    let module = Module::new();
    let program = Program::new(vec![Statement::Expression(Expression::Call(
        CallExpression {
            callee: Box::new(ident("f")),
            arguments: vec![
                Expression::Number(1.0),
                Expression::Number(2.0),
                Expression::Number(3.0),
            ],
        },
    ))]);
    let routine = compile_program(&module, &program, OptimizationInfo::default()).unwrap();
    // this + callee + array + (dup, index, boxed element) while storing.
    assert!(routine.max_stack >= 6);
    assert!(routine.max_stack < 16);
}
