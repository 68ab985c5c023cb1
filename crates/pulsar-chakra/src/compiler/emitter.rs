//! The instruction emitter: the stack machine's assembler.
//!
//! Appends opcodes and operands to a growable byte buffer while tracking the
//! evaluation-stack depth (and, in checked builds, the kind of every value on
//! it), so that malformed emission sequences fail at compile time instead of
//! corrupting the runtime.

use crate::compiler::exceptions::{FinishedRegion, RegionInProgress};
use crate::compiler::labels::{Fixup, LabelState};
use crate::compiler::locals::LocalTable;
use crate::compiler::opcode::{ExtOpCode, OpCode, EXTENDED_PREFIX};
use crate::compiler::{KindSet, ValueKind};
use crate::loader::{signature, FieldRef, MethodRef, Module, TypeRef};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// A malformed emission. Every variant is a code-generator bug: these are
/// never surfaced to script authors by a correct compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EmitError {
    /// A pop was requested while the evaluation stack was empty.
    #[error("evaluation stack underflow")]
    StackUnderflow,
    /// A popped value had a kind outside the instruction's accepted set.
    #[error("operand kind mismatch: expected {expected:?}, found {found:?}")]
    KindMismatch {
        /// Kinds the instruction accepts for this operand.
        expected: KindSet,
        /// Kind actually found on the stack.
        found: ValueKind,
    },
    /// The live stack state disagrees with a label's recorded state, or an
    /// instruction was emitted in the indeterminate state without a label.
    #[error("evaluation stack state differs from the branch target's")]
    StackMismatch,
    /// A branch fix-up references a label that was never defined.
    #[error("branch to undefined label")]
    UndefinedLabel,
    /// `define_label` was called twice on the same label.
    #[error("label defined twice")]
    DoubleDefinedLabel,
    /// Local slot index exceeded the encodable range.
    #[error("too many local variables")]
    TooManyLocals,
    /// Argument index exceeded the declared parameter list.
    #[error("argument index out of range")]
    TooManyArguments,
    /// `complete` was called with an exception region still open.
    #[error("unclosed exception region")]
    UnclosedExceptionRegion,
    /// Two catch clauses with the same type token in one region.
    #[error("duplicate catch clause for the same exception type")]
    DuplicateCatch,
    /// A second filter clause in one region.
    #[error("duplicate filter clause")]
    DuplicateFilter,
    /// A second finally clause in one region.
    #[error("duplicate finally clause")]
    DuplicateFinally,
    /// A second fault clause in one region.
    #[error("duplicate fault clause")]
    DuplicateFault,
    /// `end_exception_block` on a region with no clauses.
    #[error("exception region has no clauses")]
    EmptyExceptionRegion,
    /// `end_filter` outside the filter portion of a filter clause.
    #[error("endfilter outside a filter clause")]
    MisplacedEndFilter,
    /// `end_finally` outside a finally clause.
    #[error("endfinally outside a finally clause")]
    MisplacedEndFinally,
    /// A clause or region terminator with no active exception region.
    #[error("exception clause outside an exception region")]
    MisplacedHandler,
}

/// Element kind for array access instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    /// Signed 8-bit integer element
    Int8,
    /// Unsigned 8-bit integer element
    UInt8,
    /// Signed 16-bit integer element
    Int16,
    /// Unsigned 16-bit integer element
    UInt16,
    /// Signed 32-bit integer element
    Int32,
    /// Unsigned 32-bit integer element
    UInt32,
    /// Signed 64-bit integer element
    Int64,
    /// Unsigned 64-bit integer element; shares opcodes with [`ElementKind::Int64`]
    UInt64,
    /// Native-width integer element
    NativeInt,
    /// IEEE-754 single element
    Float32,
    /// IEEE-754 double element
    Float64,
    /// Object reference element
    Ref,
}

impl ElementKind {
    fn load_op(self) -> OpCode {
        match self {
            ElementKind::Int8 => OpCode::LdelemI1,
            ElementKind::UInt8 => OpCode::LdelemU1,
            ElementKind::Int16 => OpCode::LdelemI2,
            ElementKind::UInt16 => OpCode::LdelemU2,
            ElementKind::Int32 => OpCode::LdelemI4,
            ElementKind::UInt32 => OpCode::LdelemU4,
            // u64 element loads reuse the signed form (loader ABI).
            ElementKind::Int64 | ElementKind::UInt64 => OpCode::LdelemI8,
            ElementKind::NativeInt => OpCode::LdelemI,
            ElementKind::Float32 => OpCode::LdelemR4,
            ElementKind::Float64 => OpCode::LdelemR8,
            ElementKind::Ref => OpCode::LdelemRef,
        }
    }

    fn store_op(self) -> OpCode {
        match self {
            ElementKind::Int8 | ElementKind::UInt8 => OpCode::StelemI1,
            ElementKind::Int16 | ElementKind::UInt16 => OpCode::StelemI2,
            ElementKind::Int32 | ElementKind::UInt32 => OpCode::StelemI4,
            // u64 element stores reuse the signed form (loader ABI).
            ElementKind::Int64 | ElementKind::UInt64 => OpCode::StelemI8,
            ElementKind::NativeInt => OpCode::StelemI,
            ElementKind::Float32 => OpCode::StelemR4,
            ElementKind::Float64 => OpCode::StelemR8,
            ElementKind::Ref => OpCode::StelemRef,
        }
    }

    fn stack_kind(self) -> ValueKind {
        match self {
            ElementKind::Int8
            | ElementKind::UInt8
            | ElementKind::Int16
            | ElementKind::UInt16
            | ElementKind::Int32
            | ElementKind::UInt32 => ValueKind::Int32,
            ElementKind::Int64 | ElementKind::UInt64 => ValueKind::Int64,
            ElementKind::NativeInt => ValueKind::NativeInt,
            ElementKind::Float32 | ElementKind::Float64 => ValueKind::Float,
            ElementKind::Ref => ValueKind::Object,
        }
    }
}

/// The payload handed to the runtime loader when emission finishes.
#[derive(Debug, Clone)]
pub struct CompletedCode {
    /// The finalized instruction stream, all fix-ups patched.
    pub code: Vec<u8>,
    /// Maximum evaluation-stack depth reached at any point.
    pub max_stack: u32,
    /// Encoded local-variable signature blob.
    pub local_signature: Vec<u8>,
    /// Serialized exception table; empty when no regions were built.
    pub exception_table: Vec<u8>,
    /// Number of inline property-cache sites allocated during emission.
    pub cache_sites: u32,
}

/// Assembles instructions for one routine.
///
/// One emitter, one label set, one local table, and one region stack exist
/// per routine generation; the emitter is consumed by [`Emitter::complete`].
pub struct Emitter {
    pub(crate) module: Arc<Module>,
    pub(crate) code: Vec<u8>,
    pub(crate) stack_depth: u32,
    pub(crate) max_stack: u32,
    pub(crate) indeterminate: bool,
    /// `Some` when per-value kind checking is enabled (checked builds).
    pub(crate) kinds: Option<Vec<ValueKind>>,
    pub(crate) labels: Vec<LabelState>,
    pub(crate) fixups: Vec<Fixup>,
    pub(crate) locals: LocalTable,
    pub(crate) params: Vec<ValueKind>,
    pub(crate) return_kind: Option<ValueKind>,
    pub(crate) active_regions: Vec<RegionInProgress>,
    pub(crate) done_regions: Vec<FinishedRegion>,
    pub(crate) cache_sites: u32,
}

impl Emitter {
    /// Creates an emitter over a fresh code buffer with no parameters and no
    /// return value. Kind checking follows the build profile.
    pub fn new(module: Arc<Module>) -> Self {
        Emitter {
            module,
            code: Vec::new(),
            stack_depth: 0,
            max_stack: 0,
            indeterminate: false,
            kinds: cfg!(debug_assertions).then(Vec::new),
            labels: Vec::new(),
            fixups: Vec::new(),
            locals: LocalTable::new(),
            params: Vec::new(),
            return_kind: None,
            active_regions: Vec::new(),
            done_regions: Vec::new(),
            cache_sites: 0,
        }
    }

    /// Creates an emitter for a script routine: argument 0 is the scope
    /// handle, argument 1 the `this` receiver, then `user_params` boxed user
    /// arguments; the routine returns a boxed value.
    pub fn for_routine(module: Arc<Module>, user_params: u16) -> Self {
        let mut emitter = Emitter::new(module);
        emitter.params = vec![ValueKind::Object; 2 + user_params as usize];
        emitter.return_kind = Some(ValueKind::Object);
        emitter
    }

    /// Overrides the formal parameter kinds.
    pub fn with_params(mut self, params: Vec<ValueKind>) -> Self {
        self.params = params;
        self
    }

    /// Overrides the return kind (`None` for void).
    pub fn with_return(mut self, return_kind: Option<ValueKind>) -> Self {
        self.return_kind = return_kind;
        self
    }

    /// Forces per-value kind checking on or off regardless of build profile.
    pub fn with_kind_checking(mut self, enabled: bool) -> Self {
        self.kinds = enabled.then(Vec::new);
        self
    }

    /// The module this emitter writes tokens for.
    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    /// Current write position in the code buffer.
    pub fn offset(&self) -> u32 {
        self.code.len() as u32
    }

    /// Current evaluation-stack depth.
    pub fn stack_depth(&self) -> u32 {
        self.stack_depth
    }

    /// Whether the emitter is past an unconditional terminator and waiting
    /// for a label to re-establish the stack.
    pub fn is_indeterminate(&self) -> bool {
        self.indeterminate
    }

    // ========================================================================
    // Buffer primitives
    // ========================================================================

    fn ensure_capacity(&mut self, extra: usize) {
        let needed = self.code.len() + extra;
        if needed > self.code.capacity() {
            // Double the buffer whenever a pending write would overflow.
            let grown = self.code.capacity().max(64) * 2;
            self.code
                .reserve_exact(grown.max(needed) - self.code.len());
        }
    }

    pub(crate) fn write_u8(&mut self, value: u8) {
        self.ensure_capacity(1);
        self.code.push(value);
    }

    pub(crate) fn write_u16(&mut self, value: u16) {
        self.ensure_capacity(2);
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn write_i32(&mut self, value: i32) {
        self.ensure_capacity(4);
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn write_u32(&mut self, value: u32) {
        self.ensure_capacity(4);
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn write_u64(&mut self, value: u64) {
        self.ensure_capacity(8);
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn op(&mut self, op: OpCode) {
        self.write_u8(op.byte());
    }

    pub(crate) fn ext_op(&mut self, op: ExtOpCode) {
        self.ensure_capacity(2);
        self.code.push(EXTENDED_PREFIX);
        self.code.push(op.byte());
    }

    // ========================================================================
    // Stack bookkeeping
    // ========================================================================

    pub(crate) fn require_reachable(&self) -> Result<(), EmitError> {
        if self.indeterminate {
            // Emission after a terminator must be reached through a label.
            Err(EmitError::StackMismatch)
        } else {
            Ok(())
        }
    }

    pub(crate) fn push_kind(&mut self, kind: ValueKind) {
        self.stack_depth += 1;
        if self.stack_depth > self.max_stack {
            self.max_stack = self.stack_depth;
        }
        if let Some(kinds) = &mut self.kinds {
            kinds.push(kind);
        }
    }

    pub(crate) fn pop_kind(&mut self, expected: KindSet) -> Result<ValueKind, EmitError> {
        if self.stack_depth == 0 {
            return Err(EmitError::StackUnderflow);
        }
        self.stack_depth -= 1;
        if let Some(kinds) = &mut self.kinds {
            let found = kinds.pop().expect("kind stack tracks depth");
            if !expected.contains(found.as_set()) {
                return Err(EmitError::KindMismatch { expected, found });
            }
            Ok(found)
        } else {
            Ok(ValueKind::Object)
        }
    }

    /// Sets the stack to an exact state, used at handler entry points.
    pub(crate) fn replace_stack(&mut self, kinds: &[ValueKind]) {
        self.stack_depth = kinds.len() as u32;
        if self.stack_depth > self.max_stack {
            self.max_stack = self.stack_depth;
        }
        if let Some(tracked) = &mut self.kinds {
            tracked.clear();
            tracked.extend_from_slice(kinds);
        }
        self.indeterminate = false;
    }

    pub(crate) fn clear_stack(&mut self) {
        self.stack_depth = 0;
        if let Some(kinds) = &mut self.kinds {
            kinds.clear();
        }
    }

    // ========================================================================
    // Constants
    // ========================================================================

    /// Pushes a null object reference.
    pub fn load_null(&mut self) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.op(OpCode::Ldnull);
        self.push_kind(ValueKind::Object);
        Ok(())
    }

    /// Pushes an interned string literal.
    pub fn load_string(&mut self, text: &str) -> Result<(), EmitError> {
        self.require_reachable()?;
        let token = self.module.intern_string(text);
        self.op(OpCode::Ldstr);
        self.write_u32(token.as_u32());
        self.push_kind(ValueKind::Object);
        Ok(())
    }

    /// Pushes a 32-bit integer constant using the shortest encoding.
    pub fn load_int32(&mut self, value: i32) -> Result<(), EmitError> {
        self.require_reachable()?;
        match value {
            -1 => self.op(OpCode::LdcI4M1),
            0..=8 => self.write_u8(OpCode::LdcI40.byte() + value as u8),
            -128..=127 => {
                self.op(OpCode::LdcI4S);
                self.write_u8(value as i8 as u8);
            }
            _ => {
                self.op(OpCode::LdcI4);
                self.write_i32(value);
            }
        }
        self.push_kind(ValueKind::Int32);
        Ok(())
    }

    /// Pushes a 64-bit integer constant.
    pub fn load_int64(&mut self, value: i64) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.op(OpCode::LdcI8);
        self.write_u64(value as u64);
        self.push_kind(ValueKind::Int64);
        Ok(())
    }

    /// Pushes a double constant (IEEE-754 bits, little-endian).
    pub fn load_double(&mut self, value: f64) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.op(OpCode::LdcR8);
        self.write_u64(value.to_bits());
        self.push_kind(ValueKind::Float);
        Ok(())
    }

    // ========================================================================
    // Stack manipulation
    // ========================================================================

    /// Discards the top of the stack.
    pub fn pop(&mut self) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.pop_kind(KindSet::ANY)?;
        self.op(OpCode::Pop);
        Ok(())
    }

    /// Duplicates the top of the stack, preserving its kind.
    pub fn duplicate(&mut self) -> Result<(), EmitError> {
        self.require_reachable()?;
        if self.stack_depth == 0 {
            return Err(EmitError::StackUnderflow);
        }
        let top = self.kinds.as_ref().and_then(|kinds| kinds.last().copied());
        self.op(OpCode::Dup);
        self.stack_depth += 1;
        if self.stack_depth > self.max_stack {
            self.max_stack = self.stack_depth;
        }
        if let (Some(kinds), Some(kind)) = (&mut self.kinds, top) {
            kinds.push(kind);
        }
        Ok(())
    }

    // ========================================================================
    // Fields
    // ========================================================================

    /// Pushes a field's value; instance fields pop their receiver first.
    pub fn load_field(&mut self, field: &FieldRef) -> Result<(), EmitError> {
        self.require_reachable()?;
        if field.is_static {
            self.op(OpCode::Ldsfld);
        } else {
            self.pop_kind(KindSet::OBJECT)?;
            self.op(OpCode::Ldfld);
        }
        self.write_u32(field.token.as_u32());
        self.push_kind(field.kind);
        Ok(())
    }

    /// Stores the top of the stack into a field.
    pub fn store_field(&mut self, field: &FieldRef) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.pop_kind(field.kind.as_set())?;
        if field.is_static {
            self.op(OpCode::Stsfld);
        } else {
            self.pop_kind(KindSet::OBJECT)?;
            self.op(OpCode::Stfld);
        }
        self.write_u32(field.token.as_u32());
        Ok(())
    }

    // ========================================================================
    // Arithmetic and bitwise
    // ========================================================================

    fn binary_numeric(&mut self, op: OpCode) -> Result<(), EmitError> {
        self.require_reachable()?;
        let rhs = self.pop_kind(KindSet::NUMERIC)?;
        let lhs = self.pop_kind(KindSet::NUMERIC)?;
        if self.kinds.is_some() && lhs != rhs {
            return Err(EmitError::KindMismatch {
                expected: rhs.as_set(),
                found: lhs,
            });
        }
        self.op(op);
        self.push_kind(lhs);
        Ok(())
    }

    fn binary_integer(&mut self, op: OpCode) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.pop_kind(KindSet::INTEGER)?;
        self.pop_kind(KindSet::INTEGER)?;
        self.op(op);
        self.push_kind(ValueKind::Int32);
        Ok(())
    }

    /// Adds the top two values; both operands must share a numeric kind.
    pub fn add(&mut self) -> Result<(), EmitError> {
        self.binary_numeric(OpCode::Add)
    }

    /// Subtracts the top value from the one beneath it.
    pub fn subtract(&mut self) -> Result<(), EmitError> {
        self.binary_numeric(OpCode::Sub)
    }

    /// Multiplies the top two values.
    pub fn multiply(&mut self) -> Result<(), EmitError> {
        self.binary_numeric(OpCode::Mul)
    }

    /// Divides the value beneath the top by the top value.
    pub fn divide(&mut self) -> Result<(), EmitError> {
        self.binary_numeric(OpCode::Div)
    }

    /// Computes the remainder of the division.
    pub fn remainder(&mut self) -> Result<(), EmitError> {
        self.binary_numeric(OpCode::Rem)
    }

    /// Negates the top value in place.
    pub fn negate(&mut self) -> Result<(), EmitError> {
        self.require_reachable()?;
        let kind = self.pop_kind(KindSet::NUMERIC)?;
        self.op(OpCode::Neg);
        self.push_kind(kind);
        Ok(())
    }

    /// Bitwise AND of two 32-bit integers.
    pub fn bitwise_and(&mut self) -> Result<(), EmitError> {
        self.binary_integer(OpCode::And)
    }

    /// Bitwise OR of two 32-bit integers.
    pub fn bitwise_or(&mut self) -> Result<(), EmitError> {
        self.binary_integer(OpCode::Or)
    }

    /// Bitwise XOR of two 32-bit integers.
    pub fn bitwise_xor(&mut self) -> Result<(), EmitError> {
        self.binary_integer(OpCode::Xor)
    }

    /// Bitwise complement of a 32-bit integer.
    pub fn bitwise_not(&mut self) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.pop_kind(KindSet::INTEGER)?;
        self.op(OpCode::Not);
        self.push_kind(ValueKind::Int32);
        Ok(())
    }

    /// Shifts left; the shift count is on top.
    pub fn shift_left(&mut self) -> Result<(), EmitError> {
        self.binary_integer(OpCode::Shl)
    }

    /// Arithmetic shift right.
    pub fn shift_right(&mut self) -> Result<(), EmitError> {
        self.binary_integer(OpCode::Shr)
    }

    /// Logical shift right.
    pub fn shift_right_unsigned(&mut self) -> Result<(), EmitError> {
        self.binary_integer(OpCode::ShrUn)
    }

    // ========================================================================
    // Comparisons
    // ========================================================================

    fn compare(&mut self, op: ExtOpCode, accepts: KindSet) -> Result<(), EmitError> {
        self.require_reachable()?;
        let rhs = self.pop_kind(accepts)?;
        let lhs = self.pop_kind(accepts)?;
        if self.kinds.is_some() && lhs != rhs {
            return Err(EmitError::KindMismatch {
                expected: rhs.as_set(),
                found: lhs,
            });
        }
        self.ext_op(op);
        self.push_kind(ValueKind::Int32);
        Ok(())
    }

    /// Pushes 1 when the top two values are equal, else 0.
    pub fn compare_equal(&mut self) -> Result<(), EmitError> {
        self.compare(ExtOpCode::Ceq, KindSet::NUMERIC | KindSet::OBJECT)
    }

    /// Signed/ordered greater-than comparison.
    pub fn compare_greater_than(&mut self) -> Result<(), EmitError> {
        self.compare(ExtOpCode::Cgt, KindSet::NUMERIC)
    }

    /// Unsigned/unordered greater-than comparison.
    pub fn compare_greater_than_unsigned(&mut self) -> Result<(), EmitError> {
        self.compare(ExtOpCode::CgtUn, KindSet::NUMERIC | KindSet::OBJECT)
    }

    /// Signed/ordered less-than comparison.
    pub fn compare_less_than(&mut self) -> Result<(), EmitError> {
        self.compare(ExtOpCode::Clt, KindSet::NUMERIC)
    }

    /// Unsigned/unordered less-than comparison.
    pub fn compare_less_than_unsigned(&mut self) -> Result<(), EmitError> {
        self.compare(ExtOpCode::CltUn, KindSet::NUMERIC)
    }

    // ========================================================================
    // Conversions
    // ========================================================================

    /// Converts the top numeric value to a 32-bit integer.
    pub fn convert_to_integer(&mut self) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.pop_kind(KindSet::NUMERIC)?;
        self.op(OpCode::ConvI4);
        self.push_kind(ValueKind::Int32);
        Ok(())
    }

    /// Converts the top numeric value to an unsigned 32-bit integer.
    pub fn convert_to_unsigned_integer(&mut self) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.pop_kind(KindSet::NUMERIC)?;
        self.op(OpCode::ConvU4);
        self.push_kind(ValueKind::Int32);
        Ok(())
    }

    /// Converts the top numeric value to a double.
    pub fn convert_to_double(&mut self) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.pop_kind(KindSet::NUMERIC)?;
        self.op(OpCode::ConvR8);
        self.push_kind(ValueKind::Float);
        Ok(())
    }

    /// Converts the top integer to a double, treating it as unsigned.
    pub fn convert_unsigned_to_double(&mut self) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.pop_kind(KindSet::INTEGER)?;
        self.op(OpCode::ConvRUn);
        self.op(OpCode::ConvR8);
        self.push_kind(ValueKind::Float);
        Ok(())
    }

    /// Boxes the top value type into an object reference.
    pub fn box_value(&mut self, ty: &TypeRef) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.pop_kind(KindSet::BOXABLE)?;
        self.op(OpCode::Box);
        self.write_u32(ty.token.as_u32());
        self.push_kind(ValueKind::Object);
        Ok(())
    }

    // ========================================================================
    // Calls and object creation
    // ========================================================================

    /// Calls a static method, validating argument kinds against its
    /// signature and pushing its return value when non-void.
    pub fn call_static(&mut self, method: &MethodRef) -> Result<(), EmitError> {
        self.require_reachable()?;
        for param in method.params.iter().rev() {
            self.pop_kind(param.as_set())?;
        }
        self.op(OpCode::Call);
        self.write_u32(method.token.as_u32());
        if let Some(kind) = method.return_kind {
            self.push_kind(kind);
        }
        Ok(())
    }

    /// Calls an instance method virtually; the receiver sits beneath the
    /// arguments.
    pub fn call_virtual(&mut self, method: &MethodRef) -> Result<(), EmitError> {
        self.require_reachable()?;
        for param in method.params.iter().rev() {
            self.pop_kind(param.as_set())?;
        }
        self.pop_kind(KindSet::OBJECT)?;
        self.op(OpCode::Callvirt);
        self.write_u32(method.token.as_u32());
        if let Some(kind) = method.return_kind {
            self.push_kind(kind);
        }
        Ok(())
    }

    /// Allocates an object and runs the given constructor over the popped
    /// arguments, pushing the new instance.
    pub fn new_object(&mut self, constructor: &MethodRef) -> Result<(), EmitError> {
        self.require_reachable()?;
        for param in constructor.params.iter().rev() {
            self.pop_kind(param.as_set())?;
        }
        self.op(OpCode::Newobj);
        self.write_u32(constructor.token.as_u32());
        self.push_kind(ValueKind::Object);
        Ok(())
    }

    // ========================================================================
    // Arrays
    // ========================================================================

    /// Allocates an array of the given element type; pops the length.
    pub fn new_array(&mut self, element_type: &TypeRef) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.pop_kind(KindSet::INT32 | KindSet::NATIVE_INT)?;
        self.op(OpCode::Newarr);
        self.write_u32(element_type.token.as_u32());
        self.push_kind(ValueKind::Object);
        Ok(())
    }

    /// Pushes the length of the array on top of the stack.
    pub fn load_array_length(&mut self) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.pop_kind(KindSet::OBJECT)?;
        self.op(OpCode::Ldlen);
        self.push_kind(ValueKind::NativeInt);
        Ok(())
    }

    /// Loads an array element; pops index then array.
    pub fn load_array_element(&mut self, element: ElementKind) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.pop_kind(KindSet::INT32 | KindSet::NATIVE_INT)?;
        self.pop_kind(KindSet::OBJECT)?;
        self.op(element.load_op());
        self.push_kind(element.stack_kind());
        Ok(())
    }

    /// Stores into an array element; pops value, index, then array.
    pub fn store_array_element(&mut self, element: ElementKind) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.pop_kind(element.stack_kind().as_set())?;
        self.pop_kind(KindSet::INT32 | KindSet::NATIVE_INT)?;
        self.pop_kind(KindSet::OBJECT)?;
        self.op(element.store_op());
        Ok(())
    }

    // ========================================================================
    // Terminators and miscellany
    // ========================================================================

    /// Returns from the routine, popping the return value when the routine
    /// declares one. The stack must be empty afterwards.
    pub fn ret(&mut self) -> Result<(), EmitError> {
        self.require_reachable()?;
        if let Some(kind) = self.return_kind {
            self.pop_kind(kind.as_set())?;
        }
        if self.stack_depth != 0 {
            return Err(EmitError::StackMismatch);
        }
        self.op(OpCode::Ret);
        self.indeterminate = true;
        Ok(())
    }

    /// Throws the exception object on top of the stack.
    pub fn throw_exception(&mut self) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.pop_kind(KindSet::OBJECT)?;
        self.op(OpCode::Throw);
        self.indeterminate = true;
        Ok(())
    }

    /// Emits a debugger breakpoint.
    pub fn breakpoint(&mut self) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.op(OpCode::Break);
        Ok(())
    }

    /// Emits a no-op.
    pub fn no_operation(&mut self) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.op(OpCode::Nop);
        Ok(())
    }

    /// Reserves an inline property-cache site (two cells) and returns its
    /// id, which emitted code passes to the runtime property helpers.
    pub fn allocate_cache_site(&mut self) -> i32 {
        let site = self.cache_sites;
        self.cache_sites += 1;
        site as i32
    }

    // ========================================================================
    // Finalization
    // ========================================================================

    /// Finalizes the byte stream: resolves every pending branch fix-up,
    /// checks region balance, and hands back the loader payload.
    pub fn complete(mut self) -> Result<CompletedCode, EmitError> {
        if !self.active_regions.is_empty() {
            return Err(EmitError::UnclosedExceptionRegion);
        }
        if !self.indeterminate && self.stack_depth != 0 {
            return Err(EmitError::StackMismatch);
        }

        let fixups = std::mem::take(&mut self.fixups);
        for fixup in &fixups {
            let target = self.labels[fixup.label.index()]
                .offset
                .ok_or(EmitError::UndefinedLabel)?;
            let relative = target as i64 - fixup.next_instruction_offset as i64;
            let bytes = (relative as i32).to_le_bytes();
            let span = fixup.write_position..fixup.write_position + fixup.length as usize;
            self.code[span].copy_from_slice(&bytes);
            trace!(
                position = fixup.write_position,
                target,
                relative,
                "patched branch fix-up"
            );
        }

        let exception_table = crate::compiler::exceptions::serialize_table(&self.done_regions);
        Ok(CompletedCode {
            max_stack: self.max_stack,
            local_signature: signature::encode_local_signature(self.locals.kinds()),
            exception_table,
            cache_sites: self.cache_sites,
            code: self.code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::opcode::OpCode;

    fn emitter() -> Emitter {
        Emitter::new(Module::new()).with_kind_checking(true)
    }

    #[test]
    fn test_load_int32_shortest_encodings() {
        let mut e = emitter();
        e.load_int32(-1).unwrap();
        e.load_int32(0).unwrap();
        e.load_int32(8).unwrap();
        e.load_int32(100).unwrap();
        e.load_int32(-128).unwrap();
        e.load_int32(1000).unwrap();
        assert_eq!(
            e.code,
            vec![
                0x15, // ldc.i4.m1
                0x16, // ldc.i4.0
                0x1E, // ldc.i4.8
                0x1F, 100, // ldc.i4.s 100
                0x1F, 0x80, // ldc.i4.s -128
                0x20, 0xE8, 0x03, 0x00, 0x00, // ldc.i4 1000
            ]
        );
        assert_eq!(e.stack_depth(), 6);
        assert_eq!(e.max_stack, 6);
    }

    #[test]
    fn test_load_double_ieee_bits() {
        let mut e = emitter();
        e.load_double(1.5).unwrap();
        assert_eq!(e.code[0], OpCode::LdcR8.byte());
        assert_eq!(&e.code[1..9], &1.5f64.to_bits().to_le_bytes());
    }

    #[test]
    fn test_add_tracks_kinds() {
        let mut e = emitter();
        e.load_int32(1).unwrap();
        e.load_int32(2).unwrap();
        e.add().unwrap();
        assert_eq!(e.stack_depth(), 1);
        assert_eq!(e.kinds.as_deref(), Some(&[ValueKind::Int32][..]));
    }

    #[test]
    fn test_add_underflow() {
        let mut e = emitter();
        e.load_int32(1).unwrap();
        assert_eq!(e.add().unwrap_err(), EmitError::StackUnderflow);
    }

    #[test]
    fn test_add_kind_mismatch() {
        let mut e = emitter();
        e.load_int32(1).unwrap();
        e.load_double(2.0).unwrap();
        assert!(matches!(
            e.add().unwrap_err(),
            EmitError::KindMismatch { .. }
        ));
    }

    #[test]
    fn test_bitwise_requires_int32() {
        let mut e = emitter();
        e.load_double(1.0).unwrap();
        e.load_double(2.0).unwrap();
        assert!(matches!(
            e.bitwise_and().unwrap_err(),
            EmitError::KindMismatch { .. }
        ));
    }

    #[test]
    fn test_duplicate_preserves_kind() {
        let mut e = emitter();
        e.load_double(3.25).unwrap();
        e.duplicate().unwrap();
        assert_eq!(
            e.kinds.as_deref(),
            Some(&[ValueKind::Float, ValueKind::Float][..])
        );
    }

    #[test]
    fn test_duplicate_on_empty_stack() {
        let mut e = emitter();
        assert_eq!(e.duplicate().unwrap_err(), EmitError::StackUnderflow);
    }

    #[test]
    fn test_ret_pops_return_value() {
        let module = Module::new();
        let wk = module.well_known().clone();
        let mut e = Emitter::for_routine(module, 0).with_kind_checking(true);
        e.load_int32(1).unwrap();
        e.load_int32(2).unwrap();
        e.add().unwrap();
        e.box_value(&wk.type_number).unwrap();
        e.ret().unwrap();
        assert!(e.is_indeterminate());
        let completed = e.complete().unwrap();
        assert_eq!(completed.max_stack, 2);
        assert_eq!(*completed.code.last().unwrap(), OpCode::Ret.byte());
    }

    #[test]
    fn test_ret_with_dangling_stack() {
        let module = Module::new();
        let mut e = Emitter::for_routine(module, 0).with_kind_checking(true);
        e.load_null().unwrap();
        e.load_null().unwrap();
        assert_eq!(e.ret().unwrap_err(), EmitError::StackMismatch);
    }

    #[test]
    fn test_emission_after_terminator_requires_label() {
        let mut e = emitter();
        e.ret().unwrap();
        assert_eq!(e.load_int32(1).unwrap_err(), EmitError::StackMismatch);
        let label = e.create_label();
        e.define_label(label).unwrap();
        e.load_int32(1).unwrap();
    }

    #[test]
    fn test_virtual_call_pops_receiver() {
        let module = Module::new();
        let to_string = module.method_ref("to_string", &[], Some(ValueKind::Object));
        let mut virtual_method = to_string;
        virtual_method.is_static = false;
        let mut e = Emitter::new(module).with_kind_checking(true);
        e.load_null().unwrap();
        e.call_virtual(&virtual_method).unwrap();
        assert_eq!(e.stack_depth(), 1);
        assert_eq!(*e.code.get(1).unwrap(), OpCode::Callvirt.byte());
    }

    #[test]
    fn test_new_object_pushes_instance() {
        let module = Module::new();
        let ctor = module.method_ref("JsError::new", &[ValueKind::Object], None);
        let mut e = Emitter::new(module).with_kind_checking(true);
        e.load_string("boom").unwrap();
        e.new_object(&ctor).unwrap();
        assert_eq!(e.stack_depth(), 1);
        assert_eq!(e.kinds.as_deref(), Some(&[ValueKind::Object][..]));
    }

    #[test]
    fn test_breakpoint_and_nop() {
        let mut e = emitter();
        e.breakpoint().unwrap();
        e.no_operation().unwrap();
        assert_eq!(e.code, vec![0x01, 0x00]);
        assert_eq!(e.stack_depth(), 0);
    }

    #[test]
    fn test_call_static_validates_arguments() {
        let module = Module::new();
        let wk = module.well_known().clone();
        let mut e = Emitter::new(module).with_kind_checking(true);
        // scope_get_slot(Object, Int32): pushing two objects must fail.
        e.load_null().unwrap();
        e.load_null().unwrap();
        assert!(matches!(
            e.call_static(&wk.scope_get_slot).unwrap_err(),
            EmitError::KindMismatch { .. }
        ));
    }

    #[test]
    fn test_call_static_pushes_return() {
        let module = Module::new();
        let wk = module.well_known().clone();
        let mut e = Emitter::new(module).with_kind_checking(true);
        e.load_null().unwrap();
        e.load_int32(0).unwrap();
        e.call_static(&wk.scope_get_slot).unwrap();
        assert_eq!(e.stack_depth(), 1);
        assert_eq!(e.kinds.as_deref(), Some(&[ValueKind::Object][..]));
    }

    #[test]
    fn test_unsigned_element_access_opcode_reuse() {
        let module = Module::new();
        let wk = module.well_known().clone();
        let mut e = Emitter::new(module).with_kind_checking(true);
        e.load_int32(1).unwrap();
        e.new_array(&wk.type_value).unwrap();
        e.load_int32(0).unwrap();
        e.load_array_element(ElementKind::UInt64).unwrap();
        assert_eq!(*e.code.last().unwrap(), 0x96);
        e.pop().unwrap();

        e.load_int32(1).unwrap();
        e.new_array(&wk.type_value).unwrap();
        e.load_int32(0).unwrap();
        e.load_int64(7).unwrap();
        e.store_array_element(ElementKind::UInt64).unwrap();
        assert_eq!(*e.code.last().unwrap(), 0x9F);
    }

    #[test]
    fn test_string_interning_via_emitter() {
        let module = Module::new();
        let mut e = Emitter::new(Arc::clone(&module)).with_kind_checking(true);
        e.load_string("hi").unwrap();
        e.load_string("hi").unwrap();
        // Same token bytes for both loads.
        assert_eq!(e.code[1..5], e.code[6..10]);
    }

    #[test]
    fn test_complete_empty() {
        let e = emitter();
        let completed = e.complete().unwrap();
        assert!(completed.code.is_empty());
        assert_eq!(completed.max_stack, 0);
        assert!(completed.exception_table.is_empty());
        assert_eq!(completed.local_signature, vec![0x07, 0x00]);
    }
}
