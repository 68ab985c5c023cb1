//! Bytecode compiler for JavaScript.
//!
//! Transforms AST into a byte stream for the stack-oriented managed runtime.
//! The [`emitter::Emitter`] assembles instructions with full evaluation-stack
//! bookkeeping; [`codegen`] drives it from the syntax tree.

pub mod codegen;
pub mod disasm;
pub mod emitter;
pub mod exceptions;
pub mod labels;
pub mod locals;
pub mod opcode;

pub use emitter::{CompletedCode, EmitError, Emitter};
pub use labels::Label;
pub use locals::LocalVar;

use bitflags::bitflags;

/// The abstract category of a value on the evaluation stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// Native-width integer
    NativeInt,
    /// IEEE-754 double
    Float,
    /// Managed object reference
    Object,
    /// Managed pointer (address of a local or argument)
    ManagedPointer,
}

bitflags! {
    /// A set of [`ValueKind`]s an instruction accepts for one operand.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KindSet: u8 {
        /// 32-bit signed integer
        const INT32 = 1 << 0;
        /// 64-bit signed integer
        const INT64 = 1 << 1;
        /// Native-width integer
        const NATIVE_INT = 1 << 2;
        /// IEEE-754 double
        const FLOAT = 1 << 3;
        /// Managed object reference
        const OBJECT = 1 << 4;
        /// Managed pointer
        const POINTER = 1 << 5;

        /// Any numeric kind.
        const NUMERIC = Self::INT32.bits()
            | Self::INT64.bits()
            | Self::NATIVE_INT.bits()
            | Self::FLOAT.bits();
        /// Integer kinds accepted by bitwise and shift instructions.
        const INTEGER = Self::INT32.bits();
        /// Kinds a value type may have before boxing.
        const BOXABLE = Self::NUMERIC.bits();
        /// Kinds accepted by truthiness branches.
        const TESTABLE = Self::INT32.bits()
            | Self::NATIVE_INT.bits()
            | Self::OBJECT.bits();
        /// Every kind.
        const ANY = 0x3F;
    }
}

impl ValueKind {
    /// The singleton kind-set containing only this kind.
    pub fn as_set(self) -> KindSet {
        match self {
            ValueKind::Int32 => KindSet::INT32,
            ValueKind::Int64 => KindSet::INT64,
            ValueKind::NativeInt => KindSet::NATIVE_INT,
            ValueKind::Float => KindSet::FLOAT,
            ValueKind::Object => KindSet::OBJECT,
            ValueKind::ManagedPointer => KindSet::POINTER,
        }
    }

    /// Whether this kind is numeric.
    pub fn is_numeric(self) -> bool {
        KindSet::NUMERIC.contains(self.as_set())
    }
}
