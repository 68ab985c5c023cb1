//! Local and argument slot management.
//!
//! Slots pick the shortest access encoding by index: dedicated one-byte
//! forms for indices 0–3, the `.s` forms below 256, and the extended
//! two-byte forms below 65535.

use crate::compiler::emitter::{EmitError, Emitter};
use crate::compiler::opcode::{ExtOpCode, OpCode};
use crate::compiler::{KindSet, ValueKind};

/// A declared local variable slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalVar {
    pub(crate) index: u16,
    pub(crate) kind: ValueKind,
}

impl LocalVar {
    /// The slot index.
    pub fn index(self) -> u16 {
        self.index
    }

    /// The kind of value this slot holds.
    pub fn kind(self) -> ValueKind {
        self.kind
    }
}

#[derive(Debug, Clone)]
struct LocalSlot {
    kind: ValueKind,
    #[allow(dead_code)]
    name: Option<String>,
}

/// The ordered table of local slots for one routine.
#[derive(Debug, Default)]
pub(crate) struct LocalTable {
    slots: Vec<LocalSlot>,
    kinds: Vec<ValueKind>,
}

impl LocalTable {
    pub(crate) fn new() -> Self {
        LocalTable::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn kinds(&self) -> &[ValueKind] {
        &self.kinds
    }
}

impl Emitter {
    /// Appends a local slot of the given kind and returns its handle. The
    /// optional name is kept for debug output only.
    pub fn declare_variable(
        &mut self,
        kind: ValueKind,
        name: Option<&str>,
    ) -> Result<LocalVar, EmitError> {
        let index = self.locals.len();
        if index >= 0xFFFF {
            return Err(EmitError::TooManyLocals);
        }
        self.locals.slots.push(LocalSlot {
            kind,
            name: name.map(str::to_string),
        });
        self.locals.kinds.push(kind);
        Ok(LocalVar {
            index: index as u16,
            kind,
        })
    }

    fn check_declared(&self, local: LocalVar) -> Result<(), EmitError> {
        if (local.index as usize) < self.locals.len() {
            Ok(())
        } else {
            Err(EmitError::TooManyLocals)
        }
    }

    /// Pushes the value of a local slot.
    pub fn load_variable(&mut self, local: LocalVar) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.check_declared(local)?;
        match local.index {
            0..=3 => self.write_u8(OpCode::Ldloc0.byte() + local.index as u8),
            4..=255 => {
                self.op(OpCode::LdlocS);
                self.write_u8(local.index as u8);
            }
            _ => {
                self.ext_op(ExtOpCode::Ldloc);
                self.write_u16(local.index);
            }
        }
        self.push_kind(local.kind);
        Ok(())
    }

    /// Pops the top of the stack into a local slot.
    pub fn store_variable(&mut self, local: LocalVar) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.check_declared(local)?;
        self.pop_kind(local.kind.as_set())?;
        match local.index {
            0..=3 => self.write_u8(OpCode::Stloc0.byte() + local.index as u8),
            4..=255 => {
                self.op(OpCode::StlocS);
                self.write_u8(local.index as u8);
            }
            _ => {
                self.ext_op(ExtOpCode::Stloc);
                self.write_u16(local.index);
            }
        }
        Ok(())
    }

    /// Pushes the address of a local slot as a managed pointer.
    pub fn load_variable_address(&mut self, local: LocalVar) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.check_declared(local)?;
        if local.index < 256 {
            self.op(OpCode::LdlocaS);
            self.write_u8(local.index as u8);
        } else {
            self.ext_op(ExtOpCode::Ldloca);
            self.write_u16(local.index);
        }
        self.push_kind(ValueKind::ManagedPointer);
        Ok(())
    }

    fn argument_kind(&self, index: u16) -> Result<ValueKind, EmitError> {
        self.params
            .get(index as usize)
            .copied()
            .ok_or(EmitError::TooManyArguments)
    }

    /// Pushes the value of a formal argument. Argument 0 is the current
    /// scope handle; argument 1 is the `this` receiver.
    pub fn load_argument(&mut self, index: u16) -> Result<(), EmitError> {
        self.require_reachable()?;
        let kind = self.argument_kind(index)?;
        match index {
            0..=3 => self.write_u8(OpCode::Ldarg0.byte() + index as u8),
            4..=255 => {
                self.op(OpCode::LdargS);
                self.write_u8(index as u8);
            }
            _ => {
                self.ext_op(ExtOpCode::Ldarg);
                self.write_u16(index);
            }
        }
        self.push_kind(kind);
        Ok(())
    }

    /// Pops the top of the stack into a formal argument slot.
    pub fn store_argument(&mut self, index: u16) -> Result<(), EmitError> {
        self.require_reachable()?;
        let kind = self.argument_kind(index)?;
        self.pop_kind(kind.as_set())?;
        if index < 256 {
            self.op(OpCode::StargS);
            self.write_u8(index as u8);
        } else {
            self.ext_op(ExtOpCode::Starg);
            self.write_u16(index);
        }
        Ok(())
    }

    /// Pushes the address of a formal argument as a managed pointer.
    pub fn load_argument_address(&mut self, index: u16) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.argument_kind(index)?;
        if index < 256 {
            self.op(OpCode::LdargaS);
            self.write_u8(index as u8);
        } else {
            self.ext_op(ExtOpCode::Ldarga);
            self.write_u16(index);
        }
        self.push_kind(ValueKind::ManagedPointer);
        Ok(())
    }

    /// Number of local slots declared so far.
    pub fn local_count(&self) -> usize {
        self.locals.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::Module;

    fn emitter() -> Emitter {
        Emitter::new(Module::new()).with_kind_checking(true)
    }

    #[test]
    fn test_local_encoding_forms() {
        let mut e = emitter();
        let mut locals = Vec::new();
        for _ in 0..300 {
            locals.push(e.declare_variable(ValueKind::Int32, None).unwrap());
        }
        e.load_int32(1).unwrap();
        e.store_variable(locals[2]).unwrap();
        assert_eq!(*e.code.last().unwrap(), OpCode::Stloc2.byte());

        e.load_variable(locals[3]).unwrap();
        assert_eq!(*e.code.last().unwrap(), OpCode::Ldloc3.byte());
        e.pop().unwrap();

        e.load_variable(locals[4]).unwrap();
        assert_eq!(e.code[e.code.len() - 2], OpCode::LdlocS.byte());
        assert_eq!(e.code[e.code.len() - 1], 4);
        e.pop().unwrap();

        e.load_variable(locals[299]).unwrap();
        let tail = &e.code[e.code.len() - 4..];
        assert_eq!(tail[0], 0xFE);
        assert_eq!(tail[1], ExtOpCode::Ldloc.byte());
        assert_eq!(&tail[2..4], &299u16.to_le_bytes());
    }

    #[test]
    fn test_store_checks_kind() {
        let mut e = emitter();
        let slot = e.declare_variable(ValueKind::Object, None).unwrap();
        e.load_int32(1).unwrap();
        assert!(matches!(
            e.store_variable(slot).unwrap_err(),
            EmitError::KindMismatch { .. }
        ));
    }

    #[test]
    fn test_undeclared_slot_rejected() {
        let mut e = emitter();
        let phantom = LocalVar {
            index: 7,
            kind: ValueKind::Int32,
        };
        assert_eq!(
            e.load_variable(phantom).unwrap_err(),
            EmitError::TooManyLocals
        );
    }

    #[test]
    fn test_address_of_local() {
        let mut e = emitter();
        let slot = e.declare_variable(ValueKind::Float, None).unwrap();
        e.load_variable_address(slot).unwrap();
        assert_eq!(e.kinds.as_deref(), Some(&[ValueKind::ManagedPointer][..]));
    }

    #[test]
    fn test_argument_encoding_forms() {
        let module = Module::new();
        let mut e = Emitter::for_routine(module, 6).with_kind_checking(true);
        e.load_argument(0).unwrap();
        assert_eq!(*e.code.last().unwrap(), OpCode::Ldarg0.byte());
        e.pop().unwrap();
        e.load_argument(5).unwrap();
        assert_eq!(e.code[e.code.len() - 2], OpCode::LdargS.byte());
        e.pop().unwrap();
        e.load_null().unwrap();
        e.store_argument(0).unwrap();
        assert_eq!(e.code[e.code.len() - 2], OpCode::StargS.byte());
    }

    #[test]
    fn test_argument_out_of_range() {
        let module = Module::new();
        let mut e = Emitter::for_routine(module, 1).with_kind_checking(true);
        assert_eq!(
            e.load_argument(3).unwrap_err(),
            EmitError::TooManyArguments
        );
    }

    #[test]
    fn test_signature_follows_declarations() {
        let mut e = emitter();
        e.declare_variable(ValueKind::Object, Some("scratch")).unwrap();
        e.declare_variable(ValueKind::Float, None).unwrap();
        let completed = e.complete().unwrap();
        assert_eq!(completed.local_signature, vec![0x07, 2, 0x1C, 0x0D]);
    }
}
