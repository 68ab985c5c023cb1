//! Label management and branch emission.
//!
//! A label is a symbolic branch target bound to an eventual byte offset.
//! Whenever a label is first touched, by a branch or by its definition, the
//! live evaluation-stack state is captured into it; every later touch must
//! observe the same state. Branches to not-yet-defined labels queue a fix-up
//! that [`super::Emitter::complete`] patches.
//!
//! All branches use the 4-byte long form; short forms are never emitted, so
//! no two-pass sizing is needed.

use crate::compiler::emitter::{EmitError, Emitter};
use crate::compiler::opcode::OpCode;
use crate::compiler::{KindSet, ValueKind};

/// A branch target handle, valid only for the emitter that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

impl Label {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// The evaluation-stack state recorded for a label at first touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StackShot {
    pub depth: u32,
    /// `Some` when kind checking was active at capture time.
    pub kinds: Option<Vec<ValueKind>>,
}

/// Bookkeeping for one label.
#[derive(Debug, Clone)]
pub(crate) struct LabelState {
    /// Byte offset of the definition; `None` until defined.
    pub offset: Option<u32>,
    /// Stack state every touch must agree on.
    pub expected: Option<StackShot>,
}

/// A pending branch patch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fixup {
    /// Where in the code buffer the offset bytes live.
    pub write_position: usize,
    /// Width of the offset field, always 4.
    pub length: u8,
    /// Offset of the instruction after the branch, the base for the
    /// relative target computation.
    pub next_instruction_offset: u32,
    /// The label being branched to.
    pub label: Label,
}

impl Emitter {
    /// Creates a fresh, undefined label bound to this emitter.
    pub fn create_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(LabelState {
            offset: None,
            expected: None,
        });
        label
    }

    fn snapshot(&self) -> StackShot {
        StackShot {
            depth: self.stack_depth,
            kinds: self.kinds.clone(),
        }
    }

    /// Records the live stack state into the label, or checks it against the
    /// state recorded earlier.
    pub(crate) fn touch_label(&mut self, label: Label) -> Result<(), EmitError> {
        let shot = self.snapshot();
        let state = &mut self.labels[label.index()];
        match &state.expected {
            None => {
                state.expected = Some(shot);
                Ok(())
            }
            Some(expected) => {
                if expected.depth != shot.depth {
                    return Err(EmitError::StackMismatch);
                }
                if let (Some(expected_kinds), Some(live_kinds)) = (&expected.kinds, &shot.kinds) {
                    if expected_kinds != live_kinds {
                        return Err(EmitError::StackMismatch);
                    }
                }
                Ok(())
            }
        }
    }

    /// Marks the label's position as the current offset and reconciles the
    /// evaluation stack.
    ///
    /// In the indeterminate state the label *restores* the stack from its
    /// recorded state (or to empty when it was never targeted); otherwise the
    /// live state must match the recorded one.
    pub fn define_label(&mut self, label: Label) -> Result<(), EmitError> {
        if self.labels[label.index()].offset.is_some() {
            return Err(EmitError::DoubleDefinedLabel);
        }

        if self.indeterminate {
            let shot = self.labels[label.index()]
                .expected
                .clone()
                .unwrap_or(StackShot {
                    depth: 0,
                    kinds: self.kinds.as_ref().map(|_| Vec::new()),
                });
            self.stack_depth = shot.depth;
            if self.stack_depth > self.max_stack {
                self.max_stack = self.stack_depth;
            }
            if let (Some(tracked), Some(restored)) = (&mut self.kinds, &shot.kinds) {
                tracked.clear();
                tracked.extend_from_slice(restored);
            }
            self.indeterminate = false;
            let state = &mut self.labels[label.index()];
            if state.expected.is_none() {
                state.expected = Some(shot);
            }
        } else {
            self.touch_label(label)?;
        }

        self.labels[label.index()].offset = Some(self.offset());
        Ok(())
    }

    /// Writes a 4-byte branch target: inline when the label is already
    /// defined, otherwise a zero placeholder plus a queued fix-up.
    pub(crate) fn write_branch_target(&mut self, label: Label) {
        let write_position = self.code.len();
        let next_instruction_offset = write_position as u32 + 4;
        match self.labels[label.index()].offset {
            Some(target) => {
                let relative = target as i64 - next_instruction_offset as i64;
                self.write_i32(relative as i32);
            }
            None => {
                self.fixups.push(Fixup {
                    write_position,
                    length: 4,
                    next_instruction_offset,
                    label,
                });
                self.write_u32(0);
            }
        }
    }

    /// Branches unconditionally; marks the stack indeterminate.
    pub fn branch(&mut self, label: Label) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.touch_label(label)?;
        self.op(OpCode::Br);
        self.write_branch_target(label);
        self.indeterminate = true;
        Ok(())
    }

    fn conditional_branch_one(
        &mut self,
        op: OpCode,
        label: Label,
        accepts: KindSet,
    ) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.pop_kind(accepts)?;
        self.touch_label(label)?;
        self.op(op);
        self.write_branch_target(label);
        Ok(())
    }

    fn conditional_branch_two(
        &mut self,
        op: OpCode,
        label: Label,
        accepts: KindSet,
    ) -> Result<(), EmitError> {
        self.require_reachable()?;
        let rhs = self.pop_kind(accepts)?;
        let lhs = self.pop_kind(accepts)?;
        if self.kinds.is_some() && lhs != rhs {
            return Err(EmitError::KindMismatch {
                expected: rhs.as_set(),
                found: lhs,
            });
        }
        self.touch_label(label)?;
        self.op(op);
        self.write_branch_target(label);
        Ok(())
    }

    /// Branches when the popped value is zero or null.
    pub fn branch_if_zero(&mut self, label: Label) -> Result<(), EmitError> {
        self.conditional_branch_one(OpCode::Brfalse, label, KindSet::TESTABLE)
    }

    /// Branches when the popped value is non-zero or non-null.
    pub fn branch_if_not_zero(&mut self, label: Label) -> Result<(), EmitError> {
        self.conditional_branch_one(OpCode::Brtrue, label, KindSet::TESTABLE)
    }

    /// Branches when the two popped values are equal.
    pub fn branch_if_equal(&mut self, label: Label) -> Result<(), EmitError> {
        self.conditional_branch_two(OpCode::Beq, label, KindSet::NUMERIC | KindSet::OBJECT)
    }

    /// Branches when the two popped values differ (or are unordered).
    pub fn branch_if_not_equal(&mut self, label: Label) -> Result<(), EmitError> {
        self.conditional_branch_two(OpCode::BneUn, label, KindSet::NUMERIC | KindSet::OBJECT)
    }

    /// Branches when the lower value is greater than the top.
    pub fn branch_if_greater(&mut self, label: Label) -> Result<(), EmitError> {
        self.conditional_branch_two(OpCode::Bgt, label, KindSet::NUMERIC)
    }

    /// `bgt.un`: unsigned, or unordered for floats.
    pub fn branch_if_greater_unsigned(&mut self, label: Label) -> Result<(), EmitError> {
        self.conditional_branch_two(OpCode::BgtUn, label, KindSet::NUMERIC)
    }

    /// Branches when the lower value is at least the top.
    pub fn branch_if_greater_or_equal(&mut self, label: Label) -> Result<(), EmitError> {
        self.conditional_branch_two(OpCode::Bge, label, KindSet::NUMERIC)
    }

    /// `bge.un`: unsigned, or unordered for floats.
    pub fn branch_if_greater_or_equal_unsigned(&mut self, label: Label) -> Result<(), EmitError> {
        self.conditional_branch_two(OpCode::BgeUn, label, KindSet::NUMERIC)
    }

    /// Branches when the lower value is less than the top.
    pub fn branch_if_less(&mut self, label: Label) -> Result<(), EmitError> {
        self.conditional_branch_two(OpCode::Blt, label, KindSet::NUMERIC)
    }

    /// `blt.un`: unsigned, or unordered for floats.
    pub fn branch_if_less_unsigned(&mut self, label: Label) -> Result<(), EmitError> {
        self.conditional_branch_two(OpCode::BltUn, label, KindSet::NUMERIC)
    }

    /// Branches when the lower value is at most the top.
    pub fn branch_if_less_or_equal(&mut self, label: Label) -> Result<(), EmitError> {
        self.conditional_branch_two(OpCode::Ble, label, KindSet::NUMERIC)
    }

    /// `ble.un`: unsigned, or unordered for floats.
    pub fn branch_if_less_or_equal_unsigned(&mut self, label: Label) -> Result<(), EmitError> {
        self.conditional_branch_two(OpCode::BleUn, label, KindSet::NUMERIC)
    }

    /// Emits a `switch` jump table over the popped 32-bit index. Indices
    /// outside `0..targets.len()` fall through.
    pub fn switch(&mut self, targets: &[Label]) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.pop_kind(KindSet::INT32)?;
        for &target in targets {
            self.touch_label(target)?;
        }
        self.op(OpCode::Switch);
        self.write_u32(targets.len() as u32);
        // Relative offsets are measured from the end of the whole table.
        let next_instruction_offset = self.code.len() as u32 + 4 * targets.len() as u32;
        for &target in targets {
            let write_position = self.code.len();
            match self.labels[target.index()].offset {
                Some(offset) => {
                    let relative = offset as i64 - next_instruction_offset as i64;
                    self.write_i32(relative as i32);
                }
                None => {
                    self.fixups.push(Fixup {
                        write_position,
                        length: 4,
                        next_instruction_offset,
                        label: target,
                    });
                    self.write_u32(0);
                }
            }
        }
        Ok(())
    }

    /// Exits a protected region (or a plain statement context): clears the
    /// evaluation stack, branches, and marks the stack indeterminate.
    pub fn leave(&mut self, label: Label) -> Result<(), EmitError> {
        self.require_reachable()?;
        self.clear_stack();
        self.touch_label(label)?;
        self.op(OpCode::Leave);
        self.write_branch_target(label);
        self.indeterminate = true;
        Ok(())
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
    fn test_backward_branch_offset_is_negative() {
        let mut e = emitter();
        let top = e.create_label();
        e.define_label(top).unwrap();
        e.no_operation().unwrap();
        e.branch(top).unwrap();
        // nop(1) + br(1) + offset(4): branch base is 6, target 0.
        assert_eq!(&e.code[2..6], &(-6i32).to_le_bytes());
        assert!(e.fixups.is_empty());
    }

    #[test]
    fn test_forward_branch_fixup_patched_at_complete() {
        let mut e = emitter();
        let skip = e.create_label();
        e.branch(skip).unwrap();
        e.define_label(skip).unwrap();
        e.no_operation().unwrap();
        let completed = e.complete().unwrap();
        // br(1) + offset(4) == 5; target is 5; relative 0.
        assert_eq!(&completed.code[1..5], &0i32.to_le_bytes());
    }

    #[test]
    fn test_undefined_label_detected_at_complete() {
        let mut e = emitter();
        let nowhere = e.create_label();
        e.branch(nowhere).unwrap();
        assert_eq!(e.complete().unwrap_err(), EmitError::UndefinedLabel);
    }

    #[test]
    fn test_double_define_rejected() {
        let mut e = emitter();
        let label = e.create_label();
        e.define_label(label).unwrap();
        assert_eq!(
            e.define_label(label).unwrap_err(),
            EmitError::DoubleDefinedLabel
        );
    }

    #[test]
    fn test_branch_records_stack_state() {
        let mut e = emitter();
        let merge = e.create_label();
        e.load_int32(1).unwrap();
        e.branch_if_not_zero(merge).unwrap();
        // Depth at the branch was 0 after the pop; pushing before the
        // definition makes the states disagree.
        e.load_int32(2).unwrap();
        assert_eq!(e.define_label(merge).unwrap_err(), EmitError::StackMismatch);
    }

    #[test]
    fn test_label_restores_stack_after_terminator() {
        let mut e = emitter();
        let merge = e.create_label();
        e.load_int32(1).unwrap();
        e.branch(merge).unwrap();
        assert!(e.is_indeterminate());
        e.define_label(merge).unwrap();
        assert!(!e.is_indeterminate());
        assert_eq!(e.stack_depth(), 1);
        assert_eq!(e.kinds.as_deref(), Some(&[ValueKind::Int32][..]));
    }

    #[test]
    fn test_label_kind_mismatch_between_touches() {
        let mut e = emitter();
        let merge = e.create_label();
        let skip = e.create_label();
        e.load_int32(1).unwrap();
        e.branch(merge).unwrap();
        e.define_label(skip).unwrap(); // restores empty stack
        e.load_double(1.0).unwrap();
        // Same depth, different kind.
        assert_eq!(e.branch(merge).unwrap_err(), EmitError::StackMismatch);
    }

    #[test]
    fn test_switch_emits_count_and_table() {
        let mut e = emitter();
        let a = e.create_label();
        let b = e.create_label();
        e.load_int32(0).unwrap();
        e.switch(&[a, b]).unwrap();
        e.define_label(a).unwrap();
        e.no_operation().unwrap();
        e.define_label(b).unwrap();
        e.no_operation().unwrap();
        let completed = e.complete().unwrap();
        // ldc.i4.0(1) switch(1) count(4) table(8) => next = 14.
        assert_eq!(&completed.code[2..6], &2u32.to_le_bytes());
        assert_eq!(&completed.code[6..10], &0i32.to_le_bytes());
        assert_eq!(&completed.code[10..14], &1i32.to_le_bytes());
    }

    #[test]
    fn test_leave_clears_stack() {
        let mut e = emitter();
        let out = e.create_label();
        e.load_int32(1).unwrap();
        e.load_int32(2).unwrap();
        e.leave(out).unwrap();
        assert!(e.is_indeterminate());
        e.define_label(out).unwrap();
        assert_eq!(e.stack_depth(), 0);
    }

    #[test]
    fn test_fixups_empty_after_complete() {
        let mut e = emitter();
        let a = e.create_label();
        let b = e.create_label();
        e.branch(a).unwrap();
        e.define_label(b).unwrap();
        e.branch(b).unwrap();
        e.define_label(a).unwrap();
        let completed = e.complete().unwrap();
        // Both branches resolved; back-edge negative, forward positive.
        assert_eq!(&completed.code[1..5], &5i32.to_le_bytes());
        assert_eq!(&completed.code[6..10], &(-10i32 + 5).to_le_bytes());
    }
}
