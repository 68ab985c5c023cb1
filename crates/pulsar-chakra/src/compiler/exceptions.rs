//! Exception-region construction.
//!
//! Regions are kept on a stack while in progress; nesting is implicit in
//! close order, so inner regions land in the done list (and therefore in the
//! serialized table) before the regions that enclose them, exactly as the
//! loader requires.

use crate::compiler::emitter::{EmitError, Emitter};
use crate::compiler::labels::Label;
use crate::compiler::opcode::{ExtOpCode, OpCode};
use crate::compiler::{KindSet, ValueKind};
use crate::loader::TypeRef;

/// The kind of one exception clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClauseKind {
    /// Typed catch handler.
    Catch,
    /// Filter clause: a filter expression followed by a handler.
    Filter,
    /// Finally handler, runs on every exit.
    Finally,
    /// Fault handler, runs only on exceptional exit.
    Fault,
}

impl ClauseKind {
    fn flags(self) -> u32 {
        match self {
            ClauseKind::Catch => 0,
            ClauseKind::Filter => 1,
            ClauseKind::Finally => 2,
            ClauseKind::Fault => 4,
        }
    }
}

/// A clause being built.
#[derive(Debug, Clone)]
pub(crate) struct ClauseInProgress {
    pub kind: ClauseKind,
    /// Handler start; for filter clauses this is set by `end_filter`.
    pub handler_start: u32,
    /// Set when the clause is closed.
    pub handler_length: Option<u32>,
    /// Catch clauses: the exception type token.
    pub catch_type: u32,
    /// Filter clauses: offset of the filter expression.
    pub filter_start: u32,
    /// Filter clauses: still inside the filter expression.
    pub in_filter: bool,
}

/// A region being built.
#[derive(Debug, Clone)]
pub(crate) struct RegionInProgress {
    pub try_start: u32,
    /// Offset one past the `leave` that closes the try body.
    pub try_end: Option<u32>,
    pub end_label: Label,
    pub clauses: Vec<ClauseInProgress>,
}

/// A closed region awaiting serialization.
#[derive(Debug, Clone)]
pub(crate) struct FinishedRegion {
    pub try_start: u32,
    pub try_length: u32,
    pub clauses: Vec<FinishedClause>,
}

/// A closed clause.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FinishedClause {
    pub kind: ClauseKind,
    pub handler_start: u32,
    pub handler_length: u32,
    /// Class token for catch, filter offset for filter, zero otherwise.
    pub extra: u32,
}

impl Emitter {
    /// Opens a protected region at the current offset and returns the label
    /// every `leave` in the region targets.
    pub fn begin_exception_block(&mut self) -> Label {
        let end_label = self.create_label();
        let try_start = self.offset();
        self.active_regions.push(RegionInProgress {
            try_start,
            try_end: None,
            end_label,
            clauses: Vec::new(),
        });
        end_label
    }

    fn current_region(&mut self) -> Result<&mut RegionInProgress, EmitError> {
        self.active_regions
            .last_mut()
            .ok_or(EmitError::MisplacedHandler)
    }

    /// Closes the clause currently being emitted (or the try body when no
    /// clause has begun yet) by emitting its terminator.
    fn close_current_clause(&mut self) -> Result<(), EmitError> {
        let (end_label, last_clause) = {
            let region = self.current_region()?;
            (
                region.end_label,
                region.clauses.last().map(|c| (c.kind, c.in_filter)),
            )
        };
        // A body that already ended in a terminator (return, throw, leave)
        // has no falling path; only reachable ends get a closing terminator.
        match last_clause {
            None => {
                if !self.indeterminate {
                    self.leave(end_label)?;
                }
                let offset = self.offset();
                self.current_region()?.try_end = Some(offset);
            }
            Some((kind, in_filter)) => {
                match kind {
                    ClauseKind::Catch => {
                        if !self.indeterminate {
                            self.leave(end_label)?;
                        }
                    }
                    ClauseKind::Filter => {
                        if in_filter {
                            // A filter expression must end with endfilter
                            // before anything can close the clause.
                            return Err(EmitError::MisplacedEndFilter);
                        }
                        if !self.indeterminate {
                            self.leave(end_label)?;
                        }
                    }
                    ClauseKind::Finally => {
                        if !self.indeterminate {
                            self.end_finally()?;
                        }
                    }
                    ClauseKind::Fault => {
                        if !self.indeterminate {
                            // Fault handlers share the endfinally terminator.
                            self.clear_stack();
                            self.op(OpCode::Endfinally);
                            self.indeterminate = true;
                        }
                    }
                }
                let offset = self.offset();
                let clause = self
                    .current_region()?
                    .clauses
                    .last_mut()
                    .expect("clause checked above");
                clause.handler_length = Some(offset - clause.handler_start);
            }
        }
        Ok(())
    }

    /// Begins a typed catch clause. The handler starts with the exception
    /// object as the only value on the stack.
    pub fn begin_catch_block(&mut self, exception_type: &TypeRef) -> Result<(), EmitError> {
        let token = exception_type.token.as_u32();
        let region = self.current_region()?;
        if region
            .clauses
            .iter()
            .any(|c| c.kind == ClauseKind::Catch && c.catch_type == token)
        {
            return Err(EmitError::DuplicateCatch);
        }
        self.close_current_clause()?;
        self.replace_stack(&[ValueKind::Object]);
        let handler_start = self.offset();
        self.current_region()?.clauses.push(ClauseInProgress {
            kind: ClauseKind::Catch,
            handler_start,
            handler_length: None,
            catch_type: token,
            filter_start: 0,
            in_filter: false,
        });
        Ok(())
    }

    /// Begins the finally clause. The handler starts with an empty stack.
    pub fn begin_finally_block(&mut self) -> Result<(), EmitError> {
        let region = self.current_region()?;
        if region.clauses.iter().any(|c| c.kind == ClauseKind::Finally) {
            return Err(EmitError::DuplicateFinally);
        }
        self.close_current_clause()?;
        self.replace_stack(&[]);
        let handler_start = self.offset();
        self.current_region()?.clauses.push(ClauseInProgress {
            kind: ClauseKind::Finally,
            handler_start,
            handler_length: None,
            catch_type: 0,
            filter_start: 0,
            in_filter: false,
        });
        Ok(())
    }

    /// Begins the fault clause. The handler starts with an empty stack.
    pub fn begin_fault_block(&mut self) -> Result<(), EmitError> {
        let region = self.current_region()?;
        if region.clauses.iter().any(|c| c.kind == ClauseKind::Fault) {
            return Err(EmitError::DuplicateFault);
        }
        self.close_current_clause()?;
        self.replace_stack(&[]);
        let handler_start = self.offset();
        self.current_region()?.clauses.push(ClauseInProgress {
            kind: ClauseKind::Fault,
            handler_start,
            handler_length: None,
            catch_type: 0,
            filter_start: 0,
            in_filter: false,
        });
        Ok(())
    }

    /// Begins a filter clause. The filter expression starts with the
    /// exception object as the only value on the stack and must end with
    /// [`Emitter::end_filter`].
    pub fn begin_filter_block(&mut self) -> Result<(), EmitError> {
        let region = self.current_region()?;
        if region.clauses.iter().any(|c| c.kind == ClauseKind::Filter) {
            return Err(EmitError::DuplicateFilter);
        }
        self.close_current_clause()?;
        self.replace_stack(&[ValueKind::Object]);
        let filter_start = self.offset();
        self.current_region()?.clauses.push(ClauseInProgress {
            kind: ClauseKind::Filter,
            handler_start: 0,
            handler_length: None,
            catch_type: 0,
            filter_start,
            in_filter: true,
        });
        Ok(())
    }

    /// Ends the filter expression: pops the 32-bit decision value, then
    /// starts the filter's handler with the exception object on the stack.
    pub fn end_filter(&mut self) -> Result<(), EmitError> {
        let in_filter = self
            .active_regions
            .last()
            .and_then(|r| r.clauses.last())
            .map(|c| c.kind == ClauseKind::Filter && c.in_filter)
            .unwrap_or(false);
        if !in_filter {
            return Err(EmitError::MisplacedEndFilter);
        }
        self.pop_kind(KindSet::INT32)?;
        if self.stack_depth != 0 {
            return Err(EmitError::StackMismatch);
        }
        self.ext_op(ExtOpCode::Endfilter);
        self.replace_stack(&[ValueKind::Object]);
        let handler_start = self.offset();
        let clause = self
            .current_region()?
            .clauses
            .last_mut()
            .expect("filter clause checked above");
        clause.handler_start = handler_start;
        clause.in_filter = false;
        Ok(())
    }

    /// Terminates the finally clause explicitly.
    pub fn end_finally(&mut self) -> Result<(), EmitError> {
        let in_finally = self
            .active_regions
            .last()
            .and_then(|r| r.clauses.last())
            .map(|c| c.kind == ClauseKind::Finally)
            .unwrap_or(false);
        if !in_finally {
            return Err(EmitError::MisplacedEndFinally);
        }
        self.clear_stack();
        self.op(OpCode::Endfinally);
        self.indeterminate = true;
        Ok(())
    }

    /// Closes the region: terminates the last clause, defines the end label
    /// at the current offset, and queues the region for serialization.
    pub fn end_exception_block(&mut self) -> Result<(), EmitError> {
        if self.current_region()?.clauses.is_empty() {
            return Err(EmitError::EmptyExceptionRegion);
        }
        self.close_current_clause()?;
        let region = self.active_regions.pop().expect("region checked above");
        self.define_label(region.end_label)?;

        let try_end = region.try_end.expect("try body closed by first clause");
        let finished = FinishedRegion {
            try_start: region.try_start,
            try_length: try_end - region.try_start,
            clauses: region
                .clauses
                .into_iter()
                .map(|clause| FinishedClause {
                    kind: clause.kind,
                    handler_start: clause.handler_start,
                    handler_length: clause.handler_length.expect("clause closed"),
                    extra: match clause.kind {
                        ClauseKind::Catch => clause.catch_type,
                        ClauseKind::Filter => clause.filter_start,
                        ClauseKind::Finally | ClauseKind::Fault => 0,
                    },
                })
                .collect(),
        };
        self.done_regions.push(finished);
        Ok(())
    }
}

/// Serializes the done regions into the loader's fat table format: a 4-byte
/// header `{0x41, len₀, len₁, len₂}` followed by 24 bytes per clause.
pub(crate) fn serialize_table(regions: &[FinishedRegion]) -> Vec<u8> {
    if regions.is_empty() {
        return Vec::new();
    }
    let clause_count: usize = regions.iter().map(|r| r.clauses.len()).sum();
    let data_size = clause_count * 24 + 4;
    let mut table = Vec::with_capacity(data_size);
    table.push(0x41);
    table.push(data_size as u8);
    table.push((data_size >> 8) as u8);
    table.push((data_size >> 16) as u8);
    for region in regions {
        for clause in &region.clauses {
            table.extend_from_slice(&clause.kind.flags().to_le_bytes());
            table.extend_from_slice(&region.try_start.to_le_bytes());
            table.extend_from_slice(&region.try_length.to_le_bytes());
            table.extend_from_slice(&clause.handler_start.to_le_bytes());
            table.extend_from_slice(&clause.handler_length.to_le_bytes());
            table.extend_from_slice(&clause.extra.to_le_bytes());
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::Module;

    fn emitter() -> Emitter {
        Emitter::new(Module::new()).with_kind_checking(true)
    }

    #[test]
    fn test_try_catch_region_shape() {
        let module = Module::new();
        let wk = module.well_known().clone();
        let mut e = Emitter::new(module).with_kind_checking(true);

        e.begin_exception_block();
        e.no_operation().unwrap();
        e.begin_catch_block(&wk.type_error).unwrap();
        assert_eq!(e.stack_depth(), 1);
        e.pop().unwrap();
        e.end_exception_block().unwrap();

        assert!(e.active_regions.is_empty());
        assert_eq!(e.done_regions.len(), 1);
        let region = &e.done_regions[0];
        assert_eq!(region.try_start, 0);
        // nop(1) + leave(5) = 6 bytes of try body.
        assert_eq!(region.try_length, 6);
        assert_eq!(region.clauses.len(), 1);
        assert_eq!(region.clauses[0].handler_start, 6);
        // pop(1) + leave(5).
        assert_eq!(region.clauses[0].handler_length, 6);
        assert_eq!(region.clauses[0].extra, wk.type_error.token.as_u32());
    }

    #[test]
    fn test_duplicate_catch_type_rejected() {
        let module = Module::new();
        let wk = module.well_known().clone();
        let mut e = Emitter::new(module).with_kind_checking(true);
        e.begin_exception_block();
        e.no_operation().unwrap();
        e.begin_catch_block(&wk.type_error).unwrap();
        e.pop().unwrap();
        assert_eq!(
            e.begin_catch_block(&wk.type_error).unwrap_err(),
            EmitError::DuplicateCatch
        );
    }

    #[test]
    fn test_distinct_catch_types_allowed() {
        let module = Module::new();
        let wk = module.well_known().clone();
        let other = module.type_ref("HostError");
        let mut e = Emitter::new(module).with_kind_checking(true);
        e.begin_exception_block();
        e.no_operation().unwrap();
        e.begin_catch_block(&wk.type_error).unwrap();
        e.pop().unwrap();
        e.begin_catch_block(&other).unwrap();
        e.pop().unwrap();
        e.end_exception_block().unwrap();
        assert_eq!(e.done_regions[0].clauses.len(), 2);
    }

    #[test]
    fn test_duplicate_finally_rejected() {
        let module = Module::new();
        let wk = module.well_known().clone();
        let mut e = Emitter::new(module).with_kind_checking(true);
        e.begin_exception_block();
        e.no_operation().unwrap();
        e.begin_catch_block(&wk.type_error).unwrap();
        e.pop().unwrap();
        e.begin_finally_block().unwrap();
        e.no_operation().unwrap();
        assert_eq!(
            e.begin_finally_block().unwrap_err(),
            EmitError::DuplicateFinally
        );
    }

    #[test]
    fn test_empty_region_rejected() {
        let mut e = emitter();
        e.begin_exception_block();
        e.no_operation().unwrap();
        assert_eq!(
            e.end_exception_block().unwrap_err(),
            EmitError::EmptyExceptionRegion
        );
    }

    #[test]
    fn test_unclosed_region_detected_at_complete() {
        let mut e = emitter();
        e.begin_exception_block();
        e.no_operation().unwrap();
        assert_eq!(
            e.complete().unwrap_err(),
            EmitError::UnclosedExceptionRegion
        );
    }

    #[test]
    fn test_misplaced_endfilter() {
        let mut e = emitter();
        assert_eq!(e.end_filter().unwrap_err(), EmitError::MisplacedEndFilter);
    }

    #[test]
    fn test_misplaced_endfinally() {
        let mut e = emitter();
        assert_eq!(e.end_finally().unwrap_err(), EmitError::MisplacedEndFinally);
    }

    #[test]
    fn test_filter_state_machine() {
        let mut e = emitter();
        e.begin_exception_block();
        e.no_operation().unwrap();
        e.begin_filter_block().unwrap();
        assert_eq!(e.stack_depth(), 1);
        e.pop().unwrap();
        e.load_int32(1).unwrap();
        e.end_filter().unwrap();
        // Handler begins with the exception object installed.
        assert_eq!(e.stack_depth(), 1);
        e.pop().unwrap();
        e.end_exception_block().unwrap();
        let clause = e.done_regions[0].clauses[0];
        assert_eq!(clause.kind, ClauseKind::Filter);
        assert!(clause.extra < clause.handler_start);
    }

    #[test]
    fn test_serialized_table_layout() {
        let module = Module::new();
        let wk = module.well_known().clone();
        let mut e = Emitter::new(module).with_kind_checking(true);
        e.begin_exception_block();
        e.no_operation().unwrap();
        e.begin_catch_block(&wk.type_error).unwrap();
        e.pop().unwrap();
        e.begin_finally_block().unwrap();
        e.no_operation().unwrap();
        e.end_exception_block().unwrap();
        let completed = e.complete().unwrap();

        let table = &completed.exception_table;
        assert_eq!(table.len(), 4 + 2 * 24);
        assert_eq!(table[0], 0x41);
        let size = u32::from_le_bytes([table[1], table[2], table[3], 0]);
        assert_eq!(size, 4 + 2 * 24);
        // First clause: catch (flags 0) with the exception type token.
        assert_eq!(&table[4..8], &0u32.to_le_bytes());
        assert_eq!(
            &table[24..28],
            &wk.type_error.token.as_u32().to_le_bytes()
        );
        // Second clause: finally (flags 2), extra word zero.
        assert_eq!(&table[28..32], &2u32.to_le_bytes());
        assert_eq!(&table[48..52], &0u32.to_le_bytes());
    }

    #[test]
    fn test_nested_regions_serialize_inner_first() {
        let module = Module::new();
        let wk = module.well_known().clone();
        let mut e = Emitter::new(module).with_kind_checking(true);
        e.begin_exception_block(); // outer
        e.no_operation().unwrap();
        e.begin_exception_block(); // inner
        e.no_operation().unwrap();
        e.begin_catch_block(&wk.type_error).unwrap();
        e.pop().unwrap();
        e.end_exception_block().unwrap();
        e.begin_finally_block().unwrap();
        e.no_operation().unwrap();
        e.end_exception_block().unwrap();

        assert_eq!(e.done_regions.len(), 2);
        let inner = &e.done_regions[0];
        let outer = &e.done_regions[1];
        assert!(inner.try_start > outer.try_start);
        assert!(inner.try_length < outer.try_length);
    }
}
