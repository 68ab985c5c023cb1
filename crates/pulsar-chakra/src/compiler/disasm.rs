//! Reference decoder for the emitted instruction stream.
//!
//! Decodes a code buffer back into mnemonic/operand pairs using the same ISA
//! tables as the emitter. Used by the round-trip tests and for diagnostic
//! listings; it understands the short branch forms the emitter never emits.

use crate::compiler::opcode::{ExtOpCode, OpCode, OperandShape, EXTENDED_PREFIX};
use std::fmt;
use thiserror::Error;

/// Decoding failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A byte that names no instruction.
    #[error("unknown opcode 0x{byte:02X} at offset {offset}")]
    UnknownOpcode {
        /// Offset of the offending byte.
        offset: usize,
        /// The unrecognized byte.
        byte: u8,
    },
    /// The buffer ended inside an instruction.
    #[error("truncated instruction at offset {offset}")]
    Truncated {
        /// Offset of the truncated instruction.
        offset: usize,
    },
}

/// A decoded inline operand.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedOperand {
    /// No operand.
    None,
    /// Signed byte immediate.
    Int8(i8),
    /// Unsigned byte index.
    UInt8(u8),
    /// Two-byte index.
    UInt16(u16),
    /// Four-byte immediate.
    Int32(i32),
    /// Eight-byte immediate.
    Int64(i64),
    /// Single-precision immediate.
    Float32(f32),
    /// Double-precision immediate.
    Float64(f64),
    /// Metadata token.
    Token(u32),
    /// Branch target as an absolute code offset.
    Target(u32),
    /// Switch table of absolute code offsets.
    Switch(Vec<u32>),
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    /// Byte offset of the opcode.
    pub offset: u32,
    /// Assembler mnemonic.
    pub mnemonic: &'static str,
    /// Inline operand, with branch targets made absolute.
    pub operand: DecodedOperand,
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IL_{:04X}: {}", self.offset, self.mnemonic)?;
        match &self.operand {
            DecodedOperand::None => Ok(()),
            DecodedOperand::Int8(v) => write!(f, " {}", v),
            DecodedOperand::UInt8(v) => write!(f, " {}", v),
            DecodedOperand::UInt16(v) => write!(f, " {}", v),
            DecodedOperand::Int32(v) => write!(f, " {}", v),
            DecodedOperand::Int64(v) => write!(f, " {}", v),
            DecodedOperand::Float32(v) => write!(f, " {}", v),
            DecodedOperand::Float64(v) => write!(f, " {}", v),
            DecodedOperand::Token(v) => write!(f, " 0x{:08X}", v),
            DecodedOperand::Target(v) => write!(f, " IL_{:04X}", v),
            DecodedOperand::Switch(targets) => {
                write!(f, " (")?;
                for (i, target) in targets.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "IL_{:04X}", target)?;
                }
                write!(f, ")")
            }
        }
    }
}

struct Reader<'a> {
    code: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.position + len > self.code.len() {
            return Err(DecodeError::Truncated {
                offset: self.position,
            });
        }
        let slice = &self.code[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }
}

fn absolute_target(base: usize, relative: i64) -> u32 {
    (base as i64 + relative) as u32
}

/// Decodes a full code buffer into its instruction sequence.
pub fn disassemble(code: &[u8]) -> Result<Vec<Inst>, DecodeError> {
    let mut reader = Reader { code, position: 0 };
    let mut listing = Vec::new();

    while reader.position < code.len() {
        let offset = reader.position as u32;
        let byte = reader.u8()?;
        let (mnemonic, shape) = if byte == EXTENDED_PREFIX {
            let ext_offset = reader.position;
            let ext = reader.u8()?;
            let op = ExtOpCode::from_byte(ext).ok_or(DecodeError::UnknownOpcode {
                offset: ext_offset,
                byte: ext,
            })?;
            (op.mnemonic(), op.operand_shape())
        } else {
            let op = OpCode::from_byte(byte).ok_or(DecodeError::UnknownOpcode {
                offset: offset as usize,
                byte,
            })?;
            (op.mnemonic(), op.operand_shape())
        };

        let operand = match shape {
            OperandShape::None => DecodedOperand::None,
            OperandShape::Int8 => DecodedOperand::Int8(reader.u8()? as i8),
            OperandShape::UInt8 => DecodedOperand::UInt8(reader.u8()?),
            OperandShape::UInt16 => DecodedOperand::UInt16(reader.u16()?),
            OperandShape::Int32 => DecodedOperand::Int32(reader.u32()? as i32),
            OperandShape::Int64 => DecodedOperand::Int64(reader.u64()? as i64),
            OperandShape::Float32 => DecodedOperand::Float32(f32::from_bits(reader.u32()?)),
            OperandShape::Float64 => DecodedOperand::Float64(f64::from_bits(reader.u64()?)),
            OperandShape::Token => DecodedOperand::Token(reader.u32()?),
            OperandShape::Target8 => {
                let relative = reader.u8()? as i8 as i64;
                DecodedOperand::Target(absolute_target(reader.position, relative))
            }
            OperandShape::Target32 => {
                let relative = reader.u32()? as i32 as i64;
                DecodedOperand::Target(absolute_target(reader.position, relative))
            }
            OperandShape::SwitchTable => {
                let count = reader.u32()? as usize;
                let base = reader.position + 4 * count;
                let mut targets = Vec::with_capacity(count);
                for _ in 0..count {
                    let relative = reader.u32()? as i32 as i64;
                    targets.push(absolute_target(base, relative));
                }
                DecodedOperand::Switch(targets)
            }
        };

        listing.push(Inst {
            offset,
            mnemonic,
            operand,
        });
    }

    Ok(listing)
}

/// Convenience: the mnemonics of a decoded buffer, for terse assertions.
pub fn mnemonics(code: &[u8]) -> Result<Vec<&'static str>, DecodeError> {
    Ok(disassemble(code)?.into_iter().map(|i| i.mnemonic).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_simple_sequence() {
        // ldc.i4.1; ldc.i4.2; add; ret
        let code = [0x17, 0x18, 0x58, 0x2A];
        let listing = disassemble(&code).unwrap();
        let names: Vec<_> = listing.iter().map(|i| i.mnemonic).collect();
        assert_eq!(names, vec!["ldc.i4.1", "ldc.i4.2", "add", "ret"]);
    }

    #[test]
    fn test_decode_branch_target_absolute() {
        // br +0 (lands right after); nop
        let code = [0x38, 0x00, 0x00, 0x00, 0x00, 0x00];
        let listing = disassemble(&code).unwrap();
        assert_eq!(listing[0].operand, DecodedOperand::Target(5));
    }

    #[test]
    fn test_decode_short_branch_form() {
        // br.s -2 loops back onto the opcode.
        let code = [0x2B, 0xFE];
        let listing = disassemble(&code).unwrap();
        assert_eq!(listing[0].operand, DecodedOperand::Target(0));
    }

    #[test]
    fn test_decode_extended_opcode() {
        let code = [0xFE, 0x01, 0x2A];
        let listing = disassemble(&code).unwrap();
        assert_eq!(listing[0].mnemonic, "ceq");
        assert_eq!(listing[1].mnemonic, "ret");
    }

    #[test]
    fn test_decode_switch_table() {
        // switch with two entries of 0 and 1, then two nops.
        let mut code = vec![0x45];
        code.extend_from_slice(&2u32.to_le_bytes());
        code.extend_from_slice(&0i32.to_le_bytes());
        code.extend_from_slice(&1i32.to_le_bytes());
        code.push(0x00);
        code.push(0x00);
        let listing = disassemble(&code).unwrap();
        assert_eq!(listing[0].operand, DecodedOperand::Switch(vec![13, 14]));
    }

    #[test]
    fn test_unknown_opcode() {
        let code = [0xC0];
        assert!(matches!(
            disassemble(&code).unwrap_err(),
            DecodeError::UnknownOpcode { byte: 0xC0, .. }
        ));
    }

    #[test]
    fn test_truncated_operand() {
        let code = [0x20, 0x01];
        assert!(matches!(
            disassemble(&code).unwrap_err(),
            DecodeError::Truncated { .. }
        ));
    }

    #[test]
    fn test_display_format() {
        let code = [0x17, 0x2A];
        let listing = disassemble(&code).unwrap();
        assert_eq!(listing[0].to_string(), "IL_0000: ldc.i4.1");
        assert_eq!(listing[1].to_string(), "IL_0001: ret");
    }
}
