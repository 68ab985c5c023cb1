//! Stack-machine instruction set tables.
//!
//! One-byte primary opcodes occupy 0x00–0xDD; extended opcodes are prefixed
//! with [`EXTENDED_PREFIX`] (0xFE). Integer operands are little-endian.
//! Branch operands are signed offsets relative to the next instruction.
//!
//! The emitter never produces the short (1-byte offset) branch forms, but the
//! decoder understands them so foreign byte streams still disassemble.

/// Prefix byte introducing the two-byte opcode page.
pub const EXTENDED_PREFIX: u8 = 0xFE;

/// Shape of an instruction's inline operand, used for decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandShape {
    /// No inline operand.
    None,
    /// One signed byte.
    Int8,
    /// One unsigned byte (slot or argument index).
    UInt8,
    /// Two unsigned bytes (extended slot or argument index).
    UInt16,
    /// Four signed bytes.
    Int32,
    /// Eight signed bytes.
    Int64,
    /// Four bytes, IEEE-754 single.
    Float32,
    /// Eight bytes, IEEE-754 double.
    Float64,
    /// Four-byte metadata token.
    Token,
    /// One signed byte, branch offset relative to the next instruction.
    Target8,
    /// Four signed bytes, branch offset relative to the next instruction.
    Target32,
    /// Unsigned count followed by that many 4-byte relative offsets.
    SwitchTable,
}

macro_rules! opcode_page {
    ($(#[$attr:meta])* $name:ident {
        $($variant:ident = $value:literal, $mnemonic:literal, $shape:ident;)*
    }) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum $name {
            $(
                #[doc = $mnemonic]
                $variant = $value,
            )*
        }

        impl $name {
            /// Decodes a raw byte into an opcode, if it names one.
            pub fn from_byte(byte: u8) -> Option<Self> {
                match byte {
                    $($value => Some(Self::$variant),)*
                    _ => None,
                }
            }

            /// The raw encoding byte.
            pub fn byte(self) -> u8 {
                self as u8
            }

            /// The assembler mnemonic.
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Self::$variant => $mnemonic,)*
                }
            }

            /// The shape of the inline operand that follows the opcode.
            pub fn operand_shape(self) -> OperandShape {
                match self {
                    $(Self::$variant => OperandShape::$shape,)*
                }
            }
        }
    };
}

opcode_page! {
    /// Primary (one-byte) opcodes.
    OpCode {
        Nop = 0x00, "nop", None;
        Break = 0x01, "break", None;
        Ldarg0 = 0x02, "ldarg.0", None;
        Ldarg1 = 0x03, "ldarg.1", None;
        Ldarg2 = 0x04, "ldarg.2", None;
        Ldarg3 = 0x05, "ldarg.3", None;
        Ldloc0 = 0x06, "ldloc.0", None;
        Ldloc1 = 0x07, "ldloc.1", None;
        Ldloc2 = 0x08, "ldloc.2", None;
        Ldloc3 = 0x09, "ldloc.3", None;
        Stloc0 = 0x0A, "stloc.0", None;
        Stloc1 = 0x0B, "stloc.1", None;
        Stloc2 = 0x0C, "stloc.2", None;
        Stloc3 = 0x0D, "stloc.3", None;
        LdargS = 0x0E, "ldarg.s", UInt8;
        LdargaS = 0x0F, "ldarga.s", UInt8;
        StargS = 0x10, "starg.s", UInt8;
        LdlocS = 0x11, "ldloc.s", UInt8;
        LdlocaS = 0x12, "ldloca.s", UInt8;
        StlocS = 0x13, "stloc.s", UInt8;
        Ldnull = 0x14, "ldnull", None;
        LdcI4M1 = 0x15, "ldc.i4.m1", None;
        LdcI40 = 0x16, "ldc.i4.0", None;
        LdcI41 = 0x17, "ldc.i4.1", None;
        LdcI42 = 0x18, "ldc.i4.2", None;
        LdcI43 = 0x19, "ldc.i4.3", None;
        LdcI44 = 0x1A, "ldc.i4.4", None;
        LdcI45 = 0x1B, "ldc.i4.5", None;
        LdcI46 = 0x1C, "ldc.i4.6", None;
        LdcI47 = 0x1D, "ldc.i4.7", None;
        LdcI48 = 0x1E, "ldc.i4.8", None;
        LdcI4S = 0x1F, "ldc.i4.s", Int8;
        LdcI4 = 0x20, "ldc.i4", Int32;
        LdcI8 = 0x21, "ldc.i8", Int64;
        LdcR4 = 0x22, "ldc.r4", Float32;
        LdcR8 = 0x23, "ldc.r8", Float64;
        Dup = 0x25, "dup", None;
        Pop = 0x26, "pop", None;
        Call = 0x28, "call", Token;
        Ret = 0x2A, "ret", None;
        BrS = 0x2B, "br.s", Target8;
        BrfalseS = 0x2C, "brfalse.s", Target8;
        BrtrueS = 0x2D, "brtrue.s", Target8;
        BeqS = 0x2E, "beq.s", Target8;
        BgeS = 0x2F, "bge.s", Target8;
        BgtS = 0x30, "bgt.s", Target8;
        BleS = 0x31, "ble.s", Target8;
        BltS = 0x32, "blt.s", Target8;
        BneUnS = 0x33, "bne.un.s", Target8;
        BgeUnS = 0x34, "bge.un.s", Target8;
        BgtUnS = 0x35, "bgt.un.s", Target8;
        BleUnS = 0x36, "ble.un.s", Target8;
        BltUnS = 0x37, "blt.un.s", Target8;
        Br = 0x38, "br", Target32;
        Brfalse = 0x39, "brfalse", Target32;
        Brtrue = 0x3A, "brtrue", Target32;
        Beq = 0x3B, "beq", Target32;
        Bge = 0x3C, "bge", Target32;
        Bgt = 0x3D, "bgt", Target32;
        Ble = 0x3E, "ble", Target32;
        Blt = 0x3F, "blt", Target32;
        BneUn = 0x40, "bne.un", Target32;
        BgeUn = 0x41, "bge.un", Target32;
        BgtUn = 0x42, "bgt.un", Target32;
        BleUn = 0x43, "ble.un", Target32;
        BltUn = 0x44, "blt.un", Target32;
        Switch = 0x45, "switch", SwitchTable;
        Add = 0x58, "add", None;
        Sub = 0x59, "sub", None;
        Mul = 0x5A, "mul", None;
        Div = 0x5B, "div", None;
        DivUn = 0x5C, "div.un", None;
        Rem = 0x5D, "rem", None;
        RemUn = 0x5E, "rem.un", None;
        And = 0x5F, "and", None;
        Or = 0x60, "or", None;
        Xor = 0x61, "xor", None;
        Shl = 0x62, "shl", None;
        Shr = 0x63, "shr", None;
        ShrUn = 0x64, "shr.un", None;
        Neg = 0x65, "neg", None;
        Not = 0x66, "not", None;
        ConvI4 = 0x69, "conv.i4", None;
        ConvI8 = 0x6A, "conv.i8", None;
        ConvR8 = 0x6C, "conv.r8", None;
        ConvU4 = 0x6D, "conv.u4", None;
        Callvirt = 0x6F, "callvirt", Token;
        Ldstr = 0x72, "ldstr", Token;
        Newobj = 0x73, "newobj", Token;
        Castclass = 0x74, "castclass", Token;
        Isinst = 0x75, "isinst", Token;
        ConvRUn = 0x76, "conv.r.un", None;
        Throw = 0x7A, "throw", None;
        Ldfld = 0x7B, "ldfld", Token;
        Stfld = 0x7D, "stfld", Token;
        Ldsfld = 0x7E, "ldsfld", Token;
        Stsfld = 0x80, "stsfld", Token;
        Box = 0x8C, "box", Token;
        Newarr = 0x8D, "newarr", Token;
        Ldlen = 0x8E, "ldlen", None;
        LdelemI1 = 0x90, "ldelem.i1", None;
        LdelemU1 = 0x91, "ldelem.u1", None;
        LdelemI2 = 0x92, "ldelem.i2", None;
        LdelemU2 = 0x93, "ldelem.u2", None;
        LdelemI4 = 0x94, "ldelem.i4", None;
        LdelemU4 = 0x95, "ldelem.u4", None;
        LdelemI8 = 0x96, "ldelem.i8", None;
        LdelemI = 0x97, "ldelem.i", None;
        LdelemR4 = 0x98, "ldelem.r4", None;
        LdelemR8 = 0x99, "ldelem.r8", None;
        LdelemRef = 0x9A, "ldelem.ref", None;
        StelemI = 0x9B, "stelem.i", None;
        StelemI1 = 0x9C, "stelem.i1", None;
        StelemI2 = 0x9D, "stelem.i2", None;
        StelemI4 = 0x9E, "stelem.i4", None;
        StelemI8 = 0x9F, "stelem.i8", None;
        StelemR4 = 0xA0, "stelem.r4", None;
        StelemR8 = 0xA1, "stelem.r8", None;
        StelemRef = 0xA2, "stelem.ref", None;
        ConvI = 0xD3, "conv.i", None;
        Endfinally = 0xDC, "endfinally", None;
        Leave = 0xDD, "leave", Target32;
        LeaveS = 0xDE, "leave.s", Target8;
    }
}

opcode_page! {
    /// Extended (0xFE-prefixed) opcodes.
    ExtOpCode {
        Ceq = 0x01, "ceq", None;
        Cgt = 0x02, "cgt", None;
        CgtUn = 0x03, "cgt.un", None;
        Clt = 0x04, "clt", None;
        CltUn = 0x05, "clt.un", None;
        Ldarg = 0x09, "ldarg", UInt16;
        Ldarga = 0x0A, "ldarga", UInt16;
        Starg = 0x0B, "starg", UInt16;
        Ldloc = 0x0C, "ldloc", UInt16;
        Ldloca = 0x0D, "ldloca", UInt16;
        Stloc = 0x0E, "stloc", UInt16;
        Endfilter = 0x11, "endfilter", None;
        Rethrow = 0x1A, "rethrow", None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_round_trip() {
        for byte in 0..=0xFFu8 {
            if let Some(op) = OpCode::from_byte(byte) {
                assert_eq!(op.byte(), byte);
            }
        }
    }

    #[test]
    fn test_extended_round_trip() {
        for byte in 0..=0xFFu8 {
            if let Some(op) = ExtOpCode::from_byte(byte) {
                assert_eq!(op.byte(), byte);
            }
        }
    }

    #[test]
    fn test_mnemonics() {
        assert_eq!(OpCode::LdcI4S.mnemonic(), "ldc.i4.s");
        assert_eq!(OpCode::Leave.mnemonic(), "leave");
        assert_eq!(ExtOpCode::CltUn.mnemonic(), "clt.un");
    }

    #[test]
    fn test_operand_shapes() {
        assert_eq!(OpCode::Br.operand_shape(), OperandShape::Target32);
        assert_eq!(OpCode::BrS.operand_shape(), OperandShape::Target8);
        assert_eq!(OpCode::Switch.operand_shape(), OperandShape::SwitchTable);
        assert_eq!(OpCode::LdcR8.operand_shape(), OperandShape::Float64);
        assert_eq!(ExtOpCode::Stloc.operand_shape(), OperandShape::UInt16);
    }

    #[test]
    fn test_unsigned_64bit_element_access_aliases_signed() {
        // The loader ABI reuses the signed element opcodes for u64 access.
        assert_eq!(OpCode::StelemI8.byte(), 0x9F);
        assert_eq!(OpCode::LdelemI8.byte(), 0x96);
    }
}
