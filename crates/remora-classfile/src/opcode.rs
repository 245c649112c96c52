//! JVM instruction set
//!
//! Defines every opcode of the JVM instruction set (JVMS chapter 6) together
//! with an instruction decoder that understands `wide` and the aligned switch
//! instructions.

use crate::encoder::DecodeError;

macro_rules! opcodes {
    ($($variant:ident = $byte:literal => $mnemonic:literal,)*) => {
        /// JVM opcode enumeration
        ///
        /// Opcodes are grouped the way JVMS orders them:
        /// - 0x00-0x14: constants
        /// - 0x15-0x35: loads
        /// - 0x36-0x56: stores
        /// - 0x57-0x5F: stack manipulation
        /// - 0x60-0x84: arithmetic
        /// - 0x85-0x93: conversions
        /// - 0x94-0xA6: comparisons
        /// - 0xA7-0xB1: control
        /// - 0xB2-0xC3: references
        /// - 0xC4-0xC9: extended
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $(
                #[doc = $mnemonic]
                $variant = $byte,
            )*
        }

        impl Opcode {
            /// Convert a byte to an opcode
            pub fn from_u8(byte: u8) -> Option<Self> {
                match byte {
                    $($byte => Some(Self::$variant),)*
                    _ => None,
                }
            }

            /// Get the JVMS mnemonic
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Self::$variant => $mnemonic,)*
                }
            }
        }
    };
}

opcodes! {
    // Constants
    Nop = 0x00 => "nop",
    AconstNull = 0x01 => "aconst_null",
    IconstM1 = 0x02 => "iconst_m1",
    Iconst0 = 0x03 => "iconst_0",
    Iconst1 = 0x04 => "iconst_1",
    Iconst2 = 0x05 => "iconst_2",
    Iconst3 = 0x06 => "iconst_3",
    Iconst4 = 0x07 => "iconst_4",
    Iconst5 = 0x08 => "iconst_5",
    Lconst0 = 0x09 => "lconst_0",
    Lconst1 = 0x0A => "lconst_1",
    Fconst0 = 0x0B => "fconst_0",
    Fconst1 = 0x0C => "fconst_1",
    Fconst2 = 0x0D => "fconst_2",
    Dconst0 = 0x0E => "dconst_0",
    Dconst1 = 0x0F => "dconst_1",
    Bipush = 0x10 => "bipush",
    Sipush = 0x11 => "sipush",
    Ldc = 0x12 => "ldc",
    LdcW = 0x13 => "ldc_w",
    Ldc2W = 0x14 => "ldc2_w",

    // Loads
    Iload = 0x15 => "iload",
    Lload = 0x16 => "lload",
    Fload = 0x17 => "fload",
    Dload = 0x18 => "dload",
    Aload = 0x19 => "aload",
    Iload0 = 0x1A => "iload_0",
    Iload1 = 0x1B => "iload_1",
    Iload2 = 0x1C => "iload_2",
    Iload3 = 0x1D => "iload_3",
    Lload0 = 0x1E => "lload_0",
    Lload1 = 0x1F => "lload_1",
    Lload2 = 0x20 => "lload_2",
    Lload3 = 0x21 => "lload_3",
    Fload0 = 0x22 => "fload_0",
    Fload1 = 0x23 => "fload_1",
    Fload2 = 0x24 => "fload_2",
    Fload3 = 0x25 => "fload_3",
    Dload0 = 0x26 => "dload_0",
    Dload1 = 0x27 => "dload_1",
    Dload2 = 0x28 => "dload_2",
    Dload3 = 0x29 => "dload_3",
    Aload0 = 0x2A => "aload_0",
    Aload1 = 0x2B => "aload_1",
    Aload2 = 0x2C => "aload_2",
    Aload3 = 0x2D => "aload_3",
    Iaload = 0x2E => "iaload",
    Laload = 0x2F => "laload",
    Faload = 0x30 => "faload",
    Daload = 0x31 => "daload",
    Aaload = 0x32 => "aaload",
    Baload = 0x33 => "baload",
    Caload = 0x34 => "caload",
    Saload = 0x35 => "saload",

    // Stores
    Istore = 0x36 => "istore",
    Lstore = 0x37 => "lstore",
    Fstore = 0x38 => "fstore",
    Dstore = 0x39 => "dstore",
    Astore = 0x3A => "astore",
    Istore0 = 0x3B => "istore_0",
    Istore1 = 0x3C => "istore_1",
    Istore2 = 0x3D => "istore_2",
    Istore3 = 0x3E => "istore_3",
    Lstore0 = 0x3F => "lstore_0",
    Lstore1 = 0x40 => "lstore_1",
    Lstore2 = 0x41 => "lstore_2",
    Lstore3 = 0x42 => "lstore_3",
    Fstore0 = 0x43 => "fstore_0",
    Fstore1 = 0x44 => "fstore_1",
    Fstore2 = 0x45 => "fstore_2",
    Fstore3 = 0x46 => "fstore_3",
    Dstore0 = 0x47 => "dstore_0",
    Dstore1 = 0x48 => "dstore_1",
    Dstore2 = 0x49 => "dstore_2",
    Dstore3 = 0x4A => "dstore_3",
    Astore0 = 0x4B => "astore_0",
    Astore1 = 0x4C => "astore_1",
    Astore2 = 0x4D => "astore_2",
    Astore3 = 0x4E => "astore_3",
    Iastore = 0x4F => "iastore",
    Lastore = 0x50 => "lastore",
    Fastore = 0x51 => "fastore",
    Dastore = 0x52 => "dastore",
    Aastore = 0x53 => "aastore",
    Bastore = 0x54 => "bastore",
    Castore = 0x55 => "castore",
    Sastore = 0x56 => "sastore",

    // Stack
    Pop = 0x57 => "pop",
    Pop2 = 0x58 => "pop2",
    Dup = 0x59 => "dup",
    DupX1 = 0x5A => "dup_x1",
    DupX2 = 0x5B => "dup_x2",
    Dup2 = 0x5C => "dup2",
    Dup2X1 = 0x5D => "dup2_x1",
    Dup2X2 = 0x5E => "dup2_x2",
    Swap = 0x5F => "swap",

    // Math
    Iadd = 0x60 => "iadd",
    Ladd = 0x61 => "ladd",
    Fadd = 0x62 => "fadd",
    Dadd = 0x63 => "dadd",
    Isub = 0x64 => "isub",
    Lsub = 0x65 => "lsub",
    Fsub = 0x66 => "fsub",
    Dsub = 0x67 => "dsub",
    Imul = 0x68 => "imul",
    Lmul = 0x69 => "lmul",
    Fmul = 0x6A => "fmul",
    Dmul = 0x6B => "dmul",
    Idiv = 0x6C => "idiv",
    Ldiv = 0x6D => "ldiv",
    Fdiv = 0x6E => "fdiv",
    Ddiv = 0x6F => "ddiv",
    Irem = 0x70 => "irem",
    Lrem = 0x71 => "lrem",
    Frem = 0x72 => "frem",
    Drem = 0x73 => "drem",
    Ineg = 0x74 => "ineg",
    Lneg = 0x75 => "lneg",
    Fneg = 0x76 => "fneg",
    Dneg = 0x77 => "dneg",
    Ishl = 0x78 => "ishl",
    Lshl = 0x79 => "lshl",
    Ishr = 0x7A => "ishr",
    Lshr = 0x7B => "lshr",
    Iushr = 0x7C => "iushr",
    Lushr = 0x7D => "lushr",
    Iand = 0x7E => "iand",
    Land = 0x7F => "land",
    Ior = 0x80 => "ior",
    Lor = 0x81 => "lor",
    Ixor = 0x82 => "ixor",
    Lxor = 0x83 => "lxor",
    Iinc = 0x84 => "iinc",

    // Conversions
    I2l = 0x85 => "i2l",
    I2f = 0x86 => "i2f",
    I2d = 0x87 => "i2d",
    L2i = 0x88 => "l2i",
    L2f = 0x89 => "l2f",
    L2d = 0x8A => "l2d",
    F2i = 0x8B => "f2i",
    F2l = 0x8C => "f2l",
    F2d = 0x8D => "f2d",
    D2i = 0x8E => "d2i",
    D2l = 0x8F => "d2l",
    D2f = 0x90 => "d2f",
    I2b = 0x91 => "i2b",
    I2c = 0x92 => "i2c",
    I2s = 0x93 => "i2s",

    // Comparisons
    Lcmp = 0x94 => "lcmp",
    Fcmpl = 0x95 => "fcmpl",
    Fcmpg = 0x96 => "fcmpg",
    Dcmpl = 0x97 => "dcmpl",
    Dcmpg = 0x98 => "dcmpg",
    Ifeq = 0x99 => "ifeq",
    Ifne = 0x9A => "ifne",
    Iflt = 0x9B => "iflt",
    Ifge = 0x9C => "ifge",
    Ifgt = 0x9D => "ifgt",
    Ifle = 0x9E => "ifle",
    IfIcmpeq = 0x9F => "if_icmpeq",
    IfIcmpne = 0xA0 => "if_icmpne",
    IfIcmplt = 0xA1 => "if_icmplt",
    IfIcmpge = 0xA2 => "if_icmpge",
    IfIcmpgt = 0xA3 => "if_icmpgt",
    IfIcmple = 0xA4 => "if_icmple",
    IfAcmpeq = 0xA5 => "if_acmpeq",
    IfAcmpne = 0xA6 => "if_acmpne",

    // Control
    Goto = 0xA7 => "goto",
    Jsr = 0xA8 => "jsr",
    Ret = 0xA9 => "ret",
    Tableswitch = 0xAA => "tableswitch",
    Lookupswitch = 0xAB => "lookupswitch",
    Ireturn = 0xAC => "ireturn",
    Lreturn = 0xAD => "lreturn",
    Freturn = 0xAE => "freturn",
    Dreturn = 0xAF => "dreturn",
    Areturn = 0xB0 => "areturn",
    Return = 0xB1 => "return",

    // References
    Getstatic = 0xB2 => "getstatic",
    Putstatic = 0xB3 => "putstatic",
    Getfield = 0xB4 => "getfield",
    Putfield = 0xB5 => "putfield",
    Invokevirtual = 0xB6 => "invokevirtual",
    Invokespecial = 0xB7 => "invokespecial",
    Invokestatic = 0xB8 => "invokestatic",
    Invokeinterface = 0xB9 => "invokeinterface",
    Invokedynamic = 0xBA => "invokedynamic",
    New = 0xBB => "new",
    Newarray = 0xBC => "newarray",
    Anewarray = 0xBD => "anewarray",
    Arraylength = 0xBE => "arraylength",
    Athrow = 0xBF => "athrow",
    Checkcast = 0xC0 => "checkcast",
    Instanceof = 0xC1 => "instanceof",
    Monitorenter = 0xC2 => "monitorenter",
    Monitorexit = 0xC3 => "monitorexit",

    // Extended
    Wide = 0xC4 => "wide",
    Multianewarray = 0xC5 => "multianewarray",
    Ifnull = 0xC6 => "ifnull",
    Ifnonnull = 0xC7 => "ifnonnull",
    GotoW = 0xC8 => "goto_w",
    JsrW = 0xC9 => "jsr_w",
}

impl Opcode {
    /// Convert opcode to its byte value
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Size in bytes of the operands that follow the opcode, or `None` for
    /// the variable-length instructions (`tableswitch`, `lookupswitch`, `wide`).
    pub fn operand_size(self) -> Option<usize> {
        use Opcode::*;
        Some(match self {
            Bipush | Ldc | Iload | Lload | Fload | Dload | Aload | Istore | Lstore | Fstore
            | Dstore | Astore | Ret | Newarray => 1,
            Sipush | LdcW | Ldc2W | Iinc | Getstatic | Putstatic | Getfield | Putfield
            | Invokevirtual | Invokespecial | Invokestatic | New | Anewarray | Checkcast
            | Instanceof | Ifnull | Ifnonnull => 2,
            op if op.is_conditional_branch() || matches!(op, Goto | Jsr) => 2,
            Multianewarray => 3,
            Invokeinterface | Invokedynamic | GotoW | JsrW => 4,
            Tableswitch | Lookupswitch | Wide => return None,
            _ => 0,
        })
    }

    /// Check if this opcode is a two-way conditional branch
    pub fn is_conditional_branch(self) -> bool {
        let b = self as u8;
        (0x99..=0xA6).contains(&b) || matches!(self, Self::Ifnull | Self::Ifnonnull)
    }

    /// Check if this opcode transfers control to an explicit target
    pub fn is_branch(self) -> bool {
        self.is_conditional_branch()
            || matches!(
                self,
                Self::Goto
                    | Self::GotoW
                    | Self::Jsr
                    | Self::JsrW
                    | Self::Tableswitch
                    | Self::Lookupswitch
            )
    }

    /// Check if this opcode is a return instruction
    pub fn is_return(self) -> bool {
        (0xAC..=0xB1).contains(&(self as u8))
    }

    /// Check if execution never falls through to the next instruction
    pub fn is_terminator(self) -> bool {
        self.is_return()
            || matches!(
                self,
                Self::Goto
                    | Self::GotoW
                    | Self::Athrow
                    | Self::Ret
                    | Self::Tableswitch
                    | Self::Lookupswitch
            )
    }

    /// Check if this opcode operates on a field or method reference
    pub fn is_member_access(self) -> bool {
        (0xB2..=0xB9).contains(&(self as u8))
    }
}

/// One decoded instruction, borrowing its bytes from the method's code array
#[derive(Debug, Clone, Copy)]
pub struct Instruction<'a> {
    /// Offset of the opcode within the code array
    pub offset: usize,
    /// The opcode (for `wide` instructions, the widened opcode)
    pub opcode: Opcode,
    /// Whether this instruction was prefixed by `wide`
    pub wide: bool,
    bytes: &'a [u8],
}

impl<'a> Instruction<'a> {
    /// Total length of the instruction in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Instructions are never empty; provided for clippy symmetry
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Raw instruction bytes, opcode included
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Offset of the following instruction
    pub fn next_offset(&self) -> usize {
        self.offset + self.bytes.len()
    }

    fn operand_start(&self) -> usize {
        if self.wide {
            2
        } else {
            1
        }
    }

    /// Unsigned byte operand
    pub fn u8_operand(&self) -> u8 {
        self.bytes[1]
    }

    /// Unsigned 16-bit operand following the opcode (constant pool index)
    pub fn u16_operand(&self) -> u16 {
        let at = self.operand_start();
        u16::from_be_bytes([self.bytes[at], self.bytes[at + 1]])
    }

    /// Local variable index of a load, store, `iinc` or `ret`
    pub fn local_index(&self) -> u16 {
        if self.wide {
            self.u16_operand()
        } else {
            self.bytes[1] as u16
        }
    }

    /// Signed increment of an `iinc`
    pub fn iinc_delta(&self) -> i16 {
        if self.wide {
            i16::from_be_bytes([self.bytes[4], self.bytes[5]])
        } else {
            self.bytes[2] as i8 as i16
        }
    }

    /// Dimensions operand of `multianewarray`
    pub fn dimensions(&self) -> u8 {
        self.bytes[3]
    }

    /// Absolute targets of a branch or switch, default target first for switches
    pub fn branch_targets(&self) -> Vec<usize> {
        let base = self.offset as i64;
        let rel = |at: usize| -> usize {
            let value = i32::from_be_bytes([
                self.bytes[at],
                self.bytes[at + 1],
                self.bytes[at + 2],
                self.bytes[at + 3],
            ]);
            (base + value as i64) as usize
        };

        match self.opcode {
            Opcode::GotoW | Opcode::JsrW => vec![rel(1)],
            Opcode::Tableswitch => {
                let pad = switch_padding(self.offset);
                let at = 1 + pad;
                let read = |i: usize| {
                    i32::from_be_bytes([
                        self.bytes[i],
                        self.bytes[i + 1],
                        self.bytes[i + 2],
                        self.bytes[i + 3],
                    ])
                };
                let low = read(at + 4);
                let high = read(at + 8);
                let mut targets = vec![rel(at)];
                for i in 0..(high - low + 1).max(0) as usize {
                    targets.push(rel(at + 12 + i * 4));
                }
                targets
            }
            Opcode::Lookupswitch => {
                let pad = switch_padding(self.offset);
                let at = 1 + pad;
                let npairs = i32::from_be_bytes([
                    self.bytes[at + 4],
                    self.bytes[at + 5],
                    self.bytes[at + 6],
                    self.bytes[at + 7],
                ])
                .max(0) as usize;
                let mut targets = vec![rel(at)];
                for i in 0..npairs {
                    targets.push(rel(at + 8 + i * 8 + 4));
                }
                targets
            }
            op if op.is_branch() => {
                let value = i16::from_be_bytes([self.bytes[1], self.bytes[2]]);
                vec![(base + value as i64) as usize]
            }
            _ => Vec::new(),
        }
    }
}

/// Padding bytes after a switch opcode at `offset` so operands are 4-byte aligned
pub fn switch_padding(offset: usize) -> usize {
    (4 - (offset + 1) % 4) % 4
}

/// Iterator decoding the instructions of a code array
pub struct Instructions<'a> {
    code: &'a [u8],
    position: usize,
    failed: bool,
}

impl<'a> Instructions<'a> {
    /// Start decoding at offset 0
    pub fn new(code: &'a [u8]) -> Self {
        Self {
            code,
            position: 0,
            failed: false,
        }
    }

    fn decode_at(&self, offset: usize) -> Result<Instruction<'a>, DecodeError> {
        let byte = *self
            .code
            .get(offset)
            .ok_or(DecodeError::UnexpectedEnd(offset))?;
        let opcode = Opcode::from_u8(byte).ok_or(DecodeError::InvalidOpcode(byte, offset))?;

        let (opcode, wide, len) = match opcode {
            Opcode::Wide => {
                let inner = *self
                    .code
                    .get(offset + 1)
                    .ok_or(DecodeError::UnexpectedEnd(offset + 1))?;
                let inner = Opcode::from_u8(inner)
                    .ok_or(DecodeError::InvalidOpcode(inner, offset + 1))?;
                let len = if inner == Opcode::Iinc { 6 } else { 4 };
                (inner, true, len)
            }
            Opcode::Tableswitch => {
                let at = offset + 1 + switch_padding(offset);
                let low = read_i32(self.code, at + 4)?;
                let high = read_i32(self.code, at + 8)?;
                let count = (high as i64 - low as i64 + 1).max(0) as usize;
                (opcode, false, at + 12 + count * 4 - offset)
            }
            Opcode::Lookupswitch => {
                let at = offset + 1 + switch_padding(offset);
                let npairs = read_i32(self.code, at + 4)?.max(0) as usize;
                (opcode, false, at + 8 + npairs * 8 - offset)
            }
            _ => (opcode, false, 1 + opcode.operand_size().unwrap_or(0)),
        };

        if offset + len > self.code.len() {
            return Err(DecodeError::UnexpectedEnd(offset));
        }

        Ok(Instruction {
            offset,
            opcode,
            wide,
            bytes: &self.code[offset..offset + len],
        })
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.position >= self.code.len() {
            return None;
        }
        match self.decode_at(self.position) {
            Ok(instruction) => {
                self.position = instruction.next_offset();
                Some(Ok(instruction))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Decode every instruction of a code array
pub fn decode_instructions(code: &[u8]) -> Result<Vec<Instruction<'_>>, DecodeError> {
    Instructions::new(code).collect()
}

fn read_i32(code: &[u8], at: usize) -> Result<i32, DecodeError> {
    code.get(at..at + 4)
        .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(DecodeError::UnexpectedEnd(at))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for byte in 0x00..=0xC9u8 {
            let opcode = Opcode::from_u8(byte).expect("every byte up to jsr_w is assigned");
            assert_eq!(opcode.to_u8(), byte);
        }
        assert!(Opcode::from_u8(0xCA).is_none());
        assert!(Opcode::from_u8(0xFF).is_none());
    }

    #[test]
    fn test_mnemonics() {
        assert_eq!(Opcode::Invokevirtual.mnemonic(), "invokevirtual");
        assert_eq!(Opcode::IfAcmpne.mnemonic(), "if_acmpne");
        assert_eq!(Opcode::Ldc2W.mnemonic(), "ldc2_w");
    }

    #[test]
    fn test_classification() {
        assert!(Opcode::Ifeq.is_conditional_branch());
        assert!(Opcode::Ifnonnull.is_conditional_branch());
        assert!(!Opcode::Goto.is_conditional_branch());
        assert!(Opcode::Goto.is_terminator());
        assert!(Opcode::Athrow.is_terminator());
        assert!(Opcode::Areturn.is_return());
        assert!(!Opcode::Ifeq.is_terminator());
        assert!(Opcode::Invokeinterface.is_member_access());
        assert!(!Opcode::Invokedynamic.is_member_access());
    }

    #[test]
    fn test_decode_simple_sequence() {
        // iload_1; ifeq +6; aload_0; areturn; aconst_null; areturn
        let code = [0x1B, 0x99, 0x00, 0x06, 0x2A, 0xB0, 0x01, 0xB0];
        let instructions = decode_instructions(&code).unwrap();
        assert_eq!(instructions.len(), 6);
        assert_eq!(instructions[1].opcode, Opcode::Ifeq);
        assert_eq!(instructions[1].branch_targets(), vec![7]);
        assert_eq!(instructions[2].offset, 4);
    }

    #[test]
    fn test_decode_wide() {
        // wide iinc 300 -1; wide aload 300; return
        let code = [0xC4, 0x84, 0x01, 0x2C, 0xFF, 0xFF, 0xC4, 0x19, 0x01, 0x2C, 0xB1];
        let instructions = decode_instructions(&code).unwrap();
        assert_eq!(instructions.len(), 3);
        assert!(instructions[0].wide);
        assert_eq!(instructions[0].opcode, Opcode::Iinc);
        assert_eq!(instructions[0].local_index(), 300);
        assert_eq!(instructions[0].iinc_delta(), -1);
        assert_eq!(instructions[1].opcode, Opcode::Aload);
        assert_eq!(instructions[1].local_index(), 300);
        assert_eq!(instructions[2].offset, 10);
    }

    #[test]
    fn test_decode_tableswitch_alignment() {
        // iload_0 at 0, tableswitch at 1 (pad 2), default +19, low 0, high 0, [+19]
        let mut code = vec![0x1A, 0xAA, 0x00, 0x00];
        code.extend_from_slice(&19i32.to_be_bytes());
        code.extend_from_slice(&0i32.to_be_bytes());
        code.extend_from_slice(&0i32.to_be_bytes());
        code.extend_from_slice(&19i32.to_be_bytes());
        code.push(0xB1); // offset 20
        let instructions = decode_instructions(&code).unwrap();
        assert_eq!(instructions.len(), 3);
        assert_eq!(instructions[1].len(), 19);
        assert_eq!(instructions[1].branch_targets(), vec![20, 20]);
    }

    #[test]
    fn test_invalid_opcode() {
        let code = [0x00, 0xFE];
        let result = decode_instructions(&code);
        assert!(matches!(result, Err(DecodeError::InvalidOpcode(0xFE, 1))));
    }

    #[test]
    fn test_truncated_instruction() {
        let code = [0xB6, 0x00];
        assert!(matches!(
            decode_instructions(&code),
            Err(DecodeError::UnexpectedEnd(0))
        ));
    }
}
