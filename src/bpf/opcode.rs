//! eBPF opcode encoding.
//!
//! An opcode byte is split into an instruction class (low 3 bits) and
//! class-specific fields. Rather than hard-coding the decoding in a large
//! `match`, every known opcode is registered in an [`OpcodeTable`] that maps
//! the byte to an [`OpKind`]. The standard table covers the eBPF instruction
//! set accepted by the JIT; callers can restrict or extend it.

// Instruction classes
pub const BPF_LD: u8 = 0x00;
pub const BPF_LDX: u8 = 0x01;
pub const BPF_ST: u8 = 0x02;
pub const BPF_STX: u8 = 0x03;
pub const BPF_ALU: u8 = 0x04;
pub const BPF_JMP: u8 = 0x05;
pub const BPF_JMP32: u8 = 0x06;
pub const BPF_ALU64: u8 = 0x07;

// Source operand
pub const BPF_K: u8 = 0x00;
pub const BPF_X: u8 = 0x08;

// ALU operations
pub const BPF_ADD: u8 = 0x00;
pub const BPF_SUB: u8 = 0x10;
pub const BPF_MUL: u8 = 0x20;
pub const BPF_DIV: u8 = 0x30;
pub const BPF_OR: u8 = 0x40;
pub const BPF_AND: u8 = 0x50;
pub const BPF_LSH: u8 = 0x60;
pub const BPF_RSH: u8 = 0x70;
pub const BPF_NEG: u8 = 0x80;
pub const BPF_MOD: u8 = 0x90;
pub const BPF_XOR: u8 = 0xa0;
pub const BPF_MOV: u8 = 0xb0;
pub const BPF_ARSH: u8 = 0xc0;
pub const BPF_END: u8 = 0xd0;

// Byte order for BPF_END (shares the source bit)
pub const BPF_TO_LE: u8 = 0x00;
pub const BPF_TO_BE: u8 = 0x08;

// Jump operations
pub const BPF_JA: u8 = 0x00;
pub const BPF_JEQ: u8 = 0x10;
pub const BPF_JGT: u8 = 0x20;
pub const BPF_JGE: u8 = 0x30;
pub const BPF_JSET: u8 = 0x40;
pub const BPF_JNE: u8 = 0x50;
pub const BPF_JSGT: u8 = 0x60;
pub const BPF_JSGE: u8 = 0x70;
pub const BPF_CALL: u8 = 0x80;
pub const BPF_EXIT: u8 = 0x90;
pub const BPF_JLT: u8 = 0xa0;
pub const BPF_JLE: u8 = 0xb0;
pub const BPF_JSLT: u8 = 0xc0;
pub const BPF_JSLE: u8 = 0xd0;

// Memory access sizes
pub const BPF_W: u8 = 0x00;
pub const BPF_H: u8 = 0x08;
pub const BPF_B: u8 = 0x10;
pub const BPF_DW: u8 = 0x18;

// Memory access modes
pub const BPF_IMM: u8 = 0x00;
pub const BPF_ABS: u8 = 0x20;
pub const BPF_IND: u8 = 0x40;
pub const BPF_MEM: u8 = 0x60;
pub const BPF_ATOMIC: u8 = 0xc0;

/// `lddw`: the only instruction spanning two slots.
pub const LD_IMM_DW: u8 = BPF_LD | BPF_IMM | BPF_DW;
pub const JMP_CALL: u8 = BPF_JMP | BPF_CALL;
pub const JMP_EXIT: u8 = BPF_JMP | BPF_EXIT;

/// Number of registers in the eBPF register file (R0-R9 and the frame pointer).
pub const BPF_MAX_REGS: usize = 11;
/// Register holding the return value.
pub const BPF_REG_R0: u8 = 0;
/// Read-only frame pointer register.
pub const BPF_REG_FP: u8 = 10;

/// `src` value of an `lddw` loading a plain 64-bit immediate.
pub const BPF_PSEUDO_NONE: u8 = 0;
/// `src` value of a call to another eBPF function.
pub const BPF_PSEUDO_CALL: u8 = 1;

/// Memory access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemSize {
    B,
    H,
    W,
    DW,
}

impl MemSize {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x18 {
            BPF_W => MemSize::W,
            BPF_H => MemSize::H,
            BPF_B => MemSize::B,
            _ => MemSize::DW,
        }
    }

    /// Width in bytes.
    pub fn bytes(self) -> usize {
        match self {
            MemSize::B => 1,
            MemSize::H => 2,
            MemSize::W => 4,
            MemSize::DW => 8,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            MemSize::B => "b",
            MemSize::H => "h",
            MemSize::W => "w",
            MemSize::DW => "dw",
        }
    }
}

/// Whether the second operand is the immediate or the `src` register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Imm,
    Reg,
}

impl Source {
    fn from_bits(bits: u8) -> Self {
        if bits & BPF_X != 0 { Source::Reg } else { Source::Imm }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Sub,
    Mul,
    Div,
    Or,
    And,
    Lsh,
    Rsh,
    Neg,
    Mod,
    Xor,
    Mov,
    Arsh,
}

impl AluOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Sub => "sub",
            AluOp::Mul => "mul",
            AluOp::Div => "div",
            AluOp::Or => "or",
            AluOp::And => "and",
            AluOp::Lsh => "lsh",
            AluOp::Rsh => "rsh",
            AluOp::Neg => "neg",
            AluOp::Mod => "mod",
            AluOp::Xor => "xor",
            AluOp::Mov => "mov",
            AluOp::Arsh => "arsh",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JmpOp {
    Ja,
    Jeq,
    Jgt,
    Jge,
    Jset,
    Jne,
    Jsgt,
    Jsge,
    Jlt,
    Jle,
    Jslt,
    Jsle,
}

impl JmpOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            JmpOp::Ja => "ja",
            JmpOp::Jeq => "jeq",
            JmpOp::Jgt => "jgt",
            JmpOp::Jge => "jge",
            JmpOp::Jset => "jset",
            JmpOp::Jne => "jne",
            JmpOp::Jsgt => "jsgt",
            JmpOp::Jsge => "jsge",
            JmpOp::Jlt => "jlt",
            JmpOp::Jle => "jle",
            JmpOp::Jslt => "jslt",
            JmpOp::Jsle => "jsle",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    Le,
    Be,
}

/// Decoded operation class of an opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// ALU operation; `wide` selects ALU64 over 32-bit ALU.
    Alu { op: AluOp, wide: bool, source: Source },
    /// Byte swap to the given order; width comes from the immediate.
    Endian { order: ByteOrder },
    /// `lddw`, spanning two instruction slots.
    LoadImm64,
    /// `ldx{b,h,w,dw} dst, [src+off]`
    Load { size: MemSize },
    /// `st{size} [dst+off], imm` or `stx{size} [dst+off], src`
    Store { size: MemSize, source: Source },
    /// Atomic read-modify-write on `[dst+off]`; the operation is in the immediate.
    Atomic { size: MemSize },
    /// Legacy packet access (`ld_abs`/`ld_ind`).
    PacketLoad { size: MemSize, indirect: bool },
    /// Conditional or unconditional jump; `wide` is false for the JMP32 class.
    Jump { op: JmpOp, wide: bool, source: Source },
    Call,
    Exit,
}

impl OpKind {
    /// Number of 64-bit slots occupied by an instruction of this kind.
    pub fn slots(self) -> usize {
        match self {
            OpKind::LoadImm64 => 2,
            _ => 1,
        }
    }

    /// Whether the instruction writes its `dst` register.
    pub fn writes_dst(self) -> bool {
        matches!(
            self,
            OpKind::Alu { .. } | OpKind::Endian { .. } | OpKind::LoadImm64 | OpKind::Load { .. }
        )
    }

    /// Whether execution never falls through to the next instruction.
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            OpKind::Exit | OpKind::Jump { op: JmpOp::Ja, .. }
        )
    }
}

/// Maps every opcode byte to the operation it encodes.
#[derive(Debug, Clone)]
pub struct OpcodeTable {
    entries: [Option<OpKind>; 256],
}

impl OpcodeTable {
    /// A table with no known opcodes.
    pub fn empty() -> Self {
        Self {
            entries: [None; 256],
        }
    }

    /// The standard eBPF instruction set.
    pub fn standard() -> Self {
        let mut table = Self::empty();

        const ALU_OPS: [(u8, AluOp); 13] = [
            (BPF_ADD, AluOp::Add),
            (BPF_SUB, AluOp::Sub),
            (BPF_MUL, AluOp::Mul),
            (BPF_DIV, AluOp::Div),
            (BPF_OR, AluOp::Or),
            (BPF_AND, AluOp::And),
            (BPF_LSH, AluOp::Lsh),
            (BPF_RSH, AluOp::Rsh),
            (BPF_NEG, AluOp::Neg),
            (BPF_MOD, AluOp::Mod),
            (BPF_XOR, AluOp::Xor),
            (BPF_MOV, AluOp::Mov),
            (BPF_ARSH, AluOp::Arsh),
        ];
        for (class, wide) in [(BPF_ALU, false), (BPF_ALU64, true)] {
            for (bits, op) in ALU_OPS {
                // NEG has no register form
                let sources: &[u8] = if op == AluOp::Neg { &[BPF_K] } else { &[BPF_K, BPF_X] };
                for &src in sources {
                    table.insert(
                        class | bits | src,
                        OpKind::Alu {
                            op,
                            wide,
                            source: Source::from_bits(src),
                        },
                    );
                }
            }
        }
        table.insert(BPF_ALU | BPF_END | BPF_TO_LE, OpKind::Endian { order: ByteOrder::Le });
        table.insert(BPF_ALU | BPF_END | BPF_TO_BE, OpKind::Endian { order: ByteOrder::Be });

        const JMP_OPS: [(u8, JmpOp); 12] = [
            (BPF_JA, JmpOp::Ja),
            (BPF_JEQ, JmpOp::Jeq),
            (BPF_JGT, JmpOp::Jgt),
            (BPF_JGE, JmpOp::Jge),
            (BPF_JSET, JmpOp::Jset),
            (BPF_JNE, JmpOp::Jne),
            (BPF_JSGT, JmpOp::Jsgt),
            (BPF_JSGE, JmpOp::Jsge),
            (BPF_JLT, JmpOp::Jlt),
            (BPF_JLE, JmpOp::Jle),
            (BPF_JSLT, JmpOp::Jslt),
            (BPF_JSLE, JmpOp::Jsle),
        ];
        for (class, wide) in [(BPF_JMP, true), (BPF_JMP32, false)] {
            for (bits, op) in JMP_OPS {
                if op == JmpOp::Ja {
                    // JMP32 | JA is `gotol`, which takes its offset from the immediate
                    if wide {
                        table.insert(class | bits, OpKind::Jump { op, wide, source: Source::Imm });
                    }
                    continue;
                }
                for src in [BPF_K, BPF_X] {
                    table.insert(
                        class | bits | src,
                        OpKind::Jump {
                            op,
                            wide,
                            source: Source::from_bits(src),
                        },
                    );
                }
            }
        }
        table.insert(JMP_CALL, OpKind::Call);
        table.insert(JMP_EXIT, OpKind::Exit);

        table.insert(LD_IMM_DW, OpKind::LoadImm64);
        for size_bits in [BPF_B, BPF_H, BPF_W, BPF_DW] {
            let size = MemSize::from_bits(size_bits);
            table.insert(BPF_LDX | BPF_MEM | size_bits, OpKind::Load { size });
            table.insert(
                BPF_ST | BPF_MEM | size_bits,
                OpKind::Store { size, source: Source::Imm },
            );
            table.insert(
                BPF_STX | BPF_MEM | size_bits,
                OpKind::Store { size, source: Source::Reg },
            );
        }
        for size_bits in [BPF_W, BPF_DW] {
            let size = MemSize::from_bits(size_bits);
            table.insert(BPF_STX | BPF_ATOMIC | size_bits, OpKind::Atomic { size });
        }
        for size_bits in [BPF_B, BPF_H, BPF_W] {
            let size = MemSize::from_bits(size_bits);
            table.insert(
                BPF_LD | BPF_ABS | size_bits,
                OpKind::PacketLoad { size, indirect: false },
            );
            table.insert(
                BPF_LD | BPF_IND | size_bits,
                OpKind::PacketLoad { size, indirect: true },
            );
        }

        table
    }

    /// Look up an opcode byte.
    pub fn get(&self, opcode: u8) -> Option<OpKind> {
        self.entries[opcode as usize]
    }

    /// Register (or replace) the operation for an opcode byte.
    pub fn insert(&mut self, opcode: u8, kind: OpKind) -> Option<OpKind> {
        self.entries[opcode as usize].replace(kind)
    }

    /// Forget an opcode byte, making it decode as unknown.
    pub fn remove(&mut self, opcode: u8) -> Option<OpKind> {
        self.entries[opcode as usize].take()
    }

    /// Number of known opcodes.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for OpcodeTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_table_core_opcodes() {
        let table = OpcodeTable::standard();

        assert_eq!(
            table.get(0xb7),
            Some(OpKind::Alu { op: AluOp::Mov, wide: true, source: Source::Imm })
        );
        assert_eq!(
            table.get(0x0f),
            Some(OpKind::Alu { op: AluOp::Add, wide: true, source: Source::Reg })
        );
        assert_eq!(
            table.get(0x04),
            Some(OpKind::Alu { op: AluOp::Add, wide: false, source: Source::Imm })
        );
        assert_eq!(
            table.get(0xb5),
            Some(OpKind::Jump { op: JmpOp::Jle, wide: true, source: Source::Imm })
        );
        assert_eq!(table.get(0x79), Some(OpKind::Load { size: MemSize::DW }));
        assert_eq!(
            table.get(0x7b),
            Some(OpKind::Store { size: MemSize::DW, source: Source::Reg })
        );
        assert_eq!(table.get(0x18), Some(OpKind::LoadImm64));
        assert_eq!(table.get(0x85), Some(OpKind::Call));
        assert_eq!(table.get(0x95), Some(OpKind::Exit));
        assert_eq!(table.get(0xdc), Some(OpKind::Endian { order: ByteOrder::Be }));
    }

    #[test]
    fn test_standard_table_rejects_holes() {
        let table = OpcodeTable::standard();

        // NEG with a register source
        assert_eq!(table.get(BPF_ALU64 | BPF_NEG | BPF_X), None);
        // gotol is not supported
        assert_eq!(table.get(BPF_JMP32 | BPF_JA), None);
        // CALL / EXIT only exist in the JMP class
        assert_eq!(table.get(BPF_JMP32 | BPF_EXIT), None);
        // 64-bit legacy packet load does not exist
        assert_eq!(table.get(BPF_LD | BPF_ABS | BPF_DW), None);
        assert_eq!(table.get(0xff), None);
        assert_eq!(table.get(0x00), None);
    }

    #[test]
    fn test_table_is_configurable() {
        let mut table = OpcodeTable::standard();
        let before = table.len();

        assert!(table.remove(JMP_CALL).is_some());
        assert_eq!(table.get(JMP_CALL), None);
        assert_eq!(table.len(), before - 1);

        table.insert(JMP_CALL, OpKind::Call);
        assert_eq!(table.len(), before);

        assert!(OpcodeTable::empty().is_empty());
    }

    #[test]
    fn test_slots_and_terminators() {
        assert_eq!(OpKind::LoadImm64.slots(), 2);
        assert_eq!(OpKind::Exit.slots(), 1);
        assert!(OpKind::Exit.is_terminator());
        assert!(OpKind::Jump { op: JmpOp::Ja, wide: true, source: Source::Imm }.is_terminator());
        assert!(!OpKind::Jump { op: JmpOp::Jeq, wide: true, source: Source::Imm }.is_terminator());
        assert!(OpKind::Load { size: MemSize::B }.writes_dst());
        assert!(!OpKind::Store { size: MemSize::B, source: Source::Imm }.writes_dst());
    }
}
