//! Instruction decoding.
//!
//! Each eBPF instruction slot is a little-endian 64-bit word:
//!
//! ```text
//! bits  0..8   opcode
//! bits  8..12  dst register
//! bits 12..16  src register
//! bits 16..32  signed offset
//! bits 32..64  signed immediate
//! ```
//!
//! `lddw` occupies two slots; the second slot carries the upper 32 bits of
//! the immediate and must otherwise be zero.

use super::opcode::{AluOp, BPF_MAX_REGS, ByteOrder, JmpOp, OpKind, OpcodeTable, Source};

/// Error type for bytecode decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Opcode is not in the opcode table, or uses reserved field bits
    UnknownOpcode { pc: usize, opcode: u8 },
    /// Instruction needs more slots than remain in the program
    Truncated { pc: usize },
    /// Register id outside the eBPF register file
    InvalidRegister { pc: usize, reg: u8 },
    /// Byte input is not a whole number of instruction slots
    InvalidLength { len: usize },
    /// Program has no instructions
    EmptyProgram,
    /// Program exceeds the configured instruction limit
    TooManyInstructions { count: usize, max: usize },
    /// Last instruction can fall through past the end of the program
    MissingTerminator { pc: usize },
    /// Malformed line in an objdump listing
    InvalidListing { line: usize, message: String },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnknownOpcode { pc, opcode } => {
                write!(f, "unknown opcode {:#04x} at pc={}", opcode, pc)
            }
            DecodeError::Truncated { pc } => {
                write!(f, "truncated instruction at pc={}", pc)
            }
            DecodeError::InvalidRegister { pc, reg } => {
                write!(f, "invalid register r{} at pc={}", reg, pc)
            }
            DecodeError::InvalidLength { len } => {
                write!(f, "program length {} is not a multiple of 8 bytes", len)
            }
            DecodeError::EmptyProgram => write!(f, "empty program"),
            DecodeError::TooManyInstructions { count, max } => {
                write!(f, "program has {} instructions, limit is {}", count, max)
            }
            DecodeError::MissingTerminator { pc } => {
                write!(f, "program does not end with exit (last instruction at pc={})", pc)
            }
            DecodeError::InvalidListing { line, message } => {
                write!(f, "line {}: {}", line, message)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// A decoded eBPF instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// Slot index of the (first word of the) instruction
    pub pc: usize,
    pub opcode: u8,
    pub kind: OpKind,
    pub dst: u8,
    pub src: u8,
    pub off: i16,
    pub imm: i32,
    /// Full 64-bit immediate for `lddw`; `imm` sign-extended otherwise
    pub imm64: i64,
}

impl Instruction {
    /// Number of slots this instruction occupies.
    pub fn slots(&self) -> usize {
        self.kind.slots()
    }

    /// Slot index of the next instruction in program order.
    pub fn next_pc(&self) -> usize {
        self.pc + self.slots()
    }
}

/// Split a raw word into (opcode, dst, src, off, imm).
fn fields(word: u64) -> (u8, u8, u8, i16, i32) {
    let opcode = (word & 0xff) as u8;
    let dst = ((word >> 8) & 0x0f) as u8;
    let src = ((word >> 12) & 0x0f) as u8;
    let off = (word >> 16) as u16 as i16;
    let imm = (word >> 32) as u32 as i32;
    (opcode, dst, src, off, imm)
}

/// Encode instruction fields into a raw word.
pub fn encode(opcode: u8, dst: u8, src: u8, off: i16, imm: i32) -> u64 {
    (opcode as u64)
        | (((dst & 0x0f) as u64) << 8)
        | (((src & 0x0f) as u64) << 12)
        | ((off as u16 as u64) << 16)
        | ((imm as u32 as u64) << 32)
}

/// Decode the instruction starting at slot `pc`.
pub fn decode(table: &OpcodeTable, words: &[u64], pc: usize) -> Result<Instruction, DecodeError> {
    let word = *words.get(pc).ok_or(DecodeError::Truncated { pc })?;
    let (opcode, dst, src, off, imm) = fields(word);

    let kind = table
        .get(opcode)
        .ok_or(DecodeError::UnknownOpcode { pc, opcode })?;

    for reg in [dst, src] {
        if reg as usize >= BPF_MAX_REGS && uses_register_fields(kind) {
            return Err(DecodeError::InvalidRegister { pc, reg });
        }
    }

    let reserved = DecodeError::UnknownOpcode { pc, opcode };
    let mut imm64 = imm as i64;

    match kind {
        OpKind::Alu { op, source, .. } => {
            // non-zero offsets select the signed div/mod and movsx extensions
            if off != 0 {
                return Err(reserved);
            }
            match source {
                Source::Imm if src != 0 => return Err(reserved),
                Source::Reg if imm != 0 => return Err(reserved),
                _ => {}
            }
            if op == AluOp::Neg && imm != 0 {
                return Err(reserved);
            }
        }
        OpKind::Endian { .. } => {
            if src != 0 || off != 0 || !matches!(imm, 16 | 32 | 64) {
                return Err(reserved);
            }
        }
        OpKind::LoadImm64 => {
            let next = *words.get(pc + 1).ok_or(DecodeError::Truncated { pc })?;
            let (next_op, next_dst, next_src, next_off, next_imm) = fields(next);
            if next_op != 0 || next_dst != 0 || next_src != 0 || next_off != 0 {
                return Err(DecodeError::UnknownOpcode {
                    pc: pc + 1,
                    opcode: next_op,
                });
            }
            if off != 0 {
                return Err(reserved);
            }
            imm64 = ((imm as u32 as u64) | ((next_imm as u32 as u64) << 32)) as i64;
        }
        OpKind::Load { .. } => {
            if imm != 0 {
                return Err(reserved);
            }
        }
        OpKind::Store { source, .. } => {
            match source {
                Source::Imm if src != 0 => return Err(reserved),
                Source::Reg if imm != 0 => return Err(reserved),
                _ => {}
            }
        }
        OpKind::Jump { op, source, .. } => match source {
            Source::Imm if src != 0 => return Err(reserved),
            Source::Reg if imm != 0 => return Err(reserved),
            _ if op == JmpOp::Ja && (dst != 0 || imm != 0) => return Err(reserved),
            _ => {}
        },
        OpKind::Exit => {
            if dst != 0 || src != 0 || off != 0 || imm != 0 {
                return Err(reserved);
            }
        }
        OpKind::Atomic { .. } | OpKind::PacketLoad { .. } | OpKind::Call => {}
    }

    Ok(Instruction {
        pc,
        opcode,
        kind,
        dst,
        src,
        off,
        imm,
        imm64,
    })
}

/// Whether both register fields of `kind` name registers.
///
/// `call` reuses `src` as a call-kind selector, so it is checked by the emitter
/// instead.
fn uses_register_fields(kind: OpKind) -> bool {
    !matches!(kind, OpKind::Call)
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let width = |wide: bool| if wide { "64" } else { "32" };
        let mem = |reg: u8, off: i16| {
            if off < 0 {
                format!("[r{}-{}]", reg, -(off as i32))
            } else {
                format!("[r{}+{}]", reg, off)
            }
        };
        match self.kind {
            OpKind::Alu { op: AluOp::Neg, wide, .. } => {
                write!(f, "neg{} r{}", width(wide), self.dst)
            }
            OpKind::Alu { op, wide, source } => match source {
                Source::Imm => write!(f, "{}{} r{}, {}", op.mnemonic(), width(wide), self.dst, self.imm),
                Source::Reg => write!(f, "{}{} r{}, r{}", op.mnemonic(), width(wide), self.dst, self.src),
            },
            OpKind::Endian { order } => {
                let name = match order {
                    ByteOrder::Le => "le",
                    ByteOrder::Be => "be",
                };
                write!(f, "{}{} r{}", name, self.imm, self.dst)
            }
            OpKind::LoadImm64 => write!(f, "lddw r{}, {:#x}", self.dst, self.imm64),
            OpKind::Load { size } => {
                write!(f, "ldx{} r{}, {}", size.suffix(), self.dst, mem(self.src, self.off))
            }
            OpKind::Store { size, source: Source::Imm } => {
                write!(f, "st{} {}, {}", size.suffix(), mem(self.dst, self.off), self.imm)
            }
            OpKind::Store { size, source: Source::Reg } => {
                write!(f, "stx{} {}, r{}", size.suffix(), mem(self.dst, self.off), self.src)
            }
            OpKind::Atomic { size } => write!(
                f,
                "atomic{} {}, r{} (op {:#x})",
                size.suffix(),
                mem(self.dst, self.off),
                self.src,
                self.imm
            ),
            OpKind::PacketLoad { size, indirect: false } => {
                write!(f, "ldabs{} {}", size.suffix(), self.imm)
            }
            OpKind::PacketLoad { size, indirect: true } => {
                write!(f, "ldind{} r{}, {}", size.suffix(), self.src, self.imm)
            }
            OpKind::Jump { op: JmpOp::Ja, .. } => write!(f, "ja {:+}", self.off),
            OpKind::Jump { op, wide, source } => {
                let suffix = if wide { "" } else { "32" };
                match source {
                    Source::Imm => write!(
                        f,
                        "{}{} r{}, {}, {:+}",
                        op.mnemonic(),
                        suffix,
                        self.dst,
                        self.imm,
                        self.off
                    ),
                    Source::Reg => write!(
                        f,
                        "{}{} r{}, r{}, {:+}",
                        op.mnemonic(),
                        suffix,
                        self.dst,
                        self.src,
                        self.off
                    ),
                }
            }
            OpKind::Call => write!(f, "call {}", self.imm),
            OpKind::Exit => write!(f, "exit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::opcode::*;

    fn decode_one(word: u64) -> Result<Instruction, DecodeError> {
        decode(&OpcodeTable::standard(), &[word], 0)
    }

    #[test]
    fn test_decode_fields() {
        let word = encode(BPF_JMP | BPF_JLE | BPF_K, 1, 0, -3, 100);
        let insn = decode_one(word).unwrap();
        assert_eq!(insn.opcode, 0xb5);
        assert_eq!(insn.dst, 1);
        assert_eq!(insn.src, 0);
        assert_eq!(insn.off, -3);
        assert_eq!(insn.imm, 100);
        assert_eq!(
            insn.kind,
            OpKind::Jump { op: JmpOp::Jle, wide: true, source: Source::Imm }
        );
    }

    #[test]
    fn test_decode_negative_immediate() {
        let insn = decode_one(encode(BPF_ALU64 | BPF_ADD | BPF_K, 2, 0, 0, -1)).unwrap();
        assert_eq!(insn.imm, -1);
        assert_eq!(insn.imm64, -1);
    }

    #[test]
    fn test_decode_unknown_opcode() {
        assert_eq!(
            decode_one(0xff),
            Err(DecodeError::UnknownOpcode { pc: 0, opcode: 0xff })
        );
    }

    #[test]
    fn test_decode_every_opcode_without_panicking() {
        let table = OpcodeTable::standard();
        for opcode in 0..=255u8 {
            for word in [opcode as u64, u64::MAX & !0xff | opcode as u64] {
                let _ = decode(&table, &[word, 0], 0);
            }
        }
    }

    #[test]
    fn test_decode_reserved_fields() {
        // alu with a non-zero offset (sdiv encoding)
        let sdiv = encode(BPF_ALU64 | BPF_DIV | BPF_X, 1, 2, 1, 0);
        assert!(matches!(decode_one(sdiv), Err(DecodeError::UnknownOpcode { .. })));

        // K-source alu with a src register
        let bad_src = encode(BPF_ALU64 | BPF_MOV | BPF_K, 1, 2, 0, 5);
        assert!(matches!(decode_one(bad_src), Err(DecodeError::UnknownOpcode { .. })));

        // byte swap of an unsupported width
        let bad_end = encode(BPF_ALU | BPF_END | BPF_TO_BE, 1, 0, 0, 8);
        assert!(matches!(decode_one(bad_end), Err(DecodeError::UnknownOpcode { .. })));
    }

    #[test]
    fn test_decode_invalid_register() {
        let word = encode(BPF_ALU64 | BPF_MOV | BPF_X, 11, 1, 0, 0);
        assert_eq!(
            decode_one(word),
            Err(DecodeError::InvalidRegister { pc: 0, reg: 11 })
        );
    }

    #[test]
    fn test_decode_lddw() {
        let lo = encode(LD_IMM_DW, 3, 0, 0, 0x9abc_def0u32 as i32);
        let hi = encode(0, 0, 0, 0, 0x1234_5678);
        let insn = decode(&OpcodeTable::standard(), &[lo, hi], 0).unwrap();
        assert_eq!(insn.kind, OpKind::LoadImm64);
        assert_eq!(insn.imm64, 0x1234_5678_9abc_def0);
        assert_eq!(insn.slots(), 2);
        assert_eq!(insn.next_pc(), 2);
    }

    #[test]
    fn test_decode_lddw_truncated() {
        let lo = encode(LD_IMM_DW, 3, 0, 0, 1);
        assert_eq!(
            decode(&OpcodeTable::standard(), &[lo], 0),
            Err(DecodeError::Truncated { pc: 0 })
        );
    }

    #[test]
    fn test_decode_lddw_bad_second_slot() {
        let lo = encode(LD_IMM_DW, 3, 0, 0, 1);
        let hi = encode(BPF_ALU64 | BPF_MOV | BPF_K, 0, 0, 0, 0);
        assert_eq!(
            decode(&OpcodeTable::standard(), &[lo, hi], 0),
            Err(DecodeError::UnknownOpcode { pc: 1, opcode: 0xb7 })
        );
    }

    #[test]
    fn test_decode_respects_custom_table() {
        let mut table = OpcodeTable::standard();
        table.remove(BPF_ALU64 | BPF_MUL | BPF_X);
        let word = encode(BPF_ALU64 | BPF_MUL | BPF_X, 1, 2, 0, 0);
        assert_eq!(
            decode(&table, &[word], 0),
            Err(DecodeError::UnknownOpcode { pc: 0, opcode: 0x2f })
        );
    }

    #[test]
    fn test_display() {
        let table = OpcodeTable::standard();
        let show = |word: u64| decode(&table, &[word], 0).unwrap().to_string();

        assert_eq!(show(encode(BPF_ALU64 | BPF_MOV | BPF_K, 0, 0, 0, 0)), "mov64 r0, 0");
        assert_eq!(show(encode(BPF_ALU | BPF_ADD | BPF_X, 1, 2, 0, 0)), "add32 r1, r2");
        assert_eq!(
            show(encode(BPF_LDX | BPF_MEM | BPF_DW, 1, 10, -16, 0)),
            "ldxdw r1, [r10-16]"
        );
        assert_eq!(
            show(encode(BPF_STX | BPF_MEM | BPF_W, 10, 1, -8, 0)),
            "stxw [r10-8], r1"
        );
        assert_eq!(
            show(encode(BPF_JMP | BPF_JLE | BPF_K, 1, 0, -3, 100)),
            "jle r1, 100, -3"
        );
        assert_eq!(show(encode(BPF_JMP | BPF_JA, 0, 0, 4, 0)), "ja +4");
        assert_eq!(show(encode(JMP_EXIT, 0, 0, 0, 0)), "exit");
    }
}
