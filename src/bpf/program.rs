//! Whole-program loading and decoding.

use super::insn::{DecodeError, Instruction, decode};
use super::opcode::OpcodeTable;

/// Size of one instruction slot in bytes.
pub const SLOT_SIZE: usize = 8;

/// An eBPF program as a sequence of raw instruction words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytecodeProgram {
    words: Vec<u64>,
}

impl BytecodeProgram {
    pub fn from_words(words: Vec<u64>) -> Self {
        Self { words }
    }

    /// Load a program from its little-endian wire encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() % SLOT_SIZE != 0 {
            return Err(DecodeError::InvalidLength { len: bytes.len() });
        }
        let words = bytes
            .chunks_exact(SLOT_SIZE)
            .map(|chunk| {
                let mut slot = [0u8; SLOT_SIZE];
                slot.copy_from_slice(chunk);
                u64::from_le_bytes(slot)
            })
            .collect();
        Ok(Self { words })
    }

    /// Load a program from `llvm-objdump -d` (or `-S`) output.
    ///
    /// Only instruction lines are used; a line is an instruction when the text
    /// before the first `:` is a decimal slot index. The encoding is taken from
    /// the hex byte columns that follow, 8 bytes per slot (16 for `lddw`).
    /// Headers, labels and interleaved source lines are skipped.
    pub fn from_objdump(text: &str) -> Result<Self, DecodeError> {
        let mut bytes = Vec::new();

        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let Some((prefix, rest)) = line.split_once(':') else {
                continue;
            };
            let prefix = prefix.trim();
            if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }

            let encoding: Vec<u8> = rest
                .split_whitespace()
                .map_while(|token| {
                    if token.len() == 2 {
                        u8::from_str_radix(token, 16).ok()
                    } else {
                        None
                    }
                })
                .take(2 * SLOT_SIZE)
                .collect();

            if encoding.len() != SLOT_SIZE && encoding.len() != 2 * SLOT_SIZE {
                return Err(DecodeError::InvalidListing {
                    line: line_no,
                    message: format!(
                        "expected 8 or 16 encoded bytes, found {}",
                        encoding.len()
                    ),
                });
            }
            bytes.extend_from_slice(&encoding);
        }

        Self::from_bytes(&bytes)
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Number of instruction slots.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Little-endian wire encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Decode every instruction in program order.
    ///
    /// `max_insns` bounds the number of slots. When `require_exit` is set the
    /// last instruction must not fall through past the end of the program.
    pub fn decode(
        &self,
        table: &OpcodeTable,
        max_insns: usize,
        require_exit: bool,
    ) -> Result<Vec<Instruction>, DecodeError> {
        if self.words.is_empty() {
            return Err(DecodeError::EmptyProgram);
        }
        if self.words.len() > max_insns {
            return Err(DecodeError::TooManyInstructions {
                count: self.words.len(),
                max: max_insns,
            });
        }

        let mut insns = Vec::with_capacity(self.words.len());
        let mut pc = 0;
        while pc < self.words.len() {
            let insn = decode(table, &self.words, pc)?;
            pc = insn.next_pc();
            insns.push(insn);
        }

        if require_exit {
            if let Some(last) = insns.last() {
                if !last.kind.is_terminator() {
                    return Err(DecodeError::MissingTerminator { pc: last.pc });
                }
            }
        }

        Ok(insns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::insn::encode;
    use crate::bpf::opcode::*;

    fn sum_words() -> Vec<u64> {
        vec![
            encode(BPF_ALU64 | BPF_MOV | BPF_K, 0, 0, 0, 0),
            encode(BPF_ALU64 | BPF_MOV | BPF_K, 1, 0, 0, 1),
            encode(BPF_ALU64 | BPF_ADD | BPF_X, 0, 1, 0, 0),
            encode(BPF_ALU64 | BPF_ADD | BPF_K, 1, 0, 0, 1),
            encode(BPF_JMP | BPF_JLE | BPF_K, 1, 0, -3, 100),
            encode(JMP_EXIT, 0, 0, 0, 0),
        ]
    }

    #[test]
    fn test_from_bytes() {
        let words = sum_words();
        let program = BytecodeProgram::from_words(words.clone());
        let bytes = program.to_bytes();
        assert_eq!(bytes.len(), 48);
        assert_eq!(&bytes[..8], &[0xb7, 0, 0, 0, 0, 0, 0, 0]);

        let loaded = BytecodeProgram::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.words(), &words[..]);
    }

    #[test]
    fn test_from_bytes_invalid_length() {
        assert_eq!(
            BytecodeProgram::from_bytes(&[0u8; 12]),
            Err(DecodeError::InvalidLength { len: 12 })
        );
    }

    #[test]
    fn test_from_objdump() {
        let listing = "\
sum.o:\tfile format elf64-bpf

Disassembly of section .text:

0000000000000000 <func>:
; int func() {
       0:\tb7 00 00 00 00 00 00 00\tr0 = 0
       1:\tb7 01 00 00 01 00 00 00\tr1 = 1
LBB0_1:
       2:\t0f 10 00 00 00 00 00 00\tr0 += r1
       3:\t07 01 00 00 01 00 00 00\tr1 += 1
       4:\tb5 01 fd ff 64 00 00 00\tif r1 <= 100 goto -3 <LBB0_1>
       5:\t95 00 00 00 00 00 00 00\texit
";
        let program = BytecodeProgram::from_objdump(listing).unwrap();
        assert_eq!(program.words(), &sum_words()[..]);
    }

    #[test]
    fn test_from_objdump_lddw() {
        let listing = "       0:\t18 01 00 00 78 56 34 12 00 00 00 00 00 00 00 00\tr1 = 0x12345678 ll\n";
        let program = BytecodeProgram::from_objdump(listing).unwrap();
        assert_eq!(program.len(), 2);
    }

    #[test]
    fn test_from_objdump_rejects_short_encoding() {
        let listing = "       0:\tb7 00 00 00\tr0 = 0\n";
        assert!(matches!(
            BytecodeProgram::from_objdump(listing),
            Err(DecodeError::InvalidListing { line: 1, .. })
        ));
    }

    #[test]
    fn test_decode_program() {
        let program = BytecodeProgram::from_words(sum_words());
        let insns = program.decode(&OpcodeTable::standard(), 1000, true).unwrap();
        assert_eq!(insns.len(), 6);
        assert_eq!(insns[4].pc, 4);
        assert_eq!(insns[5].kind, OpKind::Exit);
    }

    #[test]
    fn test_decode_pcs_skip_lddw_slot() {
        let program = BytecodeProgram::from_words(vec![
            encode(LD_IMM_DW, 0, 0, 0, 7),
            encode(0, 0, 0, 0, 0),
            encode(JMP_EXIT, 0, 0, 0, 0),
        ]);
        let insns = program.decode(&OpcodeTable::standard(), 1000, true).unwrap();
        assert_eq!(insns.len(), 2);
        assert_eq!(insns[1].pc, 2);
    }

    #[test]
    fn test_decode_empty() {
        let program = BytecodeProgram::from_words(Vec::new());
        assert_eq!(
            program.decode(&OpcodeTable::standard(), 1000, false),
            Err(DecodeError::EmptyProgram)
        );
    }

    #[test]
    fn test_decode_missing_terminator() {
        let program = BytecodeProgram::from_words(vec![encode(BPF_ALU64 | BPF_MOV | BPF_K, 0, 0, 0, 1)]);
        let table = OpcodeTable::standard();
        assert_eq!(
            program.decode(&table, 1000, true),
            Err(DecodeError::MissingTerminator { pc: 0 })
        );
        assert!(program.decode(&table, 1000, false).is_ok());
    }

    #[test]
    fn test_decode_too_many() {
        let program = BytecodeProgram::from_words(sum_words());
        assert_eq!(
            program.decode(&OpcodeTable::standard(), 4, false),
            Err(DecodeError::TooManyInstructions { count: 6, max: 4 })
        );
    }
}
