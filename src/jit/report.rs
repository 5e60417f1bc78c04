//! Per-instruction map of the generated code.
//!
//! The map records which native bytes each eBPF instruction produced. It backs
//! the annotated listing printed by `bpfjit dump` and its JSON form.

use super::compiler::EmittedCode;
use super::fixup::ResolvedBranch;
use crate::bpf::Instruction;
use serde::{Serialize, Serializer};
use std::fmt;

fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn serialize_hex<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex_bytes(bytes))
}

/// Native code of one eBPF instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InsnEntry {
    pub pc: usize,
    pub opcode: u8,
    /// Instruction in eBPF assembly syntax
    pub asm: String,
    /// Offset of the first native byte
    pub offset: usize,
    #[serde(serialize_with = "serialize_hex")]
    pub bytes: Vec<u8>,
}

/// Layout of a compiled program.
#[derive(Debug, Clone, Serialize)]
pub struct CodeMap {
    pub code_size: usize,
    pub prologue_len: usize,
    pub epilogue_offset: usize,
    pub callee_saved: Vec<&'static str>,
    pub instructions: Vec<InsnEntry>,
    pub branches: Vec<ResolvedBranch>,
    #[serde(serialize_with = "serialize_hex")]
    pub code: Vec<u8>,
}

impl CodeMap {
    pub fn new(insns: &[Instruction], emitted: EmittedCode) -> Self {
        let mut instructions = Vec::with_capacity(insns.len());
        for (i, insn) in insns.iter().enumerate() {
            let start = emitted.insn_offsets.get(insn.pc).copied().flatten();
            let end = insns
                .get(i + 1)
                .and_then(|next| emitted.insn_offsets.get(next.pc).copied().flatten())
                .unwrap_or(emitted.epilogue_offset);
            let Some(start) = start else { continue };
            instructions.push(InsnEntry {
                pc: insn.pc,
                opcode: insn.opcode,
                asm: insn.to_string(),
                offset: start,
                bytes: emitted.code[start..end].to_vec(),
            });
        }

        Self {
            code_size: emitted.code.len(),
            prologue_len: emitted.prologue_len,
            epilogue_offset: emitted.epilogue_offset,
            callee_saved: emitted.callee_saved.iter().map(|r| r.name()).collect(),
            instructions,
            branches: emitted.branches,
            code: emitted.code,
        }
    }

    /// Native offset of the instruction at slot `pc`.
    pub fn offset_of(&self, pc: usize) -> Option<usize> {
        self.instructions
            .iter()
            .find(|entry| entry.pc == pc)
            .map(|entry| entry.offset)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for CodeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let saved = if self.callee_saved.is_empty() {
            "none".to_string()
        } else {
            self.callee_saved.join(", ")
        };
        writeln!(
            f,
            "; {} bytes, {} instructions, callee-saved: {}",
            self.code_size,
            self.instructions.len(),
            saved
        )?;

        writeln!(f, "; prologue")?;
        writeln!(f, "{:04x}  {}", 0, hex_bytes(&self.code[..self.prologue_len]))?;

        for entry in &self.instructions {
            writeln!(
                f,
                "{:04x}  {:<32}  {:>4}: {}",
                entry.offset,
                hex_bytes(&entry.bytes),
                entry.pc,
                entry.asm
            )?;
        }

        writeln!(f, "; epilogue")?;
        write!(
            f,
            "{:04x}  {}",
            self.epilogue_offset,
            hex_bytes(&self.code[self.epilogue_offset..])
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::opcode::*;
    use crate::bpf::{BytecodeProgram, OpcodeTable, encode};
    use crate::config::JitConfig;
    use crate::jit::compiler::JitCompiler;
    use crate::jit::helpers::HelperTable;

    fn code_map(words: Vec<u64>) -> CodeMap {
        let program = BytecodeProgram::from_words(words);
        let insns = program.decode(&OpcodeTable::standard(), 100, false).unwrap();
        let emitted = JitCompiler::new(&JitConfig::default(), &HelperTable::new())
            .compile(&insns, program.len())
            .unwrap();
        CodeMap::new(&insns, emitted)
    }

    #[test]
    fn test_entries_cover_code() {
        let map = code_map(vec![
            encode(BPF_ALU64 | BPF_MOV | BPF_K, 0, 0, 0, 1),
            encode(LD_IMM_DW, 1, 0, 0, 2),
            0,
            encode(JMP_EXIT, 0, 0, 0, 0),
        ]);

        assert_eq!(map.instructions.len(), 3);
        assert_eq!(map.instructions[0].offset, map.prologue_len);
        assert_eq!(map.offset_of(3), Some(map.instructions[2].offset));
        assert_eq!(map.offset_of(2), None);

        let covered: usize = map.instructions.iter().map(|e| e.bytes.len()).sum();
        assert_eq!(map.prologue_len + covered, map.epilogue_offset);
    }

    #[test]
    fn test_listing() {
        let map = code_map(vec![
            encode(BPF_ALU64 | BPF_MOV | BPF_K, 0, 0, 0, 1),
            encode(JMP_EXIT, 0, 0, 0, 0),
        ]);
        let listing = map.to_string();
        assert!(listing.contains("; prologue"));
        assert!(listing.contains("   0: mov64 r0, 1"));
        assert!(listing.contains("48 c7 c0 01 00 00 00"));
        assert!(listing.contains("   1: exit"));
        assert!(listing.ends_with("c3"));
    }

    #[test]
    fn test_json() {
        let map = code_map(vec![
            encode(BPF_ALU64 | BPF_MOV | BPF_K, 0, 0, 0, 1),
            encode(JMP_EXIT, 0, 0, 0, 0),
        ]);
        let value: serde_json::Value = serde_json::from_str(&map.to_json().unwrap()).unwrap();
        assert_eq!(value["code_size"], map.code_size);
        assert_eq!(value["instructions"][1]["asm"], "exit");
        assert_eq!(value["branches"][0]["target"], "epilogue");
        assert_eq!(value["branches"][0]["width"], "rel32");
    }
}
