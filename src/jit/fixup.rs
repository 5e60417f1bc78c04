//! Branch relocation.
//!
//! Branches are emitted with placeholder displacements because forward
//! targets have no native offset yet. Each branch records a
//! [`RelocationEntry`]; once every instruction has been emitted,
//! [`FixupTable::resolve`] writes the real displacements.

use super::codebuf::CodeBuffer;
use crate::bpf::Instruction;

/// Where a branch lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JumpTarget {
    /// Bytecode slot index; may be out of range until validated
    Instruction(i64),
    /// The shared epilogue
    Epilogue,
}

/// Size of a displacement field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplacementWidth {
    Rel8,
    Rel32,
}

impl DisplacementWidth {
    pub fn bytes(self) -> usize {
        match self {
            DisplacementWidth::Rel8 => 1,
            DisplacementWidth::Rel32 => 4,
        }
    }

    fn fits(self, disp: i64) -> bool {
        match self {
            DisplacementWidth::Rel8 => i8::try_from(disp).is_ok(),
            DisplacementWidth::Rel32 => i32::try_from(disp).is_ok(),
        }
    }
}

/// A displacement field waiting for its target's native offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationEntry {
    /// Offset of the displacement field in the code buffer
    pub site: usize,
    pub target: JumpTarget,
    pub width: DisplacementWidth,
    /// Slot of the branching instruction
    pub from_pc: usize,
}

/// A patched branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ResolvedBranch {
    pub from_pc: usize,
    pub site: usize,
    pub target: JumpTarget,
    pub width: DisplacementWidth,
    /// Native offset the branch lands on
    pub target_offset: usize,
    pub displacement: i64,
}

/// Error type for branch resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixupError {
    /// Branch target is outside the program or not an instruction start
    InvalidJumpTarget { pc: usize, target: i64 },
    /// Displacement does not fit in the encoded field
    DisplacementOverflow {
        pc: usize,
        displacement: i64,
        width: DisplacementWidth,
    },
}

impl std::fmt::Display for FixupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FixupError::InvalidJumpTarget { pc, target } => {
                write!(f, "invalid jump target {} from pc={}", target, pc)
            }
            FixupError::DisplacementOverflow {
                pc,
                displacement,
                width,
            } => write!(
                f,
                "branch displacement {} from pc={} does not fit in {} byte(s)",
                displacement,
                pc,
                width.bytes()
            ),
        }
    }
}

impl std::error::Error for FixupError {}

/// Slot index a branch at `insn` transfers to (`pc + off + 1`).
pub fn branch_target(insn: &Instruction) -> i64 {
    insn.pc as i64 + insn.off as i64 + 1
}

/// Displacement from the end of a field at `site` to `target_offset`.
pub fn displacement(site: usize, width: DisplacementWidth, target_offset: usize) -> i64 {
    target_offset as i64 - (site + width.bytes()) as i64
}

/// Relocations recorded during emission.
#[derive(Debug, Default)]
pub struct FixupTable {
    entries: Vec<RelocationEntry>,
}

impl FixupTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, entry: RelocationEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[RelocationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Patch every recorded displacement in `buf`.
    ///
    /// Instruction targets must name a slot whose start offset is recorded in
    /// the buffer; slots past the end of the program and the second half of
    /// `lddw` have none.
    pub fn resolve(
        &self,
        buf: &mut CodeBuffer,
        epilogue: usize,
    ) -> Result<Vec<ResolvedBranch>, FixupError> {
        let mut resolved = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            let target_offset = match entry.target {
                JumpTarget::Epilogue => epilogue,
                JumpTarget::Instruction(target) => usize::try_from(target)
                    .ok()
                    .and_then(|pc| buf.instruction_offset(pc))
                    .ok_or(FixupError::InvalidJumpTarget {
                        pc: entry.from_pc,
                        target,
                    })?,
            };

            let disp = displacement(entry.site, entry.width, target_offset);
            if !entry.width.fits(disp) {
                return Err(FixupError::DisplacementOverflow {
                    pc: entry.from_pc,
                    displacement: disp,
                    width: entry.width,
                });
            }
            match entry.width {
                DisplacementWidth::Rel8 => buf.patch_rel8(entry.site, disp as i8),
                DisplacementWidth::Rel32 => buf.patch_rel32(entry.site, disp as i32),
            }

            resolved.push(ResolvedBranch {
                from_pc: entry.from_pc,
                site: entry.site,
                target: entry.target,
                width: entry.width,
                target_offset,
                displacement: disp,
            });
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Three one-byte "instructions" followed by a rel32 jump and a rel8 jump.
    fn sample_buffer() -> CodeBuffer {
        let mut buf = CodeBuffer::with_capacity(32, 5);
        for pc in 0..3 {
            buf.mark_instruction(pc);
            buf.emit_u8(0x90);
        }
        buf.mark_instruction(3);
        buf.emit_u8(0xE9);
        buf.emit_u32(0);
        buf.mark_instruction(4);
        buf.emit_u8(0xEB);
        buf.emit_u8(0);
        buf
    }

    #[test]
    fn test_resolve_backward_and_forward() {
        let mut buf = sample_buffer();
        let epilogue = buf.len();
        buf.emit_u8(0xC3);

        let mut table = FixupTable::new();
        table.record(RelocationEntry {
            site: 4,
            target: JumpTarget::Instruction(1),
            width: DisplacementWidth::Rel32,
            from_pc: 3,
        });
        table.record(RelocationEntry {
            site: 9,
            target: JumpTarget::Epilogue,
            width: DisplacementWidth::Rel8,
            from_pc: 4,
        });

        let branches = table.resolve(&mut buf, epilogue).unwrap();
        assert_eq!(branches.len(), 2);

        // start(1) = 1, end of field = 8
        assert_eq!(branches[0].displacement, -7);
        assert_eq!(&buf.code()[4..8], &(-7i32).to_le_bytes());
        // epilogue = 10, end of field = 10
        assert_eq!(branches[1].displacement, 0);
        assert_eq!(buf.code()[9], 0);

        for branch in &branches {
            assert_eq!(
                branch.displacement,
                branch.target_offset as i64 - (branch.site + branch.width.bytes()) as i64
            );
        }
    }

    #[test]
    fn test_resolve_invalid_targets() {
        for target in [-1, 5, 100] {
            let mut buf = sample_buffer();
            let mut table = FixupTable::new();
            table.record(RelocationEntry {
                site: 4,
                target: JumpTarget::Instruction(target),
                width: DisplacementWidth::Rel32,
                from_pc: 3,
            });
            assert_eq!(
                table.resolve(&mut buf, 10),
                Err(FixupError::InvalidJumpTarget { pc: 3, target })
            );
        }
    }

    #[test]
    fn test_resolve_rel8_overflow() {
        let mut buf = CodeBuffer::with_capacity(512, 2);
        buf.mark_instruction(0);
        buf.emit_bytes(&[0x90; 200]);
        buf.mark_instruction(1);
        buf.emit_u8(0xEB);
        buf.emit_u8(0);

        let mut table = FixupTable::new();
        table.record(RelocationEntry {
            site: 201,
            target: JumpTarget::Instruction(0),
            width: DisplacementWidth::Rel8,
            from_pc: 1,
        });
        assert_eq!(
            table.resolve(&mut buf, 202),
            Err(FixupError::DisplacementOverflow {
                pc: 1,
                displacement: -202,
                width: DisplacementWidth::Rel8,
            })
        );
    }

    #[test]
    fn test_branch_target() {
        use crate::bpf::opcode::{BPF_JA, BPF_JMP, OpcodeTable};
        use crate::bpf::{decode, encode};

        let words = [0, 0, 0, 0, encode(BPF_JMP | BPF_JA, 0, 0, -3, 0)];
        let insn = decode(&OpcodeTable::standard(), &words, 4).unwrap();
        assert_eq!(branch_target(&insn), 2);
    }
}
