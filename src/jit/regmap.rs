//! eBPF to x86-64 register assignment.
//!
//! The mapping is static and lines up with the System V AMD64 calling
//! convention, so the five arguments of the compiled function arrive in R1-R5
//! and R0 is returned in rax without any shuffling:
//!
//! | eBPF   | x86-64                   |
//! |--------|--------------------------|
//! | R0     | rax                      |
//! | R1-R5  | rdi, rsi, rdx, rcx, r8   |
//! | R6-R9  | rbx, r13, r14, r15       |
//! | R10    | rbp (frame pointer)      |
//!
//! r11 has no eBPF counterpart and is free for the emitter.

use super::compiler::EmitError;
use super::x86_64::Reg;
use crate::bpf::opcode::BPF_MAX_REGS;
use crate::bpf::{Instruction, OpKind};

/// Register the emitter may clobber freely.
pub const SCRATCH: Reg = Reg::R11;

const STANDARD_MAP: [Reg; BPF_MAX_REGS] = [
    Reg::Rax,
    Reg::Rdi,
    Reg::Rsi,
    Reg::Rdx,
    Reg::Rcx,
    Reg::R8,
    Reg::Rbx,
    Reg::R13,
    Reg::R14,
    Reg::R15,
    Reg::Rbp,
];

#[derive(Debug, Clone)]
pub struct RegisterMap {
    table: [Reg; BPF_MAX_REGS],
}

impl RegisterMap {
    pub fn standard() -> Self {
        Self { table: STANDARD_MAP }
    }

    /// Host register holding eBPF register `reg`.
    pub fn host(&self, pc: usize, reg: u8) -> Result<Reg, EmitError> {
        self.table
            .get(reg as usize)
            .copied()
            .ok_or(EmitError::RegisterExhaustion { pc, reg })
    }

    /// Callee-saved host registers the program touches, in push order.
    ///
    /// rbp is excluded: the prologue always saves it.
    pub fn callee_saved_in_use(&self, insns: &[Instruction]) -> Vec<Reg> {
        let mut used = [false; BPF_MAX_REGS];
        for insn in insns {
            used_registers(insn, |reg| {
                if let Some(slot) = used.get_mut(reg as usize) {
                    *slot = true;
                }
            });
        }

        let mut saved: Vec<Reg> = Vec::new();
        for (reg, _) in used.iter().enumerate().filter(|(_, u)| **u) {
            let host = self.table[reg];
            if host.is_callee_saved() && host != Reg::Rbp && !saved.contains(&host) {
                saved.push(host);
            }
        }
        saved
    }
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::standard()
    }
}

/// Call `f` for every eBPF register `insn` names.
fn used_registers(insn: &Instruction, mut f: impl FnMut(u8)) {
    match insn.kind {
        // src selects the call kind / the lddw pseudo type
        OpKind::Call | OpKind::LoadImm64 => f(insn.dst),
        OpKind::Exit => f(0),
        _ => {
            f(insn.dst);
            f(insn.src);
        }
    }
}
