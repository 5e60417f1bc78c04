//! eBPF to x86-64 instruction selection.
//!
//! Each eBPF instruction expands to a fixed, deterministic x86-64 sequence.
//! The frame looks like this (addresses grow upwards):
//!
//! ```text
//! [return address]
//! [saved rbp]              <- rbp = eBPF R10
//! [eBPF stack]             frame_size bytes
//! [saved rbx/r13/r14/r15]  only those the program uses
//! [padding]                present when an odd number was saved
//! ```
//!
//! Every `exit` jumps to a single epilogue emitted after the last instruction;
//! a program that runs off its end falls through into it as well.

use super::CompileError;
use super::codebuf::CodeBuffer;
use super::fixup::{
    self, DisplacementWidth, FixupTable, JumpTarget, RelocationEntry, ResolvedBranch,
};
use super::helpers::HelperTable;
use super::regmap::{RegisterMap, SCRATCH};
use super::x86_64::{Cond, OperandSize, Reg, SHORT_JUMP_LEN, Shift, Width, X86_64Assembler};
use crate::bpf::Instruction;
use crate::bpf::opcode::{
    AluOp, BPF_ADD, BPF_PSEUDO_NONE, BPF_REG_FP, ByteOrder, JmpOp, MemSize, OpKind, Source,
};
use crate::config::JitConfig;

/// Error type for instruction selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitError {
    /// The decoder knows the opcode but it has no native encoding
    UnsupportedOpcode { pc: usize, opcode: u8 },
    /// eBPF register with no host register assigned
    RegisterExhaustion { pc: usize, reg: u8 },
    /// `call` to an index outside the helper table
    UnknownHelper { pc: usize, index: i32 },
    /// Instruction writes the read-only frame pointer
    FramePointerWrite { pc: usize },
}

impl std::fmt::Display for EmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmitError::UnsupportedOpcode { pc, opcode } => {
                write!(f, "unsupported opcode {:#04x} at pc={}", opcode, pc)
            }
            EmitError::RegisterExhaustion { pc, reg } => {
                write!(f, "no host register for r{} at pc={}", reg, pc)
            }
            EmitError::UnknownHelper { pc, index } => {
                write!(f, "unknown helper {} at pc={}", index, pc)
            }
            EmitError::FramePointerWrite { pc } => {
                write!(f, "write to frame pointer r10 at pc={}", pc)
            }
        }
    }
}

impl std::error::Error for EmitError {}

/// Machine code for a whole program, with branches resolved.
#[derive(Debug, Clone)]
pub struct EmittedCode {
    pub code: Vec<u8>,
    /// Native start offset of each bytecode slot
    pub insn_offsets: Vec<Option<usize>>,
    pub prologue_len: usize,
    pub epilogue_offset: usize,
    /// Callee-saved registers pushed by the prologue
    pub callee_saved: Vec<Reg>,
    pub branches: Vec<ResolvedBranch>,
}

/// JIT compiler for one eBPF program.
pub struct JitCompiler<'h> {
    buf: CodeBuffer,
    fixups: FixupTable,
    regs: RegisterMap,
    helpers: &'h HelperTable,
    frame_size: i32,
    callee_saved: Vec<Reg>,
}

impl<'h> JitCompiler<'h> {
    pub fn new(config: &JitConfig, helpers: &'h HelperTable) -> Self {
        Self {
            buf: CodeBuffer::new(),
            fixups: FixupTable::new(),
            regs: RegisterMap::standard(),
            helpers,
            frame_size: config.frame_size(),
            callee_saved: Vec::new(),
        }
    }

    /// Compile decoded instructions of a program with `slots` instruction slots.
    pub fn compile(
        mut self,
        insns: &[Instruction],
        slots: usize,
    ) -> Result<EmittedCode, CompileError> {
        self.buf = CodeBuffer::with_capacity(insns.len() * 8 + 64, slots);
        self.callee_saved = self.regs.callee_saved_in_use(insns);

        self.emit_prologue();
        let prologue_len = self.buf.len();

        for insn in insns {
            self.buf.mark_instruction(insn.pc);
            self.emit_insn(insn)?;
        }

        let epilogue_offset = self.buf.len();
        self.emit_epilogue();

        let branches = self.fixups.resolve(&mut self.buf, epilogue_offset)?;
        let (code, insn_offsets) = self.buf.into_parts();

        Ok(EmittedCode {
            code,
            insn_offsets,
            prologue_len,
            epilogue_offset,
            callee_saved: self.callee_saved,
            branches,
        })
    }

    /// Emit function prologue.
    fn emit_prologue(&mut self) {
        let mut asm = X86_64Assembler::new(&mut self.buf);

        asm.push(Reg::Rbp);
        asm.mov_rr(OperandSize::S64, Reg::Rbp, Reg::Rsp);
        if self.frame_size > 0 {
            asm.sub_ri(OperandSize::S64, Reg::Rsp, self.frame_size);
        }

        for &reg in &self.callee_saved {
            asm.push(reg);
        }
        // keep rsp 16-byte aligned for helper calls
        if self.callee_saved.len() % 2 == 1 {
            asm.sub_ri(OperandSize::S64, Reg::Rsp, 8);
        }

        // R0 is defined even if the program never writes it
        asm.xor_rr(OperandSize::S32, Reg::Rax, Reg::Rax);
    }

    /// Emit function epilogue.
    fn emit_epilogue(&mut self) {
        let mut asm = X86_64Assembler::new(&mut self.buf);

        if self.callee_saved.len() % 2 == 1 {
            asm.add_ri(OperandSize::S64, Reg::Rsp, 8);
        }
        for &reg in self.callee_saved.iter().rev() {
            asm.pop(reg);
        }

        asm.mov_rr(OperandSize::S64, Reg::Rsp, Reg::Rbp);
        asm.pop(Reg::Rbp);
        asm.ret();
    }

    /// Compile a single instruction.
    fn emit_insn(&mut self, insn: &Instruction) -> Result<(), EmitError> {
        let pc = insn.pc;
        if insn.kind.writes_dst() && insn.dst == BPF_REG_FP {
            return Err(EmitError::FramePointerWrite { pc });
        }

        match insn.kind {
            OpKind::Alu { op, wide, source } => {
                let dst = self.regs.host(pc, insn.dst)?;
                let src = match source {
                    Source::Reg => Some(self.regs.host(pc, insn.src)?),
                    Source::Imm => None,
                };
                let mut asm = X86_64Assembler::new(&mut self.buf);
                emit_alu(&mut asm, op, operand_size(wide), dst, src, insn.imm);
            }
            OpKind::Endian { order } => {
                let dst = self.regs.host(pc, insn.dst)?;
                let mut asm = X86_64Assembler::new(&mut self.buf);
                match (order, insn.imm) {
                    (ByteOrder::Le, 16) => asm.movzx_r32_r16(dst, dst),
                    (ByteOrder::Le, 32) => asm.mov_rr(OperandSize::S32, dst, dst),
                    (ByteOrder::Le, 64) => {}
                    (ByteOrder::Be, 16) => {
                        asm.rol16_ri(dst, 8);
                        asm.movzx_r32_r16(dst, dst);
                    }
                    (ByteOrder::Be, 32) => asm.bswap(OperandSize::S32, dst),
                    (ByteOrder::Be, 64) => asm.bswap(OperandSize::S64, dst),
                    _ => return Err(unsupported(insn)),
                }
            }
            OpKind::LoadImm64 => {
                // map references and other pseudo loads need a loader
                if insn.src != BPF_PSEUDO_NONE {
                    return Err(unsupported(insn));
                }
                let dst = self.regs.host(pc, insn.dst)?;
                let mut asm = X86_64Assembler::new(&mut self.buf);
                let value = insn.imm64 as u64;
                if value <= u32::MAX as u64 {
                    asm.mov_ri(OperandSize::S32, dst, value as u32 as i32);
                } else if let Ok(imm) = i32::try_from(insn.imm64) {
                    asm.mov_ri(OperandSize::S64, dst, imm);
                } else {
                    asm.mov_ri64(dst, value);
                }
            }
            OpKind::Load { size } => {
                let dst = self.regs.host(pc, insn.dst)?;
                let base = self.regs.host(pc, insn.src)?;
                let mut asm = X86_64Assembler::new(&mut self.buf);
                asm.load(mem_width(size), dst, base, insn.off as i32);
            }
            OpKind::Store { size, source } => {
                let base = self.regs.host(pc, insn.dst)?;
                let mut asm = X86_64Assembler::new(&mut self.buf);
                match source {
                    Source::Imm => asm.store_imm(mem_width(size), base, insn.off as i32, insn.imm),
                    Source::Reg => {
                        let src = self.regs.host(pc, insn.src)?;
                        asm.store(mem_width(size), base, insn.off as i32, src);
                    }
                }
            }
            OpKind::Atomic { size } => {
                let op_size = match size {
                    MemSize::W => OperandSize::S32,
                    MemSize::DW => OperandSize::S64,
                    _ => return Err(unsupported(insn)),
                };
                // plain add only; fetch variants, and/or/xor and xchg are not encoded
                if insn.imm != BPF_ADD as i32 {
                    return Err(unsupported(insn));
                }
                let base = self.regs.host(pc, insn.dst)?;
                let src = self.regs.host(pc, insn.src)?;
                let mut asm = X86_64Assembler::new(&mut self.buf);
                asm.lock_add(op_size, base, insn.off as i32, src);
            }
            OpKind::PacketLoad { .. } => return Err(unsupported(insn)),
            OpKind::Jump { op, wide, source } => self.emit_jump(insn, op, wide, source)?,
            OpKind::Call => {
                if insn.src != BPF_PSEUDO_NONE {
                    return Err(unsupported(insn));
                }
                let addr = self
                    .helpers
                    .address(insn.imm)
                    .ok_or(EmitError::UnknownHelper {
                        pc,
                        index: insn.imm,
                    })?;
                let mut asm = X86_64Assembler::new(&mut self.buf);
                asm.mov_ri64(Reg::Rax, addr);
                asm.call_r(Reg::Rax);
            }
            OpKind::Exit => {
                let mut asm = X86_64Assembler::new(&mut self.buf);
                let site = asm.jmp_rel32(0);
                self.fixups.record(RelocationEntry {
                    site,
                    target: JumpTarget::Epilogue,
                    width: DisplacementWidth::Rel32,
                    from_pc: pc,
                });
            }
        }
        Ok(())
    }

    fn emit_jump(
        &mut self,
        insn: &Instruction,
        op: JmpOp,
        wide: bool,
        source: Source,
    ) -> Result<(), EmitError> {
        let pc = insn.pc;
        let size = operand_size(wide);
        let cond = match op {
            JmpOp::Ja => None,
            JmpOp::Jeq => Some(Cond::E),
            JmpOp::Jne | JmpOp::Jset => Some(Cond::Ne),
            JmpOp::Jgt => Some(Cond::A),
            JmpOp::Jge => Some(Cond::Ae),
            JmpOp::Jlt => Some(Cond::B),
            JmpOp::Jle => Some(Cond::Be),
            JmpOp::Jsgt => Some(Cond::G),
            JmpOp::Jsge => Some(Cond::Ge),
            JmpOp::Jslt => Some(Cond::L),
            JmpOp::Jsle => Some(Cond::Le),
        };

        if cond.is_some() {
            let dst = self.regs.host(pc, insn.dst)?;
            let src = match source {
                Source::Reg => Some(self.regs.host(pc, insn.src)?),
                Source::Imm => None,
            };
            let mut asm = X86_64Assembler::new(&mut self.buf);
            match (op, src) {
                (JmpOp::Jset, Some(src)) => asm.test_rr(size, dst, src),
                (JmpOp::Jset, None) => asm.test_ri(size, dst, insn.imm),
                (_, Some(src)) => asm.cmp_rr(size, dst, src),
                (_, None) => asm.cmp_ri(size, dst, insn.imm),
            }
        }

        // Backward targets already have an offset; use the short form when it reaches.
        let target = fixup::branch_target(insn);
        let site_if_short = self.buf.offset() + SHORT_JUMP_LEN - 1;
        let width = match usize::try_from(target)
            .ok()
            .filter(|&t| t <= pc)
            .and_then(|t| self.buf.instruction_offset(t))
        {
            Some(offset)
                if i8::try_from(fixup::displacement(
                    site_if_short,
                    DisplacementWidth::Rel8,
                    offset,
                ))
                .is_ok() =>
            {
                DisplacementWidth::Rel8
            }
            _ => DisplacementWidth::Rel32,
        };

        let mut asm = X86_64Assembler::new(&mut self.buf);
        let site = match (cond, width) {
            (None, DisplacementWidth::Rel8) => asm.jmp_rel8(0),
            (None, DisplacementWidth::Rel32) => asm.jmp_rel32(0),
            (Some(cond), DisplacementWidth::Rel8) => asm.jcc_rel8(cond, 0),
            (Some(cond), DisplacementWidth::Rel32) => asm.jcc_rel32(cond, 0),
        };
        self.fixups.record(RelocationEntry {
            site,
            target: JumpTarget::Instruction(target),
            width,
            from_pc: pc,
        });
        Ok(())
    }
}

fn unsupported(insn: &Instruction) -> EmitError {
    EmitError::UnsupportedOpcode {
        pc: insn.pc,
        opcode: insn.opcode,
    }
}

fn operand_size(wide: bool) -> OperandSize {
    if wide { OperandSize::S64 } else { OperandSize::S32 }
}

fn mem_width(size: MemSize) -> Width {
    match size {
        MemSize::B => Width::Byte,
        MemSize::H => Width::Word,
        MemSize::W => Width::Dword,
        MemSize::DW => Width::Qword,
    }
}

/// ALU operation on `dst` with either a register or an immediate operand.
fn emit_alu(
    asm: &mut X86_64Assembler<'_>,
    op: AluOp,
    size: OperandSize,
    dst: Reg,
    src: Option<Reg>,
    imm: i32,
) {
    match op {
        AluOp::Add => match src {
            Some(src) => asm.add_rr(size, dst, src),
            None => asm.add_ri(size, dst, imm),
        },
        AluOp::Sub => match src {
            Some(src) => asm.sub_rr(size, dst, src),
            None => asm.sub_ri(size, dst, imm),
        },
        AluOp::Or => match src {
            Some(src) => asm.or_rr(size, dst, src),
            None => asm.or_ri(size, dst, imm),
        },
        AluOp::And => match src {
            Some(src) => asm.and_rr(size, dst, src),
            None => asm.and_ri(size, dst, imm),
        },
        AluOp::Xor => match src {
            Some(src) => asm.xor_rr(size, dst, src),
            None => asm.xor_ri(size, dst, imm),
        },
        AluOp::Mul => match src {
            Some(src) => asm.imul_rr(size, dst, src),
            None => asm.imul_rri(size, dst, dst, imm),
        },
        AluOp::Mov => match src {
            Some(src) => asm.mov_rr(size, dst, src),
            None => asm.mov_ri(size, dst, imm),
        },
        AluOp::Neg => asm.neg(size, dst),
        AluOp::Div => emit_div_mod(asm, true, size, dst, src, imm),
        AluOp::Mod => emit_div_mod(asm, false, size, dst, src, imm),
        AluOp::Lsh => emit_shift(asm, Shift::Shl, size, dst, src, imm),
        AluOp::Rsh => emit_shift(asm, Shift::Shr, size, dst, src, imm),
        AluOp::Arsh => emit_shift(asm, Shift::Sar, size, dst, src, imm),
    }
}

/// Unsigned division or remainder.
///
/// A zero divisor does not trap: the quotient is 0 and the remainder is the
/// dividend. rax and rdx are preserved around `div`; the result travels
/// through the scratch register.
fn emit_div_mod(
    asm: &mut X86_64Assembler<'_>,
    is_div: bool,
    size: OperandSize,
    dst: Reg,
    src: Option<Reg>,
    imm: i32,
) {
    if src.is_none() && imm == 0 {
        if is_div {
            asm.xor_rr(OperandSize::S32, dst, dst);
        } else if size == OperandSize::S32 {
            asm.mov_rr(OperandSize::S32, dst, dst);
        }
        return;
    }

    asm.push(Reg::Rax);
    asm.push(Reg::Rdx);
    match src {
        Some(src) => asm.mov_rr(size, SCRATCH, src),
        None => asm.mov_ri(size, SCRATCH, imm),
    }
    asm.mov_rr(size, Reg::Rax, dst);

    let done = if src.is_some() {
        asm.test_rr(size, SCRATCH, SCRATCH);
        let nonzero = asm.jcc_rel8(Cond::Ne, 0);
        if is_div {
            asm.xor_rr(OperandSize::S32, SCRATCH, SCRATCH);
        } else {
            asm.mov_rr(OperandSize::S64, SCRATCH, Reg::Rax);
        }
        let done = asm.jmp_rel8(0);
        asm.bind_rel8(nonzero);
        Some(done)
    } else {
        None
    };

    asm.xor_rr(OperandSize::S32, Reg::Rdx, Reg::Rdx);
    asm.div(size, SCRATCH);
    let result = if is_div { Reg::Rax } else { Reg::Rdx };
    asm.mov_rr(OperandSize::S64, SCRATCH, result);

    if let Some(done) = done {
        asm.bind_rel8(done);
    }
    asm.pop(Reg::Rdx);
    asm.pop(Reg::Rax);
    asm.mov_rr(OperandSize::S64, dst, SCRATCH);
}

/// Shift with the amount masked to the operand width.
///
/// x86 only shifts by `cl`, so a register amount is moved into rcx with the
/// original rcx (R4) parked in the scratch register.
fn emit_shift(
    asm: &mut X86_64Assembler<'_>,
    shift: Shift,
    size: OperandSize,
    dst: Reg,
    src: Option<Reg>,
    imm: i32,
) {
    let mask = if size == OperandSize::S64 { 63 } else { 31 };
    match src {
        None => {
            let amount = (imm as u32 & mask) as u8;
            if amount != 0 {
                asm.shift_ri(size, shift, dst, amount);
            }
        }
        Some(Reg::Rcx) => asm.shift_cl(size, shift, dst),
        Some(src) => {
            asm.mov_rr(OperandSize::S64, SCRATCH, Reg::Rcx);
            asm.mov_rr(OperandSize::S64, Reg::Rcx, src);
            if dst == Reg::Rcx {
                asm.shift_cl(size, shift, SCRATCH);
            } else {
                asm.shift_cl(size, shift, dst);
            }
            // result for dst == rcx, the saved R4 otherwise
            asm.mov_rr(OperandSize::S64, Reg::Rcx, SCRATCH);
        }
    }
    // a shift by zero leaves the upper half untouched
    if size == OperandSize::S32 {
        asm.mov_rr(OperandSize::S32, dst, dst);
    }
}
