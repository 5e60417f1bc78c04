//! x86-64 instruction encoding for JIT compilation.
//!
//! This module provides functions for encoding x86-64 instructions
//! as machine code bytes. Every arithmetic encoder takes an [`OperandSize`]:
//! 32-bit forms write the low half and zero the upper half of the destination,
//! which is exactly the eBPF ALU32 semantics.

use super::codebuf::CodeBuffer;

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Get the register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Check if this register requires REX.B or REX.R extension.
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }

    /// Get the REX.B bit for this register (when used as base/rm).
    pub fn rex_b(self) -> u8 {
        if self.needs_rex_ext() { 0x01 } else { 0x00 }
    }

    /// Get the REX.R bit for this register (when used as reg).
    pub fn rex_r(self) -> u8 {
        if self.needs_rex_ext() { 0x04 } else { 0x00 }
    }

    /// Whether the System V ABI requires a callee to preserve this register.
    pub fn is_callee_saved(self) -> bool {
        matches!(
            self,
            Reg::Rbx | Reg::Rbp | Reg::R12 | Reg::R13 | Reg::R14 | Reg::R15
        )
    }

    /// The low byte of rsp/rbp/rsi/rdi is only addressable with a REX prefix.
    fn byte_needs_rex(self) -> bool {
        matches!(self, Reg::Rsp | Reg::Rbp | Reg::Rsi | Reg::Rdi)
    }

    pub fn name(self) -> &'static str {
        match self {
            Reg::Rax => "rax",
            Reg::Rcx => "rcx",
            Reg::Rdx => "rdx",
            Reg::Rbx => "rbx",
            Reg::Rsp => "rsp",
            Reg::Rbp => "rbp",
            Reg::Rsi => "rsi",
            Reg::Rdi => "rdi",
            Reg::R8 => "r8",
            Reg::R9 => "r9",
            Reg::R10 => "r10",
            Reg::R11 => "r11",
            Reg::R12 => "r12",
            Reg::R13 => "r13",
            Reg::R14 => "r14",
            Reg::R15 => "r15",
        }
    }
}

/// x86-64 condition codes (for Jcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    B = 0x2,  // Below (unsigned <)
    Ae = 0x3, // Above or equal (unsigned >=)
    E = 0x4,  // Equal
    Ne = 0x5, // Not equal
    Be = 0x6, // Below or equal (unsigned <=)
    A = 0x7,  // Above (unsigned >)
    L = 0xC,  // Less (signed <)
    Ge = 0xD, // Greater or equal (signed >=)
    Le = 0xE, // Less or equal (signed <=)
    G = 0xF,  // Greater (signed >)
}

/// Width of a register operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandSize {
    S32,
    S64,
}

/// Width of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
    Dword,
    Qword,
}

/// Shift kinds, by their ModR/M opcode extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Shift {
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

/// Length of a `jmp rel8` / `jcc rel8` instruction.
pub const SHORT_JUMP_LEN: usize = 2;

/// x86-64 assembler.
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    // ==================== Prefix / ModR/M helpers ====================

    /// Emit a REX prefix when one is needed (or `force` is set).
    ///
    /// `reg` is the register in the ModR/M reg field (or `None` for opcode
    /// extensions), `rm` the register in the rm/base field.
    fn emit_rex(&mut self, size: OperandSize, reg: Option<Reg>, rm: Reg, force: bool) {
        let mut rex = 0x40 | rm.rex_b();
        if size == OperandSize::S64 {
            rex |= 0x08;
        }
        if let Some(reg) = reg {
            rex |= reg.rex_r();
        }
        if rex != 0x40 || force {
            self.buf.emit_u8(rex);
        }
    }

    /// Encode ModR/M byte.
    /// mod: 2 bits, reg: 3 bits, rm: 3 bits
    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// Emit the ModR/M (+ SIB + displacement) bytes for `[base + disp]`.
    fn emit_mem_operand(&mut self, reg: u8, base: Reg, disp: i32) {
        // rbp/r13 have no disp-less form; rsp/r12 need a SIB byte
        let mode = if disp == 0 && base.code() != 5 {
            0b00
        } else if (-128..=127).contains(&disp) {
            0b01
        } else {
            0b10
        };
        self.buf.emit_u8(Self::modrm(mode, reg, base.code()));
        if base.code() == 4 {
            self.buf.emit_u8(0x24);
        }
        match mode {
            0b01 => self.buf.emit_u8(disp as u8),
            0b10 => self.buf.emit_u32(disp as u32),
            _ => {}
        }
    }

    /// `op r/m, r` with both operands registers.
    fn op_rr(&mut self, size: OperandSize, opcode: u8, dst: Reg, src: Reg) {
        self.emit_rex(size, Some(src), dst, false);
        self.buf.emit_u8(opcode);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// Group-1 arithmetic with an immediate (`83 /ext ib` or `81 /ext id`).
    fn op_ri(&mut self, size: OperandSize, ext: u8, dst: Reg, imm: i32) {
        self.emit_rex(size, None, dst, false);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83);
            self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    // ==================== Data Movement ====================

    /// MOV r, r
    pub fn mov_rr(&mut self, size: OperandSize, dst: Reg, src: Reg) {
        self.op_rr(size, 0x89, dst, src);
    }

    /// MOV r, imm32. The 32-bit form zero-extends, the 64-bit form sign-extends.
    pub fn mov_ri(&mut self, size: OperandSize, dst: Reg, imm: i32) {
        match size {
            OperandSize::S32 => {
                self.emit_rex(size, None, dst, false);
                self.buf.emit_u8(0xB8 + dst.code()); // MOV r32, imm32
                self.buf.emit_u32(imm as u32);
            }
            OperandSize::S64 => {
                self.emit_rex(size, None, dst, false);
                self.buf.emit_u8(0xC7); // MOV r/m64, imm32
                self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
                self.buf.emit_u32(imm as u32);
            }
        }
    }

    /// MOV r64, imm64 (movabs)
    pub fn mov_ri64(&mut self, dst: Reg, imm: u64) {
        self.emit_rex(OperandSize::S64, None, dst, false);
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u64(imm);
    }

    /// MOVZX r32, r16
    pub fn movzx_r32_r16(&mut self, dst: Reg, src: Reg) {
        self.emit_rex(OperandSize::S32, Some(dst), src, false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB7);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// Zero-extending load of `width` bytes from `[base + disp]`.
    pub fn load(&mut self, width: Width, dst: Reg, base: Reg, disp: i32) {
        match width {
            Width::Byte | Width::Word => {
                self.emit_rex(OperandSize::S32, Some(dst), base, false);
                self.buf.emit_u8(0x0F);
                self.buf.emit_u8(if width == Width::Byte { 0xB6 } else { 0xB7 });
            }
            Width::Dword => {
                self.emit_rex(OperandSize::S32, Some(dst), base, false);
                self.buf.emit_u8(0x8B);
            }
            Width::Qword => {
                self.emit_rex(OperandSize::S64, Some(dst), base, false);
                self.buf.emit_u8(0x8B);
            }
        }
        self.emit_mem_operand(dst.code(), base, disp);
    }

    /// Store the low `width` bytes of `src` to `[base + disp]`.
    pub fn store(&mut self, width: Width, base: Reg, disp: i32, src: Reg) {
        match width {
            Width::Byte => {
                self.emit_rex(OperandSize::S32, Some(src), base, src.byte_needs_rex());
                self.buf.emit_u8(0x88);
            }
            Width::Word => {
                self.buf.emit_u8(0x66);
                self.emit_rex(OperandSize::S32, Some(src), base, false);
                self.buf.emit_u8(0x89);
            }
            Width::Dword => {
                self.emit_rex(OperandSize::S32, Some(src), base, false);
                self.buf.emit_u8(0x89);
            }
            Width::Qword => {
                self.emit_rex(OperandSize::S64, Some(src), base, false);
                self.buf.emit_u8(0x89);
            }
        }
        self.emit_mem_operand(src.code(), base, disp);
    }

    /// Store an immediate to `[base + disp]`; the qword form sign-extends `imm`.
    pub fn store_imm(&mut self, width: Width, base: Reg, disp: i32, imm: i32) {
        match width {
            Width::Byte => {
                self.emit_rex(OperandSize::S32, None, base, false);
                self.buf.emit_u8(0xC6);
                self.emit_mem_operand(0, base, disp);
                self.buf.emit_u8(imm as u8);
            }
            Width::Word => {
                self.buf.emit_u8(0x66);
                self.emit_rex(OperandSize::S32, None, base, false);
                self.buf.emit_u8(0xC7);
                self.emit_mem_operand(0, base, disp);
                self.buf.emit_u16(imm as u16);
            }
            Width::Dword | Width::Qword => {
                let size = if width == Width::Qword {
                    OperandSize::S64
                } else {
                    OperandSize::S32
                };
                self.emit_rex(size, None, base, false);
                self.buf.emit_u8(0xC7);
                self.emit_mem_operand(0, base, disp);
                self.buf.emit_u32(imm as u32);
            }
        }
    }

    /// LOCK ADD [base + disp], src (dword or qword)
    pub fn lock_add(&mut self, size: OperandSize, base: Reg, disp: i32, src: Reg) {
        self.buf.emit_u8(0xF0);
        self.emit_rex(size, Some(src), base, false);
        self.buf.emit_u8(0x01);
        self.emit_mem_operand(src.code(), base, disp);
    }

    // ==================== Arithmetic Operations ====================

    /// ADD r, r
    pub fn add_rr(&mut self, size: OperandSize, dst: Reg, src: Reg) {
        self.op_rr(size, 0x01, dst, src);
    }

    /// ADD r, imm32 (sign-extended)
    pub fn add_ri(&mut self, size: OperandSize, dst: Reg, imm: i32) {
        self.op_ri(size, 0, dst, imm);
    }

    /// SUB r, r
    pub fn sub_rr(&mut self, size: OperandSize, dst: Reg, src: Reg) {
        self.op_rr(size, 0x29, dst, src);
    }

    /// SUB r, imm32 (sign-extended)
    pub fn sub_ri(&mut self, size: OperandSize, dst: Reg, imm: i32) {
        self.op_ri(size, 5, dst, imm);
    }

    /// AND r, r
    pub fn and_rr(&mut self, size: OperandSize, dst: Reg, src: Reg) {
        self.op_rr(size, 0x21, dst, src);
    }

    /// AND r, imm32 (sign-extended)
    pub fn and_ri(&mut self, size: OperandSize, dst: Reg, imm: i32) {
        self.op_ri(size, 4, dst, imm);
    }

    /// OR r, r
    pub fn or_rr(&mut self, size: OperandSize, dst: Reg, src: Reg) {
        self.op_rr(size, 0x09, dst, src);
    }

    /// OR r, imm32 (sign-extended)
    pub fn or_ri(&mut self, size: OperandSize, dst: Reg, imm: i32) {
        self.op_ri(size, 1, dst, imm);
    }

    /// XOR r, r
    pub fn xor_rr(&mut self, size: OperandSize, dst: Reg, src: Reg) {
        self.op_rr(size, 0x31, dst, src);
    }

    /// XOR r, imm32 (sign-extended)
    pub fn xor_ri(&mut self, size: OperandSize, dst: Reg, imm: i32) {
        self.op_ri(size, 6, dst, imm);
    }

    /// IMUL r, r (low half of the product in `dst`)
    pub fn imul_rr(&mut self, size: OperandSize, dst: Reg, src: Reg) {
        self.emit_rex(size, Some(dst), src, false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xAF);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// IMUL r, r, imm32
    pub fn imul_rri(&mut self, size: OperandSize, dst: Reg, src: Reg, imm: i32) {
        self.emit_rex(size, Some(dst), src, false);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x6B); // IMUL r, r/m, imm8
            self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x69); // IMUL r, r/m, imm32
            self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// DIV r (unsigned divide rdx:rax by `src`, quotient in rax, remainder in rdx)
    pub fn div(&mut self, size: OperandSize, src: Reg) {
        self.emit_rex(size, None, src, false);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 6, src.code()));
    }

    /// NEG r
    pub fn neg(&mut self, size: OperandSize, dst: Reg) {
        self.emit_rex(size, None, dst, false);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 3, dst.code()));
    }

    /// SHL/SHR/SAR r, imm8
    pub fn shift_ri(&mut self, size: OperandSize, shift: Shift, dst: Reg, imm: u8) {
        self.emit_rex(size, None, dst, false);
        self.buf.emit_u8(0xC1);
        self.buf.emit_u8(Self::modrm(0b11, shift as u8, dst.code()));
        self.buf.emit_u8(imm);
    }

    /// SHL/SHR/SAR r, CL
    pub fn shift_cl(&mut self, size: OperandSize, shift: Shift, dst: Reg) {
        self.emit_rex(size, None, dst, false);
        self.buf.emit_u8(0xD3);
        self.buf.emit_u8(Self::modrm(0b11, shift as u8, dst.code()));
    }

    /// ROL r16, imm8 (swaps the two low bytes when `imm` is 8)
    pub fn rol16_ri(&mut self, dst: Reg, imm: u8) {
        self.buf.emit_u8(0x66);
        self.emit_rex(OperandSize::S32, None, dst, false);
        self.buf.emit_u8(0xC1);
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
        self.buf.emit_u8(imm);
    }

    /// BSWAP r
    pub fn bswap(&mut self, size: OperandSize, dst: Reg) {
        self.emit_rex(size, None, dst, false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xC8 + dst.code());
    }

    /// CMP r, r (flags from `dst - src`)
    pub fn cmp_rr(&mut self, size: OperandSize, dst: Reg, src: Reg) {
        self.op_rr(size, 0x39, dst, src);
    }

    /// CMP r, imm32 (sign-extended)
    pub fn cmp_ri(&mut self, size: OperandSize, dst: Reg, imm: i32) {
        self.op_ri(size, 7, dst, imm);
    }

    /// TEST r, r
    pub fn test_rr(&mut self, size: OperandSize, dst: Reg, src: Reg) {
        self.op_rr(size, 0x85, dst, src);
    }

    /// TEST r, imm32 (sign-extended)
    pub fn test_ri(&mut self, size: OperandSize, dst: Reg, imm: i32) {
        self.emit_rex(size, None, dst, false);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
        self.buf.emit_u32(imm as u32);
    }

    // ==================== Stack Operations ====================

    /// PUSH r64
    pub fn push(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(0x50 + reg.code());
    }

    /// POP r64
    pub fn pop(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(0x58 + reg.code());
    }

    // ==================== Control Flow ====================
    //
    // Branch encoders return the offset of their displacement field so the
    // caller can patch it once the target is known.

    /// JMP rel32
    pub fn jmp_rel32(&mut self, disp: i32) -> usize {
        self.buf.emit_u8(0xE9);
        let site = self.buf.offset();
        self.buf.emit_u32(disp as u32);
        site
    }

    /// JMP rel8
    pub fn jmp_rel8(&mut self, disp: i8) -> usize {
        self.buf.emit_u8(0xEB);
        let site = self.buf.offset();
        self.buf.emit_u8(disp as u8);
        site
    }

    /// Jcc rel32
    pub fn jcc_rel32(&mut self, cond: Cond, disp: i32) -> usize {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        let site = self.buf.offset();
        self.buf.emit_u32(disp as u32);
        site
    }

    /// Jcc rel8
    pub fn jcc_rel8(&mut self, cond: Cond, disp: i8) -> usize {
        self.buf.emit_u8(0x70 + cond as u8);
        let site = self.buf.offset();
        self.buf.emit_u8(disp as u8);
        site
    }

    /// Point the forward rel8 branch whose field is at `site` to the current offset.
    pub fn bind_rel8(&mut self, site: usize) {
        let disp = self.buf.offset() - (site + 1);
        debug_assert!(disp <= i8::MAX as usize, "short branch out of range");
        self.buf.patch_rel8(site, disp as i8);
    }

    /// CALL r64 (indirect call)
    pub fn call_r(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xFF);
        self.buf.emit_u8(Self::modrm(0b11, 2, reg.code()));
    }

    /// RET
    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }
}
