//! Code buffer for building JIT code.
//!
//! Besides the emitted bytes, the buffer records where the native code of
//! every bytecode slot starts. Branch fixups resolve against that table.

/// A buffer for building machine code.
pub struct CodeBuffer {
    /// The code bytes
    code: Vec<u8>,
    /// Native start offset of each bytecode slot; `None` for slots that never
    /// start an instruction (the second half of `lddw`)
    insn_offsets: Vec<Option<usize>>,
}

impl CodeBuffer {
    /// Create a new empty code buffer.
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            insn_offsets: Vec::new(),
        }
    }

    /// Create a buffer sized for a program of `slots` instruction slots.
    pub fn with_capacity(capacity: usize, slots: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
            insn_offsets: vec![None; slots],
        }
    }

    /// Get the current size of the code.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Get the current offset.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Emit a single byte.
    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit a 16-bit value (little-endian).
    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit value (little-endian).
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit value (little-endian).
    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit multiple bytes.
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Record that the instruction at slot `pc` starts at the current offset.
    pub fn mark_instruction(&mut self, pc: usize) {
        if pc >= self.insn_offsets.len() {
            self.insn_offsets.resize(pc + 1, None);
        }
        self.insn_offsets[pc] = Some(self.code.len());
    }

    /// Native start offset of the instruction at slot `pc`, if it has been emitted.
    pub fn instruction_offset(&self, pc: usize) -> Option<usize> {
        self.insn_offsets.get(pc).copied().flatten()
    }

    /// Start offsets of every slot, indexed by slot.
    pub fn instruction_offsets(&self) -> &[Option<usize>] {
        &self.insn_offsets
    }

    /// Overwrite the 8-bit displacement field at `site`.
    pub fn patch_rel8(&mut self, site: usize, disp: i8) {
        self.code[site] = disp as u8;
    }

    /// Overwrite the 32-bit displacement field at `site`.
    pub fn patch_rel32(&mut self, site: usize, disp: i32) {
        self.code[site..site + 4].copy_from_slice(&disp.to_le_bytes());
    }

    /// Get the code bytes (for inspection).
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Consume the buffer and return the code bytes and the slot offset table.
    pub fn into_parts(self) -> (Vec<u8>, Vec<Option<usize>>) {
        (self.code, self.insn_offsets)
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_bytes() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        buf.emit_u16(0x1234);
        buf.emit_u32(0xDEADBEEF);

        assert_eq!(buf.len(), 7);
        assert_eq!(buf.code(), &[0x90, 0x34, 0x12, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_instruction_offsets() {
        let mut buf = CodeBuffer::with_capacity(16, 3);
        buf.mark_instruction(0);
        buf.emit_bytes(&[0x90, 0x90]);
        buf.mark_instruction(2);
        buf.emit_u8(0xC3);

        assert_eq!(buf.instruction_offset(0), Some(0));
        assert_eq!(buf.instruction_offset(1), None);
        assert_eq!(buf.instruction_offset(2), Some(2));
        assert_eq!(buf.instruction_offset(7), None);
        assert_eq!(buf.instruction_offsets(), &[Some(0), None, Some(2)]);
    }

    #[test]
    fn test_mark_grows_table() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        buf.mark_instruction(4);
        assert_eq!(buf.instruction_offsets().len(), 5);
        assert_eq!(buf.instruction_offset(4), Some(1));
    }

    #[test]
    fn test_patch() {
        let mut buf = CodeBuffer::new();
        buf.emit_bytes(&[0xE9, 0, 0, 0, 0, 0xEB, 0]);
        buf.patch_rel32(1, -2);
        buf.patch_rel8(6, -7);

        assert_eq!(buf.code(), &[0xE9, 0xFE, 0xFF, 0xFF, 0xFF, 0xEB, 0xF9]);
    }
}
