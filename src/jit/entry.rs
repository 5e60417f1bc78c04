//! Calling compiled programs.

use super::memory::{ExecutableRegion, MemoryError};
use super::report::CodeMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// Native signature of a compiled program: R1-R5 in, R0 out.
pub type JitFunction = unsafe extern "C" fn(u64, u64, u64, u64, u64) -> u64;

/// A program installed in executable memory.
///
/// Clones share the same region; it is unmapped when the last clone drops.
#[derive(Clone)]
pub struct CompiledProgram {
    region: Arc<ExecutableRegion>,
    func: JitFunction,
    map: Arc<CodeMap>,
}

impl CompiledProgram {
    /// Wrap an executable region whose first byte is the program entry.
    pub fn new(region: ExecutableRegion, map: CodeMap) -> Result<Self, MemoryError> {
        let ptr = region
            .entry_ptr()
            .ok_or(MemoryError::InvalidState { state: region.state() })?;
        // SAFETY: the region is executable and starts with the compiled prologue
        let func = unsafe { std::mem::transmute::<*const u8, JitFunction>(ptr) };
        Ok(Self {
            region: Arc::new(region),
            func,
            map: Arc::new(map),
        })
    }

    /// Borrow a callable entry point. The region outlives the entry.
    pub fn entry(&self) -> CallableEntry<'_> {
        CallableEntry {
            func: self.func,
            _region: PhantomData,
        }
    }

    /// Size of the generated code in bytes.
    pub fn code_size(&self) -> usize {
        self.region.code_len()
    }

    /// The installed machine code.
    pub fn code(&self) -> &[u8] {
        self.region.code().unwrap_or(&[])
    }

    pub fn code_map(&self) -> &CodeMap {
        &self.map
    }
}

impl std::fmt::Debug for CompiledProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("entry", &(self.func as *const u8))
            .field("code_size", &self.code_size())
            .finish()
    }
}

/// Typed entry point of a [`CompiledProgram`], valid while the program is borrowed.
#[derive(Clone, Copy)]
pub struct CallableEntry<'a> {
    func: JitFunction,
    _region: PhantomData<&'a ExecutableRegion>,
}

impl CallableEntry<'_> {
    /// Run the program with R1-R5 set to the arguments and return R0.
    ///
    /// # Safety
    /// The program is executed natively without any checks. Its memory
    /// accesses, helper calls and termination must be valid for these
    /// arguments (for example, established by a verifier).
    pub unsafe fn invoke(&self, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64) -> u64 {
        unsafe { (self.func)(a1, a2, a3, a4, a5) }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.func as *const u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::opcode::*;
    use crate::bpf::{BytecodeProgram, encode};
    use crate::config::JitConfig;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_program_is_send_sync() {
        assert_send_sync::<CompiledProgram>();
        assert_send_sync::<CallableEntry<'static>>();
    }

    #[test]
    fn test_invoke_returns_first_argument() {
        let program = BytecodeProgram::from_words(vec![
            encode(BPF_ALU64 | BPF_MOV | BPF_X, 0, 1, 0, 0),
            encode(JMP_EXIT, 0, 0, 0, 0),
        ]);
        let compiled = crate::jit::compile(&program, &JitConfig::default()).unwrap();
        let entry = compiled.entry();
        assert_eq!(unsafe { entry.invoke(77, 0, 0, 0, 0) }, 77);
        assert_eq!(entry.as_ptr(), compiled.code().as_ptr());
    }

    #[test]
    fn test_clones_share_region() {
        let program = BytecodeProgram::from_words(vec![
            encode(BPF_ALU64 | BPF_MOV | BPF_K, 0, 0, 0, 9),
            encode(JMP_EXIT, 0, 0, 0, 0),
        ]);
        let compiled = crate::jit::compile(&program, &JitConfig::default()).unwrap();
        let clone = compiled.clone();
        drop(compiled);
        assert_eq!(unsafe { clone.entry().invoke(0, 0, 0, 0, 0) }, 9);
        assert_eq!(clone.code().len(), clone.code_size());
    }

    #[test]
    fn test_requires_executable_region() {
        let region = ExecutableRegion::new();
        let map = crate::jit::compile_to_code(
            &BytecodeProgram::from_words(vec![encode(JMP_EXIT, 0, 0, 0, 0)]),
            &JitConfig::default(),
            &crate::jit::HelperTable::new(),
        )
        .unwrap();
        assert!(matches!(
            CompiledProgram::new(region, map),
            Err(MemoryError::InvalidState { .. })
        ));
    }
}
