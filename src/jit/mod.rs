//! eBPF JIT compilation for x86-64.
//!
//! The pipeline is:
//! - decode the program against an [`OpcodeTable`](crate::bpf::OpcodeTable)
//! - emit native code instruction by instruction, recording branch relocations
//! - patch every branch once all instruction offsets are known
//! - copy the code into an executable region and hand out a typed entry point

pub mod codebuf;
pub mod compiler;
pub mod entry;
pub mod fixup;
pub mod helpers;
pub mod memory;
pub mod regmap;
pub mod report;
pub mod x86_64;

pub use compiler::{EmitError, JitCompiler};
pub use entry::{CallableEntry, CompiledProgram, JitFunction};
pub use fixup::FixupError;
pub use helpers::{HelperFn, HelperTable};
pub use memory::{ExecutableRegion, MemoryError, RegionState};
pub use report::CodeMap;

use crate::bpf::{BytecodeProgram, DecodeError, OpcodeTable};
use crate::config::{ConfigError, JitConfig};

/// Error type for the whole compilation pipeline.
#[derive(Debug)]
pub enum CompileError {
    Config(ConfigError),
    Decode(DecodeError),
    Emit(EmitError),
    Fixup(FixupError),
    Memory(MemoryError),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::Config(e) => write!(f, "{}", e),
            CompileError::Decode(e) => write!(f, "decode error: {}", e),
            CompileError::Emit(e) => write!(f, "emit error: {}", e),
            CompileError::Fixup(e) => write!(f, "relocation error: {}", e),
            CompileError::Memory(e) => write!(f, "memory error: {}", e),
        }
    }
}

impl std::error::Error for CompileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CompileError::Config(e) => Some(e),
            CompileError::Decode(e) => Some(e),
            CompileError::Emit(e) => Some(e),
            CompileError::Fixup(e) => Some(e),
            CompileError::Memory(e) => Some(e),
        }
    }
}

impl From<ConfigError> for CompileError {
    fn from(e: ConfigError) -> Self {
        CompileError::Config(e)
    }
}

impl From<DecodeError> for CompileError {
    fn from(e: DecodeError) -> Self {
        CompileError::Decode(e)
    }
}

impl From<EmitError> for CompileError {
    fn from(e: EmitError) -> Self {
        CompileError::Emit(e)
    }
}

impl From<FixupError> for CompileError {
    fn from(e: FixupError) -> Self {
        CompileError::Fixup(e)
    }
}

impl From<MemoryError> for CompileError {
    fn from(e: MemoryError) -> Self {
        CompileError::Memory(e)
    }
}

/// Compile a program that makes no helper calls.
pub fn compile(
    program: &BytecodeProgram,
    config: &JitConfig,
) -> Result<CompiledProgram, CompileError> {
    compile_with_helpers(program, config, &HelperTable::new())
}

/// Compile a program and install it in executable memory.
pub fn compile_with_helpers(
    program: &BytecodeProgram,
    config: &JitConfig,
    helpers: &HelperTable,
) -> Result<CompiledProgram, CompileError> {
    let map = compile_to_code(program, config, helpers)?;

    let installed = ExecutableRegion::from_code(&map.code)
        .and_then(|region| CompiledProgram::new(region, map));
    match installed {
        Ok(compiled) => {
            if config.trace_jit {
                eprintln!(
                    "[JIT] Installed {} bytes at {:p}",
                    compiled.code_size(),
                    compiled.entry().as_ptr()
                );
            }
            Ok(compiled)
        }
        Err(e) => {
            if config.trace_jit {
                eprintln!("[JIT] Failed to install program: {}", e);
            }
            Err(e.into())
        }
    }
}

/// Generate machine code without mapping it executable.
pub fn compile_to_code(
    program: &BytecodeProgram,
    config: &JitConfig,
    helpers: &HelperTable,
) -> Result<CodeMap, CompileError> {
    let result = generate(program, config, helpers);
    if config.trace_jit {
        if let Err(e) = &result {
            eprintln!("[JIT] Failed to compile program: {}", e);
        }
    }
    result
}

fn generate(
    program: &BytecodeProgram,
    config: &JitConfig,
    helpers: &HelperTable,
) -> Result<CodeMap, CompileError> {
    config.validate()?;

    let insns = program.decode(&OpcodeTable::standard(), config.max_insns, config.require_exit)?;
    if config.trace_jit {
        eprintln!(
            "[JIT] Compiling program ({} slots, {} instructions, {} helpers)",
            program.len(),
            insns.len(),
            helpers.len()
        );
    }

    let emitted = JitCompiler::new(config, helpers).compile(&insns, program.len())?;
    if config.trace_jit {
        let saved: Vec<&str> = emitted.callee_saved.iter().map(|r| r.name()).collect();
        eprintln!(
            "[JIT] Emitted {} bytes (callee-saved: [{}], {} branches patched)",
            emitted.code.len(),
            saved.join(", "),
            emitted.branches.len()
        );
    }

    Ok(CodeMap::new(&insns, emitted))
}
