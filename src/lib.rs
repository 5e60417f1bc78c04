//! bpfjit - an eBPF to x86-64 JIT compiler
//!
//! This library decodes eBPF bytecode, translates it to native x86-64 code,
//! installs the code in executable memory and exposes it as a plain function
//! taking five `u64` arguments.
//! For C/C++ embedding, use the FFI module functions.

#[cfg(not(all(target_arch = "x86_64", unix)))]
compile_error!("bpfjit generates System V x86-64 code and only supports x86-64 unix targets");

pub mod bpf;
pub mod config;
pub mod ffi;
pub mod jit;

// Re-export commonly used types
pub use bpf::{BytecodeProgram, DecodeError, Instruction, OpcodeTable};
pub use config::{ConfigError, JitConfig};
pub use jit::{
    CallableEntry, CodeMap, CompileError, CompiledProgram, HelperTable, compile, compile_to_code,
    compile_with_helpers,
};

// Re-export FFI types for C bindings
pub use ffi::*;
