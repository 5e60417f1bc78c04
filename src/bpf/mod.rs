//! eBPF bytecode: opcode encoding, instruction decoding and program loading.

pub mod insn;
pub mod opcode;
pub mod program;

pub use insn::{DecodeError, Instruction, decode, encode};
pub use opcode::{OpKind, OpcodeTable};
pub use program::BytecodeProgram;
