//! FFI type definitions for the C API.

use crate::jit::{CompileError, CompiledProgram};

/// Result codes for FFI operations.
///
/// These map to the `BpfjitResult` enum in C.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BpfjitResult {
    /// Operation succeeded
    Ok = 0,
    /// Invalid argument passed to function
    ErrorInvalidArg = 1,
    /// Malformed bytecode
    ErrorDecode = 2,
    /// Instruction the JIT cannot translate
    ErrorEmit = 3,
    /// Branch target or displacement out of range
    ErrorRelocation = 4,
    /// Executable memory could not be mapped
    ErrorMemory = 5,
    /// Invalid configuration
    ErrorConfig = 6,
}

impl BpfjitResult {
    pub fn is_ok(self) -> bool {
        self == BpfjitResult::Ok
    }

    pub fn is_err(self) -> bool {
        self != BpfjitResult::Ok
    }
}

impl From<&CompileError> for BpfjitResult {
    fn from(error: &CompileError) -> Self {
        match error {
            CompileError::Config(_) => BpfjitResult::ErrorConfig,
            CompileError::Decode(_) => BpfjitResult::ErrorDecode,
            CompileError::Emit(_) => BpfjitResult::ErrorEmit,
            CompileError::Fixup(_) => BpfjitResult::ErrorRelocation,
            CompileError::Memory(_) => BpfjitResult::ErrorMemory,
        }
    }
}

/// Opaque compiled program handle.
///
/// Created by `bpfjit_compile()` and released with `bpfjit_free()`.
#[repr(C)]
pub struct BpfjitProgram {
    _private: [u8; 0],
}

/// Rust side of a [`BpfjitProgram`] handle.
pub(crate) struct ProgramWrapper {
    pub program: CompiledProgram,
}

impl ProgramWrapper {
    pub fn into_handle(self) -> *mut BpfjitProgram {
        Box::into_raw(Box::new(self)) as *mut BpfjitProgram
    }
}

/// Borrow the wrapper behind a handle.
///
/// # Safety
/// `handle` must be null or a live pointer returned by `into_handle`.
pub(crate) unsafe fn get_wrapper<'a>(handle: *const BpfjitProgram) -> Option<&'a ProgramWrapper> {
    if handle.is_null() {
        None
    } else {
        Some(unsafe { &*(handle as *const ProgramWrapper) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::DecodeError;

    #[test]
    fn test_result_codes() {
        assert!(BpfjitResult::Ok.is_ok());
        assert!(!BpfjitResult::Ok.is_err());
        assert!(!BpfjitResult::ErrorDecode.is_ok());
        assert!(BpfjitResult::ErrorDecode.is_err());
    }

    #[test]
    fn test_result_from_error() {
        let err = CompileError::Decode(DecodeError::EmptyProgram);
        assert_eq!(BpfjitResult::from(&err), BpfjitResult::ErrorDecode);
    }

    #[test]
    fn test_null_handle() {
        assert!(unsafe { get_wrapper(std::ptr::null()) }.is_none());
    }
}
