//! C FFI for embedding the JIT
//!
//! This module provides a C-compatible API for compiling and running eBPF
//! programs from host applications. All public functions use `extern "C"` ABI.
//!
//! # Safety
//!
//! All FFI functions that take raw pointers require:
//! - Non-null pointers (unless documented otherwise)
//! - Valid program handles created by `bpfjit_compile()` or `bpfjit_compile_bytes()`
//! - Proper lifetime management (a handle must not be used after `bpfjit_free()`)

mod error;
mod program_ffi;
mod types;

#[allow(unused_imports)]
pub use error::*;
#[allow(unused_imports)]
pub use program_ffi::*;
#[allow(unused_imports)]
pub use types::*;

/// Version information
pub const BPFJIT_VERSION_MAJOR: u32 = 0;
pub const BPFJIT_VERSION_MINOR: u32 = 1;
pub const BPFJIT_VERSION_PATCH: u32 = 0;

/// Get the version string
#[unsafe(no_mangle)]
pub extern "C" fn bpfjit_version() -> *const std::ffi::c_char {
    static VERSION: &[u8] = b"0.1.0\0";
    VERSION.as_ptr() as *const std::ffi::c_char
}

/// Get the major version number
#[unsafe(no_mangle)]
pub extern "C" fn bpfjit_version_major() -> u32 {
    BPFJIT_VERSION_MAJOR
}

/// Get the minor version number
#[unsafe(no_mangle)]
pub extern "C" fn bpfjit_version_minor() -> u32 {
    BPFJIT_VERSION_MINOR
}

/// Get the patch version number
#[unsafe(no_mangle)]
pub extern "C" fn bpfjit_version_patch() -> u32 {
    BPFJIT_VERSION_PATCH
}
