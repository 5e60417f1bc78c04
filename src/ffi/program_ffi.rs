//! Program compilation and invocation FFI functions.

#![allow(unsafe_op_in_unsafe_fn)]

use super::error::{clear_last_error, set_last_error};
use super::types::{BpfjitProgram, BpfjitResult, ProgramWrapper, get_wrapper};
use crate::bpf::BytecodeProgram;
use crate::config::JitConfig;
use crate::jit::{HelperFn, HelperTable, compile_with_helpers};

unsafe fn install(
    program: &BytecodeProgram,
    helpers: &HelperTable,
    out: *mut *mut BpfjitProgram,
) -> BpfjitResult {
    match compile_with_helpers(program, &JitConfig::default(), helpers) {
        Ok(program) => {
            *out = ProgramWrapper { program }.into_handle();
            clear_last_error();
            BpfjitResult::Ok
        }
        Err(e) => {
            set_last_error(e.to_string());
            BpfjitResult::from(&e)
        }
    }
}

/// Compile a program given as 64-bit instruction slots.
///
/// # Arguments
/// - `words`: Pointer to `len` instruction slots
/// - `len`: Number of slots
/// - `out`: Receives the program handle on success
///
/// # Returns
/// - `BPFJIT_RESULT_OK` on success
/// - `BPFJIT_RESULT_ERROR_INVALID_ARG` if a pointer is NULL
/// - another error code if compilation fails; see `bpfjit_last_error()`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bpfjit_compile(
    words: *const u64,
    len: usize,
    out: *mut *mut BpfjitProgram,
) -> BpfjitResult {
    bpfjit_compile_with_helpers(words, len, std::ptr::null(), 0, out)
}

/// Compile a program whose `call imm` instructions dispatch into `helpers`.
///
/// `helpers[i]` is the helper reached by `call i`. `helpers` may be NULL
/// when `helper_count` is 0.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bpfjit_compile_with_helpers(
    words: *const u64,
    len: usize,
    helpers: *const HelperFn,
    helper_count: usize,
    out: *mut *mut BpfjitProgram,
) -> BpfjitResult {
    if words.is_null() || out.is_null() || (helpers.is_null() && helper_count > 0) {
        set_last_error("NULL pointer argument");
        return BpfjitResult::ErrorInvalidArg;
    }

    let program = BytecodeProgram::from_words(std::slice::from_raw_parts(words, len).to_vec());
    let mut table = HelperTable::new();
    if helper_count > 0 {
        for &helper in std::slice::from_raw_parts(helpers, helper_count) {
            table.register(helper);
        }
    }
    install(&program, &table, out)
}

/// Compile a program given as raw little-endian bytes.
///
/// `len` must be a multiple of 8.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bpfjit_compile_bytes(
    data: *const u8,
    len: usize,
    out: *mut *mut BpfjitProgram,
) -> BpfjitResult {
    if data.is_null() || out.is_null() {
        set_last_error("NULL pointer argument");
        return BpfjitResult::ErrorInvalidArg;
    }

    let program = match BytecodeProgram::from_bytes(std::slice::from_raw_parts(data, len)) {
        Ok(p) => p,
        Err(e) => {
            set_last_error(format!("decode error: {}", e));
            return BpfjitResult::ErrorDecode;
        }
    };
    install(&program, &HelperTable::new(), out)
}

/// Run a compiled program with R1-R5 set to `a1`..`a5`.
///
/// R0 is written to `result`.
///
/// # Safety
/// The program runs natively without checks; it must be valid for these
/// arguments.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bpfjit_call(
    program: *const BpfjitProgram,
    a1: u64,
    a2: u64,
    a3: u64,
    a4: u64,
    a5: u64,
    result: *mut u64,
) -> BpfjitResult {
    let Some(wrapper) = get_wrapper(program) else {
        set_last_error("program handle is NULL");
        return BpfjitResult::ErrorInvalidArg;
    };
    if result.is_null() {
        set_last_error("result pointer is NULL");
        return BpfjitResult::ErrorInvalidArg;
    }

    *result = wrapper.program.entry().invoke(a1, a2, a3, a4, a5);
    BpfjitResult::Ok
}

/// Size of the generated machine code, or 0 for a NULL handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bpfjit_code_size(program: *const BpfjitProgram) -> usize {
    get_wrapper(program).map_or(0, |w| w.program.code_size())
}

/// Release a compiled program.
///
/// After this call, the handle is invalid and must not be used.
///
/// # Safety
///
/// - `program` must be NULL or a handle returned by a `bpfjit_compile*` function
/// - `program` must not have been freed already
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bpfjit_free(program: *mut BpfjitProgram) {
    if program.is_null() {
        return;
    }
    let _ = Box::from_raw(program as *mut ProgramWrapper);
}
