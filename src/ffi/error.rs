//! Error handling FFI functions.
//!
//! Compilation can fail before a program handle exists, so the last error
//! message is kept per thread rather than per handle.

use std::cell::RefCell;
use std::ffi::{CString, c_char};

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Record an error message for the calling thread.
pub(crate) fn set_last_error(message: impl Into<String>) {
    let c_msg = CString::new(message.into().replace('\0', " ")).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(c_msg));
}

pub(crate) fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

/// Get the last error message of the calling thread.
///
/// Returns a pointer to the error message string, or NULL if no error.
/// The returned pointer is valid until the next API call on the same thread.
///
/// # Example (C)
/// ```c
/// BpfjitProgram *prog = NULL;
/// if (bpfjit_compile(words, len, &prog) != BPFJIT_RESULT_OK) {
///     printf("Error: %s\n", bpfjit_last_error());
/// }
/// ```
#[unsafe(no_mangle)]
pub extern "C" fn bpfjit_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map_or(std::ptr::null(), |msg| msg.as_ptr())
    })
}

/// Clear the last error.
///
/// After calling this, `bpfjit_last_error` will return NULL until
/// another error occurs.
#[unsafe(no_mangle)]
pub extern "C" fn bpfjit_clear_error() {
    clear_last_error();
}

/// Check if there is a pending error on the calling thread.
#[unsafe(no_mangle)]
pub extern "C" fn bpfjit_has_error() -> bool {
    LAST_ERROR.with(|slot| slot.borrow().is_some())
}
