//! Executable memory management using mmap.
//!
//! A region moves through `Unallocated -> Writable -> Executable -> Released`.
//! It is mapped read-write while code is copied in and flipped to
//! read-execute by [`ExecutableRegion::finalize`]; it is never writable and
//! executable at the same time.

use std::ptr::NonNull;

/// `int3`, used to fill the unused tail of the last page.
const TRAP_BYTE: u8 = 0xCC;

/// Error type for memory operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// `mmap` failed
    AllocationFailed { size: usize, errno: i32 },
    /// `mprotect` failed
    ProtectionFailed { errno: i32 },
    /// Zero-sized allocation, or code larger than the region
    InvalidSize { size: usize },
    /// Operation not allowed in the region's current state
    InvalidState { state: RegionState },
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::AllocationFailed { size, errno } => {
                write!(f, "failed to map {} bytes (errno {})", size, errno)
            }
            MemoryError::ProtectionFailed { errno } => {
                write!(f, "failed to make code executable (errno {})", errno)
            }
            MemoryError::InvalidSize { size } => write!(f, "invalid region size {}", size),
            MemoryError::InvalidState { state } => {
                write!(f, "operation not allowed on a region in state {:?}", state)
            }
        }
    }
}

impl std::error::Error for MemoryError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Unallocated,
    Writable,
    Executable,
    Released,
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Get the page size for the current system.
fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

/// A page-aligned mapping holding compiled code.
#[derive(Debug)]
pub struct ExecutableRegion {
    ptr: Option<NonNull<u8>>,
    /// Mapped size (whole pages)
    size: usize,
    /// Bytes of code copied in by `finalize`
    code_len: usize,
    state: RegionState,
}

impl ExecutableRegion {
    pub fn new() -> Self {
        Self {
            ptr: None,
            size: 0,
            code_len: 0,
            state: RegionState::Unallocated,
        }
    }

    /// Map a region for `code`, copy it in and make it executable.
    pub fn from_code(code: &[u8]) -> Result<Self, MemoryError> {
        let mut region = Self::new();
        region.allocate(code.len())?;
        region.finalize(code)?;
        Ok(region)
    }

    /// Map `size` bytes (rounded up to whole pages) read-write.
    pub fn allocate(&mut self, size: usize) -> Result<(), MemoryError> {
        if self.state != RegionState::Unallocated {
            return Err(MemoryError::InvalidState { state: self.state });
        }
        if size == 0 {
            return Err(MemoryError::InvalidSize { size });
        }

        let page = page_size();
        let aligned = size
            .checked_add(page - 1)
            .ok_or(MemoryError::InvalidSize { size })?
            & !(page - 1);

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                aligned,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed {
                size: aligned,
                errno: last_errno(),
            });
        }

        self.ptr = NonNull::new(ptr as *mut u8);
        if self.ptr.is_none() {
            return Err(MemoryError::AllocationFailed {
                size: aligned,
                errno: 0,
            });
        }
        self.size = aligned;
        self.state = RegionState::Writable;
        Ok(())
    }

    /// Copy `code` to the start of the region and make it read-execute.
    pub fn finalize(&mut self, code: &[u8]) -> Result<(), MemoryError> {
        let ptr = match (self.state, self.ptr) {
            (RegionState::Writable, Some(ptr)) => ptr,
            _ => return Err(MemoryError::InvalidState { state: self.state }),
        };
        if code.len() > self.size {
            return Err(MemoryError::InvalidSize { size: code.len() });
        }

        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr.as_ptr(), code.len());
            std::ptr::write_bytes(ptr.as_ptr().add(code.len()), TRAP_BYTE, self.size - code.len());
        }

        let result = unsafe {
            libc::mprotect(
                ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(MemoryError::ProtectionFailed {
                errno: last_errno(),
            });
        }

        self.code_len = code.len();
        self.state = RegionState::Executable;
        Ok(())
    }

    /// Unmap the region. Safe to call in any state, any number of times.
    pub fn release(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            unsafe {
                libc::munmap(ptr.as_ptr() as *mut libc::c_void, self.size);
            }
        }
        self.size = 0;
        self.code_len = 0;
        self.state = RegionState::Released;
    }

    pub fn state(&self) -> RegionState {
        self.state
    }

    /// Mapped size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Size of the code copied in by `finalize`.
    pub fn code_len(&self) -> usize {
        self.code_len
    }

    /// Start of the code, once the region is executable.
    pub fn entry_ptr(&self) -> Option<*const u8> {
        match (self.state, self.ptr) {
            (RegionState::Executable, Some(ptr)) => Some(ptr.as_ptr() as *const u8),
            _ => None,
        }
    }

    /// The installed code bytes, once the region is executable.
    pub fn code(&self) -> Option<&[u8]> {
        self.entry_ptr()
            .map(|ptr| unsafe { std::slice::from_raw_parts(ptr, self.code_len) })
    }
}

impl Default for ExecutableRegion {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExecutableRegion {
    fn drop(&mut self) {
        self.release();
    }
}

// The mapping is only written through `&mut self`; once executable it is
// immutable and may be read and executed from any thread.
unsafe impl Send for ExecutableRegion {}
unsafe impl Sync for ExecutableRegion {}
