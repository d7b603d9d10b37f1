//! Executable memory for compiled methods.
//!
//! Pages are mapped read-write, filled once, then flipped to read-execute.
//! They are never writable and executable at the same time.

use std::ptr::{self, NonNull};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("mmap of {0} bytes failed")]
    AllocationFailed(usize),
    #[error("mprotect to read-execute failed")]
    ProtectionFailed,
    #[error("cannot map an empty code region")]
    Empty,
    #[error("write of {len} bytes at {offset} exceeds region of {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },
    #[error("region is already executable")]
    Sealed,
}

/// A page-aligned mapping holding one method's machine code.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Maps at least `size` writable bytes.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::Empty);
        }
        let page = page_size();
        let size = size.div_ceil(page) * page;

        // SAFETY: anonymous private mapping with no address hint.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed(size));
        }
        let ptr = NonNull::new(raw.cast::<u8>()).ok_or(MemoryError::AllocationFailed(size))?;
        Ok(Self {
            ptr,
            size,
            executable: false,
        })
    }

    /// Maps a region holding exactly `code` and seals it.
    pub fn from_code(code: &[u8]) -> Result<Self, MemoryError> {
        let mut mem = Self::new(code.len())?;
        mem.write(0, code)?;
        mem.make_executable()?;
        Ok(mem)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::Sealed);
        }
        if offset.checked_add(data.len()).is_none_or(|end| end > self.size) {
            return Err(MemoryError::OutOfBounds {
                offset,
                len: data.len(),
                size: self.size,
            });
        }
        // SAFETY: bounds checked above; the mapping is writable until sealed.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Flips the region to read-execute. Further writes fail.
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }
        // SAFETY: ptr and size describe a mapping owned by self.
        let rc = unsafe {
            libc::mprotect(
                self.ptr.as_ptr().cast::<libc::c_void>(),
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        self.executable = true;
        Ok(())
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        // SAFETY: the mapping is owned by self and unmapped exactly once.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast::<libc::c_void>(), self.size);
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(page).ok().filter(|&p| p > 0).unwrap_or(4096)
}
