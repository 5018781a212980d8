use std::io;
use std::ptr;

/// Executable codegen arena backed by mmap'd memory.
///
/// A single RW+X mapping: fault handlers classify instructions and
/// resume execution while paused frames still point into the region,
/// and the overflow-recovery cycle re-emits while older code is live,
/// so the mapping never drops a permission.
///
/// Emission is overflow-recording, not panicking: a write that would
/// pass the end sets a sticky flag and is dropped. The assembler
/// checkpoints the write position before a unit, checks [`Self::ok`]
/// after, and rewinds with [`Self::truncate`] so an overflowed unit is
/// never partially committed.
pub struct CodeArena {
    ptr: *mut u8,
    size: usize,
    offset: usize,
    overflowed: bool,
}

// SAFETY: CodeArena owns its mmap'd memory exclusively.
unsafe impl Send for CodeArena {}

impl CodeArena {
    /// Map a new arena of `size` bytes (rounded up to page size).
    pub fn new(size: usize) -> io::Result<Self> {
        let page_size = page_size();
        let size = (size + page_size - 1) & !(page_size - 1);

        // SAFETY: anonymous private mapping, no file backing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            offset: 0,
            overflowed: false,
        })
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.size - self.offset
    }

    #[inline]
    pub fn base_ptr(&self) -> *const u8 {
        self.ptr as *const u8
    }

    #[inline]
    pub fn ptr_at(&self, offset: usize) -> *const u8 {
        assert!(offset <= self.size);
        // SAFETY: offset is within the mapping.
        unsafe { self.ptr.add(offset) as *const u8 }
    }

    /// Whether `addr` points into the mapped region.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.ptr as usize;
        addr >= base && addr < base + self.size
    }

    /// Whether everything emitted since the flag was last cleared fit.
    #[inline]
    pub fn ok(&self) -> bool {
        !self.overflowed
    }

    /// Rewind the write position (discarding a failed unit) and clear
    /// the overflow flag.
    pub fn truncate(&mut self, offset: usize) {
        assert!(offset <= self.offset || self.overflowed);
        assert!(offset <= self.size);
        self.offset = offset;
        self.overflowed = false;
    }

    /// Rewind to empty. Previously returned pointers are invalid.
    pub fn reset(&mut self) {
        self.offset = 0;
        self.overflowed = false;
    }

    // -- Emit methods --

    #[inline]
    fn check(&mut self, len: usize) -> bool {
        if self.overflowed || self.size - self.offset < len {
            self.overflowed = true;
            return false;
        }
        true
    }

    #[inline]
    pub fn emit_u8(&mut self, val: u8) {
        if !self.check(1) {
            return;
        }
        // SAFETY: bounds checked above.
        unsafe { self.ptr.add(self.offset).write(val) };
        self.offset += 1;
    }

    #[inline]
    pub fn emit_u32(&mut self, val: u32) {
        if !self.check(4) {
            return;
        }
        // SAFETY: bounds checked above.
        unsafe {
            (self.ptr.add(self.offset) as *mut u32).write_unaligned(val)
        };
        self.offset += 4;
    }

    #[inline]
    pub fn emit_u64(&mut self, val: u64) {
        if !self.check(8) {
            return;
        }
        // SAFETY: bounds checked above.
        unsafe {
            (self.ptr.add(self.offset) as *mut u64).write_unaligned(val)
        };
        self.offset += 8;
    }

    /// Patch a rel32/imm32 field at `offset` (for resolving forward
    /// jumps). No-op after an overflow; the unit is being discarded.
    #[inline]
    pub fn patch_u32(&mut self, offset: usize, val: u32) {
        if self.overflowed {
            return;
        }
        assert!(offset + 4 <= self.offset);
        // SAFETY: within already-emitted bytes.
        unsafe { (self.ptr.add(offset) as *mut u32).write_unaligned(val) };
    }
}

impl Drop for CodeArena {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: ptr/size came from mmap.
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
