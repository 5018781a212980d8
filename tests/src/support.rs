//! Test guest fixture: a reserved 4 GiB guest window with RAM mapped
//! where tests need it, an MMIO region that only the slow-path bus
//! handlers can reach, and an [`Sh4Context`] to run against.

use std::ffi::c_void;
use std::io;
use std::ptr;

use sh4jit_cache::{BlockCache, CodePtr};
use sh4jit_core::MemoryInterface;
use sh4jit_frontend::{BlockFlags, Sh4Context, Sh4Guest};

/// Guest RAM window used by the tests (code and data live here).
pub const RAM_BASE: u32 = 0x8C00_0000;
pub const RAM_SIZE: usize = 0x2_0000;

/// MMIO-like region: backed by a plain Vec, never mapped into the
/// fastmem window, so direct accesses fault and replay through the
/// bus handlers.
pub const MMIO_BASE: u32 = 0xA000_0000;
pub const MMIO_SIZE: usize = 0x1000;

/// A 4 GiB PROT_NONE reservation covering the whole guest address
/// space, with RAM mapped in at fixed offsets.
pub struct GuestSpace {
    base: *mut u8,
    size: usize,
}

impl GuestSpace {
    pub fn new() -> io::Result<Self> {
        let size = 1usize << 32;
        // SAFETY: inaccessible reservation, no file backing.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            base: base as *mut u8,
            size,
        })
    }

    /// Map a readable/writable window at a guest address.
    pub fn map_ram(&self, guest_addr: u32, size: usize) -> io::Result<()> {
        // SAFETY: within our reservation.
        let ret = unsafe {
            libc::mmap(
                self.g2h(guest_addr) as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Host pointer for a guest address.
    #[inline]
    pub fn g2h(&self, guest_addr: u32) -> *mut u8 {
        assert!((guest_addr as usize) < self.size);
        // SAFETY: within the reservation.
        unsafe { self.base.add(guest_addr as usize) }
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }
}

impl Drop for GuestSpace {
    fn drop(&mut self) {
        if !self.base.is_null() {
            // SAFETY: base/size came from mmap.
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.size);
            }
        }
    }
}

pub struct TestEnv {
    pub space: GuestSpace,
    pub mmio: Vec<u8>,
    pub ctx: Box<Sh4Context>,
}

fn mmio_index(addr: u32) -> Option<usize> {
    if (MMIO_BASE..MMIO_BASE + MMIO_SIZE as u32).contains(&addr) {
        Some((addr - MMIO_BASE) as usize)
    } else {
        None
    }
}

extern "C" fn bus_r8(data: *mut c_void, addr: u32) -> u8 {
    // SAFETY: data is the boxed TestEnv the test owns.
    let env = unsafe { &*(data as *const TestEnv) };
    match mmio_index(addr) {
        Some(i) => env.mmio[i],
        // SAFETY: tests only touch mapped RAM outside the MMIO range.
        None => unsafe { *env.space.g2h(addr) },
    }
}

extern "C" fn bus_r16(data: *mut c_void, addr: u32) -> u16 {
    u16::from_le_bytes([bus_r8(data, addr), bus_r8(data, addr + 1)])
}

extern "C" fn bus_r32(data: *mut c_void, addr: u32) -> u32 {
    (bus_r16(data, addr) as u32) | ((bus_r16(data, addr + 2) as u32) << 16)
}

extern "C" fn bus_w8(data: *mut c_void, addr: u32, val: u8) {
    // SAFETY: see bus_r8.
    let env = unsafe { &mut *(data as *mut TestEnv) };
    match mmio_index(addr) {
        Some(i) => env.mmio[i] = val,
        None => unsafe { *env.space.g2h(addr) = val },
    }
}

extern "C" fn bus_w16(data: *mut c_void, addr: u32, val: u16) {
    let b = val.to_le_bytes();
    bus_w8(data, addr, b[0]);
    bus_w8(data, addr + 1, b[1]);
}

extern "C" fn bus_w32(data: *mut c_void, addr: u32, val: u32) {
    let b = val.to_le_bytes();
    for (i, &byte) in b.iter().enumerate() {
        bus_w8(data, addr + i as u32, byte);
    }
}

/// Interpreter stand-in: counts invocations in ctx.vbr and stashes the
/// last raw word in ctx.fpul so tests can observe it.
extern "C" fn test_fallback(ctx: *mut Sh4Context, _addr: u32, raw: u16) {
    // SAFETY: ctx is the TestEnv's context.
    unsafe {
        (*ctx).vbr = (*ctx).vbr.wrapping_add(1);
        (*ctx).fpul = raw as u32;
    }
}

/// Dispatch stub stand-in. Tests drive compilation themselves, so a
/// call landing here is a no-op.
pub unsafe extern "C" fn default_stub(_ctx: *mut Sh4Context) {}

impl TestEnv {
    pub fn new() -> Box<Self> {
        let space = GuestSpace::new().expect("guest reservation");
        space.map_ram(RAM_BASE, RAM_SIZE).expect("ram window");
        Box::new(Self {
            space,
            mmio: vec![0; MMIO_SIZE],
            ctx: Box::new(Sh4Context::new()),
        })
    }

    pub fn memif(&mut self) -> MemoryInterface {
        MemoryInterface {
            data: self as *mut Self as *mut c_void,
            space: self.space.base(),
            r8: bus_r8,
            r16: bus_r16,
            r32: bus_r32,
            w8: bus_w8,
            w16: bus_w16,
            w32: bus_w32,
        }
    }

    pub fn guest(&mut self) -> Sh4Guest {
        Sh4Guest {
            ctx: self.ctx.as_mut() as *mut Sh4Context,
            mem: self.memif(),
            fallback: test_fallback,
        }
    }

    pub fn ctx_ptr(&mut self) -> *mut Sh4Context {
        self.ctx.as_mut() as *mut Sh4Context
    }

    /// Write an instruction stream into guest RAM.
    pub fn write_code(&mut self, addr: u32, words: &[u16]) {
        for (i, w) in words.iter().enumerate() {
            let host = self.space.g2h(addr + (i * 2) as u32);
            // SAFETY: addr lies in the mapped RAM window.
            unsafe {
                (host as *mut u16).write_unaligned(w.to_le());
            }
        }
    }

    pub fn read_ram32(&self, addr: u32) -> u32 {
        // SAFETY: addr lies in the mapped RAM window.
        unsafe { (self.space.g2h(addr) as *const u32).read_unaligned() }
    }

    pub fn write_ram32(&mut self, addr: u32, val: u32) {
        // SAFETY: addr lies in the mapped RAM window.
        unsafe { (self.space.g2h(addr) as *mut u32).write_unaligned(val) }
    }

    pub fn mmio32(&self, off: usize) -> u32 {
        u32::from_le_bytes(self.mmio[off..off + 4].try_into().unwrap())
    }

    pub fn set_mmio32(&mut self, off: usize, val: u32) {
        self.mmio[off..off + 4].copy_from_slice(&val.to_le_bytes());
    }
}

/// One dispatch round: look the PC up, compile on a miss, execute.
pub fn step(cache: &mut BlockCache, ctx: *mut Sh4Context) {
    // SAFETY: ctx is live for the whole test.
    let pc = unsafe { (*ctx).pc };
    let mut entry: CodePtr = cache.entry(pc);
    if entry as usize == cache.default_code() as usize {
        entry = cache
            .compile(pc, BlockFlags::empty())
            .expect("compile failed");
    }
    // SAFETY: entry is a compiled block (or was just compiled) for the
    // current pc; ctx is valid.
    unsafe { entry(ctx) };
}
