//! x86-64 backend: assembles IR into an executable codegen arena and
//! classifies fastmem faults raised by the code it emitted.

pub mod arena;
pub mod x64;

pub use arena::CodeArena;

use std::io;

use sh4jit_core::types::Register;
use sh4jit_core::{IrBuilder, MemoryInterface};
use sh4jit_fault::Exception;
use thiserror::Error;

/// Default codegen arena size.
const DEFAULT_ARENA_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssembleError {
    /// The unit does not fit in the remaining arena space. Nothing was
    /// committed; the caller may clear the arena and retry.
    #[error("codegen arena exhausted")]
    Overflow,
}

/// The x86-64 backend. Owns the executable arena; compiled code
/// pointers returned by [`assemble`](Self::assemble) stay valid until
/// [`reset`](Self::reset).
pub struct X64Backend {
    arena: CodeArena,
    memif: MemoryInterface,
}

impl X64Backend {
    pub fn new(memif: MemoryInterface) -> io::Result<Self> {
        Self::with_arena_size(memif, DEFAULT_ARENA_SIZE)
    }

    pub fn with_arena_size(
        memif: MemoryInterface,
        size: usize,
    ) -> io::Result<Self> {
        Ok(Self {
            arena: CodeArena::new(size)?,
            memif,
        })
    }

    /// The register file exposed to the register allocation pass.
    pub fn registers(&self) -> &'static [Register] {
        &x64::regs::ALLOCATABLE
    }

    pub fn num_registers(&self) -> usize {
        x64::regs::ALLOCATABLE.len()
    }

    /// Lay the unit out in the arena and return its entry and length.
    ///
    /// On [`AssembleError::Overflow`] the arena is rewound to its
    /// pre-call position; nothing is committed.
    pub fn assemble(
        &mut self,
        ir: &IrBuilder,
    ) -> Result<(*const u8, usize), AssembleError> {
        let start = self.arena.offset();
        x64::assembler::assemble_unit(&mut self.arena, ir, &self.memif);
        if !self.arena.ok() {
            self.arena.truncate(start);
            return Err(AssembleError::Overflow);
        }
        let len = self.arena.offset() - start;
        Ok((self.arena.ptr_at(start), len))
    }

    /// Rewind the arena to empty. Every previously returned pointer is
    /// invalid afterwards; the caller guarantees none is executing.
    pub fn reset(&mut self) {
        self.arena.reset();
    }

    /// Whether `addr` points into the codegen arena.
    pub fn contains_code(&self, addr: usize) -> bool {
        self.arena.contains(addr)
    }

    /// Classify a fault and, if it was raised by a fastmem access this
    /// backend emitted, repair the thread state so execution resumes
    /// past it.
    pub fn handle_fastmem_fault(&self, ex: &mut Exception) -> bool {
        if !self.arena.contains(ex.pc as usize) {
            return false;
        }
        x64::fastmem::handle_fastmem_fault(&self.memif, ex)
    }
}
