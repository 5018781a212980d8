//! The block cache: guest↔host indexing, block lifecycle, and fault
//! dispatch.
//!
//! Dispatch reads `code[block_offset(pc)]` and calls it; every slot is
//! either the shared dispatch stub (`default_code`) or the entry of
//! exactly one live block. Blocks are indexed twice (by guest start
//! address and by host code start) so both the dispatcher's compile
//! path and the fault handler's reverse lookup are cheap.
//!
//! The cache is built for a single executor thread: the thread that
//! compiles, runs host code, and takes that code's faults on its own
//! stack. There is no internal locking; a lock here would deadlock the
//! fault handler, which runs on the executor's own signal frame. Any
//! second thread (e.g. a memory watcher calling
//! [`BlockCache::remove_blocks`]) must be serialized externally.

use std::collections::BTreeMap;
use std::ffi::c_void;

use sh4jit_backend::{AssembleError, X64Backend};
use sh4jit_core::passes::{
    DeadCodeEliminationPass, LoadStoreEliminationPass, PassRunner,
    RegisterAllocationPass,
};
use sh4jit_fault::{Exception, HandlerId};
use sh4jit_frontend::{BlockFlags, Sh4Context, Sh4Frontend, Sh4Guest};
use thiserror::Error;

/// Calling convention of every compiled entry and of the dispatch
/// stub.
pub type CodePtr = unsafe extern "C" fn(*mut Sh4Context);

/// One slot per aligned guest address in the cacheable window.
pub const MAX_BLOCKS: usize = 1 << 23;

/// Direct-mapped slot for a guest address (SH4 instructions are
/// 2-byte aligned; the window covers the low 16 MiB of each mirror).
#[inline]
pub fn block_offset(guest_addr: u32) -> usize {
    ((guest_addr & 0x00ff_ffff) >> 1) as usize
}

/// A compiled translation unit.
///
/// Immutable after creation except for `flags` (which may gain
/// `SLOWMEM` when a fastmem fault demotes the block).
pub struct Block {
    pub guest_addr: u32,
    pub guest_size: u32,
    pub host_addr: *const u8,
    pub host_size: u32,
    pub flags: BlockFlags,
}

impl Block {
    fn contains_guest(&self, addr: u32) -> bool {
        addr >= self.guest_addr && addr < self.guest_addr + self.guest_size
    }

    fn contains_host(&self, addr: usize) -> bool {
        let start = self.host_addr as usize;
        addr >= start && addr < start + self.host_size as usize
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    /// The unit still overflows after a full cache clear: it is larger
    /// than the whole codegen arena. No block was created.
    #[error("translation unit at {guest_addr:#010x} exceeds the codegen arena")]
    ArenaExhausted { guest_addr: u32 },
}

pub struct BlockCache {
    /// Direct-mapped dispatch table. Redundant with `by_guest` for
    /// live entries; exists so a guest branch costs one load instead
    /// of a tree walk.
    code: Vec<CodePtr>,
    /// Owning index, keyed by guest start address.
    by_guest: BTreeMap<u32, Box<Block>>,
    /// Host code start -> guest key. Ranges are disjoint.
    by_host: BTreeMap<usize, u32>,
    default_code: CodePtr,
    frontend: Sh4Frontend,
    backend: X64Backend,
    passes: PassRunner,
    handler: Option<HandlerId>,
}

impl BlockCache {
    /// Build a cache over `guest` and `backend`, dispatching misses to
    /// `default_code`.
    ///
    /// `default_code` is the shared dispatch stub: its contract is to
    /// read the guest PC from the context, call back into the host to
    /// `compile` it, install the returned entry, and tail-call it.
    ///
    /// Returns a box because the cache registers its address with the
    /// process fault registry; it must not move until drop.
    pub fn new(
        guest: Sh4Guest,
        backend: X64Backend,
        default_code: CodePtr,
    ) -> Box<Self> {
        let mut passes = PassRunner::new();
        passes.add_pass(Box::new(LoadStoreEliminationPass));
        passes.add_pass(Box::new(DeadCodeEliminationPass));
        passes.add_pass(Box::new(RegisterAllocationPass::new(
            backend.registers(),
        )));

        let mut cache = Box::new(Self {
            code: vec![default_code; MAX_BLOCKS],
            by_guest: BTreeMap::new(),
            by_host: BTreeMap::new(),
            default_code,
            frontend: Sh4Frontend::new(guest),
            backend,
            passes,
            handler: None,
        });

        // Fastmem faults in generated code need to find their way
        // back to this cache.
        cache.handler = Some(sh4jit_fault::register(
            cache.as_mut() as *mut Self as *mut c_void,
            fault_trampoline,
        ));

        cache
    }

    #[inline]
    fn is_default(&self, p: CodePtr) -> bool {
        p as usize == self.default_code as usize
    }

    /// The dispatch entry for `guest_addr`: a compiled block, or the
    /// stub on a miss.
    #[inline]
    pub fn entry(&self, guest_addr: u32) -> CodePtr {
        self.code[block_offset(guest_addr)]
    }

    pub fn default_code(&self) -> CodePtr {
        self.default_code
    }

    pub fn num_blocks(&self) -> usize {
        self.by_guest.len()
    }

    /// Compile the block at `guest_addr` and install its entry.
    ///
    /// The slot must currently dispatch to the stub (either never
    /// compiled, or unlinked). If an unlinked block is still indexed
    /// at exactly this address, its flags carry over (that is how a
    /// fastmem demotion becomes a SLOWMEM recompile) and the stale
    /// block is fully removed now, the first point where no frame can
    /// still be inside it.
    pub fn compile(
        &mut self,
        guest_addr: u32,
        mut flags: BlockFlags,
    ) -> Result<CodePtr, CompileError> {
        let offset = block_offset(guest_addr);
        assert!(
            self.is_default(self.code[offset]),
            "compile over a linked slot at {guest_addr:#010x}"
        );

        if let Some(unlinked) = self.by_guest.get(&guest_addr) {
            flags |= unlinked.flags;
            self.remove_block(guest_addr);
        }

        // Optimistic by default; a prior demotion turns it off.
        if !flags.contains(BlockFlags::SLOWMEM) {
            flags |= BlockFlags::FASTMEM;
        }

        let mut translation = self.frontend.translate(guest_addr, flags);
        self.passes.run(&mut translation.ir);

        let (host_addr, host_size) = match self.backend.assemble(&translation.ir)
        {
            Ok(out) => out,
            Err(AssembleError::Overflow) => {
                log::info!("assembler overflow, resetting block cache");

                // Throw every block out and retry on an empty arena.
                // If it still does not fit, nothing can be done.
                self.clear_blocks();

                match self.backend.assemble(&translation.ir) {
                    Ok(out) => out,
                    Err(AssembleError::Overflow) => {
                        return Err(CompileError::ArenaExhausted { guest_addr })
                    }
                }
            }
        };

        let block = Box::new(Block {
            guest_addr,
            guest_size: translation.guest_size,
            host_addr,
            host_size: host_size as u32,
            flags,
        });

        let prev = self.by_guest.insert(guest_addr, block);
        assert!(prev.is_none(), "duplicate guest index entry");
        let prev = self.by_host.insert(host_addr as usize, guest_addr);
        assert!(prev.is_none(), "duplicate host index entry");

        // SAFETY: host_addr is the entry of a function the backend
        // just emitted with the CodePtr calling convention.
        let entry: CodePtr = unsafe { std::mem::transmute(host_addr) };
        self.code[offset] = entry;

        log::debug!(
            "compiled {:#010x}: {} guest bytes, {} host bytes, {} cycles",
            guest_addr,
            translation.guest_size,
            host_size,
            translation.num_cycles
        );

        Ok(entry)
    }

    /// Point lookup by guest start address.
    pub fn get_block(&self, guest_addr: u32) -> Option<&Block> {
        self.by_guest.get(&guest_addr).map(|b| &**b)
    }

    /// Remove every block whose guest range contains `guest_addr`.
    ///
    /// Only called when guest memory at that address is known to have
    /// been written: the guest cannot re-enter the removed code
    /// without going back through the dispatch stub.
    pub fn remove_blocks(&mut self, guest_addr: u32) {
        let mut removed = 0usize;
        while let Some(start) = self.lookup_guest_containing(guest_addr) {
            self.remove_block(start);
            removed += 1;
        }
        if removed > 0 {
            log::debug!(
                "invalidated {} block(s) covering {:#010x}",
                removed,
                guest_addr
            );
        }
    }

    /// Reset every slot to the dispatch stub, leaving both indexes
    /// intact.
    ///
    /// Safe while host code is running: future dispatches miss and
    /// recompile, but nothing an active frame executes is freed.
    pub fn unlink_blocks(&mut self) {
        for (&guest_addr, _) in self.by_guest.iter() {
            self.code[block_offset(guest_addr)] = self.default_code;
        }
    }

    /// Unlink every block, drop both indexes, and rewind the codegen
    /// arena. Caller guarantees no host code is executing.
    pub fn clear_blocks(&mut self) {
        let n = self.by_guest.len();
        self.unlink_blocks();
        self.by_guest.clear();
        self.by_host.clear();
        self.backend.reset();
        log::debug!("cleared {} block(s)", n);
    }

    /// Fault dispatch: if `ex.pc` lies inside a block and the backend
    /// recognizes (and repairs) a fastmem access, unlink the block and
    /// mark it for a SLOWMEM recompile.
    ///
    /// The block stays in both indexes: the faulting frame is still
    /// executing inside it, may fault again before it returns, and its
    /// host range must keep resolving until the recompile at its entry
    /// address finally removes it.
    pub fn handle_fault(&mut self, ex: &mut Exception) -> bool {
        let Some(guest_key) = self.lookup_host_containing(ex.pc as usize)
        else {
            return false;
        };

        if !self.backend.handle_fastmem_fault(ex) {
            return false;
        }

        let block = self.by_guest.get_mut(&guest_key).expect("indexed block");
        self.code[block_offset(block.guest_addr)] = self.default_code;
        block.flags |= BlockFlags::SLOWMEM;

        log::debug!(
            "demoted block {:#010x} after fastmem fault at host pc {:#x}",
            block.guest_addr,
            ex.pc
        );
        true
    }

    // -- Range lookups --
    //
    // Both indexes answer "greatest start <= addr" (upper bound, then
    // one step back), followed by a containment check against the
    // block's size.

    /// The block whose guest range contains `addr`, if the one with
    /// the greatest start at or below `addr` covers it.
    pub fn lookup_by_guest_containing(&self, addr: u32) -> Option<&Block> {
        let start = self.lookup_guest_containing(addr)?;
        self.get_block(start)
    }

    /// The block whose host code range contains `addr`. Host ranges
    /// are disjoint, so the predecessor is the only candidate.
    pub fn lookup_by_host_containing(&self, addr: usize) -> Option<&Block> {
        let start = self.lookup_host_containing(addr)?;
        self.get_block(start)
    }

    fn lookup_guest_containing(&self, addr: u32) -> Option<u32> {
        let (&start, block) = self.by_guest.range(..=addr).next_back()?;
        block.contains_guest(addr).then_some(start)
    }

    fn lookup_host_containing(&self, addr: usize) -> Option<u32> {
        let (_, &guest_key) = self.by_host.range(..=addr).next_back()?;
        let block = &self.by_guest[&guest_key];
        block.contains_host(addr).then_some(guest_key)
    }

    /// Unlink `start`'s slot and drop the block from both indexes.
    fn remove_block(&mut self, start: u32) {
        let block = self.by_guest.remove(&start).expect("block to remove");
        self.code[block_offset(start)] = self.default_code;
        let removed = self.by_host.remove(&(block.host_addr as usize));
        assert!(removed.is_some(), "block missing from host index");
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            sh4jit_fault::unregister(handler);
        }
    }
}

/// Registry callback: `data` is the `BlockCache` registered in
/// [`BlockCache::new`].
fn fault_trampoline(data: *mut c_void, ex: &mut Exception) -> bool {
    // SAFETY: the cache unregisters before drop, and it is boxed, so
    // the pointer is valid whenever the registry can call us. Fault
    // handling runs on the executor thread whose frame is paused, so
    // the &mut does not alias a live borrow.
    let cache = unsafe { &mut *(data as *mut BlockCache) };
    cache.handle_fault(ex)
}
