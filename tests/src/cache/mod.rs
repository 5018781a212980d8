//! Block cache lifecycle scenarios.

use sh4jit_backend::X64Backend;
use sh4jit_cache::{block_offset, BlockCache, CompileError};
use sh4jit_frontend::BlockFlags;

use crate::support::{default_stub, TestEnv, RAM_BASE};

fn cache_with_arena(env: &mut TestEnv, arena: usize) -> Box<BlockCache> {
    let backend =
        X64Backend::with_arena_size(env.memif(), arena).expect("backend");
    BlockCache::new(env.guest(), backend, default_stub)
}

fn cache(env: &mut TestEnv) -> Box<BlockCache> {
    let backend = X64Backend::new(env.memif()).expect("backend");
    BlockCache::new(env.guest(), backend, default_stub)
}

/// mov #1,r0; bra; nop: a minimal three-word block.
const SMALL_BLOCK: [u16; 3] = [0xE001, 0xAFFD, 0x0009];

/// A block that emits a lot of host code: a long run of stores that
/// neither pass can delete, then a branch.
fn fat_block(stores: usize) -> Vec<u16> {
    let mut words = vec![0x2102u16; stores]; // mov.l r0,@r1
    words.push(0xA000); // bra
    words.push(0x0009); // nop (delay)
    words
}

#[test]
fn miss_then_compile_installs_entry() {
    let mut env = TestEnv::new();
    env.write_code(RAM_BASE, &SMALL_BLOCK);
    let mut cache = cache(&mut env);

    assert!(cache.get_block(RAM_BASE).is_none());
    assert_eq!(cache.entry(RAM_BASE) as usize, default_stub as usize);

    let entry = cache.compile(RAM_BASE, BlockFlags::empty()).unwrap();

    // The slot at the block's offset now dispatches to the new entry.
    assert_eq!(cache.entry(RAM_BASE) as usize, entry as usize);
    let block = cache.get_block(RAM_BASE).expect("block indexed");
    assert_eq!(block.host_addr as usize, entry as usize);
    assert_eq!(block.guest_addr, RAM_BASE);
    assert_eq!(block.guest_size, 6);
}

#[test]
fn host_ranges_are_disjoint_and_resolvable() {
    let mut env = TestEnv::new();
    env.write_code(RAM_BASE, &SMALL_BLOCK);
    env.write_code(RAM_BASE + 0x1000, &SMALL_BLOCK);
    let mut cache = cache(&mut env);

    cache.compile(RAM_BASE, BlockFlags::empty()).unwrap();
    cache.compile(RAM_BASE + 0x1000, BlockFlags::empty()).unwrap();

    let (a_start, a_size, b_start, b_size) = {
        let a = cache.get_block(RAM_BASE).unwrap();
        let b = cache.get_block(RAM_BASE + 0x1000).unwrap();
        (
            a.host_addr as usize,
            a.host_size as usize,
            b.host_addr as usize,
            b.host_size as usize,
        )
    };

    // Disjoint host ranges.
    assert!(a_start + a_size <= b_start || b_start + b_size <= a_start);

    // Every byte in each range resolves to its own block.
    for h in [a_start, a_start + 1, a_start + a_size - 1] {
        let found = cache.lookup_by_host_containing(h).unwrap();
        assert_eq!(found.guest_addr, RAM_BASE);
    }
    for h in [b_start, b_start + b_size / 2, b_start + b_size - 1] {
        let found = cache.lookup_by_host_containing(h).unwrap();
        assert_eq!(found.guest_addr, RAM_BASE + 0x1000);
    }

    // One past the end of the later range resolves to nothing.
    let past = a_start.max(b_start)
        + if a_start > b_start { a_size } else { b_size };
    assert!(cache.lookup_by_host_containing(past).is_none());
}

#[test]
fn unlink_resets_slots_but_keeps_indexes() {
    let mut env = TestEnv::new();
    env.write_code(RAM_BASE, &SMALL_BLOCK);
    env.write_code(RAM_BASE + 0x100, &SMALL_BLOCK);
    let mut cache = cache(&mut env);

    cache.compile(RAM_BASE, BlockFlags::empty()).unwrap();
    cache.compile(RAM_BASE + 0x100, BlockFlags::empty()).unwrap();

    let host = cache.get_block(RAM_BASE).unwrap().host_addr as usize;

    cache.unlink_blocks();

    assert_eq!(cache.entry(RAM_BASE) as usize, default_stub as usize);
    assert_eq!(cache.entry(RAM_BASE + 0x100) as usize, default_stub as usize);
    // Both indexes still hold the blocks.
    assert_eq!(cache.num_blocks(), 2);
    assert!(cache.get_block(RAM_BASE).is_some());
    assert!(cache.lookup_by_host_containing(host).is_some());
}

#[test]
fn clear_empties_both_indexes() {
    let mut env = TestEnv::new();
    env.write_code(RAM_BASE, &SMALL_BLOCK);
    env.write_code(RAM_BASE + 0x100, &SMALL_BLOCK);
    let mut cache = cache(&mut env);

    cache.compile(RAM_BASE, BlockFlags::empty()).unwrap();
    cache.compile(RAM_BASE + 0x100, BlockFlags::empty()).unwrap();
    let host = cache.get_block(RAM_BASE).unwrap().host_addr as usize;

    cache.clear_blocks();

    assert_eq!(cache.num_blocks(), 0);
    assert_eq!(cache.entry(RAM_BASE) as usize, default_stub as usize);
    assert!(cache.get_block(RAM_BASE).is_none());
    assert!(cache.lookup_by_host_containing(host).is_none());
}

#[test]
fn overflow_clears_and_retries_once() {
    let mut env = TestEnv::new();
    let fat = fat_block(300);
    env.write_code(RAM_BASE, &fat);
    env.write_code(RAM_BASE + 0x2000, &fat);
    // One page: fits one fat block, not two.
    let mut cache = cache_with_arena(&mut env, 4096);

    cache.compile(RAM_BASE, BlockFlags::empty()).unwrap();
    assert_eq!(cache.num_blocks(), 1);

    // The second compile overflows, flushes everything, and retries.
    let entry = cache
        .compile(RAM_BASE + 0x2000, BlockFlags::empty())
        .unwrap();

    assert_eq!(cache.num_blocks(), 1);
    assert!(cache.get_block(RAM_BASE).is_none());
    assert_eq!(cache.entry(RAM_BASE) as usize, default_stub as usize);
    assert_eq!(cache.entry(RAM_BASE + 0x2000) as usize, entry as usize);
}

#[test]
fn second_overflow_is_fatal_and_creates_nothing() {
    let mut env = TestEnv::new();
    // Far larger than a one-page arena even after a clear.
    let fat = fat_block(4000);
    env.write_code(RAM_BASE, &fat);
    let mut cache = cache_with_arena(&mut env, 4096);

    let err = cache.compile(RAM_BASE, BlockFlags::empty()).unwrap_err();
    assert!(matches!(
        err,
        CompileError::ArenaExhausted { guest_addr } if guest_addr == RAM_BASE
    ));
    assert_eq!(cache.num_blocks(), 0);
    assert!(cache.get_block(RAM_BASE).is_none());
    assert_eq!(cache.entry(RAM_BASE) as usize, default_stub as usize);
}

#[test]
fn remove_blocks_drops_every_overlapping_block() {
    let mut env = TestEnv::new();
    // Block X: four movs then a delayed branch, covering BASE..BASE+12.
    env.write_code(
        RAM_BASE,
        &[0xE001, 0xE102, 0xE203, 0xE304, 0xAFFD, 0x0009],
    );
    let mut cache = cache(&mut env);

    cache.compile(RAM_BASE, BlockFlags::empty()).unwrap();

    // Self-modifying guest: rewrite the tail and enter mid-block.
    // Block Y starts inside X's range.
    env.write_code(RAM_BASE + 4, &[0xE203, 0xE304, 0xAFFD, 0x0009]);
    cache.compile(RAM_BASE + 4, BlockFlags::empty()).unwrap();
    assert_eq!(cache.num_blocks(), 2);

    // Both cover RAM_BASE+6; both must go.
    cache.remove_blocks(RAM_BASE + 6);

    assert_eq!(cache.num_blocks(), 0);
    assert!(cache.get_block(RAM_BASE).is_none());
    assert!(cache.get_block(RAM_BASE + 4).is_none());
    assert_eq!(cache.entry(RAM_BASE) as usize, default_stub as usize);
    assert_eq!(cache.entry(RAM_BASE + 4) as usize, default_stub as usize);
}

#[test]
fn remove_blocks_ignores_non_covering_neighbors() {
    let mut env = TestEnv::new();
    env.write_code(RAM_BASE, &SMALL_BLOCK); // covers BASE..BASE+6
    let mut cache = cache(&mut env);
    cache.compile(RAM_BASE, BlockFlags::empty()).unwrap();

    // Past the end of the block: nothing is removed.
    cache.remove_blocks(RAM_BASE + 6);
    assert_eq!(cache.num_blocks(), 1);

    cache.remove_blocks(RAM_BASE + 2);
    assert_eq!(cache.num_blocks(), 0);
}

#[test]
fn fault_outside_any_block_is_declined() {
    let mut env = TestEnv::new();
    env.write_code(RAM_BASE, &SMALL_BLOCK);
    let mut cache = cache(&mut env);
    cache.compile(RAM_BASE, BlockFlags::empty()).unwrap();

    let mut ex = sh4jit_fault::Exception {
        pc: 0x1234,
        fault_addr: 0,
        state: sh4jit_fault::ThreadState::new(),
    };
    assert!(!cache.handle_fault(&mut ex));
    // Block untouched.
    let block = cache.get_block(RAM_BASE).unwrap();
    assert!(!block.flags.contains(BlockFlags::SLOWMEM));
    assert_ne!(cache.entry(RAM_BASE) as usize, default_stub as usize);
}

#[test]
fn fault_on_non_access_instruction_is_declined() {
    let mut env = TestEnv::new();
    env.write_code(RAM_BASE, &SMALL_BLOCK);
    let mut cache = cache(&mut env);
    let entry = cache.compile(RAM_BASE, BlockFlags::empty()).unwrap();

    // The block entry is prologue code (push), not a fastmem access,
    // so the backend declines and the block stays linked.
    let mut ex = sh4jit_fault::Exception {
        pc: entry as usize as u64,
        fault_addr: 0,
        state: sh4jit_fault::ThreadState::new(),
    };
    assert!(!cache.handle_fault(&mut ex));
    let block = cache.get_block(RAM_BASE).unwrap();
    assert!(!block.flags.contains(BlockFlags::SLOWMEM));
    assert_eq!(cache.entry(RAM_BASE) as usize, entry as usize);
}

#[test]
#[should_panic(expected = "compile over a linked slot")]
fn compiling_a_linked_slot_is_an_invariant_violation() {
    let mut env = TestEnv::new();
    env.write_code(RAM_BASE, &SMALL_BLOCK);
    let mut cache = cache(&mut env);
    cache.compile(RAM_BASE, BlockFlags::empty()).unwrap();
    let _ = cache.compile(RAM_BASE, BlockFlags::empty());
}

#[test]
fn block_offset_is_two_byte_direct_mapped() {
    assert_eq!(block_offset(0x8c00_0000), 0);
    assert_eq!(block_offset(0x8c00_0002), 1);
    // Mirrors collapse onto the same slot.
    assert_eq!(block_offset(0x0c00_1000), block_offset(0x8c00_1000));
}
