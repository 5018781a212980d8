//! End-to-end tests: compiled blocks executed against a live context.

use sh4jit_backend::X64Backend;
use sh4jit_cache::BlockCache;
use sh4jit_frontend::BlockFlags;

use crate::support::{default_stub, step, TestEnv, RAM_BASE};

fn cache(env: &mut TestEnv) -> Box<BlockCache> {
    let backend = X64Backend::new(env.memif()).expect("backend");
    BlockCache::new(env.guest(), backend, default_stub)
}

#[test]
fn alu_block_updates_context() {
    let mut env = TestEnv::new();
    // mov #5,r0; mov #7,r1; add r0,r1; bra <back to base>; nop
    env.write_code(
        RAM_BASE,
        &[0xE005, 0xE107, 0x310C, 0xAFFB, 0x0009],
    );
    env.ctx.pc = RAM_BASE;
    let mut cache = cache(&mut env);

    let ctx = env.ctx_ptr();
    step(&mut cache, ctx);

    assert_eq!(env.ctx.r[0], 5);
    assert_eq!(env.ctx.r[1], 12);
    // bra at RAM_BASE+6: target = pc + 4 + disp(-5)*2 = RAM_BASE
    assert_eq!(env.ctx.pc, RAM_BASE);
}

#[test]
fn fastmem_store_and_load_round_trip() {
    let mut env = TestEnv::new();
    let data = RAM_BASE + 0x8000;
    // mov.l r0,@r1; mov.l @r1,r2; bra <base>; nop
    env.write_code(RAM_BASE, &[0x2102, 0x6212, 0xAFFC, 0x0009]);
    env.ctx.pc = RAM_BASE;
    env.ctx.r[0] = 0xDEAD_BEEF;
    env.ctx.r[1] = data;
    let mut cache = cache(&mut env);

    let ctx = env.ctx_ptr();
    step(&mut cache, ctx);

    assert_eq!(env.read_ram32(data), 0xDEAD_BEEF);
    assert_eq!(env.ctx.r[2], 0xDEAD_BEEF);
}

#[test]
fn byte_load_sign_extends() {
    let mut env = TestEnv::new();
    let data = RAM_BASE + 0x8000;
    env.write_ram32(data, 0x0000_0080);
    // mov.b @r1,r0; bra <base>; nop
    env.write_code(RAM_BASE, &[0x6010, 0xAFFD, 0x0009]);
    env.ctx.pc = RAM_BASE;
    env.ctx.r[1] = data;
    let mut cache = cache(&mut env);

    let ctx = env.ctx_ptr();
    step(&mut cache, ctx);

    assert_eq!(env.ctx.r[0], 0xFFFF_FF80);
}

#[test]
fn conditional_branch_follows_t_bit() {
    let mut env = TestEnv::new();
    // cmp/eq r1,r0; bt +disp. Taken target = pc+4+2*2
    env.write_code(RAM_BASE, &[0x3010, 0x8902]);

    // Equal: branch taken.
    env.ctx.pc = RAM_BASE;
    env.ctx.r[0] = 42;
    env.ctx.r[1] = 42;
    let mut c = cache(&mut env);
    let ctx = env.ctx_ptr();
    step(&mut c, ctx);
    assert_eq!(env.ctx.pc, RAM_BASE + 2 + 4 + 4);
    assert_eq!(env.ctx.sr & 1, 1);
    drop(c);

    // Not equal: fall through past the block.
    env.ctx = Box::new(sh4jit_frontend::Sh4Context::new());
    env.ctx.pc = RAM_BASE;
    env.ctx.r[0] = 1;
    env.ctx.r[1] = 2;
    let mut c = cache(&mut env);
    let ctx = env.ctx_ptr();
    step(&mut c, ctx);
    assert_eq!(env.ctx.pc, RAM_BASE + 4);
    assert_eq!(env.ctx.sr & 1, 0);
}

#[test]
fn delayed_branch_runs_delay_slot_before_transfer() {
    let mut env = TestEnv::new();
    // bra +4; add #1,r0 (delay slot): r0 increments, then jump.
    env.write_code(RAM_BASE, &[0xA002, 0x7001]);
    env.ctx.pc = RAM_BASE;
    env.ctx.r[0] = 10;
    let mut cache = cache(&mut env);

    let ctx = env.ctx_ptr();
    step(&mut cache, ctx);

    assert_eq!(env.ctx.r[0], 11);
    assert_eq!(env.ctx.pc, RAM_BASE + 4 + 4);
}

#[test]
fn subroutine_link_and_return() {
    let mut env = TestEnv::new();
    let sub = RAM_BASE + 0x100;
    // bsr <sub>; nop, then at sub: rts; nop
    let disp = ((sub as i32 - (RAM_BASE as i32 + 4)) / 2) as u16 & 0xFFF;
    env.write_code(RAM_BASE, &[0xB000 | disp, 0x0009]);
    env.write_code(sub, &[0x000B, 0x0009]);
    env.ctx.pc = RAM_BASE;
    let mut cache = cache(&mut env);

    let ctx = env.ctx_ptr();
    step(&mut cache, ctx);
    assert_eq!(env.ctx.pc, sub);
    assert_eq!(env.ctx.pr, RAM_BASE + 4);

    step(&mut cache, ctx);
    assert_eq!(env.ctx.pc, RAM_BASE + 4);
}

#[test]
fn invalid_instruction_falls_back_to_interpreter() {
    let mut env = TestEnv::new();
    // mov #3,r0; <invalid word>
    env.write_code(RAM_BASE, &[0xE003, 0xFFFD]);
    env.ctx.pc = RAM_BASE;
    let mut cache = cache(&mut env);

    let ctx = env.ctx_ptr();
    step(&mut cache, ctx);

    assert_eq!(env.ctx.r[0], 3);
    // The fallback helper ran once and saw the raw word.
    assert_eq!(env.ctx.vbr, 1);
    assert_eq!(env.ctx.fpul, 0xFFFD);
    // Fall-through completion resumes after the invalid word.
    assert_eq!(env.ctx.pc, RAM_BASE + 4);
}

#[test]
fn slowmem_block_routes_through_bus_handlers() {
    let mut env = TestEnv::new();
    let data = RAM_BASE + 0x8000;
    env.write_ram32(data, 0x1122_3344);
    // mov.l @r1,r0; bra; nop
    env.write_code(RAM_BASE, &[0x6012, 0xAFFC, 0x0009]);
    env.ctx.pc = RAM_BASE;
    env.ctx.r[1] = data;
    let mut cache = cache(&mut env);

    // Force the conservative path up front.
    let entry = cache.compile(RAM_BASE, BlockFlags::SLOWMEM).unwrap();
    let block = cache.get_block(RAM_BASE).unwrap();
    assert!(block.flags.contains(BlockFlags::SLOWMEM));
    assert!(!block.flags.contains(BlockFlags::FASTMEM));

    let ctx = env.ctx_ptr();
    // SAFETY: entry was just compiled for this context's pc.
    unsafe { entry(ctx) };
    assert_eq!(env.ctx.r[0], 0x1122_3344);
}

#[test]
fn spilled_block_still_computes_correctly() {
    let mut env = TestEnv::new();
    // Twelve live sums keep more values alive than there are
    // allocatable registers, forcing spill traffic.
    let mut words = Vec::new();
    for n in 2..14u16 {
        // mov.l @r1,Rn: twelve loads from the same address
        words.push(0x6012 | (n << 8));
    }
    for n in 2..14u16 {
        // add Rn,r0
        words.push(0x300C | (n << 4));
    }
    words.push(0xAFFB); // bra
    words.push(0x0009);
    env.write_code(RAM_BASE, &words);

    let data = RAM_BASE + 0x8000;
    env.write_ram32(data, 3);
    env.ctx.pc = RAM_BASE;
    env.ctx.r[1] = data;
    let mut cache = cache(&mut env);

    let ctx = env.ctx_ptr();
    step(&mut cache, ctx);

    assert_eq!(env.ctx.r[0], 36);
    for n in 2..14 {
        assert_eq!(env.ctx.r[n], 3);
    }
}
