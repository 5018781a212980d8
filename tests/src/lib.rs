//! Integration tests for the sh4jit workspace.
//!
//! `support` is a real (non-test-gated) module so per-crate
//! integration binaries (e.g. the real-signal fastmem test under
//! `cache/tests/`) can reuse the guest fixture.

pub mod support;

#[cfg(test)]
mod cache;
#[cfg(test)]
mod exec;
