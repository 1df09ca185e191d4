//! Stress harnesses and verification tooling for the waitless cores.
//!
//! - [`snapshot_stress`]: spawns writer threads hammering the wait-free
//!   snapshot engine for a fixed duration.
//! - [`twopl_stress`]: spawns transaction workers running the read-two-write
//!   workload against the lock manager until the commit cap is reached.
//! - [`checker`]: replays the per-thread commit logs deterministically and
//!   verifies every logged value.

pub mod checker;
pub mod snapshot_stress;
pub mod twopl_stress;
