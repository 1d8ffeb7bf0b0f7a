//! Crate-wide constants.

/// Number of children of an octree node.
pub const NUM_SIBLINGS: usize = 8;

/// Message tag for requests (focus tree keys, particle payloads).
pub const TAG_REQUEST: i32 = 0;

/// Message tag for replies (per-node particle counts).
pub const TAG_REPLY: i32 = 1;

/// Upper bound on rebalance fixed-point iterations.
///
/// The iteration count is bounded by the maximum tree depth in practice;
/// exceeding this limit indicates corrupted input and is fatal.
pub const MAX_REBALANCE_ITERATIONS: usize = 64;
