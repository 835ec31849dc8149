//! # cola — Cache-Oblivious Lookahead Arrays
//!
//! An in-memory ordered multiset of signed integers built from
//! geometrically doubling sorted runs, amortizing insertion cost the way
//! a write-optimized external-memory index would, but entirely in RAM.
//!
//! ## Variants
//!
//! | Type | Keys | Merge cost | Search cost |
//! |---|---|---|---|
//! | [`BasicCola`] | `i64` | amortized `O(log n)` | `O(log^2 n)` |
//! | [`DeamortizedCola`] | `i64` | worst-case `O(log n)` | `O(log^2 n)` |
//! | [`LookaheadCola`] | `i64` | amortized `O(log n)` | `O(log n)` |
//! | [`VectorBasicCola`] | `i32` | amortized, AVX2 bitonic merge | `O(log^2 n)`, AVX2 parallel search |
//! | [`VectorDeamortizedCola`] | `i32` | worst-case, AVX2 bitonic merge | `O(log^2 n)` |
//!
//! All five share the same layer-indexing arithmetic in [`bitmath`]. None
//! support deletion, concurrent mutation, or globally-sorted iteration —
//! iteration walks each run in ascending order, smallest run to largest,
//! but runs themselves are not merged together.
//!
//! ## Picking a variant
//!
//! Start with [`BasicCola`]/[`VectorBasicCola`] unless a specific cost
//! bound matters: reach for the deamortized variants when a single `add`
//! must never stall for a large merge (e.g. on a latency-sensitive path),
//! and for [`LookaheadCola`] when `contains` is checked far more often
//! than `add` and the `O(log n)` search is worth the extra storage and
//! [`predecessor`](LookaheadCola::predecessor) query is also needed. The
//! vectorized variants require a CPU with AVX2; use their `try_new`
//! constructors to fall back to a scalar variant when it is absent.

// Global allocator: mimalloc's per-thread segregated free lists make the
// small, frequent allocations from doubling and merge-scratch buffers
// close to free, the same reasoning that motivates it at the root of the
// teacher crate this one is adapted from.
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod basic;
pub mod bitmath;
pub mod deamortized;
pub mod lookahead;
pub mod simd;
pub mod vector_basic;
pub mod vector_deamortized;

pub use basic::BasicCola;
pub use deamortized::DeamortizedCola;
pub use lookahead::LookaheadCola;
pub use simd::UnsupportedSimdError;
pub use vector_basic::VectorBasicCola;
pub use vector_deamortized::VectorDeamortizedCola;
