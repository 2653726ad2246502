//! simkit: type-erased open-addressing hash tables over a pluggable
//! allocator, with a thread-local exception engine for error propagation.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: byte-oriented containers whose memory and failure behavior is
//!   fully under the caller's control.
//! - Layers:
//!   - `alloc`: the four-operation `Allocator` capability, a system
//!     allocator, a tracking wrapper used for leak and failure testing,
//!     and a per-thread default.
//!   - `exception`: a per-thread stack of recovery frames. `throw` records
//!     a code on the current frame and unwinds to it; `catch`/`guard` are
//!     the receiving ends.
//!   - `hash_table`: one engine (`RawTable`) that stores fixed-size keys
//!     and values as allocator-owned nodes behind a prime-sized slot
//!     array, probed by double hashing.
//!   - `HashSet` / `HashMap`: thin façades fixing the value size to zero
//!     or non-zero.
//!
//! Error model
//! - Every fallible operation has two forms. `try_op` returns
//!   `Result<T, Error>`. `op` raises the error through the exception
//!   engine, so it lands in the nearest enclosing `catch`; with no frame
//!   the process reports the code and exits with it.
//! - Argument errors are detected before any side effect. Allocation
//!   failures leave the structure as it was. A missing key is a plain
//!   `false`/`None`, never an error.
//!
//! Constraints
//! - Single-threaded: tables, vectors and the exception context are
//!   `!Send`/`!Sync`; each thread has its own frames and default allocator.
//! - Keys are compared only through the caller's equality predicate and
//!   hashed only through SipHash or the caller's hash function.
//! - Reentrancy: a table must not be entered from its own hash or
//!   equality function. Debug builds panic; `for_each` callbacks may read
//!   the table.
//!
//! Resizing
//! - The table grows to the next prime at or above twice its capacity
//!   when an insert would exceed the `LoadPolicy` grow threshold, and
//!   shrinks by half (never under the construction capacity) when a
//!   removal drops it below the shrink threshold.
//! - Tombstones count toward the grow threshold; when they alone would
//!   cross it the array is rehashed in place at the same capacity.

pub mod alloc;
pub mod error;
pub mod exception;
pub mod hash_map;
pub mod hash_set;
pub mod hash_table;
mod reentrancy;
pub mod siphash;
mod table_proptest;
pub mod vector;

// Public surface
pub use alloc::{
    default_allocator, set_default_allocator, Allocator, SystemAllocator, TrackingAllocator,
};
pub use error::{describe, Error, ErrorCode, Result};
pub use exception::{catch, raise, throw, RecoveryToken};
pub use hash_map::HashMap;
pub use hash_set::HashSet;
pub use hash_table::{bytes_eq, next_usable_size, LoadPolicy, TableBuilder, DEFAULT_MIN_SIZE};
pub use vector::Vector;
