//! shared-weak: single-threaded shared/weak pointers backed by an
//! explicit, heap-allocated control block.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: non-intrusive shared ownership where the managed type needs no
//!   base trait or embedded counter, with weak observers that can tell
//!   whether the object is still alive.
//! - Layers:
//!   - `control_block`: the only module that touches raw memory. A block is
//!     a type-erased header (strong count, weak count, variant tag, two
//!     destruction entry points) followed by the variant's storage:
//!     `ControlBlock<T>` holds the object, `ExternalBlock<T>` a pointer.
//!   - `SharedPtr<T>`: strong handle; block reference plus access pointer.
//!   - `WeakPtr<T>`: weak handle; same pair, counted on the weak side.
//!
//! Block variants
//! - Co-allocated (`SharedPtr::make_shared*`): the object lives inside the
//!   block allocation and is dropped in place; the storage is freed later,
//!   as one allocation.
//! - External (`SharedPtr::from_box`/`from_raw`): the block records a
//!   pointer to a separate `Box<T>`; destroying the object frees that box,
//!   freeing the block frees only the block.
//!
//! Counting rules
//! - `strong` is the number of live `SharedPtr`s. The object is destroyed
//!   exactly once, on the 1 -> 0 transition.
//! - `weak` is the number of live `WeakPtr`s. Strong handles do not hold a
//!   weak reference.
//! - The block itself is freed exactly once, when both counts are zero.
//!   Whichever handle performs the last decrement frees it.
//! - States: Alive (strong > 0), WeaklyReachable (strong == 0, weak > 0),
//!   Dead (both zero, storage freed). Only the four counter operations in
//!   `control_block` move a block between them.
//! - While the object's destructor runs the block holds one extra weak
//!   reference, so a destructor that drops weak handles to its own block
//!   cannot free the storage under the ongoing release. `weak_count()`
//!   observed from inside that destructor includes it.
//!
//! Aliasing
//! - Handles store `NonNull<BlockHeader>` and a separate access pointer, so
//!   `SharedPtr::map` can hand out a `SharedPtr<U>` to a field that keeps
//!   the enclosing object alive.
//! - Aliased handles never hand out `&mut`: `get_mut` only applies to a
//!   handle that points at its block's own object.
//!
//! Constraints
//! - Single-threaded: `!Send`/`!Sync` (raw pointers, plain `Cell` counters).
//! - Reference cycles among strong handles leak; nothing detects them.
//! - Only the global allocator is used.
//!
//! Overflow semantics
//! - Counter overflow aborts the process, matching `Rc`.
//!
//! Errors
//! - Promoting an expired weak handle via `upgrade`/`SharedPtr::from_weak`
//!   yields `ExpiredError`; `lock` returns an empty handle instead. All other
//!   misuse is a documented precondition of an `unsafe` function.

#[cfg(feature = "bench_internal")]
pub mod control_block;
#[cfg(not(feature = "bench_internal"))]
mod control_block;
mod error;
mod shared;
mod weak;

// Public surface
pub use control_block::{BlockKind, BlockState};
pub use error::ExpiredError;
pub use shared::SharedPtr;
pub use weak::WeakPtr;
