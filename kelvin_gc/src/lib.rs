//! # Kelvin GC
//!
//! The memory manager of the Kelvin VM: a cell-addressed heap with an
//! exact, compacting, stop-the-world garbage collector and a permanent
//! sub-heap for immortal metadata.
//!
//! ## Memory model
//!
//! The heap is a single array of 4-byte cells. Every object starts with
//! a one-cell header (`size | gc-kind | S | M`); a pointer is the cell
//! index of the first payload cell. The collected heap grows up from
//! the bottom of the array, the permanent sub-heap grows down from the
//! top in 2 KiB steps, and the two never overlap.
//!
//! ## Collection
//!
//! The collector is exact: it knows every pointer slot of every live
//! object. Object shapes it understands natively are described by
//! [`GcKind`] and the [`layout`] tables; the only shape it cannot scan
//! alone is a thread stack chunk, whose pointer slots depend on
//! per-method stack maps - the VM supplies those roots through
//! [`CollectorHooks`].
//!
//! Collection marks (depth-bounded, with a fixed deferred ring and a
//! guaranteed-progress whole-heap rescan on overflow), clears weak
//! referents, dissolves uncontended monitors, sweeps with coalescing,
//! and compacts with a break table only when the triggering request
//! still cannot be satisfied.
//!
//! ## Roots
//!
//! Code that allocates more than once in a row protects intermediate
//! values with the temporary-root discipline ([`TempRoots`] /
//! [`RootScope`]); roots are read back after every potential collection
//! point because compaction may move objects.

mod collector;
mod compact;
mod config;
mod error;
mod header;
mod heap;
mod hooks;
pub mod layout;
mod lock_word;
mod roots;

pub use compact::{BreakEntry, BreakTable};
pub use config::{Configuration, Statistics, DEFAULT_HEAP_CELLS, PERMANENT_GROWTH_CELLS};
pub use error::{Error, Result};
pub use header::{Cell, GcKind, Header, Ptr, MAX_OBJECT_CELLS};
pub use heap::{Heap, InstanceLayout};
pub use hooks::{CollectorHooks, MarkQueue, NoHooks};
pub use lock_word::LockWord;
pub use roots::{RootId, RootScope, TempRoot, TempRoots};
