//! The Binary Registry and Partition Allocator.
//!
//! [`Registry`] is the in-memory table describing every known binary slot:
//! identity, sizes, dual-partition mapping, versions.  It is owned by the
//! manager main loop, which is the single writer; every other component
//! sees committed-state [`SlotSnapshot`]s only.
//!
//! Each slot is double-buffered across two equal-size flash partitions.
//! Exactly one is *active* (backs the running image); the other is the
//! *staging* target for the next update.  [`Registry::commit_update`]
//! performs the atomic cutover: the new slot record is persisted to the
//! metadata partition first, and only then does the in-memory slot flip.
//! A failed persist leaves the slot bit-for-bit unchanged.

mod registry;
mod slot;

pub use registry::Registry;
pub use slot::BinarySlot;
