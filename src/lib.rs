//! A fixed-capacity concurrent map from strings to strings in which every
//! byte of state, entries and collision chains and lock words alike, lives
//! in one contiguous memory region.
//!
//! Threads of one process share a [`SharedMap`] through `Arc`; cooperating
//! processes map the same memory region and each [`attach`](SharedMap::attach)
//! a handle to it. The region layout is fully determined by the three
//! construction parameters stored in its header, so a peer needs nothing
//! but the region itself to join.
//!
//! Collisions are resolved by coalesced chaining: successors live in
//! arbitrary free slots, linked through a dense index array. Readers and
//! writers coordinate through a map-wide readers/writer lock plus per-slot
//! locks that slide forward along a traversal; a traversal that would have
//! to lock backwards retries under the exclusive map lock instead.

#![deny(rust_2018_idioms, clippy::all)]

mod error;
mod hash;
mod layout;
mod lock;
mod map;
mod raw;

#[cfg(test)]
mod proptests;

pub use error::MapError;
pub use hash::{hash_key, hash_units};
pub use map::{Iter, Keys, SharedMap, Values};
