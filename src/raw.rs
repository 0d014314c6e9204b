//! The chain engine: coalesced-chaining operations over a raw region.
//!
//! Every operation takes an `exclusive` flag. In the shared path the caller
//! holds the map lock shared and the engine guards individual slots with the
//! sliding slot locks; in the exclusive path the caller holds the map lock
//! exclusively and no slot locks are taken at all.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::Fault;
use crate::hash;
use crate::layout::{header, RegionLayout, UNDEFINED};
use crate::lock::{MapLock, SlotLocks};

/// A successful lookup: the slot holding the key and its predecessor in the
/// collision chain (`UNDEFINED` when the slot is the chain head).
///
/// In the shared path the slot lock on `pos` is still held when this is
/// returned; the caller decodes the value under that lock and releases it.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Found {
    pub pos: u32,
    pub previous: u32,
}

/// The engine: a base pointer plus the layout derived from the header.
pub(crate) struct RawMap {
    base: NonNull<u8>,
    layout: RegionLayout,
}

// SAFETY: all mutation of region state happens either under the exclusive
// map lock or under the shared map lock plus the affected slot's lock, and
// the remaining header word is only touched through atomics.
unsafe impl Send for RawMap {}
unsafe impl Sync for RawMap {}

impl RawMap {
    /// # Safety
    /// `base` must point to a readable, writable region of at least
    /// `layout.total_size` bytes, aligned to at least 4 bytes, that outlives
    /// the returned value.
    pub unsafe fn new(base: NonNull<u8>, layout: RegionLayout) -> Self {
        Self { base, layout }
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    pub fn base_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    fn at(&self, offset: usize) -> *mut u8 {
        // SAFETY: every offset handed in is below layout.total_size, which
        // the constructor contract puts inside the region.
        unsafe { self.base.as_ptr().add(offset) }
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: the layout keeps every word offset 4-byte aligned and the
        // constructor contract makes the region at least 4-byte aligned.
        unsafe { &*(self.at(offset) as *const AtomicU32) }
    }

    /// Writes the configuration words of a fresh region.
    pub fn write_header(&self) {
        self.word(header::CAPACITY)
            .store(self.layout.capacity, Ordering::Relaxed);
        self.word(header::KEY_UNITS)
            .store(self.layout.key_units, Ordering::Relaxed);
        self.word(header::VALUE_UNITS)
            .store(self.layout.value_units, Ordering::Relaxed);
        self.word(header::LENGTH).store(0, Ordering::Release);
    }

    fn len_word(&self) -> &AtomicU32 {
        self.word(header::LENGTH)
    }

    /// Current entry count. Readable without any lock; may trail concurrent
    /// mutation by one.
    pub fn len(&self) -> u32 {
        self.len_word().load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> u32 {
        self.layout.capacity
    }

    pub fn map_lock(&self) -> &MapLock {
        // SAFETY: the map-lock triple is three 4-byte-aligned u32 words and
        // MapLock is repr(C) over exactly that.
        unsafe { &*(self.at(self.layout.map_lock_offset) as *const MapLock) }
    }

    pub fn slot_locks(&self) -> SlotLocks<'_> {
        // SAFETY: the bitmap sub-region is bitmap_words() aligned u32 words.
        let words = unsafe {
            std::slice::from_raw_parts(
                self.at(self.layout.bitmap_offset) as *const AtomicU32,
                self.layout.bitmap_words(),
            )
        };
        SlotLocks::new(words)
    }

    pub fn chain(&self, slot: u32) -> &AtomicU32 {
        self.word(self.layout.chain_offset + 4 * slot as usize)
    }

    // -- Cells --------------------------------------------------------------
    //
    // Key and value cells are plain u16 storage: every access happens under
    // the slot's lock or the exclusive map lock, and the lock words carry
    // the release/acquire edges.

    fn key_cell(&self, slot: u32) -> *mut u16 {
        self.at(self.layout.keys_offset + 2 * self.layout.key_units as usize * slot as usize)
            as *mut u16
    }

    fn value_cell(&self, slot: u32) -> *mut u16 {
        self.at(self.layout.values_offset + 2 * self.layout.value_units as usize * slot as usize)
            as *mut u16
    }

    pub fn is_occupied(&self, slot: u32) -> bool {
        unsafe { self.key_cell(slot).read() != 0 }
    }

    fn mark_free(&self, slot: u32) {
        unsafe { self.key_cell(slot).write(0) }
    }

    /// Compares the key cell of `slot` against `units`.
    fn key_eq(&self, slot: u32, units: &[u16]) -> bool {
        let cell = self.key_cell(slot);
        let max = self.layout.key_units as usize;
        unsafe {
            for (i, &unit) in units.iter().enumerate() {
                if cell.add(i).read() != unit {
                    return false;
                }
            }
            // Equal iff the stored key ends exactly where `units` does.
            units.len() == max || cell.add(units.len()).read() == 0
        }
    }

    unsafe fn read_cell(cell: *const u16, max: usize) -> Vec<u16> {
        let mut units = Vec::with_capacity(max);
        for i in 0..max {
            let unit = cell.add(i).read();
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        units
    }

    unsafe fn write_cell(cell: *mut u16, units: &[u16], max: usize) {
        ptr::copy_nonoverlapping(units.as_ptr(), cell, units.len());
        if units.len() < max {
            cell.add(units.len()).write(0);
        }
    }

    pub fn read_key_units(&self, slot: u32) -> Vec<u16> {
        unsafe { Self::read_cell(self.key_cell(slot), self.layout.key_units as usize) }
    }

    pub fn read_value_units(&self, slot: u32) -> Vec<u16> {
        unsafe { Self::read_cell(self.value_cell(slot), self.layout.value_units as usize) }
    }

    pub fn read_key(&self, slot: u32) -> String {
        String::from_utf16_lossy(&self.read_key_units(slot))
    }

    pub fn read_value(&self, slot: u32) -> String {
        String::from_utf16_lossy(&self.read_value_units(slot))
    }

    fn write_value(&self, slot: u32, units: &[u16]) {
        unsafe { Self::write_cell(self.value_cell(slot), units, self.layout.value_units as usize) }
    }

    fn write_entry(&self, slot: u32, key: &[u16], value: &[u16]) {
        self.write_value(slot, value);
        // The key cell is written last: its first unit is the occupancy flag.
        unsafe { Self::write_cell(self.key_cell(slot), key, self.layout.key_units as usize) }
    }

    // -- Engine operations --------------------------------------------------

    /// Inserts or replaces an entry.
    ///
    /// Walks the collision chain from the key's natural slot; a key match
    /// overwrites the value in place. At the chain tail the walk diverges
    /// into linear probing for a free slot, keeping the tail locked so the
    /// new slot can be linked onto it. In the shared path the traversal lock
    /// slides strictly forward in slot index; any step that cannot reports
    /// [`Fault::Deadlock`] with every held slot lock released.
    pub fn set(&self, key: &[u16], value: &[u16], hash: u32, exclusive: bool) -> Result<(), Fault> {
        let cap = self.layout.capacity;
        let locks = self.slot_locks();
        let mut pos = hash % cap;
        if !exclusive {
            locks.acquire(pos);
        }
        let mut to_chain = None;

        while self.is_occupied(pos) {
            if self.key_eq(pos, key) {
                self.write_value(pos, value);
                if !exclusive {
                    locks.release(pos);
                    if let Some(tail) = to_chain {
                        locks.release(tail);
                    }
                }
                return Ok(());
            }

            if to_chain.is_none() {
                let next = self.chain(pos).load(Ordering::Acquire);
                if next != UNDEFINED {
                    // Still on the primary chain; follow it.
                    if !exclusive {
                        if let Err(fault) = locks.slide(pos, next) {
                            locks.release(pos);
                            return Err(fault);
                        }
                    }
                    pos = next;
                    continue;
                }

                // Chain tail reached without a match: the key is absent, so
                // a full map cannot take it, and probing a full map would
                // never terminate.
                if self.len() == cap {
                    if !exclusive {
                        locks.release(pos);
                    }
                    return Err(Fault::CapacityExceeded);
                }

                // Pin the tail; it gets the chain link to the claimed slot.
                to_chain = Some(pos);
                let probe = (pos + 1) % cap;
                if !exclusive {
                    if probe <= pos {
                        locks.release(pos);
                        return Err(Fault::Deadlock);
                    }
                    locks.acquire(probe);
                }
                pos = probe;
            } else {
                let probe = (pos + 1) % cap;
                if !exclusive {
                    if let Err(fault) = locks.slide(pos, probe) {
                        locks.release(pos);
                        if let Some(tail) = to_chain {
                            locks.release(tail);
                        }
                        return Err(fault);
                    }
                }
                pos = probe;
            }
        }

        // `pos` is free and, in the shared path, locked by us.
        if self.len() == cap {
            if !exclusive {
                locks.release(pos);
                if let Some(tail) = to_chain {
                    locks.release(tail);
                }
            }
            return Err(Fault::CapacityExceeded);
        }

        self.write_entry(pos, key, value);
        self.chain(pos).store(UNDEFINED, Ordering::Release);
        self.len_word().fetch_add(1, Ordering::AcqRel);
        if let Some(tail) = to_chain {
            self.chain(tail).store(pos, Ordering::Release);
        }
        if !exclusive {
            locks.release(pos);
            if let Some(tail) = to_chain {
                locks.release(tail);
            }
        }
        Ok(())
    }

    /// Walks the primary chain for `key`.
    ///
    /// Unlike [`set`](Self::set) this never leaves the chain: reaching the
    /// tail without a match means the key is absent. Chain links may point
    /// backwards in slot index, in which case the shared path reports
    /// [`Fault::Deadlock`] and the caller retries exclusively.
    pub fn find(&self, key: &[u16], hash: u32, exclusive: bool) -> Result<Option<Found>, Fault> {
        let cap = self.layout.capacity;
        let locks = self.slot_locks();
        let mut pos = hash % cap;
        if !exclusive {
            locks.acquire(pos);
        }
        let mut previous = UNDEFINED;

        loop {
            if !self.is_occupied(pos) {
                break;
            }
            if self.key_eq(pos, key) {
                // Hand-off: the caller releases the lock on `pos` once it
                // has decoded the value.
                return Ok(Some(Found { pos, previous }));
            }
            let next = self.chain(pos).load(Ordering::Acquire);
            if next == UNDEFINED {
                break;
            }
            if !exclusive {
                if let Err(fault) = locks.slide(pos, next) {
                    locks.release(pos);
                    return Err(fault);
                }
            }
            previous = pos;
            pos = next;
        }

        if !exclusive {
            locks.release(pos);
        }
        Ok(None)
    }

    /// Removes an entry and re-places the displaced tail of its chain.
    ///
    /// Requires the exclusive map lock. Coalesced chains place successors in
    /// arbitrary free slots, so unlinking alone would orphan any successor
    /// whose natural slot differs from the removed one: the tail is emptied
    /// and each entry reinserted from scratch.
    pub fn remove(&self, key: &[u16], hash: u32) -> Result<(), Fault> {
        let found = match self.find(key, hash, true)? {
            Some(found) => found,
            None => return Err(Fault::KeyNotFound),
        };

        let next = self.chain(found.pos).load(Ordering::Acquire);
        self.mark_free(found.pos);
        if found.previous != UNDEFINED {
            self.chain(found.previous)
                .store(UNDEFINED, Ordering::Release);
        }
        self.len_word().fetch_sub(1, Ordering::AcqRel);

        if next == UNDEFINED {
            return Ok(());
        }

        // Rechain: collect the tail in chain order, free it, reinsert.
        // Occupancy only shrinks before the reinsertions, so they cannot
        // hit the capacity limit.
        let mut displaced = Vec::new();
        let mut pos = next;
        while pos != UNDEFINED {
            displaced.push((self.read_key_units(pos), self.read_value_units(pos)));
            self.mark_free(pos);
            self.len_word().fetch_sub(1, Ordering::AcqRel);
            pos = self.chain(pos).load(Ordering::Acquire);
        }
        for (key, value) in &displaced {
            self.set(key, value, hash::hash_units(key), true)?;
        }
        Ok(())
    }

    /// Empties the map. Requires the exclusive map lock.
    ///
    /// Chain words are left as they are; they only carry meaning for
    /// occupied slots.
    pub fn clear(&self) {
        let cap = self.layout.capacity as usize;
        unsafe {
            ptr::write_bytes(
                self.at(self.layout.keys_offset),
                0,
                2 * self.layout.key_units as usize * cap,
            );
            ptr::write_bytes(
                self.at(self.layout.values_offset),
                0,
                2 * self.layout.value_units as usize * cap,
            );
        }
        self.len_word().store(0, Ordering::Release);
    }
}

#[cfg(test)]
impl RawMap {
    /// Walks the whole region and asserts the structural invariants. Only
    /// sound against a quiescent map built through the default-hash API.
    pub fn check_invariants(&self) {
        let cap = self.layout.capacity;
        let occupied: Vec<u32> = (0..cap).filter(|&i| self.is_occupied(i)).collect();

        // Entry count matches occupancy.
        assert_eq!(
            occupied.len() as u32,
            self.len(),
            "length != occupied slots"
        );

        let mut seen_keys = std::collections::BTreeSet::new();
        for &slot in &occupied {
            let key = self.read_key_units(slot);

            // No two occupied slots hold equal keys.
            assert!(seen_keys.insert(key.clone()), "duplicate key in slots");

            // The slot is reachable from its key's natural slot, within a
            // bounded number of acyclic chain steps.
            let mut pos = hash::hash_units(&key) % cap;
            let mut steps = 0;
            loop {
                assert!(self.is_occupied(pos), "chain passes through a free slot");
                if pos == slot {
                    break;
                }
                pos = self.chain(pos).load(Ordering::Acquire);
                assert_ne!(pos, UNDEFINED, "slot not reachable from its chain head");
                steps += 1;
                assert!(steps <= occupied.len(), "cycle in chain");
            }
        }
    }
}
