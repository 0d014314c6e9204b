use std::alloc;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use lock_api::RawRwLock;

use crate::error::{Fault, MapError};
use crate::hash;
use crate::layout::{header, RegionLayout, HEADER_SIZE, REGION_ALIGN, WORD_ALIGN};
use crate::raw::RawMap;

/// How the handle relates to the region it operates on.
enum Region {
    /// The handle allocated the region and frees it on drop.
    Owned { size: usize },
    /// The region belongs to the caller (typically a shared mapping).
    External,
}

/// A fixed-capacity concurrent map from strings to strings.
///
/// All state, including every lock word, lives in one contiguous memory
/// region laid out by three construction parameters:
/// `capacity` (slot count), `key_units` and `value_units` (per-slot storage
/// in UTF-16 code units). Nothing is allocated in the region after
/// construction and the map never grows.
///
/// Threads of one process share a map through `Arc`; cooperating processes
/// map the same memory and each build a handle with [`attach`](Self::attach).
///
/// # Examples
///
/// ```
/// use shared_map::SharedMap;
///
/// let map = SharedMap::new(64, 16, 16).unwrap();
/// map.set("a", "1").unwrap();
/// map.set("b", "2").unwrap();
///
/// assert_eq!(map.get("a"), Some("1".to_string()));
/// assert_eq!(map.get("c"), None);
/// assert_eq!(map.len(), 2);
/// ```
pub struct SharedMap {
    raw: RawMap,
    region: Region,
    // Handle-local count of deadlock-signal retries under the exclusive
    // map lock. Diagnostic only; not part of the shared region.
    escalations: AtomicUsize,
}

// SAFETY: RawMap is Send + Sync (all shared state is lock-protected or
// atomic) and the escalation counter is an atomic.
unsafe impl Send for SharedMap {}
unsafe impl Sync for SharedMap {}

impl SharedMap {
    /// Creates a map in a region allocated and owned by the handle.
    ///
    /// `capacity` is rounded up to a multiple of 4 and the unit counts to a
    /// multiple of 2. Any zero parameter is rejected.
    ///
    /// # Examples
    ///
    /// ```
    /// use shared_map::{MapError, SharedMap};
    ///
    /// let map = SharedMap::new(100, 8, 8).unwrap();
    /// assert_eq!(map.capacity(), 100);
    /// assert_eq!(SharedMap::new(0, 8, 8).unwrap_err(), MapError::BadConfig);
    /// ```
    pub fn new(capacity: u32, key_units: u32, value_units: u32) -> Result<Self, MapError> {
        let layout = RegionLayout::new(capacity, key_units, value_units)?;
        let alloc_layout = alloc::Layout::from_size_align(layout.total_size, REGION_ALIGN)
            .map_err(|_| MapError::BadConfig)?;

        let base = unsafe { alloc::alloc_zeroed(alloc_layout) };
        if base.is_null() {
            alloc::handle_alloc_error(alloc_layout);
        }
        // SAFETY: just allocated with layout.total_size bytes at alignment
        // REGION_ALIGN and checked non-null.
        let raw = unsafe { RawMap::new(NonNull::new_unchecked(base), layout) };
        raw.write_header();

        Ok(Self {
            raw,
            region: Region::Owned {
                size: layout.total_size,
            },
            escalations: AtomicUsize::new(0),
        })
    }

    /// Creates a map in a caller-provided region, typically a shared
    /// mapping visible to other processes.
    ///
    /// The region is zeroed up to the layout size and the header written,
    /// destroying whatever it held. Peers then join with
    /// [`attach`](Self::attach).
    ///
    /// # Safety
    ///
    /// - `region` must be valid for reads and writes, at least 4-byte
    ///   aligned, and stay mapped for the lifetime of the returned handle.
    /// - No other worker may be using the region while it is initialized.
    ///
    /// The caller keeps ownership of the mapping and unmaps it after all
    /// handles are gone.
    pub unsafe fn init_in(
        region: NonNull<[u8]>,
        capacity: u32,
        key_units: u32,
        value_units: u32,
    ) -> Result<Self, MapError> {
        let layout = RegionLayout::new(capacity, key_units, value_units)?;
        let base = Self::region_base(region, layout.total_size)?;

        ptr::write_bytes(base.as_ptr(), 0, layout.total_size);
        let raw = RawMap::new(base, layout);
        raw.write_header();

        Ok(Self {
            raw,
            region: Region::External,
            escalations: AtomicUsize::new(0),
        })
    }

    /// Joins a map that already lives in `region`, reconstructing the
    /// layout from the header words.
    ///
    /// # Safety
    ///
    /// - `region` must be valid for reads and writes, at least 4-byte
    ///   aligned, and stay mapped for the lifetime of the returned handle.
    /// - The region must have been initialized by [`new`](Self::new) or
    ///   [`init_in`](Self::init_in) (possibly by another process).
    pub unsafe fn attach(region: NonNull<[u8]>) -> Result<Self, MapError> {
        if region.len() < HEADER_SIZE {
            return Err(MapError::RegionTooSmall {
                required: HEADER_SIZE,
                provided: region.len(),
            });
        }
        let base = Self::region_base(region, HEADER_SIZE)?;

        let word = |offset: usize| -> u32 {
            // Relaxed is enough: configuration words never change after the
            // region is initialized.
            unsafe {
                (*(base.as_ptr().add(offset) as *const std::sync::atomic::AtomicU32))
                    .load(Ordering::Relaxed)
            }
        };
        let capacity = word(header::CAPACITY);
        let key_units = word(header::KEY_UNITS);
        let value_units = word(header::VALUE_UNITS);

        if capacity == 0
            || key_units == 0
            || value_units == 0
            || capacity % 4 != 0
            || key_units % 2 != 0
            || value_units % 2 != 0
        {
            return Err(MapError::BadHeader);
        }

        // Already-rounded parameters reproduce themselves, so the layout the
        // initializer computed is reconstructed exactly.
        let layout = RegionLayout::new(capacity, key_units, value_units)?;
        if region.len() < layout.total_size {
            return Err(MapError::RegionTooSmall {
                required: layout.total_size,
                provided: region.len(),
            });
        }

        Ok(Self {
            raw: RawMap::new(base, layout),
            region: Region::External,
            escalations: AtomicUsize::new(0),
        })
    }

    fn region_base(region: NonNull<[u8]>, required: usize) -> Result<NonNull<u8>, MapError> {
        let base = region.as_ptr() as *mut u8;
        if base as usize % WORD_ALIGN != 0 {
            return Err(MapError::MisalignedRegion);
        }
        if region.len() < required {
            return Err(MapError::RegionTooSmall {
                required,
                provided: region.len(),
            });
        }
        // SAFETY: NonNull<[u8]> guarantees a non-null data pointer.
        Ok(unsafe { NonNull::new_unchecked(base) })
    }

    /// Bytes a region must provide for the given parameters, after rounding.
    ///
    /// Lets a coordinator size a shared mapping before any map exists.
    pub fn region_size_for(
        capacity: u32,
        key_units: u32,
        value_units: u32,
    ) -> Result<usize, MapError> {
        RegionLayout::new(capacity, key_units, value_units).map(|layout| layout.total_size)
    }

    /// Size in bytes of this map's region.
    pub fn region_size(&self) -> usize {
        self.raw.layout().total_size
    }

    /// Number of slots.
    pub fn capacity(&self) -> u32 {
        self.raw.capacity()
    }

    /// Per-slot key storage in UTF-16 code units.
    pub fn key_units(&self) -> u32 {
        self.raw.layout().key_units
    }

    /// Per-slot value storage in UTF-16 code units.
    pub fn value_units(&self) -> u32 {
        self.raw.layout().value_units
    }

    /// Current entry count.
    ///
    /// Read without taking any lock: while other workers mutate the map the
    /// value may trail the true occupancy by one in either direction.
    pub fn len(&self) -> usize {
        self.raw.len() as usize
    }

    /// Returns `true` if the map contains no entries (same caveat as
    /// [`len`](Self::len)).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of times this handle recovered from the deadlock signal by
    /// retrying under the exclusive map lock.
    pub fn escalations(&self) -> usize {
        self.escalations.load(Ordering::Relaxed)
    }

    // -- Validation ---------------------------------------------------------

    fn encode_key(&self, key: &str) -> Result<Vec<u16>, MapError> {
        if key.is_empty() {
            return Err(MapError::EmptyKey);
        }
        let units: Vec<u16> = key.encode_utf16().collect();
        let max = self.raw.layout().key_units as usize;
        if units.len() > max {
            return Err(MapError::KeyTooLong {
                len: units.len(),
                max,
            });
        }
        if units.contains(&0) {
            return Err(MapError::EmbeddedNul);
        }
        Ok(units)
    }

    fn encode_value(&self, value: &str) -> Result<Vec<u16>, MapError> {
        let units: Vec<u16> = value.encode_utf16().collect();
        let max = self.raw.layout().value_units as usize;
        if units.len() > max {
            return Err(MapError::ValueTooLong {
                len: units.len(),
                max,
            });
        }
        if units.contains(&0) {
            return Err(MapError::EmbeddedNul);
        }
        Ok(units)
    }

    // -- Operations ---------------------------------------------------------

    /// Inserts a key-value pair, replacing the value if the key is present.
    ///
    /// Fails with [`MapError::CapacityExceeded`] when the map is full and
    /// the key is new; replacing an existing key always succeeds.
    ///
    /// # Examples
    ///
    /// ```
    /// use shared_map::SharedMap;
    ///
    /// let map = SharedMap::new(16, 8, 8).unwrap();
    /// map.set("k", "v1").unwrap();
    /// map.set("k", "v2").unwrap();
    /// assert_eq!(map.get("k"), Some("v2".to_string()));
    /// assert_eq!(map.len(), 1);
    /// ```
    pub fn set(&self, key: &str, value: &str) -> Result<(), MapError> {
        let key = self.encode_key(key)?;
        let value = self.encode_value(value)?;
        let hash = hash::hash_units(&key);
        self.set_units(&key, &value, hash)
    }

    /// [`set`](Self::set) with a caller-supplied hash instead of the
    /// built-in one.
    ///
    /// Every operation on the same key must then use the same hash,
    /// including the delete. After a delete rechains displaced entries,
    /// those entries are re-placed under the built-in hash.
    pub fn set_hashed(&self, key: &str, value: &str, hash: u32) -> Result<(), MapError> {
        let key = self.encode_key(key)?;
        let value = self.encode_value(value)?;
        self.set_units(&key, &value, hash)
    }

    fn set_units(&self, key: &[u16], value: &[u16], hash: u32) -> Result<(), MapError> {
        let map_lock = self.raw.map_lock();
        map_lock.lock_shared();
        match self.raw.set(key, value, hash, false) {
            Ok(()) => {
                unsafe { map_lock.unlock_shared() };
                Ok(())
            }
            Err(Fault::Deadlock) => {
                unsafe { map_lock.unlock_shared() };
                self.run_escalated(|| self.raw.set(key, value, hash, true))
                    .map_err(MapError::from)
            }
            Err(fault) => {
                unsafe { map_lock.unlock_shared() };
                Err(MapError::from(fault))
            }
        }
    }

    /// Returns the value stored under `key`, or `None` if absent.
    ///
    /// Keys that could never have been stored (empty, oversized, containing
    /// U+0000) are reported absent.
    pub fn get(&self, key: &str) -> Option<String> {
        let key = self.encode_key(key).ok()?;
        let hash = hash::hash_units(&key);
        self.get_units(&key, hash)
    }

    /// [`get`](Self::get) with a caller-supplied hash.
    pub fn get_hashed(&self, key: &str, hash: u32) -> Option<String> {
        let key = self.encode_key(key).ok()?;
        self.get_units(&key, hash)
    }

    fn get_units(&self, key: &[u16], hash: u32) -> Option<String> {
        let map_lock = self.raw.map_lock();
        map_lock.lock_shared();
        match self.raw.find(key, hash, false) {
            Ok(Some(found)) => {
                // The find hand-off: the slot lock is still ours, keeping
                // the value cell stable while it is decoded.
                let value = self.raw.read_value(found.pos);
                self.raw.slot_locks().release(found.pos);
                unsafe { map_lock.unlock_shared() };
                Some(value)
            }
            Ok(None) => {
                unsafe { map_lock.unlock_shared() };
                None
            }
            Err(_) => {
                unsafe { map_lock.unlock_shared() };
                // The value is decoded while the exclusive lock is still
                // held, mirroring the hand-off of the shared path.
                self.run_escalated(|| {
                    let found = self.raw.find(key, hash, true)?;
                    Ok(found.map(|found| self.raw.read_value(found.pos)))
                })
                .ok()
                .flatten()
            }
        }
    }

    /// Returns `true` if `key` is in the map.
    pub fn contains_key(&self, key: &str) -> bool {
        let Ok(key) = self.encode_key(key) else {
            return false;
        };
        let hash = hash::hash_units(&key);
        self.contains_units(&key, hash)
    }

    /// [`contains_key`](Self::contains_key) with a caller-supplied hash.
    pub fn contains_key_hashed(&self, key: &str, hash: u32) -> bool {
        let Ok(key) = self.encode_key(key) else {
            return false;
        };
        self.contains_units(&key, hash)
    }

    fn contains_units(&self, key: &[u16], hash: u32) -> bool {
        let map_lock = self.raw.map_lock();
        map_lock.lock_shared();
        match self.raw.find(key, hash, false) {
            Ok(Some(found)) => {
                self.raw.slot_locks().release(found.pos);
                unsafe { map_lock.unlock_shared() };
                true
            }
            Ok(None) => {
                unsafe { map_lock.unlock_shared() };
                false
            }
            Err(_) => {
                unsafe { map_lock.unlock_shared() };
                self.run_escalated(|| self.raw.find(key, hash, true))
                    .map(|found| found.is_some())
                    .unwrap_or(false)
            }
        }
    }

    /// Removes `key`, failing with [`MapError::KeyNotFound`] if absent.
    ///
    /// Runs under the exclusive map lock. Removing a slot with collision
    /// successors re-places each of them, so surviving entries may move to
    /// different slots.
    pub fn remove(&self, key: &str) -> Result<(), MapError> {
        let key = self.encode_key(key)?;
        let hash = hash::hash_units(&key);
        self.remove_units(&key, hash)
    }

    /// [`remove`](Self::remove) with a caller-supplied hash; required for
    /// entries inserted through [`set_hashed`](Self::set_hashed).
    pub fn remove_hashed(&self, key: &str, hash: u32) -> Result<(), MapError> {
        let key = self.encode_key(key)?;
        self.remove_units(&key, hash)
    }

    fn remove_units(&self, key: &[u16], hash: u32) -> Result<(), MapError> {
        let map_lock = self.raw.map_lock();
        map_lock.lock_exclusive();
        let result = self.raw.remove(key, hash);
        unsafe { map_lock.unlock_exclusive() };
        result.map_err(MapError::from)
    }

    /// Removes every entry. Runs under the exclusive map lock.
    pub fn clear(&self) {
        let map_lock = self.raw.map_lock();
        map_lock.lock_exclusive();
        self.raw.clear();
        unsafe { map_lock.unlock_exclusive() };
    }

    /// Runs an engine operation under the exclusive map lock after the
    /// shared path raised the deadlock signal.
    fn run_escalated<T>(&self, op: impl FnOnce() -> Result<T, Fault>) -> Result<T, Fault> {
        let map_lock = self.raw.map_lock();
        map_lock.lock_exclusive();
        self.escalations.fetch_add(1, Ordering::Relaxed);
        let result = op();
        unsafe { map_lock.unlock_exclusive() };
        result
    }

    // -- Iteration ----------------------------------------------------------

    /// An iterator over the entries, in slot order.
    ///
    /// Each slot is observed under the shared map lock plus its slot lock,
    /// then released before the entry is yielded: every yielded entry was
    /// in the map at the moment its slot was visited, but a key mutated
    /// concurrently may appear in a stale position or not at all.
    pub fn iter(&self) -> Iter<'_> {
        Iter { map: self, slot: 0 }
    }

    /// An iterator over the keys, in slot order. Same snapshot semantics as
    /// [`iter`](Self::iter).
    ///
    /// # Examples
    ///
    /// ```
    /// use shared_map::SharedMap;
    ///
    /// let map = SharedMap::new(16, 8, 8).unwrap();
    /// map.set("a", "1").unwrap();
    /// map.set("b", "2").unwrap();
    ///
    /// let mut keys: Vec<String> = map.keys().collect();
    /// keys.sort();
    /// assert_eq!(keys, ["a", "b"]);
    /// ```
    pub fn keys(&self) -> Keys<'_> {
        Keys { iter: self.iter() }
    }

    /// An iterator over the values, in slot order. Same snapshot semantics
    /// as [`iter`](Self::iter).
    pub fn values(&self) -> Values<'_> {
        Values { iter: self.iter() }
    }

    #[cfg(test)]
    pub(crate) fn raw(&self) -> &RawMap {
        &self.raw
    }
}

impl Drop for SharedMap {
    fn drop(&mut self) {
        if let Region::Owned { size } = self.region {
            // SAFETY: allocated in `new` with exactly this size and align.
            unsafe {
                alloc::dealloc(
                    self.raw.base_ptr(),
                    alloc::Layout::from_size_align_unchecked(size, REGION_ALIGN),
                );
            }
        }
    }
}

impl fmt::Debug for SharedMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// An iterator over the entries of a [`SharedMap`].
///
/// Created by [`SharedMap::iter`]. See its documentation for the snapshot
/// semantics.
pub struct Iter<'a> {
    map: &'a SharedMap,
    slot: u32,
}

impl Iterator for Iter<'_> {
    type Item = (String, String);

    fn next(&mut self) -> Option<Self::Item> {
        let raw = &self.map.raw;
        let cap = raw.capacity();

        while self.slot < cap {
            let slot = self.slot;
            self.slot += 1;

            let map_lock = raw.map_lock();
            map_lock.lock_shared();
            raw.slot_locks().acquire(slot);
            let entry = if raw.is_occupied(slot) {
                Some((raw.read_key(slot), raw.read_value(slot)))
            } else {
                None
            };
            raw.slot_locks().release(slot);
            unsafe { map_lock.unlock_shared() };

            if let Some(entry) = entry {
                return Some(entry);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some((self.map.capacity() - self.slot.min(self.map.capacity())) as usize))
    }
}

/// An iterator over the keys of a [`SharedMap`].
///
/// Created by [`SharedMap::keys`].
pub struct Keys<'a> {
    iter: Iter<'a>,
}

impl Iterator for Keys<'_> {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next().map(|(key, _)| key)
    }
}

/// An iterator over the values of a [`SharedMap`].
///
/// Created by [`SharedMap::values`].
pub struct Values<'a> {
    iter: Iter<'a>,
}

impl Iterator for Values<'_> {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next().map(|(_, value)| value)
    }
}
