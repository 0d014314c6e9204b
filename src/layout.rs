//! Region layout arithmetic.
//!
//! A map is one contiguous byte region, statically partitioned into six
//! sub-regions whose sizes are fully determined by the three construction
//! parameters:
//!
//! ```text
//! +--------+------------+--------------+-------+-------------+----------+
//! | Header | Key cells  | Value cells  | Chain | Lock bitmap | Map lock |
//! +--------+------------+--------------+-------+-------------+----------+
//!   16 B     2*ku*cap     2*vu*cap       4*cap   4*ceil(c/32)   12 B
//! ```
//!
//! - **Header**: four u32 words: capacity, key units, value units, length.
//! - **Key cells**: `capacity` cells of `key_units` UTF-16 code units each.
//!   A slot is occupied iff the first unit of its key cell is non-zero; a
//!   string shorter than the cell is terminated by a zero unit.
//! - **Value cells**: same convention with `value_units`.
//! - **Chain**: one u32 per slot, the coalesced collision chain successor,
//!   or [`UNDEFINED`]. Only meaningful for occupied slots.
//! - **Lock bitmap**: bit `i % 32` of word `i / 32` is set while slot `i`
//!   is held.
//! - **Map lock**: the `SHARED` / `EXCLUSIVE` / `READERS` word triple.
//!
//! The header words plus this arithmetic are the portable format: a peer
//! worker attaching to an existing region reconstructs every offset from
//! the three configuration words alone.

use crate::error::MapError;

/// Chain sentinel: no successor.
pub(crate) const UNDEFINED: u32 = u32::MAX;

/// Size of the header sub-region in bytes.
pub(crate) const HEADER_SIZE: usize = 16;

/// Size of the map-lock triple in bytes.
pub(crate) const MAP_LOCK_SIZE: usize = 12;

/// Minimum alignment of any region: the region is addressed as u32 words.
pub(crate) const WORD_ALIGN: usize = 4;

/// Alignment used for regions the map allocates itself.
pub(crate) const REGION_ALIGN: usize = 64;

/// Byte offsets of the header words.
pub(crate) mod header {
    pub const CAPACITY: usize = 0;
    pub const KEY_UNITS: usize = 4;
    pub const VALUE_UNITS: usize = 8;
    pub const LENGTH: usize = 12;
}

const _: () = assert!(HEADER_SIZE % WORD_ALIGN == 0);
const _: () = assert!(header::LENGTH + 4 == HEADER_SIZE);

/// Validated construction parameters plus the derived sub-region offsets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RegionLayout {
    pub capacity: u32,
    pub key_units: u32,
    pub value_units: u32,
    pub keys_offset: usize,
    pub values_offset: usize,
    pub chain_offset: usize,
    pub bitmap_offset: usize,
    pub map_lock_offset: usize,
    pub total_size: usize,
}

impl RegionLayout {
    /// Validates and rounds the construction parameters, then computes the
    /// sub-region offsets.
    ///
    /// Capacity is rounded up to a multiple of 4 and the unit counts to a
    /// multiple of 2, so every sub-region starts on a 4-byte boundary.
    pub fn new(capacity: u32, key_units: u32, value_units: u32) -> Result<Self, MapError> {
        if capacity == 0 || key_units == 0 || value_units == 0 {
            return Err(MapError::BadConfig);
        }

        let capacity = round_up(capacity, 4).ok_or(MapError::BadConfig)?;
        let key_units = round_up(key_units, 2).ok_or(MapError::BadConfig)?;
        let value_units = round_up(value_units, 2).ok_or(MapError::BadConfig)?;

        // All sizes are computed in u64 and must fit the address space.
        let cap = u64::from(capacity);
        let keys_bytes = 2 * u64::from(key_units) * cap;
        let values_bytes = 2 * u64::from(value_units) * cap;
        let chain_bytes = 4 * cap;
        let bitmap_bytes = 4 * cap.div_ceil(32);

        let keys_offset = HEADER_SIZE as u64;
        let values_offset = keys_offset + keys_bytes;
        let chain_offset = values_offset + values_bytes;
        let bitmap_offset = chain_offset + chain_bytes;
        let map_lock_offset = bitmap_offset + bitmap_bytes;
        let total_size = map_lock_offset + MAP_LOCK_SIZE as u64;

        if usize::try_from(total_size).is_err() {
            return Err(MapError::BadConfig);
        }

        Ok(Self {
            capacity,
            key_units,
            value_units,
            keys_offset: keys_offset as usize,
            values_offset: values_offset as usize,
            chain_offset: chain_offset as usize,
            bitmap_offset: bitmap_offset as usize,
            map_lock_offset: map_lock_offset as usize,
            total_size: total_size as usize,
        })
    }

    /// Number of u32 words in the slot-lock bitmap.
    pub fn bitmap_words(&self) -> usize {
        self.capacity.div_ceil(32) as usize
    }
}

fn round_up(value: u32, to: u32) -> Option<u32> {
    value.checked_add(to - 1).map(|v| v / to * to)
}
