use std::fmt;

/// Errors returned by map construction and map operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MapError {
    /// A construction parameter was zero, or the computed region layout
    /// does not fit in the address space.
    BadConfig,
    /// Keys must contain at least one UTF-16 code unit.
    EmptyKey,
    /// The key does not fit in the configured per-slot key storage.
    KeyTooLong { len: usize, max: usize },
    /// The value does not fit in the configured per-slot value storage.
    ValueTooLong { len: usize, max: usize },
    /// Keys and values cannot contain U+0000; the zero unit terminates a cell.
    EmbeddedNul,
    /// The map is full and the key is not already present.
    CapacityExceeded,
    /// The key is not in the map.
    KeyNotFound,
    /// The caller-provided region is smaller than the layout requires.
    RegionTooSmall { required: usize, provided: usize },
    /// The caller-provided region is not aligned for the atomic words it must hold.
    MisalignedRegion,
    /// The region header does not describe a valid map.
    BadHeader,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::BadConfig => {
                write!(f, "capacity, key units and value units must be positive")
            }
            MapError::EmptyKey => write!(f, "keys must not be empty"),
            MapError::KeyTooLong { len, max } => {
                write!(f, "key is {} code units, slot holds {}", len, max)
            }
            MapError::ValueTooLong { len, max } => {
                write!(f, "value is {} code units, slot holds {}", len, max)
            }
            MapError::EmbeddedNul => write!(f, "keys and values must not contain U+0000"),
            MapError::CapacityExceeded => write!(f, "map is at capacity"),
            MapError::KeyNotFound => write!(f, "key not found"),
            MapError::RegionTooSmall { required, provided } => {
                write!(f, "region holds {} bytes, layout needs {}", provided, required)
            }
            MapError::MisalignedRegion => {
                write!(f, "region must be 4-byte aligned")
            }
            MapError::BadHeader => write!(f, "region header does not describe a valid map"),
        }
    }
}

impl std::error::Error for MapError {}

/// Failure of an engine traversal, reported to the operation envelope.
///
/// `Deadlock` is the sliding-lock signal; it never escapes the public API
/// because the envelope retries the operation under the exclusive map lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Fault {
    Deadlock,
    CapacityExceeded,
    KeyNotFound,
}

impl From<Fault> for MapError {
    fn from(fault: Fault) -> MapError {
        match fault {
            Fault::CapacityExceeded => MapError::CapacityExceeded,
            Fault::KeyNotFound => MapError::KeyNotFound,
            // The exclusive path takes no slot locks, so it cannot raise the
            // deadlock signal, and only exclusive results are converted.
            Fault::Deadlock => unreachable!("deadlock signal escaped the retry envelope"),
        }
    }
}
