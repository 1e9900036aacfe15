#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Placement-group identifier: a pool plus a shard seed within that pool.
///
/// Ordering is `(pool, seed)` lexicographic, which is what the session and
/// placement-group registries key their maps on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PgId {
    pub pool: u64,
    pub seed: u32,
}

impl PgId {
    #[must_use]
    pub fn new(pool: u64, seed: u32) -> Self {
        Self { pool, seed }
    }
}

impl fmt::Display for PgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:x}", self.pool, self.seed)
    }
}

/// Snapshot component of an object identifier.
///
/// `SnapId::HEAD` is the writable head version; every other value names a
/// read-only snapshot of the same base object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapId(pub u64);

impl SnapId {
    pub const HEAD: Self = Self(u64::MAX);

    #[must_use]
    pub fn is_head(self) -> bool {
        self == Self::HEAD
    }
}

impl fmt::Display for SnapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_head() {
            write!(f, "head")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Full object identifier: pool, name, and snapshot.
///
/// The empty name is reserved: `ObjectId::empty()` is the wire placeholder
/// carried by pg-scoped backoff messages, which have no object component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    pub pool: u64,
    pub name: String,
    pub snapshot: SnapId,
}

impl ObjectId {
    #[must_use]
    pub fn new(pool: u64, name: impl Into<String>, snapshot: SnapId) -> Self {
        Self {
            pool,
            name: name.into(),
            snapshot,
        }
    }

    /// The head version of a named object.
    #[must_use]
    pub fn head(pool: u64, name: impl Into<String>) -> Self {
        Self::new(pool, name, SnapId::HEAD)
    }

    /// The wire placeholder for messages with no object component.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(0, "", SnapId::HEAD)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    /// The snapshot-ignoring registry key for this object.
    ///
    /// All snapshots of the same base object map to the same key, so a
    /// throttle installed against any one of them covers them all.
    #[must_use]
    pub fn base(&self) -> ObjectKey {
        ObjectKey {
            pool: self.pool,
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}:{}@{}", self.pool, self.name, self.snapshot)
        }
    }
}

/// Structural map key for object-scoped registry entries.
///
/// This is an `ObjectId` with the snapshot component stripped; ordering is
/// purely `(pool, name)`. Registries must key on this, never on the full
/// `ObjectId`, so that snapshot reads and head writes share one entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub pool: u64,
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pool, self.name)
    }
}

/// Client request identifier (tid), unique per client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tid(pub u64);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cluster topology epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Epoch(pub u32);

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
    #[error("trailing bytes after message: {remaining} unconsumed")]
    TrailingBytes { remaining: usize },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    let bytes = ensure_slice(data, offset, 1)?;
    Ok(bytes[0])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

/// Narrow a `u32` length prefix to `usize` with an explicit error path.
pub fn u32_to_usize(value: u32, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}
