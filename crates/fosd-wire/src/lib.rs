#![forbid(unsafe_code)]
//! The backoff wire message.
//!
//! A point-to-point notification exchanged between a storage node and a
//! client: "hold back requests against this placement group (or this one
//! object) from tid `first_tid` attempt `first_attempt` onward", plus the
//! acknowledgement and release forms of the same instruction.
//!
//! The encoding is a fixed-order, field-by-field little-endian layout with
//! no optional or variant framing. The object-id field is always present on
//! the wire; pg-scoped messages carry [`ObjectId::empty()`] in that slot.

use fosd_types::{
    Epoch, ObjectId, ParseError, PgId, SnapId, Tid, ensure_slice, read_le_u32, read_le_u64,
    read_u8, u32_to_usize,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Backoff operation code.
///
/// The wire values are part of the protocol; both ends must agree on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BackoffOp {
    /// Server instructs the client to begin blocking.
    Block = 1,
    /// Client acknowledges that it is blocking.
    AckBlock = 2,
    /// Server releases the block.
    Unblock = 3,
}

impl BackoffOp {
    /// Wire name of the op, as printed in message summaries.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::AckBlock => "ack-block",
            Self::Unblock => "unblock",
        }
    }
}

impl TryFrom<u8> for BackoffOp {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, ParseError> {
        match value {
            1 => Ok(Self::Block),
            2 => Ok(Self::AckBlock),
            3 => Ok(Self::Unblock),
            _ => Err(ParseError::InvalidField {
                field: "op",
                reason: "unknown backoff op code",
            }),
        }
    }
}

impl fmt::Display for BackoffOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A serialized backoff notification.
///
/// Immutable once constructed. `first_tid`/`first_attempt` mark the first
/// request the client must hold back; earlier in-flight requests may still
/// complete. `osd_epoch` lets the client discard instructions that refer to
/// a topology view it has since superseded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffMessage {
    pub op: BackoffOp,
    pub pg_id: PgId,
    /// Meaningful only for object-scoped ops; [`ObjectId::empty()`] otherwise.
    pub object_id: ObjectId,
    pub first_tid: Tid,
    pub first_attempt: u32,
    pub osd_epoch: Epoch,
}

impl BackoffMessage {
    /// A pg-scoped message (empty object-id slot).
    #[must_use]
    pub fn for_pg(op: BackoffOp, pg_id: PgId, first_tid: Tid, first_attempt: u32, ep: Epoch) -> Self {
        Self {
            op,
            pg_id,
            object_id: ObjectId::empty(),
            first_tid,
            first_attempt,
            osd_epoch: ep,
        }
    }

    /// An object-scoped message.
    #[must_use]
    pub fn for_object(
        op: BackoffOp,
        pg_id: PgId,
        object_id: ObjectId,
        first_tid: Tid,
        first_attempt: u32,
        ep: Epoch,
    ) -> Self {
        Self {
            op,
            pg_id,
            object_id,
            first_tid,
            first_attempt,
            osd_epoch: ep,
        }
    }

    /// Serialize in the fixed wire order.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(49 + self.object_id.name.len());
        out.push(self.op as u8);
        out.extend_from_slice(&self.pg_id.pool.to_le_bytes());
        out.extend_from_slice(&self.pg_id.seed.to_le_bytes());
        out.extend_from_slice(&self.object_id.pool.to_le_bytes());
        let name = self.object_id.name.as_bytes();
        let name_len = u32::try_from(name.len()).expect("object name exceeds u32 length prefix");
        out.extend_from_slice(&name_len.to_le_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&self.object_id.snapshot.0.to_le_bytes());
        out.extend_from_slice(&self.first_tid.0.to_le_bytes());
        out.extend_from_slice(&self.first_attempt.to_le_bytes());
        out.extend_from_slice(&self.osd_epoch.0.to_le_bytes());
        out
    }

    /// Parse a message, consuming the whole buffer.
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        let op = BackoffOp::try_from(read_u8(data, 0)?)?;
        let pg_pool = read_le_u64(data, 1)?;
        let pg_seed = read_le_u32(data, 9)?;
        let obj_pool = read_le_u64(data, 13)?;
        let name_len = u32_to_usize(read_le_u32(data, 21)?, "object_name_len")?;
        let name_bytes = ensure_slice(data, 25, name_len)?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| ParseError::InvalidField {
                field: "object_name",
                reason: "not valid UTF-8",
            })?
            .to_owned();
        let mut offset = 25 + name_len;
        let snapshot = read_le_u64(data, offset)?;
        offset += 8;
        let first_tid = read_le_u64(data, offset)?;
        offset += 8;
        let first_attempt = read_le_u32(data, offset)?;
        offset += 4;
        let osd_epoch = read_le_u32(data, offset)?;
        offset += 4;
        if offset != data.len() {
            return Err(ParseError::TrailingBytes {
                remaining: data.len() - offset,
            });
        }

        Ok(Self {
            op,
            pg_id: PgId::new(pg_pool, pg_seed),
            object_id: ObjectId::new(obj_pool, name, SnapId(snapshot)),
            first_tid: Tid(first_tid),
            first_attempt,
            osd_epoch: Epoch(osd_epoch),
        })
    }
}

impl fmt::Display for BackoffMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "osd_backoff({} {} {} tid {} attempt {} epoch {})",
            self.op, self.pg_id, self.object_id, self.first_tid, self.first_attempt, self.osd_epoch,
        )
    }
}
