//! On-disk record format for spilled display-list data.
//!
//! Every record is a fixed 12-byte little-endian header followed by a bincode
//! body:
//!
//! | bytes  | field    | meaning                                         |
//! |--------|----------|-------------------------------------------------|
//! | 0      | kind     | [`RecordKind`]                                  |
//! | 1..4   | reserved | zero                                            |
//! | 4..8   | count    | objects in the record (1 for payload records)   |
//! | 8..12  | len      | body length in bytes                            |
//!
//! The format is private to one page's scratch file and is never read by
//! another build, so it carries no version.

use bincode::Options;
use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, SpillError};

pub const RECORD_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    FillPayload = 1,
    GouraudPayload = 2,
    Aggregate = 3,
}

impl RecordKind {
    fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(RecordKind::FillPayload),
            2 => Some(RecordKind::GouraudPayload),
            3 => Some(RecordKind::Aggregate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: RecordKind,
    pub count: u32,
    pub len: u32,
}

impl RecordHeader {
    pub fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let mut bytes = [0u8; RECORD_HEADER_LEN];
        bytes[0] = self.kind as u8;
        LittleEndian::write_u32(&mut bytes[4..8], self.count);
        LittleEndian::write_u32(&mut bytes[8..12], self.len);
        bytes
    }

    pub fn decode(bytes: &[u8], offset: u64) -> Result<Self> {
        if bytes.len() < RECORD_HEADER_LEN {
            return Err(SpillError::CorruptRecord {
                offset,
                reason: "truncated record header",
            });
        }
        let kind = RecordKind::from_u8(bytes[0]).ok_or(SpillError::CorruptRecord {
            offset,
            reason: "unknown record kind",
        })?;
        if bytes[1..4] != [0, 0, 0] {
            return Err(SpillError::CorruptRecord {
                offset,
                reason: "reserved header bytes are set",
            });
        }
        Ok(Self {
            kind,
            count: LittleEndian::read_u32(&bytes[4..8]),
            len: LittleEndian::read_u32(&bytes[8..12]),
        })
    }

    /// Checks the header against what the caller's container says is there.
    pub fn expect(
        &self,
        offset: u64,
        kind: RecordKind,
        count: u32,
        len: Option<u32>,
    ) -> Result<()> {
        if self.kind != kind {
            return Err(SpillError::CorruptRecord {
                offset,
                reason: "record kind mismatch",
            });
        }
        if self.count != count {
            return Err(SpillError::CorruptRecord {
                offset,
                reason: "record object count mismatch",
            });
        }
        if len.is_some_and(|len| len != self.len) {
            return Err(SpillError::CorruptRecord {
                offset,
                reason: "record length mismatch",
            });
        }
        Ok(())
    }

    pub fn total_len(&self) -> u64 {
        RECORD_HEADER_LEN as u64 + u64::from(self.len)
    }
}

fn bincode_options() -> impl bincode::Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

pub(crate) fn body_len<T: Serialize + ?Sized>(value: &T) -> Result<u64> {
    Ok(bincode_options().serialized_size(value)?)
}

pub(crate) fn encode_body<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode_options().serialize(value)?)
}

pub(crate) fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    // A body can never describe more data than it contains.
    Ok(bincode_options()
        .with_limit(bytes.len() as u64)
        .deserialize(bytes)?)
}
