use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::base::{BaseEntry, Id};
use crate::storage::table::Schema;

/// Kind of catalog change carried by a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LogEntryType {
    CreateTable = 1,
    DropTable = 2,
    CreateSegment = 3,
    UpgradeSegment = 4,
    DropSegment = 5,
    CreateBlock = 6,
    UpgradeBlock = 7,
    DropBlock = 8,
}

impl LogEntryType {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(val: u8) -> Result<Self> {
        match val {
            1 => Ok(LogEntryType::CreateTable),
            2 => Ok(LogEntryType::DropTable),
            3 => Ok(LogEntryType::CreateSegment),
            4 => Ok(LogEntryType::UpgradeSegment),
            5 => Ok(LogEntryType::DropSegment),
            6 => Ok(LogEntryType::CreateBlock),
            7 => Ok(LogEntryType::UpgradeBlock),
            8 => Ok(LogEntryType::DropBlock),
            _ => Err(Error::invariant(format!("unknown log entry type: {}", val))),
        }
    }
}

impl fmt::Display for LogEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogEntryType::CreateTable => "create-table",
            LogEntryType::DropTable => "drop-table",
            LogEntryType::CreateSegment => "create-segment",
            LogEntryType::UpgradeSegment => "upgrade-segment",
            LogEntryType::DropSegment => "drop-segment",
            LogEntryType::CreateBlock => "create-block",
            LogEntryType::UpgradeBlock => "upgrade-block",
            LogEntryType::DropBlock => "drop-block",
        };
        f.write_str(name)
    }
}

/// Opaque serialized record exchanged with a log store.
///
/// The type tag stays a raw byte so that entries written by a newer version
/// still load; `entry_type()` rejects tags this build does not know.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogEntry {
    entry_type: u8,
    payload: Vec<u8>,
}

impl LogEntry {
    pub fn empty() -> Self {
        LogEntry::default()
    }

    pub fn from_raw(entry_type: u8, payload: Vec<u8>) -> Self {
        LogEntry {
            entry_type,
            payload,
        }
    }

    pub fn set_type(&mut self, entry_type: LogEntryType) {
        self.entry_type = entry_type.as_u8();
    }

    pub fn raw_type(&self) -> u8 {
        self.entry_type
    }

    pub fn entry_type(&self) -> Result<LogEntryType> {
        LogEntryType::from_u8(self.entry_type)
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize `value` into this entry's payload
    pub fn marshal<T: Serialize>(&mut self, value: &T) -> Result<()> {
        self.payload = encode(value)?;
        Ok(())
    }

    pub fn unmarshal<T: DeserializeOwned>(&self) -> Result<T> {
        decode(&self.payload)
    }
}

/// Log projection of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLogEntry {
    pub base: BaseEntry,
    pub schema: Schema,
}

/// Log projection of a segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentLogEntry {
    pub base: BaseEntry,
    pub table_id: Id,
}

/// Log projection of a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLogEntry {
    pub base: BaseEntry,
    pub table_id: Id,
    pub segment_id: Id,
    pub row_count: u64,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| Error::codec(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let (value, read): (T, usize) =
        bincode::serde::decode_from_slice(data, bincode::config::standard())
            .map_err(|e| Error::codec(e.to_string()))?;
    if read != data.len() {
        return Err(Error::codec(format!(
            "{} trailing bytes after payload",
            data.len() - read
        )));
    }
    Ok(value)
}
