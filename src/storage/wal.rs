use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::SyncPolicy;
use crate::error::{Error, Result};
use crate::storage::log_entry::LogEntry;
use crate::storage::logstore::{LogIter, LogStore};

/// WAL entry header (21 bytes, little endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalEntryHeader {
    /// Magic number for validation
    pub magic: u32,
    /// Raw `LogEntryType` tag
    pub entry_type: u8,
    /// Payload length (bytes following this header)
    pub payload_len: u32,
    /// Log sequence number, counts entries from 0
    pub lsn: u64,
    /// CRC32 of header (with this field zeroed) and payload
    pub crc32: u32,
}

impl WalEntryHeader {
    const MAGIC: u32 = 0x474C_4D46; // "FMLG"
    pub const SIZE: usize = 21;
    /// Largest payload a single entry may carry
    pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

    pub fn new(entry_type: u8, payload_len: u32, lsn: u64) -> Self {
        WalEntryHeader {
            magic: Self::MAGIC,
            entry_type,
            payload_len,
            lsn,
            crc32: 0,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4] = self.entry_type;
        buf[5..9].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[9..17].copy_from_slice(&self.lsn.to_le_bytes());
        buf[17..21].copy_from_slice(&self.crc32.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let mut lsn = [0u8; 8];
        lsn.copy_from_slice(&buf[9..17]);
        WalEntryHeader {
            magic: u32_at(0),
            entry_type: buf[4],
            payload_len: u32_at(5),
            lsn: u64::from_le_bytes(lsn),
            crc32: u32_at(17),
        }
    }

    pub fn validate(&self, offset: u64) -> Result<()> {
        if self.magic != Self::MAGIC {
            return Err(Error::invariant(format!(
                "invalid WAL entry magic {:#010x} at offset {}",
                self.magic, offset
            )));
        }
        if self.payload_len > Self::MAX_PAYLOAD_LEN {
            return Err(Error::invariant(format!(
                "WAL entry at offset {} claims {} payload bytes, limit is {}",
                offset,
                self.payload_len,
                Self::MAX_PAYLOAD_LEN
            )));
        }
        Ok(())
    }

    fn checksum(&self, payload: &[u8]) -> u32 {
        let mut unsigned = *self;
        unsigned.crc32 = 0;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&unsigned.encode());
        hasher.update(payload);
        hasher.finalize()
    }
}

struct WalWriter {
    file: File,
    /// Current write offset (next entry will be written here)
    next_offset: u64,
    next_lsn: u64,
}

/// File-backed `LogStore`: one append-only file of checksummed entries
pub struct FileLogStore {
    path: PathBuf,
    sync: SyncPolicy,
    writer: Mutex<WalWriter>,
}

impl FileLogStore {
    /// Open or create a WAL file.
    ///
    /// A partially written trailing entry is cut off; any other damage is an
    /// invariant violation.
    pub fn open<P: AsRef<Path>>(path: P, sync: SyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let file_len = file.metadata()?.len();

        let mut iter = WalIterator::new(File::open(&path)?)?;
        for entry in iter.by_ref() {
            entry?;
        }
        let (valid_end, next_lsn) = (iter.offset, iter.next_lsn);

        if valid_end < file_len {
            warn!(
                path = %path.display(),
                valid_end,
                file_len,
                "truncating torn WAL tail"
            );
            file.set_len(valid_end)?;
            file.sync_all()?;
        }

        debug!(path = %path.display(), entries = next_lsn, "opened WAL");

        Ok(FileLogStore {
            path,
            sync,
            writer: Mutex::new(WalWriter {
                file,
                next_offset: valid_end,
                next_lsn,
            }),
        })
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get current write offset
    pub fn next_offset(&self) -> u64 {
        self.writer.lock().next_offset
    }
}

impl LogStore for FileLogStore {
    fn append(&self, entry: LogEntry) -> Result<u64> {
        let payload = entry.payload();
        let payload_len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= WalEntryHeader::MAX_PAYLOAD_LEN)
            .ok_or_else(|| Error::codec(format!("log entry of {} bytes too large", payload.len())))?;

        let mut writer = self.writer.lock();
        let lsn = writer.next_lsn;
        let mut header = WalEntryHeader::new(entry.raw_type(), payload_len, lsn);
        header.crc32 = header.checksum(payload);

        let mut buf = Vec::with_capacity(WalEntryHeader::SIZE + payload.len());
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(payload);
        writer.file.write_all(&buf)?;
        if self.sync == SyncPolicy::Always {
            writer.file.sync_data()?;
        }

        writer.next_offset += buf.len() as u64;
        writer.next_lsn += 1;
        Ok(lsn)
    }

    fn replay(&self) -> Result<LogIter<'_>> {
        let file = File::open(&self.path)?;
        Ok(Box::new(WalIterator::new(file)?))
    }

    fn sync(&self) -> Result<()> {
        self.writer.lock().file.sync_data()?;
        Ok(())
    }
}

/// Iterator for WAL entries
pub struct WalIterator {
    reader: BufReader<File>,
    file_len: u64,
    offset: u64,
    next_lsn: u64,
    done: bool,
}

impl WalIterator {
    fn new(file: File) -> Result<Self> {
        let file_len = file.metadata()?.len();
        Ok(WalIterator {
            reader: BufReader::new(file),
            file_len,
            offset: 0,
            next_lsn: 0,
            done: false,
        })
    }

    fn read_entry(&mut self) -> Result<Option<LogEntry>> {
        let mut header_buf = [0u8; WalEntryHeader::SIZE];
        let n = read_full(&mut self.reader, &mut header_buf)?;
        if n == 0 {
            return Ok(None);
        }
        if n < WalEntryHeader::SIZE {
            warn!(offset = self.offset, "torn WAL entry header");
            return Ok(None);
        }

        let header = WalEntryHeader::decode(&header_buf);
        header.validate(self.offset)?;

        let payload_end = self.offset + (WalEntryHeader::SIZE as u64) + u64::from(header.payload_len);
        if payload_end > self.file_len {
            warn!(offset = self.offset, lsn = header.lsn, "torn WAL entry payload");
            return Ok(None);
        }

        let mut payload = vec![0u8; header.payload_len as usize];
        if read_full(&mut self.reader, &mut payload)? < payload.len() {
            warn!(offset = self.offset, lsn = header.lsn, "torn WAL entry payload");
            return Ok(None);
        }

        let expected = header.checksum(&payload);
        if header.crc32 != expected {
            return Err(Error::invariant(format!(
                "WAL entry CRC mismatch at offset {}: stored {:#010x}, computed {:#010x}",
                self.offset, header.crc32, expected
            )));
        }
        if header.lsn != self.next_lsn {
            return Err(Error::invariant(format!(
                "WAL entry at offset {} has lsn {}, expected {}",
                self.offset, header.lsn, self.next_lsn
            )));
        }

        self.offset += (WalEntryHeader::SIZE + payload.len()) as u64;
        self.next_lsn += 1;
        Ok(Some(LogEntry::from_raw(header.entry_type, payload)))
    }
}

impl Iterator for WalIterator {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Read until `buf` is full or EOF; returns bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::log_entry::LogEntryType;
    use tempfile::tempdir;

    fn entry(ty: LogEntryType, payload: Vec<u8>) -> LogEntry {
        let mut entry = LogEntry::empty();
        entry.set_type(ty);
        entry.set_payload(payload);
        entry
    }

    #[test]
    fn test_wal_file_creation() {
        let dir = tempdir().unwrap();
        let wal = FileLogStore::open(dir.path().join("meta.wal"), SyncPolicy::Never)
            .expect("Failed to create WAL file");
        assert_eq!(wal.next_offset(), 0);
        assert_eq!(wal.replay().unwrap().count(), 0);
    }

    #[test]
    fn test_wal_append_and_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.wal");
        let wal = FileLogStore::open(&path, SyncPolicy::Always).unwrap();

        assert_eq!(wal.append(entry(LogEntryType::CreateTable, vec![1])).unwrap(), 0);
        assert_eq!(wal.append(entry(LogEntryType::CreateSegment, vec![2, 3])).unwrap(), 1);
        assert_eq!(wal.append(entry(LogEntryType::CreateBlock, vec![])).unwrap(), 2);

        let read: Vec<_> = wal.replay().unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(read.len(), 3);
        assert_eq!(read[1].entry_type().unwrap(), LogEntryType::CreateSegment);
        assert_eq!(read[1].payload(), &[2, 3]);
        drop(wal);

        // reopen continues the lsn sequence
        let wal = FileLogStore::open(&path, SyncPolicy::Never).unwrap();
        assert_eq!(wal.append(entry(LogEntryType::DropBlock, vec![9])).unwrap(), 3);
        assert_eq!(wal.replay().unwrap().count(), 4);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.wal");
        let wal = FileLogStore::open(&path, SyncPolicy::Never).unwrap();
        wal.append(entry(LogEntryType::CreateTable, vec![1, 2, 3])).unwrap();
        let good_len = wal.next_offset();
        wal.append(entry(LogEntryType::CreateSegment, vec![4; 32])).unwrap();
        drop(wal);

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(good_len + 10).unwrap();
        drop(file);

        let wal = FileLogStore::open(&path, SyncPolicy::Never).unwrap();
        assert_eq!(wal.next_offset(), good_len);
        assert_eq!(wal.replay().unwrap().count(), 1);
        assert_eq!(wal.append(entry(LogEntryType::CreateBlock, vec![])).unwrap(), 1);
    }

    #[test]
    fn test_corrupted_payload_fails_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.wal");
        let wal = FileLogStore::open(&path, SyncPolicy::Never).unwrap();
        wal.append(entry(LogEntryType::CreateTable, vec![1, 2, 3, 4])).unwrap();
        drop(wal);

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        match FileLogStore::open(&path, SyncPolicy::Never) {
            Err(Error::InvariantViolation(msg)) => assert!(msg.contains("CRC")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("corrupted WAL opened"),
        }
    }

    #[test]
    fn test_oversized_payload_len_fails_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.wal");
        let wal = FileLogStore::open(&path, SyncPolicy::Never).unwrap();
        wal.append(entry(LogEntryType::CreateTable, vec![1, 2, 3])).unwrap();
        drop(wal);

        // valid magic, but a length no entry may have
        let header = WalEntryHeader::new(LogEntryType::CreateSegment.as_u8(), u32::MAX, 1);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&header.encode()).unwrap();
        drop(file);

        match FileLogStore::open(&path, SyncPolicy::Never) {
            Err(Error::InvariantViolation(msg)) => assert!(msg.contains("payload bytes")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("oversized entry accepted"),
        }
    }

    #[test]
    fn test_payload_len_past_end_is_torn() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.wal");
        let wal = FileLogStore::open(&path, SyncPolicy::Never).unwrap();
        wal.append(entry(LogEntryType::CreateTable, vec![1, 2, 3])).unwrap();
        let good_len = wal.next_offset();
        drop(wal);

        let header = WalEntryHeader::new(LogEntryType::CreateSegment.as_u8(), 4096, 1);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&header.encode()).unwrap();
        file.write_all(&[7; 16]).unwrap();
        drop(file);

        let wal = FileLogStore::open(&path, SyncPolicy::Never).unwrap();
        assert_eq!(wal.next_offset(), good_len);
        assert_eq!(wal.replay().unwrap().count(), 1);
    }

    #[test]
    fn test_header_encoding() {
        let mut header = WalEntryHeader::new(7, 1024, 99);
        header.crc32 = 0xdead_beef;
        assert_eq!(WalEntryHeader::decode(&header.encode()), header);
        assert!(header.validate(0).is_ok());

        let bad = WalEntryHeader::decode(&[0u8; WalEntryHeader::SIZE]);
        assert!(bad.validate(0).is_err());
    }
}
