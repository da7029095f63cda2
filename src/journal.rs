//! Append-only journal backing one topic.
//!
//! Every mutation of a topic (publish, truncate) is written here before it
//! is applied in memory, so a reopened topic can rebuild its exact state by
//! replaying entries in order. A torn entry at the tail of the file (crash
//! mid-write) truncates the journal back to the last valid boundary.

use crate::error::{Result, TopicError};
use crate::types::{Message, Offset, PayloadEncoding, Timestamp};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Magic bytes preceding every journal entry.
const ENTRY_MAGIC: &[u8; 4] = b"TQE\0";

/// Current journal entry format version.
const ENTRY_VERSION: u8 = 1;

/// Entry kind tags.
const KIND_PUBLISH: u8 = 0;
const KIND_TRUNCATE: u8 = 1;

/// A single replayed journal entry.
#[derive(Clone, Debug)]
pub enum JournalEntry {
    /// A message appended at `message.offset`.
    Publish {
        message: Message,
        dedup: Option<String>,
    },
    /// Head advanced to `new_head`.
    Truncate { new_head: Offset },
}

/// Append-only journal for one topic.
///
/// Not internally synchronized; the owning topic serializes all access
/// behind its own lock.
pub struct TopicJournal {
    /// Path to the journal file.
    path: PathBuf,

    /// Journal file handle, positioned for appending.
    file: File,

    /// Current file size (append position).
    file_size: u64,

    /// Number of writes since last sync.
    writes_since_sync: u64,

    /// Sync every N writes.
    sync_interval: u64,
}

impl TopicJournal {
    /// Default sync interval - sync every 100 writes for balance of
    /// durability and performance.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 100;

    /// Open or create a journal, replaying any existing entries.
    ///
    /// Returns the journal and the entries found in it, in write order.
    pub fn open(
        path: impl AsRef<Path>,
        sync_interval: u64,
    ) -> Result<(Self, Vec<JournalEntry>)> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let (entries, valid_end) = Self::replay(&file, file_size)?;

        // A crash mid-write leaves a torn entry past the last valid
        // boundary; drop it so the next append starts clean.
        if valid_end < file_size {
            warn!(
                path = %path.display(),
                dropped = file_size - valid_end,
                "truncating torn journal tail"
            );
            file.set_len(valid_end)?;
        }

        let journal = Self {
            path,
            file,
            file_size: valid_end,
            writes_since_sync: 0,
            sync_interval: if sync_interval == 0 { 1 } else { sync_interval },
        };

        Ok((journal, entries))
    }

    /// Append a publish entry.
    pub fn append_publish(&mut self, message: &Message, dedup: Option<&str>) -> Result<()> {
        let mut buf = Vec::with_capacity(32 + message.payload.len());
        buf.extend_from_slice(ENTRY_MAGIC);
        buf.push(ENTRY_VERSION);
        buf.push(KIND_PUBLISH);
        buf.extend_from_slice(&message.offset.0.to_le_bytes());
        buf.extend_from_slice(&message.timestamp.0.to_le_bytes());

        let encoding_byte = match message.encoding {
            PayloadEncoding::Json => 0u8,
            PayloadEncoding::MessagePack => 1u8,
            PayloadEncoding::Raw => 2u8,
        };
        buf.push(encoding_byte);

        let dedup_bytes = dedup.map(str::as_bytes).unwrap_or_default();
        buf.extend_from_slice(&(dedup_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(dedup_bytes);

        buf.extend_from_slice(&(message.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&message.payload);

        let checksum = crc32fast::hash(&message.payload);
        buf.extend_from_slice(&checksum.to_le_bytes());

        self.write_entry(&buf)
    }

    /// Append a truncate entry.
    pub fn append_truncate(&mut self, new_head: Offset) -> Result<()> {
        let mut buf = Vec::with_capacity(32);
        buf.extend_from_slice(ENTRY_MAGIC);
        buf.push(ENTRY_VERSION);
        buf.push(KIND_TRUNCATE);
        buf.extend_from_slice(&new_head.0.to_le_bytes());
        buf.extend_from_slice(&Timestamp::now().0.to_le_bytes());

        let checksum = crc32fast::hash(&new_head.0.to_le_bytes());
        buf.extend_from_slice(&checksum.to_le_bytes());

        self.write_entry(&buf)
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        self.writes_since_sync = 0;
        Ok(())
    }

    /// Current file size in bytes.
    pub fn size(&self) -> u64 {
        self.file_size
    }

    /// Rewrite the journal so it contains exactly `entries`, atomically
    /// replacing the old file.
    ///
    /// Used by compaction: the caller passes a truncate marker plus the
    /// surviving messages, so a replay of the compacted journal rebuilds
    /// the same visible state.
    pub fn rewrite(&mut self, entries: &[JournalEntry]) -> Result<()> {
        let tmp_path = self.path.with_extension("log.tmp");

        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;

            let mut replacement = Self {
                path: tmp_path.clone(),
                file,
                file_size: 0,
                writes_since_sync: 0,
                sync_interval: 1,
            };

            for entry in entries {
                match entry {
                    JournalEntry::Publish { message, dedup } => {
                        replacement.append_publish(message, dedup.as_deref())?;
                    }
                    JournalEntry::Truncate { new_head } => {
                        replacement.append_truncate(*new_head)?;
                    }
                }
            }
            replacement.sync()?;
        }

        fs::rename(&tmp_path, &self.path)?;

        // Reopen so the handle points at the replacement file.
        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.file_size = self.file.metadata()?.len();
        self.writes_since_sync = 0;

        Ok(())
    }

    fn write_entry(&mut self, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.file_size))?;
        self.file.write_all(buf)?;
        self.file_size += buf.len() as u64;

        self.writes_since_sync += 1;
        if self.writes_since_sync >= self.sync_interval {
            self.file.sync_all()?;
            self.writes_since_sync = 0;
        }

        Ok(())
    }

    /// Replay all entries, returning them plus the offset of the last
    /// valid entry boundary.
    fn replay(file: &File, file_size: u64) -> Result<(Vec<JournalEntry>, u64)> {
        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut entries = Vec::new();
        let mut valid_end = 0u64;

        while valid_end < file_size {
            match Self::read_entry(&mut reader) {
                Ok(entry) => {
                    entries.push(entry);
                    valid_end = reader.stream_position()?;
                }
                Err(_) => break,
            }
        }

        Ok((entries, valid_end))
    }

    /// Read one entry from the current position.
    fn read_entry(reader: &mut impl Read) -> Result<JournalEntry> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != ENTRY_MAGIC {
            return Err(TopicError::InvalidFormat("Invalid entry magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != ENTRY_VERSION {
            return Err(TopicError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }

        let mut kind = [0u8; 1];
        reader.read_exact(&mut kind)?;

        match kind[0] {
            KIND_PUBLISH => {
                let mut offset_bytes = [0u8; 8];
                reader.read_exact(&mut offset_bytes)?;
                let offset = Offset(u64::from_le_bytes(offset_bytes));

                let mut ts_bytes = [0u8; 8];
                reader.read_exact(&mut ts_bytes)?;
                let timestamp = Timestamp(i64::from_le_bytes(ts_bytes));

                let mut encoding_byte = [0u8; 1];
                reader.read_exact(&mut encoding_byte)?;
                let encoding = match encoding_byte[0] {
                    0 => PayloadEncoding::Json,
                    1 => PayloadEncoding::MessagePack,
                    _ => PayloadEncoding::Raw,
                };

                let mut dedup_len_bytes = [0u8; 2];
                reader.read_exact(&mut dedup_len_bytes)?;
                let dedup_len = u16::from_le_bytes(dedup_len_bytes) as usize;
                let dedup = if dedup_len > 0 {
                    let mut dedup_bytes = vec![0u8; dedup_len];
                    reader.read_exact(&mut dedup_bytes)?;
                    Some(String::from_utf8_lossy(&dedup_bytes).into_owned())
                } else {
                    None
                };

                let mut payload_len_bytes = [0u8; 4];
                reader.read_exact(&mut payload_len_bytes)?;
                let payload_len = u32::from_le_bytes(payload_len_bytes) as usize;
                let mut payload = vec![0u8; payload_len];
                reader.read_exact(&mut payload)?;

                let mut checksum_bytes = [0u8; 4];
                reader.read_exact(&mut checksum_bytes)?;
                let stored = u32::from_le_bytes(checksum_bytes);
                let computed = crc32fast::hash(&payload);
                if stored != computed {
                    return Err(TopicError::ChecksumMismatch {
                        expected: stored,
                        got: computed,
                    });
                }

                Ok(JournalEntry::Publish {
                    message: Message {
                        offset,
                        timestamp,
                        payload,
                        encoding,
                    },
                    dedup,
                })
            }
            KIND_TRUNCATE => {
                let mut head_bytes = [0u8; 8];
                reader.read_exact(&mut head_bytes)?;
                let new_head = Offset(u64::from_le_bytes(head_bytes));

                let mut ts_bytes = [0u8; 8];
                reader.read_exact(&mut ts_bytes)?;

                let mut checksum_bytes = [0u8; 4];
                reader.read_exact(&mut checksum_bytes)?;
                let stored = u32::from_le_bytes(checksum_bytes);
                let computed = crc32fast::hash(&head_bytes);
                if stored != computed {
                    return Err(TopicError::ChecksumMismatch {
                        expected: stored,
                        got: computed,
                    });
                }

                Ok(JournalEntry::Truncate { new_head })
            }
            other => Err(TopicError::InvalidFormat(format!(
                "Unknown entry kind: {}",
                other
            ))),
        }
    }
}
