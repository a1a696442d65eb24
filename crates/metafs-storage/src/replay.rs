//! Local replay log
//!
//! The append-only journal of tree mutations since the most recent
//! checkpoint. Each record is padded to a 4096-byte boundary and carries a
//! CRC64-ECMA over everything after the CRC word, so a torn tail write is
//! indistinguishable from a clean end of log: the scan truncates at the
//! first record that fails validation and replays everything before it.
//!
//! Record layout, little-endian u64 throughout:
//!
//! ```text
//! [ crc64 | bytes_following | last_checkpoint_object | transaction_type ]
//! [ type-specific payload ][ zero padding to the next 4096-byte boundary ]
//! ```
//!
//! `bytes_following` counts from the end of its own word, so a record
//! occupies `bytes_following + 16` bytes before padding.

use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use bytes::Bytes;
use crc::{Crc, CRC_64_ECMA_182};

use metafs_core::{Error, Result, LOG_ALIGNMENT};

/// Every record begins on this boundary and is padded up to it.
pub const RECORD_ALIGNMENT: u64 = LOG_ALIGNMENT;

/// Fixed record header: 4 little-endian u64 words.
pub const RECORD_HEADER_SIZE: usize = 32;

const REPLAY_CRC: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Wire identifier of each transaction shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum TransactionType {
    /// Insert or update one inode record.
    PutInodeRec = 1,
    /// Insert or update a batch of inode records.
    PutInodeRecs = 2,
    /// Delete one inode record.
    DeleteInodeRec = 3,
    /// Insert or update one log-segment record.
    PutLogSegmentRec = 4,
    /// Delete one log-segment record.
    DeleteLogSegmentRec = 5,
    /// Insert or update one B+Tree-object record.
    PutBPlusTreeObject = 6,
    /// Delete one B+Tree-object record.
    DeleteBPlusTreeObject = 7,
}

impl TransactionType {
    fn from_u64(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::PutInodeRec),
            2 => Some(Self::PutInodeRecs),
            3 => Some(Self::DeleteInodeRec),
            4 => Some(Self::PutLogSegmentRec),
            5 => Some(Self::DeleteLogSegmentRec),
            6 => Some(Self::PutBPlusTreeObject),
            7 => Some(Self::DeleteBPlusTreeObject),
            _ => None,
        }
    }

    /// Stable name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PutInodeRec => "put_inode_rec",
            Self::PutInodeRecs => "put_inode_recs",
            Self::DeleteInodeRec => "delete_inode_rec",
            Self::PutLogSegmentRec => "put_log_segment_rec",
            Self::DeleteLogSegmentRec => "delete_log_segment_rec",
            Self::PutBPlusTreeObject => "put_b_plus_tree_object",
            Self::DeleteBPlusTreeObject => "delete_b_plus_tree_object",
        }
    }
}

/// One logged tree mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Transaction {
    /// Insert or update one inode record.
    PutInodeRec {
        /// Inode number.
        inode_number: u64,
        /// Serialized record.
        value: Bytes,
    },
    /// Insert or update a batch of inode records atomically.
    PutInodeRecs {
        /// `(inode_number, value)` pairs.
        recs: Vec<(u64, Bytes)>,
    },
    /// Delete one inode record.
    DeleteInodeRec {
        /// Inode number.
        inode_number: u64,
    },
    /// Insert or update one log-segment record.
    PutLogSegmentRec {
        /// Log-segment number.
        segment_number: u64,
        /// Serialized record.
        value: Bytes,
    },
    /// Delete one log-segment record.
    DeleteLogSegmentRec {
        /// Log-segment number.
        segment_number: u64,
    },
    /// Insert or update one B+Tree-object record.
    PutBPlusTreeObject {
        /// Object number.
        object_number: u64,
        /// Serialized record.
        value: Bytes,
    },
    /// Delete one B+Tree-object record.
    DeleteBPlusTreeObject {
        /// Object number.
        object_number: u64,
    },
}

impl Transaction {
    /// Wire identifier of this transaction.
    pub fn transaction_type(&self) -> TransactionType {
        match self {
            Self::PutInodeRec { .. } => TransactionType::PutInodeRec,
            Self::PutInodeRecs { .. } => TransactionType::PutInodeRecs,
            Self::DeleteInodeRec { .. } => TransactionType::DeleteInodeRec,
            Self::PutLogSegmentRec { .. } => TransactionType::PutLogSegmentRec,
            Self::DeleteLogSegmentRec { .. } => TransactionType::DeleteLogSegmentRec,
            Self::PutBPlusTreeObject { .. } => TransactionType::PutBPlusTreeObject,
            Self::DeleteBPlusTreeObject { .. } => TransactionType::DeleteBPlusTreeObject,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Self::PutInodeRec { value, .. }
            | Self::PutLogSegmentRec { value, .. }
            | Self::PutBPlusTreeObject { value, .. } => 16 + value.len(),
            Self::PutInodeRecs { recs } => {
                8 + recs.iter().map(|(_, v)| 16 + v.len()).sum::<usize>()
            }
            Self::DeleteInodeRec { .. }
            | Self::DeleteLogSegmentRec { .. }
            | Self::DeleteBPlusTreeObject { .. } => 8,
        }
    }

    fn encode_payload(&self, out: &mut impl Write) -> Result<()> {
        match self {
            Self::PutInodeRec {
                inode_number: key,
                value,
            }
            | Self::PutLogSegmentRec {
                segment_number: key,
                value,
            }
            | Self::PutBPlusTreeObject {
                object_number: key,
                value,
            } => {
                out.write_u64::<LittleEndian>(*key)?;
                out.write_u64::<LittleEndian>(value.len() as u64)?;
                out.write_all(value)?;
            }
            Self::PutInodeRecs { recs } => {
                out.write_u64::<LittleEndian>(recs.len() as u64)?;
                for (inode_number, value) in recs {
                    out.write_u64::<LittleEndian>(*inode_number)?;
                    out.write_u64::<LittleEndian>(value.len() as u64)?;
                    out.write_all(value)?;
                }
            }
            Self::DeleteInodeRec { inode_number: key }
            | Self::DeleteLogSegmentRec {
                segment_number: key,
            }
            | Self::DeleteBPlusTreeObject {
                object_number: key,
            } => {
                out.write_u64::<LittleEndian>(*key)?;
            }
        }
        Ok(())
    }

    fn decode_payload(transaction_type: TransactionType, payload: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(payload);
        let transaction = match transaction_type {
            TransactionType::PutInodeRec => Self::PutInodeRec {
                inode_number: reader.u64()?,
                value: reader.value()?,
            },
            TransactionType::PutInodeRecs => {
                let count = reader.u64()?;
                let mut recs = Vec::new();
                for _ in 0..count {
                    let inode_number = reader.u64()?;
                    let value = reader.value()?;
                    recs.push((inode_number, value));
                }
                Self::PutInodeRecs { recs }
            }
            TransactionType::DeleteInodeRec => Self::DeleteInodeRec {
                inode_number: reader.u64()?,
            },
            TransactionType::PutLogSegmentRec => Self::PutLogSegmentRec {
                segment_number: reader.u64()?,
                value: reader.value()?,
            },
            TransactionType::DeleteLogSegmentRec => Self::DeleteLogSegmentRec {
                segment_number: reader.u64()?,
            },
            TransactionType::PutBPlusTreeObject => Self::PutBPlusTreeObject {
                object_number: reader.u64()?,
                value: reader.value()?,
            },
            TransactionType::DeleteBPlusTreeObject => Self::DeleteBPlusTreeObject {
                object_number: reader.u64()?,
            },
        };
        if !reader.at_end() {
            return Err(Error::corrupt("replay record payload has trailing bytes"));
        }
        Ok(transaction)
    }
}

struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u64(&mut self) -> Result<u64> {
        let end = self
            .pos
            .checked_add(8)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Error::corrupt("truncated replay record payload"))?;
        let word = u64::from_le_bytes(
            self.buf[self.pos..end]
                .try_into()
                .expect("slice is 8 bytes"),
        );
        self.pos = end;
        Ok(word)
    }

    fn value(&mut self) -> Result<Bytes> {
        let length = self.u64()? as usize;
        let end = self
            .pos
            .checked_add(length)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Error::corrupt("replay record value overruns the record"))?;
        let value = Bytes::copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(value)
    }

    fn at_end(&self) -> bool {
        self.pos == self.buf.len()
    }
}

/// Round up to the next record boundary.
pub fn align_up(length: u64) -> u64 {
    length.div_ceil(RECORD_ALIGNMENT) * RECORD_ALIGNMENT
}

/// Page-aligned scratch buffer, obtained by over-allocating and slicing at
/// the first aligned offset, ready for direct-I/O back-ends.
pub(crate) struct AlignedBuf {
    raw: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedBuf {
    pub(crate) fn zeroed(len: usize) -> Self {
        let align = RECORD_ALIGNMENT as usize;
        let raw = vec![0u8; len + align];
        let offset = raw.as_ptr().align_offset(align);
        Self { raw, offset, len }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.raw[self.offset..self.offset + self.len]
    }
}

/// Serialize one record into `buf`, which must span the padded record
/// length. Returns the unpadded record size.
fn encode_record(transaction: &Transaction, fence: u64, buf: &mut [u8]) -> Result<usize> {
    let bytes_needed = RECORD_HEADER_SIZE + transaction.payload_len();
    debug_assert_eq!(buf.len() as u64, align_up(bytes_needed as u64));
    buf.fill(0);
    {
        let mut cursor = Cursor::new(&mut *buf);
        cursor.set_position(8);
        cursor.write_u64::<LittleEndian>((bytes_needed - 16) as u64)?;
        cursor.write_u64::<LittleEndian>(fence)?;
        cursor.write_u64::<LittleEndian>(transaction.transaction_type() as u64)?;
        transaction.encode_payload(&mut cursor)?;
    }
    let crc = REPLAY_CRC.checksum(&buf[8..bytes_needed]);
    buf[0..8].copy_from_slice(&crc.to_le_bytes());
    Ok(bytes_needed)
}

/// Validate and deserialize one record from the start of `buf`.
///
/// Returns the transaction, the checkpoint-object fence it was written
/// under, and the unpadded record size.
fn decode_record(buf: &[u8]) -> Result<(Transaction, u64, usize)> {
    if buf.len() < RECORD_HEADER_SIZE {
        return Err(Error::corrupt("replay record shorter than its header"));
    }
    let crc = u64::from_le_bytes(buf[0..8].try_into().expect("slice is 8 bytes"));
    let bytes_following = u64::from_le_bytes(buf[8..16].try_into().expect("slice is 8 bytes"));
    let fence = u64::from_le_bytes(buf[16..24].try_into().expect("slice is 8 bytes"));
    let type_word = u64::from_le_bytes(buf[24..32].try_into().expect("slice is 8 bytes"));

    let total = (bytes_following as usize).checked_add(16);
    let total = match total {
        Some(t) if t >= RECORD_HEADER_SIZE && t <= buf.len() => t,
        _ => return Err(Error::corrupt("replay record length out of bounds")),
    };
    if REPLAY_CRC.checksum(&buf[8..total]) != crc {
        return Err(Error::corrupt("replay record CRC mismatch"));
    }
    let transaction_type = TransactionType::from_u64(type_word)
        .ok_or_else(|| Error::corrupt(format!("unknown transaction type {type_word}")))?;
    let transaction =
        Transaction::decode_payload(transaction_type, &buf[RECORD_HEADER_SIZE..total])?;
    Ok((transaction, fence, total))
}

/// The replay-log file and its append position.
///
/// The file is exclusively owned by one volume: it is created with
/// `create_new` on the first append after a checkpoint and unlinked by
/// [`ReplayLog::discard`] once a checkpoint makes it redundant.
pub struct ReplayLog {
    path: PathBuf,
    file: Option<File>,
    position: u64,
    scratch: AlignedBuf,
}

impl ReplayLog {
    /// Bind a replay log to its file path; no I/O happens yet.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            position: 0,
            scratch: AlignedBuf::zeroed(RECORD_ALIGNMENT as usize),
        }
    }

    /// The log's file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the log and scan it from offset zero, returning every valid
    /// transaction written under the given checkpoint-object fence.
    ///
    /// A missing file is a clean empty log. A partial trailing record, a
    /// CRC mismatch, an unknown transaction type, or a fence mismatch
    /// truncates the log at that record's start; everything before it
    /// replays. The file handle stays open, positioned for append.
    pub fn open_and_scan(&mut self, fence: u64) -> Result<Vec<Transaction>> {
        let mut file = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.file = None;
                self.position = 0;
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let length = file.metadata()?.len();
        let end = length - length % RECORD_ALIGNMENT;
        if end != length {
            tracing::warn!(
                path = %self.path.display(),
                length,
                "replay log length is not record-aligned; discarding partial tail"
            );
            file.set_len(end)?;
        }

        let mut transactions = Vec::new();
        let mut pos = 0u64;
        while pos < end {
            file.seek(SeekFrom::Start(pos))?;
            file.read_exact(self.scratch.as_mut_slice())?;

            let parsed = {
                let first = self.scratch.as_mut_slice();
                let bytes_following =
                    u64::from_le_bytes(first[8..16].try_into().expect("slice is 8 bytes"));
                let total = bytes_following.saturating_add(16);
                if total > end - pos {
                    Err(Error::corrupt("replay record overruns the log"))
                } else {
                    let padded = align_up(total);
                    if padded as usize <= first.len() {
                        decode_record(first).map(|r| (r, padded))
                    } else {
                        let mut big = AlignedBuf::zeroed(padded as usize);
                        file.seek(SeekFrom::Start(pos))?;
                        file.read_exact(big.as_mut_slice())?;
                        decode_record(big.as_mut_slice()).map(|r| (r, padded))
                    }
                }
            };

            match parsed {
                Ok(((transaction, record_fence, _), padded)) if record_fence == fence => {
                    transactions.push(transaction);
                    pos += padded;
                }
                Ok(((_, record_fence, _), _)) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        offset = pos,
                        record_fence,
                        fence,
                        "replay record from a stale checkpoint; truncating log here"
                    );
                    file.set_len(pos)?;
                    break;
                }
                Err(err) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        offset = pos,
                        error = %err,
                        "invalid replay record; truncating log here"
                    );
                    file.set_len(pos)?;
                    break;
                }
            }
        }

        self.position = pos;
        self.file = Some(file);
        Ok(transactions)
    }

    /// Append one record, durably.
    ///
    /// On the first append after a checkpoint the file must not exist yet
    /// and is created exclusively; every write is followed by a data sync
    /// before this returns.
    pub fn append(&mut self, transaction: &Transaction, fence: u64) -> Result<()> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::AlreadyExists {
                        Error::already_exists("replay log", self.path.display().to_string())
                    } else {
                        Error::from(e)
                    }
                })?;
            self.file = Some(file);
            self.position = 0;
        }

        let bytes_needed = RECORD_HEADER_SIZE + transaction.payload_len();
        let padded = align_up(bytes_needed as u64) as usize;

        let mut overflow;
        let record: &mut [u8] = if padded <= self.scratch.len() {
            &mut self.scratch.as_mut_slice()[..padded]
        } else {
            overflow = AlignedBuf::zeroed(padded);
            overflow.as_mut_slice()
        };
        encode_record(transaction, fence, record)?;

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::internal("replay log lost its file handle"))?;
        file.seek(SeekFrom::Start(self.position))?;
        file.write_all(record)?;
        file.sync_data()?;
        self.position += padded as u64;
        Ok(())
    }

    /// Close and unlink the log; a missing file is tolerated.
    pub fn discard(&mut self) -> Result<()> {
        self.file = None;
        self.position = 0;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_transactions() -> Vec<Transaction> {
        vec![
            Transaction::PutInodeRec {
                inode_number: 0x11,
                value: Bytes::from_static(b"abc"),
            },
            Transaction::PutInodeRecs {
                recs: vec![
                    (1, Bytes::from_static(b"one")),
                    (2, Bytes::from_static(b"two")),
                ],
            },
            Transaction::DeleteInodeRec { inode_number: 0x11 },
            Transaction::PutLogSegmentRec {
                segment_number: 7,
                value: Bytes::from_static(b"segment"),
            },
            Transaction::DeleteLogSegmentRec { segment_number: 7 },
            Transaction::PutBPlusTreeObject {
                object_number: 9,
                value: Bytes::new(),
            },
            Transaction::DeleteBPlusTreeObject { object_number: 9 },
        ]
    }

    fn encode_one(transaction: &Transaction, fence: u64) -> Vec<u8> {
        let padded = align_up((RECORD_HEADER_SIZE + transaction.payload_len()) as u64) as usize;
        let mut buf = vec![0u8; padded];
        encode_record(transaction, fence, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_record_round_trip_all_types() {
        for transaction in sample_transactions() {
            let buf = encode_one(&transaction, 42);
            let (decoded, fence, total) = decode_record(&buf).unwrap();
            assert_eq!(decoded, transaction);
            assert_eq!(fence, 42);
            assert_eq!(
                total,
                RECORD_HEADER_SIZE + transaction.payload_len()
            );
        }
    }

    #[test]
    fn test_record_alignment() {
        for transaction in sample_transactions() {
            let buf = encode_one(&transaction, 0);
            assert_eq!(buf.len() as u64 % RECORD_ALIGNMENT, 0);

            let bytes_following =
                u64::from_le_bytes(buf[8..16].try_into().unwrap()) as usize;
            assert_eq!(
                bytes_following + 16,
                RECORD_HEADER_SIZE + transaction.payload_len()
            );
        }
    }

    #[test]
    fn test_record_crc_detects_corruption() {
        let transaction = Transaction::PutInodeRec {
            inode_number: 1,
            value: Bytes::from_static(b"payload"),
        };
        let mut buf = encode_one(&transaction, 0);
        buf[40] ^= 0x01;
        assert!(matches!(decode_record(&buf), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_record_unknown_type() {
        let transaction = Transaction::DeleteInodeRec { inode_number: 1 };
        let mut buf = encode_one(&transaction, 0);
        // Overwrite the type word and make the CRC valid again, so only
        // the type check can object.
        buf[24..32].copy_from_slice(&99u64.to_le_bytes());
        let total = RECORD_HEADER_SIZE + transaction.payload_len();
        let crc = REPLAY_CRC.checksum(&buf[8..total]);
        buf[0..8].copy_from_slice(&crc.to_le_bytes());
        let err = decode_record(&buf).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn test_log_append_scan_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replay.log");

        let mut log = ReplayLog::new(path.clone());
        assert!(log.open_and_scan(5).unwrap().is_empty());
        for transaction in sample_transactions() {
            log.append(&transaction, 5).unwrap();
        }
        drop(log);

        let mut log = ReplayLog::new(path);
        let replayed = log.open_and_scan(5).unwrap();
        assert_eq!(replayed, sample_transactions());
    }

    #[test]
    fn test_log_truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replay.log");

        let mut log = ReplayLog::new(path.clone());
        log.open_and_scan(0).unwrap();
        log.append(
            &Transaction::PutInodeRec {
                inode_number: 1,
                value: Bytes::from_static(b"one"),
            },
            0,
        )
        .unwrap();
        log.append(
            &Transaction::PutInodeRec {
                inode_number: 2,
                value: Bytes::from_static(b"two"),
            },
            0,
        )
        .unwrap();
        drop(log);

        // A record torn mid-write: 2000 bytes of garbage.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xAB; 2000]).unwrap();
        drop(file);

        let mut log = ReplayLog::new(path.clone());
        let replayed = log.open_and_scan(0).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            2 * RECORD_ALIGNMENT
        );
    }

    #[test]
    fn test_log_truncates_full_garbage_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replay.log");

        let mut log = ReplayLog::new(path.clone());
        log.open_and_scan(0).unwrap();
        log.append(
            &Transaction::DeleteInodeRec { inode_number: 3 },
            0,
        )
        .unwrap();
        drop(log);

        // One full alignment unit of garbage after a valid record.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&vec![0x5A; RECORD_ALIGNMENT as usize]).unwrap();
        drop(file);

        let mut log = ReplayLog::new(path.clone());
        let replayed = log.open_and_scan(0).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), RECORD_ALIGNMENT);
    }

    #[test]
    fn test_log_fence_mismatch_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replay.log");

        let mut log = ReplayLog::new(path.clone());
        log.open_and_scan(7).unwrap();
        log.append(
            &Transaction::PutInodeRec {
                inode_number: 1,
                value: Bytes::from_static(b"stale"),
            },
            7,
        )
        .unwrap();
        drop(log);

        // A later checkpoint moved the fence; the stale log must not replay.
        let mut log = ReplayLog::new(path.clone());
        let replayed = log.open_and_scan(8).unwrap();
        assert!(replayed.is_empty());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_log_exclusive_create() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replay.log");
        std::fs::write(&path, b"leftover").unwrap();

        let mut log = ReplayLog::new(path);
        let err = log
            .append(&Transaction::DeleteInodeRec { inode_number: 1 }, 0)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[test]
    fn test_log_discard() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replay.log");

        let mut log = ReplayLog::new(path.clone());
        log.append(&Transaction::DeleteInodeRec { inode_number: 1 }, 0)
            .unwrap();
        log.discard().unwrap();
        assert!(!path.exists());

        // Tolerates an already-absent file.
        log.discard().unwrap();
    }

    #[test]
    fn test_oversized_record_spans_multiple_alignment_units() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replay.log");

        let big = Transaction::PutInodeRec {
            inode_number: 1,
            value: Bytes::from(vec![0x42; 10_000]),
        };
        let small = Transaction::DeleteInodeRec { inode_number: 2 };

        let mut log = ReplayLog::new(path.clone());
        log.append(&big, 0).unwrap();
        log.append(&small, 0).unwrap();
        drop(log);

        let mut log = ReplayLog::new(path);
        let replayed = log.open_and_scan(0).unwrap();
        assert_eq!(replayed, vec![big, small]);
    }
}
