//! Durable checkpoint formats
//!
//! Two records anchor a checkpoint:
//!
//! - the **header**, a single container header string of four
//!   space-separated 16-digit hex words
//!   (`version objectNumber objectLength reservedToNonce`), and
//! - the **trailer**, a little-endian binary record at the tail of the
//!   current checkpoint object pointing at the three tree roots and
//!   carrying the three layout reports.
//!
//! The header POST is the commit point of a checkpoint; everything else
//! is reachable from it.

use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::btree::NodeLocation;
use metafs_core::{Error, Result};

/// Checkpoint header version this build reads and writes.
pub const CHECKPOINT_VERSION: u64 = 2;

/// Container header carrying the checkpoint header string.
pub const CHECKPOINT_HEADER_NAME: &str = "X-Container-Meta-Checkpoint";

/// Account header marking the account as bi-modal (filesystem-backed).
pub const BI_MODAL_HEADER_NAME: &str = "X-Account-Meta-Bi-Modal";

/// Container header selecting the storage policy at creation.
pub const STORAGE_POLICY_HEADER_NAME: &str = "X-Storage-Policy";

/// Fixed trailer size: 12 little-endian u64 words.
pub const TRAILER_FIXED_SIZE: usize = 96;

/// Size of one `(objectNumber, objectBytes)` layout pair.
pub const LAYOUT_ELEMENT_SIZE: usize = 16;

/// The durable checkpoint header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointHeader {
    /// Format version; must equal [`CHECKPOINT_VERSION`].
    pub version: u64,
    /// Object whose tail holds the trailer; 0 = no checkpoint yet.
    pub object_number: u64,
    /// Length of the trailer region at the tail of that object.
    pub object_length: u64,
    /// Highest nonce durably reserved.
    pub reserved_to_nonce: u64,
}

impl CheckpointHeader {
    /// Header seeded when a volume is auto-formatted.
    pub fn formatted(first_nonce: u64) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            object_number: 0,
            object_length: 0,
            reserved_to_nonce: first_nonce,
        }
    }

    /// Parse a header string.
    ///
    /// # Errors
    ///
    /// - `Error::Parse` on a wrong field count or unparseable hex
    /// - `Error::UnsupportedVersion` on a version this build does not speak
    pub fn parse(value: &str) -> Result<Self> {
        let fields: Vec<&str> = value.split(' ').collect();
        if fields.len() != 4 {
            return Err(Error::Parse(format!(
                "checkpoint header has {} fields, expected 4",
                fields.len()
            )));
        }
        let mut words = [0u64; 4];
        for (word, field) in words.iter_mut().zip(&fields) {
            if field.len() != 16 {
                return Err(Error::Parse(format!(
                    "checkpoint header word `{field}` is not 16 hex digits"
                )));
            }
            *word = u64::from_str_radix(field, 16).map_err(|_| {
                Error::Parse(format!("checkpoint header word `{field}` is not valid hex"))
            })?;
        }
        if words[0] != CHECKPOINT_VERSION {
            return Err(Error::UnsupportedVersion { found: words[0] });
        }
        Ok(Self {
            version: words[0],
            object_number: words[1],
            object_length: words[2],
            reserved_to_nonce: words[3],
        })
    }
}

impl fmt::Display for CheckpointHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016X} {:016X} {:016X} {:016X}",
            self.version, self.object_number, self.object_length, self.reserved_to_nonce
        )
    }
}

/// Object name of a checkpoint object: its nonce, hex-printed.
pub fn object_name(object_number: u64) -> String {
    format!("{object_number:016X}")
}

/// The binary record at the tail of the current checkpoint object.
///
/// A zeroed root location means the corresponding tree has never held
/// data. The three element counts give the number of layout pairs that
/// follow the fixed fields, in inode-rec, log-segment-rec,
/// b-plus-tree-object order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckpointTrailer {
    /// Inode-rec tree root.
    pub inode_rec_root: NodeLocation,
    /// Log-segment-rec tree root.
    pub log_segment_rec_root: NodeLocation,
    /// B+Tree-object tree root.
    pub b_plus_tree_object_root: NodeLocation,
    /// Layout pair counts per tree.
    pub layout_counts: [u64; 3],
}

impl CheckpointTrailer {
    /// Serialize the fixed fields.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(TRAILER_FIXED_SIZE);
        for root in [
            &self.inode_rec_root,
            &self.log_segment_rec_root,
            &self.b_plus_tree_object_root,
        ] {
            buf.write_u64::<LittleEndian>(root.object_number)?;
            buf.write_u64::<LittleEndian>(root.offset)?;
            buf.write_u64::<LittleEndian>(root.length)?;
        }
        for count in self.layout_counts {
            buf.write_u64::<LittleEndian>(count)?;
        }
        Ok(buf)
    }

    /// Deserialize a trailer region: fixed fields followed by the three
    /// layout arrays.
    ///
    /// # Errors
    ///
    /// `Error::Corrupt` when the region is shorter than the fixed fields
    /// or the remaining bytes disagree with the declared element counts.
    pub fn decode(buf: &[u8]) -> Result<(Self, [HashMap<u64, u64>; 3])> {
        if buf.len() < TRAILER_FIXED_SIZE {
            return Err(Error::corrupt(format!(
                "checkpoint trailer is {} bytes, expected at least {}",
                buf.len(),
                TRAILER_FIXED_SIZE
            )));
        }
        let mut cursor = Cursor::new(buf);
        let mut roots = [NodeLocation::default(); 3];
        for root in &mut roots {
            root.object_number = read_u64(&mut cursor)?;
            root.offset = read_u64(&mut cursor)?;
            root.length = read_u64(&mut cursor)?;
        }
        let mut layout_counts = [0u64; 3];
        for count in &mut layout_counts {
            *count = read_u64(&mut cursor)?;
        }

        let declared: u64 = layout_counts.iter().sum();
        let remaining = (buf.len() - TRAILER_FIXED_SIZE) as u64;
        if remaining != declared * LAYOUT_ELEMENT_SIZE as u64 {
            return Err(Error::corrupt(format!(
                "checkpoint trailer carries {remaining} layout bytes, expected {}",
                declared * LAYOUT_ELEMENT_SIZE as u64
            )));
        }

        let mut layouts = [HashMap::new(), HashMap::new(), HashMap::new()];
        for (layout, count) in layouts.iter_mut().zip(layout_counts) {
            for _ in 0..count {
                let object_number = read_u64(&mut cursor)?;
                let bytes_used = read_u64(&mut cursor)?;
                layout.insert(object_number, bytes_used);
            }
        }

        let trailer = Self {
            inode_rec_root: roots[0],
            log_segment_rec_root: roots[1],
            b_plus_tree_object_root: roots[2],
            layout_counts,
        };
        Ok((trailer, layouts))
    }
}

/// Serialize the three layout reports as packed `(object, bytes)` pairs,
/// each report's entries in ascending object order.
pub fn encode_layouts(layouts: [&HashMap<u64, u64>; 3]) -> Result<Vec<u8>> {
    let total: usize = layouts.iter().map(|l| l.len()).sum();
    let mut buf = Vec::with_capacity(total * LAYOUT_ELEMENT_SIZE);
    for layout in layouts {
        let mut entries: Vec<(u64, u64)> = layout.iter().map(|(&o, &b)| (o, b)).collect();
        entries.sort_unstable_by_key(|&(o, _)| o);
        for (object_number, bytes_used) in entries {
            buf.write_u64::<LittleEndian>(object_number)?;
            buf.write_u64::<LittleEndian>(bytes_used)?;
        }
    }
    Ok(buf)
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| Error::corrupt("truncated checkpoint trailer"))
}
