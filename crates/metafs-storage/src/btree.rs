//! B+Tree map over object-store nodes
//!
//! A two-level tree (one root index node over a row of leaf nodes) keyed by
//! `u64` with opaque byte-string values. The tree never talks to the store
//! directly: every node read and write goes through the [`NodeIo`] callbacks
//! supplied per call, which is where the volume credits its layout reports
//! and routes writes into the shared chunked-PUT stream.
//!
//! Leaves split once they exceed twice the configured fanout and are
//! dropped when emptied. Clean leaves are cached in memory up to a
//! configured capacity and evicted least-recently-used; dirty leaves are
//! pinned until the next flush.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::num::NonZeroUsize;

use async_trait::async_trait;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use lru::LruCache;

use metafs_core::{Error, Result};

/// Where a serialized node lives in the checkpoint container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeLocation {
    /// Object number (hex-printed to form the object name).
    pub object_number: u64,
    /// Byte offset of the node within the object.
    pub offset: u64,
    /// Serialized node length in bytes.
    pub length: u64,
}

/// Node I/O callbacks implemented by the volume.
///
/// `write_node` is only ever invoked from a flush; reads may happen on any
/// access that misses the cache.
#[async_trait]
pub trait NodeIo: Send {
    /// Ship one serialized node, returning the object number and offset it
    /// landed at.
    async fn write_node(&mut self, node: Bytes) -> Result<(u64, u64)>;

    /// Read one serialized node back.
    async fn read_node(&mut self, location: NodeLocation) -> Result<Bytes>;

    /// Tell the layout accounting that a previously written node is dead.
    fn discard_node(&mut self, object_number: u64, length: u64);
}

struct Leaf {
    entries: BTreeMap<u64, Bytes>,
}

struct LeafSlot {
    /// Stable identity for the recency tracker; survives slot reordering.
    id: u64,
    /// Lowest key this leaf may hold.
    separator: u64,
    /// On-store location, absent for leaves never flushed.
    location: Option<NodeLocation>,
    /// Resident node, absent when evicted.
    node: Option<Leaf>,
    dirty: bool,
}

/// Two-level B+Tree with u64 keys and opaque values.
pub struct BPlusTree {
    slots: Vec<LeafSlot>,
    root_location: Option<NodeLocation>,
    root_loaded: bool,
    root_dirty: bool,
    next_leaf_id: u64,
    len: u64,
    fanout: usize,
    recency: LruCache<u64, ()>,
}

impl BPlusTree {
    /// Create a fresh empty tree.
    pub fn new(fanout: usize, cache_capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            root_location: None,
            root_loaded: true,
            root_dirty: false,
            next_leaf_id: 0,
            len: 0,
            fanout: fanout.max(1),
            recency: LruCache::new(
                NonZeroUsize::new(cache_capacity.max(1)).expect("capacity is nonzero"),
            ),
        }
    }

    /// Reopen a tree from the root location recorded in a checkpoint
    /// trailer. The root node itself is read lazily on first access.
    pub fn open(root: NodeLocation, fanout: usize, cache_capacity: usize) -> Self {
        let mut tree = Self::new(fanout, cache_capacity);
        tree.root_location = Some(root);
        tree.root_loaded = false;
        tree
    }

    /// Number of entries in the tree.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Look up a key.
    pub async fn get(&mut self, key: u64, io: &mut dyn NodeIo) -> Result<Option<Bytes>> {
        self.ensure_root(io).await?;
        let Some(idx) = self.slot_for_lookup(key) else {
            return Ok(None);
        };
        self.ensure_leaf(idx, io).await?;
        let leaf = self.slots[idx].node.as_ref().expect("leaf is resident");
        let value = leaf.entries.get(&key).cloned();
        self.touch(idx);
        Ok(value)
    }

    /// Update an existing key, returning false if the key is absent.
    pub async fn patch_by_key(
        &mut self,
        key: u64,
        value: Bytes,
        io: &mut dyn NodeIo,
    ) -> Result<bool> {
        self.ensure_root(io).await?;
        let Some(idx) = self.slot_for_lookup(key) else {
            return Ok(false);
        };
        self.ensure_leaf(idx, io).await?;
        let patched = {
            let leaf = self.slots[idx].node.as_mut().expect("leaf is resident");
            if leaf.entries.contains_key(&key) {
                leaf.entries.insert(key, value);
                true
            } else {
                false
            }
        };
        if patched {
            self.dirtied(idx);
        } else {
            self.touch(idx);
        }
        Ok(patched)
    }

    /// Insert or replace a key.
    pub async fn put(&mut self, key: u64, value: Bytes, io: &mut dyn NodeIo) -> Result<()> {
        self.ensure_root(io).await?;

        if self.slots.is_empty() {
            let mut entries = BTreeMap::new();
            entries.insert(key, value);
            let id = self.alloc_leaf_id();
            self.slots.push(LeafSlot {
                id,
                separator: key,
                location: None,
                node: Some(Leaf { entries }),
                dirty: true,
            });
            self.len = 1;
            self.root_dirty = true;
            return Ok(());
        }

        let idx = if key < self.slots[0].separator {
            self.slots[0].separator = key;
            self.root_dirty = true;
            0
        } else {
            self.slots.partition_point(|s| s.separator <= key) - 1
        };

        self.ensure_leaf(idx, io).await?;
        let (inserted, entries) = {
            let leaf = self.slots[idx].node.as_mut().expect("leaf is resident");
            let inserted = leaf.entries.insert(key, value).is_none();
            (inserted, leaf.entries.len())
        };
        if inserted {
            self.len += 1;
        }
        self.dirtied(idx);

        if entries > 2 * self.fanout {
            self.split(idx);
        }
        Ok(())
    }

    /// Delete a key, returning whether it was present.
    pub async fn delete_by_key(&mut self, key: u64, io: &mut dyn NodeIo) -> Result<bool> {
        self.ensure_root(io).await?;
        let Some(idx) = self.slot_for_lookup(key) else {
            return Ok(false);
        };
        self.ensure_leaf(idx, io).await?;
        let (removed, emptied) = {
            let leaf = self.slots[idx].node.as_mut().expect("leaf is resident");
            let removed = leaf.entries.remove(&key).is_some();
            (removed, leaf.entries.is_empty())
        };
        if !removed {
            self.touch(idx);
            return Ok(false);
        }
        self.len -= 1;

        if emptied {
            let slot = self.slots.remove(idx);
            if let Some(old) = slot.location {
                io.discard_node(old.object_number, old.length);
            }
            self.recency.pop(&slot.id);
            self.root_dirty = true;
        } else {
            self.dirtied(idx);
        }
        Ok(true)
    }

    /// Serialize every dirty leaf and, if anything changed, a new root
    /// node through `io`. Returns the current root location; `None` means
    /// the tree has never held data.
    ///
    /// With `evict_clean` set, resident nodes are dropped after the flush
    /// instead of staying cached.
    pub async fn flush(
        &mut self,
        io: &mut dyn NodeIo,
        evict_clean: bool,
    ) -> Result<Option<NodeLocation>> {
        if !self.root_loaded {
            // Never touched since open; the persisted root still holds.
            return Ok(self.root_location);
        }
        let any_dirty = self.root_dirty || self.slots.iter().any(|s| s.dirty);
        if !any_dirty {
            if evict_clean {
                self.evict_all();
            }
            return Ok(self.root_location);
        }

        for idx in 0..self.slots.len() {
            if !self.slots[idx].dirty {
                continue;
            }
            let buf = {
                let leaf = self.slots[idx]
                    .node
                    .as_ref()
                    .ok_or_else(|| Error::internal("dirty leaf without resident node"))?;
                encode_leaf(leaf)?
            };
            let length = buf.len() as u64;
            let (object_number, offset) = io.write_node(Bytes::from(buf)).await?;
            if let Some(old) = self.slots[idx].location.replace(NodeLocation {
                object_number,
                offset,
                length,
            }) {
                io.discard_node(old.object_number, old.length);
            }
            self.slots[idx].dirty = false;
            self.root_dirty = true;
            self.touch(idx);
        }

        let buf = encode_root(self.len, &self.slots)?;
        let length = buf.len() as u64;
        let (object_number, offset) = io.write_node(Bytes::from(buf)).await?;
        if let Some(old) = self.root_location.replace(NodeLocation {
            object_number,
            offset,
            length,
        }) {
            io.discard_node(old.object_number, old.length);
        }
        self.root_dirty = false;

        if evict_clean {
            self.evict_all();
        }
        Ok(self.root_location)
    }

    /// Drop every clean resident node, keeping only locations.
    pub fn prune(&mut self) {
        for slot in &mut self.slots {
            if !slot.dirty {
                slot.node = None;
            }
        }
        self.recency.clear();
    }

    /// Recompute the bytes referenced per object from the live node
    /// locations. Leaves that were never flushed contribute nothing.
    pub async fn layout_report(&mut self, io: &mut dyn NodeIo) -> Result<HashMap<u64, u64>> {
        self.ensure_root(io).await?;
        let mut report = HashMap::new();
        if let Some(root) = self.root_location {
            *report.entry(root.object_number).or_insert(0) += root.length;
        }
        for slot in &self.slots {
            if let Some(loc) = slot.location {
                *report.entry(loc.object_number).or_insert(0) += loc.length;
            }
        }
        Ok(report)
    }

    fn alloc_leaf_id(&mut self) -> u64 {
        let id = self.next_leaf_id;
        self.next_leaf_id += 1;
        id
    }

    fn slot_for_lookup(&self, key: u64) -> Option<usize> {
        if self.slots.is_empty() || key < self.slots[0].separator {
            return None;
        }
        Some(self.slots.partition_point(|s| s.separator <= key) - 1)
    }

    async fn ensure_root(&mut self, io: &mut dyn NodeIo) -> Result<()> {
        if self.root_loaded {
            return Ok(());
        }
        let location = self
            .root_location
            .ok_or_else(|| Error::internal("unloaded tree without a root location"))?;
        let buf = io.read_node(location).await?;
        let (len, mut slots) = decode_root(&buf)?;
        for slot in &mut slots {
            slot.id = self.alloc_leaf_id();
        }
        self.len = len;
        self.slots = slots;
        self.root_loaded = true;
        Ok(())
    }

    async fn ensure_leaf(&mut self, idx: usize, io: &mut dyn NodeIo) -> Result<()> {
        if self.slots[idx].node.is_some() {
            return Ok(());
        }
        let location = self.slots[idx]
            .location
            .ok_or_else(|| Error::internal("evicted leaf without a location"))?;
        let buf = io.read_node(location).await?;
        self.slots[idx].node = Some(decode_leaf(&buf)?);
        self.touch(idx);
        Ok(())
    }

    /// Record a use of a clean leaf, evicting the least-recently-used
    /// clean leaf beyond the cache capacity. Dirty leaves are pinned and
    /// never tracked.
    fn touch(&mut self, idx: usize) {
        let id = self.slots[idx].id;
        if self.slots[idx].dirty {
            self.recency.pop(&id);
            return;
        }
        if let Some((evicted, ())) = self.recency.push(id, ()) {
            if evicted != id {
                if let Some(slot) = self.slots.iter_mut().find(|s| s.id == evicted) {
                    slot.node = None;
                }
            }
        }
    }

    fn dirtied(&mut self, idx: usize) {
        self.slots[idx].dirty = true;
        let id = self.slots[idx].id;
        self.recency.pop(&id);
    }

    fn evict_all(&mut self) {
        self.prune();
    }

    fn split(&mut self, idx: usize) {
        let fanout = self.fanout;
        let leaf = self.slots[idx].node.as_mut().expect("leaf is resident");
        let median = *leaf
            .entries
            .keys()
            .nth(fanout)
            .expect("split only happens above 2*fanout entries");
        let right = leaf.entries.split_off(&median);
        let id = self.alloc_leaf_id();
        self.slots.insert(
            idx + 1,
            LeafSlot {
                id,
                separator: median,
                location: None,
                node: Some(Leaf { entries: right }),
                dirty: true,
            },
        );
        self.root_dirty = true;
    }
}

// Node formats, little-endian throughout.
//
// Root:  [entry_count | leaf_count | {separator, object, offset, length} x leaf_count]
// Leaf:  [entry_count | {key, value_length, value bytes} x entry_count]

fn encode_root(len: u64, slots: &[LeafSlot]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(16 + 32 * slots.len());
    buf.write_u64::<LittleEndian>(len)?;
    buf.write_u64::<LittleEndian>(slots.len() as u64)?;
    for slot in slots {
        let loc = slot
            .location
            .ok_or_else(|| Error::internal("flushing root over an unflushed leaf"))?;
        buf.write_u64::<LittleEndian>(slot.separator)?;
        buf.write_u64::<LittleEndian>(loc.object_number)?;
        buf.write_u64::<LittleEndian>(loc.offset)?;
        buf.write_u64::<LittleEndian>(loc.length)?;
    }
    Ok(buf)
}

fn decode_root(buf: &[u8]) -> Result<(u64, Vec<LeafSlot>)> {
    let mut cursor = Cursor::new(buf);
    let len = read_u64(&mut cursor)?;
    let leaf_count = read_u64(&mut cursor)?;
    let mut slots = Vec::with_capacity(leaf_count as usize);
    for _ in 0..leaf_count {
        let separator = read_u64(&mut cursor)?;
        let object_number = read_u64(&mut cursor)?;
        let offset = read_u64(&mut cursor)?;
        let length = read_u64(&mut cursor)?;
        slots.push(LeafSlot {
            id: 0,
            separator,
            location: Some(NodeLocation {
                object_number,
                offset,
                length,
            }),
            node: None,
            dirty: false,
        });
    }
    Ok((len, slots))
}

fn encode_leaf(leaf: &Leaf) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.write_u64::<LittleEndian>(leaf.entries.len() as u64)?;
    for (key, value) in &leaf.entries {
        buf.write_u64::<LittleEndian>(*key)?;
        buf.write_u64::<LittleEndian>(value.len() as u64)?;
        buf.extend_from_slice(value);
    }
    Ok(buf)
}

fn decode_leaf(buf: &[u8]) -> Result<Leaf> {
    let mut cursor = Cursor::new(buf);
    let count = read_u64(&mut cursor)?;
    let mut entries = BTreeMap::new();
    for _ in 0..count {
        let key = read_u64(&mut cursor)?;
        let length = read_u64(&mut cursor)? as usize;
        let start = cursor.position() as usize;
        let end = start
            .checked_add(length)
            .filter(|&end| end <= buf.len())
            .ok_or_else(|| Error::corrupt("leaf node value overruns the node"))?;
        entries.insert(key, Bytes::copy_from_slice(&buf[start..end]));
        cursor.set_position(end as u64);
    }
    Ok(Leaf { entries })
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| Error::corrupt("truncated tree node"))
}
