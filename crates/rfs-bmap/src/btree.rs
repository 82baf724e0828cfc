//! On-disk block-map btree.
//!
//! Used when a fork is in `BTree` format: the root (key/pointer pairs)
//! lives in the fork's inline area, external nodes and leaves occupy
//! full blocks read through the buffer cache. Leaves hold extent
//! records; nodes hold `(first_offset, child_block)` entries.
//!
//! The tree mirrors the in-core extent list record-for-record (real
//! extents only — delayed extents have no on-disk form), so all
//! operations here are single-record: `lookup_exact`, `insert`,
//! `update`, `delete`, plus `walk` for conversions and verification.
//!
//! Tree blocks are allocated and freed through [`BtreeBlockSource`], so
//! the caller decides how allocation is charged and how frees are
//! deferred.

use crate::record::{ExtentRec, REC_SIZE};
use rfs_block::{BlockDevice, BufCache};
use rfs_error::{Result, RfsError};
use rfs_types::{put_le_u16, put_le_u64, read_le_u16, read_le_u64, DiskBlock, FileBlock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Magic for bmap btree blocks (leaves and nodes).
const BMAP_MAGIC: u16 = 0x424D;

/// Block header: magic, level, nrecs, reserved.
const HEADER_SIZE: usize = 8;

/// Node entry: key (first offset) + child pointer.
const NODE_ENTRY_SIZE: usize = 16;

/// Key/pointer pairs the in-fork root area can hold.
pub const ROOT_MAX_ENTRIES: usize = 4;

// ── Fan-out ─────────────────────────────────────────────────────────────────

/// Btree fan-out parameters derived from the block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtreeFanout {
    /// Extent records per leaf block.
    pub leaf: u32,
    /// Entries per node block.
    pub node: u32,
    /// Maximum tree height, counting the root.
    pub max_levels: u32,
}

impl BtreeFanout {
    #[must_use]
    pub fn for_block_size(block_size: u32) -> Self {
        let payload = block_size as usize - HEADER_SIZE;
        Self {
            leaf: u32::try_from(payload / REC_SIZE).expect("fanout fits u32"),
            node: u32::try_from(payload / NODE_ENTRY_SIZE).expect("fanout fits u32"),
            max_levels: 5,
        }
    }
}

// ── Root ────────────────────────────────────────────────────────────────────

/// Btree root held in the fork inline area.
///
/// `level` is the height of the tree: children of the root are at
/// `level - 1`, leaves are level 0. A valid root has at least one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BmapRoot {
    pub level: u16,
    pub entries: Vec<(FileBlock, DiskBlock)>,
}

impl BmapRoot {
    /// The single remaining leaf, when the tree has collapsed far enough
    /// for the btree-to-array conversion.
    #[must_use]
    pub fn single_leaf(&self) -> Option<DiskBlock> {
        (self.level == 1 && self.entries.len() == 1).then(|| self.entries[0].1)
    }
}

/// Allocation seam for tree blocks.
pub trait BtreeBlockSource {
    /// Allocate one block for a new tree node or leaf.
    fn alloc_block(&mut self) -> Result<DiskBlock>;

    /// Release a tree block that fell out of the structure. Implementors
    /// typically defer the actual free to transaction commit.
    fn free_block(&mut self, block: DiskBlock) -> Result<()>;
}

// ── Block codec ─────────────────────────────────────────────────────────────

enum BlockBody {
    Leaf(Vec<ExtentRec>),
    Node(Vec<(FileBlock, DiskBlock)>),
}

fn parse_block(data: &[u8], at_block: u64) -> Result<(u16, BlockBody)> {
    let magic = read_le_u16(data, 0).map_err(|_| truncated(at_block))?;
    if magic != BMAP_MAGIC {
        return Err(RfsError::corrupt(
            at_block,
            format!("bad bmap btree magic {magic:#06x}"),
        ));
    }
    let level = read_le_u16(data, 2).map_err(|_| truncated(at_block))?;
    let nrecs = usize::from(read_le_u16(data, 4).map_err(|_| truncated(at_block))?);

    if level == 0 {
        if HEADER_SIZE + nrecs * REC_SIZE > data.len() {
            return Err(truncated(at_block));
        }
        let mut recs = Vec::with_capacity(nrecs);
        for i in 0..nrecs {
            let start = HEADER_SIZE + i * REC_SIZE;
            recs.push(ExtentRec::decode(&data[start..start + REC_SIZE], at_block)?);
        }
        Ok((level, BlockBody::Leaf(recs)))
    } else {
        if HEADER_SIZE + nrecs * NODE_ENTRY_SIZE > data.len() {
            return Err(truncated(at_block));
        }
        let mut entries = Vec::with_capacity(nrecs);
        for i in 0..nrecs {
            let start = HEADER_SIZE + i * NODE_ENTRY_SIZE;
            let key = read_le_u64(data, start).map_err(|_| truncated(at_block))?;
            let ptr = read_le_u64(data, start + 8).map_err(|_| truncated(at_block))?;
            entries.push((FileBlock(key), DiskBlock(ptr)));
        }
        Ok((level, BlockBody::Node(entries)))
    }
}

fn truncated(at_block: u64) -> RfsError {
    RfsError::corrupt(at_block, "truncated bmap btree block")
}

fn serialize_leaf(block_size: u32, recs: &[ExtentRec]) -> Result<Vec<u8>> {
    let mut data = vec![0_u8; block_size as usize];
    put_le_u16(&mut data, 0, BMAP_MAGIC);
    put_le_u16(&mut data, 2, 0);
    put_le_u16(
        &mut data,
        4,
        u16::try_from(recs.len()).map_err(|_| RfsError::corrupt(0, "leaf record count"))?,
    );
    for (i, rec) in recs.iter().enumerate() {
        let start = HEADER_SIZE + i * REC_SIZE;
        rec.encode(&mut data[start..start + REC_SIZE])?;
    }
    Ok(data)
}

fn serialize_node(
    block_size: u32,
    level: u16,
    entries: &[(FileBlock, DiskBlock)],
) -> Result<Vec<u8>> {
    debug_assert!(level >= 1);
    let mut data = vec![0_u8; block_size as usize];
    put_le_u16(&mut data, 0, BMAP_MAGIC);
    put_le_u16(&mut data, 2, level);
    put_le_u16(
        &mut data,
        4,
        u16::try_from(entries.len()).map_err(|_| RfsError::corrupt(0, "node entry count"))?,
    );
    for (i, (key, ptr)) in entries.iter().enumerate() {
        let start = HEADER_SIZE + i * NODE_ENTRY_SIZE;
        put_le_u64(&mut data, start, key.0);
        put_le_u64(&mut data, start + 8, ptr.0);
    }
    Ok(data)
}

fn read_body<D: BlockDevice>(
    cache: &BufCache<D>,
    block: DiskBlock,
    expect_level: u16,
) -> Result<BlockBody> {
    let buf = cache.read_block(block)?;
    let (level, body) = parse_block(buf.data(), block.0)?;
    if level != expect_level {
        return Err(RfsError::corrupt(
            block.0,
            format!("bmap btree level mismatch: expected {expect_level}, got {level}"),
        ));
    }
    Ok(body)
}

// ── Construction ────────────────────────────────────────────────────────────

/// Build a one-leaf tree from an ordered record slice (the
/// array-to-btree conversion). All records must be real.
pub fn create_from_records<D: BlockDevice>(
    cache: &BufCache<D>,
    src: &mut dyn BtreeBlockSource,
    fanout: &BtreeFanout,
    records: &[ExtentRec],
) -> Result<BmapRoot> {
    if records.len() > fanout.leaf as usize {
        return Err(RfsError::corrupt(
            0,
            format!(
                "array-to-btree conversion with {} records exceeds one leaf",
                records.len()
            ),
        ));
    }
    let leaf_block = src.alloc_block()?;
    let data = serialize_leaf(cache.block_size(), records)?;
    cache.write_block(leaf_block, &data)?;

    let first_key = records.first().map_or(FileBlock(0), |rec| rec.offset);
    debug!(
        leaf_block = leaf_block.0,
        records = records.len(),
        "bmap_btree_create"
    );
    Ok(BmapRoot {
        level: 1,
        entries: vec![(first_key, leaf_block)],
    })
}

// ── Lookup / walk ───────────────────────────────────────────────────────────

/// Find the record whose `offset` exactly equals `offset`.
pub fn lookup_exact<D: BlockDevice>(
    cache: &BufCache<D>,
    root: &BmapRoot,
    offset: FileBlock,
) -> Result<Option<ExtentRec>> {
    let Some(mut block) = child_for(&root.entries, offset) else {
        return Ok(None);
    };
    let mut level = root.level - 1;
    loop {
        match read_body(cache, block, level)? {
            BlockBody::Leaf(recs) => {
                return Ok(recs.into_iter().find(|rec| rec.offset == offset));
            }
            BlockBody::Node(entries) => {
                let Some(child) = child_for(&entries, offset) else {
                    return Ok(None);
                };
                block = child;
                level -= 1;
            }
        }
    }
}

/// Visit every record in logical order. Returns the record count.
pub fn walk<D: BlockDevice, F>(
    cache: &BufCache<D>,
    root: &BmapRoot,
    visitor: &mut F,
) -> Result<usize>
where
    F: FnMut(&ExtentRec) -> Result<()>,
{
    let mut count = 0;
    for &(_, child) in &root.entries {
        count += walk_subtree(cache, child, root.level - 1, visitor)?;
    }
    Ok(count)
}

fn walk_subtree<D: BlockDevice, F>(
    cache: &BufCache<D>,
    block: DiskBlock,
    level: u16,
    visitor: &mut F,
) -> Result<usize>
where
    F: FnMut(&ExtentRec) -> Result<()>,
{
    match read_body(cache, block, level)? {
        BlockBody::Leaf(recs) => {
            for rec in &recs {
                visitor(rec)?;
            }
            Ok(recs.len())
        }
        BlockBody::Node(entries) => {
            let mut count = 0;
            for &(_, child) in &entries {
                count += walk_subtree(cache, child, level - 1, visitor)?;
            }
            Ok(count)
        }
    }
}

/// Total number of records in the tree.
pub fn record_count<D: BlockDevice>(cache: &BufCache<D>, root: &BmapRoot) -> Result<u64> {
    let count = walk(cache, root, &mut |_| Ok(()))?;
    Ok(count as u64)
}

/// The child subtree that would hold `offset`: last entry with
/// `key <= offset`, falling back to the first entry for under-key
/// offsets (only reachable on insert paths).
fn child_for(entries: &[(FileBlock, DiskBlock)], offset: FileBlock) -> Option<DiskBlock> {
    if entries.is_empty() {
        return None;
    }
    let pos = entries.partition_point(|&(key, _)| key <= offset);
    Some(entries[pos.saturating_sub(1)].1)
}

fn child_index(entries: &[(FileBlock, DiskBlock)], offset: FileBlock) -> usize {
    entries
        .partition_point(|&(key, _)| key <= offset)
        .saturating_sub(1)
}

// ── Insert ──────────────────────────────────────────────────────────────────

/// Insert a record. The record's offset must not collide with an
/// existing record; ordering relative to neighbors is the caller's
/// contract (the in-core list is the authority).
pub fn insert<D: BlockDevice>(
    cache: &BufCache<D>,
    src: &mut dyn BtreeBlockSource,
    fanout: &BtreeFanout,
    root: &mut BmapRoot,
    rec: ExtentRec,
) -> Result<()> {
    trace!(
        offset = rec.offset.0,
        len = rec.len,
        level = root.level,
        "bmap_btree_insert"
    );
    if root.entries.is_empty() {
        // Tree was deleted down to nothing; restart with a fresh leaf.
        let leaf = src.alloc_block()?;
        cache.write_block(leaf, &serialize_leaf(cache.block_size(), &[rec])?)?;
        root.level = 1;
        root.entries = vec![(rec.offset, leaf)];
        return Ok(());
    }
    let pos = child_index(&root.entries, rec.offset);
    let child = root.entries[pos].1;

    let promoted = insert_descend(cache, src, fanout, child, root.level - 1, rec)?;

    // A new first record lowers the separator key on its path.
    if rec.offset < root.entries[pos].0 {
        root.entries[pos].0 = rec.offset;
    }
    if let Some(entry) = promoted {
        let at = root
            .entries
            .partition_point(|&(key, _)| key < entry.0);
        root.entries.insert(at, entry);
    }

    if root.entries.len() > ROOT_MAX_ENTRIES {
        grow_root(cache, src, fanout, root)?;
    }
    Ok(())
}

fn insert_descend<D: BlockDevice>(
    cache: &BufCache<D>,
    src: &mut dyn BtreeBlockSource,
    fanout: &BtreeFanout,
    block: DiskBlock,
    level: u16,
    rec: ExtentRec,
) -> Result<Option<(FileBlock, DiskBlock)>> {
    match read_body(cache, block, level)? {
        BlockBody::Leaf(mut recs) => {
            let pos = recs.partition_point(|r| r.offset < rec.offset);
            if recs.get(pos).is_some_and(|r| r.offset == rec.offset) {
                return Err(RfsError::corrupt(
                    block.0,
                    format!("duplicate btree record at offset {}", rec.offset),
                ));
            }
            recs.insert(pos, rec);

            if recs.len() <= fanout.leaf as usize {
                cache.write_block(block, &serialize_leaf(cache.block_size(), &recs)?)?;
                return Ok(None);
            }

            // Leaf overflow: split in half, right half to a fresh block.
            let mid = recs.len() / 2;
            let right = recs.split_off(mid);
            cache.write_block(block, &serialize_leaf(cache.block_size(), &recs)?)?;
            let new_block = src.alloc_block()?;
            cache.write_block(new_block, &serialize_leaf(cache.block_size(), &right)?)?;
            debug!(
                old_leaf = block.0,
                new_leaf = new_block.0,
                separator = right[0].offset.0,
                "bmap_btree_leaf_split"
            );
            Ok(Some((right[0].offset, new_block)))
        }
        BlockBody::Node(mut entries) => {
            let pos = child_index(&entries, rec.offset);
            let child = entries[pos].1;
            let promoted = insert_descend(cache, src, fanout, child, level - 1, rec)?;

            if rec.offset < entries[pos].0 {
                entries[pos].0 = rec.offset;
            }
            if let Some(entry) = promoted {
                let at = entries.partition_point(|&(key, _)| key < entry.0);
                entries.insert(at, entry);
            }

            if entries.len() <= fanout.node as usize {
                cache.write_block(block, &serialize_node(cache.block_size(), level, &entries)?)?;
                return Ok(None);
            }

            let mid = entries.len() / 2;
            let right = entries.split_off(mid);
            cache.write_block(block, &serialize_node(cache.block_size(), level, &entries)?)?;
            let new_block = src.alloc_block()?;
            cache.write_block(new_block, &serialize_node(cache.block_size(), level, &right)?)?;
            Ok(Some((right[0].0, new_block)))
        }
    }
}

/// Push the overflowing root entries down into a fresh node block and
/// grow the tree by one level.
fn grow_root<D: BlockDevice>(
    cache: &BufCache<D>,
    src: &mut dyn BtreeBlockSource,
    fanout: &BtreeFanout,
    root: &mut BmapRoot,
) -> Result<()> {
    if u32::from(root.level) + 1 > fanout.max_levels {
        return Err(RfsError::FileTooBig);
    }
    let new_block = src.alloc_block()?;
    let entries = std::mem::take(&mut root.entries);
    cache.write_block(
        new_block,
        &serialize_node(cache.block_size(), root.level, &entries)?,
    )?;
    root.entries = vec![(entries[0].0, new_block)];
    root.level += 1;
    debug!(new_node = new_block.0, level = root.level, "bmap_btree_grow");
    Ok(())
}

// ── Update ──────────────────────────────────────────────────────────────────

/// Replace the record currently keyed `old_offset` with `new`.
///
/// The replacement must keep the leaf sorted (the merge engine only
/// rewrites records in ways that preserve order relative to neighbors).
pub fn update<D: BlockDevice>(
    cache: &BufCache<D>,
    root: &mut BmapRoot,
    old_offset: FileBlock,
    new: ExtentRec,
) -> Result<()> {
    if root.entries.is_empty() {
        return Err(RfsError::corrupt(
            0,
            format!("btree update in empty tree at offset {old_offset}"),
        ));
    }
    let pos = child_index(&root.entries, old_offset);
    let child = root.entries[pos].1;
    let first_key = update_descend(cache, child, root.level - 1, old_offset, new)?;
    root.entries[pos].0 = first_key;
    Ok(())
}

fn update_descend<D: BlockDevice>(
    cache: &BufCache<D>,
    block: DiskBlock,
    level: u16,
    old_offset: FileBlock,
    new: ExtentRec,
) -> Result<FileBlock> {
    match read_body(cache, block, level)? {
        BlockBody::Leaf(mut recs) => {
            let Some(pos) = recs.iter().position(|r| r.offset == old_offset) else {
                return Err(RfsError::corrupt(
                    block.0,
                    format!("btree update: no record at offset {old_offset}"),
                ));
            };
            recs[pos] = new;
            if (pos > 0 && recs[pos - 1].end() > new.offset)
                || (pos + 1 < recs.len() && new.end() > recs[pos + 1].offset)
            {
                return Err(RfsError::corrupt(
                    block.0,
                    "btree update breaks record ordering",
                ));
            }
            cache.write_block(block, &serialize_leaf(cache.block_size(), &recs)?)?;
            Ok(recs[0].offset)
        }
        BlockBody::Node(mut entries) => {
            let pos = child_index(&entries, old_offset);
            let child = entries[pos].1;
            let first_key = update_descend(cache, child, level - 1, old_offset, new)?;
            entries[pos].0 = first_key;
            cache.write_block(block, &serialize_node(cache.block_size(), level, &entries)?)?;
            Ok(entries[0].0)
        }
    }
}

// ── Delete ──────────────────────────────────────────────────────────────────

/// Remove the record keyed exactly `offset`.
pub fn delete<D: BlockDevice>(
    cache: &BufCache<D>,
    src: &mut dyn BtreeBlockSource,
    root: &mut BmapRoot,
    offset: FileBlock,
) -> Result<()> {
    trace!(offset = offset.0, "bmap_btree_delete");
    if root.entries.is_empty() {
        return Err(RfsError::corrupt(
            0,
            format!("btree delete in empty tree at offset {offset}"),
        ));
    }
    let pos = child_index(&root.entries, offset);
    let child = root.entries[pos].1;
    let outcome = delete_descend(cache, src, child, root.level - 1, offset)?;

    match outcome {
        DeleteOutcome::Emptied => {
            src.free_block(child)?;
            cache.invalidate(child)?;
            root.entries.remove(pos);
        }
        DeleteOutcome::FirstKey(key) => {
            root.entries[pos].0 = key;
        }
    }

    shrink_root(cache, src, root)
}

enum DeleteOutcome {
    /// The child subtree is now empty and its block may be released.
    Emptied,
    /// The child remains, with this first key.
    FirstKey(FileBlock),
}

fn delete_descend<D: BlockDevice>(
    cache: &BufCache<D>,
    src: &mut dyn BtreeBlockSource,
    block: DiskBlock,
    level: u16,
    offset: FileBlock,
) -> Result<DeleteOutcome> {
    match read_body(cache, block, level)? {
        BlockBody::Leaf(mut recs) => {
            let Some(pos) = recs.iter().position(|r| r.offset == offset) else {
                return Err(RfsError::corrupt(
                    block.0,
                    format!("btree delete: no record at offset {offset}"),
                ));
            };
            recs.remove(pos);
            if recs.is_empty() {
                return Ok(DeleteOutcome::Emptied);
            }
            cache.write_block(block, &serialize_leaf(cache.block_size(), &recs)?)?;
            Ok(DeleteOutcome::FirstKey(recs[0].offset))
        }
        BlockBody::Node(mut entries) => {
            let pos = child_index(&entries, offset);
            let child = entries[pos].1;
            match delete_descend(cache, src, child, level - 1, offset)? {
                DeleteOutcome::Emptied => {
                    src.free_block(child)?;
                    cache.invalidate(child)?;
                    entries.remove(pos);
                }
                DeleteOutcome::FirstKey(key) => {
                    entries[pos].0 = key;
                }
            }
            if entries.is_empty() {
                return Ok(DeleteOutcome::Emptied);
            }
            cache.write_block(block, &serialize_node(cache.block_size(), level, &entries)?)?;
            Ok(DeleteOutcome::FirstKey(entries[0].0))
        }
    }
}

/// While the root holds a single node entry, absorb that node's entries
/// into the root (when they fit) and drop a level.
fn shrink_root<D: BlockDevice>(
    cache: &BufCache<D>,
    src: &mut dyn BtreeBlockSource,
    root: &mut BmapRoot,
) -> Result<()> {
    while root.level > 1 && root.entries.len() == 1 {
        let child = root.entries[0].1;
        let BlockBody::Node(entries) = read_body(cache, child, root.level - 1)? else {
            return Err(RfsError::corrupt(child.0, "expected node during root shrink"));
        };
        if entries.len() > ROOT_MAX_ENTRIES {
            break;
        }
        src.free_block(child)?;
        cache.invalidate(child)?;
        root.entries = entries;
        root.level -= 1;
        debug!(freed_node = child.0, level = root.level, "bmap_btree_shrink");
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ExtState;
    use rfs_block::MemBlockDevice;

    /// Hands out sequential block numbers; records frees.
    struct SeqSource {
        next: u64,
        freed: Vec<u64>,
    }

    impl SeqSource {
        fn new(start: u64) -> Self {
            Self {
                next: start,
                freed: Vec::new(),
            }
        }
    }

    impl BtreeBlockSource for SeqSource {
        fn alloc_block(&mut self) -> Result<DiskBlock> {
            let block = DiskBlock(self.next);
            self.next += 1;
            Ok(block)
        }

        fn free_block(&mut self, block: DiskBlock) -> Result<()> {
            self.freed.push(block.0);
            Ok(())
        }
    }

    fn small_fanout() -> BtreeFanout {
        // Tiny fan-out so splits and level growth happen with few records.
        BtreeFanout {
            leaf: 4,
            node: 4,
            max_levels: 5,
        }
    }

    fn setup() -> (BufCache<MemBlockDevice>, SeqSource, BtreeFanout) {
        (
            BufCache::new(MemBlockDevice::new(512, 4096)),
            SeqSource::new(100),
            small_fanout(),
        )
    }

    fn rec(offset: u64, block: u64, len: u64) -> ExtentRec {
        ExtentRec::new_real(FileBlock(offset), DiskBlock(block), len, ExtState::Normal)
    }

    fn collect<D: BlockDevice>(cache: &BufCache<D>, root: &BmapRoot) -> Vec<ExtentRec> {
        let mut out = Vec::new();
        walk(cache, root, &mut |r| {
            out.push(*r);
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn create_and_walk_single_leaf() {
        let (cache, mut src, fanout) = setup();
        let records = [rec(0, 500, 2), rec(10, 510, 3)];
        let root = create_from_records(&cache, &mut src, &fanout, &records).unwrap();
        assert_eq!(root.level, 1);
        assert_eq!(root.single_leaf(), Some(DiskBlock(100)));
        assert_eq!(collect(&cache, &root), records);
    }

    #[test]
    fn lookup_exact_finds_only_exact_offsets() {
        let (cache, mut src, fanout) = setup();
        let root =
            create_from_records(&cache, &mut src, &fanout, &[rec(0, 500, 2), rec(10, 510, 3)])
                .unwrap();
        assert_eq!(
            lookup_exact(&cache, &root, FileBlock(10)).unwrap(),
            Some(rec(10, 510, 3))
        );
        assert_eq!(lookup_exact(&cache, &root, FileBlock(11)).unwrap(), None);
    }

    #[test]
    fn inserts_split_leaves_and_grow_root() {
        let (cache, mut src, fanout) = setup();
        let mut root = create_from_records(&cache, &mut src, &fanout, &[]).unwrap();

        // 4-wide leaves and a 4-wide root force growth well before 100.
        for i in 0..100_u64 {
            insert(&cache, &mut src, &fanout, &mut root, rec(i * 10, 1000 + i, 5)).unwrap();
        }
        assert!(root.level >= 2, "tree should have grown, level={}", root.level);

        let all = collect(&cache, &root);
        assert_eq!(all.len(), 100);
        for (i, r) in all.iter().enumerate() {
            assert_eq!(r.offset, FileBlock(i as u64 * 10));
        }
        assert_eq!(record_count(&cache, &root).unwrap(), 100);
    }

    #[test]
    fn insert_below_first_key_updates_separators() {
        let (cache, mut src, fanout) = setup();
        let mut root =
            create_from_records(&cache, &mut src, &fanout, &[rec(50, 500, 2)]).unwrap();
        insert(&cache, &mut src, &fanout, &mut root, rec(5, 400, 2)).unwrap();
        assert_eq!(root.entries[0].0, FileBlock(5));
        assert_eq!(
            lookup_exact(&cache, &root, FileBlock(5)).unwrap(),
            Some(rec(5, 400, 2))
        );
    }

    #[test]
    fn duplicate_insert_is_corruption() {
        let (cache, mut src, fanout) = setup();
        let mut root =
            create_from_records(&cache, &mut src, &fanout, &[rec(10, 500, 2)]).unwrap();
        let result = insert(&cache, &mut src, &fanout, &mut root, rec(10, 900, 1));
        assert!(matches!(result, Err(RfsError::Corruption { .. })));
    }

    #[test]
    fn update_rewrites_record_and_keys() {
        let (cache, mut src, fanout) = setup();
        let mut root =
            create_from_records(&cache, &mut src, &fanout, &[rec(10, 500, 8), rec(30, 600, 4)])
                .unwrap();
        // Trim the first record's left edge: offset moves 10 -> 12.
        update(&cache, &mut root, FileBlock(10), rec(12, 502, 6)).unwrap();
        assert_eq!(root.entries[0].0, FileBlock(12));
        assert_eq!(
            collect(&cache, &root),
            vec![rec(12, 502, 6), rec(30, 600, 4)]
        );
    }

    #[test]
    fn update_missing_record_is_corruption() {
        let (cache, mut src, fanout) = setup();
        let mut root =
            create_from_records(&cache, &mut src, &fanout, &[rec(10, 500, 8)]).unwrap();
        let result = update(&cache, &mut root, FileBlock(99), rec(99, 0, 1));
        assert!(matches!(result, Err(RfsError::Corruption { .. })));
    }

    #[test]
    fn delete_all_collapses_to_empty_leafless_root() {
        let (cache, mut src, fanout) = setup();
        let mut root = create_from_records(&cache, &mut src, &fanout, &[]).unwrap();
        for i in 0..40_u64 {
            insert(&cache, &mut src, &fanout, &mut root, rec(i * 10, 1000 + i, 5)).unwrap();
        }
        let grown_level = root.level;
        assert!(grown_level >= 2);

        for i in 0..40_u64 {
            delete(&cache, &mut src, &mut root, FileBlock(i * 10)).unwrap();
        }
        assert_eq!(record_count(&cache, &root).unwrap(), 0);
        // Every allocated block except possibly the last-standing leaf
        // came back through the source.
        let outstanding = (src.next - 100) as usize - src.freed.len();
        assert!(outstanding <= 1, "leaked {outstanding} tree blocks");
    }

    #[test]
    fn delete_updates_parent_separator() {
        let (cache, mut src, fanout) = setup();
        let mut root = create_from_records(&cache, &mut src, &fanout, &[]).unwrap();
        for i in 0..8_u64 {
            insert(&cache, &mut src, &fanout, &mut root, rec(i * 10, 1000 + i, 5)).unwrap();
        }
        // Removing a leaf's first record must advance the separator so
        // later lookups still route correctly.
        for i in 0..8_u64 {
            delete(&cache, &mut src, &mut root, FileBlock(i * 10)).unwrap();
            for j in (i + 1)..8 {
                assert!(
                    lookup_exact(&cache, &root, FileBlock(j * 10))
                        .unwrap()
                        .is_some(),
                    "record {j} lost after deleting {i}"
                );
            }
        }
    }

    #[test]
    fn delete_missing_record_is_corruption() {
        let (cache, mut src, fanout) = setup();
        let mut root =
            create_from_records(&cache, &mut src, &fanout, &[rec(10, 500, 8)]).unwrap();
        let result = delete(&cache, &mut src, &mut root, FileBlock(11));
        assert!(matches!(result, Err(RfsError::Corruption { .. })));
    }

    #[test]
    fn shrink_converges_to_single_leaf() {
        let (cache, mut src, fanout) = setup();
        let mut root = create_from_records(&cache, &mut src, &fanout, &[]).unwrap();
        for i in 0..40_u64 {
            insert(&cache, &mut src, &fanout, &mut root, rec(i * 10, 1000 + i, 5)).unwrap();
        }
        for i in 3..40_u64 {
            delete(&cache, &mut src, &mut root, FileBlock(i * 10)).unwrap();
        }
        assert_eq!(record_count(&cache, &root).unwrap(), 3);
        assert!(root.single_leaf().is_some(), "level={}", root.level);
    }

    #[test]
    fn bad_magic_is_corruption() {
        let (cache, mut src, fanout) = setup();
        let root = create_from_records(&cache, &mut src, &fanout, &[rec(0, 500, 1)]).unwrap();
        let leaf = root.single_leaf().unwrap();
        let mut raw = cache.read_block(leaf).unwrap().data().to_vec();
        raw[0] = 0xFF;
        cache.write_block(leaf, &raw).unwrap();
        let result = lookup_exact(&cache, &root, FileBlock(0));
        assert!(matches!(result, Err(RfsError::Corruption { .. })));
    }

    #[test]
    fn create_overflowing_one_leaf_is_corruption() {
        let (cache, mut src, fanout) = setup();
        let records: Vec<ExtentRec> = (0..5).map(|i| rec(i * 10, 600 + i, 2)).collect();
        let result = create_from_records(&cache, &mut src, &fanout, &records);
        assert!(matches!(result, Err(RfsError::Corruption { .. })));
    }
}
