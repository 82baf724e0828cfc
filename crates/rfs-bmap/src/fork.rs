//! Fork representation and the on-disk format state machine.
//!
//! A fork is one of a file's extent maps (data, attribute, copy-on-write)
//! and is always in exactly one of three on-disk formats:
//!
//! `Inline` ⇄ `ExtentArray` ⇄ `BTree`
//!
//! Transitions fire at the inline-root capacity threshold
//! ([`IFORK_MAXEXT`]) and only ever move one step. The in-core extent
//! list is authoritative in every format; the btree (when present)
//! mirrors the real records. Both directions of the array/btree
//! transition run inside the caller's transaction and are undone with it
//! on error.

use crate::btree::{self, BmapRoot, BtreeBlockSource, BtreeFanout};
use crate::iext::ExtentList;
use crate::record::{ExtentRec, ExtState};
use rfs_alloc::{alloc_vextent, AllocArgs, AllocGroups};
use rfs_block::{BlockDevice, BufCache};
use rfs_error::{Result, RfsError};
use rfs_trans::{Intent, Transaction, LOG_BROOT, LOG_CORE, LOG_EXT};
use rfs_types::{DiskBlock, FileBlock, ForkKind};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Extent records the inline root area can hold in array format.
/// One past this converts the fork to a btree.
pub const IFORK_MAXEXT: u64 = 9;

/// Hard ceiling on records per fork, from the on-disk extent-count
/// field width. Mutations that could cross it fail with `EFBIG`.
pub const MAX_EXTENT_COUNT: u64 = u32::MAX as u64;

/// On-disk representation of a fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForkFormat {
    /// Literal payload stored in the inline area; no extents.
    Inline,
    /// Extent records stored directly in the inline area.
    ExtentArray,
    /// Btree root in the inline area, records in external blocks.
    BTree,
}

/// One fork of a file: its extent map plus format bookkeeping.
#[derive(Debug, Clone)]
pub struct Fork {
    pub(crate) kind: ForkKind,
    pub(crate) format: ForkFormat,
    pub(crate) list: ExtentList,
    pub(crate) inline: Vec<u8>,
    pub(crate) broot: Option<BmapRoot>,
    pub(crate) is_realtime: bool,
    /// Cached count of real (on-disk-worthy) records. Must equal
    /// `list.real_count()` after every mutation.
    pub(crate) nextents: u64,
}

impl Fork {
    /// A fork starts life empty, in inline format.
    #[must_use]
    pub fn new(kind: ForkKind, is_realtime: bool) -> Self {
        Self {
            kind,
            format: ForkFormat::Inline,
            list: ExtentList::new(),
            inline: Vec::new(),
            broot: None,
            is_realtime,
            nextents: 0,
        }
    }

    /// An inline fork carrying a literal payload.
    #[must_use]
    pub fn new_with_inline(kind: ForkKind, payload: Vec<u8>) -> Self {
        let mut fork = Self::new(kind, false);
        fork.inline = payload;
        fork
    }

    #[must_use]
    pub fn kind(&self) -> ForkKind {
        self.kind
    }

    #[must_use]
    pub fn format(&self) -> ForkFormat {
        self.format
    }

    #[must_use]
    pub fn is_realtime(&self) -> bool {
        self.is_realtime
    }

    /// Cached count of real extent records.
    #[must_use]
    pub fn nextents(&self) -> u64 {
        self.nextents
    }

    #[must_use]
    pub fn extents(&self) -> &ExtentList {
        &self.list
    }

    #[must_use]
    pub fn inline_payload(&self) -> &[u8] {
        &self.inline
    }

    /// Sum of data + indirect reservations over all delayed extents.
    #[must_use]
    pub fn delayed_total(&self) -> u64 {
        self.list.delayed_total()
    }

    /// Logical block just past the last mapping, 0 for an empty map.
    #[must_use]
    pub fn last_offset(&self) -> FileBlock {
        self.list.last().map_or(FileBlock(0), ExtentRec::end)
    }

    /// Whether the whole map is a single one-block extent.
    #[must_use]
    pub fn is_one_block(&self) -> bool {
        self.list.len() == 1 && self.list.first().is_some_and(|rec| rec.len == 1)
    }

    /// First hole of at least `len` blocks, searching from offset 0.
    #[must_use]
    pub fn first_unused(&self, len: u64) -> FileBlock {
        let mut candidate = FileBlock(0);
        for rec in &self.list {
            if rec.offset.0.saturating_sub(candidate.0) >= len {
                return candidate;
            }
            candidate = rec.end();
        }
        candidate
    }

    pub(crate) fn inc_nextents(&mut self) {
        self.nextents += 1;
    }

    pub(crate) fn dec_nextents(&mut self) {
        debug_assert!(self.nextents > 0);
        self.nextents -= 1;
    }

    /// Check the structural invariants: sort/overlap order, the cached
    /// real-record count, and format/structure agreement.
    pub fn validate(&self) -> Result<()> {
        self.list.validate()?;
        let real = self.list.real_count() as u64;
        if real != self.nextents {
            return Err(RfsError::corrupt(
                0,
                format!(
                    "cached extent count {} disagrees with list ({real})",
                    self.nextents
                ),
            ));
        }
        match self.format {
            ForkFormat::Inline => {
                if !self.list.is_empty() {
                    return Err(RfsError::corrupt(0, "inline fork holds extents"));
                }
            }
            ForkFormat::ExtentArray => {
                if self.broot.is_some() {
                    return Err(RfsError::corrupt(0, "array-format fork holds a btree root"));
                }
                if !self.inline.is_empty() {
                    return Err(RfsError::corrupt(0, "array-format fork holds inline data"));
                }
            }
            ForkFormat::BTree => {
                if self.broot.is_none() {
                    return Err(RfsError::corrupt(0, "btree-format fork has no root"));
                }
            }
        }
        Ok(())
    }
}

// ── Format transitions ──────────────────────────────────────────────────────

/// `Inline -> ExtentArray`.
///
/// An empty payload converts in place. A non-empty payload allocates one
/// block, copies the literal data into it, and maps it at offset 0.
/// Returns the log flags for the structural change.
pub(crate) fn local_to_extents<D: BlockDevice>(
    fork: &mut Fork,
    cache: &BufCache<D>,
    groups: &mut AllocGroups,
    txn: &mut Transaction,
    owner: u64,
) -> Result<u32> {
    debug_assert_eq!(fork.format, ForkFormat::Inline);

    if fork.inline.is_empty() {
        fork.format = ForkFormat::ExtentArray;
        return Ok(LOG_CORE);
    }

    if fork.inline.len() > cache.block_size() as usize {
        return Err(RfsError::corrupt(
            0,
            format!(
                "inline payload of {} bytes exceeds one block",
                fork.inline.len()
            ),
        ));
    }

    let result = alloc_vextent(
        groups,
        txn,
        &AllocArgs {
            target: DiskBlock(0),
            min_len: 1,
            max_len: 1,
            alignment: 0,
            eof_contiguous: false,
        },
    )?;

    let mut data = vec![0_u8; cache.block_size() as usize];
    data[..fork.inline.len()].copy_from_slice(&fork.inline);
    cache.write_block(result.block, &data)?;

    let rec = ExtentRec::new_real(FileBlock(0), result.block, 1, ExtState::Normal);
    fork.list.insert_at(fork.list.lookup(FileBlock(0)), rec);
    fork.inline.clear();
    fork.format = ForkFormat::ExtentArray;
    fork.nextents = 1;
    txn.defer(Intent::MapExtent {
        owner,
        fork: fork.kind,
        offset: FileBlock(0),
        block: result.block,
        len: 1,
    });
    debug!(owner, block = result.block.0, "fork_local_to_extents");
    Ok(LOG_CORE | LOG_EXT)
}

/// `ExtentArray -> BTree`: allocate one block, format it as a leaf
/// holding every current real extent, install the root.
pub(crate) fn extents_to_btree<D: BlockDevice>(
    fork: &mut Fork,
    cache: &BufCache<D>,
    src: &mut dyn BtreeBlockSource,
    fanout: &BtreeFanout,
) -> Result<u32> {
    debug_assert_eq!(fork.format, ForkFormat::ExtentArray);

    let records: Vec<ExtentRec> = fork.list.iter().filter(|r| r.is_real()).copied().collect();
    if records.len() as u64 != fork.nextents {
        return Err(RfsError::corrupt(
            0,
            format!(
                "cached extent count {} disagrees with array ({})",
                fork.nextents,
                records.len()
            ),
        ));
    }

    let root = btree::create_from_records(cache, src, fanout, &records)?;
    fork.broot = Some(root);
    fork.format = ForkFormat::BTree;
    debug!(records = records.len(), "fork_extents_to_btree");
    Ok(LOG_CORE | LOG_BROOT)
}

/// `BTree -> ExtentArray`: requires exactly one remaining leaf. The leaf
/// block is released through the deferred-free seam and its records are
/// checked against the in-core list before the root is dropped.
pub(crate) fn btree_to_extents<D: BlockDevice>(
    fork: &mut Fork,
    cache: &BufCache<D>,
    src: &mut dyn BtreeBlockSource,
) -> Result<u32> {
    debug_assert_eq!(fork.format, ForkFormat::BTree);
    let root = fork
        .broot
        .as_ref()
        .ok_or_else(|| RfsError::corrupt(0, "btree-format fork has no root"))?;

    let Some(leaf) = root.single_leaf() else {
        return Err(RfsError::corrupt(
            0,
            "btree-to-array conversion with more than one leaf",
        ));
    };

    // The leaf must mirror the in-core real records exactly.
    let mut on_disk = Vec::new();
    btree::walk(cache, root, &mut |rec| {
        on_disk.push(*rec);
        Ok(())
    })?;
    let in_core: Vec<ExtentRec> = fork.list.iter().filter(|r| r.is_real()).copied().collect();
    if on_disk != in_core || on_disk.len() as u64 != fork.nextents {
        return Err(RfsError::corrupt(
            leaf.0,
            format!(
                "btree leaf holds {} records, cached extent count is {}",
                on_disk.len(),
                fork.nextents
            ),
        ));
    }

    src.free_block(leaf)?;
    cache.invalidate(leaf)?;
    fork.broot = None;
    fork.format = ForkFormat::ExtentArray;
    debug!(leaf = leaf.0, records = on_disk.len(), "fork_btree_to_extents");
    Ok(LOG_CORE | LOG_EXT)
}

/// Re-check the format thresholds after a mutation and convert if the
/// real-record count crossed a bound. Returns accumulated log flags
/// (0 when no conversion happened).
pub(crate) fn maybe_convert<D: BlockDevice>(
    fork: &mut Fork,
    cache: &BufCache<D>,
    src: &mut dyn BtreeBlockSource,
    fanout: &BtreeFanout,
) -> Result<u32> {
    match fork.format {
        ForkFormat::ExtentArray if fork.nextents > IFORK_MAXEXT => {
            extents_to_btree(fork, cache, src, fanout)
        }
        ForkFormat::BTree if fork.nextents <= IFORK_MAXEXT => {
            let single = fork
                .broot
                .as_ref()
                .is_some_and(|root| root.single_leaf().is_some());
            if single {
                btree_to_extents(fork, cache, src)
            } else {
                // A multi-level tree is never collapsed directly; later
                // deletes will shrink it to one leaf first.
                Ok(0)
            }
        }
        _ => Ok(0),
    }
}
