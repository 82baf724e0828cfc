#![forbid(unsafe_code)]
//! Physical block allocation.
//!
//! The device is carved into fixed-size allocation groups; each group
//! keeps a free-extent table ([`AgFreeSpace`]) indexed by start block,
//! standing in for the external free-space search btrees. On top of the
//! groups sits the three-tier selector ([`alloc_vextent`]):
//!
//! 1. **Exact** — place immediately at the requested target when the file
//!    is being extended at end-of-file and space is not critically low.
//! 2. **Near** — best contiguous run in the target's group, preferring
//!    alignment and proximity to the target.
//! 3. **Any** — filesystem-wide minimum-length search; using this tier
//!    puts the transaction into low-space mode so later allocations in
//!    the same transaction skip the optimistic paths.
//!
//! `ENOSPC` propagates only after all three tiers fail.

use rfs_error::{Result, RfsError};
use rfs_trans::Transaction;
use rfs_types::{AgNumber, DiskBlock, Pool};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, trace};

// ── Geometry ────────────────────────────────────────────────────────────────

/// Allocation-group layout of one storage pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgGeometry {
    pub ag_count: u32,
    pub ag_blocks: u32,
    pub pool: Pool,
}

impl AgGeometry {
    pub fn new(ag_count: u32, ag_blocks: u32, pool: Pool) -> Result<Self> {
        if ag_count == 0 || ag_blocks == 0 {
            return Err(RfsError::InvalidGeometry(format!(
                "allocation groups must be non-empty: ag_count={ag_count} ag_blocks={ag_blocks}"
            )));
        }
        Ok(Self {
            ag_count,
            ag_blocks,
            pool,
        })
    }

    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        u64::from(self.ag_count) * u64::from(self.ag_blocks)
    }

    /// Group containing a device block.
    pub fn ag_of(&self, block: DiskBlock) -> Result<AgNumber> {
        let ag = block.0 / u64::from(self.ag_blocks);
        if ag >= u64::from(self.ag_count) {
            return Err(RfsError::corrupt(
                block.0,
                format!("block beyond last allocation group {}", self.ag_count - 1),
            ));
        }
        let ag = u32::try_from(ag).expect("bounded by ag_count");
        Ok(AgNumber(ag))
    }

    #[must_use]
    pub fn ag_start(&self, ag: AgNumber) -> DiskBlock {
        DiskBlock(u64::from(ag.0) * u64::from(self.ag_blocks))
    }
}

// ── Per-group free space ────────────────────────────────────────────────────

/// Free-extent table for one allocation group, keyed by start block.
///
/// Adjacent free runs are always coalesced, so the table never contains
/// two touching entries.
#[derive(Debug, Clone, Default)]
pub struct AgFreeSpace {
    by_start: BTreeMap<u64, u64>,
}

impl AgFreeSpace {
    #[must_use]
    pub fn new_fully_free(start: DiskBlock, len: u64) -> Self {
        let mut by_start = BTreeMap::new();
        by_start.insert(start.0, len);
        Self { by_start }
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.by_start.values().sum()
    }

    #[must_use]
    pub fn longest_free(&self) -> u64 {
        self.by_start.values().copied().max().unwrap_or(0)
    }

    /// The free run containing `block`, if any.
    fn run_containing(&self, block: u64) -> Option<(u64, u64)> {
        let (&start, &len) = self.by_start.range(..=block).next_back()?;
        (block < start + len).then_some((start, len))
    }

    /// Remove `[block, block+len)` from the free space. The whole range
    /// must currently be free.
    pub fn take(&mut self, block: DiskBlock, len: u64) -> Result<()> {
        let Some((start, run_len)) = self.run_containing(block.0) else {
            return Err(RfsError::corrupt(
                block.0,
                "allocating a block that is not free",
            ));
        };
        if block.0 + len > start + run_len {
            return Err(RfsError::corrupt(
                block.0,
                format!("allocation of {len} blocks overruns free run of {run_len}"),
            ));
        }
        self.by_start.remove(&start);
        if block.0 > start {
            self.by_start.insert(start, block.0 - start);
        }
        let tail_start = block.0 + len;
        let tail_len = (start + run_len) - tail_start;
        if tail_len > 0 {
            self.by_start.insert(tail_start, tail_len);
        }
        Ok(())
    }

    /// Return `[block, block+len)` to the free space, coalescing with
    /// neighbors. Freeing an already-free block is corruption.
    pub fn give_back(&mut self, block: DiskBlock, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if self.run_containing(block.0).is_some()
            || self.run_containing(block.0 + len - 1).is_some()
        {
            return Err(RfsError::corrupt(block.0, "double free of extent"));
        }
        let mut start = block.0;
        let mut total = len;

        // Coalesce with the left neighbor.
        if let Some((&left_start, &left_len)) = self.by_start.range(..start).next_back() {
            if left_start + left_len == start {
                self.by_start.remove(&left_start);
                start = left_start;
                total += left_len;
            }
        }
        // Coalesce with the right neighbor.
        if let Some(&right_len) = self.by_start.get(&(block.0 + len)) {
            self.by_start.remove(&(block.0 + len));
            total += right_len;
        }
        self.by_start.insert(start, total);
        Ok(())
    }

    /// Best contiguous run of `min_len..=max_len` blocks at or near
    /// `target`, preferring starts aligned to `alignment` and, among
    /// candidates of equal usable length, the one closest to the target.
    ///
    /// This is the free-space search interface the mapping engine
    /// consumes; `None` means this group cannot satisfy `min_len`.
    #[must_use]
    pub fn find_best_extent(
        &self,
        min_len: u64,
        max_len: u64,
        target: Option<DiskBlock>,
        alignment: u64,
    ) -> Option<(DiskBlock, u64)> {
        let align = alignment.max(1);
        let mut best: Option<(u64, u64, bool, u64)> = None; // (start, len, aligned, distance)

        for (&start, &run_len) in &self.by_start {
            // Aligned candidate: round the start up inside the run.
            let aligned_start = start.next_multiple_of(align);
            let candidates = [
                (aligned_start, true),
                (start, start % align == 0), // unaligned fallback
            ];
            for (cand_start, aligned) in candidates {
                if cand_start < start || cand_start >= start + run_len {
                    continue;
                }
                let avail = (start + run_len) - cand_start;
                if avail < min_len {
                    continue;
                }
                let take = avail.min(max_len);
                let distance = target.map_or(0, |t| cand_start.abs_diff(t.0));
                let better = match &best {
                    None => true,
                    Some((_, best_len, best_aligned, best_dist)) => {
                        (aligned, take, std::cmp::Reverse(distance))
                            > (*best_aligned, *best_len, std::cmp::Reverse(*best_dist))
                    }
                };
                if better {
                    best = Some((cand_start, take, aligned, distance));
                }
            }
        }

        best.map(|(start, len, _, _)| (DiskBlock(start), len))
    }
}

// ── Allocation groups ───────────────────────────────────────────────────────

/// All allocation groups of one pool, plus the geometry that shapes them.
#[derive(Debug)]
pub struct AllocGroups {
    geometry: AgGeometry,
    groups: Vec<AgFreeSpace>,
}

impl AllocGroups {
    /// Build a pool whose space is entirely free.
    #[must_use]
    pub fn new_empty(geometry: AgGeometry) -> Self {
        let groups = (0..geometry.ag_count)
            .map(|ag| {
                AgFreeSpace::new_fully_free(
                    geometry.ag_start(AgNumber(ag)),
                    u64::from(geometry.ag_blocks),
                )
            })
            .collect();
        Self { geometry, groups }
    }

    #[must_use]
    pub fn geometry(&self) -> &AgGeometry {
        &self.geometry
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.groups.iter().map(AgFreeSpace::free_blocks).sum()
    }

    #[must_use]
    pub fn group(&self, ag: AgNumber) -> &AgFreeSpace {
        &self.groups[ag.0 as usize]
    }

    /// Claim a specific extent (tier-1 placement or btree block).
    pub fn allocate_at(&mut self, block: DiskBlock, len: u64) -> Result<()> {
        let ag = self.geometry.ag_of(block)?;
        let ag_end = self.geometry.ag_start(ag).0 + u64::from(self.geometry.ag_blocks);
        if block.0 + len > ag_end {
            return Err(RfsError::corrupt(
                block.0,
                "extent crosses an allocation-group boundary",
            ));
        }
        self.groups[ag.0 as usize].take(block, len)
    }

    /// Return an extent to the free space.
    pub fn free_extent(&mut self, block: DiskBlock, len: u64) -> Result<()> {
        let ag = self.geometry.ag_of(block)?;
        self.groups[ag.0 as usize].give_back(block, len)
    }

    /// Whether a specific run is entirely free (tier-1 probe).
    #[must_use]
    pub fn is_free(&self, block: DiskBlock, len: u64) -> bool {
        let Ok(ag) = self.geometry.ag_of(block) else {
            return false;
        };
        let fs = &self.groups[ag.0 as usize];
        match fs.run_containing(block.0) {
            Some((start, run_len)) => block.0 + len <= start + run_len,
            None => false,
        }
    }
}

// ── Selector ────────────────────────────────────────────────────────────────

/// Arguments for one variable-length allocation.
#[derive(Debug, Clone)]
pub struct AllocArgs {
    /// Preferred placement (e.g., one past the previous extent's end).
    pub target: DiskBlock,
    /// Smallest acceptable length.
    pub min_len: u64,
    /// Requested length.
    pub max_len: u64,
    /// Preferred start alignment (stripe unit / extent-size hint); 0 or 1
    /// means unaligned.
    pub alignment: u64,
    /// The target is the block immediately after the file's last mapped
    /// extent — tier-1 exact placement applies.
    pub eof_contiguous: bool,
}

/// A successful allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocResult {
    pub block: DiskBlock,
    pub len: u64,
}

/// Allocate physical blocks through the three-tier policy.
///
/// On success the blocks are removed from the group free space and the
/// transaction accumulates the matching free-counter delta.
pub fn alloc_vextent(
    groups: &mut AllocGroups,
    txn: &mut Transaction,
    args: &AllocArgs,
) -> Result<AllocResult> {
    debug_assert!(args.min_len >= 1 && args.min_len <= args.max_len);
    let pool = groups.geometry.pool;

    // Tier 1: exact placement at the target.
    if args.eof_contiguous && !txn.is_low_space() && groups.is_free(args.target, args.min_len) {
        let ag = groups.geometry.ag_of(args.target)?;
        let fs = &groups.groups[ag.0 as usize];
        let (start, run_len) = fs
            .run_containing(args.target.0)
            .ok_or_else(|| RfsError::corrupt(args.target.0, "free run vanished"))?;
        let avail = (start + run_len) - args.target.0;
        let len = avail.min(args.max_len);
        groups.allocate_at(args.target, len)?;
        txn.add_block_delta(pool, -i64::try_from(len).expect("extent length fits i64"));
        trace!(block = args.target.0, len, tier = 1, "alloc_vextent");
        return Ok(AllocResult {
            block: args.target,
            len,
        });
    }

    // Tier 2: a full-length run near the target, in the target's group
    // first and then the remaining groups in rotor order. Short runs are
    // left for the degraded tier.
    if !txn.is_low_space() {
        let start_ag = groups.geometry.ag_of(args.target).unwrap_or(AgNumber(0));
        for i in 0..groups.geometry.ag_count {
            let ag = AgNumber((start_ag.0 + i) % groups.geometry.ag_count);
            let found = groups.groups[ag.0 as usize].find_best_extent(
                args.max_len,
                args.max_len,
                (ag == start_ag).then_some(args.target),
                args.alignment,
            );
            if let Some((block, len)) = found {
                groups.allocate_at(block, len)?;
                txn.add_block_delta(pool, -i64::try_from(len).expect("extent length fits i64"));
                trace!(block = block.0, len, ag = ag.0, tier = 2, "alloc_vextent");
                return Ok(AllocResult { block, len });
            }
        }
    }

    // Tier 3: degraded minimum-length search anywhere; flips the
    // transaction into low-space mode.
    for ag in 0..groups.geometry.ag_count {
        let found =
            groups.groups[ag as usize].find_best_extent(args.min_len, args.max_len, None, 0);
        if let Some((block, len)) = found {
            txn.set_low_space();
            groups.allocate_at(block, len)?;
            txn.add_block_delta(pool, -i64::try_from(len).expect("extent length fits i64"));
            debug!(block = block.0, len, ag, tier = 3, "alloc_vextent degraded");
            return Ok(AllocResult { block, len });
        }
    }

    Err(RfsError::NoSpace)
}

/// Free an extent and credit the transaction's counter delta.
pub fn free_vextent(
    groups: &mut AllocGroups,
    txn: &mut Transaction,
    block: DiskBlock,
    len: u64,
) -> Result<()> {
    groups.free_extent(block, len)?;
    txn.add_block_delta(
        groups.geometry.pool,
        i64::try_from(len).expect("extent length fits i64"),
    );
    trace!(block = block.0, len, "free_vextent");
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rfs_trans::{FsCounters, TxnManager};
    use std::sync::Arc;

    fn test_groups(ag_count: u32, ag_blocks: u32) -> AllocGroups {
        AllocGroups::new_empty(AgGeometry::new(ag_count, ag_blocks, Pool::Data).unwrap())
    }

    fn test_txn(groups: &AllocGroups) -> (TxnManager, Transaction) {
        let mgr = TxnManager::new(Arc::new(FsCounters::new(groups.free_blocks(), 0)));
        let txn = mgr.begin(0).unwrap();
        (mgr, txn)
    }

    #[test]
    fn geometry_rejects_empty_layout() {
        assert!(AgGeometry::new(0, 100, Pool::Data).is_err());
        assert!(AgGeometry::new(4, 0, Pool::Data).is_err());
    }

    #[test]
    fn take_splits_free_run() {
        let mut fs = AgFreeSpace::new_fully_free(DiskBlock(0), 100);
        fs.take(DiskBlock(40), 10).unwrap();
        assert_eq!(fs.free_blocks(), 90);
        assert!(fs.run_containing(45).is_none());
        assert_eq!(fs.run_containing(39), Some((0, 40)));
        assert_eq!(fs.run_containing(50), Some((50, 50)));
    }

    #[test]
    fn give_back_coalesces_both_sides() {
        let mut fs = AgFreeSpace::new_fully_free(DiskBlock(0), 100);
        fs.take(DiskBlock(40), 10).unwrap();
        fs.give_back(DiskBlock(40), 10).unwrap();
        assert_eq!(fs.run_containing(0), Some((0, 100)));
    }

    #[test]
    fn double_free_is_corruption() {
        let mut fs = AgFreeSpace::new_fully_free(DiskBlock(0), 100);
        assert!(matches!(
            fs.give_back(DiskBlock(10), 5),
            Err(RfsError::Corruption { .. })
        ));
    }

    #[test]
    fn take_unfree_block_is_corruption() {
        let mut fs = AgFreeSpace::new_fully_free(DiskBlock(0), 100);
        fs.take(DiskBlock(0), 50).unwrap();
        assert!(matches!(
            fs.take(DiskBlock(10), 5),
            Err(RfsError::Corruption { .. })
        ));
    }

    #[test]
    fn find_best_extent_prefers_alignment() {
        let mut fs = AgFreeSpace::new_fully_free(DiskBlock(0), 256);
        // Free space: [10, 256) — an aligned candidate exists at 16.
        fs.take(DiskBlock(0), 10).unwrap();
        let (block, len) = fs.find_best_extent(8, 8, None, 16).unwrap();
        assert_eq!(block, DiskBlock(16));
        assert_eq!(len, 8);
    }

    #[test]
    fn find_best_extent_falls_back_to_unaligned() {
        let mut fs = AgFreeSpace::new_fully_free(DiskBlock(0), 64);
        // Only [50, 64) free: no 16-aligned start has 14 blocks.
        fs.take(DiskBlock(0), 50).unwrap();
        let (block, len) = fs.find_best_extent(14, 14, None, 16).unwrap();
        assert_eq!(block, DiskBlock(50));
        assert_eq!(len, 14);
    }

    #[test]
    fn find_best_extent_respects_min_len() {
        let mut fs = AgFreeSpace::new_fully_free(DiskBlock(0), 100);
        fs.take(DiskBlock(0), 95).unwrap();
        assert!(fs.find_best_extent(10, 20, None, 0).is_none());
        assert_eq!(
            fs.find_best_extent(5, 20, None, 0),
            Some((DiskBlock(95), 5))
        );
    }

    #[test]
    fn tier1_takes_exact_target() {
        let mut groups = test_groups(2, 1000);
        let (_mgr, mut txn) = test_txn(&groups);
        // Simulate a file whose last extent ends at 499.
        groups.allocate_at(DiskBlock(400), 100).unwrap();

        let result = alloc_vextent(
            &mut groups,
            &mut txn,
            &AllocArgs {
                target: DiskBlock(500),
                min_len: 10,
                max_len: 50,
                alignment: 0,
                eof_contiguous: true,
            },
        )
        .unwrap();
        assert_eq!(result.block, DiskBlock(500));
        assert_eq!(result.len, 50);
        txn.abort();
    }

    #[test]
    fn tier2_searches_near_target() {
        let mut groups = test_groups(2, 1000);
        let (_mgr, mut txn) = test_txn(&groups);
        // Target is allocated, so tier 1 cannot apply even with the flag.
        groups.allocate_at(DiskBlock(500), 100).unwrap();

        let result = alloc_vextent(
            &mut groups,
            &mut txn,
            &AllocArgs {
                target: DiskBlock(500),
                min_len: 10,
                max_len: 10,
                alignment: 0,
                eof_contiguous: true,
            },
        )
        .unwrap();
        assert_eq!(result.len, 10);
        assert!(groups.geometry().ag_of(result.block).unwrap() == AgNumber(0));
        txn.abort();
    }

    #[test]
    fn tier3_sets_low_space_and_degrades() {
        let mut groups = test_groups(2, 100);
        let (_mgr, mut txn) = test_txn(&groups);
        // Leave only a small fragment in AG 1.
        groups.allocate_at(DiskBlock(0), 100).unwrap();
        groups.allocate_at(DiskBlock(100), 95).unwrap();

        let result = alloc_vextent(
            &mut groups,
            &mut txn,
            &AllocArgs {
                target: DiskBlock(0),
                min_len: 2,
                max_len: 50,
                alignment: 0,
                eof_contiguous: false,
            },
        )
        .unwrap();
        assert_eq!(result.block, DiskBlock(195));
        assert_eq!(result.len, 5);
        assert!(txn.is_low_space());
        txn.abort();
    }

    #[test]
    fn low_space_transaction_skips_optimistic_tiers() {
        let mut groups = test_groups(1, 1000);
        let (_mgr, mut txn) = test_txn(&groups);
        txn.set_low_space();

        // Tier 1 would have placed at the free target, but low-space mode
        // falls straight through to tier 3.
        let result = alloc_vextent(
            &mut groups,
            &mut txn,
            &AllocArgs {
                target: DiskBlock(500),
                min_len: 10,
                max_len: 10,
                alignment: 0,
                eof_contiguous: true,
            },
        )
        .unwrap();
        assert_eq!(result.block, DiskBlock(0));
        txn.abort();
    }

    #[test]
    fn enospc_after_all_tiers_fail() {
        let mut groups = test_groups(1, 100);
        let (_mgr, mut txn) = test_txn(&groups);
        groups.allocate_at(DiskBlock(0), 100).unwrap();

        let result = alloc_vextent(
            &mut groups,
            &mut txn,
            &AllocArgs {
                target: DiskBlock(0),
                min_len: 1,
                max_len: 1,
                alignment: 0,
                eof_contiguous: false,
            },
        );
        assert!(matches!(result, Err(RfsError::NoSpace)));
        txn.abort();
    }

    #[test]
    fn alloc_and_free_balance_txn_deltas() {
        let mut groups = test_groups(1, 1000);
        let (mgr, mut txn) = test_txn(&groups);
        let before = mgr.counters().free_blocks(Pool::Data);

        let result = alloc_vextent(
            &mut groups,
            &mut txn,
            &AllocArgs {
                target: DiskBlock(0),
                min_len: 10,
                max_len: 10,
                alignment: 0,
                eof_contiguous: false,
            },
        )
        .unwrap();
        free_vextent(&mut groups, &mut txn, result.block, result.len).unwrap();
        txn.commit().unwrap();
        assert_eq!(mgr.counters().free_blocks(Pool::Data), before);
        assert_eq!(groups.free_blocks(), 1000);
    }

    #[test]
    fn extent_crossing_ag_boundary_is_rejected() {
        let mut groups = test_groups(2, 100);
        assert!(matches!(
            groups.allocate_at(DiskBlock(95), 10),
            Err(RfsError::Corruption { .. })
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn alloc_free_sequences_conserve_space(
            ops in proptest::collection::vec((0_u64..400, 1_u64..30), 1..60),
        ) {
            let mut groups = test_groups(1, 400);
            let (_mgr, mut txn) = test_txn(&groups);
            let total = groups.free_blocks();
            let mut held: Vec<AllocResult> = Vec::new();

            for (target, len) in ops {
                let args = AllocArgs {
                    target: DiskBlock(target),
                    min_len: 1,
                    max_len: len,
                    alignment: 0,
                    eof_contiguous: false,
                };
                match alloc_vextent(&mut groups, &mut txn, &args) {
                    Ok(result) => held.push(result),
                    Err(RfsError::NoSpace) => {
                        // Free everything and keep going.
                        for r in held.drain(..) {
                            free_vextent(&mut groups, &mut txn, r.block, r.len).unwrap();
                        }
                    }
                    Err(other) => return Err(TestCaseError::fail(format!("{other}"))),
                }
                let in_use: u64 = held.iter().map(|r| r.len).sum();
                prop_assert_eq!(groups.free_blocks() + in_use, total);
            }

            for r in held.drain(..) {
                free_vextent(&mut groups, &mut txn, r.block, r.len).unwrap();
            }
            prop_assert_eq!(groups.free_blocks(), total);
            txn.abort();
        }
    }
}
