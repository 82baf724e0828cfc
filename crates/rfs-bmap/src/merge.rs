//! The extent merge/insert engine.
//!
//! Every structural change is dispatched on adjacency flags computed
//! against the record being modified and its immediate neighbors:
//! whether the change exactly fills the left/right boundary of the
//! record being replaced (`filling`), and whether the result can merge
//! with the left/right neighbor (`contig`). Each reachable flag
//! combination is a distinct case with its own list/btree edit sequence;
//! combinations that violate mutual exclusivity (a contiguity flag
//! without its filling flag while a record is being replaced) are
//! structurally unreachable and reported as corruption.
//!
//! The in-core list is edited first; when the fork is in btree format
//! the on-disk tree is mirrored with the matching delete/insert/update
//! sequence. Reservation accounting for delayed extents follows the
//! worst-case indirect-block formulas in `delalloc`.

use crate::btree::{self, BtreeBlockSource, BtreeFanout};
use crate::delalloc::{split_indlen, worst_indlen};
use crate::fork::Fork;
use crate::iext::IextCursor;
use crate::record::{can_merge, can_merge_delayed, ExtentRec, PhysBlock, MAX_EXTENT_LEN};
use rfs_alloc::{alloc_vextent, AllocArgs, AllocGroups};
use rfs_block::{BlockDevice, BufCache};
use rfs_error::{Result, RfsError};
use rfs_trans::{FsCounters, Intent, Transaction, LOG_CORE, LOG_EXT};
use rfs_types::{DiskBlock, FileBlock, Pool};
use tracing::trace;

// ── Tree-block seam ─────────────────────────────────────────────────────────

/// Allocates btree blocks against the transaction's metadata reservation
/// and defers frees to commit.
pub(crate) struct TxnBlockSource<'a> {
    pub txn: &'a mut Transaction,
    /// Data-pool groups; tree blocks always come from the main device.
    pub meta_groups: &'a mut AllocGroups,
}

impl BtreeBlockSource for TxnBlockSource<'_> {
    fn alloc_block(&mut self) -> Result<DiskBlock> {
        if !self.txn.try_consume_reserved() {
            return Err(RfsError::Again);
        }
        let result = alloc_vextent(
            self.meta_groups,
            self.txn,
            &AllocArgs {
                target: DiskBlock(0),
                min_len: 1,
                max_len: 1,
                alignment: 0,
                eof_contiguous: false,
            },
        )?;
        // The consumed reservation already paid for this block at
        // transaction start; undo the selector's charge.
        self.txn.add_block_delta(Pool::Data, 1);
        Ok(result.block)
    }

    fn free_block(&mut self, block: DiskBlock) -> Result<()> {
        self.txn.defer(Intent::FreeExtent {
            block,
            len: 1,
            pool: Pool::Data,
        });
        Ok(())
    }
}

// ── Engine context ──────────────────────────────────────────────────────────

/// Flags influencing how removals are accounted.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DelFlags {
    /// The caller is moving the blocks, not freeing them: skip the
    /// deferred free.
    pub remap: bool,
}

/// One mapping operation's working set: the fork under its structural
/// lock plus every collaborator the engine edits through.
pub(crate) struct Engine<'a, 'b, D: BlockDevice> {
    pub fork: &'a mut Fork,
    pub cache: &'a BufCache<D>,
    pub src: &'a mut TxnBlockSource<'b>,
    pub fanout: &'a BtreeFanout,
    pub counters: &'a FsCounters,
    /// Realtime allocation-group size, for the same-group merge rule.
    pub rt_ag_blocks: Option<u64>,
    pub owner: u64,
    /// Caller opted out of reverse-mapping intents.
    pub skip_rmap: bool,
}

impl<D: BlockDevice> Engine<'_, '_, D> {
    fn data_pool(&self) -> Pool {
        if self.fork.is_realtime() {
            Pool::Realtime
        } else {
            Pool::Data
        }
    }

    fn rt_merge_guard(&self) -> Option<u64> {
        if self.fork.is_realtime() {
            self.rt_ag_blocks
        } else {
            None
        }
    }

    fn log_base(&self) -> u32 {
        // With no btree, the whole change lands in the inline extent
        // array; with a btree, the array bytes are untouched.
        if self.fork.broot.is_some() {
            LOG_CORE
        } else {
            LOG_CORE | LOG_EXT
        }
    }

    fn emit_map_rmap(&mut self, rec: &ExtentRec) {
        if self.skip_rmap {
            return;
        }
        if let PhysBlock::Real(block) = rec.phys {
            self.src.txn.defer(Intent::MapExtent {
                owner: self.owner,
                fork: self.fork.kind(),
                offset: rec.offset,
                block,
                len: rec.len,
            });
        }
    }

    fn emit_unmap_rmap(&mut self, offset: FileBlock, block: DiskBlock, len: u64) {
        if self.skip_rmap {
            return;
        }
        self.src.txn.defer(Intent::UnmapExtent {
            owner: self.owner,
            fork: self.fork.kind(),
            offset,
            block,
            len,
        });
    }

    // Btree mirror helpers. No-ops when the fork has no btree.

    fn bt_insert(&mut self, rec: ExtentRec) -> Result<()> {
        if let Some(root) = self.fork.broot.as_mut() {
            btree::insert(self.cache, self.src, self.fanout, root, rec)?;
        }
        Ok(())
    }

    fn bt_delete(&mut self, offset: FileBlock) -> Result<()> {
        if let Some(root) = self.fork.broot.as_mut() {
            btree::delete(self.cache, self.src, root, offset)?;
        }
        Ok(())
    }

    fn bt_update(&mut self, old_offset: FileBlock, new: ExtentRec) -> Result<()> {
        if let Some(root) = self.fork.broot.as_mut() {
            btree::update(self.cache, root, old_offset, new)?;
        }
        Ok(())
    }

    // ── Delayed → real conversion ───────────────────────────────────────

    /// Convert (part of) the delayed extent at the cursor to the real
    /// allocation `new`. The cursor ends up on the record covering
    /// `new.offset`.
    pub fn add_extent_delay_real(
        &mut self,
        cur: &mut IextCursor,
        new: ExtentRec,
    ) -> Result<u32> {
        let prev = *self
            .fork
            .list
            .get(*cur)
            .ok_or_else(|| RfsError::corrupt(0, "delay-real conversion past end of list"))?;
        if !prev.is_delayed() || !new.is_real() {
            return Err(RfsError::corrupt(
                0,
                "delay-real conversion on a non-delayed record",
            ));
        }
        if new.offset < prev.offset || new.end() > prev.end() {
            return Err(RfsError::corrupt(
                0,
                "delay-real conversion outside the delayed record",
            ));
        }

        let da_old = prev.reservation();
        let left_filling = prev.offset == new.offset;
        let right_filling = prev.end() == new.end();
        let rt_guard = self.rt_merge_guard();

        let left = self.fork.list.peek_prev(*cur).copied();
        let right = self.fork.list.peek_next(*cur).copied();
        let left_contig = left.as_ref().is_some_and(|l| can_merge(l, &new, rt_guard));
        // All-three merges must also fit a single record.
        let right_contig = right.as_ref().is_some_and(|r| {
            can_merge(&new, r, rt_guard)
                && (!(left_contig && left_filling && right_filling)
                    || left.as_ref().map_or(0, |l| l.len) + new.len + r.len <= MAX_EXTENT_LEN)
        });

        trace!(
            offset = new.offset.0,
            len = new.len,
            left_filling,
            left_contig,
            right_filling,
            right_contig,
            "delay_real"
        );

        let mut da_new = 0_u64;
        let flags = self.log_base();

        match (left_filling, left_contig, right_filling, right_contig) {
            (true, true, true, true) => {
                // The allocation fills the whole delayed record and
                // bridges both real neighbors into one.
                let left = left.expect("left neighbor");
                let right = right.expect("right neighbor");
                let merged = ExtentRec {
                    len: left.len + prev.len + right.len,
                    ..left
                };
                self.fork.list.remove_at(*cur); // prev
                self.fork.list.remove_at(*cur); // right
                self.fork.list.prev(cur);
                self.fork.list.update_at(*cur, merged);
                self.fork.dec_nextents();

                self.bt_delete(right.offset)?;
                self.bt_update(left.offset, merged)?;
            }
            (true, true, true, false) => {
                // Fills the whole record; merges left.
                let left = left.expect("left neighbor");
                let merged = ExtentRec {
                    len: left.len + prev.len,
                    ..left
                };
                self.fork.list.remove_at(*cur);
                self.fork.list.prev(cur);
                self.fork.list.update_at(*cur, merged);

                self.bt_update(left.offset, merged)?;
            }
            (true, false, true, true) => {
                // Fills the whole record; merges right.
                let right = right.expect("right neighbor");
                let merged = ExtentRec {
                    offset: prev.offset,
                    phys: new.phys,
                    len: prev.len + right.len,
                    state: new.state,
                };
                self.fork.list.remove_at(*cur);
                self.fork.list.update_at(*cur, merged);

                self.bt_update(right.offset, merged)?;
            }
            (true, false, true, false) => {
                // Fills the whole record; no merges. The record flips
                // from delayed to real in place.
                self.fork.list.update_at(*cur, new);
                self.fork.inc_nextents();

                self.bt_insert(new)?;
            }
            (true, true, false, false) => {
                // Fills the left part; left neighbor absorbs it.
                let left = left.expect("left neighbor");
                let merged = ExtentRec {
                    len: left.len + new.len,
                    ..left
                };
                let remainder_len = prev.len - new.len;
                da_new = worst_indlen(self.fanout, remainder_len).min(da_old);
                let remainder = ExtentRec::new_delayed(new.end(), remainder_len, da_new);
                self.fork.list.update_at(*cur, remainder);
                self.fork.list.prev(cur);
                self.fork.list.update_at(*cur, merged);

                self.bt_update(left.offset, merged)?;
            }
            (true, false, false, false) => {
                // Fills the left part; new record inserted before the
                // trimmed remainder.
                let remainder_len = prev.len - new.len;
                da_new = worst_indlen(self.fanout, remainder_len).min(da_old);
                let remainder = ExtentRec::new_delayed(new.end(), remainder_len, da_new);
                self.fork.list.update_at(*cur, remainder);
                self.fork.list.insert_at(*cur, new);
                self.fork.inc_nextents();

                self.bt_insert(new)?;
            }
            (false, false, true, true) => {
                // Fills the right part; right neighbor absorbs it.
                let right = right.expect("right neighbor");
                let merged = ExtentRec {
                    offset: new.offset,
                    phys: new.phys,
                    len: new.len + right.len,
                    state: new.state,
                };
                let remainder_len = prev.len - new.len;
                da_new = worst_indlen(self.fanout, remainder_len).min(da_old);
                let remainder = ExtentRec::new_delayed(prev.offset, remainder_len, da_new);
                self.fork.list.update_at(*cur, remainder);
                self.fork.list.next(cur);
                self.fork.list.update_at(*cur, merged);

                self.bt_update(right.offset, merged)?;
            }
            (false, false, true, false) => {
                // Fills the right part; new record inserted after the
                // trimmed remainder.
                let remainder_len = prev.len - new.len;
                da_new = worst_indlen(self.fanout, remainder_len).min(da_old);
                let remainder = ExtentRec::new_delayed(prev.offset, remainder_len, da_new);
                self.fork.list.update_at(*cur, remainder);
                self.fork.list.next(cur);
                self.fork.list.insert_at(*cur, new);
                self.fork.inc_nextents();

                self.bt_insert(new)?;
            }
            (false, false, false, false) => {
                // Fills the middle: delayed remainders survive on both
                // sides. Contiguity is impossible here.
                let left_len = new.offset.0 - prev.offset.0;
                let right_len = prev.end().0 - new.end().0;
                let left_res = worst_indlen(self.fanout, left_len);
                let right_res = worst_indlen(self.fanout, right_len);
                let left_rec = ExtentRec::new_delayed(prev.offset, left_len, left_res);
                let right_rec = ExtentRec::new_delayed(new.end(), right_len, right_res);

                self.fork.list.update_at(*cur, left_rec);
                self.fork.list.next(cur);
                self.fork.list.insert_at(*cur, right_rec);
                self.fork.list.insert_at(*cur, new);
                self.fork.inc_nextents();
                da_new = left_res + right_res;

                self.bt_insert(new)?;
            }
            // A contiguity flag without its filling flag cannot occur:
            // the neighbor would not be adjacent to the converted range.
            (false, true, _, _)
            | (true, true, false, true)
            | (true, false, false, true)
            | (false, false, false, true) => {
                return Err(RfsError::corrupt(
                    0,
                    "impossible adjacency state in delay-real conversion",
                ));
            }
        }

        // Reservation settlement: surplus goes back to free space,
        // shortfall is taken from it (and may fail with ENOSPC).
        let data_pool = self.data_pool();
        if da_new < da_old {
            self.counters.unreserve(Pool::Data, da_old - da_new);
        } else if da_new > da_old {
            self.counters.reserve(Pool::Data, da_new - da_old)?;
        }
        self.counters.delalloc_add(da_new);
        self.counters.delalloc_sub(new.len + da_old)?;
        // The converted data blocks were paid for at reservation time;
        // credit the allocation charge back.
        self.src
            .txn
            .add_block_delta(data_pool, i64::try_from(new.len).expect("len fits i64"));

        self.emit_map_rmap(&new);
        debug_assert!(self.fork.list.validate().is_ok());
        Ok(flags)
    }

    // ── Unwritten ⇄ normal conversion ───────────────────────────────────

    /// Flip (part of) the real extent at the cursor to `new.state`.
    pub fn add_extent_unwritten_real(
        &mut self,
        cur: &mut IextCursor,
        new: ExtentRec,
    ) -> Result<u32> {
        let prev = *self
            .fork
            .list
            .get(*cur)
            .ok_or_else(|| RfsError::corrupt(0, "unwritten conversion past end of list"))?;
        if !prev.is_real() || !new.is_real() {
            return Err(RfsError::corrupt(
                0,
                "unwritten conversion on a non-real record",
            ));
        }
        if prev.state == new.state {
            return Err(RfsError::corrupt(0, "unwritten conversion without a state change"));
        }
        if new.offset < prev.offset || new.end() > prev.end() {
            return Err(RfsError::corrupt(
                0,
                "unwritten conversion outside the target record",
            ));
        }
        // The converted range keeps its physical placement.
        let expected =
            DiskBlock(prev.real_block().expect("real").0 + (new.offset.0 - prev.offset.0));
        if new.real_block() != Some(expected) {
            return Err(RfsError::corrupt(
                expected.0,
                "unwritten conversion moved physical blocks",
            ));
        }

        let prev_block = prev.real_block().expect("real");
        let left_filling = prev.offset == new.offset;
        let right_filling = prev.end() == new.end();
        let rt_guard = self.rt_merge_guard();

        let left = self.fork.list.peek_prev(*cur).copied();
        let right = self.fork.list.peek_next(*cur).copied();
        let left_contig = left.as_ref().is_some_and(|l| can_merge(l, &new, rt_guard));
        let right_contig = right.as_ref().is_some_and(|r| {
            can_merge(&new, r, rt_guard)
                && (!(left_contig && left_filling && right_filling)
                    || left.as_ref().map_or(0, |l| l.len) + new.len + r.len <= MAX_EXTENT_LEN)
        });

        trace!(
            offset = new.offset.0,
            len = new.len,
            left_filling,
            left_contig,
            right_filling,
            right_contig,
            "unwritten_real"
        );

        let flags = self.log_base();

        match (left_filling, left_contig, right_filling, right_contig) {
            (true, true, true, true) => {
                // Whole record converts and bridges both neighbors.
                let left = left.expect("left neighbor");
                let right = right.expect("right neighbor");
                let merged = ExtentRec {
                    len: left.len + prev.len + right.len,
                    ..left
                };
                self.fork.list.remove_at(*cur);
                self.fork.list.remove_at(*cur);
                self.fork.list.prev(cur);
                self.fork.list.update_at(*cur, merged);
                self.fork.dec_nextents();
                self.fork.dec_nextents();

                self.bt_delete(right.offset)?;
                self.bt_delete(prev.offset)?;
                self.bt_update(left.offset, merged)?;
            }
            (true, true, true, false) => {
                let left = left.expect("left neighbor");
                let merged = ExtentRec {
                    len: left.len + prev.len,
                    ..left
                };
                self.fork.list.remove_at(*cur);
                self.fork.list.prev(cur);
                self.fork.list.update_at(*cur, merged);
                self.fork.dec_nextents();

                self.bt_delete(prev.offset)?;
                self.bt_update(left.offset, merged)?;
            }
            (true, false, true, true) => {
                let right = right.expect("right neighbor");
                let merged = ExtentRec {
                    offset: prev.offset,
                    phys: new.phys,
                    len: prev.len + right.len,
                    state: new.state,
                };
                self.fork.list.remove_at(*cur);
                self.fork.list.update_at(*cur, merged);
                self.fork.dec_nextents();

                self.bt_delete(right.offset)?;
                self.bt_update(prev.offset, merged)?;
            }
            (true, false, true, false) => {
                // Whole record flips state in place.
                self.fork.list.update_at(*cur, new);

                self.bt_update(prev.offset, new)?;
            }
            (true, true, false, false) => {
                let left = left.expect("left neighbor");
                let merged = ExtentRec {
                    len: left.len + new.len,
                    ..left
                };
                let remainder = ExtentRec::new_real(
                    new.end(),
                    DiskBlock(prev_block.0 + new.len),
                    prev.len - new.len,
                    prev.state,
                );
                self.fork.list.update_at(*cur, remainder);
                self.fork.list.prev(cur);
                self.fork.list.update_at(*cur, merged);

                self.bt_update(prev.offset, remainder)?;
                self.bt_update(left.offset, merged)?;
            }
            (true, false, false, false) => {
                let remainder = ExtentRec::new_real(
                    new.end(),
                    DiskBlock(prev_block.0 + new.len),
                    prev.len - new.len,
                    prev.state,
                );
                self.fork.list.update_at(*cur, remainder);
                self.fork.list.insert_at(*cur, new);
                self.fork.inc_nextents();

                self.bt_update(prev.offset, remainder)?;
                self.bt_insert(new)?;
            }
            (false, false, true, true) => {
                let right = right.expect("right neighbor");
                let remainder = ExtentRec {
                    len: prev.len - new.len,
                    ..prev
                };
                let merged = ExtentRec {
                    offset: new.offset,
                    phys: new.phys,
                    len: new.len + right.len,
                    state: new.state,
                };
                self.fork.list.update_at(*cur, remainder);
                self.fork.list.next(cur);
                self.fork.list.update_at(*cur, merged);

                self.bt_update(prev.offset, remainder)?;
                self.bt_update(right.offset, merged)?;
            }
            (false, false, true, false) => {
                let remainder = ExtentRec {
                    len: prev.len - new.len,
                    ..prev
                };
                self.fork.list.update_at(*cur, remainder);
                self.fork.list.next(cur);
                self.fork.list.insert_at(*cur, new);
                self.fork.inc_nextents();

                self.bt_update(prev.offset, remainder)?;
                self.bt_insert(new)?;
            }
            (false, false, false, false) => {
                // Converting the middle: three records remain.
                let left_part = ExtentRec {
                    len: new.offset.0 - prev.offset.0,
                    ..prev
                };
                let right_part = ExtentRec::new_real(
                    new.end(),
                    DiskBlock(prev_block.0 + (new.end().0 - prev.offset.0)),
                    prev.end().0 - new.end().0,
                    prev.state,
                );
                self.fork.list.update_at(*cur, left_part);
                self.fork.list.next(cur);
                self.fork.list.insert_at(*cur, right_part);
                self.fork.list.insert_at(*cur, new);
                self.fork.inc_nextents();
                self.fork.inc_nextents();

                self.bt_update(prev.offset, left_part)?;
                self.bt_insert(right_part)?;
                self.bt_insert(new)?;
            }
            (false, true, _, _)
            | (true, true, false, true)
            | (true, false, false, true)
            | (false, false, false, true) => {
                return Err(RfsError::corrupt(
                    0,
                    "impossible adjacency state in unwritten conversion",
                ));
            }
        }

        debug_assert!(self.fork.list.validate().is_ok());
        Ok(flags)
    }

    // ── Mapping into a hole ─────────────────────────────────────────────

    /// Insert a real allocation into a hole in the map. The cursor must
    /// be positioned by `lookup(new.offset)` (on the following record or
    /// past end).
    pub fn add_extent_hole_real(&mut self, cur: &mut IextCursor, new: ExtentRec) -> Result<u32> {
        debug_assert!(new.is_real());
        let rt_guard = self.rt_merge_guard();
        let left = self.fork.list.peek_prev(*cur).copied();
        let right = self.fork.list.get(*cur).copied();

        let left_contig = left.as_ref().is_some_and(|l| can_merge(l, &new, rt_guard));
        let right_contig = right.as_ref().is_some_and(|r| {
            can_merge(&new, r, rt_guard)
                && (!left_contig
                    || left.as_ref().map_or(0, |l| l.len) + new.len + r.len <= MAX_EXTENT_LEN)
        });

        trace!(
            offset = new.offset.0,
            len = new.len,
            left_contig,
            right_contig,
            "hole_real"
        );

        let flags = self.log_base();

        match (left_contig, right_contig) {
            (true, true) => {
                // New extent bridges both neighbors into one record.
                let left = left.expect("left neighbor");
                let right = right.expect("right neighbor");
                let merged = ExtentRec {
                    len: left.len + new.len + right.len,
                    ..left
                };
                self.fork.list.remove_at(*cur);
                self.fork.list.prev(cur);
                self.fork.list.update_at(*cur, merged);
                self.fork.dec_nextents();

                self.bt_delete(right.offset)?;
                self.bt_update(left.offset, merged)?;
            }
            (true, false) => {
                let left = left.expect("left neighbor");
                let merged = ExtentRec {
                    len: left.len + new.len,
                    ..left
                };
                self.fork.list.prev(cur);
                self.fork.list.update_at(*cur, merged);

                self.bt_update(left.offset, merged)?;
            }
            (false, true) => {
                let right = right.expect("right neighbor");
                let merged = ExtentRec {
                    offset: new.offset,
                    phys: new.phys,
                    len: new.len + right.len,
                    state: new.state,
                };
                self.fork.list.update_at(*cur, merged);

                self.bt_update(right.offset, merged)?;
            }
            (false, false) => {
                self.fork.list.insert_at(*cur, new);
                self.fork.inc_nextents();

                self.bt_insert(new)?;
            }
        }

        self.emit_map_rmap(&new);
        debug_assert!(self.fork.list.validate().is_ok());
        Ok(flags)
    }

    /// Reserve delayed space over a hole, merging with delayed
    /// neighbors. The merged record's reservation is recomputed from the
    /// combined length and never grows beyond the sum of its parts.
    pub fn add_extent_hole_delay(
        &mut self,
        cur: &mut IextCursor,
        offset: FileBlock,
        len: u64,
    ) -> Result<()> {
        debug_assert!(len > 0 && len <= MAX_EXTENT_LEN);
        let indlen = worst_indlen(self.fanout, len);
        let data_pool = self.data_pool();

        // Fail-closed up front: both the data blocks and the worst-case
        // indirect blocks must be coverable before anything is recorded.
        self.counters.reserve(data_pool, len)?;
        if let Err(err) = self.counters.reserve(Pool::Data, indlen) {
            self.counters.unreserve(data_pool, len);
            return Err(err);
        }
        self.counters.delalloc_add(len + indlen);

        let new = ExtentRec::new_delayed(offset, len, indlen);
        let left = self.fork.list.peek_prev(*cur).copied();
        let right = self.fork.list.get(*cur).copied();
        let left_contig = left.as_ref().is_some_and(|l| can_merge_delayed(l, &new));
        let right_contig = right.as_ref().is_some_and(|r| {
            can_merge_delayed(&new, r)
                && (!left_contig
                    || left.as_ref().map_or(0, |l| l.len) + new.len + r.len <= MAX_EXTENT_LEN)
        });

        let (merged_offset, merged_len, old_res) = match (left_contig, right_contig) {
            (true, true) => {
                let left = left.expect("left neighbor");
                let right = right.expect("right neighbor");
                (
                    left.offset,
                    left.len + len + right.len,
                    left.reservation() + indlen + right.reservation(),
                )
            }
            (true, false) => {
                let left = left.expect("left neighbor");
                (left.offset, left.len + len, left.reservation() + indlen)
            }
            (false, true) => {
                let right = right.expect("right neighbor");
                (offset, len + right.len, indlen + right.reservation())
            }
            (false, false) => (offset, len, indlen),
        };

        // Never grow the combined reservation: worst case for the merged
        // length, capped at what the parts already hold.
        let new_res = worst_indlen(self.fanout, merged_len).min(old_res);
        let merged = ExtentRec::new_delayed(merged_offset, merged_len, new_res);

        match (left_contig, right_contig) {
            (true, true) => {
                self.fork.list.remove_at(*cur);
                self.fork.list.prev(cur);
                self.fork.list.update_at(*cur, merged);
            }
            (true, false) => {
                self.fork.list.prev(cur);
                self.fork.list.update_at(*cur, merged);
            }
            (false, true) => {
                self.fork.list.update_at(*cur, merged);
            }
            (false, false) => {
                self.fork.list.insert_at(*cur, merged);
            }
        }

        if new_res < old_res {
            let surplus = old_res - new_res;
            self.counters.unreserve(Pool::Data, surplus);
            self.counters.delalloc_sub(surplus)?;
        }

        trace!(
            offset = offset.0,
            len,
            reservation = new_res,
            merged = left_contig || right_contig,
            "hole_delay"
        );
        debug_assert!(self.fork.list.validate().is_ok());
        Ok(())
    }

    // ── Removal ─────────────────────────────────────────────────────────

    /// Remove `[del_offset, del_offset + del_len)` from the real extent
    /// at the cursor. Physical space is released through a deferred-free
    /// intent unless `flags.remap`.
    pub fn del_extent_real(
        &mut self,
        cur: &mut IextCursor,
        del_offset: FileBlock,
        del_len: u64,
        flags: DelFlags,
    ) -> Result<u32> {
        let got = *self
            .fork
            .list
            .get(*cur)
            .ok_or_else(|| RfsError::corrupt(0, "real delete past end of list"))?;
        let got_block = got
            .real_block()
            .ok_or_else(|| RfsError::corrupt(0, "real delete on a non-real record"))?;
        let del_end = FileBlock(del_offset.0 + del_len);
        if del_offset < got.offset || del_end > got.end() {
            return Err(RfsError::corrupt(
                got_block.0,
                "real delete outside the target record",
            ));
        }

        let left_filling = got.offset == del_offset;
        let right_filling = got.end() == del_end;
        let del_block = DiskBlock(got_block.0 + (del_offset.0 - got.offset.0));
        let log_flags = self.log_base();

        trace!(
            offset = del_offset.0,
            len = del_len,
            left_filling,
            right_filling,
            "del_extent_real"
        );

        match (left_filling, right_filling) {
            (true, true) => {
                // Matches the whole extent: delete the entry.
                self.fork.list.remove_at(*cur);
                self.fork.list.prev(cur);
                self.fork.dec_nextents();

                self.bt_delete(got.offset)?;
            }
            (true, false) => {
                // Trim the front.
                let rest = ExtentRec::new_real(
                    del_end,
                    DiskBlock(got_block.0 + del_len),
                    got.len - del_len,
                    got.state,
                );
                self.fork.list.update_at(*cur, rest);

                self.bt_update(got.offset, rest)?;
            }
            (false, true) => {
                // Trim the tail.
                let rest = ExtentRec {
                    len: got.len - del_len,
                    ..got
                };
                self.fork.list.update_at(*cur, rest);

                self.bt_update(got.offset, rest)?;
            }
            (false, false) => {
                // Punch out the middle: the record splits in two. The
                // btree insert may need a new block and can fail with
                // ENOSPC when no expansion room is available.
                let left_part = ExtentRec {
                    len: del_offset.0 - got.offset.0,
                    ..got
                };
                let right_part = ExtentRec::new_real(
                    del_end,
                    DiskBlock(got_block.0 + (del_end.0 - got.offset.0)),
                    got.end().0 - del_end.0,
                    got.state,
                );
                self.fork.list.update_at(*cur, left_part);
                self.fork.list.next(cur);
                self.fork.list.insert_at(*cur, right_part);
                self.fork.inc_nextents();

                self.bt_update(got.offset, left_part)?;
                self.bt_insert(right_part)?;
            }
        }

        if !flags.remap {
            self.src.txn.defer(Intent::FreeExtent {
                block: del_block,
                len: del_len,
                pool: self.data_pool(),
            });
        }
        self.emit_unmap_rmap(del_offset, del_block, del_len);
        debug_assert!(self.fork.list.validate().is_ok());
        Ok(log_flags)
    }

    /// Remove `[del_offset, del_offset + del_len)` from the delayed
    /// extent at the cursor, redistributing the reservation per the
    /// split/steal policy. Purely in-core: no btree, no ENOSPC.
    pub fn del_extent_delay(
        &mut self,
        cur: &mut IextCursor,
        del_offset: FileBlock,
        del_len: u64,
    ) -> Result<()> {
        let got = *self
            .fork
            .list
            .get(*cur)
            .ok_or_else(|| RfsError::corrupt(0, "delayed delete past end of list"))?;
        if !got.is_delayed() {
            return Err(RfsError::corrupt(0, "delayed delete on a non-delayed record"));
        }
        let del_end = FileBlock(del_offset.0 + del_len);
        if del_offset < got.offset || del_end > got.end() {
            return Err(RfsError::corrupt(
                0,
                "delayed delete outside the target record",
            ));
        }

        let is_realtime = self.fork.is_realtime();
        let data_pool = self.data_pool();
        let da_old = got.reservation();
        let mut da_new = 0_u64;
        let mut stolen = 0_u64;

        let left_filling = got.offset == del_offset;
        let right_filling = got.end() == del_end;

        trace!(
            offset = del_offset.0,
            len = del_len,
            left_filling,
            right_filling,
            "del_extent_delay"
        );

        match (left_filling, right_filling) {
            (true, true) => {
                // Matches the whole extent: delete the entry.
                self.fork.list.remove_at(*cur);
                self.fork.list.prev(cur);
            }
            (true, false) => {
                // Deleting the first part.
                let rest_len = got.len - del_len;
                da_new = worst_indlen(self.fanout, rest_len).min(da_old);
                self.fork
                    .list
                    .update_at(*cur, ExtentRec::new_delayed(del_end, rest_len, da_new));
            }
            (false, true) => {
                // Deleting the last part.
                let rest_len = got.len - del_len;
                da_new = worst_indlen(self.fanout, rest_len).min(da_old);
                self.fork
                    .list
                    .update_at(*cur, ExtentRec::new_delayed(got.offset, rest_len, da_new));
            }
            (false, false) => {
                // Deleting the middle: distribute the reservation across
                // both remainders, stealing blocks from the deleted range
                // to cover a deficiency — except on realtime forks, where
                // data and indirect blocks come from different pools and
                // the under-reservation is accepted.
                let left_len = del_offset.0 - got.offset.0;
                let right_len = got.end().0 - del_end.0;
                let mut left_res = worst_indlen(self.fanout, left_len);
                let mut right_res = worst_indlen(self.fanout, right_len);

                da_new = left_res + right_res;
                let mut ores = da_old;
                if da_new > ores && !is_realtime {
                    stolen = (da_new - ores).min(del_len);
                    ores += stolen;
                }
                if da_new > ores {
                    split_indlen(ores, &mut left_res, &mut right_res);
                    da_new = left_res + right_res;
                }

                self.fork.list.update_at(
                    *cur,
                    ExtentRec::new_delayed(got.offset, left_len, left_res),
                );
                self.fork.list.next(cur);
                self.fork
                    .list
                    .insert_at(*cur, ExtentRec::new_delayed(del_end, right_len, right_res));
            }
        }

        // Settle the counters: freed data blocks (minus any stolen into
        // the reservations) and the indirect-block surplus both return
        // to free space.
        let da_diff = (da_old + stolen) - da_new;
        self.counters.unreserve(data_pool, del_len - stolen);
        self.counters.unreserve(Pool::Data, da_diff);
        self.counters.delalloc_sub((del_len - stolen) + da_diff)?;

        debug_assert!(self.fork.list.validate().is_ok());
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fork::ForkFormat;
    use crate::record::ExtState;
    use rfs_alloc::AgGeometry;
    use rfs_block::{BufCache, MemBlockDevice};
    use rfs_trans::TxnManager;
    use rfs_types::ForkKind;
    use std::sync::Arc;

    struct Rig {
        cache: BufCache<MemBlockDevice>,
        groups: AllocGroups,
        counters: Arc<FsCounters>,
        mgr: TxnManager,
        fanout: BtreeFanout,
    }

    fn rig() -> Rig {
        let groups =
            AllocGroups::new_empty(AgGeometry::new(2, 4096, Pool::Data).unwrap());
        let counters = Arc::new(FsCounters::new(groups.free_blocks(), 10_000));
        Rig {
            cache: BufCache::new(MemBlockDevice::new(512, 8192)),
            groups,
            counters: Arc::clone(&counters),
            mgr: TxnManager::new(counters),
            fanout: BtreeFanout::for_block_size(512),
        }
    }

    fn real(offset: u64, block: u64, len: u64) -> ExtentRec {
        ExtentRec::new_real(FileBlock(offset), DiskBlock(block), len, ExtState::Normal)
    }

    fn unwritten(offset: u64, block: u64, len: u64) -> ExtentRec {
        ExtentRec::new_real(FileBlock(offset), DiskBlock(block), len, ExtState::Unwritten)
    }

    fn seed(fork: &mut Fork, recs: &[ExtentRec]) {
        fork.format = ForkFormat::ExtentArray;
        for rec in recs {
            fork.list.insert_at(fork.list.lookup(rec.offset), *rec);
            if rec.is_real() {
                fork.nextents += 1;
            }
        }
        fork.validate().unwrap();
    }

    /// Seed a delayed record with its counter footprint, as the reserve
    /// path would have left it.
    fn seed_delayed(fork: &mut Fork, counters: &FsCounters, offset: u64, len: u64, res: u64) {
        let rec = ExtentRec::new_delayed(FileBlock(offset), len, res);
        fork.list.insert_at(fork.list.lookup(rec.offset), rec);
        counters.reserve(Pool::Data, len + res).unwrap();
        counters.delalloc_add(len + res);
    }

    /// Run `f` with a fully wired engine over `fork`.
    fn with_engine<R>(
        rig: &mut Rig,
        fork: &mut Fork,
        f: impl FnOnce(&mut Engine<'_, '_, MemBlockDevice>) -> Result<R>,
    ) -> Result<R> {
        let mut txn = rig.mgr.begin(16).unwrap();
        let out = {
            let mut src = TxnBlockSource {
                txn: &mut txn,
                meta_groups: &mut rig.groups,
            };
            let mut engine = Engine {
                fork,
                cache: &rig.cache,
                src: &mut src,
                fanout: &rig.fanout,
                counters: &rig.counters,
                rt_ag_blocks: None,
                owner: 42,
                skip_rmap: true,
            };
            f(&mut engine)
        };
        txn.commit().unwrap();
        out
    }

    fn recs(fork: &Fork) -> Vec<ExtentRec> {
        fork.extents().iter().copied().collect()
    }

    // ── delay → real ────────────────────────────────────────────────────

    #[test]
    fn delay_real_full_fill_no_neighbors() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(&mut fork, &[]);
        seed_delayed(&mut fork, &rig.counters, 10, 20, 4);

        let new = real(10, 700, 20);
        with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(10));
            eng.add_extent_delay_real(&mut cur, new)
        })
        .unwrap();

        assert_eq!(recs(&fork), vec![new]);
        assert_eq!(fork.nextents(), 1);
        // Whole reservation settled: data blocks stay allocated, the
        // four indirect blocks went back to free space.
        assert_eq!(fork.delayed_total(), 0);
    }

    #[test]
    fn delay_real_full_fill_merges_left() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(&mut fork, &[real(0, 690, 10)]);
        seed_delayed(&mut fork, &rig.counters, 10, 20, 4);

        with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(10));
            eng.add_extent_delay_real(&mut cur, real(10, 700, 20))
        })
        .unwrap();

        assert_eq!(recs(&fork), vec![real(0, 690, 30)]);
        assert_eq!(fork.nextents(), 1);
    }

    #[test]
    fn delay_real_full_fill_merges_right() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(&mut fork, &[real(30, 720, 10)]);
        seed_delayed(&mut fork, &rig.counters, 10, 20, 4);

        with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(10));
            eng.add_extent_delay_real(&mut cur, real(10, 700, 20))
        })
        .unwrap();

        assert_eq!(recs(&fork), vec![real(10, 700, 30)]);
        assert_eq!(fork.nextents(), 1);
    }

    #[test]
    fn delay_real_full_fill_bridges_both_neighbors() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(&mut fork, &[real(0, 690, 10), real(30, 720, 10)]);
        seed_delayed(&mut fork, &rig.counters, 10, 20, 4);

        with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(10));
            eng.add_extent_delay_real(&mut cur, real(10, 700, 20))
        })
        .unwrap();

        assert_eq!(recs(&fork), vec![real(0, 690, 40)]);
        assert_eq!(fork.nextents(), 1);
    }

    #[test]
    fn delay_real_left_fill_keeps_delayed_remainder() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(&mut fork, &[]);
        seed_delayed(&mut fork, &rig.counters, 10, 20, 6);
        let before_delalloc = rig.counters.delalloc_blocks();

        with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(10));
            eng.add_extent_delay_real(&mut cur, real(10, 700, 5))
        })
        .unwrap();

        let all = recs(&fork);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], real(10, 700, 5));
        assert_eq!(all[1].offset, FileBlock(15));
        assert_eq!(all[1].len, 15);
        assert!(all[1].is_delayed());
        assert!(all[1].reservation() <= 6);
        // Outstanding delalloc shrank by at least the converted blocks.
        assert!(rig.counters.delalloc_blocks() <= before_delalloc - 5);
        assert_eq!(rig.counters.delalloc_blocks(), fork.delayed_total());
    }

    #[test]
    fn delay_real_right_fill_keeps_delayed_remainder() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(&mut fork, &[]);
        seed_delayed(&mut fork, &rig.counters, 10, 20, 6);

        with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(25));
            eng.add_extent_delay_real(&mut cur, real(25, 700, 5))
        })
        .unwrap();

        let all = recs(&fork);
        assert_eq!(all.len(), 2);
        assert!(all[0].is_delayed());
        assert_eq!(all[0].offset, FileBlock(10));
        assert_eq!(all[0].len, 15);
        assert_eq!(all[1], real(25, 700, 5));
        assert_eq!(rig.counters.delalloc_blocks(), fork.delayed_total());
    }

    #[test]
    fn delay_real_middle_fill_leaves_two_delayed() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(&mut fork, &[]);
        seed_delayed(&mut fork, &rig.counters, 0, 100, 8);

        with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(40));
            eng.add_extent_delay_real(&mut cur, real(40, 700, 20))
        })
        .unwrap();

        let all = recs(&fork);
        assert_eq!(all.len(), 3);
        assert!(all[0].is_delayed());
        assert_eq!((all[0].offset, all[0].len), (FileBlock(0), 40));
        assert_eq!(all[1], real(40, 700, 20));
        assert!(all[2].is_delayed());
        assert_eq!((all[2].offset, all[2].len), (FileBlock(60), 40));
        assert_eq!(fork.nextents(), 1);
        assert_eq!(rig.counters.delalloc_blocks(), fork.delayed_total());
    }

    #[test]
    fn delay_real_left_fill_with_left_merge() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(&mut fork, &[real(0, 690, 10)]);
        seed_delayed(&mut fork, &rig.counters, 10, 20, 6);

        with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(10));
            eng.add_extent_delay_real(&mut cur, real(10, 700, 5))
        })
        .unwrap();

        let all = recs(&fork);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], real(0, 690, 15));
        assert!(all[1].is_delayed());
        assert_eq!((all[1].offset, all[1].len), (FileBlock(15), 15));
        assert_eq!(fork.nextents(), 1);
    }

    #[test]
    fn delay_real_right_fill_with_right_merge() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(&mut fork, &[real(30, 705, 10)]);
        seed_delayed(&mut fork, &rig.counters, 10, 20, 6);

        with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(25));
            eng.add_extent_delay_real(&mut cur, real(25, 700, 5))
        })
        .unwrap();

        let all = recs(&fork);
        assert_eq!(all.len(), 2);
        assert!(all[0].is_delayed());
        assert_eq!((all[0].offset, all[0].len), (FileBlock(10), 15));
        assert_eq!(all[1], real(25, 700, 15));
        assert_eq!(fork.nextents(), 1);
    }

    #[test]
    fn delay_real_on_real_record_is_corruption() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(&mut fork, &[real(10, 700, 20)]);

        let result = with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(10));
            eng.add_extent_delay_real(&mut cur, real(10, 900, 20))
        });
        assert!(matches!(result, Err(RfsError::Corruption { .. })));
    }

    // ── unwritten ⇄ normal ──────────────────────────────────────────────

    #[test]
    fn unwritten_full_flip_in_place() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(&mut fork, &[unwritten(10, 700, 20)]);

        with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(10));
            eng.add_extent_unwritten_real(&mut cur, real(10, 700, 20))
        })
        .unwrap();

        assert_eq!(recs(&fork), vec![real(10, 700, 20)]);
    }

    #[test]
    fn unwritten_middle_conversion_splits_three_ways() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(&mut fork, &[unwritten(0, 700, 30)]);

        with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(10));
            eng.add_extent_unwritten_real(&mut cur, real(10, 710, 10))
        })
        .unwrap();

        assert_eq!(
            recs(&fork),
            vec![unwritten(0, 700, 10), real(10, 710, 10), unwritten(20, 720, 10)]
        );
        assert_eq!(fork.nextents(), 3);
    }

    #[test]
    fn unwritten_full_flip_bridges_normal_neighbors() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(
            &mut fork,
            &[real(0, 690, 10), unwritten(10, 700, 20), real(30, 720, 10)],
        );

        with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(10));
            eng.add_extent_unwritten_real(&mut cur, real(10, 700, 20))
        })
        .unwrap();

        assert_eq!(recs(&fork), vec![real(0, 690, 40)]);
        assert_eq!(fork.nextents(), 1);
    }

    #[test]
    fn unwritten_left_fill_merges_left_and_trims() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(&mut fork, &[real(0, 690, 10), unwritten(10, 700, 20)]);

        with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(10));
            eng.add_extent_unwritten_real(&mut cur, real(10, 700, 5))
        })
        .unwrap();

        assert_eq!(recs(&fork), vec![real(0, 690, 15), unwritten(15, 705, 15)]);
        assert_eq!(fork.nextents(), 2);
    }

    #[test]
    fn unwritten_conversion_must_not_move_blocks() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(&mut fork, &[unwritten(10, 700, 20)]);

        let result = with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(10));
            eng.add_extent_unwritten_real(&mut cur, real(10, 999, 20))
        });
        assert!(matches!(result, Err(RfsError::Corruption { .. })));
    }

    // ── hole mapping ────────────────────────────────────────────────────

    #[test]
    fn hole_real_bridges_two_neighbors() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(&mut fork, &[real(0, 100, 10), real(20, 120, 10)]);

        with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(10));
            eng.add_extent_hole_real(&mut cur, real(10, 110, 10))
        })
        .unwrap();

        assert_eq!(recs(&fork), vec![real(0, 100, 30)]);
        assert_eq!(fork.nextents(), 1);
    }

    #[test]
    fn hole_real_merges_one_side_when_other_is_discontiguous() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        // Right neighbor is logically adjacent but physically elsewhere.
        seed(&mut fork, &[real(0, 100, 10), real(20, 500, 10)]);

        with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(10));
            eng.add_extent_hole_real(&mut cur, real(10, 110, 10))
        })
        .unwrap();

        assert_eq!(recs(&fork), vec![real(0, 100, 20), real(20, 500, 10)]);
        assert_eq!(fork.nextents(), 2);
    }

    #[test]
    fn hole_real_standalone_insert() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(&mut fork, &[real(0, 100, 5)]);

        with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(50));
            eng.add_extent_hole_real(&mut cur, real(50, 900, 5))
        })
        .unwrap();

        assert_eq!(recs(&fork), vec![real(0, 100, 5), real(50, 900, 5)]);
        assert_eq!(fork.nextents(), 2);
    }

    #[test]
    fn hole_delay_merges_delayed_neighbors_without_growing_reservation() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(&mut fork, &[]);
        seed_delayed(&mut fork, &rig.counters, 0, 10, 5);
        seed_delayed(&mut fork, &rig.counters, 20, 10, 5);

        with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(10));
            eng.add_extent_hole_delay(&mut cur, FileBlock(10), 10)
        })
        .unwrap();

        let all = recs(&fork);
        assert_eq!(all.len(), 1);
        assert_eq!((all[0].offset, all[0].len), (FileBlock(0), 30));
        assert!(all[0].is_delayed());
        // Combined reservation never exceeds the sum of the parts.
        assert!(all[0].reservation() <= 10 + worst_indlen(&rig.fanout, 10));
        assert_eq!(rig.counters.delalloc_blocks(), fork.delayed_total());
    }

    // ── removal ─────────────────────────────────────────────────────────

    #[test]
    fn del_real_middle_split() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(&mut fork, &[real(0, 200, 20)]);

        with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(5));
            eng.del_extent_real(&mut cur, FileBlock(5), 10, DelFlags::default())
        })
        .unwrap();

        assert_eq!(recs(&fork), vec![real(0, 200, 5), real(15, 215, 5)]);
        assert_eq!(fork.nextents(), 2);
    }

    #[test]
    fn del_real_whole_extent_defers_free() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(&mut fork, &[real(0, 200, 20)]);

        let mut txn = rig.mgr.begin(16).unwrap();
        {
            let mut src = TxnBlockSource {
                txn: &mut txn,
                meta_groups: &mut rig.groups,
            };
            let mut engine = Engine {
                fork: &mut fork,
                cache: &rig.cache,
                src: &mut src,
                fanout: &rig.fanout,
                counters: &rig.counters,
                rt_ag_blocks: None,
                owner: 42,
                skip_rmap: false,
            };
            let mut cur = engine.fork.list.lookup(FileBlock(0));
            engine
                .del_extent_real(&mut cur, FileBlock(0), 20, DelFlags::default())
                .unwrap();
        }
        let intents = txn.commit().unwrap();
        assert!(recs(&fork).is_empty());
        assert!(intents.iter().any(|i| matches!(
            i,
            Intent::FreeExtent { block: DiskBlock(200), len: 20, pool: Pool::Data }
        )));
        assert!(intents
            .iter()
            .any(|i| matches!(i, Intent::UnmapExtent { len: 20, .. })));
    }

    #[test]
    fn del_real_remap_skips_free_intent() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(&mut fork, &[real(0, 200, 20)]);

        let mut txn = rig.mgr.begin(16).unwrap();
        {
            let mut src = TxnBlockSource {
                txn: &mut txn,
                meta_groups: &mut rig.groups,
            };
            let mut engine = Engine {
                fork: &mut fork,
                cache: &rig.cache,
                src: &mut src,
                fanout: &rig.fanout,
                counters: &rig.counters,
                rt_ag_blocks: None,
                owner: 42,
                skip_rmap: false,
            };
            let mut cur = engine.fork.list.lookup(FileBlock(0));
            engine
                .del_extent_real(&mut cur, FileBlock(0), 20, DelFlags { remap: true })
                .unwrap();
        }
        let intents = txn.commit().unwrap();
        assert!(!intents
            .iter()
            .any(|i| matches!(i, Intent::FreeExtent { .. })));
        assert!(intents
            .iter()
            .any(|i| matches!(i, Intent::UnmapExtent { .. })));
    }

    #[test]
    fn del_delay_middle_steals_from_deleted_range_on_data_pool() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(&mut fork, &[]);
        // Reservation of 1 is far below the worst case for either side,
        // so the split must steal from the deleted range.
        seed_delayed(&mut fork, &rig.counters, 0, 3000, 1);

        with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(1000));
            eng.del_extent_delay(&mut cur, FileBlock(1000), 1000)
        })
        .unwrap();

        let all = recs(&fork);
        assert_eq!(all.len(), 2);
        let left_res = all[0].reservation();
        let right_res = all[1].reservation();
        // Stealing kept both sides funded beyond the original single block.
        assert!(left_res > 0 && right_res > 0, "left={left_res} right={right_res}");
        assert!(left_res + right_res > 1);
        assert_eq!(rig.counters.delalloc_blocks(), fork.delayed_total());
    }

    #[test]
    fn del_delay_middle_never_steals_on_realtime() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, true);
        fork.format = ForkFormat::ExtentArray;
        let rec = ExtentRec::new_delayed(FileBlock(0), 3000, 1);
        fork.list.insert_at(fork.list.lookup(FileBlock(0)), rec);
        rig.counters.reserve(Pool::Realtime, 3000).unwrap();
        rig.counters.reserve(Pool::Data, 1).unwrap();
        rig.counters.delalloc_add(3000 + 1);

        let rt_free_before = rig.counters.free_blocks(Pool::Realtime);
        with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(1000));
            eng.del_extent_delay(&mut cur, FileBlock(1000), 1000)
        })
        .unwrap();

        let all = recs(&fork);
        assert_eq!(all.len(), 2);
        // No stealing across pools: the remainders split only the
        // original single-block reservation, leaving one side empty.
        assert_eq!(all[0].reservation() + all[1].reservation(), 1);
        // All deleted realtime data blocks returned to the rt pool.
        assert_eq!(
            rig.counters.free_blocks(Pool::Realtime),
            rt_free_before + 1000
        );
        assert_eq!(rig.counters.delalloc_blocks(), fork.delayed_total());
    }

    #[test]
    fn del_delay_whole_extent_returns_everything() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        seed(&mut fork, &[]);
        let free_before = rig.counters.free_blocks(Pool::Data);
        seed_delayed(&mut fork, &rig.counters, 0, 50, 7);

        with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(0));
            eng.del_extent_delay(&mut cur, FileBlock(0), 50)
        })
        .unwrap();

        assert!(recs(&fork).is_empty());
        assert_eq!(rig.counters.free_blocks(Pool::Data), free_before);
        assert_eq!(rig.counters.delalloc_blocks(), fork.delayed_total());
    }

    // ── btree mirroring ─────────────────────────────────────────────────

    #[test]
    fn engine_mirrors_btree_format_forks() {
        let mut rig = rig();
        let mut fork = Fork::new(ForkKind::Data, false);
        let seeds: Vec<ExtentRec> =
            (0..12).map(|i| real(i * 10, 5000 + i * 100, 5)).collect();
        seed(&mut fork, &seeds);

        // Move the fork to btree format first.
        let mut txn = rig.mgr.begin(16).unwrap();
        {
            let mut src = TxnBlockSource {
                txn: &mut txn,
                meta_groups: &mut rig.groups,
            };
            crate::fork::extents_to_btree(&mut fork, &rig.cache, &mut src, &rig.fanout).unwrap();
        }
        txn.commit().unwrap();
        assert_eq!(fork.format(), ForkFormat::BTree);

        // Punch the middle of one record and fill a hole; the tree must
        // track the list exactly.
        with_engine(&mut rig, &mut fork, |eng| {
            let mut cur = eng.fork.list.lookup(FileBlock(61));
            eng.del_extent_real(&mut cur, FileBlock(61), 2, DelFlags::default())?;
            let mut cur = eng.fork.list.lookup(FileBlock(7));
            eng.add_extent_hole_real(&mut cur, real(7, 40_000, 2))
        })
        .unwrap();

        let mut mirrored = Vec::new();
        btree::walk(&rig.cache, fork.broot.as_ref().unwrap(), &mut |rec| {
            mirrored.push(*rec);
            Ok(())
        })
        .unwrap();
        let in_core: Vec<ExtentRec> =
            fork.extents().iter().filter(|r| r.is_real()).copied().collect();
        assert_eq!(mirrored, in_core);
        assert_eq!(fork.nextents(), in_core.len() as u64);
    }
}
