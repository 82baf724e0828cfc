#![forbid(unsafe_code)]
//! Extent mapping engine.
//!
//! Translates a file fork's logical byte ranges into physical storage
//! extents and keeps the on-disk representation (inline literal area,
//! flat extent array, or btree) synchronized with allocation and
//! crash-recovery machinery.
//!
//! The public surface is [`map_read`] (pure lookup), and the
//! transaction-bound operations on [`Bmap`]: [`Bmap::map_write`],
//! [`Bmap::unmap`], and [`Bmap::convert_format`]. All mutation happens
//! synchronously inside the caller's transaction, under the file's
//! exclusive structural lock, and either commits as a unit or is
//! discarded by abort.
//!
//! Operations that cannot finish inside one transaction reservation
//! return a [`ResumeToken`] instead of an error: the caller rolls the
//! transaction and re-enters. The internal `Again` signal never escapes
//! this crate.

mod btree;
mod delalloc;
mod fork;
mod iext;
mod merge;
mod record;

pub use btree::{BmapRoot, BtreeFanout, ROOT_MAX_ENTRIES};
pub use delalloc::{split_indlen, worst_indlen};
pub use fork::{Fork, ForkFormat, IFORK_MAXEXT, MAX_EXTENT_COUNT};
pub use iext::{ExtentList, IextCursor};
pub use record::{can_merge, ExtState, ExtentRec, PhysBlock, MAX_EXTENT_LEN};

use merge::{DelFlags, Engine, TxnBlockSource};
use rfs_alloc::{alloc_vextent, AllocArgs, AllocGroups};
use rfs_block::{BlockDevice, BufCache};
use rfs_error::{Result, RfsError};
use rfs_trans::{FsCounters, Intent, Transaction};
use rfs_types::{BlockSize, DiskBlock, FileBlock, Pool};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

// ── Operation arguments and results ─────────────────────────────────────────

/// Behavior switches for [`Bmap::map_write`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteFlags {
    /// Reserve space over holes instead of allocating (delayed
    /// allocation). Existing delayed records are left delayed.
    pub delalloc: bool,
    /// Allocate holes as unwritten extents (preallocation).
    pub prealloc: bool,
    /// Convert unwritten extents in the range to normal state.
    pub convert: bool,
    /// Do not queue reverse-mapping intents for this operation.
    pub no_rmap: bool,
}

/// Behavior switches for [`Bmap::unmap`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UnmapFlags {
    /// The caller is moving the blocks elsewhere: skip the deferred
    /// frees (reverse-map intents are still queued).
    pub remap: bool,
    /// Do not queue reverse-mapping intents for this operation.
    pub no_rmap: bool,
}

/// Where to pick up an operation that exhausted its transaction
/// reservation. Hand the token back to the same operation after a
/// `Transaction::roll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken {
    pub offset: FileBlock,
    pub remaining: u64,
}

/// Result of one `map_write` call.
#[derive(Debug, Clone)]
pub struct WriteResult {
    /// Mappings covering the satisfied prefix, in logical order, at most
    /// the caller's capacity.
    pub mappings: Vec<ExtentRec>,
    /// Blocks of the request actually satisfied, from the start.
    pub completed: u64,
    /// Present when the request did not finish (capacity or reservation
    /// exhausted); roll the transaction and re-enter with the token.
    pub resume: Option<ResumeToken>,
}

/// Result of one `unmap` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnmapResult {
    /// Length (from the start of the requested range) still mapped.
    /// Zero means the whole range is unmapped.
    pub remaining: u64,
}

/// Metadata blocks one mutation step may need in the worst case: a
/// split at every tree level, root growth, and a format conversion.
/// Transactions driving `map_write`/`unmap` must reserve at least this.
#[must_use]
pub fn step_reservation(fanout: &BtreeFanout) -> u64 {
    u64::from(fanout.max_levels) + 2
}

// ── Read path ───────────────────────────────────────────────────────────────

/// Map a logical range for reading. Never allocates, never blocks on
/// space; holes come back as explicit [`PhysBlock::Hole`] records. A
/// range with no stored extents yields exactly one hole spanning it.
pub fn map_read(
    fork: &Fork,
    offset: FileBlock,
    len: u64,
    max_mappings: usize,
) -> Result<Vec<ExtentRec>> {
    if len == 0 || max_mappings == 0 {
        return Ok(Vec::new());
    }
    if fork.format() == ForkFormat::Inline && !fork.inline_payload().is_empty() {
        return Err(RfsError::InvalidGeometry(
            "cannot map an inline fork with a literal payload".to_owned(),
        ));
    }

    let end = FileBlock(offset.0 + len);
    let mut out = Vec::new();
    let mut pos = offset;
    let mut cur = fork.extents().lookup(pos);

    while pos < end && out.len() < max_mappings {
        match fork.extents().get(cur) {
            Some(rec) if rec.offset <= pos => {
                out.push(clamp_rec(rec, pos, end));
                pos = rec.end().min(end);
                fork.extents().next(&mut cur);
            }
            Some(rec) => {
                // Hole up to the next record.
                let hole_end = rec.offset.min(end);
                out.push(ExtentRec::new_hole(pos, hole_end.0 - pos.0));
                pos = hole_end;
            }
            None => {
                out.push(ExtentRec::new_hole(pos, end.0 - pos.0));
                pos = end;
            }
        }
    }
    Ok(out)
}

/// The portion of `rec` overlapping `[from, to)`.
fn clamp_rec(rec: &ExtentRec, from: FileBlock, to: FileBlock) -> ExtentRec {
    debug_assert!(rec.offset <= from && from < rec.end());
    let skip = from.0 - rec.offset.0;
    let len = (rec.end().min(to)).0 - from.0;
    let phys = match rec.phys {
        PhysBlock::Real(block) => PhysBlock::Real(DiskBlock(block.0 + skip)),
        other => other,
    };
    ExtentRec {
        offset: from,
        phys,
        len,
        state: rec.state,
    }
}

// ── Mutation context ────────────────────────────────────────────────────────

/// One mapping operation's context: the fork (held under its structural
/// lock), the active transaction, and the space collaborators.
pub struct Bmap<'a, D: BlockDevice> {
    fork: &'a mut Fork,
    txn: &'a mut Transaction,
    cache: &'a BufCache<D>,
    groups: &'a mut AllocGroups,
    rt_groups: Option<&'a mut AllocGroups>,
    fanout: BtreeFanout,
    owner: u64,
}

impl<'a, D: BlockDevice> Bmap<'a, D> {
    pub fn new(
        fork: &'a mut Fork,
        txn: &'a mut Transaction,
        cache: &'a BufCache<D>,
        groups: &'a mut AllocGroups,
        rt_groups: Option<&'a mut AllocGroups>,
        owner: u64,
    ) -> Result<Self> {
        if groups.geometry().pool != Pool::Data {
            return Err(RfsError::InvalidGeometry(
                "main allocation groups must be the data pool".to_owned(),
            ));
        }
        if let Some(rt) = &rt_groups {
            if rt.geometry().pool != Pool::Realtime {
                return Err(RfsError::InvalidGeometry(
                    "realtime allocation groups must be the realtime pool".to_owned(),
                ));
            }
        }
        if fork.is_realtime() && rt_groups.is_none() {
            return Err(RfsError::InvalidGeometry(
                "realtime fork requires the realtime pool".to_owned(),
            ));
        }
        let block_size = BlockSize::new(cache.block_size())
            .map_err(|err| RfsError::InvalidGeometry(err.to_string()))?;
        let fanout = BtreeFanout::for_block_size(block_size.get());
        Ok(Self {
            fork,
            txn,
            cache,
            groups,
            rt_groups,
            fanout,
            owner,
        })
    }

    #[must_use]
    pub fn fanout(&self) -> &BtreeFanout {
        &self.fanout
    }

    fn rt_ag_blocks(&self) -> Option<u64> {
        self.rt_groups
            .as_deref()
            .map(|g| u64::from(g.geometry().ag_blocks))
    }

    /// Whether the transaction can still cover one worst-case step.
    fn txn_can_step(&self) -> bool {
        self.txn.reserved_remaining() >= step_reservation(&self.fanout)
    }

    /// Run one engine step, then re-check format thresholds. All stray
    /// `Again` signals are promoted to corruption here: the step
    /// prechecks reservations, so an underrun mid-step is a bug.
    fn run_engine<R>(
        &mut self,
        skip_rmap: bool,
        f: impl FnOnce(&mut Engine<'_, '_, D>) -> Result<R>,
    ) -> Result<R> {
        let counters = Arc::clone(self.txn.counters());
        let rt_ag_blocks = self.rt_ag_blocks();
        let out = {
            let mut src = TxnBlockSource {
                txn: &mut *self.txn,
                meta_groups: &mut *self.groups,
            };
            let mut engine = Engine {
                fork: &mut *self.fork,
                cache: self.cache,
                src: &mut src,
                fanout: &self.fanout,
                counters: &counters,
                rt_ag_blocks,
                owner: self.owner,
                skip_rmap,
            };
            f(&mut engine)?
        };

        let conv_flags = {
            let mut src = TxnBlockSource {
                txn: &mut *self.txn,
                meta_groups: &mut *self.groups,
            };
            fork::maybe_convert(self.fork, self.cache, &mut src, &self.fanout)?
        };
        self.txn.log_structural_change(conv_flags);
        debug_assert!(self.fork.validate().is_ok());
        Ok(out)
    }

    /// Fail a transaction whose reservation could never cover one step —
    /// rolling to the same size would loop forever.
    fn check_resumable(&self) -> Result<()> {
        if self.txn.reservation() < step_reservation(&self.fanout) {
            return Err(RfsError::InvalidGeometry(format!(
                "transaction reservation {} below step requirement {}",
                self.txn.reservation(),
                step_reservation(&self.fanout)
            )));
        }
        Ok(())
    }

    // ── Write path ──────────────────────────────────────────────────────

    /// Map `[offset, offset + len)` for writing.
    ///
    /// Depending on `flags`, holes are reserved (delalloc), allocated
    /// normal, or allocated unwritten; delayed records are converted to
    /// real; unwritten records are converted to normal. `size_hint` is
    /// the preferred physical alignment (extent-size/stripe hint).
    ///
    /// Returns as many mappings as fit in `max_mappings` and how much of
    /// the request was satisfied; a [`ResumeToken`] is included whenever
    /// the request did not complete.
    pub fn map_write(
        &mut self,
        offset: FileBlock,
        len: u64,
        size_hint: u64,
        flags: WriteFlags,
        max_mappings: usize,
    ) -> Result<WriteResult> {
        if len == 0 {
            return Err(RfsError::InvalidGeometry("zero-length write mapping".to_owned()));
        }
        if max_mappings == 0 {
            return Err(RfsError::InvalidGeometry("zero mapping capacity".to_owned()));
        }
        self.check_resumable()?;
        // Every step adds at most two records (a middle split); refuse
        // work that could overflow the on-disk extent-count field.
        if self.fork.nextents() >= MAX_EXTENT_COUNT - 2 {
            return Err(RfsError::FileTooBig);
        }

        // Inline forks convert before any extent work.
        if self.fork.format() == ForkFormat::Inline {
            let flags_local = fork::local_to_extents(
                self.fork,
                self.cache,
                self.groups,
                self.txn,
                self.owner,
            )?;
            self.txn.log_structural_change(flags_local);
        }

        let end = FileBlock(offset.0 + len);
        let mut pos = offset;
        let mut mappings: Vec<ExtentRec> = Vec::new();

        while pos < end && mappings.len() < max_mappings {
            let found = self.fork.extents().lookup_extent(pos);
            match found {
                // Inside an existing record.
                Some((cur, got)) if got.offset <= pos => {
                    if got.is_delayed() && !flags.delalloc {
                        if !self.txn_can_step() {
                            break;
                        }
                        let converted = self.convert_delayed(cur, pos, end, size_hint, flags)?;
                        mappings.push(converted);
                        pos = converted.end();
                    } else if got.is_real() && got.state == ExtState::Unwritten && flags.convert {
                        if !self.txn_can_step() {
                            break;
                        }
                        let converted = self.convert_unwritten(cur, &got, pos, end, flags)?;
                        mappings.push(converted);
                        pos = converted.end();
                    } else {
                        // Already mapped (or already reserved): report it.
                        mappings.push(clamp_rec(&got, pos, end));
                        pos = got.end().min(end);
                    }
                }
                // In a hole (bounded by the next record or the request).
                other => {
                    let hole_end = match other {
                        Some((_, next)) => next.offset.min(end),
                        None => end,
                    };
                    let hole_len = hole_end.0 - pos.0;
                    if flags.delalloc {
                        let reserved = self.reserve_over_hole(pos, hole_len, flags)?;
                        pos = reserved.end();
                        mappings.push(reserved);
                    } else {
                        if !self.txn_can_step() {
                            break;
                        }
                        let mapped = self.allocate_over_hole(pos, hole_len, size_hint, flags)?;
                        mappings.push(mapped);
                        pos = mapped.end();
                    }
                }
            }
        }

        let completed = pos.0 - offset.0;
        let resume = (pos < end).then_some(ResumeToken {
            offset: pos,
            remaining: end.0 - pos.0,
        });
        debug!(
            owner = self.owner,
            offset = offset.0,
            len,
            completed,
            resumed = resume.is_some(),
            "map_write"
        );
        Ok(WriteResult {
            mappings,
            completed,
            resume,
        })
    }

    /// Reserve delayed space over a hole and report the resulting
    /// (possibly merged) delayed mapping portion.
    fn reserve_over_hole(
        &mut self,
        pos: FileBlock,
        hole_len: u64,
        flags: WriteFlags,
    ) -> Result<ExtentRec> {
        let chunk = hole_len.min(MAX_EXTENT_LEN);
        self.run_engine(flags.no_rmap, |engine| {
            let mut cur = engine.fork.list.lookup(pos);
            engine.add_extent_hole_delay(&mut cur, pos, chunk)
        })
        .map_err(promote_again)?;
        let (_, rec) = self
            .fork
            .extents()
            .lookup_extent(pos)
            .ok_or_else(|| RfsError::corrupt(0, "reserved extent vanished"))?;
        Ok(clamp_rec(&rec, pos, FileBlock(pos.0 + chunk)))
    }

    /// Allocate real blocks over a hole (normal or unwritten).
    fn allocate_over_hole(
        &mut self,
        pos: FileBlock,
        hole_len: u64,
        size_hint: u64,
        flags: WriteFlags,
    ) -> Result<ExtentRec> {
        let want = hole_len.min(MAX_EXTENT_LEN);
        let (target, eof_contiguous) = self.placement_target(pos);
        let result = {
            let txn = &mut *self.txn;
            let groups = if self.fork.is_realtime() {
                self.rt_groups.as_deref_mut().expect("checked in constructor")
            } else {
                &mut *self.groups
            };
            alloc_vextent(
                groups,
                txn,
                &AllocArgs {
                    target,
                    min_len: 1,
                    max_len: want,
                    alignment: size_hint,
                    eof_contiguous,
                },
            )?
        };

        let state = if flags.prealloc {
            ExtState::Unwritten
        } else {
            ExtState::Normal
        };
        let new = ExtentRec::new_real(pos, result.block, result.len, state);
        let log_flags = self
            .run_engine(flags.no_rmap, |engine| {
                let mut cur = engine.fork.list.lookup(pos);
                engine.add_extent_hole_real(&mut cur, new)
            })
            .map_err(promote_again)?;
        self.txn.log_structural_change(log_flags);
        Ok(new)
    }

    /// Convert (a prefix of) the delayed record containing `pos`.
    fn convert_delayed(
        &mut self,
        cur: IextCursor,
        pos: FileBlock,
        end: FileBlock,
        size_hint: u64,
        flags: WriteFlags,
    ) -> Result<ExtentRec> {
        let got = *self
            .fork
            .extents()
            .get(cur)
            .ok_or_else(|| RfsError::corrupt(0, "delayed record vanished"))?;
        let conv_end = got.end().min(end);
        let want = (conv_end.0 - pos.0).min(MAX_EXTENT_LEN);
        let (target, eof_contiguous) = self.placement_target(pos);

        let result = {
            let txn = &mut *self.txn;
            let groups = if self.fork.is_realtime() {
                self.rt_groups.as_deref_mut().expect("checked in constructor")
            } else {
                &mut *self.groups
            };
            alloc_vextent(
                groups,
                txn,
                &AllocArgs {
                    target,
                    min_len: 1,
                    max_len: want,
                    alignment: size_hint,
                    eof_contiguous,
                },
            )?
        };

        let state = if flags.prealloc {
            ExtState::Unwritten
        } else {
            ExtState::Normal
        };
        let new = ExtentRec::new_real(pos, result.block, result.len, state);
        let log_flags = self
            .run_engine(flags.no_rmap, |engine| {
                let mut cur = cur;
                engine.add_extent_delay_real(&mut cur, new)
            })
            .map_err(promote_again)?;
        self.txn.log_structural_change(log_flags);
        Ok(new)
    }

    /// Convert (a prefix of) the unwritten record containing `pos` to
    /// normal state.
    fn convert_unwritten(
        &mut self,
        cur: IextCursor,
        got: &ExtentRec,
        pos: FileBlock,
        end: FileBlock,
        flags: WriteFlags,
    ) -> Result<ExtentRec> {
        let conv_end = got.end().min(end);
        let block = got
            .real_block()
            .ok_or_else(|| RfsError::corrupt(0, "unwritten record without blocks"))?;
        let new = ExtentRec::new_real(
            pos,
            DiskBlock(block.0 + (pos.0 - got.offset.0)),
            conv_end.0 - pos.0,
            ExtState::Normal,
        );
        let log_flags = self
            .run_engine(flags.no_rmap, |engine| {
                let mut cur = cur;
                engine.add_extent_unwritten_real(&mut cur, new)
            })
            .map_err(promote_again)?;
        self.txn.log_structural_change(log_flags);
        Ok(new)
    }

    /// Placement hint: immediately after the previous record when the
    /// write lands at the end of its neighbor (file-extension pattern).
    fn placement_target(&self, pos: FileBlock) -> (DiskBlock, bool) {
        let cur = self.fork.extents().lookup(pos);
        if let Some(prev) = self.fork.extents().peek_prev(cur) {
            if let Some(block) = prev.real_block() {
                let target = DiskBlock(block.0 + prev.len);
                return (target, prev.end() == pos);
            }
        }
        (DiskBlock(0), false)
    }

    // ── Unmap path ──────────────────────────────────────────────────────

    /// Remove mappings in `[offset, offset + len)`, processing at most
    /// `max_extents` records (from the end of the range downward) so
    /// callers can interleave transaction rolls for very large ranges.
    pub fn unmap(
        &mut self,
        offset: FileBlock,
        len: u64,
        max_extents: usize,
        flags: UnmapFlags,
    ) -> Result<UnmapResult> {
        if len == 0 {
            return Ok(UnmapResult { remaining: 0 });
        }
        self.check_resumable()?;
        // A punch through the middle of a record adds one record.
        if self.fork.nextents() >= MAX_EXTENT_COUNT - 1 {
            return Err(RfsError::FileTooBig);
        }
        if self.fork.format() == ForkFormat::Inline {
            if self.fork.inline_payload().is_empty() {
                return Ok(UnmapResult { remaining: 0 });
            }
            return Err(RfsError::InvalidGeometry(
                "cannot unmap an inline fork with a literal payload".to_owned(),
            ));
        }

        let mut range_end = FileBlock(offset.0 + len);
        let mut extents_done = 0_usize;

        while range_end > offset {
            if extents_done >= max_extents || !self.txn_can_step() {
                break;
            }

            // Find the last record overlapping the remaining range.
            let probe = FileBlock(range_end.0 - 1);
            let mut cur = self.fork.extents().lookup(probe);
            let got = match self.fork.extents().get(cur) {
                Some(rec) if rec.offset <= probe => *rec,
                _ => {
                    // Cursor is past the range; the record before it (if
                    // any) is the last mapped one below the probe.
                    self.fork.extents().prev(&mut cur);
                    match self.fork.extents().get(cur) {
                        Some(rec) if rec.end() > offset && rec.offset <= probe => *rec,
                        _ => {
                            // No mappings left in the range.
                            range_end = offset;
                            break;
                        }
                    }
                }
            };

            if got.end() <= offset {
                range_end = offset;
                break;
            }

            let del_offset = got.offset.max(offset);
            let del_end = got.end().min(range_end);
            let del_len = del_end.0 - del_offset.0;

            if got.is_delayed() {
                self.run_engine(flags.no_rmap, |engine| {
                    let mut cur = cur;
                    engine.del_extent_delay(&mut cur, del_offset, del_len)
                })
                .map_err(promote_again)?;
            } else {
                let log_flags = self
                    .run_engine(flags.no_rmap, |engine| {
                        let mut cur = cur;
                        engine.del_extent_real(
                            &mut cur,
                            del_offset,
                            del_len,
                            DelFlags { remap: flags.remap },
                        )
                    })
                    .map_err(promote_again)?;
                self.txn.log_structural_change(log_flags);
            }

            extents_done += 1;
            range_end = del_offset;
        }

        let remaining = range_end.0.saturating_sub(offset.0);
        debug!(
            owner = self.owner,
            offset = offset.0,
            len,
            remaining,
            extents_done,
            "unmap"
        );
        Ok(UnmapResult { remaining })
    }

    // ── Explicit format control ─────────────────────────────────────────

    /// Force the fork toward a specific representation. Transitions move
    /// one step; requesting the current format is a no-op.
    pub fn convert_format(&mut self, target: ForkFormat) -> Result<()> {
        let current = self.fork.format();
        if current == target {
            return Ok(());
        }
        let flags = match (current, target) {
            (ForkFormat::Inline, ForkFormat::ExtentArray) => fork::local_to_extents(
                self.fork,
                self.cache,
                self.groups,
                self.txn,
                self.owner,
            )?,
            (ForkFormat::ExtentArray, ForkFormat::BTree) => {
                if self.txn.reserved_remaining() == 0 {
                    // The new root leaf needs one block of reservation.
                    return Err(RfsError::NoSpace);
                }
                let mut src = TxnBlockSource {
                    txn: &mut *self.txn,
                    meta_groups: &mut *self.groups,
                };
                fork::extents_to_btree(self.fork, self.cache, &mut src, &self.fanout)
                    .map_err(promote_again)?
            }
            (ForkFormat::BTree, ForkFormat::ExtentArray) => {
                let mut src = TxnBlockSource {
                    txn: &mut *self.txn,
                    meta_groups: &mut *self.groups,
                };
                fork::btree_to_extents(self.fork, self.cache, &mut src).map_err(promote_again)?
            }
            (ForkFormat::ExtentArray, ForkFormat::Inline) => {
                if !self.fork.extents().is_empty() {
                    return Err(RfsError::InvalidGeometry(
                        "cannot inline a fork that still holds extents".to_owned(),
                    ));
                }
                self.fork.format = ForkFormat::Inline;
                rfs_trans::LOG_CORE
            }
            (from, to) => {
                return Err(RfsError::InvalidGeometry(format!(
                    "unsupported format transition {from:?} -> {to:?}"
                )));
            }
        };
        self.txn.log_structural_change(flags);
        debug_assert!(self.fork.validate().is_ok());
        Ok(())
    }
}

/// `Again` must never escape the crate: the drivers precheck the
/// reservation before every step, so a mid-step underrun is corruption.
fn promote_again(err: RfsError) -> RfsError {
    match err {
        RfsError::Again => RfsError::corrupt(0, "transaction reservation underrun mid-step"),
        other => other,
    }
}

// ── Intent finishing ────────────────────────────────────────────────────────

/// Apply the space side of committed intents: deferred frees return
/// blocks to their pool. Reverse-map intents are returned to the caller
/// for the rmap collaborator.
pub fn finish_intents(
    groups: &mut AllocGroups,
    mut rt_groups: Option<&mut AllocGroups>,
    counters: &FsCounters,
    intents: Vec<Intent>,
) -> Result<Vec<Intent>> {
    let mut rmap = Vec::new();
    for intent in intents {
        match intent {
            Intent::FreeExtent { block, len, pool } => {
                let target = match pool {
                    Pool::Data => &mut *groups,
                    Pool::Realtime => rt_groups.as_deref_mut().ok_or_else(|| {
                        RfsError::InvalidGeometry(
                            "realtime free intent without a realtime pool".to_owned(),
                        )
                    })?,
                };
                target.free_extent(block, len)?;
                counters.unreserve(pool, len);
            }
            other => rmap.push(other),
        }
    }
    Ok(rmap)
}

// ── Tests ───────────────────────────────────────────────────────────────────
