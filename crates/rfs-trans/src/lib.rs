#![forbid(unsafe_code)]
//! Transactions, global space counters, and the deferred-intent queue.
//!
//! The mapping engine mutates forks only inside an active [`Transaction`].
//! Counter changes accumulate as append-only deltas on the transaction and
//! hit the filesystem-wide [`FsCounters`] atomically at commit; abort
//! discards everything, including queued intents. `roll` publishes the
//! deltas accumulated so far and re-arms the metadata-block reservation
//! while keeping pending intents and the low-space flag, so multi-step
//! remapping operations can continue across transaction boundaries.
//!
//! Deferred intents ([`Intent`]) record reverse-map / free-space work that
//! must land durably together with the structural change that queued them.
//! Commit drains them in queue order for the collaborator that applies
//! them; crash consistency is that collaborator's contract.

use parking_lot::Mutex;
use rfs_error::{Result, RfsError};
use rfs_types::{DiskBlock, FileBlock, ForkKind, Pool, TxnId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

// ── Log flags ───────────────────────────────────────────────────────────────

/// Which parts of the fork metadata a structural change touched.
///
/// Accumulated on the transaction so commit knows what to journal.
pub const LOG_CORE: u32 = 1 << 0;
/// The in-fork extent array (or inline payload) changed.
pub const LOG_EXT: u32 = 1 << 1;
/// The btree root in the fork inline area changed.
pub const LOG_BROOT: u32 = 1 << 2;

// ── Intents ─────────────────────────────────────────────────────────────────

/// A deferred operation queued by a structural change.
///
/// Either the intent and all of its downstream effects land durably
/// together, or none do — even across a crash. Intents survive
/// transaction rolls and are only discarded by abort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intent {
    /// Record a reverse mapping for a newly mapped extent.
    MapExtent {
        owner: u64,
        fork: ForkKind,
        offset: FileBlock,
        block: DiskBlock,
        len: u64,
    },
    /// Remove the reverse mapping for an unmapped extent.
    UnmapExtent {
        owner: u64,
        fork: ForkKind,
        offset: FileBlock,
        block: DiskBlock,
        len: u64,
    },
    /// Return physical space to the free pool after the unmap commits.
    FreeExtent {
        block: DiskBlock,
        len: u64,
        pool: Pool,
    },
}

// ── Global counters ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct CounterState {
    free_data: u64,
    free_rt: u64,
    /// Blocks reserved for delayed allocations but not yet allocated.
    delalloc: u64,
}

/// Filesystem-wide free-block and delayed-allocation counters.
///
/// Fail-closed: no operation may drive a counter negative. Underflow of
/// the delalloc counter is a corruption report, never a clamp — a clamp
/// would hide an accounting bug until ENOSPC lies to a caller.
#[derive(Debug)]
pub struct FsCounters {
    state: Mutex<CounterState>,
}

impl FsCounters {
    #[must_use]
    pub fn new(free_data: u64, free_rt: u64) -> Self {
        Self {
            state: Mutex::new(CounterState {
                free_data,
                free_rt,
                delalloc: 0,
            }),
        }
    }

    /// Take `n` blocks out of a pool's free counter. `ENOSPC` when the
    /// pool cannot cover the request.
    pub fn reserve(&self, pool: Pool, n: u64) -> Result<()> {
        let mut state = self.state.lock();
        let free = match pool {
            Pool::Data => &mut state.free_data,
            Pool::Realtime => &mut state.free_rt,
        };
        if *free < n {
            return Err(RfsError::NoSpace);
        }
        *free -= n;
        Ok(())
    }

    /// Return `n` blocks to a pool's free counter.
    pub fn unreserve(&self, pool: Pool, n: u64) {
        let mut state = self.state.lock();
        match pool {
            Pool::Data => state.free_data += n,
            Pool::Realtime => state.free_rt += n,
        }
    }

    /// Track `n` newly reserved delayed-allocation blocks.
    pub fn delalloc_add(&self, n: u64) {
        self.state.lock().delalloc += n;
    }

    /// Release `n` delayed-allocation blocks from the outstanding total.
    pub fn delalloc_sub(&self, n: u64) -> Result<()> {
        let mut state = self.state.lock();
        let Some(rest) = state.delalloc.checked_sub(n) else {
            return Err(RfsError::corrupt(
                0,
                format!(
                    "delalloc counter underflow: outstanding={} release={n}",
                    state.delalloc
                ),
            ));
        };
        state.delalloc = rest;
        Ok(())
    }

    /// Apply a signed delta to a pool's free counter (commit path).
    fn apply_delta(&self, pool: Pool, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        let mut state = self.state.lock();
        let free = match pool {
            Pool::Data => &mut state.free_data,
            Pool::Realtime => &mut state.free_rt,
        };
        if delta >= 0 {
            *free += u64::try_from(delta).expect("non-negative delta");
        } else {
            let sub = u64::try_from(-delta).expect("negative delta");
            let Some(rest) = free.checked_sub(sub) else {
                return Err(RfsError::corrupt(
                    0,
                    format!("free-block counter underflow: free={free} delta={delta}"),
                ));
            };
            *free = rest;
        }
        Ok(())
    }

    #[must_use]
    pub fn free_blocks(&self, pool: Pool) -> u64 {
        let state = self.state.lock();
        match pool {
            Pool::Data => state.free_data,
            Pool::Realtime => state.free_rt,
        }
    }

    #[must_use]
    pub fn delalloc_blocks(&self) -> u64 {
        self.state.lock().delalloc
    }
}

// ── Transaction ─────────────────────────────────────────────────────────────

/// Hands out transactions against one set of filesystem counters.
#[derive(Debug)]
pub struct TxnManager {
    counters: Arc<FsCounters>,
    next_id: AtomicU64,
}

impl TxnManager {
    #[must_use]
    pub fn new(counters: Arc<FsCounters>) -> Self {
        Self {
            counters,
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn counters(&self) -> &Arc<FsCounters> {
        &self.counters
    }

    /// Start a transaction holding `block_reservation` metadata blocks.
    ///
    /// The reservation is taken from the data pool up front; whatever the
    /// transaction does not consume is returned at commit or abort.
    pub fn begin(&self, block_reservation: u64) -> Result<Transaction> {
        self.counters.reserve(Pool::Data, block_reservation)?;
        let id = TxnId(self.next_id.fetch_add(1, Ordering::Relaxed));
        trace!(txn = id.0, reservation = block_reservation, "txn_begin");
        Ok(Transaction {
            id,
            counters: Arc::clone(&self.counters),
            block_reservation,
            blocks_consumed: 0,
            data_delta: 0,
            rt_delta: 0,
            low_space: false,
            log_flags: 0,
            intents: Vec::new(),
            state: TxnState::Open,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Open,
    Finished,
}

/// One active transaction for one file's mapping operation.
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    counters: Arc<FsCounters>,
    block_reservation: u64,
    blocks_consumed: u64,
    data_delta: i64,
    rt_delta: i64,
    low_space: bool,
    log_flags: u32,
    intents: Vec<Intent>,
    state: TxnState,
}

impl Transaction {
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    #[must_use]
    pub fn counters(&self) -> &Arc<FsCounters> {
        &self.counters
    }

    /// Consume one reserved metadata block (btree expansion). `false`
    /// when the reservation is exhausted — the caller must roll.
    pub fn try_consume_reserved(&mut self) -> bool {
        if self.blocks_consumed < self.block_reservation {
            self.blocks_consumed += 1;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn reserved_remaining(&self) -> u64 {
        self.block_reservation - self.blocks_consumed
    }

    /// The reservation this transaction (or its latest roll) started with.
    #[must_use]
    pub fn reservation(&self) -> u64 {
        self.block_reservation
    }

    /// Record a signed free-block delta to apply at commit.
    pub fn add_block_delta(&mut self, pool: Pool, delta: i64) {
        match pool {
            Pool::Data => self.data_delta += delta,
            Pool::Realtime => self.rt_delta += delta,
        }
    }

    /// Accumulate structural-change log flags.
    pub fn log_structural_change(&mut self, flags: u32) {
        self.log_flags |= flags;
    }

    #[must_use]
    pub fn log_flags(&self) -> u32 {
        self.log_flags
    }

    /// Mark that a degraded (filesystem-wide minimum-length) allocation
    /// was used; optimistic placement is skipped for the rest of this
    /// transaction, including across rolls.
    pub fn set_low_space(&mut self) {
        if !self.low_space {
            warn!(txn = self.id.0, "transaction entered low-space mode");
        }
        self.low_space = true;
    }

    #[must_use]
    pub fn is_low_space(&self) -> bool {
        self.low_space
    }

    /// Queue a deferred intent. Intents survive rolls and drain at commit.
    pub fn defer(&mut self, intent: Intent) {
        trace!(txn = self.id.0, ?intent, "defer_enqueue");
        self.intents.push(intent);
    }

    #[must_use]
    pub fn pending_intents(&self) -> &[Intent] {
        &self.intents
    }

    /// Publish accumulated counter deltas and re-arm the metadata-block
    /// reservation, keeping pending intents and the low-space flag.
    pub fn roll(&mut self, new_reservation: u64) -> Result<()> {
        debug_assert_eq!(self.state, TxnState::Open);
        self.publish_deltas()?;
        // Return what is left of the old reservation, then take the new one.
        self.counters
            .unreserve(Pool::Data, self.reserved_remaining());
        self.counters.reserve(Pool::Data, new_reservation)?;
        debug!(
            txn = self.id.0,
            new_reservation,
            pending_intents = self.intents.len(),
            "txn_roll"
        );
        self.block_reservation = new_reservation;
        self.blocks_consumed = 0;
        Ok(())
    }

    /// Commit: publish deltas, return the unused reservation, and drain
    /// the intent queue in order for the deferred-operation collaborator.
    pub fn commit(mut self) -> Result<Vec<Intent>> {
        debug_assert_eq!(self.state, TxnState::Open);
        self.publish_deltas()?;
        self.counters
            .unreserve(Pool::Data, self.reserved_remaining());
        self.blocks_consumed = self.block_reservation;
        self.state = TxnState::Finished;
        let intents = std::mem::take(&mut self.intents);
        debug!(
            txn = self.id.0,
            log_flags = self.log_flags,
            intents = intents.len(),
            "txn_commit"
        );
        Ok(intents)
    }

    /// Abort: discard all deltas and intents, return the full reservation.
    pub fn abort(mut self) {
        debug_assert_eq!(self.state, TxnState::Open);
        self.counters
            .unreserve(Pool::Data, self.reserved_remaining());
        self.blocks_consumed = self.block_reservation;
        self.intents.clear();
        self.data_delta = 0;
        self.rt_delta = 0;
        self.state = TxnState::Finished;
        debug!(txn = self.id.0, "txn_abort");
    }

    fn publish_deltas(&mut self) -> Result<()> {
        self.counters.apply_delta(Pool::Data, self.data_delta)?;
        self.counters.apply_delta(Pool::Realtime, self.rt_delta)?;
        self.data_delta = 0;
        self.rt_delta = 0;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
