//! Extent records: the atomic unit of the block map.

use rfs_error::{Result, RfsError};
use rfs_types::{put_le_u64, read_le_u64, DiskBlock, FileBlock};
use serde::{Deserialize, Serialize};

/// Longest single extent record, dictated by the 21-bit on-disk length
/// field. Merges that would exceed this stay un-merged.
pub const MAX_EXTENT_LEN: u64 = (1 << 21) - 1;

/// Encoded size of one on-disk extent record.
pub const REC_SIZE: usize = 24;

/// Physical side of an extent record.
///
/// `Delayed` and `Hole` never reach disk — only `Real` records are
/// written to btree leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhysBlock {
    /// Unmapped.
    Hole,
    /// Space reserved but not yet allocated; `reserved` is the
    /// indirect-block reservation held for this extent.
    Delayed { reserved: u64 },
    /// Allocated at a concrete device block.
    Real(DiskBlock),
}

impl PhysBlock {
    #[must_use]
    pub fn is_real(self) -> bool {
        matches!(self, Self::Real(_))
    }

    #[must_use]
    pub fn is_delayed(self) -> bool {
        matches!(self, Self::Delayed { .. })
    }
}

/// Written state of an allocated extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtState {
    Normal,
    /// Allocated but never written; reads return zeros.
    Unwritten,
}

/// One extent record: `len` logical blocks starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentRec {
    pub offset: FileBlock,
    pub phys: PhysBlock,
    pub len: u64,
    pub state: ExtState,
}

impl ExtentRec {
    #[must_use]
    pub fn new_real(offset: FileBlock, block: DiskBlock, len: u64, state: ExtState) -> Self {
        Self {
            offset,
            phys: PhysBlock::Real(block),
            len,
            state,
        }
    }

    #[must_use]
    pub fn new_delayed(offset: FileBlock, len: u64, reserved: u64) -> Self {
        Self {
            offset,
            phys: PhysBlock::Delayed { reserved },
            len,
            state: ExtState::Normal,
        }
    }

    #[must_use]
    pub fn new_hole(offset: FileBlock, len: u64) -> Self {
        Self {
            offset,
            phys: PhysBlock::Hole,
            len,
            state: ExtState::Normal,
        }
    }

    /// First logical block past this extent.
    #[must_use]
    pub fn end(&self) -> FileBlock {
        FileBlock(self.offset.0 + self.len)
    }

    #[must_use]
    pub fn is_delayed(&self) -> bool {
        self.phys.is_delayed()
    }

    #[must_use]
    pub fn is_real(&self) -> bool {
        self.phys.is_real()
    }

    #[must_use]
    pub fn real_block(&self) -> Option<DiskBlock> {
        match self.phys {
            PhysBlock::Real(block) => Some(block),
            PhysBlock::Hole | PhysBlock::Delayed { .. } => None,
        }
    }

    /// Indirect-block reservation carried by a delayed extent, 0 otherwise.
    #[must_use]
    pub fn reservation(&self) -> u64 {
        match self.phys {
            PhysBlock::Delayed { reserved } => reserved,
            PhysBlock::Hole | PhysBlock::Real(_) => 0,
        }
    }

    /// Contained device block for `offset` inside this extent.
    #[must_use]
    pub fn block_at(&self, offset: FileBlock) -> Option<DiskBlock> {
        let block = self.real_block()?;
        (self.offset <= offset && offset < self.end())
            .then(|| DiskBlock(block.0 + (offset.0 - self.offset.0)))
    }

    /// Encode for a btree leaf. Only real extents have an on-disk form.
    pub fn encode(&self, out: &mut [u8]) -> Result<()> {
        debug_assert_eq!(out.len(), REC_SIZE);
        let Some(block) = self.real_block() else {
            return Err(RfsError::corrupt(
                0,
                "encoding a hole or delayed extent to disk",
            ));
        };
        if self.len == 0 || self.len > MAX_EXTENT_LEN {
            return Err(RfsError::corrupt(
                block.0,
                format!("extent length {} out of range", self.len),
            ));
        }
        put_le_u64(out, 0, self.offset.0);
        put_le_u64(out, 8, block.0);
        let state_bit = u64::from(self.state == ExtState::Unwritten) << 63;
        put_le_u64(out, 16, self.len | state_bit);
        Ok(())
    }

    /// Decode a btree leaf record.
    pub fn decode(data: &[u8], at_block: u64) -> Result<Self> {
        let map_err = |_| RfsError::corrupt(at_block, "truncated extent record");
        let offset = read_le_u64(data, 0).map_err(map_err)?;
        let block = read_le_u64(data, 8).map_err(map_err)?;
        let len_word = read_le_u64(data, 16).map_err(map_err)?;
        let len = len_word & !(1 << 63);
        let state = if len_word >> 63 == 1 {
            ExtState::Unwritten
        } else {
            ExtState::Normal
        };
        if len == 0 || len > MAX_EXTENT_LEN {
            return Err(RfsError::corrupt(
                at_block,
                format!("extent length {len} out of range"),
            ));
        }
        Ok(Self::new_real(FileBlock(offset), DiskBlock(block), len, state))
    }
}

/// Whether two real extents may merge into one record.
///
/// Requires logical adjacency, physical contiguity, equal state, the
/// combined length within [`MAX_EXTENT_LEN`], and — on realtime forks —
/// both halves in the same realtime allocation group (`rt_ag_blocks`).
#[must_use]
pub fn can_merge(left: &ExtentRec, right: &ExtentRec, rt_ag_blocks: Option<u64>) -> bool {
    let (Some(left_block), Some(right_block)) = (left.real_block(), right.real_block()) else {
        return false;
    };
    if left.end() != right.offset {
        return false;
    }
    if left_block.0 + left.len != right_block.0 {
        return false;
    }
    if left.state != right.state {
        return false;
    }
    if left.len + right.len > MAX_EXTENT_LEN {
        return false;
    }
    if let Some(ag_blocks) = rt_ag_blocks {
        if left_block.0 / ag_blocks != right_block.0 / ag_blocks {
            return false;
        }
    }
    true
}

/// Whether two delayed extents may merge (offset adjacency and length
/// cap only — there is no physical side yet).
#[must_use]
pub fn can_merge_delayed(left: &ExtentRec, right: &ExtentRec) -> bool {
    left.is_delayed()
        && right.is_delayed()
        && left.end() == right.offset
        && left.len + right.len <= MAX_EXTENT_LEN
}
