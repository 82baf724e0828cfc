#![forbid(unsafe_code)]
//! Error types for rowanfs.
//!
//! # Error Taxonomy
//!
//! | Class | Variant | errno | Recoverable? |
//! |-------|---------|-------|--------------|
//! | Resource exhaustion | `NoSpace` | `ENOSPC` | yes — caller may retry smaller or fail the user op |
//! | Corruption | `Corruption` | `EUCLEAN` | no — the filesystem instance goes unhealthy/read-only |
//! | Continuation | `Again` | `EAGAIN` | internal only — consumed by the transaction-roll loop |
//! | Record capacity | `FileTooBig` | `EFBIG` | yes — the mapping cannot grow further |
//! | I/O | `Io` | `EIO` (or raw) | propagated unchanged from the buffer cache |
//!
//! `Again` MUST NOT escape a public entry point: the mapping layer converts
//! it into an explicit resume token before returning. The debug assertion
//! lives at that boundary, not here.
//!
//! ## Design Constraints
//!
//! - `rfs-error` depends on nothing above `libc`/`thiserror` (no cyclic deps).
//! - All string payloads are owned (`String`) so errors can cross thread and
//!   transaction boundaries freely.
//! - The errno mapping is exhaustive — adding a variant without an errno arm
//!   is a compile error.

use thiserror::Error;

/// Unified error type for all rowanfs operations.
#[derive(Debug, Error)]
pub enum RfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An on-disk or in-core structural invariant is violated.
    ///
    /// Carries the metadata block where the inconsistency was observed
    /// (0 when the violation is purely in-core) for repair triage. Fatal
    /// to the transaction context; the owning filesystem is expected to
    /// shut down or fall back to read-only.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Invalid configuration or geometry supplied by the caller.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// No physical blocks (or no btree expansion room) available.
    #[error("no space left on device")]
    NoSpace,

    /// The fork's extent count would exceed what its record format can hold.
    #[error("extent count exceeds maximum file size")]
    FileTooBig,

    /// A sub-step exhausted the current transaction's reservation and must
    /// be retried after a transaction roll. Never escapes the crate
    /// boundary of the mapping layer.
    #[error("operation must be continued in a fresh transaction")]
    Again,
}

impl RfsError {
    /// Convenience constructor for corruption reports.
    #[must_use]
    pub fn corrupt(block: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            block,
            detail: detail.into(),
        }
    }

    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive — every variant has an explicit arm.
    /// `Corruption` maps to `EUCLEAN` ("structure needs cleaning"), the
    /// conventional errno for filesystem metadata corruption.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EUCLEAN,
            Self::InvalidGeometry(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::FileTooBig => libc::EFBIG,
            Self::Again => libc::EAGAIN,
        }
    }

    /// Whether the caller may retry the operation (possibly at reduced
    /// size) without the filesystem being unhealthy.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NoSpace | Self::FileTooBig | Self::Again => true,
            Self::Io(_) | Self::Corruption { .. } | Self::InvalidGeometry(_) => false,
        }
    }
}

/// Result alias using `RfsError`.
pub type Result<T> = std::result::Result<T, RfsError>;
