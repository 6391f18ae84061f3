#![forbid(unsafe_code)]
//! Error types for clustune.
//!
//! # Error Taxonomy
//!
//! Every failure the maintenance runtime can report falls into one of five
//! classes. The class decides how the command line reacts; the variant carries
//! the detail the user needs to act on it.
//!
//! | Class | Variants | Mutation performed? |
//! |-------|----------|---------------------|
//! | Busy / unavailable | `DeviceBusy`, `DeviceNotFound`, `NotMounted`, `HeartbeatDevice`, `ResizeInProgress`, `TunefsInProgress` | never |
//! | Corruption | `CorruptChain`, `Corruption`, `Format`, `Parse` | never |
//! | Precondition | `JournalDirty`, `NoSpace` | never |
//! | Mode negotiation | `PerformOnline`, `InvalidStackName` | no; control signals, not failures |
//! | Operational | `ClusterStack`, `TrylockFailed`, `OnlineFailed`, `Internal`, `Conversion`, `Io`, `Cancelled`, `ReadOnly`, `InvalidNumber`, `Usage` | possibly (see below) |
//!
//! `Conversion` is the one variant that can follow a partial on-disk change:
//! inodes converted before the failing one stay converted. Callers must not
//! assume rollback.
//!
//! ## Mapping Policy: ParseError → CtnError
//!
//! `ctn-error` does not depend on `ctn-types`. The conversion from
//! `ParseError` happens in `ctn-ondisk`, which knows the block being decoded:
//! malformed live metadata becomes `Corruption { block, .. }`, a malformed
//! superblock becomes `Format`.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`CtnError::to_errno`].
//! The match is exhaustive so a new variant does not compile until its errno
//! is chosen.

use thiserror::Error;

/// Unified error type for all clustune operations.
#[derive(Debug, Error)]
pub enum CtnError {
    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Another process holds the device exclusively and it is not a live
    /// mount we could delegate to.
    #[error("device is busy")]
    DeviceBusy,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Online access was required but the filesystem is not mounted
    /// read-write.
    #[error("filesystem is not mounted read-write")]
    NotMounted,

    /// The device only carries heartbeat traffic; it has no filesystem to tune.
    #[error("device is a heartbeat-only device")]
    HeartbeatDevice,

    #[error("a resize operation is in progress on this filesystem")]
    ResizeInProgress,

    /// A previous feature change was interrupted.
    #[error("a feature change operation is in progress on this filesystem (tunefs flags: {0:#x})")]
    TunefsInProgress(u16),

    /// A chain allocator's accounting is inconsistent.
    ///
    /// `block` is the group descriptor (or allocator inode) whose counts
    /// disagree with what was found on disk.
    #[error("corrupt chain allocator at block {block}: {detail}")]
    CorruptChain { block: u64, detail: String },

    /// Malformed metadata at a known block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// The image is not a filesystem this build understands.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("parse error: {0}")]
    Parse(String),

    /// A node slot's journal holds unreplayed transactions.
    #[error("journal for slot {slot} is dirty; run fsck to replay all dirty journals")]
    JournalDirty { slot: u16 },

    /// Not enough free clusters for the requested layout change.
    #[error("not enough space: need {needed} clusters, {free} free")]
    NoSpace { needed: u64, free: u64 },

    /// Control signal: the change must be applied through the live mount.
    #[error("operation must be performed online")]
    PerformOnline,

    /// Control signal: the filesystem's cluster stack differs from the
    /// running one and the caller said it can live with that.
    #[error("cluster stack name does not match the running stack")]
    InvalidStackName,

    /// The cluster stack could not be initialised or joined.
    #[error("cluster stack error: {0}")]
    ClusterStack(String),

    /// The distributed lock is held elsewhere.
    #[error("could not acquire the cluster lock: it is held by another node or process")]
    TrylockFailed,

    /// The live mount rejected or failed the requested change.
    #[error("online operation failed: {0}")]
    OnlineFailed(String),

    /// Misuse of an internal interface (bad descriptor, bad arguments).
    #[error("internal error: {0}")]
    Internal(String),

    /// Converting a single inode's storage layout failed.
    #[error("failed to convert inode {inode}: {source}")]
    Conversion {
        inode: u64,
        #[source]
        source: Box<CtnError>,
    },

    /// Termination was requested by a signal.
    #[error("operation cancelled")]
    Cancelled,

    /// A write was attempted through a read-only session.
    #[error("read-only filesystem")]
    ReadOnly,

    #[error("invalid number: {0:?}")]
    InvalidNumber(String),

    #[error("{0}")]
    Usage(String),
}

impl CtnError {
    /// Convert this error into a POSIX errno.
    ///
    /// - `PerformOnline` → `EBUSY`: the device is in use by a live mount.
    /// - `JournalDirty` → `EAGAIN`: retry after journal replay.
    /// - `Conversion` → the errno of the underlying failure.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::DeviceBusy
            | Self::ResizeInProgress
            | Self::TunefsInProgress(_)
            | Self::PerformOnline => libc::EBUSY,
            Self::DeviceNotFound(_) => libc::ENOENT,
            Self::NotMounted => libc::ENODEV,
            Self::HeartbeatDevice => libc::EOPNOTSUPP,
            Self::CorruptChain { .. } | Self::Corruption { .. } | Self::OnlineFailed(_) => {
                libc::EIO
            }
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidStackName
            | Self::Internal(_)
            | Self::InvalidNumber(_)
            | Self::Usage(_) => libc::EINVAL,
            Self::JournalDirty { .. } | Self::TrylockFailed => libc::EAGAIN,
            Self::NoSpace { .. } => libc::ENOSPC,
            Self::ClusterStack(_) => libc::ENOTCONN,
            Self::Conversion { source, .. } => source.to_errno(),
            Self::Cancelled => libc::EINTR,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// True for the two open outcomes that select an operating mode.
    #[must_use]
    pub fn is_mode_signal(&self) -> bool {
        matches!(self, Self::PerformOnline | Self::InvalidStackName)
    }

    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptChain { .. } | Self::Corruption { .. } | Self::Format(_) | Self::Parse(_)
        )
    }

    /// Precondition failures abort before anything is written.
    #[must_use]
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::JournalDirty { .. } | Self::NoSpace { .. })
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::DeviceBusy
                | Self::DeviceNotFound(_)
                | Self::NotMounted
                | Self::HeartbeatDevice
                | Self::ResizeInProgress
                | Self::TunefsInProgress(_)
        )
    }
}

/// Result alias using `CtnError`.
pub type Result<T> = std::result::Result<T, CtnError>;
