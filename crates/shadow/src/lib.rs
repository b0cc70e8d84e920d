//! # Overview
//!
//! `shadow` is the replication engine at the center of waybridge: the table
//! of file descriptors a session has shared across the channel, the damage
//! intervals recording where their contents have diverged from the last
//! transmitted snapshot, and the diff/fill/stream machinery that turns that
//! divergence into transfer blocks (and received blocks back into local
//! bytes).
//!
//! # Design
//!
//! Every shared descriptor becomes a [`table::ShadowEntry`] keyed by its
//! session-unique remote id. Memory-backed kinds (regular files, memfds,
//! DMABUFs) are mapped shared and carry a mirror buffer holding the last
//! transmitted contents; pipes and sockets are replicated as append-only
//! streams with no mirror. The expensive work of scanning damage intervals,
//! compressing payloads, and decompressing and patching received blocks
//! runs on the session's worker pool; ordering across the channel comes
//! from the transfer queue's message numbers, assigned when tasks are
//! enqueued.
//!
//! The table is owned by exactly one worker for its lifetime. Pool tasks
//! read the current mapping and read or write the mirror only for disjoint
//! damage intervals, and the owner drains the pool before any operation
//! that could move the storage those tasks point into (resize, release,
//! `finish_update`).
//!
//! # Invariants
//!
//! - A clean entry (`!is_dirty`) has a mirror byte-equal to its current
//!   mapped contents.
//! - Damage is empty exactly when the entry is clean.
//! - Remote ids are never reused within a session; server-minted ids are
//!   negative, client-minted positive.
//! - An entry is released exactly once, when its refcount reaches zero.

pub mod damage;
pub mod diff;
pub mod map;
pub mod meta;
pub mod table;

pub use damage::Damage;
pub use meta::DmabufMeta;
pub use table::{KindHint, Role, ShadowKind, ShadowTable};

/// Errors from table operations and block application.
#[derive(Debug, thiserror::Error)]
pub enum ShadowError {
    /// A remote id was not present in the table.
    #[error("unknown shadow id {id}")]
    UnknownId {
        /// Offending id.
        id: i32,
    },

    /// An operation was applied to an entry of an incompatible kind.
    #[error("shadow id {id} is not {expected}")]
    WrongKind {
        /// Offending id.
        id: i32,
        /// Kind the operation needed.
        expected: &'static str,
    },

    /// The operation needs the worker pool drained for this entry first.
    #[error("shadow id {id} still has pool tasks in flight")]
    TasksInFlight {
        /// Offending id.
        id: i32,
    },

    /// A received metadata or control record was malformed.
    #[error("malformed shadow record: {detail}")]
    BadMetadata {
        /// What was wrong.
        detail: String,
    },

    /// A block arrived that the table has no business applying.
    #[error("transfer block of kind {kind:?} cannot be applied to the shadow table")]
    UnexpectedBlock {
        /// Kind of the offending block.
        kind: protocol::TransferKind,
    },

    /// The session has GPU support disabled but saw a DMABUF.
    #[error("gpu support disabled, cannot shadow dmabuf")]
    GpuDisabled,

    /// Filesystem or mapping failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Raw syscall failure.
    #[error(transparent)]
    Os(#[from] rustix::io::Errno),

    /// Diff stream or payload failure.
    #[error(transparent)]
    Diff(#[from] diff::DiffError),

    /// Frame encoding failure.
    #[error(transparent)]
    Frame(#[from] protocol::ProtocolError),

    /// Transfer queue misuse.
    #[error(transparent)]
    Queue(#[from] transfer::TransferError),

    /// A worker-pool task failed while producing or applying updates.
    #[error(transparent)]
    Pool(#[from] pool::PoolError),
}
