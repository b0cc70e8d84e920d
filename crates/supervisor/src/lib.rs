//! # Overview
//!
//! `supervisor` owns a waybridge session from the outside in: it launches
//! the application, binds or pairs its Wayland-facing socket, dials the
//! channel, and runs one replication worker per application connection.
//! Reconnectable sessions additionally carry a control FIFO through which
//! the operator injects a replacement channel address; a helper dials it,
//! stamps the session's update token, and passes the fresh socket to the
//! worker over a link socket as an ancillary fd.
//!
//! # Design
//!
//! The session is one process: the supervisor loop, the per-connection
//! workers, the reconnection helper, and the worker pools are threads, and
//! only the application is a separate child. Every shadow table is owned by
//! exactly one worker thread for its lifetime; replacement channel sockets
//! always cross the link socket as `SCM_RIGHTS` payloads, so the process
//! boundary contract of reconnection is independent of the threading
//! choice.
//!
//! Shutdown is a process-wide flag set by the signal handlers in
//! [`signal`]; every poll loop observes it at each wakeup.

pub mod config;
pub mod control;
pub mod link;
pub mod reconnect;
pub mod server;
pub mod signal;
pub mod spawn;
pub mod worker;

pub use config::{SessionConfig, VideoMode};
pub use server::{ServerOptions, run_server};

use std::path::PathBuf;

/// Errors from session bring-up and steering.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The assembled display socket path exceeds the Unix-domain limit.
    #[error("display socket name too long: {}", path.display())]
    NameTooLong {
        /// Offending path.
        path: PathBuf,
    },

    /// A relative display name was given but `$XDG_RUNTIME_DIR` is unset.
    #[error("XDG_RUNTIME_DIR is not set; cannot resolve display {display:?}")]
    MissingRuntimeDir {
        /// Display name that needed the runtime dir.
        display: String,
    },

    /// The application could not be started.
    #[error("could not launch application {command:?}: {source}")]
    Spawn {
        /// argv[0] of the attempted launch.
        command: String,
        /// Underlying failure.
        source: std::io::Error,
    },

    /// A received frame or token violated the wire contract.
    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),

    /// Replication failure in the worker's shadow table.
    #[error(transparent)]
    Shadow(#[from] shadow::ShadowError),

    /// The worker pool reported a fatal task failure.
    #[error(transparent)]
    Pool(#[from] pool::PoolError),

    /// Transfer queue misuse.
    #[error(transparent)]
    Queue(#[from] transfer::TransferError),

    /// The peer resumed from a message number this side cannot serve.
    #[error("peer requested replay from {requested}, but retention starts at {available}")]
    ReplayUnavailable {
        /// Message number the peer asked for.
        requested: u64,
        /// Oldest retained message number.
        available: u64,
    },

    /// A control frame carried a payload of the wrong shape.
    #[error("malformed control frame payload of {len} bytes")]
    BadControlFrame {
        /// Payload length as received.
        len: usize,
    },

    /// An ancillary-message read produced no descriptor.
    #[error("link socket closed while waiting for a replacement channel fd")]
    LinkClosed,

    /// General I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Raw syscall failure.
    #[error(transparent)]
    Os(#[from] rustix::io::Errno),
}
