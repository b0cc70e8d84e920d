#![deny(unsafe_code)]
#![deny(missing_docs)]

//! # Overview
//!
//! `protocol` defines the two fixed wire structures every waybridge channel
//! speaks: the 16-byte [`ConnectionToken`] exchanged when a channel socket is
//! opened, and the [`frame`] header that prefixes every transfer block
//! afterwards. Both endpoints link this crate so the layouts cannot drift.
//!
//! # Design
//!
//! The token packs a protocol version and flag word together with a 96-bit
//! session key drawn from OS randomness; the key is how a resumed connection
//! is matched to its prior session. Frame headers pack the payload length and
//! a [`frame::TransferKind`] into one little-endian word, followed by an
//! `xid` word addressing the shadow resource the block applies to. Payloads
//! are padded so that consecutive headers stay 16-byte aligned.
//!
//! # Invariants
//!
//! - Every token carries [`token::FLAG_FIXED`]; a header without it is
//!   rejected as corrupt before the key is even looked at.
//! - A version mismatch refuses the connection; there is no downgrade path.
//! - `frame::transfer_size(frame::header(kind, len)) == len` for every legal
//!   payload length.

pub mod frame;
pub mod token;

pub use frame::{FrameHeader, TransferKind};
pub use token::ConnectionToken;

/// Errors produced while decoding handshake tokens or frame headers.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The peer spoke a different protocol revision.
    #[error("protocol version mismatch: peer sent {peer:#06x}, expected {ours:#06x}")]
    VersionMismatch {
        /// Version half of the received header word.
        peer: u16,
        /// Version this build speaks.
        ours: u16,
    },

    /// The token header did not carry the always-set marker bit.
    #[error("malformed connection token: fixed bit missing from header {header:#010x}")]
    NotAToken {
        /// Raw header word as received.
        header: u32,
    },

    /// A frame header named a transfer kind this build does not know.
    #[error("unknown transfer kind {kind} in frame header")]
    UnknownTransferKind {
        /// Kind bits extracted from the header word.
        kind: u8,
    },

    /// A payload exceeded what the header word can describe.
    #[error("transfer payload of {len} bytes exceeds the frame size limit")]
    PayloadTooLarge {
        /// Offending payload length.
        len: usize,
    },

    /// The OS random source failed; tokens are never minted from a weak key.
    #[error("could not read entropy for session key: {0}")]
    Entropy(rand::Error),
}
