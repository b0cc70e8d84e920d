//! Transfer frame layout.
//!
//! Every unit delivered on the channel starts with two little-endian words:
//! a header packing the payload length and transfer kind, and an `xid`
//! addressing the shadow resource the block applies to (zero for control
//! kinds). The payload follows, zero-padded so the next header lands on a
//! 16-byte boundary.

use crate::ProtocolError;

/// Bits of the header word reserved for the transfer kind.
const KIND_BITS: u32 = 5;
/// Largest payload length the header word can describe.
pub const MAX_PAYLOAD: usize = (u32::MAX >> KIND_BITS) as usize;

/// Bytes occupied by the header and xid words.
pub const HEADER_LEN: usize = 8;

/// Alignment kept between consecutive frame headers.
pub const FRAME_ALIGN: usize = 16;

/// Discriminates the payload semantics of a transfer block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum TransferKind {
    /// Raw Wayland byte stream forwarded between application and compositor.
    Protocol = 1,
    /// Full contents of a shadow resource.
    Fill = 2,
    /// Differential update against the last transmitted snapshot.
    Diff = 3,
    /// Bytes appended to a replicated pipe.
    PipeData = 4,
    /// The write side of a replicated pipe closed.
    PipeClose = 5,
    /// First-sighting description of a shadow resource.
    Metadata = 6,
    /// Cumulative acknowledgement of received message numbers.
    Ack = 7,
    /// Marks the first message number replayed after a reconnect.
    Restart = 8,
}

impl TransferKind {
    fn from_bits(kind: u8) -> Result<Self, ProtocolError> {
        Ok(match kind {
            1 => Self::Protocol,
            2 => Self::Fill,
            3 => Self::Diff,
            4 => Self::PipeData,
            5 => Self::PipeClose,
            6 => Self::Metadata,
            7 => Self::Ack,
            8 => Self::Restart,
            _ => return Err(ProtocolError::UnknownTransferKind { kind }),
        })
    }
}

/// Packs a transfer kind and payload length into the header word.
pub fn header(kind: TransferKind, payload_len: usize) -> Result<u32, ProtocolError> {
    if payload_len > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge { len: payload_len });
    }
    #[allow(clippy::cast_possible_truncation)]
    let packed = ((payload_len as u32) << KIND_BITS) | kind as u32;
    Ok(packed)
}

/// Recovers the payload size in bytes from a header word.
#[must_use]
pub const fn transfer_size(header: u32) -> usize {
    (header >> KIND_BITS) as usize
}

/// Recovers the transfer kind from a header word.
pub fn transfer_kind(header: u32) -> Result<TransferKind, ProtocolError> {
    #[allow(clippy::cast_possible_truncation)]
    let bits = (header & ((1 << KIND_BITS) - 1)) as u8;
    TransferKind::from_bits(bits)
}

/// Total on-wire length of a block with the given payload, padding included.
#[must_use]
pub const fn block_len(payload_len: usize) -> usize {
    (HEADER_LEN + payload_len).next_multiple_of(FRAME_ALIGN)
}

/// Decoded form of the two leading frame words.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FrameHeader {
    /// Payload semantics.
    pub kind: TransferKind,
    /// Shadow remote id or control code.
    pub xid: i32,
    /// Unpadded payload length in bytes.
    pub size: usize,
}

impl FrameHeader {
    /// Parses the leading [`HEADER_LEN`] bytes of a block.
    pub fn decode(words: &[u8; HEADER_LEN]) -> Result<Self, ProtocolError> {
        let header = u32::from_le_bytes(words[0..4].try_into().unwrap());
        let xid = i32::from_le_bytes(words[4..8].try_into().unwrap());
        Ok(Self {
            kind: transfer_kind(header)?,
            xid,
            size: transfer_size(header),
        })
    }
}

/// Appends one framed block to `out`: header, xid, payload, alignment
/// padding.
pub fn write_block(
    out: &mut Vec<u8>,
    kind: TransferKind,
    xid: i32,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let word = header(kind, payload.len())?;
    out.extend_from_slice(&word.to_le_bytes());
    out.extend_from_slice(&xid.to_le_bytes());
    out.extend_from_slice(payload);
    let padded = block_len(payload.len());
    out.resize(out.len() + padded - HEADER_LEN - payload.len(), 0);
    Ok(())
}
