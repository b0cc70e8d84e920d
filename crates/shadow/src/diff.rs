//! The block diff engine and the payload layout shared by `Diff` and `Fill`
//! transfer blocks.
//!
//! A diff stream is a sequence of segments `(u32 offset, u32 length,
//! bytes[length])`, each zero-padded to a 16-byte multiple, terminated by a
//! sentinel segment with `length == 0`. The stream is wrapped in a payload
//! carrying the uncompressed length and, when the session compresses and the
//! codec actually won, the compressed length (zero means stored raw).

use std::ops::Range;

use compress::Algorithm;

/// Comparison granularity of the diff scan, in bytes.
pub const DIFF_BLOCK: usize = 64;

/// Alignment kept between segments inside a diff stream.
const SEGMENT_ALIGN: usize = 16;

const SEGMENT_HEADER: usize = 8;

/// Payload wrapper prefix: `u32 uncompressed`, `u32 compressed`.
const PAYLOAD_PREFIX: usize = 8;

/// Errors from decoding diff streams and payload wrappers.
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    /// The stream ended mid-segment.
    #[error("diff stream truncated at byte {at}")]
    Truncated {
        /// Offset of the incomplete segment.
        at: usize,
    },

    /// The stream ran out before the zero-length sentinel.
    #[error("diff stream missing its terminating sentinel")]
    MissingSentinel,

    /// A segment addressed bytes outside the target resource.
    #[error("diff segment of {length} bytes at {offset} exceeds resource size {size}")]
    OutOfBounds {
        /// Segment start offset.
        offset: usize,
        /// Segment length.
        length: usize,
        /// Size of the resource being patched.
        size: usize,
    },

    /// The payload wrapper disagreed with the bytes that followed it.
    #[error("diff payload header promised {expected} bytes, found {got}")]
    BadPayload {
        /// Length the wrapper promised.
        expected: usize,
        /// Length actually present.
        got: usize,
    },

    /// Decompression failed or produced the wrong length.
    #[error(transparent)]
    Compress(#[from] compress::CompressError),
}

/// Scans one damage interval and appends diff segments for the byte ranges
/// where `current` and `mirror` disagree.
///
/// The scan walks [`DIFF_BLOCK`]-sized chunks from the interval start and
/// coalesces consecutive differing chunks into a single segment. Both
/// slices cover the whole resource; the interval must lie inside them.
pub fn diff_interval(out: &mut Vec<u8>, current: &[u8], mirror: &[u8], interval: Range<usize>) {
    debug_assert!(interval.end <= current.len());
    debug_assert_eq!(current.len(), mirror.len());

    let mut run: Option<Range<usize>> = None;
    let mut at = interval.start;
    while at < interval.end {
        let block_end = (at + DIFF_BLOCK).min(interval.end);
        let differs = current[at..block_end] != mirror[at..block_end];
        match (&mut run, differs) {
            (None, true) => run = Some(at..block_end),
            (Some(open), true) => open.end = block_end,
            (Some(open), false) => {
                push_segment(out, open.start, &current[open.clone()]);
                run = None;
            }
            (None, false) => {}
        }
        at = block_end;
    }
    if let Some(open) = run {
        push_segment(out, open.start, &current[open.clone()]);
    }
}

fn push_segment(out: &mut Vec<u8>, offset: usize, bytes: &[u8]) {
    #[allow(clippy::cast_possible_truncation)]
    {
        out.extend_from_slice(&(offset as u32).to_le_bytes());
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    }
    out.extend_from_slice(bytes);
    let unpadded = SEGMENT_HEADER + bytes.len();
    out.resize(out.len() + unpadded.next_multiple_of(SEGMENT_ALIGN) - unpadded, 0);
}

/// Appends the zero-length sentinel that terminates a diff stream.
pub fn push_sentinel(out: &mut Vec<u8>) {
    out.extend_from_slice(&[0u8; SEGMENT_ALIGN]);
}

/// Walks a diff stream, handing each segment to `patch`.
///
/// `size` bounds the target resource; segments reaching past it fail with
/// [`DiffError::OutOfBounds`] before `patch` sees them.
pub fn apply_stream(
    stream: &[u8],
    size: usize,
    mut patch: impl FnMut(usize, &[u8]),
) -> Result<(), DiffError> {
    let mut at = 0;
    loop {
        if stream.len() < at + SEGMENT_HEADER {
            return Err(DiffError::MissingSentinel);
        }
        let offset = u32::from_le_bytes(stream[at..at + 4].try_into().unwrap()) as usize;
        let length = u32::from_le_bytes(stream[at + 4..at + 8].try_into().unwrap()) as usize;
        if length == 0 {
            return Ok(());
        }
        let data_start = at + SEGMENT_HEADER;
        if stream.len() < data_start + length {
            return Err(DiffError::Truncated { at });
        }
        if offset + length > size {
            return Err(DiffError::OutOfBounds {
                offset,
                length,
                size,
            });
        }
        patch(offset, &stream[data_start..data_start + length]);
        at += (SEGMENT_HEADER + length).next_multiple_of(SEGMENT_ALIGN);
    }
}

/// Wraps a finished stream (or full contents, for `Fill` blocks) in the
/// payload prefix, compressing when the session algorithm wins.
pub fn encode_payload(algorithm: Algorithm, raw: &[u8]) -> Result<Vec<u8>, DiffError> {
    let mut out = Vec::with_capacity(PAYLOAD_PREFIX + raw.len());
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(raw.len() as u32).to_le_bytes());
    match compress::compress(algorithm, raw)? {
        Some(compressed) => {
            #[allow(clippy::cast_possible_truncation)]
            out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
            out.extend_from_slice(&compressed);
        }
        None => {
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(raw);
        }
    }
    Ok(out)
}

/// Unwraps a payload back to the raw stream bytes.
pub fn decode_payload(algorithm: Algorithm, payload: &[u8]) -> Result<Vec<u8>, DiffError> {
    if payload.len() < PAYLOAD_PREFIX {
        return Err(DiffError::BadPayload {
            expected: PAYLOAD_PREFIX,
            got: payload.len(),
        });
    }
    let uncompressed = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
    let compressed = u32::from_le_bytes(payload[4..8].try_into().unwrap()) as usize;
    let body = &payload[PAYLOAD_PREFIX..];
    if compressed == 0 {
        if body.len() != uncompressed {
            return Err(DiffError::BadPayload {
                expected: uncompressed,
                got: body.len(),
            });
        }
        return Ok(body.to_vec());
    }
    if body.len() != compressed {
        return Err(DiffError::BadPayload {
            expected: compressed,
            got: body.len(),
        });
    }
    Ok(compress::decompress(algorithm, body, uncompressed)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch_into(target: &mut [u8]) -> impl FnMut(usize, &[u8]) + '_ {
        move |offset, bytes| target[offset..offset + bytes.len()].copy_from_slice(bytes)
    }

    #[test]
    fn identical_buffers_emit_nothing() {
        let data = vec![7u8; 1024];
        let mut out = Vec::new();
        diff_interval(&mut out, &data, &data, 0..1024);
        assert!(out.is_empty());
    }

    #[test]
    fn single_changed_byte_emits_one_block() {
        let mirror = vec![0u8; 1024];
        let mut current = mirror.clone();
        current[300] = 9;
        let mut out = Vec::new();
        diff_interval(&mut out, &current, &mirror, 0..1024);
        push_sentinel(&mut out);

        let mut restored = mirror.clone();
        apply_stream(&out, 1024, patch_into(&mut restored)).expect("apply");
        assert_eq!(restored, current);

        let offset = u32::from_le_bytes(out[0..4].try_into().unwrap()) as usize;
        let length = u32::from_le_bytes(out[4..8].try_into().unwrap()) as usize;
        assert_eq!(offset, 256);
        assert_eq!(length, DIFF_BLOCK);
    }

    #[test]
    fn consecutive_dirty_blocks_coalesce_into_one_segment() {
        let mirror = vec![0u8; 4 * DIFF_BLOCK];
        let mut current = mirror.clone();
        current[0..2 * DIFF_BLOCK].fill(1);
        let mut out = Vec::new();
        diff_interval(&mut out, &current, &mirror, 0..current.len());
        let length = u32::from_le_bytes(out[4..8].try_into().unwrap()) as usize;
        assert_eq!(length, 2 * DIFF_BLOCK);
    }

    #[test]
    fn diff_stays_inside_the_interval() {
        let mirror = vec![0u8; 1024];
        let current = vec![1u8; 1024];
        let mut out = Vec::new();
        diff_interval(&mut out, &current, &mirror, 128..256);
        push_sentinel(&mut out);
        let mut touched = vec![false; 1024];
        apply_stream(&out, 1024, |offset, bytes| {
            touched[offset..offset + bytes.len()].fill(true);
        })
        .expect("apply");
        assert!(touched[0..128].iter().all(|&t| !t));
        assert!(touched[128..256].iter().all(|&t| t));
        assert!(touched[256..].iter().all(|&t| !t));
    }

    #[test]
    fn stream_without_sentinel_is_rejected() {
        let mirror = vec![0u8; 256];
        let current = vec![1u8; 256];
        let mut out = Vec::new();
        diff_interval(&mut out, &current, &mirror, 0..256);
        assert!(matches!(
            apply_stream(&out, 256, |_, _| {}),
            Err(DiffError::MissingSentinel)
        ));
    }

    #[test]
    fn out_of_bounds_segment_is_rejected() {
        let mut out = Vec::new();
        push_segment(&mut out, 200, &[1u8; 100]);
        push_sentinel(&mut out);
        assert!(matches!(
            apply_stream(&out, 256, |_, _| {}),
            Err(DiffError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn payload_round_trips_for_every_algorithm() {
        let mut raw = Vec::new();
        for i in 0..2048u32 {
            #[allow(clippy::cast_possible_truncation)]
            raw.push((i / 16) as u8);
        }
        for algorithm in [
            Algorithm::None,
            Algorithm::Lz4,
            Algorithm::Zstd { level: 3 },
        ] {
            let payload = encode_payload(algorithm, &raw).expect("encode");
            let restored = decode_payload(algorithm, &payload).expect("decode");
            assert_eq!(restored, raw, "algorithm {algorithm}");
        }
    }

    #[test]
    fn payload_length_mismatch_is_rejected() {
        let payload = encode_payload(Algorithm::None, b"hello").expect("encode");
        assert!(matches!(
            decode_payload(Algorithm::None, &payload[..payload.len() - 1]),
            Err(DiffError::BadPayload { .. })
        ));
    }
}
