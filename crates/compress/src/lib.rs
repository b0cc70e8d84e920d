#![deny(unsafe_code)]
#![deny(missing_docs)]

//! # Overview
//!
//! `compress` selects and applies the block codecs used for waybridge diff
//! payloads. Updates to a shadowed resource are concatenated into one
//! payload per transfer block; when a session is configured with LZ4 or
//! Zstandard, that payload is replaced by its compressed form and the block
//! header records both sizes so the receiver can size its scratch buffer
//! before decoding.
//!
//! # Design
//!
//! Both channel endpoints are constructed from the same session
//! configuration, so the algorithm is fixed per session and never encoded
//! per block. Compression is advisory: when the compressed form is not
//! smaller than the input, the block is stored raw and the header's
//! compressed-size field stays zero. [`compress`] models this with an
//! `Option` return.
//!
//! # Invariants
//!
//! - `decompress(alg, compress(alg, data), data.len()) == data` for every
//!   algorithm.
//! - [`decompress`] never returns a buffer whose length differs from the
//!   expected uncompressed size; a mismatch is a protocol error upstream.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Compression applied to diff payloads, fixed for the whole session.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Algorithm {
    /// Payloads travel uncompressed.
    #[default]
    None,
    /// LZ4 block compression; fast, modest ratio.
    Lz4,
    /// Zstandard at the given level.
    Zstd {
        /// Encoder level, `1..=19`.
        level: i32,
    },
}

impl Algorithm {
    /// Default Zstandard level when none is given on the command line.
    pub const DEFAULT_ZSTD_LEVEL: i32 = 5;
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Lz4 => f.write_str("lz4"),
            Self::Zstd { level } => write!(f, "zstd:{level}"),
        }
    }
}

/// Errors from parsing an algorithm name or running a codec.
#[derive(Debug, thiserror::Error)]
pub enum CompressError {
    /// The algorithm name was not recognized.
    #[error("unknown compression algorithm {name:?} (expected none, lz4, or zstd[:level])")]
    UnknownAlgorithm {
        /// Name as supplied.
        name: String,
    },

    /// The level suffix was not an integer.
    #[error("invalid compression level in {name:?}: {source}")]
    BadLevel {
        /// Full specification as supplied.
        name: String,
        /// Parse failure.
        source: ParseIntError,
    },

    /// The codec rejected its input.
    #[error("{algorithm} codec failed: {message}")]
    Codec {
        /// Algorithm that was running.
        algorithm: Algorithm,
        /// Backend diagnostic.
        message: String,
    },

    /// Decompressed output did not match the size recorded in the block
    /// header.
    #[error("decompressed {got} bytes where the block header promised {expected}")]
    LengthMismatch {
        /// Bytes actually produced.
        got: usize,
        /// Bytes the header promised.
        expected: usize,
    },
}

impl FromStr for Algorithm {
    type Err = CompressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => return Ok(Self::None),
            "lz4" => return Ok(Self::Lz4),
            "zstd" => {
                return Ok(Self::Zstd {
                    level: Self::DEFAULT_ZSTD_LEVEL,
                });
            }
            _ => {}
        }
        if let Some(level) = s.strip_prefix("zstd:") {
            let level = level.parse().map_err(|source| CompressError::BadLevel {
                name: s.to_owned(),
                source,
            })?;
            return Ok(Self::Zstd { level });
        }
        Err(CompressError::UnknownAlgorithm { name: s.to_owned() })
    }
}

/// Compresses one block payload.
///
/// Returns `Ok(None)` when the session runs uncompressed or when the
/// compressed form would not be smaller, in which case the caller stores the
/// payload raw.
pub fn compress(algorithm: Algorithm, input: &[u8]) -> Result<Option<Vec<u8>>, CompressError> {
    let compressed = match algorithm {
        Algorithm::None => return Ok(None),
        Algorithm::Lz4 => lz4_flex::block::compress(input),
        Algorithm::Zstd { level } => {
            zstd::bulk::compress(input, level).map_err(|err| CompressError::Codec {
                algorithm,
                message: err.to_string(),
            })?
        }
    };
    if compressed.len() < input.len() {
        Ok(Some(compressed))
    } else {
        Ok(None)
    }
}

/// Expands one compressed block payload back to `expected_len` bytes.
pub fn decompress(
    algorithm: Algorithm,
    input: &[u8],
    expected_len: usize,
) -> Result<Vec<u8>, CompressError> {
    let output = match algorithm {
        Algorithm::None => {
            return Err(CompressError::Codec {
                algorithm,
                message: "compressed block on an uncompressed session".to_owned(),
            });
        }
        Algorithm::Lz4 => lz4_flex::block::decompress(input, expected_len).map_err(|err| {
            CompressError::Codec {
                algorithm,
                message: err.to_string(),
            }
        })?,
        Algorithm::Zstd { .. } => {
            zstd::bulk::decompress(input, expected_len).map_err(|err| CompressError::Codec {
                algorithm,
                message: err.to_string(),
            })?
        }
    };
    if output.len() != expected_len {
        return Err(CompressError::LengthMismatch {
            got: output.len(),
            expected: expected_len,
        });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressible_payload() -> Vec<u8> {
        let mut data = Vec::with_capacity(8192);
        for i in 0..8192u32 {
            #[allow(clippy::cast_possible_truncation)]
            data.push((i / 64) as u8);
        }
        data
    }

    #[test]
    fn parse_accepts_known_names() {
        assert_eq!("none".parse::<Algorithm>().expect("parse"), Algorithm::None);
        assert_eq!("lz4".parse::<Algorithm>().expect("parse"), Algorithm::Lz4);
        assert_eq!(
            "zstd:7".parse::<Algorithm>().expect("parse"),
            Algorithm::Zstd { level: 7 }
        );
        assert_eq!(
            "zstd".parse::<Algorithm>().expect("parse"),
            Algorithm::Zstd {
                level: Algorithm::DEFAULT_ZSTD_LEVEL
            }
        );
    }

    #[test]
    fn parse_rejects_unknown_names() {
        assert!(matches!(
            "gzip".parse::<Algorithm>(),
            Err(CompressError::UnknownAlgorithm { .. })
        ));
        assert!(matches!(
            "zstd:fast".parse::<Algorithm>(),
            Err(CompressError::BadLevel { .. })
        ));
    }

    #[test]
    fn none_always_stores_raw() {
        let payload = compressible_payload();
        assert!(compress(Algorithm::None, &payload).expect("compress").is_none());
    }

    #[test]
    fn lz4_round_trip() {
        let payload = compressible_payload();
        let compressed = compress(Algorithm::Lz4, &payload)
            .expect("compress")
            .expect("payload shrinks");
        assert!(compressed.len() < payload.len());
        let restored =
            decompress(Algorithm::Lz4, &compressed, payload.len()).expect("decompress");
        assert_eq!(restored, payload);
    }

    #[test]
    fn zstd_round_trip() {
        let algorithm = Algorithm::Zstd { level: 3 };
        let payload = compressible_payload();
        let compressed = compress(algorithm, &payload)
            .expect("compress")
            .expect("payload shrinks");
        let restored = decompress(algorithm, &compressed, payload.len()).expect("decompress");
        assert_eq!(restored, payload);
    }

    #[test]
    fn incompressible_input_is_stored_raw() {
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let mut noise = Vec::with_capacity(512);
        for _ in 0..512 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            #[allow(clippy::cast_possible_truncation)]
            noise.push(state as u8);
        }
        assert!(compress(Algorithm::Lz4, &noise).expect("compress").is_none());
    }

    #[test]
    fn short_output_is_a_length_mismatch() {
        let payload = compressible_payload();
        let compressed = compress(Algorithm::Lz4, &payload)
            .expect("compress")
            .expect("payload shrinks");
        assert!(matches!(
            decompress(Algorithm::Lz4, &compressed, payload.len() + 1),
            Err(_)
        ));
    }
}
