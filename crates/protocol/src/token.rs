//! Connection tokens: the 16-byte header written first on every channel
//! socket.
//!
//! The header word carries the protocol version in its high half and flag
//! bits in its low half; the remaining three words are the session key. A
//! reconnect attempt presents the same key with [`FLAG_UPDATE`] set, which is
//! how the receiving side matches it to the session it resumes.

use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::Instant;

use rand::RngCore;
use rand::rngs::OsRng;

use crate::ProtocolError;

/// Protocol revision spoken by this build, carried in the high 16 bits of
/// the token header.
pub const VERSION: u16 = 0x0001;

/// Always set; validates byte order and alignment on the receiving side.
pub const FLAG_FIXED: u32 = 1 << 0;
/// Set when this token resumes an existing session.
pub const FLAG_UPDATE: u32 = 1 << 1;
/// Set when the session may be resumed later.
pub const FLAG_RECONNECTABLE: u32 = 1 << 2;

/// Number of bytes a token occupies on the wire.
pub const TOKEN_LEN: usize = 16;

// Last key minted by this process. Successive mints permute it before
// overwriting so two tokens from one process never correlate, even if the
// random read only partially succeeds.
static PREVIOUS_KEY: Mutex<[u32; 3]> = Mutex::new([0; 3]);

static MINT_EPOCH: OnceLock<Instant> = OnceLock::new();

/// The 16-byte handshake header identifying protocol version, session key,
/// and per-connection flags.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ConnectionToken {
    /// Version and flag word.
    pub header: u32,
    /// Session identity; uniformly random.
    pub key: [u32; 3],
}

impl ConnectionToken {
    /// Mints a fresh token with a new session key.
    ///
    /// The key comes from OS randomness and fails closed if that read does
    /// not succeed. Process id and monotonic time are mixed in afterwards,
    /// and the previous key of this process is folded in through odd
    /// multipliers, as defense in depth against a weak entropy pool.
    pub fn mint(reconnectable: bool, update: bool) -> Result<Self, ProtocolError> {
        let mut flags = FLAG_FIXED;
        if update {
            flags |= FLAG_UPDATE;
        }
        if reconnectable {
            flags |= FLAG_RECONNECTABLE;
        }
        let header = (u32::from(VERSION) << 16) | flags;

        let epoch = MINT_EPOCH.get_or_init(Instant::now);
        let mut previous = PREVIOUS_KEY.lock().unwrap();
        let mut key = [
            previous[0].wrapping_mul(13),
            previous[1].wrapping_mul(17),
            previous[2].wrapping_mul(29),
        ];
        key[0] ^= std::process::id();
        #[allow(clippy::cast_possible_truncation)]
        let nanos = epoch.elapsed().as_nanos() as u64;
        key[1] ^= nanos as u32;
        key[2] ^= (nanos >> 32) as u32;

        let mut random = [0u8; 12];
        OsRng
            .try_fill_bytes(&mut random)
            .map_err(ProtocolError::Entropy)?;
        for (word, chunk) in key.iter_mut().zip(random.chunks_exact(4)) {
            *word ^= u32::from_le_bytes(chunk.try_into().unwrap());
        }

        *previous = key;
        Ok(Self { header, key })
    }

    /// Returns a copy of this token with [`FLAG_UPDATE`] set; key and
    /// version are unchanged.
    #[must_use]
    pub const fn flag_update(mut self) -> Self {
        self.header |= FLAG_UPDATE;
        self
    }

    /// Whether this token resumes an existing session.
    #[must_use]
    pub const fn is_update(&self) -> bool {
        self.header & FLAG_UPDATE != 0
    }

    /// Whether the session this token opens may be resumed later.
    #[must_use]
    pub const fn is_reconnectable(&self) -> bool {
        self.header & FLAG_RECONNECTABLE != 0
    }

    /// Serializes the token into its fixed wire form, header word first.
    #[must_use]
    pub fn encode(&self) -> [u8; TOKEN_LEN] {
        let mut out = [0u8; TOKEN_LEN];
        out[0..4].copy_from_slice(&self.header.to_le_bytes());
        for (i, word) in self.key.iter().enumerate() {
            out[4 + 4 * i..8 + 4 * i].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Parses and validates a received token.
    ///
    /// Refuses headers without [`FLAG_FIXED`] and headers whose version half
    /// differs from [`VERSION`].
    pub fn decode(bytes: &[u8; TOKEN_LEN]) -> Result<Self, ProtocolError> {
        let header = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if header & FLAG_FIXED == 0 {
            return Err(ProtocolError::NotAToken { header });
        }
        #[allow(clippy::cast_possible_truncation)]
        let peer = (header >> 16) as u16;
        if peer != VERSION {
            return Err(ProtocolError::VersionMismatch {
                peer,
                ours: VERSION,
            });
        }
        let mut key = [0u32; 3];
        for (i, word) in key.iter_mut().enumerate() {
            *word = u32::from_le_bytes(bytes[4 + 4 * i..8 + 4 * i].try_into().unwrap());
        }
        Ok(Self { header, key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_sets_requested_flags() {
        let token = ConnectionToken::mint(true, false).expect("mint token");
        assert!(token.is_reconnectable());
        assert!(!token.is_update());
        assert_eq!(token.header & FLAG_FIXED, FLAG_FIXED);
        assert_eq!(token.header >> 16, u32::from(VERSION));
    }

    #[test]
    fn flag_update_preserves_key_and_version() {
        let token = ConnectionToken::mint(true, false).expect("mint token");
        let update = token.flag_update();
        assert!(update.is_update());
        assert_eq!(update.key, token.key);
        assert_eq!(update.header >> 16, token.header >> 16);
    }

    #[test]
    fn encode_decode_round_trip() {
        let token = ConnectionToken::mint(false, true).expect("mint token");
        let decoded = ConnectionToken::decode(&token.encode()).expect("decode token");
        assert_eq!(decoded, token);
    }

    #[test]
    fn decode_refuses_version_mismatch() {
        let mut bytes = ConnectionToken::mint(false, false).expect("mint token").encode();
        bytes[2] ^= 0x40;
        match ConnectionToken::decode(&bytes) {
            Err(ProtocolError::VersionMismatch { .. }) => {}
            other => panic!("expected version refusal, got {other:?}"),
        }
    }

    #[test]
    fn decode_refuses_missing_fixed_bit() {
        let mut bytes = ConnectionToken::mint(false, false).expect("mint token").encode();
        bytes[0] &= !1;
        assert!(matches!(
            ConnectionToken::decode(&bytes),
            Err(ProtocolError::NotAToken { .. })
        ));
    }

    #[test]
    fn successive_mints_produce_distinct_keys() {
        let a = ConnectionToken::mint(false, false).expect("mint token");
        let b = ConnectionToken::mint(false, false).expect("mint token");
        assert_ne!(a.key, b.key);
    }
}
