//! First-sighting metadata records, including the DMABUF plane description.

use std::os::fd::{AsRawFd, BorrowedFd};

use crate::ShadowError;

/// Plane count carried for every DMABUF, used or not.
pub const DMABUF_PLANES: usize = 4;

/// Geometry and layout of a shadowed GPU buffer.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct DmabufMeta {
    /// Surface width in pixels.
    pub width: u32,
    /// Surface height in pixels.
    pub height: u32,
    /// DRM fourcc format code.
    pub format: u32,
    /// DRM format modifier.
    pub modifier: u64,
    /// Byte offset of each plane.
    pub offsets: [u32; DMABUF_PLANES],
    /// Row stride of each plane.
    pub strides: [u32; DMABUF_PLANES],
    /// Which planes are populated.
    pub plane_used: [bool; DMABUF_PLANES],
}

/// Encoded size of a [`DmabufMeta`] record.
pub const DMABUF_META_LEN: usize = 56;

impl DmabufMeta {
    /// Bytes needed to hold every used plane, which is the replication size
    /// of the buffer.
    #[must_use]
    pub fn nominal_size(&self) -> usize {
        let mut size = 0usize;
        for plane in 0..DMABUF_PLANES {
            if self.plane_used[plane] {
                let end = self.offsets[plane] as usize
                    + self.strides[plane] as usize * self.height as usize;
                size = size.max(end);
            }
        }
        size
    }

    /// Serializes the record for a `Metadata` block.
    #[must_use]
    pub fn encode(&self) -> [u8; DMABUF_META_LEN] {
        let mut out = [0u8; DMABUF_META_LEN];
        out[0..4].copy_from_slice(&self.width.to_le_bytes());
        out[4..8].copy_from_slice(&self.height.to_le_bytes());
        out[8..12].copy_from_slice(&self.format.to_le_bytes());
        out[12..20].copy_from_slice(&self.modifier.to_le_bytes());
        for plane in 0..DMABUF_PLANES {
            let at = 20 + 4 * plane;
            out[at..at + 4].copy_from_slice(&self.offsets[plane].to_le_bytes());
            let at = 36 + 4 * plane;
            out[at..at + 4].copy_from_slice(&self.strides[plane].to_le_bytes());
            out[52 + plane] = u8::from(self.plane_used[plane]);
        }
        out
    }

    /// Parses a record received in a `Metadata` block.
    pub fn decode(bytes: &[u8]) -> Result<Self, ShadowError> {
        if bytes.len() != DMABUF_META_LEN {
            return Err(ShadowError::BadMetadata {
                detail: format!("dmabuf record of {} bytes", bytes.len()),
            });
        }
        let mut meta = Self {
            width: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            height: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            format: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            modifier: u64::from_le_bytes(bytes[12..20].try_into().unwrap()),
            ..Self::default()
        };
        for plane in 0..DMABUF_PLANES {
            let at = 20 + 4 * plane;
            meta.offsets[plane] = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
            let at = 36 + 4 * plane;
            meta.strides[plane] = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
            meta.plane_used[plane] = bytes[52 + plane] != 0;
        }
        Ok(meta)
    }
}

// From linux/dma-buf.h: DMA_BUF_IOCTL_SYNC = _IOW('b', 0, struct dma_buf_sync).
const DMA_BUF_IOCTL_SYNC: libc::c_ulong = 0x4008_6200;
const DMA_BUF_SYNC_RW: u64 = 3;
const DMA_BUF_SYNC_START: u64 = 0;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

#[repr(C)]
struct DmaBufSync {
    flags: u64,
}

fn sync_ioctl(fd: BorrowedFd<'_>, flags: u64) -> Result<(), ShadowError> {
    let sync = DmaBufSync { flags };
    // SAFETY: fd is live for the call and the argument struct matches the
    // kernel ABI for this ioctl.
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), DMA_BUF_IOCTL_SYNC, &raw const sync) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        // Not every exporter implements the sync ioctl; treat that as a
        // coherent mapping.
        if err.raw_os_error() != Some(libc::ENOTTY) {
            return Err(ShadowError::Io(err));
        }
    }
    Ok(())
}

/// Brackets CPU access to a mapped DMABUF: call before reading or writing
/// through the mapping.
pub fn dmabuf_sync_begin(fd: BorrowedFd<'_>) -> Result<(), ShadowError> {
    sync_ioctl(fd, DMA_BUF_SYNC_START | DMA_BUF_SYNC_RW)
}

/// Ends a CPU access bracket opened by [`dmabuf_sync_begin`].
pub fn dmabuf_sync_end(fd: BorrowedFd<'_>) -> Result<(), ShadowError> {
    sync_ioctl(fd, DMA_BUF_SYNC_END | DMA_BUF_SYNC_RW)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> DmabufMeta {
        DmabufMeta {
            width: 256,
            height: 320,
            format: 0x3432_4258,
            modifier: 0x00ff_ffff_ffff_fffe,
            offsets: [0, 327_680, 0, 0],
            strides: [1024, 512, 0, 0],
            plane_used: [true, true, false, false],
        }
    }

    #[test]
    fn meta_encode_decode_round_trip() {
        let meta = sample_meta();
        let decoded = DmabufMeta::decode(&meta.encode()).expect("decode");
        assert_eq!(decoded, meta);
    }

    #[test]
    fn nominal_size_covers_every_used_plane() {
        let meta = sample_meta();
        assert_eq!(meta.nominal_size(), 327_680 + 512 * 320);
    }

    #[test]
    fn short_record_is_rejected() {
        assert!(matches!(
            DmabufMeta::decode(&[0u8; 20]),
            Err(ShadowError::BadMetadata { .. })
        ));
    }
}
