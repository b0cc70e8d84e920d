//! Shared memory mappings of shadowed resources, and the raw region handles
//! the worker pool reads through.

use std::fs::File;
use std::ops::Range;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use memmap2::{MmapOptions, MmapRaw};
use rustix::fs::{MemfdFlags, memfd_create};

use crate::ShadowError;

/// A resource mapped shared, so stores by the application (or patches by
/// the replication engine) are visible through the same pages.
#[derive(Debug)]
pub struct Mapping {
    file: File,
    raw: Option<MmapRaw>,
    len: usize,
}

impl Mapping {
    /// Maps `len` bytes of an existing descriptor.
    pub fn from_fd(fd: OwnedFd, len: usize) -> Result<Self, ShadowError> {
        let file = File::from(fd);
        let raw = Self::map_len(&file, len)?;
        Ok(Self { file, raw, len })
    }

    /// Creates an anonymous memfd replica of `len` bytes and maps it.
    pub fn create_memfd(name: &str, len: usize) -> Result<Self, ShadowError> {
        let fd = memfd_create(name, MemfdFlags::CLOEXEC)?;
        let file = File::from(fd);
        file.set_len(len as u64)?;
        let raw = Self::map_len(&file, len)?;
        Ok(Self { file, raw, len })
    }

    fn map_len(file: &File, len: usize) -> Result<Option<MmapRaw>, ShadowError> {
        if len == 0 {
            return Ok(None);
        }
        Ok(Some(MmapOptions::new().len(len).map_raw(file)?))
    }

    /// Current mapped length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Re-reads the backing file size, remapping if it changed.
    ///
    /// Returns the new length. The caller must ensure no pool task holds a
    /// region into this mapping.
    pub fn refresh_len(&mut self) -> Result<usize, ShadowError> {
        let len = usize::try_from(self.file.metadata()?.len()).unwrap_or(usize::MAX);
        self.resize(len)?;
        Ok(len)
    }

    /// Sets the backing file length and remaps.
    ///
    /// The caller must ensure no pool task holds a region into this
    /// mapping.
    pub fn set_len(&mut self, len: usize) -> Result<(), ShadowError> {
        if len != self.len {
            self.file.set_len(len as u64)?;
        }
        self.resize(len)
    }

    fn resize(&mut self, len: usize) -> Result<(), ShadowError> {
        if len != self.len {
            self.raw = Self::map_len(&self.file, len)?;
            self.len = len;
        }
        Ok(())
    }

    /// Borrow of the underlying descriptor.
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }

    /// Duplicates the underlying descriptor, for handing the replica to the
    /// protocol layer.
    pub fn clone_fd(&self) -> Result<OwnedFd, ShadowError> {
        Ok(self.file.try_clone()?.into())
    }

    /// Raw region over `range`, for a pool task.
    ///
    /// The region stays valid only while the mapping is neither resized nor
    /// dropped; the owning worker guarantees that by draining the pool
    /// before any such mutation.
    #[must_use]
    pub fn region(&self, range: Range<usize>) -> Region {
        debug_assert!(range.end <= self.len);
        let base = self
            .raw
            .as_ref()
            .map_or(std::ptr::null_mut(), MmapRaw::as_mut_ptr);
        Region {
            ptr: base.wrapping_add(range.start),
            len: range.len(),
        }
    }

    /// Copies `bytes` into the mapping at `offset`.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.len);
        let region = self.region(offset..offset + bytes.len());
        // SAFETY: bounds checked above; the owner serializes writers.
        unsafe { region.as_mut_slice().copy_from_slice(bytes) }
    }

    /// Copies `range` of the mapping into a fresh vector.
    #[must_use]
    pub fn snapshot(&self, range: Range<usize>) -> Vec<u8> {
        let region = self.region(range);
        // SAFETY: bounds checked by `region`; the mapping outlives the call.
        unsafe { region.as_slice().to_vec() }
    }
}

/// Unowned view of a byte range inside a mapping or mirror buffer.
///
/// Regions cross into pool tasks, so they are `Send`; the soundness
/// contract is the damage-interval partitioning: concurrent regions are
/// disjoint for writes, and the owner blocks on pool drain before resizing
/// or releasing the storage they point into.
#[derive(Clone, Copy, Debug)]
pub struct Region {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: see the type-level contract; the owner enforces disjointness and
// lifetime by draining the pool before mutation or teardown.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Builds a region over an owned buffer.
    #[must_use]
    pub fn of_slice(slice: &[u8]) -> Self {
        Self {
            ptr: slice.as_ptr().cast_mut(),
            len: slice.len(),
        }
    }

    /// Length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    ///
    /// The backing storage must still be live and no concurrent writer may
    /// overlap this region.
    #[must_use]
    pub unsafe fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: caller upholds the type-level contract.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// # Safety
    ///
    /// As [`Self::as_slice`], and this region must be the only accessor of
    /// these bytes for the duration of the borrow.
    #[must_use]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        // SAFETY: caller upholds the type-level contract.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memfd_mapping_round_trips_bytes() {
        let mapping = Mapping::create_memfd("test-replica", 4096).expect("create");
        assert_eq!(mapping.len(), 4096);
        mapping.write_at(100, b"hello");
        assert_eq!(mapping.snapshot(100..105), b"hello");
        assert_eq!(mapping.snapshot(105..106), vec![0]);
    }

    #[test]
    fn grow_preserves_existing_contents() {
        let mut mapping = Mapping::create_memfd("test-grow", 64).expect("create");
        mapping.write_at(0, b"persist");
        mapping.set_len(4096).expect("grow");
        assert_eq!(mapping.len(), 4096);
        assert_eq!(mapping.snapshot(0..7), b"persist");
    }

    #[test]
    fn zero_length_mapping_is_legal() {
        let mapping = Mapping::create_memfd("test-empty", 0).expect("create");
        assert!(mapping.is_empty());
        assert!(mapping.snapshot(0..0).is_empty());
    }

    #[test]
    fn refresh_tracks_external_truncation() {
        let mut mapping = Mapping::create_memfd("test-shrink", 4096).expect("create");
        let clone = mapping.clone_fd().expect("dup");
        let file = File::from(clone);
        file.set_len(64).expect("truncate");
        assert_eq!(mapping.refresh_len().expect("refresh"), 64);
        assert_eq!(mapping.len(), 64);
    }
}
