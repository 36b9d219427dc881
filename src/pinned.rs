// FPGA msgDMA User-Mode Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Pinned, device-visible host memory.
//!
//! Turning a virtual range into a pinned, IOMMU-mapped range is the
//! driver's job; [`PinnedAllocator`] is the seam where a driver binding
//! plugs in. [`HostPinnedAllocator`] locks anonymous pages and reports the
//! virtual address as the IOVA, which is what a software device (or an
//! identity-mapped IOMMU domain) expects.

use crate::error::{DmaError, DmaResult};
use std::ptr::NonNull;

/// A pinned memory range with its device-visible address.
#[derive(Debug)]
pub struct PinnedRegion {
    virt: NonNull<u8>,
    iova: u64,
    len: usize,
}

// SAFETY: PinnedRegion is a plain description of memory owned by the
// allocator that produced it; moving it between threads moves that claim.
unsafe impl Send for PinnedRegion {}

// SAFETY: shared references only expose the addresses, never the bytes.
unsafe impl Sync for PinnedRegion {}

impl PinnedRegion {
    /// Describe an already pinned range.
    ///
    /// # Safety
    ///
    /// - `virt` must be valid for reads and writes of `len` bytes until the
    ///   region is handed back to its allocator
    /// - `iova` must be the address the device uses for the same bytes
    pub unsafe fn from_raw_parts(virt: NonNull<u8>, iova: u64, len: usize) -> Self {
        Self { virt, iova, len }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    /// Device-visible address of the first byte.
    #[inline]
    pub fn iova(&self) -> u64 {
        self.iova
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Source of pinned, device-visible buffers.
pub trait PinnedAllocator: Send + Sync {
    /// Pin `len` bytes and return the mapped region.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::PinFailed`] if the memory cannot be allocated,
    /// locked or mapped for the device.
    fn allocate(&self, len: usize) -> DmaResult<PinnedRegion>;

    /// Unpin and free a region produced by [`allocate`](Self::allocate).
    fn release(&self, region: PinnedRegion);
}

/// Page-locked anonymous memory whose IOVA equals its virtual address.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostPinnedAllocator;

impl HostPinnedAllocator {
    pub fn new() -> Self {
        Self
    }
}

impl PinnedAllocator for HostPinnedAllocator {
    fn allocate(&self, len: usize) -> DmaResult<PinnedRegion> {
        if len == 0 {
            return Err(DmaError::PinFailed {
                len,
                reason: "zero-length region".into(),
            });
        }

        // SAFETY: anonymous private mapping chosen by the kernel; checked below.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(DmaError::PinFailed {
                len,
                reason: format!("mmap: {}", std::io::Error::last_os_error()),
            });
        }

        // SAFETY: addr/len is the mapping created above.
        if unsafe { libc::mlock(addr, len) } != 0 {
            let err = std::io::Error::last_os_error();
            // Locking is best effort under RLIMIT_MEMLOCK; the pages are
            // already populated.
            log::debug!("mlock of {} bytes failed: {}", len, err);
        }

        let virt = NonNull::new(addr.cast::<u8>()).ok_or_else(|| DmaError::PinFailed {
            len,
            reason: "null mapping".into(),
        })?;
        let iova = virt.as_ptr() as u64;
        // SAFETY: the mapping is valid for len bytes until release.
        Ok(unsafe { PinnedRegion::from_raw_parts(virt, iova, len) })
    }

    fn release(&self, region: PinnedRegion) {
        // SAFETY: region was produced by allocate and is released once.
        unsafe {
            libc::munlock(region.as_ptr().cast(), region.len());
            libc::munmap(region.as_ptr().cast(), region.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_pinned_identity_iova() {
        let alloc = HostPinnedAllocator::new();
        let region = alloc.allocate(8192).unwrap();
        assert_eq!(region.len(), 8192);
        assert_eq!(region.iova(), region.as_ptr() as u64);
        // page aligned
        assert_eq!(region.iova() % 4096, 0);

        // SAFETY: region is valid for its length.
        unsafe {
            region.as_ptr().write_bytes(0xA5, region.len());
            assert_eq!(*region.as_ptr().add(8191), 0xA5);
        }
        alloc.release(region);
    }

    #[test]
    fn test_zero_length_rejected() {
        let err = HostPinnedAllocator::new().allocate(0).unwrap_err();
        assert!(matches!(err, DmaError::PinFailed { len: 0, .. }));
    }
}
