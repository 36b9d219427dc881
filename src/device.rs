// FPGA msgDMA User-Mode Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! The device boundary the engine consumes.
//!
//! Enumeration, handle lifetime and interrupt registration belong to the
//! driver stack. By the time a channel is opened the caller has:
//! - a mapped register window containing the dispatcher
//! - a file descriptor that becomes readable when the channel interrupts
//! - a way to pin host memory and learn its IOVA
//!
//! [`MappedDevice`] bundles those for real hardware. The simulated device
//! in [`crate::sim`] implements the same trait in software.

use crate::error::{DmaError, DmaResult};
use crate::numa::DeviceLocality;
use crate::pinned::PinnedAllocator;
use crate::regs::{MmioRegion, RegisterSpace, CHANNEL_SPAN};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;

/// Which data path a dispatcher channel drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Memory-mapped reads and writes of device memory.
    MemoryMapped,
    /// Host memory into a device stream (memory-to-stream).
    HostToStream,
    /// Device stream into host memory (stream-to-memory).
    StreamToHost,
}

impl ChannelKind {
    #[inline]
    pub fn is_streaming(&self) -> bool {
        !matches!(self, Self::MemoryMapped)
    }
}

/// Where a channel lives inside the register window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout {
    /// Offset of the channel's register block.
    pub base: usize,
    pub kind: ChannelKind,
}

impl ChannelLayout {
    pub const fn new(base: usize, kind: ChannelKind) -> Self {
        Self { base, kind }
    }
}

/// An opened DMA-capable device, as seen by one channel.
pub trait Device: Send + Sync {
    /// The register window holding the channel.
    fn registers(&self) -> Arc<dyn RegisterSpace>;

    /// Location and kind of the channel.
    fn channel_layout(&self) -> ChannelLayout;

    /// File descriptor that becomes readable on a channel interrupt and
    /// yields an eight-byte event count when read.
    fn interrupt_fd(&self) -> BorrowedFd<'_>;

    /// Allocator for pinned, device-visible host memory.
    fn allocator(&self) -> Arc<dyn PinnedAllocator>;

    /// PCI address, used to place buffers and workers on the device's
    /// NUMA node.
    fn locality(&self) -> Option<DeviceLocality> {
        None
    }
}

/// A hardware device opened through its MMIO resource file.
pub struct MappedDevice {
    regs: Arc<MmioRegion>,
    layout: ChannelLayout,
    irq: OwnedFd,
    allocator: Arc<dyn PinnedAllocator>,
    locality: Option<DeviceLocality>,
}

impl MappedDevice {
    /// Map `mmio_len` bytes of `path` (e.g. a PCI `resource2` file or a
    /// UIO node) and pair it with an already registered interrupt fd.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The channel block does not fit inside the window
    /// - The register window cannot be opened or mapped
    pub fn open(
        path: &Path,
        mmio_len: usize,
        layout: ChannelLayout,
        irq: OwnedFd,
        allocator: Arc<dyn PinnedAllocator>,
    ) -> DmaResult<Self> {
        if layout.base.checked_add(CHANNEL_SPAN).map_or(true, |end| end > mmio_len) {
            return Err(DmaError::InvalidConfig(format!(
                "channel at {:#x} does not fit in {} byte window",
                layout.base, mmio_len
            )));
        }
        let regs = Arc::new(MmioRegion::open(path, mmio_len, 0)?);
        log::info!(
            "opened {:?} channel at {:#x} in {}",
            layout.kind,
            layout.base,
            path.display()
        );
        Ok(Self {
            regs,
            layout,
            irq,
            allocator,
            locality: None,
        })
    }

    /// Record the device's PCI address for NUMA placement.
    pub fn with_locality(mut self, locality: DeviceLocality) -> Self {
        self.locality = Some(locality);
        self
    }
}

impl Device for MappedDevice {
    fn registers(&self) -> Arc<dyn RegisterSpace> {
        self.regs.clone()
    }

    fn channel_layout(&self) -> ChannelLayout {
        self.layout
    }

    fn interrupt_fd(&self) -> BorrowedFd<'_> {
        self.irq.as_fd()
    }

    fn allocator(&self) -> Arc<dyn PinnedAllocator> {
        self.allocator.clone()
    }

    fn locality(&self) -> Option<DeviceLocality> {
        self.locality
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pinned::HostPinnedAllocator;

    fn eventfd() -> OwnedFd {
        use std::os::fd::FromRawFd;
        // SAFETY: eventfd returns a fresh descriptor or -1.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        assert!(fd >= 0);
        // SAFETY: fd is owned by nobody else.
        unsafe { OwnedFd::from_raw_fd(fd) }
    }

    #[test]
    fn test_streaming_kinds() {
        assert!(!ChannelKind::MemoryMapped.is_streaming());
        assert!(ChannelKind::HostToStream.is_streaming());
        assert!(ChannelKind::StreamToHost.is_streaming());
    }

    #[test]
    fn test_channel_must_fit_window() {
        let result = MappedDevice::open(
            Path::new("/dev/null"),
            0x100,
            ChannelLayout::new(0x80, ChannelKind::MemoryMapped),
            eventfd(),
            Arc::new(HostPinnedAllocator::new()),
        );
        assert!(matches!(result, Err(DmaError::InvalidConfig(_))));
    }

    #[test]
    fn test_open_missing_resource() {
        let result = MappedDevice::open(
            Path::new("/nonexistent/resource2"),
            0x1000,
            ChannelLayout::new(0, ChannelKind::MemoryMapped),
            eventfd(),
            Arc::new(HostPinnedAllocator::new()),
        );
        assert!(result.is_err());
    }
}
