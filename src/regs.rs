// FPGA msgDMA User-Mode Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! msgDMA dispatcher register map and register-space access.
//!
//! Every offset here is relative to the channel base inside the device's
//! MMIO region. The layout follows the Altera/Intel modular scatter-gather
//! DMA dispatcher with the extended descriptor format.
//!
//! | Block            | Offset |
//! |------------------|--------|
//! | CSR              | `0x40` |
//! | Descriptor port  | `0x60` |
//! | Response port    | `0x80` |
//! | Streaming valve  | `0xA0` |

use crate::descriptor::Descriptor;
use crate::error::{DmaError, DmaResult};
use bitflags::bitflags;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Offset of the dispatcher CSR block.
pub const CSR_OFFSET: usize = 0x40;
/// Offset of the descriptor write port.
pub const DESCRIPTOR_OFFSET: usize = 0x60;
/// Offset of the response read port.
pub const RESPONSE_OFFSET: usize = 0x80;
/// Offset of the streaming valve block.
pub const STREAMING_VALVE_OFFSET: usize = 0xA0;

/// Status register.
pub const CSR_STATUS: usize = CSR_OFFSET;
/// Control register.
pub const CSR_CONTROL: usize = CSR_OFFSET + 0x4;
/// Read/write descriptor fill levels (low/high 16 bits).
pub const CSR_FILL_LEVEL: usize = CSR_OFFSET + 0x8;
/// Response FIFO fill level (low 16 bits).
pub const CSR_RESPONSE_FILL_LEVEL: usize = CSR_OFFSET + 0xC;
/// Read/write sequence numbers.
pub const CSR_SEQUENCE_NUMBER: usize = CSR_OFFSET + 0x10;

/// Actual bytes transferred by the oldest response.
pub const RESPONSE_BYTES: usize = RESPONSE_OFFSET;
/// Status of the oldest response; reading it pops the entry.
pub const RESPONSE_STATUS: usize = RESPONSE_OFFSET + 0x4;

/// Streaming valve control register.
pub const VALVE_CONTROL: usize = STREAMING_VALVE_OFFSET;

/// Size of the register window a channel occupies.
pub const CHANNEL_SPAN: usize = 0xC0;

bitflags! {
    /// Dispatcher status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u32 {
        const BUSY = 1 << 0;
        const DESC_BUF_EMPTY = 1 << 1;
        /// Descriptor FIFO cannot accept another descriptor.
        const DESC_BUF_FULL = 1 << 2;
        const RSP_BUF_EMPTY = 1 << 3;
        const RSP_BUF_FULL = 1 << 4;
        const STOPPED = 1 << 5;
        const RESETTING = 1 << 6;
        const STOPPED_ON_ERROR = 1 << 7;
        const STOPPED_ON_EARLY_TERM = 1 << 8;
        /// Interrupt pending; write one to clear.
        const IRQ = 1 << 9;
    }
}

bitflags! {
    /// Dispatcher control register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlFlags: u32 {
        const STOP_DISPATCHER = 1 << 0;
        const RESET_DISPATCHER = 1 << 1;
        const STOP_ON_ERROR = 1 << 2;
        const STOP_ON_EARLY_TERM = 1 << 3;
        const GLOBAL_INTR_EN = 1 << 4;
        const STOP_DESCRIPTORS = 1 << 5;
        const FLUSH_DESCRIPTORS = 1 << 6;
        const FLUSH_RD_MASTER = 1 << 7;
        const FLUSH_WR_MASTER = 1 << 8;
    }
}

bitflags! {
    /// Response status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResponseStatus: u32 {
        const ERROR = 0xFF;
        const EARLY_TERMINATION = 1 << 8;
        const EOP_ARRIVED = 1 << 9;
    }
}

bitflags! {
    /// Streaming valve control bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ValveControl: u32 {
        const EN_DATA_FLOW = 1 << 0;
        const EN_DET_TF = 1 << 1;
        const EN_NON_DET_TF = 1 << 2;
        const CLR_BYTES = 1 << 3;
    }
}

/// Value forced into the control register when the device disappears:
/// stop the dispatcher and drop queued descriptors, interrupts masked.
pub const SHUTDOWN_CONTROL: u32 = ControlFlags::STOP_DISPATCHER.bits()
    | ControlFlags::STOP_DESCRIPTORS.bits()
    | ControlFlags::FLUSH_DESCRIPTORS.bits();

/// One entry popped from the response FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// Bytes actually written by the descriptor.
    pub bytes: u32,
    /// Error and end-of-packet bits.
    pub status: ResponseStatus,
}

impl Response {
    #[inline]
    pub fn eop_arrived(&self) -> bool {
        self.status.contains(ResponseStatus::EOP_ARRIVED)
    }

    #[inline]
    pub fn error_bits(&self) -> u8 {
        (self.status.bits() & ResponseStatus::ERROR.bits()) as u8
    }
}

/// 32-bit register access to a device's MMIO window.
///
/// Offsets are absolute within the window. Implementations must report
/// accesses that cannot complete as [`DmaError::RegisterAccess`].
pub trait RegisterSpace: Send + Sync {
    /// Read a 32-bit register.
    fn read32(&self, offset: usize) -> DmaResult<u32>;

    /// Write a 32-bit register.
    fn write32(&self, offset: usize, value: u32) -> DmaResult<()>;

    /// Write consecutive 32-bit words starting at `offset`, in order.
    fn write_block(&self, offset: usize, words: &[u32]) -> DmaResult<()> {
        for (i, word) in words.iter().enumerate() {
            self.write32(offset + i * 4, *word)?;
        }
        Ok(())
    }

    /// Stable address of a register for lock-free writers, if the window
    /// is directly mapped.
    fn mapped_address(&self, _offset: usize) -> Option<NonNull<u32>> {
        None
    }
}

// ============================================================================
// Memory-mapped register window
// ============================================================================

/// A device register window mapped from a character device or sysfs
/// `resource` file.
pub struct MmioRegion {
    /// Keeps the mapping's backing file open.
    #[allow(dead_code)]
    file: File,
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: MmioRegion can be sent between threads because:
// - The file descriptor is owned and valid
// - The mapping stays valid until Drop
unsafe impl Send for MmioRegion {}

// SAFETY: all accesses are single volatile 32-bit loads and stores, which
// the device serializes itself.
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// Map `len` bytes of a device file starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be opened (permissions, not found)
    /// - Memory mapping fails
    pub fn open(path: &Path, len: usize, offset: u64) -> DmaResult<Self> {
        if len == 0 {
            return Err(DmaError::InvalidArgument("empty register window".into()));
        }
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    DmaError::PermissionDenied(path.display().to_string())
                } else {
                    DmaError::Io(e)
                }
            })?;

        let offset = libc::off_t::try_from(offset)
            .map_err(|_| DmaError::InvalidArgument(format!("offset {offset:#x} out of range")))?;

        // SAFETY: mapping a fresh range chosen by the kernel; the result is checked.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                offset,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(DmaError::MmapFailed(format!(
                "mmap of {} bytes failed for {}: {}",
                len,
                path.display(),
                std::io::Error::last_os_error()
            )));
        }

        let base = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| DmaError::MmapFailed(format!("null mapping for {}", path.display())))?;

        log::debug!("mapped {} bytes of {} at {:p}", len, path.display(), base);
        Ok(Self { file, base, len })
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn register(&self, offset: usize) -> DmaResult<*mut u32> {
        if offset % 4 != 0 || offset.checked_add(4).map_or(true, |end| end > self.len) {
            return Err(DmaError::RegisterAccess {
                offset,
                reason: format!("outside {}-byte window", self.len),
            });
        }
        // SAFETY: bounds and alignment checked above.
        Ok(unsafe { self.base.as_ptr().add(offset).cast::<u32>() })
    }
}

impl RegisterSpace for MmioRegion {
    fn read32(&self, offset: usize) -> DmaResult<u32> {
        let reg = self.register(offset)?;
        // SAFETY: `reg` lies inside the live mapping.
        Ok(unsafe { std::ptr::read_volatile(reg) })
    }

    fn write32(&self, offset: usize, value: u32) -> DmaResult<()> {
        let reg = self.register(offset)?;
        // SAFETY: `reg` lies inside the live mapping.
        unsafe { std::ptr::write_volatile(reg, value) };
        Ok(())
    }

    fn mapped_address(&self, offset: usize) -> Option<NonNull<u32>> {
        self.register(offset).ok().and_then(NonNull::new)
    }
}

impl Drop for MmioRegion {
    fn drop(&mut self) {
        // SAFETY: base/len describe the mapping created in `open`.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

// ============================================================================
// Per-channel view
// ============================================================================

/// The register block of one dispatcher channel.
#[derive(Clone)]
pub struct ChannelRegisters {
    space: Arc<dyn RegisterSpace>,
    base: usize,
}

impl ChannelRegisters {
    pub fn new(space: Arc<dyn RegisterSpace>, base: usize) -> Self {
        Self { space, base }
    }

    /// Channel base offset inside the register window.
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn status(&self) -> DmaResult<StatusFlags> {
        self.space
            .read32(self.base + CSR_STATUS)
            .map(StatusFlags::from_bits_retain)
    }

    /// Acknowledge the pending interrupt (write-one-to-clear).
    #[inline]
    pub fn clear_irq(&self) -> DmaResult<()> {
        self.space
            .write32(self.base + CSR_STATUS, StatusFlags::IRQ.bits())
    }

    pub fn control(&self) -> DmaResult<ControlFlags> {
        self.space
            .read32(self.base + CSR_CONTROL)
            .map(ControlFlags::from_bits_retain)
    }

    pub fn set_control(&self, control: ControlFlags) -> DmaResult<()> {
        self.space.write32(self.base + CSR_CONTROL, control.bits())
    }

    /// Number of descriptors waiting in the read-side FIFO.
    pub fn descriptor_fill_level(&self) -> DmaResult<u16> {
        Ok((self.space.read32(self.base + CSR_FILL_LEVEL)? & 0xFFFF) as u16)
    }

    /// Number of entries waiting in the response FIFO.
    pub fn response_fill_level(&self) -> DmaResult<u16> {
        Ok((self.space.read32(self.base + CSR_RESPONSE_FILL_LEVEL)? & 0xFFFF) as u16)
    }

    /// Write a descriptor to the descriptor port. The control word lands
    /// last, so the go bit commits a fully written descriptor.
    #[inline]
    pub fn write_descriptor(&self, desc: &Descriptor) -> DmaResult<()> {
        self.space
            .write_block(self.base + DESCRIPTOR_OFFSET, &desc.as_words())
    }

    /// Pop the oldest entry from the response FIFO.
    pub fn pop_response(&self) -> DmaResult<Response> {
        let bytes = self.space.read32(self.base + RESPONSE_BYTES)?;
        let status = self.space.read32(self.base + RESPONSE_STATUS)?;
        Ok(Response {
            bytes,
            status: ResponseStatus::from_bits_retain(status),
        })
    }

    /// Reset the dispatcher and wait for it to leave the resetting state.
    ///
    /// The reset drops queued descriptors and responses and leaves the
    /// control register with interrupts masked.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::UnexpectedStatus`] if the dispatcher is still
    /// resetting after `timeout`.
    pub fn reset_dispatcher(&self, timeout: Duration) -> DmaResult<()> {
        self.set_control(ControlFlags::RESET_DISPATCHER)?;
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.status()?;
            if !status.contains(StatusFlags::RESETTING) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DmaError::UnexpectedStatus {
                    status: status.bits(),
                });
            }
            std::thread::yield_now();
        }
    }

    pub fn set_valve(&self, valve: ValveControl) -> DmaResult<()> {
        self.space.write32(self.base + VALVE_CONTROL, valve.bits())
    }

    /// Direct pointer to the control register, for the hot-removal guard.
    pub fn control_address(&self) -> Option<NonNull<u32>> {
        self.space.mapped_address(self.base + CSR_CONTROL)
    }
}

impl std::fmt::Debug for ChannelRegisters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegisters")
            .field("base", &format_args!("{:#x}", self.base))
            .finish()
    }
}
