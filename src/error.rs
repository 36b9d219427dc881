// FPGA msgDMA User-Mode Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Error types for DMA channel operations.

use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during DMA channel operations.
#[derive(Debug, Error)]
pub enum DmaError {
    /// A device-side address is not aligned to the channel granularity.
    #[error("address {addr:#018x} is not aligned to {align} bytes")]
    Misaligned { addr: u64, align: usize },

    /// A single descriptor would carry more bytes than the hardware length field holds.
    #[error("descriptor length {len} exceeds the maximum of {max} bytes")]
    OversizedDescriptor { len: usize, max: usize },

    /// Channel configuration rejected before touching hardware.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid argument provided.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Transfer queue is at capacity; retry later.
    #[error("transfer queue full")]
    QueueFull,

    /// No free buffer in the pool.
    #[error("buffer pool exhausted")]
    PoolExhausted,

    /// Register read or write failed; the device mapping is gone.
    #[error("register access failed at offset {offset:#06x}: {reason}")]
    RegisterAccess { offset: usize, reason: String },

    /// The channel reported a status the engine cannot continue from.
    #[error("unexpected channel status {status:#010x}")]
    UnexpectedStatus { status: u32 },

    /// Waiting on the interrupt source failed.
    #[error("interrupt wait failed: {0}")]
    Interrupt(String),

    /// Could not determine the NUMA placement of the device.
    #[error("device topology lookup failed: {0}")]
    TopologyLookup(String),

    /// Could not bind CPU or memory affinity.
    #[error("NUMA affinity binding failed: {0}")]
    AffinityBinding(String),

    /// Could not pin or map a buffer for device access.
    #[error("pinning {len} bytes failed: {reason}")]
    PinFailed { len: usize, reason: String },

    /// The channel has been closed.
    #[error("channel closed")]
    ChannelClosed,

    /// Descriptors left behind by a failed transfer could not be flushed;
    /// the channel must be reopened.
    #[error("channel faulted and must be reopened")]
    ChannelFaulted,

    /// A worker thread did not start.
    #[error("worker thread failed to start: {0}")]
    WorkerStart(String),

    /// Installing or restoring the hot-removal signal handler failed.
    #[error("signal handler error: {0}")]
    SignalHandler(String),

    /// The interrupt wait budget was exhausted.
    #[error("timed out waiting for transfer completion")]
    Timeout,

    /// A transfer failed; carries the cause reported on the completion path.
    #[error("transfer failed: {0}")]
    TransferFailed(Arc<DmaError>),

    /// I/O error from system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Memory mapping failed.
    #[error("mmap failed: {0}")]
    MmapFailed(String),

    /// Permission denied opening a device node.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl DmaError {
    /// Returns true for resource-exhaustion outcomes the caller may retry.
    #[inline]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::QueueFull | Self::PoolExhausted)
    }

    /// Returns true if the channel must be closed and reopened to recover.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::RegisterAccess { .. }
            | Self::UnexpectedStatus { .. }
            | Self::Interrupt(_)
            | Self::ChannelFaulted => true,
            Self::TransferFailed(inner) => inner.is_fatal(),
            _ => false,
        }
    }
}

/// Result type alias for DMA operations.
pub type DmaResult<T> = Result<T, DmaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_classification() {
        assert!(DmaError::QueueFull.is_busy());
        assert!(DmaError::PoolExhausted.is_busy());
        assert!(!DmaError::ChannelClosed.is_busy());
    }

    #[test]
    fn test_fatal_classification() {
        let err = DmaError::RegisterAccess {
            offset: 0x40,
            reason: "unmapped".into(),
        };
        assert!(err.is_fatal());
        assert!(DmaError::TransferFailed(Arc::new(err)).is_fatal());
        assert!(!DmaError::Misaligned { addr: 3, align: 64 }.is_fatal());
        assert!(DmaError::ChannelFaulted.is_fatal());
    }

    #[test]
    fn test_display() {
        let err = DmaError::Misaligned {
            addr: 0x1001,
            align: 64,
        };
        assert_eq!(
            err.to_string(),
            "address 0x0000000000001001 is not aligned to 64 bytes"
        );
    }
}
