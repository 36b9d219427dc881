// FPGA msgDMA User-Mode Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Descriptor submission against the dispatcher's descriptor port.
//!
//! # Backpressure
//!
//! The dispatcher exposes a small descriptor FIFO. Before each write the
//! submitter spins on the status register until `DESC_BUF_FULL` clears.
//! The spin deliberately does not yield: the FIFO drains in hardware
//! time (a handful of bus transactions), and parking the thread would
//! add scheduler latency to every descriptor on the hot path.
//!
//! The spin is bounded by [`DEFAULT_SPIN_LIMIT`] status reads. Exceeding it
//! means the dispatcher stopped draining, which is a channel failure.

use crate::descriptor::Descriptor;
use crate::error::{DmaError, DmaResult};
use crate::regs::{ChannelRegisters, StatusFlags};

/// Default maximum status reads while the descriptor FIFO is full.
///
/// One MMIO read is roughly a microsecond on PCIe, so this bounds the spin
/// at several seconds of a wedged dispatcher.
pub const DEFAULT_SPIN_LIMIT: u32 = 4_000_000;

/// Status bits that mean the dispatcher will never drain.
const HALTED: StatusFlags = StatusFlags::STOPPED
    .union(StatusFlags::STOPPED_ON_ERROR)
    .union(StatusFlags::RESETTING);

/// Writes descriptors to one channel, honoring descriptor-FIFO backpressure.
#[derive(Debug, Clone)]
pub struct DescriptorSubmitter {
    regs: ChannelRegisters,
    spin_limit: u32,
}

impl DescriptorSubmitter {
    pub fn new(regs: ChannelRegisters) -> Self {
        Self {
            regs,
            spin_limit: DEFAULT_SPIN_LIMIT,
        }
    }

    /// Set the maximum number of status reads spent waiting for FIFO space.
    pub fn with_spin_limit(mut self, spin_limit: u32) -> Self {
        self.spin_limit = spin_limit.max(1);
        self
    }

    pub fn registers(&self) -> &ChannelRegisters {
        &self.regs
    }

    /// Submit one descriptor.
    ///
    /// # Errors
    ///
    /// - Register access failures are propagated unchanged; they mean the
    ///   device mapping is gone and the channel must be reopened.
    /// - [`DmaError::UnexpectedStatus`] if the dispatcher is stopped or the
    ///   FIFO stays full past the spin limit.
    #[inline]
    pub fn submit(&self, desc: &Descriptor) -> DmaResult<()> {
        self.wait_for_space()?;
        self.regs.write_descriptor(desc)
    }

    fn wait_for_space(&self) -> DmaResult<()> {
        let mut status = self.regs.status()?;
        let mut spins = 0u32;
        while status.contains(StatusFlags::DESC_BUF_FULL) {
            if status.intersects(HALTED) || spins >= self.spin_limit {
                return Err(DmaError::UnexpectedStatus {
                    status: status.bits(),
                });
            }
            spins += 1;
            core::hint::spin_loop();
            status = self.regs.status()?;
        }
        if status.intersects(StatusFlags::STOPPED | StatusFlags::STOPPED_ON_ERROR) {
            return Err(DmaError::UnexpectedStatus {
                status: status.bits(),
            });
        }
        Ok(())
    }

    /// Pop the oldest response-FIFO entry.
    pub fn pop_response(&self) -> DmaResult<crate::regs::Response> {
        self.regs.pop_response()
    }
}
