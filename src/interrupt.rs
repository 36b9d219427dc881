// FPGA msgDMA User-Mode Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Bounded waits on a channel's interrupt notification.
//!
//! The device exposes its interrupt as a pollable file descriptor (an
//! eventfd registered with the driver). A successful wait drains the
//! eventfd counter and acknowledges the interrupt in the channel status
//! register before returning, so the hardware can raise the next one.

use crate::device::Device;
use crate::error::{DmaError, DmaResult};
use crate::regs::ChannelRegisters;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

/// Result of one bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The channel raised an interrupt; carries the eventfd count drained.
    Signaled(u64),
    /// Nothing arrived within the timeout.
    Timeout,
}

impl WaitOutcome {
    #[inline]
    pub fn is_signaled(&self) -> bool {
        matches!(self, Self::Signaled(_))
    }
}

/// Waits on a channel's interrupt source.
#[derive(Clone)]
pub struct InterruptBridge {
    device: Arc<dyn Device>,
    regs: ChannelRegisters,
}

impl InterruptBridge {
    pub fn new(device: Arc<dyn Device>, regs: ChannelRegisters) -> Self {
        Self { device, regs }
    }

    /// Block for at most `timeout` waiting for the channel interrupt.
    ///
    /// A timeout is an ordinary outcome. Events that arrive after a timed
    /// out call stay latched in the eventfd and are reported by the next
    /// call.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::Interrupt`] if polling or reading the eventfd
    /// fails, or a register error if the acknowledgment write fails.
    pub fn wait(&self, timeout: Duration) -> DmaResult<WaitOutcome> {
        let fd = self.device.interrupt_fd().as_raw_fd();
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

        // SAFETY: pfd is a valid pollfd for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(WaitOutcome::Timeout);
            }
            return Err(DmaError::Interrupt(format!("poll failed: {err}")));
        }
        if rc == 0 {
            log::debug!("interrupt wait timed out after {:?}", timeout);
            return Ok(WaitOutcome::Timeout);
        }
        if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            return Err(DmaError::Interrupt(format!(
                "poll reported revents {:#x}",
                pfd.revents
            )));
        }

        let mut count = 0u64;
        // SAFETY: reading exactly eight bytes into a local u64.
        let n = unsafe {
            libc::read(
                fd,
                (&mut count as *mut u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                // Another reader drained the counter first.
                return Ok(WaitOutcome::Timeout);
            }
            return Err(DmaError::Interrupt(format!("eventfd read failed: {err}")));
        }
        if n as usize != std::mem::size_of::<u64>() {
            return Err(DmaError::Interrupt(format!("short eventfd read of {n} bytes")));
        }

        self.regs.clear_irq()?;
        Ok(WaitOutcome::Signaled(count))
    }

    /// Wait for one interrupt, retrying timeouts until `budget` is spent.
    ///
    /// With no budget, waits indefinitely.
    pub fn wait_with_budget(&self, timeout: Duration, budget: Option<Duration>) -> DmaResult<u64> {
        let started = std::time::Instant::now();
        loop {
            match self.wait(timeout)? {
                WaitOutcome::Signaled(count) => return Ok(count),
                WaitOutcome::Timeout => {
                    if let Some(budget) = budget {
                        if started.elapsed() >= budget {
                            return Err(DmaError::Timeout);
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for InterruptBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptBridge")
            .field("regs", &self.regs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ChannelKind;
    use crate::regs::StatusFlags;
    use crate::sim::{SimConfig, SimulatedDevice};

    fn bridge(sim: &Arc<SimulatedDevice>) -> InterruptBridge {
        let device: Arc<dyn Device> = sim.clone();
        let regs = ChannelRegisters::new(device.registers(), device.channel_layout().base);
        InterruptBridge::new(device, regs)
    }

    #[test]
    fn test_wait_times_out_without_event() {
        let sim = SimulatedDevice::new(SimConfig::new(ChannelKind::MemoryMapped)).unwrap();
        let outcome = bridge(&sim).wait(Duration::from_millis(10)).unwrap();
        assert_eq!(outcome, WaitOutcome::Timeout);
    }

    #[test]
    fn test_signal_clears_irq_bit() {
        let sim = SimulatedDevice::new(SimConfig::new(ChannelKind::MemoryMapped)).unwrap();
        sim.raise_interrupt();
        let bridge = bridge(&sim);

        let outcome = bridge.wait(Duration::from_millis(100)).unwrap();
        assert_eq!(outcome, WaitOutcome::Signaled(1));
        let status = ChannelRegisters::new(sim.registers(), 0).status().unwrap();
        assert!(!status.contains(StatusFlags::IRQ));
    }

    #[test]
    fn test_late_event_is_not_lost() {
        let sim = SimulatedDevice::new(SimConfig::new(ChannelKind::MemoryMapped)).unwrap();
        let bridge = bridge(&sim);

        let raiser = {
            let sim = sim.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                sim.raise_interrupt();
            })
        };

        assert_eq!(
            bridge.wait(Duration::from_millis(1)).unwrap(),
            WaitOutcome::Timeout
        );
        raiser.join().unwrap();
        assert!(bridge.wait(Duration::from_secs(2)).unwrap().is_signaled());
    }

    #[test]
    fn test_budget_exhaustion() {
        let sim = SimulatedDevice::new(SimConfig::new(ChannelKind::MemoryMapped)).unwrap();
        let err = bridge(&sim)
            .wait_with_budget(Duration::from_millis(5), Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, DmaError::Timeout));
    }
}
