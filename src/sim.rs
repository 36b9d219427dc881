// FPGA msgDMA User-Mode Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Software model of a msgDMA dispatcher channel.
//!
//! [`SimulatedDevice`] implements [`Device`] without hardware: a register
//! file with the dispatcher's layout, a bounded descriptor FIFO drained by
//! a background executor thread, device memory, a packet stream on each
//! side, a response FIFO and an eventfd interrupt.
//!
//! Addresses carrying [`HOST_ADDR_MASK`] are host IOVAs. The simulator
//! pairs with [`HostPinnedAllocator`], whose IOVAs are the buffers'
//! virtual addresses, so it dereferences them directly. Any other address
//! is an offset into device memory.

use crate::descriptor::{Descriptor, DescriptorControl, DESCRIPTOR_WORDS, HOST_ADDR_MASK};
use crate::device::{ChannelKind, ChannelLayout, Device};
use crate::error::{DmaError, DmaResult};
use crate::numa::DeviceLocality;
use crate::pinned::{HostPinnedAllocator, PinnedAllocator};
use crate::regs::{
    ControlFlags, RegisterSpace, ResponseStatus, StatusFlags, CHANNEL_SPAN, CSR_CONTROL,
    CSR_FILL_LEVEL, CSR_RESPONSE_FILL_LEVEL, CSR_STATUS, DESCRIPTOR_OFFSET, RESPONSE_BYTES,
    RESPONSE_STATUS,
};
use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Simulated channel parameters.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub kind: ChannelKind,
    /// Channel base inside the register window.
    pub base: usize,
    /// Descriptor FIFO depth.
    pub fifo_depth: usize,
    /// Time each descriptor takes to execute.
    pub latency: Duration,
    /// Bytes of device memory.
    pub device_memory: usize,
    /// PCI address reported to NUMA placement.
    pub locality: Option<DeviceLocality>,
}

impl SimConfig {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            base: 0,
            fifo_depth: 32,
            latency: Duration::ZERO,
            device_memory: 1 << 20,
            locality: None,
        }
    }

    pub fn with_base(mut self, base: usize) -> Self {
        self.base = base;
        self
    }

    pub fn with_fifo_depth(mut self, depth: usize) -> Self {
        self.fifo_depth = depth.max(1);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_device_memory(mut self, bytes: usize) -> Self {
        self.device_memory = bytes;
        self
    }

    pub fn with_locality(mut self, locality: DeviceLocality) -> Self {
        self.locality = Some(locality);
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct SimResponse {
    bytes: u32,
    status: ResponseStatus,
}

/// Stream source: queued packets and the read position in the front one.
#[derive(Debug, Default)]
struct Source {
    packets: VecDeque<Vec<u8>>,
    cursor: usize,
}

impl Source {
    fn has_data(&self) -> bool {
        !self.packets.is_empty()
    }

    /// Move up to `out.len()` bytes. Returns (bytes, packet_ended).
    fn read(&mut self, out: &mut [u8], end_on_eop: bool) -> (usize, bool) {
        let mut done = 0;
        while done < out.len() {
            let Some(packet) = self.packets.front() else {
                break;
            };
            let n = (packet.len() - self.cursor).min(out.len() - done);
            out[done..done + n].copy_from_slice(&packet[self.cursor..self.cursor + n]);
            done += n;
            self.cursor += n;
            if self.cursor == packet.len() {
                self.packets.pop_front();
                self.cursor = 0;
                if end_on_eop {
                    return (done, true);
                }
            }
        }
        (done, false)
    }
}

#[derive(Debug, Default)]
struct SimState {
    port: [u32; DESCRIPTOR_WORDS],
    pending: VecDeque<Descriptor>,
    responses: VecDeque<SimResponse>,
    device_mem: Vec<u8>,
    sink: Vec<u8>,
    sink_packets: usize,
    source: Source,
    history: Vec<Descriptor>,
    executing: bool,
    overflowed: bool,
    faulted: bool,
    resets: usize,
    shutdown: bool,
    paused: bool,
}

struct SimShared {
    config: SimConfig,
    words: Vec<AtomicU32>,
    irq_pending: AtomicU32,
    state: Mutex<SimState>,
    work: Condvar,
    eventfd: OwnedFd,
}

impl SimShared {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn control(&self) -> ControlFlags {
        ControlFlags::from_bits_retain(self.words[(self.config.base + CSR_CONTROL) / 4].load(Ordering::SeqCst))
    }

    fn status(&self, st: &SimState) -> StatusFlags {
        let depth = self.config.fifo_depth;
        let mut status = StatusFlags::empty();
        if st.pending.is_empty() {
            status |= StatusFlags::DESC_BUF_EMPTY;
        } else {
            status |= StatusFlags::BUSY;
        }
        if st.pending.len() >= depth {
            status |= StatusFlags::DESC_BUF_FULL;
        }
        if st.responses.is_empty() {
            status |= StatusFlags::RSP_BUF_EMPTY;
        }
        if st.responses.len() >= depth {
            status |= StatusFlags::RSP_BUF_FULL;
        }
        if st.overflowed || st.faulted {
            status |= StatusFlags::STOPPED | StatusFlags::STOPPED_ON_ERROR;
        }
        if self.control().contains(ControlFlags::STOP_DISPATCHER) {
            status |= StatusFlags::STOPPED;
        }
        if self.irq_pending.load(Ordering::SeqCst) != 0 {
            status |= StatusFlags::IRQ;
        }
        status
    }

    fn raise_irq(&self) {
        self.irq_pending.store(1, Ordering::SeqCst);
        let one = 1u64;
        // SAFETY: writing eight bytes from a local u64 to our own eventfd.
        let n = unsafe {
            libc::write(
                self.eventfd.as_raw_fd(),
                (&one as *const u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            log::warn!("sim: eventfd write failed: {}", std::io::Error::last_os_error());
        }
    }

    fn out_of_window(&self, offset: usize) -> DmaError {
        DmaError::RegisterAccess {
            offset,
            reason: format!("outside simulated window of {} bytes", self.words.len() * 4),
        }
    }

    /// Copy `len` bytes at a descriptor address out of host or device memory.
    fn load(&self, st: &SimState, addr: u64, len: usize) -> Option<Vec<u8>> {
        if addr & HOST_ADDR_MASK != 0 {
            let ptr = (addr & !HOST_ADDR_MASK) as *const u8;
            // SAFETY: host IOVAs come from HostPinnedAllocator, which maps
            // them one to one, and stay pinned while their descriptor is queued.
            Some(unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec())
        } else {
            let start = usize::try_from(addr).ok()?;
            st.device_mem.get(start..start.checked_add(len)?).map(<[u8]>::to_vec)
        }
    }

    fn store(&self, st: &mut SimState, addr: u64, data: &[u8]) -> bool {
        if addr & HOST_ADDR_MASK != 0 {
            let ptr = (addr & !HOST_ADDR_MASK) as *mut u8;
            // SAFETY: as in `load`; the staging buffer is exclusively
            // reserved for this descriptor until its completion.
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
            true
        } else {
            let Ok(start) = usize::try_from(addr) else {
                return false;
            };
            match start
                .checked_add(data.len())
                .and_then(|end| st.device_mem.get_mut(start..end))
            {
                Some(dst) => {
                    dst.copy_from_slice(data);
                    true
                }
                None => false,
            }
        }
    }

    /// Execute one descriptor. Returns (bytes, eop) or None on a fault.
    fn execute<'a>(
        &'a self,
        mut st: MutexGuard<'a, SimState>,
        desc: &Descriptor,
    ) -> (MutexGuard<'a, SimState>, Option<(usize, bool)>) {
        let ctrl = desc.control_flags();
        let len = desc.len as usize;
        let result = match self.config.kind {
            ChannelKind::MemoryMapped => {
                let data = self.load(&st, desc.read_address(), len);
                match data {
                    Some(data) => self
                        .store(&mut st, desc.write_address(), &data)
                        .then_some((len, false)),
                    None => None,
                }
            }
            ChannelKind::HostToStream => match self.load(&st, desc.read_address(), len) {
                Some(data) => {
                    st.sink.extend_from_slice(&data);
                    if ctrl.contains(DescriptorControl::GENERATE_EOP) {
                        st.sink_packets += 1;
                    }
                    Some((len, false))
                }
                None => None,
            },
            ChannelKind::StreamToHost => {
                let generation = st.resets;
                while !st.source.has_data() && !st.shutdown && st.resets == generation {
                    st = self.work.wait(st).unwrap_or_else(PoisonError::into_inner);
                }
                if st.resets != generation {
                    return (st, None);
                }
                let mut buf = vec![0u8; len];
                let (n, eop) = st
                    .source
                    .read(&mut buf, ctrl.contains(DescriptorControl::END_ON_EOP));
                if self.store(&mut st, desc.write_address(), &buf[..n]) {
                    let mut status = ResponseStatus::empty();
                    if eop {
                        status |= ResponseStatus::EOP_ARRIVED;
                    }
                    st.responses.push_back(SimResponse {
                        bytes: n as u32,
                        status,
                    });
                    Some((n, eop))
                } else {
                    None
                }
            }
        };
        (st, result)
    }

    fn run(self: Arc<Self>) {
        let mut st = self.lock();
        loop {
            while !st.shutdown
                && (st.paused
                    || st.pending.is_empty()
                    || self.control().contains(ControlFlags::STOP_DISPATCHER))
            {
                st = self.work.wait(st).unwrap_or_else(PoisonError::into_inner);
            }
            if st.shutdown {
                break;
            }
            let Some(desc) = st.pending.front().copied() else {
                continue;
            };
            st.executing = true;
            let generation = st.resets;

            if !self.config.latency.is_zero() {
                drop(st);
                std::thread::sleep(self.config.latency);
                st = self.lock();
            }

            // A reset while the descriptor was in flight aborts it.
            let (guard, result) = if st.resets == generation {
                self.execute(st, &desc)
            } else {
                (st, None)
            };
            st = guard;
            if st.shutdown {
                break;
            }
            if st.resets != generation {
                st.executing = false;
                self.work.notify_all();
                continue;
            }
            st.pending.pop_front();
            st.history.push(desc);
            st.executing = false;

            match result {
                Some((_, eop)) => {
                    let ctrl = desc.control_flags();
                    let wants_irq = ctrl.contains(DescriptorControl::TRANSFER_IRQ_EN)
                        || (eop && ctrl.contains(DescriptorControl::EOP_RCVD_IRQ_EN));
                    if wants_irq && self.control().contains(ControlFlags::GLOBAL_INTR_EN) {
                        self.raise_irq();
                    }
                }
                None => {
                    log::warn!("sim: descriptor {:?} faulted", desc);
                    st.faulted = true;
                }
            }
            self.work.notify_all();
        }
    }
}

impl RegisterSpace for SimShared {
    fn read32(&self, offset: usize) -> DmaResult<u32> {
        if offset % 4 != 0 || offset / 4 >= self.words.len() {
            return Err(self.out_of_window(offset));
        }
        let base = self.config.base;
        match offset.checked_sub(base) {
            Some(CSR_STATUS) => {
                let st = self.lock();
                Ok(self.status(&st).bits())
            }
            Some(CSR_FILL_LEVEL) => Ok(self.lock().pending.len() as u32),
            Some(CSR_RESPONSE_FILL_LEVEL) => Ok(self.lock().responses.len() as u32),
            Some(RESPONSE_BYTES) => Ok(self.lock().responses.front().map_or(0, |r| r.bytes)),
            Some(RESPONSE_STATUS) => Ok(self
                .lock()
                .responses
                .pop_front()
                .map_or(0, |r| r.status.bits())),
            _ => Ok(self.words[offset / 4].load(Ordering::SeqCst)),
        }
    }

    fn write32(&self, offset: usize, value: u32) -> DmaResult<()> {
        if offset % 4 != 0 || offset / 4 >= self.words.len() {
            return Err(self.out_of_window(offset));
        }
        let base = self.config.base;
        let rel = offset.checked_sub(base);
        match rel {
            Some(CSR_STATUS) => {
                if value & StatusFlags::IRQ.bits() != 0 {
                    self.irq_pending.store(0, Ordering::SeqCst);
                }
            }
            Some(CSR_CONTROL) => {
                let mut st = self.lock();
                if value & ControlFlags::RESET_DISPATCHER.bits() != 0 {
                    st.pending.clear();
                    st.responses.clear();
                    st.overflowed = false;
                    st.faulted = false;
                    st.resets += 1;
                    self.irq_pending.store(0, Ordering::SeqCst);
                }
                // Reset is self-clearing.
                self.words[offset / 4].store(
                    value & !ControlFlags::RESET_DISPATCHER.bits(),
                    Ordering::SeqCst,
                );
                self.work.notify_all();
            }
            Some(r) if (DESCRIPTOR_OFFSET..DESCRIPTOR_OFFSET + DESCRIPTOR_WORDS * 4).contains(&r) => {
                let word = (r - DESCRIPTOR_OFFSET) / 4;
                let mut st = self.lock();
                st.port[word] = value;
                if word == DESCRIPTOR_WORDS - 1 {
                    let desc = Descriptor::from_words(st.port);
                    if !desc.control_flags().contains(DescriptorControl::GO) {
                        return Ok(());
                    }
                    if st.pending.len() >= self.config.fifo_depth {
                        log::warn!("sim: descriptor FIFO overflow");
                        st.overflowed = true;
                    } else {
                        st.pending.push_back(desc);
                        self.work.notify_all();
                    }
                }
            }
            _ => self.words[offset / 4].store(value, Ordering::SeqCst),
        }
        Ok(())
    }

    fn mapped_address(&self, offset: usize) -> Option<NonNull<u32>> {
        self.words.get(offset / 4).and_then(|w| NonNull::new(w.as_ptr()))
    }
}

/// A software msgDMA channel.
pub struct SimulatedDevice {
    shared: Arc<SimShared>,
    allocator: Arc<HostPinnedAllocator>,
    executor: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedDevice {
    /// Create the device and start its executor thread.
    ///
    /// # Errors
    ///
    /// - [`DmaError::Interrupt`] if the eventfd cannot be created
    /// - [`DmaError::WorkerStart`] if the executor thread cannot be spawned
    pub fn new(config: SimConfig) -> DmaResult<Arc<Self>> {
        // SAFETY: eventfd returns a fresh descriptor or -1.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(DmaError::Interrupt(format!(
                "eventfd: {}",
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: fd was just created and is owned by nobody else.
        let eventfd = unsafe { OwnedFd::from_raw_fd(fd) };

        let words = (0..(config.base + CHANNEL_SPAN) / 4)
            .map(|_| AtomicU32::new(0))
            .collect();
        let device_mem = vec![0u8; config.device_memory];
        let shared = Arc::new(SimShared {
            config,
            words,
            irq_pending: AtomicU32::new(0),
            state: Mutex::new(SimState {
                device_mem,
                ..SimState::default()
            }),
            work: Condvar::new(),
            eventfd,
        });

        let executor = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("msgdma-sim".into())
                .spawn(move || shared.run())
                .map_err(|e| DmaError::WorkerStart(format!("simulator executor: {e}")))?
        };

        Ok(Arc::new(Self {
            shared,
            allocator: Arc::new(HostPinnedAllocator::new()),
            executor: Mutex::new(Some(executor)),
        }))
    }

    /// Raise the channel interrupt as if a descriptor had requested it.
    pub fn raise_interrupt(&self) {
        self.shared.raise_irq();
    }

    /// Stop or resume starting new descriptors.
    pub fn set_paused(&self, paused: bool) {
        self.shared.lock().paused = paused;
        self.shared.work.notify_all();
    }

    /// Every descriptor executed so far, in execution order.
    pub fn history(&self) -> Vec<Descriptor> {
        self.shared.lock().history.clone()
    }

    /// Number of dispatcher resets observed.
    pub fn resets(&self) -> usize {
        self.shared.lock().resets
    }

    /// Read device memory.
    ///
    /// # Panics
    ///
    /// Panics if the range is outside device memory.
    pub fn read_device(&self, offset: usize, len: usize) -> Vec<u8> {
        self.shared.lock().device_mem[offset..offset + len].to_vec()
    }

    /// Write device memory.
    ///
    /// # Panics
    ///
    /// Panics if the range is outside device memory.
    pub fn write_device(&self, offset: usize, data: &[u8]) {
        self.shared.lock().device_mem[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Queue a packet on the device-to-host stream.
    pub fn push_packet(&self, packet: Vec<u8>) {
        if packet.is_empty() {
            return;
        }
        self.shared.lock().source.packets.push_back(packet);
        self.shared.work.notify_all();
    }

    /// Bytes received on the host-to-device stream and the number of
    /// packets closed by end-of-packet.
    pub fn stream_sink(&self) -> (Vec<u8>, usize) {
        let st = self.shared.lock();
        (st.sink.clone(), st.sink_packets)
    }

    /// Current control register value.
    pub fn control(&self) -> ControlFlags {
        self.shared.control()
    }

    /// Wait until the descriptor FIFO is drained.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.lock();
        while !st.pending.is_empty() || st.executing {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            st = self
                .shared
                .work
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

impl Device for SimulatedDevice {
    fn registers(&self) -> Arc<dyn RegisterSpace> {
        self.shared.clone()
    }

    fn channel_layout(&self) -> ChannelLayout {
        ChannelLayout::new(self.shared.config.base, self.shared.config.kind)
    }

    fn interrupt_fd(&self) -> BorrowedFd<'_> {
        self.shared.eventfd.as_fd()
    }

    fn allocator(&self) -> Arc<dyn PinnedAllocator> {
        self.allocator.clone()
    }

    fn locality(&self) -> Option<DeviceLocality> {
        self.shared.config.locality
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.work.notify_all();
        let handle = self
            .executor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDevice")
            .field("config", &self.shared.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::ChannelRegisters;

    fn regs(sim: &Arc<SimulatedDevice>) -> ChannelRegisters {
        ChannelRegisters::new(sim.registers(), sim.channel_layout().base)
    }

    #[test]
    fn test_device_to_device_copy() {
        let sim = SimulatedDevice::new(SimConfig::new(ChannelKind::MemoryMapped)).unwrap();
        sim.write_device(0, b"hello msgdma");
        let regs = regs(&sim);
        regs.write_descriptor(&Descriptor::new(0, 4096, 12, DescriptorControl::empty()))
            .unwrap();
        assert!(sim.wait_idle(Duration::from_secs(2)));
        assert_eq!(sim.read_device(4096, 12), b"hello msgdma");
        assert_eq!(sim.history().len(), 1);
    }

    #[test]
    fn test_irq_only_when_enabled() {
        let sim = SimulatedDevice::new(SimConfig::new(ChannelKind::MemoryMapped)).unwrap();
        let regs = regs(&sim);
        let desc = Descriptor::new(0, 64, 64, DescriptorControl::TRANSFER_IRQ_EN);

        regs.write_descriptor(&desc).unwrap();
        assert!(sim.wait_idle(Duration::from_secs(2)));
        assert!(!regs.status().unwrap().contains(StatusFlags::IRQ));

        regs.set_control(ControlFlags::GLOBAL_INTR_EN).unwrap();
        regs.write_descriptor(&desc).unwrap();
        assert!(sim.wait_idle(Duration::from_secs(2)));
        assert!(regs.status().unwrap().contains(StatusFlags::IRQ));
        regs.clear_irq().unwrap();
        assert!(!regs.status().unwrap().contains(StatusFlags::IRQ));
    }

    #[test]
    fn test_fifo_full_while_paused() {
        let sim = SimulatedDevice::new(SimConfig::new(ChannelKind::MemoryMapped).with_fifo_depth(2)).unwrap();
        sim.set_paused(true);
        let regs = regs(&sim);
        let desc = Descriptor::new(0, 64, 64, DescriptorControl::empty());
        regs.write_descriptor(&desc).unwrap();
        assert!(!regs.status().unwrap().contains(StatusFlags::DESC_BUF_FULL));
        regs.write_descriptor(&desc).unwrap();
        assert!(regs.status().unwrap().contains(StatusFlags::DESC_BUF_FULL));
        assert_eq!(regs.descriptor_fill_level().unwrap(), 2);

        sim.set_paused(false);
        assert!(sim.wait_idle(Duration::from_secs(2)));
        assert!(regs.status().unwrap().contains(StatusFlags::DESC_BUF_EMPTY));
    }

    #[test]
    fn test_stream_to_host_end_on_eop() {
        let sim = SimulatedDevice::new(SimConfig::new(ChannelKind::StreamToHost)).unwrap();
        let alloc = HostPinnedAllocator::new();
        let region = alloc.allocate(4096).unwrap();
        sim.push_packet(vec![7u8; 100]);
        sim.push_packet(vec![9u8; 50]);

        let regs = regs(&sim);
        let desc = Descriptor::new(
            0,
            region.iova() | HOST_ADDR_MASK,
            1024,
            DescriptorControl::END_ON_EOP,
        );
        regs.write_descriptor(&desc).unwrap();
        assert!(sim.wait_idle(Duration::from_secs(2)));

        assert_eq!(regs.response_fill_level().unwrap(), 1);
        let rsp = regs.pop_response().unwrap();
        assert_eq!(rsp.bytes, 100);
        assert!(rsp.eop_arrived());
        // SAFETY: region is live and at least 100 bytes.
        let got = unsafe { std::slice::from_raw_parts(region.as_ptr(), 100) };
        assert!(got.iter().all(|b| *b == 7));
        alloc.release(region);
    }

    #[test]
    fn test_reset_clears_fifo() {
        let sim = SimulatedDevice::new(SimConfig::new(ChannelKind::MemoryMapped)).unwrap();
        sim.set_paused(true);
        let regs = regs(&sim);
        regs.write_descriptor(&Descriptor::new(0, 64, 64, DescriptorControl::empty()))
            .unwrap();
        regs.set_control(ControlFlags::RESET_DISPATCHER).unwrap();
        assert_eq!(regs.descriptor_fill_level().unwrap(), 0);
        assert_eq!(sim.resets(), 1);
        assert!(!sim.control().contains(ControlFlags::RESET_DISPATCHER));
    }

    #[test]
    fn test_out_of_range_device_address_faults() {
        let sim = SimulatedDevice::new(SimConfig::new(ChannelKind::MemoryMapped).with_device_memory(4096)).unwrap();
        let regs = regs(&sim);
        regs.write_descriptor(&Descriptor::new(0, 8192, 64, DescriptorControl::empty()))
            .unwrap();
        assert!(sim.wait_idle(Duration::from_secs(2)));
        assert!(regs.status().unwrap().contains(StatusFlags::STOPPED_ON_ERROR));
    }
}
