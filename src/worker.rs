// FPGA msgDMA User-Mode Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! The transfer worker.
//!
//! One thread per channel dequeues [`TransferRecord`]s, turns each into
//! descriptors and waits on the channel interrupt until the transfer is
//! acknowledged, then hands the record to the completion queue.
//!
//! Three staging strategies:
//! - Pool: host bytes go through pinned pool buffers, chunk by chunk,
//!   ping-ponging when the transfer outgrows the pool.
//! - Inline: the caller's [`SmallBuffer`](crate::pool::SmallBuffer) is
//!   already device-visible; one descriptor, no copy.
//! - Device-to-device: no host side; descriptors only.
//!
//! A failure anywhere fails the whole record. If hardware may still
//! reference a staging buffer at that point, the buffer is quarantined.

use crate::chunk::{Chunk, ChunkPlan};
use crate::descriptor::{Descriptor, DescriptorControl, HOST_ADDR_MASK};
use crate::device::ChannelKind;
use crate::error::{DmaError, DmaResult};
use crate::interrupt::{InterruptBridge, WaitOutcome};
use crate::pool::{BufferHandle, BufferPool};
use crate::queue::{Dequeued, EnqueueError, TransferQueue};
use crate::regs::{ControlFlags, ValveControl};
use crate::submit::DescriptorSubmitter;
use crate::transfer::{
    Direction, HandleListCache, RxControl, Staging, TransferMode, TransferRecord,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State shared by a channel and its two worker threads.
pub(crate) struct ChannelShared {
    pub kind: ChannelKind,
    pub submitter: DescriptorSubmitter,
    pub bridge: InterruptBridge,
    pub pool: Arc<BufferPool>,
    pub requests: TransferQueue<TransferRecord>,
    pub completions: TransferQueue<TransferRecord>,
    pub lists: HandleListCache,
    pub irq_timeout: Duration,
    pub wait_budget: Option<Duration>,
    /// How long a dispatcher reset may take.
    pub reset_timeout: Duration,
    /// Set by close; interrupt waits give up at their next timeout.
    pub closing: AtomicBool,
    /// Set when a failed transfer could not be flushed from the hardware.
    pub faulted: AtomicBool,
}

impl ChannelShared {
    /// Bring the dispatcher to a clean state: reset it, drop interrupts
    /// latched before the reset, then unmask interrupts and reopen the
    /// streaming valve.
    pub(crate) fn restart_dispatcher(&self) -> DmaResult<()> {
        let regs = self.submitter.registers();
        regs.reset_dispatcher(self.reset_timeout)?;
        while self.bridge.wait(Duration::ZERO)?.is_signaled() {}
        regs.set_control(ControlFlags::GLOBAL_INTR_EN)?;
        if self.kind.is_streaming() {
            regs.set_valve(ValveControl::EN_DATA_FLOW)?;
        }
        Ok(())
    }

    pub(crate) fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }
}

/// Transfer worker loop. Returns when the request queue is closed.
pub(crate) fn run_transfers(shared: Arc<ChannelShared>) {
    log::debug!("transfer worker started");
    let mut worker = TransferWorker {
        shared: &shared,
        credits: 0,
        submitted: None,
        acked: None,
    };
    while let Dequeued::Item(mut record) = shared.requests.dequeue() {
        worker.execute(&mut record);
        worker.hand_off(record);
    }
    log::debug!("transfer worker stopped");
}

struct TransferWorker<'a> {
    shared: &'a ChannelShared,
    /// Interrupts drained from the eventfd but not yet consumed.
    credits: u64,
    /// Index of the last descriptor submitted for the current transfer.
    submitted: Option<usize>,
    /// Index of the last descriptor known complete.
    acked: Option<usize>,
}

impl TransferWorker<'_> {
    fn execute(&mut self, record: &mut TransferRecord) {
        self.submitted = None;
        self.acked = None;
        if self.shared.is_faulted() {
            record.fail(DmaError::ChannelFaulted);
            return;
        }

        let inline = matches!(record.staging, Staging::Inline(_));
        let result = if inline {
            self.run_inline(record)
        } else if record.direction == Direction::DeviceToDevice {
            self.run_device_copy(record)
        } else {
            self.run_pooled(record)
        };

        if let Err(err) = result {
            log::warn!("transfer {:?} failed: {}", record, err);
            record.fail(err);
            if self.has_unacked() {
                self.quarantine_staging(record);
                self.flush_stranded();
            }
        }
    }

    /// Drop descriptors a failed transfer left queued on the hardware.
    /// Their late interrupts would otherwise acknowledge the next transfer.
    fn flush_stranded(&mut self) {
        self.credits = 0;
        self.submitted = None;
        self.acked = None;
        match self.shared.restart_dispatcher() {
            Ok(()) => log::debug!("dispatcher flushed after failed transfer"),
            Err(e) => {
                log::error!("dispatcher did not recover ({}); channel must be reopened", e);
                self.shared.faulted.store(true, Ordering::Release);
            }
        }
    }

    /// Pass the record to the completion worker.
    fn hand_off(&self, mut record: TransferRecord) {
        loop {
            match self.shared.completions.enqueue(record) {
                Ok(()) => return,
                Err(EnqueueError::Busy(back)) => {
                    record = back;
                    std::thread::yield_now();
                }
                Err(EnqueueError::Closed(back)) => {
                    // Only reachable if the completion side went away first.
                    self.shared.retire(back);
                    return;
                }
            }
        }
    }

    fn has_unacked(&self) -> bool {
        match (self.submitted, self.acked) {
            (Some(s), Some(a)) => s > a,
            (Some(_), None) => true,
            _ => false,
        }
    }

    fn quarantine_staging(&self, record: &mut TransferRecord) {
        match std::mem::replace(&mut record.staging, Staging::Unstaged) {
            Staging::Pool(mut handles) => {
                for handle in handles.drain(..) {
                    if let Err(e) = self.shared.pool.quarantine(handle) {
                        log::error!("quarantining staging buffer: {e}");
                    }
                }
                record.staging = Staging::Pool(handles);
            }
            Staging::Inline(buf) => buf.quarantine(),
            Staging::Unstaged => {}
        }
    }

    fn submit(&mut self, index: usize, desc: &Descriptor) -> DmaResult<()> {
        self.shared.submitter.submit(desc)?;
        self.submitted = Some(index);
        Ok(())
    }

    /// Wait for one interrupt. Acknowledges every descriptor up to the
    /// most recent interrupt-bearing one, `upto`.
    fn await_irq(&mut self, upto: usize) -> DmaResult<()> {
        if self.credits == 0 {
            let started = Instant::now();
            loop {
                match self.shared.bridge.wait(self.shared.irq_timeout)? {
                    WaitOutcome::Signaled(count) => {
                        self.credits += count;
                        break;
                    }
                    WaitOutcome::Timeout => {
                        if self.shared.closing.load(Ordering::Acquire) {
                            return Err(DmaError::ChannelClosed);
                        }
                        if let Some(budget) = self.shared.wait_budget {
                            if started.elapsed() >= budget {
                                log::error!(
                                    "no interrupt for descriptor {} within {:?}",
                                    upto,
                                    budget
                                );
                                return Err(DmaError::Timeout);
                            }
                        }
                    }
                }
            }
        }
        self.credits -= 1;
        self.acked = Some(upto);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Pool-staged host transfers
    // ------------------------------------------------------------------------

    fn run_pooled(&mut self, record: &mut TransferRecord) -> DmaResult<()> {
        let pool = &self.shared.pool;
        let usable = pool.capacity() - pool.quarantined();
        if usable == 0 {
            return Err(DmaError::PoolExhausted);
        }

        let mut plan = ChunkPlan::new(record.len, pool.buffer_size(), usable);
        if record.rx == RxControl::EndOnEop {
            plan = plan.serialized();
        }

        // Handles live in the record from the start so the completion
        // worker returns them whatever happens below.
        let mut handles = self.shared.lists.take();
        let acquired = (0..plan.buffers_needed()).try_for_each(|_| {
            handles.push(pool.acquire()?);
            Ok::<_, DmaError>(())
        });
        record.staging = Staging::Pool(handles);
        acquired?;

        match record.direction {
            Direction::HostToDevice => self.write_from_pool(record, &plan),
            _ => {
                if record.mode == TransferMode::Streaming {
                    self.open_valve(record.rx)?;
                }
                self.read_into_pool(record, &plan)
            }
        }
    }

    /// Arm the stream-to-memory valve for the next transfer. With
    /// end-on-EOP the valve closes behind the packet.
    fn open_valve(&self, rx: RxControl) -> DmaResult<()> {
        let transfer_type = match rx {
            RxControl::EndOnEop => ValveControl::EN_NON_DET_TF,
            RxControl::NoPacket => ValveControl::EN_DET_TF,
        };
        self.shared
            .submitter
            .registers()
            .set_valve(ValveControl::EN_DATA_FLOW | transfer_type)
    }

    fn handles(staging: &mut Staging) -> &mut Vec<BufferHandle> {
        match staging {
            Staging::Pool(handles) => handles,
            _ => unreachable!("pool transfer without pool staging"),
        }
    }

    fn chunk_control(&self, record: &TransferRecord, chunk: &Chunk) -> DescriptorControl {
        let mut control = DescriptorControl::empty();
        if record.mode == TransferMode::Streaming {
            control |= match record.direction {
                Direction::HostToDevice => record.tx.flags_for(chunk.first, chunk.last),
                _ => record.rx.flags(),
            };
        }
        if !chunk.last {
            control |= DescriptorControl::EARLY_DONE_EN;
        }
        if chunk.irq {
            control |= DescriptorControl::TRANSFER_IRQ_EN;
        }
        control
    }

    fn write_from_pool(&mut self, record: &mut TransferRecord, plan: &ChunkPlan) -> DmaResult<()> {
        let pool = self.shared.pool.clone();
        let mut last_irq = None;
        for chunk in plan {
            if chunk.wait_before {
                if let Some(upto) = last_irq {
                    self.await_irq(upto)?;
                }
            }

            let handles = Self::handles(&mut record.staging);
            let handle = &mut handles[chunk.buffer];
            pool.slice_mut(handle)?[..chunk.len]
                .copy_from_slice(&record.data[chunk.offset..chunk.offset + chunk.len]);

            let src = pool.iova(handle)? | HOST_ADDR_MASK;
            let dst = match record.mode {
                TransferMode::MemoryMapped => record.dst + chunk.offset as u64,
                TransferMode::Streaming => 0,
            };
            let desc = Descriptor::new(src, dst, chunk.len as u32, self.chunk_control(record, &chunk));
            self.submit(chunk.index, &desc)?;
            if chunk.irq {
                last_irq = Some(chunk.index);
            }
        }
        if let Some(upto) = last_irq {
            self.await_irq(upto)?;
        }
        record.bytes = record.len;
        Ok(())
    }

    fn read_into_pool(&mut self, record: &mut TransferRecord, plan: &ChunkPlan) -> DmaResult<()> {
        let mut receive = std::mem::take(&mut record.data);
        receive.clear();
        receive.resize(record.len, 0);

        let mut read = ReadBack {
            pending: VecDeque::with_capacity(plan.buffers_needed()),
            received: 0,
            eop: false,
            streaming: record.mode == TransferMode::Streaming,
            end_on_eop: record.rx == RxControl::EndOnEop,
        };
        let result = self.read_chunks(record, plan, &mut read, &mut receive);

        receive.truncate(read.received);
        record.data = receive;
        record.bytes = read.received;
        record.eop_arrived = read.eop;
        result
    }

    fn read_chunks(
        &mut self,
        record: &mut TransferRecord,
        plan: &ChunkPlan,
        read: &mut ReadBack,
        receive: &mut [u8],
    ) -> DmaResult<()> {
        let mut last_irq = None;
        for chunk in plan {
            if chunk.wait_before {
                if let Some(upto) = last_irq {
                    self.await_irq(upto)?;
                    read.collect(self.shared, &record.staging, receive, upto)?;
                }
            }
            if read.finished() {
                return Ok(());
            }

            let handles = Self::handles(&mut record.staging);
            let dst = self.shared.pool.iova(&handles[chunk.buffer])? | HOST_ADDR_MASK;
            let src = match record.mode {
                TransferMode::MemoryMapped => record.src + chunk.offset as u64,
                TransferMode::Streaming => 0,
            };
            let desc = Descriptor::new(src, dst, chunk.len as u32, self.chunk_control(record, &chunk));
            self.submit(chunk.index, &desc)?;
            read.pending.push_back(chunk);
            if chunk.irq {
                last_irq = Some(chunk.index);
            }
        }
        if let Some(upto) = last_irq {
            self.await_irq(upto)?;
            read.collect(self.shared, &record.staging, receive, upto)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Inline and device-to-device transfers
    // ------------------------------------------------------------------------

    fn run_inline(&mut self, record: &mut TransferRecord) -> DmaResult<()> {
        let Staging::Inline(buf) = &record.staging else {
            unreachable!("inline transfer without a small buffer");
        };
        let host = buf.iova() | HOST_ADDR_MASK;
        let single = Chunk {
            index: 0,
            offset: 0,
            len: record.len,
            buffer: 0,
            first: true,
            last: true,
            irq: true,
            wait_before: false,
        };
        let (src, dst) = match (record.direction, record.mode) {
            (Direction::HostToDevice, TransferMode::MemoryMapped) => (host, record.dst),
            (Direction::HostToDevice, TransferMode::Streaming) => (host, 0),
            (_, TransferMode::MemoryMapped) => (record.src, host),
            (_, TransferMode::Streaming) => (0, host),
        };
        if record.direction == Direction::DeviceToHost && record.mode == TransferMode::Streaming {
            self.open_valve(record.rx)?;
        }

        let desc = Descriptor::new(src, dst, record.len as u32, self.chunk_control(record, &single));
        self.submit(0, &desc)?;
        self.await_irq(0)?;

        if self.shared.kind == ChannelKind::StreamToHost {
            let rsp = self.shared.submitter.pop_response()?;
            check_response_error(rsp.error_bits())?;
            record.bytes = rsp.bytes as usize;
            record.eop_arrived = rsp.eop_arrived();
        } else {
            record.bytes = record.len;
        }
        Ok(())
    }

    fn run_device_copy(&mut self, record: &mut TransferRecord) -> DmaResult<()> {
        let step = self.shared.pool.buffer_size();
        let plan = ChunkPlan::new(record.len, step, record.len.div_ceil(step).max(1));
        for chunk in &plan {
            let desc = Descriptor::new(
                record.src + chunk.offset as u64,
                record.dst + chunk.offset as u64,
                chunk.len as u32,
                self.chunk_control(record, &chunk),
            );
            self.submit(chunk.index, &desc)?;
        }
        if let Some(last) = plan.chunk_count().checked_sub(1) {
            self.await_irq(last)?;
        }
        record.bytes = record.len;
        Ok(())
    }
}

fn check_response_error(bits: u8) -> DmaResult<()> {
    if bits == 0 {
        Ok(())
    } else {
        Err(DmaError::UnexpectedStatus {
            status: u32::from(bits),
        })
    }
}

/// Device-to-host chunks waiting to be copied out of their buffers.
struct ReadBack {
    pending: VecDeque<Chunk>,
    received: usize,
    eop: bool,
    streaming: bool,
    end_on_eop: bool,
}

impl ReadBack {
    /// The packet ended and no further chunks should be issued.
    fn finished(&self) -> bool {
        self.eop && self.end_on_eop
    }

    /// Copy out every pending chunk up to and including `upto`.
    fn collect(
        &mut self,
        shared: &ChannelShared,
        staging: &Staging,
        receive: &mut [u8],
        upto: usize,
    ) -> DmaResult<()> {
        let Staging::Pool(handles) = staging else {
            unreachable!("pool read without pool staging");
        };
        while self.pending.front().is_some_and(|c| c.index <= upto) {
            let Some(chunk) = self.pending.pop_front() else {
                break;
            };
            let len = if self.streaming {
                let rsp = shared.submitter.pop_response()?;
                check_response_error(rsp.error_bits())?;
                self.eop |= rsp.eop_arrived();
                (rsp.bytes as usize).min(chunk.len)
            } else {
                chunk.len
            };
            let at = if self.streaming { self.received } else { chunk.offset };
            let src = shared.pool.slice(&handles[chunk.buffer])?;
            receive[at..at + len].copy_from_slice(&src[..len]);
            self.received += len;
            if self.finished() {
                self.pending.clear();
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pinned::HostPinnedAllocator;
    use crate::regs::ChannelRegisters;
    use crate::sim::{SimConfig, SimulatedDevice};
    use crate::transfer::{TransferSpec, TxControl};
    use crate::device::Device;

    fn shared_for(sim: &Arc<SimulatedDevice>, pool_size: usize, buffer_size: usize) -> ChannelShared {
        let device: Arc<dyn Device> = sim.clone();
        let layout = device.channel_layout();
        let regs = ChannelRegisters::new(device.registers(), layout.base);
        regs.set_control(ControlFlags::GLOBAL_INTR_EN).unwrap();
        ChannelShared {
            kind: layout.kind,
            submitter: DescriptorSubmitter::new(regs.clone()),
            bridge: InterruptBridge::new(device, regs),
            pool: Arc::new(
                BufferPool::new(Arc::new(HostPinnedAllocator::new()), pool_size, buffer_size, None).unwrap(),
            ),
            requests: TransferQueue::new(4),
            completions: TransferQueue::new(4),
            lists: HandleListCache::new(4),
            irq_timeout: Duration::from_millis(20),
            wait_budget: Some(Duration::from_secs(5)),
            reset_timeout: Duration::from_secs(1),
            closing: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
        }
    }

    fn execute(shared: &ChannelShared, spec: TransferSpec) -> TransferRecord {
        let mut worker = TransferWorker {
            shared,
            credits: 0,
            submitted: None,
            acked: None,
        };
        let mut record = TransferRecord::new(spec, None, None);
        worker.execute(&mut record);
        record
    }

    fn release(shared: &ChannelShared, record: TransferRecord) {
        if let Staging::Pool(handles) = record.staging {
            handles.into_iter().for_each(|h| shared.pool.release(h).unwrap());
        }
    }

    #[test]
    fn test_ping_pong_write_lands_intact() {
        let sim = SimulatedDevice::new(SimConfig::new(ChannelKind::MemoryMapped)).unwrap();
        let shared = shared_for(&sim, 2, 64);
        let data: Vec<u8> = (0..640u32).map(|i| (i * 7) as u8).collect();

        let record = execute(&shared, TransferSpec::host_to_device(data.clone(), 0x1000));
        assert!(record.error.is_none(), "{:?}", record.error);
        assert_eq!(record.bytes, 640);
        assert_eq!(sim.read_device(0x1000, 640), data);

        let history = sim.history();
        assert_eq!(history.len(), 10);
        let addrs: Vec<_> = history.iter().map(|d| d.write_address()).collect();
        assert!(addrs.windows(2).all(|w| w[0] < w[1]));
        release(&shared, record);
        assert_eq!(shared.pool.available(), 2);
    }

    #[test]
    fn test_early_done_on_all_but_last() {
        let sim = SimulatedDevice::new(SimConfig::new(ChannelKind::MemoryMapped)).unwrap();
        let shared = shared_for(&sim, 4, 64);
        let record = execute(&shared, TransferSpec::host_to_device(vec![1; 200], 0));
        let history = sim.history();
        let (last, rest) = history.split_last().unwrap();
        assert!(rest
            .iter()
            .all(|d| d.control_flags().contains(DescriptorControl::EARLY_DONE_EN)));
        assert!(!last.control_flags().contains(DescriptorControl::EARLY_DONE_EN));
        assert!(last.control_flags().contains(DescriptorControl::TRANSFER_IRQ_EN));
        assert!(history
            .iter()
            .all(|d| d.read_address() & HOST_ADDR_MASK != 0));
        release(&shared, record);
    }

    #[test]
    fn test_read_back_from_device() {
        let sim = SimulatedDevice::new(SimConfig::new(ChannelKind::MemoryMapped)).unwrap();
        let shared = shared_for(&sim, 2, 128);
        let expected: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        sim.write_device(0x4000, &expected);

        let record = execute(&shared, TransferSpec::device_to_host(0x4000, 1000));
        assert!(record.error.is_none(), "{:?}", record.error);
        assert_eq!(record.data, expected);
        release(&shared, record);
    }

    #[test]
    fn test_stream_read_stops_at_eop() {
        let sim = SimulatedDevice::new(SimConfig::new(ChannelKind::StreamToHost)).unwrap();
        let shared = shared_for(&sim, 4, 64);
        sim.push_packet((0..150u8).collect());
        sim.push_packet(vec![0xEE; 64]);

        let record = execute(&shared, TransferSpec::stream_to_host(1024, RxControl::EndOnEop));
        assert!(record.error.is_none(), "{:?}", record.error);
        assert!(record.eop_arrived);
        assert_eq!(record.bytes, 150);
        assert_eq!(record.data, (0..150u8).collect::<Vec<_>>());
        // 64 + 64 + 22: the third descriptor ends on the packet boundary.
        assert_eq!(sim.history().len(), 3);
        release(&shared, record);
    }

    #[test]
    fn test_stream_write_framing() {
        let sim = SimulatedDevice::new(SimConfig::new(ChannelKind::HostToStream)).unwrap();
        let shared = shared_for(&sim, 4, 64);
        let record = execute(
            &shared,
            TransferSpec::host_to_stream(vec![5; 200], TxControl::GenerateSopAndEop),
        );
        assert!(record.error.is_none());
        let flags: Vec<_> = sim.history().iter().map(|d| d.control_flags()).collect();
        assert!(flags[0].contains(DescriptorControl::GENERATE_SOP));
        assert!(flags[1..]
            .iter()
            .all(|f| !f.contains(DescriptorControl::GENERATE_SOP)));
        assert!(flags[3].contains(DescriptorControl::GENERATE_EOP));
        assert!(flags[..3]
            .iter()
            .all(|f| !f.contains(DescriptorControl::GENERATE_EOP)));
        assert_eq!(sim.stream_sink(), (vec![5; 200], 1));
        release(&shared, record);
    }

    #[test]
    fn test_device_copy_is_split() {
        let sim = SimulatedDevice::new(SimConfig::new(ChannelKind::MemoryMapped)).unwrap();
        let shared = shared_for(&sim, 2, 256);
        sim.write_device(0, &[3; 600]);
        let record = execute(&shared, TransferSpec::device_to_device(0, 0x1000, 600));
        assert!(record.error.is_none());
        assert_eq!(sim.history().len(), 3);
        assert_eq!(sim.read_device(0x1000, 600), vec![3; 600]);
        assert_eq!(shared.pool.available(), 2);
    }

    #[test]
    fn test_budget_exhaustion_quarantines_buffers() {
        let sim = SimulatedDevice::new(SimConfig::new(ChannelKind::MemoryMapped)).unwrap();
        sim.set_paused(true);
        let mut shared = shared_for(&sim, 2, 64);
        shared.wait_budget = Some(Duration::from_millis(60));

        let record = execute(&shared, TransferSpec::host_to_device(vec![1; 100], 0));
        assert!(matches!(record.error, Some(DmaError::Timeout)));
        assert_eq!(shared.pool.quarantined(), 2);

        // The stranded descriptors were flushed, not left to run later.
        assert_eq!(sim.resets(), 1);
        assert!(sim.control().contains(ControlFlags::GLOBAL_INTR_EN));
        sim.set_paused(false);
        assert!(sim.wait_idle(Duration::from_secs(1)));
        assert!(sim.history().is_empty());
    }

    #[test]
    fn test_late_interrupt_does_not_complete_next_transfer() {
        let sim = SimulatedDevice::new(
            SimConfig::new(ChannelKind::MemoryMapped).with_latency(Duration::from_millis(150)),
        )
        .unwrap();
        let mut shared = shared_for(&sim, 4, 128);
        shared.wait_budget = Some(Duration::from_millis(50));

        let failed = execute(&shared, TransferSpec::host_to_device(vec![1; 200], 0));
        assert!(matches!(failed.error, Some(DmaError::Timeout)));
        // Outlive the aborted descriptor's latency.
        std::thread::sleep(Duration::from_millis(200));
        assert!(sim.wait_idle(Duration::from_secs(1)));

        let pattern: Vec<u8> = (0..128u32).map(|i| (i / 2) as u8 | 1).collect();
        sim.write_device(0x1000, &pattern);
        shared.wait_budget = Some(Duration::from_secs(5));
        let record = execute(&shared, TransferSpec::device_to_host(0x1000, 128));
        assert!(record.error.is_none(), "{:?}", record.error);
        assert_eq!(record.data, pattern);
        assert_eq!(sim.read_device(0, 200), vec![0; 200]);
        release(&shared, record);
    }
}
