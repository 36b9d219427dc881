// FPGA msgDMA User-Mode Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! The completion worker: retires finished transfers.

use crate::queue::Dequeued;
use crate::transfer::{Staging, TransferRecord};
use crate::worker::ChannelShared;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Completion worker loop. Returns when the completion queue is closed.
pub(crate) fn run_completions(shared: Arc<ChannelShared>) {
    log::debug!("completion worker started");
    while let Dequeued::Item(record) = shared.completions.dequeue() {
        shared.retire(record);
    }
    log::debug!("completion worker stopped");
}

impl ChannelShared {
    /// Deliver a record's outcome, then return its staging buffers.
    ///
    /// The callback runs before any buffer is released.
    pub(crate) fn retire(&self, mut record: TransferRecord) {
        let outcome = record.take_outcome();
        let signal = record.signal.take();

        match record.callback.take() {
            Some(callback) => {
                let summary = signal.as_ref().map(|_| outcome.summary());
                if catch_unwind(AssertUnwindSafe(move || callback(outcome))).is_err() {
                    log::error!("completion callback panicked");
                }
                if let (Some(signal), Some(summary)) = (signal, summary) {
                    signal.complete(summary);
                }
            }
            None => {
                if let Some(signal) = signal {
                    signal.complete(outcome);
                }
            }
        }

        if let Staging::Pool(mut handles) = std::mem::replace(&mut record.staging, Staging::Unstaged) {
            for handle in handles.drain(..) {
                if let Err(e) = self.pool.release(handle) {
                    log::error!("releasing staging buffer: {e}");
                }
            }
            self.lists.put(handles);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ChannelKind, Device};
    use crate::error::DmaError;
    use crate::interrupt::InterruptBridge;
    use crate::pinned::HostPinnedAllocator;
    use crate::pool::BufferPool;
    use crate::queue::TransferQueue;
    use crate::regs::ChannelRegisters;
    use crate::sim::{SimConfig, SimulatedDevice};
    use crate::submit::DescriptorSubmitter;
    use crate::transfer::{CompletionSignal, HandleListCache, TransferOutcome, TransferSpec};
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use std::time::Duration;

    fn shared() -> (Arc<SimulatedDevice>, ChannelShared) {
        let sim = SimulatedDevice::new(SimConfig::new(ChannelKind::MemoryMapped)).unwrap();
        let device: Arc<dyn Device> = sim.clone();
        let regs = ChannelRegisters::new(device.registers(), 0);
        let shared = ChannelShared {
            kind: ChannelKind::MemoryMapped,
            submitter: DescriptorSubmitter::new(regs.clone()),
            bridge: InterruptBridge::new(device, regs),
            pool: Arc::new(BufferPool::new(Arc::new(HostPinnedAllocator::new()), 2, 64, None).unwrap()),
            requests: TransferQueue::new(2),
            completions: TransferQueue::new(2),
            lists: HandleListCache::new(2),
            irq_timeout: Duration::from_millis(10),
            wait_budget: None,
            reset_timeout: Duration::from_secs(1),
            closing: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
        };
        (sim, shared)
    }

    fn staged(shared: &ChannelShared, callback: Option<crate::transfer::Callback>) -> (TransferRecord, Arc<CompletionSignal>) {
        let signal = Arc::new(CompletionSignal::new());
        let mut record = TransferRecord::new(
            TransferSpec::device_to_host(0, 64),
            callback,
            Some(signal.clone()),
        );
        let handle = shared.pool.acquire().unwrap();
        record.staging = Staging::Pool(vec![handle]);
        record.data = vec![9; 64];
        record.bytes = 64;
        (record, signal)
    }

    #[test]
    fn test_callback_sees_buffers_still_checked_out() {
        let (_sim, shared) = shared();
        let shared = Arc::new(shared);
        let seen = Arc::new(Mutex::new(None));
        let (record, signal) = {
            let seen = seen.clone();
            let pool = shared.pool.clone();
            staged(
                &shared,
                Some(Box::new(move |outcome: TransferOutcome| {
                    *seen.lock().unwrap() = Some((outcome.data.len(), pool.available()));
                })),
            )
        };

        shared.retire(record);
        assert_eq!(*seen.lock().unwrap(), Some((64, 1)));
        assert_eq!(shared.pool.available(), 2);

        // The synchronous waiter still gets the status, without the data.
        let summary = signal.wait_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(summary.bytes, 64);
        assert!(summary.data.is_empty());
    }

    #[test]
    fn test_sync_waiter_gets_data() {
        let (_sim, shared) = shared();
        let (record, signal) = staged(&shared, None);
        shared.retire(record);
        let outcome = signal.wait_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(outcome.data, vec![9; 64]);
        assert_eq!(shared.pool.available(), 2);
    }

    #[test]
    fn test_panicking_callback_still_releases() {
        let (_sim, shared) = shared();
        let (mut record, _signal) = staged(&shared, Some(Box::new(|_: TransferOutcome| panic!("boom"))));
        record.fail(DmaError::Timeout);
        shared.retire(record);
        assert_eq!(shared.pool.available(), 2);
    }

    #[test]
    fn test_worker_exits_on_close() {
        let (_sim, shared) = shared();
        let shared = Arc::new(shared);
        let (record, signal) = staged(&shared, None);
        shared.completions.enqueue(record).unwrap();
        shared.completions.close();

        let worker = {
            let shared = shared.clone();
            std::thread::spawn(move || run_completions(shared))
        };
        worker.join().unwrap();
        assert!(signal.wait_timeout(Duration::from_secs(1)).is_some());
        assert_eq!(shared.pool.available(), 2);
    }
}
