// FPGA msgDMA User-Mode Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! High-level channel API.

use crate::completion::run_completions;
use crate::device::{ChannelKind, Device};
use crate::error::{DmaError, DmaResult};
use crate::hotplug::HotRemovalGuard;
use crate::interrupt::InterruptBridge;
use crate::numa::{NumaBinding, SysfsTopology, Topology};
use crate::pool::{BufferPool, SmallBuffer};
use crate::queue::{EnqueueError, TransferQueue};
use crate::regs::{ChannelRegisters, ControlFlags};
use crate::submit::DescriptorSubmitter;
use crate::transfer::{
    CompletionSignal, HandleListCache, TransferOutcome, TransferRecord, TransferSpec,
};
use crate::worker::{run_transfers, ChannelShared};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Where channel buffers and workers are placed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NumaPolicy {
    /// Leave placement to the OS.
    Disabled,
    /// Look up the device's node in sysfs.
    #[default]
    Device,
    /// Use the given binding.
    Explicit(NumaBinding),
}

/// Channel construction parameters.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Buffers in the staging pool.
    pub pool_size: usize,
    /// Bytes per staging buffer; also the largest descriptor issued.
    pub buffer_size: usize,
    /// Capacity of the request and completion queues.
    pub queue_depth: usize,
    /// Caller-writable inline buffers, in a pool of their own.
    pub small_buffers: usize,
    pub small_buffer_size: usize,
    /// Timeout of a single interrupt wait.
    pub irq_timeout: Duration,
    /// Total time to wait for one interrupt before failing the transfer.
    /// `None` waits indefinitely.
    pub wait_budget: Option<Duration>,
    pub numa: NumaPolicy,
    /// Install the `SIGHUP` device-removal guard while open.
    pub hot_removal_guard: bool,
    /// How long open waits for each worker thread to come up.
    pub startup_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            buffer_size: 1 << 20,
            queue_depth: 1024,
            small_buffers: 4,
            small_buffer_size: 4096,
            irq_timeout: Duration::from_secs(1),
            wait_budget: None,
            numa: NumaPolicy::Device,
            hot_removal_guard: true,
            startup_timeout: Duration::from_secs(1),
        }
    }
}

impl ChannelConfig {
    pub fn with_pool(mut self, pool_size: usize, buffer_size: usize) -> Self {
        self.pool_size = pool_size;
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn with_small_buffers(mut self, count: usize, size: usize) -> Self {
        self.small_buffers = count;
        self.small_buffer_size = size;
        self
    }

    pub fn with_irq_timeout(mut self, timeout: Duration) -> Self {
        self.irq_timeout = timeout;
        self
    }

    pub fn with_wait_budget(mut self, budget: Option<Duration>) -> Self {
        self.wait_budget = budget;
        self
    }

    pub fn with_numa(mut self, numa: NumaPolicy) -> Self {
        self.numa = numa;
        self
    }

    pub fn with_hot_removal_guard(mut self, enabled: bool) -> Self {
        self.hot_removal_guard = enabled;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Check the configuration without touching hardware.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::InvalidConfig`] describing the first bad field.
    pub fn validate(&self) -> DmaResult<()> {
        fn buffer_ok(what: &str, size: usize) -> DmaResult<()> {
            if size == 0 || size % crate::descriptor::DMA_ALIGN_BYTES != 0 {
                return Err(DmaError::InvalidConfig(format!(
                    "{what} of {size} bytes is not a non-zero multiple of {}",
                    crate::descriptor::DMA_ALIGN_BYTES
                )));
            }
            if size > crate::descriptor::MAX_DESCRIPTOR_LEN {
                return Err(DmaError::InvalidConfig(format!(
                    "{what} of {size} bytes exceeds one descriptor"
                )));
            }
            Ok(())
        }

        if self.pool_size == 0 {
            return Err(DmaError::InvalidConfig("pool_size must be non-zero".into()));
        }
        buffer_ok("buffer_size", self.buffer_size)?;
        if self.small_buffers > 0 {
            buffer_ok("small_buffer_size", self.small_buffer_size)?;
        }
        if self.queue_depth == 0 {
            return Err(DmaError::InvalidConfig("queue_depth must be non-zero".into()));
        }
        if self.irq_timeout.is_zero() || self.startup_timeout.is_zero() {
            return Err(DmaError::InvalidConfig("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

/// An open DMA channel with its transfer and completion workers.
///
/// # Example
///
/// ```rust,no_run
/// use fpga_dma::{open_channel, DmaError, SimConfig, SimulatedDevice, TransferSpec, ChannelKind};
///
/// fn main() -> Result<(), DmaError> {
///     let device = SimulatedDevice::new(SimConfig::new(ChannelKind::MemoryMapped))?;
///     let channel = open_channel(device, 4, 64 * 1024)?;
///
///     let outcome = channel.submit_sync(TransferSpec::host_to_device(vec![0xAB; 3000], 0x1000))?;
///     println!("moved {} bytes", outcome.bytes);
///     Ok(())
/// }
/// ```
pub struct Channel {
    kind: ChannelKind,
    /// Taken by close, which releases the pools with it.
    shared: RwLock<Option<Arc<ChannelShared>>>,
    small_pool: Mutex<Option<Arc<BufferPool>>>,
    regs: ChannelRegisters,
    workers: Mutex<Vec<JoinHandle<()>>>,
    guard: Mutex<Option<HotRemovalGuard>>,
    _device: Arc<dyn Device>,
}

/// Open a channel with default settings and the given pool geometry.
///
/// # Errors
///
/// See [`Channel::open`].
pub fn open_channel(device: Arc<dyn Device>, pool_size: usize, buffer_size: usize) -> DmaResult<Channel> {
    Channel::open(device, ChannelConfig::default().with_pool(pool_size, buffer_size))
}

impl Channel {
    /// Open a channel on `device`, resolving NUMA placement from sysfs.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - An explicit NUMA binding cannot be applied
    /// - Buffers cannot be pinned
    /// - The dispatcher does not come out of reset
    /// - A worker thread fails to start
    pub fn open(device: Arc<dyn Device>, config: ChannelConfig) -> DmaResult<Self> {
        Self::open_with_topology(device, config, &SysfsTopology::default())
    }

    /// Like [`open`](Self::open) with a caller-supplied topology source.
    pub fn open_with_topology(
        device: Arc<dyn Device>,
        config: ChannelConfig,
        topology: &dyn Topology,
    ) -> DmaResult<Self> {
        config.validate()?;
        let layout = device.channel_layout();
        let binding = resolve_binding(device.as_ref(), &config.numa, topology);

        let allocator = device.allocator();
        let pool = Arc::new(BufferPool::new(
            allocator.clone(),
            config.pool_size,
            config.buffer_size,
            binding.as_ref(),
        )?);
        let small_pool = if config.small_buffers > 0 {
            Some(Arc::new(BufferPool::new(
                allocator,
                config.small_buffers,
                config.small_buffer_size,
                binding.as_ref(),
            )?))
        } else {
            None
        };

        let regs = ChannelRegisters::new(device.registers(), layout.base);
        let shared = Arc::new(ChannelShared {
            kind: layout.kind,
            submitter: DescriptorSubmitter::new(regs.clone()),
            bridge: InterruptBridge::new(device.clone(), regs.clone()),
            pool,
            requests: TransferQueue::new(config.queue_depth),
            completions: TransferQueue::new(config.queue_depth),
            lists: HandleListCache::new(config.queue_depth.min(64)),
            irq_timeout: config.irq_timeout,
            wait_budget: config.wait_budget,
            reset_timeout: config.startup_timeout,
            closing: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
        });
        shared.restart_dispatcher()?;

        let mut workers = Vec::with_capacity(2);
        let started = spawn_worker("dma-transfer", &binding, config.startup_timeout, {
            let shared = shared.clone();
            move || run_transfers(shared)
        })
        .and_then(|transfer| {
            workers.push(transfer);
            spawn_worker("dma-completion", &binding, config.startup_timeout, {
                let shared = shared.clone();
                move || run_completions(shared)
            })
        });
        match started {
            Ok(completion) => workers.push(completion),
            Err(e) => {
                shared.requests.close();
                shared.completions.close();
                for worker in workers {
                    let _ = worker.join();
                }
                let _ = regs.set_control(ControlFlags::empty());
                return Err(e);
            }
        }

        let guard = if config.hot_removal_guard {
            match HotRemovalGuard::install(&regs) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    log::warn!("channel at {:#x} runs without removal guard: {}", layout.base, e);
                    None
                }
            }
        } else {
            None
        };

        log::info!(
            "opened {:?} channel at {:#x}: {} x {} byte buffers, queue depth {}",
            layout.kind,
            layout.base,
            config.pool_size,
            config.buffer_size,
            config.queue_depth
        );
        Ok(Self {
            kind: layout.kind,
            shared: RwLock::new(Some(shared)),
            small_pool: Mutex::new(small_pool),
            regs,
            workers: Mutex::new(workers),
            guard: Mutex::new(guard),
            _device: device,
        })
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn shared(&self) -> Option<Arc<ChannelShared>> {
        self.shared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Staging buffers not currently checked out. Zero once closed.
    pub fn available_buffers(&self) -> usize {
        self.shared().map_or(0, |shared| shared.pool.available())
    }

    /// Staging buffers withdrawn after unacknowledged failures.
    pub fn quarantined_buffers(&self) -> usize {
        self.shared().map_or(0, |shared| shared.pool.quarantined())
    }

    pub fn is_closed(&self) -> bool {
        self.shared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// True after a failed transfer left the hardware in a state it could
    /// not be reset from. Every later submission fails until the channel
    /// is reopened.
    pub fn is_faulted(&self) -> bool {
        self.shared().is_some_and(|shared| shared.is_faulted())
    }

    /// Borrow a device-visible inline buffer.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::PoolExhausted`] if none is free and
    /// [`DmaError::ChannelClosed`] after close.
    pub fn small_buffer(&self) -> DmaResult<SmallBuffer> {
        if self.is_closed() {
            return Err(DmaError::ChannelClosed);
        }
        match &*self.small_pool.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(pool) => SmallBuffer::take(pool),
            None => Err(DmaError::PoolExhausted),
        }
    }

    fn enqueue(&self, spec: TransferSpec, record: impl FnOnce(TransferSpec) -> TransferRecord) -> DmaResult<()> {
        // Held across the enqueue so close cannot drain in between.
        let shared = self.shared.read().unwrap_or_else(PoisonError::into_inner);
        let Some(shared) = shared.as_ref() else {
            return Err(DmaError::ChannelClosed);
        };
        if shared.is_faulted() {
            return Err(DmaError::ChannelFaulted);
        }
        spec.validate(self.kind)?;
        match shared.requests.enqueue(record(spec)) {
            Ok(()) => Ok(()),
            Err(EnqueueError::Busy(_)) => Err(DmaError::QueueFull),
            Err(EnqueueError::Closed(_)) => Err(DmaError::ChannelClosed),
        }
    }

    /// Queue a transfer and block until it completes.
    ///
    /// # Errors
    ///
    /// - Configuration errors, [`DmaError::QueueFull`] and
    ///   [`DmaError::ChannelClosed`] are returned before anything is queued
    /// - [`DmaError::TransferFailed`] wraps a failure during the transfer
    pub fn submit_sync(&self, spec: TransferSpec) -> DmaResult<TransferOutcome> {
        let signal = Arc::new(CompletionSignal::new());
        self.enqueue(spec, |spec| TransferRecord::new(spec, None, Some(signal.clone())))?;
        signal.wait().into_result()
    }

    /// Queue a transfer; `callback` runs on the completion worker when it
    /// finishes, successfully or not.
    ///
    /// The callback is dropped without running if the channel closes
    /// before the transfer starts.
    ///
    /// # Errors
    ///
    /// Configuration errors, [`DmaError::QueueFull`] and
    /// [`DmaError::ChannelClosed`]; the callback is not invoked.
    pub fn submit_async<F>(&self, spec: TransferSpec, callback: F) -> DmaResult<()>
    where
        F: FnOnce(TransferOutcome) + Send + 'static,
    {
        self.enqueue(spec, |spec| TransferRecord::new(spec, Some(Box::new(callback)), None))
    }

    /// Queue a transfer and await its completion.
    #[cfg(feature = "tokio")]
    pub async fn submit(&self, spec: TransferSpec) -> DmaResult<TransferOutcome> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.submit_async(spec, move |outcome| {
            let _ = tx.send(outcome);
        })?;
        match rx.await {
            Ok(outcome) => outcome.into_result(),
            Err(_) => Err(DmaError::ChannelClosed),
        }
    }

    /// Shut the channel down and release its pinned pools.
    ///
    /// Queued transfers are discarded without their callbacks. A transfer
    /// already on the hardware is finished, or abandoned at the next
    /// interrupt timeout. Inline buffers still held by the caller keep
    /// their own pool alive until they are dropped. Closing twice is a
    /// no-op.
    pub fn close(&self) {
        let Some(shared) = self
            .shared
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let discarded = shared.requests.drain();
        if !discarded.is_empty() {
            log::debug!("discarding {} queued transfers", discarded.len());
        }
        discarded.into_iter().for_each(TransferRecord::discard);

        shared.closing.store(true, Ordering::Release);
        shared.requests.close();
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut workers = workers.drain(..);
        // Completions stay open until the transfer worker has handed off
        // its last record.
        if let Some(transfer) = workers.next() {
            let _ = transfer.join();
        }
        shared.completions.close();
        for worker in workers {
            let _ = worker.join();
        }

        let guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(guard) = guard {
            if let Err(e) = guard.restore() {
                log::warn!("{}", e);
            }
        }

        let disabled = self
            .regs
            .control()
            .and_then(|ctl| self.regs.set_control(ctl - ControlFlags::GLOBAL_INTR_EN));
        if let Err(e) = disabled {
            log::warn!("disabling channel interrupts: {}", e);
        }

        // The workers are joined, so these are the last channel references.
        drop(shared);
        self.small_pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        log::info!("closed channel at {:#x}", self.regs.base());
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared();
        f.debug_struct("Channel")
            .field("kind", &self.kind)
            .field("regs", &self.regs)
            .field("pool", &shared.as_ref().map(|s| &s.pool))
            .field("closed", &shared.is_none())
            .finish()
    }
}

fn resolve_binding(device: &dyn Device, policy: &NumaPolicy, topology: &dyn Topology) -> Option<NumaBinding> {
    match policy {
        NumaPolicy::Disabled => None,
        NumaPolicy::Explicit(binding) => Some(binding.clone()),
        NumaPolicy::Device => {
            let locality = device.locality()?;
            match topology.binding_for(&locality) {
                Ok(binding) => Some(binding),
                Err(e) => {
                    log::warn!("no NUMA placement for {}: {}", locality, e);
                    None
                }
            }
        }
    }
}

/// Start a named worker and wait for it to report ready.
fn spawn_worker<F>(
    name: &str,
    binding: &Option<NumaBinding>,
    timeout: Duration,
    body: F,
) -> DmaResult<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let (ready_tx, ready_rx) = mpsc::sync_channel::<DmaResult<()>>(1);
    let binding = binding.clone();
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            if let Some(binding) = binding.filter(|b| !b.is_empty()) {
                if let Err(e) = binding.apply_to_current_thread() {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            }
            let _ = ready_tx.send(Ok(()));
            body();
        })
        .map_err(|e| DmaError::WorkerStart(format!("{name}: {e}")))?;

    match ready_rx.recv_timeout(timeout) {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(DmaError::WorkerStart(format!("{name}: {e}")))
        }
        Err(_) => Err(DmaError::WorkerStart(format!(
            "{name} not ready within {timeout:?}"
        ))),
    }
}
