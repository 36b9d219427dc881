// FPGA msgDMA User-Mode Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Transfer requests, in-flight records and completion delivery.

use crate::descriptor::{is_dma_aligned, DescriptorControl, DMA_ALIGN_BYTES};
use crate::device::ChannelKind;
use crate::error::{DmaError, DmaResult};
use crate::pool::{BufferHandle, SmallBuffer};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Which way data moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

/// Whether the device side is addressed memory or a packet stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    MemoryMapped,
    Streaming,
}

/// Packet framing requested for a host-to-stream transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxControl {
    #[default]
    NoPacket,
    GenerateSop,
    GenerateEop,
    GenerateSopAndEop,
}

impl TxControl {
    /// Framing bits for a chunk at the given position. SOP goes on the
    /// first chunk and EOP on the last; a lone chunk can carry both.
    pub fn flags_for(self, first: bool, last: bool) -> DescriptorControl {
        let mut flags = DescriptorControl::empty();
        if first && matches!(self, Self::GenerateSop | Self::GenerateSopAndEop) {
            flags |= DescriptorControl::GENERATE_SOP;
        }
        if last && matches!(self, Self::GenerateEop | Self::GenerateSopAndEop) {
            flags |= DescriptorControl::GENERATE_EOP;
        }
        flags
    }
}

/// Packet handling requested for a stream-to-host transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxControl {
    #[default]
    NoPacket,
    /// Stop the transfer when the stream delivers end-of-packet.
    EndOnEop,
}

impl RxControl {
    pub fn flags(self) -> DescriptorControl {
        match self {
            Self::NoPacket => DescriptorControl::empty(),
            Self::EndOnEop => {
                DescriptorControl::END_ON_EOP
                    | DescriptorControl::EOP_RCVD_IRQ_EN
                    | DescriptorControl::WAIT_FOR_WR_RSP
            }
        }
    }
}

/// Host side of a transfer.
pub(crate) enum HostSide {
    /// Device-to-device: nothing on the host.
    None,
    /// Caller memory, staged through the pool. For reads the vector is
    /// filled on completion.
    Owned(Vec<u8>),
    /// A device-visible small buffer; no staging.
    Inline(SmallBuffer),
}

/// A transfer request, built by one of the constructors below.
pub struct TransferSpec {
    pub(crate) direction: Direction,
    pub(crate) mode: TransferMode,
    pub(crate) src: u64,
    pub(crate) dst: u64,
    pub(crate) len: usize,
    pub(crate) tx: TxControl,
    pub(crate) rx: RxControl,
    pub(crate) host: HostSide,
}

impl TransferSpec {
    fn new(direction: Direction, mode: TransferMode, src: u64, dst: u64, len: usize, host: HostSide) -> Self {
        Self {
            direction,
            mode,
            src,
            dst,
            len,
            tx: TxControl::NoPacket,
            rx: RxControl::NoPacket,
            host,
        }
    }

    /// Copy `data` to device memory at `dst`.
    pub fn host_to_device(data: Vec<u8>, dst: u64) -> Self {
        let len = data.len();
        Self::new(Direction::HostToDevice, TransferMode::MemoryMapped, 0, dst, len, HostSide::Owned(data))
    }

    /// Send `data` into the device stream with the given framing.
    pub fn host_to_stream(data: Vec<u8>, tx: TxControl) -> Self {
        let len = data.len();
        let mut spec = Self::new(Direction::HostToDevice, TransferMode::Streaming, 0, 0, len, HostSide::Owned(data));
        spec.tx = tx;
        spec
    }

    /// Read `len` bytes of device memory at `src`.
    pub fn device_to_host(src: u64, len: usize) -> Self {
        Self::new(
            Direction::DeviceToHost,
            TransferMode::MemoryMapped,
            src,
            0,
            len,
            HostSide::Owned(Vec::new()),
        )
    }

    /// Receive up to `len` bytes from the device stream.
    pub fn stream_to_host(len: usize, rx: RxControl) -> Self {
        let mut spec = Self::new(
            Direction::DeviceToHost,
            TransferMode::Streaming,
            0,
            0,
            len,
            HostSide::Owned(Vec::new()),
        );
        spec.rx = rx;
        spec
    }

    /// Copy `len` bytes between two device addresses.
    pub fn device_to_device(src: u64, dst: u64, len: usize) -> Self {
        Self::new(Direction::DeviceToDevice, TransferMode::MemoryMapped, src, dst, len, HostSide::None)
    }

    /// Send the first `len` bytes of a small buffer to device memory.
    pub fn inline_to_device(buf: SmallBuffer, len: usize, dst: u64) -> Self {
        Self::new(Direction::HostToDevice, TransferMode::MemoryMapped, 0, dst, len, HostSide::Inline(buf))
    }

    /// Send the first `len` bytes of a small buffer into the stream.
    pub fn inline_to_stream(buf: SmallBuffer, len: usize, tx: TxControl) -> Self {
        let mut spec = Self::new(Direction::HostToDevice, TransferMode::Streaming, 0, 0, len, HostSide::Inline(buf));
        spec.tx = tx;
        spec
    }

    /// Read device memory straight into a small buffer.
    pub fn device_to_inline(src: u64, buf: SmallBuffer, len: usize) -> Self {
        Self::new(Direction::DeviceToHost, TransferMode::MemoryMapped, src, 0, len, HostSide::Inline(buf))
    }

    /// Receive from the stream straight into a small buffer.
    pub fn stream_to_inline(buf: SmallBuffer, len: usize, rx: RxControl) -> Self {
        let mut spec = Self::new(Direction::DeviceToHost, TransferMode::Streaming, 0, 0, len, HostSide::Inline(buf));
        spec.rx = rx;
        spec
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check the request against a channel before anything is queued.
    ///
    /// # Errors
    ///
    /// - [`DmaError::InvalidArgument`] for empty transfers or a transfer
    ///   kind the channel does not carry
    /// - [`DmaError::Misaligned`] for unaligned device addresses
    /// - [`DmaError::OversizedDescriptor`] when an inline transfer exceeds
    ///   its buffer
    pub fn validate(&self, kind: ChannelKind) -> DmaResult<()> {
        if self.len == 0 {
            return Err(DmaError::InvalidArgument("zero-length transfer".into()));
        }

        let supported = match (kind, self.direction, self.mode) {
            (ChannelKind::MemoryMapped, _, TransferMode::MemoryMapped) => true,
            (ChannelKind::HostToStream, Direction::HostToDevice, TransferMode::Streaming) => true,
            (ChannelKind::StreamToHost, Direction::DeviceToHost, TransferMode::Streaming) => true,
            _ => false,
        };
        if !supported {
            return Err(DmaError::InvalidArgument(format!(
                "{:?} {:?} transfer on a {:?} channel",
                self.mode, self.direction, kind
            )));
        }

        if self.mode == TransferMode::MemoryMapped {
            let device_addrs = match self.direction {
                Direction::HostToDevice => [Some(self.dst), None],
                Direction::DeviceToHost => [Some(self.src), None],
                Direction::DeviceToDevice => [Some(self.src), Some(self.dst)],
            };
            if let Some(addr) = device_addrs
                .into_iter()
                .flatten()
                .find(|a| !is_dma_aligned(*a))
            {
                return Err(DmaError::Misaligned {
                    addr,
                    align: DMA_ALIGN_BYTES,
                });
            }
        }

        if let HostSide::Inline(buf) = &self.host {
            if self.len > buf.capacity() {
                return Err(DmaError::OversizedDescriptor {
                    len: self.len,
                    max: buf.capacity(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TransferSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSpec")
            .field("direction", &self.direction)
            .field("mode", &self.mode)
            .field("src", &format_args!("{:#x}", self.src))
            .field("dst", &format_args!("{:#x}", self.dst))
            .field("len", &self.len)
            .field("tx", &self.tx)
            .field("rx", &self.rx)
            .finish()
    }
}

/// Result delivered to the caller when a transfer retires.
#[derive(Debug, Default)]
pub struct TransferOutcome {
    /// Bytes moved; for stream reads, bytes actually received.
    pub bytes: usize,
    /// Whether the stream delivered end-of-packet.
    pub eop_arrived: bool,
    /// Received bytes for pool-staged reads, or the caller's payload
    /// handed back for writes.
    pub data: Vec<u8>,
    /// The inline buffer, for transfers built from one.
    pub small_buffer: Option<SmallBuffer>,
    /// Why the transfer failed, if it did.
    pub error: Option<Arc<DmaError>>,
}

impl TransferOutcome {
    #[inline]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Convert a failed outcome into an error.
    pub fn into_result(self) -> DmaResult<Self> {
        match self.error {
            Some(err) => Err(DmaError::TransferFailed(err)),
            None => Ok(self),
        }
    }

    /// Copy of the status fields without the data.
    pub fn summary(&self) -> Self {
        Self {
            bytes: self.bytes,
            eop_arrived: self.eop_arrived,
            data: Vec::new(),
            small_buffer: None,
            error: self.error.clone(),
        }
    }
}

/// Completion callback. Runs on the completion worker thread.
pub type Callback = Box<dyn FnOnce(TransferOutcome) + Send + 'static>;

/// One-shot completion slot a synchronous caller blocks on.
#[derive(Debug, Default)]
pub struct CompletionSignal {
    outcome: Mutex<Option<TransferOutcome>>,
    cond: Condvar,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self, outcome: TransferOutcome) {
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(outcome);
        self.cond.notify_all();
    }

    /// Block until the transfer completes.
    pub fn wait(&self) -> TransferOutcome {
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(outcome) = slot.take() {
                return outcome;
            }
            slot = self.cond.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block at most `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TransferOutcome> {
        let slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut slot, _) = self
            .cond
            .wait_timeout_while(slot, timeout, |s| s.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.take()
    }
}

/// How a record's host data is staged for the device.
pub(crate) enum Staging {
    /// Nothing staged yet, or nothing to stage.
    Unstaged,
    /// Pool buffers checked out for this transfer, chunk order.
    Pool(Vec<BufferHandle>),
    /// The caller's own device-visible buffer.
    Inline(SmallBuffer),
}

/// A transfer travelling through the request and completion queues.
pub(crate) struct TransferRecord {
    pub direction: Direction,
    pub mode: TransferMode,
    pub src: u64,
    pub dst: u64,
    pub len: usize,
    pub tx: TxControl,
    pub rx: RxControl,
    /// Payload for writes; receive area for pool-staged reads.
    pub data: Vec<u8>,
    pub staging: Staging,
    pub callback: Option<Callback>,
    pub signal: Option<Arc<CompletionSignal>>,
    pub bytes: usize,
    pub eop_arrived: bool,
    pub error: Option<DmaError>,
}

impl TransferRecord {
    pub fn new(spec: TransferSpec, callback: Option<Callback>, signal: Option<Arc<CompletionSignal>>) -> Self {
        let (data, staging) = match spec.host {
            HostSide::None => (Vec::new(), Staging::Unstaged),
            HostSide::Owned(data) => (data, Staging::Unstaged),
            HostSide::Inline(buf) => (Vec::new(), Staging::Inline(buf)),
        };
        Self {
            direction: spec.direction,
            mode: spec.mode,
            src: spec.src,
            dst: spec.dst,
            len: spec.len,
            tx: spec.tx,
            rx: spec.rx,
            data,
            staging,
            callback,
            signal,
            bytes: 0,
            eop_arrived: false,
            error: None,
        }
    }

    /// Mark the whole transfer failed. The first error wins.
    pub fn fail(&mut self, err: DmaError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Pull the caller-facing outcome out of the record, leaving any pool
    /// handles in place for release.
    pub fn take_outcome(&mut self) -> TransferOutcome {
        let small_buffer = match std::mem::replace(&mut self.staging, Staging::Unstaged) {
            Staging::Inline(buf) => Some(buf),
            other => {
                self.staging = other;
                None
            }
        };
        TransferOutcome {
            bytes: self.bytes,
            eop_arrived: self.eop_arrived,
            data: std::mem::take(&mut self.data),
            small_buffer,
            error: self.error.take().map(Arc::new),
        }
    }

    /// Drop a record that will never run. Synchronous waiters are released
    /// with `ChannelClosed`; callbacks are not invoked.
    pub fn discard(mut self) {
        self.callback = None;
        if let Some(signal) = self.signal.take() {
            signal.complete(TransferOutcome {
                error: Some(Arc::new(DmaError::ChannelClosed)),
                ..TransferOutcome::default()
            });
        }
    }
}

impl fmt::Debug for TransferRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRecord")
            .field("direction", &self.direction)
            .field("mode", &self.mode)
            .field("len", &self.len)
            .field("bytes", &self.bytes)
            .field("error", &self.error)
            .finish()
    }
}

/// Recycled handle lists, so steady-state transfers do not allocate.
#[derive(Debug)]
pub(crate) struct HandleListCache {
    lists: Mutex<Vec<Vec<BufferHandle>>>,
    limit: usize,
}

impl HandleListCache {
    pub fn new(limit: usize) -> Self {
        Self {
            lists: Mutex::new(Vec::with_capacity(limit)),
            limit,
        }
    }

    pub fn take(&self) -> Vec<BufferHandle> {
        self.lists
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default()
    }

    /// Return an emptied list.
    pub fn put(&self, list: Vec<BufferHandle>) {
        debug_assert!(list.is_empty());
        let mut lists = self.lists.lock().unwrap_or_else(PoisonError::into_inner);
        if lists.len() < self.limit {
            lists.push(list);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_framing() {
        use DescriptorControl as C;
        let both = TxControl::GenerateSopAndEop;
        assert_eq!(both.flags_for(true, true), C::GENERATE_SOP | C::GENERATE_EOP);
        assert_eq!(both.flags_for(true, false), C::GENERATE_SOP);
        assert_eq!(both.flags_for(false, false), C::empty());
        assert_eq!(both.flags_for(false, true), C::GENERATE_EOP);
        assert_eq!(TxControl::GenerateSop.flags_for(true, true), C::GENERATE_SOP);
        assert_eq!(TxControl::NoPacket.flags_for(true, true), C::empty());
    }

    #[test]
    fn test_rx_end_on_eop_flags() {
        let flags = RxControl::EndOnEop.flags();
        assert!(flags.contains(DescriptorControl::END_ON_EOP));
        assert!(flags.contains(DescriptorControl::EOP_RCVD_IRQ_EN));
        assert!(flags.contains(DescriptorControl::WAIT_FOR_WR_RSP));
        assert!(RxControl::NoPacket.flags().is_empty());
    }

    #[test]
    fn test_validate_alignment() {
        let spec = TransferSpec::host_to_device(vec![0; 128], 0x1001);
        assert!(matches!(
            spec.validate(ChannelKind::MemoryMapped),
            Err(DmaError::Misaligned { addr: 0x1001, align: 64 })
        ));
        let spec = TransferSpec::device_to_device(0x40, 0x30, 64);
        assert!(matches!(
            spec.validate(ChannelKind::MemoryMapped),
            Err(DmaError::Misaligned { addr: 0x30, .. })
        ));
        assert!(TransferSpec::device_to_host(0x80, 3)
            .validate(ChannelKind::MemoryMapped)
            .is_ok());
    }

    #[test]
    fn test_validate_channel_kind() {
        let spec = TransferSpec::host_to_stream(vec![1, 2, 3], TxControl::GenerateSopAndEop);
        assert!(spec.validate(ChannelKind::HostToStream).is_ok());
        assert!(spec.validate(ChannelKind::MemoryMapped).is_err());
        assert!(TransferSpec::stream_to_host(64, RxControl::EndOnEop)
            .validate(ChannelKind::HostToStream)
            .is_err());
    }

    #[test]
    fn test_validate_empty() {
        let spec = TransferSpec::host_to_device(Vec::new(), 0);
        assert!(matches!(
            spec.validate(ChannelKind::MemoryMapped),
            Err(DmaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_outcome_into_result() {
        let ok = TransferOutcome {
            bytes: 10,
            ..TransferOutcome::default()
        };
        assert_eq!(ok.into_result().unwrap().bytes, 10);

        let failed = TransferOutcome {
            error: Some(Arc::new(DmaError::Timeout)),
            ..TransferOutcome::default()
        };
        assert!(!failed.is_success());
        assert!(failed.summary().error.is_some());
        assert!(matches!(failed.into_result(), Err(DmaError::TransferFailed(_))));
    }

    #[test]
    fn test_discard_releases_sync_waiter() {
        let signal = Arc::new(CompletionSignal::new());
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();
        let record = TransferRecord::new(
            TransferSpec::device_to_device(0, 64, 64),
            Some(Box::new(move |_: TransferOutcome| *flag.lock().unwrap() = true)),
            Some(signal.clone()),
        );
        record.discard();

        let outcome = signal.wait_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(outcome.error.as_deref(), Some(DmaError::ChannelClosed)));
        assert!(!*called.lock().unwrap());
    }

    #[test]
    fn test_handle_list_cache_bounded() {
        let cache = HandleListCache::new(1);
        cache.put(Vec::with_capacity(4));
        cache.put(Vec::with_capacity(4));
        assert_eq!(cache.len(), 1);
        assert!(cache.take().capacity() >= 4);
        assert_eq!(cache.len(), 0);
    }
}
