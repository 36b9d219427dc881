// FPGA msgDMA User-Mode Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! # User-mode DMA engine for FPGA msgDMA channels
//!
//! This crate drives a modular scatter-gather DMA (msgDMA) dispatcher from
//! user space: it stages host data in pinned, NUMA-local buffers, builds
//! extended descriptors, submits them against the dispatcher's descriptor
//! FIFO and retires completed transfers on a dedicated worker thread.
//!
//! ## Architecture
//!
//! ```text
//! caller ─▶ request queue ─▶ transfer worker ─▶ descriptor FIFO ─▶ hardware
//!                                  ▲                                  │
//!                                  └──────── interrupt (eventfd) ◀────┘
//!                                  │
//!                                  ▼
//!           completion queue ─▶ completion worker ─▶ callback / waiter
//! ```
//!
//! ## Supported transfers
//!
//! | Channel kind   | Transfers                                         |
//! |----------------|---------------------------------------------------|
//! | `MemoryMapped` | host → device, device → host, device → device     |
//! | `HostToStream` | host → stream, with SOP/EOP framing               |
//! | `StreamToHost` | stream → host, optionally ending on EOP           |
//!
//! Large transfers are split into buffer-sized descriptors and ping-pong
//! through the pool. Small transfers can skip staging entirely by writing
//! into a [`SmallBuffer`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use fpga_dma::{Channel, ChannelConfig, ChannelKind, DmaError, SimConfig, SimulatedDevice, TransferSpec};
//!
//! fn main() -> Result<(), DmaError> {
//!     // The simulated device stands in for a mapped FPGA channel.
//!     let device = SimulatedDevice::new(SimConfig::new(ChannelKind::MemoryMapped))?;
//!     let channel = Channel::open(device, ChannelConfig::default().with_pool(4, 4096))?;
//!
//!     channel.submit_sync(TransferSpec::host_to_device(b"Hello, FPGA!".to_vec(), 0x1000))?;
//!     let back = channel.submit_sync(TransferSpec::device_to_host(0x1000, 12))?;
//!     assert_eq!(back.data, b"Hello, FPGA!");
//!     Ok(())
//! }
//! ```
//!
//! ## Requirements
//!
//! - Linux, with the device's MMIO window mappable from user space
//!   (UIO, VFIO or a sysfs PCI `resource` file)
//! - An eventfd registered for the channel interrupt
//! - Memory that can be pinned, or a driver-provided allocator that
//!   returns IOVAs

#![cfg(target_os = "linux")]

// Module declarations
pub mod channel;
pub mod chunk;
mod completion;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod hotplug;
pub mod interrupt;
pub mod numa;
pub mod pinned;
pub mod pool;
pub mod queue;
pub mod regs;
pub mod sim;
pub mod submit;
pub mod transfer;
mod worker;

// Re-exports for convenient access
pub use channel::{open_channel, Channel, ChannelConfig, NumaPolicy};
pub use chunk::{Chunk, ChunkPlan};
pub use descriptor::{Descriptor, DescriptorControl, DMA_ALIGN_BYTES, HOST_ADDR_MASK};
pub use device::{ChannelKind, ChannelLayout, Device, MappedDevice};
pub use error::{DmaError, DmaResult};
pub use hotplug::HotRemovalGuard;
pub use interrupt::{InterruptBridge, WaitOutcome};
pub use numa::{DeviceLocality, NumaBinding, SysfsTopology, Topology};
pub use pinned::{HostPinnedAllocator, PinnedAllocator, PinnedRegion};
pub use pool::{BufferHandle, BufferPool, SmallBuffer};
pub use queue::{Dequeued, EnqueueError, TransferQueue};
pub use regs::{ChannelRegisters, MmioRegion, RegisterSpace};
pub use sim::{SimConfig, SimulatedDevice};
pub use submit::DescriptorSubmitter;
pub use transfer::{Direction, RxControl, TransferMode, TransferOutcome, TransferSpec, TxControl};
