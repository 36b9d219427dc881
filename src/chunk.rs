// FPGA msgDMA User-Mode Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Splitting a transfer into descriptor-sized chunks.
//!
//! A transfer of `len` bytes becomes `ceil(len / chunk_size)` chunks. At
//! most `pool_size` staging buffers are used; when there are more chunks
//! than buffers the plan ping-pongs, chunk `i` reusing buffer
//! `i % buffers`.
//!
//! # Interrupt pacing
//!
//! Only some descriptors request an interrupt: the last chunk always, and
//! when ping-ponging, every chunk closing a half-pool batch. Before an
//! interrupt-bearing chunk is staged, the previously requested interrupt
//! is awaited. The first interrupt-bearing chunk never waits, since
//! nothing is outstanding yet. A chunk reuses buffer `i % n` only after
//! chunk `i - n` has been acknowledged by one of those waits.

/// One descriptor's worth of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    /// Byte offset within the transfer.
    pub offset: usize,
    pub len: usize,
    /// Index into the transfer's acquired buffers.
    pub buffer: usize,
    pub first: bool,
    pub last: bool,
    /// Request an interrupt when this descriptor completes.
    pub irq: bool,
    /// Wait for the outstanding interrupt before staging this chunk.
    pub wait_before: bool,
}

/// Chunk layout and pacing for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    len: usize,
    chunk_size: usize,
    chunks: usize,
    buffers: usize,
    serialized: bool,
}

impl ChunkPlan {
    /// Plan `len` bytes in chunks of `chunk_size`, staged through at most
    /// `pool_size` buffers.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` or `pool_size` is zero.
    pub fn new(len: usize, chunk_size: usize, pool_size: usize) -> Self {
        assert!(chunk_size > 0 && pool_size > 0, "empty chunk or pool size");
        let chunks = len.div_ceil(chunk_size);
        Self {
            len,
            chunk_size,
            chunks,
            buffers: chunks.min(pool_size),
            serialized: false,
        }
    }

    /// Request and await an interrupt for every chunk.
    pub fn serialized(mut self) -> Self {
        self.serialized = true;
        self
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    /// Staging buffers the transfer needs.
    pub fn buffers_needed(&self) -> usize {
        self.buffers
    }

    /// True when chunks outnumber buffers.
    pub fn is_ping_pong(&self) -> bool {
        self.chunks > self.buffers
    }

    fn half(&self) -> usize {
        (self.buffers / 2).max(1)
    }

    fn is_irq(&self, index: usize) -> bool {
        let last = index + 1 == self.chunks;
        last || self.serialized || (self.is_ping_pong() && index % self.half() == self.half() - 1)
    }

    pub fn iter(&self) -> ChunkIter {
        ChunkIter {
            plan: *self,
            next: 0,
            irq_outstanding: false,
        }
    }
}

impl IntoIterator for &ChunkPlan {
    type Item = Chunk;
    type IntoIter = ChunkIter;

    fn into_iter(self) -> ChunkIter {
        self.iter()
    }
}

/// Iterator over a [`ChunkPlan`] in offset order.
#[derive(Debug, Clone)]
pub struct ChunkIter {
    plan: ChunkPlan,
    next: usize,
    irq_outstanding: bool,
}

impl Iterator for ChunkIter {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let plan = &self.plan;
        let index = self.next;
        if index >= plan.chunks {
            return None;
        }
        self.next += 1;

        let offset = index * plan.chunk_size;
        let irq = plan.is_irq(index);
        let wait_before = irq && self.irq_outstanding;
        self.irq_outstanding |= irq;

        Some(Chunk {
            index,
            offset,
            len: (plan.len - offset).min(plan.chunk_size),
            buffer: index % plan.buffers,
            first: index == 0,
            last: index + 1 == plan.chunks,
            irq,
            wait_before,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.plan.chunks - self.next;
        (left, Some(left))
    }
}

impl ExactSizeIterator for ChunkIter {}
