// FPGA msgDMA User-Mode Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Pool of same-size pinned staging buffers.
//!
//! Buffers are allocated once, NUMA-local to the device, and handed out as
//! [`BufferHandle`]s. A handle is neither `Clone` nor `Copy`: holding one
//! is the only way to touch the buffer, and [`BufferPool::release`]
//! consumes it, so a buffer cannot be issued twice or released twice.

use crate::error::{DmaError, DmaResult};
use crate::numa::{NumaBinding, ThreadPlacement};
use crate::pinned::{PinnedAllocator, PinnedRegion};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// Exclusive claim on one pool buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct BufferHandle {
    pool: u32,
    index: u32,
}

impl BufferHandle {
    /// Slot index inside the pool.
    #[inline]
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    CheckedOut,
    /// Withdrawn because hardware may still write it.
    Quarantined,
}

struct PoolState {
    free: Vec<u32>,
    slots: Vec<SlotState>,
}

/// Fixed set of pinned buffers of one size.
pub struct BufferPool {
    id: u32,
    allocator: Arc<dyn PinnedAllocator>,
    regions: Vec<PinnedRegion>,
    buffer_size: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl BufferPool {
    /// Allocate `pool_size` buffers of `buffer_size` bytes.
    ///
    /// With a binding, the calling thread is bound to the device's node
    /// while the buffers are pinned and restored afterwards, so the pages
    /// land on the device's root complex.
    ///
    /// # Errors
    ///
    /// - [`DmaError::InvalidConfig`] for a zero pool or buffer size
    /// - [`DmaError::AffinityBinding`] if the binding cannot be applied
    /// - [`DmaError::PinFailed`] if any buffer cannot be pinned; buffers
    ///   pinned before the failure are released
    pub fn new(
        allocator: Arc<dyn PinnedAllocator>,
        pool_size: usize,
        buffer_size: usize,
        binding: Option<&NumaBinding>,
    ) -> DmaResult<Self> {
        if pool_size == 0 || buffer_size == 0 {
            return Err(DmaError::InvalidConfig(format!(
                "pool of {pool_size} x {buffer_size} bytes"
            )));
        }
        let pool_len = u32::try_from(pool_size)
            .map_err(|_| DmaError::InvalidConfig(format!("pool size {pool_size} too large")))?;

        let _placement = match binding.filter(|b| !b.is_empty()) {
            Some(binding) => {
                let saved = ThreadPlacement::current()?;
                binding.apply_to_current_thread()?;
                Some(scopeguard::guard(saved, |saved| {
                    if let Err(e) = saved.restore() {
                        log::warn!("failed to restore thread placement: {}", e);
                    }
                }))
            }
            None => None,
        };

        let mut regions = scopeguard::guard(Vec::with_capacity(pool_size), |regions| {
            for region in regions {
                allocator.release(region);
            }
        });
        for _ in 0..pool_size {
            regions.push(allocator.allocate(buffer_size)?);
        }
        let regions = scopeguard::ScopeGuard::into_inner(regions);

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "pool {} ready: {} x {} bytes",
            id,
            pool_size,
            buffer_size
        );
        Ok(Self {
            id,
            allocator,
            regions,
            buffer_size,
            state: Mutex::new(PoolState {
                // Popped from the back, so slot 0 is handed out first.
                free: (0..pool_len).rev().collect(),
                slots: vec![SlotState::Free; pool_size],
            }),
            available: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_out(&self, state: &mut PoolState) -> Option<BufferHandle> {
        let index = state.free.pop()?;
        debug_assert_eq!(state.slots[index as usize], SlotState::Free);
        state.slots[index as usize] = SlotState::CheckedOut;
        Some(BufferHandle {
            pool: self.id,
            index,
        })
    }

    /// Take a free buffer, blocking until one is released.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::PoolExhausted`] if every buffer has been
    /// quarantined, since none can ever come back.
    pub fn acquire(&self) -> DmaResult<BufferHandle> {
        let mut state = self.lock();
        loop {
            if let Some(handle) = self.check_out(&mut state) {
                return Ok(handle);
            }
            if state.slots.iter().all(|s| *s == SlotState::Quarantined) {
                return Err(DmaError::PoolExhausted);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Take a free buffer if one is available right now.
    pub fn try_acquire(&self) -> Option<BufferHandle> {
        let mut state = self.lock();
        self.check_out(&mut state)
    }

    /// Take a free buffer, waiting at most `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<BufferHandle> {
        let state = self.lock();
        let (mut state, _) = self
            .available
            .wait_timeout_while(state, timeout, |s| s.free.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        self.check_out(&mut state)
    }

    /// Return a buffer to the pool.
    ///
    /// Only call once the hardware has completed every descriptor that
    /// referenced the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::InvalidArgument`] for a handle issued by another
    /// pool.
    pub fn release(&self, handle: BufferHandle) -> DmaResult<()> {
        self.check_owner(&handle)?;
        self.release_slot(handle.index);
        Ok(())
    }

    fn release_slot(&self, index: u32) {
        let mut state = self.lock();
        let slot = &mut state.slots[index as usize];
        debug_assert_eq!(*slot, SlotState::CheckedOut);
        *slot = SlotState::Free;
        state.free.push(index);
        drop(state);
        self.available.notify_one();
    }

    /// Withdraw a buffer permanently. Used when hardware never confirmed
    /// the descriptor that references it.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::InvalidArgument`] for a handle issued by another
    /// pool.
    pub fn quarantine(&self, handle: BufferHandle) -> DmaResult<()> {
        self.check_owner(&handle)?;
        self.quarantine_slot(handle.index);
        Ok(())
    }

    fn quarantine_slot(&self, index: u32) {
        let mut state = self.lock();
        state.slots[index as usize] = SlotState::Quarantined;
        log::error!("pool {}: buffer {} quarantined", self.id, index);
        drop(state);
        // Wake waiters so they can notice a fully quarantined pool.
        self.available.notify_all();
    }

    #[inline]
    fn check_owner(&self, handle: &BufferHandle) -> DmaResult<()> {
        if handle.pool == self.id {
            Ok(())
        } else {
            Err(DmaError::InvalidArgument(format!(
                "buffer handle from pool {} used with pool {}",
                handle.pool, self.id
            )))
        }
    }

    #[inline]
    fn region(&self, handle: &BufferHandle) -> DmaResult<&PinnedRegion> {
        self.check_owner(handle)?;
        Ok(&self.regions[handle.index()])
    }

    /// Device-visible address of a buffer.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::InvalidArgument`] for a foreign handle, as do
    /// [`slice`](Self::slice) and [`slice_mut`](Self::slice_mut).
    #[inline]
    pub fn iova(&self, handle: &BufferHandle) -> DmaResult<u64> {
        self.region(handle).map(PinnedRegion::iova)
    }

    /// Mutable view of a checked-out buffer.
    #[inline]
    pub fn slice_mut<'a>(&'a self, handle: &'a mut BufferHandle) -> DmaResult<&'a mut [u8]> {
        let region = self.region(handle)?;
        // SAFETY: the handle is unique for its slot and borrowed mutably
        // for the slice's lifetime, so no other view of these bytes exists.
        Ok(unsafe { std::slice::from_raw_parts_mut(region.as_ptr(), self.buffer_size) })
    }

    /// Shared view of a checked-out buffer.
    #[inline]
    pub fn slice<'a>(&'a self, handle: &'a BufferHandle) -> DmaResult<&'a [u8]> {
        let region = self.region(handle)?;
        // SAFETY: only the handle holder can produce a mutable view, and it
        // is borrowed shared here.
        Ok(unsafe { std::slice::from_raw_parts(region.as_ptr(), self.buffer_size) })
    }

    /// Bytes per buffer.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers the pool was built with.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.regions.len()
    }

    /// Buffers ready to be acquired.
    pub fn available(&self) -> usize {
        self.lock().free.len()
    }

    /// Buffers withdrawn from circulation.
    pub fn quarantined(&self) -> usize {
        self.lock()
            .slots
            .iter()
            .filter(|s| **s == SlotState::Quarantined)
            .count()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let slots = std::mem::take(
            &mut self
                .state
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .slots,
        );
        for (region, slot) in self.regions.drain(..).zip(slots) {
            if slot == SlotState::Quarantined {
                // The device may still write here; leak rather than unmap.
                std::mem::forget(region);
            } else {
                self.allocator.release(region);
            }
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.id)
            .field("capacity", &self.capacity())
            .field("buffer_size", &self.buffer_size)
            .field("available", &self.available())
            .finish()
    }
}

// ============================================================================
// Caller-writable inline buffers
// ============================================================================

/// A pool buffer lent to the caller, returned to its pool on drop.
///
/// Data written here is already device-visible, so transfers built from a
/// `SmallBuffer` skip staging copies.
pub struct SmallBuffer {
    pool: Arc<BufferPool>,
    handle: Option<BufferHandle>,
}

impl SmallBuffer {
    /// Take a buffer from `pool` without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError::PoolExhausted`] if all buffers are lent out.
    pub fn take(pool: &Arc<BufferPool>) -> DmaResult<Self> {
        let handle = pool.try_acquire().ok_or(DmaError::PoolExhausted)?;
        Ok(Self {
            pool: pool.clone(),
            handle: Some(handle),
        })
    }

    // The handle always comes from `self.pool`, so no owner check.
    fn region(&self) -> &PinnedRegion {
        match &self.handle {
            Some(handle) => &self.pool.regions[handle.index()],
            None => unreachable!("small buffer used after release"),
        }
    }

    /// Device-visible address of the first byte.
    pub fn iova(&self) -> u64 {
        self.region().iova()
    }

    pub fn capacity(&self) -> usize {
        self.pool.buffer_size()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: this buffer is the only holder of the slot.
        unsafe { std::slice::from_raw_parts(self.region().as_ptr(), self.capacity()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `self` is borrowed mutably.
        unsafe { std::slice::from_raw_parts_mut(self.region().as_ptr(), self.capacity()) }
    }

    /// Withdraw the buffer from its pool instead of returning it.
    pub(crate) fn quarantine(mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.quarantine_slot(handle.index);
        }
    }
}

impl Drop for SmallBuffer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release_slot(handle.index);
        }
    }
}

impl std::fmt::Debug for SmallBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmallBuffer")
            .field("index", &self.handle.as_ref().map(BufferHandle::index))
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pinned::HostPinnedAllocator;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn pool(size: usize, buffer: usize) -> Arc<BufferPool> {
        Arc::new(BufferPool::new(Arc::new(HostPinnedAllocator::new()), size, buffer, None).unwrap())
    }

    /// Fails after `limit` successful allocations.
    struct FlakyAllocator {
        inner: HostPinnedAllocator,
        limit: usize,
        live: AtomicUsize,
    }

    impl PinnedAllocator for FlakyAllocator {
        fn allocate(&self, len: usize) -> DmaResult<PinnedRegion> {
            if self.live.load(Ordering::SeqCst) >= self.limit {
                return Err(DmaError::PinFailed {
                    len,
                    reason: "iommu full".into(),
                });
            }
            self.live.fetch_add(1, Ordering::SeqCst);
            self.inner.allocate(len)
        }

        fn release(&self, region: PinnedRegion) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            self.inner.release(region);
        }
    }

    #[test]
    fn test_no_double_issue() {
        let pool = pool(4, 1024);
        let handles: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        let indices: HashSet<_> = handles.iter().map(BufferHandle::index).collect();
        assert_eq!(indices.len(), 4);
        assert!(pool.try_acquire().is_none());

        let mut handles = handles.into_iter();
        let first = handles.next().unwrap();
        let first_index = first.index();
        pool.release(first).unwrap();
        let again = pool.try_acquire().unwrap();
        assert_eq!(again.index(), first_index);

        pool.release(again).unwrap();
        handles.for_each(|h| pool.release(h).unwrap());
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_concurrent_holders_are_disjoint() {
        let pool = pool(3, 64);
        let holders: Vec<_> = (0..6)
            .map(|t| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for round in 0..50u8 {
                        let mut h = pool.acquire().unwrap();
                        let tag = t as u8 ^ round;
                        pool.slice_mut(&mut h).unwrap().fill(tag);
                        thread::yield_now();
                        assert!(pool.slice(&h).unwrap().iter().all(|b| *b == tag));
                        pool.release(h).unwrap();
                    }
                })
            })
            .collect();
        holders.into_iter().for_each(|h| h.join().unwrap());
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let pool = pool(1, 64);
        let held = pool.acquire().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().unwrap().index())
        };
        thread::sleep(Duration::from_millis(20));
        pool.release(held).unwrap();
        assert_eq!(waiter.join().unwrap(), 0);
    }

    #[test]
    fn test_acquire_timeout() {
        let pool = pool(1, 64);
        let _held = pool.acquire().unwrap();
        assert!(pool.acquire_timeout(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn test_quarantine_removes_buffer() {
        let pool = pool(1, 64);
        let h = pool.acquire().unwrap();
        pool.quarantine(h).unwrap();
        assert_eq!(pool.quarantined(), 1);
        assert!(matches!(pool.acquire(), Err(DmaError::PoolExhausted)));
    }

    #[test]
    fn test_foreign_handle_is_rejected() {
        let ours = pool(1, 64);
        let theirs = pool(1, 64);
        let mut h = theirs.acquire().unwrap();
        assert!(matches!(ours.iova(&h), Err(DmaError::InvalidArgument(_))));
        assert!(matches!(ours.slice_mut(&mut h), Err(DmaError::InvalidArgument(_))));
        assert!(matches!(ours.release(h), Err(DmaError::InvalidArgument(_))));
        assert_eq!(ours.available(), 1);
        assert_eq!(theirs.available(), 0);
    }

    #[test]
    fn test_failed_pin_releases_partial_pool() {
        let alloc = Arc::new(FlakyAllocator {
            inner: HostPinnedAllocator::new(),
            limit: 2,
            live: AtomicUsize::new(0),
        });
        let err = BufferPool::new(alloc.clone(), 4, 4096, None).unwrap_err();
        assert!(matches!(err, DmaError::PinFailed { .. }));
        assert_eq!(alloc.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalid_sizes() {
        let alloc = Arc::new(HostPinnedAllocator::new());
        assert!(matches!(
            BufferPool::new(alloc.clone(), 0, 64, None),
            Err(DmaError::InvalidConfig(_))
        ));
        assert!(matches!(
            BufferPool::new(alloc, 2, 0, None),
            Err(DmaError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_small_buffer_returns_on_drop() {
        let pool = pool(2, 256);
        let mut a = SmallBuffer::take(&pool).unwrap();
        let _b = SmallBuffer::take(&pool).unwrap();
        assert!(matches!(SmallBuffer::take(&pool), Err(DmaError::PoolExhausted)));

        a.as_mut_slice()[..3].copy_from_slice(b"abc");
        assert_eq!(&a.as_slice()[..3], b"abc");
        assert_eq!(a.capacity(), 256);
        drop(a);
        assert_eq!(pool.available(), 1);
    }
}
