//! Pooled device-memory allocators.
//!
//! Every device owns two pools: one for blob memory (tensors that live on the
//! device for the duration of a `process()` call) and one for staging memory
//! (host-visible transfer buffers). A caller borrows an allocator through an
//! [`AllocatorLease`], which hands it back to the pool when dropped, whatever
//! the exit path.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{trace, warn};

use crate::error::{Result, SrError};
use crate::tensor::{ElementType, GpuTensor, TensorShape};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocatorKind {
    Blob,
    Staging,
}

impl std::fmt::Display for AllocatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blob => write!(f, "blob"),
            Self::Staging => write!(f, "staging"),
        }
    }
}

#[derive(Debug, Error)]
#[error("{kind} allocator {id} out of memory: requested {requested} bytes with {live} live of {budget} budget")]
pub struct OutOfDeviceMemory {
    pub kind: AllocatorKind,
    pub id: u64,
    pub requested: usize,
    pub live: usize,
    pub budget: usize,
}

#[derive(Debug, Default)]
struct Counters {
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    allocations: AtomicU64,
}

/// Accounting handle carried by every tensor; releases its bytes on drop.
pub struct Allocation {
    counters: Option<Arc<Counters>>,
    bytes: usize,
}

impl Allocation {
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            counters: None,
            bytes: 0,
        }
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if let Some(counters) = &self.counters {
            counters.live_bytes.fetch_sub(self.bytes, Ordering::AcqRel);
        }
    }
}

/// A device allocator with a byte budget. Obtained from an [`AllocatorPool`].
#[derive(Debug)]
pub struct DeviceAllocator {
    kind: AllocatorKind,
    id: u64,
    budget_bytes: usize,
    counters: Arc<Counters>,
}

impl DeviceAllocator {
    fn new(kind: AllocatorKind, id: u64, budget_bytes: usize) -> Self {
        Self {
            kind,
            id,
            budget_bytes,
            counters: Arc::new(Counters::default()),
        }
    }

    fn share(&self) -> Self {
        Self {
            kind: self.kind,
            id: self.id,
            budget_bytes: self.budget_bytes,
            counters: Arc::clone(&self.counters),
        }
    }

    pub fn kind(&self) -> AllocatorKind {
        self.kind
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    pub fn live_bytes(&self) -> usize {
        self.counters.live_bytes.load(Ordering::Acquire)
    }

    pub fn peak_bytes(&self) -> usize {
        self.counters.peak_bytes.load(Ordering::Acquire)
    }

    pub fn allocation_count(&self) -> u64 {
        self.counters.allocations.load(Ordering::Acquire)
    }

    /// Allocate a zeroed tensor, failing with [`SrError::Device`] when the
    /// allocator's budget would be exceeded.
    pub fn create(&self, shape: TensorShape, element: ElementType) -> Result<GpuTensor> {
        let bytes = GpuTensor::required_bytes(shape, element);
        let budget = self.budget_bytes;
        let reserved = self.counters.live_bytes.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |live| live.checked_add(bytes).filter(|next| *next <= budget),
        );

        let live = match reserved {
            Ok(previous) => previous + bytes,
            Err(live) => {
                return Err(SrError::device(OutOfDeviceMemory {
                    kind: self.kind,
                    id: self.id,
                    requested: bytes,
                    live,
                    budget,
                }));
            }
        };

        self.counters.peak_bytes.fetch_max(live, Ordering::AcqRel);
        self.counters.allocations.fetch_add(1, Ordering::AcqRel);
        trace!(
            kind = %self.kind,
            allocator = self.id,
            width = shape.width,
            height = shape.height,
            channels = shape.channels,
            bytes,
            "Allocated tensor"
        );

        let allocation = Allocation {
            counters: Some(Arc::clone(&self.counters)),
            bytes,
        };
        Ok(GpuTensor::zeroed(shape, element, allocation))
    }

    pub fn create_planar(
        &self,
        width: usize,
        height: usize,
        channels: usize,
        element: ElementType,
    ) -> Result<GpuTensor> {
        self.create(TensorShape::planar(width, height, channels), element)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub acquired: u64,
    pub reclaimed: u64,
    pub created: u64,
    pub idle: usize,
}

impl PoolStats {
    /// Allocators currently leased out.
    pub fn outstanding(&self) -> u64 {
        self.acquired - self.reclaimed
    }
}

/// Thread-safe pool of allocators of one kind.
#[derive(Debug)]
pub struct AllocatorPool {
    kind: AllocatorKind,
    budget_bytes: usize,
    idle: Mutex<Vec<DeviceAllocator>>,
    created: AtomicU64,
    acquired: AtomicU64,
    reclaimed: AtomicU64,
}

impl AllocatorPool {
    pub fn new(kind: AllocatorKind, budget_bytes: usize) -> Self {
        Self {
            kind,
            budget_bytes,
            idle: Mutex::new(Vec::new()),
            created: AtomicU64::new(0),
            acquired: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> AllocatorKind {
        self.kind
    }

    /// Lease an idle allocator, creating one if none is idle. Concurrent
    /// callers always receive distinct allocators.
    pub fn acquire(&self) -> AllocatorLease<'_> {
        let reused = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();

        let allocator = reused.unwrap_or_else(|| {
            let id = self.created.fetch_add(1, Ordering::AcqRel);
            DeviceAllocator::new(self.kind, id, self.budget_bytes)
        });

        self.acquired.fetch_add(1, Ordering::AcqRel);
        trace!(kind = %self.kind, allocator = allocator.id, "Acquired allocator");
        AllocatorLease {
            pool: self,
            allocator,
        }
    }

    fn reclaim(&self, allocator: DeviceAllocator) {
        let live = allocator.live_bytes();
        if live != 0 {
            warn!(
                kind = %self.kind,
                allocator = allocator.id,
                live_bytes = live,
                "Allocator reclaimed with live tensors"
            );
        }

        self.reclaimed.fetch_add(1, Ordering::AcqRel);
        trace!(kind = %self.kind, allocator = allocator.id, "Reclaimed allocator");
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(allocator);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            acquired: self.acquired.load(Ordering::Acquire),
            reclaimed: self.reclaimed.load(Ordering::Acquire),
            created: self.created.load(Ordering::Acquire),
            idle: self
                .idle
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .len(),
        }
    }
}

/// Scoped ownership of a pooled allocator. Dropping the lease returns the
/// allocator to its pool exactly once.
pub struct AllocatorLease<'a> {
    pool: &'a AllocatorPool,
    allocator: DeviceAllocator,
}

impl Deref for AllocatorLease<'_> {
    type Target = DeviceAllocator;

    fn deref(&self) -> &Self::Target {
        &self.allocator
    }
}

impl Drop for AllocatorLease<'_> {
    fn drop(&mut self) {
        self.pool.reclaim(self.allocator.share());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    #[test]
    fn lease_returns_allocator_on_drop() {
        let pool = AllocatorPool::new(AllocatorKind::Blob, MIB);
        {
            let lease = pool.acquire();
            assert_eq!(lease.kind(), AllocatorKind::Blob);
            assert_eq!(pool.stats().outstanding(), 1);
        }
        let stats = pool.stats();
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.reclaimed, 1);
        assert_eq!(stats.outstanding(), 0);
        assert_eq!(stats.idle, 1);
    }

    #[test]
    fn idle_allocators_are_reused() {
        let pool = AllocatorPool::new(AllocatorKind::Staging, MIB);
        let first_id = pool.acquire().id();
        let second_id = pool.acquire().id();
        assert_eq!(first_id, second_id);
        assert_eq!(pool.stats().created, 1);
    }

    #[test]
    fn concurrent_leases_get_distinct_allocators() {
        let pool = AllocatorPool::new(AllocatorKind::Blob, MIB);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_ne!(a.id(), b.id());
        drop(a);
        drop(b);
        assert_eq!(pool.stats().idle, 2);
    }

    #[test]
    fn lease_is_returned_when_unwinding() {
        let pool = AllocatorPool::new(AllocatorKind::Blob, MIB);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _lease = pool.acquire();
            panic!("kernel blew up");
        }));
        assert!(result.is_err());
        assert_eq!(pool.stats().outstanding(), 0);
    }

    #[test]
    fn tensors_account_live_and_peak_bytes() {
        let pool = AllocatorPool::new(AllocatorKind::Blob, MIB);
        let lease = pool.acquire();
        let a = lease.create_planar(4, 4, 1, ElementType::F32).unwrap();
        let b = lease.create_planar(4, 4, 3, ElementType::F32).unwrap();
        assert_eq!(lease.live_bytes(), a.byte_len() + b.byte_len());
        drop(a);
        assert_eq!(lease.live_bytes(), b.byte_len());
        drop(b);
        assert_eq!(lease.live_bytes(), 0);
        assert_eq!(lease.peak_bytes(), 64 + 192);
        assert_eq!(lease.allocation_count(), 2);
    }

    #[test]
    fn exceeding_budget_is_a_device_error() {
        let pool = AllocatorPool::new(AllocatorKind::Blob, 100);
        let lease = pool.acquire();
        let _held = lease.create_planar(4, 4, 1, ElementType::F32).unwrap();
        let err = lease
            .create_planar(4, 4, 1, ElementType::F32)
            .expect_err("second tensor exceeds budget");
        match err {
            SrError::Device(source) => {
                let oom = source
                    .downcast_ref::<OutOfDeviceMemory>()
                    .expect("out-of-memory source");
                assert_eq!(oom.requested, 64);
                assert_eq!(oom.live, 64);
                assert_eq!(oom.budget, 100);
            }
            other => panic!("expected device error, got {other:?}"),
        }
        assert_eq!(lease.live_bytes(), 64);
    }
}
