// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Memory pool for bounding memory usage shared by many trackers.
//!
//! # Features
//!
//! - **Lock-free reservations**: the check against the capacity and the update
//!   of the usage happen in a single compare-and-swap loop
//! - **Sub-pools**: a pool created with a parent reserves on the parent first,
//!   so every limit up the chain applies
//! - **Live capacity updates** via [`MemoryPool::set_capacity`]
//! - **Unbounded mode**: unbounded pools never reject but still count usage

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use bytesize::ByteSize;
use tracing::{debug, warn};
use triomphe::Arc;

use memledger_types::MemoryGroup;

use crate::MemoryLimitExceeded;
use crate::registry::Registration;

/// Capacity of unbounded pools.
const UNBOUNDED: i64 = i64::MAX;

/// Converts a byte amount into the signed domain of the counters, saturating.
#[inline]
pub(crate) fn to_signed(bytes: usize) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

/// A named pool of memory that trackers reserve from.
///
/// Cheaply cloneable (uses `Arc` internally); clones share the same usage.
/// Pools are usually created through [`MemoryPools`](crate::MemoryPools),
/// which keeps track of them until they are [closed](Self::close).
#[derive(Clone)]
pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    group: MemoryGroup,
    capacity: AtomicI64,
    used: AtomicI64,
    parent: Option<MemoryPool>,
    registration: Option<Registration>,
    closed: AtomicBool,
}

impl MemoryPool {
    /// Creates a standalone pool that is not registered anywhere.
    ///
    /// A `capacity` of zero creates an unbounded pool.
    pub fn new(group: MemoryGroup, name: impl Into<String>, capacity: usize) -> Self {
        Self::create(group, name.into(), capacity, None, None)
    }

    /// Creates a standalone unbounded pool.
    pub fn unbounded(group: MemoryGroup, name: impl Into<String>) -> Self {
        Self::new(group, name, 0)
    }

    pub(crate) fn create(
        group: MemoryGroup,
        name: String,
        capacity: usize,
        parent: Option<MemoryPool>,
        registration: Option<Registration>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name,
                group,
                capacity: AtomicI64::new(capacity_from(capacity)),
                used: AtomicI64::new(0),
                parent,
                registration,
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn group(&self) -> MemoryGroup {
        self.inner.group
    }

    #[inline]
    pub fn parent(&self) -> Option<&MemoryPool> {
        self.inner.parent.as_ref()
    }

    #[inline]
    pub fn is_unbounded(&self) -> bool {
        self.total_size() == UNBOUNDED
    }

    /// Configured capacity, `None` if unbounded.
    #[inline]
    pub fn capacity(&self) -> Option<usize> {
        let capacity = self.total_size();
        (capacity != UNBOUNDED).then_some(capacity.max(0).unsigned_abs() as usize)
    }

    /// Configured capacity, `i64::MAX` if unbounded.
    #[inline]
    pub fn total_size(&self) -> i64 {
        self.inner.capacity.load(Ordering::Relaxed)
    }

    /// Updates the capacity at runtime. Zero makes the pool unbounded.
    ///
    /// Lowering the capacity below the current usage only affects new
    /// reservations.
    pub fn set_capacity(&self, capacity: usize) {
        self.inner
            .capacity
            .store(capacity_from(capacity), Ordering::Relaxed);
        debug!(
            "Capacity of memory pool '{}' set to {}",
            self.name(),
            display_capacity(capacity)
        );
    }

    #[inline]
    pub fn used(&self) -> i64 {
        self.inner.used.load(Ordering::Relaxed)
    }

    /// Bytes that can still be reserved from this pool alone. Limits of
    /// parent pools are not taken into account.
    #[inline]
    pub fn free(&self) -> i64 {
        self.total_size().saturating_sub(self.used()).max(0)
    }

    /// Reserves `bytes` from this pool and all its ancestors.
    ///
    /// Fails without changing any pool if the reservation does not fit in this
    /// pool or one of its ancestors. The error names the pool whose capacity
    /// was hit.
    pub fn reserve(&self, bytes: usize) -> Result<(), MemoryLimitExceeded> {
        self.try_reserve_inner(bytes).map_err(|rejection| {
            MemoryLimitExceeded::pool(rejection.name, bytes, rejection.used, rejection.capacity)
        })
    }

    /// Like [`reserve`](Self::reserve), but a rejection is neither counted
    /// nor logged. For callers that fall back to a smaller reservation.
    pub(crate) fn try_reserve(&self, bytes: usize) -> bool {
        self.try_reserve_inner(bytes).is_ok()
    }

    fn try_reserve_inner(&self, bytes: usize) -> Result<(), Rejection<'_>> {
        if bytes == 0 {
            return Ok(());
        }

        if let Some(parent) = &self.inner.parent {
            parent.try_reserve_inner(bytes)?;
        }

        if let Err(rejection) = self.reserve_local(bytes) {
            if let Some(parent) = &self.inner.parent {
                parent.release(bytes);
            }
            return Err(rejection);
        }
        Ok(())
    }

    fn reserve_local(&self, bytes: usize) -> Result<(), Rejection<'_>> {
        let delta = to_signed(bytes);
        let inner = &self.inner;
        inner
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                let capacity = inner.capacity.load(Ordering::Relaxed);
                // unbounded pools saturate instead of rejecting
                let new_used = used.saturating_add(delta);
                (capacity == UNBOUNDED || new_used <= capacity).then_some(new_used)
            })
            .map(|_| ())
            .map_err(|used| Rejection {
                name: &inner.name,
                used,
                capacity: inner.capacity.load(Ordering::Relaxed),
            })
    }

    /// Returns `bytes` to this pool and all its ancestors.
    ///
    /// Releasing more than is in use makes the usage negative. This is only
    /// expected transiently, while memory is handed over between trackers.
    pub fn release(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        self.inner
            .used
            .fetch_sub(to_signed(bytes), Ordering::Relaxed);
        if let Some(parent) = &self.inner.parent {
            parent.release(bytes);
        }
    }

    /// Deregisters the pool from the registry that created it.
    ///
    /// Idempotent. The pool stays usable for trackers still holding it, it
    /// just won't be listed anymore.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let used = self.used();
        if used != 0 {
            warn!(
                "Memory pool '{}' closed while {} bytes are still in use",
                self.name(),
                used
            );
        }
        if let Some(registration) = &self.inner.registration {
            registration.deregister();
        }
        debug!("Closed memory pool '{}'", self.name());
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }

    /// Whether both handles refer to the same pool.
    #[inline]
    pub fn ptr_eq(&self, other: &MemoryPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// The pool that turned a reservation down and its state at that moment.
struct Rejection<'a> {
    name: &'a str,
    used: i64,
    capacity: i64,
}

fn capacity_from(capacity: usize) -> i64 {
    if capacity == 0 {
        UNBOUNDED
    } else {
        to_signed(capacity)
    }
}

fn display_capacity(capacity: usize) -> String {
    if capacity == 0 {
        "unbounded".to_owned()
    } else {
        ByteSize(capacity as u64).to_string()
    }
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("name", &self.inner.name)
            .field("group", &self.inner.group)
            .field("used", &self.used())
            .field("capacity", &self.capacity())
            .field("parent", &self.parent().map(MemoryPool::name))
            .finish()
    }
}

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<MemoryPool>();
};

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn pool(capacity: usize) -> MemoryPool {
        MemoryPool::new(MemoryGroup::Other, "test", capacity)
    }

    #[test]
    fn bounded_pool_reserve_and_release() {
        let pool = pool(10);
        assert_eq!(pool.capacity(), Some(10));
        assert_eq!(pool.total_size(), 10);

        pool.reserve(5).unwrap();
        pool.reserve(5).unwrap();
        assert_eq!(pool.used(), 10);
        assert_eq!(pool.free(), 0);

        let err = pool.reserve(1).unwrap_err();
        assert!(err.to_string().contains("10"), "{err}");
        assert_eq!(err.label, "test");
        assert_eq!(err.limit, 10);
        assert_eq!(pool.used(), 10);

        pool.release(5);
        assert_eq!(pool.used(), 5);
        assert_eq!(pool.free(), 5);

        pool.reserve(1).unwrap();
        assert_eq!(pool.used(), 6);
        assert_eq!(pool.free(), 4);
    }

    #[test]
    fn unbounded_pool_counts_but_never_rejects() {
        let pool = MemoryPool::unbounded(MemoryGroup::Other, "unbounded");
        assert!(pool.is_unbounded());
        assert_eq!(pool.capacity(), None);

        pool.reserve(1 << 40).unwrap();
        pool.reserve(1 << 40).unwrap();
        pool.reserve(1000).unwrap();
        assert_eq!(pool.used(), (1 << 41) + 1000);

        pool.release(1 << 41);
        pool.release(1000);
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn unbounded_pool_saturates_instead_of_rejecting() {
        let pool = MemoryPool::unbounded(MemoryGroup::Other, "unbounded");

        pool.reserve(usize::MAX / 2).unwrap();
        pool.reserve(usize::MAX / 2).unwrap();
        assert_eq!(pool.used(), i64::MAX);

        // a sub-pool below an unbounded parent is not held back by the parent
        let child = MemoryPool::create(
            MemoryGroup::Transaction,
            "child".to_owned(),
            0,
            Some(pool.clone()),
            None,
        );
        child.reserve(1000).unwrap();
        assert_eq!(child.used(), 1000);
        assert_eq!(pool.used(), i64::MAX);
    }

    #[test]
    fn fallible_reservation_without_error() {
        let parent = pool(10);
        let child = MemoryPool::create(
            MemoryGroup::Transaction,
            "child".to_owned(),
            0,
            Some(parent.clone()),
            None,
        );

        assert!(!child.try_reserve(11));
        assert_eq!(child.used(), 0);
        assert_eq!(parent.used(), 0);

        assert!(child.try_reserve(10));
        assert_eq!(child.used(), 10);
        assert_eq!(parent.used(), 10);
    }

    #[test]
    fn zero_reservation_is_a_noop() {
        let pool = pool(1);
        pool.reserve(1).unwrap();
        pool.reserve(0).unwrap();
        pool.release(0);
        assert_eq!(pool.used(), 1);
    }

    #[test]
    fn release_may_transiently_go_negative() {
        let pool = pool(10);
        pool.release(4);
        assert_eq!(pool.used(), -4);
        pool.reserve(4).unwrap();
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn sub_pool_reserves_on_parent() {
        let parent = pool(100);
        let child = MemoryPool::create(
            MemoryGroup::Transaction,
            "child".to_owned(),
            50,
            Some(parent.clone()),
            None,
        );

        child.reserve(30).unwrap();
        assert_eq!(child.used(), 30);
        assert_eq!(parent.used(), 30);

        child.release(10);
        assert_eq!(child.used(), 20);
        assert_eq!(parent.used(), 20);

        child.release(20);
        assert_eq!(parent.used(), 0);
    }

    #[test]
    fn parent_rejection_leaves_child_untouched() {
        let parent = pool(10);
        let child = MemoryPool::create(
            MemoryGroup::Transaction,
            "child".to_owned(),
            0,
            Some(parent.clone()),
            None,
        );
        parent.reserve(8).unwrap();

        let err = child.reserve(5).unwrap_err();
        assert_eq!(err.label, "test");
        assert_eq!(child.used(), 0);
        assert_eq!(parent.used(), 8);
    }

    #[test]
    fn child_rejection_rolls_back_parent() {
        let parent = pool(100);
        let child = MemoryPool::create(
            MemoryGroup::Transaction,
            "child".to_owned(),
            10,
            Some(parent.clone()),
            None,
        );

        let err = child.reserve(11).unwrap_err();
        assert_eq!(err.label, "child");
        assert_eq!(child.used(), 0);
        assert_eq!(parent.used(), 0);
    }

    #[test]
    fn set_capacity_applies_to_new_reservations() {
        let pool = pool(100);
        pool.reserve(60).unwrap();

        pool.set_capacity(50);
        assert!(pool.reserve(1).is_err());
        assert_eq!(pool.free(), 0);

        pool.set_capacity(0);
        assert!(pool.is_unbounded());
        pool.reserve(1000).unwrap();

        pool.release(1060);
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn concurrent_reservations_never_exceed_capacity() {
        let pool = pool(1000);
        let granted = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..500 {
                        if pool.reserve(1).is_ok() {
                            granted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(granted.load(Ordering::Relaxed), 1000);
        assert_eq!(pool.used(), 1000);
    }

    #[test]
    fn concurrent_reserve_release_balances() {
        let parent = pool(0);
        let child = MemoryPool::create(
            MemoryGroup::Transaction,
            "child".to_owned(),
            64,
            Some(parent.clone()),
            None,
        );

        std::thread::scope(|s| {
            for i in 1..=4usize {
                let child = child.clone();
                let parent = parent.clone();
                s.spawn(move || {
                    for _ in 0..1000 {
                        if child.reserve(i).is_ok() {
                            assert!(child.used() <= 64);
                            assert!(parent.used() >= 0);
                            child.release(i);
                        }
                    }
                });
            }
        });

        assert_eq!(child.used(), 0);
        assert_eq!(parent.used(), 0);
    }
}
