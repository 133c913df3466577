// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use crate::{MemoryKind, MemoryLimitExceeded};

/// Accounting of the memory used by a single owner (a query, a transaction, a
/// worker).
///
/// Trackers are not synchronized. They take `&mut self` and are meant to be
/// driven by the one task that owns them. Shared state, if any, lives in the
/// [`MemoryPool`](crate::MemoryPool)s they reserve from.
///
/// A failing `allocate_*` call leaves the tracker and everything behind it
/// exactly as it was before the call. Releases never fail. Calling any method
/// on a closed tracker is a programming error and panics.
pub trait MemoryTracker {
    fn allocate_heap(&mut self, bytes: usize) -> Result<(), MemoryLimitExceeded>;

    fn release_heap(&mut self, bytes: usize);

    fn allocate_native(&mut self, bytes: usize) -> Result<(), MemoryLimitExceeded>;

    fn release_native(&mut self, bytes: usize);

    /// Net heap bytes accounted by this tracker. Negative after the tracker
    /// received more releases than allocations (memory handed over from
    /// another tracker).
    fn estimated_heap_memory(&self) -> i64;

    fn used_native_memory(&self) -> i64;

    /// Peak of [`estimated_heap_memory`](Self::estimated_heap_memory) since the
    /// tracker was created.
    fn heap_high_water_mark(&self) -> i64;

    /// Gives back what this tracker holds so that it can be reused. Once
    /// every allocation was released this leaves all counters at zero.
    fn reset(&mut self);

    fn allocate(&mut self, kind: MemoryKind, bytes: usize) -> Result<(), MemoryLimitExceeded> {
        match kind {
            MemoryKind::Heap => self.allocate_heap(bytes),
            MemoryKind::Native => self.allocate_native(bytes),
        }
    }

    fn release(&mut self, kind: MemoryKind, bytes: usize) {
        match kind {
            MemoryKind::Heap => self.release_heap(bytes),
            MemoryKind::Native => self.release_native(bytes),
        }
    }

    fn used(&self, kind: MemoryKind) -> i64 {
        match kind {
            MemoryKind::Heap => self.estimated_heap_memory(),
            MemoryKind::Native => self.used_native_memory(),
        }
    }
}

impl<T: MemoryTracker + ?Sized> MemoryTracker for &mut T {
    #[inline]
    fn allocate_heap(&mut self, bytes: usize) -> Result<(), MemoryLimitExceeded> {
        (**self).allocate_heap(bytes)
    }

    #[inline]
    fn release_heap(&mut self, bytes: usize) {
        (**self).release_heap(bytes)
    }

    #[inline]
    fn allocate_native(&mut self, bytes: usize) -> Result<(), MemoryLimitExceeded> {
        (**self).allocate_native(bytes)
    }

    #[inline]
    fn release_native(&mut self, bytes: usize) {
        (**self).release_native(bytes)
    }

    fn estimated_heap_memory(&self) -> i64 {
        (**self).estimated_heap_memory()
    }

    fn used_native_memory(&self) -> i64 {
        (**self).used_native_memory()
    }

    fn heap_high_water_mark(&self) -> i64 {
        (**self).heap_high_water_mark()
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

impl<T: MemoryTracker + ?Sized> MemoryTracker for Box<T> {
    #[inline]
    fn allocate_heap(&mut self, bytes: usize) -> Result<(), MemoryLimitExceeded> {
        (**self).allocate_heap(bytes)
    }

    #[inline]
    fn release_heap(&mut self, bytes: usize) {
        (**self).release_heap(bytes)
    }

    #[inline]
    fn allocate_native(&mut self, bytes: usize) -> Result<(), MemoryLimitExceeded> {
        (**self).allocate_native(bytes)
    }

    #[inline]
    fn release_native(&mut self, bytes: usize) {
        (**self).release_native(bytes)
    }

    fn estimated_heap_memory(&self) -> i64 {
        (**self).estimated_heap_memory()
    }

    fn used_native_memory(&self) -> i64 {
        (**self).used_native_memory()
    }

    fn heap_high_water_mark(&self) -> i64 {
        (**self).heap_high_water_mark()
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

/// A tracker that records nothing and never rejects.
///
/// Handed out when memory tracking is disabled.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EmptyMemoryTracker;

impl MemoryTracker for EmptyMemoryTracker {
    #[inline]
    fn allocate_heap(&mut self, _bytes: usize) -> Result<(), MemoryLimitExceeded> {
        Ok(())
    }

    #[inline]
    fn release_heap(&mut self, _bytes: usize) {}

    #[inline]
    fn allocate_native(&mut self, _bytes: usize) -> Result<(), MemoryLimitExceeded> {
        Ok(())
    }

    #[inline]
    fn release_native(&mut self, _bytes: usize) {}

    fn estimated_heap_memory(&self) -> i64 {
        0
    }

    fn used_native_memory(&self) -> i64 {
        0
    }

    fn heap_high_water_mark(&self) -> i64 {
        0
    }

    fn reset(&mut self) {}
}
