// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Trackers bracketing a sub-operation.
//!
//! A scope forwards everything to the tracker it wraps and remembers its own
//! net delta, so that closing it gives back exactly what was charged through
//! it and nothing the wrapped tracker held before.
//!
//! - [`ScopedMemoryTracker`] always forwards to its outer tracker.
//! - [`DualScopedMemoryTracker`] can temporarily redirect to an inner tracker.
//!   Detaching the inner tracker moves what was charged to it onto the outer
//!   one.
//! - [`RebindableScopedMemoryTracker`] detaches inner trackers without moving
//!   anything. What is left behind on them is carried and must add up to zero
//!   by the time the scope is closed.
//!
//! Scopes wrap any [`MemoryTracker`], owned or borrowed (`&mut T`).

use tracing::warn;

use crate::pool::to_signed;
use crate::{MemoryKind, MemoryLimitExceeded, MemoryTracker};

/// Setting label reported when a scope's own heap limit is hit.
pub const SCOPE_LIMIT_SETTING: &str = "scope-memory-limit";

const KINDS: [MemoryKind; 2] = [MemoryKind::Heap, MemoryKind::Native];

/// Net bytes charged through a scope, per dimension.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delta {
    pub heap: i64,
    pub native: i64,
}

impl Delta {
    pub fn get(&self, kind: MemoryKind) -> i64 {
        match kind {
            MemoryKind::Heap => self.heap,
            MemoryKind::Native => self.native,
        }
    }

    fn get_mut(&mut self, kind: MemoryKind) -> &mut i64 {
        match kind {
            MemoryKind::Heap => &mut self.heap,
            MemoryKind::Native => &mut self.native,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.heap == 0 && self.native == 0
    }

    fn add(&mut self, other: Delta) {
        self.heap += other.heap;
        self.native += other.native;
    }
}

/// Undoes `net` on `tracker`. Releases go first, so that taking back memory
/// that was released through the scope finds as much room as possible.
pub(crate) fn give_back<T: MemoryTracker + ?Sized>(tracker: &mut T, net: Delta) {
    for kind in KINDS {
        let delta = net.get(kind);
        if delta > 0 {
            tracker.release(kind, delta.unsigned_abs() as usize);
        }
    }
    for kind in KINDS {
        let delta = net.get(kind);
        if delta < 0
            && let Err(err) = tracker.allocate(kind, delta.unsigned_abs() as usize)
        {
            warn!(%kind, %err, "Could not take back memory released through this tracker");
        }
    }
}

/// Moves `delta` from `from` onto `to`. Either everything is moved or both
/// trackers are left untouched.
fn transfer<F, T>(from: &mut F, to: &mut T, delta: Delta) -> Result<(), MemoryLimitExceeded>
where
    F: MemoryTracker + ?Sized,
    T: MemoryTracker + ?Sized,
{
    // the side that receives memory is charged first, both dimensions
    let mut charged = Vec::with_capacity(KINDS.len());
    for kind in KINDS {
        let amount = delta.get(kind);
        let bytes = amount.unsigned_abs() as usize;
        let result = match amount.signum() {
            1 => to.allocate(kind, bytes),
            -1 => from.allocate(kind, bytes),
            _ => continue,
        };
        if let Err(err) = result {
            for (kind, amount) in charged {
                uncharge(from, to, kind, amount);
            }
            return Err(err);
        }
        charged.push((kind, amount));
    }

    for (kind, amount) in charged {
        let bytes = amount.unsigned_abs() as usize;
        if amount > 0 {
            from.release(kind, bytes);
        } else {
            to.release(kind, bytes);
        }
    }
    Ok(())
}

fn uncharge<F, T>(from: &mut F, to: &mut T, kind: MemoryKind, amount: i64)
where
    F: MemoryTracker + ?Sized,
    T: MemoryTracker + ?Sized,
{
    let bytes = amount.unsigned_abs() as usize;
    if amount > 0 {
        to.release(kind, bytes);
    } else {
        from.release(kind, bytes);
    }
}

/// A scope that forwards to its outer tracker and gives back its net delta on
/// [`close`](Self::close).
pub struct ScopedMemoryTracker<T: MemoryTracker> {
    outer: T,
    net: Delta,
    heap_limit: Option<usize>,
    heap_high_water_mark: i64,
    closed: bool,
}

impl<T: MemoryTracker> ScopedMemoryTracker<T> {
    pub fn new(outer: T) -> Self {
        Self {
            outer,
            net: Delta::default(),
            heap_limit: None,
            heap_high_water_mark: 0,
            closed: false,
        }
    }

    /// A scope that additionally caps its own net heap usage.
    pub fn with_limit(outer: T, heap_limit: usize) -> Self {
        Self {
            outer,
            net: Delta::default(),
            heap_limit: Some(heap_limit),
            heap_high_water_mark: 0,
            closed: false,
        }
    }

    pub fn outer(&self) -> &T {
        &self.outer
    }

    pub fn net(&self) -> Delta {
        self.net
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Gives back the net delta to the outer tracker.
    ///
    /// # Panics
    ///
    /// If the scope is already closed.
    pub fn close(&mut self) {
        assert!(!self.closed, "memory tracker scope already closed");
        give_back(&mut self.outer, std::mem::take(&mut self.net));
        self.closed = true;
    }

    fn assert_open(&self) {
        assert!(!self.closed, "memory tracker scope is closed");
    }

    fn allocate_kind(
        &mut self,
        kind: MemoryKind,
        bytes: usize,
    ) -> Result<(), MemoryLimitExceeded> {
        self.assert_open();
        if bytes == 0 {
            return Ok(());
        }
        let new_net = self.net.get(kind).saturating_add(to_signed(bytes));
        if kind == MemoryKind::Heap
            && let Some(limit) = self.heap_limit
            && new_net > to_signed(limit)
        {
            return Err(MemoryLimitExceeded::local(
                kind,
                SCOPE_LIMIT_SETTING,
                bytes,
                self.net.heap,
                limit,
            ));
        }
        self.outer.allocate(kind, bytes)?;
        *self.net.get_mut(kind) = new_net;
        if kind == MemoryKind::Heap {
            self.heap_high_water_mark = self.heap_high_water_mark.max(new_net);
        }
        Ok(())
    }

    fn release_kind(&mut self, kind: MemoryKind, bytes: usize) {
        self.assert_open();
        if bytes == 0 {
            return;
        }
        self.outer.release(kind, bytes);
        *self.net.get_mut(kind) -= to_signed(bytes);
    }
}

impl<T: MemoryTracker> MemoryTracker for ScopedMemoryTracker<T> {
    fn allocate_heap(&mut self, bytes: usize) -> Result<(), MemoryLimitExceeded> {
        self.allocate_kind(MemoryKind::Heap, bytes)
    }

    fn release_heap(&mut self, bytes: usize) {
        self.release_kind(MemoryKind::Heap, bytes)
    }

    fn allocate_native(&mut self, bytes: usize) -> Result<(), MemoryLimitExceeded> {
        self.allocate_kind(MemoryKind::Native, bytes)
    }

    fn release_native(&mut self, bytes: usize) {
        self.release_kind(MemoryKind::Native, bytes)
    }

    fn estimated_heap_memory(&self) -> i64 {
        self.net.heap
    }

    fn used_native_memory(&self) -> i64 {
        self.net.native
    }

    fn heap_high_water_mark(&self) -> i64 {
        self.heap_high_water_mark
    }

    fn reset(&mut self) {
        self.assert_open();
        give_back(&mut self.outer, std::mem::take(&mut self.net));
    }
}

impl<T: MemoryTracker> Drop for ScopedMemoryTracker<T> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if !self.net.is_zero() {
            warn!(net = ?self.net, "Memory tracker scope dropped without being closed");
        }
        give_back(&mut self.outer, std::mem::take(&mut self.net));
    }
}

/// State shared by the scopes with an inner slot.
struct DelegateSlots<O, I> {
    outer: O,
    inner: Option<I>,
    outer_net: Delta,
    inner_net: Delta,
    heap_high_water_mark: i64,
    closed: bool,
}

impl<O: MemoryTracker, I: MemoryTracker> DelegateSlots<O, I> {
    fn new(outer: O) -> Self {
        Self {
            outer,
            inner: None,
            outer_net: Delta::default(),
            inner_net: Delta::default(),
            heap_high_water_mark: 0,
            closed: false,
        }
    }

    fn assert_open(&self) {
        assert!(!self.closed, "memory tracker scope is closed");
    }

    fn set_inner(&mut self, inner: I) {
        self.assert_open();
        assert!(self.inner.is_none(), "inner delegate already set");
        self.inner = Some(inner);
        self.inner_net = Delta::default();
    }

    fn allocate(
        &mut self,
        kind: MemoryKind,
        bytes: usize,
        bypass_inner: bool,
        carried: Delta,
    ) -> Result<(), MemoryLimitExceeded> {
        self.assert_open();
        if bytes == 0 {
            return Ok(());
        }
        let net = match &mut self.inner {
            Some(inner) if !bypass_inner => {
                inner.allocate(kind, bytes)?;
                &mut self.inner_net
            }
            _ => {
                self.outer.allocate(kind, bytes)?;
                &mut self.outer_net
            }
        };
        *net.get_mut(kind) += to_signed(bytes);
        if kind == MemoryKind::Heap {
            let total = self.total(carried).heap;
            self.heap_high_water_mark = self.heap_high_water_mark.max(total);
        }
        Ok(())
    }

    fn release(&mut self, kind: MemoryKind, bytes: usize, bypass_inner: bool) {
        self.assert_open();
        if bytes == 0 {
            return;
        }
        let net = match &mut self.inner {
            Some(inner) if !bypass_inner => {
                inner.release(kind, bytes);
                &mut self.inner_net
            }
            _ => {
                self.outer.release(kind, bytes);
                &mut self.outer_net
            }
        };
        *net.get_mut(kind) -= to_signed(bytes);
    }

    fn total(&self, carried: Delta) -> Delta {
        let mut total = self.outer_net;
        total.add(self.inner_net);
        total.add(carried);
        total
    }

    /// Gives back everything charged through the scope to the delegates it
    /// was charged to.
    fn give_back(&mut self) {
        if let Some(inner) = &mut self.inner {
            give_back(inner, std::mem::take(&mut self.inner_net));
        }
        give_back(&mut self.outer, std::mem::take(&mut self.outer_net));
    }
}

/// A scope with an outer tracker and an optional inner tracker.
///
/// While an inner tracker is set, allocations and releases go to it; the
/// `*_outer` methods always go to the outer tracker. Detaching the inner
/// tracker with [`close_inner`](Self::close_inner) moves its net delta onto
/// the outer tracker.
pub struct DualScopedMemoryTracker<O: MemoryTracker, I: MemoryTracker> {
    slots: DelegateSlots<O, I>,
}

impl<O: MemoryTracker, I: MemoryTracker> DualScopedMemoryTracker<O, I> {
    pub fn new(outer: O) -> Self {
        Self {
            slots: DelegateSlots::new(outer),
        }
    }

    pub fn outer(&self) -> &O {
        &self.slots.outer
    }

    pub fn inner(&self) -> Option<&I> {
        self.slots.inner.as_ref()
    }

    pub fn has_inner_delegate(&self) -> bool {
        self.slots.inner.is_some()
    }

    /// # Panics
    ///
    /// If an inner tracker is already set or the scope is closed.
    pub fn set_inner_delegate(&mut self, inner: I) {
        self.slots.set_inner(inner);
    }

    /// Detaches the inner tracker, moving its net delta onto the outer
    /// tracker.
    ///
    /// Fails if the outer tracker (or the inner one, for memory released
    /// through it) can't take the delta. The inner tracker then stays attached
    /// and nothing changes.
    pub fn close_inner(&mut self) -> Result<Option<I>, MemoryLimitExceeded> {
        let slots = &mut self.slots;
        slots.assert_open();
        let Some(inner) = &mut slots.inner else {
            return Ok(None);
        };
        transfer(inner, &mut slots.outer, slots.inner_net)?;
        slots.outer_net.add(std::mem::take(&mut slots.inner_net));
        Ok(slots.inner.take())
    }

    pub fn allocate_heap_outer(&mut self, bytes: usize) -> Result<(), MemoryLimitExceeded> {
        self.slots
            .allocate(MemoryKind::Heap, bytes, true, Delta::default())
    }

    pub fn release_heap_outer(&mut self, bytes: usize) {
        self.slots.release(MemoryKind::Heap, bytes, true)
    }

    pub fn allocate_native_outer(&mut self, bytes: usize) -> Result<(), MemoryLimitExceeded> {
        self.slots
            .allocate(MemoryKind::Native, bytes, true, Delta::default())
    }

    pub fn release_native_outer(&mut self, bytes: usize) {
        self.slots.release(MemoryKind::Native, bytes, true)
    }

    /// Net delta of the scope over both trackers.
    pub fn net(&self) -> Delta {
        self.slots.total(Delta::default())
    }

    pub fn is_closed(&self) -> bool {
        self.slots.closed
    }

    /// Gives back the net delta to the trackers it was charged to. The inner
    /// tracker, if still set, is dropped.
    ///
    /// # Panics
    ///
    /// If the scope is already closed.
    pub fn close(&mut self) {
        assert!(!self.slots.closed, "memory tracker scope already closed");
        self.slots.give_back();
        self.slots.inner = None;
        self.slots.closed = true;
    }
}

impl<O: MemoryTracker, I: MemoryTracker> MemoryTracker for DualScopedMemoryTracker<O, I> {
    fn allocate_heap(&mut self, bytes: usize) -> Result<(), MemoryLimitExceeded> {
        self.slots
            .allocate(MemoryKind::Heap, bytes, false, Delta::default())
    }

    fn release_heap(&mut self, bytes: usize) {
        self.slots.release(MemoryKind::Heap, bytes, false)
    }

    fn allocate_native(&mut self, bytes: usize) -> Result<(), MemoryLimitExceeded> {
        self.slots
            .allocate(MemoryKind::Native, bytes, false, Delta::default())
    }

    fn release_native(&mut self, bytes: usize) {
        self.slots.release(MemoryKind::Native, bytes, false)
    }

    fn estimated_heap_memory(&self) -> i64 {
        self.net().heap
    }

    fn used_native_memory(&self) -> i64 {
        self.net().native
    }

    fn heap_high_water_mark(&self) -> i64 {
        self.slots.heap_high_water_mark
    }

    fn reset(&mut self) {
        self.slots.assert_open();
        self.slots.give_back();
    }
}

impl<O: MemoryTracker, I: MemoryTracker> Drop for DualScopedMemoryTracker<O, I> {
    fn drop(&mut self) {
        if self.slots.closed {
            return;
        }
        let net = self.net();
        if !net.is_zero() {
            warn!(?net, "Memory tracker scope dropped without being closed");
        }
        self.slots.give_back();
    }
}

/// A scope whose inner tracker can be replaced any number of times.
///
/// Detaching an inner tracker leaves its net delta on it and adds it to the
/// unreleased inner scope memory. Later inner trackers are expected to settle
/// it, e.g. by releasing what an earlier one allocated. Closing the scope
/// while any of it remains is a bug in the caller and panics.
pub struct RebindableScopedMemoryTracker<O: MemoryTracker, I: MemoryTracker> {
    slots: DelegateSlots<O, I>,
    unreleased_inner: Delta,
}

impl<O: MemoryTracker, I: MemoryTracker> RebindableScopedMemoryTracker<O, I> {
    pub fn new(outer: O) -> Self {
        Self {
            slots: DelegateSlots::new(outer),
            unreleased_inner: Delta::default(),
        }
    }

    pub fn outer(&self) -> &O {
        &self.slots.outer
    }

    pub fn inner(&self) -> Option<&I> {
        self.slots.inner.as_ref()
    }

    pub fn has_inner_delegate(&self) -> bool {
        self.slots.inner.is_some()
    }

    /// # Panics
    ///
    /// If an inner tracker is already set or the scope is closed.
    pub fn set_inner_delegate(&mut self, inner: I) {
        self.slots.set_inner(inner);
    }

    /// Detaches the inner tracker, carrying over its net delta.
    pub fn close_inner(&mut self) -> Option<I> {
        self.slots.assert_open();
        self.detach_inner()
    }

    fn detach_inner(&mut self) -> Option<I> {
        let inner = self.slots.inner.take()?;
        self.unreleased_inner
            .add(std::mem::take(&mut self.slots.inner_net));
        Some(inner)
    }

    pub fn unreleased_inner_scope_heap(&self) -> i64 {
        self.unreleased_inner.heap
    }

    pub fn unreleased_inner_scope_native(&self) -> i64 {
        self.unreleased_inner.native
    }

    pub fn allocate_heap_outer(&mut self, bytes: usize) -> Result<(), MemoryLimitExceeded> {
        self.slots
            .allocate(MemoryKind::Heap, bytes, true, self.unreleased_inner)
    }

    pub fn release_heap_outer(&mut self, bytes: usize) {
        self.slots.release(MemoryKind::Heap, bytes, true)
    }

    pub fn allocate_native_outer(&mut self, bytes: usize) -> Result<(), MemoryLimitExceeded> {
        self.slots
            .allocate(MemoryKind::Native, bytes, true, self.unreleased_inner)
    }

    pub fn release_native_outer(&mut self, bytes: usize) {
        self.slots.release(MemoryKind::Native, bytes, true)
    }

    /// Net delta of the scope over the outer tracker, the current inner
    /// tracker and the ones detached before.
    pub fn net(&self) -> Delta {
        self.slots.total(self.unreleased_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.slots.closed
    }

    /// Detaches the inner tracker, if any, and gives back the net delta of the
    /// outer tracker.
    ///
    /// # Panics
    ///
    /// If the scope is already closed, or if inner trackers were left with
    /// unreleased memory.
    pub fn close(&mut self) {
        assert!(!self.slots.closed, "memory tracker scope already closed");
        self.detach_inner();
        assert!(
            self.unreleased_inner.native == 0,
            "unreleased inner scope native memory: {} bytes",
            self.unreleased_inner.native
        );
        assert!(
            self.unreleased_inner.heap == 0,
            "unreleased inner scope heap memory: {} bytes",
            self.unreleased_inner.heap
        );
        self.slots.give_back();
        self.slots.closed = true;
    }
}

impl<O: MemoryTracker, I: MemoryTracker> MemoryTracker for RebindableScopedMemoryTracker<O, I> {
    fn allocate_heap(&mut self, bytes: usize) -> Result<(), MemoryLimitExceeded> {
        self.slots
            .allocate(MemoryKind::Heap, bytes, false, self.unreleased_inner)
    }

    fn release_heap(&mut self, bytes: usize) {
        self.slots.release(MemoryKind::Heap, bytes, false)
    }

    fn allocate_native(&mut self, bytes: usize) -> Result<(), MemoryLimitExceeded> {
        self.slots
            .allocate(MemoryKind::Native, bytes, false, self.unreleased_inner)
    }

    fn release_native(&mut self, bytes: usize) {
        self.slots.release(MemoryKind::Native, bytes, false)
    }

    fn estimated_heap_memory(&self) -> i64 {
        self.net().heap
    }

    fn used_native_memory(&self) -> i64 {
        self.net().native
    }

    fn heap_high_water_mark(&self) -> i64 {
        self.slots.heap_high_water_mark
    }

    /// Gives back what is charged to the outer and the current inner tracker.
    /// Memory left on detached inner trackers stays carried.
    fn reset(&mut self) {
        self.slots.assert_open();
        self.slots.give_back();
    }
}

impl<O: MemoryTracker, I: MemoryTracker> Drop for RebindableScopedMemoryTracker<O, I> {
    fn drop(&mut self) {
        if self.slots.closed {
            return;
        }
        if !self.unreleased_inner.is_zero() {
            warn!(
                unreleased = ?self.unreleased_inner,
                "Memory tracker scope dropped with unreleased inner scope memory"
            );
        }
        self.slots.give_back();
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use memledger_types::MemoryGroup;

    use super::*;
    use crate::{DEFAULT_LIMIT_SETTING, LocalMemoryTracker, MemoryPool};

    fn tracker() -> LocalMemoryTracker {
        LocalMemoryTracker::unlimited()
    }

    #[test]
    fn scope_changes_outer_by_its_net_delta() -> Result<()> {
        let mut outer = tracker();
        outer.allocate_heap(100)?;

        let mut scope = ScopedMemoryTracker::new(&mut outer);
        scope.allocate_heap(50)?;
        scope.release_heap(20);
        scope.allocate_native(10)?;
        verify_that!(scope.estimated_heap_memory(), eq(30))?;
        verify_that!(scope.outer().estimated_heap_memory(), eq(130))?;
        verify_that!(scope.outer().used_native_memory(), eq(10))?;
        verify_that!(scope.heap_high_water_mark(), eq(50))?;

        scope.close();
        drop(scope);
        verify_that!(outer.estimated_heap_memory(), eq(100))?;
        verify_that!(outer.used_native_memory(), eq(0))
    }

    #[test]
    fn scope_takes_back_what_it_released() -> Result<()> {
        let pool = MemoryPool::new(MemoryGroup::Other, "scopes", 0);
        let mut outer = LocalMemoryTracker::new(Some(pool.clone()), None);
        outer.allocate_heap(100)?;

        let mut scope = ScopedMemoryTracker::new(&mut outer);
        scope.release_heap(30);
        verify_that!(scope.estimated_heap_memory(), eq(-30))?;
        verify_that!(pool.used(), eq(70))?;

        scope.close();
        drop(scope);
        verify_that!(outer.estimated_heap_memory(), eq(100))?;
        verify_that!(pool.used(), eq(100))
    }

    #[test]
    fn scope_limit_and_outer_limit_both_apply() -> Result<()> {
        let outer = LocalMemoryTracker::new(None, Some(15));
        let mut scope = ScopedMemoryTracker::with_limit(outer, 10);

        scope.allocate_heap(10)?;
        let err = scope.allocate_heap(1).unwrap_err();
        verify_that!(err.label.as_str(), eq(SCOPE_LIMIT_SETTING))?;

        let err = scope.allocate_native(16).unwrap_err();
        verify_that!(err.label.as_str(), eq(DEFAULT_LIMIT_SETTING))?;
        verify_that!(scope.used_native_memory(), eq(0))?;
        verify_that!(scope.outer().estimated_heap_memory(), eq(10))
    }

    #[test]
    fn scope_reset_keeps_it_open() -> Result<()> {
        let mut scope = ScopedMemoryTracker::new(tracker());
        scope.allocate_heap(10)?;
        scope.reset();
        verify_that!(scope.outer().estimated_heap_memory(), eq(0))?;
        scope.allocate_heap(5)?;
        verify_that!(scope.net(), eq(Delta { heap: 5, native: 0 }))
    }

    #[test]
    fn dropped_scope_gives_back() -> Result<()> {
        let mut outer = tracker();
        {
            let mut scope = ScopedMemoryTracker::new(&mut outer);
            scope.allocate_native(8)?;
        }
        verify_that!(outer.used_native_memory(), eq(0))
    }

    #[test]
    #[should_panic(expected = "already closed")]
    fn double_close_panics() {
        let mut scope = ScopedMemoryTracker::new(tracker());
        scope.close();
        scope.close();
    }

    #[test]
    #[should_panic(expected = "closed")]
    fn allocate_after_close_panics() {
        let mut scope = ScopedMemoryTracker::new(tracker());
        scope.close();
        let _ = scope.allocate_heap(1);
    }

    #[test]
    #[should_panic(expected = "closed")]
    fn release_after_close_panics() {
        let mut scope = ScopedMemoryTracker::new(tracker());
        scope.close();
        scope.release_native(1);
    }

    #[test]
    #[should_panic(expected = "closed")]
    fn reset_after_close_panics() {
        let mut scope = ScopedMemoryTracker::new(tracker());
        scope.close();
        scope.reset();
    }

    #[test]
    fn inner_delegate_receives_allocations() -> Result<()> {
        let mut scope = DualScopedMemoryTracker::new(tracker());
        scope.allocate_heap(5)?;

        scope.set_inner_delegate(tracker());
        verify_that!(scope.has_inner_delegate(), eq(true))?;
        scope.allocate_heap(40)?;
        scope.allocate_native(4)?;
        scope.allocate_heap_outer(3)?;
        verify_that!(scope.inner().map(|t| t.estimated_heap_memory()), some(eq(40)))?;
        verify_that!(scope.outer().estimated_heap_memory(), eq(8))?;
        verify_that!(scope.estimated_heap_memory(), eq(48))?;
        verify_that!(scope.heap_high_water_mark(), eq(48))?;

        let inner = scope.close_inner()?;
        let inner = inner.expect("inner delegate was set");
        verify_that!(inner.estimated_heap_memory(), eq(0))?;
        verify_that!(inner.used_native_memory(), eq(0))?;
        verify_that!(scope.outer().estimated_heap_memory(), eq(48))?;
        verify_that!(scope.outer().used_native_memory(), eq(4))?;
        verify_that!(scope.estimated_heap_memory(), eq(48))?;

        // without inner delegate, allocations go to the outer one
        scope.release_heap(48);
        scope.release_native(4);
        verify_that!(scope.net(), eq(Delta::default()))?;
        scope.close();
        verify_that!(scope.outer().estimated_heap_memory(), eq(0))
    }

    #[test]
    fn failed_transfer_keeps_inner_attached() -> Result<()> {
        let mut scope = DualScopedMemoryTracker::new(LocalMemoryTracker::new(None, Some(30)));
        scope.set_inner_delegate(tracker());
        scope.allocate_heap(20)?;
        scope.allocate_native(40)?;

        let err = scope.close_inner().unwrap_err();
        verify_that!(err.kind, some(eq(MemoryKind::Native)))?;
        verify_that!(scope.has_inner_delegate(), eq(true))?;
        verify_that!(scope.outer().estimated_heap_memory(), eq(0))?;
        verify_that!(scope.inner().map(|t| t.estimated_heap_memory()), some(eq(20)))?;

        scope.release_native(40);
        let inner = scope.close_inner()?;
        verify_that!(inner.map(|t| t.estimated_heap_memory()), some(eq(0)))?;
        verify_that!(scope.outer().estimated_heap_memory(), eq(20))
    }

    #[test]
    fn close_inner_moves_released_memory_too() -> Result<()> {
        let mut outer = tracker();
        outer.allocate_heap(50)?;
        let mut scope: DualScopedMemoryTracker<_, LocalMemoryTracker> =
            DualScopedMemoryTracker::new(&mut outer);

        scope.set_inner_delegate(tracker());
        scope.release_heap(10);
        let inner = scope.close_inner()?.expect("inner delegate was set");
        verify_that!(inner.estimated_heap_memory(), eq(0))?;
        verify_that!(scope.outer().estimated_heap_memory(), eq(40))?;

        scope.close();
        drop(scope);
        verify_that!(outer.estimated_heap_memory(), eq(50))
    }

    #[test]
    #[should_panic(expected = "inner delegate already set")]
    fn setting_inner_twice_panics() {
        let mut scope = DualScopedMemoryTracker::new(tracker());
        scope.set_inner_delegate(tracker());
        scope.set_inner_delegate(tracker());
    }

    #[test]
    fn rebinding_carries_unreleased_inner_memory() -> Result<()> {
        let mut scope = RebindableScopedMemoryTracker::new(tracker());

        scope.set_inner_delegate(tracker());
        scope.allocate_heap(30)?;
        scope.allocate_native(7)?;
        let mut first = scope.close_inner().expect("inner delegate was set");
        verify_that!(first.estimated_heap_memory(), eq(30))?;
        verify_that!(scope.unreleased_inner_scope_heap(), eq(30))?;
        verify_that!(scope.unreleased_inner_scope_native(), eq(7))?;

        scope.set_inner_delegate(tracker());
        scope.release_heap(10);
        scope.allocate_native(3)?;
        scope.close_inner();
        verify_that!(scope.unreleased_inner_scope_heap(), eq(20))?;
        verify_that!(scope.unreleased_inner_scope_native(), eq(10))?;
        verify_that!(scope.estimated_heap_memory(), eq(20))?;

        scope.set_inner_delegate(tracker());
        scope.release_heap(20);
        scope.release_native(10);
        scope.allocate_heap_outer(5)?;
        verify_that!(scope.has_inner_delegate(), eq(true))?;
        scope.close();
        verify_that!(scope.outer().estimated_heap_memory(), eq(0))?;

        first.close();
        Ok(())
    }

    #[test]
    #[should_panic(expected = "unreleased inner scope native memory")]
    fn close_with_native_carry_panics() {
        let mut scope = RebindableScopedMemoryTracker::new(tracker());
        scope.set_inner_delegate(tracker());
        scope.allocate_heap(1).unwrap();
        scope.allocate_native(1).unwrap();
        let _inner = scope.close_inner();
        scope.close();
    }

    #[test]
    #[should_panic(expected = "unreleased inner scope heap memory")]
    fn close_with_heap_carry_panics() {
        let mut scope = RebindableScopedMemoryTracker::new(tracker());
        scope.set_inner_delegate(tracker());
        scope.allocate_heap(1).unwrap();
        scope.close();
    }

    #[test]
    #[should_panic(expected = "closed")]
    fn rebindable_use_after_close_panics() {
        let mut scope: RebindableScopedMemoryTracker<_, LocalMemoryTracker> =
            RebindableScopedMemoryTracker::new(tracker());
        scope.close();
        scope.release_heap(1);
    }
}
