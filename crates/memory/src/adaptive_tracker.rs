// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tracker that reserves from its pool in adaptively sized batches.
//!
//! A transaction typically performs thousands of small allocations. Forwarding
//! each of them to a pool shared by all transactions would turn the pool's
//! counter into a point of contention. The [`AdaptiveMemoryTracker`] instead
//! reserves memory in chunks ("grabs") and serves allocations out of the
//! unconsumed part of them (the credit). Releases are buffered the same way
//! and handed back to the pool in chunks ("flushes").
//!
//! Chunk sizes adapt to the allocation pattern. Starting at the configured
//! initial size, a chunk that was used up within a few calls (see
//! [`MemoryOptions::grab_growth_threshold`]) makes the next chunk grow to the
//! next power of two, up to the configured maximum. Grabs and flushes grow
//! independently and never shrink.
//!
//! [`MemoryOptions::grab_growth_threshold`]: memledger_types::config::MemoryOptions::grab_growth_threshold

use std::borrow::Cow;
use std::num::NonZeroU32;

use bytesize::ByteSize;
use tracing::{trace, warn};

use memledger_types::config::DEFAULT_GRAB_GROWTH_THRESHOLD;

use crate::local_tracker::DEFAULT_LIMIT_SETTING;
use crate::pool::{MemoryPool, to_signed};
use crate::{MemoryKind, MemoryLimitExceeded, MemoryTracker};

/// Adaptive chunk size for one direction (grab or flush) of one dimension.
#[derive(Debug, Clone, Copy)]
struct BatchSize {
    size: usize,
    max: usize,
    growth_threshold: u32,
    /// Batches handed out since creation or the last reset.
    batches: u32,
    /// Client calls since the last batch was handed out.
    calls: u32,
}

impl BatchSize {
    fn new(size: usize, max: usize, growth_threshold: u32) -> Self {
        let max = max.max(1);
        Self {
            size: size.clamp(1, max),
            max,
            growth_threshold,
            batches: 0,
            calls: 0,
        }
    }

    /// Size the next batch would have. The first two batches have the initial
    /// size.
    fn upcoming(&self) -> usize {
        if self.batches >= 2 && self.calls <= self.growth_threshold && self.size < self.max {
            (self.size + 1)
                .checked_next_power_of_two()
                .unwrap_or(self.max)
                .min(self.max)
        } else {
            self.size
        }
    }

    fn next_batch(&mut self) -> usize {
        self.size = self.upcoming();
        self.batches = self.batches.saturating_add(1);
        self.calls = 0;
        self.size
    }

    #[inline]
    fn record_call(&mut self) {
        self.calls = self.calls.saturating_add(1);
    }

    fn reset(&mut self) {
        self.batches = 0;
        self.calls = 0;
    }
}

/// Accounting of one dimension.
#[derive(Debug, Clone, Copy)]
struct Account {
    used: i64,
    /// Bytes held from the pool. Negative after memory reserved by another
    /// tracker was released to the pool through this one.
    reserved: i64,
    high_water_mark: i64,
    grab: BatchSize,
    flush: BatchSize,
}

impl Account {
    fn new(grab_size: usize, max_grab_size: usize, growth_threshold: u32) -> Self {
        let batch = BatchSize::new(grab_size, max_grab_size, growth_threshold);
        Self {
            used: 0,
            reserved: 0,
            high_water_mark: 0,
            grab: batch,
            flush: batch,
        }
    }

    #[inline]
    fn credit(&self) -> i64 {
        self.reserved - self.used
    }
}

/// A tracker that talks to its pool in adaptively sized chunks.
///
/// Enforces an optional local limit on heap and native memory independently.
/// Unconsumed credit is returned to the pool on [`reset`](MemoryTracker::reset).
/// Everything held from the pool is returned on [`close`](Self::close) or drop.
pub struct AdaptiveMemoryTracker {
    pool: Option<MemoryPool>,
    limit: Option<usize>,
    setting: Cow<'static, str>,
    heap: Account,
    native: Account,
    closed: bool,
}

impl AdaptiveMemoryTracker {
    pub fn new(
        pool: Option<MemoryPool>,
        limit: Option<usize>,
        grab_size: usize,
        max_grab_size: usize,
        setting: impl Into<Cow<'static, str>>,
    ) -> Self {
        let threshold = DEFAULT_GRAB_GROWTH_THRESHOLD;
        Self {
            pool,
            limit,
            setting: setting.into(),
            heap: Account::new(grab_size, max_grab_size, threshold),
            native: Account::new(grab_size, max_grab_size, threshold),
            closed: false,
        }
    }

    /// A tracker without local limit.
    pub fn unlimited(pool: MemoryPool, grab_size: usize, max_grab_size: usize) -> Self {
        Self::new(
            Some(pool),
            None,
            grab_size,
            max_grab_size,
            DEFAULT_LIMIT_SETTING,
        )
    }

    /// Number of calls within which a drained chunk makes the next one grow.
    pub fn with_growth_threshold(mut self, threshold: NonZeroU32) -> Self {
        for account in [&mut self.heap, &mut self.native] {
            account.grab.growth_threshold = threshold.get();
            account.flush.growth_threshold = threshold.get();
        }
        self
    }

    pub fn pool(&self) -> Option<&MemoryPool> {
        self.pool.as_ref()
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    /// Reserved heap bytes not yet consumed by allocations.
    pub fn heap_credit(&self) -> i64 {
        self.heap.credit()
    }

    pub fn native_credit(&self) -> i64 {
        self.native.credit()
    }

    /// Current chunk size of heap reservations.
    pub fn heap_grab_size(&self) -> usize {
        self.heap.grab.size
    }

    pub fn native_grab_size(&self) -> usize {
        self.native.grab.size
    }

    /// Current chunk size of heap flushes.
    pub fn heap_flush_size(&self) -> usize {
        self.heap.flush.size
    }

    pub fn native_high_water_mark(&self) -> i64 {
        self.native.high_water_mark
    }

    /// Returns everything held to the pool and marks the tracker closed.
    /// Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.give_back();
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn assert_open(&self) {
        assert!(!self.closed, "memory tracker is closed");
    }

    fn account(&mut self, kind: MemoryKind) -> &mut Account {
        match kind {
            MemoryKind::Heap => &mut self.heap,
            MemoryKind::Native => &mut self.native,
        }
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

        let account = *self.account(kind);
        let new_used = account.used.saturating_add(to_signed(bytes));
        if let Some(limit) = self.limit
            && new_used > to_signed(limit)
        {
            return Err(MemoryLimitExceeded::local(
                kind,
                &self.setting,
                bytes,
                account.used,
                limit,
            ));
        }

        let mut grab = account.grab;
        let mut reserved = account.reserved;
        let shortfall = new_used - reserved;
        if shortfall > 0 {
            let chunk = grab.next_batch();
            let shortfall = shortfall.unsigned_abs() as usize;
            let rounded = shortfall.checked_next_multiple_of(chunk).unwrap_or(shortfall);
            let amount = match &self.pool {
                Some(pool) if rounded > shortfall && pool.try_reserve(rounded) => rounded,
                // whole chunks don't fit, settle for what is needed
                Some(pool) => {
                    pool.reserve(shortfall).map_err(|err| err.with_kind(kind))?;
                    shortfall
                }
                None => rounded,
            };
            trace!(
                %kind,
                amount = %ByteSize(amount as u64),
                chunk = %ByteSize(chunk as u64),
                "Grabbed memory from pool"
            );
            reserved += to_signed(amount);
        }
        grab.record_call();

        let account = self.account(kind);
        account.grab = grab;
        account.reserved = reserved;
        account.used = new_used;
        account.high_water_mark = account.high_water_mark.max(new_used);
        Ok(())
    }

    fn release_kind(&mut self, kind: MemoryKind, bytes: usize) {
        self.assert_open();
        if bytes == 0 {
            return;
        }

        let account = self.account(kind);
        account.used = account.used.saturating_sub(to_signed(bytes));
        account.flush.record_call();

        // keep at most one chunk of credit around
        let excess = account.credit() - to_signed(account.flush.upcoming());
        if excess <= 0 {
            return;
        }
        let chunk = account.flush.next_batch();
        let excess = excess.unsigned_abs() as usize;
        let amount = excess.checked_next_multiple_of(chunk).unwrap_or(excess);
        account.reserved -= to_signed(amount);

        if let Some(pool) = &self.pool {
            pool.release(amount);
        }
        trace!(
            %kind,
            amount = %ByteSize(amount as u64),
            chunk = %ByteSize(chunk as u64),
            "Flushed memory to pool"
        );
    }

    /// Hands the unconsumed credit of both dimensions back to the pool in a
    /// single call. Live allocations stay reserved.
    fn return_credit(&mut self) {
        let mut credit = 0;
        for account in [&mut self.heap, &mut self.native] {
            credit += account.credit();
            account.reserved = account.used;
            account.grab.reset();
            account.flush.reset();
        }
        if credit > 0
            && let Some(pool) = &self.pool
        {
            pool.release(credit.unsigned_abs() as usize);
        }
    }

    /// Hands everything reserved back to the pool in a single call and zeroes
    /// usage. Chunk sizes and high-water marks are kept.
    fn give_back(&mut self) {
        let net = self.heap.reserved + self.native.reserved;
        for account in [&mut self.heap, &mut self.native] {
            account.used = 0;
            account.reserved = 0;
            account.grab.reset();
            account.flush.reset();
        }
        let Some(pool) = &self.pool else {
            return;
        };
        if net > 0 {
            pool.release(net.unsigned_abs() as usize);
        } else if net < 0
            && let Err(err) = pool.reserve(net.unsigned_abs() as usize)
        {
            warn!(%err, "Could not take back memory handed over to this tracker");
        }
    }
}

impl MemoryTracker for AdaptiveMemoryTracker {
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
        self.heap.used
    }

    fn used_native_memory(&self) -> i64 {
        self.native.used
    }

    fn heap_high_water_mark(&self) -> i64 {
        self.heap.high_water_mark
    }

    /// Returns the unconsumed credit to the pool and restarts the growth
    /// heuristics. Memory that is still allocated stays reserved until it is
    /// released or the tracker is closed, so once every allocation was
    /// released this zeroes the tracker.
    fn reset(&mut self) {
        self.assert_open();
        self.return_credit();
    }
}

impl Drop for AdaptiveMemoryTracker {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if self.heap.used != 0 || self.native.used != 0 {
            warn!(
                heap = self.heap.used,
                native = self.native.used,
                "Memory tracker dropped without being closed"
            );
        }
        self.give_back();
    }
}

impl std::fmt::Debug for AdaptiveMemoryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveMemoryTracker")
            .field("pool", &self.pool.as_ref().map(MemoryPool::name))
            .field("limit", &self.limit)
            .field("heap", &self.heap)
            .field("native", &self.native)
            .field("closed", &self.closed)
            .finish()
    }
}

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<AdaptiveMemoryTracker>();
};
