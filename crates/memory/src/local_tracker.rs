// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::borrow::Cow;

use tracing::warn;

use crate::pool::{MemoryPool, to_signed};
use crate::{MemoryKind, MemoryLimitExceeded, MemoryTracker};

/// Setting label reported when no specific one was configured.
pub const DEFAULT_LIMIT_SETTING: &str = "memory-limit";

/// A tracker that forwards every allocation and release straight to its pool.
///
/// Good for owners that allocate rarely or in large pieces. For hot allocation
/// paths see [`AdaptiveMemoryTracker`](crate::AdaptiveMemoryTracker), which
/// talks to the pool in batches.
///
/// The optional limit applies to heap and native memory independently. Heap
/// and native usage may go negative while memory allocated by another tracker
/// is released here; they return to zero once the hand-off is balanced.
pub struct LocalMemoryTracker {
    pool: Option<MemoryPool>,
    heap: i64,
    native: i64,
    limit: Option<usize>,
    setting: Cow<'static, str>,
    heap_high_water_mark: i64,
    closed: bool,
}

impl LocalMemoryTracker {
    /// Creates a tracker that reserves from `pool`, if any, and rejects
    /// allocations that would take one dimension above `limit`.
    pub fn new(pool: Option<MemoryPool>, limit: Option<usize>) -> Self {
        Self {
            pool,
            heap: 0,
            native: 0,
            limit,
            setting: Cow::Borrowed(DEFAULT_LIMIT_SETTING),
            heap_high_water_mark: 0,
            closed: false,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None, None)
    }

    /// Names the setting reported when the local limit is hit.
    pub fn with_limit_setting(mut self, setting: impl Into<Cow<'static, str>>) -> Self {
        self.setting = setting.into();
        self
    }

    pub fn pool(&self) -> Option<&MemoryPool> {
        self.pool.as_ref()
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Changes the local limit for subsequent allocations. Usage above the new
    /// limit is kept.
    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
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

    fn used_mut(&mut self, kind: MemoryKind) -> &mut i64 {
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

        let used = self.used(kind);
        let new_used = used.saturating_add(to_signed(bytes));
        if let Some(limit) = self.limit
            && new_used > to_signed(limit)
        {
            return Err(MemoryLimitExceeded::local(
                kind,
                &self.setting,
                bytes,
                used,
                limit,
            ));
        }
        if let Some(pool) = &self.pool {
            pool.reserve(bytes).map_err(|err| err.with_kind(kind))?;
        }

        *self.used_mut(kind) = new_used;
        if kind == MemoryKind::Heap {
            self.heap_high_water_mark = self.heap_high_water_mark.max(new_used);
        }
        Ok(())
    }

    fn release_kind(&mut self, kind: MemoryKind, bytes: usize) {
        self.assert_open();
        if bytes == 0 {
            return;
        }
        let used = self.used_mut(kind);
        *used = used.saturating_sub(to_signed(bytes));
        if let Some(pool) = &self.pool {
            pool.release(bytes);
        }
    }

    /// Hands the net usage of both dimensions back to the pool and zeroes it.
    fn give_back(&mut self) {
        let net = self.heap + self.native;
        self.heap = 0;
        self.native = 0;
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

impl MemoryTracker for LocalMemoryTracker {
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
        self.heap
    }

    fn used_native_memory(&self) -> i64 {
        self.native
    }

    fn heap_high_water_mark(&self) -> i64 {
        self.heap_high_water_mark
    }

    fn reset(&mut self) {
        self.assert_open();
        self.give_back();
    }
}

impl Drop for LocalMemoryTracker {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if self.heap != 0 || self.native != 0 {
            warn!(
                heap = self.heap,
                native = self.native,
                "Memory tracker dropped without being closed"
            );
        }
        self.give_back();
    }
}

impl std::fmt::Debug for LocalMemoryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMemoryTracker")
            .field("pool", &self.pool.as_ref().map(MemoryPool::name))
            .field("heap", &self.heap)
            .field("native", &self.native)
            .field("limit", &self.limit)
            .field("closed", &self.closed)
            .finish()
    }
}

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<LocalMemoryTracker>();
};
