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

use crate::local_tracker::DEFAULT_LIMIT_SETTING;
use crate::pool::to_signed;
use crate::scoped::{Delta, give_back};
use crate::{MemoryKind, MemoryLimitExceeded, MemoryTracker};

/// A tracker backed by another tracker instead of a pool.
///
/// Puts a limit of its own in front of the parent: an allocation has to fit
/// below the local limit and be accepted by the parent. Either both accept it
/// or neither records it. Releases are forwarded as they come.
///
/// The limit applies to heap and native memory independently. On
/// [`reset`](MemoryTracker::reset), [`close`](Self::close) or drop the net
/// usage of both dimensions is given back to the parent.
pub struct LimitedMemoryTracker<T: MemoryTracker> {
    parent: T,
    heap: i64,
    native: i64,
    limit: Option<usize>,
    setting: Cow<'static, str>,
    heap_high_water_mark: i64,
    closed: bool,
}

impl<T: MemoryTracker> LimitedMemoryTracker<T> {
    pub fn new(parent: T, limit: Option<usize>) -> Self {
        Self {
            parent,
            heap: 0,
            native: 0,
            limit,
            setting: Cow::Borrowed(DEFAULT_LIMIT_SETTING),
            heap_high_water_mark: 0,
            closed: false,
        }
    }

    /// Names the setting reported when the local limit is hit.
    pub fn with_limit_setting(mut self, setting: impl Into<Cow<'static, str>>) -> Self {
        self.setting = setting.into();
        self
    }

    pub fn parent(&self) -> &T {
        &self.parent
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    /// Gives the net usage back to the parent and marks the tracker closed.
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
        self.parent.allocate(kind, bytes)?;

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
        self.parent.release(kind, bytes);
    }

    fn give_back(&mut self) {
        let net = Delta {
            heap: std::mem::take(&mut self.heap),
            native: std::mem::take(&mut self.native),
        };
        give_back(&mut self.parent, net);
    }
}

impl<T: MemoryTracker> MemoryTracker for LimitedMemoryTracker<T> {
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

impl<T: MemoryTracker> Drop for LimitedMemoryTracker<T> {
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

impl<T: MemoryTracker> std::fmt::Debug for LimitedMemoryTracker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitedMemoryTracker")
            .field("heap", &self.heap)
            .field("native", &self.native)
            .field("limit", &self.limit)
            .field("setting", &self.setting)
            .field("closed", &self.closed)
            .finish()
    }
}
