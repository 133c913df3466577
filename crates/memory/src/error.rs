// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use bytesize::ByteSize;
use metrics::counter;
use tracing::debug;

use crate::metric_definitions::{LIMIT_SCOPE_LOCAL, LIMIT_SCOPE_POOL, MEMORY_LIMIT_EXCEEDED};

/// The two dimensions a tracker accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum MemoryKind {
    /// Estimated size of objects living on the heap.
    #[display("heap")]
    Heap,
    /// Off-heap memory, e.g. buffers allocated directly from the allocator.
    #[display("native")]
    Native,
}

/// Returned when an allocation would exceed a memory limit.
///
/// The limit may be a tracker's local limit (the label is the name of the setting
/// that configures it) or the capacity of a pool (the label is the pool's name).
/// The call that fails never leaves a partial debit behind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "the allocation of an extra {} would use more than the limit of {} of '{label}', \
     {} currently in use",
    human(.requested),
    human(.limit),
    human_signed(.used)
)]
pub struct MemoryLimitExceeded {
    /// Name of the pool or setting whose limit was hit.
    pub label: String,
    pub requested: u64,
    pub used: i64,
    pub limit: u64,
    /// Dimension of the failed allocation, if known. Pool reservations that are
    /// not made on behalf of a tracker don't have one.
    pub kind: Option<MemoryKind>,
}

impl MemoryLimitExceeded {
    /// A pool could not satisfy a reservation.
    pub(crate) fn pool(label: &str, requested: usize, used: i64, limit: i64) -> Self {
        counter!(MEMORY_LIMIT_EXCEEDED, "scope" => LIMIT_SCOPE_POOL).increment(1);
        let err = Self {
            label: label.to_owned(),
            requested: requested as u64,
            used,
            limit: limit.max(0).unsigned_abs(),
            kind: None,
        };
        debug!("Rejected reservation: {err}");
        err
    }

    /// A tracker's own limit would be exceeded.
    pub(crate) fn local(
        kind: MemoryKind,
        setting: &str,
        requested: usize,
        used: i64,
        limit: usize,
    ) -> Self {
        counter!(MEMORY_LIMIT_EXCEEDED, "scope" => LIMIT_SCOPE_LOCAL).increment(1);
        let err = Self {
            label: setting.to_owned(),
            requested: requested as u64,
            used,
            limit: limit as u64,
            kind: Some(kind),
        };
        debug!("Rejected {kind} allocation: {err}");
        err
    }

    /// Attributes a pool rejection to the tracker dimension that triggered it.
    pub(crate) fn with_kind(mut self, kind: MemoryKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

fn human(bytes: &u64) -> ByteSize {
    ByteSize(*bytes)
}

fn human_signed(bytes: &i64) -> ByteSize {
    ByteSize((*bytes).max(0).unsigned_abs())
}
