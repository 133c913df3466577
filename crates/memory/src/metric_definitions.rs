// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use metrics::{Unit, describe_counter, describe_gauge};

/// dimensioned by "pool" and "group"
pub const MEMORY_POOL_USED_BYTES: &str = "memledger.memory_pool.used.bytes";
/// dimensioned by "pool" and "group", unbounded pools are not reported
pub const MEMORY_POOL_CAPACITY_BYTES: &str = "memledger.memory_pool.capacity.bytes";
/// dimensioned by "scope" (LIMIT_SCOPE_*)
pub const MEMORY_LIMIT_EXCEEDED: &str = "memledger.memory.limit_exceeded.total";

pub const LIMIT_SCOPE_POOL: &str = "pool";
pub const LIMIT_SCOPE_LOCAL: &str = "local";

pub fn describe_metrics() {
    describe_gauge!(
        MEMORY_POOL_USED_BYTES,
        Unit::Bytes,
        "Bytes currently reserved from a memory pool, dimensioned by pool and group"
    );
    describe_gauge!(
        MEMORY_POOL_CAPACITY_BYTES,
        Unit::Bytes,
        "Configured capacity of a bounded memory pool"
    );
    describe_counter!(
        MEMORY_LIMIT_EXCEEDED,
        Unit::Count,
        "Number of allocations rejected because a memory limit would be exceeded"
    );
}
