// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::num::NonZeroU32;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

/// Default number of client calls within which a drained batch causes the next
/// batch to grow.
pub const DEFAULT_GRAB_GROWTH_THRESHOLD: u32 = 8;

#[derive(Debug, Clone, Serialize, Deserialize, derive_builder::Builder, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
#[builder(default)]
pub struct MemoryOptions {
    /// # Memory tracking
    ///
    /// Enables accounting of the memory used by transactions. When disabled,
    /// transactions are handed a tracker that records nothing and enforces no limit.
    pub memory_tracking: bool,

    /// # Global memory limit
    ///
    /// Upper bound for all memory accounted by any pool of the process. `0` means
    /// unlimited.
    pub global_limit: ByteSize,

    /// # Transaction global memory limit
    ///
    /// Upper bound for the memory used by all transactions together. The
    /// transaction pool is a sub-pool of the global pool, so both limits apply.
    /// `0` means unlimited.
    pub transaction_global_limit: ByteSize,

    /// # Transaction max size
    ///
    /// Upper bound for the memory a single transaction may use, enforced
    /// independently for heap and native memory. `0` means unlimited.
    pub transaction_max_size: ByteSize,

    /// # Initial transaction heap grab size
    ///
    /// Size of the first chunks a transaction reserves from the transaction pool.
    /// Larger values reduce contention on the shared pool at the cost of
    /// over-reserving for small transactions.
    pub initial_transaction_heap_grab_size: ByteSize,

    /// # Max transaction heap grab size
    ///
    /// Ceiling for the reservation chunk size of a transaction. Chunks grow
    /// towards this value while a transaction allocates in large bursts.
    pub max_transaction_heap_grab_size: ByteSize,

    /// # Grab growth threshold
    ///
    /// A chunk that was consumed within this many allocation calls makes the
    /// next chunk twice as large (rounded up to a power of two).
    pub grab_growth_threshold: NonZeroU32,
}

impl MemoryOptions {
    /// Clamped to the max grab size, and never zero.
    pub fn initial_transaction_heap_grab_size(&self) -> usize {
        (self.initial_transaction_heap_grab_size.as_u64() as usize)
            .clamp(1, self.max_transaction_heap_grab_size())
    }

    pub fn max_transaction_heap_grab_size(&self) -> usize {
        (self.max_transaction_heap_grab_size.as_u64() as usize).max(1)
    }

    /// Per-transaction limit in bytes, `None` if unlimited.
    pub fn transaction_max_size(&self) -> Option<usize> {
        non_zero(self.transaction_max_size)
    }

    pub fn global_limit(&self) -> Option<usize> {
        non_zero(self.global_limit)
    }

    pub fn transaction_global_limit(&self) -> Option<usize> {
        non_zero(self.transaction_global_limit)
    }
}

fn non_zero(size: ByteSize) -> Option<usize> {
    (size.as_u64() > 0).then_some(size.as_u64() as usize)
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            memory_tracking: true,
            global_limit: ByteSize::b(0),
            transaction_global_limit: ByteSize::b(0),
            transaction_max_size: ByteSize::b(0),
            initial_transaction_heap_grab_size: ByteSize::mib(2),
            max_transaction_heap_grab_size: ByteSize::mib(32),
            grab_growth_threshold: NonZeroU32::new(DEFAULT_GRAB_GROWTH_THRESHOLD)
                .expect("be non zero"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_unlimited() {
        let options = MemoryOptions::default();
        assert!(options.memory_tracking);
        assert_eq!(options.global_limit(), None);
        assert_eq!(options.transaction_global_limit(), None);
        assert_eq!(options.transaction_max_size(), None);
        assert_eq!(options.initial_transaction_heap_grab_size(), 2 * 1024 * 1024);
        assert_eq!(options.grab_growth_threshold.get(), DEFAULT_GRAB_GROWTH_THRESHOLD);
    }

    #[test]
    fn deserialize_human_readable_sizes() -> googletest::Result<()> {
        let options: MemoryOptions = serde_json::from_str(
            r#"{
                "global-limit": "1 GiB",
                "transaction-max-size": "64 MiB",
                "initial-transaction-heap-grab-size": 4096
            }"#,
        )?;

        assert_eq!(options.global_limit(), Some(1024 * 1024 * 1024));
        assert_eq!(options.transaction_max_size(), Some(64 * 1024 * 1024));
        assert_eq!(options.initial_transaction_heap_grab_size(), 4096);
        // unspecified fields keep their defaults
        assert!(options.memory_tracking);
        assert_eq!(options.transaction_global_limit(), None);
        Ok(())
    }

    #[test]
    fn initial_grab_size_is_clamped_to_max() {
        let options = MemoryOptionsBuilder::default()
            .initial_transaction_heap_grab_size(ByteSize::kib(64))
            .max_transaction_heap_grab_size(ByteSize::kib(16))
            .build()
            .unwrap();
        assert_eq!(options.initial_transaction_heap_grab_size(), 16 * 1024);

        let options = MemoryOptionsBuilder::default()
            .initial_transaction_heap_grab_size(ByteSize::b(0))
            .build()
            .unwrap();
        assert_eq!(options.initial_transaction_heap_grab_size(), 1);
    }
}
