// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use metrics::gauge;
use tracing::{debug, info, trace};

use memledger_types::MemoryGroup;
use memledger_types::config::MemoryOptions;

use crate::adaptive_tracker::AdaptiveMemoryTracker;
use crate::metric_definitions::{
    MEMORY_POOL_CAPACITY_BYTES, MEMORY_POOL_USED_BYTES, describe_metrics,
};
use crate::pool::MemoryPool;
use crate::tracker::{EmptyMemoryTracker, MemoryTracker};

static GLOBAL_POOLS: OnceLock<MemoryPools> = OnceLock::new();

/// Name of the setting reported when a transaction exceeds its own limit.
pub const TRANSACTION_MAX_SIZE_SETTING: &str = "transaction-max-size";

#[derive(Debug, thiserror::Error)]
#[error("global memory pools are already initialized")]
pub struct AlreadyInitialized;

/// Initializes the process-wide registry and describes the memory metrics.
/// Meant to be called once at start-up, before anything calls [`global_pools`].
pub fn init_global_pools(
    options: MemoryOptions,
) -> Result<&'static MemoryPools, AlreadyInitialized> {
    let mut initialized = false;
    let pools = GLOBAL_POOLS.get_or_init(|| {
        initialized = true;
        MemoryPools::from_options(options)
    });
    if initialized {
        describe_metrics();
        Ok(pools)
    } else {
        Err(AlreadyInitialized)
    }
}

/// The process-wide registry, set up with default options if
/// [`init_global_pools`] was never called.
pub fn global_pools() -> &'static MemoryPools {
    GLOBAL_POOLS.get_or_init(|| MemoryPools::from_options(MemoryOptions::default()))
}

/// Registry of the live memory pools of a process.
///
/// Cloning is cheap; clones share the same set of pools. Pools deregister
/// themselves when they are [closed](MemoryPool::close).
#[derive(Clone, Default)]
pub struct MemoryPools {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    pools: DashMap<u64, MemoryPool>,
    next_id: AtomicU64,
    transactions: OnceLock<TransactionPools>,
}

/// The global pool and the transaction sub-pool below it.
struct TransactionPools {
    global: MemoryPool,
    transaction: MemoryPool,
    options: MemoryOptions,
}

impl TransactionPools {
    fn create(registry: &MemoryPools, options: MemoryOptions) -> Self {
        let global = registry.create_named_pool(
            MemoryGroup::Other,
            "Global",
            options.global_limit().unwrap_or_default(),
            None,
        );
        let transaction = registry.create_pool(
            MemoryGroup::Transaction,
            options.transaction_global_limit().unwrap_or_default(),
            Some(&global),
        );
        info!(
            global_limit = %options.global_limit,
            transaction_global_limit = %options.transaction_global_limit,
            transaction_max_size = %options.transaction_max_size,
            memory_tracking = options.memory_tracking,
            "Memory pools configured"
        );
        Self {
            global,
            transaction,
            options,
        }
    }
}

/// Link from a pool back to the registry listing it.
pub(crate) struct Registration {
    id: u64,
    registry: Weak<RegistryInner>,
}

impl Registration {
    pub(crate) fn deregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.pools.remove(&self.id);
        }
    }
}

impl MemoryPools {
    /// An empty registry. The global and transaction pools are created on
    /// first use with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the global pool and the transaction pool configured
    /// from `options`.
    pub fn from_options(options: MemoryOptions) -> Self {
        let pools = Self::new();
        pools
            .inner
            .transactions
            .get_or_init(|| TransactionPools::create(&pools, options));
        pools
    }

    fn transactions(&self) -> &TransactionPools {
        self.inner
            .transactions
            .get_or_init(|| TransactionPools::create(self, MemoryOptions::default()))
    }

    /// Root pool bounding everything accounted by this process.
    pub fn global_pool(&self) -> &MemoryPool {
        &self.transactions().global
    }

    /// Pool shared by all transactions, a sub-pool of the [global
    /// pool](Self::global_pool).
    pub fn transaction_pool(&self) -> &MemoryPool {
        &self.transactions().transaction
    }

    pub fn options(&self) -> &MemoryOptions {
        &self.transactions().options
    }

    /// Tracker for a new transaction, reserving from the transaction pool in
    /// adaptively sized chunks. Records nothing if memory tracking is disabled.
    pub fn new_transaction_tracker(&self) -> Box<dyn MemoryTracker + Send> {
        let TransactionPools {
            transaction,
            options,
            ..
        } = self.transactions();
        if !options.memory_tracking {
            return Box::new(EmptyMemoryTracker);
        }
        Box::new(
            AdaptiveMemoryTracker::new(
                Some(transaction.clone()),
                options.transaction_max_size(),
                options.initial_transaction_heap_grab_size(),
                options.max_transaction_heap_grab_size(),
                TRANSACTION_MAX_SIZE_SETTING,
            )
            .with_growth_threshold(options.grab_growth_threshold),
        )
    }

    /// Creates and registers a pool named after its group. Sub-pools are named
    /// `<parent>/<group>`.
    ///
    /// A `capacity` of zero creates an unbounded pool.
    pub fn create_pool(
        &self,
        group: MemoryGroup,
        capacity: usize,
        parent: Option<&MemoryPool>,
    ) -> MemoryPool {
        let name = match parent {
            Some(parent) => format!("{}/{group}", parent.name()),
            None => group.to_string(),
        };
        self.create_named_pool(group, name, capacity, parent)
    }

    pub fn create_named_pool(
        &self,
        group: MemoryGroup,
        name: impl Into<String>,
        capacity: usize,
        parent: Option<&MemoryPool>,
    ) -> MemoryPool {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let registration = Registration {
            id,
            registry: Arc::downgrade(&self.inner),
        };
        let pool = MemoryPool::create(
            group,
            name.into(),
            capacity,
            parent.cloned(),
            Some(registration),
        );
        debug!(
            pool = pool.name(),
            %group,
            capacity = ?pool.capacity(),
            "Registered memory pool"
        );
        self.inner.pools.insert(id, pool.clone());
        pool
    }

    /// Snapshot of the registered pools, in creation order.
    pub fn pools(&self) -> Vec<MemoryPool> {
        let mut pools: Vec<_> = self
            .inner
            .pools
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        pools.sort_unstable_by_key(|(id, _)| *id);
        pools.into_iter().map(|(_, pool)| pool).collect()
    }

    pub fn pools_in_group(&self, group: MemoryGroup) -> Vec<MemoryPool> {
        let mut pools = self.pools();
        pools.retain(|pool| pool.group() == group);
        pools
    }

    pub fn len(&self) -> usize {
        self.inner.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.pools.is_empty()
    }

    /// Bytes in use across all registered root pools. Sub-pools are left out,
    /// their usage is already included in their parents'.
    pub fn total_used(&self) -> i64 {
        self.inner
            .pools
            .iter()
            .filter(|entry| entry.value().parent().is_none())
            .map(|entry| entry.value().used())
            .sum()
    }

    /// Publishes usage and capacity of every registered pool as gauges.
    pub fn report_metrics(&self) {
        for entry in self.inner.pools.iter() {
            let pool = entry.value();
            let labels = [
                ("pool", pool.name().to_owned()),
                ("group", pool.group().as_label().to_owned()),
            ];
            gauge!(MEMORY_POOL_USED_BYTES, &labels).set(pool.used() as f64);
            if let Some(capacity) = pool.capacity() {
                gauge!(MEMORY_POOL_CAPACITY_BYTES, &labels).set(capacity as f64);
            }
        }
        trace!("Reported metrics of {} memory pools", self.len());
    }
}

impl std::fmt::Debug for MemoryPools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.pools()).finish()
    }
}
