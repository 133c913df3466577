// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Hierarchical memory accounting.
//!
//! This crate provides:
//! - [`MemoryPool`]: A named, optionally bounded budget shared by many trackers,
//!   optionally nested below a parent pool
//! - [`MemoryPools`]: Registry of the live pools of a process
//! - [`MemoryTracker`]: Per-owner accounting of heap and native memory, with
//!   [`LocalMemoryTracker`] forwarding every call to its pool,
//!   [`AdaptiveMemoryTracker`] reserving in adaptively sized batches and
//!   [`LimitedMemoryTracker`] putting a limit in front of another tracker
//! - Scopes ([`ScopedMemoryTracker`], [`DualScopedMemoryTracker`],
//!   [`RebindableScopedMemoryTracker`]) releasing exactly what was charged
//!   through them

mod adaptive_tracker;
mod error;
mod limited_tracker;
mod local_tracker;
pub mod metric_definitions;
mod pool;
mod registry;
pub mod scoped;
mod tracker;

pub use adaptive_tracker::AdaptiveMemoryTracker;
pub use error::{MemoryKind, MemoryLimitExceeded};
pub use limited_tracker::LimitedMemoryTracker;
pub use local_tracker::{DEFAULT_LIMIT_SETTING, LocalMemoryTracker};
pub use pool::MemoryPool;
pub use registry::{
    AlreadyInitialized, MemoryPools, TRANSACTION_MAX_SIZE_SETTING, global_pools,
    init_global_pools,
};
pub use scoped::{DualScopedMemoryTracker, RebindableScopedMemoryTracker, ScopedMemoryTracker};
pub use tracker::{EmptyMemoryTracker, MemoryTracker};
