// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use serde::{Deserialize, Serialize};

/// The subsystem bucket a memory pool accounts for.
///
/// Groups carry no semantics of their own. They only exist so that pools can be
/// listed and reported per subsystem.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum MemoryGroup {
    /// Memory held by open transactions and their statements.
    #[display("Transaction")]
    Transaction,
    /// Compiled query plans kept for reuse.
    #[display("Query Cache")]
    QueryCache,
    #[display("Page Cache")]
    PageCache,
    #[display("Recent Query Buffer")]
    RecentQueryBuffer,
    /// Network buffers of client connections.
    #[display("Network")]
    Network,
    #[display("Other")]
    Other,
}

impl MemoryGroup {
    /// Short, stable identifier, suitable as a metric label.
    pub fn as_label(&self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn labels_are_kebab_case() {
        assert_eq!(MemoryGroup::Transaction.as_label(), "transaction");
        assert_eq!(MemoryGroup::QueryCache.as_label(), "query-cache");
        assert_eq!(MemoryGroup::RecentQueryBuffer.as_label(), "recent-query-buffer");
    }

    #[test]
    fn display_names() {
        assert_eq!(MemoryGroup::PageCache.to_string(), "Page Cache");
        assert_eq!(MemoryGroup::Other.to_string(), "Other");
    }

    #[test]
    fn labels_are_unique() {
        let mut labels: Vec<_> = MemoryGroup::iter().map(|g| g.as_label()).collect();
        let count = labels.len();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), count);
    }

    #[test]
    fn deserializes_from_label() {
        let group: MemoryGroup = serde_json::from_str("\"query-cache\"").unwrap();
        assert_eq!(group, MemoryGroup::QueryCache);
    }
}
