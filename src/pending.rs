/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! The table of in-flight work items awaiting a matching decoded output.

use std::collections::BTreeMap;

use crate::work::WorkItem;

/// Maps ordinal to the in-flight work item that will receive the matching
/// decoded output.
///
/// An ordinal appears at most once; a second insert with the same ordinal is
/// refused rather than silently overwriting the earlier entry.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: BTreeMap<u64, WorkItem>,
}

impl PendingTable {
    /// Registers an item under its ordinal. On collision the NEW item is
    /// handed back so the caller can fail it; the existing entry is kept.
    pub fn insert(&mut self, item: WorkItem) -> std::result::Result<(), WorkItem> {
        if self.entries.contains_key(&item.ordinal) {
            return Err(item);
        }
        self.entries.insert(item.ordinal, item);
        Ok(())
    }

    /// Removes and returns the entry matching a surfaced output's ordinal.
    pub fn remove(&mut self, ordinal: u64) -> Option<WorkItem> {
        self.entries.remove(&ordinal)
    }

    /// Drains every remaining entry, in ordinal order. Used on flush and
    /// shutdown so no item is ever leaked.
    pub fn drain_all(&mut self) -> Vec<WorkItem> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
