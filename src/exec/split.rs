// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Split descriptors and task source updates.
//!
//! Responsibilities:
//! - Defines the scheduled split (data or snapshot marker) attributed to a source
//!   plan node and a lifespan.
//! - Defines the cumulative `TaskSource` update stream sent by the coordinator.
//!
//! Key exported interfaces:
//! - Types: `ScheduledSplit`, `SplitPayload`, `MarkerPage`, `TaskSource`.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use crate::common::ids::PlanNodeId;
use crate::exec::lifespan::Lifespan;

/// Snapshot barrier page broadcast to a pipeline's output in place of data.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MarkerPage {
    pub snapshot_id: u64,
}

impl MarkerPage {
    pub const fn new(snapshot_id: u64) -> Self {
        Self { snapshot_id }
    }
}

/// Inner kind of a split: opaque connector data, or a snapshot marker.
///
/// A marker with snapshot id 0 is the bootstrap sentinel used to trigger task
/// creation; the scheduler drops it without broadcasting.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SplitPayload {
    Data { info: String },
    Marker { snapshot_id: u64 },
}

impl SplitPayload {
    pub fn data(info: impl Into<String>) -> Self {
        SplitPayload::Data { info: info.into() }
    }

    pub fn is_marker(&self) -> bool {
        matches!(self, SplitPayload::Marker { .. })
    }
}

/// One unit of input assigned to this task by the coordinator.
///
/// Sequence ids are monotonically assigned per task; the receiver deduplicates
/// redeliveries by comparing against the highest acknowledged id. Identity
/// (equality and hashing) is (plan node, sequence id).
#[derive(Clone, Debug)]
pub struct ScheduledSplit {
    pub sequence_id: i64,
    pub plan_node_id: PlanNodeId,
    pub lifespan: Lifespan,
    pub payload: SplitPayload,
}

impl ScheduledSplit {
    pub fn data(
        sequence_id: i64,
        plan_node_id: PlanNodeId,
        lifespan: Lifespan,
        info: impl Into<String>,
    ) -> Self {
        Self {
            sequence_id,
            plan_node_id,
            lifespan,
            payload: SplitPayload::data(info),
        }
    }

    pub fn marker(
        sequence_id: i64,
        plan_node_id: PlanNodeId,
        lifespan: Lifespan,
        snapshot_id: u64,
    ) -> Self {
        Self {
            sequence_id,
            plan_node_id,
            lifespan,
            payload: SplitPayload::Marker { snapshot_id },
        }
    }

    pub fn is_marker(&self) -> bool {
        self.payload.is_marker()
    }
}

impl PartialEq for ScheduledSplit {
    fn eq(&self, other: &Self) -> bool {
        self.sequence_id == other.sequence_id && self.plan_node_id == other.plan_node_id
    }
}

impl Eq for ScheduledSplit {}

impl Hash for ScheduledSplit {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sequence_id.hash(state);
        self.plan_node_id.hash(state);
    }
}

/// Cumulative split announcement for one plan node.
///
/// Updates are idempotent: the same splits may be delivered more than once and
/// out of order; the `no_more_*` flags only ever turn on.
#[derive(Clone, Debug)]
pub struct TaskSource {
    pub plan_node_id: PlanNodeId,
    pub splits: Vec<ScheduledSplit>,
    pub no_more_splits_for_lifespan: HashSet<Lifespan>,
    pub no_more_splits: bool,
}

impl TaskSource {
    pub fn new(
        plan_node_id: PlanNodeId,
        splits: Vec<ScheduledSplit>,
        no_more_splits_for_lifespan: HashSet<Lifespan>,
        no_more_splits: bool,
    ) -> Self {
        Self {
            plan_node_id,
            splits,
            no_more_splits_for_lifespan,
            no_more_splits,
        }
    }

    pub fn initial(plan_node_id: PlanNodeId) -> Self {
        Self::new(plan_node_id, Vec::new(), HashSet::new(), false)
    }

    /// Merge a later cumulative update into this one. Returns `None` when the
    /// update carries nothing new, so callers can skip driver notification.
    pub fn update(&self, source: &TaskSource) -> Option<TaskSource> {
        assert_eq!(
            self.plan_node_id, source.plan_node_id,
            "source update for different plan node"
        );

        let known: HashSet<i64> = self.splits.iter().map(|s| s.sequence_id).collect();
        let new_splits: Vec<ScheduledSplit> = source
            .splits
            .iter()
            .filter(|s| !known.contains(&s.sequence_id))
            .cloned()
            .collect();
        let newly_closed = source.no_more_splits && !self.no_more_splits;
        if new_splits.is_empty() && !newly_closed {
            return None;
        }

        let mut splits = self.splits.clone();
        splits.extend(new_splits);
        let mut no_more_for_lifespan = self.no_more_splits_for_lifespan.clone();
        no_more_for_lifespan.extend(source.no_more_splits_for_lifespan.iter().copied());
        Some(TaskSource::new(
            self.plan_node_id,
            splits,
            no_more_for_lifespan,
            self.no_more_splits || source.no_more_splits,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_identity_is_sequence_and_plan_node() {
        let a = ScheduledSplit::data(7, PlanNodeId::new(1), Lifespan::task_wide(), "a");
        let b = ScheduledSplit::data(7, PlanNodeId::new(1), Lifespan::driver_group(3), "b");
        let c = ScheduledSplit::data(8, PlanNodeId::new(1), Lifespan::task_wide(), "a");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn source_update_dedupes_and_accumulates() {
        let node = PlanNodeId::new(5);
        let base = TaskSource::new(
            node,
            vec![ScheduledSplit::data(1, node, Lifespan::task_wide(), "x")],
            HashSet::new(),
            false,
        );

        // Redelivery of the same split with no new flag is not an update.
        assert!(base.update(&base.clone()).is_none());

        let more = TaskSource::new(
            node,
            vec![
                ScheduledSplit::data(1, node, Lifespan::task_wide(), "x"),
                ScheduledSplit::data(2, node, Lifespan::task_wide(), "y"),
            ],
            HashSet::new(),
            true,
        );
        let merged = base.update(&more).expect("new content");
        assert_eq!(merged.splits.len(), 2);
        assert!(merged.no_more_splits);

        // Merging again changes nothing.
        assert!(merged.update(&more).is_none());
    }
}
